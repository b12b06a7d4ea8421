//! Bearer-token verification. Tokens are issued elsewhere; this service only
//! checks them and takes the subject as the owner of every record it touches.

mod claims;
pub mod extractors;
pub mod jwt;

pub use extractors::AuthUser;
pub use jwt::JwtKeys;
