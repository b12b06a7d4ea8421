pub mod dto;
pub mod handlers;
pub mod repo_types;

pub use handlers::router;
