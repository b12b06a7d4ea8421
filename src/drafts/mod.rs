pub mod auto_promote;
pub mod dto;
pub mod handlers;
pub mod lifecycle;
pub mod repo_types;

pub use handlers::router;
pub use lifecycle::{DraftLifecycle, LifecycleWorker};
