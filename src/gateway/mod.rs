//! Gateway server implementation

pub mod access_log;
pub mod enforce;
mod router;
mod server;

pub use enforce::{AccessDecision, DenyReason, authorize};
pub use router::{AppState, create_router};
pub use server::Gateway;
