//! Reverse-proxy plumbing.
//!
//! - [`director`] — rewrites the outbound request (URL + trust headers)
//! - [`forwarder`] — streams the rewritten request upstream and the
//!   response back

pub mod director;
pub mod forwarder;

pub use director::UpstreamTarget;
pub use forwarder::{ProxiedTarget, forward};
