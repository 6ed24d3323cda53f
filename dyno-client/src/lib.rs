//! Dyno client library
//!
//! Content-addressed sync of a local source tree to a remote build service,
//! and a multiplexed live session with a development dyno.

pub mod config;
pub mod daemon;
pub mod fs;
pub mod manifest;
pub mod session;
pub mod sync;
pub mod transfer;
pub mod utils;

// Re-export commonly used types
pub use config::Config;
pub use utils::errors::{DynoError, Result};
