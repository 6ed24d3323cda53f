//! Utility modules for the dyno client.

pub mod errors;
pub mod logger;

pub use errors::{DynoError, Result};
