//! Upload body helpers.

pub mod progress_stream;
