//! External Capture API
//!
//! The coordinator consumes these endpoints; it never serves them.

pub mod capture;
pub mod envelope;

pub use capture::{CaptureApi, HttpCaptureApi};
