//! Capture orchestration
//!
//! This module ties the pieces together:
//! - CaptureCoordinator as the public facade (start, cancel, reconcile)
//! - Rollback guard so failed or abandoned starts never leave a pending task
//! - StatusPoller for periodic reconciliation against the Capture API

pub mod coordinator;
mod poller;
mod rollback;

pub use coordinator::CaptureCoordinator;
