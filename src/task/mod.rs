//! Capture task lifecycle
//!
//! This module implements the task side of capture orchestration:
//! - CaptureTask / CaptureStatus state machine with transition guards
//! - TaskRegistry as the single writer over all task records
//! - CaptureEvent notifications for observers

pub mod events;
pub mod registry;
pub mod state;

pub use events::CaptureEvent;
pub use registry::{Reconciled, StatusUpdate, TaskRegistry};
pub use state::{
    CaptureRequest, CaptureSchedule, CaptureStatus, CaptureTask, TaskId, Transition, WorkshopId,
};
