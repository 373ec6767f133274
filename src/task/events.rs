//! Registry notifications

use super::state::{CaptureStatus, CaptureTask, TaskId, WorkshopId};

/// Events published to registry subscribers
#[derive(Debug, Clone, PartialEq)]
pub enum CaptureEvent {
    /// A task entered the registry
    Created(CaptureTask),
    /// A task moved through the state machine
    StatusChanged {
        task_id: TaskId,
        workshop_id: WorkshopId,
        from: CaptureStatus,
        to: CaptureStatus,
    },
    /// A stale or regressing server update was ignored
    StaleUpdateDropped {
        task_id: TaskId,
        current: CaptureStatus,
        reported: CaptureStatus,
    },
    /// A live preview was attached to a running task
    PreviewAttached { task_id: TaskId, workshop_id: WorkshopId },
    /// The preview was released
    PreviewDetached { task_id: TaskId },
    /// A terminal task left the in-memory index
    Evicted { task_id: TaskId },
}

impl CaptureEvent {
    pub fn task_id(&self) -> &TaskId {
        match self {
            CaptureEvent::Created(task) => &task.id,
            CaptureEvent::StatusChanged { task_id, .. }
            | CaptureEvent::StaleUpdateDropped { task_id, .. }
            | CaptureEvent::PreviewAttached { task_id, .. }
            | CaptureEvent::PreviewDetached { task_id }
            | CaptureEvent::Evicted { task_id } => task_id,
        }
    }
}
