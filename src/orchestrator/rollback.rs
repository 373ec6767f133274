//! Compensating cancel for half-started captures

use super::coordinator::Inner;
use crate::task::TaskId;
use crate::utils::error::CaptureError;
use std::sync::Arc;

/// Cancels a freshly created task unless disarmed.
///
/// Runs explicitly through [`Rollback::run`] on failure, or from `Drop`
/// when the start future is abandoned mid-flight.
pub(crate) struct Rollback {
    inner: Option<Arc<Inner>>,
    task_id: TaskId,
    /// Local cancel done, server cancel not yet confirmed
    remote_pending: bool,
}

impl Rollback {
    pub(crate) fn arm(inner: Arc<Inner>, task_id: TaskId) -> Self {
        Self {
            inner: Some(inner),
            task_id,
            remote_pending: false,
        }
    }

    /// The start succeeded; nothing to undo
    pub(crate) fn disarm(mut self) {
        self.inner = None;
    }

    pub(crate) async fn run(mut self) {
        let Some(inner) = self.inner.clone() else {
            return;
        };
        let cancelled = cancel_locally(&inner, &self.task_id);
        inner.detach_preview(&self.task_id);
        if cancelled {
            tracing::info!(task_id = %self.task_id, "rolled back capture task");
            self.remote_pending = true;
            inner.cancel_remote(&self.task_id).await;
        }
        self.inner = None;
    }
}

/// Cancel in the registry; true when the server still has to be told.
///
/// A task missing locally (the registry was cleared mid-start) is still
/// live on the server.
fn cancel_locally(inner: &Inner, task_id: &TaskId) -> bool {
    match inner.registry.cancel(task_id) {
        Ok((_, transition)) => transition.is_applied(),
        Err(CaptureError::NotFound(_)) => true,
        Err(_) => false,
    }
}

impl Drop for Rollback {
    fn drop(&mut self) {
        let Some(inner) = self.inner.take() else {
            return;
        };
        let cancelled = cancel_locally(&inner, &self.task_id);
        inner.detach_preview(&self.task_id);
        if !cancelled && !self.remote_pending {
            return;
        }

        tracing::warn!(task_id = %self.task_id, "capture start abandoned, rolling back");
        let task_id = self.task_id.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    inner.cancel_remote(&task_id).await;
                });
            }
            Err(_) => {
                inner.pending_remote_cancels.lock().insert(task_id);
            }
        }
    }
}
