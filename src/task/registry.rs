//! Task registry
//!
//! In-memory index of capture tasks. Every mutation goes through the
//! state-machine guard in [`CaptureTask`]; readers get per-call snapshots.

use super::events::CaptureEvent;
use super::state::{CaptureStatus, CaptureTask, TaskId, Transition, WorkshopId};
use crate::config::CoordinatorConfig;
use crate::signaling::MediaSession;
use crate::utils::error::{CaptureError, CaptureResult};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::broadcast;

/// Out-of-band status report for one task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusUpdate {
    pub task_id: TaskId,
    pub status: CaptureStatus,
    #[serde(default)]
    pub error_message: Option<String>,
}

impl StatusUpdate {
    pub fn new(task_id: TaskId, status: CaptureStatus) -> Self {
        Self {
            task_id,
            status,
            error_message: None,
        }
    }
}

impl From<&CaptureTask> for StatusUpdate {
    fn from(task: &CaptureTask) -> Self {
        Self {
            task_id: task.id.clone(),
            status: task.status,
            error_message: task.error_message.clone(),
        }
    }
}

/// Result of merging a server record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reconciled {
    /// Unknown locally, inserted as reported
    Adopted,
    /// Known locally, fed through the guard
    Updated(Transition),
}

struct Entry {
    task: CaptureTask,
    /// Insertion order, breaks `created_at` ties
    seq: u64,
}

#[derive(Default)]
struct Index {
    tasks: HashMap<TaskId, Entry>,
    next_seq: u64,
}

impl Index {
    fn active_for(&self, workshop_id: &WorkshopId) -> Option<&CaptureTask> {
        self.tasks
            .values()
            .map(|entry| &entry.task)
            .find(|task| task.workshop_id == *workshop_id && task.is_active())
    }

    fn insert(&mut self, task: CaptureTask) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.tasks.insert(task.id.clone(), Entry { task, seq });
    }

    fn entry_mut(&mut self, id: &TaskId) -> CaptureResult<&mut Entry> {
        self.tasks
            .get_mut(id)
            .ok_or_else(|| CaptureError::NotFound(format!("capture task {id}")))
    }
}

/// Single writer for capture task state
pub struct TaskRegistry {
    index: RwLock<Index>,
    event_tx: broadcast::Sender<CaptureEvent>,
    retain_terminal: usize,
}

impl TaskRegistry {
    pub fn new(event_capacity: usize, retain_terminal: usize) -> Self {
        let (event_tx, _) = broadcast::channel(event_capacity.max(1));
        Self {
            index: RwLock::new(Index::default()),
            event_tx,
            retain_terminal,
        }
    }

    pub fn from_config(config: &CoordinatorConfig) -> Self {
        Self::new(config.event_capacity, config.retain_terminal_per_workshop)
    }

    /// Subscribe to registry events
    pub fn subscribe(&self) -> broadcast::Receiver<CaptureEvent> {
        self.event_tx.subscribe()
    }

    pub(crate) fn publish(&self, event: CaptureEvent) {
        let _ = self.event_tx.send(event);
    }

    /// Tasks newest first, optionally for one workshop
    pub fn list(&self, workshop_id: Option<&WorkshopId>) -> Vec<CaptureTask> {
        let index = self.index.read();
        let mut entries: Vec<&Entry> = index
            .tasks
            .values()
            .filter(|entry| workshop_id.map_or(true, |w| entry.task.workshop_id == *w))
            .collect();
        entries.sort_by(|a, b| {
            b.task
                .created_at
                .cmp(&a.task.created_at)
                .then(b.seq.cmp(&a.seq))
        });
        entries.into_iter().map(|entry| entry.task.clone()).collect()
    }

    /// Tasks in `status`, newest first
    pub fn list_by_status(
        &self,
        workshop_id: Option<&WorkshopId>,
        status: CaptureStatus,
    ) -> Vec<CaptureTask> {
        let mut tasks = self.list(workshop_id);
        tasks.retain(|task| task.status == status);
        tasks
    }

    pub fn get(&self, id: &TaskId) -> CaptureResult<CaptureTask> {
        self.index
            .read()
            .tasks
            .get(id)
            .map(|entry| entry.task.clone())
            .ok_or_else(|| CaptureError::NotFound(format!("capture task {id}")))
    }

    pub fn len(&self) -> usize {
        self.index.read().tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The pending or running task for a workshop, if any
    pub fn active_for(&self, workshop_id: &WorkshopId) -> Option<CaptureTask> {
        self.index.read().active_for(workshop_id).cloned()
    }

    /// Workshops that currently have a pending or running task
    pub fn active_workshops(&self) -> Vec<WorkshopId> {
        let index = self.index.read();
        let mut workshops: Vec<WorkshopId> = index
            .tasks
            .values()
            .filter(|entry| entry.task.is_active())
            .map(|entry| entry.task.workshop_id.clone())
            .collect();
        workshops.sort();
        workshops.dedup();
        workshops
    }

    /// Fail with `DuplicateActiveTask` if the workshop is busy
    pub fn ensure_idle(&self, workshop_id: &WorkshopId) -> CaptureResult<()> {
        match self.index.read().active_for(workshop_id) {
            Some(active) => Err(CaptureError::DuplicateActiveTask {
                workshop_id: workshop_id.to_string(),
                task_id: active.id.to_string(),
            }),
            None => Ok(()),
        }
    }

    /// Record a freshly created `pending` task.
    ///
    /// With `enforce` the one-active-task-per-workshop rule is checked under
    /// the same write lock as the insert.
    pub fn create(&self, task: CaptureTask, enforce: bool) -> CaptureResult<CaptureTask> {
        if task.status != CaptureStatus::Pending {
            return Err(CaptureError::InvalidTransition {
                from: task.status,
                to: CaptureStatus::Pending,
            });
        }

        let mut index = self.index.write();
        if index.tasks.contains_key(&task.id) {
            return Err(CaptureError::InvalidRequest(format!(
                "capture task {} is already registered",
                task.id
            )));
        }
        if let Some(active) = index.active_for(&task.workshop_id) {
            if enforce {
                return Err(CaptureError::DuplicateActiveTask {
                    workshop_id: task.workshop_id.to_string(),
                    task_id: active.id.to_string(),
                });
            }
            tracing::warn!(
                workshop_id = %task.workshop_id,
                active_task = %active.id,
                "second active capture task for workshop"
            );
        }

        index.insert(task.clone());
        drop(index);

        tracing::info!(task_id = %task.id, workshop_id = %task.workshop_id, "capture task created");
        self.publish(CaptureEvent::Created(task.clone()));
        Ok(task)
    }

    /// `pending -> running`; requires the negotiated preview
    pub fn mark_running(&self, id: &TaskId, session: &MediaSession) -> CaptureResult<CaptureTask> {
        let mut index = self.index.write();
        let entry = index.entry_mut(id)?;
        let transition = entry.task.mark_running(session)?;
        let task = entry.task.clone();
        drop(index);

        self.announce(&task, transition);
        Ok(task)
    }

    /// Cancel locally; terminal tasks are left untouched
    pub fn cancel(&self, id: &TaskId) -> CaptureResult<(CaptureTask, Transition)> {
        let mut index = self.index.write();
        let entry = index.entry_mut(id)?;
        let transition = entry.task.cancel();
        let task = entry.task.clone();
        drop(index);

        self.announce(&task, transition);
        Ok((task, transition))
    }

    /// Apply a server status report to a known task
    pub fn upsert(&self, update: StatusUpdate) -> CaptureResult<Transition> {
        let mut index = self.index.write();
        let entry = index.entry_mut(&update.task_id)?;
        let transition = entry.task.apply_server_status(update.status);
        if transition.is_applied() {
            if let Some(message) = update.error_message.filter(|m| !m.is_empty()) {
                entry.task.error_message = Some(message);
            }
        }
        let task = entry.task.clone();
        drop(index);

        self.announce(&task, transition);
        Ok(transition)
    }

    /// Merge a full server record, inserting tasks this client never saw
    pub fn reconcile(&self, remote: CaptureTask) -> Reconciled {
        let mut index = self.index.write();
        if index.tasks.contains_key(&remote.id) {
            drop(index);
            return match self.upsert(StatusUpdate::from(&remote)) {
                Ok(transition) => Reconciled::Updated(transition),
                // evicted between the two locks
                Err(_) => Reconciled::Updated(Transition::Unchanged),
            };
        }

        if remote.is_active() {
            if let Some(active) = index.active_for(&remote.workshop_id) {
                tracing::warn!(
                    workshop_id = %remote.workshop_id,
                    local_task = %active.id,
                    remote_task = %remote.id,
                    "server reports another active capture for workshop"
                );
            }
        }
        index.insert(remote.clone());
        drop(index);

        tracing::debug!(task_id = %remote.id, status = %remote.status, "adopted server task");
        let terminal = remote.status.is_terminal();
        let workshop_id = remote.workshop_id.clone();
        self.publish(CaptureEvent::Created(remote));
        if terminal {
            self.prune_terminal(&workshop_id);
        }
        Reconciled::Adopted
    }

    /// Remove a terminal task; active tasks are never evicted
    pub fn evict(&self, id: &TaskId) -> CaptureResult<bool> {
        let mut index = self.index.write();
        let entry = index.entry_mut(id)?;
        if entry.task.is_active() {
            return Ok(false);
        }
        index.tasks.remove(id);
        drop(index);

        self.publish(CaptureEvent::Evicted { task_id: id.clone() });
        Ok(true)
    }

    /// Drop every record
    pub fn clear(&self) {
        let mut index = self.index.write();
        index.tasks.clear();
    }

    fn announce(&self, task: &CaptureTask, transition: Transition) {
        match transition {
            Transition::Applied { from, to } => {
                tracing::info!(task_id = %task.id, %from, %to, "capture task transitioned");
                self.publish(CaptureEvent::StatusChanged {
                    task_id: task.id.clone(),
                    workshop_id: task.workshop_id.clone(),
                    from,
                    to,
                });
                if to.is_terminal() {
                    self.prune_terminal(&task.workshop_id);
                }
            }
            // the server trails behind a task this client already started
            Transition::Dropped {
                from,
                to: CaptureStatus::Pending,
            } => {
                tracing::debug!(
                    task_id = %task.id,
                    current = %from,
                    "server still reports pending, keeping local state"
                );
            }
            Transition::Dropped { from, to } => {
                tracing::warn!(
                    task_id = %task.id,
                    current = %from,
                    reported = %to,
                    "dropping stale status update"
                );
                self.publish(CaptureEvent::StaleUpdateDropped {
                    task_id: task.id.clone(),
                    current: from,
                    reported: to,
                });
            }
            Transition::Unchanged => {}
        }
    }

    /// Keep at most `retain_terminal` finished tasks per workshop
    fn prune_terminal(&self, workshop_id: &WorkshopId) {
        let mut index = self.index.write();
        let mut finished: Vec<(TaskId, chrono::DateTime<chrono::Utc>, u64)> = index
            .tasks
            .values()
            .filter(|e| e.task.workshop_id == *workshop_id && e.task.status.is_terminal())
            .map(|e| (e.task.id.clone(), e.task.created_at, e.seq))
            .collect();
        if finished.len() <= self.retain_terminal {
            return;
        }
        finished.sort_by(|a, b| b.1.cmp(&a.1).then(b.2.cmp(&a.2)));
        let evicted: Vec<TaskId> = finished
            .drain(self.retain_terminal..)
            .map(|(id, _, _)| id)
            .collect();
        for id in &evicted {
            index.tasks.remove(id);
        }
        drop(index);

        for task_id in evicted {
            tracing::debug!(task_id = %task_id, "evicted finished capture task");
            self.publish(CaptureEvent::Evicted { task_id });
        }
    }
}

impl Default for TaskRegistry {
    fn default() -> Self {
        Self::from_config(&CoordinatorConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signaling::SessionDescriptor;
    use chrono::{Duration, Utc};

    fn pending(id: &str, workshop: &str) -> CaptureTask {
        CaptureTask::new(TaskId::new(id), WorkshopId::new(workshop))
    }

    fn session(workshop: &str) -> MediaSession {
        MediaSession::new(
            WorkshopId::new(workshop),
            "n".into(),
            SessionDescriptor::new("v=0 o").unwrap(),
            SessionDescriptor::new("v=0 a").unwrap(),
        )
    }

    #[test]
    fn test_create_rejects_second_active_task() {
        let registry = TaskRegistry::default();
        registry.create(pending("1", "W1"), true).unwrap();
        let err = registry.create(pending("2", "W1"), true).unwrap_err();
        assert!(matches!(err, CaptureError::DuplicateActiveTask { task_id, .. } if task_id == "1"));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_create_advisory_mode_allows_second() {
        let registry = TaskRegistry::default();
        registry.create(pending("1", "W1"), false).unwrap();
        assert!(registry.create(pending("2", "W1"), false).is_ok());
    }

    #[test]
    fn test_other_workshops_independent() {
        let registry = TaskRegistry::default();
        registry.create(pending("1", "W1"), true).unwrap();
        registry.create(pending("2", "W2"), true).unwrap();
        assert_eq!(
            registry.active_workshops(),
            vec![WorkshopId::new("W1"), WorkshopId::new("W2")]
        );
    }

    #[test]
    fn test_new_task_allowed_after_terminal() {
        let registry = TaskRegistry::default();
        registry.create(pending("1", "W1"), true).unwrap();
        registry.cancel(&TaskId::new("1")).unwrap();
        assert!(registry.ensure_idle(&WorkshopId::new("W1")).is_ok());
        assert!(registry.create(pending("2", "W1"), true).is_ok());
    }

    #[test]
    fn test_list_newest_first_and_filtered() {
        let registry = TaskRegistry::default();
        let mut old = pending("1", "W1");
        old.created_at = Utc::now() - Duration::hours(1);
        old.status = CaptureStatus::Completed;
        registry.reconcile(old);
        registry.create(pending("2", "W1"), true).unwrap();
        registry.create(pending("3", "W2"), true).unwrap();

        let ids: Vec<String> = registry
            .list(Some(&WorkshopId::new("W1")))
            .into_iter()
            .map(|t| t.id.to_string())
            .collect();
        assert_eq!(ids, vec!["2", "1"]);
        assert_eq!(registry.list(None).len(), 3);
    }

    #[test]
    fn test_get_unknown_is_not_found() {
        let registry = TaskRegistry::default();
        assert!(matches!(
            registry.get(&TaskId::new("nope")),
            Err(CaptureError::NotFound(_))
        ));
        assert!(matches!(
            registry.upsert(StatusUpdate::new(TaskId::new("nope"), CaptureStatus::Running)),
            Err(CaptureError::NotFound(_))
        ));
    }

    #[test]
    fn test_upsert_drops_regression_and_notifies() {
        let registry = TaskRegistry::default();
        let mut events = registry.subscribe();
        registry.create(pending("1", "W1"), true).unwrap();
        let id = TaskId::new("1");

        registry.upsert(StatusUpdate::new(id.clone(), CaptureStatus::Completed)).unwrap();
        let outcome = registry
            .upsert(StatusUpdate::new(id.clone(), CaptureStatus::Running))
            .unwrap();
        assert!(matches!(outcome, Transition::Dropped { .. }));
        assert_eq!(registry.get(&id).unwrap().status, CaptureStatus::Completed);

        assert!(matches!(events.try_recv().unwrap(), CaptureEvent::Created(_)));
        assert!(matches!(
            events.try_recv().unwrap(),
            CaptureEvent::StatusChanged { to: CaptureStatus::Completed, .. }
        ));
        assert!(matches!(
            events.try_recv().unwrap(),
            CaptureEvent::StaleUpdateDropped { reported: CaptureStatus::Running, .. }
        ));
    }

    #[test]
    fn test_lagging_pending_report_is_quiet() {
        let registry = TaskRegistry::default();
        registry.create(pending("1", "W1"), true).unwrap();
        registry
            .mark_running(&TaskId::new("1"), &session("W1"))
            .unwrap();
        let mut events = registry.subscribe();

        let outcome = registry
            .upsert(StatusUpdate::new(TaskId::new("1"), CaptureStatus::Pending))
            .unwrap();
        assert!(matches!(outcome, Transition::Dropped { .. }));
        assert_eq!(registry.get(&TaskId::new("1")).unwrap().status, CaptureStatus::Running);
        assert!(events.try_recv().is_err());

        registry
            .upsert(StatusUpdate::new(TaskId::new("1"), CaptureStatus::Completed))
            .unwrap();
        registry
            .upsert(StatusUpdate::new(TaskId::new("1"), CaptureStatus::Running))
            .unwrap();
        assert!(matches!(events.try_recv().unwrap(), CaptureEvent::StatusChanged { .. }));
        assert!(matches!(
            events.try_recv().unwrap(),
            CaptureEvent::StaleUpdateDropped { reported: CaptureStatus::Running, .. }
        ));
    }

    #[test]
    fn test_list_by_status() {
        let registry = TaskRegistry::new(16, 10);
        registry.create(pending("1", "W1"), true).unwrap();
        registry.cancel(&TaskId::new("1")).unwrap();
        registry.create(pending("2", "W1"), true).unwrap();
        registry.mark_running(&TaskId::new("2"), &session("W1")).unwrap();
        registry.create(pending("3", "W2"), true).unwrap();

        let running = registry.list_by_status(None, CaptureStatus::Running);
        assert_eq!(running.len(), 1);
        assert_eq!(running[0].id, TaskId::new("2"));
        assert_eq!(
            registry
                .list_by_status(Some(&WorkshopId::new("W1")), CaptureStatus::Pending)
                .len(),
            0
        );
        assert_eq!(registry.list_by_status(None, CaptureStatus::Pending).len(), 1);
        assert_eq!(registry.list_by_status(None, CaptureStatus::Cancelled).len(), 1);
    }

    #[test]
    fn test_upsert_records_error_message() {
        let registry = TaskRegistry::default();
        registry.create(pending("1", "W1"), true).unwrap();
        let update = StatusUpdate {
            task_id: TaskId::new("1"),
            status: CaptureStatus::Failed,
            error_message: Some("ffmpeg exited".into()),
        };
        registry.upsert(update).unwrap();
        let task = registry.get(&TaskId::new("1")).unwrap();
        assert_eq!(task.status, CaptureStatus::Failed);
        assert_eq!(task.error_message.as_deref(), Some("ffmpeg exited"));
    }

    #[test]
    fn test_mark_running_requires_pending() {
        let registry = TaskRegistry::default();
        registry.create(pending("1", "W1"), true).unwrap();
        registry.cancel(&TaskId::new("1")).unwrap();
        let err = registry
            .mark_running(&TaskId::new("1"), &session("W1"))
            .unwrap_err();
        assert!(matches!(err, CaptureError::InvalidTransition { .. }));
        assert_eq!(
            registry.get(&TaskId::new("1")).unwrap().status,
            CaptureStatus::Cancelled
        );
    }

    #[test]
    fn test_reconcile_adopts_unknown_task() {
        let registry = TaskRegistry::default();
        let mut remote = pending("9", "W1");
        remote.status = CaptureStatus::Running;
        assert_eq!(registry.reconcile(remote.clone()), Reconciled::Adopted);
        assert_eq!(registry.active_for(&WorkshopId::new("W1")).unwrap().id, remote.id);

        remote.status = CaptureStatus::Completed;
        assert!(matches!(
            registry.reconcile(remote),
            Reconciled::Updated(Transition::Applied { .. })
        ));
    }

    #[test]
    fn test_terminal_tasks_pruned_beyond_retention() {
        let registry = TaskRegistry::new(16, 2);
        for i in 0..4 {
            let id = i.to_string();
            registry.create(pending(&id, "W1"), true).unwrap();
            registry.cancel(&TaskId::new(id)).unwrap();
        }
        let remaining: Vec<String> = registry
            .list(Some(&WorkshopId::new("W1")))
            .into_iter()
            .map(|t| t.id.to_string())
            .collect();
        assert_eq!(remaining, vec!["3", "2"]);
    }

    #[test]
    fn test_evict_skips_active_tasks() {
        let registry = TaskRegistry::default();
        registry.create(pending("1", "W1"), true).unwrap();
        assert!(!registry.evict(&TaskId::new("1")).unwrap());
        registry.cancel(&TaskId::new("1")).unwrap();
        assert!(registry.evict(&TaskId::new("1")).unwrap());
        assert!(registry.is_empty());
    }
}
