//! Capture coordinator
//!
//! Composes the task registry, the Capture API and the signaling client into
//! "start capture for a workshop and attach a live preview", with rollback
//! when any step after task creation fails.

use super::poller::StatusPoller;
use super::rollback::Rollback;
use crate::api::{CaptureApi, HttpCaptureApi};
use crate::config::CoordinatorConfig;
use crate::signaling::{HttpSignalingGateway, MediaSession, OfferSource, SignalingClient};
use crate::task::{
    CaptureEvent, CaptureRequest, CaptureStatus, CaptureTask, Reconciled, StatusUpdate, TaskId,
    TaskRegistry, Transition, WorkshopId,
};
use crate::utils::error::{CaptureError, CaptureResult};
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

pub(crate) struct Inner {
    pub(crate) registry: TaskRegistry,
    pub(crate) api: Arc<dyn CaptureApi>,
    signaling: SignalingClient,
    offers: Arc<dyn OfferSource>,
    previews: RwLock<HashMap<TaskId, MediaSession>>,
    /// One async lock per workshop; operations on a workshop run one at a time
    workshop_locks: Mutex<HashMap<WorkshopId, Arc<tokio::sync::Mutex<()>>>>,
    /// Remote cancels that failed and are retried by the poller
    pub(crate) pending_remote_cancels: Mutex<HashSet<TaskId>>,
    poller: Mutex<Option<StatusPoller>>,
    enforce_single_active: bool,
    poll_interval: Duration,
}

impl Inner {
    /// Hand out the workshop's lock, dropping locks of idle workshops nobody holds
    fn workshop_lock(&self, workshop_id: &WorkshopId) -> Arc<tokio::sync::Mutex<()>> {
        let active = self.registry.active_workshops();
        let mut locks = self.workshop_locks.lock();
        locks.retain(|id, lock| Arc::strong_count(lock) > 1 || active.binary_search(id).is_ok());
        locks.entry(workshop_id.clone()).or_default().clone()
    }

    pub(crate) fn detach_preview(&self, task_id: &TaskId) {
        if self.previews.write().remove(task_id).is_some() {
            tracing::debug!(task_id = %task_id, "preview detached");
            self.registry.publish(CaptureEvent::PreviewDetached {
                task_id: task_id.clone(),
            });
        }
    }

    fn attach_preview(&self, task: &CaptureTask, session: MediaSession) {
        self.previews.write().insert(task.id.clone(), session);
        self.registry.publish(CaptureEvent::PreviewAttached {
            task_id: task.id.clone(),
            workshop_id: task.workshop_id.clone(),
        });
    }

    /// Previews live only while their task is running
    fn release_if_stopped(&self, task_id: &TaskId) {
        let running = self
            .registry
            .get(task_id)
            .map(|task| task.status == CaptureStatus::Running)
            .unwrap_or(false);
        if !running {
            self.detach_preview(task_id);
        }
    }

    pub(crate) async fn cancel_remote(&self, task_id: &TaskId) {
        match self.api.cancel(task_id).await {
            Ok(()) => {
                self.pending_remote_cancels.lock().remove(task_id);
            }
            Err(CaptureError::NotFound(_)) => {
                self.pending_remote_cancels.lock().remove(task_id);
            }
            Err(err) => {
                tracing::warn!(task_id = %task_id, "remote cancel failed, will retry: {}", err);
                self.pending_remote_cancels.lock().insert(task_id.clone());
            }
        }
    }

    pub(crate) async fn retry_remote_cancels(&self) {
        let pending: Vec<TaskId> = self.pending_remote_cancels.lock().iter().cloned().collect();
        for task_id in pending {
            self.cancel_remote(&task_id).await;
        }
    }

    /// Merge one server record; true when it was adopted or moved a task.
    /// Caller holds the workshop lock.
    fn merge_remote(&self, task: CaptureTask) -> bool {
        let task_id = task.id.clone();
        let changed = matches!(
            self.registry.reconcile(task),
            Reconciled::Adopted | Reconciled::Updated(Transition::Applied { .. })
        );
        self.release_if_stopped(&task_id);
        changed
    }

    /// Pull the server's view of a workshop; caller holds the workshop lock
    async fn sync_locked(&self, workshop_id: &WorkshopId) -> CaptureResult<usize> {
        let remote = self.api.list(Some(workshop_id)).await?;
        let changed = remote
            .into_iter()
            .filter(|task| task.workshop_id == *workshop_id)
            .map(|task| self.merge_remote(task))
            .filter(|changed| *changed)
            .count();
        Ok(changed)
    }

    pub(crate) async fn sync_workshop(&self, workshop_id: &WorkshopId) -> CaptureResult<usize> {
        let lock = self.workshop_lock(workshop_id);
        let _guard = lock.lock().await;
        self.sync_locked(workshop_id).await
    }
}

/// Entry point for capture orchestration
#[derive(Clone)]
pub struct CaptureCoordinator {
    inner: Arc<Inner>,
}

impl CaptureCoordinator {
    pub fn new(
        api: Arc<dyn CaptureApi>,
        signaling: SignalingClient,
        offers: Arc<dyn OfferSource>,
        config: &CoordinatorConfig,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                registry: TaskRegistry::from_config(config),
                api,
                signaling,
                offers,
                previews: RwLock::new(HashMap::new()),
                workshop_locks: Mutex::new(HashMap::new()),
                pending_remote_cancels: Mutex::new(HashSet::new()),
                poller: Mutex::new(None),
                enforce_single_active: config.enforce_single_active,
                poll_interval: config.poll_interval(),
            }),
        }
    }

    /// Wire up the HTTP Capture API and signaling gateway from config
    pub fn from_config(
        config: &CoordinatorConfig,
        offers: Arc<dyn OfferSource>,
    ) -> CaptureResult<Self> {
        let http = config.http_client()?;
        let api = HttpCaptureApi::from_config(http.clone(), config)?;
        let gateway = HttpSignalingGateway::from_config(http, config)?;
        let signaling = SignalingClient::from_config(Arc::new(gateway), config);
        Ok(Self::new(Arc::new(api), signaling, offers, config))
    }

    pub fn registry(&self) -> &TaskRegistry {
        &self.inner.registry
    }

    /// Subscribe to task and preview events
    pub fn subscribe(&self) -> broadcast::Receiver<CaptureEvent> {
        self.inner.registry.subscribe()
    }

    pub fn list(&self, workshop_id: Option<&WorkshopId>) -> Vec<CaptureTask> {
        self.inner.registry.list(workshop_id)
    }

    /// Like [`CaptureCoordinator::list`], keeping only tasks in `status`
    pub fn list_by_status(
        &self,
        workshop_id: Option<&WorkshopId>,
        status: CaptureStatus,
    ) -> Vec<CaptureTask> {
        self.inner.registry.list_by_status(workshop_id, status)
    }

    pub fn get(&self, task_id: &TaskId) -> CaptureResult<CaptureTask> {
        self.inner.registry.get(task_id)
    }

    /// The negotiated preview of a running task
    pub fn preview(&self, task_id: &TaskId) -> Option<MediaSession> {
        self.inner.previews.read().get(task_id).cloned()
    }

    /// Start an immediate capture and attach its live preview
    pub async fn start_capture(&self, workshop_id: &WorkshopId) -> CaptureResult<CaptureTask> {
        self.start_capture_with(CaptureRequest::new(workshop_id.clone()))
            .await
    }

    /// Start a capture described by `request`.
    ///
    /// On any failure after the task was created the task is cancelled
    /// locally and on the server before the error is returned. Dropping the
    /// returned future has the same effect.
    pub async fn start_capture_with(&self, request: CaptureRequest) -> CaptureResult<CaptureTask> {
        request.validate()?;
        let inner = &self.inner;
        let workshop_id = request.workshop_id.clone();
        let lock = inner.workshop_lock(&workshop_id);

        let guard = lock.lock().await;
        if let Err(err) = inner.sync_locked(&workshop_id).await {
            tracing::warn!(
                workshop_id = %workshop_id,
                "could not refresh tasks before start, using local state: {}",
                err
            );
        }
        if inner.enforce_single_active {
            inner.registry.ensure_idle(&workshop_id)?;
        }

        let created = inner.api.create(&request).await?;
        let task = match inner
            .registry
            .create(created.clone(), inner.enforce_single_active)
        {
            Ok(task) => task,
            Err(err) => {
                inner.cancel_remote(&created.id).await;
                return Err(err);
            }
        };
        let rollback = Rollback::arm(inner.clone(), task.id.clone());
        drop(guard);

        tracing::info!(task_id = %task.id, workshop_id = %workshop_id, "negotiating preview");
        let negotiated = match inner.offers.create_offer(&workshop_id).await {
            Ok(offer) => inner.signaling.negotiate(&workshop_id, offer).await,
            Err(err) => Err(err),
        };

        let _guard = lock.lock().await;
        let session = match negotiated {
            Ok(session) => session,
            Err(err) => {
                tracing::warn!(task_id = %task.id, "preview negotiation failed: {}", err);
                rollback.run().await;
                return Err(err);
            }
        };

        match inner.registry.mark_running(&task.id, &session) {
            Ok(running) => {
                inner.attach_preview(&running, session);
                rollback.disarm();
                Ok(running)
            }
            // the server already reported it running while we negotiated
            Err(CaptureError::InvalidTransition {
                from: CaptureStatus::Running,
                ..
            }) => {
                let running = inner.registry.get(&task.id)?;
                inner.attach_preview(&running, session);
                rollback.disarm();
                Ok(running)
            }
            Err(err) => {
                tracing::warn!(task_id = %task.id, "task left pending during negotiation: {}", err);
                rollback.run().await;
                Err(err)
            }
        }
    }

    /// Cancel a task; succeeds for every known id, terminal or not
    pub async fn cancel_capture(&self, task_id: &TaskId) -> CaptureResult<()> {
        let inner = &self.inner;
        let workshop_id = inner.registry.get(task_id)?.workshop_id;
        let lock = inner.workshop_lock(&workshop_id);
        let _guard = lock.lock().await;

        let (_, transition) = inner.registry.cancel(task_id)?;
        inner.detach_preview(task_id);
        if transition.is_applied() {
            inner.cancel_remote(task_id).await;
        } else {
            tracing::debug!(task_id = %task_id, "cancel on finished task ignored");
        }
        Ok(())
    }

    /// Reconcile one pushed status report
    pub async fn apply_server_update(&self, update: StatusUpdate) -> CaptureResult<Transition> {
        let inner = &self.inner;
        let task_id = update.task_id.clone();
        let workshop_id = inner.registry.get(&task_id)?.workshop_id;
        let lock = inner.workshop_lock(&workshop_id);
        let _guard = lock.lock().await;

        let transition = inner.registry.upsert(update)?;
        inner.release_if_stopped(&task_id);
        Ok(transition)
    }

    /// Pull every task of a workshop from the Capture API.
    ///
    /// Returns how many tasks were adopted or changed state.
    pub async fn sync_workshop(&self, workshop_id: &WorkshopId) -> CaptureResult<usize> {
        self.inner.sync_workshop(workshop_id).await
    }

    /// Pull every workshop's tasks from the Capture API.
    ///
    /// Counts the same way as [`CaptureCoordinator::sync_workshop`].
    pub async fn sync_all(&self) -> CaptureResult<usize> {
        let remote = self.inner.api.list(None).await?;
        let mut by_workshop: HashMap<WorkshopId, Vec<CaptureTask>> = HashMap::new();
        for task in remote {
            by_workshop.entry(task.workshop_id.clone()).or_default().push(task);
        }

        let mut changed = 0;
        for (workshop_id, tasks) in by_workshop {
            let lock = self.inner.workshop_lock(&workshop_id);
            let _guard = lock.lock().await;
            for task in tasks {
                if self.inner.merge_remote(task) {
                    changed += 1;
                }
            }
        }
        Ok(changed)
    }

    /// Pull one task from the Capture API
    pub async fn refresh_task(&self, task_id: &TaskId) -> CaptureResult<CaptureTask> {
        let inner = &self.inner;
        let remote = inner.api.get(task_id).await?;
        let lock = inner.workshop_lock(&remote.workshop_id);
        let _guard = lock.lock().await;

        inner.registry.reconcile(remote);
        inner.release_if_stopped(task_id);
        inner.registry.get(task_id)
    }

    /// Begin periodic reconciliation of active workshops
    pub fn start_polling(&self) {
        let mut poller = self.inner.poller.lock();
        if poller.is_none() {
            *poller = Some(StatusPoller::spawn(
                Arc::downgrade(&self.inner),
                self.inner.poll_interval,
            ));
        }
    }

    /// Stop polling and drop all local state
    pub fn shutdown(&self) {
        if let Some(poller) = self.inner.poller.lock().take() {
            poller.stop();
        }
        let attached: Vec<TaskId> = self.inner.previews.read().keys().cloned().collect();
        for task_id in attached {
            self.inner.detach_preview(&task_id);
        }
        self.inner.registry.clear();
        tracing::info!("capture coordinator shut down");
    }
}
