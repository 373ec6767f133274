//! In-memory stand-ins for the Capture API and the signaling gateway

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use workshop_capture::api::CaptureApi;
use workshop_capture::signaling::{SignalingGateway, SignalingReply, SignalingRequest};
use workshop_capture::{
    CaptureCoordinator, CaptureError, CaptureRequest, CaptureResult, CaptureStatus, CaptureTask,
    CoordinatorConfig, SessionDescriptor, SignalingClient, StaticOffer, TaskId, WorkshopId,
};

/// Server-side task table
#[derive(Default)]
pub struct FakeCaptureApi {
    next_id: AtomicU64,
    tasks: Mutex<HashMap<TaskId, CaptureTask>>,
    cancelled: Mutex<Vec<TaskId>>,
    pub fail_list: AtomicBool,
    pub fail_cancel: AtomicBool,
}

impl FakeCaptureApi {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Seed a task as if another operator created it
    pub fn seed(&self, workshop: &str, status: CaptureStatus) -> TaskId {
        let id = TaskId::new(format!("seed-{}", self.next_id.fetch_add(1, Ordering::SeqCst)));
        let mut task = CaptureTask::new(id.clone(), WorkshopId::new(workshop));
        task.status = status;
        self.tasks.lock().insert(id.clone(), task);
        id
    }

    pub fn set_status(&self, id: &TaskId, status: CaptureStatus) {
        if let Some(task) = self.tasks.lock().get_mut(id) {
            task.status = status;
            task.updated_at = Some(Utc::now());
        }
    }

    pub fn status(&self, id: &TaskId) -> Option<CaptureStatus> {
        self.tasks.lock().get(id).map(|task| task.status)
    }

    pub fn cancelled(&self) -> Vec<TaskId> {
        self.cancelled.lock().clone()
    }
}

#[async_trait]
impl CaptureApi for FakeCaptureApi {
    async fn create(&self, request: &CaptureRequest) -> CaptureResult<CaptureTask> {
        let id = TaskId::new(self.next_id.fetch_add(1, Ordering::SeqCst).to_string());
        let mut task = CaptureTask::new(id.clone(), request.workshop_id.clone());
        task.schedule = request.schedule.clone();
        self.tasks.lock().insert(id, task.clone());
        Ok(task)
    }

    async fn list(&self, workshop_id: Option<&WorkshopId>) -> CaptureResult<Vec<CaptureTask>> {
        if self.fail_list.load(Ordering::SeqCst) {
            return Err(CaptureError::Api {
                status: Some(502),
                message: "bad gateway".into(),
            });
        }
        Ok(self
            .tasks
            .lock()
            .values()
            .filter(|task| workshop_id.map_or(true, |w| task.workshop_id == *w))
            .cloned()
            .collect())
    }

    async fn get(&self, id: &TaskId) -> CaptureResult<CaptureTask> {
        self.tasks
            .lock()
            .get(id)
            .cloned()
            .ok_or_else(|| CaptureError::NotFound(format!("capture {id}")))
    }

    async fn cancel(&self, id: &TaskId) -> CaptureResult<()> {
        if self.fail_cancel.load(Ordering::SeqCst) {
            return Err(CaptureError::Api {
                status: None,
                message: "connection reset".into(),
            });
        }
        let mut tasks = self.tasks.lock();
        let task = tasks
            .get_mut(id)
            .ok_or_else(|| CaptureError::NotFound(format!("capture {id}")))?;
        task.status = CaptureStatus::Cancelled;
        self.cancelled.lock().push(id.clone());
        Ok(())
    }
}

/// What the fake gateway does with the next offer
#[derive(Clone)]
pub enum GatewayBehavior {
    Reply(serde_json::Value),
    Unavailable,
    Hang,
}

pub struct FakeGateway {
    behavior: Mutex<GatewayBehavior>,
    delay: Mutex<Duration>,
    calls: AtomicU64,
}

impl FakeGateway {
    pub fn new(behavior: GatewayBehavior) -> Arc<Self> {
        Arc::new(Self {
            behavior: Mutex::new(behavior),
            delay: Mutex::new(Duration::ZERO),
            calls: AtomicU64::new(0),
        })
    }

    pub fn answering() -> Arc<Self> {
        Self::new(GatewayBehavior::Reply(
            serde_json::json!({ "success": true, "sdp": "v=0\r\no=gateway 1 1 IN IP4 10.0.0.2" }),
        ))
    }

    pub fn with_delay(self: Arc<Self>, delay: Duration) -> Arc<Self> {
        *self.delay.lock() = delay;
        self
    }

    pub fn set_behavior(&self, behavior: GatewayBehavior) {
        *self.behavior.lock() = behavior;
    }

    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SignalingGateway for FakeGateway {
    async fn exchange(&self, _request: &SignalingRequest) -> CaptureResult<SignalingReply> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let delay = *self.delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let behavior = self.behavior.lock().clone();
        match behavior {
            GatewayBehavior::Reply(body) => Ok(serde_json::from_value(body)?),
            GatewayBehavior::Unavailable => Err(CaptureError::SignalingUnavailable(
                "connection refused".into(),
            )),
            GatewayBehavior::Hang => std::future::pending().await,
        }
    }
}

pub fn test_config() -> CoordinatorConfig {
    CoordinatorConfig {
        negotiation_timeout_ms: 2_000,
        poll_interval_ms: 20,
        ..Default::default()
    }
}

pub fn offer() -> Arc<StaticOffer> {
    Arc::new(StaticOffer::new(
        SessionDescriptor::new("v=0\r\no=browser 1 1 IN IP4 127.0.0.1").unwrap(),
    ))
}

pub fn coordinator_with(
    api: Arc<FakeCaptureApi>,
    gateway: Arc<FakeGateway>,
    config: &CoordinatorConfig,
) -> CaptureCoordinator {
    let signaling = SignalingClient::from_config(gateway, config);
    CaptureCoordinator::new(api, signaling, offer(), config)
}
