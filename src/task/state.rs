//! Capture task state management
//!
//! Defines the capture task state machine and the task record it guards.

use crate::signaling::MediaSession;
use crate::utils::error::{CaptureError, CaptureResult};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

/// Accepts ids the backend emits as JSON numbers as well as strings.
fn opaque_id<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum RawId {
        Text(String),
        Number(u64),
    }

    match RawId::deserialize(deserializer)? {
        RawId::Text(text) => Ok(text),
        RawId::Number(number) => Ok(number.to_string()),
    }
}

/// Decimal ids go back out as JSON numbers; the backend binds them to integers.
fn serialize_opaque_id<S>(id: &str, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    match id.parse::<u64>() {
        Ok(number) if number.to_string() == id => serializer.serialize_u64(number),
        _ => serializer.serialize_str(id),
    }
}

/// Server-assigned capture task identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(String);

impl Serialize for TaskId {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serialize_opaque_id(&self.0, serializer)
    }
}

impl<'de> Deserialize<'de> for TaskId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        opaque_id(deserializer).map(Self)
    }
}

impl TaskId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Reference to a workshop owned by the external catalog
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WorkshopId(String);

impl Serialize for WorkshopId {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serialize_opaque_id(&self.0, serializer)
    }
}

impl<'de> Deserialize<'de> for WorkshopId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        opaque_id(deserializer).map(Self)
    }
}

impl WorkshopId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for WorkshopId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for WorkshopId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// Lifecycle state of a capture task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CaptureStatus {
    /// Created, preview not yet negotiated
    #[serde(alias = "waiting")]
    Pending,
    /// Recording with an attached preview
    Running,
    /// Finished normally
    Completed,
    /// Cancelled by an operator or by rollback
    Cancelled,
    /// Failed on the server side
    Failed,
}

impl Default for CaptureStatus {
    fn default() -> Self {
        Self::Pending
    }
}

impl CaptureStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CaptureStatus::Pending => "pending",
            CaptureStatus::Running => "running",
            CaptureStatus::Completed => "completed",
            CaptureStatus::Cancelled => "cancelled",
            CaptureStatus::Failed => "failed",
        }
    }

    /// Completed, cancelled and failed tasks never change again
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            CaptureStatus::Completed | CaptureStatus::Cancelled | CaptureStatus::Failed
        )
    }

    /// Pending and running tasks count against the one-per-workshop limit
    pub fn is_active(&self) -> bool {
        !self.is_terminal()
    }

    /// Single-step edges of the transition table
    pub fn can_transition_to(&self, next: CaptureStatus) -> bool {
        use CaptureStatus::*;
        matches!(
            (self, next),
            (Pending, Running)
                | (Pending, Cancelled)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Cancelled)
        )
    }

    /// Whether `target` lies on some forward path from this state.
    ///
    /// Server reports may skip intermediate states (a poll can observe a
    /// task only after it already completed), so reconciliation uses
    /// reachability rather than single edges.
    pub fn can_reach(&self, target: CaptureStatus) -> bool {
        use CaptureStatus::*;
        match self {
            Pending => target != Pending,
            Running => target.is_terminal(),
            Completed | Cancelled | Failed => false,
        }
    }
}

impl std::str::FromStr for CaptureStatus {
    type Err = CaptureError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pending" | "waiting" => Ok(CaptureStatus::Pending),
            "running" => Ok(CaptureStatus::Running),
            "completed" => Ok(CaptureStatus::Completed),
            "cancelled" => Ok(CaptureStatus::Cancelled),
            "failed" => Ok(CaptureStatus::Failed),
            other => Err(CaptureError::InvalidRequest(format!(
                "unknown capture status {other}"
            ))),
        }
    }
}

impl fmt::Display for CaptureStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of feeding a status change through the guard
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// State moved forward
    Applied { from: CaptureStatus, to: CaptureStatus },
    /// Already in the requested state (or already terminal for cancel)
    Unchanged,
    /// Stale or regressing update, ignored
    Dropped { from: CaptureStatus, to: CaptureStatus },
}

impl Transition {
    pub fn is_applied(&self) -> bool {
        matches!(self, Transition::Applied { .. })
    }
}

/// Optional recording window for scheduled captures
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CaptureSchedule {
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    /// Segment length in minutes
    pub interval: u32,
}

impl CaptureSchedule {
    pub const MAX_INTERVAL_MINUTES: u32 = 1440;

    pub fn validate(&self, now: DateTime<Utc>) -> CaptureResult<()> {
        if self.start_time > self.end_time {
            return Err(CaptureError::InvalidRequest(
                "start time must not be after end time".into(),
            ));
        }
        if self.start_time < now {
            return Err(CaptureError::InvalidRequest(
                "start time must not be in the past".into(),
            ));
        }
        if self.interval < 1 || self.interval > Self::MAX_INTERVAL_MINUTES {
            return Err(CaptureError::InvalidRequest(format!(
                "interval must be between 1 and {} minutes",
                Self::MAX_INTERVAL_MINUTES
            )));
        }
        Ok(())
    }

    /// Number of segments the window produces
    pub fn segment_count(&self) -> i64 {
        let window = self.end_time - self.start_time;
        window.num_minutes() / i64::from(self.interval.max(1))
    }

    /// Window starting `lead` from now, `segments` intervals long
    pub fn starting_in(lead: Duration, interval: u32, segments: u32) -> Self {
        let start_time = Utc::now() + lead;
        Self {
            start_time,
            end_time: start_time + Duration::minutes(i64::from(interval) * i64::from(segments)),
            interval,
        }
    }
}

/// Parameters for creating a capture task
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CaptureRequest {
    pub workshop_id: WorkshopId,
    #[serde(flatten, skip_serializing_if = "Option::is_none")]
    pub schedule: Option<CaptureSchedule>,
}

impl CaptureRequest {
    /// Capture starting immediately
    pub fn new(workshop_id: WorkshopId) -> Self {
        Self {
            workshop_id,
            schedule: None,
        }
    }

    pub fn with_schedule(mut self, schedule: CaptureSchedule) -> Self {
        self.schedule = Some(schedule);
        self
    }

    pub fn validate(&self) -> CaptureResult<()> {
        if self.workshop_id.as_str().trim().is_empty() {
            return Err(CaptureError::InvalidRequest("workshop id is empty".into()));
        }
        match &self.schedule {
            Some(schedule) => schedule.validate(Utc::now()),
            None => Ok(()),
        }
    }
}

/// A single capture task as tracked by the registry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CaptureTask {
    pub id: TaskId,

    pub workshop_id: WorkshopId,

    #[serde(default)]
    pub status: CaptureStatus,

    pub created_at: DateTime<Utc>,

    /// Falls back to `created_at` when the server omits it
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,

    /// Failure reason reported by the server
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,

    #[serde(flatten, skip_serializing_if = "Option::is_none")]
    pub schedule: Option<CaptureSchedule>,
}

impl CaptureTask {
    /// Create a fresh task in `pending`
    pub fn new(id: TaskId, workshop_id: WorkshopId) -> Self {
        let now = Utc::now();
        Self {
            id,
            workshop_id,
            status: CaptureStatus::Pending,
            created_at: now,
            updated_at: Some(now),
            error_message: None,
            schedule: None,
        }
    }

    pub fn last_updated(&self) -> DateTime<Utc> {
        self.updated_at.unwrap_or(self.created_at)
    }

    pub fn is_active(&self) -> bool {
        self.status.is_active()
    }

    fn set_status(&mut self, to: CaptureStatus) -> Transition {
        let from = self.status;
        self.status = to;
        self.updated_at = Some(Utc::now());
        Transition::Applied { from, to }
    }

    /// Move `pending -> running` once a preview has been negotiated
    pub fn mark_running(&mut self, session: &MediaSession) -> CaptureResult<Transition> {
        if !self.status.can_transition_to(CaptureStatus::Running) {
            return Err(CaptureError::InvalidTransition {
                from: self.status,
                to: CaptureStatus::Running,
            });
        }
        if session.workshop_id != self.workshop_id {
            return Err(CaptureError::InvalidRequest(format!(
                "session for workshop {} cannot attach to task {} of workshop {}",
                session.workshop_id, self.id, self.workshop_id
            )));
        }
        Ok(self.set_status(CaptureStatus::Running))
    }

    /// Cancel the task; a no-op once terminal
    pub fn cancel(&mut self) -> Transition {
        if self.status.is_terminal() {
            return Transition::Unchanged;
        }
        self.set_status(CaptureStatus::Cancelled)
    }

    /// Reconcile an out-of-band status report
    pub fn apply_server_status(&mut self, status: CaptureStatus) -> Transition {
        if status == self.status {
            return Transition::Unchanged;
        }
        if !self.status.can_reach(status) {
            return Transition::Dropped {
                from: self.status,
                to: status,
            };
        }
        self.set_status(status)
    }
}
