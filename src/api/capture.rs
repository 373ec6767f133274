//! Capture API client
//!
//! Thin typed wrapper over the external `/captures` endpoints.

use super::envelope::{Envelope, ErrorBody};
use crate::config::CoordinatorConfig;
use crate::task::state::{CaptureRequest, CaptureStatus, CaptureTask, TaskId, WorkshopId};
use crate::utils::error::{CaptureError, CaptureResult};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use url::Url;

/// Server-side capture task operations
#[async_trait]
pub trait CaptureApi: Send + Sync {
    /// `POST /captures`; the returned task is always `pending`
    async fn create(&self, request: &CaptureRequest) -> CaptureResult<CaptureTask>;

    /// `GET /captures[?workshopId=]`
    async fn list(&self, workshop_id: Option<&WorkshopId>) -> CaptureResult<Vec<CaptureTask>>;

    /// `GET /captures/{id}`
    async fn get(&self, id: &TaskId) -> CaptureResult<CaptureTask>;

    /// `POST /captures/{id}/cancel`
    async fn cancel(&self, id: &TaskId) -> CaptureResult<()>;
}

/// Minimal create response: `{id, status, createdAt}`
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreatedCapture {
    id: TaskId,
    status: Option<CaptureStatus>,
    created_at: Option<DateTime<Utc>>,
}

impl CreatedCapture {
    fn into_task(self, request: &CaptureRequest) -> CaptureTask {
        if let Some(status) = self.status.filter(|s| *s != CaptureStatus::Pending) {
            tracing::debug!(
                task_id = %self.id,
                %status,
                "server created task in non-pending state, tracking as pending"
            );
        }
        let mut task = CaptureTask::new(self.id, request.workshop_id.clone());
        if let Some(created_at) = self.created_at {
            task.created_at = created_at;
            task.updated_at = Some(created_at);
        }
        task.schedule = request.schedule.clone();
        task
    }
}

pub struct HttpCaptureApi {
    http: reqwest::Client,
    base: Url,
}

impl HttpCaptureApi {
    /// `base` must end with a slash, e.g. `http://host/api/`
    pub fn new(http: reqwest::Client, base: Url) -> Self {
        Self { http, base }
    }

    pub fn from_config(http: reqwest::Client, config: &CoordinatorConfig) -> CaptureResult<Self> {
        Ok(Self::new(http, config.api_base()?))
    }

    fn url(&self, path: &str) -> CaptureResult<Url> {
        self.base
            .join(path)
            .map_err(|e| CaptureError::Config(format!("cannot build url for {path}: {e}")))
    }

    fn task_url(&self, id: &TaskId, suffix: &str) -> CaptureResult<Url> {
        self.url(&format!("captures/{}{}", urlencoding::encode(id.as_str()), suffix))
    }

    /// Send and decode, mapping HTTP failures onto the error taxonomy
    async fn call<T: DeserializeOwned>(
        &self,
        request: reqwest::RequestBuilder,
        what: &str,
    ) -> CaptureResult<Option<T>> {
        let response = request.send().await.map_err(|e| CaptureError::api(e.to_string()))?;
        let status = response.status();
        let body = response
            .bytes()
            .await
            .map_err(|e| CaptureError::api(e.to_string()))?;

        if !status.is_success() {
            let error: ErrorBody = serde_json::from_slice(&body).unwrap_or_default();
            if status == StatusCode::NOT_FOUND || error.is_record_not_found() {
                return Err(CaptureError::NotFound(what.to_string()));
            }
            return Err(CaptureError::Api {
                status: Some(status.as_u16()),
                message: error
                    .describe()
                    .unwrap_or_else(|| format!("{what} failed with {status}")),
            });
        }

        if body.iter().all(u8::is_ascii_whitespace) {
            return Ok(None);
        }
        serde_json::from_slice::<Envelope<T>>(&body)?.into_data()
    }
}

#[async_trait]
impl CaptureApi for HttpCaptureApi {
    async fn create(&self, request: &CaptureRequest) -> CaptureResult<CaptureTask> {
        tracing::debug!(workshop_id = %request.workshop_id, "creating capture task");
        let created: Option<CreatedCapture> = self
            .call(
                self.http.post(self.url("captures")?).json(request),
                "create capture",
            )
            .await?;
        created
            .map(|created| created.into_task(request))
            .ok_or_else(|| CaptureError::api("create capture returned no task"))
    }

    async fn list(&self, workshop_id: Option<&WorkshopId>) -> CaptureResult<Vec<CaptureTask>> {
        let mut builder = self.http.get(self.url("captures")?);
        if let Some(workshop_id) = workshop_id {
            builder = builder.query(&[("workshopId", workshop_id.as_str())]);
        }
        let tasks: Option<Vec<CaptureTask>> = self.call(builder, "list captures").await?;
        Ok(tasks.unwrap_or_default())
    }

    async fn get(&self, id: &TaskId) -> CaptureResult<CaptureTask> {
        let task: Option<CaptureTask> = self
            .call(self.http.get(self.task_url(id, "")?), &format!("capture {id}"))
            .await?;
        task.ok_or_else(|| CaptureError::NotFound(format!("capture {id}")))
    }

    async fn cancel(&self, id: &TaskId) -> CaptureResult<()> {
        let _: Option<serde_json::Value> = self
            .call(
                self.http.post(self.task_url(id, "/cancel")?),
                &format!("capture {id}"),
            )
            .await?;
        Ok(())
    }
}
