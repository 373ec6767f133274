//! Signaling client
//!
//! Performs the offer/answer exchange against the media gateway and
//! validates what comes back. Task state is never touched here.

use super::session::{MediaSession, SessionDescriptor, SignalingReply, SignalingRequest, SignalingSession};
use crate::config::CoordinatorConfig;
use crate::task::state::WorkshopId;
use crate::utils::error::{CaptureError, CaptureResult};
use async_trait::async_trait;
use reqwest::StatusCode;
use std::sync::Arc;
use std::time::Duration;
use url::Url;

/// Transport for a single signaling round trip
#[async_trait]
pub trait SignalingGateway: Send + Sync {
    async fn exchange(&self, request: &SignalingRequest) -> CaptureResult<SignalingReply>;
}

/// `POST /webrtc` over HTTP
pub struct HttpSignalingGateway {
    http: reqwest::Client,
    endpoint: Url,
}

impl HttpSignalingGateway {
    pub fn new(http: reqwest::Client, endpoint: Url) -> Self {
        Self { http, endpoint }
    }

    pub fn from_config(http: reqwest::Client, config: &CoordinatorConfig) -> CaptureResult<Self> {
        Ok(Self::new(http, config.signaling_endpoint()?))
    }
}

fn unavailable(err: reqwest::Error) -> CaptureError {
    CaptureError::SignalingUnavailable(err.to_string())
}

#[async_trait]
impl SignalingGateway for HttpSignalingGateway {
    async fn exchange(&self, request: &SignalingRequest) -> CaptureResult<SignalingReply> {
        tracing::debug!(
            endpoint = %self.endpoint,
            workshop_id = %request.workshop_id,
            nonce = %request.nonce,
            "sending signaling offer"
        );

        let response = self
            .http
            .post(self.endpoint.clone())
            .json(request)
            .send()
            .await
            .map_err(unavailable)?;

        let status = response.status();
        // proxy and load balancer failures, whatever body they carry
        if matches!(
            status,
            StatusCode::BAD_GATEWAY | StatusCode::SERVICE_UNAVAILABLE | StatusCode::GATEWAY_TIMEOUT
        ) {
            return Err(CaptureError::SignalingUnavailable(format!(
                "gateway responded with {status}"
            )));
        }
        let body = response.bytes().await.map_err(unavailable)?;

        match serde_json::from_slice::<SignalingReply>(&body) {
            Ok(reply) => Ok(reply),
            Err(_) if status.is_server_error() => Err(CaptureError::SignalingUnavailable(format!(
                "gateway responded with {status}"
            ))),
            Err(err) => Err(CaptureError::InvalidSignalingResponse(format!(
                "undecodable gateway response ({status}): {err}"
            ))),
        }
    }
}

/// Negotiates preview sessions with timeout and bounded retry
#[derive(Clone)]
pub struct SignalingClient {
    gateway: Arc<dyn SignalingGateway>,
    timeout: Duration,
    attempts: u32,
    backoff: Duration,
}

impl SignalingClient {
    pub fn new(gateway: Arc<dyn SignalingGateway>, timeout: Duration) -> Self {
        Self {
            gateway,
            timeout,
            attempts: 1,
            backoff: Duration::from_millis(250),
        }
    }

    pub fn from_config(gateway: Arc<dyn SignalingGateway>, config: &CoordinatorConfig) -> Self {
        Self::new(gateway, config.negotiation_timeout())
            .with_retry(config.negotiation_attempts, config.retry_backoff())
    }

    /// Retry `SignalingUnavailable` up to `attempts` total tries
    pub fn with_retry(mut self, attempts: u32, backoff: Duration) -> Self {
        self.attempts = attempts.max(1);
        self.backoff = backoff;
        self
    }

    /// Exchange `offer` for the gateway's answer
    pub async fn negotiate(
        &self,
        workshop_id: &WorkshopId,
        offer: SessionDescriptor,
    ) -> CaptureResult<MediaSession> {
        let mut attempt = 1;
        loop {
            match self.negotiate_once(workshop_id, offer.clone()).await {
                Err(CaptureError::SignalingUnavailable(reason)) if attempt < self.attempts => {
                    let delay = self.backoff * 2u32.saturating_pow(attempt - 1);
                    tracing::warn!(
                        workshop_id = %workshop_id,
                        attempt,
                        ?delay,
                        "signaling unavailable ({}), retrying",
                        reason
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                result => return result,
            }
        }
    }

    async fn negotiate_once(
        &self,
        workshop_id: &WorkshopId,
        offer: SessionDescriptor,
    ) -> CaptureResult<MediaSession> {
        let session = SignalingSession::new(workshop_id.clone(), offer);
        let request = session.request();

        let reply = tokio::time::timeout(self.timeout, self.gateway.exchange(&request))
            .await
            .map_err(|_| {
                CaptureError::SignalingUnavailable(format!(
                    "no answer within {}ms",
                    self.timeout.as_millis()
                ))
            })??;

        let media = session.accept(reply)?;
        tracing::info!(
            workshop_id = %workshop_id,
            nonce = %media.nonce,
            "preview session negotiated"
        );
        Ok(media)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::collections::VecDeque;

    /// Replays scripted outcomes; `None` never answers
    struct ScriptedGateway {
        script: Mutex<VecDeque<Option<CaptureResult<&'static str>>>>,
        calls: Mutex<u32>,
    }

    impl ScriptedGateway {
        fn new(script: Vec<Option<CaptureResult<&'static str>>>) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(script.into()),
                calls: Mutex::new(0),
            })
        }

        fn calls(&self) -> u32 {
            *self.calls.lock()
        }
    }

    #[async_trait]
    impl SignalingGateway for ScriptedGateway {
        async fn exchange(&self, _request: &SignalingRequest) -> CaptureResult<SignalingReply> {
            *self.calls.lock() += 1;
            let next = self.script.lock().pop_front().flatten();
            match next {
                Some(Ok(body)) => Ok(serde_json::from_str(body)?),
                Some(Err(err)) => Err(err),
                None => std::future::pending().await,
            }
        }
    }

    fn offer() -> SessionDescriptor {
        SessionDescriptor::new("v=0 offer").unwrap()
    }

    #[tokio::test]
    async fn test_negotiate_success() {
        let gateway = ScriptedGateway::new(vec![Some(Ok(r#"{"success":true,"sdp":"v=0 answer"}"#))]);
        let client = SignalingClient::new(gateway.clone(), Duration::from_secs(1));
        let media = client.negotiate(&WorkshopId::new("W1"), offer()).await.unwrap();
        assert_eq!(media.answer.as_str(), "v=0 answer");
        assert_eq!(gateway.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_negotiate_times_out() {
        let gateway = ScriptedGateway::new(vec![None]);
        let client = SignalingClient::new(gateway, Duration::from_secs(3));
        let err = client.negotiate(&WorkshopId::new("W1"), offer()).await.unwrap_err();
        assert!(matches!(err, CaptureError::SignalingUnavailable(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unavailable_is_retried() {
        let gateway = ScriptedGateway::new(vec![
            Some(Err(CaptureError::SignalingUnavailable("reset".into()))),
            Some(Ok(r#"{"success":true,"sdp":"v=0"}"#)),
        ]);
        let client = SignalingClient::new(gateway.clone(), Duration::from_secs(1))
            .with_retry(3, Duration::from_millis(100));
        assert!(client.negotiate(&WorkshopId::new("W1"), offer()).await.is_ok());
        assert_eq!(gateway.calls(), 2);
    }

    #[tokio::test]
    async fn test_invalid_response_not_retried() {
        let gateway = ScriptedGateway::new(vec![
            Some(Ok(r#"{"success":false}"#)),
            Some(Ok(r#"{"success":true,"sdp":"v=0"}"#)),
        ]);
        let client = SignalingClient::new(gateway.clone(), Duration::from_secs(1))
            .with_retry(3, Duration::from_millis(1));
        let err = client.negotiate(&WorkshopId::new("W1"), offer()).await.unwrap_err();
        assert!(matches!(err, CaptureError::InvalidSignalingResponse(_)));
        assert_eq!(gateway.calls(), 1);
    }
}
