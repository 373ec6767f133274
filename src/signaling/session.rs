//! Offer/answer bookkeeping for one preview negotiation

use crate::task::state::WorkshopId;
use crate::utils::error::{CaptureError, CaptureResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A non-empty SDP blob
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionDescriptor(String);

impl SessionDescriptor {
    pub fn new(sdp: impl Into<String>) -> CaptureResult<Self> {
        let sdp = sdp.into();
        if sdp.trim().is_empty() {
            return Err(CaptureError::InvalidRequest("session descriptor is empty".into()));
        }
        Ok(Self(sdp))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Body posted to the signaling gateway
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignalingRequest {
    pub workshop_id: WorkshopId,
    pub sdp_offer: String,
    pub nonce: String,
}

/// Answer payload as the gateway reports it
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignalingAnswer {
    #[serde(default)]
    pub success: bool,
    #[serde(default)]
    pub sdp: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
    /// Echoed correlation token, when the gateway supports it
    #[serde(default)]
    pub nonce: Option<String>,
    #[serde(default)]
    pub workshop_id: Option<WorkshopId>,
}

/// Gateway reply, either bare or wrapped in the backend's `{code, data}` envelope
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum SignalingReply {
    Enveloped {
        code: i64,
        #[serde(default)]
        message: Option<String>,
        #[serde(default)]
        data: Option<SignalingAnswer>,
    },
    Bare(SignalingAnswer),
}

impl SignalingReply {
    fn into_answer(self) -> CaptureResult<SignalingAnswer> {
        match self {
            SignalingReply::Bare(answer) => Ok(answer),
            SignalingReply::Enveloped {
                code: 0,
                data: Some(answer),
                ..
            } => Ok(answer),
            SignalingReply::Enveloped { code, message, .. } => {
                Err(CaptureError::InvalidSignalingResponse(format!(
                    "gateway returned code {code}: {}",
                    message.unwrap_or_else(|| "no answer payload".into())
                )))
            }
        }
    }
}

/// One in-flight offer awaiting its answer
#[derive(Debug, Clone)]
pub struct SignalingSession {
    pub workshop_id: WorkshopId,
    pub nonce: String,
    pub offer: SessionDescriptor,
    pub answer: Option<SessionDescriptor>,
}

impl SignalingSession {
    pub fn new(workshop_id: WorkshopId, offer: SessionDescriptor) -> Self {
        Self {
            workshop_id,
            nonce: Uuid::new_v4().simple().to_string(),
            offer,
            answer: None,
        }
    }

    pub fn request(&self) -> SignalingRequest {
        SignalingRequest {
            workshop_id: self.workshop_id.clone(),
            sdp_offer: self.offer.as_str().to_string(),
            nonce: self.nonce.clone(),
        }
    }

    /// Validate the reply against this offer and produce the media session
    pub fn accept(mut self, reply: SignalingReply) -> CaptureResult<MediaSession> {
        let answer = reply.into_answer()?;

        if !answer.success {
            return Err(CaptureError::InvalidSignalingResponse(
                answer
                    .message
                    .unwrap_or_else(|| "gateway reported failure".into()),
            ));
        }
        let sdp = answer
            .sdp
            .filter(|sdp| !sdp.trim().is_empty())
            .ok_or_else(|| CaptureError::InvalidSignalingResponse("missing answer sdp".into()))?;

        if let Some(echoed) = answer.nonce.as_deref() {
            if echoed != self.nonce {
                return Err(CaptureError::InvalidSignalingResponse(format!(
                    "answer nonce {echoed} does not match offer nonce {}",
                    self.nonce
                )));
            }
        }
        if let Some(workshop) = answer.workshop_id.as_ref() {
            if *workshop != self.workshop_id {
                return Err(CaptureError::InvalidSignalingResponse(format!(
                    "answer for workshop {workshop} does not match offer for {}",
                    self.workshop_id
                )));
            }
        }

        let answer = SessionDescriptor(sdp);
        self.answer = Some(answer.clone());
        Ok(MediaSession {
            workshop_id: self.workshop_id,
            nonce: self.nonce,
            offer: self.offer,
            answer,
            negotiated_at: Utc::now(),
        })
    }
}

/// Negotiated preview handle, attached to a task while it is running
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaSession {
    pub workshop_id: WorkshopId,
    pub nonce: String,
    pub offer: SessionDescriptor,
    pub answer: SessionDescriptor,
    pub negotiated_at: DateTime<Utc>,
}

impl MediaSession {
    pub fn new(
        workshop_id: WorkshopId,
        nonce: String,
        offer: SessionDescriptor,
        answer: SessionDescriptor,
    ) -> Self {
        Self {
            workshop_id,
            nonce,
            offer,
            answer,
            negotiated_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session() -> SignalingSession {
        SignalingSession::new(
            WorkshopId::new("W1"),
            SessionDescriptor::new("v=0 offer").unwrap(),
        )
    }

    fn reply(json: &str) -> SignalingReply {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn test_empty_descriptor_rejected() {
        assert!(SessionDescriptor::new("   ").is_err());
    }

    #[test]
    fn test_accept_bare_answer() {
        let media = session()
            .accept(reply(r#"{"success": true, "sdp": "v=0 answer"}"#))
            .unwrap();
        assert_eq!(media.answer.as_str(), "v=0 answer");
        assert_eq!(media.workshop_id.as_str(), "W1");
    }

    #[test]
    fn test_accept_enveloped_answer() {
        let media = session()
            .accept(reply(
                r#"{"code": 0, "message": "success", "data": {"success": true, "sdp": "v=0 a"}}"#,
            ))
            .unwrap();
        assert_eq!(media.answer.as_str(), "v=0 a");
    }

    #[test]
    fn test_failure_flag_rejected() {
        let err = session()
            .accept(reply(r#"{"success": false, "message": "rtsp unreachable"}"#))
            .unwrap_err();
        assert!(matches!(err, CaptureError::InvalidSignalingResponse(msg) if msg == "rtsp unreachable"));
    }

    #[test]
    fn test_missing_sdp_rejected() {
        let err = session().accept(reply(r#"{"success": true}"#)).unwrap_err();
        assert!(matches!(err, CaptureError::InvalidSignalingResponse(_)));

        let err = session()
            .accept(reply(r#"{"success": true, "sdp": ""}"#))
            .unwrap_err();
        assert!(matches!(err, CaptureError::InvalidSignalingResponse(_)));
    }

    #[test]
    fn test_nonzero_envelope_code_rejected() {
        let err = session()
            .accept(reply(r#"{"code": 500, "message": "boom"}"#))
            .unwrap_err();
        assert!(matches!(err, CaptureError::InvalidSignalingResponse(_)));
    }

    #[test]
    fn test_mismatched_nonce_rejected() {
        let err = session()
            .accept(reply(r#"{"success": true, "sdp": "v=0", "nonce": "other"}"#))
            .unwrap_err();
        assert!(matches!(err, CaptureError::InvalidSignalingResponse(_)));
    }

    #[test]
    fn test_echoed_nonce_accepted() {
        let session = session();
        let body = format!(r#"{{"success": true, "sdp": "v=0", "nonce": "{}"}}"#, session.nonce);
        assert!(session.accept(reply(&body)).is_ok());
    }

    #[test]
    fn test_request_shape() {
        let session = session();
        let value = serde_json::to_value(session.request()).unwrap();
        assert_eq!(value["workshopId"], "W1");
        assert_eq!(value["sdpOffer"], "v=0 offer");
        assert_eq!(value["nonce"], session.nonce.as_str());
    }
}
