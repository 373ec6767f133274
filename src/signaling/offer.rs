//! Local offer generation

use super::session::SessionDescriptor;
use crate::task::state::WorkshopId;
use crate::utils::error::{CaptureError, CaptureResult};
use async_trait::async_trait;
use std::path::Path;

/// Produces the local session description for a preview attempt
#[async_trait]
pub trait OfferSource: Send + Sync {
    async fn create_offer(&self, workshop_id: &WorkshopId) -> CaptureResult<SessionDescriptor>;
}

/// Hands out the same pre-built offer for every workshop
#[derive(Debug, Clone)]
pub struct StaticOffer {
    offer: SessionDescriptor,
}

impl StaticOffer {
    pub fn new(offer: SessionDescriptor) -> Self {
        Self { offer }
    }

    /// Read an SDP offer from disk
    pub async fn from_file(path: impl AsRef<Path>) -> CaptureResult<Self> {
        let path = path.as_ref();
        let sdp = tokio::fs::read_to_string(path).await.map_err(|e| {
            CaptureError::InvalidRequest(format!(
                "cannot read offer from {}: {e}",
                path.display()
            ))
        })?;
        Ok(Self::new(SessionDescriptor::new(sdp)?))
    }
}

#[async_trait]
impl OfferSource for StaticOffer {
    async fn create_offer(&self, _workshop_id: &WorkshopId) -> CaptureResult<SessionDescriptor> {
        Ok(self.offer.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[tokio::test]
    async fn test_offer_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "v=0\r\no=- 0 0 IN IP4 127.0.0.1").unwrap();
        let source = StaticOffer::from_file(file.path()).await.unwrap();
        let offer = source.create_offer(&WorkshopId::new("W1")).await.unwrap();
        assert!(offer.as_str().starts_with("v=0"));
    }

    #[tokio::test]
    async fn test_empty_offer_file_rejected() {
        let file = tempfile::NamedTempFile::new().unwrap();
        assert!(StaticOffer::from_file(file.path()).await.is_err());
    }
}
