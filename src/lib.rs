//! Workshop Capture - capture-task orchestration with live preview signaling.
//!
//! This is the main library crate. It tracks capture tasks for workshop
//! cameras, negotiates WebRTC preview sessions with the media gateway and
//! reconciles local task state with the Capture API.

pub mod api;
pub mod config;
pub mod orchestrator;
pub mod signaling;
pub mod task;
pub mod utils;

pub use config::CoordinatorConfig;
pub use orchestrator::CaptureCoordinator;
pub use signaling::{MediaSession, OfferSource, SessionDescriptor, SignalingClient, StaticOffer};
pub use task::{
    CaptureEvent, CaptureRequest, CaptureSchedule, CaptureStatus, CaptureTask, StatusUpdate,
    TaskId, TaskRegistry, Transition, WorkshopId,
};
pub use utils::error::{CaptureError, CaptureResult, ErrorResponse};

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Install the global tracing subscriber.
///
/// Honours `RUST_LOG`; safe to call more than once.
pub fn init_tracing() {
    let installed = tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "workshop_capture=debug,capturectl=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .try_init();

    if installed.is_ok() {
        tracing::info!("Starting Workshop Capture v{}", env!("CARGO_PKG_VERSION"));
    }
}
