//! Background status polling
//!
//! Periodically pulls the server's view of every workshop with an active
//! task and retries remote cancels that failed earlier.

use super::coordinator::Inner;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

pub(crate) struct StatusPoller {
    stop_flag: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

impl StatusPoller {
    /// Must be called from within a tokio runtime
    pub(crate) fn spawn(inner: Weak<Inner>, period: Duration) -> Self {
        let stop_flag = Arc::new(AtomicBool::new(false));
        let flag = stop_flag.clone();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // first tick completes immediately
            ticker.tick().await;

            tracing::debug!(?period, "status poller started");
            loop {
                ticker.tick().await;
                if flag.load(Ordering::Relaxed) {
                    break;
                }
                let Some(inner) = inner.upgrade() else {
                    break;
                };
                poll_once(&inner).await;
            }
            tracing::debug!("status poller stopped");
        });

        Self { stop_flag, handle }
    }

    pub(crate) fn stop(self) {
        self.stop_flag.store(true, Ordering::Relaxed);
        self.handle.abort();
    }
}

async fn poll_once(inner: &Inner) {
    inner.retry_remote_cancels().await;

    for workshop_id in inner.registry.active_workshops() {
        match inner.sync_workshop(&workshop_id).await {
            Ok(0) => {}
            Ok(changed) => {
                tracing::debug!(workshop_id = %workshop_id, changed, "reconciled workshop tasks");
            }
            Err(err) => {
                tracing::warn!(workshop_id = %workshop_id, "status poll failed: {}", err);
            }
        }
    }
}
