use std::time::Duration;

use tokio::{task::JoinHandle, time::MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::connection::{ConnectionError, ConnectionManager};

/// Sub-minute so a suspended and restarted host reconnects quickly. It also
/// bounds how long an intent written by another process takes to apply.
pub const DEFAULT_KEEPALIVE_PERIOD: Duration = Duration::from_secs(10);

/// Re-invokes [`ConnectionManager::ensure_connected`] on a fixed period.
///
/// The first tick fires immediately. Ticks carry no state of their own; the
/// manager re-reads intent and credentials from storage on each call, so a
/// tick is correct no matter what happened to the process in between.
#[derive(Debug)]
pub struct KeepAliveScheduler {
    task: JoinHandle<()>,
}

impl KeepAliveScheduler {
    pub fn start(manager: ConnectionManager, period: Duration) -> Self {
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            // After a suspension, resume with one tick instead of a burst.
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                ticker.tick().await;
                match manager.ensure_connected().await {
                    Ok(outcome) => debug!(?outcome, "keep-alive tick"),
                    Err(ConnectionError::ManagerGone) => {
                        info!("connection manager gone, keep-alive stopping");
                        break;
                    }
                    Err(err) => warn!("keep-alive tick failed: {}", err),
                }
            }
        });

        Self { task }
    }

    pub fn stop(&self) {
        self.task.abort();
    }
}

impl Drop for KeepAliveScheduler {
    fn drop(&mut self) {
        self.task.abort();
    }
}
