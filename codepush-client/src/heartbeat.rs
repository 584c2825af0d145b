use std::time::Duration;

use codepush_core::{PushMessage, encode_push_message};
use tokio::{sync::mpsc, task::JoinHandle};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error};

pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(20);

/// Sends `PING` frames on a fixed interval for as long as the channel accepts them.
///
/// Replies are not tracked: a half-open connection is only noticed once the
/// transport itself reports an error.
#[derive(Debug)]
pub struct HeartbeatMonitor {
    task: JoinHandle<()>,
}

impl HeartbeatMonitor {
    pub fn start(channel: mpsc::UnboundedSender<Message>, interval: Duration) -> Self {
        let task = tokio::spawn(async move {
            let ping = match encode_push_message(&PushMessage::Ping) {
                Ok(ping) => ping,
                Err(err) => {
                    error!("failed to encode ping: {}", err);
                    return;
                }
            };

            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await; // skip first immediate tick

            loop {
                ticker.tick().await;
                if channel.send(Message::Text(ping.clone().into())).is_err() {
                    debug!("channel closed, heartbeat stopping");
                    break;
                }
                debug!("ping queued");
            }
        });

        Self { task }
    }

    pub fn stop(&self) {
        self.task.abort();
    }

    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }
}

impl Drop for HeartbeatMonitor {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[cfg(test)]
mod tests {
    use tokio::time::timeout;

    use super::*;

    #[tokio::test]
    async fn sends_pings_on_interval() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let monitor = HeartbeatMonitor::start(tx, Duration::from_millis(20));

        for _ in 0..2 {
            let message = timeout(Duration::from_secs(2), rx.recv())
                .await
                .expect("ping within timeout")
                .expect("channel open");
            assert_eq!(message, Message::Text(r#"{"type":"PING"}"#.into()));
        }

        monitor.stop();
    }

    #[tokio::test]
    async fn no_ping_before_first_interval_elapses() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let _monitor = HeartbeatMonitor::start(tx, Duration::from_secs(60));

        let early = timeout(Duration::from_millis(100), rx.recv()).await;
        assert!(early.is_err(), "ping sent before the interval elapsed");
    }

    #[tokio::test]
    async fn stops_when_channel_goes_away() {
        let (tx, rx) = mpsc::unbounded_channel();
        let monitor = HeartbeatMonitor::start(tx, Duration::from_millis(10));
        drop(rx);

        timeout(Duration::from_secs(2), async {
            while monitor.is_running() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("heartbeat task exits");
    }

    #[tokio::test]
    async fn stop_cancels_pings() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let monitor = HeartbeatMonitor::start(tx, Duration::from_millis(20));
        monitor.stop();

        // Aborting drops the sender, so the receiver ends without a ping.
        let next = timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("receiver resolves");
        assert!(next.is_none());
    }
}
