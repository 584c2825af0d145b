use std::sync::Arc;

use codepush_core::{CoreError, PageMessage, PushMessage, decode_push_message};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

pub type PageId = u64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub title: String,
    pub message: String,
    pub code: String,
}

impl Notification {
    pub fn code_received(code: &str) -> Self {
        Self {
            title: "Verification code received".to_owned(),
            message: format!("Code {code} received, attempting to fill"),
            code: code.to_owned(),
        }
    }
}

#[derive(Debug, Error)]
pub enum HostError {
    #[error("page {0} is gone")]
    PageGone(PageId),
    #[error("host unavailable: {0}")]
    Unavailable(String),
}

/// The environment hosting the relay: knows which pages are active, can post
/// messages to their in-page agents, and can raise user-visible notifications.
pub trait RelayHost: Send + Sync {
    fn active_pages(&self) -> Result<Vec<PageId>, HostError>;

    fn send_to_page(&self, page: PageId, message: &PageMessage) -> Result<(), HostError>;

    fn notify(&self, notification: &Notification) -> Result<(), HostError>;
}

impl<H: RelayHost + ?Sized> RelayHost for Arc<H> {
    fn active_pages(&self) -> Result<Vec<PageId>, HostError> {
        (**self).active_pages()
    }

    fn send_to_page(&self, page: PageId, message: &PageMessage) -> Result<(), HostError> {
        (**self).send_to_page(page, message)
    }

    fn notify(&self, notification: &Notification) -> Result<(), HostError> {
        (**self).notify(notification)
    }
}

#[derive(Debug)]
pub enum Dispatch {
    /// Valid frame with a kind this client does not act on.
    Ignored,
    /// Malformed frame, dropped.
    Dropped(CoreError),
    Delivered { pages: usize, notified: bool },
}

/// Parses inbound channel frames and routes verification codes to the active page.
///
/// Nothing here can fail the channel: bad frames are logged and dropped, and
/// page delivery and notification are independent best-effort side effects.
pub struct CodeDispatcher<H> {
    host: H,
}

impl<H: RelayHost> CodeDispatcher<H> {
    pub fn new(host: H) -> Self {
        Self { host }
    }

    pub fn host(&self) -> &H {
        &self.host
    }

    pub fn on_message(&self, raw: &str) -> Dispatch {
        let message = match decode_push_message(raw) {
            Ok(message) => message,
            Err(err) => {
                warn!("dropping malformed push message: {}", err);
                return Dispatch::Dropped(err);
            }
        };

        match message {
            PushMessage::VerificationCode { code } => self.dispatch_code(code.trim()),
            PushMessage::Ping | PushMessage::Unknown => {
                debug!("ignoring push message without a handler");
                Dispatch::Ignored
            }
        }
    }

    /// Consumes inbound frames until the channel side goes away.
    pub async fn run(self, mut inbound_rx: mpsc::UnboundedReceiver<String>) {
        while let Some(raw) = inbound_rx.recv().await {
            self.on_message(&raw);
        }
        debug!("inbound stream ended, dispatcher stopping");
    }

    fn dispatch_code(&self, code: &str) -> Dispatch {
        info!("verification code received");

        let message = PageMessage::FillCode {
            code: code.to_owned(),
        };
        let mut pages = 0;
        match self.host.active_pages() {
            Ok(active) => {
                for page in active {
                    match self.host.send_to_page(page, &message) {
                        Ok(()) => pages += 1,
                        Err(err) => debug!(page, "page did not take the code: {}", err),
                    }
                }
            }
            Err(err) => warn!("cannot query active pages: {}", err),
        }

        let notified = match self.host.notify(&Notification::code_received(code)) {
            Ok(()) => true,
            Err(err) => {
                warn!("notification failed: {}", err);
                false
            }
        };

        Dispatch::Delivered { pages, notified }
    }
}
