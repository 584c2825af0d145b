//! Host glue for running the client as a desktop process.
//!
//! There is a single local "page": an optional DOM snapshot file. Codes are
//! forwarded to a [`PageAgent`](crate::agent::PageAgent) task, notifications go
//! to the log and stdout.

use std::path::PathBuf;

use codepush_core::{Document, ElementId, PageMessage};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::{
    agent::{InputEvent, Overlay, OverlayId, PageEvent, PageSurface},
    dispatcher::{HostError, Notification, PageId, RelayHost},
};

pub const LOCAL_PAGE: PageId = 0;

pub struct DesktopHost {
    page_tx: mpsc::UnboundedSender<PageEvent>,
}

impl DesktopHost {
    pub fn new(page_tx: mpsc::UnboundedSender<PageEvent>) -> Self {
        Self { page_tx }
    }
}

impl RelayHost for DesktopHost {
    fn active_pages(&self) -> Result<Vec<PageId>, HostError> {
        if self.page_tx.is_closed() {
            return Ok(Vec::new());
        }
        Ok(vec![LOCAL_PAGE])
    }

    fn send_to_page(&self, page: PageId, message: &PageMessage) -> Result<(), HostError> {
        if page != LOCAL_PAGE {
            return Err(HostError::PageGone(page));
        }
        self.page_tx
            .send(PageEvent::Message(message.clone()))
            .map_err(|_| HostError::PageGone(page))
    }

    fn notify(&self, notification: &Notification) -> Result<(), HostError> {
        info!(code = %notification.code, "{}", notification.title);
        println!("{}: {}", notification.title, notification.message);
        Ok(())
    }
}

/// A page backed by a snapshot file, re-read on every snapshot. Fills are
/// applied to the in-memory copy.
pub struct HeadlessPage {
    snapshot_path: Option<PathBuf>,
    document: Document,
}

impl HeadlessPage {
    pub fn new(snapshot_path: Option<PathBuf>) -> Self {
        Self {
            snapshot_path,
            document: Document::new(),
        }
    }

    pub fn document(&self) -> &Document {
        &self.document
    }

    fn reload(&mut self) {
        let Some(path) = &self.snapshot_path else {
            return;
        };
        match std::fs::read_to_string(path) {
            Ok(raw) => match Document::from_json(&raw) {
                Ok(document) => self.document = document,
                Err(err) => warn!(path = %path.display(), "invalid page snapshot: {}", err),
            },
            Err(err) => warn!(path = %path.display(), "cannot read page snapshot: {}", err),
        }
    }
}

impl PageSurface for HeadlessPage {
    fn snapshot(&mut self) -> Document {
        self.reload();
        self.document.clone()
    }

    fn set_value(&mut self, element: ElementId, value: &str) {
        if let Some(target) = self.document.get_mut(element) {
            target.attributes.insert("value".to_owned(), value.to_owned());
            info!(element = element.0, tag = %target.tag, "filled code into page");
        }
    }

    fn dispatch_event(&mut self, element: ElementId, event: InputEvent) {
        debug!(element = element.0, event = event.as_str(), "dispatched event");
    }

    fn show_overlay(&mut self, overlay: &Overlay) {
        if overlay.copied {
            println!("Code {} copied to clipboard", overlay.code);
        } else {
            println!("Code {} (clipboard unavailable)", overlay.code);
        }
    }

    fn remove_overlay(&mut self, id: OverlayId) {
        debug!(overlay = id.0, "overlay dismissed");
    }
}

#[cfg(test)]
mod tests {
    use codepush_core::Element;

    use super::*;

    #[test]
    fn host_forwards_codes_to_local_page() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let host = DesktopHost::new(tx);

        assert_eq!(host.active_pages().unwrap(), vec![LOCAL_PAGE]);
        let message = PageMessage::FillCode {
            code: "123456".to_owned(),
        };
        host.send_to_page(LOCAL_PAGE, &message).unwrap();
        assert_eq!(rx.try_recv().unwrap(), PageEvent::Message(message.clone()));

        assert!(matches!(
            host.send_to_page(9, &message),
            Err(HostError::PageGone(9))
        ));
    }

    #[test]
    fn host_without_agent_reports_no_pages() {
        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx);
        let host = DesktopHost::new(tx);
        assert!(host.active_pages().unwrap().is_empty());
    }

    #[test]
    fn headless_page_loads_snapshot_and_records_fill() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("page.json");
        let mut document = Document::new();
        let id = document.push(Element::input().with_attr("autocomplete", "one-time-code"));
        std::fs::write(&path, serde_json::to_string(&document).unwrap()).unwrap();

        let mut page = HeadlessPage::new(Some(path));
        assert_eq!(page.snapshot(), document);

        page.set_value(id, "4821");
        assert_eq!(
            page.document().get(id).and_then(|element| element.attr("value")),
            Some("4821")
        );
    }

    #[test]
    fn missing_snapshot_keeps_empty_page() {
        let mut page = HeadlessPage::new(Some(PathBuf::from("/nonexistent/page.json")));
        assert_eq!(page.snapshot(), Document::new());
    }
}
