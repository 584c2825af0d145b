//! In-page side of code delivery.
//!
//! The [`PageAgent`] receives `FILL_CODE` from the relay, picks a target
//! element with the [`TargetResolver`] and hands the code to the
//! [`DeliveryPresenter`], which copies it to the clipboard, fills the target
//! and shows an auto-dismissing confirmation overlay.

use std::time::{Duration, Instant};

use arboard::Clipboard;
use codepush_core::{Document, ElementId, PageMessage, TargetResolver};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

pub const DEFAULT_OVERLAY_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
#[error("clipboard write failed: {0}")]
pub struct ClipboardError(pub String);

pub trait ClipboardWriter {
    fn write_text(&mut self, text: &str) -> Result<(), ClipboardError>;
}

/// The OS clipboard.
#[derive(Debug, Default)]
pub struct SystemClipboard;

impl ClipboardWriter for SystemClipboard {
    fn write_text(&mut self, text: &str) -> Result<(), ClipboardError> {
        let mut clipboard = Clipboard::new().map_err(|err| ClipboardError(err.to_string()))?;
        clipboard
            .set_text(text.to_owned())
            .map_err(|err| ClipboardError(err.to_string()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputEvent {
    Input,
    Change,
}

impl InputEvent {
    pub fn as_str(self) -> &'static str {
        match self {
            InputEvent::Input => "input",
            InputEvent::Change => "change",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OverlayId(pub u64);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Overlay {
    pub id: OverlayId,
    pub code: String,
    /// Whether the automatic clipboard write succeeded.
    pub copied: bool,
}

/// What the agent can do to the page it lives in.
pub trait PageSurface {
    /// Captures the current document; may re-read page state.
    fn snapshot(&mut self) -> Document;

    /// Sets the element's value and raises `event` on it, bubbling.
    fn set_value(&mut self, element: ElementId, value: &str);

    fn dispatch_event(&mut self, element: ElementId, event: InputEvent);

    fn show_overlay(&mut self, overlay: &Overlay);

    /// Removing an overlay that is already gone is a no-op.
    fn remove_overlay(&mut self, id: OverlayId);
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryReport {
    pub copied: bool,
    pub filled: Option<ElementId>,
    pub overlay: OverlayId,
}

struct ShownOverlay {
    id: OverlayId,
    code: String,
    expires_at: Instant,
}

pub struct DeliveryPresenter<C> {
    clipboard: C,
    overlay_timeout: Duration,
    shown: Vec<ShownOverlay>,
    next_overlay: u64,
}

impl<C: ClipboardWriter> DeliveryPresenter<C> {
    pub fn new(clipboard: C, overlay_timeout: Duration) -> Self {
        Self {
            clipboard,
            overlay_timeout,
            shown: Vec::new(),
            next_overlay: 0,
        }
    }

    pub fn clipboard(&self) -> &C {
        &self.clipboard
    }

    pub fn deliver<P: PageSurface>(
        &mut self,
        page: &mut P,
        code: &str,
        target: Option<ElementId>,
        now: Instant,
    ) -> DeliveryReport {
        let copied = match self.clipboard.write_text(code) {
            Ok(()) => true,
            Err(err) => {
                warn!("{}", err);
                false
            }
        };

        if let Some(element) = target {
            page.set_value(element, code);
            page.dispatch_event(element, InputEvent::Input);
            page.dispatch_event(element, InputEvent::Change);
        }

        self.next_overlay += 1;
        let overlay = Overlay {
            id: OverlayId(self.next_overlay),
            code: code.to_owned(),
            copied,
        };
        page.show_overlay(&overlay);
        self.shown.push(ShownOverlay {
            id: overlay.id,
            code: overlay.code,
            expires_at: now + self.overlay_timeout,
        });

        DeliveryReport {
            copied,
            filled: target,
            overlay: overlay.id,
        }
    }

    /// The overlay's confirm button: retries the clipboard write under a real
    /// user gesture, then dismisses the overlay.
    pub fn confirm<P: PageSurface>(
        &mut self,
        page: &mut P,
        id: OverlayId,
    ) -> Result<(), ClipboardError> {
        let Some(index) = self.shown.iter().position(|shown| shown.id == id) else {
            return Ok(());
        };
        let shown = self.shown.remove(index);
        page.remove_overlay(id);
        self.clipboard.write_text(&shown.code)
    }

    /// Removes overlays whose timeout has passed; returns how many were removed.
    pub fn dismiss_expired<P: PageSurface>(&mut self, page: &mut P, now: Instant) -> usize {
        let before = self.shown.len();
        self.shown.retain(|shown| {
            if shown.expires_at <= now {
                page.remove_overlay(shown.id);
                false
            } else {
                true
            }
        });
        before - self.shown.len()
    }

    pub fn next_expiry(&self) -> Option<Instant> {
        self.shown.iter().map(|shown| shown.expires_at).min()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PageEvent {
    Message(PageMessage),
    OverlayConfirmed(OverlayId),
}

pub struct PageAgent<P, C> {
    page: P,
    resolver: TargetResolver,
    presenter: DeliveryPresenter<C>,
}

impl<P: PageSurface, C: ClipboardWriter> PageAgent<P, C> {
    pub fn new(page: P, resolver: TargetResolver, presenter: DeliveryPresenter<C>) -> Self {
        Self {
            page,
            resolver,
            presenter,
        }
    }

    pub fn page(&self) -> &P {
        &self.page
    }

    pub fn presenter(&self) -> &DeliveryPresenter<C> {
        &self.presenter
    }

    pub fn handle_message(&mut self, message: &PageMessage, now: Instant) -> DeliveryReport {
        match message {
            PageMessage::FillCode { code } => {
                let document = self.page.snapshot();
                let target = self.resolver.resolve(&document);
                match &target {
                    Some(target) => info!(rule = %target.rule, "fill target found"),
                    None => info!("no unambiguous fill target, clipboard only"),
                }
                self.presenter.deliver(
                    &mut self.page,
                    code,
                    target.map(|target| target.element),
                    now,
                )
            }
        }
    }

    pub fn confirm_overlay(&mut self, id: OverlayId) {
        if let Err(err) = self.presenter.confirm(&mut self.page, id) {
            warn!("{}", err);
        }
    }

    pub fn dismiss_expired(&mut self, now: Instant) -> usize {
        self.presenter.dismiss_expired(&mut self.page, now)
    }

    /// Handles page events until the relay side goes away, dismissing
    /// overlays as their timeouts pass.
    pub async fn run(mut self, mut events: mpsc::UnboundedReceiver<PageEvent>) {
        loop {
            let next_expiry = self.presenter.next_expiry();
            tokio::select! {
                event = events.recv() => match event {
                    Some(PageEvent::Message(message)) => {
                        self.handle_message(&message, Instant::now());
                    }
                    Some(PageEvent::OverlayConfirmed(id)) => self.confirm_overlay(id),
                    None => break,
                },
                _ = sleep_until(next_expiry), if next_expiry.is_some() => {
                    let removed = self.dismiss_expired(Instant::now());
                    debug!(removed, "overlays expired");
                }
            }
        }
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    if let Some(deadline) = deadline {
        tokio::time::sleep_until(tokio::time::Instant::from_std(deadline)).await;
    }
}

#[cfg(test)]
mod tests {
    use codepush_core::{Element, Layout};

    use super::*;

    #[derive(Default)]
    struct FakeClipboard {
        writes: Vec<String>,
        fail: bool,
    }

    impl ClipboardWriter for FakeClipboard {
        fn write_text(&mut self, text: &str) -> Result<(), ClipboardError> {
            if self.fail {
                return Err(ClipboardError("document not focused".to_owned()));
            }
            self.writes.push(text.to_owned());
            Ok(())
        }
    }

    #[derive(Default)]
    struct FakePage {
        document: Document,
        values: Vec<(ElementId, String)>,
        events: Vec<(ElementId, InputEvent)>,
        overlays: Vec<Overlay>,
    }

    impl PageSurface for FakePage {
        fn snapshot(&mut self) -> Document {
            self.document.clone()
        }

        fn set_value(&mut self, element: ElementId, value: &str) {
            self.values.push((element, value.to_owned()));
        }

        fn dispatch_event(&mut self, element: ElementId, event: InputEvent) {
            self.events.push((element, event));
        }

        fn show_overlay(&mut self, overlay: &Overlay) {
            self.overlays.push(overlay.clone());
        }

        fn remove_overlay(&mut self, id: OverlayId) {
            self.overlays.retain(|overlay| overlay.id != id);
        }
    }

    fn agent(document: Document, clipboard: FakeClipboard) -> PageAgent<FakePage, FakeClipboard> {
        PageAgent::new(
            FakePage {
                document,
                ..FakePage::default()
            },
            TargetResolver::default(),
            DeliveryPresenter::new(clipboard, DEFAULT_OVERLAY_TIMEOUT),
        )
    }

    fn fill(code: &str) -> PageMessage {
        PageMessage::FillCode {
            code: code.to_owned(),
        }
    }

    #[test]
    fn fills_target_and_raises_input_then_change() {
        let mut document = Document::new();
        document.push(Element::input().with_attr("id", "email"));
        let otp = document.push(Element::input().with_attr("autocomplete", "one-time-code"));
        let mut agent = agent(document, FakeClipboard::default());

        let report = agent.handle_message(&fill("123456"), Instant::now());

        assert_eq!(report.filled, Some(otp));
        assert!(report.copied);
        assert_eq!(agent.page().values, vec![(otp, "123456".to_owned())]);
        assert_eq!(
            agent.page().events,
            vec![(otp, InputEvent::Input), (otp, InputEvent::Change)]
        );
        assert_eq!(agent.page().overlays.len(), 1);
        assert_eq!(agent.presenter().clipboard().writes, vec!["123456".to_owned()]);
    }

    #[test]
    fn ambiguous_page_gets_clipboard_and_overlay_only() {
        let mut document = Document::new();
        for id in ["a", "b", "c"] {
            document.push(Element::input().with_attr("id", id));
        }
        let mut agent = agent(document, FakeClipboard::default());

        let report = agent.handle_message(&fill("123456"), Instant::now());

        assert_eq!(report.filled, None);
        assert!(agent.page().values.is_empty());
        assert!(agent.page().events.is_empty());
        assert_eq!(agent.presenter().clipboard().writes, vec!["123456".to_owned()]);
        assert_eq!(agent.page().overlays[0].code, "123456");
    }

    #[test]
    fn clipboard_failure_still_fills_and_shows_code() {
        let mut document = Document::new();
        let only = document.push(Element::input().with_layout(Layout::sized(80.0, 20.0)));
        let mut agent = agent(
            document,
            FakeClipboard {
                fail: true,
                ..FakeClipboard::default()
            },
        );

        let report = agent.handle_message(&fill("4821"), Instant::now());

        assert!(!report.copied);
        assert_eq!(report.filled, Some(only));
        assert!(!agent.page().overlays[0].copied);
    }

    #[test]
    fn overlays_auto_dismiss_after_timeout() {
        let mut agent = agent(Document::new(), FakeClipboard::default());
        let start = Instant::now();
        agent.handle_message(&fill("1111"), start);

        assert_eq!(agent.dismiss_expired(start + Duration::from_secs(9)), 0);
        assert_eq!(agent.page().overlays.len(), 1);

        assert_eq!(agent.dismiss_expired(start + DEFAULT_OVERLAY_TIMEOUT), 1);
        assert!(agent.page().overlays.is_empty());
        assert_eq!(agent.presenter().next_expiry(), None);
    }

    #[test]
    fn confirm_recopies_and_dismisses() {
        let mut agent = agent(Document::new(), FakeClipboard::default());
        let report = agent.handle_message(&fill("2468"), Instant::now());

        agent.confirm_overlay(report.overlay);
        assert!(agent.page().overlays.is_empty());
        assert_eq!(
            agent.presenter().clipboard().writes,
            vec!["2468".to_owned(), "2468".to_owned()]
        );

        // A second confirm for a dismissed overlay does nothing.
        agent.confirm_overlay(report.overlay);
        assert_eq!(agent.presenter().clipboard().writes.len(), 2);
    }

    #[tokio::test]
    async fn run_loop_handles_messages_until_sender_drops() {
        let (tx, rx) = mpsc::unbounded_channel();
        let agent = agent(Document::new(), FakeClipboard::default());

        tx.send(PageEvent::Message(fill("7777"))).unwrap();
        drop(tx);

        tokio::time::timeout(Duration::from_secs(2), agent.run(rx))
            .await
            .expect("agent stops when relay side drops");
    }
}
