//! Serializable snapshot of a page's DOM, as captured by the in-page agent.
//!
//! Elements are stored in document (tree) order. Only what target resolution
//! needs is captured: tag, attributes and rendered layout.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::CoreError;

/// Input types a browser recognizes; anything else normalizes to `text`.
const KNOWN_INPUT_TYPES: &[&str] = &[
    "button",
    "checkbox",
    "color",
    "date",
    "datetime-local",
    "email",
    "file",
    "hidden",
    "image",
    "month",
    "number",
    "password",
    "radio",
    "range",
    "reset",
    "search",
    "submit",
    "tel",
    "text",
    "time",
    "url",
    "week",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ElementId(pub usize);

/// Rendered geometry: `offsetWidth`, `offsetHeight` and the number of client rects.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Layout {
    #[serde(default)]
    pub width: f64,
    #[serde(default)]
    pub height: f64,
    #[serde(default)]
    pub client_rects: u32,
}

impl Layout {
    pub fn sized(width: f64, height: f64) -> Self {
        Self {
            width,
            height,
            client_rects: 1,
        }
    }

    /// Layout of an element that is not rendered (`display: none` or detached).
    pub fn hidden() -> Self {
        Self::default()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Element {
    pub tag: String,
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
    #[serde(default)]
    pub layout: Layout,
}

impl Element {
    pub fn new(tag: &str) -> Self {
        Self {
            tag: tag.to_ascii_lowercase(),
            attributes: BTreeMap::new(),
            layout: Layout::sized(120.0, 24.0),
        }
    }

    pub fn input() -> Self {
        Self::new("input")
    }

    #[must_use]
    pub fn with_attr(mut self, name: &str, value: &str) -> Self {
        self.attributes
            .insert(name.to_ascii_lowercase(), value.to_owned());
        self
    }

    #[must_use]
    pub fn with_layout(mut self, layout: Layout) -> Self {
        self.layout = layout;
        self
    }

    /// Attribute lookup; names are case-insensitive as in HTML.
    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    pub fn is_input(&self) -> bool {
        self.tag.eq_ignore_ascii_case("input")
    }

    /// The `type` of an input as the browser reports it: lower-cased, with
    /// missing or unrecognized values reported as `text`.
    pub fn input_type(&self) -> &'static str {
        let raw = self.attr("type").unwrap_or_default().trim();
        KNOWN_INPUT_TYPES
            .iter()
            .copied()
            .find(|known| known.eq_ignore_ascii_case(raw))
            .unwrap_or("text")
    }

    pub fn has_class(&self, class: &str) -> bool {
        self.attr("class")
            .is_some_and(|classes| classes.split_ascii_whitespace().any(|c| c == class))
    }

    pub fn is_visible(&self) -> bool {
        self.layout.width > 0.0 || self.layout.height > 0.0 || self.layout.client_rects > 0
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Document {
    #[serde(default)]
    pub elements: Vec<Element>,
    #[serde(default)]
    pub focused: Option<ElementId>,
}

impl Document {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_json(raw: &str) -> Result<Self, CoreError> {
        serde_json::from_str(raw).map_err(|err| CoreError::Serialization(err.to_string()))
    }

    /// Appends `element` in tree order and returns its id.
    pub fn push(&mut self, element: Element) -> ElementId {
        self.elements.push(element);
        ElementId(self.elements.len() - 1)
    }

    pub fn focus(&mut self, id: ElementId) {
        self.focused = Some(id);
    }

    pub fn get(&self, id: ElementId) -> Option<&Element> {
        self.elements.get(id.0)
    }

    pub fn get_mut(&mut self, id: ElementId) -> Option<&mut Element> {
        self.elements.get_mut(id.0)
    }

    pub fn focused_element(&self) -> Option<(ElementId, &Element)> {
        let id = self.focused?;
        self.get(id).map(|element| (id, element))
    }

    pub fn iter(&self) -> impl Iterator<Item = (ElementId, &Element)> {
        self.elements
            .iter()
            .enumerate()
            .map(|(index, element)| (ElementId(index), element))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn input_type_normalizes_like_a_browser() {
        assert_eq!(Element::input().input_type(), "text");
        assert_eq!(Element::input().with_attr("type", "TEL").input_type(), "tel");
        assert_eq!(
            Element::input().with_attr("type", "bogus").input_type(),
            "text"
        );
    }

    #[test]
    fn visibility_uses_size_or_client_rects() {
        let hidden = Element::input().with_layout(Layout::hidden());
        assert!(!hidden.is_visible());

        let inline_only = Element::input().with_layout(Layout {
            width: 0.0,
            height: 0.0,
            client_rects: 1,
        });
        assert!(inline_only.is_visible());

        let flat = Element::input().with_layout(Layout {
            width: 80.0,
            height: 0.0,
            client_rects: 0,
        });
        assert!(flat.is_visible());
    }

    #[test]
    fn snapshot_parses_from_json() {
        let doc = Document::from_json(
            r#"{
                "elements": [
                    {"tag": "input", "attributes": {"ID": "otp", "class": "a code-input"},
                     "layout": {"width": 100, "height": 20, "client_rects": 1}},
                    {"tag": "div"}
                ],
                "focused": 0
            }"#,
        )
        .expect("parse snapshot");

        let (id, focused) = doc.focused_element().expect("focused");
        assert_eq!(id, ElementId(0));
        assert_eq!(focused.attr("id"), Some("otp"));
        assert!(focused.has_class("code-input"));
        assert!(!doc.get(ElementId(1)).expect("div").is_visible());
    }
}
