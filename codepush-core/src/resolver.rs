//! Picks the input element that should receive an incoming verification code.
//!
//! Resolution is a pure function of a [`Document`] snapshot. Rules are tried
//! in priority order and the first hit wins:
//!
//! 1. the focused element, when it is a text-like `<input>`;
//! 2. a fixed list of semantic selectors, each yielding its first visible match;
//! 3. the only visible text/number/tel/password input on the page.
//!
//! When none of these applies the page is ambiguous and nothing is returned.

use std::fmt;

use crate::dom::{Document, Element, ElementId};

const NON_TEXT_FOCUS_TYPES: &[&str] = &["checkbox", "radio", "submit", "button"];
const FALLBACK_INPUT_TYPES: &[&str] = &["text", "number", "tel", "password"];
pub const DEFAULT_PLACEHOLDER_HINTS: &[&str] = &["验证码", "code"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolverConfig {
    /// Placeholder fragments meaning "code", one per supported language.
    pub placeholder_hints: Vec<String>,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            placeholder_hints: DEFAULT_PLACEHOLDER_HINTS
                .iter()
                .map(|hint| (*hint).to_owned())
                .collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Condition {
    Equals(&'static str, String),
    Contains(&'static str, String),
    InputType(&'static str),
    Class(&'static str),
}

impl Condition {
    fn matches(&self, element: &Element) -> bool {
        match self {
            Condition::Equals(name, value) => element.attr(name) == Some(value.as_str()),
            Condition::Contains(name, needle) => element
                .attr(name)
                .is_some_and(|value| value.contains(needle.as_str())),
            Condition::InputType(kind) => element.input_type() == *kind,
            Condition::Class(class) => element.has_class(class),
        }
    }
}

/// A CSS-like selector: an optional `input` tag constraint plus attribute conditions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Selector {
    input_only: bool,
    conditions: Vec<Condition>,
}

impl Selector {
    fn input(conditions: Vec<Condition>) -> Self {
        Self {
            input_only: true,
            conditions,
        }
    }

    fn class(class: &'static str) -> Self {
        Self {
            input_only: false,
            conditions: vec![Condition::Class(class)],
        }
    }

    pub fn matches(&self, element: &Element) -> bool {
        (!self.input_only || element.is_input())
            && self.conditions.iter().all(|c| c.matches(element))
    }

    fn first_visible(&self, document: &Document) -> Option<ElementId> {
        document
            .iter()
            .find(|(_, element)| self.matches(element) && element.is_visible())
            .map(|(id, _)| id)
    }
}

impl fmt::Display for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.input_only {
            f.write_str("input")?;
        }
        for condition in &self.conditions {
            match condition {
                Condition::Equals(name, value) => write!(f, "[{name}=\"{value}\"]")?,
                Condition::Contains(name, needle) => write!(f, "[{name}*=\"{needle}\"]")?,
                Condition::InputType(kind) => write!(f, "[type=\"{kind}\"]")?,
                Condition::Class(class) => write!(f, ".{class}")?,
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetRule {
    Focused,
    Selector(String),
    SoleInput,
}

impl fmt::Display for TargetRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TargetRule::Focused => f.write_str("focused element"),
            TargetRule::Selector(selector) => write!(f, "selector {selector}"),
            TargetRule::SoleInput => f.write_str("only visible input"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub element: ElementId,
    pub rule: TargetRule,
}

#[derive(Debug, Clone)]
pub struct TargetResolver {
    selectors: Vec<Selector>,
}

impl Default for TargetResolver {
    fn default() -> Self {
        Self::new(&ResolverConfig::default())
    }
}

impl TargetResolver {
    pub fn new(config: &ResolverConfig) -> Self {
        use Condition::{Contains, Equals, InputType};

        let mut selectors = vec![
            Selector::input(vec![Equals("autocomplete", "one-time-code".to_owned())]),
            Selector::input(vec![Contains("id", "captcha".to_owned())]),
            Selector::input(vec![Contains("name", "captcha".to_owned())]),
            Selector::input(vec![Contains("id", "verify".to_owned())]),
            Selector::input(vec![Contains("name", "verify".to_owned())]),
        ];
        selectors.extend(
            config
                .placeholder_hints
                .iter()
                .filter(|hint| !hint.is_empty())
                .map(|hint| Selector::input(vec![Contains("placeholder", hint.clone())])),
        );
        selectors.extend([
            Selector::input(vec![Contains("id", "code".to_owned())]),
            Selector::input(vec![Contains("name", "code".to_owned())]),
            Selector::class("code-input"),
            Selector::class("verify-input"),
            Selector::input(vec![Equals("maxlength", "6".to_owned())]),
            Selector::input(vec![Equals("maxlength", "4".to_owned())]),
            Selector::input(vec![
                InputType("number"),
                Equals("pattern", "[0-9]*".to_owned()),
            ]),
            Selector::input(vec![InputType("tel")]),
        ]);

        Self { selectors }
    }

    pub fn selectors(&self) -> &[Selector] {
        &self.selectors
    }

    pub fn resolve(&self, document: &Document) -> Option<Target> {
        if let Some((id, element)) = document.focused_element()
            && is_text_like_input(element)
        {
            return Some(Target {
                element: id,
                rule: TargetRule::Focused,
            });
        }

        for selector in &self.selectors {
            if let Some(id) = selector.first_visible(document) {
                return Some(Target {
                    element: id,
                    rule: TargetRule::Selector(selector.to_string()),
                });
            }
        }

        sole_visible_input(document).map(|id| Target {
            element: id,
            rule: TargetRule::SoleInput,
        })
    }
}

/// Resolves with the default selector set.
pub fn resolve(document: &Document) -> Option<ElementId> {
    TargetResolver::default()
        .resolve(document)
        .map(|target| target.element)
}

fn is_text_like_input(element: &Element) -> bool {
    element.is_input() && !NON_TEXT_FOCUS_TYPES.contains(&element.input_type())
}

fn sole_visible_input(document: &Document) -> Option<ElementId> {
    let mut candidates = document.iter().filter(|(_, element)| {
        element.is_input()
            && FALLBACK_INPUT_TYPES.contains(&element.input_type())
            && element.is_visible()
    });

    let (id, _) = candidates.next()?;
    if candidates.next().is_some() {
        return None;
    }
    Some(id)
}
