//! Interactive element listing decoder.
//!
//! `get_interactive_elements` returns a plain text block rather than
//! structured JSON. Each element starts with a `Type:` line, followed by
//! `Name: value` fields until the next `Type:` line:
//!
//! ```text
//! Found 2 interactive elements:
//! Type: ElevatedButton
//!   Text: Find Gym
//!   Key: [<'find_gym'>]
//!   Bounds: Rect.fromLTRB(16.0, 300.0, 180.0, 348.0)
//! - Type: NavigationDestination, Text: Map, Bounds: 104, 715, 104, 80
//! ```
//!
//! Fields may also be packed on one line separated by `,`, `|` or `;`.
//! The element count is whatever the parse finds; nothing is assumed
//! up front. Unrecognized fields are kept in [`Element::attributes`].

use std::collections::BTreeMap;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

/// Axis-aligned bounding box in logical pixels.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bounds {
    pub left: f64,
    pub top: f64,
    pub width: f64,
    pub height: f64,
}

impl Bounds {
    pub fn from_ltrb(left: f64, top: f64, right: f64, bottom: f64) -> Self {
        Self {
            left,
            top,
            width: right - left,
            height: bottom - top,
        }
    }

    /// Parse a geometry string.
    ///
    /// Four numbers are read as left, top, right, bottom when the text
    /// mentions `LTRB` or is a `Rect(...)`, otherwise as x, y, width, height.
    pub fn parse(value: &str) -> Option<Self> {
        let nums = numbers(value);
        if nums.len() != 4 {
            return None;
        }
        let lower = value.to_ascii_lowercase();
        if lower.contains("ltrb") || (lower.starts_with("rect") && !lower.contains("ltwh")) {
            Some(Self::from_ltrb(nums[0], nums[1], nums[2], nums[3]))
        } else {
            Some(Self {
                left: nums[0],
                top: nums[1],
                width: nums[2],
                height: nums[3],
            })
        }
    }

    pub fn right(&self) -> f64 {
        self.left + self.width
    }

    pub fn bottom(&self) -> f64 {
        self.top + self.height
    }

    /// Center point, used for coordinate taps.
    pub fn center(&self) -> (f64, f64) {
        (self.left + self.width / 2.0, self.top + self.height / 2.0)
    }

    pub fn contains(&self, x: f64, y: f64) -> bool {
        x >= self.left && x < self.right() && y >= self.top && y < self.bottom()
    }
}

/// One interactive element from the listing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Element {
    /// Widget type, e.g. `ElevatedButton`.
    #[serde(rename = "type")]
    pub kind: String,

    /// Display text, if the widget shows any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,

    /// Widget key or identifier.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bounds: Option<Bounds>,

    /// Fields the decoder does not interpret, keyed by lowercase name.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub attributes: BTreeMap<String, String>,
}

impl Element {
    #[must_use]
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            text: None,
            key: None,
            bounds: None,
            attributes: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.text = Some(text.into());
        self
    }

    #[must_use]
    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    #[must_use]
    pub fn with_bounds(mut self, bounds: Bounds) -> Self {
        self.bounds = Some(bounds);
        self
    }

    /// Whether the element's text or key equals `text_or_key`.
    pub fn matches(&self, text_or_key: &str) -> bool {
        self.text.as_deref() == Some(text_or_key) || self.key.as_deref() == Some(text_or_key)
    }
}

/// Find the first element whose text or key matches.
pub fn find_element<'a>(elements: &'a [Element], text_or_key: &str) -> Option<&'a Element> {
    elements.iter().find(|e| e.matches(text_or_key))
}

/// Count lines that start an element, without building the elements.
pub fn count_elements(text: &str) -> usize {
    text.lines()
        .filter(|line| starts_element(&line_fields(line)))
        .count()
}

/// Decode the listing into elements, in listing order.
pub fn parse_elements(text: &str) -> Vec<Element> {
    let mut elements = Vec::new();
    let mut current: Option<PendingElement> = None;

    for line in text.lines() {
        let fields = line_fields(line);
        if starts_element(&fields) {
            if let Some(done) = current.take() {
                elements.push(done.finish());
            }
            current = Some(PendingElement::default());
        }

        if let Some(pending) = current.as_mut() {
            for (name, value) in fields {
                pending.apply(&name, value);
            }
        }
    }

    if let Some(done) = current {
        elements.push(done.finish());
    }
    elements
}

#[derive(Debug, Default)]
struct PendingElement {
    kind: String,
    text: Option<String>,
    key: Option<String>,
    bounds: Option<Bounds>,
    position: Option<(f64, f64)>,
    size: Option<(f64, f64)>,
    parts: [Option<f64>; 4],
    attributes: BTreeMap<String, String>,
}

impl PendingElement {
    fn apply(&mut self, name: &str, value: &str) {
        match name {
            "type" => self.kind = value.to_string(),
            "text" | "label" => self.text = clean_value(value),
            "key" | "id" => self.key = clean_value(value).map(|k| unwrap_value_key(&k)),
            "bounds" | "rect" => self.bounds = Bounds::parse(value),
            "position" | "offset" => self.position = pair(value),
            "size" => self.size = pair(value),
            "x" | "left" => self.parts[0] = numbers(value).first().copied(),
            "y" | "top" => self.parts[1] = numbers(value).first().copied(),
            "width" => self.parts[2] = numbers(value).first().copied(),
            "height" => self.parts[3] = numbers(value).first().copied(),
            other => {
                self.attributes.insert(other.to_string(), value.to_string());
            }
        }
    }

    fn finish(self) -> Element {
        let bounds = self.bounds.or_else(|| match (self.position, self.size) {
            (Some((x, y)), Some((w, h))) => Some(Bounds {
                left: x,
                top: y,
                width: w,
                height: h,
            }),
            _ => match self.parts {
                [Some(left), Some(top), Some(width), Some(height)] => Some(Bounds {
                    left,
                    top,
                    width,
                    height,
                }),
                _ => None,
            },
        });

        Element {
            kind: self.kind,
            text: self.text,
            key: self.key,
            bounds,
            attributes: self.attributes,
        }
    }
}

fn field_regex() -> &'static Regex {
    static FIELD: OnceLock<Regex> = OnceLock::new();
    FIELD.get_or_init(|| {
        Regex::new(r"(?:^|[,|;]\s*)([A-Za-z][A-Za-z _-]{0,23}?)\s*:\s*")
            .expect("field pattern is valid")
    })
}

fn number_regex() -> &'static Regex {
    static NUMBER: OnceLock<Regex> = OnceLock::new();
    NUMBER.get_or_init(|| Regex::new(r"-?\d+(?:\.\d+)?").expect("number pattern is valid"))
}

fn line_fields(line: &str) -> Vec<(String, &str)> {
    split_fields(strip_list_marker(line.trim()))
}

/// A `Type:` field opening the line starts a new element.
fn starts_element(fields: &[(String, &str)]) -> bool {
    fields.first().is_some_and(|(name, _)| name == "type")
}

/// Strip a leading `-`, `*`, `•` or `12.` list marker.
fn strip_list_marker(line: &str) -> &str {
    if let Some(rest) = line
        .strip_prefix('-')
        .or_else(|| line.strip_prefix('*'))
        .or_else(|| line.strip_prefix('•'))
    {
        return rest.trim_start();
    }
    let digits = line.chars().take_while(char::is_ascii_digit).count();
    if digits > 0 {
        if let Some(rest) = line[digits..].strip_prefix('.') {
            return rest.trim_start();
        }
    }
    line
}

/// Split `Name: value, Other: value` into lowercase names and raw values.
///
/// Field names must start the line or follow a separator, so colons inside
/// values (URIs, times) do not start a new field.
fn split_fields(line: &str) -> Vec<(String, &str)> {
    let captures: Vec<_> = field_regex().captures_iter(line).collect();
    let Some(first) = captures.first() else {
        return Vec::new();
    };
    if !first.get(0).is_some_and(|m| m.start() == 0) {
        return Vec::new();
    }

    captures
        .iter()
        .enumerate()
        .filter_map(|(i, cap)| {
            let name = cap.get(1)?;
            let value_start = cap.get(0)?.end();
            let value_end = captures
                .get(i + 1)
                .and_then(|next| next.get(0))
                .map_or(line.len(), |m| m.start());
            Some((
                name.as_str().trim().to_ascii_lowercase(),
                line[value_start..value_end].trim(),
            ))
        })
        .collect()
}

fn clean_value(value: &str) -> Option<String> {
    let trimmed = value
        .trim()
        .trim_matches(|c| c == '"' || c == '\'')
        .trim();
    if trimmed.is_empty() || trimmed.eq_ignore_ascii_case("null") || trimmed.eq_ignore_ascii_case("none")
    {
        None
    } else {
        Some(trimmed.to_string())
    }
}

/// `[<'find_gym'>]` is how a Flutter `ValueKey<String>` prints.
fn unwrap_value_key(key: &str) -> String {
    key.strip_prefix("[<")
        .and_then(|rest| rest.strip_suffix(">]"))
        .map(|inner| inner.trim_matches(|c| c == '\'' || c == '"'))
        .unwrap_or(key)
        .to_string()
}

fn numbers(value: &str) -> Vec<f64> {
    number_regex()
        .find_iter(value)
        .filter_map(|m| m.as_str().parse().ok())
        .collect()
}

fn pair(value: &str) -> Option<(f64, f64)> {
    match numbers(value)[..] {
        [a, b] => Some((a, b)),
        _ => None,
    }
}
