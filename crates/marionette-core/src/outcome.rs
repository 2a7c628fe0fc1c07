//! Typed results of the automation tools.

use serde::Serialize;

use crate::content::ToolCallResult;
use crate::elements::{find_element, parse_elements, Element};

/// Word prefixes that mark a tool's text as a failure report, matched
/// case-insensitively. The peer does not always set `isError` for these.
const FAILURE_WORDS: &[&str] = &["fail", "error", "unable", "unsuccess", "cannot"];

/// Whether the peer's text describes a failure.
///
/// Only the peer's own wording counts: quoted names it echoes back (a
/// widget called "Report an error") are ignored. Success wording wins over
/// failure wording, and text with neither is a plain acknowledgement.
pub fn reports_failure(text: &str) -> bool {
    let frame = strip_quoted(text).to_lowercase();
    let words: Vec<&str> = frame
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .collect();

    if words.iter().any(|w| w.starts_with("success")) {
        return false;
    }
    frame.contains("not found")
        || words
            .iter()
            .any(|w| FAILURE_WORDS.iter().any(|marker| w.starts_with(marker)))
}

/// Drop `'quoted'`, `"quoted"` and `` `quoted` `` runs. A quote only opens a
/// run at the start of a word, so apostrophes in "couldn't" are left alone.
fn strip_quoted(text: &str) -> String {
    let chars: Vec<char> = text.chars().collect();
    let mut out = String::with_capacity(text.len());
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        let opens = matches!(c, '\'' | '"' | '`')
            && (i == 0 || !chars[i - 1].is_alphanumeric());
        if opens {
            let close = (i + 1..chars.len()).find(|&j| {
                chars[j] == c && !chars.get(j + 1).is_some_and(|next| next.is_alphanumeric())
            });
            if let Some(close) = close {
                out.push(c);
                out.push(c);
                i = close + 1;
                continue;
            }
        }
        out.push(c);
        i += 1;
    }
    out
}

/// Result of attaching the peer to an app's debug endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnectResult {
    pub uri: String,
    /// Status text reported by the peer.
    pub message: String,
}

/// A fresh listing of the interactive elements on screen.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ElementList {
    pub elements: Vec<Element>,
    /// The listing text exactly as the peer sent it.
    #[serde(skip)]
    pub raw: String,
}

impl ElementList {
    pub fn from_text(raw: String) -> Self {
        Self {
            elements: parse_elements(&raw),
            raw,
        }
    }

    pub fn len(&self) -> usize {
        self.elements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    pub fn find(&self, text_or_key: &str) -> Option<&Element> {
        find_element(&self.elements, text_or_key)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Element> {
        self.elements.iter()
    }
}

/// What the peer said about a tap.
///
/// The tap is only dispatched; whether the UI reacted is for the caller to
/// check, e.g. by listing elements again.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TapOutcome {
    pub success: bool,
    pub message: String,
}

impl TapOutcome {
    pub fn from_result(result: &ToolCallResult) -> Self {
        let message = result.text();
        Self {
            success: !result.is_error && !reports_failure(&message),
            message,
        }
    }
}
