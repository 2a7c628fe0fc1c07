//! Tap targets.

use std::fmt;

use serde_json::{json, Value};
use thiserror::Error;

use crate::elements::Element;

/// What a tap should hit.
#[derive(Debug, Clone, PartialEq)]
pub enum TapTarget {
    /// Resolved by the peer against widget text or key.
    TextOrKey(String),
    /// Absolute logical-pixel coordinate.
    Point { x: f64, y: f64 },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TargetError {
    #[error("invalid coordinate '{0}': expected X,Y")]
    InvalidPoint(String),

    #[error("tap target cannot be empty")]
    Empty,
}

impl TapTarget {
    pub fn text_or_key(locator: impl Into<String>) -> Result<Self, TargetError> {
        let locator = locator.into();
        if locator.trim().is_empty() {
            return Err(TargetError::Empty);
        }
        Ok(Self::TextOrKey(locator))
    }

    /// Parse `X,Y`, `X Y` or `(X, Y)`.
    pub fn parse_point(input: &str) -> Result<Self, TargetError> {
        let invalid = || TargetError::InvalidPoint(input.to_string());
        let inner = input
            .trim()
            .trim_start_matches('(')
            .trim_end_matches(')');
        let mut parts = inner
            .split(|c: char| c == ',' || c.is_whitespace())
            .filter(|s| !s.is_empty());

        let x: f64 = parts.next().and_then(|s| s.parse().ok()).ok_or_else(invalid)?;
        let y: f64 = parts.next().and_then(|s| s.parse().ok()).ok_or_else(invalid)?;
        if parts.next().is_some() || !x.is_finite() || !y.is_finite() {
            return Err(invalid());
        }
        Ok(Self::Point { x, y })
    }

    /// Best target for a decoded element: key, then text, then the center
    /// of its bounds.
    pub fn from_element(element: &Element) -> Option<Self> {
        if let Some(key) = &element.key {
            return Some(Self::TextOrKey(key.clone()));
        }
        if let Some(text) = &element.text {
            return Some(Self::TextOrKey(text.clone()));
        }
        element.bounds.map(|b| {
            let (x, y) = b.center();
            Self::Point { x, y }
        })
    }

    /// Arguments for the `tap` tool.
    pub fn to_arguments(&self) -> Value {
        match self {
            TapTarget::TextOrKey(locator) => json!({ "textOrKey": locator }),
            TapTarget::Point { x, y } => json!({ "x": x, "y": y }),
        }
    }
}

impl fmt::Display for TapTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TapTarget::TextOrKey(locator) => write!(f, "'{}'", locator),
            TapTarget::Point { x, y } => write!(f, "({}, {})", x, y),
        }
    }
}
