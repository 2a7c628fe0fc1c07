//! Tool result content and screen image decoding.
//!
//! A `tools/call` result carries a `content` array of typed items:
//!
//! ```text
//! {"content": [{"type": "text", "text": "..."},
//!              {"type": "image", "data": "<base64>", "mimeType": "image/png"}],
//!  "isError": false}
//! ```
//!
//! Only `text` and `image` items are understood. Any other `type` fails the
//! decode with [`DecodeError::UnknownContentType`] instead of being skipped.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::DecodeError;

/// One entry of a tool result's `content` array.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentItem {
    Text {
        text: String,
    },
    Image {
        data: String,
        #[serde(rename = "mimeType", default, skip_serializing_if = "Option::is_none")]
        mime_type: Option<String>,
    },
}

impl ContentItem {
    pub fn from_value(value: &Value) -> Result<Self, DecodeError> {
        let kind = value
            .get("type")
            .and_then(Value::as_str)
            .ok_or(DecodeError::Missing("content item type"))?;

        match kind {
            "text" | "image" => {
                serde_json::from_value(value.clone()).map_err(|source| DecodeError::Shape {
                    what: "content item",
                    source,
                })
            }
            other => Err(DecodeError::UnknownContentType(other.to_string())),
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            ContentItem::Text { text } => Some(text),
            ContentItem::Image { .. } => None,
        }
    }
}

/// Decoded result of `tools/call`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolCallResult {
    pub content: Vec<ContentItem>,
    #[serde(rename = "isError", default)]
    pub is_error: bool,
}

impl ToolCallResult {
    pub fn from_value(value: &Value) -> Result<Self, DecodeError> {
        let items = value
            .get("content")
            .ok_or(DecodeError::Missing("content"))?
            .as_array()
            .ok_or(DecodeError::Missing("content array"))?;

        let content = items
            .iter()
            .map(ContentItem::from_value)
            .collect::<Result<Vec<_>, _>>()?;

        let is_error = value
            .get("isError")
            .and_then(Value::as_bool)
            .unwrap_or(false);

        Ok(Self { content, is_error })
    }

    /// Text items in order.
    pub fn texts(&self) -> impl Iterator<Item = &str> {
        self.content.iter().filter_map(ContentItem::as_text)
    }

    /// All text items joined by newlines.
    pub fn text(&self) -> String {
        self.texts().collect::<Vec<_>>().join("\n")
    }

    /// Decode every image item.
    pub fn images(&self) -> Result<Vec<ScreenImage>, DecodeError> {
        self.content
            .iter()
            .filter_map(|item| match item {
                ContentItem::Image { data, mime_type } => {
                    Some(ScreenImage::decode(data, mime_type.clone()))
                }
                ContentItem::Text { .. } => None,
            })
            .collect()
    }
}

/// Raw image bytes recovered from an `image` content item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScreenImage {
    pub bytes: Vec<u8>,
    pub mime_type: Option<String>,
}

const PNG_MAGIC: &[u8] = b"\x89PNG\r\n\x1a\n";
const JPEG_MAGIC: &[u8] = b"\xff\xd8\xff";

impl ScreenImage {
    /// Decode standard base64, ignoring embedded whitespace and an optional
    /// `data:<mime>;base64,` prefix.
    pub fn decode(data: &str, mime_type: Option<String>) -> Result<Self, DecodeError> {
        let payload = match data.split_once(";base64,") {
            Some((prefix, rest)) if prefix.starts_with("data:") => rest,
            _ => data,
        };
        let compact: String = payload.chars().filter(|c| !c.is_whitespace()).collect();
        if compact.is_empty() {
            return Err(DecodeError::Missing("image data"));
        }

        let bytes = STANDARD.decode(compact.as_bytes())?;
        Ok(Self { bytes, mime_type })
    }

    /// File extension for saving, from the MIME type or the magic bytes.
    pub fn extension(&self) -> &'static str {
        match self.mime_type.as_deref() {
            Some("image/png") => "png",
            Some("image/jpeg") | Some("image/jpg") => "jpg",
            Some("image/webp") => "webp",
            Some("image/gif") => "gif",
            _ if self.bytes.starts_with(PNG_MAGIC) => "png",
            _ if self.bytes.starts_with(JPEG_MAGIC) => "jpg",
            _ => "bin",
        }
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}
