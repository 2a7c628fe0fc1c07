//! Core types and logic for marionette.
//!
//! This crate holds everything about driving a UI-automation peer that does
//! not need an async runtime: the JSON-RPC frame model, newline framing, and
//! the decoders that turn tool results into domain values. The CLI crate
//! owns the child process and the async plumbing built on top of it.
//!
//! # Modules
//!
//! - [`protocol`]: JSON-RPC 2.0 frames and MCP payload shapes
//! - [`framing`]: newline-delimited JSON frame reassembly
//! - [`content`]: tool result content items and screen image decoding
//! - [`elements`]: interactive element listing decoder
//! - [`outcome`]: typed results of the connect, listing and tap tools
//! - [`target`]: tap targets (text-or-key locator or absolute point)
//! - [`state`]: session lifecycle state machine
//! - [`error`]: client error taxonomy with actionable suggestions
//!
//! # Wire Format
//!
//! | Frame | Shape |
//! |-------|-------|
//! | Request | `{"jsonrpc":"2.0","id":1,"method":"tools/call","params":{...}}` |
//! | Notification | `{"jsonrpc":"2.0","method":"notifications/initialized"}` |
//! | Response | `{"jsonrpc":"2.0","id":1,"result":{...}}` or `..."error":{...}}` |
//!
//! Every frame is a single line of UTF-8 JSON terminated by `\n`.

pub mod content;
pub mod elements;
pub mod error;
pub mod framing;
pub mod outcome;
pub mod protocol;
pub mod state;
pub mod target;
