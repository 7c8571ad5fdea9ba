//! Common types and utilities shared across the toolbridge protocol stack.
//!
//! This crate provides:
//! - JSON message schema and validation ([`message`])
//! - Challenge-response and fingerprint helpers ([`crypto`])
//! - Protocol type definitions and constants ([`types`])

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod crypto;
pub mod message;
pub mod types;

pub use message::{InboundMessage, MessageError, OutboundMessage, ToolExecute, ToolResult};
pub use types::Identity;
