//! Cross-style payload conversion.
//!
//! The OpenAI chat.completions shape is the canonical intermediate: every
//! other style converts to or from it, and multi-hop conversions are
//! composed through it. All style decisions are made here; nothing outside
//! this crate inspects payload fields to guess a dialect.

pub mod adapter;
pub mod generate;

pub use adapter::{
    AdaptError, ApiStyle, ChatRequest, ChatResponse, StreamAdapter, StreamEvent,
    adapt_request, adapt_response, detect_request_style,
};
