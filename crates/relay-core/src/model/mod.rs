//! LLM gateway port and conversation history types.

pub mod client;
pub mod types;
