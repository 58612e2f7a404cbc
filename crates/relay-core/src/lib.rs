//! Core logic for the chat relay bot.
//!
//! This crate is intentionally framework-agnostic. Telegram and the LLM backend
//! live behind ports (traits) implemented in adapter crates.

pub mod broadcast;
pub mod buffer;
pub mod classify;
pub mod config;
pub mod domain;
pub mod errors;
pub mod formatting;
pub mod logging;
pub mod messaging;
pub mod model;
pub mod ports;
pub mod relay;
pub mod reminder;
pub mod repair;
pub mod stats;
pub mod store;
pub mod utils;

pub use errors::{Error, Result};
