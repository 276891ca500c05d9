//! Core domain + application logic for the mxb Matrix bot.
//!
//! This crate is intentionally transport-agnostic. The homeserver HTTP API and
//! on-disk persistence live behind ports (traits) implemented in adapter crates.

pub mod config;
pub mod dispatch;
pub mod domain;
pub mod errors;
pub mod handlers;
pub mod logging;
pub mod ports;
pub mod sync;
pub mod token;

pub use errors::{Error, Result};
