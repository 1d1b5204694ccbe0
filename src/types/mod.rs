//! Core types shared by client and server.
//!
//! - **Errors**: the crate error enum with thiserror derives
//! - **Config**: serde-loadable client and server settings

mod config;
mod errors;

pub use config::{ClientConfig, Config, LoggingConfig, ServerConfig, DEFAULT_MAX_MESSAGE_BYTES};
pub use errors::{Error, Result};
