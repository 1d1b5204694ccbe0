//! # muxrpc - multiplexed JSON RPC over one connection
//!
//! A client issues named calls (`"Service.Method"`) over a single persistent
//! connection; many calls can be in flight at once and replies may come back
//! in any order. A server accepts connections, decodes each call, dispatches
//! it to a registered service method and writes the result back.
//!
//! ## Architecture
//!
//! ```text
//!   Client                                          Server
//!  ┌──────────────────────┐                ┌──────────────────────────────┐
//!  │ callers ─→ writer    ├── Request ───→ │ Session (one per connection) │
//!  │                      │                │   └─→ Registry ─→ Service    │
//!  │ call map ←─ receiver │ ←── Response ──┤        method table          │
//!  └──────────────────────┘                └──────────────────────────────┘
//! ```
//!
//! - [`codec`]: self-delimiting JSON messages, newline after each
//! - [`protocol`]: `Request`/`Response` envelopes and method-name rule
//! - [`registry`]: services and their dispatch tables
//! - [`server`]: accept loop and per-connection sessions
//! - [`client`]: call tracker multiplexing calls over one stream

// Enforce strict safety at compile time
#![deny(unsafe_code)]
#![deny(clippy::unwrap_used, clippy::expect_used)]
#![cfg_attr(test, allow(clippy::unwrap_used, clippy::expect_used))]
#![warn(missing_debug_implementations)]
#![warn(rust_2018_idioms)]

pub mod client;
pub mod codec;
pub mod protocol;
pub mod registry;
pub mod server;
pub mod types;

// Subscriber setup for hosts
pub mod observability;

pub use client::Client;
pub use protocol::{Request, Response};
pub use registry::{MethodSet, Registry, Service};
pub use server::{Server, Session};
pub use types::{ClientConfig, Config, Error, LoggingConfig, Result, ServerConfig};
