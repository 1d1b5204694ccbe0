//! Application error types.
//!
//! All errors use `thiserror` for automatic Error trait derivation. Errors that
//! cross the wire travel as their `Display` text only, so the messages here
//! are what a remote caller ends up seeing.

use thiserror::Error;

/// Application result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error enum for the RPC runtime.
#[derive(Error, Debug)]
pub enum Error {
    /// Method name is not of the form `Service.Method`.
    #[error("invalid method '{0}'")]
    InvalidMethod(String),

    /// Registered type resolved to an unusable service name.
    #[error("invalid service name '{0}'")]
    InvalidServiceName(String),

    /// Registered type exposes no addressable method.
    #[error("no exported method")]
    NoExportedMethod,

    /// No service registered under this name.
    #[error("service '{0}' not found")]
    ServiceNotFound(String),

    /// Service exists but has no such method.
    #[error("method '{method}' not found in service '{service}'")]
    MethodNotFound { service: String, method: String },

    /// Request payload did not decode into the method's input type.
    #[error("invalid param for {method}: {reason}")]
    InvalidParam { method: String, reason: String },

    /// Client was closed locally; no new calls are accepted.
    #[error("client has closed")]
    ClientClosed,

    /// Connection died underneath outstanding calls.
    #[error("connection shut down: {0}")]
    Shutdown(String),

    /// Caller stopped waiting for a reply.
    #[error("rpc call timeout")]
    Timeout,

    /// Error text returned by the remote side.
    #[error("{0}")]
    Remote(String),

    /// Internal errors.
    #[error("internal error: {0}")]
    Internal(String),

    /// Serialization/deserialization errors.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O errors.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// True for errors that mean the connection is gone for good.
    pub fn is_disconnect(&self) -> bool {
        matches!(self, Error::ClientClosed | Error::Shutdown(_))
    }
}

// Convenience constructors
impl Error {
    pub fn invalid_method(method: impl Into<String>) -> Self {
        Self::InvalidMethod(method.into())
    }

    pub fn service_not_found(service: impl Into<String>) -> Self {
        Self::ServiceNotFound(service.into())
    }

    pub fn method_not_found(service: impl Into<String>, method: impl Into<String>) -> Self {
        Self::MethodNotFound {
            service: service.into(),
            method: method.into(),
        }
    }

    pub fn invalid_param(method: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        Self::InvalidParam {
            method: method.into(),
            reason: reason.to_string(),
        }
    }

    pub fn shutdown(reason: impl Into<String>) -> Self {
        Self::Shutdown(reason.into())
    }

    pub fn remote(msg: impl Into<String>) -> Self {
        Self::Remote(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }
}
