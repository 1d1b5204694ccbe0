//! Request/response envelopes and the method-name rule.
//!
//! Both directions carry one JSON object per message:
//!
//! ```text
//! Request:  {"id": 7, "method": "Calc.Square", "param": {"x": 3}}
//! Response: {"id": 7, "result": {"y": 9}, "error": ""}
//! ```
//!
//! Payloads are kept as raw JSON so they pass through the envelope untouched.

use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;

use crate::types::{Error, Result};

/// One call on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    pub id: u32,
    pub method: String,
    #[serde(default)]
    pub param: Option<Box<RawValue>>,
}

impl Request {
    /// Split `method` into `(service, method)`, rejecting malformed names.
    pub fn target(&self) -> Result<(&str, &str)> {
        split_method(&self.method)
    }
}

/// One reply on the wire. An empty `error` means success.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    pub id: u32,
    #[serde(default)]
    pub result: Option<Box<RawValue>>,
    #[serde(default)]
    pub error: String,
}

impl Response {
    pub fn success(id: u32, result: Box<RawValue>) -> Self {
        Self {
            id,
            result: Some(result),
            error: String::new(),
        }
    }

    pub fn failure(id: u32, error: impl std::fmt::Display) -> Self {
        Self {
            id,
            result: None,
            error: error.to_string(),
        }
    }

    pub fn is_error(&self) -> bool {
        !self.error.is_empty()
    }
}

/// Split `Service.Method` into its two parts.
///
/// Exactly one dot, both sides non-empty. Client and server both go through
/// here so they can never disagree on what a valid name is.
pub fn split_method(method: &str) -> Result<(&str, &str)> {
    let mut parts = method.split('.');
    match (parts.next(), parts.next(), parts.next()) {
        (Some(service), Some(name), None) if !service.is_empty() && !name.is_empty() => {
            Ok((service, name))
        }
        _ => Err(Error::invalid_method(method)),
    }
}

/// Decode an optional raw payload, treating an absent one as JSON `null`.
pub(crate) fn decode_payload<T: serde::de::DeserializeOwned>(
    payload: Option<&RawValue>,
) -> serde_json::Result<T> {
    serde_json::from_str(payload.map_or("null", RawValue::get))
}
