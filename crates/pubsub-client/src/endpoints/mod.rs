//! One-shot service operations.
//!
//! Each endpoint is a parameter struct implementing
//! [`Endpoint`](crate::request::Endpoint); its setters are defined on
//! [`RequestBuilder`](crate::RequestBuilder) specialised to that struct.

pub mod access;
pub mod channel_groups;
pub mod files;
pub mod history;
pub mod presence;
pub mod publish;
pub mod push;
pub mod time;

use crate::error::{Error, Result};
use crate::request::RequestContext;

pub(crate) fn require_subscribe_key<'a>(ctx: &'a RequestContext<'_>) -> Result<&'a str> {
    let key = ctx.config().subscribe_key.as_str();
    if key.is_empty() {
        return Err(Error::validation("subscribe key is required"));
    }
    Ok(key)
}

pub(crate) fn require_publish_key<'a>(ctx: &'a RequestContext<'_>) -> Result<&'a str> {
    let key = ctx.config().publish_key.as_str();
    if key.is_empty() {
        return Err(Error::validation("publish key is required"));
    }
    Ok(key)
}

pub(crate) fn require_secret_key(ctx: &RequestContext<'_>) -> Result<()> {
    match ctx.config().secret_key.as_deref() {
        Some(s) if !s.is_empty() => Ok(()),
        _ => Err(Error::validation("secret key is required")),
    }
}

pub(crate) fn require_non_empty(value: &str, what: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(Error::validation(format!("{what} is required")));
    }
    Ok(())
}

/// Service envelopes of the form `{"status":200,"payload":{...}}`.
pub(crate) fn payload(body: &serde_json::Value) -> Result<&serde_json::Value> {
    body.get("payload")
        .ok_or_else(|| Error::decoding("response is missing 'payload'"))
}
