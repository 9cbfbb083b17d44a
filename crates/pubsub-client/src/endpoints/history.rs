//! Message history: fetch and delete.

use serde_json::Value;

use crate::crypto::decrypt_value;
use crate::endpoints::{require_non_empty, require_subscribe_key};
use crate::error::{Error, Result, ServerErrorKind};
use crate::request::{
    Endpoint, PreparedRequest, RequestBuilder, RequestContext, decode_json, parse_timetoken,
};
use crate::signature::{Query, encode_component};
use crate::status::Operation;
use crate::transport::{HttpResponse, Method};

const MAX_HISTORY_COUNT: u32 = 100;

#[derive(Debug, Clone, PartialEq)]
pub struct HistoryItem {
    pub message: Value,
    pub timetoken: Option<i64>,
    pub meta: Option<Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct HistoryResponse {
    pub messages: Vec<HistoryItem>,
    pub start_timetoken: i64,
    pub end_timetoken: i64,
}

#[derive(Debug, Clone, Default)]
pub struct History {
    pub(crate) channel: String,
    pub(crate) count: Option<u32>,
    pub(crate) start: Option<i64>,
    pub(crate) end: Option<i64>,
    pub(crate) reverse: bool,
    pub(crate) include_timetoken: bool,
    pub(crate) include_meta: bool,
}

pub type HistoryBuilder = RequestBuilder<History>;

impl HistoryBuilder {
    pub fn channel(mut self, channel: impl Into<String>) -> Self {
        self.endpoint.channel = channel.into();
        self
    }

    /// Number of messages, clamped to 1..=100.
    pub fn count(mut self, count: u32) -> Self {
        self.endpoint.count = Some(count);
        self
    }

    pub fn start(mut self, timetoken: i64) -> Self {
        self.endpoint.start = Some(timetoken);
        self
    }

    pub fn end(mut self, timetoken: i64) -> Self {
        self.endpoint.end = Some(timetoken);
        self
    }

    pub fn reverse(mut self, reverse: bool) -> Self {
        self.endpoint.reverse = reverse;
        self
    }

    pub fn include_timetoken(mut self, include: bool) -> Self {
        self.endpoint.include_timetoken = include;
        self
    }

    pub fn include_meta(mut self, include: bool) -> Self {
        self.endpoint.include_meta = include;
        self
    }
}

impl History {
    fn wants_envelopes(&self) -> bool {
        self.include_timetoken || self.include_meta
    }
}

impl Endpoint for History {
    type Output = HistoryResponse;

    fn operation(&self) -> Operation {
        Operation::History
    }

    fn prepare(&self, ctx: &RequestContext<'_>) -> Result<PreparedRequest> {
        let sub_key = require_subscribe_key(ctx)?;
        require_non_empty(&self.channel, "channel")?;

        let count = self
            .count
            .filter(|c| (1..=MAX_HISTORY_COUNT).contains(c))
            .unwrap_or(MAX_HISTORY_COUNT);
        let mut query = Query::new();
        query.push("count", count.to_string());
        query.push_opt("start", self.start.map(|t| t.to_string()));
        query.push_opt("end", self.end.map(|t| t.to_string()));
        if self.reverse {
            query.push("reverse", "true");
        }
        if self.wants_envelopes() {
            query.push("include_token", "true");
        }
        if self.include_meta {
            query.push("include_meta", "true");
        }

        let path = format!(
            "/v2/history/sub-key/{}/channel/{}",
            encode_component(sub_key),
            encode_component(&self.channel)
        );
        Ok(PreparedRequest::get(path)
            .with_query(query)
            .with_targets(std::slice::from_ref(&self.channel), &[]))
    }

    fn decode(&self, response: &HttpResponse, ctx: &RequestContext<'_>) -> Result<HistoryResponse> {
        let body: Value = decode_json(&response.body)?;
        let (items, start, end) = match body.as_array().map(Vec::as_slice) {
            Some([items, start, end]) => (items, start, end),
            _ => return Err(Error::decoding("history response is not a 3-element array")),
        };
        let Value::Array(items) = items else {
            // Error answers look like `[0, "message", 0]`.
            return Err(Error::Server {
                status: response.status,
                kind: ServerErrorKind::Other,
                message: start.as_str().unwrap_or("history failed").to_string(),
                body: Some(body.clone()),
            });
        };

        let messages = items
            .iter()
            .map(|item| {
                let mut entry = if self.wants_envelopes() {
                    HistoryItem {
                        message: item.get("message").cloned().unwrap_or(Value::Null),
                        timetoken: item.get("timetoken").and_then(parse_timetoken),
                        meta: item.get("meta").cloned().filter(|m| !m.is_null()),
                    }
                } else {
                    HistoryItem {
                        message: item.clone(),
                        timetoken: None,
                        meta: None,
                    }
                };
                if let Some(cipher) = ctx.cipher() {
                    match decrypt_value(cipher, &entry.message) {
                        Ok(plain) => entry.message = plain,
                        Err(e) => {
                            tracing::warn!(channel = %self.channel, error = %e, "history message left encrypted");
                        }
                    }
                }
                entry
            })
            .collect();

        Ok(HistoryResponse {
            messages,
            start_timetoken: parse_timetoken(start).unwrap_or_default(),
            end_timetoken: parse_timetoken(end).unwrap_or_default(),
        })
    }
}

// ---------------------------------------------------------------------------
// Delete
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default)]
pub struct DeleteMessages {
    pub(crate) channel: String,
    pub(crate) start: Option<i64>,
    pub(crate) end: Option<i64>,
}

pub type DeleteMessagesBuilder = RequestBuilder<DeleteMessages>;

impl DeleteMessagesBuilder {
    pub fn channel(mut self, channel: impl Into<String>) -> Self {
        self.endpoint.channel = channel.into();
        self
    }

    pub fn start(mut self, timetoken: i64) -> Self {
        self.endpoint.start = Some(timetoken);
        self
    }

    pub fn end(mut self, timetoken: i64) -> Self {
        self.endpoint.end = Some(timetoken);
        self
    }
}

impl Endpoint for DeleteMessages {
    type Output = ();

    fn operation(&self) -> Operation {
        Operation::DeleteMessages
    }

    fn prepare(&self, ctx: &RequestContext<'_>) -> Result<PreparedRequest> {
        let sub_key = require_subscribe_key(ctx)?;
        require_non_empty(&self.channel, "channel")?;

        let mut query = Query::new();
        query.push_opt("start", self.start.map(|t| t.to_string()));
        query.push_opt("end", self.end.map(|t| t.to_string()));

        let path = format!(
            "/v3/history/sub-key/{}/channel/{}",
            encode_component(sub_key),
            encode_component(&self.channel)
        );
        Ok(PreparedRequest::get(path)
            .with_method(Method::Delete)
            .with_query(query)
            .with_targets(std::slice::from_ref(&self.channel), &[]))
    }

    fn decode(&self, response: &HttpResponse, _ctx: &RequestContext<'_>) -> Result<()> {
        let body: Value = decode_json(&response.body)?;
        if body.get("error").and_then(Value::as_bool).unwrap_or(false) {
            let message = body
                .get("error_message")
                .and_then(Value::as_str)
                .unwrap_or("delete failed")
                .to_string();
            return Err(Error::Server {
                status: response.status,
                kind: ServerErrorKind::Other,
                message,
                body: Some(body),
            });
        }
        Ok(())
    }
}
