//! Publish, fire and signal.

use serde_json::Value;

use crate::crypto::encrypt_value;
use crate::endpoints::{require_non_empty, require_publish_key, require_subscribe_key};
use crate::error::{Error, Result, ServerErrorKind};
use crate::request::{
    Endpoint, PreparedRequest, RequestBuilder, RequestContext, decode_json, parse_timetoken,
};
use crate::signature::{Query, encode_component};
use crate::status::Operation;
use crate::transport::{HttpResponse, Method};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PublishResponse {
    pub timetoken: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub(crate) enum PublishKind {
    #[default]
    Publish,
    /// Publish that is neither stored nor replicated.
    Fire,
    Signal,
}

#[derive(Debug, Clone)]
pub struct Publish {
    pub(crate) kind: PublishKind,
    pub(crate) channel: String,
    pub(crate) message: Option<Value>,
    pub(crate) meta: Option<Value>,
    pub(crate) store: Option<bool>,
    pub(crate) ttl: Option<u32>,
    pub(crate) replicate: bool,
    pub(crate) use_post: bool,
}

impl Publish {
    pub(crate) fn new(kind: PublishKind) -> Self {
        Self {
            kind,
            channel: String::new(),
            message: None,
            meta: None,
            store: None,
            ttl: None,
            replicate: kind != PublishKind::Fire,
            use_post: false,
        }
    }
}

pub type PublishBuilder = RequestBuilder<Publish>;

impl PublishBuilder {
    pub fn channel(mut self, channel: impl Into<String>) -> Self {
        self.endpoint.channel = channel.into();
        self
    }

    pub fn message(mut self, message: impl Into<Value>) -> Self {
        self.endpoint.message = Some(message.into());
        self
    }

    /// Metadata usable by subscriber filter expressions.
    pub fn meta(mut self, meta: Value) -> Self {
        self.endpoint.meta = Some(meta);
        self
    }

    pub fn should_store(mut self, store: bool) -> Self {
        self.endpoint.store = Some(store);
        self
    }

    /// Storage TTL in hours.
    pub fn ttl(mut self, hours: u32) -> Self {
        self.endpoint.ttl = Some(hours);
        self
    }

    pub fn replicate(mut self, replicate: bool) -> Self {
        self.endpoint.replicate = replicate;
        self
    }

    /// Send the message in a POST body instead of the URL path.
    pub fn use_post(mut self, use_post: bool) -> Self {
        self.endpoint.use_post = use_post;
        self
    }
}

impl Endpoint for Publish {
    type Output = PublishResponse;

    fn operation(&self) -> Operation {
        match self.kind {
            PublishKind::Publish => Operation::Publish,
            PublishKind::Fire => Operation::Fire,
            PublishKind::Signal => Operation::Signal,
        }
    }

    fn prepare(&self, ctx: &RequestContext<'_>) -> Result<PreparedRequest> {
        let pub_key = require_publish_key(ctx)?;
        let sub_key = require_subscribe_key(ctx)?;
        require_non_empty(&self.channel, "channel")?;
        let message = self
            .message
            .as_ref()
            .ok_or_else(|| Error::validation("message is required"))?;

        let payload = match (ctx.cipher(), self.kind) {
            (Some(cipher), PublishKind::Publish | PublishKind::Fire) => {
                encrypt_value(cipher, message)?
            }
            _ => message.clone(),
        };
        let json = serde_json::to_string(&payload)
            .map_err(|e| Error::validation(format!("message is not serializable: {e}")))?;

        let prefix = if self.kind == PublishKind::Signal {
            "signal"
        } else {
            "publish"
        };
        let mut path = format!(
            "/{prefix}/{}/{}/0/{}/0",
            encode_component(pub_key),
            encode_component(sub_key),
            encode_component(&self.channel)
        );

        let mut query = Query::new();
        if self.kind != PublishKind::Signal {
            let store = match self.kind {
                PublishKind::Fire => Some(false),
                _ => self.store,
            };
            query.push_opt("store", store.map(|s| if s { "1" } else { "0" }));
            query.push_opt("ttl", self.ttl.map(|t| t.to_string()));
            if let Some(meta) = &self.meta {
                let meta = serde_json::to_string(meta)
                    .map_err(|e| Error::validation(format!("meta is not serializable: {e}")))?;
                query.push("meta", meta);
            }
            if !self.replicate {
                query.push("norep", "true");
            }
            query.push("seqn", ctx.next_sequence().to_string());
        }

        let channels = std::slice::from_ref(&self.channel);
        if self.use_post {
            Ok(PreparedRequest::get(path)
                .with_method(Method::Post)
                .with_query(query)
                .with_body(json.into_bytes())
                .with_targets(channels, &[]))
        } else {
            path.push('/');
            path.push_str(&encode_component(&json));
            Ok(PreparedRequest::get(path)
                .with_query(query)
                .with_targets(channels, &[]))
        }
    }

    fn decode(&self, response: &HttpResponse, _ctx: &RequestContext<'_>) -> Result<PublishResponse> {
        let body: Vec<Value> = decode_json(&response.body)?;
        if body.first().and_then(Value::as_i64) != Some(1) {
            let message = body
                .get(1)
                .and_then(Value::as_str)
                .unwrap_or("publish rejected")
                .to_string();
            return Err(Error::Server {
                status: response.status,
                kind: ServerErrorKind::Other,
                message,
                body: Some(Value::Array(body)),
            });
        }
        let timetoken = body
            .get(2)
            .and_then(parse_timetoken)
            .ok_or_else(|| Error::decoding("publish response has no timetoken"))?;
        Ok(PublishResponse { timetoken })
    }
}
