//! Mobile push registration for channels.

use std::fmt;

use serde_json::Value;

use crate::endpoints::{require_non_empty, require_subscribe_key};
use crate::error::{Error, Result, ServerErrorKind};
use crate::request::{Endpoint, PreparedRequest, RequestBuilder, RequestContext, decode_json};
use crate::signature::{Query, encode_component};
use crate::status::Operation;
use crate::transport::HttpResponse;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PushType {
    #[default]
    Gcm,
    Apns,
    /// HTTP/2 APNs; requires a topic.
    Apns2,
    Mpns,
}

impl fmt::Display for PushType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Gcm => "gcm",
            Self::Apns => "apns",
            Self::Apns2 => "apns2",
            Self::Mpns => "mpns",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PushEnvironment {
    #[default]
    Development,
    Production,
}

impl fmt::Display for PushEnvironment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Development => "development",
            Self::Production => "production",
        })
    }
}

/// Device and gateway selection shared by every push operation.
#[derive(Debug, Clone, Default)]
pub(crate) struct PushTarget {
    pub device_id: String,
    pub push_type: PushType,
    pub topic: Option<String>,
    pub environment: PushEnvironment,
}

impl PushTarget {
    fn base(&self, ctx: &RequestContext<'_>) -> Result<(String, Query)> {
        let sub_key = require_subscribe_key(ctx)?;
        require_non_empty(&self.device_id, "device id")?;

        let mut query = Query::new();
        let path = if self.push_type == PushType::Apns2 {
            let topic = self
                .topic
                .as_deref()
                .filter(|t| !t.is_empty())
                .ok_or_else(|| Error::validation("topic is required for apns2"))?;
            query.push("topic", topic);
            query.push("environment", self.environment.to_string());
            format!(
                "/v2/push/sub-key/{}/devices-apns2/{}",
                encode_component(sub_key),
                encode_component(&self.device_id)
            )
        } else {
            query.push("type", self.push_type.to_string());
            format!(
                "/v1/push/sub-key/{}/devices/{}",
                encode_component(sub_key),
                encode_component(&self.device_id)
            )
        };
        Ok((path, query))
    }
}

macro_rules! push_target_setters {
    ($builder:ty) => {
        impl $builder {
            pub fn device_id(mut self, device_id: impl Into<String>) -> Self {
                self.endpoint.target.device_id = device_id.into();
                self
            }

            pub fn push_type(mut self, push_type: PushType) -> Self {
                self.endpoint.target.push_type = push_type;
                self
            }

            /// APNs2 bundle topic.
            pub fn topic(mut self, topic: impl Into<String>) -> Self {
                self.endpoint.target.topic = Some(topic.into());
                self
            }

            pub fn environment(mut self, environment: PushEnvironment) -> Self {
                self.endpoint.target.environment = environment;
                self
            }
        }
    };
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PushAction {
    Add,
    Remove,
    RemoveAll,
}

#[derive(Debug, Clone)]
pub struct ModifyPush {
    pub(crate) action: PushAction,
    pub(crate) target: PushTarget,
    pub(crate) channels: Vec<String>,
}

impl ModifyPush {
    pub(crate) fn new(action: PushAction) -> Self {
        Self {
            action,
            target: PushTarget::default(),
            channels: Vec::new(),
        }
    }
}

pub type ModifyPushBuilder = RequestBuilder<ModifyPush>;

push_target_setters!(ModifyPushBuilder);

impl ModifyPushBuilder {
    /// Ignored when removing the device from every channel.
    pub fn channels<I, S>(mut self, channels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.endpoint.channels = channels.into_iter().map(Into::into).collect();
        self
    }
}

impl Endpoint for ModifyPush {
    type Output = ();

    fn operation(&self) -> Operation {
        match self.action {
            PushAction::Add => Operation::AddPushNotifications,
            PushAction::Remove => Operation::RemovePushNotifications,
            PushAction::RemoveAll => Operation::RemoveAllPushNotifications,
        }
    }

    fn prepare(&self, ctx: &RequestContext<'_>) -> Result<PreparedRequest> {
        let (path, mut query) = self.target.base(ctx)?;
        if self.action == PushAction::RemoveAll {
            return Ok(PreparedRequest::get(format!("{path}/remove")).with_query(query));
        }
        if self.channels.is_empty() {
            return Err(Error::validation("at least one channel is required"));
        }
        let key = if self.action == PushAction::Add {
            "add"
        } else {
            "remove"
        };
        query.push(key, self.channels.join(","));
        Ok(PreparedRequest::get(path)
            .with_query(query)
            .with_targets(&self.channels, &[]))
    }

    fn decode(&self, response: &HttpResponse, _ctx: &RequestContext<'_>) -> Result<()> {
        let body: Value = decode_json(&response.body)?;
        match body.as_array().and_then(|a| a.first()).and_then(Value::as_i64) {
            Some(1) => Ok(()),
            _ => Err(Error::Server {
                status: response.status,
                kind: ServerErrorKind::Other,
                message: body
                    .get(1)
                    .and_then(Value::as_str)
                    .unwrap_or("push registration failed")
                    .to_string(),
                body: Some(body),
            }),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ListPushProvisions {
    pub(crate) target: PushTarget,
}

pub type ListPushProvisionsBuilder = RequestBuilder<ListPushProvisions>;

push_target_setters!(ListPushProvisionsBuilder);

impl Endpoint for ListPushProvisions {
    type Output = Vec<String>;

    fn operation(&self) -> Operation {
        Operation::ListPushProvisions
    }

    fn prepare(&self, ctx: &RequestContext<'_>) -> Result<PreparedRequest> {
        let (path, query) = self.target.base(ctx)?;
        Ok(PreparedRequest::get(path).with_query(query))
    }

    fn decode(&self, response: &HttpResponse, _ctx: &RequestContext<'_>) -> Result<Vec<String>> {
        let channels: Vec<String> = decode_json(&response.body)?;
        Ok(channels)
    }
}
