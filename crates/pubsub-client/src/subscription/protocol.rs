//! Subscribe long-poll request and response envelopes.

use serde::{Deserialize, Deserializer};
use serde_json::Value;

use crate::crypto::{EncryptionProvider, decrypt_value};
use crate::endpoints::require_subscribe_key;
use crate::error::{Error, Result};
use crate::request::{
    Endpoint, PreparedRequest, RequestContext, decode_json, parse_timetoken,
};
use crate::signature::{Query, encode_component, encode_list};
use crate::status::Operation;
use crate::subscription::state::{Cursor, PRESENCE_SUFFIX};
use crate::transport::HttpResponse;
use crate::types::{Event, Message, MessageType, PresenceAction, PresenceEvent};

/// One long-poll request for the current subscription set.
#[derive(Debug, Clone)]
pub(crate) struct SubscribeRequest {
    /// Channel names with presence variants already appended.
    pub channels: Vec<String>,
    pub groups: Vec<String>,
    pub cursor: Cursor,
}

impl Endpoint for SubscribeRequest {
    type Output = SubscribeResponse;

    fn operation(&self) -> Operation {
        Operation::Subscribe
    }

    fn prepare(&self, ctx: &RequestContext<'_>) -> Result<PreparedRequest> {
        let sub_key = require_subscribe_key(ctx)?;
        if self.channels.is_empty() && self.groups.is_empty() {
            return Err(Error::validation("nothing to subscribe to"));
        }

        let mut query = Query::new();
        query.push("tt", self.cursor.timetoken.to_string());
        query.push("tr", self.cursor.region.to_string());
        if !self.groups.is_empty() {
            query.push("channel-group", self.groups.join(","));
        }
        query.push_opt("filter-expr", ctx.filter_expression());
        query.push(
            "heartbeat",
            ctx.config().presence_timeout.as_secs().to_string(),
        );
        if self.cursor.is_handshake() {
            let plain = self
                .channels
                .iter()
                .filter(|c| !c.ends_with(PRESENCE_SUFFIX));
            if let Some(state) = ctx.state().snapshot_for(plain) {
                query.push("state", state.to_string());
            }
        }

        let path = format!(
            "/v2/subscribe/{}/{}/0",
            encode_component(sub_key),
            encode_list(&self.channels)
        );
        Ok(PreparedRequest::get(path)
            .with_query(query)
            .with_targets(&self.channels, &self.groups))
    }

    fn decode(&self, response: &HttpResponse, _ctx: &RequestContext<'_>) -> Result<SubscribeResponse> {
        decode_json(&response.body)
    }
}

fn timetoken<'de, D: Deserializer<'de>>(d: D) -> std::result::Result<i64, D::Error> {
    let value = Value::deserialize(d)?;
    parse_timetoken(&value).ok_or_else(|| serde::de::Error::custom("invalid timetoken"))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub(crate) struct WireCursor {
    #[serde(rename = "t", deserialize_with = "timetoken")]
    pub timetoken: i64,
    #[serde(rename = "r", default)]
    pub region: i32,
}

impl From<WireCursor> for Cursor {
    fn from(c: WireCursor) -> Self {
        Cursor {
            timetoken: c.timetoken,
            region: c.region,
        }
    }
}

/// Envelopes stay raw so one malformed entry cannot fail the whole batch.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub(crate) struct SubscribeResponse {
    #[serde(rename = "t")]
    pub cursor: WireCursor,
    #[serde(rename = "m", default)]
    pub envelopes: Vec<Value>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub(crate) struct Envelope {
    #[serde(rename = "c")]
    pub channel: String,
    #[serde(rename = "b", default)]
    pub subscription: Option<String>,
    #[serde(rename = "p", default)]
    pub publish: Option<WireCursor>,
    #[serde(rename = "o", default)]
    pub origin: Option<WireCursor>,
    #[serde(rename = "i", default)]
    pub issuer: Option<String>,
    #[serde(rename = "d", default)]
    pub payload: Value,
    #[serde(rename = "e", default)]
    pub kind: Option<i64>,
    #[serde(rename = "u", default)]
    pub user_metadata: Option<Value>,
}

fn strip_presence(name: &str) -> &str {
    name.strip_suffix(PRESENCE_SUFFIX).unwrap_or(name)
}

fn string_list(value: Option<&Value>) -> Vec<String> {
    value
        .and_then(Value::as_array)
        .map(|list| {
            list.iter()
                .filter_map(|u| u.as_str().map(String::from))
                .collect()
        })
        .unwrap_or_default()
}

/// Decode one raw envelope into a listener event. Errors carry the channel
/// name when the envelope had one.
pub(crate) fn decode_envelope(
    raw: Value,
    cipher: Option<&dyn EncryptionProvider>,
) -> std::result::Result<Event, (Option<String>, Error)> {
    let channel = raw.get("c").and_then(Value::as_str).map(String::from);
    let envelope = serde_json::from_value::<Envelope>(raw)
        .map_err(|e| (channel.clone(), Error::decoding(format!("malformed envelope: {e}"))))?;
    envelope.into_event(cipher).map_err(|e| (channel, e))
}

impl Envelope {
    pub fn is_presence(&self) -> bool {
        self.channel.ends_with(PRESENCE_SUFFIX)
    }

    fn timetoken(&self) -> i64 {
        self.publish.map(|p| p.timetoken).unwrap_or_default()
    }

    /// Subscription that routed the envelope, omitted when it is the
    /// channel itself.
    fn routed_by(&self) -> Option<String> {
        self.subscription
            .as_deref()
            .map(strip_presence)
            .filter(|s| *s != strip_presence(&self.channel))
            .map(String::from)
    }

    /// Convert into a listener event, decrypting message payloads with
    /// `cipher` when one is configured.
    pub fn into_event(self, cipher: Option<&dyn EncryptionProvider>) -> Result<Event> {
        if self.is_presence() {
            return Ok(Event::Presence(self.into_presence()));
        }

        let message_type = MessageType::from_wire(self.kind);
        let payload = match (cipher, &self.payload) {
            (Some(cipher), Value::String(_)) if message_type == MessageType::Message => {
                decrypt_value(cipher, &self.payload)?
            }
            _ => self.payload.clone(),
        };
        Ok(Event::Message(Message {
            subscription: self.routed_by(),
            timetoken: self.timetoken(),
            originating_timetoken: self.origin.map(|o| o.timetoken),
            publisher: self.issuer,
            payload,
            message_type,
            user_metadata: self.user_metadata,
            channel: self.channel,
        }))
    }

    fn into_presence(self) -> PresenceEvent {
        let p = &self.payload;
        let uuid = p.get("uuid").and_then(Value::as_str).map(String::from);
        let state = p.get("data").cloned().filter(|d| !d.is_null());
        PresenceEvent {
            event: PresenceAction::parse(p.get("action").and_then(Value::as_str).unwrap_or("")),
            uuid,
            occupancy: p.get("occupancy").and_then(Value::as_u64).unwrap_or(0),
            state,
            joined: string_list(p.get("join")),
            left: string_list(p.get("leave")),
            timed_out: string_list(p.get("timeout")),
            subscription: self.routed_by(),
            timetoken: self.timetoken(),
            channel: strip_presence(&self.channel).to_string(),
        }
    }
}
