//! Presence: occupancy queries, per-channel state, heartbeat and leave.

use std::collections::HashMap;

use serde_json::Value;

use crate::endpoints::{payload, require_non_empty, require_subscribe_key};
use crate::error::{Error, Result};
use crate::request::{Endpoint, PreparedRequest, RequestBuilder, RequestContext, decode_json};
use crate::signature::{Query, encode_component, encode_list};
use crate::status::Operation;
use crate::transport::HttpResponse;

fn require_targets(channels: &[String], groups: &[String]) -> Result<()> {
    if channels.is_empty() && groups.is_empty() {
        return Err(Error::validation("at least one channel or channel group is required"));
    }
    Ok(())
}

fn push_groups(query: &mut Query, groups: &[String]) {
    if !groups.is_empty() {
        query.push("channel-group", groups.join(","));
    }
}

fn channel_path(sub_key: &str, channels: &[String]) -> String {
    format!(
        "/v2/presence/sub-key/{}/channel/{}",
        encode_component(sub_key),
        encode_list(channels)
    )
}

// ---------------------------------------------------------------------------
// HereNow
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct Occupant {
    pub uuid: String,
    pub state: Option<Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChannelOccupancy {
    pub channel: String,
    pub occupancy: u64,
    pub occupants: Vec<Occupant>,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct HereNowResponse {
    pub total_channels: u64,
    pub total_occupancy: u64,
    pub channels: Vec<ChannelOccupancy>,
}

#[derive(Debug, Clone)]
pub struct HereNow {
    pub(crate) channels: Vec<String>,
    pub(crate) groups: Vec<String>,
    pub(crate) include_uuids: bool,
    pub(crate) include_state: bool,
}

impl Default for HereNow {
    fn default() -> Self {
        Self {
            channels: Vec::new(),
            groups: Vec::new(),
            include_uuids: true,
            include_state: false,
        }
    }
}

pub type HereNowBuilder = RequestBuilder<HereNow>;

impl HereNowBuilder {
    /// Channels to query. With no channels and no groups the query is global.
    pub fn channels<I, S>(mut self, channels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.endpoint.channels = channels.into_iter().map(Into::into).collect();
        self
    }

    pub fn channel_groups<I, S>(mut self, groups: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.endpoint.groups = groups.into_iter().map(Into::into).collect();
        self
    }

    pub fn include_uuids(mut self, include: bool) -> Self {
        self.endpoint.include_uuids = include;
        self
    }

    pub fn include_state(mut self, include: bool) -> Self {
        self.endpoint.include_state = include;
        self
    }
}

fn parse_occupants(uuids: Option<&Value>) -> Vec<Occupant> {
    let Some(Value::Array(uuids)) = uuids else {
        return Vec::new();
    };
    uuids
        .iter()
        .filter_map(|u| match u {
            Value::String(s) => Some(Occupant {
                uuid: s.clone(),
                state: None,
            }),
            Value::Object(obj) => Some(Occupant {
                uuid: obj.get("uuid")?.as_str()?.to_string(),
                state: obj.get("state").cloned(),
            }),
            _ => None,
        })
        .collect()
}

fn parse_channel(channel: &str, body: &Value) -> ChannelOccupancy {
    ChannelOccupancy {
        channel: channel.to_string(),
        occupancy: body.get("occupancy").and_then(Value::as_u64).unwrap_or(0),
        occupants: parse_occupants(body.get("uuids")),
    }
}

impl Endpoint for HereNow {
    type Output = HereNowResponse;

    fn operation(&self) -> Operation {
        Operation::HereNow
    }

    fn prepare(&self, ctx: &RequestContext<'_>) -> Result<PreparedRequest> {
        let sub_key = require_subscribe_key(ctx)?;
        let path = if self.channels.is_empty() && self.groups.is_empty() {
            format!("/v2/presence/sub-key/{}", encode_component(sub_key))
        } else {
            channel_path(sub_key, &self.channels)
        };

        let mut query = Query::new();
        push_groups(&mut query, &self.groups);
        if !self.include_uuids {
            query.push("disable_uuids", "1");
        }
        if self.include_state {
            query.push("state", "1");
        }
        Ok(PreparedRequest::get(path)
            .with_query(query)
            .with_targets(&self.channels, &self.groups))
    }

    fn decode(&self, response: &HttpResponse, _ctx: &RequestContext<'_>) -> Result<HereNowResponse> {
        let body: Value = decode_json(&response.body)?;

        // A single channel without groups answers with a flat object.
        if let Ok(payload) = payload(&body) {
            let channels = payload
                .get("channels")
                .and_then(Value::as_object)
                .map(|map| {
                    map.iter()
                        .map(|(name, entry)| parse_channel(name, entry))
                        .collect()
                })
                .unwrap_or_default();
            return Ok(HereNowResponse {
                total_channels: payload
                    .get("total_channels")
                    .and_then(Value::as_u64)
                    .unwrap_or(0),
                total_occupancy: payload
                    .get("total_occupancy")
                    .and_then(Value::as_u64)
                    .unwrap_or(0),
                channels,
            });
        }

        let name = self.channels.first().cloned().unwrap_or_default();
        let channel = parse_channel(&name, &body);
        Ok(HereNowResponse {
            total_channels: 1,
            total_occupancy: channel.occupancy,
            channels: vec![channel],
        })
    }
}

// ---------------------------------------------------------------------------
// WhereNow
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Default)]
pub struct WhereNowResponse {
    pub channels: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct WhereNow {
    pub(crate) uuid: Option<String>,
}

pub type WhereNowBuilder = RequestBuilder<WhereNow>;

impl WhereNowBuilder {
    /// UUID to look up; defaults to this client's UUID.
    pub fn uuid(mut self, uuid: impl Into<String>) -> Self {
        self.endpoint.uuid = Some(uuid.into());
        self
    }
}

impl Endpoint for WhereNow {
    type Output = WhereNowResponse;

    fn operation(&self) -> Operation {
        Operation::WhereNow
    }

    fn prepare(&self, ctx: &RequestContext<'_>) -> Result<PreparedRequest> {
        let sub_key = require_subscribe_key(ctx)?;
        let uuid = self.uuid.as_deref().unwrap_or(ctx.uuid());
        require_non_empty(uuid, "uuid")?;
        Ok(PreparedRequest::get(format!(
            "/v2/presence/sub-key/{}/uuid/{}",
            encode_component(sub_key),
            encode_component(uuid)
        )))
    }

    fn decode(&self, response: &HttpResponse, _ctx: &RequestContext<'_>) -> Result<WhereNowResponse> {
        let body: Value = decode_json(&response.body)?;
        let channels = payload(&body)?
            .get("channels")
            .and_then(Value::as_array)
            .ok_or_else(|| Error::decoding("where-now payload has no channel list"))?
            .iter()
            .filter_map(|c| c.as_str().map(String::from))
            .collect();
        Ok(WhereNowResponse { channels })
    }
}

// ---------------------------------------------------------------------------
// SetState
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct SetStateResponse {
    pub state: Value,
}

#[derive(Debug, Clone, Default)]
pub struct SetState {
    pub(crate) channels: Vec<String>,
    pub(crate) groups: Vec<String>,
    pub(crate) state: Option<Value>,
}

pub type SetStateBuilder = RequestBuilder<SetState>;

impl SetStateBuilder {
    pub fn channels<I, S>(mut self, channels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.endpoint.channels = channels.into_iter().map(Into::into).collect();
        self
    }

    pub fn channel_groups<I, S>(mut self, groups: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.endpoint.groups = groups.into_iter().map(Into::into).collect();
        self
    }

    /// State object; must be a JSON object.
    pub fn state(mut self, state: Value) -> Self {
        self.endpoint.state = Some(state);
        self
    }
}

impl Endpoint for SetState {
    type Output = SetStateResponse;

    fn operation(&self) -> Operation {
        Operation::SetState
    }

    fn prepare(&self, ctx: &RequestContext<'_>) -> Result<PreparedRequest> {
        let sub_key = require_subscribe_key(ctx)?;
        require_targets(&self.channels, &self.groups)?;
        let state = match &self.state {
            Some(state @ Value::Object(_)) => state,
            Some(_) => return Err(Error::validation("state must be a JSON object")),
            None => return Err(Error::validation("state is required")),
        };

        let mut query = Query::new();
        query.push("state", state.to_string());
        push_groups(&mut query, &self.groups);

        let path = format!(
            "{}/uuid/{}/data",
            channel_path(sub_key, &self.channels),
            encode_component(ctx.uuid())
        );
        Ok(PreparedRequest::get(path)
            .with_query(query)
            .with_targets(&self.channels, &self.groups))
    }

    fn decode(&self, response: &HttpResponse, _ctx: &RequestContext<'_>) -> Result<SetStateResponse> {
        let body: Value = decode_json(&response.body)?;
        Ok(SetStateResponse {
            state: payload(&body)?.clone(),
        })
    }

    fn on_success(&self, _output: &SetStateResponse, ctx: &RequestContext<'_>) {
        if let Some(state) = &self.state {
            ctx.state().set_many(&self.channels, state);
        }
    }
}

// ---------------------------------------------------------------------------
// GetState
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Default)]
pub struct GetStateResponse {
    pub uuid: String,
    pub channels: HashMap<String, Value>,
}

#[derive(Debug, Clone, Default)]
pub struct GetState {
    pub(crate) channels: Vec<String>,
    pub(crate) groups: Vec<String>,
    pub(crate) uuid: Option<String>,
}

pub type GetStateBuilder = RequestBuilder<GetState>;

impl GetStateBuilder {
    pub fn channels<I, S>(mut self, channels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.endpoint.channels = channels.into_iter().map(Into::into).collect();
        self
    }

    pub fn channel_groups<I, S>(mut self, groups: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.endpoint.groups = groups.into_iter().map(Into::into).collect();
        self
    }

    /// UUID whose state to read; defaults to this client's UUID.
    pub fn uuid(mut self, uuid: impl Into<String>) -> Self {
        self.endpoint.uuid = Some(uuid.into());
        self
    }
}

impl GetState {
    fn target_uuid<'a>(&'a self, ctx: &'a RequestContext<'_>) -> &'a str {
        self.uuid.as_deref().unwrap_or(ctx.uuid())
    }
}

impl Endpoint for GetState {
    type Output = GetStateResponse;

    fn operation(&self) -> Operation {
        Operation::GetState
    }

    fn prepare(&self, ctx: &RequestContext<'_>) -> Result<PreparedRequest> {
        let sub_key = require_subscribe_key(ctx)?;
        require_targets(&self.channels, &self.groups)?;
        let uuid = self.target_uuid(ctx);
        require_non_empty(uuid, "uuid")?;

        let mut query = Query::new();
        push_groups(&mut query, &self.groups);
        let path = format!(
            "{}/uuid/{}",
            channel_path(sub_key, &self.channels),
            encode_component(uuid)
        );
        Ok(PreparedRequest::get(path)
            .with_query(query)
            .with_targets(&self.channels, &self.groups))
    }

    fn decode(&self, response: &HttpResponse, ctx: &RequestContext<'_>) -> Result<GetStateResponse> {
        let body: Value = decode_json(&response.body)?;
        let uuid = body
            .get("uuid")
            .and_then(Value::as_str)
            .unwrap_or(self.target_uuid(ctx))
            .to_string();
        let payload = payload(&body)?;

        // Single-channel answers name the channel at the top level.
        let channels = match body.get("channel").and_then(Value::as_str) {
            Some(channel) => HashMap::from([(channel.to_string(), payload.clone())]),
            None => payload
                .get("channels")
                .and_then(Value::as_object)
                .map(|map| map.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
                .unwrap_or_default(),
        };
        Ok(GetStateResponse { uuid, channels })
    }

    fn on_success(&self, output: &GetStateResponse, ctx: &RequestContext<'_>) {
        if output.uuid != ctx.uuid() {
            return;
        }
        for (channel, state) in &output.channels {
            ctx.state().set(channel, state.clone());
        }
    }
}

// ---------------------------------------------------------------------------
// Heartbeat / Leave (driven by the subscription machinery)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default)]
pub(crate) struct Heartbeat {
    pub channels: Vec<String>,
    pub groups: Vec<String>,
}

impl Endpoint for Heartbeat {
    type Output = ();

    fn operation(&self) -> Operation {
        Operation::Heartbeat
    }

    fn prepare(&self, ctx: &RequestContext<'_>) -> Result<PreparedRequest> {
        let sub_key = require_subscribe_key(ctx)?;
        require_targets(&self.channels, &self.groups)?;

        let mut query = Query::new();
        push_groups(&mut query, &self.groups);
        query.push(
            "heartbeat",
            ctx.config().presence_timeout.as_secs().to_string(),
        );
        if let Some(state) = ctx.state().snapshot_for(&self.channels) {
            query.push("state", state.to_string());
        }
        Ok(
            PreparedRequest::get(format!("{}/heartbeat", channel_path(sub_key, &self.channels)))
                .with_query(query)
                .with_targets(&self.channels, &self.groups),
        )
    }

    fn decode(&self, response: &HttpResponse, _ctx: &RequestContext<'_>) -> Result<()> {
        let _: Value = decode_json(&response.body)?;
        Ok(())
    }
}

#[derive(Debug, Clone, Default)]
pub(crate) struct Leave {
    pub channels: Vec<String>,
    pub groups: Vec<String>,
}

impl Endpoint for Leave {
    type Output = ();

    fn operation(&self) -> Operation {
        Operation::Leave
    }

    fn prepare(&self, ctx: &RequestContext<'_>) -> Result<PreparedRequest> {
        let sub_key = require_subscribe_key(ctx)?;
        require_targets(&self.channels, &self.groups)?;

        let mut query = Query::new();
        push_groups(&mut query, &self.groups);
        Ok(
            PreparedRequest::get(format!("{}/leave", channel_path(sub_key, &self.channels)))
                .with_query(query)
                .with_targets(&self.channels, &self.groups),
        )
    }

    fn decode(&self, response: &HttpResponse, _ctx: &RequestContext<'_>) -> Result<()> {
        let _: Value = decode_json(&response.body)?;
        Ok(())
    }
}
