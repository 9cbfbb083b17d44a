//! Channel-group registry.

use serde_json::Value;

use crate::endpoints::{payload, require_non_empty, require_subscribe_key};
use crate::error::{Error, Result, ServerErrorKind};
use crate::request::{Endpoint, PreparedRequest, RequestBuilder, RequestContext, decode_json};
use crate::signature::{Query, encode_component};
use crate::status::Operation;
use crate::transport::HttpResponse;

fn group_path(sub_key: &str, group: &str) -> String {
    format!(
        "/v1/channel-registration/sub-key/{}/channel-group/{}",
        encode_component(sub_key),
        encode_component(group)
    )
}

/// Registry answers carry `"error": true` alongside a 200 on some failures.
fn check_envelope(response: &HttpResponse) -> Result<Value> {
    let body: Value = decode_json(&response.body)?;
    if body.get("error").and_then(Value::as_bool).unwrap_or(false) {
        let message = body
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("channel group request failed")
            .to_string();
        return Err(Error::Server {
            status: response.status,
            kind: ServerErrorKind::Other,
            message,
            body: Some(body),
        });
    }
    Ok(body)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum GroupAction {
    Add,
    Remove,
    Delete,
}

/// Add channels to, remove channels from, or delete a channel group.
#[derive(Debug, Clone)]
pub struct ModifyChannelGroup {
    pub(crate) action: GroupAction,
    pub(crate) group: String,
    pub(crate) channels: Vec<String>,
}

impl ModifyChannelGroup {
    pub(crate) fn new(action: GroupAction) -> Self {
        Self {
            action,
            group: String::new(),
            channels: Vec::new(),
        }
    }
}

pub type ModifyChannelGroupBuilder = RequestBuilder<ModifyChannelGroup>;

impl ModifyChannelGroupBuilder {
    pub fn channel_group(mut self, group: impl Into<String>) -> Self {
        self.endpoint.group = group.into();
        self
    }

    /// Ignored when deleting the whole group.
    pub fn channels<I, S>(mut self, channels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.endpoint.channels = channels.into_iter().map(Into::into).collect();
        self
    }
}

impl Endpoint for ModifyChannelGroup {
    type Output = ();

    fn operation(&self) -> Operation {
        match self.action {
            GroupAction::Add => Operation::AddChannelsToGroup,
            GroupAction::Remove => Operation::RemoveChannelsFromGroup,
            GroupAction::Delete => Operation::DeleteChannelGroup,
        }
    }

    fn prepare(&self, ctx: &RequestContext<'_>) -> Result<PreparedRequest> {
        let sub_key = require_subscribe_key(ctx)?;
        require_non_empty(&self.group, "channel group")?;

        let groups = std::slice::from_ref(&self.group);
        let path = group_path(sub_key, &self.group);
        if self.action == GroupAction::Delete {
            return Ok(PreparedRequest::get(format!("{path}/remove")).with_targets(&[], groups));
        }

        if self.channels.is_empty() {
            return Err(Error::validation("at least one channel is required"));
        }
        let key = if self.action == GroupAction::Add {
            "add"
        } else {
            "remove"
        };
        let mut query = Query::new();
        query.push(key, self.channels.join(","));
        Ok(PreparedRequest::get(path)
            .with_query(query)
            .with_targets(&self.channels, groups))
    }

    fn decode(&self, response: &HttpResponse, _ctx: &RequestContext<'_>) -> Result<()> {
        check_envelope(response).map(|_| ())
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct ListChannelsResponse {
    pub group: String,
    pub channels: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct ListChannelsInGroup {
    pub(crate) group: String,
}

pub type ListChannelsInGroupBuilder = RequestBuilder<ListChannelsInGroup>;

impl ListChannelsInGroupBuilder {
    pub fn channel_group(mut self, group: impl Into<String>) -> Self {
        self.endpoint.group = group.into();
        self
    }
}

impl Endpoint for ListChannelsInGroup {
    type Output = ListChannelsResponse;

    fn operation(&self) -> Operation {
        Operation::ListChannelsInGroup
    }

    fn prepare(&self, ctx: &RequestContext<'_>) -> Result<PreparedRequest> {
        let sub_key = require_subscribe_key(ctx)?;
        require_non_empty(&self.group, "channel group")?;
        Ok(PreparedRequest::get(group_path(sub_key, &self.group))
            .with_targets(&[], std::slice::from_ref(&self.group)))
    }

    fn decode(
        &self,
        response: &HttpResponse,
        _ctx: &RequestContext<'_>,
    ) -> Result<ListChannelsResponse> {
        let body = check_envelope(response)?;
        let payload = payload(&body)?;
        let channels = payload
            .get("channels")
            .and_then(Value::as_array)
            .map(|list| {
                list.iter()
                    .filter_map(|c| c.as_str().map(String::from))
                    .collect()
            })
            .unwrap_or_default();
        let group = payload
            .get("group")
            .and_then(Value::as_str)
            .unwrap_or(&self.group)
            .to_string();
        Ok(ListChannelsResponse { group, channels })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::request::testing::{executor, response};

    #[test]
    fn add_and_remove_use_query_lists() {
        let exec = executor(Config::new("pub", "sub", "me"));
        let mut add = ModifyChannelGroup::new(GroupAction::Add);
        add.group = "fam".into();
        add.channels = vec!["a".into(), "b".into()];
        let req = add.prepare(&exec.context()).unwrap();
        assert_eq!(
            req.path,
            "/v1/channel-registration/sub-key/sub/channel-group/fam"
        );
        assert_eq!(req.query.get("add"), Some("a,b"));
        assert_eq!(req.groups, vec!["fam"]);

        let mut remove = add.clone();
        remove.action = GroupAction::Remove;
        let req = remove.prepare(&exec.context()).unwrap();
        assert_eq!(req.query.get("remove"), Some("a,b"));
        assert_eq!(remove.operation(), Operation::RemoveChannelsFromGroup);
    }

    #[test]
    fn delete_group_path() {
        let exec = executor(Config::new("pub", "sub", "me"));
        let mut del = ModifyChannelGroup::new(GroupAction::Delete);
        del.group = "fam".into();
        let req = del.prepare(&exec.context()).unwrap();
        assert_eq!(
            req.path,
            "/v1/channel-registration/sub-key/sub/channel-group/fam/remove"
        );
    }

    #[test]
    fn validation() {
        let exec = executor(Config::new("pub", "sub", "me"));
        let add = ModifyChannelGroup::new(GroupAction::Add);
        assert!(matches!(add.prepare(&exec.context()), Err(Error::Validation(_))));

        let mut add = ModifyChannelGroup::new(GroupAction::Add);
        add.group = "fam".into();
        assert!(matches!(add.prepare(&exec.context()), Err(Error::Validation(_))));
    }

    #[test]
    fn list_decodes_payload() {
        let exec = executor(Config::new("pub", "sub", "me"));
        let list = ListChannelsInGroup { group: "fam".into() };
        let body = r#"{"status":200,"payload":{"channels":["a","b"],"group":"fam"},"service":"channel-registry","error":false}"#;
        let out = list.decode(&response(200, body), &exec.context()).unwrap();
        assert_eq!(out.group, "fam");
        assert_eq!(out.channels, vec!["a", "b"]);
    }

    #[test]
    fn error_flag_is_a_server_error() {
        let exec = executor(Config::new("pub", "sub", "me"));
        let mut add = ModifyChannelGroup::new(GroupAction::Add);
        add.group = "fam".into();
        let body = r#"{"status":200,"message":"Channel group limit exceeded","error":true}"#;
        let err = add.decode(&response(200, body), &exec.context()).unwrap_err();
        assert!(matches!(err, Error::Server { ref message, .. } if message.contains("limit")));
    }
}
