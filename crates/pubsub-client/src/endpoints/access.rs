//! Access manager: grant and revoke tokens. Both require the secret key.

use serde_json::{Value, json};

use crate::endpoints::{require_secret_key, require_subscribe_key};
use crate::error::{Error, Result};
use crate::request::{Endpoint, PreparedRequest, RequestBuilder, RequestContext, decode_json};
use crate::signature::encode_component;
use crate::status::Operation;
use crate::token::{Resource, TokenResources, token_id};
use crate::transport::{HttpResponse, Method};

/// Longest TTL the service accepts, in minutes (30 days).
const MAX_TTL_MINUTES: u32 = 43_200;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GrantTokenResponse {
    pub token: String,
}

#[derive(Debug, Clone, Default)]
pub struct GrantToken {
    pub(crate) ttl: u32,
    pub(crate) authorized_uuid: Option<String>,
    pub(crate) meta: Option<Value>,
    pub(crate) resources: TokenResources,
    pub(crate) patterns: TokenResources,
}

pub type GrantTokenBuilder = RequestBuilder<GrantToken>;

impl GrantTokenBuilder {
    /// Token lifetime in minutes, 1..=43200.
    pub fn ttl(mut self, minutes: u32) -> Self {
        self.endpoint.ttl = minutes;
        self
    }

    /// Bind the token to a single UUID.
    pub fn authorized_uuid(mut self, uuid: impl Into<String>) -> Self {
        self.endpoint.authorized_uuid = Some(uuid.into());
        self
    }

    pub fn meta(mut self, meta: Value) -> Self {
        self.endpoint.meta = Some(meta);
        self
    }

    /// Grant `resource` on the entity named exactly `name`.
    pub fn resource(mut self, name: impl Into<String>, resource: Resource) -> Self {
        self.endpoint.resources.insert(name.into(), resource);
        self
    }

    /// Grant `resource` on every entity whose name matches the `pattern` regex.
    pub fn pattern(mut self, pattern: impl Into<String>, resource: Resource) -> Self {
        self.endpoint.patterns.insert(pattern.into(), resource);
        self
    }
}

fn resources_json(resources: &TokenResources) -> Value {
    json!({
        "channels": resources.channels,
        "groups": resources.groups,
        "uuids": resources.uuids,
        "users": {},
        "spaces": {},
    })
}

impl Endpoint for GrantToken {
    type Output = GrantTokenResponse;

    fn operation(&self) -> Operation {
        Operation::GrantToken
    }

    fn prepare(&self, ctx: &RequestContext<'_>) -> Result<PreparedRequest> {
        let sub_key = require_subscribe_key(ctx)?;
        require_secret_key(ctx)?;
        if !(1..=MAX_TTL_MINUTES).contains(&self.ttl) {
            return Err(Error::validation(format!(
                "ttl must be between 1 and {MAX_TTL_MINUTES} minutes"
            )));
        }
        if self.resources.is_empty() && self.patterns.is_empty() {
            return Err(Error::validation("at least one resource or pattern is required"));
        }
        if let Some(meta) = &self.meta {
            if !meta.is_object() {
                return Err(Error::validation("meta must be a JSON object"));
            }
        }

        let mut permissions = json!({
            "resources": resources_json(&self.resources),
            "patterns": resources_json(&self.patterns),
            "meta": self.meta.clone().unwrap_or_else(|| json!({})),
        });
        if let (Some(uuid), Some(obj)) = (&self.authorized_uuid, permissions.as_object_mut()) {
            obj.insert("uuid".into(), Value::String(uuid.clone()));
        }
        let body = json!({ "ttl": self.ttl, "permissions": permissions });

        let channels: Vec<String> = self.resources.channels.keys().cloned().collect();
        let groups: Vec<String> = self.resources.groups.keys().cloned().collect();
        Ok(PreparedRequest::get(format!(
            "/v3/pam/{}/grant",
            encode_component(sub_key)
        ))
        .with_method(Method::Post)
        .with_body(body.to_string().into_bytes())
        .with_targets(&channels, &groups))
    }

    fn decode(&self, response: &HttpResponse, _ctx: &RequestContext<'_>) -> Result<GrantTokenResponse> {
        let body: Value = decode_json(&response.body)?;
        let token = body
            .get("data")
            .and_then(|d| d.get("token"))
            .and_then(Value::as_str)
            .ok_or_else(|| Error::decoding("grant response has no token"))?;
        Ok(GrantTokenResponse {
            token: token.to_string(),
        })
    }
}

#[derive(Debug, Clone, Default)]
pub struct RevokeToken {
    pub(crate) token: String,
}

pub type RevokeTokenBuilder = RequestBuilder<RevokeToken>;

impl RevokeTokenBuilder {
    pub fn token(mut self, token: impl Into<String>) -> Self {
        self.endpoint.token = token.into();
        self
    }
}

impl Endpoint for RevokeToken {
    type Output = ();

    fn operation(&self) -> Operation {
        Operation::RevokeToken
    }

    fn prepare(&self, ctx: &RequestContext<'_>) -> Result<PreparedRequest> {
        let sub_key = require_subscribe_key(ctx)?;
        require_secret_key(ctx)?;
        if self.token.trim().is_empty() {
            return Err(Error::validation("token is required"));
        }
        Ok(PreparedRequest::get(format!(
            "/v3/pam/{}/grant/{}",
            encode_component(sub_key),
            token_id(&self.token)
        ))
        .with_method(Method::Delete))
    }

    fn decode(&self, response: &HttpResponse, _ctx: &RequestContext<'_>) -> Result<()> {
        let _: Value = decode_json(&response.body)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::request::testing::{executor, response};
    use crate::token::{ChannelPermissions, GroupPermissions};

    fn secret_config() -> Config {
        let mut config = Config::new("pub", "sub", "me");
        config.secret_key = Some("secret".into());
        config
    }

    fn grant() -> GrantToken {
        let mut g = GrantToken {
            ttl: 10,
            ..GrantToken::default()
        };
        g.resources.insert(
            "ch1".into(),
            Resource::Channel(ChannelPermissions {
                read: true,
                write: true,
                ..Default::default()
            }),
        );
        g
    }

    #[test]
    fn grant_body_shape() {
        let exec = executor(secret_config());
        let mut g = grant();
        g.authorized_uuid = Some("alice".into());
        g.patterns.insert(
            "^g-.*".into(),
            Resource::Group(GroupPermissions {
                read: true,
                manage: false,
            }),
        );
        let req = g.prepare(&exec.context()).unwrap();
        assert_eq!(req.method, Method::Post);
        assert_eq!(req.path, "/v3/pam/sub/grant");

        let body: Value = serde_json::from_slice(req.body.as_deref().unwrap()).unwrap();
        assert_eq!(body["ttl"], 10);
        assert_eq!(body["permissions"]["resources"]["channels"]["ch1"], 3);
        assert_eq!(body["permissions"]["patterns"]["groups"]["^g-.*"], 1);
        assert_eq!(body["permissions"]["uuid"], "alice");
        assert_eq!(body["permissions"]["meta"], json!({}));
    }

    #[test]
    fn grant_validation() {
        let exec = executor(Config::new("pub", "sub", "me"));
        assert!(matches!(grant().prepare(&exec.context()), Err(Error::Validation(_))));

        let exec = executor(secret_config());
        let mut g = grant();
        g.ttl = 0;
        assert!(matches!(g.prepare(&exec.context()), Err(Error::Validation(_))));

        let empty = GrantToken {
            ttl: 10,
            ..GrantToken::default()
        };
        assert!(matches!(empty.prepare(&exec.context()), Err(Error::Validation(_))));

        let mut g = grant();
        g.meta = Some(json!("not an object"));
        assert!(matches!(g.prepare(&exec.context()), Err(Error::Validation(_))));
    }

    #[test]
    fn grant_decode() {
        let exec = executor(secret_config());
        let body = r#"{"status":200,"data":{"message":"Success","token":"p0F2AkF0Gl"},"service":"Access Manager"}"#;
        let out = grant().decode(&response(200, body), &exec.context()).unwrap();
        assert_eq!(out.token, "p0F2AkF0Gl");
    }

    #[test]
    fn revoke_path_uses_token_id() {
        let exec = executor(secret_config());
        let revoke = RevokeToken {
            token: "abc".into(),
        };
        let req = revoke.prepare(&exec.context()).unwrap();
        assert_eq!(req.method, Method::Delete);
        assert_eq!(
            req.path,
            "/v3/pam/sub/grant/ba7816bf8f01cfea414140de5dae2223"
        );
    }
}
