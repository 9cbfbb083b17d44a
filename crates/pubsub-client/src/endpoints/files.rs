//! `GET /v1/files/{sub}/channels/{channel}/files`.

use serde::Deserialize;

use crate::endpoints::{require_non_empty, require_subscribe_key};
use crate::error::Result;
use crate::request::{Endpoint, PreparedRequest, RequestBuilder, RequestContext, decode_json};
use crate::signature::{Query, encode_component};
use crate::status::Operation;
use crate::transport::HttpResponse;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct FileInfo {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub size: u64,
    #[serde(default)]
    pub created: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Deserialize)]
pub struct ListFilesResponse {
    #[serde(default)]
    pub data: Vec<FileInfo>,
    /// Page cursor for the next call, absent on the last page.
    #[serde(default)]
    pub next: Option<String>,
    #[serde(default)]
    pub count: u64,
}

#[derive(Debug, Clone, Default)]
pub struct ListFiles {
    pub(crate) channel: String,
    pub(crate) limit: Option<u32>,
    pub(crate) next: Option<String>,
}

pub type ListFilesBuilder = RequestBuilder<ListFiles>;

impl ListFilesBuilder {
    pub fn channel(mut self, channel: impl Into<String>) -> Self {
        self.endpoint.channel = channel.into();
        self
    }

    pub fn limit(mut self, limit: u32) -> Self {
        self.endpoint.limit = Some(limit);
        self
    }

    pub fn next(mut self, cursor: impl Into<String>) -> Self {
        self.endpoint.next = Some(cursor.into());
        self
    }
}

impl Endpoint for ListFiles {
    type Output = ListFilesResponse;

    fn operation(&self) -> Operation {
        Operation::ListFiles
    }

    fn prepare(&self, ctx: &RequestContext<'_>) -> Result<PreparedRequest> {
        let sub_key = require_subscribe_key(ctx)?;
        require_non_empty(&self.channel, "channel")?;

        let mut query = Query::new();
        query.push_opt("limit", self.limit.map(|l| l.to_string()));
        query.push_opt("next", self.next.clone());

        let path = format!(
            "/v1/files/{}/channels/{}/files",
            encode_component(sub_key),
            encode_component(&self.channel)
        );
        Ok(PreparedRequest::get(path)
            .with_query(query)
            .with_targets(std::slice::from_ref(&self.channel), &[]))
    }

    fn decode(&self, response: &HttpResponse, _ctx: &RequestContext<'_>) -> Result<ListFilesResponse> {
        decode_json(&response.body)
    }
}
