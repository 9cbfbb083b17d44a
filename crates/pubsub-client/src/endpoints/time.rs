//! `GET /time/0`.

use crate::error::{Error, Result};
use crate::request::{
    Endpoint, PreparedRequest, RequestBuilder, RequestContext, decode_json, parse_timetoken,
};
use crate::status::Operation;
use crate::transport::HttpResponse;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeResponse {
    pub timetoken: i64,
}

#[derive(Debug, Default)]
pub struct Time;

pub type TimeBuilder = RequestBuilder<Time>;

impl Endpoint for Time {
    type Output = TimeResponse;

    fn operation(&self) -> Operation {
        Operation::Time
    }

    fn prepare(&self, _ctx: &RequestContext<'_>) -> Result<PreparedRequest> {
        Ok(PreparedRequest::get("/time/0".to_string()))
    }

    fn decode(&self, response: &HttpResponse, _ctx: &RequestContext<'_>) -> Result<TimeResponse> {
        let body: Vec<serde_json::Value> = decode_json(&response.body)?;
        let timetoken = body
            .first()
            .and_then(parse_timetoken)
            .ok_or_else(|| Error::decoding("time response has no timetoken"))?;
        Ok(TimeResponse { timetoken })
    }
}
