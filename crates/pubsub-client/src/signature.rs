//! URL component encoding and request signing.

use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use hmac::{Hmac, Mac};
use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, utf8_percent_encode};
use sha2::Sha256;

use crate::error::{Error, Result};
use crate::transport::Method;

type HmacSha256 = Hmac<Sha256>;

/// Everything except the RFC 3986 unreserved set is escaped, including `/`
/// and `,` inside channel names.
const COMPONENT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'.')
    .remove(b'_')
    .remove(b'~');

pub(crate) fn encode_component(s: &str) -> String {
    utf8_percent_encode(s, COMPONENT).to_string()
}

/// Encode each name and join with the `,` list separator. An empty list
/// renders as a lone `,`, which the service reads as "no channels".
pub(crate) fn encode_list(names: &[String]) -> String {
    if names.is_empty() {
        return ",".to_string();
    }
    names
        .iter()
        .map(|n| encode_component(n))
        .collect::<Vec<_>>()
        .join(",")
}

// ---------------------------------------------------------------------------
// Query string
// ---------------------------------------------------------------------------

/// Unencoded query pairs. Rendering sorts by key so the same pairs always
/// produce the same canonical string.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Query {
    pairs: Vec<(String, String)>,
}

impl Query {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, key: &str, value: impl Into<String>) -> &mut Self {
        self.pairs.push((key.to_string(), value.into()));
        self
    }

    pub fn push_opt(&mut self, key: &str, value: Option<impl Into<String>>) -> &mut Self {
        if let Some(v) = value {
            self.push(key, v);
        }
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.pairs
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn to_canonical_string(&self) -> String {
        let mut sorted: Vec<&(String, String)> = self.pairs.iter().collect();
        sorted.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.cmp(&b.1)));
        sorted
            .into_iter()
            .map(|(k, v)| format!("{}={}", encode_component(k), encode_component(v)))
            .collect::<Vec<_>>()
            .join("&")
    }
}

// ---------------------------------------------------------------------------
// Signing
// ---------------------------------------------------------------------------

/// Sign a canonical request with HMAC-SHA256 and render it as
/// `v2.<base64url without padding>`.
///
/// The signed text is `METHOD\npublish_key\npath\ncanonical_query\nbody`.
/// `query` must already contain `timestamp` and must not contain
/// `signature`.
pub(crate) fn sign_request(
    secret_key: &str,
    method: Method,
    publish_key: &str,
    path: &str,
    query: &Query,
    body: Option<&[u8]>,
) -> Result<String> {
    let mut plain = format!(
        "{method}\n{publish_key}\n{path}\n{}\n",
        query.to_canonical_string()
    );
    if let Some(body) = body {
        plain.push_str(&String::from_utf8_lossy(body));
    }
    let mut mac = HmacSha256::new_from_slice(secret_key.as_bytes())
        .map_err(|e| Error::validation(format!("secret key: {e}")))?;
    mac.update(plain.as_bytes());
    Ok(format!("v2.{}", URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes())))
}
