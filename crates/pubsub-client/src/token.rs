//! Access token codec.
//!
//! Tokens are CBOR maps, base64url-encoded:
//!
//! ```text
//! { "v": version, "t": issued-at (unix secs), "ttl": minutes,
//!   "res": { "chan": {name: bits}, "grp": {...}, "uuid": {...} },
//!   "pat": { same shape, keys are patterns },
//!   "meta": {...}, "uuid": authorized uuid, "sig": bytes }
//! ```
//!
//! Map keys may be text or byte strings; both decode the same.

use std::collections::BTreeMap;

use base64::Engine as _;
use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use minicbor::data::Type;
use minicbor::{Decoder, Encoder};
use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};

/// Permission bit positions shared by every resource kind.
pub mod bits {
    pub const READ: u64 = 1;
    pub const WRITE: u64 = 2;
    pub const MANAGE: u64 = 4;
    pub const DELETE: u64 = 8;
    pub const CREATE: u64 = 16;
    pub const GET: u64 = 32;
    pub const UPDATE: u64 = 64;
    pub const JOIN: u64 = 128;
}

fn flag(set: bool, bit: u64) -> u64 {
    if set { bit } else { 0 }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ChannelPermissions {
    pub read: bool,
    pub write: bool,
    pub get: bool,
    pub manage: bool,
    pub update: bool,
    pub join: bool,
    pub delete: bool,
}

impl ChannelPermissions {
    pub fn bits(&self) -> u64 {
        flag(self.read, bits::READ)
            | flag(self.write, bits::WRITE)
            | flag(self.get, bits::GET)
            | flag(self.manage, bits::MANAGE)
            | flag(self.update, bits::UPDATE)
            | flag(self.join, bits::JOIN)
            | flag(self.delete, bits::DELETE)
    }

    pub fn from_bits(value: u64) -> Self {
        Self {
            read: value & bits::READ != 0,
            write: value & bits::WRITE != 0,
            get: value & bits::GET != 0,
            manage: value & bits::MANAGE != 0,
            update: value & bits::UPDATE != 0,
            join: value & bits::JOIN != 0,
            delete: value & bits::DELETE != 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct GroupPermissions {
    pub read: bool,
    pub manage: bool,
}

impl GroupPermissions {
    pub fn bits(&self) -> u64 {
        flag(self.read, bits::READ) | flag(self.manage, bits::MANAGE)
    }

    pub fn from_bits(value: u64) -> Self {
        Self {
            read: value & bits::READ != 0,
            manage: value & bits::MANAGE != 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct UuidPermissions {
    pub get: bool,
    pub update: bool,
    pub delete: bool,
}

impl UuidPermissions {
    pub fn bits(&self) -> u64 {
        flag(self.get, bits::GET) | flag(self.update, bits::UPDATE) | flag(self.delete, bits::DELETE)
    }

    pub fn from_bits(value: u64) -> Self {
        Self {
            get: value & bits::GET != 0,
            update: value & bits::UPDATE != 0,
            delete: value & bits::DELETE != 0,
        }
    }
}

/// A grantable resource and the permissions requested on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resource {
    Channel(ChannelPermissions),
    Group(GroupPermissions),
    Uuid(UuidPermissions),
}

impl Resource {
    pub fn bits(&self) -> u64 {
        match self {
            Self::Channel(p) => p.bits(),
            Self::Group(p) => p.bits(),
            Self::Uuid(p) => p.bits(),
        }
    }
}

// ---------------------------------------------------------------------------
// Decoded token
// ---------------------------------------------------------------------------

/// Raw permission bitmasks keyed by entity name (or pattern).
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct TokenResources {
    pub channels: BTreeMap<String, u64>,
    pub groups: BTreeMap<String, u64>,
    pub uuids: BTreeMap<String, u64>,
}

impl TokenResources {
    pub fn is_empty(&self) -> bool {
        self.channels.is_empty() && self.groups.is_empty() && self.uuids.is_empty()
    }

    pub(crate) fn insert(&mut self, name: String, resource: Resource) {
        let map = match resource {
            Resource::Channel(_) => &mut self.channels,
            Resource::Group(_) => &mut self.groups,
            Resource::Uuid(_) => &mut self.uuids,
        };
        map.insert(name, resource.bits());
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Token {
    pub version: u64,
    /// Issue time, unix seconds.
    pub timestamp: u64,
    /// Lifetime in minutes.
    pub ttl: u64,
    pub resources: TokenResources,
    pub patterns: TokenResources,
    pub meta: Value,
    pub authorized_uuid: Option<String>,
    pub signature: Vec<u8>,
}

impl Token {
    /// Typed view of the exact-name resources.
    pub fn permissions(&self, token: &str) -> PermissionsBody {
        parse_grant_resources(&self.resources, token, self.timestamp, self.ttl)
    }

    /// Typed view of the pattern resources.
    pub fn pattern_permissions(&self, token: &str) -> PermissionsBody {
        parse_grant_resources(&self.patterns, token, self.timestamp, self.ttl)
    }
}

/// Typed permissions for one token, keyed by entity name.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PermissionsBody {
    pub channels: BTreeMap<String, ChannelPermissions>,
    pub groups: BTreeMap<String, GroupPermissions>,
    pub uuids: BTreeMap<String, UuidPermissions>,
    pub token: String,
    pub timestamp: u64,
    pub ttl: u64,
}

pub fn parse_grant_resources(
    resources: &TokenResources,
    token: &str,
    timestamp: u64,
    ttl: u64,
) -> PermissionsBody {
    PermissionsBody {
        channels: resources
            .channels
            .iter()
            .map(|(k, v)| (k.clone(), ChannelPermissions::from_bits(*v)))
            .collect(),
        groups: resources
            .groups
            .iter()
            .map(|(k, v)| (k.clone(), GroupPermissions::from_bits(*v)))
            .collect(),
        uuids: resources
            .uuids
            .iter()
            .map(|(k, v)| (k.clone(), UuidPermissions::from_bits(*v)))
            .collect(),
        token: token.to_string(),
        timestamp,
        ttl,
    }
}

/// Identifier used to revoke `token`: lowercase hex of the first 16 bytes
/// of its SHA-256.
pub fn token_id(token: &str) -> String {
    Sha256::digest(token.as_bytes())
        .iter()
        .take(16)
        .map(|b| format!("{b:02x}"))
        .collect()
}

// ---------------------------------------------------------------------------
// Decoding
// ---------------------------------------------------------------------------

fn token_error(e: impl std::fmt::Display) -> Error {
    Error::Token(e.to_string())
}

/// Decode a token string. Standard and URL-safe alphabets are accepted,
/// with or without padding.
pub fn parse_token(token: &str) -> Result<Token> {
    let normalized: String = token
        .trim()
        .trim_end_matches('=')
        .chars()
        .map(|c| match c {
            '+' => '-',
            '/' => '_',
            other => other,
        })
        .collect();
    if normalized.is_empty() {
        return Err(Error::Token("token is empty".into()));
    }
    let raw = URL_SAFE_NO_PAD.decode(normalized).map_err(token_error)?;
    decode_token(&raw).map_err(token_error)
}

fn decode_token(raw: &[u8]) -> std::result::Result<Token, minicbor::decode::Error> {
    let mut d = Decoder::new(raw);
    let mut token = Token::default();
    let mut saw_version = false;

    for_each_entry(&mut d, |d, key| {
        match key.as_str() {
            "v" => {
                token.version = d.u64()?;
                saw_version = true;
            }
            "t" => token.timestamp = d.u64()?,
            "ttl" => token.ttl = d.u64()?,
            "res" => token.resources = decode_resources(d)?,
            "pat" => token.patterns = decode_resources(d)?,
            "meta" => token.meta = cbor_to_json(d, 0)?,
            "uuid" => token.authorized_uuid = Some(decode_text(d)?),
            "sig" => token.signature = d.bytes()?.to_vec(),
            _ => d.skip()?,
        }
        Ok(())
    })?;

    if !saw_version {
        return Err(minicbor::decode::Error::message("missing field: v"));
    }
    Ok(token)
}

fn decode_resources(
    d: &mut Decoder<'_>,
) -> std::result::Result<TokenResources, minicbor::decode::Error> {
    let mut out = TokenResources::default();
    for_each_entry(d, |d, key| {
        match key.as_str() {
            "chan" => out.channels = decode_bitmasks(d)?,
            "grp" => out.groups = decode_bitmasks(d)?,
            "uuid" => out.uuids = decode_bitmasks(d)?,
            _ => d.skip()?,
        }
        Ok(())
    })?;
    Ok(out)
}

fn decode_bitmasks(
    d: &mut Decoder<'_>,
) -> std::result::Result<BTreeMap<String, u64>, minicbor::decode::Error> {
    let mut out = BTreeMap::new();
    for_each_entry(d, |d, key| {
        out.insert(key, d.u64()?);
        Ok(())
    })?;
    Ok(out)
}

/// Text or byte string, as UTF-8.
fn decode_text(d: &mut Decoder<'_>) -> std::result::Result<String, minicbor::decode::Error> {
    match d.datatype()? {
        Type::String => Ok(d.str()?.to_string()),
        Type::Bytes => String::from_utf8(d.bytes()?.to_vec())
            .map_err(|_| minicbor::decode::Error::message("key is not valid UTF-8")),
        other => Err(minicbor::decode::Error::message(format!(
            "expected string, found {other}"
        ))),
    }
}

/// Visit each entry of a definite or indefinite map with a string key.
fn for_each_entry<'b, F>(
    d: &mut Decoder<'b>,
    mut f: F,
) -> std::result::Result<(), minicbor::decode::Error>
where
    F: FnMut(&mut Decoder<'b>, String) -> std::result::Result<(), minicbor::decode::Error>,
{
    match d.map()? {
        Some(len) => {
            for _ in 0..len {
                let key = decode_text(d)?;
                f(d, key)?;
            }
        }
        None => loop {
            if d.datatype()? == Type::Break {
                d.set_position(d.position() + 1);
                break;
            }
            let key = decode_text(d)?;
            f(d, key)?;
        },
    }
    Ok(())
}

/// Deepest array/map/tag nesting accepted in token meta.
const MAX_META_DEPTH: usize = 32;

/// Convert one CBOR item to JSON. Byte strings become base64 text.
fn cbor_to_json(
    d: &mut Decoder<'_>,
    depth: usize,
) -> std::result::Result<Value, minicbor::decode::Error> {
    if depth > MAX_META_DEPTH {
        return Err(minicbor::decode::Error::message("token meta nesting too deep"));
    }
    let value = match d.datatype()? {
        Type::Null | Type::Undefined => {
            d.skip()?;
            Value::Null
        }
        Type::Bool => Value::Bool(d.bool()?),
        Type::U8 | Type::U16 | Type::U32 | Type::U64 => Value::from(d.u64()?),
        Type::I8 | Type::I16 | Type::I32 | Type::I64 => Value::from(d.i64()?),
        Type::F16 => float(f64::from(d.f16()?)),
        Type::F32 => float(f64::from(d.f32()?)),
        Type::F64 => float(d.f64()?),
        Type::String => Value::String(d.str()?.to_string()),
        Type::Bytes => Value::String(STANDARD.encode(d.bytes()?)),
        Type::Array | Type::ArrayIndef => {
            let mut items = Vec::new();
            match d.array()? {
                Some(len) => {
                    for _ in 0..len {
                        items.push(cbor_to_json(d, depth + 1)?);
                    }
                }
                None => loop {
                    if d.datatype()? == Type::Break {
                        d.set_position(d.position() + 1);
                        break;
                    }
                    items.push(cbor_to_json(d, depth + 1)?);
                },
            }
            Value::Array(items)
        }
        Type::Map | Type::MapIndef => {
            let mut obj = serde_json::Map::new();
            for_each_entry(d, |d, key| {
                obj.insert(key, cbor_to_json(d, depth + 1)?);
                Ok(())
            })?;
            Value::Object(obj)
        }
        Type::Tag => {
            d.tag()?;
            cbor_to_json(d, depth + 1)?
        }
        other => {
            tracing::warn!(cbor_type = %other, "unsupported CBOR item in token meta, substituting null");
            d.skip()?;
            Value::Null
        }
    };
    Ok(value)
}

fn float(f: f64) -> Value {
    serde_json::Number::from_f64(f).map_or(Value::Null, Value::Number)
}

// ---------------------------------------------------------------------------
// Encoding
// ---------------------------------------------------------------------------

type EncodeResult = std::result::Result<(), minicbor::encode::Error<std::convert::Infallible>>;

/// Encode a token as unpadded base64url CBOR.
pub fn encode_token(token: &Token) -> Result<String> {
    let mut e = Encoder::new(Vec::new());
    write_token(&mut e, token).map_err(token_error)?;
    Ok(URL_SAFE_NO_PAD.encode(e.into_writer()))
}

fn write_token(e: &mut Encoder<Vec<u8>>, token: &Token) -> EncodeResult {
    let fields = 7 + u64::from(token.authorized_uuid.is_some());
    e.map(fields)?;
    e.str("v")?.u64(token.version)?;
    e.str("t")?.u64(token.timestamp)?;
    e.str("ttl")?.u64(token.ttl)?;
    e.str("res")?;
    write_resources(e, &token.resources)?;
    e.str("pat")?;
    write_resources(e, &token.patterns)?;
    e.str("meta")?;
    json_to_cbor(e, &token.meta)?;
    if let Some(uuid) = &token.authorized_uuid {
        e.str("uuid")?.str(uuid)?;
    }
    e.str("sig")?.bytes(&token.signature)?;
    Ok(())
}

fn write_resources(e: &mut Encoder<Vec<u8>>, resources: &TokenResources) -> EncodeResult {
    e.map(3)?;
    for (key, map) in [
        ("chan", &resources.channels),
        ("grp", &resources.groups),
        ("uuid", &resources.uuids),
    ] {
        e.str(key)?.map(map.len() as u64)?;
        for (name, bits) in map {
            e.str(name)?.u64(*bits)?;
        }
    }
    Ok(())
}

fn json_to_cbor(e: &mut Encoder<Vec<u8>>, value: &Value) -> EncodeResult {
    match value {
        Value::Null => {
            e.null()?;
        }
        Value::Bool(b) => {
            e.bool(*b)?;
        }
        Value::Number(n) => {
            if let Some(u) = n.as_u64() {
                e.u64(u)?;
            } else if let Some(i) = n.as_i64() {
                e.i64(i)?;
            } else {
                e.f64(n.as_f64().unwrap_or_default())?;
            }
        }
        Value::String(s) => {
            e.str(s)?;
        }
        Value::Array(items) => {
            e.array(items.len() as u64)?;
            for item in items {
                json_to_cbor(e, item)?;
            }
        }
        Value::Object(obj) => {
            e.map(obj.len() as u64)?;
            for (k, v) in obj {
                e.str(k)?;
                json_to_cbor(e, v)?;
            }
        }
    }
    Ok(())
}
