//! Protocol message types

use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

/// Envelope carried by every frame
///
/// Exactly one variant per frame. `Failure` sits after the five base variants
/// so that their bincode tags stay stable for peers that never send it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum Packet {
    /// First packet a tunnel client sends: declares its service name.
    /// `key` is empty when the client has no shared key configured.
    Handshake { service: String, key: String },
    /// Keepalive, milliseconds since the Unix epoch
    Ping { time: i64 },
    /// Reply to `Ping`, echoing its timestamp
    Pong { time: i64 },
    Request(TunnelRequest),
    Response(TunnelResponse),
    /// Handler failure for a request (only sent by clients that opt in)
    Failure {
        id: u64,
        name: String,
        message: String,
    },
}

impl Packet {
    pub fn handshake(service: impl Into<String>, key: Option<&str>) -> Self {
        Packet::Handshake {
            service: service.into(),
            key: key.unwrap_or_default().to_string(),
        }
    }

    pub fn ping() -> Self {
        Packet::Ping { time: now_millis() }
    }

    /// Short variant name for log lines
    pub fn kind(&self) -> &'static str {
        match self {
            Packet::Handshake { .. } => "handshake",
            Packet::Ping { .. } => "ping",
            Packet::Pong { .. } => "pong",
            Packet::Request(_) => "request",
            Packet::Response(_) => "response",
            Packet::Failure { .. } => "failure",
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(bytes)
    }
}

/// One header name with all of its values, in arrival order
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HeaderField {
    pub key: String,
    pub values: Vec<String>,
}

impl HeaderField {
    pub fn new(key: impl Into<String>, values: Vec<String>) -> Self {
        Self {
            key: key.into(),
            values,
        }
    }
}

/// First value of a header, matched case-insensitively
pub fn header_value<'a>(headers: &'a [HeaderField], key: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|h| h.key.eq_ignore_ascii_case(key))
        .and_then(|h| h.values.first())
        .map(String::as_str)
}

/// HTTP request forwarded from the gateway to a tunnel client
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct TunnelRequest {
    /// Correlation id, unique among the origin's outstanding requests
    pub id: u64,
    /// Target service name
    pub name: String,
    pub method: String,
    /// Path and query as received by the gateway
    pub url: String,
    pub headers: Vec<HeaderField>,
    pub host: String,
    pub remote_addr: String,
    /// -1 when unknown
    pub content_length: i64,
    #[serde(with = "serde_bytes")]
    pub body: Vec<u8>,
}

impl TunnelRequest {
    pub fn new(
        id: u64,
        name: impl Into<String>,
        method: impl Into<String>,
        url: impl Into<String>,
    ) -> Self {
        Self {
            id,
            name: name.into(),
            method: method.into(),
            url: url.into(),
            ..Default::default()
        }
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        push_header(&mut self.headers, key.into(), value.into());
        self
    }

    pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = body.into();
        self.content_length = self.body.len() as i64;
        self
    }

    pub fn header(&self, key: &str) -> Option<&str> {
        header_value(&self.headers, key)
    }
}

/// Response produced by a tunnel client for one `TunnelRequest`
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct TunnelResponse {
    /// Copied from the request it answers
    pub id: u64,
    /// Copied from the request it answers
    pub name: String,
    pub status_code: i32,
    pub content_length: i64,
    pub headers: Vec<HeaderField>,
    #[serde(with = "serde_bytes")]
    pub body: Vec<u8>,
}

impl TunnelResponse {
    pub fn new(status_code: i32) -> Self {
        Self {
            status_code,
            ..Default::default()
        }
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        push_header(&mut self.headers, key.into(), value.into());
        self
    }

    pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = body.into();
        self.content_length = self.body.len() as i64;
        self
    }

    /// Stamp the correlation fields of `request` onto this response
    pub fn answering(mut self, request: &TunnelRequest) -> Self {
        self.id = request.id;
        self.name = request.name.clone();
        self
    }

    pub fn header(&self, key: &str) -> Option<&str> {
        header_value(&self.headers, key)
    }
}

fn push_header(headers: &mut Vec<HeaderField>, key: String, value: String) {
    match headers.iter_mut().find(|h| h.key == key) {
        Some(field) => field.values.push(value),
        None => headers.push(HeaderField::new(key, vec![value])),
    }
}

/// Milliseconds since the Unix epoch, as carried by ping/pong
pub fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or_default()
}

mod serde_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(data: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_bytes(data)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        Vec::<u8>::deserialize(deserializer)
    }
}
