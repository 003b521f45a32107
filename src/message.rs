//! The message envelope moved across the bridge in either direction.
//!
//! A [`BridgedMessage`] is an opaque payload plus a string-keyed metadata map. On MQTT v5
//! the metadata maps to user properties, which is where the `traceparent` token travels.

use std::collections::HashMap;
use std::fmt;

use bytes::Bytes;

/// Metadata key holding the trace-context token, both directions.
pub const TRACEPARENT: &str = "traceparent";

/// Metadata key holding the destination topic of an outbound message.
///
/// The broker client consumes it as the publish topic; it is not forwarded to the peer.
pub const DESTINATION_TOPIC: &str = "mqtt_topic";

/// A metadata value.
///
/// Transports can attach non-text values (binary correlation data, numeric properties),
/// so readers match on the variant instead of assuming text.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum HeaderValue {
    /// UTF-8 text
    Text(String),
    /// Raw bytes
    Binary(Bytes),
    /// Unsigned integer property
    Integer(u64),
}

impl HeaderValue {
    /// The text content, if this is a text value.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            HeaderValue::Text(text) => Some(text),
            HeaderValue::Binary(_) | HeaderValue::Integer(_) => None,
        }
    }
}

impl fmt::Display for HeaderValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HeaderValue::Text(text) => f.write_str(text),
            HeaderValue::Binary(bytes) => write!(f, "<{} bytes>", bytes.len()),
            HeaderValue::Integer(value) => write!(f, "{value}"),
        }
    }
}

impl From<String> for HeaderValue {
    fn from(value: String) -> Self {
        HeaderValue::Text(value)
    }
}

impl From<&str> for HeaderValue {
    fn from(value: &str) -> Self {
        HeaderValue::Text(value.to_string())
    }
}

impl From<Bytes> for HeaderValue {
    fn from(value: Bytes) -> Self {
        HeaderValue::Binary(value)
    }
}

impl From<u64> for HeaderValue {
    fn from(value: u64) -> Self {
        HeaderValue::Integer(value)
    }
}

/// Message metadata.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Headers(HashMap<String, HeaderValue>);

impl Headers {
    /// Empty metadata.
    pub fn new() -> Self {
        Self::default()
    }

    /// Looks up a value by key.
    pub fn get(&self, key: &str) -> Option<&HeaderValue> {
        self.0.get(key)
    }

    /// Sets `key`, replacing any previous value.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<HeaderValue>) {
        self.0.insert(key.into(), value.into());
    }

    /// Removes and returns the value under `key`.
    pub fn remove(&mut self, key: &str) -> Option<HeaderValue> {
        self.0.remove(key)
    }

    /// Copies every entry of `other` into `self`, overwriting shared keys.
    pub fn extend_from(&mut self, other: &Headers) {
        self.0
            .extend(other.0.iter().map(|(k, v)| (k.clone(), v.clone())));
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// True when no metadata is attached.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterates entries in no particular order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &HeaderValue)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v))
    }
}

impl<K, V> FromIterator<(K, V)> for Headers
where
    K: Into<String>,
    V: Into<HeaderValue>,
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(
            iter.into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }
}

/// One transport message: payload plus metadata.
///
/// Owned by whichever bridge direction is processing it.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BridgedMessage {
    /// Opaque payload.
    pub payload: Bytes,
    /// Metadata, including [`TRACEPARENT`] when the producer was traced.
    pub headers: Headers,
}

impl BridgedMessage {
    /// A message with `payload` and no metadata.
    pub fn new(payload: impl Into<Bytes>) -> Self {
        Self {
            payload: payload.into(),
            headers: Headers::new(),
        }
    }

    /// Builder-style header setter.
    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<HeaderValue>) -> Self {
        self.headers.insert(key, value);
        self
    }

    /// The destination topic of an outbound message, if it is set as text.
    pub fn topic(&self) -> Option<&str> {
        self.headers
            .get(DESTINATION_TOPIC)
            .and_then(HeaderValue::as_text)
    }

    /// Payload as UTF-8, lossily.
    pub fn payload_text(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.payload)
    }
}
