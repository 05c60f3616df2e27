//! Broker frames and their headers.
//!
//! A [`Message`] is one unit exchanged with the broker: an ordered header map
//! plus an opaque body. Messages are immutable once received; everything the
//! relay learns about a frame (which subscription it belongs to, whether it is
//! a probe, where replies go) is read out of the headers.

use serde::{Deserialize, Serialize};

/// Header naming the subscription a frame was delivered on.
pub const HDR_SUBSCRIPTION: &str = "subscription";
/// Header carrying the broker-assigned message id used for acks.
pub const HDR_MESSAGE_ID: &str = "message-id";
/// Header naming the destination to reply to.
pub const HDR_REPLY_TO: &str = "reply-to";
/// Header naming the destination a queued outbound entry is sent to.
pub const HDR_DESTINATION: &str = "destination";
/// Marker header identifying a self-addressed monitoring probe.
pub const HDR_PROBE: &str = "relay-probe";
/// Header carrying the probing client's identity.
pub const HDR_PROBE_CLIENT: &str = "relay-client";
/// Header stamped onto probe echoes with the reply time (unix seconds).
pub const HDR_TIMESTAMP: &str = "timestamp";

/// An insertion-ordered header map with unique keys.
///
/// Broker headers are ordered on the wire, so this type preserves insertion
/// order while enforcing key uniqueness: inserting an existing key replaces
/// its value in place. Serializes as a sequence of `[key, value]` pairs, which
/// round-trips both order and content exactly.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Headers(Vec<(String, String)>);

impl Headers {
    /// Creates an empty header map.
    #[must_use]
    pub const fn new() -> Self {
        Self(Vec::new())
    }

    /// Inserts a header, replacing any existing value for the key in place.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();
        if let Some(slot) = self.0.iter_mut().find(|(k, _)| *k == key) {
            slot.1 = value;
        } else {
            self.0.push((key, value));
        }
    }

    /// Returns the value for a key, if present.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Removes a header, returning its value if it was present.
    pub fn remove(&mut self, key: &str) -> Option<String> {
        let idx = self.0.iter().position(|(k, _)| k == key)?;
        Some(self.0.remove(idx).1)
    }

    /// Returns true if the key is present.
    #[must_use]
    pub fn contains_key(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    /// Iterates headers in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Number of headers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns true if there are no headers.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Headers {
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        let mut headers = Self::new();
        for (k, v) in iter {
            headers.insert(k, v);
        }
        headers
    }
}

/// One frame exchanged with the broker.
///
/// Immutable once constructed: the dispatch path only reads from it, and the
/// error-filing path serializes it whole so the original can be replayed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    headers: Headers,
    #[serde(with = "hex_body")]
    body: Vec<u8>,
}

impl Message {
    /// Builds a message from headers and a body.
    #[must_use]
    pub fn new(headers: Headers, body: Vec<u8>) -> Self {
        Self { headers, body }
    }

    /// The frame headers.
    #[must_use]
    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    /// The frame body.
    #[must_use]
    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// The subscription this frame was delivered on, if the broker said.
    #[must_use]
    pub fn subscription(&self) -> Option<&str> {
        self.headers.get(HDR_SUBSCRIPTION)
    }

    /// The broker-assigned message id, used to ack the frame.
    #[must_use]
    pub fn message_id(&self) -> Option<&str> {
        self.headers.get(HDR_MESSAGE_ID)
    }

    /// The destination replies should be sent to.
    #[must_use]
    pub fn reply_to(&self) -> Option<&str> {
        self.headers.get(HDR_REPLY_TO)
    }

    /// Returns true if this frame is a self-addressed monitoring probe.
    ///
    /// Probes carry the probe marker plus our own client identity; frames
    /// probing some other relay instance are not ours to answer.
    #[must_use]
    pub fn is_probe_for(&self, client_id: &str) -> bool {
        self.headers.contains_key(HDR_PROBE)
            && self.headers.get(HDR_PROBE_CLIENT) == Some(client_id)
    }
}

/// Body bytes as a hex string, so envelopes stay printable and lossless.
mod hex_body {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(body: &[u8], ser: S) -> Result<S::Ok, S::Error> {
        ser.serialize_str(&hex::encode(body))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(de)?;
        hex::decode(&s).map_err(serde::de::Error::custom)
    }
}
