//! Dead-letter envelopes and the durable error sink.
//!
//! When a frame cannot be handled or an outbound entry exhausts its retries,
//! the relay wraps the original message in an [`ErrorEnvelope`] and files it
//! to an [`ErrorSink`] for offline inspection or replay. Envelopes are written
//! once and never re-read by the relay itself.

use std::fs;
use std::path::PathBuf;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::message::{Headers, Message};

/// Errors from the error-filing sink.
#[derive(Debug, Error)]
pub enum SinkError {
    /// The sink backend rejected or failed the write.
    #[error("error sink write failed: {0}")]
    Write(String),
}

/// Which engine filed the envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Component {
    /// Inbound dispatch could not hand the frame to a handler.
    Dispatch,
    /// Outbound delivery exhausted its retries.
    Delivery,
}

impl std::fmt::Display for Component {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Dispatch => write!(f, "dispatch"),
            Self::Delivery => write!(f, "delivery"),
        }
    }
}

/// A dead-lettered message with enough context to inspect or replay it.
///
/// The embedded original round-trips headers and body exactly; parsing the
/// serialized envelope back reproduces the message byte for byte.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorEnvelope {
    /// Host the relay was running on.
    pub host: String,
    /// When the envelope was filed.
    pub timestamp: DateTime<Utc>,
    /// Why the message could not be processed.
    pub reason: String,
    /// Which engine filed it.
    pub component: Component,
    /// The original message, unmodified.
    pub original: Message,
}

impl ErrorEnvelope {
    /// Wraps a message, stamping the current time.
    #[must_use]
    pub fn new(
        host: impl Into<String>,
        component: Component,
        reason: impl Into<String>,
        original: Message,
    ) -> Self {
        Self {
            host: host.into(),
            timestamp: Utc::now(),
            reason: reason.into(),
            component,
            original,
        }
    }

    /// Serializes the envelope for the sink.
    pub fn to_bytes(&self) -> Result<Vec<u8>, SinkError> {
        serde_json::to_vec(self).map_err(|e| SinkError::Write(e.to_string()))
    }

    /// Parses an envelope back from its serialized form.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, SinkError> {
        serde_json::from_slice(bytes).map_err(|e| SinkError::Write(e.to_string()))
    }
}

/// Durable filing sink for dead-lettered messages.
pub trait ErrorSink: Send {
    /// Appends one serialized envelope under the given destination.
    fn add_message(
        &self,
        destination: &str,
        headers: &Headers,
        body: &[u8],
    ) -> Result<(), SinkError>;
}

/// Files an envelope, logging instead of propagating sink failures.
///
/// Filing is best-effort: a broken sink must not take down a dispatch or
/// delivery cycle that is otherwise making progress.
pub fn file_envelope(sink: &dyn ErrorSink, destination: &str, envelope: &ErrorEnvelope) {
    let bytes = match envelope.to_bytes() {
        Ok(b) => b,
        Err(e) => {
            tracing::warn!(component = %envelope.component, error = %e, "could not serialize error envelope");
            return;
        }
    };
    if let Err(e) = sink.add_message(destination, envelope.original.headers(), &bytes) {
        tracing::warn!(
            component = %envelope.component,
            destination,
            error = %e,
            "could not file error envelope"
        );
    }
}

/// In-memory sink for tests and embedded use.
#[derive(Debug, Default)]
pub struct MemorySink {
    records: Mutex<Vec<(String, Headers, Vec<u8>)>>,
}

impl MemorySink {
    /// Creates an empty sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of filed records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.lock().map(|r| r.len()).unwrap_or(0)
    }

    /// Returns true if nothing has been filed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drains and returns all filed records.
    pub fn take(&self) -> Vec<(String, Headers, Vec<u8>)> {
        self.records
            .lock()
            .map(|mut r| std::mem::take(&mut *r))
            .unwrap_or_default()
    }
}

impl ErrorSink for MemorySink {
    fn add_message(
        &self,
        destination: &str,
        headers: &Headers,
        body: &[u8],
    ) -> Result<(), SinkError> {
        let mut records = self
            .records
            .lock()
            .map_err(|_| SinkError::Write("poisoned sink lock".to_string()))?;
        records.push((destination.to_string(), headers.clone(), body.to_vec()));
        Ok(())
    }
}

/// Directory-backed sink: one JSON file per envelope.
///
/// Destinations map to subdirectories; filenames embed the filing time and a
/// random suffix so writers never collide. The relay never reads these back.
#[derive(Debug)]
pub struct DirSink {
    root: PathBuf,
}

impl DirSink {
    /// Opens (creating if needed) a sink rooted at `root`.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, SinkError> {
        let root = root.into();
        fs::create_dir_all(&root).map_err(|e| SinkError::Write(e.to_string()))?;
        Ok(Self { root })
    }

    fn destination_dir(&self, destination: &str) -> PathBuf {
        // Destinations look like broker paths ("/queue/errors"); flatten them
        // into a single safe directory name.
        let safe: String = destination
            .chars()
            .map(|c| if c.is_alphanumeric() || c == '-' || c == '.' { c } else { '_' })
            .collect();
        self.root.join(safe)
    }
}

impl ErrorSink for DirSink {
    fn add_message(
        &self,
        destination: &str,
        _headers: &Headers,
        body: &[u8],
    ) -> Result<(), SinkError> {
        let dir = self.destination_dir(destination);
        fs::create_dir_all(&dir).map_err(|e| SinkError::Write(e.to_string()))?;

        let name = format!("{}-{}.json", Utc::now().timestamp(), Uuid::new_v4().as_simple());
        let tmp = dir.join(format!(".{name}.tmp"));
        let path = dir.join(name);

        fs::write(&tmp, body).map_err(|e| SinkError::Write(e.to_string()))?;
        fs::rename(&tmp, &path).map_err(|e| SinkError::Write(e.to_string()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_message() -> Message {
        let headers: Headers = [("subscription", "disk-usage"), ("message-id", "m-1")]
            .into_iter()
            .collect();
        Message::new(headers, vec![0u8, 7, 255, 3])
    }

    #[test]
    fn test_envelope_round_trip_reproduces_original_exactly() {
        let msg = sample_message();
        let env = ErrorEnvelope::new("host-1", Component::Dispatch, "no such handler", msg.clone());

        let bytes = env.to_bytes().unwrap();
        let back = ErrorEnvelope::from_bytes(&bytes).unwrap();

        assert_eq!(back.original, msg);
        assert_eq!(back.reason, "no such handler");
        assert_eq!(back.component, Component::Dispatch);
        assert_eq!(back.host, "host-1");
    }

    #[test]
    fn test_memory_sink_records_in_order() {
        let sink = MemorySink::new();
        let msg = sample_message();
        let env = ErrorEnvelope::new("h", Component::Delivery, "send failed", msg);

        file_envelope(&sink, "/queue/errors", &env);
        file_envelope(&sink, "/queue/errors", &env);

        let records = sink.take();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].0, "/queue/errors");
        let parsed = ErrorEnvelope::from_bytes(&records[0].2).unwrap();
        assert_eq!(parsed.reason, "send failed");
    }

    #[test]
    fn test_dir_sink_writes_one_file_per_envelope() {
        let dir = tempfile::tempdir().unwrap();
        let sink = DirSink::open(dir.path().join("errors")).unwrap();
        let env = ErrorEnvelope::new("h", Component::Dispatch, "bad frame", sample_message());

        sink.add_message("/queue/errors", env.original.headers(), &env.to_bytes().unwrap())
            .unwrap();

        let sub = dir.path().join("errors").join("_queue_errors");
        let files: Vec<_> = fs::read_dir(&sub).unwrap().collect();
        assert_eq!(files.len(), 1);

        let body = fs::read(files[0].as_ref().unwrap().path()).unwrap();
        let parsed = ErrorEnvelope::from_bytes(&body).unwrap();
        assert_eq!(parsed.reason, "bad frame");
    }

    #[test]
    fn test_component_display() {
        assert_eq!(Component::Dispatch.to_string(), "dispatch");
        assert_eq!(Component::Delivery.to_string(), "delivery");
    }
}
