//! Structured event log for sessions and generations.
//!
//! Every line of `events.jsonl` is one compact JSON object that starts with
//! `type`, `session_id` and `ts`, followed by the event's own fields.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use anyhow::{Context, Result};
use chrono::{SecondsFormat, Utc};
use log::warn;
use serde_json::{Map, Value};

/// Fields stamped by the writer. Payload keys with these names are dropped.
pub const RESERVED_FIELDS: [&str; 3] = ["type", "session_id", "ts"];

/// Appends events to one file. The file is opened on the first write and
/// stays open; clones share the handle, so lines from different threads
/// never interleave.
#[derive(Debug, Clone)]
pub struct EventWriter {
    inner: Arc<WriterInner>,
}

#[derive(Debug)]
struct WriterInner {
    path: PathBuf,
    session_id: String,
    file: Mutex<Option<File>>,
}

impl EventWriter {
    pub fn new(path: impl Into<PathBuf>, session_id: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(WriterInner {
                path: path.into(),
                session_id: session_id.into(),
                file: Mutex::new(None),
            }),
        }
    }

    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    pub fn session_id(&self) -> &str {
        &self.inner.session_id
    }

    /// Writes one event and returns the line as written. Object payloads are
    /// merged into the line, `null` adds nothing and any other value is
    /// stored under `value`.
    pub fn write(&self, event_type: &str, payload: Value) -> Result<Value> {
        let mut event = Map::new();
        event.insert("type".to_string(), Value::from(event_type));
        event.insert(
            "session_id".to_string(),
            Value::from(self.inner.session_id.as_str()),
        );
        event.insert("ts".to_string(), Value::from(timestamp()));
        for (key, value) in payload_fields(payload) {
            if !RESERVED_FIELDS.contains(&key.as_str()) {
                event.insert(key, value);
            }
        }

        let mut line = serde_json::to_string(&event)?;
        line.push('\n');

        let mut guard = self
            .inner
            .file
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let file = match guard.take() {
            Some(file) => file,
            None => open_append(&self.inner.path)?,
        };
        guard
            .insert(file)
            .write_all(line.as_bytes())
            .with_context(|| format!("failed writing {}", self.inner.path.display()))?;
        Ok(Value::Object(event))
    }
}

/// Where a component sends its events: nowhere, or a writer plus fields
/// stamped onto every event. Write failures are logged as warnings.
#[derive(Debug, Clone, Default)]
pub struct EventSink {
    writer: Option<EventWriter>,
    fields: Map<String, Value>,
}

impl EventSink {
    pub fn disabled() -> Self {
        Self::default()
    }

    pub fn is_enabled(&self) -> bool {
        self.writer.is_some()
    }

    pub fn writer(&self) -> Option<&EventWriter> {
        self.writer.as_ref()
    }

    /// A sink on the same writer that also stamps `fields` on each event.
    /// Fields given at emit time take precedence.
    pub fn with_fields(&self, fields: Value) -> Self {
        let mut scoped = self.clone();
        scoped.fields.extend(payload_fields(fields));
        scoped
    }

    pub fn emit(&self, event_type: &str, payload: Value) {
        let Some(writer) = self.writer.as_ref() else {
            return;
        };
        let mut merged = self.fields.clone();
        merged.extend(payload_fields(payload));
        if let Err(err) = writer.write(event_type, Value::Object(merged)) {
            warn!(
                "dropped {event_type} event for {}: {err:#}",
                writer.path().display()
            );
        }
    }
}

impl From<EventWriter> for EventSink {
    fn from(writer: EventWriter) -> Self {
        Self {
            writer: Some(writer),
            fields: Map::new(),
        }
    }
}

impl From<Option<EventWriter>> for EventSink {
    fn from(writer: Option<EventWriter>) -> Self {
        writer.map(Self::from).unwrap_or_default()
    }
}

fn payload_fields(payload: Value) -> Map<String, Value> {
    match payload {
        Value::Object(map) => map,
        Value::Null => Map::new(),
        other => Map::from_iter([("value".to_string(), other)]),
    }
}

fn open_append(path: &Path) -> Result<File> {
    if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("failed to open {}", path.display()))
}

fn timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}
