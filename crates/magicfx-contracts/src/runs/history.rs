use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

pub const HISTORY_SCHEMA_VERSION: u64 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    #[serde(default = "default_schema_version")]
    pub schema_version: u64,
    pub id: String,
    pub ts: String,
    pub effect_id: String,
    pub model_id: String,
    pub endpoint: String,
    pub seed: Option<u64>,
    pub prompt: Option<String>,
    pub input_file: Option<String>,
    pub input_sha256: Option<String>,
    pub result: Value,
}

impl HistoryEntry {
    pub fn new(effect_id: &str, model_id: &str, endpoint: &str, result: Value) -> Self {
        Self {
            schema_version: HISTORY_SCHEMA_VERSION,
            id: Uuid::new_v4().to_string(),
            ts: now_utc_iso(),
            effect_id: effect_id.to_string(),
            model_id: model_id.to_string(),
            endpoint: endpoint.to_string(),
            seed: None,
            prompt: None,
            input_file: None,
            input_sha256: None,
            result,
        }
    }

    /// The result as a displayable string, when it is one.
    pub fn result_text(&self) -> Option<&str> {
        self.result
            .as_str()
            .or_else(|| self.result.get("url").and_then(Value::as_str))
    }
}

/// Append-only JSONL log of successful generations.
#[derive(Debug, Clone)]
pub struct HistoryStore {
    path: PathBuf,
}

impl HistoryStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&self, entry: &HistoryEntry) -> anyhow::Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let line = serde_json::to_string(entry)?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        file.write_all(line.as_bytes())?;
        file.write_all(b"\n")?;
        Ok(())
    }

    /// Entries oldest first. Unreadable lines are skipped; a missing file is empty.
    pub fn load(&self) -> Vec<HistoryEntry> {
        let Ok(raw) = std::fs::read_to_string(&self.path) else {
            return Vec::new();
        };
        raw.lines()
            .filter(|line| !line.trim().is_empty())
            .filter_map(|line| serde_json::from_str::<HistoryEntry>(line).ok())
            .collect()
    }

    pub fn recent(&self, limit: usize) -> Vec<HistoryEntry> {
        let mut entries = self.load();
        entries.reverse();
        entries.truncate(limit);
        entries
    }
}

fn default_schema_version() -> u64 {
    HISTORY_SCHEMA_VERSION
}

fn now_utc_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, false)
}
