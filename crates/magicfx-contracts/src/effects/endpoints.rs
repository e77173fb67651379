use std::fmt;

use serde::{Deserialize, Serialize};

/// A remote operation reference: an API name such as `/infer`, or the
/// positional index of the function on the remote app.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndpointRef {
    Named(String),
    Index(u32),
}

impl EndpointRef {
    pub fn named(name: &str) -> Self {
        let trimmed = name.trim();
        if trimmed.starts_with('/') {
            Self::Named(trimmed.to_string())
        } else {
            Self::Named(format!("/{trimmed}"))
        }
    }

    /// Parses `#3` or `3` as an index, anything else as a name.
    pub fn parse(raw: &str) -> Option<Self> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return None;
        }
        let digits = trimmed.strip_prefix('#').unwrap_or(trimmed);
        if let Ok(index) = digits.parse::<u32>() {
            return Some(Self::Index(index));
        }
        if trimmed.starts_with('#') || trimmed == "/" {
            return None;
        }
        Some(Self::named(trimmed))
    }

    /// The API name without its leading slash, when this is a named endpoint.
    pub fn api_name(&self) -> Option<&str> {
        match self {
            Self::Named(name) => Some(name.trim_start_matches('/')),
            Self::Index(_) => None,
        }
    }
}

impl fmt::Display for EndpointRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Named(name) => write!(f, "{name}"),
            Self::Index(index) => write!(f, "#{index}"),
        }
    }
}
