use std::env;
use std::path::PathBuf;

pub const DEFAULT_HUB_BASE: &str = "https://huggingface.co";

/// Process-wide settings. Read from the environment once at startup:
///
/// - `MAGICFX_USE_PROXY` (default off): honor system proxy variables
/// - `MAGICFX_ENABLE_HISTORY` (default on): append generations to the history file
/// - `MAGICFX_HUB_BASE`: hub used to resolve `owner/name` targets
/// - `MAGICFX_HISTORY_PATH`: history file location
/// - `HF_TOKEN` (or `HUGGING_FACE_HUB_TOKEN`): bearer token for private Spaces
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub use_proxy: bool,
    pub enable_history: bool,
    pub hub_base: String,
    pub hub_token: Option<String>,
    pub history_path: Option<PathBuf>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            use_proxy: false,
            enable_history: true,
            hub_base: DEFAULT_HUB_BASE.to_string(),
            hub_token: None,
            history_path: None,
        }
    }
}

impl Settings {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let non_empty = |key: &str| {
            lookup(key)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };
        let defaults = Self::default();
        Self {
            use_proxy: non_empty("MAGICFX_USE_PROXY")
                .and_then(|value| parse_flag(&value))
                .unwrap_or(defaults.use_proxy),
            enable_history: non_empty("MAGICFX_ENABLE_HISTORY")
                .and_then(|value| parse_flag(&value))
                .unwrap_or(defaults.enable_history),
            hub_base: non_empty("MAGICFX_HUB_BASE")
                .map(|value| value.trim_end_matches('/').to_string())
                .unwrap_or(defaults.hub_base),
            hub_token: non_empty("HF_TOKEN").or_else(|| non_empty("HUGGING_FACE_HUB_TOKEN")),
            history_path: non_empty("MAGICFX_HISTORY_PATH").map(PathBuf::from),
        }
    }

    /// Where history goes, or `None` when history is disabled.
    pub fn history_file(&self) -> Option<PathBuf> {
        if !self.enable_history {
            return None;
        }
        if let Some(path) = &self.history_path {
            return Some(path.clone());
        }
        let home = env::var_os("HOME").or_else(|| env::var_os("USERPROFILE"))?;
        Some(PathBuf::from(home).join(".magicfx").join("history.jsonl"))
    }
}

fn parse_flag(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
