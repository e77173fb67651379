use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use log::{debug, info};
use magicfx_contracts::effects::EndpointRef;
use magicfx_contracts::settings::Settings;
use reqwest::blocking::multipart::{Form as MultipartForm, Part as MultipartPart};
use reqwest::blocking::{Client as HttpClient, RequestBuilder, Response as HttpResponse};
use serde_json::{json, Map, Value};

use crate::transport::{Argument, RemoteConnection, RemoteTransport};

/// Talks to Gradio apps over HTTP, the way the hosted Spaces expose them.
///
/// `owner/name` targets are resolved to their host through the hub API;
/// `http(s)://` targets are used as-is.
#[derive(Debug, Clone)]
pub struct GradioTransport {
    http: HttpClient,
    hub_base: String,
    token: Option<String>,
}

impl GradioTransport {
    pub fn new(settings: &Settings) -> Result<Self> {
        let mut builder = HttpClient::builder()
            .user_agent(concat!("magicfx/", env!("CARGO_PKG_VERSION")))
            .connect_timeout(Duration::from_secs(30))
            // Cold Spaces can take minutes to answer; calls are not time-limited.
            .timeout(None::<Duration>);
        if !settings.use_proxy {
            builder = builder.no_proxy();
        }
        Ok(Self {
            http: builder.build().context("failed building HTTP client")?,
            hub_base: settings.hub_base.trim_end_matches('/').to_string(),
            token: settings.hub_token.clone(),
        })
    }

    fn resolve_host(&self, target: &str) -> Result<String> {
        let trimmed = target.trim();
        if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
            return Ok(trimmed.trim_end_matches('/').to_string());
        }
        let url = format!("{}/api/spaces/{}/host", self.hub_base, trimmed);
        let response = authorize(self.http.get(&url), self.token.as_deref())
            .send()
            .with_context(|| format!("Space host lookup failed ({url})"))?;
        let payload = response_json_or_error("Space host lookup", response)?;
        let Some(host) = payload
            .get("host")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|value| !value.is_empty())
        else {
            bail!("Space '{trimmed}' has no running host");
        };
        Ok(host.trim_end_matches('/').to_string())
    }
}

impl RemoteTransport for GradioTransport {
    fn name(&self) -> &str {
        "gradio"
    }

    fn connect(&self, target: &str) -> Result<Arc<dyn RemoteConnection>> {
        let host = self.resolve_host(target)?;
        let config_url = format!("{host}/config");
        debug!("fetching app config from {config_url}");
        let response = authorize(self.http.get(&config_url), self.token.as_deref())
            .send()
            .with_context(|| format!("app config request failed ({config_url})"))?;
        let payload = response_json_or_error("App config", response)?;
        let config = AppConfig::from_value(&payload);
        info!(
            "connected to {target} at {host} (gradio {}, {} functions)",
            if config.version.is_empty() {
                "unknown"
            } else {
                config.version.as_str()
            },
            config.dependencies.len()
        );
        Ok(Arc::new(GradioConnection {
            target: target.to_string(),
            host,
            http: self.http.clone(),
            token: self.token.clone(),
            config,
        }))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Dependency {
    fn_index: u32,
    api_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct ResolvedEndpoint {
    fn_index: Option<u32>,
    api_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct AppConfig {
    version: String,
    api_prefix: String,
    legacy: bool,
    dependencies: Vec<Dependency>,
}

impl AppConfig {
    fn from_value(payload: &Value) -> Self {
        let version = payload
            .get("version")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .trim()
            .to_string();
        let api_prefix = payload
            .get("api_prefix")
            .and_then(Value::as_str)
            .map(|value| value.trim().trim_end_matches('/').to_string())
            .unwrap_or_default();
        let major = version
            .split('.')
            .next()
            .and_then(|value| value.parse::<u32>().ok());
        let dependencies = payload
            .get("dependencies")
            .and_then(Value::as_array)
            .map(|rows| {
                rows.iter()
                    .enumerate()
                    .map(|(position, row)| Dependency {
                        fn_index: row
                            .get("id")
                            .and_then(Value::as_u64)
                            .and_then(|value| u32::try_from(value).ok())
                            .unwrap_or(position as u32),
                        api_name: row
                            .get("api_name")
                            .and_then(Value::as_str)
                            .map(|value| value.trim().trim_start_matches('/').to_string())
                            .filter(|value| !value.is_empty()),
                    })
                    .collect()
            })
            .unwrap_or_default();
        Self {
            version,
            api_prefix,
            legacy: matches!(major, Some(value) if value < 4),
            dependencies,
        }
    }

    fn resolve(&self, endpoint: &EndpointRef) -> Result<ResolvedEndpoint> {
        match endpoint {
            EndpointRef::Named(_) => {
                let wanted = endpoint.api_name().unwrap_or_default();
                if self.dependencies.is_empty() {
                    return Ok(ResolvedEndpoint {
                        fn_index: None,
                        api_name: Some(wanted.to_string()),
                    });
                }
                let Some(dep) = self
                    .dependencies
                    .iter()
                    .find(|dep| dep.api_name.as_deref() == Some(wanted))
                else {
                    bail!("app publishes no endpoint named {endpoint}");
                };
                Ok(ResolvedEndpoint {
                    fn_index: Some(dep.fn_index),
                    api_name: dep.api_name.clone(),
                })
            }
            EndpointRef::Index(index) => {
                if self.dependencies.is_empty() {
                    return Ok(ResolvedEndpoint {
                        fn_index: Some(*index),
                        api_name: None,
                    });
                }
                let Some(dep) = self.dependencies.iter().find(|dep| dep.fn_index == *index)
                else {
                    bail!("app has no function #{index}");
                };
                Ok(ResolvedEndpoint {
                    fn_index: Some(dep.fn_index),
                    api_name: dep.api_name.clone(),
                })
            }
        }
    }
}

struct GradioConnection {
    target: String,
    host: String,
    http: HttpClient,
    token: Option<String>,
    config: AppConfig,
}

impl GradioConnection {
    fn base(&self) -> String {
        format!("{}{}", self.host, self.config.api_prefix)
    }

    fn prepare_argument(&self, arg: &Argument) -> Result<Value> {
        match arg {
            Argument::Value(value) => Ok(value.clone()),
            Argument::File(path) if self.config.legacy => file_as_data_url(path),
            Argument::File(path) => self.upload_file(path),
        }
    }

    fn upload_file(&self, path: &Path) -> Result<Value> {
        let bytes = std::fs::read(path)
            .with_context(|| format!("failed reading input file {}", path.display()))?;
        let file_name = path
            .file_name()
            .and_then(|value| value.to_str())
            .unwrap_or("upload")
            .to_string();
        let mut part = MultipartPart::bytes(bytes).file_name(file_name.clone());
        if let Some(mime) = mime_for_path(path) {
            part = part.mime_str(mime)?;
        }
        let url = format!("{}/upload", self.base());
        let response = authorize(self.http.post(&url), self.token.as_deref())
            .multipart(MultipartForm::new().part("files", part))
            .send()
            .with_context(|| format!("file upload failed ({url})"))?;
        let payload = response_json_or_error("File upload", response)?;
        let Some(remote_path) = payload
            .as_array()
            .and_then(|rows| rows.first())
            .and_then(Value::as_str)
        else {
            bail!("File upload returned no path: {}", truncate_text(&payload.to_string(), 256));
        };
        Ok(json!({
            "path": remote_path,
            "orig_name": file_name,
            "meta": {"_type": "gradio.FileData"},
        }))
    }

    fn call_queued(&self, api_name: &str, data: Vec<Value>) -> Result<Value> {
        let call_url = format!("{}/call/{}", self.base(), api_name);
        let response = authorize(self.http.post(&call_url), self.token.as_deref())
            .json(&json!({ "data": data }))
            .send()
            .with_context(|| format!("call request failed ({call_url})"))?;
        let payload = response_json_or_error("Call", response)?;
        let Some(event_id) = payload.get("event_id").and_then(Value::as_str) else {
            bail!("Call returned no event id: {}", truncate_text(&payload.to_string(), 256));
        };

        let stream_url = format!("{call_url}/{event_id}");
        let response = authorize(self.http.get(&stream_url), self.token.as_deref())
            .send()
            .with_context(|| format!("result stream request failed ({stream_url})"))?;
        let status = response.status();
        let body = response
            .text()
            .context("result stream read failed")?;
        if !status.is_success() {
            bail!(
                "result stream failed ({}): {}",
                status.as_u16(),
                truncate_text(&body, 512)
            );
        }
        for (event, data) in parse_sse_events(&body) {
            match event.as_str() {
                "complete" => {
                    let parsed: Value = serde_json::from_str(&data)
                        .context("result stream returned invalid JSON payload")?;
                    return Ok(json!({ "data": parsed }));
                }
                "error" => bail!("/{api_name} failed: {}", truncate_text(&data, 512)),
                _ => {}
            }
        }
        bail!("result stream for /{api_name} ended without a result")
    }

    fn call_legacy(&self, resolved: &ResolvedEndpoint, data: Vec<Value>) -> Result<Value> {
        let url = match resolved.api_name.as_deref() {
            Some(api_name) => format!("{}/api/{}", self.base(), api_name),
            None => format!("{}/api/predict", self.base()),
        };
        let mut body = Map::new();
        body.insert("data".to_string(), Value::Array(data));
        if let Some(fn_index) = resolved.fn_index {
            body.insert("fn_index".to_string(), json!(fn_index));
        }
        let response = authorize(self.http.post(&url), self.token.as_deref())
            .json(&Value::Object(body))
            .send()
            .with_context(|| format!("predict request failed ({url})"))?;
        let payload = response_json_or_error("Predict", response)?;
        if let Some(error) = payload.get("error").filter(|value| !value.is_null()) {
            bail!("Predict failed: {}", truncate_text(&error.to_string(), 512));
        }
        Ok(payload)
    }
}

impl RemoteConnection for GradioConnection {
    fn target(&self) -> &str {
        &self.target
    }

    fn predict(&self, endpoint: &EndpointRef, args: &[Argument]) -> Result<Value> {
        let resolved = self.config.resolve(endpoint)?;
        let data = args
            .iter()
            .map(|arg| self.prepare_argument(arg))
            .collect::<Result<Vec<Value>>>()?;
        debug!("calling {endpoint} on {} with {} args", self.target, data.len());
        let mut response = match resolved.api_name.as_deref() {
            Some(api_name) if !self.config.legacy => self.call_queued(api_name, data)?,
            _ => self.call_legacy(&resolved, data)?,
        };
        fill_file_urls(&mut response, &self.base());
        Ok(response)
    }

    fn describe(&self) -> Value {
        let named: Vec<Value> = self
            .config
            .dependencies
            .iter()
            .filter_map(|dep| {
                dep.api_name.as_ref().map(|name| {
                    json!({
                        "api_name": format!("/{name}"),
                        "fn_index": dep.fn_index,
                    })
                })
            })
            .collect();
        let unnamed = self.config.dependencies.len() - named.len();
        json!({
            "target": self.target,
            "host": self.host,
            "version": self.config.version,
            "named_endpoints": named,
            "unnamed_endpoints": unnamed,
        })
    }
}

fn authorize(builder: RequestBuilder, token: Option<&str>) -> RequestBuilder {
    match token {
        Some(token) => builder.bearer_auth(token),
        None => builder,
    }
}

/// Splits a server-sent-events body into `(event, data)` pairs.
fn parse_sse_events(body: &str) -> Vec<(String, String)> {
    let mut events = Vec::new();
    let mut event = String::new();
    let mut data: Vec<String> = Vec::new();

    let mut flush = |event: &mut String, data: &mut Vec<String>| {
        if event.is_empty() && data.is_empty() {
            return;
        }
        let name = if event.is_empty() {
            "message".to_string()
        } else {
            std::mem::take(event)
        };
        events.push((name, data.join("\n")));
        data.clear();
    };

    for line in body.lines() {
        let line = line.trim_end_matches('\r');
        if line.is_empty() {
            flush(&mut event, &mut data);
            continue;
        }
        if let Some(value) = line.strip_prefix("event:") {
            event = value.trim().to_string();
        } else if let Some(value) = line.strip_prefix("data:") {
            data.push(value.trim_start().to_string());
        }
    }
    flush(&mut event, &mut data);
    events
}

/// File outputs that only carry a server path get the URL the app serves them from.
/// Gradio 3 marks them `{"name": <path>, "is_file": true}`, later apps use `path`.
fn fill_file_urls(value: &mut Value, base: &str) {
    match value {
        Value::Array(rows) => {
            for row in rows {
                fill_file_urls(row, base);
            }
        }
        Value::Object(map) => {
            let missing_url = map.get("url").map(Value::is_null).unwrap_or(true);
            let legacy_file = map.get("is_file").and_then(Value::as_bool) == Some(true);
            let path = map
                .get("path")
                .or_else(|| map.get("name").filter(|_| legacy_file))
                .and_then(Value::as_str)
                .filter(|path| !path.is_empty())
                .map(str::to_string);
            if let (true, Some(path)) = (missing_url, path) {
                map.insert(
                    "url".to_string(),
                    Value::String(format!("{base}/file={path}")),
                );
            }
            for (_, row) in map.iter_mut() {
                fill_file_urls(row, base);
            }
        }
        _ => {}
    }
}

fn file_as_data_url(path: &Path) -> Result<Value> {
    let bytes = std::fs::read(path)
        .with_context(|| format!("failed reading input file {}", path.display()))?;
    let mime = mime_for_path(path).unwrap_or("application/octet-stream");
    Ok(Value::String(format!(
        "data:{mime};base64,{}",
        BASE64.encode(bytes)
    )))
}

fn mime_for_path(path: &Path) -> Option<&'static str> {
    let ext = path
        .extension()
        .and_then(|value| value.to_str())
        .map(|value| value.to_ascii_lowercase())?;
    match ext.as_str() {
        "png" => Some("image/png"),
        "jpg" | "jpeg" => Some("image/jpeg"),
        "webp" => Some("image/webp"),
        "gif" => Some("image/gif"),
        "bmp" => Some("image/bmp"),
        "mp4" => Some("video/mp4"),
        "webm" => Some("video/webm"),
        "mov" => Some("video/quicktime"),
        "mkv" => Some("video/x-matroska"),
        "avi" => Some("video/x-msvideo"),
        _ => None,
    }
}

fn response_json_or_error(label: &str, response: HttpResponse) -> Result<Value> {
    let status = response.status();
    let code = status.as_u16();
    let body = response
        .text()
        .with_context(|| format!("{label} response body read failed"))?;
    if !status.is_success() {
        bail!("{label} request failed ({code}): {}", truncate_text(&body, 512));
    }
    let parsed: Value = serde_json::from_str(&body)
        .with_context(|| format!("{label} returned invalid JSON payload"))?;
    Ok(parsed)
}

fn truncate_text(value: &str, max_chars: usize) -> String {
    if value.chars().count() <= max_chars {
        return value.to_string();
    }
    value.chars().take(max_chars).collect::<String>() + "…"
}
