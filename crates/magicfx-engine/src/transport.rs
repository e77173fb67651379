use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Result};
use magicfx_contracts::effects::EndpointRef;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};

/// One positional argument for a remote call.
#[derive(Debug, Clone, PartialEq)]
pub enum Argument {
    Value(Value),
    /// A local file; the transport uploads it and substitutes a remote reference.
    File(PathBuf),
}

impl Argument {
    pub fn value(value: impl Into<Value>) -> Self {
        Self::Value(value.into())
    }

    /// JSON shape used for logging and the dryrun transport.
    pub fn describe(&self) -> Value {
        match self {
            Self::Value(value) => value.clone(),
            Self::File(path) => json!({ "file": path.to_string_lossy() }),
        }
    }
}

/// A live connection to one remote app.
pub trait RemoteConnection: Send + Sync {
    fn target(&self) -> &str;
    /// Calls one endpoint and returns the raw response, shaped `{"data": [...]}`.
    fn predict(&self, endpoint: &EndpointRef, args: &[Argument]) -> Result<Value>;
    /// Endpoint listing, as far as the remote app publishes one.
    fn describe(&self) -> Value;
}

pub trait RemoteTransport: Send + Sync {
    fn name(&self) -> &str;
    fn connect(&self, target: &str) -> Result<Arc<dyn RemoteConnection>>;
}

/// Answers locally. Targets beginning with `fail/` refuse to connect, and
/// only named endpoints listed in `endpoints` answer.
#[derive(Debug, Clone)]
pub struct DryrunTransport {
    endpoints: Vec<String>,
}

impl Default for DryrunTransport {
    fn default() -> Self {
        Self {
            endpoints: vec![
                "/infer".to_string(),
                "/predict".to_string(),
                "/process_image".to_string(),
            ],
        }
    }
}

impl DryrunTransport {
    pub fn new() -> Self {
        Self::default()
    }
}

impl RemoteTransport for DryrunTransport {
    fn name(&self) -> &str {
        "dryrun"
    }

    fn connect(&self, target: &str) -> Result<Arc<dyn RemoteConnection>> {
        if target.trim().is_empty() {
            bail!("dryrun target is empty");
        }
        if target.starts_with("fail/") {
            bail!("dryrun target '{target}' refused the connection");
        }
        Ok(Arc::new(DryrunConnection {
            target: target.to_string(),
            endpoints: self.endpoints.clone(),
        }))
    }
}

struct DryrunConnection {
    target: String,
    endpoints: Vec<String>,
}

impl RemoteConnection for DryrunConnection {
    fn target(&self) -> &str {
        &self.target
    }

    fn predict(&self, endpoint: &EndpointRef, args: &[Argument]) -> Result<Value> {
        let name = match endpoint {
            EndpointRef::Named(name) if self.endpoints.contains(name) => name.clone(),
            EndpointRef::Named(name) => bail!("dryrun app has no endpoint {name}"),
            EndpointRef::Index(index) => match self.endpoints.get(*index as usize) {
                Some(name) => name.clone(),
                None => bail!("dryrun app has no function #{index}"),
            },
        };
        let payload = Value::Array(args.iter().map(Argument::describe).collect());
        let digest = Sha256::digest(serde_json::to_vec(&payload)?);
        let short = hex::encode(&digest[..6]);
        Ok(json!({
            "data": [{
                "url": format!("dryrun://{}{}/{short}", self.target, name),
            }]
        }))
    }

    fn describe(&self) -> Value {
        json!({
            "target": self.target,
            "named_endpoints": self.endpoints,
        })
    }
}

#[cfg(test)]
mod tests {
    use magicfx_contracts::effects::EndpointRef;
    use serde_json::json;

    use super::{Argument, DryrunTransport, RemoteTransport};

    #[test]
    fn dryrun_answers_named_and_indexed_endpoints() -> anyhow::Result<()> {
        let connection = DryrunTransport::new().connect("owner/space")?;
        let args = vec![Argument::value("a cat"), Argument::value(7)];

        let named = connection.predict(&EndpointRef::named("/infer"), &args)?;
        let url = named["data"][0]["url"].as_str().unwrap_or_default();
        assert!(url.starts_with("dryrun://owner/space/infer/"));

        let indexed = connection.predict(&EndpointRef::Index(0), &args)?;
        assert_eq!(indexed, named);
        Ok(())
    }

    #[test]
    fn dryrun_rejects_unknown_endpoints_and_fail_targets() {
        let transport = DryrunTransport::new();
        assert!(transport.connect("fail/offline").is_err());
        assert!(transport.connect("").is_err());

        let connection = transport.connect("owner/space").unwrap();
        assert!(connection
            .predict(&EndpointRef::named("/nope"), &[])
            .is_err());
        assert!(connection.predict(&EndpointRef::Index(9), &[]).is_err());
        assert_eq!(
            connection.describe()["named_endpoints"],
            json!(["/infer", "/predict", "/process_image"])
        );
    }
}
