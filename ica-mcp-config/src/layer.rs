//! Reading and normalizing one configuration layer.
//!
//! Three sources feed the merger: `<cwd>/.mcp.json` (project),
//! `<ICA_HOME>/mcp-servers.json` (home), and an operator-named file from
//! `MCP_CONFIG` / `MCP_CONFIG_PATH` (env-override). Each parses to a
//! [`ConfigLayer`]: the entries that narrowed cleanly, the entries that did
//! not (kept by name so the merger can report them), and a digest binding
//! the layer's `mcpServers` content.

use crate::error::{ConfigError, Result};
use crate::spec::{LayerOrigin, ServerSpec};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Project-scope config file name.
pub const PROJECT_CONFIG_FILE: &str = ".mcp.json";
/// Home-scope config file name.
pub const HOME_CONFIG_FILE: &str = "mcp-servers.json";

/// One parsed configuration source.
#[derive(Debug, Clone)]
pub struct ConfigLayer {
    pub origin: LayerOrigin,
    pub path: PathBuf,
    /// Entries that narrowed into valid specs.
    pub servers: BTreeMap<String, ServerSpec>,
    /// Entries that failed narrowing, name -> reason. These are carried
    /// through the merge as blocked servers so no name silently vanishes.
    pub invalid: BTreeMap<String, String>,
    /// SHA-256 hex digest of the canonical `mcpServers` serialization.
    pub digest: String,
}

/// Digest of a layer's `mcpServers` value.
///
/// `serde_json`'s default `Map` is ordered by key, so `to_string` yields a
/// canonical form: sorted keys, no insignificant whitespace. The digest is
/// therefore invariant under key reordering of the source file.
pub fn canonical_digest(servers: &Value) -> String {
    let canonical = serde_json::to_string(servers).unwrap_or_else(|_| "{}".to_string());
    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    format!("{:x}", hasher.finalize())
}

fn parse_layer(path: &Path, origin: LayerOrigin) -> Result<Option<ConfigLayer>> {
    let text = match std::fs::read_to_string(path) {
        Ok(text) => text,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => {
            return Err(ConfigError::Parse {
                path: path.to_path_buf(),
                detail: e.to_string(),
            })
        }
    };

    let document: Value = serde_json::from_str(&text).map_err(|e| ConfigError::Parse {
        path: path.to_path_buf(),
        detail: e.to_string(),
    })?;

    // Unknown top-level keys are ignored; only mcpServers matters.
    let raw_servers = match document.get("mcpServers") {
        None | Some(Value::Null) => Value::Object(serde_json::Map::new()),
        Some(Value::Object(map)) => Value::Object(map.clone()),
        Some(other) => {
            return Err(ConfigError::Parse {
                path: path.to_path_buf(),
                detail: format!(
                    "'mcpServers' must be an object, got {}",
                    match other {
                        Value::Array(_) => "an array",
                        Value::String(_) => "a string",
                        Value::Number(_) => "a number",
                        Value::Bool(_) => "a bool",
                        _ => "null",
                    }
                ),
            })
        }
    };

    let digest = canonical_digest(&raw_servers);

    let mut servers = BTreeMap::new();
    let mut invalid = BTreeMap::new();
    if let Value::Object(map) = &raw_servers {
        for (name, raw) in map {
            match ServerSpec::from_raw(name, origin, raw) {
                Ok(spec) => {
                    servers.insert(name.clone(), spec);
                }
                Err(e) => {
                    tracing::warn!(
                        layer = %origin,
                        server = %name,
                        error = %e,
                        "dropping malformed server entry"
                    );
                    invalid.insert(name.clone(), e.to_string());
                }
            }
        }
    }

    Ok(Some(ConfigLayer {
        origin,
        path: path.to_path_buf(),
        servers,
        invalid,
        digest,
    }))
}

/// Read the project layer from `<cwd>/.mcp.json`.
pub fn read_project(cwd: &Path) -> Result<Option<ConfigLayer>> {
    parse_layer(&cwd.join(PROJECT_CONFIG_FILE), LayerOrigin::Project)
}

/// Read the home layer from `<home_dir>/mcp-servers.json`.
pub fn read_home(home_dir: &Path) -> Result<Option<ConfigLayer>> {
    parse_layer(&home_dir.join(HOME_CONFIG_FILE), LayerOrigin::Home)
}

/// Read the env-override layer from an operator-provided path.
pub fn read_env_override(path: &Path) -> Result<Option<ConfigLayer>> {
    parse_layer(path, LayerOrigin::EnvOverride)
}
