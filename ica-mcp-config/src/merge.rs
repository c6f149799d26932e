//! Layer merging and the trust gate.
//!
//! The merged view is deterministic: overlay home, project, env-override in
//! that order (later wins), swap home/project when the operator prefers the
//! home layer, then gate project-defined stdio entries behind the trust
//! seal. Every server name seen in any layer ends up in exactly one of
//! `servers` or `blocked_servers`.

use crate::error::{ConfigError, Result};
use crate::layer::{self, canonical_digest, ConfigLayer};
use crate::spec::{LayerOrigin, ServerSpec};
use crate::trust::{TrustRecord, TrustStore};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Home scope directory.
pub const ENV_ICA_HOME: &str = "ICA_HOME";
/// When truthy, the home layer overrides the project layer.
pub const ENV_PREFER_HOME: &str = "ICA_MCP_CONFIG_PREFER_HOME";
/// When truthy, project stdio servers require a trust seal.
pub const ENV_STRICT_TRUST: &str = "ICA_MCP_STRICT_TRUST";
/// When truthy, bypass the trust gate for this process only.
pub const ENV_ALLOW_PROJECT_STDIO: &str = "ICA_MCP_ALLOW_PROJECT_STDIO";
/// Env-override layer path (wins over `MCP_CONFIG_PATH`).
pub const ENV_MCP_CONFIG: &str = "MCP_CONFIG";
/// Env-override layer path, lower-precedence spelling.
pub const ENV_MCP_CONFIG_PATH: &str = "MCP_CONFIG_PATH";

/// Reason string attached to gated project stdio servers.
pub const BLOCKED_UNTRUSTED: &str = "untrusted_project_stdio";

/// Boolean interpretation shared by every `ICA_*` flag: `1`, `true`, `yes`
/// (case-insensitive) are truthy; anything else is false.
pub fn truthy(value: &str) -> bool {
    let value = value.trim();
    value.eq_ignore_ascii_case("1")
        || value.eq_ignore_ascii_case("true")
        || value.eq_ignore_ascii_case("yes")
}

/// Interpret a boolean environment variable; unset reads as false.
pub fn env_flag(name: &str) -> bool {
    std::env::var(name).map(|value| truthy(&value)).unwrap_or(false)
}

/// A snapshot of the policy-relevant environment.
///
/// Captured once at the top of each merge so every decision in a single
/// call sees one consistent view, and so tests can inject policies without
/// touching process state.
#[derive(Debug, Clone, Default)]
pub struct Policy {
    pub home_dir: Option<PathBuf>,
    pub prefer_home: bool,
    pub strict_trust: bool,
    pub allow_project_stdio: bool,
    pub env_override_path: Option<PathBuf>,
}

impl Policy {
    pub fn from_env() -> Self {
        let env_override_path = std::env::var(ENV_MCP_CONFIG)
            .ok()
            .filter(|p| !p.is_empty())
            .or_else(|| std::env::var(ENV_MCP_CONFIG_PATH).ok().filter(|p| !p.is_empty()))
            .map(PathBuf::from);
        Self {
            home_dir: std::env::var(ENV_ICA_HOME)
                .ok()
                .filter(|p| !p.is_empty())
                .map(PathBuf::from),
            prefer_home: env_flag(ENV_PREFER_HOME),
            strict_trust: env_flag(ENV_STRICT_TRUST),
            allow_project_stdio: env_flag(ENV_ALLOW_PROJECT_STDIO),
            env_override_path,
        }
    }
}

/// The merged, gated view of all configuration layers.
#[derive(Debug, Clone, Default)]
pub struct MergedConfig {
    pub servers: BTreeMap<String, ServerSpec>,
    /// Server name -> reason it is not runnable.
    pub blocked_servers: BTreeMap<String, String>,
    /// Layer origin ("home", "project", "env-override") -> digest.
    pub source_digests: BTreeMap<String, String>,
    pub warnings: Vec<String>,
}

impl MergedConfig {
    /// Digest of the project layer, if one was loaded.
    pub fn project_digest(&self) -> Option<&str> {
        self.source_digests
            .get(&LayerOrigin::Project.to_string())
            .map(String::as_str)
    }
}

enum MergedEntry {
    Valid(ServerSpec),
    Invalid(String),
}

fn overlay(target: &mut BTreeMap<String, MergedEntry>, layer: &ConfigLayer) {
    for (name, spec) in &layer.servers {
        target.insert(name.clone(), MergedEntry::Valid(spec.clone()));
    }
    for (name, reason) in &layer.invalid {
        target.insert(name.clone(), MergedEntry::Invalid(reason.clone()));
    }
}

/// Merge all layers using policy read from the current process environment.
///
/// The environment is re-read on every call, so trust edits and flag flips
/// are observed without restarting the proxy.
pub fn load_servers_merged(cwd: &Path) -> Result<MergedConfig> {
    load_servers_merged_with(cwd, &Policy::from_env())
}

/// Merge all layers under an explicit [`Policy`].
pub fn load_servers_merged_with(cwd: &Path, policy: &Policy) -> Result<MergedConfig> {
    let mut warnings = Vec::new();
    let mut parse_errors = Vec::new();
    let mut available_sources = 0usize;

    let mut read = |result: Result<Option<ConfigLayer>>| match result {
        Ok(layer) => {
            if layer.is_some() {
                available_sources += 1;
            }
            layer
        }
        Err(e) => {
            warnings.push(e.to_string());
            parse_errors.push(e);
            None
        }
    };

    let home = policy
        .home_dir
        .as_deref()
        .and_then(|home_dir| read(layer::read_home(home_dir)));
    let project = read(layer::read_project(cwd));
    let env_override = policy
        .env_override_path
        .as_deref()
        .and_then(|path| read(layer::read_env_override(path)));

    // A broken layer is a warning while any other source still loads; with
    // nothing left to serve from, it is fatal.
    if available_sources == 0 {
        if let Some(error) = parse_errors.into_iter().next() {
            return Err(error);
        }
    }

    let mut source_digests = BTreeMap::new();
    for layer in [home.as_ref(), project.as_ref(), env_override.as_ref()].into_iter().flatten() {
        source_digests.insert(layer.origin.to_string(), layer.digest.clone());
    }

    let mut merged: BTreeMap<String, MergedEntry> = BTreeMap::new();
    let base_order: [Option<&ConfigLayer>; 2] = if policy.prefer_home {
        [project.as_ref(), home.as_ref()]
    } else {
        [home.as_ref(), project.as_ref()]
    };
    for layer in base_order.into_iter().flatten() {
        overlay(&mut merged, layer);
    }
    // The env-override layer is operator-authored and always wins.
    if let Some(layer) = env_override.as_ref() {
        overlay(&mut merged, layer);
    }

    let project_digest = project.as_ref().map(|layer| layer.digest.clone());
    let project_trusted = match (&policy.home_dir, &project_digest) {
        (Some(home_dir), Some(digest)) => TrustStore::new(home_dir).is_trusted(cwd, digest),
        _ => false,
    };
    let gate_open = !policy.strict_trust || policy.allow_project_stdio || project_trusted;

    let mut config = MergedConfig {
        warnings,
        source_digests,
        ..Default::default()
    };

    for (name, entry) in merged {
        match entry {
            MergedEntry::Invalid(reason) => {
                config.blocked_servers.insert(name, reason);
            }
            MergedEntry::Valid(spec) => {
                let gated = spec.origin == LayerOrigin::Project && spec.is_stdio();
                if gated && !gate_open {
                    config.blocked_servers.insert(name, BLOCKED_UNTRUSTED.to_string());
                } else {
                    config.servers.insert(name, spec);
                }
            }
        }
    }

    Ok(config)
}

/// Seal the project at its current on-disk config digest.
///
/// A subsequent edit to `<cwd>/.mcp.json` changes the digest and re-gates
/// the project's stdio servers until the operator trusts it again.
pub fn trust_project(cwd: &Path) -> Result<TrustRecord> {
    trust_project_with(cwd, &Policy::from_env())
}

/// Seal the project under an explicit [`Policy`].
pub fn trust_project_with(cwd: &Path, policy: &Policy) -> Result<TrustRecord> {
    let home_dir = policy.home_dir.as_deref().ok_or_else(|| {
        ConfigError::HomeUnavailable(format!("{} is not set", ENV_ICA_HOME))
    })?;
    if !home_dir.is_dir() {
        return Err(ConfigError::HomeUnavailable(format!(
            "{} is not a directory",
            home_dir.display()
        )));
    }

    let digest = match layer::read_project(cwd)? {
        Some(layer) => layer.digest,
        None => canonical_digest(&Value::Object(serde_json::Map::new())),
    };
    TrustStore::new(home_dir).trust(cwd, &digest)
}
