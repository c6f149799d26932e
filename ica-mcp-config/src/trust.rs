//! Operator trust seals for project-defined executable upstreams.
//!
//! A seal binds a canonicalized project path to the digest of its project
//! config at the moment of sealing. Any later edit to the project config
//! changes the digest and silently invalidates the seal; the operator must
//! re-trust after reviewing the change.

use crate::error::{ConfigError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

/// Trust state file name under the home scope.
pub const TRUST_FILE: &str = "trust.json";

/// One recorded approval.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrustRecord {
    pub config_digest: String,
    pub trusted_at: u64,
}

/// Persistent map of project path -> [`TrustRecord`].
#[derive(Debug, Clone)]
pub struct TrustStore {
    path: PathBuf,
}

fn canonical_project_path(project: &Path) -> PathBuf {
    std::fs::canonicalize(project).unwrap_or_else(|_| project.to_path_buf())
}

impl TrustStore {
    pub fn new(home_dir: &Path) -> Self {
        Self {
            path: home_dir.join(TRUST_FILE),
        }
    }

    /// Load the full map. Missing or malformed files read as empty so a
    /// corrupted trust file fails closed rather than crashing the proxy.
    fn load(&self) -> BTreeMap<String, TrustRecord> {
        let text = match std::fs::read_to_string(&self.path) {
            Ok(text) => text,
            Err(_) => return BTreeMap::new(),
        };
        match serde_json::from_str(&text) {
            Ok(map) => map,
            Err(e) => {
                tracing::warn!(path = %self.path.display(), error = %e, "ignoring malformed trust file");
                BTreeMap::new()
            }
        }
    }

    /// Write-to-temp-then-rename so concurrent readers never observe a
    /// partially written file.
    fn store(&self, map: &BTreeMap<String, TrustRecord>) -> Result<()> {
        let io_err = |source| ConfigError::TrustIo {
            path: self.path.clone(),
            source,
        };
        let text = serde_json::to_string_pretty(map).expect("trust map serializes");
        let temp_path = self.path.with_file_name(format!(
            "{}.{}.tmp",
            TRUST_FILE,
            std::process::id()
        ));
        std::fs::write(&temp_path, text).map_err(io_err)?;
        std::fs::rename(&temp_path, &self.path).map_err(io_err)?;
        Ok(())
    }

    /// Look up the record for a project directory.
    pub fn lookup(&self, project: &Path) -> Option<TrustRecord> {
        let key = canonical_project_path(project);
        self.load().get(&key.to_string_lossy().to_string()).cloned()
    }

    /// Record (or overwrite) the operator's approval of a project at its
    /// current config digest.
    pub fn trust(&self, project: &Path, config_digest: &str) -> Result<TrustRecord> {
        let record = TrustRecord {
            config_digest: config_digest.to_string(),
            trusted_at: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs(),
        };
        let key = canonical_project_path(project).to_string_lossy().to_string();
        let mut map = self.load();
        map.insert(key, record.clone());
        self.store(&map)?;
        Ok(record)
    }

    /// True iff a record exists and its digest matches the current one.
    pub fn is_trusted(&self, project: &Path, current_digest: &str) -> bool {
        self.lookup(project)
            .map(|record| record.config_digest == current_digest)
            .unwrap_or(false)
    }
}
