//! Backend configuration patcher
//!
//! Makes sure the backend's `configuration.yaml` trusts forwarding headers
//! from the tunnel's network:
//!
//! ```yaml
//! http:
//!   use_x_forwarded_for: true
//!   trusted_proxies:
//!     - 172.30.33.0/24
//! ```
//!
//! The patch is a small transaction: snapshot the raw bytes, write the merged
//! document, ask the backend to validate it, and restore the snapshot if the
//! backend rejects it or cannot be asked.

use std::path::{Path, PathBuf};
use std::time::Duration;

use homeport_shared::error::ConfigError;
use serde_yaml::{Mapping, Value};
use tracing::{error, info, warn};

use crate::validator::{ConfigValidator, Validation};

/// Networks the tunnel traffic reaches the backend from
pub const DEFAULT_TRUSTED_PROXIES: &[&str] = &[
    "172.30.33.0/24", // add-on network
    "172.30.32.0/24", // supervisor network
    "127.0.0.1",
    "::1",
];

const HTTP: &str = "http";
const USE_X_FORWARDED_FOR: &str = "use_x_forwarded_for";
const TRUSTED_PROXIES: &str = "trusted_proxies";

/// Outcome of [`ConfigPatcher::ensure_trusted_proxy`]
#[derive(Debug)]
pub enum PatchOutcome {
    /// Patch written and accepted (or validation skipped)
    Applied,
    /// Nothing to do, file untouched
    AlreadyPresent,
    /// Patch written, then rolled back for this reason
    Reverted(ConfigError),
}

/// In-memory view of the backend configuration file
#[derive(Debug, Clone)]
pub struct ConfigDocument {
    raw: Vec<u8>,
    root: Mapping,
}

impl ConfigDocument {
    pub async fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = match tokio::fs::read(path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(ConfigError::NotFound(path.to_path_buf()))
            }
            Err(e) => return Err(e.into()),
        };
        Self::parse(raw)
    }

    pub fn parse(raw: Vec<u8>) -> Result<Self, ConfigError> {
        let text = std::str::from_utf8(&raw).map_err(|e| ConfigError::ParseFailure(e.to_string()))?;
        let blank = text.lines().all(|l| {
            let l = l.trim();
            l.is_empty() || l.starts_with('#')
        });
        let value: Value = if blank {
            Value::Null
        } else {
            serde_yaml::from_str(text).map_err(|e| ConfigError::ParseFailure(e.to_string()))?
        };

        let root = match value {
            Value::Null => Mapping::new(),
            Value::Mapping(map) => map,
            other => {
                return Err(ConfigError::ParseFailure(format!(
                    "top level must be a mapping, found {}",
                    kind(&other)
                )))
            }
        };
        check_http_shape(&root)?;

        Ok(Self { raw, root })
    }

    /// Bytes the document was loaded from
    pub fn snapshot(&self) -> &[u8] {
        &self.raw
    }

    pub fn root(&self) -> &Mapping {
        &self.root
    }

    /// Whether the `http` section already trusts every range.
    pub fn is_trusting(&self, ranges: &[String]) -> bool {
        let Some(http) = self.root.get(HTTP).and_then(Value::as_mapping) else {
            return false;
        };
        let forwarded = http.get(USE_X_FORWARDED_FOR).and_then(Value::as_bool) == Some(true);
        let proxies = proxy_entries(http.get(TRUSTED_PROXIES));
        forwarded && ranges.iter().all(|r| proxies.iter().any(|p| p == r))
    }

    /// Merge the ranges into `http.trusted_proxies` and enable
    /// `use_x_forwarded_for`. Existing entries stay in place; missing ones are
    /// appended once. Returns whether anything changed.
    pub fn trust(&mut self, ranges: &[String]) -> bool {
        let mut changed = false;

        let http_key = Value::from(HTTP);
        if !matches!(self.root.get(&http_key), Some(Value::Mapping(_))) {
            self.root.insert(http_key.clone(), Value::Mapping(Mapping::new()));
            info!("Added http: section");
            changed = true;
        }
        let Some(http) = self.root.get_mut(&http_key).and_then(Value::as_mapping_mut) else {
            return changed;
        };

        if http.get(USE_X_FORWARDED_FOR).and_then(Value::as_bool) != Some(true) {
            http.insert(Value::from(USE_X_FORWARDED_FOR), Value::Bool(true));
            info!("Set use_x_forwarded_for: true");
            changed = true;
        }

        let proxies_key = Value::from(TRUSTED_PROXIES);
        let mut list = match http.get(&proxies_key) {
            Some(Value::Sequence(seq)) => seq.clone(),
            Some(Value::String(single)) => vec![Value::from(single.as_str())],
            _ => Vec::new(),
        };
        let before = list.len();
        for range in ranges {
            if !list.iter().any(|v| v.as_str() == Some(range)) {
                list.push(Value::from(range.as_str()));
                info!("Added trusted proxy: {}", range);
            }
        }
        if list.len() != before || !matches!(http.get(&proxies_key), Some(Value::Sequence(_))) {
            http.insert(proxies_key, Value::Sequence(list));
            changed = true;
        }

        changed
    }

    pub fn render(&self) -> Result<String, ConfigError> {
        serde_yaml::to_string(&self.root).map_err(|e| ConfigError::ParseFailure(e.to_string()))
    }
}

/// Reject `http` sections the patcher cannot edit safely.
fn check_http_shape(root: &Mapping) -> Result<(), ConfigError> {
    let http = match root.get(HTTP) {
        None | Some(Value::Null) => return Ok(()),
        Some(Value::Mapping(http)) => http,
        Some(other) => {
            return Err(ConfigError::ParseFailure(format!(
                "http section is a {}, expected a mapping",
                kind(other)
            )))
        }
    };
    match http.get(TRUSTED_PROXIES) {
        None | Some(Value::Null) | Some(Value::String(_)) => Ok(()),
        Some(Value::Sequence(seq)) if seq.iter().all(|v| v.as_str().is_some()) => Ok(()),
        Some(other) => Err(ConfigError::ParseFailure(format!(
            "http.trusted_proxies is a {}, expected a list of strings",
            kind(other)
        ))),
    }
}

fn proxy_entries(value: Option<&Value>) -> Vec<String> {
    match value {
        Some(Value::Sequence(seq)) => seq.iter().filter_map(|v| v.as_str().map(String::from)).collect(),
        Some(Value::String(s)) => vec![s.clone()],
        _ => Vec::new(),
    }
}

fn kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Sequence(_) => "list",
        Value::Mapping(_) => "mapping",
        Value::Tagged(_) => "tagged value",
    }
}

/// Applies the trusted-proxy patch with validation and rollback
pub struct ConfigPatcher<V> {
    validator: V,
    validation_timeout: Duration,
    keep_backup: bool,
}

impl<V: ConfigValidator> ConfigPatcher<V> {
    pub fn new(validator: V, validation_timeout: Duration) -> Self {
        Self {
            validator,
            validation_timeout,
            keep_backup: true,
        }
    }

    /// Also write a timestamped copy of the original file before patching.
    pub fn keep_backup(mut self, keep: bool) -> Self {
        self.keep_backup = keep;
        self
    }

    pub async fn ensure_trusted_proxy(&self, path: &Path, ranges: &[String]) -> Result<PatchOutcome, ConfigError> {
        let mut doc = ConfigDocument::load(path).await?;

        if doc.is_trusting(ranges) {
            info!("{} already trusts the tunnel network", path.display());
            return Ok(PatchOutcome::AlreadyPresent);
        }

        doc.trust(ranges);
        let rendered = doc.render()?;

        if self.keep_backup {
            let backup = backup_path(path);
            tokio::fs::write(&backup, doc.snapshot()).await?;
            info!("Configuration backup created: {}", backup.display());
        }

        if let Err(e) = write_atomic(path, rendered.as_bytes()).await {
            error!("Failed to write {}: {}", path.display(), e);
            return Err(e);
        }
        info!("{} updated, validating", path.display());

        let verdict = match tokio::time::timeout(self.validation_timeout, self.validator.validate()).await {
            Ok(verdict) => verdict,
            Err(_) => Err(ConfigError::ValidatorUnreachable(format!(
                "no answer within {:?}",
                self.validation_timeout
            ))),
        };

        match verdict {
            Ok(validation) => {
                if let Validation::Skipped(reason) = validation {
                    warn!("Configuration validation skipped ({}), keeping patch", reason);
                }
                warn!("The backend must be restarted for http: changes to take effect");
                Ok(PatchOutcome::Applied)
            }
            Err(reason) => {
                error!("Configuration validation failed: {}. Reverting {}", reason, path.display());
                restore(path, doc.snapshot()).await?;
                Ok(PatchOutcome::Reverted(reason))
            }
        }
    }
}

async fn restore(path: &Path, snapshot: &[u8]) -> Result<(), ConfigError> {
    write_atomic(path, snapshot).await?;
    info!("Restored {} from snapshot", path.display());
    Ok(())
}

/// Replace `path` through a sibling temp file; the original stays intact
/// until the rename.
async fn write_atomic(path: &Path, contents: &[u8]) -> Result<(), ConfigError> {
    let tmp = with_suffix(path, ".homeport_tmp");
    let result = async {
        tokio::fs::write(&tmp, contents).await?;
        if let Ok(meta) = tokio::fs::metadata(path).await {
            tokio::fs::set_permissions(&tmp, meta.permissions()).await?;
        }
        tokio::fs::rename(&tmp, path).await
    }
    .await;

    if let Err(e) = result {
        if tokio::fs::metadata(&tmp).await.map(|m| m.is_file()).unwrap_or(false) {
            let _ = tokio::fs::remove_file(&tmp).await;
        }
        return Err(e.into());
    }
    Ok(())
}

fn backup_path(path: &Path) -> PathBuf {
    let stamp = chrono::Local::now().format("%Y%m%d_%H%M%S");
    with_suffix(path, &format!(".homeport_backup_{}", stamp))
}

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(suffix);
    PathBuf::from(name)
}
