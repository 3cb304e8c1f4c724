//! Durable engine state.
//!
//! One JSON document per engine, written atomically (tmp + rename) so a
//! dashboard or sibling process reading the file sees either the old or the
//! new snapshot, never a torn one. A corrupt file is preserved for operator
//! inspection and the engine starts fresh.

pub mod grid;
pub mod pairs;

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{error, info};

pub fn save_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(dir) = path.parent() {
        if !dir.as_os_str().is_empty() {
            fs::create_dir_all(dir).with_context(|| format!("create {}", dir.display()))?;
        }
    }
    let raw = serde_json::to_vec_pretty(value).context("serialize state")?;
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, raw).with_context(|| format!("write {}", tmp.display()))?;
    fs::rename(&tmp, path).with_context(|| format!("rename to {}", path.display()))?;
    Ok(())
}

/// Load a state document. `None` means start fresh: the file is missing, or
/// it failed to parse (in which case it is moved aside, not deleted).
pub fn load_json<T: DeserializeOwned>(path: &Path) -> Option<T> {
    let raw = match fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(_) => {
            info!("no existing state file at {}", path.display());
            return None;
        }
    };
    match serde_json::from_str(&raw) {
        Ok(value) => Some(value),
        Err(e) => {
            let quarantine = path.with_extension("json.corrupt");
            error!(
                error = %e,
                "state file {} is corrupt; preserving as {} and starting fresh",
                path.display(),
                quarantine.display()
            );
            let _ = fs::rename(path, &quarantine);
            None
        }
    }
}
