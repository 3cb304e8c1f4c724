//! Shared broker session file.
//!
//! The broker throttles logins, so sibling engine processes on the same
//! account share one authenticated token through a JSON file. Writes are
//! atomic (tmp + rename); consumers treat records older than
//! `SESSION_MAX_AGE_SECS` as invalid. No lock file: the discipline is
//! re-read-and-probe before any fresh login.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

pub const SESSION_MAX_AGE_SECS: i64 = 8 * 3600;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRecord {
    pub token: String,
    #[serde(rename = "userID")]
    pub user_id: String,
    #[serde(rename = "isInvestorClient", default = "default_investor")]
    pub is_investor_client: bool,
    /// Unix seconds at save time; freshness gate for consumers.
    pub timestamp: i64,
}

fn default_investor() -> bool {
    true
}

#[derive(Debug, Clone)]
pub struct SessionStore {
    path: PathBuf,
}

impl SessionStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the shared file; `None` if missing, unparseable, or expired.
    pub fn load_fresh(&self) -> Option<SessionRecord> {
        let raw = match fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(_) => return None,
        };
        let record: SessionRecord = match serde_json::from_str(&raw) {
            Ok(r) => r,
            Err(e) => {
                debug!(error = %e, "session file unparseable");
                return None;
            }
        };
        let age = Utc::now().timestamp() - record.timestamp;
        if age > SESSION_MAX_AGE_SECS {
            info!("session file expired (age={:.1}h)", age as f64 / 3600.0);
            return None;
        }
        if record.token.is_empty() || record.user_id.is_empty() {
            return None;
        }
        Some(record)
    }

    /// Atomically write a fresh session record for sibling processes.
    pub fn save(&self, token: &str, user_id: &str, is_investor_client: bool) -> Result<()> {
        if let Some(dir) = self.path.parent() {
            fs::create_dir_all(dir).with_context(|| format!("create {}", dir.display()))?;
        }
        let record = SessionRecord {
            token: token.to_string(),
            user_id: user_id.to_string(),
            is_investor_client,
            timestamp: Utc::now().timestamp(),
        };
        let tmp = self.path.with_extension("json.tmp");
        let raw = serde_json::to_vec(&record).context("serialize session record")?;
        fs::write(&tmp, raw).with_context(|| format!("write {}", tmp.display()))?;
        fs::rename(&tmp, &self.path).with_context(|| format!("rename to {}", self.path.display()))?;
        info!("session saved to {}", self.path.display());
        Ok(())
    }

    pub fn save_logged(&self, token: &str, user_id: &str, is_investor_client: bool) {
        if let Err(e) = self.save(token, user_id, is_investor_client) {
            warn!(error = %e, "failed to save session file");
        }
    }
}
