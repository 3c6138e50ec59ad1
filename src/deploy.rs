//! `.modsync-deploy.json`: per-environment record of the last deployment.

use std::fs;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

pub const DEPLOY_RECORD: &str = ".modsync-deploy.json";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeployRecord {
    /// Environment name.
    pub name: String,
    /// Commit of the control branch the environment was deployed from.
    pub signature: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub deploy_success: bool,
}

impl DeployRecord {
    pub fn new(name: &str, signature: &str, started_at: DateTime<Utc>, success: bool) -> Self {
        Self {
            name: name.to_string(),
            signature: signature.to_string(),
            started_at,
            finished_at: Utc::now(),
            deploy_success: success,
        }
    }

    pub fn write(&self, environment_dir: &Path) -> Result<()> {
        let path = environment_dir.join(DEPLOY_RECORD);
        let body = serde_json::to_string_pretty(self)?;
        fs::write(&path, body).map_err(|e| Error::filesystem(&path, e))
    }

    /// The record in `environment_dir`, `None` when missing or unreadable.
    pub fn read(environment_dir: &Path) -> Option<Self> {
        let body = fs::read_to_string(environment_dir.join(DEPLOY_RECORD)).ok()?;
        serde_json::from_str(&body).ok()
    }
}
