//! Per-deployment log collection
//!
//! A deployment's log survives the mid-update reboot, so messages are
//! appended to a file keyed by deployment ID and read back for upload when
//! the deployment ends. The manager is an explicit value carried in the
//! state context; it is enabled when the artifact starts storing and
//! released when the deployment reaches a terminal state.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::{error, warn};

use crate::errors::AgentError;

/// A single deployment log message
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogMessage {
    pub timestamp: DateTime<Utc>,
    pub level: String,
    pub message: String,
}

/// File-backed log store for the deployment in flight.
pub struct DeploymentLogManager {
    log_dir: PathBuf,
    active: Option<String>,
}

impl DeploymentLogManager {
    pub fn new(log_dir: impl Into<PathBuf>) -> Self {
        Self {
            log_dir: log_dir.into(),
            active: None,
        }
    }

    fn log_path(&self, deployment_id: &str) -> PathBuf {
        self.log_dir.join(format!("deployments.{}.log", deployment_id))
    }

    /// Start (or resume) collecting messages for `deployment_id`.
    pub async fn enable(&mut self, deployment_id: &str) -> Result<(), AgentError> {
        fs::create_dir_all(&self.log_dir).await?;
        self.active = Some(deployment_id.to_string());
        Ok(())
    }

    /// Whether a deployment log is currently enabled.
    pub fn is_enabled(&self) -> bool {
        self.active.is_some()
    }

    /// Append a message to the active deployment log. Dropping a message is
    /// logged but never fails the update.
    pub async fn log(&self, level: &str, message: impl Into<String>) {
        let Some(id) = &self.active else {
            return;
        };
        let entry = LogMessage {
            timestamp: Utc::now(),
            level: level.to_string(),
            message: message.into(),
        };
        if let Err(e) = self.append(id, &entry).await {
            warn!("failed to write deployment log: {}", e);
        }
    }

    async fn append(&self, deployment_id: &str, entry: &LogMessage) -> Result<(), AgentError> {
        let mut line = serde_json::to_vec(entry)?;
        line.push(b'\n');
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.log_path(deployment_id))
            .await?;
        file.write_all(&line).await?;
        Ok(())
    }

    /// Read back everything collected for the active deployment.
    pub async fn messages(&self) -> Result<Vec<LogMessage>, AgentError> {
        let Some(id) = &self.active else {
            return Ok(Vec::new());
        };
        let contents = match fs::read_to_string(self.log_path(id)).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut messages = Vec::new();
        for line in contents.lines() {
            match serde_json::from_str::<LogMessage>(line) {
                Ok(msg) => messages.push(msg),
                Err(e) => error!("skipping malformed deployment log line: {}", e),
            }
        }
        Ok(messages)
    }

    /// Drop the active deployment's log file and stop collecting.
    pub async fn release(&mut self) {
        if let Some(id) = self.active.take() {
            if let Err(e) = fs::remove_file(self.log_path(&id)).await {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!("failed to remove deployment log: {}", e);
                }
            }
        }
    }
}
