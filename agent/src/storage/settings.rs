//! Settings file management

use serde::{Deserialize, Serialize};

use crate::errors::AgentError;
use crate::filesys::file::File;
use crate::logs::LogLevel;

/// Agent settings, read from the configuration file at startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Log level
    #[serde(default)]
    pub log_level: LogLevel,

    /// Deployment server base URL
    #[serde(default = "default_server_url")]
    pub server_url: String,

    /// Optional path to a PEM-encoded CA certificate for server TLS
    /// verification. When absent, the system certificate store is used.
    #[serde(default)]
    pub server_cert: Option<String>,

    /// Skip TLS certificate verification
    #[serde(default)]
    pub skip_verify: bool,

    /// Path to the file holding the device API token
    #[serde(default = "default_token_path")]
    pub tenant_token_path: String,

    /// Path to the `device_type=...` file
    #[serde(default = "default_device_type_file")]
    pub device_type_file: String,

    /// Path to the `artifact_name=...` file of the running image
    #[serde(default = "default_artifact_info_file")]
    pub artifact_info_file: String,

    /// Block device path of rootfs partition A
    #[serde(default)]
    pub rootfs_part_a: String,

    /// Block device path of rootfs partition B
    #[serde(default)]
    pub rootfs_part_b: String,

    /// Seconds between update polls
    #[serde(default = "default_update_poll_interval")]
    pub update_poll_interval_secs: u64,

    /// Seconds between inventory submissions
    #[serde(default = "default_inventory_poll_interval")]
    pub inventory_poll_interval_secs: u64,

    /// Seconds between authorization retries
    #[serde(default = "default_retry_poll_interval")]
    pub retry_poll_interval_secs: u64,

    /// Cap for the report/upload retry backoff, in seconds
    #[serde(default = "default_retry_poll_max")]
    pub retry_poll_max_secs: u64,

    /// Wall-clock timeout for a single state script, in seconds
    #[serde(default = "default_state_script_timeout")]
    pub state_script_timeout_secs: u64,

    /// Sleep between retry-later attempts, in seconds
    #[serde(default = "default_state_script_retry_interval")]
    pub state_script_retry_interval_secs: u64,

    /// Cumulative retry-later budget per script, in seconds
    #[serde(default = "default_state_script_retry_total")]
    pub state_script_retry_total_secs: u64,

    /// Accepted state-script `version` file values
    #[serde(default = "default_supported_script_versions")]
    pub supported_script_versions: Vec<i32>,

    /// Directory of scripts baked into the image
    #[serde(default = "default_rootfs_scripts_path")]
    pub rootfs_scripts_path: String,

    /// Directory of scripts delivered with the update
    #[serde(default = "default_artifact_scripts_path")]
    pub artifact_scripts_path: String,

    /// Directory backing the persistent key-value store
    #[serde(default = "default_store_dir")]
    pub store_dir: String,

    /// Directory holding per-deployment logs
    #[serde(default = "default_deploy_log_dir")]
    pub deploy_log_dir: String,

    /// Command used to reboot the host
    #[serde(default = "default_reboot_cmd")]
    pub reboot_cmd: String,
}

fn default_server_url() -> String {
    "https://updates.example.com".to_string()
}

fn default_token_path() -> String {
    "/var/lib/updagent/authtoken".to_string()
}

fn default_device_type_file() -> String {
    "/var/lib/updagent/device_type".to_string()
}

fn default_artifact_info_file() -> String {
    "/etc/updagent/artifact_info".to_string()
}

fn default_update_poll_interval() -> u64 {
    1800
}

fn default_inventory_poll_interval() -> u64 {
    28800
}

fn default_retry_poll_interval() -> u64 {
    60
}

fn default_retry_poll_max() -> u64 {
    300
}

fn default_state_script_timeout() -> u64 {
    60
}

fn default_state_script_retry_interval() -> u64 {
    60
}

fn default_state_script_retry_total() -> u64 {
    180
}

fn default_supported_script_versions() -> Vec<i32> {
    vec![2, 3]
}

fn default_rootfs_scripts_path() -> String {
    "/etc/updagent/scripts".to_string()
}

fn default_artifact_scripts_path() -> String {
    "/var/lib/updagent/scripts".to_string()
}

fn default_store_dir() -> String {
    "/var/lib/updagent/store".to_string()
}

fn default_deploy_log_dir() -> String {
    "/var/lib/updagent/deployments".to_string()
}

fn default_reboot_cmd() -> String {
    "reboot".to_string()
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            log_level: LogLevel::Info,
            server_url: default_server_url(),
            server_cert: None,
            skip_verify: false,
            tenant_token_path: default_token_path(),
            device_type_file: default_device_type_file(),
            artifact_info_file: default_artifact_info_file(),
            rootfs_part_a: String::new(),
            rootfs_part_b: String::new(),
            update_poll_interval_secs: default_update_poll_interval(),
            inventory_poll_interval_secs: default_inventory_poll_interval(),
            retry_poll_interval_secs: default_retry_poll_interval(),
            retry_poll_max_secs: default_retry_poll_max(),
            state_script_timeout_secs: default_state_script_timeout(),
            state_script_retry_interval_secs: default_state_script_retry_interval(),
            state_script_retry_total_secs: default_state_script_retry_total(),
            supported_script_versions: default_supported_script_versions(),
            rootfs_scripts_path: default_rootfs_scripts_path(),
            artifact_scripts_path: default_artifact_scripts_path(),
            store_dir: default_store_dir(),
            deploy_log_dir: default_deploy_log_dir(),
            reboot_cmd: default_reboot_cmd(),
        }
    }
}

impl Settings {
    /// Load and validate settings from a JSON file.
    pub async fn load(path: &str) -> Result<Self, AgentError> {
        let file = File::new(path);
        let settings: Settings = file
            .read_json()
            .await
            .map_err(|e| AgentError::ConfigError(format!("{}: {}", path, e)))?;
        settings.validate()?;
        Ok(settings)
    }

    /// Validate invariants that would otherwise surface deep inside an
    /// update attempt.
    pub fn validate(&self) -> Result<(), AgentError> {
        if self.server_url.is_empty() {
            return Err(AgentError::ConfigError("server_url is empty".to_string()));
        }
        if !self.rootfs_part_a.is_empty()
            && !self.rootfs_part_b.is_empty()
            && self.rootfs_part_a == self.rootfs_part_b
        {
            return Err(AgentError::ConfigError(
                "rootfs_part_a and rootfs_part_b cannot be set to the same value".to_string(),
            ));
        }
        if self.supported_script_versions.is_empty() {
            return Err(AgentError::ConfigError(
                "supported_script_versions is empty".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let settings = Settings::default();
        assert_eq!(settings.update_poll_interval_secs, 1800);
        assert_eq!(settings.state_script_timeout_secs, 60);
        assert_eq!(settings.supported_script_versions, vec![2, 3]);
        settings.validate().unwrap();
    }

    #[test]
    fn test_same_partitions_rejected() {
        let settings = Settings {
            rootfs_part_a: "/dev/mmcblk0p2".to_string(),
            rootfs_part_b: "/dev/mmcblk0p2".to_string(),
            ..Default::default()
        };
        assert!(settings.validate().is_err());
    }
}
