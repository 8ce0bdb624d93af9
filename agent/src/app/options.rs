//! Application configuration assembly

use std::path::PathBuf;
use std::time::Duration;

use crate::device::DeviceConfig;
use crate::http::client::ClientConfig;
use crate::scripts::ScriptsConfig;
use crate::storage::settings::Settings;

/// Options derived from the settings file, grouped per component.
#[derive(Debug, Clone)]
pub struct AppOptions {
    pub settings: Settings,
}

impl AppOptions {
    pub fn new(settings: Settings) -> Self {
        Self { settings }
    }

    pub fn client_config(&self) -> ClientConfig {
        ClientConfig {
            server_url: self.settings.server_url.clone(),
            server_cert: self.settings.server_cert.clone(),
            skip_verify: self.settings.skip_verify,
        }
    }

    pub fn device_config(&self) -> DeviceConfig {
        DeviceConfig {
            rootfs_part_a: self.settings.rootfs_part_a.clone(),
            rootfs_part_b: self.settings.rootfs_part_b.clone(),
            reboot_cmd: self.settings.reboot_cmd.clone(),
        }
    }

    pub fn scripts_config(&self) -> ScriptsConfig {
        ScriptsConfig {
            rootfs_scripts_path: PathBuf::from(&self.settings.rootfs_scripts_path),
            artifact_scripts_path: PathBuf::from(&self.settings.artifact_scripts_path),
            supported_versions: self.settings.supported_script_versions.clone(),
            timeout: Duration::from_secs(self.settings.state_script_timeout_secs),
            retry_interval: Duration::from_secs(self.settings.state_script_retry_interval_secs),
            retry_total_time: Duration::from_secs(self.settings.state_script_retry_total_secs),
        }
    }
}
