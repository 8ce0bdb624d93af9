//! Production controller: wires the device, API client and script executor

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::deploylog::LogMessage;
use crate::device::Device;
use crate::errors::AgentError;
use crate::filesys::file::File;
use crate::http::client::ApiClient;
use crate::http::deployments::UpdateReader;
use crate::http::inventory::InventoryAttribute;
use crate::http::status::UpdateStatusData;
use crate::models::update::UpdateInfo;
use crate::scripts::{Launcher, ScriptExecutor};
use crate::state::Controller;
use crate::storage::settings::Settings;
use crate::utils::{read_key_value, version_info};

/// The update agent: implements [`Controller`] on top of the real device
/// and backend.
pub struct UpdateAgent {
    settings: Settings,
    api: ApiClient,
    device: Device,
    executor: Arc<Launcher>,
    auth_token: Option<String>,
}

impl UpdateAgent {
    pub fn new(
        settings: Settings,
        api: ApiClient,
        device: Device,
        executor: Arc<Launcher>,
    ) -> Self {
        Self {
            settings,
            api,
            device,
            executor,
            auth_token: None,
        }
    }

    fn token(&self) -> &str {
        self.auth_token.as_deref().unwrap_or("")
    }

    fn retry_cap(&self) -> Duration {
        Duration::from_secs(self.settings.retry_poll_max_secs)
    }

    async fn device_type(&self) -> Result<String, AgentError> {
        let contents = File::new(&self.settings.device_type_file)
            .read_string()
            .await?;
        read_key_value(&contents, "device_type").ok_or_else(|| {
            AgentError::ConfigError(format!(
                "no device_type entry in {}",
                self.settings.device_type_file
            ))
        })
    }

    async fn installed_artifact_name(&self) -> Result<String, AgentError> {
        let contents = File::new(&self.settings.artifact_info_file)
            .read_string()
            .await?;
        read_key_value(&contents, "artifact_name").ok_or_else(|| {
            AgentError::ConfigError(format!(
                "no artifact_name entry in {}",
                self.settings.artifact_info_file
            ))
        })
    }
}

#[async_trait]
impl Controller for UpdateAgent {
    fn script_executor(&self) -> Arc<dyn ScriptExecutor> {
        self.executor.clone()
    }

    fn update_poll_interval(&self) -> Duration {
        Duration::from_secs(self.settings.update_poll_interval_secs)
    }

    fn inventory_poll_interval(&self) -> Duration {
        Duration::from_secs(self.settings.inventory_poll_interval_secs)
    }

    fn retry_poll_interval(&self) -> Duration {
        Duration::from_secs(self.settings.retry_poll_interval_secs)
    }

    fn is_authorized(&self) -> bool {
        self.auth_token.is_some()
    }

    async fn authorize(&mut self) -> Result<(), AgentError> {
        let token = File::new(&self.settings.tenant_token_path)
            .read_string()
            .await
            .map_err(|e| {
                AgentError::AuthError(format!(
                    "cannot read token from {}: {}",
                    self.settings.tenant_token_path, e
                ))
            })?;
        let token = token.trim().to_string();
        if token.is_empty() {
            return Err(AgentError::AuthError(format!(
                "empty token in {}",
                self.settings.tenant_token_path
            )));
        }
        self.auth_token = Some(token);
        Ok(())
    }

    async fn check_update(&mut self) -> Result<Option<UpdateInfo>, AgentError> {
        let device_type = self.device_type().await?;
        let artifact_name = self.installed_artifact_name().await?;

        let update = self
            .api
            .check_update(self.token(), &artifact_name, &device_type)
            .await?;

        match update {
            Some(update) if !update.compatible_with(&device_type) => {
                warn!(
                    "deployment {} is not compatible with device type {}, skipping",
                    update.id, device_type
                );
                Ok(None)
            }
            Some(update) if update.artifact_name() == artifact_name => {
                debug!("artifact {} already installed", artifact_name);
                Ok(None)
            }
            update => Ok(update),
        }
    }

    async fn fetch_update(
        &mut self,
        update: &UpdateInfo,
    ) -> Result<(UpdateReader, i64), AgentError> {
        self.api.fetch_update(self.token(), update.uri()).await
    }

    async fn install_update(
        &mut self,
        mut image: UpdateReader,
        size: i64,
    ) -> Result<(), AgentError> {
        self.device.install_update(&mut image, size).await
    }

    async fn enable_updated_partition(&mut self) -> Result<(), AgentError> {
        self.device.enable_updated_partition().await
    }

    async fn verify_update(&mut self, update: &UpdateInfo) -> Result<(), AgentError> {
        if !self.device.has_update().await? {
            return Err(AgentError::VerificationError(
                "no update pending in the boot environment".to_string(),
            ));
        }
        let installed = self.installed_artifact_name().await?;
        if installed != update.artifact_name() {
            return Err(AgentError::VerificationError(format!(
                "booted artifact {} does not match deployed artifact {}",
                installed,
                update.artifact_name()
            )));
        }
        Ok(())
    }

    async fn commit_update(&mut self) -> Result<(), AgentError> {
        self.device.commit_update().await
    }

    async fn swap_partitions(&mut self) -> Result<(), AgentError> {
        self.device.swap_partitions().await
    }

    async fn has_unconfirmed_update(&self) -> Result<bool, AgentError> {
        self.device.has_unconfirmed_update().await
    }

    async fn reboot(&mut self) -> Result<(), AgentError> {
        self.device.reboot().await
    }

    async fn submit_inventory(&mut self) -> Result<(), AgentError> {
        let mut attributes = vec![InventoryAttribute::new(
            "updagent_version",
            version_info().version,
        )];

        match self.device_type().await {
            Ok(device_type) => attributes.push(InventoryAttribute::new("device_type", device_type)),
            Err(e) => warn!("cannot read device type for inventory: {}", e),
        }
        match self.installed_artifact_name().await {
            Ok(name) => attributes.push(InventoryAttribute::new("artifact_name", name)),
            Err(e) => warn!("cannot read artifact name for inventory: {}", e),
        }
        if let Some(hostname) = sysinfo::System::host_name() {
            attributes.push(InventoryAttribute::new("hostname", hostname));
        }
        if let Some(kernel) = sysinfo::System::kernel_version() {
            attributes.push(InventoryAttribute::new("kernel", kernel));
        }

        self.api.submit_inventory(self.token(), &attributes).await
    }

    async fn report_update_status(
        &mut self,
        update: &UpdateInfo,
        status: UpdateStatusData,
    ) -> Result<(), AgentError> {
        let token = self.token().to_string();
        let cap = self.retry_cap();
        self.api
            .report_status(&token, &update.id, &status, cap)
            .await
    }

    async fn upload_log(
        &mut self,
        update: &UpdateInfo,
        messages: &[LogMessage],
    ) -> Result<(), AgentError> {
        let token = self.token().to_string();
        let cap = self.retry_cap();
        self.api.upload_log(&token, &update.id, messages, cap).await
    }
}
