//! Capability surface the state machine drives
//!
//! The production implementation wires the device, the API client and the
//! script executor together; tests substitute doubles.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::deploylog::LogMessage;
use crate::errors::AgentError;
use crate::http::deployments::UpdateReader;
use crate::http::status::UpdateStatusData;
use crate::models::update::UpdateInfo;
use crate::scripts::ScriptExecutor;

/// Everything a state handler may do to the outside world.
#[async_trait]
pub trait Controller: Send {
    /// The hook-script executor.
    fn script_executor(&self) -> Arc<dyn ScriptExecutor>;

    /// Seconds between update polls.
    fn update_poll_interval(&self) -> Duration;

    /// Seconds between inventory submissions.
    fn inventory_poll_interval(&self) -> Duration;

    /// Seconds between authorization retries.
    fn retry_poll_interval(&self) -> Duration;

    /// Whether a device API token is available.
    fn is_authorized(&self) -> bool;

    /// Obtain (or refresh) the device API token.
    async fn authorize(&mut self) -> Result<(), AgentError>;

    /// Poll the backend for the next deployment.
    async fn check_update(&mut self) -> Result<Option<UpdateInfo>, AgentError>;

    /// Open a streaming reader for the artifact body plus its declared size.
    async fn fetch_update(
        &mut self,
        update: &UpdateInfo,
    ) -> Result<(UpdateReader, i64), AgentError>;

    /// Stream the image into the inactive partition.
    async fn install_update(
        &mut self,
        image: UpdateReader,
        size: i64,
    ) -> Result<(), AgentError>;

    /// Make the freshly written partition the next boot candidate.
    async fn enable_updated_partition(&mut self) -> Result<(), AgentError>;

    /// Check the booted image matches the deployment.
    async fn verify_update(&mut self, update: &UpdateInfo) -> Result<(), AgentError>;

    /// Clear `upgrade_available` for a verified image.
    async fn commit_update(&mut self) -> Result<(), AgentError>;

    /// Point the bootloader back at the previous partition.
    async fn swap_partitions(&mut self) -> Result<(), AgentError>;

    /// `upgrade_available == 1` and `bootcount == 0`.
    async fn has_unconfirmed_update(&self) -> Result<bool, AgentError>;

    /// Reboot the host. Returns only on failure (or from a test double).
    async fn reboot(&mut self) -> Result<(), AgentError>;

    /// Push the inventory attribute set.
    async fn submit_inventory(&mut self) -> Result<(), AgentError>;

    /// Report a deployment status event.
    async fn report_update_status(
        &mut self,
        update: &UpdateInfo,
        status: UpdateStatusData,
    ) -> Result<(), AgentError>;

    /// Upload the collected deployment log.
    async fn upload_log(
        &mut self,
        update: &UpdateInfo,
        messages: &[LogMessage],
    ) -> Result<(), AgentError>;
}
