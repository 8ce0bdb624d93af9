//! Daemon initialization and run loop

use std::future::Future;
use std::sync::Arc;

use tokio::sync::watch;
use tracing::{error, info};

use crate::app::agent::UpdateAgent;
use crate::app::options::AppOptions;
use crate::bootenv::UBootEnv;
use crate::deploylog::DeploymentLogManager;
use crate::device::Device;
use crate::errors::AgentError;
use crate::http::client::ApiClient;
use crate::scripts::Launcher;
use crate::state::machine;
use crate::state::StateContext;
use crate::storage::settings::Settings;
use crate::storage::store::Store;

/// Run the update daemon until a fatal error or a shutdown signal.
pub async fn run(
    settings: Settings,
    shutdown_signal: impl Future<Output = ()> + Send + 'static,
) -> Result<(), AgentError> {
    info!("Initializing update agent...");
    let options = AppOptions::new(settings);

    let store = Arc::new(Store::open(&options.settings.store_dir).await?);

    let (stop_tx, stop_rx) = watch::channel(false);
    tokio::spawn(async move {
        shutdown_signal.await;
        info!("Shutdown signal received, stopping at the next state boundary...");
        let _ = stop_tx.send(true);
    });

    let mut agent = build_agent(&options, store.clone())?;
    let mut ctx = StateContext::new(
        store.clone(),
        DeploymentLogManager::new(&options.settings.deploy_log_dir),
        stop_rx,
    );

    let result = machine::run(&mut agent, &mut ctx).await;

    // A lost close is logged but not fatal.
    if let Err(e) = store.close().await {
        error!("failed to close data store: {}", e);
    }

    match &result {
        Ok(()) => info!("Daemon stopped"),
        Err(e) => error!("Daemon failed: {}", e),
    }
    result
}

/// Assemble the production controller.
pub fn build_agent(options: &AppOptions, store: Arc<Store>) -> Result<UpdateAgent, AgentError> {
    let executor = Arc::new(Launcher::new(store, options.scripts_config()));
    let boot_env = Arc::new(UBootEnv::new());
    let device = Device::new(boot_env, options.device_config());
    let api = ApiClient::new(&options.client_config())?;
    Ok(UpdateAgent::new(
        options.settings.clone(),
        api,
        device,
        executor,
    ))
}

/// Build just the device half, for the one-shot CLI operations.
pub fn build_device(options: &AppOptions) -> Device {
    Device::new(Arc::new(UBootEnv::new()), options.device_config())
}
