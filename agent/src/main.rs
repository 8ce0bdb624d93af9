//! Update Agent - Entry Point
//!
//! A/B rootfs update agent for embedded Linux devices. Polls a deployment
//! backend, writes new images to the inactive partition and commits or
//! rolls back across reboots.

use std::collections::HashMap;
use std::env;

use updagent::app::options::AppOptions;
use updagent::app::run::{build_device, run};
use updagent::errors::AgentError;
use updagent::filesys::file::File;
use updagent::http::client::ApiClient;
use updagent::logs::{init_logging, LogOptions};
use updagent::storage::settings::Settings;
use updagent::utils::{read_key_value, version_info};

use tracing::{error, info};

const DEFAULT_CONFIG_PATH: &str = "/etc/updagent/updagent.conf";

const USAGE: &str = "\
usage: updagent [--config=<path>] [--log-level=<level>] <command>

commands:
  --daemon             run the update daemon
  --bootstrap          verify the device API token is in place
  --commit             commit a booted update
  --rollback           point the bootloader back at the previous partition
  --install=<file|uri> write an image to the inactive partition
  --show-artifact      print the currently installed artifact name
  --version            print version information";

#[tokio::main]
async fn main() {
    std::process::exit(run_cli().await);
}

async fn run_cli() -> i32 {
    // Parse command line arguments
    let args: Vec<String> = env::args().collect();
    let mut cli_args: HashMap<String, String> = HashMap::new();

    for arg in args.iter().skip(1) {
        if let Some((key, value)) = arg.split_once('=') {
            // Handle --key=value format
            let clean_key = key.trim_start_matches('-');
            cli_args.insert(clean_key.to_string(), value.to_string());
        } else if arg.starts_with('-') {
            // Handle standalone flags like --version
            let clean_key = arg.trim_start_matches('-');
            cli_args.insert(clean_key.to_string(), "true".to_string());
        } else {
            eprintln!("unrecognized argument: {}", arg);
            eprintln!("{}", USAGE);
            return 2;
        }
    }

    // Print version and exit
    if cli_args.contains_key("version") {
        match serde_json::to_string_pretty(&version_info()) {
            Ok(version) => println!("{}", version),
            Err(e) => {
                eprintln!("failed to render version info: {}", e);
                return 1;
            }
        }
        return 0;
    }

    // Retrieve the settings file
    let config_path = cli_args
        .get("config")
        .cloned()
        .unwrap_or_else(|| DEFAULT_CONFIG_PATH.to_string());
    let settings = match Settings::load(&config_path).await {
        Ok(settings) => settings,
        Err(e) => {
            if File::new(&config_path).exists().await {
                eprintln!("Unable to read settings file: {}", e);
                return 1;
            }
            eprintln!("No configuration file at {}, using defaults", config_path);
            Settings::default()
        }
    };

    // Initialize logging, with the CLI override taking precedence
    let log_level = match cli_args.get("log-level") {
        Some(level) => match level.parse() {
            Ok(level) => level,
            Err(e) => {
                eprintln!("{}", e);
                return 2;
            }
        },
        None => settings.log_level.clone(),
    };
    if let Err(e) = init_logging(LogOptions {
        log_level,
        ..Default::default()
    }) {
        eprintln!("Failed to initialize logging: {}", e);
    }

    let options = AppOptions::new(settings);

    let result = if cli_args.contains_key("daemon") {
        info!("Running update agent daemon");
        run(options.settings.clone(), await_shutdown_signal()).await
    } else if cli_args.contains_key("commit") {
        commit(&options).await
    } else if cli_args.contains_key("rollback") {
        rollback(&options).await
    } else if let Some(target) = cli_args.get("install") {
        install_artifact(target, &options).await
    } else if cli_args.contains_key("show-artifact") {
        show_artifact(&options).await
    } else if cli_args.contains_key("bootstrap") {
        bootstrap(&options).await
    } else {
        eprintln!("{}", USAGE);
        return 2;
    };

    match result {
        Ok(()) => 0,
        Err(e) => {
            error!("{}", e);
            1
        }
    }
}

async fn commit(options: &AppOptions) -> Result<(), AgentError> {
    let mut device = build_device(options);
    device.commit_update().await?;
    println!("Update committed.");
    Ok(())
}

async fn rollback(options: &AppOptions) -> Result<(), AgentError> {
    let mut device = build_device(options);
    device.swap_partitions().await?;
    println!("Bootloader now points at the previous partition.");
    Ok(())
}

async fn install_artifact(target: &str, options: &AppOptions) -> Result<(), AgentError> {
    let mut device = build_device(options);

    if target.starts_with("http://") || target.starts_with("https://") {
        let api = ApiClient::new(&options.client_config())?;
        let (mut image, size) = api.fetch_update("", target).await?;
        device.install_update(&mut image, size).await?;
    } else {
        let size = tokio::fs::metadata(target).await?.len() as i64;
        let mut image = tokio::fs::File::open(target).await?;
        device.install_update(&mut image, size).await?;
    }

    device.enable_updated_partition().await?;
    println!("Image installed to the inactive partition. Reboot to apply.");
    Ok(())
}

async fn show_artifact(options: &AppOptions) -> Result<(), AgentError> {
    let contents = File::new(&options.settings.artifact_info_file)
        .read_string()
        .await?;
    match read_key_value(&contents, "artifact_name") {
        Some(name) => {
            println!("{}", name);
            Ok(())
        }
        None => Err(AgentError::ConfigError(format!(
            "no artifact_name entry in {}",
            options.settings.artifact_info_file
        ))),
    }
}

async fn bootstrap(options: &AppOptions) -> Result<(), AgentError> {
    let token = File::new(&options.settings.tenant_token_path)
        .read_string()
        .await
        .map_err(|e| {
            AgentError::AuthError(format!(
                "cannot read token from {}: {}",
                options.settings.tenant_token_path, e
            ))
        })?;
    if token.trim().is_empty() {
        return Err(AgentError::AuthError(format!(
            "empty token in {}",
            options.settings.tenant_token_path
        )));
    }
    println!("Device token is in place.");
    Ok(())
}

async fn await_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let sigterm = signal(SignalKind::terminate());
        let sigint = signal(SignalKind::interrupt());
        match (sigterm, sigint) {
            (Ok(mut sigterm), Ok(mut sigint)) => {
                tokio::select! {
                    _ = sigterm.recv() => info!("SIGTERM received, shutting down..."),
                    _ = sigint.recv() => info!("SIGINT received, shutting down..."),
                }
            }
            _ => {
                if tokio::signal::ctrl_c().await.is_ok() {
                    info!("Ctrl+C received, shutting down...");
                }
            }
        }
    }

    #[cfg(not(unix))]
    {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Ctrl+C received, shutting down...");
        }
    }
}
