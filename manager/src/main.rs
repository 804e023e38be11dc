//! Botyard - Entry Point
//!
//! Single-host manager that builds, deploys and supervises bot containers
//! from git repositories or prebuilt images.

use std::collections::HashMap;
use std::env;
use std::path::Path;

use anyhow::Context;
use botyard::app::options::AppOptions;
use botyard::app::run::run;
use botyard::filesys::file::File;
use botyard::logs::{init_logging, LogOptions};
use botyard::storage::settings::Settings;
use botyard::utils::{run_diagnostic, version_info};

use tracing::{error, info};

const DEFAULT_CONFIG_PATH: &str = "/etc/botyard/settings.json";

#[tokio::main]
async fn main() {
    // Parse command line arguments
    let args: Vec<String> = env::args().collect();
    let mut cli_args: HashMap<String, String> = HashMap::new();

    for arg in args.iter().skip(1) {
        if let Some((key, value)) = arg.split_once('=') {
            // Handle --key=value format
            let clean_key = key.trim_start_matches('-');
            cli_args.insert(clean_key.to_string(), value.to_string());
        } else if arg.starts_with("--") {
            // Handle standalone flags like --version
            let clean_key = arg.trim_start_matches('-');
            cli_args.insert(clean_key.to_string(), "true".to_string());
        }
    }

    // Print version and exit
    let version = version_info();
    if cli_args.contains_key("version") {
        match serde_json::to_string_pretty(&version) {
            Ok(json) => println!("{}", json),
            Err(_) => println!("{}", version.version),
        }
        return;
    }

    // Retrieve the settings file
    let config_path = cli_args
        .get("config")
        .map(String::as_str)
        .unwrap_or(DEFAULT_CONFIG_PATH);
    let settings = match load_settings(Path::new(config_path)).await {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("Unable to read settings: {:#}", e);
            std::process::exit(1);
        }
    };

    // Run diagnostics
    if cli_args.contains_key("diagnostic") || cli_args.contains_key("diag") {
        run_diagnostic(&settings).await;
        return;
    }

    // Initialize logging
    let log_options = LogOptions {
        log_level: settings.log_level.clone(),
        log_dir: settings.log_dir.clone(),
        json_format: settings.json_logs,
        ..Default::default()
    };
    let _log_guard = match init_logging(log_options) {
        Ok(guard) => guard,
        Err(e) => {
            println!("Failed to initialize logging: {e}");
            None
        }
    };

    // Run the manager
    let options = AppOptions::from_settings(&settings);
    info!("Running botyard with options: {:?}", options);
    let result = run(version.version, options, await_shutdown_signal()).await;
    if let Err(e) = result {
        error!("Failed to run botyard: {e}");
        std::process::exit(1);
    }
}

/// Settings from `path`, or the defaults when the file does not exist
async fn load_settings(path: &Path) -> anyhow::Result<Settings> {
    let file = File::new(path);
    if !file.exists().await {
        return Ok(Settings::default());
    }
    file.read_json::<Settings>()
        .await
        .with_context(|| format!("invalid settings file {}", path.display()))
}

async fn await_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let (mut sigterm, mut sigint) =
            match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
                (Ok(sigterm), Ok(sigint)) => (sigterm, sigint),
                _ => {
                    error!("Failed to install signal handlers, falling back to Ctrl+C");
                    let _ = tokio::signal::ctrl_c().await;
                    return;
                }
            };

        tokio::select! {
            _ = sigterm.recv() => {
                info!("SIGTERM received, shutting down...");
            }
            _ = sigint.recv() => {
                info!("SIGINT received, shutting down...");
            }
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
        }
        info!("Ctrl+C received, shutting down...");
    }
}
