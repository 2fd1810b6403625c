//! shipwright - Entry Point
//!
//! Builds a container image, publishes it and swaps it in on a remote host,
//! rolling back when the new instance does not come up healthy.

use std::collections::HashMap;
use std::env;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use shipwright::app::options::AppOptions;
use shipwright::app::run::{build_orchestrator, run};
use shipwright::deploy::builder::detect_revision;
use shipwright::deploy::orchestrator::DeployRequest;
use shipwright::deploy::report::{EXIT_CONFIG, EXIT_FAILED, EXIT_IN_FLIGHT};
use shipwright::errors::DeployError;
use shipwright::filesys::file::File;
use shipwright::logs::{init_logging, LogOptions};
use shipwright::models::artifact::SourceRef;
use shipwright::storage::layout::StorageLayout;
use shipwright::storage::settings::Settings;
use shipwright::utils::version_info;

use tracing::{debug, error, info};

const DEFAULT_TAG: &str = "latest";
const DEFAULT_LOG_LINES: usize = 100;

#[tokio::main]
async fn main() -> ExitCode {
    // Parse command line arguments
    let mut cli_args: HashMap<String, String> = HashMap::new();
    let mut positional: Vec<String> = Vec::new();

    for arg in env::args().skip(1) {
        if let Some(flag) = arg.strip_prefix("--") {
            match flag.split_once('=') {
                // Handle --key=value format
                Some((key, value)) => cli_args.insert(key.to_string(), value.to_string()),
                // Handle standalone flags like --version
                None => cli_args.insert(flag.to_string(), "true".to_string()),
            };
        } else {
            positional.push(arg);
        }
    }

    // Print version and exit
    if cli_args.contains_key("version") {
        match serde_json::to_string_pretty(&version_info()) {
            Ok(json) => println!("{}", json),
            Err(e) => eprintln!("{}", e),
        }
        return ExitCode::SUCCESS;
    }

    // Pick up a local .env before reading overrides
    let env_file = dotenvy::dotenv().ok();

    let layout = StorageLayout::default();
    let settings_file = match cli_args.get("settings") {
        Some(path) => File::new(PathBuf::from(path)),
        None => layout.settings_file(),
    };
    let settings = match load_settings(&settings_file).await {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("{}", e);
            return exit(EXIT_CONFIG);
        }
    };

    // Initialize logging
    let log_options = LogOptions {
        log_level: settings.log_level.clone(),
        json_format: settings.log_json,
        log_dir: settings
            .log_to_file
            .then(|| layout.logs_dir().path().to_path_buf()),
        ..Default::default()
    };
    let _log_guard = match init_logging(log_options) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("Failed to initialize logging: {e}");
            None
        }
    };
    if let Some(path) = env_file {
        debug!("Loaded environment from {}", path.display());
    }

    if let Err(e) = settings.validate() {
        error!("{}", e);
        return exit(EXIT_CONFIG);
    }
    let credential = match settings.registry_credential(|key| env::var(key).ok()) {
        Ok(credential) => credential,
        Err(e) => {
            error!("{}", e);
            return exit(EXIT_CONFIG);
        }
    };

    let options = AppOptions::from_settings(&settings, layout, credential);
    let orchestrator = match build_orchestrator(&options) {
        Ok(orchestrator) => orchestrator,
        Err(e) => {
            error!("Failed to set up the deployment: {}", e);
            return exit(EXIT_CONFIG);
        }
    };

    // Print the authoritative record and exit
    if cli_args.contains_key("status") {
        return match orchestrator.status().await {
            Ok(Some(record)) => print_json(&record),
            Ok(None) => {
                println!("No deployment of {} recorded", orchestrator.slot());
                ExitCode::SUCCESS
            }
            Err(e) => {
                error!("{}", e);
                exit(EXIT_FAILED)
            }
        };
    }

    // Tail the remote service logs and exit
    if let Some(lines) = cli_args.get("logs") {
        let lines = lines.parse().unwrap_or(DEFAULT_LOG_LINES);
        return match orchestrator.tail_logs(lines).await {
            Ok(lines) => {
                for line in lines {
                    println!("{}", line);
                }
                ExitCode::SUCCESS
            }
            Err(e) => {
                error!("{}", e);
                exit(EXIT_FAILED)
            }
        };
    }

    // Deploy
    let tag = cli_args
        .get("tag")
        .or(positional.first())
        .cloned()
        .unwrap_or_else(|| DEFAULT_TAG.to_string());
    let revision = match cli_args.get("revision") {
        Some(revision) => Some(revision.clone()),
        None => detect_revision(&options.context, Duration::from_secs(10)).await,
    };
    let request = DeployRequest {
        tag,
        source: SourceRef {
            context: options.context.clone(),
            revision,
        },
        descriptor: options.descriptor.clone(),
    };

    info!("Running shipwright {} for {}", version_info().version, orchestrator.slot());
    match run(&orchestrator, request, await_shutdown_signal()).await {
        Ok(report) => {
            if cli_args.contains_key("json") {
                print_json(&report);
            } else {
                print!("{}", report);
            }
            exit(report.exit_code())
        }
        Err(e @ DeployError::AttemptInFlight { .. }) => {
            error!("{}", e);
            exit(EXIT_IN_FLIGHT)
        }
        Err(e @ DeployError::Config(_)) => {
            error!("{}", e);
            exit(EXIT_CONFIG)
        }
        Err(e) => {
            error!("Failed to run the deployment: {}", e);
            exit(EXIT_FAILED)
        }
    }
}

async fn load_settings(file: &File) -> Result<Settings, DeployError> {
    let mut settings = Settings::load(file).await?;
    settings.apply_env(|key| env::var(key).ok())?;
    Ok(settings)
}

fn print_json<T: serde::Serialize>(value: &T) -> ExitCode {
    match serde_json::to_string_pretty(value) {
        Ok(json) => {
            println!("{}", json);
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("{}", e);
            exit(EXIT_FAILED)
        }
    }
}

fn exit(code: i32) -> ExitCode {
    ExitCode::from(u8::try_from(code).unwrap_or(1))
}

async fn await_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let (mut sigterm, mut sigint) = match (
            signal(SignalKind::terminate()),
            signal(SignalKind::interrupt()),
        ) {
            (Ok(sigterm), Ok(sigint)) => (sigterm, sigint),
            _ => {
                error!("Failed to install signal handlers; cancellation disabled");
                return std::future::pending().await;
            }
        };

        tokio::select! {
            _ = sigterm.recv() => {
                info!("SIGTERM received");
            }
            _ = sigint.recv() => {
                info!("SIGINT received");
            }
        }
    }

    #[cfg(not(unix))]
    {
        if tokio::signal::ctrl_c().await.is_err() {
            return std::future::pending().await;
        }
        info!("Ctrl+C received");
    }
}
