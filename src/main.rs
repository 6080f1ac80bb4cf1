use clap::{Arg, ArgGroup, Command};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info, warn, Level};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use quarantine_agent::{
    clamav::{ClamAVClient, ClamAVClientImpl},
    config::Config,
    error::{Error, Result},
    scanner::mime_from_filename,
    scheduler::MaintenanceOutcome,
    service::QuarantineService,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    Daemon,
    Status,
    Maintenance,
    SealDb,
    Scan { file: PathBuf, mime: Option<String> },
}

#[derive(Debug)]
pub struct Args {
    config_path: Option<PathBuf>,
    log_level: Option<String>,
    dry_run: bool,
    action: Action,
}

pub async fn load_config_from_args(args: &Args) -> Result<Config> {
    if let Some(config_path) = &args.config_path {
        Config::load(config_path).await
    } else {
        Config::load_from_default_locations().await
    }
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<String> {
    serde_json::to_string_pretty(value)
        .map_err(|e| Error::Parse(format!("Failed to encode output: {}", e)))
}

async fn run_daemon(service: &QuarantineService) -> Result<()> {
    service.ensure_folder_structure().await?;
    service.probe_engine().await;

    if !service.validate_system_health().await {
        warn!("Starting with an unverified virus database; maintenance will attempt recovery");
    }

    if service.config().maintenance.enabled {
        let next = service.start_maintenance_scheduler().await?;
        info!(next_run = %next, "Maintenance scheduler running");
    } else {
        info!("Scheduled maintenance disabled");
    }

    info!(
        machine = %service.config().get_machine_name(),
        base_dir = %service.config().base_dir().display(),
        "Quarantine agent started"
    );

    match signal::ctrl_c().await {
        Ok(()) => info!("Received shutdown signal"),
        Err(err) => error!("Unable to listen for shutdown signal: {}", err),
    }

    info!("Shutting down...");
    service.stop_maintenance_scheduler().await;
    info!("Quarantine agent shutdown complete");
    Ok(())
}

async fn run_scan(service: &QuarantineService, file: &Path, mime: Option<&str>) -> Result<()> {
    let bytes = tokio::fs::read(file)
        .await
        .map_err(|e| Error::filesystem("read", file, e))?;
    let filename = file
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "upload".to_string());
    let mime = mime.unwrap_or_else(|| mime_from_filename(&filename));

    service.ensure_folder_structure().await?;
    let result = service.scan_detailed(&bytes, &filename, mime).await?;
    println!("{}", to_json(&result)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = parse_args();

    let config = load_config_from_args(&args).await?;
    let log_level = args
        .log_level
        .clone()
        .unwrap_or_else(|| config.agent.log_level.clone());
    init_logging(&log_level)?;

    info!("Starting quarantine agent v{}", env!("CARGO_PKG_VERSION"));

    if args.dry_run {
        info!("Configuration is valid. Dry run complete.");
        return Ok(());
    }

    let client: Arc<dyn ClamAVClient> = Arc::new(ClamAVClientImpl::from_config(&config.clamav)?);
    let service = QuarantineService::new(config, client)?;

    match &args.action {
        Action::Daemon => run_daemon(&service).await,
        Action::Status => {
            println!("{}", to_json(&service.status().await?)?);
            Ok(())
        }
        Action::Maintenance => {
            service.ensure_folder_structure().await?;
            let report = service.run_maintenance_now().await;
            println!("{}", to_json(&report)?);
            if report.outcome == MaintenanceOutcome::RestoreFailed {
                return Err(Error::RestoreFailed(
                    report.reason.unwrap_or_else(|| "restore failed".to_string()),
                ));
            }
            Ok(())
        }
        Action::SealDb => {
            let op = service.seal_database().await;
            if op.success {
                info!("Virus database sealed");
                Ok(())
            } else {
                Err(Error::DatabaseCorrupted(
                    op.reason.unwrap_or_else(|| "seal failed".to_string()),
                ))
            }
        }
        Action::Scan { file, mime } => run_scan(&service, file, mime.as_deref()).await,
    }
}

fn build_cli() -> Command {
    Command::new("quarantine-agent")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Upload quarantine and ClamAV signature database maintenance agent")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("Configuration file path")
                .num_args(1),
        )
        .arg(
            Arg::new("log-level")
                .short('l')
                .long("log-level")
                .value_name("LEVEL")
                .help("Log level (trace, debug, info, warn, error); overrides the config file")
                .num_args(1),
        )
        .arg(
            Arg::new("dry-run")
                .long("dry-run")
                .help("Validate configuration and exit")
                .action(clap::ArgAction::SetTrue),
        )
        .arg(
            Arg::new("status")
                .long("status")
                .help("Print a JSON status snapshot and exit")
                .action(clap::ArgAction::SetTrue),
        )
        .arg(
            Arg::new("maintenance")
                .long("maintenance")
                .help("Run one virus database maintenance pass and exit")
                .action(clap::ArgAction::SetTrue),
        )
        .arg(
            Arg::new("seal-db")
                .long("seal-db")
                .help("Write the checksum manifest for the current virus database")
                .action(clap::ArgAction::SetTrue),
        )
        .arg(
            Arg::new("scan")
                .long("scan")
                .value_name("FILE")
                .help("Push one file through the quarantine pipeline")
                .num_args(1),
        )
        .arg(
            Arg::new("mime")
                .long("mime")
                .value_name("TYPE")
                .help("Declared MIME type for --scan (default: from extension)")
                .requires("scan")
                .num_args(1),
        )
        .group(
            ArgGroup::new("action")
                .args(["status", "maintenance", "seal-db", "scan"])
                .multiple(false),
        )
}

fn args_from_matches(matches: &clap::ArgMatches) -> Args {
    let action = if let Some(file) = matches.get_one::<String>("scan") {
        Action::Scan {
            file: PathBuf::from(file),
            mime: matches.get_one::<String>("mime").cloned(),
        }
    } else if matches.get_flag("status") {
        Action::Status
    } else if matches.get_flag("maintenance") {
        Action::Maintenance
    } else if matches.get_flag("seal-db") {
        Action::SealDb
    } else {
        Action::Daemon
    };

    Args {
        config_path: matches.get_one::<String>("config").map(PathBuf::from),
        log_level: matches.get_one::<String>("log-level").cloned(),
        dry_run: matches.get_flag("dry-run"),
        action,
    }
}

fn parse_args() -> Args {
    args_from_matches(&build_cli().get_matches())
}

fn init_logging(log_level: &str) -> Result<()> {
    let level = match log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => return Err(Error::Config(format!("Invalid log level: {}", log_level))),
    };

    let directive = format!("quarantine_agent={}", level)
        .parse()
        .map_err(|e| Error::Config(format!("Invalid log directive: {}", e)))?;
    let env_filter = EnvFilter::from_default_env().add_directive(directive);

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false))
        .with(env_filter)
        .init();

    Ok(())
}
