mod config;
mod protocol;
mod rate_limit;
mod registry;
mod server;
mod store;

use std::net::ToSocketAddrs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, Result};
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use serde_json::Value;
use tracing_subscriber::EnvFilter;

use config::Config;
use server::DisplayGateway;
use store::{DeviceStore, FileDeviceStore};

#[derive(Debug, Clone, Parser)]
#[command(author, version, about = "Real-time presence and control gateway for Mizan displays")]
struct Cli {
    /// Path to TOML config file.
    #[arg(
        long,
        global = true,
        env = "MIZAN_DISPLAY_CONFIG",
        default_value = "mizan-display.toml"
    )]
    config: PathBuf,

    /// Override the listen address, e.g. 0.0.0.0:18793.
    #[arg(long, global = true)]
    bind: Option<String>,

    /// Override the device store path.
    #[arg(long = "store-path", global = true)]
    store_path: Option<PathBuf>,

    /// Log level filter, e.g. info,debug,trace.
    #[arg(long, global = true, env = "MIZAN_DISPLAY_LOG", default_value = "info")]
    log: String,

    #[command(subcommand)]
    command: Option<CliCommand>,
}

#[derive(Debug, Clone, Subcommand)]
enum CliCommand {
    /// Run the display gateway.
    Run,
    /// Run non-interactive diagnostics against the local setup.
    Doctor(DoctorArgs),
    /// Inspect the durable device store.
    Devices(DevicesArgs),
}

#[derive(Debug, Clone, Args, Default)]
struct DoctorArgs {
    /// Emit doctor output as JSON.
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Clone, Args)]
struct DevicesArgs {
    #[command(subcommand)]
    command: DevicesSubcommand,
}

#[derive(Debug, Clone, Subcommand)]
enum DevicesSubcommand {
    /// List stored devices for one tenant.
    List(DevicesListArgs),
}

#[derive(Debug, Clone, Args)]
struct DevicesListArgs {
    /// Tenant whose devices to list.
    #[arg(long)]
    tenant: String,
    /// Emit output as JSON.
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Clone, Serialize)]
struct DoctorReport {
    ok: bool,
    checks: Vec<DoctorCheck>,
}

#[derive(Debug, Clone, Serialize)]
struct DoctorCheck {
    id: String,
    status: String,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    detail: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.log)?;

    let command = cli.command.clone().unwrap_or(CliCommand::Run);
    match command {
        CliCommand::Run => run_gateway(cli).await,
        CliCommand::Doctor(args) => run_doctor(&cli.config, args),
        CliCommand::Devices(args) => run_devices_command(cli, args).await,
    }
}

async fn run_gateway(cli: Cli) -> Result<()> {
    let cfg = load_config(&cli)?;
    let store: Arc<dyn DeviceStore> = Arc::new(FileDeviceStore::open(cfg.store.path.clone()).await?);
    let gateway = DisplayGateway::new(cfg.server, store);
    gateway
        .run_until(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                tracing::warn!("ctrl-c listener failed: {err}");
                std::future::pending::<()>().await;
            }
            tracing::info!("shutdown signal received");
        })
        .await
}

async fn run_devices_command(cli: Cli, args: DevicesArgs) -> Result<()> {
    let DevicesSubcommand::List(list) = args.command;
    let cfg = load_config(&cli)?;
    let store = FileDeviceStore::open(cfg.store.path.clone()).await?;
    let devices = store.list_for_tenant(&list.tenant).await?;

    if list.json {
        let rows: Vec<Value> = devices.iter().map(protocol::device_summary).collect();
        println!("{}", serde_json::to_string_pretty(&rows)?);
        return Ok(());
    }

    if devices.is_empty() {
        println!("no devices stored for tenant {}", list.tenant);
        return Ok(());
    }
    for device in &devices {
        println!(
            "{}  {}  {}  lastSeen={}",
            device.id,
            device.status,
            device.name.as_deref().unwrap_or("-"),
            device.last_seen_ms
        );
    }
    Ok(())
}

fn load_config(cli: &Cli) -> Result<Config> {
    let mut cfg = Config::load(&cli.config)?;
    cfg.apply_cli_overrides(cli.bind.as_deref(), cli.store_path.as_deref());
    Ok(cfg)
}

fn run_doctor(config_path: &Path, args: DoctorArgs) -> Result<()> {
    let config_result = Config::load(config_path).map_err(|err| format!("{err:#}"));
    let report = build_doctor_report(config_result, config_path);
    print_doctor_report(&report, args.json);
    if report.ok {
        return Ok(());
    }
    Err(anyhow!("doctor reported blocking issues"))
}

fn build_doctor_report(
    config_result: std::result::Result<Config, String>,
    config_path: &Path,
) -> DoctorReport {
    let mut checks = Vec::new();
    let mut config = None;

    match config_result {
        Ok(cfg) => {
            checks.push(DoctorCheck {
                id: "config.load".to_owned(),
                status: "pass".to_owned(),
                message: format!("loaded {}", config_path.display()),
                detail: None,
            });
            config = Some(cfg);
        }
        Err(err) => {
            checks.push(DoctorCheck {
                id: "config.load".to_owned(),
                status: "fail".to_owned(),
                message: format!("failed to load {}", config_path.display()),
                detail: Some(err),
            });
        }
    }

    if let Some(cfg) = config.as_ref() {
        let bind_resolves = cfg
            .server
            .bind
            .to_socket_addrs()
            .map(|mut addrs| addrs.next().is_some())
            .unwrap_or(false);
        checks.push(DoctorCheck {
            id: "server.bind".to_owned(),
            status: if bind_resolves { "pass" } else { "fail" }.to_owned(),
            message: cfg.server.bind.clone(),
            detail: if bind_resolves {
                None
            } else {
                Some("address does not resolve".to_owned())
            },
        });

        let store_path = cfg.store.path.to_string_lossy().to_ascii_lowercase();
        let sqlite_selected = store_path.ends_with(".db")
            || store_path.ends_with(".sqlite")
            || store_path.ends_with(".sqlite3");
        let sqlite_enabled = cfg!(feature = "sqlite-store");
        checks.push(DoctorCheck {
            id: "store.backend".to_owned(),
            status: if sqlite_selected && !sqlite_enabled {
                "warn"
            } else {
                "pass"
            }
            .to_owned(),
            message: if sqlite_selected {
                "sqlite-backed device store requested".to_owned()
            } else {
                "json-backed device store requested".to_owned()
            },
            detail: Some(format!("feature sqlite-store enabled={sqlite_enabled}")),
        });
    }

    let ok = checks.iter().all(|check| check.status != "fail");
    DoctorReport { ok, checks }
}

fn print_doctor_report(report: &DoctorReport, json_output: bool) {
    if json_output {
        println!(
            "{}",
            serde_json::to_string_pretty(report)
                .unwrap_or_else(|_| "{\"ok\":false,\"checks\":[]}".to_owned())
        );
        return;
    }

    println!("doctor: {}", if report.ok { "ok" } else { "issues" });
    for check in &report.checks {
        let detail = check
            .detail
            .as_deref()
            .map(|value| format!(" ({value})"))
            .unwrap_or_default();
        println!(
            "[{}] {}: {}{}",
            check.status.to_uppercase(),
            check.id,
            check.message,
            detail
        );
    }
}

fn init_logging(filter: &str) -> Result<()> {
    let env = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));
    tracing_subscriber::fmt()
        .with_env_filter(env)
        .with_target(false)
        .init();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_defaults_to_run() {
        let cli = Cli::parse_from(["mizan-display-gateway"]);
        assert!(cli.command.is_none());
        assert_eq!(cli.config, PathBuf::from("mizan-display.toml"));
        assert_eq!(cli.log, "info");
    }

    #[test]
    fn cli_parses_doctor_command_and_flags() {
        let cli = Cli::parse_from(["mizan-display-gateway", "doctor", "--json"]);
        match cli.command {
            Some(CliCommand::Doctor(args)) => assert!(args.json),
            _ => panic!("expected doctor command"),
        }
    }

    #[test]
    fn cli_parses_devices_list() {
        let cli = Cli::parse_from([
            "mizan-display-gateway",
            "devices",
            "list",
            "--tenant",
            "t1",
            "--json",
        ]);
        match cli.command {
            Some(CliCommand::Devices(DevicesArgs {
                command: DevicesSubcommand::List(args),
            })) => {
                assert_eq!(args.tenant, "t1");
                assert!(args.json);
            }
            _ => panic!("expected devices list command"),
        }
    }

    #[test]
    fn cli_overrides_bind_and_store_path() {
        let cli = Cli::parse_from([
            "mizan-display-gateway",
            "--bind",
            "0.0.0.0:9000",
            "--store-path",
            "/tmp/devices.db",
        ]);
        assert_eq!(cli.bind.as_deref(), Some("0.0.0.0:9000"));
        assert_eq!(cli.store_path.as_deref(), Some(Path::new("/tmp/devices.db")));
    }

    #[test]
    fn doctor_report_marks_config_load_failure_as_blocking() {
        let report = build_doctor_report(
            Err("boom".to_owned()),
            Path::new("mizan-display.toml"),
        );
        assert!(!report.ok);
        assert_eq!(report.checks[0].id, "config.load");
        assert_eq!(report.checks[0].status, "fail");
    }

    #[test]
    fn doctor_report_passes_on_default_config() {
        let report = build_doctor_report(
            Ok(Config::default()),
            Path::new("mizan-display.toml"),
        );
        assert!(report.ok);
        assert!(report
            .checks
            .iter()
            .any(|check| check.id == "server.bind" && check.status == "pass"));
        assert!(report
            .checks
            .iter()
            .any(|check| check.id == "store.backend"));
    }
}
