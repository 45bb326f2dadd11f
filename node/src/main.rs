use anyhow::{Context, Result};
use clap::{value_parser, Arg, ArgAction, ArgMatches, Command};
use config::{Config, Environment, File};
use std::path::PathBuf;
use std::str::FromStr;
use testchain_chains::{ChainError, ChainManager, ManagerConfig};
use testchain_types::{ChainConfig, ChainEventKind, ChainKind, ChainStatus};
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const TESTCHAIN_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Exit codes of the CLI wrapper.
const EXIT_INVALID_CONFIG: i32 = 64;
const EXIT_RESOURCE_CONFLICT: i32 = 65;
const EXIT_START_FAILED: i32 = 66;
const EXIT_UNEXPECTED: i32 = 70;

fn cli() -> Command {
    Command::new("testchain-node")
        .version(TESTCHAIN_VERSION)
        .about("Manage local Ethereum test chains")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("Configuration file path")
                .global(true),
        )
        .arg(
            Arg::new("pretty")
                .long("pretty")
                .action(ArgAction::SetTrue)
                .help("Human-readable log output")
                .global(true),
        )
        .subcommand(
            Command::new("start")
                .about("Start a chain and stream its events until interrupted")
                .arg(
                    Arg::new("type")
                        .long("type")
                        .value_name("EVM")
                        .default_value("geth")
                        .help("EVM implementation: geth or ganache"),
                )
                .arg(
                    Arg::new("accounts")
                        .long("accounts")
                        .value_parser(value_parser!(u32))
                        .default_value("1")
                        .help("Number of pre-funded accounts"),
                )
                .arg(
                    Arg::new("block-time-ms")
                        .long("block-time-ms")
                        .value_parser(value_parser!(u64))
                        .default_value("0")
                        .help("Mine interval in milliseconds; 0 means instamine"),
                )
                .arg(
                    Arg::new("network-id")
                        .long("network-id")
                        .value_parser(value_parser!(u64))
                        .default_value("999"),
                )
                .arg(
                    Arg::new("http-port")
                        .long("http-port")
                        .value_parser(value_parser!(u16)),
                )
                .arg(
                    Arg::new("ws-port")
                        .long("ws-port")
                        .value_parser(value_parser!(u16)),
                )
                .arg(
                    Arg::new("db-path")
                        .long("db-path")
                        .value_name("DIR")
                        .help("Data directory; allocated under base_path when absent"),
                )
                .arg(
                    Arg::new("output-log")
                        .long("output-log")
                        .value_name("FILE")
                        .help("Append EVM output to this file"),
                )
                .arg(
                    Arg::new("snapshot")
                        .long("snapshot")
                        .value_name("ID")
                        .help("Seed the data directory from this snapshot"),
                )
                .arg(
                    Arg::new("clean-on-stop")
                        .long("clean-on-stop")
                        .action(ArgAction::SetTrue)
                        .help("Wipe the data directory after a clean stop"),
                ),
        )
        .subcommand(
            Command::new("resume")
                .about("Start a previously stopped chain from its surviving data directory")
                .arg(Arg::new("id").required(true).value_name("CHAIN_ID")),
        )
        .subcommand(
            Command::new("snapshots")
                .about("Inspect the snapshot index")
                .subcommand(Command::new("list").about("List indexed snapshots"))
                .subcommand(
                    Command::new("remove")
                        .about("Delete a snapshot's archive and index entry")
                        .arg(Arg::new("id").required(true).value_name("SNAPSHOT_ID")),
                ),
        )
        .subcommand(Command::new("version").about("Print EVM binary versions"))
}

fn init_tracing(pretty: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if pretty {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().pretty())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
}

/// Layer the manager config from an optional file and `TESTCHAIN_`-prefixed
/// environment variables over the defaults.
fn load_config(path: Option<&String>) -> Result<ManagerConfig> {
    let mut builder = Config::builder();
    if let Some(path) = path {
        builder = builder.add_source(File::with_name(path));
    }
    let raw = builder
        .add_source(Environment::with_prefix("TESTCHAIN"))
        .build()
        .context("failed to read configuration")?;
    raw.try_deserialize::<ManagerConfig>()
        .context("invalid configuration")
}

fn chain_config_from_args(matches: &ArgMatches) -> Result<ChainConfig, ChainError> {
    let kind = matches
        .get_one::<String>("type")
        .map(String::as_str)
        .unwrap_or("geth");
    let kind = ChainKind::from_str(kind).map_err(|e| ChainError::Validation(e.to_string()))?;
    let mut config = ChainConfig::new(kind);
    config.accounts_requested = *matches.get_one::<u32>("accounts").unwrap_or(&1);
    config.block_mine_time_ms = *matches.get_one::<u64>("block-time-ms").unwrap_or(&0);
    config.network_id = *matches.get_one::<u64>("network-id").unwrap_or(&999);
    config.http_port = matches.get_one::<u16>("http-port").copied();
    config.ws_port = matches.get_one::<u16>("ws-port").copied();
    config.db_path = matches.get_one::<String>("db-path").map(PathBuf::from);
    config.output_log_path = matches.get_one::<String>("output-log").map(PathBuf::from);
    config.snapshot_id = matches.get_one::<String>("snapshot").cloned();
    config.clean_on_stop = matches.get_flag("clean-on-stop");
    Ok(config)
}

fn exit_code(error: &ChainError) -> i32 {
    match error {
        ChainError::Validation(_) | ChainError::Serialization(_) => EXIT_INVALID_CONFIG,
        ChainError::ResourceConflict | ChainError::AlreadyExists(_) => EXIT_RESOURCE_CONFLICT,
        ChainError::StartFailure(_) | ChainError::Timeout(_) => EXIT_START_FAILED,
        _ => EXIT_UNEXPECTED,
    }
}

/// Run a chain in the foreground, printing its events as JSON lines, until
/// the chain reaches a terminal state or the operator interrupts.
async fn run_chain(
    manager: &ChainManager,
    mut events: testchain_chains::EventStream,
    id: String,
) -> i32 {
    println!("{}", serde_json::json!({"ok": true, "id": id}));
    loop {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else {
                    return 0;
                };
                match serde_json::to_string(&event) {
                    Ok(line) => println!("{line}"),
                    Err(e) => error!("failed to encode event: {e}"),
                }
                match event.kind {
                    ChainEventKind::Stopped => return 0,
                    ChainEventKind::StatusChanged(ChainStatus::Failed) => {
                        return EXIT_START_FAILED;
                    }
                    _ => {}
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted, stopping chain");
                if let Err(e) = manager.stop(&id).await {
                    error!("stop failed: {e}");
                    manager.shutdown().await;
                    return exit_code(&e);
                }
            }
        }
    }
}

async fn run(matches: ArgMatches) -> i32 {
    let manager_config = match load_config(matches.get_one::<String>("config")) {
        Ok(config) => config,
        Err(e) => {
            error!("{e:#}");
            return EXIT_INVALID_CONFIG;
        }
    };
    let manager = match ChainManager::new(manager_config) {
        Ok(manager) => manager,
        Err(e) => {
            error!("failed to boot chain manager: {e}");
            return exit_code(&e);
        }
    };

    match matches.subcommand() {
        Some(("start", sub)) => {
            let config = match chain_config_from_args(sub) {
                Ok(config) => config,
                Err(e) => {
                    error!("{e}");
                    return exit_code(&e);
                }
            };
            match manager.start(config).await {
                Ok((id, events)) => run_chain(&manager, events, id).await,
                Err(e) => {
                    error!("start failed: {e}");
                    exit_code(&e)
                }
            }
        }
        Some(("resume", sub)) => {
            let id = sub.get_one::<String>("id").cloned().unwrap_or_default();
            match manager.start_existing(&id).await {
                Ok((id, events)) => run_chain(&manager, events, id).await,
                Err(e) => {
                    error!("resume failed: {e}");
                    exit_code(&e)
                }
            }
        }
        Some(("snapshots", sub)) => match sub.subcommand() {
            Some(("remove", remove)) => {
                let id = remove.get_one::<String>("id").cloned().unwrap_or_default();
                match manager.snapshots().remove(&id) {
                    Ok(()) => 0,
                    Err(e) => {
                        error!("remove failed: {e}");
                        EXIT_UNEXPECTED
                    }
                }
            }
            _ => match manager.snapshots().list() {
                Ok(snapshots) => {
                    for details in snapshots {
                        match serde_json::to_string(&details) {
                            Ok(line) => println!("{line}"),
                            Err(e) => error!("failed to encode snapshot: {e}"),
                        }
                    }
                    0
                }
                Err(e) => {
                    error!("list failed: {e}");
                    EXIT_UNEXPECTED
                }
            },
        },
        Some(("version", _)) => {
            println!("testchain-node {TESTCHAIN_VERSION}");
            println!("{}", manager.version().await);
            0
        }
        _ => {
            let _ = cli().print_help();
            EXIT_INVALID_CONFIG
        }
    }
}

#[tokio::main]
async fn main() {
    let matches = cli().get_matches();
    init_tracing(matches.get_flag("pretty"));
    let code = run(matches).await;
    std::process::exit(code);
}
