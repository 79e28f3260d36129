use std::fs;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, warn};

use wick_broker::BrokerClient;
use wick_config::{load_config, AppConfig};
use wick_core::BotSpec;
use wick_deriv::DerivClient;
use wick_engine::{EngineSettings, Reconciler, ShutdownSignal, StartReply, Supervisor};
use wick_store::SqliteStore;

use crate::telemetry::init_tracing;

#[derive(Parser)]
#[command(author, version, about = "Wick binary contract trading engine")]
pub struct Cli {
    /// Increases logging verbosity (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
    /// Selects which configuration environment to load (maps to config/{env}.toml)
    #[arg(long, default_value = "default")]
    env: String,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start every configured bot and trade until interrupted
    Run,
    /// Settle pending orders against the account statement, then exit
    Reconcile,
    /// Validate the configured bot definitions and print their identities
    Bots,
}

pub async fn run() -> Result<()> {
    let cli = Cli::parse();
    let config = load_config(Some(&cli.env)).context("failed to load configuration")?;

    let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| match cli.verbose {
        0 => config.log_level.clone(),
        1 => "debug".to_string(),
        _ => "trace".to_string(),
    });
    init_tracing(&filter, config.log_path.as_deref()).context("failed to initialize logging")?;

    match cli.command {
        Commands::Run => run_live(&config).await,
        Commands::Reconcile => run_reconcile(&config).await,
        Commands::Bots => list_bots(&config),
    }
}

async fn run_live(config: &AppConfig) -> Result<()> {
    let specs = resolve_bots(config)?;
    if specs.is_empty() {
        bail!("no bots configured; add a [[bots]] entry to the configuration");
    }

    let store = open_store(config)?;
    let settings = engine_settings(config);
    let (supervisor, handle) = Supervisor::new(settings.clone(), Arc::clone(&store));
    let supervisor_task = tokio::spawn(supervisor.run());

    let mut accepted = 0usize;
    for spec in specs {
        let name = spec.display_name();
        match handle.start_bot(spec).await? {
            StartReply::Accepted => {
                info!(bot = %name, "bot accepted");
                accepted += 1;
            }
            StartReply::AlreadyRunning => warn!(bot = %name, "duplicate bot definition ignored"),
            StartReply::Rejected(reason) => warn!(bot = %name, %reason, "bot rejected"),
        }
    }
    if accepted == 0 {
        drop(handle);
        supervisor_task.await?;
        bail!("no bots could be started");
    }

    let shutdown = ShutdownSignal::listening_to_ctrl_c();

    // The reconciler gets its own connection so a worker teardown never
    // takes the settlement safety net with it.
    let mut reconciliation = None;
    if config.deriv.api_token.is_some() {
        let client = Arc::new(DerivClient::account_only(settings.deriv.clone()));
        client
            .connect()
            .await
            .context("failed to connect the reconciliation client")?;
        let reconciler = Arc::new(Reconciler::new(
            client.clone(),
            Arc::clone(&store),
            settings.statement_page_size,
        ));
        let task = reconciler.spawn(settings.reconcile_interval, shutdown.clone());
        reconciliation = Some((client, task));
    } else {
        warn!("no api token configured; statement reconciliation is off");
    }

    info!(bots = accepted, "live session started, press ctrl-c to stop");
    shutdown.wait().await;
    info!("live session stopping");

    // Closing the handle makes the supervisor stop every worker and wait
    // for their final order flushes.
    drop(handle);
    supervisor_task.await?;
    if let Some((client, task)) = reconciliation {
        task.await?;
        client.disconnect().await;
    }
    info!("live session closed");
    Ok(())
}

async fn run_reconcile(config: &AppConfig) -> Result<()> {
    if config.deriv.api_token.is_none() {
        bail!("reconciliation requires deriv.api_token (or WICK__DERIV__API_TOKEN)");
    }
    let store = open_store(config)?;
    let settings = engine_settings(config);

    let client = Arc::new(DerivClient::account_only(settings.deriv.clone()));
    client.connect().await.context("failed to connect to deriv")?;
    let reconciler = Reconciler::new(
        client.clone(),
        Arc::clone(&store),
        settings.statement_page_size,
    );
    let outcome = reconciler.pass().await;
    client.disconnect().await;

    let settled = outcome?;
    info!(settled, "reconciliation pass finished");
    Ok(())
}

fn list_bots(config: &AppConfig) -> Result<()> {
    if config.bots.is_empty() {
        println!("no bots configured");
        return Ok(());
    }
    let mut invalid = 0usize;
    for definition in &config.bots {
        match definition.resolve() {
            Ok(spec) => println!(
                "{}  [{}]  stake {} {}, duration {}{}",
                spec.display_name(),
                spec.key(),
                spec.stake,
                spec.currency,
                spec.duration,
                spec.duration_unit,
            ),
            Err(err) => {
                invalid += 1;
                println!("{}  invalid: {err:#}", definition.symbol);
            }
        }
    }
    if invalid > 0 {
        bail!("{invalid} invalid bot definition(s)");
    }
    Ok(())
}

fn resolve_bots(config: &AppConfig) -> Result<Vec<BotSpec>> {
    let mut specs = Vec::with_capacity(config.bots.len());
    for definition in &config.bots {
        let spec = definition
            .resolve()
            .with_context(|| format!("invalid bot definition for '{}'", definition.symbol))?;
        specs.push(spec);
    }
    Ok(specs)
}

fn open_store(config: &AppConfig) -> Result<Arc<SqliteStore>> {
    let path = config.database_path();
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir)
            .with_context(|| format!("failed to create data directory {}", dir.display()))?;
    }
    let store = SqliteStore::open(&path)
        .with_context(|| format!("failed to open store at {}", path.display()))?;
    Ok(Arc::new(store))
}

fn engine_settings(config: &AppConfig) -> EngineSettings {
    EngineSettings {
        deriv: deriv_config(config),
        history_bars: config.engine.history_bars,
        order_flush_interval: Duration::from_secs(config.engine.order_flush_interval_secs),
        reconcile_interval: Duration::from_secs(config.engine.reconcile_interval_secs),
        statement_page_size: config.engine.statement_page_size,
    }
}

fn deriv_config(config: &AppConfig) -> wick_deriv::DerivConfig {
    let mut deriv = wick_deriv::DerivConfig::new(config.deriv.app_id.clone())
        .with_endpoint(config.deriv.endpoint.clone());
    deriv.api_token = config.deriv.api_token.clone();
    deriv
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::path::PathBuf;

    fn app_config() -> AppConfig {
        AppConfig {
            log_level: "info".to_string(),
            log_path: None,
            data_dir: PathBuf::from("./data"),
            deriv: wick_config::DerivConfig {
                endpoint: "wss://example.test/ws".to_string(),
                app_id: "4242".to_string(),
                api_token: Some("tok".to_string()),
            },
            store: wick_config::StoreConfig::default(),
            engine: wick_config::EngineConfig {
                history_bars: 120,
                order_flush_interval_secs: 5,
                reconcile_interval_secs: 7,
                statement_page_size: 50,
            },
            bots: Vec::new(),
        }
    }

    #[test]
    fn engine_settings_map_the_configured_cadences() {
        let settings = engine_settings(&app_config());
        assert_eq!(settings.history_bars, 120);
        assert_eq!(settings.order_flush_interval, Duration::from_secs(5));
        assert_eq!(settings.reconcile_interval, Duration::from_secs(7));
        assert_eq!(settings.statement_page_size, 50);
        assert_eq!(settings.deriv.endpoint, "wss://example.test/ws");
        assert_eq!(settings.deriv.app_id, "4242");
        assert_eq!(settings.deriv.api_token.as_deref(), Some("tok"));
    }

    #[test]
    fn cli_parses_global_flags() {
        let cli = Cli::try_parse_from(["wick", "-vv", "--env", "staging", "bots"]).unwrap();
        assert_eq!(cli.verbose, 2);
        assert_eq!(cli.env, "staging");
        assert!(matches!(cli.command, Commands::Bots));
    }

    #[test]
    fn run_subcommand_takes_no_arguments() {
        let cli = Cli::try_parse_from(["wick", "run"]).unwrap();
        assert_eq!(cli.verbose, 0);
        assert_eq!(cli.env, "default");
        assert!(matches!(cli.command, Commands::Run));
    }
}
