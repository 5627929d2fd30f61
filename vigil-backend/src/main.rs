//! # Vigil Backend
//!
//! Backend daemon for the Vigil monitoring platform.
//!
//! Every backend shares one PostgreSQL database with its peers. On startup it
//! applies the coordination schema, checks itself in as a `backend` operator,
//! and keeps checking in until shut down. A presence monitor reports the
//! agents currently assigned to this backend, including agents adopted from
//! peers that went silent.

mod config;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Args as ClapArgs, Parser, Subcommand};
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;
use vigil_core::presence::{
    MonitorRequest, OperatorKey, OperatorPresence, OperatorState, OperatorType,
    PostgresOperatorPresence,
};
use vigil_core::{CoordError, CoordinationConfig};

use crate::config::{BackendMetadata, CoordinationConfigSource};

/// CLI entry point
#[derive(Parser, Debug)]
#[command(name = "vigil-backend")]
#[command(about = "Vigil backend: presence, failover and coordination daemon")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,

    #[command(flatten)]
    db: DbArgs,

    #[command(flatten)]
    run: RunArgs,
}

#[derive(ClapArgs, Debug, Clone)]
struct DbArgs {
    /// PostgreSQL connection URL
    #[arg(long, env = "DATABASE_URL")]
    database_url: String,

    /// Maximum pooled connections
    #[arg(long, env = "VIGIL_MAX_CONNECTIONS", default_value_t = 10)]
    max_connections: u32,
}

#[derive(ClapArgs, Debug, Clone)]
struct RunArgs {
    /// Operator name of this backend. Defaults to a random instance name.
    #[arg(long, env = "VIGIL_BACKEND_NAME")]
    name: Option<String>,

    /// Namespace backends check in under
    #[arg(long, env = "VIGIL_NAMESPACE", default_value = "default")]
    namespace: String,

    /// How often to check in and poll for assigned agents (e.g. 10s)
    #[arg(
        long,
        env = "VIGIL_CHECK_IN_INTERVAL",
        default_value = "10s",
        value_parser = config::parse_duration
    )]
    check_in_interval: Duration,

    /// Silence after which peers consider this backend gone. Defaults to the
    /// configured presence timeout.
    #[arg(long, env = "VIGIL_CHECK_IN_TIMEOUT", value_parser = config::parse_duration)]
    check_in_timeout: Option<Duration>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the backend until interrupted (default)
    Run,
    /// Apply database migrations and exit
    Migrate,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let env_file_loaded = dotenvy::dotenv().is_ok();
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,vigil_core=info,sqlx=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    if env_file_loaded {
        info!("loaded .env file");
    }

    match cli.command.unwrap_or(Command::Run) {
        Command::Migrate => {
            let pool = connect(&cli.db).await?;
            migrate(&pool).await?;
            pool.close().await;
            Ok(())
        }
        Command::Run => run(cli.db, cli.run).await,
    }
}

async fn connect(args: &DbArgs) -> anyhow::Result<PgPool> {
    let url = config::validate_database_url(&args.database_url)?;
    let pool = PgPoolOptions::new()
        .max_connections(args.max_connections)
        .connect(url.as_str())
        .await
        .context("failed to connect to PostgreSQL")?;
    info!(
        host = url.host_str().unwrap_or("localhost"),
        database = url.path().trim_start_matches('/'),
        max_connections = args.max_connections,
        "connected to PostgreSQL"
    );
    Ok(pool)
}

async fn migrate(pool: &PgPool) -> anyhow::Result<()> {
    vigil_core::MIGRATOR
        .run(pool)
        .await
        .context("failed to apply coordination migrations")?;
    info!("coordination schema up to date");
    Ok(())
}

fn log_config_source(source: &CoordinationConfigSource) {
    match source {
        CoordinationConfigSource::Default => {
            info!("coordination config: built-in defaults")
        }
        CoordinationConfigSource::EnvPath(path) => {
            info!(path = %path.display(), "coordination config loaded from env path")
        }
        CoordinationConfigSource::EnvInline => {
            info!("coordination config loaded from inline environment json")
        }
        CoordinationConfigSource::File(path) => {
            info!(path = %path.display(), "coordination config loaded from file")
        }
    }
}

async fn run(db: DbArgs, args: RunArgs) -> anyhow::Result<()> {
    let (coordination, source) =
        config::load_from_env().context("failed to load coordination config")?;
    log_config_source(&source);

    let pool = connect(&db).await?;
    migrate(&pool).await?;

    let root = CancellationToken::new();
    spawn_signal_handler(root.clone());

    let instance = Uuid::now_v7().simple().to_string();
    let name = args
        .name
        .clone()
        .unwrap_or_else(|| format!("backend-{}", &instance[..12]));
    let key = OperatorKey::new(args.namespace.clone(), OperatorType::Backend, name);
    let state = backend_state(&key, &args, &coordination, instance)?;

    let presence = PostgresOperatorPresence::new(pool.clone(), coordination.presence);
    presence
        .check_in(&state)
        .await
        .with_context(|| format!("initial check-in of {key} failed"))?;
    info!(
        operator = %key,
        interval_ms = args.check_in_interval.as_millis() as u64,
        timeout_ms = state.check_in_timeout.as_millis() as u64,
        "backend checked in"
    );

    let check_ins = tokio::spawn(check_in_loop(
        presence.clone(),
        state,
        args.check_in_interval,
        root.clone(),
    ));

    let request = MonitorRequest {
        op_type: OperatorType::Agent,
        controller_type: OperatorType::Backend,
        controller_name: key.name.clone(),
        controller_namespace: key.namespace.clone(),
        every: args.check_in_interval,
        micromanage: false,
        error_handler: Some(Arc::new(|err: &CoordError| {
            warn!(error = %err, "agent monitor tick failed");
        })),
    };
    let mut batches = presence
        .monitor_operators(&root, request)
        .await
        .context("failed to start agent monitor")?;

    while let Some(batch) = batches.recv().await {
        for agent in &batch {
            if agent.present {
                info!(agent = %agent.key, "agent assigned to this backend");
            } else {
                warn!(agent = %agent.key, "agent stopped checking in");
            }
        }
    }

    root.cancel();
    if let Err(err) = check_ins.await {
        error!(error = %err, "check-in task failed");
    }
    presence.close().await;

    match presence.check_out(&key).await {
        Ok(()) => info!(operator = %key, "backend checked out"),
        Err(err) if err.is_not_found() => {}
        Err(err) => warn!(operator = %key, error = %err, "check-out failed"),
    }

    pool.close().await;
    info!("backend stopped");
    Ok(())
}

fn backend_state(
    key: &OperatorKey,
    args: &RunArgs,
    coordination: &CoordinationConfig,
    instance: String,
) -> anyhow::Result<OperatorState> {
    let timeout = args
        .check_in_timeout
        .unwrap_or_else(|| coordination.presence.default_check_in_timeout());
    if timeout <= args.check_in_interval {
        warn!(
            timeout_ms = timeout.as_millis() as u64,
            interval_ms = args.check_in_interval.as_millis() as u64,
            "check-in timeout does not exceed the check-in interval; peers may see this backend flap"
        );
    }

    let metadata = serde_json::to_value(BackendMetadata {
        version: env!("CARGO_PKG_VERSION").to_string(),
        instance,
    })
    .context("failed to encode backend metadata")?;

    Ok(OperatorState::new(key.clone(), timeout).with_metadata(metadata))
}

async fn check_in_loop(
    presence: PostgresOperatorPresence,
    state: OperatorState,
    every: Duration,
    scope: CancellationToken,
) {
    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // The first tick completes immediately; the initial check-in already ran.
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = scope.cancelled() => break,
            _ = ticker.tick() => {}
        }
        if let Err(err) = presence.check_in(&state).await {
            warn!(operator = %state.key, error = %err, "check-in failed");
        }
    }
}

fn spawn_signal_handler(root: CancellationToken) {
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("shutdown requested"),
            Err(err) => error!(error = %err, "failed to listen for shutdown signal"),
        }
        root.cancel();
    });
}
