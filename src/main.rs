use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{ArgAction, Parser};
use tracing::Level;

use switchboard_engine::loopback::LoopbackEngine;
use switchboard_engine::{Orchestrator, OrchestratorConfig, ReconnectPolicy};
use switchboard_store::sealing::load_or_create_key;
use switchboard_store::Database;
use switchboard_telemetry::{init_telemetry, TelemetryConfig};

/// Multi-tenant messaging session relay.
#[derive(Debug, Parser)]
#[command(name = "switchboard", version)]
struct Args {
    #[arg(long, env = "SWITCHBOARD_PORT", default_value_t = 9191)]
    port: u16,

    #[arg(long, env = "SWITCHBOARD_HOST", default_value = "0.0.0.0")]
    host: String,

    /// Defaults to ~/.switchboard
    #[arg(long, env = "SWITCHBOARD_DATA_DIR")]
    data_dir: Option<PathBuf>,

    #[arg(long, env = "SWITCHBOARD_LOG_LEVEL", default_value = "info")]
    log_level: Level,

    /// Skip persisting warn+ logs to <data-dir>/logs.db
    #[arg(long)]
    no_log_db: bool,

    /// Days of persisted logs kept across restarts; 0 keeps everything
    #[arg(long, default_value_t = 14)]
    log_retention_days: u32,

    #[arg(long, default_value_t = 5)]
    pairing_cycle_cap: u32,

    #[arg(long, default_value_t = 5)]
    reconnect_delay_secs: u64,

    #[arg(long, default_value_t = 60)]
    reconnect_max_delay_secs: u64,

    #[arg(long, default_value_t = 10)]
    max_reconnect_attempts: u32,

    /// Resume instances that were connected or pairing at last shutdown
    #[arg(long, env = "SWITCHBOARD_RESTORE_ON_BOOT", default_value_t = true, action = ArgAction::Set)]
    restore_on_boot: bool,

    /// Seconds before the loopback engine approves a pairing code
    #[arg(long, default_value_t = 10)]
    loopback_approve_secs: u64,
}

impl Args {
    fn data_dir(&self) -> PathBuf {
        self.data_dir.clone().unwrap_or_else(|| {
            std::env::var("HOME")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("/tmp"))
                .join(".switchboard")
        })
    }

    fn orchestrator_config(&self) -> OrchestratorConfig {
        OrchestratorConfig {
            pairing_cycle_cap: self.pairing_cycle_cap,
            reconnect: ReconnectPolicy {
                base_delay: Duration::from_secs(self.reconnect_delay_secs),
                max_delay: Duration::from_secs(self.reconnect_max_delay_secs),
                max_attempts: self.max_reconnect_attempts,
            },
            ..Default::default()
        }
    }
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    let data_dir = args.data_dir();
    std::fs::create_dir_all(&data_dir).expect("Failed to create data directory");

    let telemetry = Arc::new(init_telemetry(TelemetryConfig {
        log_level: args.log_level,
        module_levels: Vec::new(),
        log_to_sqlite: !args.no_log_db,
        log_db_path: data_dir.join("logs.db"),
        log_retention_days: args.log_retention_days,
    }));

    tracing::info!(data_dir = %data_dir.display(), "starting switchboard");

    let key = load_or_create_key(&data_dir.join("credential.key")).expect("Failed to load credential key");
    let db_path = data_dir.join("switchboard.db");
    let db = Database::open(&db_path, key).expect("Failed to open database");
    tracing::info!(path = %db_path.display(), "database opened");

    let engine = Arc::new(LoopbackEngine::auto(Duration::from_secs(args.loopback_approve_secs)));
    let orchestrator = Orchestrator::new(engine, db.clone(), args.orchestrator_config());

    let config = switchboard_server::ServerConfig {
        host: args.host.clone(),
        port: args.port,
        ..Default::default()
    };
    let handle = switchboard_server::start(config, orchestrator.clone(), db, Some(telemetry))
        .await
        .expect("Failed to start server");

    if args.restore_on_boot {
        match orchestrator.restore().await {
            Ok(summary) => tracing::info!(
                resumed = summary.resumed,
                reset = summary.reset,
                failed = summary.failed,
                "previous sessions restored"
            ),
            Err(e) => tracing::error!(error = %e, "restore failed"),
        }
    }

    tracing::info!(port = handle.port, engine = orchestrator.engine_name(), "switchboard ready");

    tokio::signal::ctrl_c()
        .await
        .expect("Failed to listen for ctrl+c");

    tracing::info!("shutting down");
    orchestrator.shutdown().await;
    handle.shutdown();
}
