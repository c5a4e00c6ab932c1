mod config;

use std::sync::Arc;

use clap::Parser;

use pulse_core::event::{Channel, ObjectType};
use pulse_dispatch::{Dispatcher, HandlerRegistry};
use pulse_reconcile::{FirstResponseReconciler, HttpRecordSink};
use pulse_source::transport::{PollTransport, PushTransport};
use pulse_source::{ChannelSource, HttpTransport};
use pulse_store::cursors::CursorRepo;
use pulse_store::database::Database;
use pulse_store::dead_letters::DeadLetterRepo;
use pulse_telemetry::{HealthRegistry, MetricsRecorder, TelemetryConfig};

use config::AppConfig;

#[derive(Parser)]
#[command(name = "pulse", about = "Lead first-response pipeline consumer")]
struct Cli {
    /// Override the cursor/dead-letter database path.
    #[arg(long)]
    db: Option<std::path::PathBuf>,

    /// Never use the push transport, poll the changes endpoint only.
    #[arg(long)]
    poll_only: bool,

    /// Clear the stored replay cursor for a channel, then exit.
    /// The channel is reprocessed from "now" on the next run.
    #[arg(long, value_name = "CHANNEL")]
    reset_channel: Option<String>,

    /// Print recent dead-lettered events as JSON, then exit.
    #[arg(long, value_name = "LIMIT")]
    dead_letters: Option<u32>,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // The offline maintenance paths only need the local database.
    if cli.reset_channel.is_some() || cli.dead_letters.is_some() {
        run_maintenance(&cli);
        return;
    }

    let mut app = AppConfig::from_env().unwrap_or_else(|e| {
        eprintln!("pulse: {e}");
        std::process::exit(2);
    });
    if let Some(db) = cli.db {
        app.db_path = db;
    }
    app.source.poll_only = app.source.poll_only || cli.poll_only;

    let _telemetry = pulse_telemetry::init_telemetry(TelemetryConfig {
        json_output: app.log_json,
        log_db_path: config::data_dir().join("pulse-logs.db"),
        ..TelemetryConfig::default()
    });
    tracing::info!(channels = app.channels.len(), poll_only = app.source.poll_only, "pulse starting");

    let db = Database::open(&app.db_path).expect("failed to open database");
    let cursors = Arc::new(CursorRepo::new(db.clone()));
    let dead_letters = Arc::new(DeadLetterRepo::new(db));

    let transport = HttpTransport::new(app.gateway_url.clone(), app.gateway_token.clone())
        .expect("failed to build gateway transport");
    let source = Arc::new(ChannelSource::new(
        Arc::new(transport.clone()) as Arc<dyn PushTransport>,
        Arc::new(transport) as Arc<dyn PollTransport>,
        app.source.clone(),
    ));

    let sink = Arc::new(
        HttpRecordSink::new(app.sink_url.clone(), app.sink_token.clone())
            .expect("failed to build record sink"),
    );

    let metrics = Arc::new(MetricsRecorder::new());
    let health = Arc::new(HealthRegistry::new());

    let reconciler = Arc::new(FirstResponseReconciler::new(sink, Arc::clone(&metrics)));
    let mut registry = HandlerRegistry::new();
    registry.register(ObjectType::ResponseTask, reconciler.clone());
    registry.register(ObjectType::ResponseMessage, reconciler);

    let dispatcher = Dispatcher::new(
        source,
        Arc::new(registry),
        cursors,
        dead_letters,
        metrics,
        health,
        app.dispatch.clone(),
    );
    dispatcher.start(app.channels.clone());
    tracing::info!("pulse ready");

    tokio::signal::ctrl_c()
        .await
        .expect("failed to listen for ctrl+c");
    tracing::info!("shutdown signal received");
    dispatcher.shutdown().await;
}

fn run_maintenance(cli: &Cli) {
    let db_path = cli
        .db
        .clone()
        .or_else(|| std::env::var("PULSE_DB_PATH").ok().map(Into::into))
        .unwrap_or_else(|| config::data_dir().join("pulse.db"));
    let db = Database::open(&db_path).expect("failed to open database");

    if let Some(channel) = &cli.reset_channel {
        let cursors = CursorRepo::new(db.clone());
        let cleared = cursors
            .reset(&Channel::new(channel.clone()))
            .expect("cursor reset failed");
        if cleared {
            println!("cursor cleared for {channel}");
        } else {
            println!("no cursor stored for {channel}");
        }
    }

    if let Some(limit) = cli.dead_letters {
        let dead_letters = DeadLetterRepo::new(db);
        let rows = dead_letters
            .list(None, limit)
            .expect("dead-letter query failed");
        for row in rows {
            println!(
                "{}",
                serde_json::to_string(&row).expect("dead-letter row serialization failed")
            );
        }
    }
}
