use clap::Parser;
use fleet_sync::{
    FleetApiClient, FleetConfig, FleetDependencies, FleetSync, NativeDbStore, SystemClock,
    TracingSink, WebSocketConnector,
};
use std::sync::Arc;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None, rename_all = "snake_case")]
struct Args {
    /// Command to execute: watch, backfill, sync, status
    #[arg(short, long)]
    command: String,

    /// Local state database
    #[arg(long, name = "db_path", default_value = "fleet_state.db")]
    db_path: String,

    /// Print every event as JSON while watching
    #[arg(long, default_value = "false")]
    json: bool,

    /// Log level
    #[arg(long, default_value = "info")]
    log_level: String,
}

// example usage:
// FLEET_WS_URL=wss://fleet.example.com/ws FLEET_API_URL=https://fleet.example.com/api ./target/release/fleet_cli --command backfill
// FLEET_WS_URL=wss://fleet.example.com/ws FLEET_API_URL=https://fleet.example.com/api ./target/release/fleet_cli --command watch --json
// FLEET_WS_URL=wss://fleet.example.com/ws FLEET_API_URL=https://fleet.example.com/api ./target/release/fleet_cli --command sync
// FLEET_WS_URL=wss://fleet.example.com/ws FLEET_API_URL=https://fleet.example.com/api ./target/release/fleet_cli --command status

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(format!("fleet_sync={}", args.log_level))
        .init();

    let config = FleetConfig::from_env()?;
    let client = FleetApiClient::from_config(&config)?;
    let store = NativeDbStore::open(&args.db_path)?;

    let fleet = FleetSync::new(
        config,
        FleetDependencies {
            transport: Arc::new(WebSocketConnector),
            store: Arc::new(store),
            remote: Arc::new(client.clone()),
            sink: Arc::new(TracingSink),
            clock: Arc::new(SystemClock),
        },
    );

    match args.command.as_str() {
        "watch" => {
            let mut events = fleet.subscribe();
            if let Err(e) = fleet.start().await {
                error!("Failed to connect: {}", e);
                std::process::exit(1);
            }
            info!("Watching fleet telemetry, press Ctrl-C to stop");
            loop {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => break,
                    event = events.recv() => match event {
                        Ok(event) => {
                            if args.json {
                                println!("{}", serde_json::to_string(&event)?);
                            }
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!("Event stream lagged, skipped {} events", skipped);
                        }
                        Err(_) => break,
                    },
                }
            }
            fleet.stop().await;
        }
        "backfill" => {
            let summary = fleet.backfill(&client).await?;
            fleet.persist()?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
            if summary.rejected > 0 {
                std::process::exit(1);
            }
        }
        "sync" => {
            let result = fleet.sync_now().await;
            println!("{}", serde_json::to_string_pretty(&result)?);
            if !result.is_clean() {
                std::process::exit(1);
            }
        }
        "status" => {
            println!("Vehicles:        {}", fleet.vehicles().len());
            println!("Alerts:          {} ({} unread)", fleet.alerts().len(), fleet.unread_alert_count());
            println!("Violations:      {}", fleet.violations().len());
            println!("Routes:          {}", fleet.routes().len());
            println!("Pending sync:    {}", fleet.pending_sync_count());
        }
        other => {
            eprintln!("Unknown command: {}", other);
            std::process::exit(1);
        }
    }

    Ok(())
}
