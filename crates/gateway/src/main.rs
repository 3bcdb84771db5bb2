use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use fleet_clock::SystemClock;
use fleet_gateway::{
    InMemoryPersistence, RestEventFetcher, TelemetryService, WsTransport, load_config,
    load_default_config,
};

/// Fleet telemetry gateway
#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    /// JSON config file (defaults to the embedded config)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Extra device ids to track, on top of the config file
    #[arg(short, long = "device")]
    devices: Vec<u64>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive("fleet_gateway=info".parse()?))
        .init();

    let args = Args::parse();

    let mut file = match &args.config {
        Some(path) => load_config(path)?,
        None => load_default_config()?,
    };
    file.devices.extend(args.devices.iter().copied());
    file.devices.sort_unstable();
    file.devices.dedup();
    file.validate()?;

    tracing::info!(
        "Starting fleet gateway: socket {}, api {}, {} devices",
        file.server.ws_url,
        file.server.rest_url,
        file.devices.len()
    );

    let config = file.to_telemetry_config();

    let mut fetcher =
        RestEventFetcher::new(&file.server.rest_url).with_timeout(config.backfill.fetch_timeout);
    if let (Some(user), Some(password)) = (&file.server.username, &file.server.password) {
        fetcher = fetcher.with_credentials(user, password);
    }

    let transport = Arc::new(WsTransport::new(config.connection.event_capacity));
    let service = TelemetryService::new(
        config,
        transport,
        Arc::new(fetcher),
        Arc::new(InMemoryPersistence::new()),
        Arc::new(SystemClock::new()),
    );

    for device_id in file.device_ids() {
        let Some(mut snapshots) = service.subscribe(device_id) else {
            continue;
        };
        tokio::spawn(async move {
            while let Ok(snapshot) = snapshots.recv().await {
                tracing::info!(
                    "{} at {:.5},{:.5} {:?} ({})",
                    snapshot.device_id,
                    snapshot.position.latitude,
                    snapshot.position.longitude,
                    snapshot.engine_state,
                    snapshot.origin
                );
            }
            tracing::debug!("Snapshot stream for {} closed", device_id);
        });
    }

    let mut events = service.subscribe_events();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            tracing::info!("Event {} on {}: {}", event.id, event.device_id, event.kind);
        }
    });

    let mut backfills = service.on_backfill_completed();
    tokio::spawn(async move {
        while let Ok(completed) = backfills.recv().await {
            tracing::info!(
                "Backfill recovered {} events ({} devices failed)",
                completed.recovered_count,
                completed.summary.failed_devices.len()
            );
        }
    });

    service.start().await;
    tracing::info!("Connection state: {}", *service.connection_state().borrow());

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutting down...");
    service.shutdown().await;
    Ok(())
}
