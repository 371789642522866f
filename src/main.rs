//! OCPP charging-station fleet emulator.
//! Reads configuration from TOML file (~/.config/ocpp-emulator/config.toml).

use std::time::Duration;

use tracing::{error, info, warn};

use voltsim_ocpp::broadcast::Broadcaster;
use voltsim_ocpp::config::{default_config_path, AppConfig};
use voltsim_ocpp::dispatch::build_router;
use voltsim_ocpp::messagelog::MessageLog;
use voltsim_ocpp::persistence::MemoryStore;
use voltsim_ocpp::scenario::ScenarioRunner;
use voltsim_ocpp::shared::shutdown::ShutdownCoordinator;
use voltsim_ocpp::station::StationManager;
use voltsim_ocpp::transport::ConnectionPool;

#[tokio::main]
async fn main() {
    // ── Load configuration ─────────────────────────────────────
    let config_path = std::env::var("OCPP_EMU_CONFIG")
        .map(std::path::PathBuf::from)
        .unwrap_or_else(|_| default_config_path());
    let config = if config_path.exists() {
        match AppConfig::load(&config_path) {
            Ok(config) => {
                init_logging(&config);
                info!("Configuration loaded from {}", config_path.display());
                config
            }
            Err(e) => {
                // Bad configuration is a startup failure
                eprintln!("Failed to load config {}: {}", config_path.display(), e);
                std::process::exit(1);
            }
        }
    } else {
        let config = AppConfig::default();
        init_logging(&config);
        warn!(
            "No configuration at {}; using defaults",
            config_path.display()
        );
        config
    };

    info!("Starting OCPP fleet emulator...");

    // ── Prometheus metrics recorder + listener ─────────────────
    match config.bind_address().parse::<std::net::SocketAddr>() {
        Ok(addr) => {
            if let Err(e) = metrics_exporter_prometheus::PrometheusBuilder::new()
                .with_http_listener(addr)
                .install()
            {
                warn!("Prometheus exporter failed to start on {}: {}", addr, e);
            } else {
                info!("Metrics exposed on http://{}/metrics", addr);
            }
        }
        Err(e) => {
            error!("Bad server bind address '{}': {}", config.bind_address(), e);
            std::process::exit(1);
        }
    }

    // ── Core wiring ────────────────────────────────────────────
    // Validation guaranteed a memory:// URI; concrete database bindings
    // are host-layer adapters behind the same store contract.
    let store = MemoryStore::shared();

    let shutdown = ShutdownCoordinator::new(config.app.shutdown_timeout_secs);
    let shutdown_signal = shutdown.signal();
    shutdown.spawn_signal_listener();

    let broadcaster = Broadcaster::shared();
    let message_log = MessageLog::with_options(
        store.clone(),
        config.app.message_buffer_size,
        config.app.batch_size,
        Duration::from_secs(config.app.batch_interval_secs.max(1)),
    );
    message_log.start(shutdown_signal.clone());

    // The broadcaster observes every logged wire message
    {
        let broadcaster = broadcaster.clone();
        message_log.add_listener(std::sync::Arc::new(move |entry| {
            broadcaster.broadcast_message(entry);
        }));
    }

    let pool = ConnectionPool::shared();
    let router = build_router(
        pool.clone(),
        message_log.clone(),
        config.request_timeout(),
        config.validation_mode(),
    );

    let manager = StationManager::new(
        pool.clone(),
        router,
        message_log.clone(),
        broadcaster.clone(),
        store,
        config.station_defaults(),
        Duration::from_secs(config.app.sync_interval_secs.max(1)),
        config.app.max_stations,
    );
    manager.start_sync_loop(shutdown_signal.clone());

    let scenario_runner = ScenarioRunner::new(manager.clone(), message_log.clone(), broadcaster.clone());
    info!(
        scenarios = scenario_runner.list_scenarios().len(),
        "Scenario runner ready"
    );

    // ── Seed configured stations ───────────────────────────────
    for station_config in config.stations.clone() {
        let station_id = station_config.id.clone();
        match manager.add_station(station_config).await {
            Ok(_) => info!(station_id = station_id.as_str(), "Station seeded"),
            Err(e) => {
                error!(station_id = station_id.as_str(), error = %e, "Station seeding failed");
                std::process::exit(1);
            }
        }
    }

    info!("Emulator started. Press Ctrl+C to shutdown gracefully.");

    // ── Wait for shutdown, then drain subsystems in order ──────
    let drained = shutdown
        .drain(vec![
            (
                "stations",
                Box::pin(async move { manager.stop_all().await }),
            ),
            ("connection pool", Box::pin(async move { pool.close_all() })),
            ("broadcaster", Box::pin(async move { broadcaster.shutdown() })),
            (
                "message log",
                // Grace period for the consumer's residual flush
                Box::pin(tokio::time::sleep(Duration::from_millis(200))),
            ),
        ])
        .await;

    match drained {
        Ok(()) => info!("Emulator shutdown complete"),
        Err(phase) => warn!(phase, "Emulator shutdown exceeded its budget"),
    }
}

fn init_logging(config: &AppConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.logging.level));
    if config.logging.format == "json" {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}
