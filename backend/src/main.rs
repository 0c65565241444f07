use smartbins::{
    api::AppState, build_stores, config::Config, metrics, mqtt, serve,
    store::postgres::redact_url, worker,
};
use tokio::sync::mpsc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = Config::from_env();

    info!("Starting smart-bin backend");
    info!("HTTP server: {}", config.http_addr);
    info!("Store: {:?} ({})", config.store, redact_url(&config.database_url));
    info!(
        "Alert defaults: fill >= {}%, battery <= {}%, device thresholds {}",
        config.ingest.policy.defaults.fill_percent,
        config.ingest.policy.defaults.battery_percent,
        if config.ingest.policy.use_device_thresholds { "on" } else { "off" }
    );

    metrics::init_metrics();

    let stores = match build_stores(&config).await {
        Ok(stores) => stores,
        Err(e) => {
            error!("Failed to open store: {}", e);
            std::process::exit(1);
        }
    };

    let state = AppState::new(stores, &config);

    let mqtt_handle = config.mqtt.clone().map(|mqtt_config| {
        info!("MQTT broker: {}:{}", mqtt_config.broker, mqtt_config.port);
        info!("Channel capacity: {}", mqtt_config.channel_capacity);
        let (tx, rx) = mpsc::channel(mqtt_config.channel_capacity);

        tokio::spawn(worker::run_worker(rx, state.pipeline.clone()));

        let client_id = format!("smartbins-{}", uuid::Uuid::new_v4());
        tokio::spawn(async move {
            if let Err(e) =
                mqtt::run_mqtt(mqtt_config.broker, mqtt_config.port, client_id, tx).await
            {
                error!("MQTT task failed: {}", e);
            }
        })
    });

    let listener = tokio::net::TcpListener::bind(&config.http_addr)
        .await
        .unwrap_or_else(|e| {
            error!("Failed to bind to {}: {}", config.http_addr, e);
            std::process::exit(1);
        });

    info!("HTTP server listening on {}", config.http_addr);

    let frontend_url = config.frontend_url.clone();
    let server_handle = tokio::spawn(async move {
        if let Err(e) = serve(listener, state, frontend_url.as_deref()).await {
            error!("HTTP server error: {}", e);
        }
    });

    let mqtt_task = async move {
        match mqtt_handle {
            Some(handle) => {
                let _ = handle.await;
            }
            None => std::future::pending::<()>().await,
        }
    };

    tokio::select! {
        _ = mqtt_task => {
            error!("MQTT task terminated");
        }
        _ = server_handle => {
            error!("HTTP server terminated");
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
    }

    info!("Shutting down");
}
