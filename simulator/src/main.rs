mod telemetry;

use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use rumqttc::{AsyncClient, MqttOptions, QoS};
use telemetry::{Bin, Reading};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Transport {
    Http,
    Mqtt,
}

#[derive(Debug, Parser)]
#[command(name = "simulator", about = "Smart-bin telemetry simulator")]
struct Cli {
    /// How readings reach the backend
    #[arg(long, env = "SIM_TRANSPORT", value_enum, default_value_t = Transport::Http)]
    transport: Transport,

    /// Backend base URL for HTTP ingest
    #[arg(long, env = "BACKEND_URL", default_value = "http://localhost:4000")]
    backend_url: String,

    #[arg(long, env = "MQTT_BROKER", default_value = "localhost")]
    mqtt_broker: String,

    #[arg(long, env = "MQTT_PORT", default_value_t = 1883)]
    mqtt_port: u16,

    /// Number of simulated bins
    #[arg(short, long, env = "DEVICES", default_value_t = 10)]
    devices: usize,

    /// Seconds between two readings of the same bin
    #[arg(short, long, env = "INTERVAL_SECS", default_value_t = 5)]
    interval: u64,

    /// Stop after this many rounds; runs forever when unset
    #[arg(long, env = "ROUNDS")]
    rounds: Option<u64>,
}

enum Sink {
    Http {
        client: reqwest::Client,
        base_url: String,
    },
    Mqtt {
        client: AsyncClient,
    },
}

impl Sink {
    async fn connect(cli: &Cli) -> Result<Self> {
        match cli.transport {
            Transport::Http => Ok(Sink::Http {
                client: reqwest::Client::builder()
                    .timeout(Duration::from_secs(10))
                    .build()
                    .context("building HTTP client")?,
                base_url: cli.backend_url.trim_end_matches('/').to_string(),
            }),
            Transport::Mqtt => {
                let client_id = format!("sim-{}", uuid::Uuid::new_v4().simple());
                let mut mqtt_options = MqttOptions::new(client_id, &cli.mqtt_broker, cli.mqtt_port);
                mqtt_options.set_keep_alive(Duration::from_secs(30));
                mqtt_options.set_clean_session(true);

                let (client, mut eventloop) = AsyncClient::new(mqtt_options, 1000);
                tokio::spawn(async move {
                    loop {
                        if let Err(e) = eventloop.poll().await {
                            error!("MQTT eventloop error: {}", e);
                            tokio::time::sleep(Duration::from_secs(1)).await;
                        }
                    }
                });
                Ok(Sink::Mqtt { client })
            }
        }
    }

    async fn send(&self, device_id: &str, reading: &Reading) -> Result<()> {
        match self {
            Sink::Http { client, base_url } => {
                let url = format!("{}/api/devices/{}/telemetry", base_url, device_id);
                let response = client.post(url).json(reading).send().await?;
                let status = response.status();
                if !status.is_success() {
                    let body = response.text().await.unwrap_or_default();
                    anyhow::bail!("backend answered {}: {}", status, body);
                }
            }
            Sink::Mqtt { client } => {
                let payload = serde_json::to_vec(reading)?;
                client
                    .publish(format!("telemetry/{}", device_id), QoS::AtLeastOnce, false, payload)
                    .await?;
            }
        }
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    info!(
        "Starting simulator: {} bins over {:?}, one reading per bin every {}s",
        cli.devices, cli.transport, cli.interval
    );

    let sink = Sink::connect(&cli).await?;
    let mut rng = rand::thread_rng();
    let mut bins: Vec<Bin> = (0..cli.devices)
        .map(|i| Bin::new(format!("bin-{:03}", i + 1), &mut rng))
        .collect();

    let interval = Duration::from_secs(cli.interval.max(1));
    let mut round = 0u64;
    let mut sent = 0u64;

    loop {
        let round_start = Instant::now();

        for bin in bins.iter_mut() {
            let reading = bin.tick(&mut rng);
            match sink.send(&bin.id, &reading).await {
                Ok(()) => sent += 1,
                Err(e) => warn!(device_id = %bin.id, "Failed to send reading: {:#}", e),
            }
        }

        round += 1;
        info!("Round {} done, {} readings sent", round, sent);
        if cli.rounds.is_some_and(|limit| round >= limit) {
            break;
        }

        let elapsed = round_start.elapsed();
        if elapsed < interval {
            tokio::time::sleep(interval - elapsed).await;
        } else {
            warn!("Round took {:?}, longer than the {:?} interval", elapsed, interval);
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_defaults() {
        let cli = Cli::try_parse_from(["simulator"]).unwrap();
        assert_eq!(cli.transport, Transport::Http);
        assert_eq!(cli.mqtt_port, 1883);
        assert!(cli.rounds.is_none());
    }

    #[test]
    fn test_cli_mqtt_mode() {
        let cli = Cli::try_parse_from([
            "simulator",
            "--transport",
            "mqtt",
            "--devices",
            "3",
            "--rounds",
            "2",
        ])
        .unwrap();
        assert_eq!(cli.transport, Transport::Mqtt);
        assert_eq!(cli.devices, 3);
        assert_eq!(cli.rounds, Some(2));
    }
}
