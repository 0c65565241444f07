use std::time::Duration;

use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use serde_json::Value;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, error, info, warn};

use crate::errors::{Error, Result};
use crate::metrics::{CHANNEL_FULL_TOTAL, TELEMETRY_RECEIVED_TOTAL, TELEMETRY_REJECTED_TOTAL};

pub const TELEMETRY_TOPIC: &str = "telemetry/+";

/// A device payload received over MQTT, waiting for the ingest worker.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundReading {
    pub device_id: String,
    pub payload: Value,
}

pub async fn run_mqtt(
    broker: String,
    port: u16,
    client_id: String,
    tx: mpsc::Sender<InboundReading>,
) -> Result<()> {
    info!("Connecting to MQTT broker at {}:{}", broker, port);

    let mut mqtt_options = MqttOptions::new(client_id, broker, port);
    mqtt_options.set_keep_alive(Duration::from_secs(30));
    mqtt_options.set_clean_session(false);

    let (client, mut eventloop) = AsyncClient::new(mqtt_options, 1000);

    client.subscribe(TELEMETRY_TOPIC, QoS::AtLeastOnce).await?;
    info!("Subscribed to {} with QoS 1", TELEMETRY_TOPIC);

    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                debug!(
                    "Received message on topic {}, size: {} bytes",
                    publish.topic,
                    publish.payload.len()
                );

                match process_message(&publish.topic, &publish.payload, &tx).await {
                    Ok(()) => {}
                    Err(Error::ChannelSend) => {
                        error!("Ingest channel closed, stopping MQTT ingress");
                        return Err(Error::ChannelSend);
                    }
                    Err(e) => {
                        // Never reaches the pipeline, so count it here.
                        TELEMETRY_RECEIVED_TOTAL.inc();
                        TELEMETRY_REJECTED_TOTAL.inc();
                        warn!("Dropping MQTT message on {}: {}", publish.topic, e);
                    }
                }
            }
            Ok(_) => {}
            Err(e) => {
                error!("MQTT error: {}", e);
                // rumqttc reconnects on the next poll
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }
    }
}

/// `telemetry/{deviceId}` → `deviceId`.
pub fn device_id_from_topic(topic: &str) -> Result<&str> {
    topic
        .strip_prefix("telemetry/")
        .map(str::trim)
        .filter(|id| !id.is_empty() && !id.contains('/'))
        .ok_or_else(|| Error::Validation(format!("Unexpected topic {}", topic)))
}

async fn process_message(
    topic: &str,
    payload: &[u8],
    tx: &mpsc::Sender<InboundReading>,
) -> Result<()> {
    let device_id = device_id_from_topic(topic)?;
    let payload: Value = serde_json::from_slice(payload)?;

    let reading = InboundReading {
        device_id: device_id.to_string(),
        payload,
    };

    match tx.try_send(reading) {
        Ok(()) => Ok(()),
        Err(TrySendError::Full(reading)) => {
            CHANNEL_FULL_TOTAL.inc();
            debug!("Channel full, waiting for the ingest worker");
            tx.send(reading).await.map_err(|_| Error::ChannelSend)
        }
        Err(TrySendError::Closed(_)) => Err(Error::ChannelSend),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_device_id_from_topic() {
        assert_eq!(device_id_from_topic("telemetry/bin-1").unwrap(), "bin-1");
        assert!(device_id_from_topic("telemetry/").is_err());
        assert!(device_id_from_topic("telemetry/a/b").is_err());
        assert!(device_id_from_topic("alerts/bin-1").is_err());
    }

    #[test]
    fn test_process_message_valid() {
        tokio_test::block_on(async {
            let (tx, mut rx) = mpsc::channel(10);
            let payload = serde_json::to_vec(&json!({"fillPercent": 12})).unwrap();

            assert!(process_message("telemetry/bin-1", &payload, &tx).await.is_ok());

            let received = rx.recv().await.unwrap();
            assert_eq!(received.device_id, "bin-1");
            assert_eq!(received.payload["fillPercent"], 12);
        });
    }

    #[test]
    fn test_process_message_invalid_json() {
        tokio_test::block_on(async {
            let (tx, _rx) = mpsc::channel(10);
            let result = process_message("telemetry/bin-1", b"invalid json", &tx).await;
            assert!(matches!(result, Err(Error::Json(_))));
        });
    }

    #[test]
    fn test_process_message_closed_channel() {
        tokio_test::block_on(async {
            let (tx, rx) = mpsc::channel(1);
            drop(rx);
            let result = process_message("telemetry/bin-1", b"{}", &tx).await;
            assert!(matches!(result, Err(Error::ChannelSend)));
        });
    }
}
