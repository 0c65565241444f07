use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::ingest::IngestPipeline;
use crate::mqtt::InboundReading;

/// Drains the MQTT ingress channel, one pipeline run per message, until every sender is gone.
pub async fn run_worker(mut rx: mpsc::Receiver<InboundReading>, pipeline: IngestPipeline) {
    info!("Starting ingest worker");

    while let Some(message) = rx.recv().await {
        // The pipeline logs and counts its own failures.
        if let Err(e) = pipeline.ingest(&message.device_id, &message.payload).await {
            debug!(device_id = %message.device_id, "MQTT reading not ingested: {}", e);
        }
    }

    info!("Ingest worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::realtime::RecordingPublisher;
    use crate::ingest::IngestSettings;
    use crate::model::TimeRange;
    use crate::store::Stores;
    use serde_json::json;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_worker_ingests_until_channel_closes() {
        let stores = Stores::memory();
        let publisher = RecordingPublisher::new();
        let pipeline = IngestPipeline::new(
            &stores,
            Arc::new(publisher.clone()),
            IngestSettings::default(),
        );

        let (tx, rx) = mpsc::channel(4);
        let handle = tokio::spawn(run_worker(rx, pipeline));

        for payload in [json!({"fillPercent": 95}), json!({"fillPercent": "bad"})] {
            tx.send(InboundReading {
                device_id: "bin-1".to_string(),
                payload,
            })
            .await
            .unwrap();
        }
        drop(tx);
        handle.await.unwrap();

        let rows = stores
            .telemetry
            .query("bin-1", TimeRange::default(), 10)
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(publisher.event_names(), vec!["telemetry", "alert"]);
    }
}
