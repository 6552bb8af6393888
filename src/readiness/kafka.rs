//! Kafka-metadata readiness probe: open a client to the broker and
//! require a metadata refresh to succeed.

use std::sync::Arc;
use std::time::Duration;

use rdkafka::client::DefaultClientContext;
use rdkafka::consumer::{BaseConsumer, Consumer};
use rdkafka::ClientConfig;

use super::{Probe, ProbeError};

pub struct KafkaMetadataProbe {
    consumer: Arc<BaseConsumer<DefaultClientContext>>,
    timeout: Duration,
}

impl KafkaMetadataProbe {
    pub fn new(broker: &str, timeout: Duration) -> Result<Self, ProbeError> {
        let consumer: BaseConsumer = ClientConfig::new()
            .set("bootstrap.servers", broker)
            .set("socket.timeout.ms", timeout.as_millis().to_string())
            .create()
            .map_err(ProbeError::Kafka)?;
        Ok(Self {
            consumer: Arc::new(consumer),
            timeout,
        })
    }
}

impl Probe for KafkaMetadataProbe {
    async fn check(&mut self) -> Result<bool, ProbeError> {
        let timeout = self.timeout;
        let consumer = self.consumer.clone();
        // Metadata fetch is blocking C-library I/O; keep it off the Tokio
        // reactor the way the rest of the crate keeps blocking work away
        // from the executor.
        let healthy = tokio::task::spawn_blocking(move || consumer.fetch_metadata(None, timeout).is_ok())
            .await
            .unwrap_or(false);
        Ok(healthy)
    }
}
