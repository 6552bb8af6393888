//! Discovers topics on a Kafka broker and tails partition 0 of each into
//! the event store.

use std::collections::HashSet;
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::{debug, error, warn};
use rdkafka::consumer::{BaseConsumer, Consumer, StreamConsumer};
use rdkafka::message::Message;
use rdkafka::{ClientConfig, Offset, TopicPartitionList};
use tokio::sync::watch;

use crate::event_store::EventStore;

const METADATA_TIMEOUT: Duration = Duration::from_secs(5);

/// A running topic-discovery loop for one broker.
pub struct KafkaObserverHandle {
    pub stop: crate::process::StopToken,
    join: tokio::task::JoinHandle<()>,
}

impl KafkaObserverHandle {
    pub async fn join(self) {
        let _ = self.join.await;
    }
}

pub struct KafkaObserver;

impl KafkaObserver {
    pub fn spawn(broker_name: impl Into<String>, bootstrap_servers: impl Into<String>, store: EventStore) -> KafkaObserverHandle {
        let broker_name = broker_name.into();
        let bootstrap_servers = bootstrap_servers.into();
        let (stop_tx, stop_rx) = watch::channel(false);

        let join = tokio::spawn(discovery_loop(broker_name, bootstrap_servers, store, stop_rx));

        KafkaObserverHandle {
            stop: crate::process::StopToken::from_sender(stop_tx),
            join,
        }
    }
}

async fn discovery_loop(
    broker_name: String,
    bootstrap_servers: String,
    store: EventStore,
    mut stop_rx: watch::Receiver<bool>,
) {
    let metadata_consumer: BaseConsumer = match ClientConfig::new()
        .set("bootstrap.servers", &bootstrap_servers)
        .set("group.id", format!("substrate-observer-{broker_name}"))
        .create()
    {
        Ok(c) => c,
        Err(e) => {
            error!("kafka observer '{broker_name}': failed to create metadata client: {e}");
            log_observer_error(&store, &broker_name, format!("failed to create metadata client: {e}\n")).await;
            return;
        }
    };

    let mut known_topics: HashSet<String> = HashSet::new();
    let mut consumer_tasks = Vec::new();
    let mut ticker = tokio::time::interval(crate::settings::kafka_topic_discovery_interval());

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = stop_rx.changed() => break,
        }

        let metadata = match metadata_consumer.fetch_metadata(None, METADATA_TIMEOUT) {
            Ok(m) => m,
            Err(e) => {
                warn!("kafka observer '{broker_name}': metadata fetch failed: {e}");
                log_observer_error(&store, &broker_name, format!("metadata fetch failed: {e}\n")).await;
                continue;
            }
        };

        for topic in metadata.topics() {
            let name = topic.name();
            // Kafka's internal coordination topic never carries application data.
            if name == "__consumer_offsets" || known_topics.contains(name) {
                continue;
            }
            known_topics.insert(name.to_string());
            debug!("kafka observer '{broker_name}': discovered topic '{name}'");

            let task = tokio::spawn(tail_topic(
                broker_name.clone(),
                bootstrap_servers.clone(),
                name.to_string(),
                store.clone(),
                stop_rx.clone(),
            ));
            consumer_tasks.push(task);
        }
    }

    for task in consumer_tasks {
        let _ = task.await;
    }
}

async fn tail_topic(
    broker_name: String,
    bootstrap_servers: String,
    topic: String,
    store: EventStore,
    mut stop_rx: watch::Receiver<bool>,
) {
    let consumer: StreamConsumer = match ClientConfig::new()
        .set("bootstrap.servers", &bootstrap_servers)
        .set("group.id", format!("substrate-observer-{broker_name}-{topic}"))
        .set("enable.auto.commit", "false")
        .create()
    {
        Ok(c) => c,
        Err(e) => {
            error!("kafka observer '{broker_name}': failed to create consumer for topic '{topic}': {e}");
            log_observer_error(&store, &broker_name, format!("failed to create consumer for topic '{topic}': {e}\n")).await;
            return;
        }
    };

    let mut assignment = TopicPartitionList::new();
    assignment.add_partition_offset(&topic, 0, Offset::Beginning).ok();
    if let Err(e) = consumer.assign(&assignment) {
        error!("kafka observer '{broker_name}': failed to assign partition 0 of '{topic}': {e}");
        log_observer_error(&store, &broker_name, format!("failed to assign partition 0 of '{topic}': {e}\n")).await;
        return;
    }

    loop {
        let message = tokio::select! {
            result = consumer.recv() => result,
            _ = stop_rx.changed() => break,
        };

        let message = match message {
            Ok(m) => m,
            Err(e) => {
                warn!("kafka observer '{broker_name}': receive error on '{topic}': {e}");
                log_observer_error(&store, &broker_name, format!("receive error on '{topic}': {e}\n")).await;
                continue;
            }
        };

        let key = message.key().map(|k| String::from_utf8_lossy(k).into_owned());
        let value = message
            .payload()
            .map(|p| String::from_utf8_lossy(p).into_owned())
            .unwrap_or_default();
        let timestamp = message_timestamp(&message);

        if let Err(e) = store
            .append_kafka(broker_name.clone(), topic.clone(), key, value, timestamp)
            .await
        {
            error!("kafka observer '{broker_name}': failed to append message from '{topic}': {e}");
        }
    }
}

/// Records a transient observer failure as a stderr Log row under the
/// broker's own name. Best-effort: if the store itself is unhealthy this
/// is a no-op beyond the `log`-facade line already emitted at the call
/// site.
async fn log_observer_error(store: &EventStore, broker_name: &str, content: String) {
    let _ = store
        .append_log(broker_name, crate::event_store::Stream::Stderr, content)
        .await;
}

fn message_timestamp(message: &rdkafka::message::BorrowedMessage<'_>) -> DateTime<Utc> {
    match message.timestamp().to_millis() {
        Some(millis) => DateTime::from_timestamp_millis(millis).unwrap_or_else(Utc::now),
        None => Utc::now(),
    }
}
