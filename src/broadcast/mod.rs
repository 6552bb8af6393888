//! Broadcast Tailer and WebSocket wire format.
//!
//! The tailer polls the Event Store every second across four
//! independent `(table, last_id)` cursors in a single task, and
//! republishes each new row as a typed JSON message via [`Broadcaster`].

mod broadcaster;
mod ws;

pub use broadcaster::Broadcaster;
pub use ws::websocket_route;

use chrono::{DateTime, Utc};
use log::error;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::watch;

use crate::event_store::{EventStore, HttpRequestRow, Result as StoreResult, Stream as LogStream};
use crate::settings::broadcast_poll_interval;

const PAGE_LIMIT: i64 = 100;

fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

fn parse_headers(headers_json: &str) -> Value {
    serde_json::from_str(headers_json).unwrap_or_else(|_| Value::Object(Default::default()))
}

/// Strips `time`/`timestamp` keys from a Log line that parses as a JSON
/// object and re-serializes it with sorted keys. `serde_json::Map` is a
/// `BTreeMap` in this crate (the `preserve_order` feature is not
/// enabled), so a plain re-serialize already yields sorted keys.
/// Unparseable or non-object content passes through unchanged.
fn scrub_log_content(content: &str) -> String {
    match serde_json::from_str::<Value>(content) {
        Ok(Value::Object(mut map)) => {
            map.remove("time");
            map.remove("timestamp");
            serde_json::to_string(&Value::Object(map)).unwrap_or_else(|_| content.to_string())
        }
        _ => content.to_string(),
    }
}

/// The request half of an `http_response` message's embedded
/// `http_request` field, also used standalone for `http_request`
/// messages.
#[derive(Debug, Clone, Serialize)]
pub struct HttpRequestPayload {
    pub id: i64,
    pub timestamp: String,
    pub process_name: String,
    pub method: String,
    pub url: String,
    pub headers: Value,
    pub body: String,
}

impl From<&HttpRequestRow> for HttpRequestPayload {
    fn from(row: &HttpRequestRow) -> Self {
        Self {
            id: row.id,
            timestamp: format_timestamp(row.timestamp),
            process_name: row.process_name.clone(),
            method: row.method.clone(),
            url: row.url.clone(),
            headers: parse_headers(&row.headers_json),
            body: row.body.clone(),
        }
    }
}

/// One `type`-discriminated WebSocket wire message.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BroadcastMessage {
    Log {
        id: i64,
        timestamp: String,
        process_name: String,
        output_type: &'static str,
        content: String,
    },
    HttpRequest {
        #[serde(flatten)]
        payload: HttpRequestPayload,
    },
    HttpResponse {
        id: i64,
        timestamp: String,
        process_name: String,
        status_code: u16,
        headers: Value,
        body: String,
        http_request: HttpRequestPayload,
    },
    KafkaMessage {
        id: i64,
        timestamp: String,
        broker_name: String,
        topic_name: String,
        message_key: Option<String>,
        message_value: String,
    },
}

/// Background loop that drains newly-appended Event Store rows into a
/// [`Broadcaster`]. Holds a read-only reference to the store and owns
/// its own cursor state.
pub struct BroadcastTailer {
    store: EventStore,
    broadcaster: Broadcaster,
}

impl BroadcastTailer {
    pub fn new(store: EventStore, broadcaster: Broadcaster) -> Self {
        Self { store, broadcaster }
    }

    /// Runs the poll loop until `stop` is signaled. Each table is polled
    /// independently every tick; a failure on one table is logged and
    /// does not stop the others.
    pub async fn run(self, mut stop_rx: watch::Receiver<bool>) {
        let mut last_log_id = 0i64;
        let mut last_request_id = 0i64;
        let mut last_response_id = 0i64;
        let mut last_kafka_id = 0i64;
        let mut ticker = tokio::time::interval(broadcast_poll_interval());

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = stop_rx.changed() => break,
            }

            if let Err(e) = self.poll_logs(&mut last_log_id).await {
                error!("broadcast tailer: log poll failed: {e}");
            }
            if let Err(e) = self.poll_requests(&mut last_request_id).await {
                error!("broadcast tailer: request poll failed: {e}");
            }
            if let Err(e) = self.poll_responses(&mut last_response_id).await {
                error!("broadcast tailer: response poll failed: {e}");
            }
            if let Err(e) = self.poll_kafka(&mut last_kafka_id).await {
                error!("broadcast tailer: kafka poll failed: {e}");
            }
        }
    }

    async fn poll_logs(&self, cursor: &mut i64) -> StoreResult<()> {
        let rows = self.store.query_logs_since(*cursor, PAGE_LIMIT).await?;
        for row in &rows {
            self.publish(&BroadcastMessage::Log {
                id: row.id,
                timestamp: format_timestamp(row.timestamp),
                process_name: row.process_name.clone(),
                output_type: match row.stream {
                    LogStream::Stdout => "stdout",
                    LogStream::Stderr => "stderr",
                },
                content: scrub_log_content(&row.content),
            });
        }
        if let Some(last) = rows.last() {
            *cursor = last.id;
        }
        Ok(())
    }

    async fn poll_requests(&self, cursor: &mut i64) -> StoreResult<()> {
        let rows = self.store.query_requests_since(*cursor, PAGE_LIMIT).await?;
        for row in &rows {
            self.publish(&BroadcastMessage::HttpRequest {
                payload: HttpRequestPayload::from(row),
            });
        }
        if let Some(last) = rows.last() {
            *cursor = last.id;
        }
        Ok(())
    }

    async fn poll_responses(&self, cursor: &mut i64) -> StoreResult<()> {
        let rows = self.store.query_responses_since(*cursor, PAGE_LIMIT).await?;
        for row in &rows {
            let http_request = match self.store.get_request(row.http_request_id).await? {
                Some(request) => HttpRequestPayload::from(&request),
                None => {
                    error!(
                        "broadcast tailer: response {} references missing request {}",
                        row.id, row.http_request_id
                    );
                    continue;
                }
            };
            self.publish(&BroadcastMessage::HttpResponse {
                id: row.id,
                timestamp: format_timestamp(row.timestamp),
                process_name: row.process_name.clone(),
                status_code: row.status_code,
                headers: parse_headers(&row.headers_json),
                body: row.body.clone(),
                http_request,
            });
        }
        if let Some(last) = rows.last() {
            *cursor = last.id;
        }
        Ok(())
    }

    async fn poll_kafka(&self, cursor: &mut i64) -> StoreResult<()> {
        let rows = self.store.query_kafka_since(*cursor, PAGE_LIMIT).await?;
        for row in &rows {
            self.publish(&BroadcastMessage::KafkaMessage {
                id: row.id,
                timestamp: format_timestamp(row.timestamp),
                broker_name: row.broker_name.clone(),
                topic_name: row.topic.clone(),
                message_key: row.key.clone(),
                message_value: row.value.clone(),
            });
        }
        if let Some(last) = rows.last() {
            *cursor = last.id;
        }
        Ok(())
    }

    fn publish(&self, message: &BroadcastMessage) {
        match serde_json::to_vec(message) {
            Ok(bytes) => self.broadcaster.broadcast(bytes),
            Err(e) => error!("broadcast tailer: failed to serialize message: {e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_store::Stream;

    #[test]
    fn scrubs_json_object_and_sorts_keys() {
        let content = r#"{"time":"2023-01-01","timestamp":"x","msg":"hi"}"#;
        assert_eq!(scrub_log_content(content), r#"{"msg":"hi"}"#);
    }

    #[test]
    fn passes_through_non_json_content_unchanged() {
        let content = "plain text line\n";
        assert_eq!(scrub_log_content(content), content);
    }

    #[tokio::test]
    async fn tailer_publishes_log_row_to_subscriber() {
        let store = EventStore::open_in_memory().await.unwrap();
        let broadcaster = Broadcaster::new();
        let mut rx = broadcaster.subscribe();

        store.append_log("svc1", Stream::Stdout, "Service started\n").await.unwrap();

        let tailer = BroadcastTailer::new(store, broadcaster);
        tailer.poll_logs(&mut 0).await.unwrap();

        let received = rx.try_recv().unwrap();
        let value: Value = serde_json::from_slice(&received).unwrap();
        assert_eq!(value["type"], "log");
        assert_eq!(value["process_name"], "svc1");
        assert_eq!(value["content"], "Service started\n");
    }

    #[tokio::test]
    async fn tailer_embeds_linked_request_in_response_message() {
        let store = EventStore::open_in_memory().await.unwrap();
        let broadcaster = Broadcaster::new();
        let mut rx = broadcaster.subscribe();

        let request_id = store.append_request("svc1", "GET", "/ping", "{}", "").await.unwrap();
        store.append_response(request_id, "svc1", 200, "{}", "healthy").await.unwrap();

        let tailer = BroadcastTailer::new(store, broadcaster);
        tailer.poll_requests(&mut 0).await.unwrap();
        rx.try_recv().unwrap(); // drain the http_request message
        tailer.poll_responses(&mut 0).await.unwrap();

        let received = rx.try_recv().unwrap();
        let value: Value = serde_json::from_slice(&received).unwrap();
        assert_eq!(value["type"], "http_response");
        assert_eq!(value["http_request"]["id"], request_id);
        assert_eq!(value["http_request"]["method"], "GET");
    }
}
