//! The append-only local event store.
//!
//! Four tables hold logs, HTTP request/response pairs, and Kafka
//! messages. Every append is synchronous-durable (`PRAGMA synchronous =
//! FULL`, WAL journaling) before the call returns. A single
//! `std::sync::Mutex` around the connection serializes writers; blocking
//! SQLite work is dispatched via `spawn_blocking` so it never stalls the
//! Tokio reactor the rest of the crate runs on.

use std::path::Path;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;

pub type Result<T> = std::result::Result<T, EventStoreError>;

#[derive(Debug, thiserror::Error)]
pub enum EventStoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("event store worker panicked: {0}")]
    WorkerPanicked(#[from] tokio::task::JoinError),
    #[error("response references unknown request id {0}")]
    UnknownRequest(i64),
}

/// Which stream a captured [`LogRow`] line came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Stream {
    Stdout,
    Stderr,
}

impl Stream {
    fn as_str(self) -> &'static str {
        match self {
            Stream::Stdout => "stdout",
            Stream::Stderr => "stderr",
        }
    }

    fn parse(s: &str) -> Self {
        match s {
            "stderr" => Stream::Stderr,
            _ => Stream::Stdout,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct LogRow {
    pub id: i64,
    pub timestamp: DateTime<Utc>,
    pub process_name: String,
    pub stream: Stream,
    pub content: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct HttpRequestRow {
    pub id: i64,
    pub timestamp: DateTime<Utc>,
    pub process_name: String,
    pub method: String,
    pub url: String,
    pub headers_json: String,
    pub body: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct HttpResponseRow {
    pub id: i64,
    pub timestamp: DateTime<Utc>,
    pub http_request_id: i64,
    pub process_name: String,
    pub status_code: u16,
    pub headers_json: String,
    pub body: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct KafkaMessageRow {
    pub id: i64,
    pub timestamp: DateTime<Utc>,
    pub broker_name: String,
    pub topic: String,
    pub key: Option<String>,
    pub value: String,
}

fn now_millis() -> DateTime<Utc> {
    let now = Utc::now();
    DateTime::from_timestamp_millis(now.timestamp_millis()).unwrap_or(now)
}

/// Handle to the durable event store. Cheaply `Clone`-able; all clones
/// share the same underlying connection and writer lock.
#[derive(Debug, Clone)]
pub struct EventStore {
    conn: Arc<Mutex<Connection>>,
}

impl EventStore {
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_owned();
        let conn = tokio::task::spawn_blocking(move || -> Result<Connection> {
            let conn = Connection::open(path)?;
            init_schema(&conn)?;
            Ok(conn)
        })
        .await??;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Opens an in-memory store, primarily for tests.
    pub async fn open_in_memory() -> Result<Self> {
        let conn = tokio::task::spawn_blocking(|| -> Result<Connection> {
            let conn = Connection::open_in_memory()?;
            init_schema(&conn)?;
            Ok(conn)
        })
        .await??;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn with_conn<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> rusqlite::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().expect("event store connection lock poisoned");
            f(&conn).map_err(EventStoreError::from)
        })
        .await?
    }

    pub async fn append_log(
        &self,
        process_name: impl Into<String>,
        stream: Stream,
        content: impl Into<String>,
    ) -> Result<i64> {
        let process_name = process_name.into();
        let content = content.into();
        let timestamp = now_millis();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO logs (timestamp, process_name, stream, content) VALUES (?1, ?2, ?3, ?4)",
                params![timestamp.to_rfc3339_opts(chrono::SecondsFormat::Millis, true), process_name, stream.as_str(), content],
            )?;
            Ok(conn.last_insert_rowid())
        })
        .await
    }

    pub async fn append_request(
        &self,
        process_name: impl Into<String>,
        method: impl Into<String>,
        url: impl Into<String>,
        headers_json: impl Into<String>,
        body: impl Into<String>,
    ) -> Result<i64> {
        let (process_name, method, url, headers_json, body) =
            (process_name.into(), method.into(), url.into(), headers_json.into(), body.into());
        let timestamp = now_millis();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO http_requests (timestamp, process_name, method, url, headers_json, body) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    timestamp.to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
                    process_name,
                    method,
                    url,
                    headers_json,
                    body
                ],
            )?;
            Ok(conn.last_insert_rowid())
        })
        .await
    }

    pub async fn append_response(
        &self,
        http_request_id: i64,
        process_name: impl Into<String>,
        status_code: u16,
        headers_json: impl Into<String>,
        body: impl Into<String>,
    ) -> Result<i64> {
        let (process_name, headers_json, body) = (process_name.into(), headers_json.into(), body.into());
        let timestamp = now_millis();
        self.with_conn(move |conn| {
            let exists: Option<i64> = conn
                .query_row(
                    "SELECT id FROM http_requests WHERE id = ?1",
                    params![http_request_id],
                    |row| row.get(0),
                )
                .optional()?;
            if exists.is_none() {
                return Err(rusqlite::Error::QueryReturnedNoRows);
            }
            conn.execute(
                "INSERT INTO http_responses (timestamp, http_request_id, process_name, status_code, headers_json, body) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    timestamp.to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
                    http_request_id,
                    process_name,
                    status_code,
                    headers_json,
                    body
                ],
            )?;
            Ok(conn.last_insert_rowid())
        })
        .await
        .map_err(|e| match e {
            EventStoreError::Sqlite(rusqlite::Error::QueryReturnedNoRows) => {
                EventStoreError::UnknownRequest(http_request_id)
            }
            other => other,
        })
    }

    pub async fn append_kafka(
        &self,
        broker_name: impl Into<String>,
        topic: impl Into<String>,
        key: Option<String>,
        value: impl Into<String>,
        timestamp: DateTime<Utc>,
    ) -> Result<i64> {
        let (broker_name, topic, value) = (broker_name.into(), topic.into(), value.into());
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO kafka_messages (timestamp, broker_name, topic, key, value) VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    timestamp.to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
                    broker_name,
                    topic,
                    key,
                    value
                ],
            )?;
            Ok(conn.last_insert_rowid())
        })
        .await
    }

    pub async fn query_logs_since(&self, last_id: i64, limit: i64) -> Result<Vec<LogRow>> {
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, timestamp, process_name, stream, content FROM logs WHERE id > ?1 ORDER BY id ASC LIMIT ?2",
            )?;
            let rows = stmt
                .query_map(params![last_id, limit], |row| {
                    Ok(LogRow {
                        id: row.get(0)?,
                        timestamp: parse_timestamp(row.get::<_, String>(1)?),
                        process_name: row.get(2)?,
                        stream: Stream::parse(&row.get::<_, String>(3)?),
                        content: row.get(4)?,
                    })
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
        .await
    }

    pub async fn query_requests_since(&self, last_id: i64, limit: i64) -> Result<Vec<HttpRequestRow>> {
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, timestamp, process_name, method, url, headers_json, body FROM http_requests WHERE id > ?1 ORDER BY id ASC LIMIT ?2",
            )?;
            let rows = stmt
                .query_map(params![last_id, limit], |row| {
                    Ok(HttpRequestRow {
                        id: row.get(0)?,
                        timestamp: parse_timestamp(row.get::<_, String>(1)?),
                        process_name: row.get(2)?,
                        method: row.get(3)?,
                        url: row.get(4)?,
                        headers_json: row.get(5)?,
                        body: row.get(6)?,
                    })
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
        .await
    }

    pub async fn query_responses_since(&self, last_id: i64, limit: i64) -> Result<Vec<HttpResponseRow>> {
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, timestamp, http_request_id, process_name, status_code, headers_json, body FROM http_responses WHERE id > ?1 ORDER BY id ASC LIMIT ?2",
            )?;
            let rows = stmt
                .query_map(params![last_id, limit], |row| {
                    Ok(HttpResponseRow {
                        id: row.get(0)?,
                        timestamp: parse_timestamp(row.get::<_, String>(1)?),
                        http_request_id: row.get(2)?,
                        process_name: row.get(3)?,
                        status_code: row.get::<_, i64>(4)? as u16,
                        headers_json: row.get(5)?,
                        body: row.get(6)?,
                    })
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
        .await
    }

    pub async fn query_kafka_since(&self, last_id: i64, limit: i64) -> Result<Vec<KafkaMessageRow>> {
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, timestamp, broker_name, topic, key, value FROM kafka_messages WHERE id > ?1 ORDER BY id ASC LIMIT ?2",
            )?;
            let rows = stmt
                .query_map(params![last_id, limit], |row| {
                    Ok(KafkaMessageRow {
                        id: row.get(0)?,
                        timestamp: parse_timestamp(row.get::<_, String>(1)?),
                        broker_name: row.get(2)?,
                        topic: row.get(3)?,
                        key: row.get(4)?,
                        value: row.get(5)?,
                    })
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
        .await
    }

    pub async fn get_request(&self, id: i64) -> Result<Option<HttpRequestRow>> {
        self.with_conn(move |conn| {
            conn.query_row(
                "SELECT id, timestamp, process_name, method, url, headers_json, body FROM http_requests WHERE id = ?1",
                params![id],
                |row| {
                    Ok(HttpRequestRow {
                        id: row.get(0)?,
                        timestamp: parse_timestamp(row.get::<_, String>(1)?),
                        process_name: row.get(2)?,
                        method: row.get(3)?,
                        url: row.get(4)?,
                        headers_json: row.get(5)?,
                        body: row.get(6)?,
                    })
                },
            )
            .optional()
        })
        .await
    }

    /// All log contents for a given process and stream, oldest first.
    pub async fn get_logs(&self, process_name: impl Into<String>, stream: Stream) -> Result<Vec<String>> {
        let process_name = process_name.into();
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT content FROM logs WHERE process_name = ?1 AND stream = ?2 ORDER BY id ASC",
            )?;
            let rows = stmt
                .query_map(params![process_name, stream.as_str()], |row| row.get(0))?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
        .await
    }

    /// Finalizes the store ahead of shutdown by flushing the WAL back
    /// into the main database file (`PRAGMA wal_checkpoint(TRUNCATE)`).
    /// The connection itself stays open for as long as any clone of this
    /// handle is alive (the Broadcast Tailer holds one), so this does not
    /// close a file descriptor; it makes every durable append visible in
    /// the main database file and surfaces any checkpoint failure to the
    /// caller. Safe to call more than once.
    pub async fn close(&self) -> Result<()> {
        self.with_conn(|conn| {
            conn.query_row("PRAGMA wal_checkpoint(TRUNCATE)", [], |_row| Ok(()))?;
            Ok(())
        })
        .await
    }
}

fn parse_timestamp(s: String) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(&s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

fn init_schema(conn: &Connection) -> rusqlite::Result<()> {
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "synchronous", "FULL")?;
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS logs (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            timestamp TEXT NOT NULL,
            process_name TEXT NOT NULL,
            stream TEXT NOT NULL,
            content TEXT NOT NULL
        );
        CREATE TABLE IF NOT EXISTS http_requests (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            timestamp TEXT NOT NULL,
            process_name TEXT NOT NULL,
            method TEXT NOT NULL,
            url TEXT NOT NULL,
            headers_json TEXT NOT NULL,
            body TEXT NOT NULL
        );
        CREATE TABLE IF NOT EXISTS http_responses (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            timestamp TEXT NOT NULL,
            http_request_id INTEGER NOT NULL REFERENCES http_requests(id),
            process_name TEXT NOT NULL,
            status_code INTEGER NOT NULL,
            headers_json TEXT NOT NULL,
            body TEXT NOT NULL
        );
        CREATE TABLE IF NOT EXISTS kafka_messages (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            timestamp TEXT NOT NULL,
            broker_name TEXT NOT NULL,
            topic TEXT NOT NULL,
            key TEXT,
            value TEXT NOT NULL
        );
        ",
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn append_and_query_logs_round_trip() {
        let store = EventStore::open_in_memory().await.unwrap();
        let id1 = store.append_log("svc1", Stream::Stdout, "hello\n").await.unwrap();
        let id2 = store.append_log("svc1", Stream::Stdout, "world\n").await.unwrap();
        assert!(id2 > id1);

        let rows = store.query_logs_since(0, 100).await.unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].content, "hello\n");
        assert_eq!(rows[1].content, "world\n");

        let contents = store.get_logs("svc1", Stream::Stdout).await.unwrap();
        assert_eq!(contents, vec!["hello\n".to_string(), "world\n".to_string()]);
    }

    #[tokio::test]
    async fn on_disk_store_persists_rows_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("events.sqlite3");

        {
            let store = EventStore::open(&path).await.unwrap();
            store.append_log("svc1", Stream::Stdout, "hello\n").await.unwrap();
        }

        let reopened = EventStore::open(&path).await.unwrap();
        let rows = reopened.query_logs_since(0, 100).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].content, "hello\n");
    }

    #[tokio::test]
    async fn response_references_existing_request() {
        let store = EventStore::open_in_memory().await.unwrap();
        let req_id = store
            .append_request("svc1", "GET", "/ping", "{}", "")
            .await
            .unwrap();
        let resp_id = store
            .append_response(req_id, "svc1", 200, "{}", "healthy")
            .await
            .unwrap();
        assert!(resp_id > req_id);

        let responses = store.query_responses_since(0, 10).await.unwrap();
        assert_eq!(responses.len(), 1);
        assert_eq!(responses[0].http_request_id, req_id);
    }

    #[tokio::test]
    async fn response_rejects_unknown_request_id() {
        let store = EventStore::open_in_memory().await.unwrap();
        let err = store.append_response(999, "svc1", 200, "{}", "").await.unwrap_err();
        assert!(matches!(err, EventStoreError::UnknownRequest(999)));
    }

    #[tokio::test]
    async fn query_since_is_ordered_ascending_by_id() {
        let store = EventStore::open_in_memory().await.unwrap();
        for i in 0..5 {
            store
                .append_kafka("kafka", "my-topic", None, format!("msg-{i}"), Utc::now())
                .await
                .unwrap();
        }
        let rows = store.query_kafka_since(2, 100).await.unwrap();
        assert_eq!(rows.len(), 3);
        assert!(rows.windows(2).all(|w| w[0].id < w[1].id));
    }
}
