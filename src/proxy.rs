//! A reverse proxy in front of a service that records the full
//! request/response pair before forwarding and relaying the response.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::State;
use axum::http::header::HOST;
use axum::http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::routing::any;
use axum::Router;
use http_body_util::BodyExt;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client as HyperClient;
use hyper_util::rt::TokioExecutor;
use log::{error, warn};
use tokio::net::TcpListener;
use tokio::sync::watch;

use crate::error::StartupError;
use crate::event_store::EventStore;

/// RFC 7230 §6.1 hop-by-hop headers, stripped in both directions.
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

#[derive(Clone)]
struct ProxyState {
    process_name: Arc<String>,
    upstream: String,
    upstream_host: String,
    store: EventStore,
    client: HyperClient<HttpConnector, Body>,
}

/// A running Capture Proxy instance.
pub struct ProxyHandle {
    pub stop: crate::process::StopToken,
    join: tokio::task::JoinHandle<()>,
}

impl ProxyHandle {
    pub async fn join(self) {
        let _ = self.join.await;
    }
}

pub struct CaptureProxy;

impl CaptureProxy {
    /// Binds `listen_port` and forwards everything to
    /// `http://127.0.0.1:<service_port>`, recording every request/response
    /// pair under `process_name`.
    pub async fn spawn(
        process_name: impl Into<String>,
        listen_port: u16,
        service_port: u16,
        store: EventStore,
    ) -> Result<ProxyHandle, StartupError> {
        let process_name = process_name.into();
        let addr = SocketAddr::from(([127, 0, 0, 1], listen_port));
        let listener = TcpListener::bind(addr)
            .await
            .map_err(StartupError::ProxyBind)?;

        let client: HyperClient<HttpConnector, Body> =
            HyperClient::builder(TokioExecutor::new()).build(HttpConnector::new());

        let state = ProxyState {
            process_name: Arc::new(process_name),
            upstream: format!("http://127.0.0.1:{service_port}"),
            upstream_host: format!("127.0.0.1:{service_port}"),
            store,
            client,
        };

        let app = Router::new().fallback(any(handle_request)).with_state(state);

        let (stop_tx, mut stop_rx) = watch::channel(false);
        let join = tokio::spawn(async move {
            let shutdown = async move {
                let _ = stop_rx.changed().await;
            };
            if let Err(e) = axum::serve(listener, app.into_make_service())
                .with_graceful_shutdown(shutdown)
                .await
            {
                error!("capture proxy on {addr}: {e}");
            }
        });

        Ok(ProxyHandle {
            stop: crate::process::StopToken::from_sender(stop_tx),
            join,
        })
    }
}

async fn handle_request(
    State(state): State<ProxyState>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Body,
) -> Response {
    let body_bytes = match body.collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => {
            warn!("proxy '{}': failed to read request body: {e}", state.process_name);
            return StatusCode::BAD_REQUEST.into_response();
        }
    };

    let headers_json = headers_to_json(&headers);
    let request_body_text = String::from_utf8_lossy(&body_bytes).into_owned();

    let request_id = match state
        .store
        .append_request(
            state.process_name.as_str(),
            method.as_str(),
            uri.to_string(),
            headers_json,
            request_body_text,
        )
        .await
    {
        Ok(id) => id,
        Err(e) => {
            error!("proxy '{}': failed to persist request: {e}", state.process_name);
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };

    let upstream_uri = format!(
        "{}{}",
        state.upstream,
        uri.path_and_query().map(|pq| pq.as_str()).unwrap_or("/")
    );

    let mut upstream_request = hyper::Request::builder()
        .method(method)
        .uri(upstream_uri)
        .body(Body::from(body_bytes))
        .expect("method/uri validated by axum extraction");
    for (name, value) in headers.iter() {
        if is_hop_by_hop(name) || name == HOST {
            continue;
        }
        upstream_request.headers_mut().append(name.clone(), value.clone());
    }
    upstream_request.headers_mut().insert(
        HOST,
        HeaderValue::from_str(&state.upstream_host).unwrap_or_else(|_| HeaderValue::from_static("localhost")),
    );

    let upstream_response = match state.client.request(upstream_request).await {
        Ok(response) => response,
        Err(e) => {
            warn!("proxy '{}': upstream request failed: {e}", state.process_name);
            let _ = state
                .store
                .append_response(
                    request_id,
                    state.process_name.as_str(),
                    StatusCode::BAD_GATEWAY.as_u16(),
                    "{}",
                    format!("upstream error: {e}"),
                )
                .await;
            return StatusCode::BAD_GATEWAY.into_response();
        }
    };

    let status = upstream_response.status();
    let response_headers = upstream_response.headers().clone();
    let response_body_bytes = match upstream_response.into_body().collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => {
            warn!("proxy '{}': failed to read upstream response body: {e}", state.process_name);
            bytes::Bytes::new()
        }
    };

    let response_headers_json = headers_to_json(&response_headers);
    let response_body_text = String::from_utf8_lossy(&response_body_bytes).into_owned();

    if let Err(e) = state
        .store
        .append_response(request_id, state.process_name.as_str(), status.as_u16(), response_headers_json, response_body_text)
        .await
    {
        error!("proxy '{}': failed to persist response: {e}", state.process_name);
    }

    let mut response = Response::builder().status(status);
    for (name, value) in response_headers.iter() {
        if is_hop_by_hop(name) {
            continue;
        }
        response = response.header(name, value);
    }
    response
        .body(Body::from(response_body_bytes))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

fn is_hop_by_hop(name: &HeaderName) -> bool {
    HOP_BY_HOP.iter().any(|h| name.as_str().eq_ignore_ascii_case(h))
}

fn headers_to_json(headers: &HeaderMap) -> String {
    let map: serde_json::Map<String, serde_json::Value> = headers
        .iter()
        .map(|(name, value)| {
            (
                name.to_string(),
                serde_json::Value::String(value.to_str().unwrap_or("").to_string()),
            )
        })
        .collect();
    serde_json::Value::Object(map).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener as TestListener;

    async fn spawn_echo_upstream() -> u16 {
        let listener = TestListener::bind(("127.0.0.1", 0)).await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let app = Router::new().fallback(any(|body: String| async move { body }));
            let _ = axum::serve(listener, app).await;
        });
        port
    }

    #[tokio::test]
    async fn proxies_and_records_request_response_pair() {
        let upstream_port = spawn_echo_upstream().await;
        let store = EventStore::open_in_memory().await.unwrap();

        let proxy_listener = TestListener::bind(("127.0.0.1", 0)).await.unwrap();
        let listen_port = proxy_listener.local_addr().unwrap().port();
        drop(proxy_listener);

        let handle = CaptureProxy::spawn("echo-svc", listen_port, upstream_port, store.clone())
            .await
            .unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(100)).await;

        let client = reqwest::Client::new();
        let response = client
            .post(format!("http://127.0.0.1:{listen_port}/ping"))
            .body("hello")
            .send()
            .await
            .unwrap();
        assert!(response.status().is_success());
        assert_eq!(response.text().await.unwrap(), "hello");

        let requests = store.query_requests_since(0, 10).await.unwrap();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].body, "hello");
        assert_eq!(requests[0].method, "POST");

        let responses = store.query_responses_since(0, 10).await.unwrap();
        assert_eq!(responses.len(), 1);
        assert_eq!(responses[0].http_request_id, requests[0].id);
        assert_eq!(responses[0].status_code, 200);

        handle.stop.stop();
        handle.join().await;
    }
}
