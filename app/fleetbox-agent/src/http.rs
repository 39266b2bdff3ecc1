//! HTTPS ingress.
//!
//! Exactly one endpoint: `PUT /json_transport`, the client's channel for
//! delivering its config-encryption token and JSON blob to the mandelbox
//! it was assigned. The body is parsed in two passes (raw, then typed) so
//! authentication sees only the token field, the request is routed to the
//! waiting spinup by mandelbox id, and the handler blocks on the spinup's
//! result slot. Everything else is a 404; preflight gets a 204; CORS
//! headers are applied uniformly.

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::any;
use axum::{Json, Router};
use fleetbox_core::environment;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper_util::rt::TokioIo;
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tower::Service;
use tower_http::cors::{Any, CorsLayer};
use tracing::{debug, error, info, warn};

use crate::auth;
use crate::state::{Agent, JsonTransportBody, JsonTransportRequest};

/// How long the server drains connections after shutdown begins.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

#[derive(Clone)]
struct AppState {
    agent: Arc<Agent>,
    server_tx: mpsc::Sender<JsonTransportRequest>,
}

/// Builds the ingress router. Parsed requests are handed to the event
/// loop through `server_tx`.
pub fn router(agent: Arc<Agent>, server_tx: mpsc::Sender<JsonTransportRequest>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/json_transport", any(json_transport))
        .fallback(|| async { StatusCode::NOT_FOUND })
        .layer(cors)
        .with_state(AppState { agent, server_tx })
}

async fn json_transport(
    State(state): State<AppState>,
    method: Method,
    body: Bytes,
) -> Response {
    if method == Method::OPTIONS {
        return StatusCode::NO_CONTENT.into_response();
    }
    if method != Method::PUT {
        state.agent.metrics.increment_failed_requests();
        return (StatusCode::BAD_REQUEST, "expected a PUT request").into_response();
    }

    let started = Instant::now();

    // Raw pass: only the access token leaves this scope, so the typed
    // request never carries authentication concerns.
    let Ok(raw) = serde_json::from_slice::<serde_json::Map<String, Value>>(&body) else {
        state.agent.metrics.increment_failed_requests();
        return (StatusCode::BAD_REQUEST, "Malformed body").into_response();
    };
    let access_token = raw
        .get("jwt_access_token")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_owned();

    let parsed: JsonTransportBody = match serde_json::from_slice(&body) {
        Ok(parsed) => parsed,
        Err(e) => {
            debug!(error = %e, "transport body failed typed parse");
            state.agent.metrics.increment_failed_requests();
            return (StatusCode::BAD_REQUEST, "Malformed body").into_response();
        }
    };

    if !environment::app_environment().is_local() {
        if let Err(e) = auth::authenticate(
            &state.agent.config,
            state.agent.verifier.as_ref(),
            &access_token,
        ) {
            warn!(error = %e, "rejected transport request");
            state.agent.metrics.increment_failed_requests();
            return (StatusCode::UNAUTHORIZED, "unauthorized").into_response();
        }
    }

    let request = JsonTransportRequest::new(parsed);
    let result_slot = Arc::clone(&request.result);
    if state.server_tx.send(request).await.is_err() {
        state.agent.metrics.increment_failed_requests();
        return processing_error("service is shutting down");
    }

    match result_slot.wait().await {
        Ok(Ok(result)) => {
            state.agent.metrics.increment_successful_requests();
            state
                .agent
                .metrics
                .add_request_time_ms(started.elapsed().as_millis() as u64);
            (StatusCode::OK, Json(json!({ "result": result }))).into_response()
        }
        Ok(Err(message)) => {
            state.agent.metrics.increment_failed_requests();
            processing_error(&message)
        }
        Err(e) => {
            state.agent.metrics.increment_failed_requests();
            processing_error(&e.to_string())
        }
    }
}

fn processing_error(message: &str) -> Response {
    (
        StatusCode::NOT_ACCEPTABLE,
        Json(json!({ "result": null, "error": message })),
    )
        .into_response()
}

/// Serves the router over TLS on `0.0.0.0:<port>` until the root token is
/// cancelled, then drains open connections for up to 30 seconds.
pub async fn serve(
    tls_config: Arc<rustls::ServerConfig>,
    router: Router,
    port: u16,
    cancel: CancellationToken,
) {
    let listener = match TcpListener::bind(("0.0.0.0", port)).await {
        Ok(listener) => listener,
        Err(e) => {
            error!(port, error = %e, "failed to bind HTTPS listener");
            cancel.cancel();
            return;
        }
    };
    let acceptor = TlsAcceptor::from(tls_config);
    info!(port, "HTTPS server listening");

    let connections = TaskTracker::new();
    loop {
        let accepted = tokio::select! {
            accepted = listener.accept() => accepted,
            () = cancel.cancelled() => break,
        };
        let (stream, peer) = match accepted {
            Ok(pair) => pair,
            Err(e) => {
                warn!(error = %e, "accept failed");
                continue;
            }
        };

        let acceptor = acceptor.clone();
        let tower_service = router.clone();
        connections.spawn(async move {
            let tls_stream = match acceptor.accept(stream).await {
                Ok(tls_stream) => tls_stream,
                Err(e) => {
                    debug!(%peer, error = %e, "TLS handshake failed");
                    return;
                }
            };

            let hyper_service =
                hyper::service::service_fn(move |request: hyper::Request<Incoming>| {
                    tower_service.clone().call(request)
                });

            if let Err(e) = http1::Builder::new()
                .serve_connection(TokioIo::new(tls_stream), hyper_service)
                .await
            {
                let message = e.to_string().to_lowercase();
                if !message.contains("connection reset") && !message.contains("broken pipe") {
                    debug!(%peer, error = %e, "connection error");
                }
            }
        });
    }

    info!("shutting down HTTPS server");
    connections.close();
    if tokio::time::timeout(SHUTDOWN_GRACE, connections.wait())
        .await
        .is_err()
    {
        warn!("HTTPS connections still open after grace period");
    } else {
        info!("gracefully shut down HTTPS server");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AgentConfig;
    use crate::metrics::Metrics;
    use crate::runtime::NullRuntime;
    use crate::state::{HostDatastore, TransportMap};
    use fleetbox_core::Dirs;
    use fleetbox_db::MemoryRepository;
    use fleetbox_mandelbox::{MandelboxRegistry, ResourceBroker};
    use http_body_util::BodyExt;
    use tower::util::ServiceExt;

    fn test_agent() -> Arc<Agent> {
        let (death_tx, _death_rx) = mpsc::channel(8);
        let repository = Arc::new(MemoryRepository::new());
        Arc::new(Agent {
            config: AgentConfig::default(),
            dirs: Dirs::default(),
            broker: Arc::new(ResourceBroker::with_seed(1, 1)),
            registry: Arc::new(MandelboxRegistry::new()),
            datastore: HostDatastore::disabled(repository),
            runtime: Arc::new(NullRuntime::new()),
            verifier: Arc::new(auth::InsecureVerifier),
            metrics: Arc::new(Metrics::new(1)),
            transport: TransportMap::default(),
            cancel: CancellationToken::new(),
            tracker: TaskTracker::new(),
            death_tx,
        })
    }

    #[tokio::test]
    async fn malformed_body_is_a_bad_request() {
        let agent = test_agent();
        let (server_tx, _server_rx) = mpsc::channel(8);
        let app = router(Arc::clone(&agent), server_tx);

        let response = app
            .oneshot(
                axum::http::Request::builder()
                    .method("PUT")
                    .uri("/json_transport")
                    .body(axum::body::Body::from("{not json"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(agent.metrics.failed_requests(), 1);
    }

    #[tokio::test]
    async fn wrong_method_is_a_bad_request() {
        let agent = test_agent();
        let (server_tx, _server_rx) = mpsc::channel(8);
        let app = router(agent, server_tx);

        let response = app
            .oneshot(
                axum::http::Request::builder()
                    .method("POST")
                    .uri("/json_transport")
                    .body(axum::body::Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn unknown_paths_are_not_found() {
        let agent = test_agent();
        let (server_tx, _server_rx) = mpsc::channel(8);
        let app = router(agent, server_tx);

        let response = app
            .oneshot(
                axum::http::Request::builder()
                    .uri("/nope")
                    .body(axum::body::Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn preflight_gets_no_content() {
        let agent = test_agent();
        let (server_tx, _server_rx) = mpsc::channel(8);
        let app = router(agent, server_tx);

        let response = app
            .oneshot(
                axum::http::Request::builder()
                    .method("OPTIONS")
                    .uri("/json_transport")
                    .body(axum::body::Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
    }

    #[tokio::test]
    async fn valid_request_round_trips_through_the_result_slot() {
        let agent = test_agent();
        let (server_tx, mut server_rx) = mpsc::channel(8);
        let app = router(Arc::clone(&agent), server_tx);

        // Answer the request like a spinup would.
        tokio::spawn(async move {
            let request: JsonTransportRequest = server_rx.recv().await.unwrap();
            request
                .result
                .set(Ok(crate::state::JsonTransportResult {
                    host_port_32262: 32801,
                    host_port_32263: 32802,
                    host_port_32273: 32803,
                    aes_key: "abcd".to_owned(),
                }))
                .unwrap();
        });

        let body = json!({
            "mandelbox_id": uuid::Uuid::new_v4(),
            "config_encryption_token": "token",
            "json_data": "{}",
        });
        let response = app
            .oneshot(
                axum::http::Request::builder()
                    .method("PUT")
                    .uri("/json_transport")
                    .header("content-type", "application/json")
                    .body(axum::body::Body::from(body.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let value: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(value["result"]["host_port_32262"], 32801);
        assert_eq!(value["result"]["aes_key"], "abcd");
    }
}
