//! Container runtime access.
//!
//! The agent drives containers through the [`ContainerRuntime`] trait so
//! the lifecycle code stays engine-agnostic and testable. The shipped
//! implementation speaks the Docker Engine HTTP API over its unix socket;
//! [`NullRuntime`] backs local development and tests where no engine is
//! available.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use fleetbox_error::{CommonError, Result};
use fleetbox_mandelbox::uinput::DeviceMapping;
use fleetbox_mandelbox::PortBinding;
use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper::header::{CONTENT_TYPE, HOST};
use hyper::{Method, Request, StatusCode};
use hyper_util::rt::TokioIo;
use serde_json::{json, Value};
use tokio::net::UnixStream;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// What the agent asks the engine to run for one mandelbox.
#[derive(Debug, Clone)]
pub struct ContainerSpec {
    /// Container name.
    pub name: String,
    /// Image reference.
    pub image: String,
    /// `KEY=VALUE` environment entries.
    pub env: Vec<String>,
    /// Host port bindings for the exposed mandelbox ports.
    pub port_bindings: Vec<PortBinding>,
    /// `host:container[:options]` bind mounts.
    pub binds: Vec<String>,
    /// Input devices mapped into the container.
    pub devices: Vec<DeviceMapping>,
}

/// An event from the engine's event stream.
#[derive(Debug, Clone)]
pub enum RuntimeEvent {
    /// A container exited.
    Die { runtime_id: String },
    /// Any other container action; logged and ignored.
    Other { action: String, runtime_id: String },
}

/// Why the event stream stopped.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StreamError {
    /// The engine is unreachable. Fatal.
    #[error("cannot connect to the container engine: {0}")]
    ConnectionFailed(String),
    /// The stream was fully read. Fatal.
    #[error("container event stream has been completely read")]
    Eof,
    /// Anything else; the stream is recreated.
    #[error("container event stream error: {0}")]
    Other(String),
}

/// Engine-agnostic container operations.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Creates a container without starting it; returns the runtime id.
    async fn create_container(&self, spec: &ContainerSpec) -> Result<String>;

    /// Starts a created container.
    async fn start_container(&self, runtime_id: &str) -> Result<()>;

    /// Stops a container, allowing it `timeout` to exit gracefully.
    async fn stop_container(&self, runtime_id: &str, timeout: Duration) -> Result<()>;

    /// Removes a stopped container.
    async fn remove_container(&self, runtime_id: &str) -> Result<()>;

    /// Opens the engine's container event stream.
    ///
    /// The receiver yields events until the stream breaks; the final item
    /// is always an `Err` describing why.
    async fn subscribe_events(
        &self,
    ) -> Result<mpsc::Receiver<std::result::Result<RuntimeEvent, StreamError>>>;
}

// ---------------------------------------------------------------------
// Docker engine implementation
// ---------------------------------------------------------------------

/// Docker Engine API client over the local unix socket.
pub struct DockerRuntime {
    socket: PathBuf,
}

impl DockerRuntime {
    /// Creates a client for the engine socket.
    #[must_use]
    pub fn new(socket: impl Into<PathBuf>) -> Self {
        Self {
            socket: socket.into(),
        }
    }

    async fn request(
        &self,
        method: Method,
        path: &str,
        body: Option<Value>,
    ) -> Result<(StatusCode, Bytes)> {
        let stream = UnixStream::connect(&self.socket).await.map_err(|e| {
            CommonError::internal(format!(
                "connecting to engine socket {}: {e}",
                self.socket.display()
            ))
        })?;
        let (mut sender, connection) = hyper::client::conn::http1::handshake(TokioIo::new(stream))
            .await
            .map_err(|e| CommonError::internal(format!("engine handshake: {e}")))?;
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                debug!(error = %e, "engine connection closed");
            }
        });

        let payload = match body {
            Some(value) => Bytes::from(value.to_string()),
            None => Bytes::new(),
        };
        let request = Request::builder()
            .method(method)
            .uri(path)
            .header(HOST, "docker")
            .header(CONTENT_TYPE, "application/json")
            .body(Full::new(payload))
            .map_err(|e| CommonError::internal(format!("building engine request: {e}")))?;

        let response = sender
            .send_request(request)
            .await
            .map_err(|e| CommonError::internal(format!("engine request {path}: {e}")))?;
        let status = response.status();
        let bytes = response
            .into_body()
            .collect()
            .await
            .map_err(|e| CommonError::internal(format!("reading engine response: {e}")))?
            .to_bytes();
        Ok((status, bytes))
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn create_container(&self, spec: &ContainerSpec) -> Result<String> {
        let mut exposed = serde_json::Map::new();
        let mut bindings = serde_json::Map::new();
        for binding in &spec.port_bindings {
            let key = format!("{}/{}", binding.mandelbox_port, binding.protocol);
            exposed.insert(key.clone(), json!({}));
            bindings.insert(
                key,
                json!([{ "HostPort": binding.host_port.to_string() }]),
            );
        }
        let devices: Vec<Value> = spec
            .devices
            .iter()
            .map(|d| {
                json!({
                    "PathOnHost": d.path_on_host,
                    "PathInContainer": d.path_in_mandelbox,
                    "CgroupPermissions": d.cgroup_permissions,
                })
            })
            .collect();

        let payload = json!({
            "Image": spec.image,
            "Env": spec.env,
            "ExposedPorts": exposed,
            "AttachStdin": true,
            "AttachStdout": true,
            "AttachStderr": true,
            "Tty": true,
            "HostConfig": {
                "PortBindings": bindings,
                "Binds": spec.binds,
                "Devices": devices,
                "CapDrop": ["ALL"],
                "CapAdd": [
                    "SETPCAP", "MKNOD", "AUDIT_WRITE", "CHOWN", "NET_RAW",
                    "DAC_OVERRIDE", "FOWNER", "FSETID", "KILL", "SETGID",
                    "SETUID", "NET_BIND_SERVICE", "SYS_CHROOT", "SETFCAP",
                    "SYS_NICE", "IPC_LOCK",
                ],
                "ShmSize": 2_147_483_648u64,
                "Tmpfs": { "/run": "size=52428800", "/run/lock": "size=52428800" },
            },
        });

        let path = format!("/containers/create?name={}", spec.name);
        let (status, body) = self.request(Method::POST, &path, Some(payload)).await?;
        if !status.is_success() {
            return Err(CommonError::internal(format!(
                "engine create returned {status}: {}",
                String::from_utf8_lossy(&body)
            )));
        }
        let value: Value = serde_json::from_slice(&body)
            .map_err(|e| CommonError::internal(format!("decoding create response: {e}")))?;
        value
            .get("Id")
            .and_then(Value::as_str)
            .map(str::to_owned)
            .ok_or_else(|| CommonError::internal("create response had no container id"))
    }

    async fn start_container(&self, runtime_id: &str) -> Result<()> {
        let path = format!("/containers/{runtime_id}/start");
        let (status, body) = self.request(Method::POST, &path, None).await?;
        if !status.is_success() && status != StatusCode::NOT_MODIFIED {
            return Err(CommonError::internal(format!(
                "engine start returned {status}: {}",
                String::from_utf8_lossy(&body)
            )));
        }
        Ok(())
    }

    async fn stop_container(&self, runtime_id: &str, timeout: Duration) -> Result<()> {
        let path = format!("/containers/{runtime_id}/stop?t={}", timeout.as_secs());
        let (status, body) = self.request(Method::POST, &path, None).await?;
        if !status.is_success() && status != StatusCode::NOT_MODIFIED {
            return Err(CommonError::internal(format!(
                "engine stop returned {status}: {}",
                String::from_utf8_lossy(&body)
            )));
        }
        Ok(())
    }

    async fn remove_container(&self, runtime_id: &str) -> Result<()> {
        let path = format!("/containers/{runtime_id}?force=true");
        let (status, body) = self.request(Method::DELETE, &path, None).await?;
        if !status.is_success() && status != StatusCode::NOT_FOUND {
            return Err(CommonError::internal(format!(
                "engine remove returned {status}: {}",
                String::from_utf8_lossy(&body)
            )));
        }
        Ok(())
    }

    async fn subscribe_events(
        &self,
    ) -> Result<mpsc::Receiver<std::result::Result<RuntimeEvent, StreamError>>> {
        let (events_tx, events_rx) = mpsc::channel(64);
        let socket = self.socket.clone();
        tokio::spawn(async move {
            let error = stream_engine_events(&socket, &events_tx).await;
            let _ = events_tx.send(Err(error)).await;
        });
        Ok(events_rx)
    }
}

/// Reads the engine's chunked event stream, forwarding container events
/// until the connection breaks. Returns why it stopped.
async fn stream_engine_events(
    socket: &PathBuf,
    events_tx: &mpsc::Sender<std::result::Result<RuntimeEvent, StreamError>>,
) -> StreamError {
    let stream = match UnixStream::connect(socket).await {
        Ok(stream) => stream,
        Err(e) => return StreamError::ConnectionFailed(e.to_string()),
    };
    let (mut sender, connection) =
        match hyper::client::conn::http1::handshake(TokioIo::new(stream)).await {
            Ok(pair) => pair,
            Err(e) => return StreamError::ConnectionFailed(e.to_string()),
        };
    tokio::spawn(async move {
        let _ = connection.await;
    });

    // Filter server-side to container events only.
    let filters = "%7B%22type%22%3A%5B%22container%22%5D%7D";
    let request = match Request::builder()
        .method(Method::GET)
        .uri(format!("/events?filters={filters}"))
        .header(HOST, "docker")
        .body(Full::new(Bytes::new()))
    {
        Ok(request) => request,
        Err(e) => return StreamError::Other(e.to_string()),
    };
    let response = match sender.send_request(request).await {
        Ok(response) => response,
        Err(e) => return StreamError::ConnectionFailed(e.to_string()),
    };
    if !response.status().is_success() {
        return StreamError::Other(format!("event stream returned {}", response.status()));
    }

    let mut body = response.into_body();
    let mut buffer: Vec<u8> = Vec::new();
    loop {
        match body.frame().await {
            Some(Ok(frame)) => {
                if let Some(data) = frame.data_ref() {
                    buffer.extend_from_slice(data);
                    while let Some(newline) = buffer.iter().position(|b| *b == b'\n') {
                        let line: Vec<u8> = buffer.drain(..=newline).collect();
                        if let Some(event) = parse_engine_event(&line) {
                            if events_tx.send(Ok(event)).await.is_err() {
                                return StreamError::Eof;
                            }
                        }
                    }
                }
            }
            Some(Err(e)) => return StreamError::Other(e.to_string()),
            None => return StreamError::Eof,
        }
    }
}

fn parse_engine_event(line: &[u8]) -> Option<RuntimeEvent> {
    let value: Value = serde_json::from_slice(line).ok()?;
    if value.get("Type").and_then(Value::as_str) != Some("container") {
        return None;
    }
    let action = value.get("Action").and_then(Value::as_str)?.to_owned();
    let runtime_id = value
        .get("Actor")
        .and_then(|actor| actor.get("ID"))
        .and_then(Value::as_str)
        .or_else(|| value.get("id").and_then(Value::as_str))?
        .to_owned();
    if action == "die" {
        Some(RuntimeEvent::Die { runtime_id })
    } else {
        Some(RuntimeEvent::Other { action, runtime_id })
    }
}

// ---------------------------------------------------------------------
// Null engine for local development and tests
// ---------------------------------------------------------------------

/// Engine stub: containers exist in name only and never die on their own.
#[derive(Default)]
pub struct NullRuntime {
    // Keeps every subscriber's sender alive so streams stay open.
    subscribers: parking_lot::Mutex<
        Vec<mpsc::Sender<std::result::Result<RuntimeEvent, StreamError>>>,
    >,
}

impl NullRuntime {
    /// Creates the stub engine.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Injects an event into every open stream (tests).
    pub async fn inject(&self, event: RuntimeEvent) {
        let subscribers = self.subscribers.lock().clone();
        for subscriber in subscribers {
            if subscriber.send(Ok(event.clone())).await.is_err() {
                warn!("event subscriber gone");
            }
        }
    }
}

#[async_trait]
impl ContainerRuntime for NullRuntime {
    async fn create_container(&self, spec: &ContainerSpec) -> Result<String> {
        debug!(name = %spec.name, image = %spec.image, "null engine create");
        Ok(format!("null-{}", uuid::Uuid::new_v4().simple()))
    }

    async fn start_container(&self, _runtime_id: &str) -> Result<()> {
        Ok(())
    }

    async fn stop_container(&self, _runtime_id: &str, _timeout: Duration) -> Result<()> {
        Ok(())
    }

    async fn remove_container(&self, _runtime_id: &str) -> Result<()> {
        Ok(())
    }

    async fn subscribe_events(
        &self,
    ) -> Result<mpsc::Receiver<std::result::Result<RuntimeEvent, StreamError>>> {
        let (events_tx, events_rx) = mpsc::channel(64);
        self.subscribers.lock().push(events_tx);
        Ok(events_rx)
    }
}
