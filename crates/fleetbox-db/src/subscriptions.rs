//! Live pub/sub over the datastore's GraphQL websocket.
//!
//! Both services keep one long-lived connection speaking the
//! graphql-transport-ws protocol: `connection_init`, wait for the ack, then
//! one `subscribe` frame per registered subscription. Every `next` frame is
//! decoded into a [`SubscriptionEvent`] and run through the subscription's
//! predicate handler; only matching events reach the consumer channel.
//! Delivery is at-least-once; consumers are idempotent.

use fleetbox_error::{CommonError, Result};
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::queries;
use crate::types::{FrontendVersion, Instance, Mandelbox};

/// Delay before reconnecting after a dropped connection.
const RECONNECT_DELAY: std::time::Duration = std::time::Duration::from_secs(5);

/// A change event received from the datastore.
#[derive(Debug, Clone)]
pub enum SubscriptionEvent {
    /// Instance rows matching an instance subscription.
    Instance(Vec<Instance>),
    /// Mandelbox rows matching a mandelbox subscription.
    Mandelbox(Vec<Mandelbox>),
    /// The frontend version row changed.
    FrontendVersion(FrontendVersion),
}

/// Which root field a subscription's `next` frames carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionKind {
    Instances,
    Mandelboxes,
    FrontendVersion,
}

/// Predicate deciding whether an event is relevant to this process.
pub type HandlerFn = fn(&SubscriptionEvent, &Value) -> bool;

/// One registered subscription.
pub struct Subscription {
    /// GraphQL subscription document.
    pub document: &'static str,
    /// Variables the document is instantiated with; also visible to the
    /// handler for filtering.
    pub variables: Value,
    /// Root field the results arrive under.
    pub kind: SubscriptionKind,
    /// Predicate filter applied before events are forwarded.
    pub handler: HandlerFn,
}

/// Matches instance events whose first row carries the subscribed id and
/// status.
pub fn instance_status_handler(event: &SubscriptionEvent, variables: &Value) -> bool {
    let SubscriptionEvent::Instance(instances) = event else {
        return false;
    };
    let Some(instance) = instances.first() else {
        return false;
    };
    let (Some(id), Some(status)) = (
        variables.get("id").and_then(Value::as_str),
        variables.get("status").and_then(Value::as_str),
    ) else {
        return false;
    };
    instance.id == id && instance.status.to_string() == status
}

/// Matches any non-empty instance event with the subscribed status
/// (the scaler watches every instance entering DRAINING).
pub fn any_instance_status_handler(event: &SubscriptionEvent, variables: &Value) -> bool {
    let SubscriptionEvent::Instance(instances) = event else {
        return false;
    };
    let Some(instance) = instances.first() else {
        return false;
    };
    variables
        .get("status")
        .and_then(Value::as_str)
        .is_some_and(|status| instance.status.to_string() == status)
}

/// Matches mandelbox events bound to the subscribed instance and status.
pub fn mandelbox_allocated_handler(event: &SubscriptionEvent, variables: &Value) -> bool {
    let SubscriptionEvent::Mandelbox(mandelboxes) = event else {
        return false;
    };
    let Some(mandelbox) = mandelboxes.first() else {
        return false;
    };
    let (Some(instance_id), Some(status)) = (
        variables.get("instance_id").and_then(Value::as_str),
        variables.get("status").and_then(Value::as_str),
    ) else {
        return false;
    };
    mandelbox.instance_id == instance_id && mandelbox.status.to_string() == status
}

/// Accepts every frontend-version event.
pub fn frontend_version_handler(event: &SubscriptionEvent, _variables: &Value) -> bool {
    matches!(event, SubscriptionEvent::FrontendVersion(_))
}

/// The subscriptions the host agent registers: its own instance row
/// entering DRAINING, and mandelboxes on this instance entering ALLOCATED.
#[must_use]
pub fn host_subscriptions(instance_id: &str) -> Vec<Subscription> {
    vec![
        Subscription {
            document: queries::SUB_INSTANCE_BY_ID_WITH_STATUS,
            variables: json!({ "id": instance_id, "status": "DRAINING" }),
            kind: SubscriptionKind::Instances,
            handler: instance_status_handler,
        },
        Subscription {
            document: queries::SUB_MANDELBOXES_BY_INSTANCE_ID,
            variables: json!({ "instance_id": instance_id, "status": "ALLOCATED" }),
            kind: SubscriptionKind::Mandelboxes,
            handler: mandelbox_allocated_handler,
        },
    ]
}

/// The subscriptions the scaling controller registers: any instance
/// entering DRAINING, and frontend version rollouts.
#[must_use]
pub fn scaler_subscriptions() -> Vec<Subscription> {
    vec![
        Subscription {
            document: queries::SUB_INSTANCES_BY_STATUS,
            variables: json!({ "status": "DRAINING" }),
            kind: SubscriptionKind::Instances,
            handler: any_instance_status_handler,
        },
        Subscription {
            document: queries::SUB_FRONTEND_VERSION,
            variables: json!({}),
            kind: SubscriptionKind::FrontendVersion,
            handler: frontend_version_handler,
        },
    ]
}

/// Long-lived subscription client.
pub struct SubscriptionClient {
    url: String,
    admin_secret: Option<String>,
    subscriptions: Vec<Subscription>,
}

impl SubscriptionClient {
    /// Creates a client for the given websocket endpoint
    /// (e.g. `wss://db.fleetbox.dev/v1/graphql`).
    #[must_use]
    pub fn new(url: impl Into<String>, admin_secret: Option<String>) -> Self {
        Self {
            url: url.into(),
            admin_secret,
            subscriptions: Vec::new(),
        }
    }

    /// Registers the subscriptions to open on every (re)connect.
    pub fn set_subscriptions(&mut self, subscriptions: Vec<Subscription>) {
        self.subscriptions = subscriptions;
    }

    /// Runs until cancelled, reconnecting after dropped connections.
    ///
    /// # Errors
    ///
    /// Returns an error only for unrecoverable setup problems (bad URL);
    /// transport failures are logged and retried.
    pub async fn run(
        self,
        cancel: CancellationToken,
        events: mpsc::Sender<SubscriptionEvent>,
    ) -> Result<()> {
        loop {
            if cancel.is_cancelled() {
                return Ok(());
            }
            match self.serve_connection(&cancel, &events).await {
                Ok(()) => return Ok(()),
                Err(err) => {
                    warn!(error = %err, "subscription connection dropped, reconnecting");
                }
            }
            tokio::select! {
                () = tokio::time::sleep(RECONNECT_DELAY) => {}
                () = cancel.cancelled() => return Ok(()),
            }
        }
    }

    async fn serve_connection(
        &self,
        cancel: &CancellationToken,
        events: &mpsc::Sender<SubscriptionEvent>,
    ) -> Result<()> {
        let mut request = self
            .url
            .as_str()
            .into_client_request()
            .map_err(|e| CommonError::config(format!("bad subscription URL: {e}")))?;
        request.headers_mut().insert(
            "Sec-WebSocket-Protocol",
            "graphql-transport-ws"
                .parse()
                .map_err(|_| CommonError::internal("building protocol header"))?,
        );

        let (stream, _) = tokio_tungstenite::connect_async(request)
            .await
            .map_err(|e| CommonError::database(format!("connecting subscription socket: {e}")))?;
        let (mut sink, mut source) = stream.split();

        let init_payload = match &self.admin_secret {
            Some(secret) => json!({ "headers": { "x-hasura-admin-secret": secret } }),
            None => json!({}),
        };
        send_frame(
            &mut sink,
            &json!({ "type": "connection_init", "payload": init_payload }),
        )
        .await?;

        // Wait for the ack before subscribing.
        loop {
            let frame = next_frame(&mut source).await?;
            match frame.get("type").and_then(Value::as_str) {
                Some("connection_ack") => break,
                Some("ping") => send_frame(&mut sink, &json!({ "type": "pong" })).await?,
                other => {
                    debug!(frame_type = ?other, "ignoring pre-ack frame");
                }
            }
        }

        for (index, subscription) in self.subscriptions.iter().enumerate() {
            send_frame(
                &mut sink,
                &json!({
                    "id": index.to_string(),
                    "type": "subscribe",
                    "payload": {
                        "query": subscription.document,
                        "variables": subscription.variables,
                    },
                }),
            )
            .await?;
        }
        info!(count = self.subscriptions.len(), "datastore subscriptions open");

        loop {
            let frame = tokio::select! {
                frame = next_frame(&mut source) => frame?,
                () = cancel.cancelled() => {
                    // Best-effort unsubscribe; the server drops state on close.
                    for index in 0..self.subscriptions.len() {
                        let _ = send_frame(
                            &mut sink,
                            &json!({ "id": index.to_string(), "type": "complete" }),
                        )
                        .await;
                    }
                    let _ = sink.send(Message::Close(None)).await;
                    return Ok(());
                }
            };

            match frame.get("type").and_then(Value::as_str) {
                Some("ping") => send_frame(&mut sink, &json!({ "type": "pong" })).await?,
                Some("next") => {
                    let Some(subscription) = frame
                        .get("id")
                        .and_then(Value::as_str)
                        .and_then(|id| id.parse::<usize>().ok())
                        .and_then(|i| self.subscriptions.get(i))
                    else {
                        continue;
                    };
                    let Some(data) = frame.get("payload").and_then(|p| p.get("data")) else {
                        continue;
                    };
                    match decode_event(subscription.kind, data) {
                        Ok(Some(event)) => {
                            if (subscription.handler)(&event, &subscription.variables) {
                                if events.send(event).await.is_err() {
                                    // Consumer is gone; nothing left to serve.
                                    return Ok(());
                                }
                            }
                        }
                        Ok(None) => {}
                        Err(err) => warn!(error = %err, "dropping undecodable subscription frame"),
                    }
                }
                Some("error") => {
                    warn!(frame = %frame, "subscription errored");
                }
                Some("complete") | None => {}
                Some(other) => debug!(frame_type = other, "ignoring frame"),
            }
        }
    }
}

async fn send_frame<S>(sink: &mut S, frame: &Value) -> Result<()>
where
    S: futures_util::Sink<Message> + Unpin,
    S::Error: std::fmt::Display,
{
    sink.send(Message::Text(frame.to_string().into()))
        .await
        .map_err(|e| CommonError::database(format!("sending subscription frame: {e}")))
}

async fn next_frame<S>(source: &mut S) -> Result<Value>
where
    S: futures_util::Stream<Item = std::result::Result<Message, tokio_tungstenite::tungstenite::Error>>
        + Unpin,
{
    loop {
        match source.next().await {
            Some(Ok(Message::Text(text))) => {
                return serde_json::from_str(text.as_str()).map_err(|e| {
                    CommonError::database(format!("decoding subscription frame: {e}"))
                });
            }
            Some(Ok(Message::Close(_))) | None => {
                return Err(CommonError::database("subscription socket closed"));
            }
            Some(Ok(_)) => {}
            Some(Err(e)) => {
                return Err(CommonError::database(format!("subscription socket: {e}")));
            }
        }
    }
}

fn decode_event(kind: SubscriptionKind, data: &Value) -> Result<Option<SubscriptionEvent>> {
    let decode_rows = |root: &str| -> Result<Value> {
        data.get(root)
            .cloned()
            .ok_or_else(|| CommonError::database(format!("missing {root} in frame")))
    };
    match kind {
        SubscriptionKind::Instances => {
            let rows: Vec<Instance> = serde_json::from_value(decode_rows("fleet_instances")?)
                .map_err(|e| CommonError::database(format!("decoding instance rows: {e}")))?;
            Ok(Some(SubscriptionEvent::Instance(rows)))
        }
        SubscriptionKind::Mandelboxes => {
            let rows: Vec<Mandelbox> = serde_json::from_value(decode_rows("fleet_mandelboxes")?)
                .map_err(|e| CommonError::database(format!("decoding mandelbox rows: {e}")))?;
            Ok(Some(SubscriptionEvent::Mandelbox(rows)))
        }
        SubscriptionKind::FrontendVersion => {
            let mut rows: Vec<FrontendVersion> =
                serde_json::from_value(decode_rows("config_frontend_version")?)
                    .map_err(|e| CommonError::database(format!("decoding version rows: {e}")))?;
            Ok(rows.pop().map(SubscriptionEvent::FrontendVersion))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{InstanceStatus, MandelboxId, MandelboxStatus};
    use chrono::Utc;

    fn instance(id: &str, status: InstanceStatus) -> Instance {
        Instance {
            id: id.to_owned(),
            provider: "AWS".to_owned(),
            region: "us-east-1".to_owned(),
            image_id: "img".to_owned(),
            client_sha: "sha".to_owned(),
            ip_addr: "1.1.1.1".to_owned(),
            instance_type: "g4dn.2xlarge".to_owned(),
            remaining_capacity: 2,
            status,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn instance_handler_filters_on_id_and_status() {
        let vars = json!({ "id": "i-1", "status": "DRAINING" });
        let matching =
            SubscriptionEvent::Instance(vec![instance("i-1", InstanceStatus::Draining)]);
        let wrong_id =
            SubscriptionEvent::Instance(vec![instance("i-2", InstanceStatus::Draining)]);
        let wrong_status =
            SubscriptionEvent::Instance(vec![instance("i-1", InstanceStatus::Active)]);
        let empty = SubscriptionEvent::Instance(vec![]);

        assert!(instance_status_handler(&matching, &vars));
        assert!(!instance_status_handler(&wrong_id, &vars));
        assert!(!instance_status_handler(&wrong_status, &vars));
        assert!(!instance_status_handler(&empty, &vars));
    }

    #[test]
    fn mandelbox_handler_filters_on_instance_and_status() {
        let vars = json!({ "instance_id": "i-1", "status": "ALLOCATED" });
        let row = Mandelbox {
            id: MandelboxId::new(),
            app: "CHROME".to_owned(),
            instance_id: "i-1".to_owned(),
            user_id: "u".to_owned(),
            session_id: "s".to_owned(),
            status: MandelboxStatus::Allocated,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        let matching = SubscriptionEvent::Mandelbox(vec![row.clone()]);
        let elsewhere = SubscriptionEvent::Mandelbox(vec![Mandelbox {
            instance_id: "i-2".to_owned(),
            ..row
        }]);
        assert!(mandelbox_allocated_handler(&matching, &vars));
        assert!(!mandelbox_allocated_handler(&elsewhere, &vars));
    }

    #[test]
    fn decode_event_reads_root_fields() {
        let data = json!({ "fleet_instances": [instance("i-1", InstanceStatus::Draining)] });
        let event = decode_event(SubscriptionKind::Instances, &data)
            .unwrap()
            .unwrap();
        assert!(matches!(event, SubscriptionEvent::Instance(rows) if rows.len() == 1));

        let data = json!({ "config_frontend_version": [{ "major": 3, "minor": 1, "micro": 0 }] });
        let event = decode_event(SubscriptionKind::FrontendVersion, &data)
            .unwrap()
            .unwrap();
        assert!(matches!(
            event,
            SubscriptionEvent::FrontendVersion(v) if v.major == 3 && v.minor == 1
        ));
    }
}
