//! The agent's main event loop.
//!
//! One long-lived task fans in four sources: the container engine's event
//! stream, datastore subscription events, parsed HTTP transport requests,
//! and the internal death channel. The loop deliberately outlives the
//! root cancellation (it stops on its own keepalive token) so container
//! deaths during shutdown still reach the datastore.

use std::sync::Arc;

use fleetbox_core::environment;
use fleetbox_db::subscriptions::SubscriptionEvent;
use fleetbox_db::{InstanceStatus, Mandelbox as MandelboxRow, MandelboxId, MandelboxStatus};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::runtime::{RuntimeEvent, StreamError};
use crate::state::{Agent, JsonTransportRequest};

/// Runs the event loop until `keepalive` is cancelled.
pub async fn event_loop(
    agent: Arc<Agent>,
    keepalive: CancellationToken,
    mut server_events: mpsc::Receiver<JsonTransportRequest>,
    mut subscription_events: mpsc::Receiver<SubscriptionEvent>,
    mut death_events: mpsc::Receiver<MandelboxId>,
) {
    let mut runtime_events = match agent.runtime.subscribe_events().await {
        Ok(stream) => stream,
        Err(e) => {
            error!(error = %e, "could not open the container event stream");
            agent.cancel.cancel();
            return;
        }
    };
    info!("initialized container event stream");
    info!("entering event loop");

    // A closed channel yields `None` immediately; its arm is disabled so
    // the loop doesn't spin while shutdown drains the other sources.
    let mut runtime_open = true;
    let mut server_open = true;
    let mut subscriptions_open = true;
    let mut deaths_open = true;

    loop {
        tokio::select! {
            () = keepalive.cancelled() => {
                info!("leaving main event loop");
                return;
            }

            maybe = runtime_events.recv(), if runtime_open => match maybe {
                Some(Ok(RuntimeEvent::Die { runtime_id })) => {
                    let agent = Arc::clone(&agent);
                    tokio::spawn(async move {
                        agent.mandelbox_die_handler(&runtime_id).await;
                    });
                }
                Some(Ok(RuntimeEvent::Other { action, runtime_id })) => {
                    debug!(action, runtime_id, "container event");
                }
                Some(Err(stream_error)) => {
                    match stream_error {
                        StreamError::Other(message) => {
                            warn!(message, "container event stream broke, re-initializing");
                            tokio::time::sleep(std::time::Duration::from_secs(1)).await;
                            match agent.runtime.subscribe_events().await {
                                Ok(stream) => {
                                    runtime_events = stream;
                                    info!("re-initialized container event stream");
                                }
                                Err(e) => {
                                    error!(error = %e, "could not re-open the event stream");
                                    runtime_open = false;
                                    agent.cancel.cancel();
                                }
                            }
                        }
                        fatal @ (StreamError::ConnectionFailed(_) | StreamError::Eof) => {
                            error!(error = %fatal, "container event stream is gone");
                            runtime_open = false;
                            agent.cancel.cancel();
                        }
                    }
                }
                None => {
                    // Stream task ended without a final error; treat as a
                    // broken stream and re-initialize.
                    warn!("container event stream closed, re-initializing");
                    tokio::time::sleep(std::time::Duration::from_secs(1)).await;
                    match agent.runtime.subscribe_events().await {
                        Ok(stream) => runtime_events = stream,
                        Err(e) => {
                            error!(error = %e, "could not re-open the event stream");
                            runtime_open = false;
                            agent.cancel.cancel();
                        }
                    }
                }
            },

            maybe = death_events.recv(), if deaths_open => {
                let Some(_mandelbox_id) = maybe else {
                    deaths_open = false;
                    continue;
                };
                let agent = Arc::clone(&agent);
                tokio::spawn(async move {
                    agent.monitor_waiting_mandelboxes().await;
                });
            }

            maybe = server_events.recv(), if server_open => {
                let Some(request) = maybe else {
                    server_open = false;
                    continue;
                };
                handle_server_event(&agent, request);
            }

            maybe = subscription_events.recv(), if subscriptions_open => {
                let Some(event) = maybe else {
                    subscriptions_open = false;
                    continue;
                };
                handle_subscription_event(&agent, event);
            }
        }
    }
}

fn handle_server_event(agent: &Arc<Agent>, request: JsonTransportRequest) {
    if environment::app_environment().is_local_without_db() {
        // No datastore, so no allocation event will arrive: synthesize
        // one and run both spinup halves back to back.
        let agent = Arc::clone(agent);
        tokio::spawn(async move {
            local_transport_flow(agent, request).await;
        });
        return;
    }

    // Deployed path: park the request where the allocated mandelbox's
    // spinup picks it up. A second request for the same mandelbox is
    // rejected by the slot's once-only semantics.
    if let Err(rejected) = agent.transport.submit(request) {
        warn!(mandelbox_id = %rejected.body.mandelbox_id,
              "duplicate transport request rejected");
        let _ = rejected
            .result
            .set(Err("mandelbox already received a transport request".to_owned()));
    }
}

async fn local_transport_flow(agent: Arc<Agent>, request: JsonTransportRequest) {
    let mandelbox_id = request.body.mandelbox_id;
    let app_name = request
        .body
        .app_name
        .clone()
        .unwrap_or_else(|| agent.config.app_name.clone());

    if let Err(e) = agent.start_mandelbox_spin_up(mandelbox_id, &app_name).await {
        error!(%mandelbox_id, error = %e, "local spinup failed");
        let _ = request.result.set(Err(e.to_string()));
        return;
    }

    let allocation = MandelboxRow {
        id: mandelbox_id,
        app: app_name,
        instance_id: agent.config.instance_id.clone(),
        user_id: "localdev".to_owned(),
        session_id: chrono::Utc::now().timestamp_millis().to_string(),
        status: MandelboxStatus::Allocated,
        created_at: chrono::Utc::now(),
        updated_at: chrono::Utc::now(),
    };
    agent.finish_mandelbox_spin_up(allocation, Some(request)).await;
}

fn handle_subscription_event(agent: &Arc<Agent>, event: SubscriptionEvent) {
    match event {
        SubscriptionEvent::Mandelbox(rows) => {
            let Some(allocation) = rows.into_iter().next() else {
                return;
            };
            let agent = Arc::clone(agent);
            tokio::spawn(async move {
                agent.finish_mandelbox_spin_up(allocation, None).await;
            });
        }
        SubscriptionEvent::Instance(rows) => {
            let Some(instance) = rows.first() else { return };
            if instance.status == InstanceStatus::Draining {
                info!("this instance was marked draining, beginning shutdown");
                agent.cancel.cancel();
            }
        }
        SubscriptionEvent::FrontendVersion(_) => {
            // The agent has no use for version rollouts.
        }
    }
}
