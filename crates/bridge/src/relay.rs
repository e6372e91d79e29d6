//! The shared gateway-push relay.
//!
//! One background task drains the gateway's push stream and re-delivers to
//! subscribed, connected nodes. Its lifetime equals "at least one connection
//! exists": started by the first registration, aborted when the registry
//! empties — both decisions made under the coordinator lock.

use {
    futures::StreamExt,
    serde_json::Value,
    tracing::{debug, trace},
};

use tether_protocol::{GatewayPush, server_events};

use crate::state::{BridgeInner, BridgeState};

impl BridgeState {
    /// Start the relay if it is not already running.
    pub(crate) fn ensure_relay_task(&self, inner: &mut BridgeInner) {
        if inner.relay_task.is_some() {
            return;
        }
        let weak = self.weak_self.clone();
        inner.relay_task = Some(tokio::spawn(async move {
            let Some(state) = weak.upgrade() else {
                return;
            };
            // Best-effort: pushes flow once the gateway comes up regardless.
            if let Err(e) = state.services.gateway.refresh().await {
                debug!(error = %e, "gateway refresh failed before relay start");
            }
            let mut stream = state.services.gateway.subscribe().await;
            drop(state);

            while let Some(push) = stream.next().await {
                // Hold only a weak reference between pushes so an aborted or
                // orphaned relay cannot keep the coordinator alive.
                let Some(state) = weak.upgrade() else {
                    return;
                };
                state.forward_push(push).await;
            }
            debug!("gateway push stream ended");
        }));
        debug!("push relay started");
    }

    /// Fan one gateway push out to eligible nodes. Eligibility and delivery
    /// happen under a single lock acquisition, so a push is never delivered
    /// to a node whose unregistration has completed.
    pub(crate) async fn forward_push(&self, push: GatewayPush) {
        let inner = self.inner.lock().await;
        // Eligible = holds at least one chat subscription AND is connected.
        let eligible: Vec<_> = inner
            .subscriptions
            .keys()
            .filter_map(|node_id| inner.connections.get(node_id))
            .collect();
        if eligible.is_empty() {
            return;
        }

        match push {
            GatewayPush::Snapshot { health } => {
                for handle in &eligible {
                    handle.send_event(server_events::HEALTH, Some(health.clone()));
                }
            },
            GatewayPush::Event { event, payload } => match event.as_str() {
                server_events::HEALTH => {
                    let Some(payload) = payload else { return };
                    for handle in &eligible {
                        handle.send_event(server_events::HEALTH, Some(payload.clone()));
                    }
                },
                server_events::TICK => {
                    for handle in &eligible {
                        handle.send_event(server_events::TICK, None);
                    }
                },
                server_events::CHAT => {
                    let session_key = payload
                        .as_ref()
                        .and_then(|p| p.get("sessionKey"))
                        .and_then(Value::as_str)
                        .map(str::to_string);
                    match session_key {
                        Some(key) => {
                            for handle in &eligible {
                                let subscribed = inner
                                    .subscriptions
                                    .get(&handle.node_id)
                                    .is_some_and(|set| set.contains(&key));
                                if subscribed {
                                    handle.send_event(server_events::CHAT, payload.clone());
                                }
                            }
                        },
                        // No decodable session key: deliver to every
                        // eligible node. Filtering is a refinement here,
                        // not a security boundary.
                        None => {
                            for handle in &eligible {
                                handle.send_event(server_events::CHAT, payload.clone());
                            }
                        },
                    }
                },
                other => trace!(event = other, "ignoring gateway push"),
            },
            GatewayPush::SeqGap => {
                for handle in &eligible {
                    handle.send_event(server_events::SEQ_GAP, None);
                }
            },
        }
    }
}
