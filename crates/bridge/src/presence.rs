//! Presence beacons: advisory "who is connected" signals forwarded to the
//! agent subsystem. Never fatal, never surfaced to the node.

use std::time::Duration;

use {
    serde_json::{Value, json},
    tracing::debug,
};

use tether_protocol::{PRESENCE_INTERVAL_SECS, trimmed_non_empty};

use crate::state::{BridgeInner, BridgeState};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresenceReason {
    Connect,
    Disconnect,
    Periodic,
}

impl PresenceReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Connect => "connect",
            Self::Disconnect => "disconnect",
            Self::Periodic => "periodic",
        }
    }
}

impl BridgeState {
    /// Send one presence beacon. Best-effort: every failure is swallowed.
    pub(crate) async fn beacon_presence(&self, node_id: &str, reason: PresenceReason) {
        let paired = match &self.store {
            Some(store) => store.find(node_id).await,
            None => None,
        };
        let remote_addr = {
            let inner = self.inner.lock().await;
            inner
                .connections
                .get(node_id)
                .and_then(|h| h.remote_addr.clone())
        };

        let host = paired
            .as_ref()
            .and_then(|p| p.display_name.as_deref())
            .and_then(trimmed_non_empty)
            .unwrap_or(node_id)
            .to_string();
        let platform = paired
            .as_ref()
            .and_then(|p| p.platform.as_deref())
            .and_then(trimmed_non_empty)
            .map(str::to_string);
        let version = paired
            .as_ref()
            .and_then(|p| p.version.as_deref())
            .and_then(trimmed_non_empty)
            .map(str::to_string);

        let mut tags = vec!["node".to_string()];
        if let Some(platform) = &platform {
            tags.push(platform.clone());
        }

        let mut summary = format!("Node: {host}");
        if let Some(addr) = &remote_addr {
            summary.push_str(&format!(" ({addr})"));
        }
        if let Some(platform) = &platform {
            summary.push_str(&format!(" · platform {platform}"));
        }
        if let Some(version) = &version {
            summary.push_str(&format!(" · app {version}"));
        }
        summary.push_str(" · mode node · reason ");
        summary.push_str(reason.as_str());

        let mut params = json!({
            "text": summary,
            "instanceId": node_id,
            "host": host,
            "mode": "node",
            "reason": reason.as_str(),
            "tags": tags,
        });
        if let Some(addr) = remote_addr {
            params["ip"] = Value::String(addr);
        }
        if let Some(version) = version {
            params["version"] = Value::String(version);
        }

        if let Err(e) = self
            .services
            .agent
            .control_request("system-event", params)
            .await
        {
            debug!(node_id, error = %e, "presence beacon failed");
        }
    }

    /// (Re)start the periodic presence timer for a node. The timer never
    /// outlives its connection: it is aborted unconditionally on unregister
    /// and replaced when the node reconnects.
    pub(crate) fn start_presence_timer(&self, inner: &mut BridgeInner, node_id: &str) {
        if let Some(old) = inner.presence_tasks.remove(node_id) {
            old.abort();
        }
        let weak = self.weak_self.clone();
        let node_id_owned = node_id.to_string();
        let task = tokio::spawn(async move {
            loop {
                tokio::time::sleep(Duration::from_secs(PRESENCE_INTERVAL_SECS)).await;
                let Some(state) = weak.upgrade() else {
                    return;
                };
                state
                    .beacon_presence(&node_id_owned, PresenceReason::Periodic)
                    .await;
            }
        });
        inner.presence_tasks.insert(node_id.to_string(), task);
    }
}
