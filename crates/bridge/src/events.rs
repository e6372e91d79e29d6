//! Node-originated event dispatch.

use tracing::debug;

use tether_protocol::{EventFrame, MAX_AGENT_MESSAGE_CHARS, NodeEvent, trimmed_non_empty};

use crate::{
    services::{AgentMessage, LAST_CHANNEL},
    state::BridgeState,
};

/// Session key a node's traffic falls back to when it names none.
fn node_session_key(node_id: &str, provided: Option<&str>) -> String {
    provided
        .and_then(trimmed_non_empty)
        .map(str::to_string)
        .unwrap_or_else(|| format!("node-{node_id}"))
}

fn trimmed_owned(value: Option<&str>) -> Option<String> {
    value.and_then(trimmed_non_empty).map(str::to_string)
}

impl BridgeState {
    /// Dispatch a fire-and-forget event from an authenticated node. Events
    /// are processed in receipt order; unknown names are ignored so newer
    /// clients never break the connection.
    pub async fn handle_event(&self, node_id: &str, frame: &EventFrame) {
        let Some(event) = NodeEvent::decode(frame) else {
            debug!(node_id, event = %frame.event, "dropping undecodable event payload");
            return;
        };

        match event {
            NodeEvent::ChatSubscribe { session_key } => {
                let Some(key) = trimmed_non_empty(&session_key) else {
                    return;
                };
                let mut inner = self.inner.lock().await;
                inner
                    .subscriptions
                    .entry(node_id.to_string())
                    .or_default()
                    .insert(key.to_string());
            },
            NodeEvent::ChatUnsubscribe { session_key } => {
                let Some(key) = trimmed_non_empty(&session_key) else {
                    return;
                };
                let mut inner = self.inner.lock().await;
                if let Some(set) = inner.subscriptions.get_mut(node_id) {
                    set.remove(key);
                    // A node with zero subscriptions is absent from the
                    // table, never an empty set.
                    if set.is_empty() {
                        inner.subscriptions.remove(node_id);
                    }
                }
            },
            NodeEvent::VoiceTranscript { text, session_key } => {
                let Some(text) = trimmed_non_empty(&text) else {
                    return;
                };
                let message = AgentMessage {
                    text: text.to_string(),
                    thinking: Some("low".into()),
                    session_key: node_session_key(node_id, session_key.as_deref()),
                    deliver: false,
                    to: None,
                    channel: LAST_CHANNEL.to_string(),
                };
                if let Err(e) = self.services.agent.send(message).await {
                    debug!(node_id, error = %e, "voice transcript forward failed");
                }
            },
            NodeEvent::AgentRequest(req) => {
                let Some(text) = trimmed_non_empty(&req.message) else {
                    return;
                };
                if text.chars().count() > MAX_AGENT_MESSAGE_CHARS {
                    return;
                }
                let message = AgentMessage {
                    text: text.to_string(),
                    thinking: trimmed_owned(req.thinking.as_deref()),
                    session_key: node_session_key(node_id, req.session_key.as_deref()),
                    deliver: req.deliver,
                    to: trimmed_owned(req.to.as_deref()),
                    channel: trimmed_owned(req.channel.as_deref())
                        .unwrap_or_else(|| LAST_CHANNEL.to_string()),
                };
                if let Err(e) = self.services.agent.send(message).await {
                    debug!(node_id, error = %e, "agent request forward failed");
                }
            },
            NodeEvent::Unknown => {},
        }
    }
}
