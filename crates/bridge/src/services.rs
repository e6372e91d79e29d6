//! Seams to the external collaborators: the backend gateway and the agent
//! subsystem. The bridge only ever talks to these traits; concrete clients
//! are wired in by the embedding binary.

use std::sync::Arc;

use {
    anyhow::{Result, bail},
    async_trait::async_trait,
    futures::stream::BoxStream,
    serde_json::Value,
};

use {
    tether_pairing::{DenyAllApprover, PairingApprover},
    tether_protocol::GatewayPush,
};

/// Sentinel channel meaning "deliver on the last used channel".
pub const LAST_CHANNEL: &str = "last";

// ── Gateway ──────────────────────────────────────────────────────────────────

/// Backend gateway RPC + push client.
#[async_trait]
pub trait GatewayClient: Send + Sync {
    /// Best-effort reconnect, attempted once before the push stream is
    /// drained.
    async fn refresh(&self) -> Result<()>;

    /// Forward an RPC and return its raw response payload. The bridge
    /// enforces the protocol timeout around this call; implementations do
    /// not need their own.
    async fn request(&self, method: &str, params: Option<Value>) -> Result<Value>;

    /// The gateway's push stream: lazy, unbounded, effectively infinite.
    /// A single active subscriber is expected.
    async fn subscribe(&self) -> BoxStream<'static, GatewayPush>;
}

// ── Agent ────────────────────────────────────────────────────────────────────

/// Agent-bound message assembled from a node event.
#[derive(Debug, Clone)]
pub struct AgentMessage {
    pub text: String,
    pub thinking: Option<String>,
    pub session_key: String,
    pub deliver: bool,
    pub to: Option<String>,
    pub channel: String,
}

#[async_trait]
pub trait AgentService: Send + Sync {
    /// Fire-and-forget from the bridge's perspective: the result is never
    /// surfaced to the remote node.
    async fn send(&self, message: AgentMessage) -> Result<()>;

    /// Control-plane call (presence beacons). Callers swallow errors.
    async fn control_request(&self, method: &str, params: Value) -> Result<()>;
}

// ── Aggregate ────────────────────────────────────────────────────────────────

pub struct BridgeServices {
    pub gateway: Arc<dyn GatewayClient>,
    pub agent: Arc<dyn AgentService>,
    pub approver: Arc<dyn PairingApprover>,
}

impl BridgeServices {
    /// Stand-in wiring: gateway requests fail, the push stream never
    /// yields, agent calls are accepted and dropped, pairing is denied.
    pub fn noop() -> Self {
        Self {
            gateway: Arc::new(NoopGateway),
            agent: Arc::new(NoopAgent),
            approver: Arc::new(DenyAllApprover),
        }
    }
}

pub struct NoopGateway;

#[async_trait]
impl GatewayClient for NoopGateway {
    async fn refresh(&self) -> Result<()> {
        Ok(())
    }

    async fn request(&self, method: &str, _params: Option<Value>) -> Result<Value> {
        bail!("gateway not configured (method {method})")
    }

    async fn subscribe(&self) -> BoxStream<'static, GatewayPush> {
        Box::pin(futures::stream::pending())
    }
}

pub struct NoopAgent;

#[async_trait]
impl AgentService for NoopAgent {
    async fn send(&self, _message: AgentMessage) -> Result<()> {
        Ok(())
    }

    async fn control_request(&self, _method: &str, _params: Value) -> Result<()> {
        Ok(())
    }
}
