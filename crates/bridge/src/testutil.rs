//! Shared test fixtures: channel-backed mock collaborators and a bridge
//! builder wired to a temp-dir store.

use std::{
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use {
    anyhow::{Result, bail},
    async_trait::async_trait,
    futures::stream::BoxStream,
    serde_json::Value,
    tokio::sync::{Mutex, mpsc},
    tokio_stream::wrappers::UnboundedReceiverStream,
};

use {
    tether_pairing::{PairedNodeStore, PairingApprover},
    tether_protocol::{EventFrame, GatewayPush, Hello, PairRequest, ServerFrame},
};

use crate::{
    auth::PairOutcome,
    services::{AgentMessage, AgentService, BridgeServices, GatewayClient},
    state::{BridgeState, ConnectionHandle},
};

/// Poll until `cond` holds, panicking after one second.
pub(crate) async fn wait_until(cond: impl Fn() -> bool) {
    for _ in 0..200 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached within 1s");
}

/// Receive one server event frame, panicking on anything else or a timeout.
pub(crate) async fn recv_event(
    rx: &mut mpsc::UnboundedReceiver<ServerFrame>,
) -> (String, Option<Value>) {
    let frame = tokio::time::timeout(Duration::from_secs(1), rx.recv())
        .await
        .ok()
        .flatten();
    match frame {
        Some(ServerFrame::Event(e)) => (e.event, e.payload),
        other => panic!("expected event frame, got {other:?}"),
    }
}

pub(crate) fn hello(node_id: &str, token: Option<&str>) -> Hello {
    Hello {
        node_id: node_id.into(),
        display_name: Some(format!("Node {}", node_id.trim())),
        token: token.map(str::to_string),
        platform: Some("ios".into()),
        version: Some("1.0".into()),
    }
}

pub(crate) fn pair_request(node_id: &str) -> PairRequest {
    PairRequest {
        node_id: node_id.into(),
        display_name: Some(format!("Node {}", node_id.trim())),
        platform: Some("ios".into()),
        version: Some("1.0".into()),
        remote_address: Some("192.0.2.7".into()),
    }
}

pub(crate) fn event(name: &str, payload: Value) -> EventFrame {
    EventFrame {
        event: name.into(),
        payload: Some(payload),
    }
}

// ── Mock gateway ─────────────────────────────────────────────────────────────

pub(crate) struct MockGateway {
    requests: Mutex<Vec<(String, Option<Value>)>>,
    responses: Mutex<Vec<Value>>,
    push_tx: Mutex<Option<mpsc::UnboundedSender<GatewayPush>>>,
    subscribes: AtomicUsize,
}

impl MockGateway {
    pub(crate) fn new() -> Self {
        Self {
            requests: Mutex::new(Vec::new()),
            responses: Mutex::new(Vec::new()),
            push_tx: Mutex::new(None),
            subscribes: AtomicUsize::new(0),
        }
    }

    /// Queue the payload returned by the next forwarded request.
    pub(crate) async fn respond_with(&self, payload: Value) {
        self.responses.lock().await.push(payload);
    }

    pub(crate) async fn requests(&self) -> Vec<(String, Option<Value>)> {
        self.requests.lock().await.clone()
    }

    pub(crate) fn subscribe_count(&self) -> usize {
        self.subscribes.load(Ordering::SeqCst)
    }

    /// Emit a push into the active subscription, waiting for the relay to
    /// subscribe first. A send into a stale subscription (relay restarted)
    /// is retried against the replacement.
    pub(crate) async fn push(&self, push: GatewayPush) {
        for _ in 0..200 {
            if let Some(tx) = self.push_tx.lock().await.as_ref()
                && tx.send(push.clone()).is_ok()
            {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("no active push subscription within 1s");
    }
}

#[async_trait]
impl GatewayClient for MockGateway {
    async fn refresh(&self) -> Result<()> {
        Ok(())
    }

    async fn request(&self, method: &str, params: Option<Value>) -> Result<Value> {
        self.requests
            .lock()
            .await
            .push((method.to_string(), params));
        match self.responses.lock().await.pop() {
            Some(payload) => Ok(payload),
            None => bail!("gateway offline"),
        }
    }

    async fn subscribe(&self) -> BoxStream<'static, GatewayPush> {
        let (tx, rx) = mpsc::unbounded_channel();
        *self.push_tx.lock().await = Some(tx);
        self.subscribes.fetch_add(1, Ordering::SeqCst);
        Box::pin(UnboundedReceiverStream::new(rx))
    }
}

// ── Recording agent ──────────────────────────────────────────────────────────

pub(crate) struct RecordingAgent {
    fail: bool,
    sent: Mutex<Vec<AgentMessage>>,
    control: Mutex<Vec<(String, Value)>>,
}

impl RecordingAgent {
    pub(crate) fn new(fail: bool) -> Self {
        Self {
            fail,
            sent: Mutex::new(Vec::new()),
            control: Mutex::new(Vec::new()),
        }
    }

    pub(crate) async fn sent(&self) -> Vec<AgentMessage> {
        self.sent.lock().await.clone()
    }

    pub(crate) async fn control_calls(&self) -> Vec<(String, Value)> {
        self.control.lock().await.clone()
    }
}

#[async_trait]
impl AgentService for RecordingAgent {
    async fn send(&self, message: AgentMessage) -> Result<()> {
        if self.fail {
            bail!("agent offline");
        }
        self.sent.lock().await.push(message);
        Ok(())
    }

    async fn control_request(&self, method: &str, params: Value) -> Result<()> {
        if self.fail {
            bail!("agent offline");
        }
        self.control
            .lock()
            .await
            .push((method.to_string(), params));
        Ok(())
    }
}

// ── Recording approver ───────────────────────────────────────────────────────

pub(crate) struct RecordingApprover {
    decision: bool,
    seen: Mutex<Vec<(String, bool)>>,
}

impl RecordingApprover {
    pub(crate) fn new(decision: bool) -> Self {
        Self {
            decision,
            seen: Mutex::new(Vec::new()),
        }
    }

    pub(crate) async fn seen(&self) -> Vec<(String, bool)> {
        self.seen.lock().await.clone()
    }
}

#[async_trait]
impl PairingApprover for RecordingApprover {
    async fn approve(&self, request: &PairRequest, is_repair: bool) -> bool {
        self.seen
            .lock()
            .await
            .push((request.node_id.trim().to_string(), is_repair));
        self.decision
    }
}

// ── Bridge fixture ───────────────────────────────────────────────────────────

pub(crate) struct TestBridge {
    pub(crate) state: Arc<BridgeState>,
    pub(crate) gateway: Arc<MockGateway>,
    pub(crate) agent: Arc<RecordingAgent>,
    pub(crate) approver: Arc<RecordingApprover>,
    _store_dir: Option<tempfile::TempDir>,
}

pub(crate) struct TestBridgeBuilder {
    approve: bool,
    with_store: bool,
    failing_agent: bool,
}

impl TestBridge {
    pub(crate) fn builder() -> TestBridgeBuilder {
        TestBridgeBuilder {
            approve: false,
            with_store: true,
            failing_agent: false,
        }
    }

    /// Pair a node through the full ladder and return its token.
    pub(crate) async fn pair_node(&self, node_id: &str) -> String {
        match self.state.pair(&pair_request(node_id)).await {
            PairOutcome::Ok { token } => token,
            other => panic!("pairing failed: {other:?}"),
        }
    }

    /// Register a fake connection and hand back its frame receiver.
    pub(crate) async fn register_node(
        &self,
        node_id: &str,
    ) -> (mpsc::UnboundedReceiver<ServerFrame>, String) {
        let conn_id = uuid::Uuid::new_v4().simple().to_string();
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = ConnectionHandle::new(node_id, conn_id.clone(), Some("192.0.2.7".into()), tx);
        self.state.register_connection(handle).await;
        (rx, conn_id)
    }

    pub(crate) async fn subscribe(&self, node_id: &str, session_key: &str) {
        self.state
            .handle_event(
                node_id,
                &event("chat.subscribe", serde_json::json!({"sessionKey": session_key})),
            )
            .await;
    }
}

impl TestBridgeBuilder {
    pub(crate) fn approve(mut self, decision: bool) -> Self {
        self.approve = decision;
        self
    }

    pub(crate) fn without_store(mut self) -> Self {
        self.with_store = false;
        self
    }

    pub(crate) fn failing_agent(mut self) -> Self {
        self.failing_agent = true;
        self
    }

    pub(crate) fn build(self) -> TestBridge {
        let gateway = Arc::new(MockGateway::new());
        let agent = Arc::new(RecordingAgent::new(self.failing_agent));
        let approver = Arc::new(RecordingApprover::new(self.approve));

        let (store, dir) = if self.with_store {
            let dir = tempfile::tempdir().unwrap_or_else(|e| panic!("tempdir: {e}"));
            let store = Arc::new(PairedNodeStore::new(dir.path().join("paired-nodes.json")));
            (Some(store), Some(dir))
        } else {
            (None, None)
        };

        let services = BridgeServices {
            gateway: Arc::clone(&gateway) as Arc<dyn GatewayClient>,
            agent: Arc::clone(&agent) as Arc<dyn AgentService>,
            approver: Arc::clone(&approver) as Arc<dyn PairingApprover>,
        };

        TestBridge {
            state: BridgeState::new(store, services),
            gateway,
            agent,
            approver,
            _store_dir: dir,
        }
    }
}
