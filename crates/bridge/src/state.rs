//! Bridge coordinator state: connection registry, subscriptions, and the
//! authorize/pair decision ladders.

use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, Weak},
};

use {
    serde_json::Value,
    tokio::{
        sync::{Mutex, mpsc},
        task::JoinHandle,
    },
    tracing::{debug, warn},
};

use {
    tether_pairing::{PairedNode, PairedNodeStore, mint_token, now_ms},
    tether_protocol::{EventFrame, Hello, PairRequest, ServerFrame, trimmed_non_empty},
};

use crate::{
    auth::{AuthOutcome, PairOutcome, safe_equal},
    presence::PresenceReason,
    services::BridgeServices,
};

// ── Connection handle ────────────────────────────────────────────────────────

/// What the coordinator keeps per registered connection.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    pub node_id: String,
    /// Distinguishes physical sockets when a node reconnects: a stale
    /// handler's unregistration must not evict its replacement.
    pub conn_id: String,
    pub remote_addr: Option<String>,
    sender: mpsc::UnboundedSender<ServerFrame>,
}

impl ConnectionHandle {
    pub fn new(
        node_id: impl Into<String>,
        conn_id: impl Into<String>,
        remote_addr: Option<String>,
        sender: mpsc::UnboundedSender<ServerFrame>,
    ) -> Self {
        Self {
            node_id: node_id.into(),
            conn_id: conn_id.into(),
            remote_addr,
            sender,
        }
    }

    /// Queue a frame for this connection's writer. Returns false when the
    /// writer is gone (delivery is best-effort, drop-on-disconnect).
    pub fn send(&self, frame: ServerFrame) -> bool {
        self.sender.send(frame).is_ok()
    }

    /// Push an asynchronous server event to this connection. Safe to call
    /// concurrently with the connection's own read loop.
    pub fn send_event(&self, event: &str, payload: Option<Value>) -> bool {
        self.send(ServerFrame::Event(EventFrame {
            event: event.to_string(),
            payload,
        }))
    }
}

// ── Coordinator ──────────────────────────────────────────────────────────────

#[derive(Default)]
pub(crate) struct BridgeInner {
    /// One live handler per nodeId; a newer connection replaces the older.
    pub(crate) connections: HashMap<String, ConnectionHandle>,
    /// nodeId → subscribed session keys. No empty sets persist.
    pub(crate) subscriptions: HashMap<String, HashSet<String>>,
    /// Per-node periodic presence timers.
    pub(crate) presence_tasks: HashMap<String, JoinHandle<()>>,
    /// The shared gateway-push relay; alive iff at least one connection is
    /// registered.
    pub(crate) relay_task: Option<JoinHandle<()>>,
}

/// Single source of truth for registry, subscriptions, authorization, and
/// push fan-out. All state mutation happens under one lock; external
/// collaborators (store, gateway, approval gate) are awaited with the lock
/// released and state re-validated afterwards.
pub struct BridgeState {
    pub(crate) store: Option<Arc<PairedNodeStore>>,
    pub(crate) services: BridgeServices,
    pub(crate) weak_self: Weak<Self>,
    pub(crate) inner: Mutex<BridgeInner>,
}

impl BridgeState {
    pub fn new(store: Option<Arc<PairedNodeStore>>, services: BridgeServices) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            store,
            services,
            weak_self: weak.clone(),
            inner: Mutex::new(BridgeInner::default()),
        })
    }

    pub async fn connected_node_ids(&self) -> Vec<String> {
        let inner = self.inner.lock().await;
        let mut ids: Vec<String> = inner.connections.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub async fn connection_count(&self) -> usize {
        self.inner.lock().await.connections.len()
    }

    // ── Authorization ────────────────────────────────────────────────────────

    /// Authorize a hello frame against the paired-node store.
    pub async fn authorize(&self, hello: &Hello) -> AuthOutcome {
        let Some(node_id) = trimmed_non_empty(&hello.node_id) else {
            return AuthOutcome::invalid("nodeId required");
        };
        let Some(store) = &self.store else {
            return AuthOutcome::unavailable("store unavailable");
        };
        let Some(paired) = store.find(node_id).await else {
            return AuthOutcome::NotPaired;
        };
        let token_matches = hello
            .token
            .as_deref()
            .is_some_and(|token| safe_equal(token, &paired.token));
        if !token_matches {
            return AuthOutcome::Unauthorized;
        }
        // Best-effort; a persistence hiccup does not fail the auth.
        if let Err(e) = store.touch_seen(node_id).await {
            debug!(node_id, error = %e, "touch_seen failed");
        }
        AuthOutcome::Ok
    }

    /// Run a pairing attempt through the approval gate and mint a token.
    pub async fn pair(&self, request: &PairRequest) -> PairOutcome {
        let Some(node_id) = trimmed_non_empty(&request.node_id) else {
            return PairOutcome::invalid("nodeId required");
        };
        let Some(store) = &self.store else {
            return PairOutcome::unavailable("store unavailable");
        };
        let is_repair = store.find(node_id).await.is_some();

        // May suspend indefinitely on a human decision. No coordinator lock
        // is held here, so other connections keep flowing.
        if !self.services.approver.approve(request, is_repair).await {
            return PairOutcome::Rejected;
        }

        let token = mint_token();
        let now = now_ms();
        let node = PairedNode {
            node_id: node_id.to_string(),
            display_name: request.display_name.clone(),
            platform: request.platform.clone(),
            version: request.version.clone(),
            token: token.clone(),
            created_at_ms: now,
            last_seen_at_ms: now,
        };
        match store.upsert(node).await {
            Ok(()) => PairOutcome::Ok { token },
            Err(e) => {
                warn!(node_id, error = %e, "failed to persist pairing");
                PairOutcome::unavailable("failed to persist pairing")
            },
        }
    }

    // ── Registry ─────────────────────────────────────────────────────────────

    /// Register an authenticated connection: emit the connect beacon, start
    /// the node's presence timer, and make sure the shared push relay runs.
    pub async fn register_connection(&self, handle: ConnectionHandle) {
        let node_id = handle.node_id.clone();
        {
            let mut inner = self.inner.lock().await;
            if let Some(old) = inner.connections.insert(node_id.clone(), handle) {
                debug!(node_id, old_conn = %old.conn_id, "connection replaced");
            }
            self.start_presence_timer(&mut inner, &node_id);
            self.ensure_relay_task(&mut inner);
        }
        self.beacon_presence(&node_id, PresenceReason::Connect).await;
    }

    /// Tear down a connection's registration. No-op when a newer connection
    /// for the same nodeId has already replaced this one.
    pub async fn unregister_connection(&self, node_id: &str, conn_id: &str) {
        {
            let inner = self.inner.lock().await;
            let registered = inner
                .connections
                .get(node_id)
                .is_some_and(|h| h.conn_id == conn_id);
            if !registered {
                return;
            }
        }

        self.beacon_presence(node_id, PresenceReason::Disconnect)
            .await;

        let mut inner = self.inner.lock().await;
        // Re-validate after the beacon await: a replacement may have
        // registered meanwhile and must not be evicted.
        let registered = inner
            .connections
            .get(node_id)
            .is_some_and(|h| h.conn_id == conn_id);
        if !registered {
            return;
        }
        inner.connections.remove(node_id);
        inner.subscriptions.remove(node_id);
        if let Some(task) = inner.presence_tasks.remove(node_id) {
            task.abort();
        }
        // Last one out stops the shared relay.
        if inner.connections.is_empty()
            && let Some(task) = inner.relay_task.take()
        {
            task.abort();
            debug!("push relay stopped, no connections remain");
        }
    }
}
