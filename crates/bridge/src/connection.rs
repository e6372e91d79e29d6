//! Per-connection protocol engine.
//!
//! `AwaitingHello → (Authorizing | Pairing) → Authenticated → Closed`; no
//! transition goes backwards, and `Closed` triggers exactly-once
//! unregistration. Frames are newline-delimited JSON.

use std::{net::SocketAddr, sync::Arc};

use {
    tokio::{
        io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
        net::{TcpStream, tcp::OwnedReadHalf},
        sync::mpsc,
    },
    tracing::{debug, warn},
};

use tether_protocol::{ClientFrame, ErrorShape, ServerFrame, error_codes};

use crate::{
    auth::{AuthOutcome, PairOutcome},
    state::{BridgeState, ConnectionHandle},
};

/// Drive one node connection to completion.
pub async fn handle_connection(stream: TcpStream, addr: SocketAddr, state: Arc<BridgeState>) {
    let conn_id = uuid::Uuid::new_v4().simple().to_string();
    debug!(conn_id, peer = %addr, "connection accepted");

    let (read_half, mut write_half) = stream.into_split();
    let (tx, mut rx) = mpsc::unbounded_channel::<ServerFrame>();

    // Writer task: the only place that touches the socket's write half.
    // Coordinator pushes just queue frames, which makes `send_event` safe
    // concurrently with the read loop below.
    let writer = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            let Ok(mut line) = serde_json::to_string(&frame) else {
                continue;
            };
            line.push('\n');
            if write_half.write_all(line.as_bytes()).await.is_err() {
                break;
            }
        }
        let _ = write_half.shutdown().await;
    });

    let mut reader = BufReader::new(read_half);

    if let Some(node_id) = handshake(&mut reader, &tx, &state, &conn_id, addr).await {
        serve_authenticated(&mut reader, &tx, &state, &node_id).await;
        // Exactly once: the only path out of Authenticated is here.
        state.unregister_connection(&node_id, &conn_id).await;
        debug!(conn_id, node_id, "connection closed");
    }

    // Let the writer drain anything still queued, then close the socket.
    drop(tx);
    let _ = writer.await;
}

async fn read_frame(reader: &mut BufReader<OwnedReadHalf>, line: &mut String) -> Option<usize> {
    line.clear();
    match reader.read_line(line).await {
        Ok(0) => None,
        Ok(n) => Some(n),
        Err(e) => {
            debug!(error = %e, "connection read failed");
            None
        },
    }
}

/// Run the handshake until the connection is authenticated or dead.
/// Returns the registered node id on success.
async fn handshake(
    reader: &mut BufReader<OwnedReadHalf>,
    tx: &mpsc::UnboundedSender<ServerFrame>,
    state: &Arc<BridgeState>,
    conn_id: &str,
    addr: SocketAddr,
) -> Option<String> {
    let mut line = String::new();
    loop {
        read_frame(reader, &mut line).await?;
        let raw = line.trim();
        if raw.is_empty() {
            continue;
        }

        let frame: ClientFrame = match serde_json::from_str(raw) {
            Ok(frame) => frame,
            Err(e) => {
                // During the handshake a decode failure is fatal.
                debug!(conn_id, error = %e, "undecodable handshake frame");
                let _ = tx.send(ServerFrame::AuthError(ErrorShape::new(
                    error_codes::INVALID_REQUEST,
                    "undecodable frame",
                )));
                return None;
            },
        };

        match frame {
            ClientFrame::Hello(hello) => match state.authorize(&hello).await {
                AuthOutcome::Ok => {
                    let node_id = hello.node_id.trim().to_string();
                    let _ = tx.send(ServerFrame::AuthOk);
                    register(state, tx, &node_id, conn_id, addr).await;
                    return Some(node_id);
                },
                AuthOutcome::NotPaired => {
                    // Stay in AwaitingHello; a pair request is expected on
                    // this same connection.
                    let _ = tx.send(ServerFrame::NotPaired);
                },
                AuthOutcome::Unauthorized => {
                    let _ = tx.send(ServerFrame::AuthError(ErrorShape::new(
                        error_codes::UNAUTHORIZED,
                        "unknown or expired token",
                    )));
                    return None;
                },
                AuthOutcome::Error { code, message } => {
                    let _ = tx.send(ServerFrame::AuthError(ErrorShape::new(code, message)));
                    return None;
                },
            },
            ClientFrame::Pair(mut request) => {
                // The listener knows the peer address better than the
                // client does.
                if request.remote_address.is_none() {
                    request.remote_address = Some(addr.ip().to_string());
                }
                match state.pair(&request).await {
                    PairOutcome::Ok { token } => {
                        let node_id = request.node_id.trim().to_string();
                        let _ = tx.send(ServerFrame::PairOk { token });
                        register(state, tx, &node_id, conn_id, addr).await;
                        return Some(node_id);
                    },
                    PairOutcome::Rejected => {
                        let _ = tx.send(ServerFrame::AuthError(ErrorShape::new(
                            error_codes::PAIRING_REJECTED,
                            "pairing rejected",
                        )));
                        return None;
                    },
                    PairOutcome::Error { code, message } => {
                        let _ = tx.send(ServerFrame::AuthError(ErrorShape::new(code, message)));
                        return None;
                    },
                }
            },
            ClientFrame::Event(_) | ClientFrame::Request(_) => {
                let _ = tx.send(ServerFrame::AuthError(ErrorShape::new(
                    error_codes::INVALID_REQUEST,
                    "expected hello or pair",
                )));
                return None;
            },
        }
    }
}

async fn register(
    state: &Arc<BridgeState>,
    tx: &mpsc::UnboundedSender<ServerFrame>,
    node_id: &str,
    conn_id: &str,
    addr: SocketAddr,
) {
    let handle =
        ConnectionHandle::new(node_id, conn_id, Some(addr.ip().to_string()), tx.clone());
    state.register_connection(handle).await;
}

/// The authenticated frame loop: events inline (receipt order), requests
/// spawned (out-of-order completion, correlated by id).
async fn serve_authenticated(
    reader: &mut BufReader<OwnedReadHalf>,
    tx: &mpsc::UnboundedSender<ServerFrame>,
    state: &Arc<BridgeState>,
    node_id: &str,
) {
    let mut line = String::new();
    loop {
        if read_frame(reader, &mut line).await.is_none() {
            return;
        }
        let raw = line.trim();
        if raw.is_empty() {
            continue;
        }

        let frame: ClientFrame = match serde_json::from_str(raw) {
            Ok(frame) => frame,
            Err(e) => {
                // Malformed frames are dropped; they do not close the
                // connection.
                warn!(node_id, error = %e, "dropping malformed frame");
                continue;
            },
        };

        match frame {
            ClientFrame::Event(event) => state.handle_event(node_id, &event).await,
            ClientFrame::Request(request) => {
                let state = Arc::clone(state);
                let tx = tx.clone();
                let node_id = node_id.to_string();
                tokio::spawn(async move {
                    let response = state.handle_request(&node_id, &request).await;
                    let _ = tx.send(ServerFrame::Response(response));
                });
            },
            ClientFrame::Hello(_) | ClientFrame::Pair(_) => {
                warn!(node_id, "dropping handshake frame after authentication");
            },
        }
    }
}
