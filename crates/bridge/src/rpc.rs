//! RPC forwarding: node → gateway, behind a fixed allowlist.

use std::time::Duration;

use {serde_json::Value, tracing::debug};

use tether_protocol::{RPC_TIMEOUT_MS, RpcMethod, RpcRequest, RpcResponse, error_codes};

use crate::state::BridgeState;

impl BridgeState {
    /// Answer one RPC request. Exactly one response per request, correlated
    /// by id; concurrent requests on a connection may complete out of order.
    pub async fn handle_request(&self, node_id: &str, req: &RpcRequest) -> RpcResponse {
        let Some(method) = RpcMethod::parse(&req.method) else {
            return RpcResponse::failure(&req.id, error_codes::FORBIDDEN, "method not allowed");
        };

        let params = match &req.params {
            None | Some(Value::Null) => None,
            Some(value @ Value::Object(_)) => Some(value.clone()),
            Some(_) => {
                return RpcResponse::failure(
                    &req.id,
                    error_codes::INVALID_REQUEST,
                    "params must be a JSON object",
                );
            },
        };

        let forward = self.services.gateway.request(method.as_str(), params);
        match tokio::time::timeout(Duration::from_millis(RPC_TIMEOUT_MS), forward).await {
            // Successful payloads pass through unmodified.
            Ok(Ok(payload)) => RpcResponse::success(&req.id, payload),
            Ok(Err(e)) => {
                debug!(node_id, method = method.as_str(), error = %e, "gateway request failed");
                RpcResponse::failure(&req.id, error_codes::UNAVAILABLE, e.to_string())
            },
            Err(_) => RpcResponse::failure(
                &req.id,
                error_codes::UNAVAILABLE,
                "gateway request timed out",
            ),
        }
    }
}
