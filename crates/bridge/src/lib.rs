//! The tether bridge core.
//!
//! A persistent TCP server that pairs and authenticates remote node
//! clients, forwards their allowlisted RPCs to the backend gateway, and
//! fans gateway pushes out to nodes subscribed by chat-session key.

pub mod auth;
pub mod connection;
pub mod events;
pub mod presence;
pub mod relay;
pub mod rpc;
pub mod server;
pub mod services;
pub mod state;

#[cfg(test)]
pub(crate) mod testutil;

pub use {
    auth::{AuthOutcome, PairOutcome},
    services::{AgentMessage, AgentService, BridgeServices, GatewayClient},
    state::{BridgeState, ConnectionHandle},
};
