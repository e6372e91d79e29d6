//! Durable pairing state for tether nodes: the paired-node store and the
//! approval policies that gate first contact.

pub mod approval;
pub mod store;

pub use {
    approval::{AllowlistApprover, AutoApprover, DenyAllApprover, PairingApprover},
    store::{PairedNode, PairedNodeStore, StoreError},
};

/// Mint a new opaque bearer token: uuid v4, dashless.
pub fn mint_token() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

/// Current unix time in milliseconds, the store's timestamp unit.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
