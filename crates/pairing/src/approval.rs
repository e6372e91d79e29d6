//! Pairing approval policies.
//!
//! First contact from an unknown node must be approved before a token is
//! minted. The gate is asynchronous and answered exactly once per attempt;
//! it may suspend indefinitely (a human deciding), so the coordinator never
//! awaits it while holding its state lock.

use std::path::PathBuf;

use {async_trait::async_trait, tracing::warn};

use tether_protocol::{PairRequest, trimmed_non_empty};

#[async_trait]
pub trait PairingApprover: Send + Sync {
    /// Decide one pairing attempt. `is_repair` is true when a record for the
    /// node already exists and would be overwritten.
    async fn approve(&self, request: &PairRequest, is_repair: bool) -> bool;
}

/// Approves every pairing attempt. For trusted networks and tests.
pub struct AutoApprover;

#[async_trait]
impl PairingApprover for AutoApprover {
    async fn approve(&self, _request: &PairRequest, _is_repair: bool) -> bool {
        true
    }
}

/// Rejects every pairing attempt.
pub struct DenyAllApprover;

#[async_trait]
impl PairingApprover for DenyAllApprover {
    async fn approve(&self, _request: &PairRequest, _is_repair: bool) -> bool {
        false
    }
}

/// Approves node ids listed in a newline-delimited file. Blank lines and
/// `#` comments are skipped. The file is re-read per attempt so edits apply
/// without a restart.
pub struct AllowlistApprover {
    path: PathBuf,
}

impl AllowlistApprover {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl PairingApprover for AllowlistApprover {
    async fn approve(&self, request: &PairRequest, _is_repair: bool) -> bool {
        let Some(node_id) = trimmed_non_empty(&request.node_id) else {
            return false;
        };
        match tokio::fs::read_to_string(&self.path).await {
            Ok(contents) => contents
                .lines()
                .map(str::trim)
                .filter(|line| !line.is_empty() && !line.starts_with('#'))
                .any(|line| line == node_id),
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "allowlist unreadable, rejecting pairing");
                false
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(node_id: &str) -> PairRequest {
        PairRequest {
            node_id: node_id.into(),
            display_name: None,
            platform: None,
            version: None,
            remote_address: None,
        }
    }

    #[tokio::test]
    async fn auto_and_deny_policies() {
        assert!(AutoApprover.approve(&request("n1"), false).await);
        assert!(!DenyAllApprover.approve(&request("n1"), true).await);
    }

    #[tokio::test]
    async fn allowlist_matches_listed_ids_only() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("allowed.txt");
        std::fs::write(&path, "# lab devices\nn1\n  n2  \n").unwrap();

        let approver = AllowlistApprover::new(&path);
        assert!(approver.approve(&request("n1"), false).await);
        assert!(approver.approve(&request(" n2 "), false).await);
        assert!(!approver.approve(&request("n3"), false).await);
        assert!(!approver.approve(&request("   "), false).await);
    }

    #[tokio::test]
    async fn allowlist_missing_file_rejects() {
        let approver = AllowlistApprover::new("/nonexistent/allowed.txt");
        assert!(!approver.approve(&request("n1"), false).await);
    }
}
