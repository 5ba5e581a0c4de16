//! Detects whether the server on the other end changed since the last
//! connection and since the last full sync.

/// Stored in place of the since-last-sync baseline to suppress the sync prompt
/// once. The next handshake replaces it with the real installation ID.
pub const SYNC_BASELINE_SUPPRESS_SENTINEL: &str = "notrigger";

/// Result of comparing a handshake's installation ID with both baselines.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IdentityComparison {
    pub is_new_server: bool,
    pub is_new_server_since_sync: bool,
    /// The since-last-connection baseline must be replaced with the current ID.
    pub update_connection_baseline: bool,
    /// The since-last-sync baseline must be replaced with the current ID.
    pub update_sync_baseline: bool,
}

pub fn compare_identity(
    installation_id: Option<&str>,
    last_connection: Option<&str>,
    last_sync: Option<&str>,
) -> IdentityComparison {
    let Some(current) = installation_id else {
        return IdentityComparison::default();
    };

    let is_new_server = last_connection != Some(current);

    let (is_new_server_since_sync, update_sync_baseline) = match last_sync {
        Some(SYNC_BASELINE_SUPPRESS_SENTINEL) => (false, true),
        Some(previous) => (previous != current, false),
        None => (true, false),
    };

    IdentityComparison {
        is_new_server,
        is_new_server_since_sync,
        update_connection_baseline: is_new_server,
        update_sync_baseline,
    }
}
