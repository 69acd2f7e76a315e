//! Tunables for a `Connection`, analogous to `mujmap`'s `config::Config` but
//! scoped to the batching/dispatch engine rather than a whole sync client.

use std::collections::HashMap;

use serde::Deserialize;

/// Per-connection configuration. All fields have JMAP-sensible defaults so a
/// consumer can use `ConnectionConfig::default()` or deserialize a partial
/// document and let the rest fall back.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ConnectionConfig {
    /// Seconds to wait for a response before the initial upload completes.
    pub timeout_secs: u64,
    /// Seconds to wait once the request body has finished uploading. JMAP
    /// servers may take a while to process a large batch.
    pub timeout_after_upload_secs: u64,
    /// Backoff hint, in seconds, reported to `Auth::connection_failed` for
    /// 429/502/503/504 responses.
    pub rate_limit_backoff_secs: u64,
    /// Bound on how many times the HTTP-404 branch may refresh the session
    /// and re-send before giving up. See spec §9's flagged-as-ambiguous
    /// re-send loop.
    pub max_session_refetches: u32,
    /// Per-record-type `maxChanges` escalation schedule for `<Type>/changes`
    /// calls, e.g. `{"Email": [50, 100, 150], "Thread": [30, 100, 120]}`.
    pub max_changes_schedules: HashMap<String, Vec<u64>>,
}

fn default_max_changes_schedules() -> HashMap<String, Vec<u64>> {
    HashMap::from([
        ("Email".to_string(), vec![50, 100, 150]),
        ("Thread".to_string(), vec![30, 100, 120]),
    ])
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 30,
            timeout_after_upload_secs: 120,
            rate_limit_backoff_secs: 30,
            max_session_refetches: 3,
            max_changes_schedules: default_max_changes_schedules(),
        }
    }
}

impl ConnectionConfig {
    /// The `maxChanges` escalation schedule for a record type, falling back
    /// to a single-step schedule of `[100]` if the type has none configured.
    pub fn max_changes_schedule(&self, type_name: &str) -> &[u64] {
        self.max_changes_schedules
            .get(type_name)
            .map(Vec::as_slice)
            .unwrap_or(&[100])
    }
}
