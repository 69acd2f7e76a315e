//! The `Auth` interface consumed by `Connection`. Credential storage and
//! session refresh are a collaborator's concern — this crate only calls
//! through the trait.

use crate::wire::State;

/// Snapshot of the session capabilities `Connection` needs to decide
/// pagination, mirroring `mujmap::jmap::session::CoreCapabilities` but
/// trimmed to the one field `Connection`'s pagination logic actually reads.
#[derive(Debug, Clone, Copy)]
pub struct CoreCapabilities {
    pub max_calls_in_request: u64,
}

pub trait Auth {
    /// Consulted before materializing a batch; vetoing (`false`) means the
    /// Connection should not send right now (e.g. auth is mid-refresh).
    fn connection_will_send(&self) -> bool;

    fn connection_succeeded(&mut self);

    /// `backoff_secs` carries the rate-limit hint from
    /// `failure::Outcome::RateLimit`, if any.
    fn connection_failed(&mut self, backoff_secs: Option<u64>);

    fn did_lose_authentication(&mut self);

    /// Fire-and-forget: schedule a session re-fetch. Does not block the
    /// caller; the updated `capabilities()`/`session_state()` become
    /// visible once it completes.
    fn fetch_session(&mut self);

    fn access_token(&self) -> Option<String>;

    fn api_url(&self) -> String;

    fn capabilities(&self) -> CoreCapabilities;

    fn session_state(&self) -> State;
}
