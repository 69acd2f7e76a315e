//! HTTP-status → outcome classification, the `cannotCalculateChanges`
//! resync, and the adaptive `maxChanges` escalation state machine, per spec
//! §4.4. The status table is spec §4.4's verbatim; the state machine is
//! spec §9's redesign flag (encode adaptive `maxChanges` as a small state
//! machine rather than bare integers).

use http::StatusCode;
use log::warn;

/// What the request pipeline should do in response to a transport failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Log for diagnostics and discard: flush pending callbacks with empty
    /// responses, do not retry.
    Discard,
    /// Notify `Auth::did_lose_authentication`; the request is rescheduled
    /// after re-auth completes.
    ReAuth,
    /// Refresh the session and re-queue the send (bounded by
    /// `max_session_refetches`, see `ConnectionConfig`).
    RefreshSession,
    /// Report a connection failure to `Auth::connection_failed` with a
    /// backoff hint, in seconds.
    RateLimit { backoff_secs: u64 },
    /// Show a user-visible server-failure notice, then discard.
    Fatal,
    /// Hand off to auth's generic retry scheduler.
    Retry,
}

/// Classify an HTTP completion that did not return 2xx, per spec §4.4's
/// table. `will_retry` mirrors the JMAP `serverUnavailable` / transport
/// hint of whether a retry is worth attempting for the "other" branch.
pub fn classify(status: StatusCode, will_retry: bool, rate_limit_backoff_secs: u64) -> Outcome {
    match status.as_u16() {
        400 | 413 => Outcome::Discard,
        401 => Outcome::ReAuth,
        404 => Outcome::RefreshSession,
        429 | 502 | 503 | 504 => Outcome::RateLimit {
            backoff_secs: rate_limit_backoff_secs,
        },
        500 => Outcome::Fatal,
        _ => {
            if will_retry {
                Outcome::Retry
            } else {
                Outcome::Discard
            }
        }
    }
}

/// Classify the absence of an HTTP response at all (timeout/abort), which
/// spec §4.4 folds into the same "other / timeout / abort" branch.
pub fn classify_no_response(will_retry: bool) -> Outcome {
    if will_retry {
        Outcome::Retry
    } else {
        Outcome::Discard
    }
}

/// The three rungs of the `maxChanges` escalation ladder for one
/// `(accountId, typeId)` slot, per spec §4.4's "Adaptive paging for
/// `<Type>/changes`" paragraph and §9's redesign flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Rung {
    Initial,
    Doubled,
    Maxed,
}

#[derive(Debug, Clone)]
pub struct MaxChangesSchedule {
    steps: Vec<u64>,
    rung: Rung,
}

impl MaxChangesSchedule {
    /// `steps` is the escalation ladder, e.g. `[50, 100, 150]` for messages
    /// or `[30, 100, 120]` for threads (see `ConnectionConfig`).
    pub fn new(steps: Vec<u64>) -> Self {
        assert!(!steps.is_empty(), "escalation schedule must not be empty");
        Self {
            steps,
            rung: Rung::Initial,
        }
    }

    /// The `maxChanges` value to send on the next `<Type>/changes` call.
    pub fn current(&self) -> u64 {
        self.steps[self.rung_index()]
    }

    fn rung_index(&self) -> usize {
        match self.rung {
            Rung::Initial => 0,
            Rung::Doubled => 1.min(self.steps.len() - 1),
            Rung::Maxed => self.steps.len() - 1,
        }
    }

    /// Step up one rung after a `hasMoreChanges` response. Returns `true`
    /// if the ladder had room left, `false` if already at the ceiling (the
    /// caller should then force a resync and `reset`).
    pub fn escalate(&mut self) -> bool {
        self.rung = match self.rung {
            Rung::Initial => Rung::Doubled,
            Rung::Doubled => Rung::Maxed,
            Rung::Maxed => return false,
        };
        true
    }

    /// Whether the ladder is already at its ceiling.
    pub fn is_maxed(&self) -> bool {
        self.rung == Rung::Maxed
    }

    /// Reset to the bottom rung, e.g. after a forced resync.
    pub fn reset(&mut self) {
        self.rung = Rung::Initial;
    }
}

/// What `force_resync` tells the caller to do: mark every record of the
/// type obsolete, then adopt the new state with no updated/destroyed
/// lists, per spec §4.4's `cannotCalculateChanges` recovery and §7 point 5.
pub struct ResyncAction {
    pub account_id: String,
    pub type_name: String,
}

pub fn force_resync(account_id: impl Into<String>, type_name: impl Into<String>) -> ResyncAction {
    let account_id = account_id.into();
    let type_name = type_name.into();
    warn!(
        "forcing full resync of {} for account {}: cannot calculate changes",
        type_name, account_id
    );
    ResyncAction {
        account_id,
        type_name,
    }
}
