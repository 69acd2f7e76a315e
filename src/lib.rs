//! A transport-agnostic JMAP request batching and response dispatch engine.
//!
//! A [`Connection`] accumulates fetch/refresh/commit work against a
//! [`Store`], batches it into as few HTTP round trips as `maxCallsInRequest`
//! allows, and routes each response back into store mutations and
//! caller-supplied callbacks in a single-threaded, cooperative fashion — no
//! `tokio`, no thread spawning. [`AggregateSource`] composes several
//! connections (mail, contacts, calendars, ...) behind one dirty-bit.

/// Request batching, response dispatch, and retry/backoff state machine.
pub mod connection;
/// Translates HTTP/JMAP-level failures into retry/discard/reauth outcomes.
pub mod failure;
/// Copy-on-write per-type handler composition.
pub mod handler;
/// Pending fetch/refresh/commit accumulators drained by a `Connection`.
pub mod queue;
/// RFC 6901 JSON-Pointer patch codec used to diff records for `set` calls.
pub mod patch;
/// RRULE-like recurrence expansion and occurrence identity.
pub mod recurrence;
/// Linear async step-chain without an executor.
pub mod sequence;
/// `<Type>/set` and `<Type>/copy` argument construction from a `ChangeSet`.
pub mod set_request;
/// The batched method-call/response envelope types.
pub mod wire;

/// Tunables a `Connection` consults: timeouts, retry bounds, per-type
/// `maxChanges` escalation schedules.
pub mod config;

/// The out-of-scope collaborator interfaces a `Connection` is generic over.
pub mod auth;
/// The out-of-scope collaborator interface a `Connection` is generic over.
pub mod store;
/// The out-of-scope collaborator interface a `Connection` is generic over.
pub mod transport;

/// Fans a sync engine out across several data groups, one `Connection` each.
pub mod aggregate;
/// A minimal synchronous scheduler sufficient to drive `Connection::flush`
/// and observe callback-ordering behavior without a real event loop.
pub mod run_loop;

pub use crate::aggregate::AggregateSource;
pub use crate::auth::Auth;
pub use crate::connection::Connection;
pub use crate::run_loop::{Phase, RunLoop, SynchronousRunLoop};
pub use crate::store::Store;
pub use crate::transport::Transport;
