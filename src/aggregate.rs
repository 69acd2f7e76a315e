//! Fans a sync engine out across several data groups — mail, contacts,
//! calendars, whatever a host application keeps separate JMAP account
//! state for — behind one combined dirty bit. Generalizes the "one
//! `Remote` owning one `HttpWrapper`" shape to "several, one per concern",
//! since nothing about request batching or response dispatch is specific
//! to a single data type.

use std::collections::HashMap;

use crate::auth::Auth;
use crate::connection::{self, Connection};
use crate::store::Store;
use crate::transport::Transport;

/// Owns one named `Connection` per data group and exposes the union of
/// their pending-work state. Every group shares the same `Store`, `Auth`,
/// and `Transport` implementation; a host with genuinely different
/// collaborators per group composes several `AggregateSource`s instead.
pub struct AggregateSource<S: Store, A: Auth, T: Transport> {
    connections: HashMap<String, Connection<S, A, T>>,
}

impl<S: Store, A: Auth, T: Transport> AggregateSource<S, A, T> {
    pub fn new() -> Self {
        Self {
            connections: HashMap::new(),
        }
    }

    /// Add or replace the connection owning `group` (e.g. `"mail"`).
    pub fn insert(&mut self, group: impl Into<String>, connection: Connection<S, A, T>) {
        self.connections.insert(group.into(), connection);
    }

    pub fn connection(&self, group: &str) -> Option<&Connection<S, A, T>> {
        self.connections.get(group)
    }

    pub fn connection_mut(&mut self, group: &str) -> Option<&mut Connection<S, A, T>> {
        self.connections.get_mut(group)
    }

    pub fn groups(&self) -> impl Iterator<Item = &str> {
        self.connections.keys().map(String::as_str)
    }

    /// True if any owned connection has a `set`/`copy` call queued or in
    /// flight — i.e. local writes are still outstanding somewhere.
    pub fn is_dirty(&self) -> bool {
        self.connections.values().any(Connection::has_pending_mutation)
    }

    /// Flush every owned connection, in group-name order for determinism.
    /// Collects every group's error rather than stopping at the first,
    /// since one group's transport trouble should not stall the others.
    pub fn flush_all(&mut self) -> HashMap<String, connection::Error> {
        let mut groups: Vec<&String> = self.connections.keys().collect();
        groups.sort();
        let groups: Vec<String> = groups.into_iter().cloned().collect();

        let mut errors = HashMap::new();
        for group in groups {
            if let Some(connection) = self.connections.get_mut(&group) {
                if let Err(error) = connection.flush() {
                    errors.insert(group, error);
                }
            }
        }
        errors
    }
}

impl<S: Store, A: Auth, T: Transport> Default for AggregateSource<S, A, T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::CoreCapabilities;
    use crate::config::ConnectionConfig;
    use crate::store::RecordError;
    use crate::transport;
    use crate::wire::{BatchRequest, BatchResponse, State};
    use serde_json::Value;
    use std::time::Duration;

    #[derive(Default, Clone)]
    struct NoopStore;

    impl Store for NoopStore {
        fn source_did_fetch_records(&mut self, _: &str, _: &str, _: Vec<Value>, _: &State) {}
        fn source_did_fetch_partial_records(&mut self, _: &str, _: &str, _: Vec<Value>, _: Vec<String>, _: &State) {}
        fn source_could_not_find_records(&mut self, _: &str, _: &str, _: Vec<String>) {}
        fn source_did_fetch_updates(&mut self, _: &str, _: &str, _: Option<Vec<String>>, _: Option<Vec<String>>, _: &State, _: &str) {}
        fn source_did_commit_create(&mut self, _: &str, _: &str, _: HashMap<String, Value>) {}
        fn source_did_commit_update(&mut self, _: &str, _: &str, _: Vec<String>) {}
        fn source_did_commit_destroy(&mut self, _: &str, _: &str, _: Vec<String>) {}
        fn source_did_not_create(&mut self, _: &str, _: &str, _: HashMap<String, RecordError>, _: bool) {}
        fn source_did_not_update(&mut self, _: &str, _: &str, _: HashMap<String, RecordError>, _: bool) {}
        fn source_did_not_destroy(&mut self, _: &str, _: &str, _: HashMap<String, RecordError>, _: bool) {}
        fn source_commit_did_change_state(&mut self, _: &str, _: &str, _: &State) {}
        fn get_store_key(&self, _: &str, _: &str, _: &str) -> Option<String> {
            None
        }
        fn get_status(&self, _: &str, _: &str, _: &str) -> Value {
            Value::Null
        }
        fn set_status(&mut self, _: &str, _: &str, _: &str, _: Value) {}
        fn get_type_state(&self, _: &str, _: &str) -> Option<State> {
            None
        }
    }

    #[derive(Clone)]
    struct NoopAuth;

    impl Auth for NoopAuth {
        fn connection_will_send(&self) -> bool {
            true
        }
        fn connection_succeeded(&mut self) {}
        fn connection_failed(&mut self, _: Option<u64>) {}
        fn did_lose_authentication(&mut self) {}
        fn fetch_session(&mut self) {}
        fn access_token(&self) -> Option<String> {
            None
        }
        fn api_url(&self) -> String {
            "https://example.invalid/jmap".to_string()
        }
        fn capabilities(&self) -> CoreCapabilities {
            CoreCapabilities { max_calls_in_request: 10 }
        }
        fn session_state(&self) -> State {
            State("s".to_string())
        }
    }

    #[derive(Clone)]
    struct UnusedTransport;

    impl Transport for UnusedTransport {
        fn send(
            &self,
            _: &str,
            _: Option<&str>,
            _: &BatchRequest,
            _: Duration,
            _: Duration,
        ) -> transport::Result<BatchResponse> {
            unreachable!("test never drives a flush to completion")
        }
    }

    fn connection() -> Connection<NoopStore, NoopAuth, UnusedTransport> {
        Connection::new(NoopStore, NoopAuth, UnusedTransport, ConnectionConfig::default(), vec![])
    }

    #[test]
    fn empty_aggregate_is_not_dirty() {
        let aggregate: AggregateSource<NoopStore, NoopAuth, UnusedTransport> = AggregateSource::new();
        assert!(!aggregate.is_dirty());
    }

    #[test]
    fn dirty_bit_reflects_a_queued_set_call_in_any_group() {
        let mut aggregate = AggregateSource::new();
        aggregate.insert("mail", connection());
        aggregate.insert("contacts", connection());

        assert!(!aggregate.is_dirty());

        aggregate
            .connection_mut("contacts")
            .unwrap()
            .call_method("Contact/set", serde_json::json!({"accountId": "A1"}), None);

        assert!(aggregate.is_dirty());
        assert!(!aggregate.connection("mail").unwrap().has_pending_mutation());
        assert!(aggregate.connection("contacts").unwrap().has_pending_mutation());
    }

    #[test]
    fn a_non_mutating_call_does_not_set_the_dirty_bit() {
        let mut aggregate = AggregateSource::new();
        aggregate.insert("mail", connection());
        aggregate
            .connection_mut("mail")
            .unwrap()
            .call_method("Email/get", serde_json::json!({"accountId": "A1"}), None);
        assert!(!aggregate.is_dirty());
    }
}
