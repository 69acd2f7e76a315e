//! `Connection`'s pending-work accumulators and in-flight slots, per spec
//! §3's "work queues" and "in-flight state" data model. Structurally similar
//! to how `mujmap::sync::sync` accumulates maps before a single flush, but
//! generalized to an arbitrary number of record types and accounts instead
//! of being hardwired to `Email`.

use std::collections::{HashMap, HashSet};

use crate::wire::{ClientTag, Id, MethodCall, State};

/// What a pending fetch/refresh should ask the server for, for one
/// `(accountId, typeId)` slot: everything, a delta since a known state, or
/// a targeted set of ids.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchTarget {
    All,
    Since(State),
    Ids(HashSet<Id>),
}

impl FetchTarget {
    /// Merge another request for the same slot into this one. A type-wide
    /// fetch (`All`) absorbs anything; two `Since` targets keep the older
    /// (lower) state so no intervening change is missed; targeted ids union.
    pub fn merge(&mut self, other: FetchTarget) {
        match (&mut *self, other) {
            (FetchTarget::All, _) => {}
            (_, FetchTarget::All) => *self = FetchTarget::All,
            (FetchTarget::Ids(existing), FetchTarget::Ids(more)) => existing.extend(more),
            (_, other) => *self = other,
        }
    }
}

pub type Callback = Box<dyn FnOnce(&serde_json::Value, &str, &serde_json::Value)>;

/// A query pending its first/continued fetch.
#[derive(Debug, Clone)]
pub struct PendingQuery {
    pub account_id: String,
    pub type_name: String,
    pub filter: serde_json::Value,
    pub sort: serde_json::Value,
}

/// One accumulator slot, keyed by `(accountId, typeId)`.
type Slots = HashMap<String, HashMap<String, FetchTarget>>;

/// The full set of accumulated work for a `Connection`, flushed into one
/// batch per run-loop tick per spec §4.3 step 2.
#[derive(Default)]
pub struct WorkQueues {
    pub send_queue: Vec<MethodCall>,
    pub callback_queue: Vec<(ClientTag, Callback)>,
    pub queries_to_fetch: HashMap<String, PendingQuery>,
    pub types_to_fetch: Slots,
    pub types_to_refresh: Slots,
    pub records_to_fetch: Slots,
    pub records_to_refresh: Slots,
}

impl WorkQueues {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a method call, assigning its `clientTag` as the decimal index
    /// at append time (spec §3 invariant).
    pub fn push_call(&mut self, name: impl Into<String>, arguments: serde_json::Value) -> ClientTag {
        let tag = ClientTag::from_index(self.send_queue.len());
        self.send_queue.push(MethodCall {
            name: name.into(),
            arguments,
            client_tag: tag.clone(),
        });
        tag
    }

    pub fn push_callback(&mut self, tag: ClientTag, callback: Callback) {
        self.callback_queue.push((tag, callback));
    }

    /// Queue an unconditional callback (spec's empty-tag sentinel), run
    /// regardless of whether any particular response correlates to it.
    pub fn push_unconditional_callback(&mut self, callback: Callback) {
        self.callback_queue.push((ClientTag(String::new()), callback));
    }

    pub fn queue_record_fetch(&mut self, account_id: &str, type_name: &str, target: FetchTarget) {
        merge_slot(&mut self.records_to_fetch, account_id, type_name, target);
    }

    pub fn queue_record_refresh(&mut self, account_id: &str, type_name: &str, since: State) {
        merge_slot(
            &mut self.records_to_refresh,
            account_id,
            type_name,
            FetchTarget::Since(since),
        );
    }

    pub fn queue_type_fetch(&mut self, account_id: &str, type_name: &str) {
        merge_slot(&mut self.types_to_fetch, account_id, type_name, FetchTarget::All);
    }

    pub fn queue_type_refresh(&mut self, account_id: &str, type_name: &str, since: State) {
        merge_slot(
            &mut self.types_to_refresh,
            account_id,
            type_name,
            FetchTarget::Since(since),
        );
    }

    pub fn queue_query(&mut self, query_id: impl Into<String>, query: PendingQuery) {
        self.queries_to_fetch.insert(query_id.into(), query);
    }

    pub fn is_empty(&self) -> bool {
        self.send_queue.is_empty()
            && self.callback_queue.is_empty()
            && self.queries_to_fetch.is_empty()
            && self.types_to_fetch.is_empty()
            && self.types_to_refresh.is_empty()
            && self.records_to_fetch.is_empty()
            && self.records_to_refresh.is_empty()
    }
}

fn merge_slot(slots: &mut Slots, account_id: &str, type_name: &str, target: FetchTarget) {
    let by_type = slots.entry(account_id.to_string()).or_default();
    by_type
        .entry(type_name.to_string())
        .and_modify(|existing| existing.merge(target.clone()))
        .or_insert(target);
}

/// State captured while a batch (possibly paginated) is outstanding.
pub struct InFlightContext {
    pub created_ids: HashMap<String, String>,
    pub done_count: usize,
    pub sent_count: usize,
}

#[derive(Default)]
pub struct InFlightState {
    pub remote_calls: Vec<MethodCall>,
    pub callbacks: Vec<(ClientTag, Callback)>,
    pub context: Option<InFlightContext>,
}

impl InFlightState {
    pub fn is_active(&self) -> bool {
        !self.remote_calls.is_empty()
    }

    /// Clear all three in-flight slots atomically, per spec §3's invariant
    /// that this only happens once no further page is pending.
    pub fn clear(&mut self) {
        self.remote_calls.clear();
        self.callbacks.clear();
        self.context = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_tag_is_decimal_append_index() {
        let mut queues = WorkQueues::new();
        let t0 = queues.push_call("Email/get", serde_json::json!({}));
        let t1 = queues.push_call("Thread/get", serde_json::json!({}));
        assert_eq!(t0.0, "0");
        assert_eq!(t1.0, "1");
    }

    #[test]
    fn type_wide_fetch_supersedes_targeted_ids() {
        let mut queues = WorkQueues::new();
        queues.queue_record_fetch(
            "A1",
            "Email",
            FetchTarget::Ids(HashSet::from([Id("m1".to_string())])),
        );
        queues.queue_record_fetch("A1", "Email", FetchTarget::All);
        assert_eq!(
            queues.records_to_fetch["A1"]["Email"],
            FetchTarget::All
        );
    }

    #[test]
    fn targeted_ids_merge_by_union() {
        let mut queues = WorkQueues::new();
        queues.queue_record_fetch(
            "A1",
            "Email",
            FetchTarget::Ids(HashSet::from([Id("m1".to_string())])),
        );
        queues.queue_record_fetch(
            "A1",
            "Email",
            FetchTarget::Ids(HashSet::from([Id("m2".to_string())])),
        );
        let FetchTarget::Ids(ids) = &queues.records_to_fetch["A1"]["Email"] else {
            panic!("expected Ids");
        };
        assert_eq!(ids.len(), 2);
    }

    #[test]
    fn empty_queues_reports_empty() {
        assert!(WorkQueues::new().is_empty());
    }
}
