//! The `Store` trait (the exact consumed-interface method list from spec
//! §6) and the dispatch-table functions that translate JMAP response shapes
//! into calls against it, per spec §4.7. Grounded on `mujmap::remote`'s
//! `expect_email_get`/`expect_email_set`-style per-method unwrap helpers,
//! generalized from "one fixed method per function" to "dispatch by method
//! name" per spec §9's redesign flag.

use std::collections::HashMap;

use serde_json::Value;

use crate::wire::State;

/// A server-supplied error object attached to one failed id in a
/// `notCreated`/`notUpdated`/`notDestroyed` map.
pub type RecordError = Value;

/// The store interface a `Connection` drives, per spec §6. Out of scope
/// per spec §1 (storage, identity, dirty-tracking are the store's own
/// concern) — this crate only calls through the trait.
pub trait Store {
    fn source_did_fetch_records(&mut self, account_id: &str, type_name: &str, records: Vec<Value>, state: &State);

    fn source_did_fetch_partial_records(
        &mut self,
        account_id: &str,
        type_name: &str,
        records: Vec<Value>,
        not_found: Vec<String>,
        state: &State,
    );

    fn source_could_not_find_records(&mut self, account_id: &str, type_name: &str, ids: Vec<String>);

    fn source_did_fetch_updates(
        &mut self,
        account_id: &str,
        type_name: &str,
        updated: Option<Vec<String>>,
        destroyed: Option<Vec<String>>,
        new_state: &State,
        old_state: &str,
    );

    fn source_did_commit_create(&mut self, account_id: &str, type_name: &str, created: HashMap<String, Value>);

    fn source_did_commit_update(&mut self, account_id: &str, type_name: &str, updated: Vec<String>);

    fn source_did_commit_destroy(&mut self, account_id: &str, type_name: &str, destroyed: Vec<String>);

    fn source_did_not_create(&mut self, account_id: &str, type_name: &str, errors: HashMap<String, RecordError>, is_permanent: bool);

    fn source_did_not_update(&mut self, account_id: &str, type_name: &str, errors: HashMap<String, RecordError>, is_permanent: bool);

    fn source_did_not_destroy(&mut self, account_id: &str, type_name: &str, errors: HashMap<String, RecordError>, is_permanent: bool);

    fn source_commit_did_change_state(&mut self, account_id: &str, type_name: &str, new_state: &State);

    fn get_store_key(&self, account_id: &str, type_name: &str, id: &str) -> Option<String>;

    fn get_status(&self, account_id: &str, type_name: &str, store_key: &str) -> Value;

    fn set_status(&mut self, account_id: &str, type_name: &str, store_key: &str, status: Value);

    fn get_type_state(&self, account_id: &str, type_name: &str) -> Option<State>;
}

/// `notFound`/`list`/`state` half of a `<Type>/get` response.
pub fn apply_get_response(store: &mut dyn Store, account_id: &str, type_name: &str, response: &Value) {
    let list: Vec<Value> = response
        .get("list")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();
    let not_found: Vec<String> = response
        .get("notFound")
        .and_then(Value::as_array)
        .map(|ids| ids.iter().filter_map(|v| v.as_str().map(str::to_string)).collect())
        .unwrap_or_default();
    let state = response
        .get("state")
        .and_then(Value::as_str)
        .map(|s| State(s.to_string()))
        .unwrap_or_else(|| State(String::new()));

    if not_found.is_empty() {
        store.source_did_fetch_records(account_id, type_name, list, &state);
    } else {
        store.source_did_fetch_partial_records(account_id, type_name, list, not_found, &state);
    }
}

/// `created`/`updated`/`destroyed`/`oldState`/`newState` half of a
/// `<Type>/changes` response.
pub fn apply_changes_response(store: &mut dyn Store, account_id: &str, type_name: &str, response: &Value) {
    fn ids(response: &Value, key: &str) -> Option<Vec<String>> {
        response
            .get(key)
            .and_then(Value::as_array)
            .map(|ids| ids.iter().filter_map(|v| v.as_str().map(str::to_string)).collect())
    }

    let created = ids(response, "created");
    let updated = ids(response, "updated");
    let destroyed = ids(response, "destroyed");
    let old_state = response.get("oldState").and_then(Value::as_str).unwrap_or("");
    let new_state = response
        .get("newState")
        .and_then(Value::as_str)
        .map(|s| State(s.to_string()))
        .unwrap_or_else(|| State(String::new()));

    // `created` records still need a fetch; the store sees them folded into
    // `updated` since both are "this id needs fresh data".
    let mut updated = updated.unwrap_or_default();
    if let Some(created) = created {
        updated.extend(created);
    }
    let updated = if updated.is_empty() { None } else { Some(updated) };

    store.source_did_fetch_updates(account_id, type_name, updated, destroyed, &new_state, old_state);
}

/// `created`/`notCreated`/`updated`/`notUpdated`/`destroyed`/`notDestroyed`/
/// `oldState`/`newState` half of a `<Type>/set` response.
pub fn apply_set_response(store: &mut dyn Store, account_id: &str, type_name: &str, response: &Value) {
    if let Some(created) = response.get("created").and_then(Value::as_object) {
        let created: HashMap<String, Value> = created.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
        if !created.is_empty() {
            store.source_did_commit_create(account_id, type_name, created);
        }
    }
    if let Some(updated) = response.get("updated").and_then(Value::as_object) {
        let ids: Vec<String> = updated.keys().cloned().collect();
        if !ids.is_empty() {
            store.source_did_commit_update(account_id, type_name, ids);
        }
    }
    if let Some(destroyed) = response.get("destroyed").and_then(Value::as_array) {
        let ids: Vec<String> = destroyed.iter().filter_map(|v| v.as_str().map(str::to_string)).collect();
        if !ids.is_empty() {
            store.source_did_commit_destroy(account_id, type_name, ids);
        }
    }

    apply_not_map(store, account_id, type_name, response, "notCreated", Store::source_did_not_create);
    apply_not_map(store, account_id, type_name, response, "notUpdated", Store::source_did_not_update);
    apply_not_map(store, account_id, type_name, response, "notDestroyed", Store::source_did_not_destroy);

    if let Some(new_state) = response.get("newState").and_then(Value::as_str) {
        store.source_commit_did_change_state(account_id, type_name, &State(new_state.to_string()));
    }
}

/// Per spec §7 point 4: per-record failures inside an otherwise successful
/// batch are always permanent (the server made a final decision about that
/// id), unlike the generic fallback in §7 point 3 for a wholesale method
/// error, which is also permanent but attributed to every attempted id
/// rather than a server-reported subset.
fn apply_not_map(
    store: &mut dyn Store,
    account_id: &str,
    type_name: &str,
    response: &Value,
    key: &str,
    apply: fn(&mut dyn Store, &str, &str, HashMap<String, RecordError>, bool),
) {
    if let Some(map) = response.get(key).and_then(Value::as_object) {
        if !map.is_empty() {
            let errors: HashMap<String, RecordError> = map.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
            apply(store, account_id, type_name, errors, true);
        }
    }
}
