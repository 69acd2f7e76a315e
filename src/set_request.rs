//! Shapes `create`/`update`/`destroy` payloads for `<Type>/set` and
//! `<Type>/copy`, per spec §4.2. Grounded on
//! `mujmap::jmap::request::MethodCallSet`'s `create`/`update`/`destroy` map
//! shape, generalized from per-type create payload structs to an open
//! `serde_json::Value`, since this crate is not scoped to one record type.

use std::collections::HashMap;

use serde_json::{Map, Value};

use crate::patch::{make_patches, Patch};
use crate::wire::Id;

/// Per-record-type change-set handed to the set-request builder: the input
/// half of spec §3's "change-set (input to commit)" data model.
#[derive(Debug, Clone, Default)]
pub struct ChangeSet {
    pub account_id: String,
    /// Attribute the server treats as this type's primary key (usually
    /// `"id"`, but e.g. `EmailSubmission` methods use others).
    pub primary_key: String,
    pub create: CreateBucket,
    pub update: UpdateBucket,
    pub destroy: DestroyBucket,
    /// Per-source-account update buckets for records being moved in via
    /// `moveFromAccount`, keyed by the source account id.
    pub move_from_account: HashMap<String, UpdateBucket>,
    pub state: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct CreateBucket {
    pub store_keys: Vec<String>,
    pub records: Vec<Value>,
}

#[derive(Debug, Clone, Default)]
pub struct UpdateBucket {
    pub store_keys: Vec<String>,
    pub records: Vec<Value>,
    pub committed: Vec<Value>,
    /// `changes[i]` maps attribute name to whether it changed, for the
    /// record at the same index in `records`/`committed`.
    pub changes: Vec<HashMap<String, bool>>,
}

#[derive(Debug, Clone, Default)]
pub struct DestroyBucket {
    pub ids: Vec<Id>,
}

/// The `create`/`update`/`destroy` arguments of a `<Type>/set` call, ready
/// to be merged into a `MethodCall`'s `arguments` object alongside
/// `accountId` and (optionally) `ifInState`.
#[derive(Debug, Clone, Default)]
pub struct SetArgs {
    pub create: Option<HashMap<String, Value>>,
    pub update: Option<HashMap<String, Value>>,
    pub destroy: Option<Vec<Id>>,
}

impl SetArgs {
    fn is_empty(&self) -> bool {
        self.create.as_ref().map_or(true, HashMap::is_empty)
            && self.update.as_ref().map_or(true, HashMap::is_empty)
            && self.destroy.as_ref().map_or(true, Vec::is_empty)
    }
}

/// A synthesized `<Type>/copy` call for one `moveFromAccount` source, to be
/// appended to the batch alongside the primary `<Type>/set`.
#[derive(Debug, Clone)]
pub struct CopyArgs {
    pub from_account_id: String,
    pub account_id: String,
    pub create: HashMap<String, Value>,
    pub on_success_destroy_original: bool,
}

/// Build the `create`/`update`/`destroy` arguments for `change`. `noPatch`
/// (used when building a `copy` call) emits whole attribute values instead
/// of diffing against `committed`. Returns `None` if every bucket is empty.
pub fn make_set_request(change: &ChangeSet, no_patch: bool) -> Option<SetArgs> {
    let mut args = SetArgs::default();

    if !change.create.records.is_empty() {
        let mut create = HashMap::new();
        for (store_key, record) in change.create.store_keys.iter().zip(&change.create.records) {
            create.insert(store_key.clone(), record.clone());
        }
        args.create = Some(create);
    }

    if !change.update.records.is_empty() {
        let mut update = HashMap::new();
        for (((store_key, record), committed), changes) in change
            .update
            .store_keys
            .iter()
            .zip(&change.update.records)
            .zip(&change.update.committed)
            .zip(&change.update.changes)
        {
            let patched = build_update_patch(record, committed, changes, no_patch);
            update.insert(store_key.clone(), patched);
        }
        args.update = Some(update);
    }

    if !change.destroy.ids.is_empty() {
        args.destroy = Some(change.destroy.ids.clone());
    }

    if args.is_empty() {
        None
    } else {
        Some(args)
    }
}

/// Per-record update payload: either a whole-value replacement (`noPatch`)
/// or a JSON-Pointer patch over only the attributes marked as changed.
fn build_update_patch(
    record: &Value,
    committed: &Value,
    changes: &HashMap<String, bool>,
    no_patch: bool,
) -> Value {
    if no_patch {
        return record.clone();
    }

    let mut patches: Patch = Patch::new();
    for (attribute, changed) in changes {
        if !*changed || attribute == "accountId" {
            continue;
        }
        let original = committed.get(attribute).cloned().unwrap_or(Value::Null);
        let current = record.get(attribute).cloned().unwrap_or(Value::Null);
        let path = format!("/{}", crate::patch::encode_component(attribute));
        make_patches(&path, &mut patches, &original, &current);
    }

    let mut object = Map::new();
    for (path, value) in patches {
        object.insert(path, value.unwrap_or(Value::Null));
    }
    Value::Object(object)
}

/// Build the `<Type>/copy` calls for a `ChangeSet`'s `moveFromAccount`
/// buckets, one per source account. Each copy's `create` bucket is built
/// with `noPatch = true` (full attribute values, not diffs) and its
/// `primaryKey` set to the source-side id so the server correlates the
/// copy, mirroring `mujmap::remote::Remote::send_email`'s pattern of a
/// success-triggered follow-up call (there `onSuccessUpdateEmail`; here
/// `onSuccessDestroyOriginal`).
pub fn commit_type_copies(change: &ChangeSet) -> Vec<CopyArgs> {
    change
        .move_from_account
        .iter()
        .filter(|(_, bucket)| !bucket.records.is_empty())
        .map(|(from_account_id, bucket)| {
            let mut create = HashMap::new();
            for (store_key, record) in bucket.store_keys.iter().zip(&bucket.records) {
                let mut record = record.clone();
                if let (Value::Object(map), Some(committed)) = (
                    &mut record,
                    bucket
                        .store_keys
                        .iter()
                        .position(|k| k == store_key)
                        .and_then(|i| bucket.committed.get(i)),
                ) {
                    if let Some(source_id) = committed.get(&change.primary_key) {
                        map.insert(change.primary_key.clone(), source_id.clone());
                    }
                }
                create.insert(store_key.clone(), record);
            }
            CopyArgs {
                from_account_id: from_account_id.clone(),
                account_id: change.account_id.clone(),
                create,
                on_success_destroy_original: true,
            }
        })
        .collect()
}
