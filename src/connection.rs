//! `Connection<S, A, T>`: the request batching and response dispatch engine
//! that sits between a record store and the HTTP transport, per spec §4.3.
//! Follows the shape of `mujmap::remote::Remote` (one struct owning an
//! `HttpWrapper`-equivalent plus session/capabilities state), but
//! parameterized over `Store`/`Auth`/`Transport` instead of hardwired to
//! `ureq`/notmuch, since those are out-of-scope collaborators here.
//!
//! Since every `Transport` implementation this crate ships is synchronous
//! (no executor dependency, per spec §5's single-threaded cooperative
//! model), a call to `flush()` runs every page of a paginated batch to
//! completion before returning; `InFlightState` still tracks "a request is
//! outstanding" so a callback that re-enters `flush()` does not recurse.

use std::collections::HashMap;
use std::time::Duration;

use log::{debug, trace, warn};
use serde_json::{json, Value};
use snafu::prelude::*;

use crate::auth::Auth;
use crate::config::ConnectionConfig;
use crate::failure::{self, MaxChangesSchedule, Outcome};
use crate::handler::{HandlerRegistry, RecordHandler};
use crate::queue::{Callback, FetchTarget, InFlightContext, InFlightState, PendingQuery, WorkQueues};
use crate::set_request::{commit_type_copies, make_set_request, ChangeSet};
use crate::store::{apply_changes_response, apply_get_response, apply_set_response, Store};
use crate::transport::{self, Transport};
use crate::wire::{BatchRequest, ClientTag, Id, MethodCall, MethodResponse, ResultReference, State};

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("transport error: {}", source))]
    Transport { source: transport::Error },

    #[snafu(display("exceeded max_session_refetches ({}) retrying after repeated 404", limit))]
    SessionRefetchLoop { limit: u32 },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

pub struct Connection<S: Store, A: Auth, T: Transport> {
    store: S,
    auth: A,
    transport: T,
    config: ConnectionConfig,
    handlers: HandlerRegistry,
    queues: WorkQueues,
    in_flight: InFlightState,
    /// Capability URIs this connection always declares in `using`.
    using: Vec<String>,
    session_refetch_count: u32,
    changes_schedules: HashMap<(String, String), MaxChangesSchedule>,
}

impl<S: Store, A: Auth, T: Transport> Connection<S, A, T> {
    pub fn new(store: S, auth: A, transport: T, config: ConnectionConfig, using: Vec<String>) -> Self {
        Self {
            store,
            auth,
            transport,
            config,
            handlers: HandlerRegistry::new(),
            queues: WorkQueues::new(),
            in_flight: InFlightState::default(),
            using,
            session_refetch_count: 0,
            changes_schedules: HashMap::new(),
        }
    }

    pub fn handlers_mut(&mut self) -> &mut HandlerRegistry {
        &mut self.handlers
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut S {
        &mut self.store
    }

    // ---- Queueing API (called synchronously as the store accumulates work) ----

    pub fn fetch_record(&mut self, account_id: &str, type_name: &str, target: FetchTarget) {
        self.queues.queue_record_fetch(account_id, type_name, target);
    }

    pub fn refresh_record(&mut self, account_id: &str, type_name: &str, since: State) {
        self.queues.queue_record_refresh(account_id, type_name, since);
    }

    pub fn fetch_type(&mut self, account_id: &str, type_name: &str) {
        self.queues.queue_type_fetch(account_id, type_name);
    }

    pub fn refresh_type(&mut self, account_id: &str, type_name: &str, since: State) {
        self.queues.queue_type_refresh(account_id, type_name, since);
    }

    pub fn fetch_query(&mut self, query_id: impl Into<String>, query: PendingQuery) {
        self.queues.queue_query(query_id, query);
    }

    /// Queue a `<Type>/set` (plus any `<Type>/copy` fan-out) for `change`,
    /// per spec §4.2. The store adaptor translates the response
    /// automatically; `callback`, if given, additionally observes the raw
    /// response.
    pub fn commit_changes(&mut self, type_name: &str, change: ChangeSet, callback: Option<Callback>) {
        if let Some(set_args) = make_set_request(&change, false) {
            let mut arguments = json!({ "accountId": change.account_id });
            if let Some(create) = &set_args.create {
                arguments["create"] = serde_json::to_value(create).unwrap();
            }
            if let Some(update) = &set_args.update {
                arguments["update"] = serde_json::to_value(update).unwrap();
            }
            if let Some(destroy) = &set_args.destroy {
                arguments["destroy"] = serde_json::to_value(destroy).unwrap();
            }
            let tag = self.queues.push_call(format!("{type_name}/set"), arguments);
            self.register_set_response_handler(type_name, tag.clone());
            if let Some(callback) = callback {
                self.queues.push_callback(tag, callback);
            }
        }

        for copy in commit_type_copies(&change) {
            let arguments = json!({
                "fromAccountId": copy.from_account_id,
                "accountId": copy.account_id,
                "create": copy.create,
                "onSuccessDestroyOriginal": copy.on_success_destroy_original,
            });
            let tag = self.queues.push_call(format!("{type_name}/copy"), arguments);
            self.register_set_response_handler(type_name, tag);
        }
    }

    fn register_set_response_handler(&mut self, _type_name: &str, _tag: ClientTag) {
        // The default dispatch in `route_response` already recognizes any
        // `<Type>/set` or `<Type>/copy` response by its verb suffix, so no
        // per-call registration is required unless a caller wants to
        // override it via `handlers_mut().handle_response(...)`.
    }

    /// Queue a direct method call with an optional completion callback, per
    /// spec §3's "direct method calls" accumulator.
    pub fn call_method(&mut self, name: impl Into<String>, arguments: Value, callback: Option<Callback>) -> ClientTag {
        let tag = self.queues.push_call(name, arguments);
        if let Some(callback) = callback {
            self.queues.push_callback(tag.clone(), callback);
        }
        tag
    }

    /// True if a `set` or `copy` call is queued or in flight: an aggregate
    /// owning several connections uses this to tell whether any of them
    /// still has local writes outstanding.
    pub fn has_pending_mutation(&self) -> bool {
        let is_mutation = |call: &MethodCall| matches!(split_method(&call.name).1, "set" | "copy");
        self.queues.send_queue.iter().any(is_mutation) || self.in_flight.remote_calls.iter().any(is_mutation)
    }

    // ---- Pipeline ----

    /// Drain queues into a batched method-call list, slice into pages,
    /// submit, dispatch responses, and run callbacks. A no-op if a request
    /// is already being flushed (reentrant call from inside a callback) or
    /// `Auth::connection_will_send` vetoes sending right now.
    pub fn flush(&mut self) -> Result<()> {
        if self.in_flight.is_active() {
            return Ok(());
        }
        if !self.auth.connection_will_send() {
            return Ok(());
        }

        self.materialize_batch();

        if self.queues.send_queue.is_empty() && self.queues.callback_queue.is_empty() {
            return Ok(());
        }

        self.in_flight.remote_calls = std::mem::take(&mut self.queues.send_queue);
        self.in_flight.callbacks = std::mem::take(&mut self.queues.callback_queue);

        let max_calls = self.auth.capabilities().max_calls_in_request as usize;
        if max_calls > 0 && self.in_flight.remote_calls.len() > max_calls {
            self.in_flight.context = Some(InFlightContext {
                created_ids: HashMap::new(),
                done_count: 0,
                sent_count: 0,
            });
        }

        self.send_all_pages()
    }

    /// Step 2 of spec §4.3: turn accumulated queue state into `MethodCall`s,
    /// in the mandated order (queries → type refreshes → record refreshes →
    /// type fetches → record fetches), each in registration order among
    /// same-kind handlers.
    fn materialize_batch(&mut self) {
        for (query_id, query) in std::mem::take(&mut self.queues.queries_to_fetch) {
            let arguments = json!({
                "accountId": query.account_id,
                "filter": query.filter,
                "sort": query.sort,
            });
            self.queues.push_call(format!("{}/query", query.type_name), arguments);
            trace!("materialized query fetch {query_id}");
        }

        self.materialize_slots(SlotKind::TypeRefresh);
        self.materialize_slots(SlotKind::RecordRefresh);
        self.materialize_slots(SlotKind::TypeFetch);
        self.materialize_slots(SlotKind::RecordFetch);
    }

    fn materialize_slots(&mut self, kind: SlotKind) {
        let slots = match kind {
            SlotKind::TypeFetch => std::mem::take(&mut self.queues.types_to_fetch),
            SlotKind::TypeRefresh => std::mem::take(&mut self.queues.types_to_refresh),
            SlotKind::RecordFetch => std::mem::take(&mut self.queues.records_to_fetch),
            SlotKind::RecordRefresh => std::mem::take(&mut self.queues.records_to_refresh),
        };

        let handler_names = self.handlers.types_with(|set| match kind {
            SlotKind::TypeFetch | SlotKind::RecordFetch => set.fetch.is_some(),
            SlotKind::TypeRefresh | SlotKind::RecordRefresh => set.refresh.is_some(),
        });

        // Process in handler-precedence order where a handler is
        // registered; any remaining (unregistered) types fall back to the
        // built-in `<Type>/get` or `<Type>/changes` shape.
        let mut ordered: Vec<String> = handler_names;
        for (_, by_type) in &slots {
            for type_name in by_type.keys() {
                if !ordered.contains(type_name) {
                    ordered.push(type_name.clone());
                }
            }
        }

        for type_name in ordered {
            for (account_id, by_type) in &slots {
                let Some(target) = by_type.get(&type_name) else {
                    continue;
                };
                self.materialize_one(kind, account_id, &type_name, target);
            }
        }
    }

    fn materialize_one(&mut self, kind: SlotKind, account_id: &str, type_name: &str, target: &FetchTarget) {
        let handler = self
            .handlers
            .type_handlers(type_name)
            .and_then(|set| match kind {
                SlotKind::TypeFetch | SlotKind::RecordFetch => set.fetch.clone(),
                SlotKind::TypeRefresh | SlotKind::RecordRefresh => set.refresh.clone(),
            });

        match handler {
            Some(RecordHandler::Function(f)) => {
                let ids: Option<Vec<String>> = match target {
                    FetchTarget::Ids(ids) => Some(ids.iter().map(|id| id.0.clone()).collect()),
                    _ => None,
                };
                let state = match target {
                    FetchTarget::Since(state) => Some(state.0.as_str()),
                    _ => None,
                };
                let arguments = (f.as_ref())(account_id, ids.as_deref(), state);
                self.push_built_call(kind, type_name, arguments);
            }
            _ => {
                // Built-in: `get` shape for fetches, `changes` shape for refreshes.
                match (kind, target) {
                    (SlotKind::TypeFetch | SlotKind::RecordFetch, _) => {
                        let arguments = self.build_get_args(account_id, target);
                        self.push_built_call(kind, type_name, arguments);
                    }
                    (SlotKind::TypeRefresh | SlotKind::RecordRefresh, FetchTarget::Since(since)) => {
                        let max_changes = self.changes_schedule(account_id, type_name).current();
                        let arguments = json!({
                            "accountId": account_id,
                            "sinceState": since.0,
                            "maxChanges": max_changes,
                        });
                        self.queues.push_call(format!("{type_name}/changes"), arguments);
                    }
                    _ => {
                        warn!("refresh requested for {type_name} without a known state; skipping");
                    }
                }
            }
        }
    }

    fn push_built_call(&mut self, kind: SlotKind, type_name: &str, arguments: Value) {
        let verb = match kind {
            SlotKind::TypeFetch | SlotKind::RecordFetch => "get",
            SlotKind::TypeRefresh | SlotKind::RecordRefresh => "changes",
        };
        self.queues.push_call(format!("{type_name}/{verb}"), arguments);
    }

    fn build_get_args(&self, account_id: &str, target: &FetchTarget) -> Value {
        match target {
            FetchTarget::All => json!({ "accountId": account_id, "ids": Value::Null }),
            FetchTarget::Since(_) => json!({ "accountId": account_id, "ids": Value::Null }),
            FetchTarget::Ids(ids) => {
                let mut ids: Vec<&str> = ids.iter().map(|id| id.0.as_str()).collect();
                ids.sort_unstable();
                json!({ "accountId": account_id, "ids": ids })
            }
        }
    }

    fn changes_schedule(&mut self, account_id: &str, type_name: &str) -> &mut MaxChangesSchedule {
        let key = (account_id.to_string(), type_name.to_string());
        self.changes_schedules
            .entry(key)
            .or_insert_with(|| MaxChangesSchedule::new(self.config.max_changes_schedule(type_name).to_vec()))
    }

    /// Step 4-6 of spec §4.3: send every page of the current in-flight
    /// batch to completion, dispatching responses and finally draining
    /// callbacks over the combined response set once the whole batch (all
    /// pages) has completed.
    fn send_all_pages(&mut self) -> Result<()> {
        let total = self.in_flight.remote_calls.len();
        let mut all_responses: Vec<MethodResponse> = Vec::with_capacity(total);

        loop {
            let max_calls = self.auth.capabilities().max_calls_in_request.max(1) as usize;
            let start = self
                .in_flight
                .context
                .as_ref()
                .map(|ctx| ctx.done_count)
                .unwrap_or(0);
            let end = page_end(&self.in_flight.remote_calls, start, max_calls.min(total.max(1)));
            let end = if self.in_flight.context.is_some() { end } else { total };

            let page = self.in_flight.remote_calls[start..end].to_vec();
            let created_ids = self.in_flight.context.as_ref().map(|ctx| ctx.created_ids.clone());

            let request = BatchRequest {
                using: self.using.clone(),
                method_calls: page,
                created_ids,
            };

            let timeout = Duration::from_secs(self.config.timeout_secs);
            let timeout_after_upload = Duration::from_secs(self.config.timeout_after_upload_secs);

            match self.transport.send(
                &self.auth.api_url(),
                self.auth.access_token().as_deref(),
                &request,
                timeout,
                timeout_after_upload,
            ) {
                Ok(batch_response) => {
                    self.auth.connection_succeeded();
                    self.session_refetch_count = 0;

                    if State(batch_response.session_state.clone()) != self.auth.session_state() {
                        self.auth.fetch_session();
                    }

                    if batch_response.method_responses.is_empty() {
                        self.auth.connection_failed(None);
                        self.discard_in_flight();
                        return Ok(());
                    }

                    let sent = end - start;
                    all_responses.extend(batch_response.method_responses);

                    match &mut self.in_flight.context {
                        Some(ctx) => {
                            ctx.done_count += sent;
                            ctx.sent_count = sent;
                            ctx.created_ids = batch_response.created_ids.unwrap_or_default();
                            if ctx.done_count >= total {
                                break;
                            }
                            // loop again for the next page
                        }
                        None => break,
                    }
                }
                Err(err) => {
                    return self.handle_transport_error(err);
                }
            }
        }

        self.dispatch_all(&all_responses);
        self.drain_callbacks(&all_responses);
        self.in_flight.clear();
        Ok(())
    }

    fn discard_in_flight(&mut self) {
        debug!("discarding in-flight batch: no usable response");
        self.drain_callbacks(&[]);
        self.in_flight.clear();
    }

    /// Per spec §9's flagged-as-ambiguous HTTP-404 re-send loop: bounded by
    /// `max_session_refetches`. Exceeding it discards the in-flight batch and
    /// reports `Error::SessionRefetchLoop` rather than looping forever.
    fn handle_transport_error(&mut self, err: transport::Error) -> Result<()> {
        let outcome = match &err {
            transport::Error::Status { status } => {
                failure::classify(*status, true, self.config.rate_limit_backoff_secs)
            }
            transport::Error::Timeout => failure::classify_no_response(true),
            _ => failure::classify_no_response(false),
        };

        match outcome {
            Outcome::Discard => {
                warn!("discarding batch after transport error: {err}");
                self.discard_in_flight();
            }
            Outcome::ReAuth => {
                self.auth.did_lose_authentication();
                self.requeue_in_flight();
            }
            Outcome::RefreshSession => {
                self.session_refetch_count += 1;
                if self.session_refetch_count > self.config.max_session_refetches {
                    warn!("exceeded max_session_refetches after repeated 404s");
                    self.discard_in_flight();
                    return SessionRefetchLoopSnafu {
                        limit: self.config.max_session_refetches,
                    }
                    .fail();
                }
                self.auth.fetch_session();
                self.requeue_in_flight();
            }
            Outcome::RateLimit { backoff_secs } => {
                self.auth.connection_failed(Some(backoff_secs));
                self.requeue_in_flight();
            }
            Outcome::Fatal => {
                warn!("fatal server failure: {err}");
                self.discard_in_flight();
            }
            Outcome::Retry => {
                self.auth.connection_failed(None);
                self.requeue_in_flight();
            }
        }
        Ok(())
    }

    /// Put the in-flight batch back at the front of the send queue so the
    /// next `flush()` retries it, preserving clientTag/append order.
    fn requeue_in_flight(&mut self) {
        let mut calls = std::mem::take(&mut self.in_flight.remote_calls);
        calls.append(&mut self.queues.send_queue);
        self.queues.send_queue = calls;
        let mut callbacks = std::mem::take(&mut self.in_flight.callbacks);
        callbacks.append(&mut self.queues.callback_queue);
        self.queues.callback_queue = callbacks;
        self.in_flight.context = None;
    }

    /// Route every response by `response.name` to a handler, most specific
    /// first, per spec §7 point 3's layered lookup. Store mutation happens
    /// here so that `drain_callbacks` (run afterward) observes the
    /// post-response store state, per spec §5's ordering guarantee.
    fn dispatch_all(&mut self, responses: &[MethodResponse]) {
        for response in responses {
            let Some(index) = response.client_tag.as_index() else {
                continue;
            };
            let Some(request) = self.in_flight.remote_calls.get(index).cloned() else {
                warn!("response tag {} has no matching request", response.client_tag);
                continue;
            };
            self.route_response(&request, response);
        }
    }

    fn route_response(&mut self, request: &MethodCall, response: &MethodResponse) {
        let (type_name, verb) = split_method(&request.name);
        let account_id = request
            .arguments
            .get("accountId")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();

        if response.is_error() {
            self.route_error(&account_id, type_name, verb, request, response);
            return;
        }

        if let Some(handler) = self.handlers.response_handler(&response.name) {
            (handler.as_ref())(&response.arguments, &request.name, &request.arguments);
            return;
        }

        match verb {
            "get" => apply_get_response(&mut self.store, &account_id, type_name, &response.arguments),
            "changes" => {
                let has_more = response
                    .arguments
                    .get("hasMoreChanges")
                    .and_then(Value::as_bool)
                    .unwrap_or(false);
                apply_changes_response(&mut self.store, &account_id, type_name, &response.arguments);
                if has_more {
                    let escalated = self.changes_schedule(&account_id, type_name).escalate();
                    if !escalated {
                        self.changes_schedule(&account_id, type_name).reset();
                        let action = failure::force_resync(account_id.clone(), type_name.to_string());
                        let state = self
                            .store
                            .get_type_state(&account_id, type_name)
                            .unwrap_or_else(|| State(String::new()));
                        self.store.source_did_fetch_updates(
                            &action.account_id,
                            &action.type_name,
                            None,
                            None,
                            &state,
                            "",
                        );
                    }
                }
            }
            "set" | "copy" => apply_set_response(&mut self.store, &account_id, type_name, &response.arguments),
            _ => {
                if let Some(handler) = self.handlers.response_handler(&request.name) {
                    (handler.as_ref())(&response.arguments, &request.name, &request.arguments);
                } else {
                    debug!("no handler registered for response `{}'", response.name);
                }
            }
        }
    }

    /// Method-level error taxonomy per spec §7 point 3: layered lookup
    /// `error_<Method>_<type>` → `error_<Method>` → `error_/<verb>` →
    /// `error_<type>`; if nothing matches, log as unhandled, and for
    /// `/set`/`/copy` synthesize `notCreated`/`notUpdated`/`notDestroyed`
    /// maps attributing the error to every attempted id.
    fn route_error(&mut self, account_id: &str, type_name: &str, verb: &str, request: &MethodCall, response: &MethodResponse) {
        let error_type = response.error_kind().unwrap_or("unknown");

        if error_type == "cannotCalculateChanges" && verb == "changes" {
            let action = failure::force_resync(account_id.to_string(), type_name.to_string());
            if let Some(schedule) = self.changes_schedules.get_mut(&(account_id.to_string(), type_name.to_string())) {
                schedule.reset();
            }
            let current_state = self
                .store
                .get_type_state(account_id, type_name)
                .unwrap_or_else(|| State(String::new()));
            self.store.source_did_fetch_updates(
                &action.account_id,
                &action.type_name,
                None,
                None,
                &current_state,
                "",
            );
            return;
        }

        let candidates = [
            format!("error_{}_{}", request.name, error_type),
            format!("error_{}", request.name),
            format!("error_/{verb}"),
            format!("error_{error_type}"),
        ];

        for key in &candidates {
            if let Some(handler) = self.handlers.response_handler(key) {
                (handler.as_ref())(&response.arguments, &request.name, &request.arguments);
                return;
            }
        }

        warn!(
            "unhandled method-level error `{}' for `{}'",
            error_type, request.name
        );

        if verb == "set" || verb == "copy" {
            let attempted_ids = attempted_record_ids(&request.arguments);
            if !attempted_ids.is_empty() {
                let errors: HashMap<String, Value> = attempted_ids
                    .into_iter()
                    .map(|id| (id, response.arguments.clone()))
                    .collect();
                self.store.source_did_not_create(account_id, type_name, errors.clone(), true);
                self.store.source_did_not_update(account_id, type_name, errors.clone(), true);
                self.store.source_did_not_destroy(account_id, type_name, errors, true);
            }
        }
    }

    /// Callbacks fire in append order after every response handler for this
    /// batch has mutated the store (spec §8's callback-ordering property).
    /// A non-empty tag locates the matching response by numeric index (or
    /// the `["error", {}, ""]` sentinel if none); the empty tag is an
    /// unconditional callback.
    fn drain_callbacks(&mut self, responses: &[MethodResponse]) {
        let callbacks = std::mem::take(&mut self.in_flight.callbacks);
        let sentinel_args = json!({});
        for (tag, callback) in callbacks {
            if tag.0.is_empty() {
                callback(&sentinel_args, "", &Value::Null);
                continue;
            }
            let request_args = tag
                .as_index()
                .and_then(|i| self.in_flight.remote_calls.get(i))
                .map(|call| call.arguments.clone())
                .unwrap_or(Value::Null);
            match responses.iter().find(|r| r.client_tag == tag) {
                Some(response) => callback(&response.arguments, &response.name, &request_args),
                None => callback(&sentinel_args, "error", &request_args),
            }
        }
    }
}

#[derive(Clone, Copy)]
enum SlotKind {
    TypeFetch,
    TypeRefresh,
    RecordFetch,
    RecordRefresh,
}

fn split_method(name: &str) -> (&str, &str) {
    match name.rsplit_once('/') {
        Some((type_name, verb)) => (type_name, verb),
        None => (name, ""),
    }
}

fn attempted_record_ids(arguments: &Value) -> Vec<String> {
    let mut ids = Vec::new();
    for key in ["create", "update"] {
        if let Some(map) = arguments.get(key).and_then(Value::as_object) {
            ids.extend(map.keys().cloned());
        }
    }
    if let Some(destroy) = arguments.get("destroy").and_then(Value::as_array) {
        ids.extend(destroy.iter().filter_map(|v| v.as_str().map(str::to_string)));
    }
    ids
}

/// Pagination slicing per spec §4.3 step 5: the page is
/// `calls[start..start+max_calls)`, then shrunk while the call immediately
/// after the tentative end still back-references into the page (assuming,
/// per spec §9's documented simplifying assumption, that a back-reference
/// always targets the immediately preceding call).
fn page_end(calls: &[MethodCall], start: usize, max_calls: usize) -> usize {
    let mut end = (start + max_calls.max(1)).min(calls.len());
    while end > start + 1 && end < calls.len() {
        if ResultReference::any_in(&calls[end].arguments) {
            end -= 1;
        } else {
            break;
        }
    }
    end
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::CoreCapabilities;
    use std::cell::RefCell;
    use std::rc::Rc;
    use std::sync::{Arc, Mutex};

    #[derive(Default, Clone)]
    struct FakeStore {
        fetched: Arc<Mutex<Vec<(String, String, usize, String)>>>,
        fetched_updates: Arc<Mutex<Vec<(String, String, Option<Vec<String>>, Option<Vec<String>>)>>>,
    }

    impl Store for FakeStore {
        fn source_did_fetch_records(&mut self, account_id: &str, type_name: &str, records: Vec<Value>, state: &State) {
            self.fetched
                .lock()
                .unwrap()
                .push((account_id.to_string(), type_name.to_string(), records.len(), state.0.clone()));
        }
        fn source_did_fetch_partial_records(&mut self, _: &str, _: &str, _: Vec<Value>, _: Vec<String>, _: &State) {}
        fn source_could_not_find_records(&mut self, _: &str, _: &str, _: Vec<String>) {}
        fn source_did_fetch_updates(
            &mut self,
            account_id: &str,
            type_name: &str,
            updated: Option<Vec<String>>,
            destroyed: Option<Vec<String>>,
            _: &State,
            _: &str,
        ) {
            self.fetched_updates
                .lock()
                .unwrap()
                .push((account_id.to_string(), type_name.to_string(), updated, destroyed));
        }
        fn source_did_commit_create(&mut self, _: &str, _: &str, _: HashMap<String, Value>) {}
        fn source_did_commit_update(&mut self, _: &str, _: &str, _: Vec<String>) {}
        fn source_did_commit_destroy(&mut self, _: &str, _: &str, _: Vec<String>) {}
        fn source_did_not_create(&mut self, _: &str, _: &str, _: HashMap<String, Value>, _: bool) {}
        fn source_did_not_update(&mut self, _: &str, _: &str, _: HashMap<String, Value>, _: bool) {}
        fn source_did_not_destroy(&mut self, _: &str, _: &str, _: HashMap<String, Value>, _: bool) {}
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

    struct FakeAuth {
        max_calls_in_request: u64,
        session_state: State,
        will_send: bool,
        failed_calls: Rc<RefCell<Vec<Option<u64>>>>,
    }

    impl Auth for FakeAuth {
        fn connection_will_send(&self) -> bool {
            self.will_send
        }
        fn connection_succeeded(&mut self) {}
        fn connection_failed(&mut self, backoff_secs: Option<u64>) {
            self.failed_calls.borrow_mut().push(backoff_secs);
        }
        fn did_lose_authentication(&mut self) {}
        fn fetch_session(&mut self) {}
        fn access_token(&self) -> Option<String> {
            Some("token".to_string())
        }
        fn api_url(&self) -> String {
            "https://example.com/api".to_string()
        }
        fn capabilities(&self) -> CoreCapabilities {
            CoreCapabilities {
                max_calls_in_request: self.max_calls_in_request,
            }
        }
        fn session_state(&self) -> State {
            self.session_state.clone()
        }
    }

    /// A transport that replays pre-scripted responses, one per `send`
    /// call, and records the batches it was asked to send.
    struct ScriptedTransport {
        responses: RefCell<Vec<crate::wire::BatchResponse>>,
        sent_batches: RefCell<Vec<BatchRequest>>,
    }

    impl Transport for ScriptedTransport {
        fn send(
            &self,
            _api_url: &str,
            _access_token: Option<&str>,
            request: &BatchRequest,
            _timeout: Duration,
            _timeout_after_upload: Duration,
        ) -> transport::Result<crate::wire::BatchResponse> {
            self.sent_batches.borrow_mut().push(request.clone());
            Ok(self.responses.borrow_mut().remove(0))
        }
    }

    fn fake_auth() -> FakeAuth {
        FakeAuth {
            max_calls_in_request: 100,
            session_state: State("s0".to_string()),
            will_send: true,
            failed_calls: Rc::new(RefCell::new(Vec::new())),
        }
    }

    #[test]
    fn single_fetch_batches_one_call() {
        let store = FakeStore::default();
        let transport = ScriptedTransport {
            responses: RefCell::new(vec![crate::wire::BatchResponse {
                method_responses: vec![MethodResponse {
                    name: "Email/get".to_string(),
                    arguments: json!({"list": [{"id": "m7"}], "state": "s1"}),
                    client_tag: ClientTag::from_index(0),
                }],
                session_state: "s0".to_string(),
                created_ids: None,
            }]),
            sent_batches: RefCell::new(Vec::new()),
        };
        let mut conn = Connection::new(
            store.clone(),
            fake_auth(),
            transport,
            ConnectionConfig::default(),
            vec!["urn:ietf:params:jmap:mail".to_string()],
        );

        conn.fetch_record(
            "A1",
            "Email",
            FetchTarget::Ids(std::collections::HashSet::from([Id("m7".to_string())])),
        );
        conn.flush().unwrap();

        assert_eq!(conn.transport.sent_batches.borrow().len(), 1);
        assert_eq!(store.fetched.lock().unwrap()[0].3, "s1");
    }

    #[test]
    fn pagination_keeps_back_reference_chain_together() {
        // spec §8 scenario 4: maxCallsInRequest = 2, three calls where call
        // 2 references call 1 which references call 0.
        let calls = vec![
            MethodCall {
                name: "Email/get".to_string(),
                arguments: json!({"ids": ["m7"]}),
                client_tag: ClientTag::from_index(0),
            },
            MethodCall {
                name: "Thread/get".to_string(),
                arguments: json!({"#ids": {"resultOf": "0", "name": "Email/get", "path": "/list/*/threadId"}}),
                client_tag: ClientTag::from_index(1),
            },
            MethodCall {
                name: "Email/get".to_string(),
                arguments: json!({"#ids": {"resultOf": "1", "name": "Thread/get", "path": "/list/*/emailIds"}}),
                client_tag: ClientTag::from_index(2),
            },
        ];
        assert_eq!(page_end(&calls, 0, 2), 1);
        assert_eq!(page_end(&calls, 1, 2), 3);
    }

    #[test]
    fn callback_ordering_runs_after_store_mutation_in_append_order() {
        let store = FakeStore::default();
        let transport = ScriptedTransport {
            responses: RefCell::new(vec![crate::wire::BatchResponse {
                method_responses: vec![
                    MethodResponse {
                        name: "Email/get".to_string(),
                        arguments: json!({"list": [], "state": "s1"}),
                        client_tag: ClientTag::from_index(0),
                    },
                    MethodResponse {
                        name: "Thread/get".to_string(),
                        arguments: json!({"list": [], "state": "s1"}),
                        client_tag: ClientTag::from_index(1),
                    },
                ],
                session_state: "s0".to_string(),
                created_ids: None,
            }]),
            sent_batches: RefCell::new(Vec::new()),
        };

        let order = Rc::new(RefCell::new(Vec::new()));
        let order1 = order.clone();
        let order2 = order.clone();

        let mut conn = Connection::new(
            store,
            fake_auth(),
            transport,
            ConnectionConfig::default(),
            vec![],
        );
        let tag0 = conn.call_method("Email/get", json!({}), Some(Box::new(move |_, _, _| order1.borrow_mut().push(0))));
        let tag1 = conn.call_method("Thread/get", json!({}), Some(Box::new(move |_, _, _| order2.borrow_mut().push(1))));
        assert_eq!(tag0.0, "0");
        assert_eq!(tag1.0, "1");

        conn.flush().unwrap();
        assert_eq!(*order.borrow(), vec![0, 1]);
    }

    #[test]
    fn cannot_calculate_changes_forces_resync() {
        // spec §8 scenario 5
        let store = FakeStore::default();
        let transport = ScriptedTransport {
            responses: RefCell::new(vec![crate::wire::BatchResponse {
                method_responses: vec![MethodResponse {
                    name: "error".to_string(),
                    arguments: json!({"type": "cannotCalculateChanges"}),
                    client_tag: ClientTag::from_index(0),
                }],
                session_state: "s0".to_string(),
                created_ids: None,
            }]),
            sent_batches: RefCell::new(Vec::new()),
        };
        let mut conn = Connection::new(
            store.clone(),
            fake_auth(),
            transport,
            ConnectionConfig::default(),
            vec![],
        );
        conn.refresh_record("A1", "Message", State("s1".to_string()));
        conn.flush().unwrap();

        let updates = store.fetched_updates.lock().unwrap();
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].0, "A1");
        assert_eq!(updates[0].1, "Message");
        assert_eq!(updates[0].2, None);
        assert_eq!(updates[0].3, None);
    }

    /// Readable `warn!`/`debug!` output when running this module's tests
    /// with `--nocapture`, mirroring `mujmap::main`'s own logger setup.
    fn init_test_logging() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    #[test]
    fn retry_idempotence_on_rate_limit_requeues_batch() {
        init_test_logging();
        struct FailingTransport;
        impl Transport for FailingTransport {
            fn send(
                &self,
                _: &str,
                _: Option<&str>,
                _: &BatchRequest,
                _: Duration,
                _: Duration,
            ) -> transport::Result<crate::wire::BatchResponse> {
                Err(transport::Error::Status {
                    status: http::StatusCode::SERVICE_UNAVAILABLE,
                })
            }
        }
        let store = FakeStore::default();
        let auth = fake_auth();
        let failed = auth.failed_calls.clone();
        let mut conn = Connection::new(store, auth, FailingTransport, ConnectionConfig::default(), vec![]);
        conn.call_method("Email/get", json!({}), None);
        conn.flush().unwrap();

        assert_eq!(failed.borrow().len(), 1);
        assert_eq!(failed.borrow()[0], Some(30));
        // The call was requeued, not discarded.
        assert_eq!(conn.queues.send_queue.len(), 1);
    }

    #[test]
    fn repeated_404s_exceed_max_session_refetches_and_surface_an_error() {
        init_test_logging();
        struct NotFoundTransport;
        impl Transport for NotFoundTransport {
            fn send(
                &self,
                _: &str,
                _: Option<&str>,
                _: &BatchRequest,
                _: Duration,
                _: Duration,
            ) -> transport::Result<crate::wire::BatchResponse> {
                Err(transport::Error::Status {
                    status: http::StatusCode::NOT_FOUND,
                })
            }
        }
        let store = FakeStore::default();
        let config = ConnectionConfig {
            max_session_refetches: 2,
            ..ConnectionConfig::default()
        };
        let mut conn = Connection::new(store, fake_auth(), NotFoundTransport, config, vec![]);
        conn.call_method("Email/get", json!({}), None);

        // First two 404s just re-queue and refresh the session.
        conn.flush().unwrap();
        conn.flush().unwrap();
        // The third exceeds the bound.
        match conn.flush() {
            Err(Error::SessionRefetchLoop { limit }) => assert_eq!(limit, 2),
            other => panic!("expected SessionRefetchLoop, got {other:?}"),
        }
    }
}
