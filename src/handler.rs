//! Per-type fetch/refresh/commit/query handlers and named response
//! handlers, per spec §4.3's "Handler registry" paragraph and §9's redesign
//! flag: explicit copy-on-write composition over a shared base map instead
//! of prototype inheritance. The per-method `expect_email_get`/
//! `expect_mailbox_set` free functions in `mujmap::remote` are the
//! precedent for "one handler per method name"; here they are entries in a
//! table instead of separate top-level functions.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;

/// Either a built-in name (`"Foo"` → call the Connection's own
/// `fetch_type`/`refresh_type`/`commit_type` helpers) or a user function
/// called with `(accountId, ids, state)`.
#[derive(Clone)]
pub enum RecordHandler {
    BuiltIn,
    Function(Arc<dyn Fn(&str, Option<&[String]>, Option<&str>) -> Value + Send + Sync>),
}

#[derive(Clone, Default)]
pub struct HandlerSet {
    pub fetch: Option<RecordHandler>,
    pub refresh: Option<RecordHandler>,
    pub commit: Option<RecordHandler>,
    pub query: Option<RecordHandler>,
    /// Registration order among types with the same handler kind; lower
    /// sorts first, per spec §4.3 step 2 ("within each the order of
    /// registration").
    pub precedence: i64,
}

pub type ResponseHandler = Arc<dyn Fn(&Value, &str, &Value) + Send + Sync>;

/// Layered handler storage. `base` is shared (e.g. process-wide defaults);
/// `own` starts empty and is populated lazily on first write, so mutating
/// one `Connection`'s registry never leaks into a sibling built from the
/// same base, and an unregistered type still falls back to `base`.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    base: Option<Arc<HandlerRegistry>>,
    types: HashMap<String, HandlerSet>,
    responses: HashMap<String, ResponseHandler>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A fresh registry layered on top of `base`: reads fall through to
    /// `base` for anything not overridden here; writes only ever touch this
    /// registry's own maps.
    pub fn layered_on(base: Arc<HandlerRegistry>) -> Self {
        Self {
            base: Some(base),
            types: HashMap::new(),
            responses: HashMap::new(),
        }
    }

    /// Register (or merge into) the handler set for `type_name`, and any
    /// other response handlers supplied alongside it.
    pub fn handle_type(&mut self, type_name: impl Into<String>, handlers: HandlerSet) {
        let type_name = type_name.into();
        match self.types.get_mut(&type_name) {
            Some(existing) => merge_handler_set(existing, handlers),
            None => {
                let mut merged = self.base_type_handlers(&type_name);
                merge_handler_set(&mut merged, handlers);
                self.types.insert(type_name, merged);
            }
        }
    }

    pub fn handle_response(&mut self, name: impl Into<String>, handler: ResponseHandler) {
        self.responses.insert(name.into(), handler);
    }

    fn base_type_handlers(&self, type_name: &str) -> HandlerSet {
        self.base
            .as_ref()
            .and_then(|base| base.type_handlers(type_name))
            .cloned()
            .unwrap_or_default()
    }

    pub fn type_handlers(&self, type_name: &str) -> Option<&HandlerSet> {
        self.types
            .get(type_name)
            .or_else(|| self.base.as_ref().and_then(|base| base.type_handlers(type_name)))
    }

    pub fn response_handler(&self, name: &str) -> Option<&ResponseHandler> {
        self.responses
            .get(name)
            .or_else(|| self.base.as_ref().and_then(|base| base.response_handler(name)))
    }

    /// All type names that have a handler of `kind`, `base` first then
    /// `own` overrides, each group sorted by `precedence` then name,
    /// deduplicated so an override doesn't appear twice.
    pub fn types_with(&self, kind: impl Fn(&HandlerSet) -> bool) -> Vec<String> {
        let mut seen = std::collections::HashSet::new();
        let mut names: Vec<(i64, String)> = Vec::new();
        let mut collect = |registry: &HandlerRegistry| {
            for (name, set) in &registry.types {
                if kind(set) && seen.insert(name.clone()) {
                    names.push((set.precedence, name.clone()));
                }
            }
        };
        if let Some(base) = &self.base {
            collect(base);
        }
        collect(self);
        names.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.cmp(&b.1)));
        names.into_iter().map(|(_, name)| name).collect()
    }
}

fn merge_handler_set(existing: &mut HandlerSet, incoming: HandlerSet) {
    if incoming.fetch.is_some() {
        existing.fetch = incoming.fetch;
    }
    if incoming.refresh.is_some() {
        existing.refresh = incoming.refresh;
    }
    if incoming.commit.is_some() {
        existing.commit = incoming.commit;
    }
    if incoming.query.is_some() {
        existing.query = incoming.query;
    }
    if incoming.precedence != 0 {
        existing.precedence = incoming.precedence;
    }
}
