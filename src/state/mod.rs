//! Reactive state store.
//!
//! One hierarchical document addressed by dot paths. Every applied write
//! notifies, in this order:
//!   1. watchers registered on exactly that path,
//!   2. [`STATE_CHANGED`] on the bus with `{path, newValue, oldValue, timestamp}`,
//!   3. the derived topic (`ui.zoom` -> `state:ui:zoom`) with `{value, oldValue, path}`.
//!
//! Writes are validated against per-path predicates, skipped when the value
//! is unchanged (unless forced) and recorded in a bounded history for
//! [`StateStore::undo`]. [`StateStore::transaction`] is all-or-nothing.

mod history;
pub(crate) mod path;
pub mod schema;

pub use history::ChangeRecord;
pub use path::derived_topic;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use crate::bus::{call_guarded, EventBus};
use crate::subscription::Unsubscribe;
use crate::types::{Error, HandlerResult, ListenerId, Result, StoreConfig};
use crate::value::Value;
use history::History;

/// Bus topic carrying every applied change.
pub const STATE_CHANGED: &str = "state:changed";

/// Bus topic emitted (with a null payload) after a full reset.
pub const STATE_RESET: &str = "state:reset";

/// Path-scoped change callback.
pub type Watcher = Arc<dyn Fn(&StateChange) -> HandlerResult + Send + Sync>;

/// Predicate a value must satisfy to be written at a path.
pub type Validator = Arc<dyn Fn(&Value) -> bool + Send + Sync>;

/// What a watcher receives. `None` marks an absent value.
#[derive(Debug, Clone, PartialEq)]
pub struct StateChange {
    pub path: String,
    pub value: Option<Value>,
    pub old_value: Option<Value>,
    pub timestamp: DateTime<Utc>,
}

/// Per-write options.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SetOptions {
    /// Write and notify even when the value is unchanged.
    pub force: bool,
}

impl SetOptions {
    pub fn forced() -> Self {
        Self { force: true }
    }
}

/// One write inside a [`StateStore::transaction`].
#[derive(Debug, Clone)]
pub struct Update {
    pub path: String,
    pub value: Value,
    pub options: SetOptions,
}

impl Update {
    pub fn new(path: impl Into<String>, value: impl Into<Value>) -> Self {
        Self {
            path: path.into(),
            value: value.into(),
            options: SetOptions::default(),
        }
    }

    pub fn forced(path: impl Into<String>, value: impl Into<Value>) -> Self {
        Self {
            options: SetOptions::forced(),
            ..Self::new(path, value)
        }
    }
}

/// An applied write waiting to be notified.
#[derive(Debug, Clone)]
struct Change {
    path: String,
    old: Option<Value>,
    new: Option<Value>,
    forced: bool,
}

impl Change {
    fn to_record(&self) -> ChangeRecord {
        ChangeRecord {
            path: self.path.clone(),
            old_value: self.old.clone(),
            new_value: self.new.clone(),
            timestamp: Utc::now(),
        }
    }
}

struct WatcherEntry {
    id: ListenerId,
    callback: Watcher,
    active: AtomicBool,
}

impl WatcherEntry {
    fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }
}

struct Inner {
    document: Value,
    initial: Value,
    validators: BTreeMap<String, Validator>,
    history: History,
}

// =============================================================================
// Staging
// =============================================================================

/// Apply one write to `doc`. Returns `None` when nothing changed.
///
/// Validation runs before the write, so a rejected value leaves `doc`
/// untouched. Removals (`next == None`) are not validated.
fn stage(
    doc: &mut Value,
    validators: &BTreeMap<String, Validator>,
    path: &str,
    segments: &[&str],
    next: Option<Value>,
    force: bool,
) -> Result<Option<Change>> {
    if !force && path::lookup(doc, segments) == next.as_ref() {
        return Ok(None);
    }

    let old = match next.clone() {
        Some(value) => {
            check_validators(doc, validators, segments, &value)?;
            path::write(doc, segments, value)?
        }
        None => path::remove(doc, segments),
    };

    Ok(Some(Change {
        path: path.to_string(),
        old,
        new: next,
        forced: force,
    }))
}

/// Run every validator whose path overlaps the written one.
///
/// Validators on the path itself or below it see the matching part of the
/// new value (absent parts are not checked). Validators above it see their
/// subtree as it would look after the write.
fn check_validators(
    doc: &Value,
    validators: &BTreeMap<String, Validator>,
    segments: &[&str],
    value: &Value,
) -> Result<()> {
    for (guarded, validator) in validators {
        let guarded_segments: Vec<&str> = guarded.split('.').collect();

        let accepted = if guarded_segments.starts_with(segments) {
            path::lookup(value, &guarded_segments[segments.len()..])
                .map_or(true, |v| validator(v))
        } else if segments.starts_with(&guarded_segments) {
            let mut subtree = path::lookup(doc, &guarded_segments)
                .cloned()
                .unwrap_or_else(Value::record);
            path::write(
                &mut subtree,
                &segments[guarded_segments.len()..],
                value.clone(),
            )?;
            validator(&subtree)
        } else {
            true
        };

        if !accepted {
            return Err(Error::validation(format!(
                "value for '{}' rejected by validator on '{guarded}'",
                segments.join(".")
            )));
        }
    }
    Ok(())
}

// =============================================================================
// StateStore
// =============================================================================

/// Hierarchical application state shared by every service.
pub struct StateStore {
    self_ref: Weak<StateStore>,
    bus: Arc<EventBus>,
    inner: Mutex<Inner>,
    /// Exact path -> watchers in registration order.
    watchers: Mutex<HashMap<String, Vec<Arc<WatcherEntry>>>>,
}

impl StateStore {
    /// Create a store over `initial`, which must be a record. `initial` is
    /// also what [`StateStore::reset`] restores.
    pub fn new(bus: Arc<EventBus>, initial: Value, config: StoreConfig) -> Result<Arc<Self>> {
        if initial.as_record().is_none() {
            return Err(Error::validation(format!(
                "state document must be a record, got {}",
                initial.type_name()
            )));
        }

        Ok(Arc::new_cyclic(|self_ref| Self {
            self_ref: self_ref.clone(),
            bus,
            inner: Mutex::new(Inner {
                document: initial.clone(),
                initial,
                validators: BTreeMap::new(),
                history: History::new(config.max_history),
            }),
            watchers: Mutex::new(HashMap::new()),
        }))
    }

    /// Create a store holding the music browser's default document and
    /// validators.
    pub fn with_schema(bus: Arc<EventBus>, config: StoreConfig) -> Arc<Self> {
        let validators = schema::default_validators()
            .into_iter()
            .map(|(p, v)| (p.to_string(), v))
            .collect();
        let initial = schema::default_document();

        Arc::new_cyclic(|self_ref| Self {
            self_ref: self_ref.clone(),
            bus,
            inner: Mutex::new(Inner {
                document: initial.clone(),
                initial,
                validators,
                history: History::new(config.max_history),
            }),
            watchers: Mutex::new(HashMap::new()),
        })
    }

    /// The bus this store echoes changes on.
    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    // =========================================================================
    // Reads
    // =========================================================================

    /// Value at `path`, or `None` if any segment is missing or the path is
    /// malformed. The empty path returns the whole document.
    pub fn get(&self, path: &str) -> Option<Value> {
        let segments = path::split(path).ok()?;
        let inner = self.inner.lock();
        path::lookup(&inner.document, &segments).cloned()
    }

    pub fn has_path(&self, path: &str) -> bool {
        path::split(path)
            .map(|segments| path::lookup(&self.inner.lock().document, &segments).is_some())
            .unwrap_or(false)
    }

    /// Deep copy of the whole document.
    pub fn snapshot(&self) -> Value {
        self.inner.lock().document.clone()
    }

    // =========================================================================
    // Writes
    // =========================================================================

    /// Write `value` at `path`. Returns whether anything changed.
    pub fn set(&self, path: &str, value: impl Into<Value>) -> Result<bool> {
        self.set_with(path, value, SetOptions::default())
    }

    /// Write with options. A rejected write returns a validation error and
    /// leaves the document untouched.
    pub fn set_with(&self, path: &str, value: impl Into<Value>, options: SetOptions) -> Result<bool> {
        self.apply(path, Some(value.into()), options.force)
    }

    /// Validate, write, record history, then notify. Validators run while
    /// the document is locked and must not call back into the store.
    fn apply(&self, path: &str, next: Option<Value>, force: bool) -> Result<bool> {
        let segments = path::split_writable(path)?;

        let change = {
            let mut inner = self.inner.lock();
            let Inner {
                document,
                validators,
                history,
                ..
            } = &mut *inner;
            let Some(change) = stage(document, validators, path, &segments, next, force)? else {
                tracing::trace!(path, "value unchanged, write skipped");
                return Ok(false);
            };
            history.push(change.to_record());
            change
        };

        tracing::debug!(path, forced = force, "state updated");
        self.notify(&change);
        Ok(true)
    }

    /// Apply a batch atomically.
    ///
    /// Writes are staged on a copy of the document. The first failing write
    /// aborts the batch and nothing is committed or notified. On success
    /// each changed path is notified once, after every write landed, with
    /// its first old value and its last new value. Paths whose net value did
    /// not change are not notified unless one of their writes was forced.
    /// Transaction writes are not recorded in history.
    ///
    /// Returns the number of paths notified.
    pub fn transaction(&self, updates: Vec<Update>) -> Result<usize> {
        let changes = {
            let mut inner = self.inner.lock();
            let mut staged = inner.document.clone();
            let mut pending: Vec<Change> = Vec::new();

            for update in updates {
                let segments = path::split_writable(&update.path)?;
                let staged_change = stage(
                    &mut staged,
                    &inner.validators,
                    &update.path,
                    &segments,
                    Some(update.value),
                    update.options.force,
                );
                let change = match staged_change {
                    Ok(Some(change)) => change,
                    Ok(None) => continue,
                    Err(err) => {
                        tracing::warn!(path = %update.path, error = %err, "transaction aborted");
                        return Err(err);
                    }
                };
                match pending.iter_mut().find(|p| p.path == change.path) {
                    Some(existing) => {
                        existing.new = change.new;
                        existing.forced |= change.forced;
                    }
                    None => pending.push(change),
                }
            }

            inner.document = staged;
            pending.retain(|c| c.forced || c.old != c.new);
            pending
        };

        tracing::debug!(paths = changes.len(), "transaction committed");
        for change in &changes {
            self.notify(change);
        }
        Ok(changes.len())
    }

    /// Revert the newest history entry and notify with old and new swapped.
    /// Returns `false` when the history is empty.
    pub fn undo(&self) -> Result<bool> {
        let change = {
            let mut inner = self.inner.lock();
            let Some(record) = inner.history.pop() else {
                return Ok(false);
            };
            let segments = path::split_writable(&record.path)?;
            let Inner {
                document,
                validators,
                history,
                ..
            } = &mut *inner;
            match stage(
                document,
                validators,
                &record.path,
                &segments,
                record.old_value.clone(),
                true,
            ) {
                Ok(change) => change,
                Err(err) => {
                    history.push(record);
                    return Err(err);
                }
            }
        };

        if let Some(change) = change {
            tracing::debug!(path = %change.path, "state change undone");
            self.notify(&change);
        }
        Ok(true)
    }

    /// Restore defaults. `None` restores the whole document, clears history
    /// and emits [`STATE_RESET`]; otherwise each path is written back to its
    /// initial value (or removed if it had none) and notified normally.
    pub fn reset(&self, paths: Option<&[&str]>) -> Result<()> {
        let Some(paths) = paths else {
            {
                let mut inner = self.inner.lock();
                inner.document = inner.initial.clone();
                inner.history.clear();
            }
            tracing::info!("state reset to defaults");
            if let Err(err) = self.bus.emit(STATE_RESET, Value::Null) {
                tracing::warn!(error = %err, "could not emit state reset");
            }
            return Ok(());
        };

        for path in paths {
            let segments = path::split_writable(path)?;
            let initial = path::lookup(&self.inner.lock().initial, &segments).cloned();
            self.apply(path, initial, false)?;
        }
        Ok(())
    }

    /// Constrain `path`. Fails if the current value already violates the
    /// predicate. Replaces any validator previously set on the path.
    pub fn register_validator<F>(&self, path: &str, validator: F) -> Result<()>
    where
        F: Fn(&Value) -> bool + Send + Sync + 'static,
    {
        let segments = path::split_writable(path)?;
        let mut inner = self.inner.lock();
        if let Some(current) = path::lookup(&inner.document, &segments) {
            if !validator(current) {
                return Err(Error::validation(format!(
                    "current value at '{path}' violates the new validator"
                )));
            }
        }
        inner.validators.insert(path.to_string(), Arc::new(validator));
        tracing::debug!(path, "validator registered");
        Ok(())
    }

    // =========================================================================
    // History
    // =========================================================================

    /// Recorded changes, oldest first.
    pub fn history(&self) -> Vec<ChangeRecord> {
        self.inner.lock().history.records()
    }

    pub fn history_len(&self) -> usize {
        self.inner.lock().history.len()
    }

    pub fn clear_history(&self) {
        self.inner.lock().history.clear();
    }

    // =========================================================================
    // Watchers
    // =========================================================================

    /// Watch exactly `path`. Writes to parents or children of `path` do not
    /// trigger the callback.
    pub fn subscribe<F>(&self, path: &str, callback: F) -> Unsubscribe
    where
        F: Fn(&StateChange) -> HandlerResult + Send + Sync + 'static,
    {
        let id = ListenerId::next();
        self.watchers
            .lock()
            .entry(path.to_string())
            .or_default()
            .push(Arc::new(WatcherEntry {
                id,
                callback: Arc::new(callback),
                active: AtomicBool::new(true),
            }));

        tracing::debug!(path, listener = %id, "state watcher registered");

        let store = self.self_ref.clone();
        let owned_path = path.to_string();
        Unsubscribe::new(id, path, move || {
            let store = store
                .upgrade()
                .ok_or_else(|| Error::internal("state store dropped before unsubscribe"))?;
            store.unwatch(&owned_path, id);
            Ok(())
        })
    }

    /// Remove one watcher. Returns whether it was registered.
    pub fn unwatch(&self, path: &str, id: ListenerId) -> bool {
        let mut watchers = self.watchers.lock();
        let Some(list) = watchers.get_mut(path) else {
            return false;
        };
        let Some(pos) = list.iter().position(|w| w.id == id) else {
            return false;
        };
        let removed = list.remove(pos);
        removed.active.store(false, Ordering::Release);
        if list.is_empty() {
            watchers.remove(path);
        }
        true
    }

    pub fn watcher_count(&self, path: &str) -> usize {
        self.watchers.lock().get(path).map_or(0, Vec::len)
    }

    fn notify(&self, change: &Change) {
        let timestamp = Utc::now();
        let topic = path::derived_topic(&change.path);
        let event = StateChange {
            path: change.path.clone(),
            value: change.new.clone(),
            old_value: change.old.clone(),
            timestamp,
        };

        let watchers: Vec<Arc<WatcherEntry>> = self
            .watchers
            .lock()
            .get(&change.path)
            .cloned()
            .unwrap_or_default();
        for watcher in watchers {
            if !watcher.is_active() {
                continue;
            }
            if let Err(message) = call_guarded(|| (watcher.callback)(&event)) {
                let data = Value::from(change.new.clone());
                self.bus.report_failure(&topic, message, &data);
            }
        }

        let generic = Value::from_pairs([
            ("path", Value::from(change.path.as_str())),
            ("newValue", Value::from(change.new.clone())),
            ("oldValue", Value::from(change.old.clone())),
            ("timestamp", Value::Timestamp(timestamp)),
        ]);
        if let Err(err) = self.bus.emit(STATE_CHANGED, generic) {
            tracing::warn!(path = %change.path, error = %err, "could not emit state change");
        }

        let derived = Value::from_pairs([
            ("value", Value::from(change.new.clone())),
            ("oldValue", Value::from(change.old.clone())),
            ("path", Value::from(change.path.as_str())),
        ]);
        if let Err(err) = self.bus.emit(&topic, derived) {
            tracing::warn!(topic = %topic, error = %err, "could not emit derived state topic");
        }
    }
}

impl fmt::Debug for StateStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("StateStore")
            .field("validators", &inner.validators.keys().collect::<Vec<_>>())
            .field("history", &inner.history.len())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
