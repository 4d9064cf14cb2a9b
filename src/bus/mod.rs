//! Event bus for decoupled publish/subscribe between services.
//!
//! Topic-based fan-out inside one process:
//!   - **Listeners**: per-topic callbacks, optionally throttled and/or debounced
//!   - **Middleware**: before/after observers run on every emission
//!   - **Error isolation**: a failing listener never reaches the emitter; the
//!     failure is re-published on [`SYSTEM_ERROR`]
//!
//! Delivery is synchronous by default: `emit` returns after every listener
//! ran, in registration order, against a snapshot taken at emit time.
//! Detached emission schedules each listener on the tokio runtime instead.
//!
//! No lock is held while user callbacks run, so listeners may emit, subscribe
//! and unsubscribe freely. Nested emission depth is bounded per thread.

mod rate_limit;

pub use rate_limit::ListenOptions;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::cell::Cell;
use std::collections::HashMap;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::runtime::Handle;
use tokio::time::Instant;

use crate::subscription::Unsubscribe;
use crate::types::{BusConfig, Error, HandlerResult, ListenerId, Result};
use crate::value::Value;
use rate_limit::{Debounce, Throttle};

/// Reserved topic carrying `{originalEvent, error, data}` for every caught
/// listener failure.
pub const SYSTEM_ERROR: &str = "system:error";

/// Listener callback.
pub type Listener = Arc<dyn Fn(&Value) -> HandlerResult + Send + Sync>;

/// Middleware callback, receives the topic and the payload.
pub type Middleware = Arc<dyn Fn(&str, &Value) -> HandlerResult + Send + Sync>;

/// When a middleware runs relative to listener delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MiddlewarePhase {
    Before,
    After,
}

/// Per-emission options.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EmitOptions {
    /// Schedule each listener independently on the async runtime; the
    /// emitter does not wait and no ordering is guaranteed.
    pub detached: bool,
}

impl EmitOptions {
    pub fn detached() -> Self {
        Self { detached: true }
    }
}

/// Statistics about bus usage.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct BusStats {
    pub events_emitted: u64,
    pub deliveries: u64,
    pub listener_errors: u64,
    pub middleware_errors: u64,
    pub recursion_drops: u64,
    pub active_listeners: usize,
    pub topics: usize,
}

thread_local! {
    static EMIT_DEPTH: Cell<usize> = const { Cell::new(0) };
    static REPORTING_FAILURE: Cell<bool> = const { Cell::new(false) };
}

/// Tracks nested `emit` calls on the current thread.
struct DepthGuard;

impl DepthGuard {
    fn enter(limit: usize) -> Option<Self> {
        EMIT_DEPTH.with(|depth| {
            if depth.get() >= limit {
                None
            } else {
                depth.set(depth.get() + 1);
                Some(DepthGuard)
            }
        })
    }
}

impl Drop for DepthGuard {
    fn drop(&mut self) {
        EMIT_DEPTH.with(|depth| depth.set(depth.get().saturating_sub(1)));
    }
}

/// The effective callback registered against a topic.
struct Delivery {
    id: ListenerId,
    topic: String,
    callback: Listener,
    throttle: Option<Throttle>,
    debounce: Option<Debounce>,
    active: AtomicBool,
}

impl Delivery {
    fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    fn deactivate(&self) {
        self.active.store(false, Ordering::Release);
        if let Some(debounce) = &self.debounce {
            debounce.cancel();
        }
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("id", &self.id)
            .field("topic", &self.topic)
            .field("throttle", &self.throttle)
            .field("debounce", &self.debounce)
            .field("active", &self.is_active())
            .finish()
    }
}

/// Run a user callback, turning both errors and panics into a message.
pub(crate) fn call_guarded(f: impl FnOnce() -> HandlerResult) -> std::result::Result<(), String> {
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(Ok(())) => Ok(()),
        Ok(Err(err)) => Err(err.to_string()),
        Err(panic) => Err(panic
            .downcast_ref::<&str>()
            .map(|s| (*s).to_string())
            .or_else(|| panic.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "listener panicked".to_string())),
    }
}

// =============================================================================
// EventBus
// =============================================================================

/// In-process topic bus shared by the store and every service.
pub struct EventBus {
    self_ref: Weak<EventBus>,
    config: BusConfig,
    /// Topic -> effective callbacks in registration order. Never holds an
    /// empty list.
    topics: Mutex<HashMap<String, Vec<Arc<Delivery>>>>,
    before: Mutex<Vec<Middleware>>,
    after: Mutex<Vec<Middleware>>,
    stats: Mutex<BusStats>,
}

impl EventBus {
    /// Create a bus. The bus is always shared behind an `Arc`.
    pub fn new(config: BusConfig) -> Arc<Self> {
        Arc::new_cyclic(|self_ref| Self {
            self_ref: self_ref.clone(),
            config,
            topics: Mutex::new(HashMap::new()),
            before: Mutex::new(Vec::new()),
            after: Mutex::new(Vec::new()),
            stats: Mutex::new(BusStats::default()),
        })
    }

    /// Create a bus with default configuration.
    pub fn with_defaults() -> Arc<Self> {
        Self::new(BusConfig::default())
    }

    // =========================================================================
    // Subscription
    // =========================================================================

    /// Subscribe to a topic.
    pub fn on<F>(&self, topic: &str, callback: F) -> Unsubscribe
    where
        F: Fn(&Value) -> HandlerResult + Send + Sync + 'static,
    {
        self.on_with(topic, callback, ListenOptions::default())
    }

    /// Subscribe with throttle and/or debounce. When both are set the
    /// throttle filters calls first and survivors feed the debounce.
    pub fn on_with<F>(&self, topic: &str, callback: F, options: ListenOptions) -> Unsubscribe
    where
        F: Fn(&Value) -> HandlerResult + Send + Sync + 'static,
    {
        self.register(topic, ListenerId::next(), Arc::new(callback), options)
    }

    /// Subscribe for a single delivery. The wrapper removes its own
    /// subscription before running `callback`.
    pub fn once<F>(&self, topic: &str, callback: F) -> Unsubscribe
    where
        F: FnOnce(&Value) -> HandlerResult + Send + 'static,
    {
        let id = ListenerId::next();
        let bus = self.self_ref.clone();
        let owned_topic = topic.to_string();
        let slot = Mutex::new(Some(callback));

        let wrapper = move |data: &Value| -> HandlerResult {
            let Some(callback) = slot.lock().take() else {
                return Ok(());
            };
            if let Some(bus) = bus.upgrade() {
                bus.off(&owned_topic, id);
            }
            callback(data)
        };

        self.register(topic, id, Arc::new(wrapper), ListenOptions::default())
    }

    fn register(
        &self,
        topic: &str,
        id: ListenerId,
        callback: Listener,
        options: ListenOptions,
    ) -> Unsubscribe {
        let delivery = Arc::new(Delivery {
            id,
            topic: topic.to_string(),
            callback,
            throttle: options.throttle.map(Throttle::new),
            debounce: options.debounce.map(Debounce::new),
            active: AtomicBool::new(true),
        });

        self.topics
            .lock()
            .entry(topic.to_string())
            .or_default()
            .push(delivery);

        tracing::debug!(
            topic,
            listener = %id,
            throttle_ms = options.throttle.map(|d| d.as_millis() as u64),
            debounce_ms = options.debounce.map(|d| d.as_millis() as u64),
            "listener registered"
        );

        let bus = self.self_ref.clone();
        let owned_topic = topic.to_string();
        Unsubscribe::new(id, topic, move || {
            let bus = bus
                .upgrade()
                .ok_or_else(|| Error::internal("event bus dropped before unsubscribe"))?;
            bus.off(&owned_topic, id);
            Ok(())
        })
    }

    /// Remove one effective subscription. Returns whether it was registered.
    ///
    /// Takes effect immediately: a listener removed while an emission is in
    /// flight is skipped for the rest of that emission.
    pub fn off(&self, topic: &str, id: ListenerId) -> bool {
        let mut topics = self.topics.lock();
        let Some(list) = topics.get_mut(topic) else {
            return false;
        };
        let Some(pos) = list.iter().position(|d| d.id == id) else {
            return false;
        };

        let removed = list.remove(pos);
        removed.deactivate();
        if list.is_empty() {
            topics.remove(topic);
        }

        tracing::debug!(topic, listener = %id, "listener removed");
        true
    }

    /// Remove every listener of `topic`, or of all topics when `None`.
    pub fn remove_all(&self, topic: Option<&str>) -> usize {
        let mut topics = self.topics.lock();
        let removed: Vec<Arc<Delivery>> = match topic {
            Some(t) => topics.remove(t).unwrap_or_default(),
            None => topics.drain().flat_map(|(_, list)| list).collect(),
        };
        for delivery in &removed {
            delivery.deactivate();
        }
        removed.len()
    }

    /// Register a before/after observer. Middleware failures are logged and
    /// swallowed.
    pub fn use_middleware<F>(&self, phase: MiddlewarePhase, middleware: F)
    where
        F: Fn(&str, &Value) -> HandlerResult + Send + Sync + 'static,
    {
        let chain = match phase {
            MiddlewarePhase::Before => &self.before,
            MiddlewarePhase::After => &self.after,
        };
        chain.lock().push(Arc::new(middleware));
    }

    // =========================================================================
    // Emission
    // =========================================================================

    /// Emit synchronously. Returns the number of listeners the event was
    /// dispatched to.
    pub fn emit(&self, topic: &str, data: impl Into<Value>) -> Result<usize> {
        self.emit_with(topic, data, EmitOptions::default())
    }

    /// Emit with explicit options.
    pub fn emit_with(
        &self,
        topic: &str,
        data: impl Into<Value>,
        options: EmitOptions,
    ) -> Result<usize> {
        let data = data.into();

        let Some(_depth) = DepthGuard::enter(self.config.max_emit_depth) else {
            self.stats.lock().recursion_drops += 1;
            tracing::warn!(
                topic,
                limit = self.config.max_emit_depth,
                "emit depth limit reached, event dropped"
            );
            return Err(Error::RecursionLimit {
                topic: topic.to_string(),
                limit: self.config.max_emit_depth,
            });
        };

        self.run_middleware(MiddlewarePhase::Before, topic, &data);

        // Snapshot: listeners added during this emission are not reached.
        let snapshot: Vec<Arc<Delivery>> =
            self.topics.lock().get(topic).cloned().unwrap_or_default();

        let dispatched = if options.detached {
            self.dispatch_detached(snapshot, &data)
        } else {
            snapshot
                .iter()
                .filter(|delivery| self.dispatch(delivery, &data))
                .count()
        };

        {
            let mut stats = self.stats.lock();
            stats.events_emitted += 1;
            stats.deliveries += dispatched as u64;
        }

        self.run_middleware(MiddlewarePhase::After, topic, &data);

        tracing::debug!(
            topic,
            listeners = dispatched,
            detached = options.detached,
            "event emitted"
        );

        Ok(dispatched)
    }

    /// Apply rate limiting and deliver. Returns false if the delivery was
    /// inactive or throttled away.
    fn dispatch(&self, delivery: &Arc<Delivery>, data: &Value) -> bool {
        if !delivery.is_active() {
            return false;
        }
        if let Some(throttle) = &delivery.throttle {
            if !throttle.admit(Instant::now()) {
                return false;
            }
        }
        if let Some(debounce) = &delivery.debounce {
            self.schedule_debounced(delivery, debounce, data.clone());
            return true;
        }
        self.invoke(delivery, data);
        true
    }

    fn schedule_debounced(&self, delivery: &Arc<Delivery>, debounce: &Debounce, data: Value) {
        let generation = debounce.arm(data);

        match Handle::try_current() {
            Ok(handle) => {
                let bus = self.self_ref.clone();
                let delivery = Arc::clone(delivery);
                let delay = debounce.delay();
                handle.spawn(async move {
                    tokio::time::sleep(delay).await;
                    let Some(bus) = bus.upgrade() else {
                        return;
                    };
                    let pending = delivery
                        .debounce
                        .as_ref()
                        .and_then(|debounce| debounce.fire(generation));
                    if let Some(data) = pending {
                        bus.invoke(&delivery, &data);
                    }
                });
            }
            Err(_) => {
                tracing::warn!(
                    topic = %delivery.topic,
                    listener = %delivery.id,
                    "no async runtime for debounce timer, delivering inline"
                );
                if let Some(data) = debounce.fire(generation) {
                    self.invoke(delivery, &data);
                }
            }
        }
    }

    fn dispatch_detached(&self, snapshot: Vec<Arc<Delivery>>, data: &Value) -> usize {
        let handle = match Handle::try_current() {
            Ok(handle) => handle,
            Err(_) => {
                tracing::warn!("no async runtime for detached emit, delivering inline");
                return snapshot
                    .iter()
                    .filter(|delivery| self.dispatch(delivery, data))
                    .count();
            }
        };

        let data = Arc::new(data.clone());
        let mut scheduled = 0;
        for delivery in snapshot {
            if !delivery.is_active() {
                continue;
            }
            let bus = self.self_ref.clone();
            let data = Arc::clone(&data);
            handle.spawn(async move {
                if let Some(bus) = bus.upgrade() {
                    bus.dispatch(&delivery, &data);
                }
            });
            scheduled += 1;
        }
        scheduled
    }

    fn invoke(&self, delivery: &Delivery, data: &Value) {
        // Re-checked here: debounced and detached deliveries fire later.
        if !delivery.is_active() {
            return;
        }
        if let Err(message) = call_guarded(|| (delivery.callback)(data)) {
            self.report_failure(&delivery.topic, message, data);
        }
    }

    fn run_middleware(&self, phase: MiddlewarePhase, topic: &str, data: &Value) {
        let chain: Vec<Middleware> = match phase {
            MiddlewarePhase::Before => self.before.lock().clone(),
            MiddlewarePhase::After => self.after.lock().clone(),
        };
        for middleware in chain {
            if let Err(message) = call_guarded(|| middleware(topic, data)) {
                self.stats.lock().middleware_errors += 1;
                tracing::warn!(topic, ?phase, error = %message, "middleware failed");
            }
        }
    }

    /// Publish a caught failure on [`SYSTEM_ERROR`].
    ///
    /// Failures raised while a system error is being delivered are logged
    /// only, so a faulty error listener cannot recurse.
    pub(crate) fn report_failure(&self, origin: &str, message: String, data: &Value) {
        self.stats.lock().listener_errors += 1;

        let nested = REPORTING_FAILURE.with(Cell::get);
        if origin == SYSTEM_ERROR || nested {
            tracing::error!(
                origin,
                error = %message,
                "failure while handling a system error, not re-raised"
            );
            return;
        }

        tracing::warn!(origin, error = %message, "listener failed");

        let failure = Error::subscriber(origin, message);
        let payload = Value::from_pairs([
            ("originalEvent", Value::from(origin)),
            ("error", Value::from(failure.to_string())),
            ("data", data.clone()),
        ]);

        REPORTING_FAILURE.with(|flag| flag.set(true));
        let result = self.emit(SYSTEM_ERROR, payload);
        REPORTING_FAILURE.with(|flag| flag.set(false));

        if let Err(err) = result {
            tracing::error!(origin, error = %err, "could not publish system error");
        }
    }

    // =========================================================================
    // Introspection
    // =========================================================================

    pub fn listener_count(&self, topic: &str) -> usize {
        self.topics.lock().get(topic).map_or(0, Vec::len)
    }

    pub fn has_listeners(&self, topic: &str) -> bool {
        self.listener_count(topic) > 0
    }

    /// Topics with at least one listener, sorted.
    pub fn topics(&self) -> Vec<String> {
        let mut names: Vec<String> = self.topics.lock().keys().cloned().collect();
        names.sort();
        names
    }

    /// Get current bus statistics.
    pub fn stats(&self) -> BusStats {
        let (active_listeners, topics) = {
            let topics = self.topics.lock();
            (topics.values().map(Vec::len).sum(), topics.len())
        };
        let mut stats = self.stats.lock().clone();
        stats.active_listeners = active_listeners;
        stats.topics = topics;
        stats
    }

    /// Reset statistics counters.
    pub fn reset_stats(&self) {
        *self.stats.lock() = BusStats::default();
    }
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus")
            .field("config", &self.config)
            .field("topics", &self.topics())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
