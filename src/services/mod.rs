//! Service contract and lifecycle.
//!
//! A service owns a [`ServiceBase`]: shared references to the store and the
//! bus plus the unsubscribe handles it accumulated. Everything a service
//! subscribes to through its base is removed when it is destroyed.

pub mod lifecycle;
mod registry;

pub use lifecycle::{
    LifecycleManager, ServiceContext, ServiceOptions, ServiceStatus, SERVICES_READY,
    SERVICES_SHUTDOWN, SERVICE_FAILED, SERVICE_STARTED, SERVICE_STOPPED,
};

use async_trait::async_trait;
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;

use crate::bus::{EventBus, ListenOptions};
use crate::state::{StateChange, StateStore};
use crate::subscription::Unsubscribe;
use crate::types::{HandlerResult, ListenerId, Result};
use crate::validation::Rules;
use crate::value::Value;

/// A unit of application behavior started by the [`LifecycleManager`].
#[async_trait]
pub trait Service: Send + Sync + 'static {
    /// Shared store/bus references and the cleanup list.
    fn base(&self) -> &ServiceBase;

    /// Called once after construction, bounded by the init timeout.
    async fn initialize(&self) -> HandlerResult {
        Ok(())
    }

    /// Release everything the service holds. The default drains the base's
    /// subscriptions; overrides should do the same.
    async fn destroy(&self) -> HandlerResult {
        self.base().destroy();
        Ok(())
    }
}

/// Store/bus access with automatic subscription cleanup.
pub struct ServiceBase {
    store: Arc<StateStore>,
    bus: Arc<EventBus>,
    cleanup: Mutex<Vec<Unsubscribe>>,
}

impl ServiceBase {
    pub fn new(store: Arc<StateStore>, bus: Arc<EventBus>) -> Self {
        Self {
            store,
            bus,
            cleanup: Mutex::new(Vec::new()),
        }
    }

    pub fn store(&self) -> &Arc<StateStore> {
        &self.store
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    /// Watch a state path until the service is destroyed.
    pub fn subscribe_to_state<F>(&self, path: &str, callback: F) -> ListenerId
    where
        F: Fn(&StateChange) -> HandlerResult + Send + Sync + 'static,
    {
        let handle = self.store.subscribe(path, callback);
        let id = handle.id();
        self.cleanup.lock().push(handle);
        id
    }

    /// Listen on a bus topic until the service is destroyed.
    pub fn subscribe_to_event<F>(
        &self,
        topic: &str,
        callback: F,
        options: ListenOptions,
    ) -> ListenerId
    where
        F: Fn(&Value) -> HandlerResult + Send + Sync + 'static,
    {
        let handle = self.bus.on_with(topic, callback, options);
        let id = handle.id();
        self.cleanup.lock().push(handle);
        id
    }

    /// Number of subscriptions still owned.
    pub fn subscription_count(&self) -> usize {
        self.cleanup.lock().len()
    }

    /// Unsubscribe everything. A failing handle is logged and the rest are
    /// still released. Returns how many handles were released cleanly.
    pub fn destroy(&self) -> usize {
        let handles: Vec<_> = self.cleanup.lock().drain(..).collect();
        let total = handles.len();
        let mut released = 0;
        for handle in handles {
            let bound_to = handle.target().to_string();
            match handle.unsubscribe() {
                Ok(()) => released += 1,
                Err(err) => tracing::warn!(subscription = %bound_to, error = %err, "unsubscribe failed"),
            }
        }
        tracing::debug!(released, total, "service subscriptions released");
        released
    }

    /// Check `data` against field rules, failing on the first violation.
    pub fn validate(&self, data: &Value, rules: &Rules) -> Result<()> {
        rules.check(data)
    }
}

impl fmt::Debug for ServiceBase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceBase")
            .field("subscriptions", &self.subscription_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::StoreConfig;
    use crate::validation;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn base() -> ServiceBase {
        let bus = EventBus::with_defaults();
        let store =
            StateStore::new(Arc::clone(&bus), Value::record(), StoreConfig::default()).unwrap();
        ServiceBase::new(store, bus)
    }

    #[test]
    fn test_destroy_releases_all_subscriptions() {
        let base = base();
        let hits = Arc::new(AtomicUsize::new(0));

        let h = Arc::clone(&hits);
        base.subscribe_to_state("ui.view", move |_| {
            h.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        let h = Arc::clone(&hits);
        base.subscribe_to_event(
            "track:selected",
            move |_| {
                h.fetch_add(1, Ordering::SeqCst);
                Ok(())
            },
            ListenOptions::default(),
        );
        assert_eq!(base.subscription_count(), 2);

        base.store().set("ui.view", "list").unwrap();
        base.bus().emit("track:selected", Value::Null).unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 2);

        assert_eq!(base.destroy(), 2);
        base.store().set("ui.view", "grid").unwrap();
        base.bus().emit("track:selected", Value::Null).unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 2);
        assert!(!base.bus().has_listeners("track:selected"));
    }

    #[test]
    fn test_destroy_tolerates_failed_handles() {
        let base = base();
        base.subscribe_to_state("a", |_| Ok(()));

        // A handle whose bus is already gone cannot detach.
        let other = EventBus::with_defaults();
        base.cleanup.lock().push(other.on("b", |_| Ok(())));
        drop(other);

        assert_eq!(base.destroy(), 1);
        assert_eq!(base.subscription_count(), 0);
    }

    #[test]
    fn test_default_destroy_drains_base() {
        struct Plain {
            base: ServiceBase,
        }

        #[async_trait]
        impl Service for Plain {
            fn base(&self) -> &ServiceBase {
                &self.base
            }
        }

        let service = Plain { base: base() };
        service.base().subscribe_to_event("x", |_| Ok(()), ListenOptions::default());

        tokio_test::block_on(service.initialize()).unwrap();
        tokio_test::block_on(service.destroy()).unwrap();
        assert_eq!(service.base().subscription_count(), 0);
        assert!(!service.base().bus().has_listeners("x"));
    }

    #[test]
    fn test_validate_reports_field() {
        let base = base();
        let rules = validation::Rules::new()
            .field("name", validation::non_empty_string())
            .field("tracks", validation::is_list());

        let err = base
            .validate(&Value::from_pairs([("name", "Road trip")]), &rules)
            .unwrap_err();
        assert!(err.to_string().contains("'tracks'"));
    }
}
