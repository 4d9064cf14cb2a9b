//! Lifecycle integration tests: ordering, rollback, optional failures, cleanup.

use async_trait::async_trait;
use canopy_core::services::{
    ServiceStatus, SERVICES_READY, SERVICES_SHUTDOWN, SERVICE_FAILED, SERVICE_STARTED,
};
use canopy_core::types::{BoxError, LifecycleConfig, StoreConfig};
use canopy_core::{
    Error, EventBus, HandlerResult, LifecycleManager, ListenOptions, Service, ServiceBase,
    ServiceContext, ServiceOptions, StateStore, Value, SYSTEM_ERROR,
};
use parking_lot::Mutex;
use std::sync::Arc;

type Log = Arc<Mutex<Vec<String>>>;

/// A service that logs its hooks and listens to one state path and one topic.
struct Recording {
    base: ServiceBase,
    name: String,
    log: Log,
    fail: bool,
}

#[async_trait]
impl Service for Recording {
    fn base(&self) -> &ServiceBase {
        &self.base
    }

    async fn initialize(&self) -> HandlerResult {
        self.log.lock().push(format!("init:{}", self.name));
        if self.fail {
            return Err(format!("{} failed", self.name).into());
        }
        let log = Arc::clone(&self.log);
        let name = self.name.clone();
        self.base.subscribe_to_state("ui.view", move |_| {
            log.lock().push(format!("view-changed:{name}"));
            Ok(())
        });
        let log = Arc::clone(&self.log);
        let name = self.name.clone();
        self.base.subscribe_to_event(
            "track:selected",
            move |_| {
                log.lock().push(format!("track:{name}"));
                Ok(())
            },
            ListenOptions::default(),
        );
        Ok(())
    }

    async fn destroy(&self) -> HandlerResult {
        self.base.destroy();
        self.log.lock().push(format!("destroy:{}", self.name));
        Ok(())
    }
}

fn recording(
    log: &Log,
    name: &'static str,
    fail: bool,
) -> impl Fn(&ServiceContext) -> Result<Recording, BoxError> + Send + Sync + 'static {
    let log = Arc::clone(log);
    move |ctx: &ServiceContext| {
        Ok(Recording {
            base: ctx.base(),
            name: name.to_string(),
            log: Arc::clone(&log),
            fail,
        })
    }
}

fn manager() -> LifecycleManager {
    let bus = EventBus::with_defaults();
    let store = StateStore::with_schema(Arc::clone(&bus), StoreConfig::default());
    LifecycleManager::new(store, bus, LifecycleConfig::default())
}

fn topic_log(bus: &EventBus, topic: &str) -> Arc<Mutex<Vec<Value>>> {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let _ = bus.on(topic, move |v| {
        sink.lock().push(v.clone());
        Ok(())
    });
    seen
}

#[tokio::test]
async fn dependency_starts_first() {
    let log: Log = Arc::default();
    let mut services = manager();
    services
        .register_service("B", recording(&log, "B", false), &["A"], ServiceOptions::default())
        .unwrap();
    services
        .register_service("A", recording(&log, "A", false), &[], ServiceOptions::default())
        .unwrap();
    let ready = topic_log(services.bus(), SERVICES_READY);
    let started = topic_log(services.bus(), SERVICE_STARTED);

    services.initialize_services().await.unwrap();

    assert_eq!(*log.lock(), vec!["init:A", "init:B"]);
    assert_eq!(services.start_order(), vec!["A", "B"]);
    assert_eq!(started.lock().len(), 2);
    assert_eq!(
        ready.lock()[0].field("services"),
        Some(&Value::List(vec![Value::from("A"), Value::from("B")]))
    );
}

#[tokio::test]
async fn required_failure_prevents_dependents_and_rolls_back() {
    let log: Log = Arc::default();
    let mut services = manager();
    services
        .register_service("root", recording(&log, "root", false), &[], ServiceOptions::default())
        .unwrap();
    services
        .register_service("A", recording(&log, "A", true), &["root"], ServiceOptions::default())
        .unwrap();
    services
        .register_service("B", recording(&log, "B", false), &["A"], ServiceOptions::default())
        .unwrap();
    let failed = topic_log(services.bus(), SERVICE_FAILED);

    let err = services.initialize_services().await.unwrap_err();

    assert!(matches!(err, Error::Dependency { ref service, .. } if service == "A"));
    assert!(services.get_service("B").is_none());
    assert!(services.get_service("root").is_none());
    assert!(services.start_order().is_empty());
    assert_eq!(services.service_status("B"), Some(ServiceStatus::Registered));
    assert_eq!(services.service_status("root"), Some(ServiceStatus::Stopped));
    assert_eq!(
        *log.lock(),
        vec!["init:root", "init:A", "destroy:A", "destroy:root"]
    );
    assert_eq!(failed.lock().len(), 1);

    // Rolled-back services no longer react.
    services.store().set("ui.view", "list").unwrap();
    assert!(!log.lock().iter().any(|l| l.starts_with("view-changed")));
}

#[tokio::test]
async fn optional_failure_is_reported_and_skipped() {
    let log: Log = Arc::default();
    let mut services = manager();
    services
        .register_service("scanner", recording(&log, "scanner", true), &[], ServiceOptions::optional())
        .unwrap();
    services
        .register_service(
            "library",
            |ctx: &ServiceContext| {
                // The failed optional dependency is absent, not an error.
                assert!(ctx.dependency::<Recording>("scanner").is_none());
                Ok(Recording {
                    base: ctx.base(),
                    name: "library".to_string(),
                    log: Arc::default(),
                    fail: false,
                })
            },
            &["scanner"],
            ServiceOptions::default(),
        )
        .unwrap();
    let errors = topic_log(services.bus(), SYSTEM_ERROR);

    services.initialize_services().await.unwrap();

    assert_eq!(services.start_order(), vec!["library"]);
    assert_eq!(services.service_status("scanner"), Some(ServiceStatus::Failed));
    let errors = errors.lock();
    assert_eq!(errors.len(), 1);
    assert_eq!(
        errors[0].field("data").and_then(|d| d.field("service")),
        Some(&Value::from("scanner"))
    );
}

#[tokio::test]
async fn cycle_rejected_before_anything_starts() {
    let log: Log = Arc::default();
    let mut services = manager();
    services
        .register_service("solo", recording(&log, "solo", false), &[], ServiceOptions::default())
        .unwrap();
    services
        .register_service("a", recording(&log, "a", false), &["b"], ServiceOptions::default())
        .unwrap();
    services
        .register_service("b", recording(&log, "b", false), &["a"], ServiceOptions::default())
        .unwrap();

    let err = services.initialize_services().await.unwrap_err();

    assert!(matches!(err, Error::CycleDetected { .. }));
    assert!(log.lock().is_empty());
}

#[tokio::test]
async fn unknown_dependency_rejected() {
    let log: Log = Arc::default();
    let mut services = manager();
    services
        .register_service("ui", recording(&log, "ui", false), &["renderer"], ServiceOptions::default())
        .unwrap();

    let err = services.initialize_services().await.unwrap_err();
    assert!(matches!(err, Error::UnknownDependency { ref depends_on, .. } if depends_on == "renderer"));
}

#[tokio::test]
async fn manual_service_starts_on_demand_with_dependencies() {
    let log: Log = Arc::default();
    let mut services = manager();
    services
        .register_service("library", recording(&log, "library", false), &[], ServiceOptions::default())
        .unwrap();
    services
        .register_service(
            "export",
            |ctx: &ServiceContext| {
                assert!(ctx.dependency::<Recording>("library").is_some());
                Ok(Recording {
                    base: ctx.base(),
                    name: "export".to_string(),
                    log: Arc::default(),
                    fail: false,
                })
            },
            &["library"],
            ServiceOptions::manual(),
        )
        .unwrap();

    services.initialize_services().await.unwrap();
    assert_eq!(services.service_status("export"), Some(ServiceStatus::Registered));

    services.start_service("export").await.unwrap();
    assert_eq!(services.start_order(), vec!["library", "export"]);
    assert!(services.get_service_as::<Recording>("export").is_some());

    let err = services.start_service("missing").await.unwrap_err();
    assert!(matches!(err, Error::NotFound(_)));
}

#[tokio::test]
async fn shutdown_is_reverse_order_and_releases_subscriptions() {
    let log: Log = Arc::default();
    let mut services = manager();
    for (name, deps) in [("db", vec![]), ("library", vec!["db"]), ("ui", vec!["library"])] {
        services
            .register_service(name, recording(&log, name, false), &deps, ServiceOptions::default())
            .unwrap();
    }
    let shutdown = topic_log(services.bus(), SERVICES_SHUTDOWN);

    services.initialize_services().await.unwrap();
    services.bus().emit("track:selected", Value::from("t1")).unwrap();
    services.shutdown_services().await;
    services.bus().emit("track:selected", Value::from("t2")).unwrap();

    let log = log.lock();
    let destroys: Vec<&String> = log.iter().filter(|l| l.starts_with("destroy:")).collect();
    assert_eq!(destroys, vec!["destroy:ui", "destroy:library", "destroy:db"]);
    assert_eq!(log.iter().filter(|l| l.starts_with("track:")).count(), 3);
    assert!(!services.bus().has_listeners("track:selected"));
    assert_eq!(shutdown.lock().len(), 1);
}

#[tokio::test]
async fn dependent_never_starts_before_manual_dependency() {
    let log: Log = Arc::default();
    let mut services = manager();
    services
        .register_service("codec", recording(&log, "codec", false), &[], ServiceOptions::manual())
        .unwrap();
    services
        .register_service("player", recording(&log, "player", false), &["codec"], ServiceOptions::default())
        .unwrap();

    let err = services.initialize_services().await.unwrap_err();

    assert!(matches!(err, Error::Dependency { ref service, .. } if service == "player"));
    assert!(err.to_string().contains("codec"));
    assert!(services.start_order().is_empty());
    assert_eq!(services.service_status("codec"), Some(ServiceStatus::Registered));
    assert!(log.lock().is_empty());
}

#[tokio::test]
async fn start_service_requires_running_dependencies() {
    let log: Log = Arc::default();
    let mut services = manager();
    services
        .register_service("codec", recording(&log, "codec", false), &[], ServiceOptions::manual())
        .unwrap();
    services
        .register_service("player", recording(&log, "player", false), &["codec"], ServiceOptions::manual())
        .unwrap();
    services.initialize_services().await.unwrap();

    let err = services.start_service("player").await.unwrap_err();
    assert!(matches!(err, Error::Dependency { ref service, .. } if service == "player"));
    assert!(services.get_service("player").is_none());

    services.start_service("codec").await.unwrap();
    services.start_service("player").await.unwrap();
    assert_eq!(services.start_order(), vec!["codec", "player"]);

    services.shutdown_services().await;
    let destroys: Vec<String> = log
        .lock()
        .iter()
        .filter(|l| l.starts_with("destroy:"))
        .cloned()
        .collect();
    assert_eq!(destroys, vec!["destroy:player", "destroy:codec"]);
}
