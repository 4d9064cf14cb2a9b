//! Service lifecycle manager.
//!
//! Services are registered with a factory and the names they depend on.
//! `initialize_services` orders them so every service starts after its
//! dependencies, then constructs and initializes each one:
//!   - a **required** service that fails aborts startup; everything already
//!     started is destroyed in reverse order
//!   - an **optional** service that fails is reported on `system:error` and
//!     skipped; its dependents see it as absent
//!   - a service whose dependency is not running for any other reason (a
//!     manual service not started yet, a stopped one) fails to start
//!
//! `shutdown_services` destroys running services in reverse start order.

use serde::{Deserialize, Serialize};
use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

use super::registry::{self, Node};
use super::{Service, ServiceBase};
use crate::bus::{EventBus, SYSTEM_ERROR};
use crate::state::StateStore;
use crate::types::{BoxError, Error, HandlerResult, InstanceId, LifecycleConfig, Result};
use crate::value::Value;

/// Emitted with `{service, instanceId}` after a service initialized.
pub const SERVICE_STARTED: &str = "service:started";
/// Emitted with `{service, error, required}` when construction or
/// initialization failed.
pub const SERVICE_FAILED: &str = "service:failed";
/// Emitted with `{service, instanceId, clean}` after a service was destroyed.
pub const SERVICE_STOPPED: &str = "service:stopped";
/// Emitted with `{services}` (start order) once startup completed.
pub const SERVICES_READY: &str = "services:ready";
/// Emitted with `{services}` (stop order) once shutdown completed.
pub const SERVICES_SHUTDOWN: &str = "services:shutdown";

type AnyService = Arc<dyn Any + Send + Sync>;
type Factory = Arc<dyn Fn(&ServiceContext) -> std::result::Result<Built, BoxError> + Send + Sync>;

/// A constructed service, both as the trait object and as `Any` for typed
/// lookup.
struct Built {
    service: Arc<dyn Service>,
    any: AnyService,
}

/// Registration options.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceOptions {
    /// Failure aborts startup.
    pub required: bool,
    /// Started by `initialize_services`; otherwise only by `start_service`.
    pub auto_start: bool,
}

impl Default for ServiceOptions {
    fn default() -> Self {
        Self {
            required: true,
            auto_start: true,
        }
    }
}

impl ServiceOptions {
    pub fn optional() -> Self {
        Self {
            required: false,
            ..Self::default()
        }
    }

    pub fn manual() -> Self {
        Self {
            auto_start: false,
            ..Self::default()
        }
    }
}

/// Where a registered service is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceStatus {
    /// Registered, not started.
    Registered,
    /// Initialized and running.
    Running,
    /// Construction or initialization failed.
    Failed,
    /// Destroyed by shutdown or rollback.
    Stopped,
}

struct Descriptor {
    name: String,
    depends_on: Vec<String>,
    options: ServiceOptions,
    factory: Factory,
    status: ServiceStatus,
}

struct Running {
    name: String,
    instance_id: InstanceId,
    service: Arc<dyn Service>,
    any: AnyService,
}

// =============================================================================
// ServiceContext
// =============================================================================

/// What a factory receives: the shared store and bus, and the running
/// instances of the declared dependencies.
pub struct ServiceContext {
    name: String,
    store: Arc<StateStore>,
    bus: Arc<EventBus>,
    dependencies: HashMap<String, AnyService>,
}

impl ServiceContext {
    /// Name the service was registered under.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn store(&self) -> &Arc<StateStore> {
        &self.store
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    /// A fresh base bound to the shared store and bus.
    pub fn base(&self) -> ServiceBase {
        ServiceBase::new(Arc::clone(&self.store), Arc::clone(&self.bus))
    }

    /// A running dependency of type `T`. `None` when the dependency was not
    /// declared, is a failed optional service or has another type.
    pub fn dependency<T: Service>(&self, name: &str) -> Option<Arc<T>> {
        self.dependencies
            .get(name)
            .cloned()
            .and_then(|any| any.downcast::<T>().ok())
    }

    pub fn has_dependency(&self, name: &str) -> bool {
        self.dependencies.contains_key(name)
    }
}

impl fmt::Debug for ServiceContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut deps: Vec<&String> = self.dependencies.keys().collect();
        deps.sort();
        f.debug_struct("ServiceContext")
            .field("name", &self.name)
            .field("dependencies", &deps)
            .finish()
    }
}

// =============================================================================
// LifecycleManager
// =============================================================================

/// Owns service descriptors and running instances.
pub struct LifecycleManager {
    store: Arc<StateStore>,
    bus: Arc<EventBus>,
    config: LifecycleConfig,
    /// Registration order.
    descriptors: Vec<Descriptor>,
    /// Start order.
    running: Vec<Running>,
}

/// Run a service hook on its own task so panics are contained, bounded by
/// `limit`.
async fn run_hook<F>(limit: Duration, hook: F) -> std::result::Result<(), String>
where
    F: Future<Output = HandlerResult> + Send + 'static,
{
    let task = tokio::spawn(hook);
    let abort = task.abort_handle();
    match tokio::time::timeout(limit, task).await {
        Ok(Ok(Ok(()))) => Ok(()),
        Ok(Ok(Err(err))) => Err(err.to_string()),
        Ok(Err(join)) if join.is_panic() => Err(panic_message(join.into_panic())),
        Ok(Err(join)) => Err(join.to_string()),
        Err(_) => {
            abort.abort();
            Err(Error::timeout(format!("hook did not finish within {limit:?}")).to_string())
        }
    }
}

/// Call a factory, turning both errors and panics into a message.
fn build(factory: &Factory, ctx: &ServiceContext) -> std::result::Result<Built, String> {
    match catch_unwind(AssertUnwindSafe(|| factory(ctx))) {
        Ok(Ok(built)) => Ok(built),
        Ok(Err(err)) => Err(err.to_string()),
        Err(panic) => Err(panic_message(panic)),
    }
}

fn panic_message(panic: Box<dyn Any + Send>) -> String {
    panic
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "service panicked".to_string())
}

impl LifecycleManager {
    pub fn new(store: Arc<StateStore>, bus: Arc<EventBus>, config: LifecycleConfig) -> Self {
        Self {
            store,
            bus,
            config,
            descriptors: Vec::new(),
            running: Vec::new(),
        }
    }

    // =========================================================================
    // Registration
    // =========================================================================

    /// Register a service. `factory` runs once per start with a context
    /// holding the running dependencies.
    pub fn register_service<T, F>(
        &mut self,
        name: &str,
        factory: F,
        depends_on: &[&str],
        options: ServiceOptions,
    ) -> Result<()>
    where
        T: Service,
        F: Fn(&ServiceContext) -> std::result::Result<T, BoxError> + Send + Sync + 'static,
    {
        if self.descriptors.iter().any(|d| d.name == name) {
            return Err(Error::DuplicateService(name.to_string()));
        }

        let factory: Factory = Arc::new(move |ctx: &ServiceContext| {
            let instance = Arc::new(factory(ctx)?);
            Ok(Built {
                service: Arc::clone(&instance) as Arc<dyn Service>,
                any: instance as AnyService,
            })
        });

        self.descriptors.push(Descriptor {
            name: name.to_string(),
            depends_on: depends_on.iter().map(|d| (*d).to_string()).collect(),
            options,
            factory,
            status: ServiceStatus::Registered,
        });

        tracing::debug!(
            service = name,
            depends_on = ?depends_on,
            required = options.required,
            auto_start = options.auto_start,
            "service registered"
        );
        Ok(())
    }

    // =========================================================================
    // Startup
    // =========================================================================

    /// Start every auto-start service in dependency order.
    ///
    /// The dependency graph is checked (unknown names, cycles) before any
    /// service starts. Services already running are left alone.
    pub async fn initialize_services(&mut self) -> Result<()> {
        let order = self.resolve_order()?;

        tracing::info!(
            order = ?order.iter().map(|&i| self.descriptors[i].name.as_str()).collect::<Vec<_>>(),
            "initializing services"
        );

        for idx in order {
            let descriptor = &self.descriptors[idx];
            if descriptor.status == ServiceStatus::Running {
                continue;
            }
            if !descriptor.options.auto_start {
                tracing::debug!(service = %descriptor.name, "manual start, skipped");
                continue;
            }

            if let Err(err) = self.start(idx).await {
                if self.descriptors[idx].options.required {
                    tracing::error!(error = %err, "required service failed, rolling back");
                    self.teardown().await;
                    return Err(err);
                }
                self.report_optional_failure(&err);
            }
        }

        let started = self.start_order();
        tracing::info!(services = ?started, "services ready");
        self.emit(
            SERVICES_READY,
            Value::from_pairs([("services", names_value(&started))]),
        );
        Ok(())
    }

    /// Start one registered service that is not running yet (typically an
    /// `auto_start: false` one). Its dependencies are not started for it:
    /// each must already be running or be an optional service that failed.
    pub async fn start_service(&mut self, name: &str) -> Result<()> {
        self.resolve_order()?;
        let idx = self
            .descriptors
            .iter()
            .position(|d| d.name == name)
            .ok_or_else(|| Error::not_found(format!("service '{name}'")))?;

        if self.descriptors[idx].status == ServiceStatus::Running {
            return Ok(());
        }
        self.start(idx).await
    }

    fn resolve_order(&self) -> Result<Vec<usize>> {
        let nodes: Vec<Node<'_>> = self
            .descriptors
            .iter()
            .map(|d| Node {
                name: &d.name,
                depends_on: &d.depends_on,
            })
            .collect();
        registry::start_order(&nodes)
    }

    /// Construct and initialize one service. The returned error is already
    /// classified as `Dependency` or `OptionalServiceFailure`.
    async fn start(&mut self, idx: usize) -> Result<()> {
        let descriptor = &self.descriptors[idx];
        let name = descriptor.name.clone();
        let required = descriptor.options.required;

        let ctx = ServiceContext {
            name: name.clone(),
            store: Arc::clone(&self.store),
            bus: Arc::clone(&self.bus),
            dependencies: descriptor
                .depends_on
                .iter()
                .filter_map(|dep| {
                    self.running
                        .iter()
                        .find(|r| &r.name == dep)
                        .map(|r| (dep.clone(), Arc::clone(&r.any)))
                })
                .collect(),
        };
        // Only a failed optional dependency may be absent.
        let (skipped, blocking): (Vec<&str>, Vec<&str>) = descriptor
            .depends_on
            .iter()
            .filter(|dep| !ctx.has_dependency(dep))
            .map(String::as_str)
            .partition(|dep| self.failed_optional(dep));
        if !skipped.is_empty() {
            tracing::warn!(
                service = %name,
                missing = ?skipped,
                "starting without failed optional dependencies"
            );
        }

        let factory = Arc::clone(&descriptor.factory);
        let outcome = if blocking.is_empty() {
            match build(&factory, &ctx) {
                Ok(built) => self.initialize_built(&name, built).await,
                Err(message) => Err(message),
            }
        } else {
            Err(format!("dependencies not running: {}", blocking.join(", ")))
        };

        match outcome {
            Ok(built) => {
                let instance_id = InstanceId::new();
                tracing::info!(service = %name, instance = %instance_id, "service started");
                self.emit(
                    SERVICE_STARTED,
                    Value::from_pairs([
                        ("service", Value::from(name.as_str())),
                        ("instanceId", Value::from(instance_id.as_str())),
                    ]),
                );
                self.running.push(Running {
                    name,
                    instance_id,
                    service: built.service,
                    any: built.any,
                });
                self.descriptors[idx].status = ServiceStatus::Running;
                Ok(())
            }
            Err(message) => {
                self.descriptors[idx].status = ServiceStatus::Failed;
                tracing::warn!(
                    service = %name,
                    required,
                    error = %message,
                    "service failed to start"
                );
                self.emit(
                    SERVICE_FAILED,
                    Value::from_pairs([
                        ("service", Value::from(name.as_str())),
                        ("error", Value::from(message.as_str())),
                        ("required", Value::from(required)),
                    ]),
                );
                Err(if required {
                    Error::Dependency {
                        service: name,
                        message,
                    }
                } else {
                    Error::OptionalServiceFailure {
                        service: name,
                        message,
                    }
                })
            }
        }
    }

    fn failed_optional(&self, name: &str) -> bool {
        self.descriptors.iter().any(|d| {
            d.name == name && d.status == ServiceStatus::Failed && !d.options.required
        })
    }

    /// Run `initialize()`; on failure, `destroy()` the instance so partial
    /// subscriptions are released.
    async fn initialize_built(
        &self,
        name: &str,
        built: Built,
    ) -> std::result::Result<Built, String> {
        let limit = self.config.init_timeout;
        let service = Arc::clone(&built.service);
        let Err(message) = run_hook(limit, async move { service.initialize().await }).await else {
            return Ok(built);
        };

        let service = Arc::clone(&built.service);
        if let Err(cleanup) = run_hook(limit, async move { service.destroy().await }).await {
            tracing::warn!(service = name, error = %cleanup, "cleanup after failed init failed");
        }
        Err(message)
    }

    fn report_optional_failure(&self, err: &Error) {
        let Error::OptionalServiceFailure { service, .. } = err else {
            return;
        };
        self.emit(
            SYSTEM_ERROR,
            Value::from_pairs([
                ("originalEvent", Value::from(SERVICE_FAILED)),
                ("error", Value::from(err.to_string())),
                ("data", Value::from_pairs([("service", service.as_str())])),
            ]),
        );
    }

    // =========================================================================
    // Shutdown
    // =========================================================================

    /// Destroy every running service in reverse start order. Individual
    /// failures are logged and do not stop the rest.
    pub async fn shutdown_services(&mut self) {
        let stopped = self.teardown().await;
        tracing::info!(services = ?stopped, "services shut down");
        self.emit(
            SERVICES_SHUTDOWN,
            Value::from_pairs([("services", names_value(&stopped))]),
        );
    }

    /// Destroy running services newest first. Returns their names in stop
    /// order.
    async fn teardown(&mut self) -> Vec<String> {
        let mut stopped = Vec::with_capacity(self.running.len());
        while let Some(running) = self.running.pop() {
            let service = Arc::clone(&running.service);
            let result =
                run_hook(self.config.init_timeout, async move { service.destroy().await }).await;
            let clean = match result {
                Ok(()) => true,
                Err(message) => {
                    tracing::warn!(
                        service = %running.name,
                        error = %message,
                        "service destroy failed"
                    );
                    false
                }
            };

            if let Some(d) = self.descriptors.iter_mut().find(|d| d.name == running.name) {
                d.status = ServiceStatus::Stopped;
            }
            tracing::info!(
                service = %running.name,
                instance = %running.instance_id,
                clean,
                "service stopped"
            );
            self.emit(
                SERVICE_STOPPED,
                Value::from_pairs([
                    ("service", Value::from(running.name.as_str())),
                    ("instanceId", Value::from(running.instance_id.as_str())),
                    ("clean", Value::from(clean)),
                ]),
            );
            stopped.push(running.name);
        }
        stopped
    }

    // =========================================================================
    // Lookup
    // =========================================================================

    /// A running service, `None` if it never started, failed or stopped.
    pub fn get_service(&self, name: &str) -> Option<Arc<dyn Service>> {
        self.running
            .iter()
            .find(|r| r.name == name)
            .map(|r| Arc::clone(&r.service))
    }

    /// A running service as its concrete type.
    pub fn get_service_as<T: Service>(&self, name: &str) -> Option<Arc<T>> {
        self.running
            .iter()
            .find(|r| r.name == name)
            .and_then(|r| Arc::clone(&r.any).downcast::<T>().ok())
    }

    /// Instance id of a running service.
    pub fn instance_id(&self, name: &str) -> Option<InstanceId> {
        self.running
            .iter()
            .find(|r| r.name == name)
            .map(|r| r.instance_id.clone())
    }

    pub fn service_status(&self, name: &str) -> Option<ServiceStatus> {
        self.descriptors
            .iter()
            .find(|d| d.name == name)
            .map(|d| d.status)
    }

    /// Names of running services in the order they started.
    pub fn start_order(&self) -> Vec<String> {
        self.running.iter().map(|r| r.name.clone()).collect()
    }

    pub fn store(&self) -> &Arc<StateStore> {
        &self.store
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    fn emit(&self, topic: &str, payload: Value) {
        if let Err(err) = self.bus.emit(topic, payload) {
            tracing::warn!(topic, error = %err, "could not emit lifecycle event");
        }
    }
}

impl fmt::Debug for LifecycleManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LifecycleManager")
            .field("config", &self.config)
            .field(
                "registered",
                &self.descriptors.iter().map(|d| &d.name).collect::<Vec<_>>(),
            )
            .field("running", &self.start_order())
            .finish()
    }
}

fn names_value(names: &[String]) -> Value {
    Value::List(names.iter().map(|n| Value::from(n.as_str())).collect())
}

// =============================================================================
// Tests
// =============================================================================
