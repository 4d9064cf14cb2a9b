//! # Canopy Core - Music Browser Runtime
//!
//! The in-process runtime shared by every part of the Canopy music browser:
//! - Event bus with middleware, throttle/debounce and failure isolation
//! - Reactive state store with dot paths, validation, undo and transactions
//! - Service base with automatic subscription cleanup
//! - Lifecycle manager with dependency ordering and rollback
//!
//! ## Architecture
//!
//! One bus and one store are built per process and handed to every service;
//! services never call each other directly:
//! ```text
//!                 ┌──────────────────────────────────────┐
//!                 │          LifecycleManager            │
//!                 │  ┌─────────┐ ┌─────────┐ ┌─────────┐ │
//!                 │  │ Library │ │Playlists│ │   UI    │ │
//!                 │  │ Service │ │ Service │ │ Service │ │
//!                 │  └────┬────┘ └────┬────┘ └────┬────┘ │
//!                 └───────┼───────────┼───────────┼──────┘
//!                         ▼           ▼           ▼
//!                 ┌──────────────┐  changes  ┌──────────┐
//!                 │  StateStore  │ ────────► │ EventBus │
//!                 └──────────────┘           └──────────┘
//! ```
//!
//! ```no_run
//! use canopy_core::{Config, EventBus, LifecycleManager, StateStore};
//!
//! # async fn run() -> canopy_core::Result<()> {
//! let config = Config::default();
//! canopy_core::observability::init_tracing_with(&config.observability);
//!
//! let bus = EventBus::new(config.bus.clone());
//! let store = StateStore::with_schema(bus.clone(), config.store.clone());
//! let mut services = LifecycleManager::new(store, bus, config.lifecycle.clone());
//! services.initialize_services().await?;
//! services.shutdown_services().await;
//! # Ok(())
//! # }
//! ```

// Enforce strict safety at compile time
#![deny(unsafe_code)]
#![warn(missing_debug_implementations)]
#![warn(rust_2018_idioms)]

pub mod bus;
pub mod services;
pub mod state;
pub mod subscription;
pub mod types;
pub mod validation;
pub mod value;

// Internal utilities
pub mod observability;

pub use bus::{EmitOptions, EventBus, ListenOptions, MiddlewarePhase, SYSTEM_ERROR};
pub use services::{LifecycleManager, Service, ServiceBase, ServiceContext, ServiceOptions};
pub use state::{SetOptions, StateChange, StateStore, Update};
pub use subscription::Unsubscribe;
pub use types::{Config, Error, HandlerResult, Result};
pub use value::{Value, ValueSet};
