//! Core types for the runtime.
//!
//! This module provides foundational types used throughout the system:
//! - **IDs**: Strongly-typed identifiers (ListenerId, InstanceId)
//! - **Errors**: Error taxonomy with thiserror derives
//! - **Config**: Configuration structures for bus, store and lifecycle

mod config;
mod errors;
mod ids;

pub use config::{BusConfig, Config, LifecycleConfig, ObservabilityConfig, StoreConfig};
pub use errors::{BoxError, Error, HandlerResult, Result};
pub use ids::{InstanceId, ListenerId};
