//! spawnwatch reflector: keeps in-memory caches of pods and events in sync with
//! the cluster using list-then-watch, and serves reads from those caches.
//!
//! - `Reflector` runs the list/watch state machine for one `(kind, namespace)`.
//! - `Supervisor` owns the reflector tasks and their lifecycle.
//! - `Registry` is the cheap, cloneable read side handed to callers.

#![forbid(unsafe_code)]

mod config;
mod reflector;
mod registry;
mod supervisor;

pub use config::ReflectorConfig;
pub use reflector::{Reflector, ReflectorState, ReflectorStatus};
pub use registry::{AnyCache, Cached, CachedObject, Health, Listing, LookupError, ReflectorHealth, Registry};
pub use supervisor::{ReflectorFailure, StartupError, StopReport, Supervisor, SupervisorConfig};
