// sunpoll-core: Polling, caching and aggregation between sunpoll-api and consumers.

pub mod aggregate;
pub mod backoff;
pub mod cache;
pub mod command;
pub mod config;
pub mod coordinator;
pub mod counters;
pub mod error;
pub mod features;
pub mod mapper;
pub mod model;
pub mod parameters;
pub mod precedence;
pub mod store;
pub mod strategy;

// ── Primary re-exports ──────────────────────────────────────────────
pub use backoff::{BackoffConfig, FailureController, FailureSnapshot, RequestClass};
pub use cache::{CacheStats, EndpointKind, ResponseCache};
pub use command::{Command, CommandResult};
pub use config::{CloudSettings, CoordinatorConfig, DeviceConfig, Intervals, LocalLink};
pub use coordinator::{Coordinator, CycleState, EndpointHealth, Health, MANUFACTURER};
pub use error::{CoreError, FailureKind};
pub use features::{Features, ModelFamily};
pub use store::SnapshotStore;
pub use strategy::{Binding, Family};

// Re-export model types at the crate root for ergonomics.
pub use model::{
    DeviceDescriptor, DeviceKind, DeviceSnapshot, Parameters, SensorValue, Sensors, Snapshot,
};

// Link-level types consumers need to build a config.
pub use sunpoll_api::{DeviceRole, TlsMode, TransportKind};
