//! sing-box subscription client and process supervisor.
//!
//! A panel subscription is fetched and decoded into [`Profile`]s, mapped
//! into a typed [`GeneratedConfig`], written atomically, and consumed by an
//! external `sing-box` process owned by [`ProcessSupervisor`].
//! [`RefreshScheduler`] ties the pipeline together; [`StatsCollector`]
//! polls the running engine for traffic counters.

pub mod error;
pub mod generator;
pub mod outbound;
pub mod scheduler;
pub mod stats;
pub mod subscription;
pub mod supervisor;
pub mod writer;

pub use error::{VpnError, VpnResult};
pub use generator::{ConfigGenerator, GeneratedConfig, GeneratorOptions};
pub use outbound::{Outbound, Protocol};
pub use scheduler::{RefreshHandle, RefreshOutcome, RefreshScheduler, RefreshState};
pub use stats::{EngineProbe, PollOutcome, StatsCollector, StatsOptions, StatsSnapshot};
pub use subscription::{decode_payload, Profile, SubscriptionFetcher, SubscriptionSource};
pub use supervisor::{
    ExitOutcome, ProcessState, ProcessStatus, ProcessSupervisor, SupervisorOptions,
};
pub use writer::{ConfigWriter, StagedConfig};
