//! KINETIC Compute - Memoizing Compute Cache
//!
//! Caches the results of registered operations by [`ComputationKey`], records
//! which results were computed from which, and invalidates dependents
//! transitively when an input changes.
//!
//! # Architecture
//!
//! ```text
//! invoke / get_or_compute
//!        │
//!        ▼
//! ┌──────────────┐   miss    ┌────────────────────┐
//! │ ComputeCache │ ────────► │ production task    │
//! │  (DashMap)   │ ◄──────── │ Producer::produce  │
//! └──────┬───────┘  result   └─────────┬──────────┘
//!        │                             │ ctx.call(..)
//!        ▼                             ▼
//! ┌──────────────┐           ┌────────────────────┐
//! │ Invalidation │ ◄──────── │  DependencyGraph   │
//! └──────┬───────┘ dependents└────────────────────┘
//!        │ on_invalidated / on_evicted
//!        ▼
//!   CacheObserver (publication bridge)
//! ```
//!
//! Entries are evicted by the keep-alive sweeper once idle for longer than
//! their operation's keep-alive.

pub mod cache;
pub mod config;
pub mod constants;
pub mod context;
pub mod graph;
pub mod invalidation;
pub mod keep_alive;
pub mod observer;
pub mod registry;
pub mod stats;

pub use cache::{ComputeCache, EntrySnapshot};
pub use config::ComputeConfig;
pub use context::ComputeContext;
pub use graph::DependencyGraph;
pub use invalidation::InvalidationReport;
pub use keep_alive::{
    keep_alive_task, KeepAliveConfig, KeepAliveMetrics, KeepAliveSnapshot, SweepReport,
};
pub use observer::CacheObserver;
pub use registry::{producer_fn, OperationDescriptor, OperationRegistry, Producer, RegistryBuilder};
pub use stats::{CacheStats, CacheStatsSnapshot};
