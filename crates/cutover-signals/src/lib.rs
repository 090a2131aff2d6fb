//! Cutover signals
//!
//! The two feedback sources the traffic shift is gated on:
//! - [`ReplicationMonitor`]: polls the source → target replication task and
//!   reports lag and fault state, debounced over consecutive polls
//! - [`HealthProbe`]: keeps a bounded window of health snapshots per
//!   environment and derives error rate and p99 latency from it
//!
//! Both own their state and hand out cloned snapshots; pollers run as tokio
//! tasks that only hold a weak reference to their component.

pub mod clock;
pub mod error;
pub mod health;
pub mod replication;

pub use clock::Clock;
pub use error::{AdapterError, HealthError, ReplicationError};
pub use health::{
    Environment, HealthProbe, HealthReading, HealthSettings, HealthSnapshot, HealthSource,
};
pub use replication::{
    ReplicationMonitor, ReplicationReport, ReplicationSettings, ReplicationState,
    ReplicationStatus, ReplicationStatusSource,
};
