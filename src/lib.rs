//! Core runtime substrate of a distributed object-storage daemon: the
//! elastic worker-pool scheduler (`workqueue`) and the multi-disk
//! consistent-hash placement layer (`placement`) that sits on top of it.
//!
//! Everything else this daemon would need -- the wire protocol, the
//! recovery orchestrator's internals, cluster membership, object I/O --
//! is referenced only through the narrow trait contracts in
//! `collaborators`.

pub mod collaborators;
pub mod config;
pub mod disk;
pub mod error;
pub mod fifo;
pub mod fnv;
pub mod placement;
pub mod ring;
pub mod workqueue;
mod xattr_util;

pub use collaborators::{
    ClusterMembership, EventLoop, FixedMembership, NoopEventLoop, NoopRecovery, NoopTracer,
    RecoveryOrchestrator, ThreadTracer,
};
pub use config::{Config, ConfigBuilder, MdConfig, WqeConfig};
pub use disk::{Disk, DiskState};
pub use error::MdError;
pub use placement::{AdminResult, DiskInfo, MultiDiskPlacement};
pub use ring::VDisk;
pub use workqueue::{ThreadPolicy, Work, WorkQueue, WorkQueueEngine};
