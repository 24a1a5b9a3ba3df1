//! Narrow trait contracts for the collaborators this crate calls into but
//! does not implement (spec §1, §6): the host event loop, cluster
//! membership, the recovery orchestrator, and thread tracing. Each ships a
//! `Noop*` implementation for standalone use and tests.

use std::thread::ThreadId;

/// Registers the engine's completion readiness source with the host's
/// event loop. Called once, at engine construction.
pub trait EventLoop: Send + Sync {
    fn register_completion_source(&self);
}

/// Cluster membership, consulted by the `Dynamic` roof.
pub trait ClusterMembership: Send + Sync {
    fn node_count(&self) -> usize;
}

/// The "kick" entry point into the recovery orchestrator (spec §1: only
/// this entry point is a contract here, the orchestrator's internals are
/// out of scope).
pub trait RecoveryOrchestrator: Send + Sync {
    fn start_recovery(&self, old_view: u64, new_view: u64);
}

/// Thread registration/unregistration with an external tracing facility.
pub trait ThreadTracer: Send + Sync {
    fn register_thread(&self, tid: ThreadId);
    fn unregister_thread(&self, tid: ThreadId);
}

/// No-op event loop registration, used standalone and in tests.
pub struct NoopEventLoop;
impl EventLoop for NoopEventLoop {
    fn register_completion_source(&self) {}
}

/// Fixed node count, useful for tests that want a deterministic `Dynamic`
/// roof.
pub struct FixedMembership(pub usize);
impl ClusterMembership for FixedMembership {
    fn node_count(&self) -> usize {
        self.0.max(1)
    }
}

/// Recovery kicks are logged and otherwise discarded.
pub struct NoopRecovery;
impl RecoveryOrchestrator for NoopRecovery {
    fn start_recovery(&self, old_view: u64, new_view: u64) {
        log::info!(
            "recovery kick requested (view {} -> {}); no orchestrator attached",
            old_view,
            new_view
        );
    }
}

/// Thread tracing disabled.
pub struct NoopTracer;
impl ThreadTracer for NoopTracer {
    fn register_thread(&self, _tid: ThreadId) {}
    fn unregister_thread(&self, _tid: ThreadId) {}
}
