//! Session-scoped persistence for Canopy.
//!
//! The `AgentStore` owns sessions, agents, links, and runs in a single
//! SQLite database. Every query is scoped by `session_id`: rows belonging
//! to another session are reported as not found, and cross-session parent
//! assignments are rejected outright.
//!
//! Mutations fan out to registered [`MutationListener`]s so that derived
//! state (the agent tree cache) stays coherent without a dependency cycle.

pub mod sqlite;

pub use sqlite::AgentStore;

/// Observer notified after any agent/link mutation in a session.
///
/// Listeners run synchronously before the mutating call returns, so a
/// subsequent snapshot build is guaranteed to see the invalidation.
pub trait MutationListener: Send + Sync {
    fn agents_changed(&self, session_id: &str);
}
