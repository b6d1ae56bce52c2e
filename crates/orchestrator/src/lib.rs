//! The run orchestrator — the heart of Canopy.
//!
//! A run flows through four cooperating pieces:
//!
//! 1. **Tree cache** — materializes a capability snapshot of the agent
//!    subtree for a `(session, root)` pair, invalidated on any mutation
//! 2. **Capability router** — deterministically picks which immediate
//!    children to engage for a task
//! 3. **Recursive executor** — runs one agent, streams its tokens, and
//!    recursively engages its selected children within bounded depth and
//!    parallelism
//! 4. **Run coordinator** — claims the run, fans executor events to the
//!    caller, synthesizes the final output, and persists terminal state
//!
//! Every run reaches a terminal persisted state in bounded time, even when
//! the upstream LLM stalls, errors, or yields no content.

pub mod breaker;
pub mod coordinator;
pub mod event;
pub mod executor;
pub mod router;
pub mod tree_cache;

#[cfg(test)]
pub(crate) mod test_support;

pub use breaker::CircuitBreaker;
pub use coordinator::{CoordinatorConfig, RunCoordinator};
pub use event::{AgentPhase, RefusalReason, RunEvent};
pub use executor::{ExecContext, ExecutorConfig, RecursiveExecutor};
pub use tree_cache::{CacheStats, TreeCache};
