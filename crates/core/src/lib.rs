//! # Canopy Core
//!
//! Domain types, traits, and error definitions for the Canopy run
//! orchestrator. This crate has **zero framework dependencies** — it defines
//! the domain model that all other crates implement against.
//!
//! ## Design Philosophy
//!
//! The provider boundary is defined as a trait here; implementations live in
//! their own crates. This enables:
//! - Swapping the LLM backend via configuration
//! - Easy testing with mock/stub generators
//! - Clean dependency graph (all crates depend inward on core)

pub mod capability;
pub mod error;
pub mod generator;
pub mod model;

// Re-export key types at crate root for ergonomics
pub use capability::{AgentTreeSnapshot, Capability};
pub use error::{Error, OrchestratorError, ProviderError, Result, StoreError};
pub use generator::{FinishReason, GenerationRequest, InlineImage, TextChunk, TextGenerator};
pub use model::{
    AgentParameters, AgentRecord, LinkRecord, LogLevel, RunInput, RunLogEntry, RunOutput,
    RunRecord, RunStatus, SessionRecord,
};
