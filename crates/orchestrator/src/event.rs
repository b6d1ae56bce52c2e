//! Run-level streaming events.
//!
//! `RunEvent` wraps executor and coordinator activity into the events the
//! gateway forwards to clients over SSE:
//!
//! - `connected`    — stream opened for a run
//! - `log`          — human-readable progress line
//! - `status`       — agent state transition
//! - `output_chunk` — partial text token from one agent
//! - `output`       — an agent's full text
//! - `delegation`   — a parent engaged a child
//! - `error`        — a typed failure (including timeouts)
//! - `completed`    — terminal frame with the aggregated output

use canopy_core::model::LogLevel;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Agent execution phase, surfaced as `status` event data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentPhase {
    Running,
    Analyzing,
    Executing,
    Completed,
    Failed,
    Cancelled,
}

/// Why a delegation was refused before execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RefusalReason {
    /// The agent already appears on this execution path.
    Cycle,
    /// The branch reached the maximum delegation depth.
    Depth,
}

/// Events emitted during run execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RunEvent {
    /// The SSE stream is attached to a run.
    Connected { run_id: String },

    /// Progress line for the activity feed.
    Log {
        agent_id: String,
        message: String,
        level: LogLevel,
    },

    /// An agent moved to a new execution phase.
    Status { agent_id: String, state: AgentPhase },

    /// Partial text token from the LLM.
    OutputChunk { agent_id: String, data: String },

    /// An agent's complete output text.
    Output { agent_id: String, data: String },

    /// A parent engaged a child with its output as the brief.
    Delegation {
        from: String,
        to: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        label: Option<String>,
    },

    /// A branch was skipped before execution (cycle or depth bound).
    DelegationRefused {
        agent_id: String,
        reason: RefusalReason,
    },

    /// A typed failure scoped to one agent.
    Error {
        agent_id: String,
        kind: String,
        message: String,
    },

    /// An agent's deadline expired; accumulated text becomes its output.
    Timeout { agent_id: String },

    /// An agent observed cancellation.
    Cancelled { agent_id: String },

    /// Terminal frame: the run finished with aggregated output.
    Completed {
        final_output: String,
        per_agent_output: BTreeMap<String, String>,
    },
}

impl RunEvent {
    /// SSE event name for this event.
    ///
    /// The wire protocol has a closed set of frame names; refusals surface
    /// as `log` frames and timeouts as `error` frames, with the `type` tag
    /// in the payload preserving the precise variant.
    pub fn sse_event(&self) -> &'static str {
        match self {
            Self::Connected { .. } => "connected",
            Self::Log { .. } => "log",
            Self::Status { .. } => "status",
            Self::OutputChunk { .. } => "output_chunk",
            Self::Output { .. } => "output",
            Self::Delegation { .. } => "delegation",
            Self::DelegationRefused { .. } => "log",
            Self::Error { .. } => "error",
            Self::Timeout { .. } => "error",
            Self::Cancelled { .. } => "status",
            Self::Completed { .. } => "completed",
        }
    }

    /// The agent this event is scoped to, when any.
    pub fn agent_id(&self) -> Option<&str> {
        match self {
            Self::Log { agent_id, .. }
            | Self::Status { agent_id, .. }
            | Self::OutputChunk { agent_id, .. }
            | Self::Output { agent_id, .. }
            | Self::DelegationRefused { agent_id, .. }
            | Self::Error { agent_id, .. }
            | Self::Timeout { agent_id }
            | Self::Cancelled { agent_id } => Some(agent_id),
            Self::Delegation { from, .. } => Some(from),
            Self::Connected { .. } | Self::Completed { .. } => None,
        }
    }
}
