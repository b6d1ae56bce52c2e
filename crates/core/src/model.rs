//! Persistent domain records: sessions, agents, links, and runs.
//!
//! These are the value objects that flow through the entire system:
//! a Session owns Agents arranged in a tree, a Run executes the tree
//! against a user task, and the orchestrator appends logs and output
//! to the Run until it reaches a terminal status.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// An isolation boundary owning agents, links, and runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRecord {
    pub session_id: String,
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub last_accessed: DateTime<Utc>,
}

impl SessionRecord {
    pub fn new(name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            session_id: Uuid::new_v4().to_string(),
            name: name.into(),
            created_at: now,
            last_accessed: now,
        }
    }
}

/// Generation parameters attached to an agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentParameters {
    /// Model identifier (e.g. "gemini-2.5-flash").
    #[serde(default = "default_model")]
    pub model: String,

    /// Sampling temperature (0.0 = deterministic).
    #[serde(default = "default_temperature")]
    pub temperature: f32,

    /// Maximum tokens to generate.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
}

fn default_model() -> String {
    "gemini-2.5-flash".into()
}

fn default_temperature() -> f32 {
    0.7
}

impl Default for AgentParameters {
    fn default() -> Self {
        Self {
            model: default_model(),
            temperature: default_temperature(),
            max_tokens: None,
        }
    }
}

/// A named LLM persona with an optional parent in the agent tree.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRecord {
    pub agent_id: String,
    pub session_id: String,
    pub name: String,
    pub role: String,
    pub system_prompt: String,

    #[serde(default)]
    pub parameters: AgentParameters,

    /// Whether run images are attached to this agent's prompts.
    #[serde(default)]
    pub photo_injection_enabled: bool,

    /// Custom feature tags configured alongside photo injection.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub photo_injection_features: Vec<String>,

    /// Parent agent in the same session; `None` for roots.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,

    /// Canvas coordinates, persisted for the graph editor.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<(f64, f64)>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl AgentRecord {
    /// Create a new agent in the given session.
    pub fn new(
        session_id: impl Into<String>,
        name: impl Into<String>,
        role: impl Into<String>,
        system_prompt: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            agent_id: Uuid::new_v4().to_string(),
            session_id: session_id.into(),
            name: name.into(),
            role: role.into(),
            system_prompt: system_prompt.into(),
            parameters: AgentParameters::default(),
            photo_injection_enabled: false,
            photo_injection_features: Vec::new(),
            parent_id: None,
            position: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Builder-style parent assignment.
    pub fn with_parent(mut self, parent_id: impl Into<String>) -> Self {
        self.parent_id = Some(parent_id.into());
        self
    }
}

/// Redundant edge materialization of `parent_id`, kept for the graph editor.
/// The orchestrator treats `parent_id` as authoritative and never reads links.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinkRecord {
    pub link_id: String,
    pub session_id: String,
    pub parent_agent_id: String,
    pub child_agent_id: String,
    pub created_at: DateTime<Utc>,
}

impl LinkRecord {
    pub fn new(
        session_id: impl Into<String>,
        parent_agent_id: impl Into<String>,
        child_agent_id: impl Into<String>,
    ) -> Self {
        Self {
            link_id: Uuid::new_v4().to_string(),
            session_id: session_id.into(),
            parent_agent_id: parent_agent_id.into(),
            child_agent_id: child_agent_id.into(),
            created_at: Utc::now(),
        }
    }
}

/// Lifecycle status of a run. Terminal statuses are immutable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunStatus::Completed | RunStatus::Failed | RunStatus::Cancelled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Pending => "pending",
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
            RunStatus::Cancelled => "cancelled",
        }
    }
}

impl std::str::FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "pending" => Ok(RunStatus::Pending),
            "running" => Ok(RunStatus::Running),
            "completed" => Ok(RunStatus::Completed),
            "failed" => Ok(RunStatus::Failed),
            "cancelled" => Ok(RunStatus::Cancelled),
            other => Err(format!("unknown run status: {other}")),
        }
    }
}

/// User input for a run: task text, optional history, optional images.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunInput {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conversation_history: Vec<String>,

    /// Base64-encoded image payloads.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub images: Vec<String>,
}

impl RunInput {
    /// The effective task string: `prompt` wins over `task`.
    pub fn effective_task(&self) -> &str {
        self.prompt
            .as_deref()
            .filter(|p| !p.is_empty())
            .or(self.task.as_deref())
            .unwrap_or("")
    }
}

/// Aggregated run output: the synthesized final text plus per-agent texts.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunOutput {
    #[serde(rename = "final")]
    pub final_text: String,

    /// Full output per agent, keyed by agent id.
    #[serde(default)]
    pub agents: BTreeMap<String, String>,
}

/// Severity of a run log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Info,
    Warn,
    Error,
}

/// One append-only run log record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunLogEntry {
    pub agent_id: String,
    pub timestamp: DateTime<Utc>,
    pub message: String,
    pub level: LogLevel,
}

impl RunLogEntry {
    pub fn info(agent_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            agent_id: agent_id.into(),
            timestamp: Utc::now(),
            message: message.into(),
            level: LogLevel::Info,
        }
    }

    pub fn warn(agent_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            agent_id: agent_id.into(),
            timestamp: Utc::now(),
            message: message.into(),
            level: LogLevel::Warn,
        }
    }
}

/// One execution of a root agent against a user task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRecord {
    pub run_id: String,
    pub session_id: String,
    pub root_agent_id: String,
    pub status: RunStatus,
    pub input: RunInput,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<RunOutput>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub logs: Vec<RunLogEntry>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    pub created_at: DateTime<Utc>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl RunRecord {
    /// Create a pending run for the given root agent.
    pub fn new(
        session_id: impl Into<String>,
        root_agent_id: impl Into<String>,
        input: RunInput,
    ) -> Self {
        Self {
            run_id: Uuid::new_v4().to_string(),
            session_id: session_id.into(),
            root_agent_id: root_agent_id.into(),
            status: RunStatus::Pending,
            input,
            output: None,
            logs: Vec::new(),
            error: None,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_starts_pending() {
        let run = RunRecord::new("s1", "a1", RunInput::default());
        assert_eq!(run.status, RunStatus::Pending);
        assert!(run.started_at.is_none());
        assert!(run.output.is_none());
    }

    #[test]
    fn terminal_statuses() {
        assert!(!RunStatus::Pending.is_terminal());
        assert!(!RunStatus::Running.is_terminal());
        assert!(RunStatus::Completed.is_terminal());
        assert!(RunStatus::Failed.is_terminal());
        assert!(RunStatus::Cancelled.is_terminal());
    }

    #[test]
    fn status_roundtrip() {
        for status in [
            RunStatus::Pending,
            RunStatus::Running,
            RunStatus::Completed,
            RunStatus::Failed,
            RunStatus::Cancelled,
        ] {
            let parsed: RunStatus = status.as_str().parse().unwrap();
            assert_eq!(parsed, status);
        }
        assert!("bogus".parse::<RunStatus>().is_err());
    }

    #[test]
    fn effective_task_prefers_prompt() {
        let input = RunInput {
            prompt: Some("plan a trip".into()),
            task: Some("ignored".into()),
            ..RunInput::default()
        };
        assert_eq!(input.effective_task(), "plan a trip");

        let input = RunInput {
            prompt: Some(String::new()),
            task: Some("fallback".into()),
            ..RunInput::default()
        };
        assert_eq!(input.effective_task(), "fallback");

        assert_eq!(RunInput::default().effective_task(), "");
    }

    #[test]
    fn run_output_serializes_final_field() {
        let mut output = RunOutput::default();
        output.final_text = "done".into();
        output.agents.insert("a1".into(), "text".into());
        let json = serde_json::to_string(&output).unwrap();
        assert!(json.contains(r#""final":"done""#));
        assert!(json.contains(r#""a1":"text""#));
    }

    #[test]
    fn agent_serialization_roundtrip() {
        let agent = AgentRecord::new("s1", "Echo", "repeater", "You repeat the user task.")
            .with_parent("root-1");
        let json = serde_json::to_string(&agent).unwrap();
        let parsed: AgentRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.name, "Echo");
        assert_eq!(parsed.parent_id.as_deref(), Some("root-1"));
        assert_eq!(parsed.parameters.model, "gemini-2.5-flash");
    }
}
