//! Capability tree and cached agent-tree snapshots.
//!
//! A `Capability` summarizes what one agent claims to do as a short keyword
//! set, recursively including its children. An `AgentTreeSnapshot` is the
//! cached result of discovering the full subtree for a `(session, root)`
//! pair; the tree cache owns snapshot lifecycle and invalidation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Derived capability summary for one agent and its descendants.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Capability {
    pub agent_id: String,
    pub agent_name: String,

    /// 3–7 keywords extracted from the agent's name, role, and system prompt.
    pub keywords: Vec<String>,

    /// Extraction confidence; lower when the keywords fell back to the role.
    pub confidence: f32,

    /// Depth below the snapshot root (root = 0).
    pub depth: usize,

    #[serde(default)]
    pub children: Vec<Capability>,
}

impl Capability {
    /// Find the capability node for a specific agent in this subtree.
    pub fn find(&self, agent_id: &str) -> Option<&Capability> {
        if self.agent_id == agent_id {
            return Some(self);
        }
        self.children.iter().find_map(|c| c.find(agent_id))
    }

    /// Total number of agents in this subtree.
    pub fn agent_count(&self) -> usize {
        1 + self.children.iter().map(Capability::agent_count).sum::<usize>()
    }

    /// Maximum depth of this subtree, counted in edges below this node.
    pub fn max_depth(&self) -> usize {
        self.children
            .iter()
            .map(|c| 1 + c.max_depth())
            .max()
            .unwrap_or(0)
    }

    /// Flat list of all agent ids in this subtree.
    pub fn all_agent_ids(&self) -> Vec<String> {
        let mut ids = vec![self.agent_id.clone()];
        for child in &self.children {
            ids.extend(child.all_agent_ids());
        }
        ids
    }
}

/// Cached snapshot of one agent subtree with discovered capabilities.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentTreeSnapshot {
    pub session_id: String,
    pub root_agent_id: String,
    pub capability_map: Capability,
    pub agent_count: usize,
    pub max_depth: usize,
    pub created_at: DateTime<Utc>,
    pub last_accessed: DateTime<Utc>,
}

impl AgentTreeSnapshot {
    /// Build a snapshot from a discovered capability tree.
    pub fn new(
        session_id: impl Into<String>,
        root_agent_id: impl Into<String>,
        capability_map: Capability,
    ) -> Self {
        let now = Utc::now();
        let agent_count = capability_map.agent_count();
        let max_depth = capability_map.max_depth();
        Self {
            session_id: session_id.into(),
            root_agent_id: root_agent_id.into(),
            capability_map,
            agent_count,
            max_depth,
            created_at: now,
            last_accessed: now,
        }
    }

    /// Find capability info for a specific agent.
    pub fn find(&self, agent_id: &str) -> Option<&Capability> {
        self.capability_map.find(agent_id)
    }
}
