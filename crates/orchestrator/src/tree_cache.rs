//! Agent tree cache with LLM-derived capabilities.
//!
//! Caches one snapshot per `(session, root)` pair. Snapshots are built
//! lazily on first run, coalescing concurrent first-time callers onto one
//! in-flight build, and invalidated whenever the store reports a mutation
//! for the session. There is no time-based expiry: a snapshot is valid
//! exactly until the session mutates.

use canopy_core::capability::{AgentTreeSnapshot, Capability};
use canopy_core::error::{OrchestratorError, ProviderError};
use canopy_core::generator::{GenerationRequest, TextGenerator};
use canopy_core::model::AgentRecord;
use canopy_store::{AgentStore, MutationListener};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, info, warn};

/// Model used for capability analysis; cheap and fast beats clever here.
const ANALYSIS_MODEL: &str = "gemini-2.5-flash";
const ANALYSIS_TEMPERATURE: f32 = 0.1;

/// Confidence assigned to LLM-extracted keywords.
const EXTRACTED_CONFIDENCE: f32 = 0.7;
/// Confidence assigned to the role-token fallback.
const FALLBACK_CONFIDENCE: f32 = 0.3;

type CacheKey = (String, String);

/// Cache statistics for operator visibility.
#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    pub cached_trees: usize,
    pub pending_invalidations: usize,
    pub total_agents: usize,
}

/// Global cache of agent tree snapshots.
pub struct TreeCache {
    store: Arc<AgentStore>,
    generator: Arc<dyn TextGenerator>,
    llm_permits: Arc<Semaphore>,
    cache: Mutex<HashMap<CacheKey, Arc<AgentTreeSnapshot>>>,
    /// Per-key locks so concurrent first-time callers share one build.
    build_locks: Mutex<HashMap<CacheKey, Arc<Mutex<()>>>>,
    /// Latest mutation timestamp per session. Snapshots created before
    /// this instant are stale. std Mutex: written from the synchronous
    /// listener path.
    invalidated_at: std::sync::Mutex<HashMap<String, DateTime<Utc>>>,
}

impl TreeCache {
    pub fn new(
        store: Arc<AgentStore>,
        generator: Arc<dyn TextGenerator>,
        llm_permits: Arc<Semaphore>,
    ) -> Self {
        Self {
            store,
            generator,
            llm_permits,
            cache: Mutex::new(HashMap::new()),
            build_locks: Mutex::new(HashMap::new()),
            invalidated_at: std::sync::Mutex::new(HashMap::new()),
        }
    }

    /// Get the cached snapshot for `(session_id, root_id)` or build one.
    pub async fn get_or_build(
        &self,
        session_id: &str,
        root_id: &str,
        api_key: &str,
    ) -> Result<Arc<AgentTreeSnapshot>, OrchestratorError> {
        let key: CacheKey = (session_id.to_string(), root_id.to_string());

        if let Some(snapshot) = self.fresh_snapshot(&key).await {
            return Ok(snapshot);
        }

        // Single-flight: concurrent first-time callers queue on the same
        // per-key lock; whoever builds first populates the cache for the rest.
        let build_lock = {
            let mut locks = self.build_locks.lock().await;
            locks.entry(key.clone()).or_default().clone()
        };
        let _guard = build_lock.lock().await;

        if let Some(snapshot) = self.fresh_snapshot(&key).await {
            return Ok(snapshot);
        }

        info!(session_id, root_id, "Building agent tree snapshot");
        let snapshot = Arc::new(self.build_snapshot(session_id, root_id, api_key).await?);

        let mut cache = self.cache.lock().await;
        cache.insert(key, snapshot.clone());
        info!(
            session_id,
            root_id,
            agent_count = snapshot.agent_count,
            max_depth = snapshot.max_depth,
            "Snapshot built"
        );
        Ok(snapshot)
    }

    /// Return the cached snapshot if it postdates the session's last
    /// mutation, refreshing its access time.
    async fn fresh_snapshot(&self, key: &CacheKey) -> Option<Arc<AgentTreeSnapshot>> {
        let mut cache = self.cache.lock().await;
        let snapshot = cache.get(key)?.clone();

        let stale = {
            let marks = self.invalidated_at.lock().expect("invalidation lock poisoned");
            marks
                .get(&key.0)
                .is_some_and(|mark| snapshot.created_at < *mark)
        };
        if stale {
            debug!(session_id = %key.0, root_id = %key.1, "Discarding stale snapshot");
            cache.remove(key);
            return None;
        }

        let mut touched = (*snapshot).clone();
        touched.last_accessed = Utc::now();
        let touched = Arc::new(touched);
        cache.insert(key.clone(), touched.clone());
        Some(touched)
    }

    async fn build_snapshot(
        &self,
        session_id: &str,
        root_id: &str,
        api_key: &str,
    ) -> Result<AgentTreeSnapshot, OrchestratorError> {
        let agents = self
            .store
            .get_agent_subtree(session_id, root_id)
            .await
            .map_err(|e| OrchestratorError::SnapshotUnavailable(e.to_string()))?;

        // Subtree arrives breadth-first; index children per parent to
        // assemble the recursive capability tree bottom-up.
        let mut children_of: HashMap<String, Vec<&AgentRecord>> = HashMap::new();
        for agent in agents.iter().skip(1) {
            if let Some(parent_id) = &agent.parent_id {
                children_of.entry(parent_id.clone()).or_default().push(agent);
            }
        }

        let mut keywords: HashMap<String, (Vec<String>, f32)> = HashMap::new();
        for agent in &agents {
            let extracted = self.analyze_keywords(agent, api_key).await;
            keywords.insert(agent.agent_id.clone(), extracted);
        }

        let root = &agents[0];
        let capability_map = Self::assemble(root, 0, &children_of, &keywords);
        Ok(AgentTreeSnapshot::new(session_id, root_id, capability_map))
    }

    fn assemble(
        agent: &AgentRecord,
        depth: usize,
        children_of: &HashMap<String, Vec<&AgentRecord>>,
        keywords: &HashMap<String, (Vec<String>, f32)>,
    ) -> Capability {
        let (kw, confidence) = keywords
            .get(&agent.agent_id)
            .cloned()
            .unwrap_or_else(|| (fallback_keywords(&agent.role), FALLBACK_CONFIDENCE));

        let children = children_of
            .get(&agent.agent_id)
            .map(|list| {
                list.iter()
                    .map(|child| Self::assemble(child, depth + 1, children_of, keywords))
                    .collect()
            })
            .unwrap_or_default();

        Capability {
            agent_id: agent.agent_id.clone(),
            agent_name: agent.name.clone(),
            keywords: kw,
            confidence,
            depth,
            children,
        }
    }

    /// Extract 3–7 capability keywords for one agent; falls back to role
    /// tokens with a recorded warning so the snapshot stays usable.
    async fn analyze_keywords(&self, agent: &AgentRecord, api_key: &str) -> (Vec<String>, f32) {
        let user_prompt = format!(
            "Analyze this agent's capabilities and extract keywords for what it can handle.\n\n\
             Agent Name: {}\n\
             Agent Role: {}\n\
             System Prompt:\n{}\n\n\
             Instructions:\n\
             1. Extract 3-7 specific keywords/topics this agent can handle\n\
             2. Be specific (e.g., \"flight booking\", \"hotel recommendations\", not just \"travel\")\n\
             3. Focus on actionable capabilities\n\
             4. Return ONLY a JSON array of keywords\n\n\
             Example: [\"flight booking\", \"airline recommendations\", \"seat selection\"]\n\n\
             Your response (JSON array only):",
            agent.name, agent.role, agent.system_prompt
        );

        let mut request = GenerationRequest::new(
            api_key,
            ANALYSIS_MODEL,
            "You extract capability keywords from agent descriptions. Respond ONLY with a JSON array.",
            user_prompt,
        );
        request.temperature = ANALYSIS_TEMPERATURE;

        let result = async {
            let _permit = self
                .llm_permits
                .acquire()
                .await
                .map_err(|_| ProviderError::Transport("LLM semaphore closed".into()))?;
            self.generator.generate(request).await
        }
        .await;

        match result {
            Ok(response) => match parse_keyword_response(&response) {
                Some(keywords) if !keywords.is_empty() => (keywords, EXTRACTED_CONFIDENCE),
                _ => {
                    warn!(agent_id = %agent.agent_id, "Capability response was not a keyword array, using role fallback");
                    (fallback_keywords(&agent.role), FALLBACK_CONFIDENCE)
                }
            },
            Err(e) => {
                warn!(agent_id = %agent.agent_id, error = %e, "Capability extraction failed, using role fallback");
                (fallback_keywords(&agent.role), FALLBACK_CONFIDENCE)
            }
        }
    }

    /// Invalidate one snapshot, or every snapshot in the session.
    pub async fn invalidate(&self, session_id: &str, root_id: Option<&str>) {
        match root_id {
            Some(root_id) => {
                let key = (session_id.to_string(), root_id.to_string());
                self.cache.lock().await.remove(&key);
                info!(session_id, root_id, "Snapshot invalidated");
            }
            None => {
                self.mark_session(session_id);
                info!(session_id, "Session snapshots invalidated");
            }
        }
    }

    /// Drop all cache state for a session (session deletion).
    pub async fn clear_session(&self, session_id: &str) {
        let mut cache = self.cache.lock().await;
        cache.retain(|(sid, _), _| sid != session_id);
        self.invalidated_at
            .lock()
            .expect("invalidation lock poisoned")
            .remove(session_id);
    }

    fn mark_session(&self, session_id: &str) {
        let mut marks = self.invalidated_at.lock().expect("invalidation lock poisoned");
        marks.insert(session_id.to_string(), Utc::now());
    }

    pub async fn stats(&self) -> CacheStats {
        let cache = self.cache.lock().await;
        let pending = self
            .invalidated_at
            .lock()
            .expect("invalidation lock poisoned")
            .len();
        CacheStats {
            cached_trees: cache.len(),
            pending_invalidations: pending,
            total_agents: cache.values().map(|s| s.agent_count).sum(),
        }
    }
}

impl MutationListener for TreeCache {
    fn agents_changed(&self, session_id: &str) {
        // Synchronous on purpose: the mark lands before the mutating call
        // returns, so the next get_or_build cannot serve a stale snapshot.
        self.mark_session(session_id);
    }
}

/// Derive fallback keywords from an agent's role.
fn fallback_keywords(role: &str) -> Vec<String> {
    let tokens: Vec<String> = role
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(|w| w.to_lowercase())
        .collect();
    if tokens.is_empty() {
        vec!["general".into()]
    } else {
        tokens
    }
}

/// Parse the analysis response into a keyword list, tolerating markdown
/// code fences around the JSON array.
fn parse_keyword_response(response: &str) -> Option<Vec<String>> {
    let trimmed = response.trim();
    let body = if let Some(rest) = trimmed.strip_prefix("```json") {
        rest.split("```").next()?
    } else if let Some(rest) = trimmed.strip_prefix("```") {
        rest.split("```").next()?
    } else {
        trimmed
    };

    serde_json::from_str::<Vec<String>>(body.trim()).ok()
}
