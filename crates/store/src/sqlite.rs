//! SQLite store implementation.
//!
//! A single database file with four tables: `sessions`, `agents`, `links`,
//! and `runs`. Structured fields (parameters, run input/output, logs) are
//! stored as JSON columns; timestamps as RFC 3339 text. Migrations run at
//! open. Pass `":memory:"` for an in-process ephemeral database (tests).

use crate::MutationListener;
use canopy_core::error::StoreError;
use canopy_core::model::{
    AgentRecord, LinkRecord, RunInput, RunLogEntry, RunOutput, RunRecord, RunStatus, SessionRecord,
};
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{Row, SqlitePool};
use std::str::FromStr;
use std::sync::RwLock;
use tracing::{debug, info};

/// Upper bound on ancestor-chain walks; a legal tree can never get near it.
const MAX_ANCESTOR_WALK: usize = 10_000;

/// The session-scoped SQLite repository.
pub struct AgentStore {
    pool: SqlitePool,
    listeners: RwLock<Vec<std::sync::Arc<dyn MutationListener>>>,
}

impl AgentStore {
    /// Open (or create) the store at the given path.
    pub async fn open(path: &str) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str(path)
            .map_err(|e| StoreError::Storage(format!("Invalid SQLite path: {e}")))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .pragma("foreign_keys", "ON");

        // In-memory databases are per-connection; keep the pool at one.
        let max_connections = if path.contains(":memory:") { 1 } else { 4 };

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await
            .map_err(|e| StoreError::Storage(format!("Failed to open SQLite: {e}")))?;

        let store = Self {
            pool,
            listeners: RwLock::new(Vec::new()),
        };
        store.run_migrations().await?;
        info!("SQLite store initialized at {path}");
        Ok(store)
    }

    /// Open an ephemeral in-memory store (tests).
    pub async fn in_memory() -> Result<Self, StoreError> {
        Self::open(":memory:").await
    }

    /// Register a mutation listener (tree cache invalidation hook).
    pub fn add_listener(&self, listener: std::sync::Arc<dyn MutationListener>) {
        self.listeners
            .write()
            .expect("listener lock poisoned")
            .push(listener);
    }

    fn notify(&self, session_id: &str) {
        let listeners = self.listeners.read().expect("listener lock poisoned");
        for listener in listeners.iter() {
            listener.agents_changed(session_id);
        }
    }

    async fn run_migrations(&self) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS sessions (
                id            TEXT PRIMARY KEY,
                name          TEXT NOT NULL,
                created_at    TEXT NOT NULL,
                last_accessed TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Storage(format!("sessions table: {e}")))?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS agents (
                id                        TEXT PRIMARY KEY,
                session_id                TEXT NOT NULL REFERENCES sessions(id) ON DELETE CASCADE,
                name                      TEXT NOT NULL,
                role                      TEXT NOT NULL,
                system_prompt             TEXT NOT NULL,
                parameters                TEXT NOT NULL DEFAULT '{}',
                photo_injection_enabled   INTEGER NOT NULL DEFAULT 0,
                photo_injection_features  TEXT NOT NULL DEFAULT '[]',
                parent_id                 TEXT REFERENCES agents(id) ON DELETE SET NULL,
                position_x                REAL,
                position_y                REAL,
                created_at                TEXT NOT NULL,
                updated_at                TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Storage(format!("agents table: {e}")))?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_agents_parent ON agents(session_id, parent_id)",
        )
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Storage(format!("agents index: {e}")))?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS links (
                id               TEXT PRIMARY KEY,
                session_id       TEXT NOT NULL REFERENCES sessions(id) ON DELETE CASCADE,
                parent_agent_id  TEXT NOT NULL REFERENCES agents(id) ON DELETE CASCADE,
                child_agent_id   TEXT NOT NULL REFERENCES agents(id) ON DELETE CASCADE,
                created_at       TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Storage(format!("links table: {e}")))?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS runs (
                id            TEXT PRIMARY KEY,
                session_id    TEXT NOT NULL REFERENCES sessions(id) ON DELETE CASCADE,
                root_agent_id TEXT NOT NULL,
                status        TEXT NOT NULL DEFAULT 'pending',
                input         TEXT NOT NULL DEFAULT '{}',
                output        TEXT,
                logs          TEXT NOT NULL DEFAULT '[]',
                error         TEXT,
                created_at    TEXT NOT NULL,
                started_at    TEXT,
                finished_at   TEXT
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Storage(format!("runs table: {e}")))?;

        debug!("SQLite migrations complete");
        Ok(())
    }

    // ── Sessions ──────────────────────────────────────────────────────────

    pub async fn create_session(&self, name: &str) -> Result<SessionRecord, StoreError> {
        let session = SessionRecord::new(name);
        sqlx::query("INSERT INTO sessions (id, name, created_at, last_accessed) VALUES (?, ?, ?, ?)")
            .bind(&session.session_id)
            .bind(&session.name)
            .bind(session.created_at.to_rfc3339())
            .bind(session.last_accessed.to_rfc3339())
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::Storage(format!("create_session: {e}")))?;
        Ok(session)
    }

    pub async fn get_session(&self, session_id: &str) -> Result<SessionRecord, StoreError> {
        let row = sqlx::query("SELECT * FROM sessions WHERE id = ?")
            .bind(session_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StoreError::Storage(format!("get_session: {e}")))?
            .ok_or_else(|| StoreError::NotFound(format!("session {session_id}")))?;
        Self::row_to_session(&row)
    }

    pub async fn list_sessions(&self) -> Result<Vec<SessionRecord>, StoreError> {
        let rows = sqlx::query("SELECT * FROM sessions ORDER BY created_at DESC")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| StoreError::Storage(format!("list_sessions: {e}")))?;
        rows.iter().map(Self::row_to_session).collect()
    }

    pub async fn touch_session(&self, session_id: &str) -> Result<(), StoreError> {
        sqlx::query("UPDATE sessions SET last_accessed = ? WHERE id = ?")
            .bind(Utc::now().to_rfc3339())
            .bind(session_id)
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::Storage(format!("touch_session: {e}")))?;
        Ok(())
    }

    /// Delete a session; owned agents, links, and runs cascade.
    pub async fn delete_session(&self, session_id: &str) -> Result<(), StoreError> {
        let result = sqlx::query("DELETE FROM sessions WHERE id = ?")
            .bind(session_id)
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::Storage(format!("delete_session: {e}")))?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("session {session_id}")));
        }
        self.notify(session_id);
        Ok(())
    }

    // ── Agents ────────────────────────────────────────────────────────────

    pub async fn create_agent(&self, agent: &AgentRecord) -> Result<(), StoreError> {
        self.get_session(&agent.session_id).await?;
        if let Some(parent_id) = &agent.parent_id {
            self.require_same_session(&agent.session_id, parent_id).await?;
        }

        let parameters = serde_json::to_string(&agent.parameters)
            .map_err(|e| StoreError::Storage(format!("parameters encode: {e}")))?;
        let features = serde_json::to_string(&agent.photo_injection_features)
            .map_err(|e| StoreError::Storage(format!("features encode: {e}")))?;

        sqlx::query(
            r#"
            INSERT INTO agents (
                id, session_id, name, role, system_prompt, parameters,
                photo_injection_enabled, photo_injection_features,
                parent_id, position_x, position_y, created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&agent.agent_id)
        .bind(&agent.session_id)
        .bind(&agent.name)
        .bind(&agent.role)
        .bind(&agent.system_prompt)
        .bind(parameters)
        .bind(agent.photo_injection_enabled as i64)
        .bind(features)
        .bind(&agent.parent_id)
        .bind(agent.position.map(|p| p.0))
        .bind(agent.position.map(|p| p.1))
        .bind(agent.created_at.to_rfc3339())
        .bind(agent.updated_at.to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Storage(format!("create_agent: {e}")))?;

        self.notify(&agent.session_id);
        Ok(())
    }

    pub async fn get_agent(
        &self,
        session_id: &str,
        agent_id: &str,
    ) -> Result<AgentRecord, StoreError> {
        let row = sqlx::query("SELECT * FROM agents WHERE id = ? AND session_id = ?")
            .bind(agent_id)
            .bind(session_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StoreError::Storage(format!("get_agent: {e}")))?
            .ok_or_else(|| StoreError::NotFound(format!("agent {agent_id}")))?;
        Self::row_to_agent(&row)
    }

    pub async fn list_agents(&self, session_id: &str) -> Result<Vec<AgentRecord>, StoreError> {
        let rows = sqlx::query("SELECT * FROM agents WHERE session_id = ? ORDER BY id")
            .bind(session_id)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| StoreError::Storage(format!("list_agents: {e}")))?;
        rows.iter().map(Self::row_to_agent).collect()
    }

    /// Immediate children of an agent, ordered by id for determinism.
    pub async fn get_children(
        &self,
        session_id: &str,
        parent_id: &str,
    ) -> Result<Vec<AgentRecord>, StoreError> {
        let rows =
            sqlx::query("SELECT * FROM agents WHERE session_id = ? AND parent_id = ? ORDER BY id")
                .bind(session_id)
                .bind(parent_id)
                .fetch_all(&self.pool)
                .await
                .map_err(|e| StoreError::Storage(format!("get_children: {e}")))?;
        rows.iter().map(Self::row_to_agent).collect()
    }

    /// The full subtree rooted at `root_id`, breadth-first, root included.
    pub async fn get_agent_subtree(
        &self,
        session_id: &str,
        root_id: &str,
    ) -> Result<Vec<AgentRecord>, StoreError> {
        let root = self.get_agent(session_id, root_id).await?;
        let mut result = vec![root];
        let mut cursor = 0;
        while cursor < result.len() {
            let parent_id = result[cursor].agent_id.clone();
            let children = self.get_children(session_id, &parent_id).await?;
            result.extend(children);
            cursor += 1;
        }
        Ok(result)
    }

    /// Update an agent's mutable fields. Re-parenting runs the same
    /// session and cycle checks as `set_parent`.
    pub async fn update_agent(&self, agent: &AgentRecord) -> Result<(), StoreError> {
        let existing = self.get_agent(&agent.session_id, &agent.agent_id).await?;
        if agent.parent_id != existing.parent_id {
            if let Some(parent_id) = &agent.parent_id {
                self.check_reparent(&agent.session_id, &agent.agent_id, parent_id)
                    .await?;
            }
        }

        let parameters = serde_json::to_string(&agent.parameters)
            .map_err(|e| StoreError::Storage(format!("parameters encode: {e}")))?;
        let features = serde_json::to_string(&agent.photo_injection_features)
            .map_err(|e| StoreError::Storage(format!("features encode: {e}")))?;

        sqlx::query(
            r#"
            UPDATE agents SET
                name = ?, role = ?, system_prompt = ?, parameters = ?,
                photo_injection_enabled = ?, photo_injection_features = ?,
                parent_id = ?, position_x = ?, position_y = ?, updated_at = ?
            WHERE id = ? AND session_id = ?
            "#,
        )
        .bind(&agent.name)
        .bind(&agent.role)
        .bind(&agent.system_prompt)
        .bind(parameters)
        .bind(agent.photo_injection_enabled as i64)
        .bind(features)
        .bind(&agent.parent_id)
        .bind(agent.position.map(|p| p.0))
        .bind(agent.position.map(|p| p.1))
        .bind(Utc::now().to_rfc3339())
        .bind(&agent.agent_id)
        .bind(&agent.session_id)
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Storage(format!("update_agent: {e}")))?;

        self.notify(&agent.session_id);
        Ok(())
    }

    /// Re-parent an agent (or detach it with `None`).
    pub async fn set_parent(
        &self,
        session_id: &str,
        agent_id: &str,
        parent_id: Option<&str>,
    ) -> Result<(), StoreError> {
        self.get_agent(session_id, agent_id).await?;
        if let Some(parent_id) = parent_id {
            self.check_reparent(session_id, agent_id, parent_id).await?;
        }

        sqlx::query("UPDATE agents SET parent_id = ?, updated_at = ? WHERE id = ? AND session_id = ?")
            .bind(parent_id)
            .bind(Utc::now().to_rfc3339())
            .bind(agent_id)
            .bind(session_id)
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::Storage(format!("set_parent: {e}")))?;

        self.notify(session_id);
        Ok(())
    }

    pub async fn delete_agent(&self, session_id: &str, agent_id: &str) -> Result<(), StoreError> {
        let result = sqlx::query("DELETE FROM agents WHERE id = ? AND session_id = ?")
            .bind(agent_id)
            .bind(session_id)
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::Storage(format!("delete_agent: {e}")))?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("agent {agent_id}")));
        }
        self.notify(session_id);
        Ok(())
    }

    /// Reject cross-session parents and parent chains that would revisit
    /// `agent_id` (walking ancestors of the candidate parent).
    async fn check_reparent(
        &self,
        session_id: &str,
        agent_id: &str,
        parent_id: &str,
    ) -> Result<(), StoreError> {
        if agent_id == parent_id {
            return Err(StoreError::WouldCreateCycle {
                agent_id: agent_id.into(),
                parent_id: parent_id.into(),
            });
        }
        self.require_same_session(session_id, parent_id).await?;

        let mut current = Some(parent_id.to_string());
        let mut steps = 0;
        while let Some(id) = current {
            if id == agent_id {
                return Err(StoreError::WouldCreateCycle {
                    agent_id: agent_id.into(),
                    parent_id: parent_id.into(),
                });
            }
            steps += 1;
            if steps > MAX_ANCESTOR_WALK {
                return Err(StoreError::Storage("ancestor walk exceeded bound".into()));
            }
            current = self.get_agent(session_id, &id).await?.parent_id;
        }
        Ok(())
    }

    /// Public form of the same-session assertion, used by the coordinator
    /// to distinguish an isolation violation from a missing root agent.
    pub async fn verify_agent_session(
        &self,
        session_id: &str,
        agent_id: &str,
    ) -> Result<(), StoreError> {
        self.require_same_session(session_id, agent_id).await
    }

    /// Assert that `agent_id` exists and belongs to `session_id`; a row in
    /// another session is a cross-session violation, not a missing row.
    async fn require_same_session(
        &self,
        session_id: &str,
        agent_id: &str,
    ) -> Result<(), StoreError> {
        let row = sqlx::query("SELECT session_id FROM agents WHERE id = ?")
            .bind(agent_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StoreError::Storage(format!("require_same_session: {e}")))?
            .ok_or_else(|| StoreError::NotFound(format!("agent {agent_id}")))?;
        let owner: String = row
            .try_get("session_id")
            .map_err(|e| StoreError::Storage(format!("session_id column: {e}")))?;
        if owner != session_id {
            return Err(StoreError::CrossSessionViolation {
                entity: format!("agent {agent_id}"),
            });
        }
        Ok(())
    }

    // ── Links ─────────────────────────────────────────────────────────────

    pub async fn create_link(&self, link: &LinkRecord) -> Result<(), StoreError> {
        self.require_same_session(&link.session_id, &link.parent_agent_id)
            .await?;
        self.require_same_session(&link.session_id, &link.child_agent_id)
            .await?;

        sqlx::query(
            "INSERT INTO links (id, session_id, parent_agent_id, child_agent_id, created_at)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&link.link_id)
        .bind(&link.session_id)
        .bind(&link.parent_agent_id)
        .bind(&link.child_agent_id)
        .bind(link.created_at.to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Storage(format!("create_link: {e}")))?;

        self.notify(&link.session_id);
        Ok(())
    }

    pub async fn list_links(&self, session_id: &str) -> Result<Vec<LinkRecord>, StoreError> {
        let rows = sqlx::query("SELECT * FROM links WHERE session_id = ? ORDER BY created_at")
            .bind(session_id)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| StoreError::Storage(format!("list_links: {e}")))?;
        rows.iter().map(Self::row_to_link).collect()
    }

    pub async fn delete_link(&self, session_id: &str, link_id: &str) -> Result<(), StoreError> {
        let result = sqlx::query("DELETE FROM links WHERE id = ? AND session_id = ?")
            .bind(link_id)
            .bind(session_id)
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::Storage(format!("delete_link: {e}")))?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("link {link_id}")));
        }
        self.notify(session_id);
        Ok(())
    }

    // ── Runs ──────────────────────────────────────────────────────────────

    /// Create a pending run. The root agent must resolve within the session.
    pub async fn create_run(
        &self,
        session_id: &str,
        root_agent_id: &str,
        input: RunInput,
    ) -> Result<RunRecord, StoreError> {
        self.get_agent(session_id, root_agent_id).await?;

        let run = RunRecord::new(session_id, root_agent_id, input);
        let input_json = serde_json::to_string(&run.input)
            .map_err(|e| StoreError::Storage(format!("input encode: {e}")))?;

        sqlx::query(
            "INSERT INTO runs (id, session_id, root_agent_id, status, input, logs, created_at)
             VALUES (?, ?, ?, ?, ?, '[]', ?)",
        )
        .bind(&run.run_id)
        .bind(&run.session_id)
        .bind(&run.root_agent_id)
        .bind(run.status.as_str())
        .bind(input_json)
        .bind(run.created_at.to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Storage(format!("create_run: {e}")))?;

        Ok(run)
    }

    pub async fn get_run(&self, session_id: &str, run_id: &str) -> Result<RunRecord, StoreError> {
        let row = sqlx::query("SELECT * FROM runs WHERE id = ? AND session_id = ?")
            .bind(run_id)
            .bind(session_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StoreError::Storage(format!("get_run: {e}")))?
            .ok_or_else(|| StoreError::NotFound(format!("run {run_id}")))?;
        Self::row_to_run(&row)
    }

    /// Atomically claim a pending run for execution (pending → running).
    ///
    /// Returns the claimed record; any other prior status yields
    /// `RunAlreadyStartedOrFinished` without side effects.
    pub async fn claim_run(&self, session_id: &str, run_id: &str) -> Result<RunRecord, StoreError> {
        let result = sqlx::query(
            "UPDATE runs SET status = 'running', started_at = ?
             WHERE id = ? AND session_id = ? AND status = 'pending'",
        )
        .bind(Utc::now().to_rfc3339())
        .bind(run_id)
        .bind(session_id)
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Storage(format!("claim_run: {e}")))?;

        if result.rows_affected() == 0 {
            let run = self.get_run(session_id, run_id).await?;
            return Err(StoreError::RunAlreadyStartedOrFinished {
                run_id: run_id.into(),
                status: run.status.as_str().into(),
            });
        }

        self.get_run(session_id, run_id).await
    }

    /// Move a run forward. Terminal rows are immutable; a no-op write to a
    /// terminal run succeeds idempotently.
    pub async fn update_run_status(
        &self,
        session_id: &str,
        run_id: &str,
        status: RunStatus,
        error: Option<&str>,
    ) -> Result<(), StoreError> {
        let finished_at = status.is_terminal().then(|| Utc::now().to_rfc3339());

        let result = sqlx::query(
            "UPDATE runs SET status = ?, error = COALESCE(?, error), finished_at = COALESCE(?, finished_at)
             WHERE id = ? AND session_id = ? AND status IN ('pending', 'running')",
        )
        .bind(status.as_str())
        .bind(error)
        .bind(finished_at)
        .bind(run_id)
        .bind(session_id)
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Storage(format!("update_run_status: {e}")))?;

        if result.rows_affected() == 0 {
            // Distinguish "already terminal" (idempotent) from "missing".
            self.get_run(session_id, run_id).await?;
        }
        Ok(())
    }

    /// Append one log entry to a run's append-only log.
    pub async fn append_run_log(
        &self,
        session_id: &str,
        run_id: &str,
        entry: RunLogEntry,
    ) -> Result<(), StoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| StoreError::Storage(format!("append_run_log begin: {e}")))?;

        let row = sqlx::query("SELECT logs FROM runs WHERE id = ? AND session_id = ?")
            .bind(run_id)
            .bind(session_id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| StoreError::Storage(format!("append_run_log read: {e}")))?
            .ok_or_else(|| StoreError::NotFound(format!("run {run_id}")))?;

        let logs_json: String = row
            .try_get("logs")
            .map_err(|e| StoreError::Storage(format!("logs column: {e}")))?;
        let mut logs: Vec<RunLogEntry> = serde_json::from_str(&logs_json).unwrap_or_default();
        logs.push(entry);
        let logs_json = serde_json::to_string(&logs)
            .map_err(|e| StoreError::Storage(format!("logs encode: {e}")))?;

        sqlx::query("UPDATE runs SET logs = ? WHERE id = ? AND session_id = ?")
            .bind(logs_json)
            .bind(run_id)
            .bind(session_id)
            .execute(&mut *tx)
            .await
            .map_err(|e| StoreError::Storage(format!("append_run_log write: {e}")))?;

        tx.commit()
            .await
            .map_err(|e| StoreError::Storage(format!("append_run_log commit: {e}")))?;
        Ok(())
    }

    /// Persist the aggregated run output.
    pub async fn set_run_output(
        &self,
        session_id: &str,
        run_id: &str,
        output: &RunOutput,
    ) -> Result<(), StoreError> {
        let output_json = serde_json::to_string(output)
            .map_err(|e| StoreError::Storage(format!("output encode: {e}")))?;

        let result = sqlx::query("UPDATE runs SET output = ? WHERE id = ? AND session_id = ?")
            .bind(output_json)
            .bind(run_id)
            .bind(session_id)
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::Storage(format!("set_run_output: {e}")))?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("run {run_id}")));
        }
        Ok(())
    }

    // ── Row parsing ───────────────────────────────────────────────────────

    fn row_to_session(row: &sqlx::sqlite::SqliteRow) -> Result<SessionRecord, StoreError> {
        Ok(SessionRecord {
            session_id: Self::text(row, "id")?,
            name: Self::text(row, "name")?,
            created_at: Self::timestamp(row, "created_at")?,
            last_accessed: Self::timestamp(row, "last_accessed")?,
        })
    }

    fn row_to_agent(row: &sqlx::sqlite::SqliteRow) -> Result<AgentRecord, StoreError> {
        let parameters_json: String = Self::text(row, "parameters")?;
        let features_json: String = Self::text(row, "photo_injection_features")?;
        let enabled: i64 = row
            .try_get("photo_injection_enabled")
            .map_err(|e| StoreError::Storage(format!("photo_injection_enabled column: {e}")))?;
        let position_x: Option<f64> = row.try_get("position_x").ok().flatten();
        let position_y: Option<f64> = row.try_get("position_y").ok().flatten();

        Ok(AgentRecord {
            agent_id: Self::text(row, "id")?,
            session_id: Self::text(row, "session_id")?,
            name: Self::text(row, "name")?,
            role: Self::text(row, "role")?,
            system_prompt: Self::text(row, "system_prompt")?,
            parameters: serde_json::from_str(&parameters_json).unwrap_or_default(),
            photo_injection_enabled: enabled != 0,
            photo_injection_features: serde_json::from_str(&features_json).unwrap_or_default(),
            parent_id: row.try_get("parent_id").ok().flatten(),
            position: position_x.zip(position_y),
            created_at: Self::timestamp(row, "created_at")?,
            updated_at: Self::timestamp(row, "updated_at")?,
        })
    }

    fn row_to_link(row: &sqlx::sqlite::SqliteRow) -> Result<LinkRecord, StoreError> {
        Ok(LinkRecord {
            link_id: Self::text(row, "id")?,
            session_id: Self::text(row, "session_id")?,
            parent_agent_id: Self::text(row, "parent_agent_id")?,
            child_agent_id: Self::text(row, "child_agent_id")?,
            created_at: Self::timestamp(row, "created_at")?,
        })
    }

    fn row_to_run(row: &sqlx::sqlite::SqliteRow) -> Result<RunRecord, StoreError> {
        let status_str: String = Self::text(row, "status")?;
        let input_json: String = Self::text(row, "input")?;
        let logs_json: String = Self::text(row, "logs")?;
        let output_json: Option<String> = row.try_get("output").ok().flatten();
        let started_at: Option<String> = row.try_get("started_at").ok().flatten();
        let finished_at: Option<String> = row.try_get("finished_at").ok().flatten();

        Ok(RunRecord {
            run_id: Self::text(row, "id")?,
            session_id: Self::text(row, "session_id")?,
            root_agent_id: Self::text(row, "root_agent_id")?,
            status: status_str
                .parse()
                .map_err(|e: String| StoreError::Storage(e))?,
            input: serde_json::from_str(&input_json).unwrap_or_default(),
            output: output_json.and_then(|json| serde_json::from_str(&json).ok()),
            logs: serde_json::from_str(&logs_json).unwrap_or_default(),
            error: row.try_get("error").ok().flatten(),
            created_at: Self::timestamp(row, "created_at")?,
            started_at: started_at.as_deref().map(Self::parse_timestamp),
            finished_at: finished_at.as_deref().map(Self::parse_timestamp),
        })
    }

    fn text(row: &sqlx::sqlite::SqliteRow, column: &str) -> Result<String, StoreError> {
        row.try_get(column)
            .map_err(|e| StoreError::Storage(format!("{column} column: {e}")))
    }

    fn timestamp(row: &sqlx::sqlite::SqliteRow, column: &str) -> Result<DateTime<Utc>, StoreError> {
        let raw: String = Self::text(row, column)?;
        Ok(Self::parse_timestamp(&raw))
    }

    fn parse_timestamp(raw: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(raw)
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use canopy_core::model::{LogLevel, RunStatus};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    async fn store_with_session() -> (AgentStore, SessionRecord) {
        let store = AgentStore::in_memory().await.unwrap();
        let session = store.create_session("test").await.unwrap();
        (store, session)
    }

    async fn add_agent(store: &AgentStore, session_id: &str, name: &str) -> AgentRecord {
        let agent = AgentRecord::new(session_id, name, "worker", "You help.");
        store.create_agent(&agent).await.unwrap();
        agent
    }

    #[tokio::test]
    async fn session_crud() {
        let store = AgentStore::in_memory().await.unwrap();
        let session = store.create_session("alpha").await.unwrap();
        let fetched = store.get_session(&session.session_id).await.unwrap();
        assert_eq!(fetched.name, "alpha");
        assert_eq!(store.list_sessions().await.unwrap().len(), 1);

        store.delete_session(&session.session_id).await.unwrap();
        assert!(store.get_session(&session.session_id).await.is_err());
    }

    #[tokio::test]
    async fn agents_are_session_scoped() {
        let store = AgentStore::in_memory().await.unwrap();
        let s1 = store.create_session("one").await.unwrap();
        let s2 = store.create_session("two").await.unwrap();
        let agent = add_agent(&store, &s1.session_id, "A").await;

        // Visible in its own session, not found from the other.
        assert!(store.get_agent(&s1.session_id, &agent.agent_id).await.is_ok());
        let err = store
            .get_agent(&s2.session_id, &agent.agent_id)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[tokio::test]
    async fn cross_session_parent_rejected() {
        let store = AgentStore::in_memory().await.unwrap();
        let s1 = store.create_session("one").await.unwrap();
        let s2 = store.create_session("two").await.unwrap();
        let foreign = add_agent(&store, &s2.session_id, "F").await;

        let orphan = AgentRecord::new(&s1.session_id, "O", "worker", "...")
            .with_parent(&foreign.agent_id);
        let err = store.create_agent(&orphan).await.unwrap_err();
        assert!(matches!(err, StoreError::CrossSessionViolation { .. }));
    }

    #[tokio::test]
    async fn reparent_cycle_rejected() {
        let (store, session) = store_with_session().await;
        let a = add_agent(&store, &session.session_id, "A").await;
        let b = AgentRecord::new(&session.session_id, "B", "worker", "...")
            .with_parent(&a.agent_id);
        store.create_agent(&b).await.unwrap();
        let c = AgentRecord::new(&session.session_id, "C", "worker", "...")
            .with_parent(&b.agent_id);
        store.create_agent(&c).await.unwrap();

        // A under C would close the loop A → B → C → A.
        let err = store
            .set_parent(&session.session_id, &a.agent_id, Some(&c.agent_id))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::WouldCreateCycle { .. }));

        // Self-parenting is a degenerate cycle.
        let err = store
            .set_parent(&session.session_id, &a.agent_id, Some(&a.agent_id))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::WouldCreateCycle { .. }));
    }

    #[tokio::test]
    async fn children_ordered_by_id() {
        let (store, session) = store_with_session().await;
        let root = add_agent(&store, &session.session_id, "root").await;
        for name in ["x", "y", "z"] {
            let child = AgentRecord::new(&session.session_id, name, "worker", "...")
                .with_parent(&root.agent_id);
            store.create_agent(&child).await.unwrap();
        }

        let children = store
            .get_children(&session.session_id, &root.agent_id)
            .await
            .unwrap();
        assert_eq!(children.len(), 3);
        let ids: Vec<_> = children.iter().map(|c| c.agent_id.clone()).collect();
        let mut sorted = ids.clone();
        sorted.sort();
        assert_eq!(ids, sorted);
    }

    #[tokio::test]
    async fn subtree_is_breadth_first() {
        let (store, session) = store_with_session().await;
        let root = add_agent(&store, &session.session_id, "root").await;
        let mid = AgentRecord::new(&session.session_id, "mid", "worker", "...")
            .with_parent(&root.agent_id);
        store.create_agent(&mid).await.unwrap();
        let leaf = AgentRecord::new(&session.session_id, "leaf", "worker", "...")
            .with_parent(&mid.agent_id);
        store.create_agent(&leaf).await.unwrap();

        let subtree = store
            .get_agent_subtree(&session.session_id, &root.agent_id)
            .await
            .unwrap();
        assert_eq!(subtree.len(), 3);
        assert_eq!(subtree[0].agent_id, root.agent_id);
        assert_eq!(subtree[1].agent_id, mid.agent_id);
        assert_eq!(subtree[2].agent_id, leaf.agent_id);
    }

    #[tokio::test]
    async fn run_lifecycle() {
        let (store, session) = store_with_session().await;
        let agent = add_agent(&store, &session.session_id, "A").await;

        let run = store
            .create_run(&session.session_id, &agent.agent_id, RunInput::default())
            .await
            .unwrap();
        assert_eq!(run.status, RunStatus::Pending);

        let claimed = store
            .claim_run(&session.session_id, &run.run_id)
            .await
            .unwrap();
        assert_eq!(claimed.status, RunStatus::Running);
        assert!(claimed.started_at.is_some());

        // A second claim is rejected without side effects.
        let err = store
            .claim_run(&session.session_id, &run.run_id)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            StoreError::RunAlreadyStartedOrFinished { .. }
        ));

        store
            .update_run_status(&session.session_id, &run.run_id, RunStatus::Completed, None)
            .await
            .unwrap();
        let done = store.get_run(&session.session_id, &run.run_id).await.unwrap();
        assert_eq!(done.status, RunStatus::Completed);
        assert!(done.finished_at.is_some());

        // Terminal rows are immutable.
        store
            .update_run_status(
                &session.session_id,
                &run.run_id,
                RunStatus::Failed,
                Some("late"),
            )
            .await
            .unwrap();
        let still_done = store.get_run(&session.session_id, &run.run_id).await.unwrap();
        assert_eq!(still_done.status, RunStatus::Completed);
        assert!(still_done.error.is_none());
    }

    #[tokio::test]
    async fn run_requires_root_in_session() {
        let store = AgentStore::in_memory().await.unwrap();
        let s1 = store.create_session("one").await.unwrap();
        let s2 = store.create_session("two").await.unwrap();
        let foreign = add_agent(&store, &s2.session_id, "F").await;

        let err = store
            .create_run(&s1.session_id, &foreign.agent_id, RunInput::default())
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[tokio::test]
    async fn logs_append_in_order() {
        let (store, session) = store_with_session().await;
        let agent = add_agent(&store, &session.session_id, "A").await;
        let run = store
            .create_run(&session.session_id, &agent.agent_id, RunInput::default())
            .await
            .unwrap();

        store
            .append_run_log(
                &session.session_id,
                &run.run_id,
                RunLogEntry::info(&agent.agent_id, "first"),
            )
            .await
            .unwrap();
        store
            .append_run_log(
                &session.session_id,
                &run.run_id,
                RunLogEntry::warn(&agent.agent_id, "second"),
            )
            .await
            .unwrap();

        let fetched = store.get_run(&session.session_id, &run.run_id).await.unwrap();
        assert_eq!(fetched.logs.len(), 2);
        assert_eq!(fetched.logs[0].message, "first");
        assert_eq!(fetched.logs[1].message, "second");
        assert_eq!(fetched.logs[1].level, LogLevel::Warn);
    }

    #[tokio::test]
    async fn output_roundtrip() {
        let (store, session) = store_with_session().await;
        let agent = add_agent(&store, &session.session_id, "A").await;
        let run = store
            .create_run(&session.session_id, &agent.agent_id, RunInput::default())
            .await
            .unwrap();

        let mut output = RunOutput::default();
        output.final_text = "done".into();
        output.agents.insert(agent.agent_id.clone(), "partial".into());
        store
            .set_run_output(&session.session_id, &run.run_id, &output)
            .await
            .unwrap();

        let fetched = store.get_run(&session.session_id, &run.run_id).await.unwrap();
        let stored = fetched.output.unwrap();
        assert_eq!(stored.final_text, "done");
        assert_eq!(stored.agents.get(&agent.agent_id).unwrap(), "partial");
    }

    #[tokio::test]
    async fn session_delete_cascades() {
        let (store, session) = store_with_session().await;
        let agent = add_agent(&store, &session.session_id, "A").await;
        let run = store
            .create_run(&session.session_id, &agent.agent_id, RunInput::default())
            .await
            .unwrap();

        store.delete_session(&session.session_id).await.unwrap();
        assert!(store.get_agent(&session.session_id, &agent.agent_id).await.is_err());
        assert!(store.get_run(&session.session_id, &run.run_id).await.is_err());
    }

    struct CountingListener {
        count: AtomicUsize,
    }

    impl MutationListener for CountingListener {
        fn agents_changed(&self, _session_id: &str) {
            self.count.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn mutations_notify_listeners() {
        let (store, session) = store_with_session().await;
        let listener = Arc::new(CountingListener {
            count: AtomicUsize::new(0),
        });
        store.add_listener(listener.clone());

        let agent = add_agent(&store, &session.session_id, "A").await;
        store
            .set_parent(&session.session_id, &agent.agent_id, None)
            .await
            .unwrap();
        store
            .delete_agent(&session.session_id, &agent.agent_id)
            .await
            .unwrap();

        assert_eq!(listener.count.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn link_crud_and_checks() {
        let (store, session) = store_with_session().await;
        let parent = add_agent(&store, &session.session_id, "P").await;
        let child = add_agent(&store, &session.session_id, "C").await;

        let link = LinkRecord::new(&session.session_id, &parent.agent_id, &child.agent_id);
        store.create_link(&link).await.unwrap();
        assert_eq!(store.list_links(&session.session_id).await.unwrap().len(), 1);

        store
            .delete_link(&session.session_id, &link.link_id)
            .await
            .unwrap();
        assert!(store.list_links(&session.session_id).await.unwrap().is_empty());
    }
}
