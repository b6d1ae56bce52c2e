//! Recursive agent execution.
//!
//! Executes one agent within a run and, when its output warrants it,
//! recursively executes the children the router selects — concurrently,
//! under a per-run worker pool, inside the agent's own deadline, with
//! hierarchical cancellation. Events flow upward through the run's
//! bounded channel; the consumer closing that channel cancels the branch.
//!
//! State machine per agent:
//! `IDLE → ANALYZING → EXECUTING → {WAITING_FOR_CHILDREN → EXECUTING}* →
//! COMPLETED | FAILED | CANCELLED`

use crate::breaker::CircuitBreaker;
use crate::event::{AgentPhase, RefusalReason, RunEvent};
use crate::router;
use canopy_core::capability::{AgentTreeSnapshot, Capability};
use canopy_core::generator::{GenerationRequest, InlineImage, TextGenerator};
use canopy_core::model::{AgentRecord, LogLevel};
use futures::future::BoxFuture;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Tunables for the recursive executor.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Maximum delegation depth (root = 0).
    pub max_depth: usize,
    /// Concurrent child executions per run.
    pub max_parallel_per_run: usize,
    /// Wall-clock budget per agent execution, children included.
    pub agent_timeout: Duration,
    /// Conversation-history entries included in prompts.
    pub history_window: usize,
    /// Router selection threshold.
    pub selection_threshold: f32,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_depth: 10,
            max_parallel_per_run: 4,
            agent_timeout: Duration::from_secs(30),
            history_window: 3,
            selection_threshold: 0.0,
        }
    }
}

/// Per-run execution context threaded through the recursion.
#[derive(Clone)]
pub struct ExecContext {
    pub session_id: String,
    pub run_id: String,
    pub api_key: String,
    pub snapshot: Arc<AgentTreeSnapshot>,
    pub conversation_history: Vec<String>,
    pub images: Vec<InlineImage>,
    /// Cancellation scope for this branch; children inherit a child token.
    pub cancel: CancellationToken,
    /// Per-run worker pool bounding concurrent LLM calls.
    pub run_permits: Arc<Semaphore>,
}

/// Executes agents recursively, emitting events upward.
pub struct RecursiveExecutor {
    store: Arc<canopy_store::AgentStore>,
    generator: Arc<dyn TextGenerator>,
    breaker: Arc<CircuitBreaker>,
    /// Process-wide cap on in-flight LLM calls.
    llm_permits: Arc<Semaphore>,
    config: ExecutorConfig,
}

/// Outcome of the streaming phase, before any delegation.
enum StreamOutcome {
    Finished,
    TimedOut,
    Cancelled,
    Failed { kind: &'static str, message: String },
}

impl RecursiveExecutor {
    pub fn new(
        store: Arc<canopy_store::AgentStore>,
        generator: Arc<dyn TextGenerator>,
        breaker: Arc<CircuitBreaker>,
        llm_permits: Arc<Semaphore>,
        config: ExecutorConfig,
    ) -> Self {
        Self {
            store,
            generator,
            breaker,
            llm_permits,
            config,
        }
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    /// Execute one agent and its selected descendants.
    ///
    /// Returns the agent's own output text (the accumulated stream, possibly
    /// empty); all observable progress is reported through `tx`.
    pub fn execute(
        self: Arc<Self>,
        agent: AgentRecord,
        task: String,
        parent_output: Option<String>,
        depth: usize,
        path: Vec<String>,
        ctx: ExecContext,
        tx: mpsc::Sender<RunEvent>,
    ) -> BoxFuture<'static, String> {
        Box::pin(async move {
            let agent_id = agent.agent_id.clone();

            // Pre-execution checks, in order: cycle, depth, cancellation,
            // circuit. Refused branches never reach the LLM.
            if path.contains(&agent_id) {
                warn!(agent_id = %agent_id, "Cycle detected on execution path");
                emit(
                    &tx,
                    RunEvent::DelegationRefused {
                        agent_id,
                        reason: RefusalReason::Cycle,
                    },
                )
                .await;
                return String::new();
            }

            if depth >= self.config.max_depth {
                emit(
                    &tx,
                    RunEvent::DelegationRefused {
                        agent_id,
                        reason: RefusalReason::Depth,
                    },
                )
                .await;
                return String::new();
            }

            if ctx.cancel.is_cancelled() {
                emit(&tx, RunEvent::Cancelled { agent_id }).await;
                return String::new();
            }

            if !self.breaker.should_try(&agent_id) {
                emit(
                    &tx,
                    RunEvent::Error {
                        agent_id: agent_id.clone(),
                        kind: "circuit_open".into(),
                        message: format!("{} is temporarily unavailable", agent.name),
                    },
                )
                .await;
                return String::new();
            }

            emit(
                &tx,
                RunEvent::Status {
                    agent_id: agent_id.clone(),
                    state: AgentPhase::Running,
                },
            )
            .await;

            // ── Prompt assembly ──
            emit(
                &tx,
                RunEvent::Status {
                    agent_id: agent_id.clone(),
                    state: AgentPhase::Analyzing,
                },
            )
            .await;
            emit(
                &tx,
                RunEvent::Log {
                    agent_id: agent_id.clone(),
                    message: format!("[{}] Analyzing task", agent.name),
                    level: LogLevel::Info,
                },
            )
            .await;

            let capability = ctx.snapshot.find(&agent_id).cloned();
            let system_prompt = build_system_prompt(&agent, capability.as_ref());
            let user_prompt = build_user_prompt(
                &ctx.conversation_history,
                parent_output.as_deref(),
                &task,
                self.config.history_window,
            );

            let mut request = GenerationRequest::new(
                &ctx.api_key,
                &agent.parameters.model,
                system_prompt,
                user_prompt,
            );
            request.temperature = agent.parameters.temperature;
            request.max_tokens = agent.parameters.max_tokens;
            if agent.photo_injection_enabled {
                request.images = ctx.images.clone();
            }

            // ── Streaming execution ──
            emit(
                &tx,
                RunEvent::Status {
                    agent_id: agent_id.clone(),
                    state: AgentPhase::Executing,
                },
            )
            .await;

            // The deadline covers this agent's whole execution, children
            // included; the branch token lets a deadline here cancel the
            // entire subtree without touching siblings.
            let deadline = tokio::time::Instant::now() + self.config.agent_timeout;
            let branch_cancel = ctx.cancel.child_token();

            let mut accumulated = String::new();
            let outcome = self
                .stream_agent(
                    &agent_id,
                    request,
                    &ctx,
                    &branch_cancel,
                    deadline,
                    &mut accumulated,
                    &tx,
                )
                .await;

            match outcome {
                StreamOutcome::Cancelled => {
                    emit(&tx, RunEvent::Cancelled { agent_id }).await;
                    return accumulated;
                }
                StreamOutcome::Failed { kind, message } => {
                    self.breaker.record_failure(&agent_id);
                    emit(
                        &tx,
                        RunEvent::Error {
                            agent_id: agent_id.clone(),
                            kind: kind.into(),
                            message,
                        },
                    )
                    .await;
                    if accumulated.is_empty() {
                        emit(
                            &tx,
                            RunEvent::Status {
                                agent_id,
                                state: AgentPhase::Failed,
                            },
                        )
                        .await;
                        return accumulated;
                    }
                    // Partial text survives a mid-stream failure.
                }
                StreamOutcome::TimedOut => {
                    emit(&tx, RunEvent::Timeout { agent_id: agent_id.clone() }).await;
                    emit(
                        &tx,
                        RunEvent::Output {
                            agent_id: agent_id.clone(),
                            data: accumulated.clone(),
                        },
                    )
                    .await;
                    emit(
                        &tx,
                        RunEvent::Status {
                            agent_id,
                            state: AgentPhase::Completed,
                        },
                    )
                    .await;
                    return accumulated;
                }
                StreamOutcome::Finished => {
                    self.breaker.record_success(&agent_id);
                }
            }

            emit(
                &tx,
                RunEvent::Output {
                    agent_id: agent_id.clone(),
                    data: accumulated.clone(),
                },
            )
            .await;

            // ── Recursive delegation ──
            let mut timed_out = false;
            if !accumulated.is_empty() && depth < self.config.max_depth {
                if let Some(capability) = &capability {
                    let selected =
                        router::select_children(&task, capability, self.config.selection_threshold);
                    if !selected.is_empty() {
                        timed_out = self
                            .run_children(
                                &agent,
                                &selected,
                                &accumulated,
                                depth,
                                &path,
                                &ctx,
                                &branch_cancel,
                                deadline,
                                &tx,
                            )
                            .await;
                    }
                }
            }

            if timed_out {
                emit(&tx, RunEvent::Timeout { agent_id: agent_id.clone() }).await;
            }
            emit(
                &tx,
                RunEvent::Status {
                    agent_id,
                    state: AgentPhase::Completed,
                },
            )
            .await;
            accumulated
        })
    }

    /// Drive the LLM stream for one agent, relaying chunks upward.
    #[allow(clippy::too_many_arguments)]
    async fn stream_agent(
        &self,
        agent_id: &str,
        request: GenerationRequest,
        ctx: &ExecContext,
        branch_cancel: &CancellationToken,
        deadline: tokio::time::Instant,
        accumulated: &mut String,
        tx: &mpsc::Sender<RunEvent>,
    ) -> StreamOutcome {
        // Admission: the per-run worker pool and the process-wide LLM cap.
        // Both held for the duration of the stream, released before children.
        let permits = tokio::select! {
            _ = branch_cancel.cancelled() => return StreamOutcome::Cancelled,
            _ = tokio::time::sleep_until(deadline) => return StreamOutcome::TimedOut,
            permits = async {
                let run = ctx.run_permits.clone().acquire_owned().await.ok()?;
                let global = self.llm_permits.clone().acquire_owned().await.ok()?;
                Some((run, global))
            } => permits,
        };
        let Some(_permits) = permits else {
            return StreamOutcome::Cancelled;
        };

        let mut rx = match self.generator.stream(request).await {
            Ok(rx) => rx,
            Err(e) => {
                return StreamOutcome::Failed {
                    kind: e.kind(),
                    message: e.to_string(),
                }
            }
        };

        loop {
            tokio::select! {
                _ = branch_cancel.cancelled() => return StreamOutcome::Cancelled,
                _ = tokio::time::sleep_until(deadline) => return StreamOutcome::TimedOut,
                chunk = rx.recv() => match chunk {
                    None => return StreamOutcome::Finished,
                    Some(Ok(chunk)) => {
                        if !chunk.text.is_empty() {
                            accumulated.push_str(&chunk.text);
                            let event = RunEvent::OutputChunk {
                                agent_id: agent_id.to_string(),
                                data: chunk.text,
                            };
                            if tx.send(event).await.is_err() {
                                // Consumer closed the channel: cancel the branch.
                                branch_cancel.cancel();
                                return StreamOutcome::Cancelled;
                            }
                        }
                        if chunk.done {
                            return StreamOutcome::Finished;
                        }
                    }
                    Some(Err(e)) => {
                        return StreamOutcome::Failed {
                            kind: e.kind(),
                            message: e.to_string(),
                        };
                    }
                },
            }
        }
    }

    /// Launch the selected children concurrently and wait for them under
    /// the parent's deadline. Returns true when the deadline expired.
    #[allow(clippy::too_many_arguments)]
    async fn run_children(
        self: &Arc<Self>,
        agent: &AgentRecord,
        selected: &[String],
        agent_output: &str,
        depth: usize,
        path: &[String],
        ctx: &ExecContext,
        branch_cancel: &CancellationToken,
        deadline: tokio::time::Instant,
        tx: &mpsc::Sender<RunEvent>,
    ) -> bool {
        let mut child_path = path.to_vec();
        child_path.push(agent.agent_id.clone());

        let mut join_set: JoinSet<String> = JoinSet::new();

        for child_id in selected {
            let child_agent = match self.store.get_agent(&ctx.session_id, child_id).await {
                Ok(agent) => agent,
                Err(e) => {
                    warn!(child_id = %child_id, error = %e, "Selected child could not be loaded");
                    emit(
                        tx,
                        RunEvent::Log {
                            agent_id: child_id.clone(),
                            message: format!("Skipping unavailable child: {e}"),
                            level: LogLevel::Warn,
                        },
                    )
                    .await;
                    continue;
                }
            };

            emit(
                tx,
                RunEvent::Delegation {
                    from: agent.agent_id.clone(),
                    to: child_id.clone(),
                    label: None,
                },
            )
            .await;

            debug!(
                from = %agent.agent_id,
                to = %child_id,
                depth = depth + 1,
                "Delegating to child"
            );

            // The parent's output is the child's brief.
            let executor = self.clone();
            let child_ctx = ExecContext {
                cancel: branch_cancel.child_token(),
                ..ctx.clone()
            };
            let child_task = agent_output.to_string();
            let child_parent_output = agent_output.to_string();
            let child_tx = tx.clone();
            let child_path = child_path.clone();

            join_set.spawn(async move {
                executor
                    .execute(
                        child_agent,
                        child_task,
                        Some(child_parent_output),
                        depth + 1,
                        child_path,
                        child_ctx,
                        child_tx,
                    )
                    .await
            });
        }

        loop {
            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => {
                    branch_cancel.cancel();
                    // Let children observe cancellation and unwind.
                    while join_set.join_next().await.is_some() {}
                    return true;
                }
                next = join_set.join_next() => {
                    if next.is_none() {
                        return false;
                    }
                }
            }
        }
    }
}

/// Send an event, ignoring a closed channel (the stream loop handles
/// closure; everywhere else the event is simply dropped with the consumer).
async fn emit(tx: &mpsc::Sender<RunEvent>, event: RunEvent) -> bool {
    tx.send(event).await.is_ok()
}

/// The agent's own prompt plus the fixed autonomy directive and an
/// informational list of immediate child capabilities.
fn build_system_prompt(agent: &AgentRecord, capability: Option<&Capability>) -> String {
    let base = if agent.system_prompt.is_empty() {
        format!("You are {}, a {}.", agent.name, agent.role)
    } else {
        agent.system_prompt.clone()
    };

    let mut prompt = format!(
        "{base}\n\n\
         IMPORTANT INSTRUCTIONS:\n\
         - Make decisions autonomously based on best practices and your expertise\n\
         - DO NOT ask the user for additional information; make reasonable assumptions\n\
         - Provide complete, actionable responses with specific recommendations\n"
    );

    if let Some(capability) = capability {
        if !capability.children.is_empty() {
            prompt.push_str(
                "\nYOUR CHILD AGENTS (the system engages them automatically when appropriate; \
                 do not wait for them):\n",
            );
            for child in &capability.children {
                prompt.push_str(&format!(
                    "- {} [{}]\n",
                    child.agent_name,
                    child.keywords.join(", ")
                ));
            }
        }
    }

    prompt
}

/// Join of recent conversation history, the parent's output, and the task.
fn build_user_prompt(
    history: &[String],
    parent_output: Option<&str>,
    task: &str,
    window: usize,
) -> String {
    let mut sections: Vec<String> = Vec::new();

    if !history.is_empty() {
        let start = history.len().saturating_sub(window);
        sections.push(format!("Conversation so far:\n{}", history[start..].join("\n")));
    }

    if let Some(parent) = parent_output {
        if !parent.is_empty() {
            sections.push(format!("Parent's analysis:\n{parent}"));
        }
    }

    sections.push(format!("Task: {task}"));
    sections.join("\n\n")
}
