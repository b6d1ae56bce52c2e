//! Run coordinator — drives a run from request to terminal state.
//!
//! The coordinator claims the pending run, obtains a tree snapshot, spawns
//! the recursive executor on the root agent, pumps events into the caller's
//! bounded channel while appending pertinent ones to the run log, performs
//! the final synthesis, and persists terminal state. Every started run
//! reaches `completed`, `failed`, or `cancelled` within the run deadline —
//! a disconnected client never strands a run mid-flight.

use crate::event::RunEvent;
use crate::executor::{ExecContext, RecursiveExecutor};
use crate::tree_cache::TreeCache;
use canopy_core::capability::AgentTreeSnapshot;
use canopy_core::error::{Error, OrchestratorError, ProviderError};
use canopy_core::generator::{GenerationRequest, InlineImage, TextGenerator};
use canopy_core::model::{AgentRecord, RunLogEntry, RunOutput, RunRecord, RunStatus};
use canopy_store::AgentStore;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Tunables for the coordinator.
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Total wall-clock budget for one run.
    pub run_timeout: Duration,
    /// Capacity of the producer→consumer event channel.
    pub channel_capacity: usize,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            run_timeout: Duration::from_secs(600),
            channel_capacity: 256,
        }
    }
}

/// The top-level run entry point.
pub struct RunCoordinator {
    store: Arc<AgentStore>,
    cache: Arc<TreeCache>,
    generator: Arc<dyn TextGenerator>,
    executor: Arc<RecursiveExecutor>,
    llm_permits: Arc<Semaphore>,
    config: CoordinatorConfig,
}

impl RunCoordinator {
    pub fn new(
        store: Arc<AgentStore>,
        cache: Arc<TreeCache>,
        generator: Arc<dyn TextGenerator>,
        executor: Arc<RecursiveExecutor>,
        llm_permits: Arc<Semaphore>,
        config: CoordinatorConfig,
    ) -> Self {
        Self {
            store,
            cache,
            generator,
            executor,
            llm_permits,
            config,
        }
    }

    /// Start executing a pending run, returning the event stream.
    ///
    /// Fails without side effects when the run is not pending; marks the
    /// run `failed` when its preconditions (root agent resolution, API key,
    /// snapshot) cannot be met.
    pub async fn start_run(
        &self,
        session_id: &str,
        run_id: &str,
        api_key: &str,
    ) -> Result<mpsc::Receiver<RunEvent>, Error> {
        let run = self.store.claim_run(session_id, run_id).await?;

        // The root agent must resolve within this session; a root owned by
        // another session is an isolation violation, not a lookup miss.
        if let Err(e) = self
            .store
            .verify_agent_session(session_id, &run.root_agent_id)
            .await
        {
            self.fail_run(session_id, run_id, e.kind(), &e.to_string()).await;
            return Err(e.into());
        }
        let root_agent = match self.store.get_agent(session_id, &run.root_agent_id).await {
            Ok(agent) => agent,
            Err(e) => {
                self.fail_run(session_id, run_id, e.kind(), &e.to_string()).await;
                return Err(e.into());
            }
        };

        if api_key.trim().is_empty() {
            let e = ProviderError::MissingKey;
            self.fail_run(session_id, run_id, e.kind(), &e.to_string()).await;
            return Err(e.into());
        }

        let snapshot = match self
            .cache
            .get_or_build(session_id, &run.root_agent_id, api_key)
            .await
        {
            Ok(snapshot) => snapshot,
            Err(e) => {
                self.fail_run(session_id, run_id, e.kind(), &e.to_string()).await;
                return Err(e.into());
            }
        };

        info!(
            run_id,
            session_id,
            root_agent = %root_agent.name,
            agents = snapshot.agent_count,
            "Run starting"
        );

        let (out_tx, out_rx) = mpsc::channel(self.config.channel_capacity);
        let (ev_tx, ev_rx) = mpsc::channel(self.config.channel_capacity);

        let cancel = CancellationToken::new();
        let ctx = ExecContext {
            session_id: session_id.to_string(),
            run_id: run_id.to_string(),
            api_key: api_key.to_string(),
            snapshot: snapshot.clone(),
            conversation_history: run.input.conversation_history.clone(),
            images: parse_images(&run.input.images),
            cancel: cancel.clone(),
            run_permits: Arc::new(Semaphore::new(self.executor.config().max_parallel_per_run)),
        };

        let task = run.input.effective_task().to_string();
        let producer = tokio::spawn(self.executor.clone().execute(
            root_agent.clone(),
            task,
            None,
            0,
            Vec::new(),
            ctx,
            ev_tx,
        ));

        let pump = RunPump {
            store: self.store.clone(),
            generator: self.generator.clone(),
            llm_permits: self.llm_permits.clone(),
            snapshot,
            root_agent,
            run,
            api_key: api_key.to_string(),
        };
        let run_timeout = self.config.run_timeout;
        let store = self.store.clone();
        let session_id = session_id.to_string();
        let run_id = run_id.to_string();

        tokio::spawn(async move {
            let drive = pump.drive(ev_rx, producer, out_tx.clone());
            match tokio::time::timeout(run_timeout, drive).await {
                Ok(()) => {}
                Err(_) => {
                    error!(run_id = %run_id, "Run deadline expired, cancelling root task");
                    cancel.cancel();
                    let timeout_error =
                        OrchestratorError::RunTimeout(run_timeout.as_secs());
                    store
                        .update_run_status(
                            &session_id,
                            &run_id,
                            RunStatus::Failed,
                            Some(&timeout_error.to_string()),
                        )
                        .await
                        .ok();
                    let _ = out_tx
                        .send(RunEvent::Error {
                            agent_id: String::new(),
                            kind: timeout_error.kind().into(),
                            message: timeout_error.to_string(),
                        })
                        .await;
                }
            }
        });

        Ok(out_rx)
    }

    async fn fail_run(&self, session_id: &str, run_id: &str, kind: &str, message: &str) {
        warn!(run_id, kind, "Run failed before execution: {message}");
        self.store
            .update_run_status(
                session_id,
                run_id,
                RunStatus::Failed,
                Some(&format!("{kind}: {message}")),
            )
            .await
            .ok();
    }
}

/// Owns the event pump and terminal persistence for one run.
struct RunPump {
    store: Arc<AgentStore>,
    generator: Arc<dyn TextGenerator>,
    llm_permits: Arc<Semaphore>,
    snapshot: Arc<AgentTreeSnapshot>,
    root_agent: AgentRecord,
    run: RunRecord,
    /// Travels in memory only; never persisted or logged.
    api_key: String,
}

impl RunPump {
    /// Forward executor events to the consumer, append log-worthy ones to
    /// the run record, accumulate per-agent outputs, then synthesize and
    /// persist the terminal state.
    async fn drive(
        self,
        mut ev_rx: mpsc::Receiver<RunEvent>,
        producer: JoinHandle<String>,
        out_tx: mpsc::Sender<RunEvent>,
    ) {
        let session_id = self.run.session_id.clone();
        let run_id = self.run.run_id.clone();
        let root_id = self.run.root_agent_id.clone();

        let mut outputs: BTreeMap<String, String> = BTreeMap::new();
        let mut consumer_gone = false;

        while let Some(event) = ev_rx.recv().await {
            if let Some(entry) = log_entry_for(&event) {
                self.store
                    .append_run_log(&session_id, &run_id, entry)
                    .await
                    .ok();
            }
            if let RunEvent::Output { agent_id, data } = &event {
                outputs.insert(agent_id.clone(), data.clone());
            }

            if !consumer_gone && out_tx.send(event).await.is_err() {
                // Client went away; the run still drives to a persisted
                // terminal state so later readers see the completed record.
                info!(run_id = %run_id, "Event consumer disconnected, continuing to terminal state");
                consumer_gone = true;
            }
        }

        let root_output = match producer.await {
            Ok(output) => output,
            Err(e) => {
                error!(run_id = %run_id, error = %e, "Executor task panicked");
                self.store
                    .update_run_status(
                        &session_id,
                        &run_id,
                        RunStatus::Failed,
                        Some(&format!("internal: {e}")),
                    )
                    .await
                    .ok();
                let _ = out_tx
                    .send(RunEvent::Error {
                        agent_id: root_id,
                        kind: "internal".into(),
                        message: "executor task failed".into(),
                    })
                    .await;
                return;
            }
        };

        // A run fails only when the root itself produced nothing at all.
        if root_output.is_empty() && !outputs.contains_key(&root_id) {
            self.store
                .update_run_status(
                    &session_id,
                    &run_id,
                    RunStatus::Failed,
                    Some("root agent produced no output"),
                )
                .await
                .ok();
            let _ = out_tx
                .send(RunEvent::Error {
                    agent_id: root_id,
                    kind: "root_execution_failed".into(),
                    message: "root agent produced no output".into(),
                })
                .await;
            return;
        }

        let final_text = self.synthesize(&root_output, &outputs).await;

        let output = RunOutput {
            final_text: final_text.clone(),
            agents: outputs.clone(),
        };
        self.store
            .set_run_output(&session_id, &run_id, &output)
            .await
            .ok();
        self.store
            .update_run_status(&session_id, &run_id, RunStatus::Completed, None)
            .await
            .ok();

        info!(run_id = %run_id, agents = outputs.len(), "Run completed");

        let _ = out_tx
            .send(RunEvent::Completed {
                final_output: final_text,
                per_agent_output: outputs,
            })
            .await;
    }

    /// Synthesize the final output. With no engaged children the final
    /// output is exactly the root's output; otherwise a second LLM pass
    /// merges the child reports, falling back to plain concatenation.
    async fn synthesize(&self, root_output: &str, outputs: &BTreeMap<String, String>) -> String {
        let root_id = &self.run.root_agent_id;
        let child_reports: Vec<(String, &String)> = outputs
            .iter()
            .filter(|(id, _)| *id != root_id)
            .map(|(id, text)| {
                let name = self
                    .snapshot
                    .find(id)
                    .map(|c| c.agent_name.clone())
                    .unwrap_or_else(|| id.clone());
                (name, text)
            })
            .collect();

        if child_reports.is_empty() {
            return root_output.to_string();
        }

        let reports_block: String = child_reports
            .iter()
            .map(|(name, text)| format!("## {name}\n{text}"))
            .collect::<Vec<_>>()
            .join("\n\n");

        let user_prompt = format!(
            "Original request: {}\n\n\
             Root agent's analysis:\n{}\n\n\
             Team reports:\n{}\n\n\
             Provide a unified, coherent answer that combines all reports.",
            self.run.input.effective_task(),
            root_output,
            reports_block
        );

        let mut request = GenerationRequest::new(
            &self.api_key,
            &self.root_agent.parameters.model,
            "You are synthesizing results from multiple specialist agents into one final response.",
            user_prompt,
        );
        request.temperature = self.root_agent.parameters.temperature;
        request.max_tokens = self.root_agent.parameters.max_tokens;

        let result = async {
            let _permit = self.llm_permits.acquire().await.ok()?;
            self.generator.generate(request).await.ok()
        }
        .await;

        match result {
            Some(text) if !text.trim().is_empty() => text,
            _ => {
                warn!(run_id = %self.run.run_id, "Synthesis failed, falling back to concatenation");
                let joined: Vec<&str> = child_reports.iter().map(|(_, t)| t.as_str()).collect();
                format!("{root_output}\n\n{}", joined.join("\n\n"))
            }
        }
    }
}

/// Which events land in the persisted run log.
fn log_entry_for(event: &RunEvent) -> Option<RunLogEntry> {
    match event {
        RunEvent::Log {
            agent_id,
            message,
            level,
        } => Some(RunLogEntry {
            agent_id: agent_id.clone(),
            timestamp: chrono::Utc::now(),
            message: message.clone(),
            level: *level,
        }),
        RunEvent::Delegation { from, to, .. } => Some(RunLogEntry::info(
            from.clone(),
            format!("delegated to {to}"),
        )),
        RunEvent::DelegationRefused { agent_id, reason } => Some(RunLogEntry::warn(
            agent_id.clone(),
            format!("delegation refused: {reason:?}"),
        )),
        RunEvent::Error {
            agent_id,
            kind,
            message,
        } => Some(RunLogEntry::warn(
            agent_id.clone(),
            format!("{kind}: {message}"),
        )),
        RunEvent::Timeout { agent_id } => Some(RunLogEntry::warn(
            agent_id.clone(),
            "agent execution timed out".to_string(),
        )),
        _ => None,
    }
}

/// Decode run-input images into inline payloads, honoring data-URL
/// prefixes and defaulting the MIME type otherwise.
fn parse_images(raw: &[String]) -> Vec<InlineImage> {
    raw.iter()
        .map(|payload| {
            if let Some(rest) = payload.strip_prefix("data:") {
                if let Some((mime, data)) = rest.split_once(";base64,") {
                    return InlineImage {
                        mime_type: mime.to_string(),
                        data_base64: data.to_string(),
                    };
                }
            }
            InlineImage {
                mime_type: "image/png".to_string(),
                data_base64: payload.clone(),
            }
        })
        .collect()
}
