//! Shared test doubles for orchestrator tests.
//!
//! `StubGenerator` plays scripted behaviors keyed by prompt content: fixed
//! text, chunked streams, mid-stream hangs, and typed failures. Tests use
//! the call log to assert which prompts actually reached the "LLM".

use async_trait::async_trait;
use canopy_core::error::ProviderError;
use canopy_core::generator::{FinishReason, GenerationRequest, TextChunk, TextGenerator};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use tokio::sync::mpsc;

/// What the stub does for one matching request.
#[derive(Debug, Clone)]
pub enum StubBehavior {
    /// Stream the whole text as a single chunk, then terminate.
    Text(String),
    /// Stream each chunk in order, then terminate.
    Chunks(Vec<String>),
    /// Send one chunk after a delay, then hang until the receiver drops.
    HangAfter { first: String, delay_ms: u64 },
    /// Fail stream initiation with this error.
    Fail(ProviderError),
}

/// A scripted `TextGenerator` for tests.
pub struct StubGenerator {
    default: StubBehavior,
    rules: Vec<(String, StubBehavior)>,
    delay_ms: u64,
    calls: AtomicUsize,
    requests: Mutex<Vec<GenerationRequest>>,
}

impl StubGenerator {
    /// Respond to every request with the same text.
    pub fn always(text: &str) -> Self {
        Self {
            default: StubBehavior::Text(text.into()),
            rules: Vec::new(),
            delay_ms: 0,
            calls: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Like `always`, but each call takes `delay_ms` before responding.
    pub fn always_slow(text: &str, delay_ms: u64) -> Self {
        let mut stub = Self::always(text);
        stub.delay_ms = delay_ms;
        stub
    }

    /// Route requests whose system or user prompt contains `needle` to the
    /// given behavior. First matching rule wins; the default applies
    /// otherwise.
    pub fn with_rule(mut self, needle: &str, behavior: StubBehavior) -> Self {
        self.rules.push((needle.into(), behavior));
        self
    }

    /// Total stream/generate calls observed.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Copies of every request received, in order.
    pub fn requests(&self) -> Vec<GenerationRequest> {
        self.requests.lock().unwrap().clone()
    }

    /// Whether any received request mentions `needle` in either prompt.
    pub fn saw_prompt(&self, needle: &str) -> bool {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .any(|r| r.system_prompt.contains(needle) || r.user_prompt.contains(needle))
    }

    fn behavior_for(&self, request: &GenerationRequest) -> StubBehavior {
        for (needle, behavior) in &self.rules {
            if request.system_prompt.contains(needle) || request.user_prompt.contains(needle) {
                return behavior.clone();
            }
        }
        self.default.clone()
    }
}

#[async_trait]
impl TextGenerator for StubGenerator {
    fn name(&self) -> &str {
        "stub"
    }

    async fn stream(
        &self,
        request: GenerationRequest,
    ) -> Result<mpsc::Receiver<Result<TextChunk, ProviderError>>, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let behavior = self.behavior_for(&request);
        self.requests.lock().unwrap().push(request);

        if self.delay_ms > 0 {
            tokio::time::sleep(std::time::Duration::from_millis(self.delay_ms)).await;
        }

        if let StubBehavior::Fail(error) = behavior {
            return Err(error);
        }

        let (tx, rx) = mpsc::channel(8);
        tokio::spawn(async move {
            match behavior {
                StubBehavior::Text(text) => {
                    let _ = tx.send(Ok(TextChunk::delta(text))).await;
                    let _ = tx.send(Ok(TextChunk::terminal(FinishReason::Stop))).await;
                }
                StubBehavior::Chunks(chunks) => {
                    for chunk in chunks {
                        if tx.send(Ok(TextChunk::delta(chunk))).await.is_err() {
                            return;
                        }
                    }
                    let _ = tx.send(Ok(TextChunk::terminal(FinishReason::Stop))).await;
                }
                StubBehavior::HangAfter { first, delay_ms } => {
                    tokio::time::sleep(std::time::Duration::from_millis(delay_ms)).await;
                    let _ = tx.send(Ok(TextChunk::delta(first))).await;
                    // Hang until the consumer gives up.
                    tx.closed().await;
                }
                StubBehavior::Fail(_) => unreachable!("handled above"),
            }
        });

        Ok(rx)
    }
}
