//! Google Gemini provider implementation.
//!
//! Uses the Generative Language API directly:
//!
//! - `x-goog-api-key` header authentication (the key never enters the URL)
//! - System prompt as the top-level `system_instruction` field
//! - Inline images as `inline_data` parts
//! - Streaming via `streamGenerateContent?alt=sse` with `data:` frames
//! - Legacy model ids substituted before dispatch
//! - Empty or policy-blocked completions surfaced as a synthetic notice
//!   chunk so that a response always exists

use async_trait::async_trait;
use canopy_core::error::ProviderError;
use canopy_core::generator::{
    FinishReason, GenerationRequest, InlineImage, TextChunk, TextGenerator,
};
use futures::StreamExt;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, trace, warn};

const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";
/// Initial attempt plus three retries.
const MAX_ATTEMPTS: u32 = 4;
const BACKOFF_BASE_MS: u64 = 500;

/// Operator-visible notice emitted when the provider returns no text.
const EMPTY_COMPLETION_NOTICE: &str =
    "[notice] The model returned no content for this request.";

/// Gemini Generative Language API client.
pub struct GeminiClient {
    name: String,
    base_url: String,
    client: reqwest::Client,
    /// Retired model ids mapped to their successors.
    legacy_models: HashMap<String, String>,
}

impl GeminiClient {
    /// Create a new Gemini client with no legacy substitutions.
    pub fn new() -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(300))
            .build()
            .expect("Failed to create HTTP client");

        Self {
            name: "gemini".into(),
            base_url: DEFAULT_BASE_URL.into(),
            client,
            legacy_models: HashMap::new(),
        }
    }

    /// Create with a custom base URL (e.g., for testing or proxies).
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    /// Configure the legacy model substitution map.
    pub fn with_legacy_models(mut self, map: HashMap<String, String>) -> Self {
        self.legacy_models = map;
        self
    }

    /// Substitute a retired model id with its configured successor.
    fn migrate_model(&self, model: &str) -> String {
        match self.legacy_models.get(model) {
            Some(current) => {
                warn!(old_model = model, new_model = %current, "Migrating legacy model id");
                current.clone()
            }
            None => model.to_string(),
        }
    }

    /// Validate request inputs before any network I/O.
    fn validate(request: &GenerationRequest) -> Result<(), ProviderError> {
        if request.api_key.trim().is_empty() {
            return Err(ProviderError::MissingKey);
        }
        Ok(())
    }

    /// Build the request body for `generateContent` / `streamGenerateContent`.
    fn build_body(request: &GenerationRequest) -> serde_json::Value {
        let mut parts = vec![serde_json::json!({ "text": request.user_prompt })];
        for image in &request.images {
            parts.push(Self::image_part(image));
        }

        let temperature = request.temperature.clamp(0.0, 2.0);
        let mut generation_config = serde_json::json!({ "temperature": temperature });
        if let Some(max) = request.max_tokens {
            generation_config["maxOutputTokens"] = serde_json::json!(max);
        }

        let mut body = serde_json::json!({
            "contents": [{ "role": "user", "parts": parts }],
            "generationConfig": generation_config,
        });

        if !request.system_prompt.is_empty() {
            body["system_instruction"] = serde_json::json!({
                "parts": [{ "text": request.system_prompt }]
            });
        }

        body
    }

    fn image_part(image: &InlineImage) -> serde_json::Value {
        serde_json::json!({
            "inline_data": {
                "mime_type": image.mime_type,
                "data": image.data_base64,
            }
        })
    }

    /// Map an HTTP error status to a typed provider error.
    fn status_to_error(status: u16, body: String, retry_after: Option<u64>) -> ProviderError {
        match status {
            429 => ProviderError::RateLimited {
                retry_after_secs: retry_after.unwrap_or(5),
            },
            _ => ProviderError::Api {
                status_code: status,
                message: body,
            },
        }
    }

    /// Issue the streaming request, retrying retryable initiation failures
    /// with exponential backoff.
    async fn send_with_retry(
        &self,
        url: &str,
        api_key: &str,
        body: &serde_json::Value,
    ) -> Result<reqwest::Response, ProviderError> {
        let mut last_error = ProviderError::Transport("no attempt made".into());

        for attempt in 0..MAX_ATTEMPTS {
            if attempt > 0 {
                let delay = backoff_delay(attempt);
                debug!(attempt, delay_ms = delay.as_millis() as u64, "Retrying Gemini request");
                tokio::time::sleep(delay).await;
            }

            let result = self
                .client
                .post(url)
                .header("x-goog-api-key", api_key)
                .header("Content-Type", "application/json")
                .header("Accept", "text/event-stream")
                .json(body)
                .send()
                .await;

            let response = match result {
                Ok(r) => r,
                Err(e) if e.is_timeout() => {
                    last_error = ProviderError::Timeout(e.to_string());
                    continue;
                }
                Err(e) => {
                    last_error = ProviderError::Transport(e.to_string());
                    continue;
                }
            };

            let status = response.status().as_u16();
            if status == 200 {
                return Ok(response);
            }

            let retry_after = response
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse().ok());
            let error_body = response.text().await.unwrap_or_default();
            warn!(status, "Gemini API error");
            let error = Self::status_to_error(status, error_body, retry_after);

            if !error.is_retryable() {
                return Err(error);
            }
            if let ProviderError::RateLimited { retry_after_secs } = &error {
                tokio::time::sleep(Duration::from_secs(*retry_after_secs)).await;
            }
            last_error = error;
        }

        Err(last_error)
    }
}

impl Default for GeminiClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TextGenerator for GeminiClient {
    fn name(&self) -> &str {
        &self.name
    }

    async fn stream(
        &self,
        request: GenerationRequest,
    ) -> Result<tokio::sync::mpsc::Receiver<Result<TextChunk, ProviderError>>, ProviderError> {
        Self::validate(&request)?;

        let model = self.migrate_model(&request.model);
        let url = format!(
            "{}/models/{}:streamGenerateContent?alt=sse",
            self.base_url, model
        );
        let body = Self::build_body(&request);

        debug!(provider = "gemini", model = %model, "Sending streaming request");

        let response = self.send_with_retry(&url, &request.api_key, &body).await?;

        let (tx, rx) = tokio::sync::mpsc::channel(64);

        tokio::spawn(async move {
            let mut byte_stream = response.bytes_stream();
            let mut buffer = String::new();
            let mut emitted_text = false;
            let mut finish: Option<FinishReason> = None;
            let mut block_reason: Option<String> = None;

            'outer: while let Some(chunk_result) = byte_stream.next().await {
                let bytes = match chunk_result {
                    Ok(b) => b,
                    Err(e) => {
                        let _ = tx
                            .send(Err(ProviderError::Transport(e.to_string())))
                            .await;
                        return;
                    }
                };

                buffer.push_str(&String::from_utf8_lossy(&bytes));

                while let Some(line_end) = buffer.find('\n') {
                    let line = buffer[..line_end].trim_end_matches('\r').to_string();
                    buffer = buffer[line_end + 1..].to_string();

                    if line.is_empty() || line.starts_with(':') {
                        continue;
                    }

                    let Some(data) = line.strip_prefix("data: ") else {
                        continue;
                    };
                    let data = data.trim();
                    if data.is_empty() || data == "[DONE]" {
                        continue;
                    }

                    let frame = match parse_stream_frame(data) {
                        Some(f) => f,
                        None => {
                            trace!(data = %data, "Ignoring unparseable Gemini SSE frame");
                            continue;
                        }
                    };

                    if frame.block_reason.is_some() {
                        block_reason = frame.block_reason;
                        break 'outer;
                    }

                    for text in frame.texts {
                        if text.is_empty() {
                            continue;
                        }
                        emitted_text = true;
                        if tx.send(Ok(TextChunk::delta(text))).await.is_err() {
                            // Consumer dropped the receiver — cancelled.
                            return;
                        }
                    }

                    if frame.finish_reason.is_some() {
                        finish = frame.finish_reason;
                    }
                }
            }

            // The contract is "a response exists": when the provider blocked
            // the prompt or the stream ended with zero text, surface one
            // synthetic operator-visible notice instead of silence.
            if let Some(reason) = block_reason {
                let notice = format!("[notice] The provider blocked this request: {reason}");
                if tx.send(Ok(TextChunk::delta(notice))).await.is_err() {
                    return;
                }
                let _ = tx.send(Ok(TextChunk::terminal(FinishReason::Safety))).await;
                return;
            }

            if !emitted_text {
                if tx
                    .send(Ok(TextChunk::delta(EMPTY_COMPLETION_NOTICE)))
                    .await
                    .is_err()
                {
                    return;
                }
            }

            let _ = tx
                .send(Ok(TextChunk::terminal(finish.unwrap_or(FinishReason::Stop))))
                .await;
        });

        Ok(rx)
    }
}

/// One parsed SSE data frame from the Gemini stream.
#[derive(Debug, Default)]
struct StreamFrame {
    texts: Vec<String>,
    finish_reason: Option<FinishReason>,
    block_reason: Option<String>,
}

/// Parse a `data:` frame payload into text deltas and terminal signals.
fn parse_stream_frame(data: &str) -> Option<StreamFrame> {
    let event: serde_json::Value = serde_json::from_str(data).ok()?;
    let mut frame = StreamFrame::default();

    if let Some(reason) = event["promptFeedback"]["blockReason"].as_str() {
        frame.block_reason = Some(reason.to_string());
        return Some(frame);
    }

    let candidate = &event["candidates"][0];

    if let Some(parts) = candidate["content"]["parts"].as_array() {
        for part in parts {
            if let Some(text) = part["text"].as_str() {
                frame.texts.push(text.to_string());
            }
        }
    }

    if let Some(reason) = candidate["finishReason"].as_str() {
        frame.finish_reason = Some(match reason {
            "STOP" => FinishReason::Stop,
            "MAX_TOKENS" => FinishReason::MaxTokens,
            "SAFETY" | "PROHIBITED_CONTENT" | "BLOCKLIST" => FinishReason::Safety,
            other => FinishReason::Other(other.to_string()),
        });
    }

    Some(frame)
}

/// Exponential backoff with nanosecond-derived jitter (no rand dependency).
fn backoff_delay(attempt: u32) -> Duration {
    use std::time::{SystemTime, UNIX_EPOCH};
    let base = BACKOFF_BASE_MS * (1 << attempt.min(6));
    let jitter = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .subsec_nanos() as u64
        % BACKOFF_BASE_MS;
    Duration::from_millis(base + jitter)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constructor() {
        let client = GeminiClient::new();
        assert_eq!(client.name(), "gemini");
        assert_eq!(client.base_url, DEFAULT_BASE_URL);
        assert!(client.legacy_models.is_empty());
    }

    #[test]
    fn constructor_with_base_url() {
        let client = GeminiClient::new().with_base_url("https://proxy.example.com/");
        assert_eq!(client.base_url, "https://proxy.example.com");
    }

    #[test]
    fn legacy_model_migration() {
        let map: HashMap<String, String> =
            [("gemini-1.5-flash".to_string(), "gemini-2.5-flash".to_string())]
                .into_iter()
                .collect();
        let client = GeminiClient::new().with_legacy_models(map);
        assert_eq!(client.migrate_model("gemini-1.5-flash"), "gemini-2.5-flash");
        assert_eq!(client.migrate_model("gemini-2.5-pro"), "gemini-2.5-pro");
    }

    #[test]
    fn empty_api_key_rejected() {
        let request = GenerationRequest::new("  ", "gemini-2.5-flash", "sys", "user");
        let err = GeminiClient::validate(&request).unwrap_err();
        assert!(matches!(err, ProviderError::MissingKey));
    }

    #[test]
    fn body_includes_system_instruction() {
        let request = GenerationRequest::new("key", "gemini-2.5-flash", "Be brief.", "Hello");
        let body = GeminiClient::build_body(&request);
        assert_eq!(
            body["system_instruction"]["parts"][0]["text"].as_str(),
            Some("Be brief.")
        );
        assert_eq!(
            body["contents"][0]["parts"][0]["text"].as_str(),
            Some("Hello")
        );
    }

    #[test]
    fn body_omits_empty_system_instruction() {
        let request = GenerationRequest::new("key", "gemini-2.5-flash", "", "Hello");
        let body = GeminiClient::build_body(&request);
        assert!(body.get("system_instruction").is_none());
    }

    #[test]
    fn body_clamps_temperature() {
        let mut request = GenerationRequest::new("key", "m", "s", "u");
        request.temperature = 9.0;
        let body = GeminiClient::build_body(&request);
        let temp = body["generationConfig"]["temperature"].as_f64().unwrap();
        assert!((temp - 2.0).abs() < f64::EPSILON);
    }

    #[test]
    fn body_attaches_images() {
        let mut request = GenerationRequest::new("key", "m", "s", "u");
        request.images.push(InlineImage {
            mime_type: "image/png".into(),
            data_base64: "aGVsbG8=".into(),
        });
        let body = GeminiClient::build_body(&request);
        assert_eq!(
            body["contents"][0]["parts"][1]["inline_data"]["mime_type"].as_str(),
            Some("image/png")
        );
    }

    #[test]
    fn body_includes_max_tokens() {
        let mut request = GenerationRequest::new("key", "m", "s", "u");
        request.max_tokens = Some(512);
        let body = GeminiClient::build_body(&request);
        assert_eq!(
            body["generationConfig"]["maxOutputTokens"].as_u64(),
            Some(512)
        );
    }

    #[test]
    fn parse_text_frame() {
        let frame = parse_stream_frame(
            r#"{"candidates":[{"content":{"parts":[{"text":"Hello"},{"text":" world"}]}}]}"#,
        )
        .unwrap();
        assert_eq!(frame.texts, vec!["Hello", " world"]);
        assert!(frame.finish_reason.is_none());
        assert!(frame.block_reason.is_none());
    }

    #[test]
    fn parse_finish_frame() {
        let frame = parse_stream_frame(
            r#"{"candidates":[{"content":{"parts":[{"text":"done"}]},"finishReason":"STOP"}]}"#,
        )
        .unwrap();
        assert_eq!(frame.finish_reason, Some(FinishReason::Stop));

        let frame = parse_stream_frame(
            r#"{"candidates":[{"finishReason":"MAX_TOKENS"}]}"#,
        )
        .unwrap();
        assert_eq!(frame.finish_reason, Some(FinishReason::MaxTokens));

        let frame = parse_stream_frame(
            r#"{"candidates":[{"finishReason":"RECITATION"}]}"#,
        )
        .unwrap();
        assert_eq!(
            frame.finish_reason,
            Some(FinishReason::Other("RECITATION".into()))
        );
    }

    #[test]
    fn parse_block_frame() {
        let frame = parse_stream_frame(
            r#"{"promptFeedback":{"blockReason":"SAFETY"}}"#,
        )
        .unwrap();
        assert_eq!(frame.block_reason.as_deref(), Some("SAFETY"));
    }

    #[test]
    fn parse_garbage_returns_none() {
        assert!(parse_stream_frame("not json").is_none());
    }

    #[test]
    fn status_mapping() {
        let err = GeminiClient::status_to_error(429, "slow down".into(), Some(12));
        assert!(matches!(
            err,
            ProviderError::RateLimited {
                retry_after_secs: 12
            }
        ));

        let err = GeminiClient::status_to_error(500, "boom".into(), None);
        assert!(matches!(err, ProviderError::Api { status_code: 500, .. }));
    }

    #[test]
    fn backoff_grows_with_attempts() {
        let first = backoff_delay(1);
        let second = backoff_delay(2);
        assert!(first.as_millis() >= BACKOFF_BASE_MS as u128);
        assert!(second.as_millis() >= 2 * BACKOFF_BASE_MS as u128);
    }
}
