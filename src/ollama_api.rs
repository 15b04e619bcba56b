// Handles communication with the Ollama chat API

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::errors::ChatError;
use crate::ledger::{Exchange, ExchangeUsage, LedgerSnapshot};
use crate::session::{SessionController, SessionId, StreamEnd, StreamHandle};
use crate::ui::{HealthCheck, UiSink};

pub const DEFAULT_BASE_URL: &str = "http://localhost:11434";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".into(),
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant".into(),
            content: content.into(),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct ChunkMessage {
    #[serde(default)]
    pub content: String,
}

/// One line of an `/api/chat` response stream. The final line (`done: true`)
/// carries the backend's own token accounting.
#[derive(Debug, Default, Deserialize)]
pub struct ChatChunk {
    #[serde(default)]
    pub message: Option<ChunkMessage>,
    #[serde(default)]
    pub done: bool,
    pub prompt_eval_count: Option<u64>,
    pub eval_count: Option<u64>,
    /// Nanoseconds spent generating the completion.
    pub eval_duration: Option<u64>,
}

impl ChatChunk {
    pub fn content(&self) -> &str {
        self.message.as_ref().map_or("", |m| m.content.as_str())
    }

    /// Reported usage, if the chunk carries both counts. Ollama leaves out
    /// `prompt_eval_count` when the prompt was served from its cache; a half
    /// report is not used.
    pub fn usage(&self) -> Option<ExchangeUsage> {
        let (prompt_tokens, completion_tokens) = (self.prompt_eval_count?, self.eval_count?);
        Some(ExchangeUsage::Reported {
            prompt_tokens,
            completion_tokens,
            generation: self
                .eval_duration
                .filter(|ns| *ns > 0)
                .map(Duration::from_nanos),
        })
    }
}

/// Splits a newline-delimited JSON byte stream into chunks. Network reads do
/// not line up with lines, so a partial line is held until the rest arrives.
#[derive(Debug, Default)]
pub struct NdjsonDecoder {
    buffer: Vec<u8>,
}

impl NdjsonDecoder {
    pub fn push(&mut self, bytes: &[u8]) -> Vec<ChatChunk> {
        self.buffer.extend_from_slice(bytes);

        let mut chunks = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            if let Some(chunk) = parse_line(&line) {
                chunks.push(chunk);
            }
        }
        chunks
    }

    /// Parses whatever is left once the stream has ended.
    pub fn finish(&mut self) -> Option<ChatChunk> {
        let rest = std::mem::take(&mut self.buffer);
        parse_line(&rest)
    }
}

fn parse_line(line: &[u8]) -> Option<ChatChunk> {
    let text = String::from_utf8_lossy(line);
    let text = text.trim();
    if text.is_empty() {
        return None;
    }
    match serde_json::from_str(text) {
        Ok(chunk) => Some(chunk),
        Err(e) => {
            debug!(error = %e, line = %text, "skipping malformed stream line");
            None
        }
    }
}

/// Stream handle backed by a cancellation token shared with the pump.
#[derive(Debug, Clone)]
pub struct CancelTokenHandle {
    token: CancellationToken,
}

impl CancelTokenHandle {
    pub fn new(token: CancellationToken) -> Self {
        Self { token }
    }
}

#[async_trait]
impl StreamHandle for CancelTokenHandle {
    async fn cancel(&self) -> Result<(), ChatError> {
        if self.token.is_cancelled() {
            debug!("stream already cancelled");
        }
        self.token.cancel();
        Ok(())
    }
}

#[derive(Deserialize)]
struct TagsResponse {
    #[serde(default)]
    models: Vec<ModelTag>,
}

#[derive(Deserialize)]
struct ModelTag {
    name: String,
}

#[derive(Debug, Clone)]
pub struct OllamaClient {
    base_url: String,
    client: Client,
}

impl OllamaClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client: Client::new(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub async fn fetch_models(&self) -> Result<Vec<String>, ChatError> {
        let response = self
            .client
            .get(format!("{}/api/tags", self.base_url))
            .timeout(Duration::from_secs(3))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(ChatError::Status(response.status().as_u16()));
        }

        let tags: TagsResponse = serde_json::from_slice(&response.bytes().await?)?;
        Ok(tags.models.into_iter().map(|m| m.name).collect())
    }

    /// Sends a streaming chat request and returns the response once the
    /// headers are in.
    pub async fn open_chat(
        &self,
        model: &str,
        messages: &[ChatMessage],
    ) -> Result<reqwest::Response, ChatError> {
        let response = self
            .client
            .post(format!("{}/api/chat", self.base_url))
            .json(&serde_json::json!({
                "model": model,
                "messages": messages,
                "stream": true,
            }))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(ChatError::Status(response.status().as_u16()));
        }
        Ok(response)
    }
}

/// Shows connection status from `/api/tags`.
pub struct OllamaHealth {
    client: OllamaClient,
    ui: Arc<dyn UiSink>,
}

impl OllamaHealth {
    pub fn new(client: OllamaClient, ui: Arc<dyn UiSink>) -> Self {
        Self { client, ui }
    }
}

#[async_trait]
impl HealthCheck for OllamaHealth {
    async fn refresh(&self) {
        match self.client.fetch_models().await {
            Ok(models) => self
                .ui
                .show_status(&format!("Connected: {} models", models.len())),
            Err(e) => {
                warn!(error = %e, url = %self.client.base_url(), "health check failed");
                self.ui.show_status("Ollama unreachable");
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub model: String,
    /// Conversation so far, ending with the new user prompt.
    pub messages: Vec<ChatMessage>,
}

impl GenerationRequest {
    fn user_text(&self) -> String {
        self.messages
            .iter()
            .rev()
            .find(|m| m.role == "user")
            .map(|m| m.content.clone())
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct GenerationResult {
    pub session: SessionId,
    pub response: String,
    pub cancelled: bool,
    pub ledger: LedgerSnapshot,
}

/// Response text and usage collected so far.
#[derive(Debug)]
pub struct Transcript {
    pub text: String,
    pub usage: ExchangeUsage,
    received_content: bool,
}

impl Default for Transcript {
    fn default() -> Self {
        Self {
            text: String::new(),
            usage: ExchangeUsage::Estimated,
            received_content: false,
        }
    }
}

impl Transcript {
    /// Appends a chunk and forwards its text to the page. Returns `true` on the
    /// final chunk.
    pub fn absorb(&mut self, chunk: ChatChunk, ui: Option<&dyn UiSink>) -> bool {
        let content = chunk.content();
        if !content.is_empty() {
            if let Some(ui) = ui {
                if !self.received_content {
                    ui.set_typing_indicator(false);
                }
                ui.stream_chunk(content);
            }
            self.received_content = true;
            self.text.push_str(content);
        }
        if let Some(usage) = chunk.usage() {
            self.usage = usage;
        }
        chunk.done
    }
}

async fn stream_response(
    client: &OllamaClient,
    request: &GenerationRequest,
    transcript: &mut Transcript,
    ui: Option<&dyn UiSink>,
) -> Result<StreamEnd, ChatError> {
    let mut stream = client
        .open_chat(&request.model, &request.messages)
        .await?
        .bytes_stream();
    let mut decoder = NdjsonDecoder::default();

    while let Some(bytes) = stream.next().await {
        for chunk in decoder.push(&bytes?) {
            if transcript.absorb(chunk, ui) {
                return Ok(StreamEnd::Exhausted);
            }
        }
    }
    if let Some(chunk) = decoder.finish() {
        transcript.absorb(chunk, ui);
    }
    Ok(StreamEnd::Exhausted)
}

/// Streams one response through `controller`.
///
/// The session is registered before the request goes out, so the stop control
/// can interrupt a request that is still connecting. Whatever text arrived
/// before a cancel is returned with `cancelled` set. Transport errors close
/// the session like a cancel and are then returned.
pub async fn run_generation(
    controller: &SessionController,
    client: &OllamaClient,
    request: GenerationRequest,
) -> Result<GenerationResult, ChatError> {
    let token = CancellationToken::new();
    let session = controller
        .start_session(Box::new(CancelTokenHandle::new(token.clone())))
        .await;

    let ui = controller.ui().cloned();

    let mut transcript = Transcript::default();
    let streamed = tokio::select! {
        result = stream_response(client, &request, &mut transcript, ui.as_deref()) => result,
        _ = token.cancelled() => {
            debug!(%session, "generation task was cancelled");
            Ok(StreamEnd::Cancelled)
        }
    };

    let (end, error) = match streamed {
        Ok(end) => (end, None),
        Err(e) => {
            warn!(%session, error = %e, "error generating chat");
            (StreamEnd::Cancelled, Some(e))
        }
    };

    let exchange = Exchange {
        user_text: request.user_text(),
        ai_text: transcript.text,
        usage: transcript.usage,
    };
    let ledger = controller.finish_session(session, end, &exchange);

    if let Some(e) = error {
        return Err(e);
    }
    Ok(GenerationResult {
        session,
        response: exchange.ai_text,
        cancelled: end == StreamEnd::Cancelled || token.is_cancelled(),
        ledger,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ui::GenerationControls;
    use pretty_assertions::assert_eq;
    use std::sync::Mutex;

    #[test]
    fn decoder_joins_lines_split_across_reads() {
        let mut decoder = NdjsonDecoder::default();
        assert!(decoder.push(br#"{"message":{"role":"assistant","con"#).is_empty());
        let chunks = decoder.push(b"tent\":\"Hel\"},\"done\":false}\n{\"message\":{\"content\":\"lo\"},\"done\":false}\n");
        let text: Vec<&str> = chunks.iter().map(|c| c.content()).collect();
        assert_eq!(text, vec!["Hel", "lo"]);
    }

    #[test]
    fn decoder_skips_blank_and_malformed_lines() {
        let mut decoder = NdjsonDecoder::default();
        let chunks = decoder.push(b"\n  \nnot json\n{\"done\":true}\n");
        assert_eq!(chunks.len(), 1);
        assert!(chunks[0].done);
    }

    #[test]
    fn decoder_finish_parses_unterminated_tail() {
        let mut decoder = NdjsonDecoder::default();
        assert!(decoder.push(br#"{"message":{"content":"end"},"done":true}"#).is_empty());
        let chunk = decoder.finish().expect("tail chunk");
        assert_eq!(chunk.content(), "end");
        assert!(decoder.finish().is_none());
    }

    #[test]
    fn final_chunk_reports_usage() {
        let chunk: ChatChunk = serde_json::from_str(
            r#"{"model":"llama3","done":true,"prompt_eval_count":26,"eval_count":290,"eval_duration":4709213000}"#,
        )
        .unwrap();
        assert_eq!(
            chunk.usage(),
            Some(ExchangeUsage::Reported {
                prompt_tokens: 26,
                completion_tokens: 290,
                generation: Some(Duration::from_nanos(4_709_213_000)),
            })
        );
    }

    #[test]
    fn cached_prompt_falls_back_to_estimate() {
        let chunk: ChatChunk = serde_json::from_str(r#"{"done":true,"eval_count":12}"#).unwrap();
        assert_eq!(chunk.usage(), None);
    }

    #[derive(Default)]
    struct ChunkLog {
        typing: Mutex<Vec<bool>>,
        chunks: Mutex<Vec<String>>,
    }

    impl UiSink for ChunkLog {
        fn render_tokens(&self, _snapshot: &LedgerSnapshot) {}
        fn set_generation_controls(&self, _controls: GenerationControls) {}
        fn pending_input(&self) -> String {
            String::new()
        }
        fn set_typing_indicator(&self, visible: bool) {
            self.typing.lock().unwrap().push(visible);
        }
        fn stream_chunk(&self, text: &str) {
            self.chunks.lock().unwrap().push(text.to_string());
        }
    }

    fn content_chunk(text: &str) -> ChatChunk {
        ChatChunk {
            message: Some(ChunkMessage {
                content: text.to_string(),
            }),
            ..ChatChunk::default()
        }
    }

    #[test]
    fn transcript_hides_typing_on_first_content() {
        let log = ChunkLog::default();
        let mut transcript = Transcript::default();

        assert!(!transcript.absorb(ChatChunk::default(), Some(&log)));
        assert!(!transcript.absorb(content_chunk("Hi"), Some(&log)));
        assert!(!transcript.absorb(content_chunk(" there"), Some(&log)));
        assert!(transcript.absorb(
            ChatChunk {
                done: true,
                ..ChatChunk::default()
            },
            Some(&log)
        ));

        assert_eq!(transcript.text, "Hi there");
        assert_eq!(transcript.usage, ExchangeUsage::Estimated);
        assert_eq!(*log.typing.lock().unwrap(), vec![false]);
        assert_eq!(*log.chunks.lock().unwrap(), vec!["Hi", " there"]);
    }

    #[tokio::test]
    async fn token_handle_cancel_is_idempotent() {
        let token = CancellationToken::new();
        let handle = CancelTokenHandle::new(token.clone());
        assert!(handle.cancel().await.is_ok());
        assert!(handle.cancel().await.is_ok());
        assert!(token.is_cancelled());
    }

    #[test]
    fn user_text_is_last_user_message() {
        let request = GenerationRequest {
            model: "llama3".into(),
            messages: vec![
                ChatMessage::user("first"),
                ChatMessage::assistant("reply"),
                ChatMessage::user("second"),
            ],
        };
        assert_eq!(request.user_text(), "second");
    }

    #[test]
    fn base_url_drops_trailing_slash() {
        assert_eq!(OllamaClient::new("http://host:11434/").base_url(), "http://host:11434");
    }
}
