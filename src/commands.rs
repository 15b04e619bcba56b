// Handles Tauri command definitions

use std::sync::{Arc, Mutex as StdMutex, PoisonError};

use rusqlite::Connection;
use serde::Serialize;
use tauri::{command, State, Window};
use tokio::sync::Mutex;
use tracing::warn;

use streamchat::config::KEY_SELECTED_MODEL;
use streamchat::db::{self, HistoryEntry};
use streamchat::ollama_api::{self, ChatMessage, GenerationRequest, GenerationResult, OllamaClient};
use streamchat::{GenerationControls, LedgerSnapshot, SessionController, UiSink};

/// Forwards page updates to the webview as window events.
pub struct TauriSink {
    window: Window,
    draft: StdMutex<String>,
}

impl TauriSink {
    pub fn new(window: Window) -> Self {
        Self {
            window,
            draft: StdMutex::new(String::new()),
        }
    }

    fn emit<S: Serialize + Clone>(&self, event: &str, payload: S) {
        if let Err(e) = self.window.emit(event, payload) {
            warn!(event, error = %e, "failed to emit window event");
        }
    }

    fn set_draft(&self, text: String) {
        *self.draft.lock().unwrap_or_else(PoisonError::into_inner) = text;
    }
}

impl UiSink for TauriSink {
    fn render_tokens(&self, snapshot: &LedgerSnapshot) {
        self.emit("token-stats", *snapshot);
    }

    fn set_generation_controls(&self, controls: GenerationControls) {
        self.emit("generation-controls", controls);
    }

    fn pending_input(&self) -> String {
        self.draft.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    fn set_typing_indicator(&self, visible: bool) {
        self.emit("typing-indicator", visible);
    }

    fn show_status(&self, status: &str) {
        self.emit("status-line", status.to_string());
    }

    fn clear_status(&self) {
        self.emit("status-line", String::new());
    }

    fn stream_chunk(&self, text: &str) {
        self.emit("stream-chunk", text.to_string());
    }
}

pub struct AppState {
    pub controller: Arc<SessionController>,
    pub client: OllamaClient,
    pub sink: Arc<TauriSink>,
    pub conversation_id: Mutex<i64>,
}

type Db<'a> = State<'a, Arc<Mutex<Connection>>>;

#[command]
pub async fn load_models(state: State<'_, AppState>) -> Result<Vec<String>, String> {
    state.client.fetch_models().await.map_err(|e| e.to_string())
}

// Get selected model
#[command]
pub async fn get_selected_model(conn: Db<'_>) -> Result<String, String> {
    let conn = conn.lock().await;
    db::get_config_value(&conn, KEY_SELECTED_MODEL)
        .map(|model| model.unwrap_or_default())
        .map_err(|e| e.to_string())
}

// Save selected model
#[command]
pub async fn save_selected_model(conn: Db<'_>, model_name: String) -> Result<(), String> {
    let conn = conn.lock().await;
    db::update_config_value(&conn, KEY_SELECTED_MODEL, &model_name).map_err(|e| e.to_string())
}

/// Tracks the input field so the send control can be re-enabled correctly.
#[command]
pub fn update_input_draft(text: String, state: State<'_, AppState>) {
    let controls = GenerationControls::idle(&text);
    state.sink.set_draft(text);
    if !state.controller.is_active() {
        state.sink.set_generation_controls(controls);
    }
}

#[command]
pub async fn generate_chat(
    prompt: String,
    model: String,
    state: State<'_, AppState>,
    db_conn: Db<'_>,
) -> Result<GenerationResult, String> {
    let conversation_id = *state.conversation_id.lock().await;

    let messages: Vec<ChatMessage> = {
        let conn = db_conn.lock().await;
        db::save_chat_message(&conn, conversation_id, "user", &prompt)
            .map_err(|e| format!("Failed to save user message: {}", e))?;
        db::fetch_chat_history(&conn, conversation_id)
            .map_err(|e| e.to_string())?
            .iter()
            .map(ChatMessage::from)
            .collect()
    };

    let request = GenerationRequest { model, messages };
    let result = ollama_api::run_generation(&state.controller, &state.client, request)
        .await
        .map_err(|e| e.to_string())?;

    if !result.response.is_empty() {
        let conn = db_conn.lock().await;
        db::save_chat_message(&conn, conversation_id, "assistant", &result.response)
            .map_err(|e| format!("Failed to save assistant message: {}", e))?;
    }

    Ok(result)
}

// Abort chat generation
#[command]
pub async fn abort_generation(state: State<'_, AppState>) -> Result<bool, String> {
    Ok(state.controller.cancel_session().await.transitioned())
}

#[command]
pub fn get_token_stats(state: State<'_, AppState>) -> LedgerSnapshot {
    state.controller.ledger().snapshot()
}

#[command]
pub fn reset_token_stats(state: State<'_, AppState>) -> LedgerSnapshot {
    state.controller.ledger().reset()
}

#[command]
pub fn estimate_tokens(text: String) -> u64 {
    streamchat::estimate_tokens(text.as_str())
}

/// Starts an empty conversation: stops any stream and zeroes the counters.
#[command]
pub async fn new_conversation(state: State<'_, AppState>, db_conn: Db<'_>) -> Result<i64, String> {
    state.controller.cancel_session().await;
    state.controller.ledger().reset();

    let next = {
        let conn = db_conn.lock().await;
        db::next_conversation_id(&conn).map_err(|e| e.to_string())?
    };
    *state.conversation_id.lock().await = next;
    Ok(next)
}

#[command]
pub async fn load_chat_history(state: State<'_, AppState>, db_conn: Db<'_>) -> Result<Vec<HistoryEntry>, String> {
    let conversation_id = *state.conversation_id.lock().await;
    let conn = db_conn.lock().await;
    db::fetch_chat_history(&conn, conversation_id).map_err(|e| e.to_string())
}
