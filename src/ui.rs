// Contracts for the page that renders counters and generation controls

use async_trait::async_trait;
use serde::Serialize;

use crate::ledger::LedgerSnapshot;

/// Visibility of the "stop" control and enabled state of the "send" control.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct GenerationControls {
    pub stop_visible: bool,
    pub send_enabled: bool,
}

impl GenerationControls {
    /// Controls while a response is streaming in.
    pub fn streaming() -> Self {
        Self {
            stop_visible: true,
            send_enabled: false,
        }
    }

    /// Controls once no stream is active. Send is only offered when the input
    /// field holds something other than whitespace.
    pub fn idle(pending_input: &str) -> Self {
        Self {
            stop_visible: false,
            send_enabled: !pending_input.trim().is_empty(),
        }
    }
}

/// Receives every state change the page has to reflect.
///
/// Only `render_tokens`, `set_generation_controls` and `pending_input` are
/// required; the rest default to no-ops so a sink can ignore what it does not
/// display.
pub trait UiSink: Send + Sync {
    fn render_tokens(&self, snapshot: &LedgerSnapshot);

    fn set_generation_controls(&self, controls: GenerationControls);

    /// Current contents of the message input field.
    fn pending_input(&self) -> String;

    fn set_typing_indicator(&self, _visible: bool) {}

    fn show_status(&self, _status: &str) {}

    fn clear_status(&self) {}

    fn stream_chunk(&self, _text: &str) {}
}

/// Refreshes the connection / model status display.
#[async_trait]
pub trait HealthCheck: Send + Sync {
    async fn refresh(&self);
}
