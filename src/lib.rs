//! Backend for a streaming chat client talking to a local Ollama server.
//!
//! [`session::SessionController`] owns the single in-flight response and its
//! cancellation; [`ledger::TokenLedger`] keeps the running token counts and
//! throughput shown next to the conversation.

pub mod config;
pub mod db;
pub mod errors;
pub mod ledger;
pub mod logger;
pub mod ollama_api;
pub mod session;
pub mod ui;

pub use errors::ChatError;
pub use ledger::{estimate_tokens, Exchange, ExchangeUsage, LedgerSnapshot, TokenLedger};
pub use session::{CancelOutcome, SessionController, SessionId, StreamEnd, StreamHandle};
pub use ui::{GenerationControls, HealthCheck, UiSink};
