// Manages the active generation stream and its cancellation

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::errors::ChatError;
use crate::ledger::{Exchange, LedgerSnapshot, TokenLedger};
use crate::ui::{GenerationControls, HealthCheck, UiSink};

/// Delay before the "Cancelled" status gives way to a fresh health check.
pub const DEFAULT_STATUS_CLEAR_DELAY: Duration = Duration::from_millis(1500);

/// Something that can stop an in-flight response.
///
/// Cancelling an already-cancelled handle must be harmless.
#[async_trait]
pub trait StreamHandle: Send + Sync {
    async fn cancel(&self) -> Result<(), ChatError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct SessionId {
    seq: u64,
    /// Ledger epoch the session was started under.
    epoch: u64,
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.seq)
    }
}

/// How a stream stopped producing output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamEnd {
    /// The backend finished the response.
    Exhausted,
    /// The stream was stopped early: by the user, a replacement, or a
    /// transport failure.
    Cancelled,
}

/// Result of [`SessionController::cancel_session`].
///
/// The controller state is always back to idle when this is returned; the
/// transport result is kept for diagnostics only.
#[derive(Debug)]
pub enum CancelOutcome {
    /// Nothing was streaming.
    Idle,
    Cancelled {
        session: SessionId,
        transport: Result<(), String>,
        /// Fires the health check once the status delay has passed.
        status_refresh: JoinHandle<()>,
    },
}

impl CancelOutcome {
    pub fn transitioned(&self) -> bool {
        matches!(self, CancelOutcome::Cancelled { .. })
    }
}

struct ActiveSession {
    id: SessionId,
    handle: Box<dyn StreamHandle>,
}

#[derive(Default)]
struct GenerationState {
    last_id: u64,
    active: Option<ActiveSession>,
}

/// Owns at most one streaming response at a time.
pub struct SessionController {
    state: Mutex<GenerationState>,
    ledger: Arc<TokenLedger>,
    ui: Option<Arc<dyn UiSink>>,
    health: Option<Arc<dyn HealthCheck>>,
    status_clear_delay: Duration,
}

impl SessionController {
    pub fn new(ledger: Arc<TokenLedger>) -> Self {
        Self {
            state: Mutex::new(GenerationState::default()),
            ledger,
            ui: None,
            health: None,
            status_clear_delay: DEFAULT_STATUS_CLEAR_DELAY,
        }
    }

    pub fn with_ui(mut self, ui: Arc<dyn UiSink>) -> Self {
        self.ui = Some(ui);
        self
    }

    pub fn with_health_check(mut self, health: Arc<dyn HealthCheck>) -> Self {
        self.health = Some(health);
        self
    }

    pub fn with_status_clear_delay(mut self, delay: Duration) -> Self {
        self.status_clear_delay = delay;
        self
    }

    pub fn ledger(&self) -> &Arc<TokenLedger> {
        &self.ledger
    }

    pub fn ui(&self) -> Option<&Arc<dyn UiSink>> {
        self.ui.as_ref()
    }

    fn lock(&self) -> MutexGuard<'_, GenerationState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_active(&self) -> bool {
        self.lock().active.is_some()
    }

    pub fn active_session(&self) -> Option<SessionId> {
        self.lock().active.as_ref().map(|s| s.id)
    }

    /// Installs `handle` as the current stream. A stream that is still active
    /// is taken out in the same step; its cancel runs on a detached task so a
    /// transport that never acknowledges cannot hold up the new session.
    pub async fn start_session(&self, handle: Box<dyn StreamHandle>) -> SessionId {
        let (id, previous) = {
            let mut state = self.lock();
            state.last_id += 1;
            let id = SessionId {
                seq: state.last_id,
                epoch: self.ledger.epoch(),
            };
            let previous = state.active.replace(ActiveSession { id, handle });

            self.ledger.start_timing();
            if let Some(ui) = &self.ui {
                ui.set_generation_controls(GenerationControls::streaming());
                ui.set_typing_indicator(true);
            }
            (id, previous)
        };

        if let Some(previous) = previous {
            debug!(replaced = %previous.id, session = %id, "replacing active session");
            tokio::spawn(async move {
                if let Err(e) = previous.handle.cancel().await {
                    warn!(session = %previous.id, error = %e, "failed to cancel replaced stream");
                }
            });
        }

        info!(session = %id, "generation session started");
        id
    }

    /// Stops the current stream. Idle when nothing is streaming.
    ///
    /// The controller and the page flip to idle before the transport is asked
    /// to cancel, so a slow or failing cancel never leaves the stop control
    /// showing.
    pub async fn cancel_session(&self) -> CancelOutcome {
        let session = {
            let mut state = self.lock();
            let Some(session) = state.active.take() else {
                return CancelOutcome::Idle;
            };

            self.ledger.clear_timing();
            if let Some(ui) = &self.ui {
                ui.set_generation_controls(GenerationControls::idle(&ui.pending_input()));
                ui.set_typing_indicator(false);
                ui.show_status("Cancelled");
            }
            session
        };

        let transport = match session.handle.cancel().await {
            Ok(()) => {
                info!(session = %session.id, "generation cancelled");
                Ok(())
            }
            Err(e) => {
                warn!(session = %session.id, error = %e, "stream cancel failed");
                Err(e.to_string())
            }
        };

        CancelOutcome::Cancelled {
            session: session.id,
            transport,
            status_refresh: self.schedule_status_refresh(),
        }
    }

    fn schedule_status_refresh(&self) -> JoinHandle<()> {
        let delay = self.status_clear_delay;
        let health = self.health.clone();
        let ui = self.ui.clone();

        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            match (health, ui) {
                (Some(health), _) => health.refresh().await,
                (None, Some(ui)) => ui.clear_status(),
                (None, None) => {}
            }
        })
    }

    /// Reports that the stream for `id` stopped and settles its token
    /// accounting.
    ///
    /// Only the active session can end as completed. A session that was
    /// already cancelled or replaced contributes its counts but never a rate
    /// sample, and does not touch the current session. Nothing is counted
    /// for a session started before the last ledger reset.
    pub fn finish_session(&self, id: SessionId, end: StreamEnd, exchange: &Exchange) -> LedgerSnapshot {
        let completed = {
            let mut state = self.lock();
            if state.active.as_ref().is_some_and(|active| active.id == id) {
                state.active = None;
                if let Some(ui) = &self.ui {
                    ui.set_typing_indicator(false);
                    ui.set_generation_controls(GenerationControls::idle(&ui.pending_input()));
                }
                if end == StreamEnd::Cancelled {
                    self.ledger.clear_timing();
                }
                debug!(session = %id, ?end, "generation session finished");
                end == StreamEnd::Exhausted
            } else {
                debug!(session = %id, ?end, "stream ended after its session was closed");
                false
            }
        };

        self.ledger.record_stream(id.epoch, exchange, completed)
    }
}
