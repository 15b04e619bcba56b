// Token accounting and throughput sampling for the lifetime of the app

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::debug;

use crate::ui::UiSink;

const CHARS_PER_TOKEN: u64 = 4;

/// Approximate token count for `text`: one token per four characters, rounded
/// up. No tokenizer is consulted, so this drifts from what the model actually
/// counts; it only stands in until the backend reports real numbers.
///
/// Missing and empty text both count as zero.
pub fn estimate_tokens<'a>(text: impl Into<Option<&'a str>>) -> u64 {
    match text.into() {
        Some(text) => (text.chars().count() as u64).div_ceil(CHARS_PER_TOKEN),
        None => 0,
    }
}

/// Tokens per second, or `None` when either side of the ratio is zero.
fn rate_for(completion_tokens: u64, elapsed: Duration) -> Option<f64> {
    let secs = elapsed.as_secs_f64();
    if completion_tokens == 0 || secs <= 0.0 {
        return None;
    }
    Some(completion_tokens as f64 / secs)
}

/// Counters as the page displays them.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct LedgerSnapshot {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    /// Tokens/second of the most recently completed response.
    pub last_rate: Option<f64>,
}

/// Where the token counts of one exchange come from.
#[derive(Debug, Clone, PartialEq)]
pub enum ExchangeUsage {
    /// Counts supplied by the backend. When present they replace the estimate
    /// for both sides of the exchange; `generation` is the backend-measured
    /// time spent producing the completion.
    Reported {
        prompt_tokens: u64,
        completion_tokens: u64,
        generation: Option<Duration>,
    },
    /// Nothing reported; estimate both sides from text length.
    Estimated,
}

/// One user prompt and the (possibly partial) response it produced.
#[derive(Debug, Clone, PartialEq)]
pub struct Exchange {
    pub user_text: String,
    pub ai_text: String,
    pub usage: ExchangeUsage,
}

impl Exchange {
    pub fn estimated(user_text: impl Into<String>, ai_text: impl Into<String>) -> Self {
        Self {
            user_text: user_text.into(),
            ai_text: ai_text.into(),
            usage: ExchangeUsage::Estimated,
        }
    }

    /// Prompt and completion counts, preferring backend-reported numbers.
    pub fn token_counts(&self) -> (u64, u64) {
        match self.usage {
            ExchangeUsage::Reported {
                prompt_tokens,
                completion_tokens,
                ..
            } => (prompt_tokens, completion_tokens),
            ExchangeUsage::Estimated => (
                estimate_tokens(self.user_text.as_str()),
                estimate_tokens(self.ai_text.as_str()),
            ),
        }
    }
}

#[derive(Debug, Default)]
struct LedgerState {
    prompt_tokens: u64,
    completion_tokens: u64,
    last_rate: Option<f64>,
    timing_started: Option<Instant>,
    /// Bumped by every reset.
    epoch: u64,
}

impl LedgerState {
    fn snapshot(&self) -> LedgerSnapshot {
        LedgerSnapshot {
            prompt_tokens: self.prompt_tokens,
            completion_tokens: self.completion_tokens,
            last_rate: self.last_rate,
        }
    }

    fn apply(&mut self, prompt_delta: u64, completion_delta: u64, rate: Option<f64>) {
        self.prompt_tokens = self.prompt_tokens.saturating_add(prompt_delta);
        self.completion_tokens = self.completion_tokens.saturating_add(completion_delta);
        if let Some(rate) = rate.filter(|r| r.is_finite() && *r > 0.0) {
            if completion_delta > 0 {
                self.last_rate = Some(rate);
            }
        }
    }
}

/// Cumulative prompt/completion counts plus the last throughput sample.
///
/// Constructed once and shared by `Arc`; every change to the counters is
/// pushed to the optional [`UiSink`].
pub struct TokenLedger {
    state: Mutex<LedgerState>,
    sink: Option<Arc<dyn UiSink>>,
}

impl TokenLedger {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(LedgerState::default()),
            sink: None,
        }
    }

    pub fn with_sink(sink: Arc<dyn UiSink>) -> Self {
        Self {
            state: Mutex::new(LedgerState::default()),
            sink: Some(sink),
        }
    }

    fn lock(&self) -> MutexGuard<'_, LedgerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn publish(&self, snapshot: LedgerSnapshot) -> LedgerSnapshot {
        if let Some(sink) = &self.sink {
            sink.render_tokens(&snapshot);
        }
        snapshot
    }

    pub fn snapshot(&self) -> LedgerSnapshot {
        self.lock().snapshot()
    }

    /// Estimates both sides of an exchange and adds them to the totals. The
    /// rate sample is only replaced when `elapsed` is non-zero and the response
    /// produced at least one token.
    pub fn record_exchange<'a>(
        &self,
        user_text: impl Into<Option<&'a str>>,
        ai_text: impl Into<Option<&'a str>>,
        elapsed: Option<Duration>,
    ) -> LedgerSnapshot {
        let prompt = estimate_tokens(user_text);
        let completion = estimate_tokens(ai_text);
        let rate = elapsed.and_then(|elapsed| rate_for(completion, elapsed));
        self.record_delta(prompt, completion, rate)
    }

    /// Adds already-known counts. A missing, zero or negative `rate` leaves the
    /// previous sample in place.
    pub fn record_delta(
        &self,
        prompt_delta: u64,
        completion_delta: u64,
        rate: Option<f64>,
    ) -> LedgerSnapshot {
        let snapshot = {
            let mut state = self.lock();
            state.apply(prompt_delta, completion_delta, rate);
            state.snapshot()
        };
        debug!(
            prompt = snapshot.prompt_tokens,
            completion = snapshot.completion_tokens,
            rate = ?snapshot.last_rate,
            "token ledger updated"
        );
        self.publish(snapshot)
    }

    /// Reset generation the counters belong to. A stream started under an
    /// older epoch no longer counts towards them.
    pub fn epoch(&self) -> u64 {
        self.lock().epoch
    }

    /// Settles the accounting for a finished stream that started under
    /// `epoch`. Only a stream that ran to completion may contribute a rate
    /// sample; a cancelled one adds its counts and leaves the stopwatch alone,
    /// since it may already be timing a newer stream. A stream from before the
    /// last reset adds nothing.
    pub fn record_stream(&self, epoch: u64, exchange: &Exchange, completed: bool) -> LedgerSnapshot {
        let (prompt, completion) = exchange.token_counts();
        let snapshot = {
            let mut state = self.lock();
            if state.epoch != epoch {
                if completed {
                    state.timing_started = None;
                }
                debug!(epoch, current = state.epoch, "dropping usage from before the last reset");
                return state.snapshot();
            }

            let rate = if !completed {
                None
            } else if let ExchangeUsage::Reported {
                generation: Some(generation),
                ..
            } = exchange.usage
            {
                state.timing_started = None;
                rate_for(completion, generation)
            } else {
                state
                    .timing_started
                    .take()
                    .and_then(|started| rate_for(completion, started.elapsed()))
            };
            state.apply(prompt, completion, rate);
            state.snapshot()
        };
        debug!(
            prompt = snapshot.prompt_tokens,
            completion = snapshot.completion_tokens,
            rate = ?snapshot.last_rate,
            "token ledger updated"
        );
        self.publish(snapshot)
    }

    /// Starts the stopwatch, discarding any unfinished measurement.
    pub fn start_timing(&self) {
        self.lock().timing_started = Some(Instant::now());
    }

    /// Stops the stopwatch and returns the throughput it measured. Returns
    /// `None` when timing was never started or no tokens were produced. The
    /// measurement is one-shot: a started stopwatch is cleared either way.
    pub fn stop_timing(&self, completion_tokens: u64) -> Option<f64> {
        let started = self.lock().timing_started.take()?;
        rate_for(completion_tokens, started.elapsed())
    }

    /// Abandons a running measurement without producing a sample.
    pub fn clear_timing(&self) {
        self.lock().timing_started = None;
    }

    /// Zeroes the counters and drops the rate sample.
    pub fn reset(&self) -> LedgerSnapshot {
        let snapshot = {
            let mut state = self.lock();
            state.prompt_tokens = 0;
            state.completion_tokens = 0;
            state.last_rate = None;
            state.epoch += 1;
            state.snapshot()
        };
        debug!("token ledger reset");
        self.publish(snapshot)
    }
}

impl Default for TokenLedger {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[derive(Default)]
    struct RenderLog(Mutex<Vec<LedgerSnapshot>>);

    impl UiSink for RenderLog {
        fn render_tokens(&self, snapshot: &LedgerSnapshot) {
            self.0.lock().unwrap().push(*snapshot);
        }
        fn set_generation_controls(&self, _controls: crate::ui::GenerationControls) {}
        fn pending_input(&self) -> String {
            String::new()
        }
    }

    #[test]
    fn estimate_rounds_up_per_four_chars() {
        assert_eq!(estimate_tokens(""), 0);
        assert_eq!(estimate_tokens(None::<&str>), 0);
        assert_eq!(estimate_tokens("a"), 1);
        assert_eq!(estimate_tokens("abcd"), 1);
        assert_eq!(estimate_tokens("abcde"), 2);
        assert_eq!(estimate_tokens("abcdefgh"), 2);
    }

    #[test]
    fn estimate_counts_characters_not_bytes() {
        // four chars, twelve bytes
        assert_eq!(estimate_tokens("日本語!"), 1);
    }

    #[test]
    fn record_exchange_scenario() {
        let ledger = TokenLedger::new();
        let snap = ledger.record_exchange(
            "Hello, this is a test message from the user.",
            "This is a test response from the AI assistant.",
            Some(Duration::from_millis(1500)),
        );
        assert_eq!(snap.prompt_tokens, 11);
        assert_eq!(snap.completion_tokens, 12);
        assert_eq!(snap.last_rate, Some(8.0));
    }

    #[test]
    fn missing_timing_keeps_previous_rate() {
        let ledger = TokenLedger::new();
        ledger.record_exchange("abcd", "abcdefgh", Some(Duration::from_secs(1)));
        let snap = ledger.record_exchange("abcd", "abcd", None);
        assert_eq!(snap.last_rate, Some(2.0));
        assert_eq!(snap.prompt_tokens, 2);
        assert_eq!(snap.completion_tokens, 3);

        let snap = ledger.record_exchange("abcd", "", Some(Duration::from_secs(1)));
        assert_eq!(snap.last_rate, Some(2.0));

        let snap = ledger.record_exchange("abcd", "abcd", Some(Duration::ZERO));
        assert_eq!(snap.last_rate, Some(2.0));
    }

    #[test]
    fn counters_are_sum_of_deltas() {
        let ledger = TokenLedger::new();
        let deltas = [(3, 5, None), (0, 0, Some(4.0)), (10, 1, Some(-1.0)), (2, 7, Some(12.5))];
        let mut expected = (0, 0);
        for (p, c, rate) in deltas {
            ledger.record_delta(p, c, rate);
            expected.0 += p;
            expected.1 += c;
        }
        ledger.record_exchange("abcdefghi", None::<&str>, None);
        expected.0 += 3;

        let snap = ledger.snapshot();
        assert_eq!((snap.prompt_tokens, snap.completion_tokens), expected);
        // zero completion and negative rates never become samples
        assert_eq!(snap.last_rate, Some(12.5));
    }

    #[test]
    fn reset_clears_everything() {
        let ledger = TokenLedger::new();
        ledger.record_delta(40, 60, Some(9.0));
        ledger.reset();
        assert_eq!(ledger.snapshot(), LedgerSnapshot::default());
    }

    #[test]
    fn stop_timing_without_start_is_none() {
        let ledger = TokenLedger::new();
        assert_eq!(ledger.stop_timing(10), None);
    }

    #[test]
    fn stop_timing_with_zero_tokens_is_none() {
        let ledger = TokenLedger::new();
        ledger.start_timing();
        assert_eq!(ledger.stop_timing(0), None);
        // one-shot: the stopwatch is gone afterwards
        assert_eq!(ledger.stop_timing(10), None);
    }

    #[test]
    fn stop_timing_measures_throughput() {
        let ledger = TokenLedger::new();
        let outer = Instant::now();
        ledger.start_timing();
        std::thread::sleep(Duration::from_millis(50));
        let rate = ledger.stop_timing(100).expect("rate");
        let expected = 100.0 / outer.elapsed().as_secs_f64();

        // the measured interval sits inside [50ms, outer]
        assert!(rate >= expected && rate <= 2000.0, "rate {rate}, expected {expected}");
        assert!((rate - expected).abs() / expected < 0.05, "rate {rate}, expected {expected}");
        assert_eq!(ledger.stop_timing(100), None);
    }

    #[test]
    fn cancelled_stream_never_sets_rate() {
        let ledger = TokenLedger::new();
        ledger.start_timing();
        let exchange = Exchange::estimated("abcd", "abcdabcd");
        let snap = ledger.record_stream(ledger.epoch(), &exchange, false);
        assert_eq!(snap.prompt_tokens, 1);
        assert_eq!(snap.completion_tokens, 2);
        assert_eq!(snap.last_rate, None);
        // the stopwatch may belong to a newer stream and keeps running
        std::thread::sleep(Duration::from_millis(5));
        assert!(ledger.stop_timing(2).is_some());
    }

    #[test]
    fn reported_usage_takes_precedence_over_estimate() {
        let ledger = TokenLedger::new();
        let exchange = Exchange {
            user_text: "a".repeat(400),
            ai_text: "b".repeat(400),
            usage: ExchangeUsage::Reported {
                prompt_tokens: 26,
                completion_tokens: 30,
                generation: Some(Duration::from_secs(2)),
            },
        };
        let snap = ledger.record_stream(ledger.epoch(), &exchange, true);
        assert_eq!(
            snap,
            LedgerSnapshot {
                prompt_tokens: 26,
                completion_tokens: 30,
                last_rate: Some(15.0),
            }
        );
    }

    #[test]
    fn sink_sees_every_mutation() {
        let log = Arc::new(RenderLog::default());
        let ledger = TokenLedger::with_sink(log.clone());
        ledger.record_delta(1, 2, None);
        ledger.record_exchange("abcd", "abcd", None);
        ledger.reset();

        let renders = log.0.lock().unwrap();
        assert_eq!(renders.len(), 3);
        assert_eq!(renders[1].prompt_tokens, 2);
        assert_eq!(renders[2], LedgerSnapshot::default());
    }

    #[test]
    fn usage_from_before_reset_is_dropped() {
        let ledger = TokenLedger::new();
        let epoch = ledger.epoch();
        ledger.record_delta(5, 5, Some(3.0));
        ledger.reset();
        assert_ne!(ledger.epoch(), epoch);

        let stale = Exchange::estimated("old prompt", "old partial");
        assert_eq!(ledger.record_stream(epoch, &stale, false), LedgerSnapshot::default());
        assert_eq!(ledger.record_stream(epoch, &stale, true), LedgerSnapshot::default());

        let current = ledger.record_stream(ledger.epoch(), &stale, false);
        assert_eq!((current.prompt_tokens, current.completion_tokens), (3, 3));
    }
}
