//! Telemetry hooks for generation performance.
//!
//! Provides:
//! - [`InferenceMetrics`]: TTFT, tokens/sec and a generation summary
//! - [`TelemetryHook`] trait: callbacks fired while a generation runs
//! - [`InferenceTimer`]: records timestamps and computes metrics
//! - [`NoopTelemetry`] / [`LogTelemetry`]: built-in hooks

use std::sync::{Arc, Mutex};
use std::time::Instant;

use hearth_engine::ExecutionProvider;
use tracing::info;

/// Aggregate metrics from one generation.
#[derive(Debug, Clone)]
pub struct InferenceMetrics {
    pub provider: ExecutionProvider,
    /// Time to first generated token in milliseconds (prime pass latency).
    pub ttft_ms: f64,
    /// Generated tokens per second, excluding the prime pass.
    pub tokens_per_sec: f64,
    pub prompt_tokens: usize,
    pub generated_tokens: usize,
    pub total_time_ms: f64,
}

/// Callback trait for generation telemetry.
///
/// All methods default to no-ops so hooks can be selective.
pub trait TelemetryHook: Send + Sync {
    /// Called after the prime pass produced the first token.
    fn on_prefill_complete(&self, _ttft_ms: f64) {}

    /// Called after each stepping pass produced a token.
    fn on_token_generated(&self, _token_idx: usize, _elapsed_ms: f64) {}

    /// Called once when the generation reaches a terminal state.
    fn on_generation_complete(&self, _metrics: &InferenceMetrics) {}
}

/// Hook that does nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopTelemetry;

impl TelemetryHook for NoopTelemetry {}

/// Hook that logs each summary and keeps the last one.
#[derive(Debug, Clone, Default)]
pub struct LogTelemetry {
    last_report: Arc<Mutex<Option<InferenceMetrics>>>,
}

impl LogTelemetry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Metrics of the last completed generation.
    pub fn last_metrics(&self) -> Option<InferenceMetrics> {
        self.last_report.lock().ok().and_then(|m| m.clone())
    }
}

impl TelemetryHook for LogTelemetry {
    fn on_generation_complete(&self, metrics: &InferenceMetrics) {
        info!(
            provider = %metrics.provider,
            prompt_tokens = metrics.prompt_tokens,
            generated_tokens = metrics.generated_tokens,
            ttft_ms = metrics.ttft_ms,
            tokens_per_sec = metrics.tokens_per_sec,
            "generation complete"
        );
        if let Ok(mut last) = self.last_report.lock() {
            *last = Some(metrics.clone());
        }
    }
}

/// Records timestamps during a generation to compute [`InferenceMetrics`].
///
/// 1. [`InferenceTimer::new`] at generation start
/// 2. [`InferenceTimer::mark_prefill_complete`] after the prime pass
/// 3. [`InferenceTimer::mark_token`] after each stepping pass
/// 4. [`InferenceTimer::finish`] once terminal
pub struct InferenceTimer {
    provider: ExecutionProvider,
    prompt_tokens: usize,
    start: Instant,
    prefill_end: Option<Instant>,
    token_count: usize,
    hook: Arc<dyn TelemetryHook>,
}

impl InferenceTimer {
    pub fn new(provider: ExecutionProvider, prompt_tokens: usize, hook: Arc<dyn TelemetryHook>) -> Self {
        Self {
            provider,
            prompt_tokens,
            start: Instant::now(),
            prefill_end: None,
            token_count: 0,
            hook,
        }
    }

    pub fn mark_prefill_complete(&mut self) {
        let now = Instant::now();
        self.prefill_end = Some(now);
        self.token_count += 1;
        let ttft_ms = now.duration_since(self.start).as_secs_f64() * 1000.0;
        self.hook.on_prefill_complete(ttft_ms);
    }

    pub fn mark_token(&mut self) {
        self.token_count += 1;
        let elapsed_ms = self.start.elapsed().as_secs_f64() * 1000.0;
        self.hook.on_token_generated(self.token_count, elapsed_ms);
    }

    /// Finalize and fire `on_generation_complete`.
    pub fn finish(self) -> InferenceMetrics {
        let total_time_ms = self.start.elapsed().as_secs_f64() * 1000.0;
        let ttft_ms = self
            .prefill_end
            .map(|t| t.duration_since(self.start).as_secs_f64() * 1000.0)
            .unwrap_or(0.0);

        // The first token belongs to the prime pass.
        let stepped = self.token_count.saturating_sub(1);
        let decode_time_ms = total_time_ms - ttft_ms;
        let tokens_per_sec = if decode_time_ms > 0.0 && stepped > 0 {
            stepped as f64 / (decode_time_ms / 1000.0)
        } else {
            0.0
        };

        let metrics = InferenceMetrics {
            provider: self.provider,
            ttft_ms,
            tokens_per_sec,
            prompt_tokens: self.prompt_tokens,
            generated_tokens: self.token_count,
            total_time_ms,
        };
        self.hook.on_generation_complete(&metrics);
        metrics
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_telemetry_captures_metrics() {
        let hook = LogTelemetry::new();
        assert!(hook.last_metrics().is_none());
        hook.on_generation_complete(&InferenceMetrics {
            provider: ExecutionProvider::Cpu,
            ttft_ms: 12.5,
            tokens_per_sec: 80.0,
            prompt_tokens: 4,
            generated_tokens: 8,
            total_time_ms: 112.5,
        });
        let captured = hook.last_metrics().unwrap();
        assert_eq!(captured.ttft_ms, 12.5);
        assert_eq!(captured.generated_tokens, 8);
    }

    #[test]
    fn timer_counts_prime_and_steps() {
        let log = LogTelemetry::new();
        let mut timer = InferenceTimer::new(ExecutionProvider::Cpu, 3, Arc::new(log.clone()));
        timer.mark_prefill_complete();
        timer.mark_token();
        timer.mark_token();
        let metrics = timer.finish();

        assert_eq!(metrics.prompt_tokens, 3);
        assert_eq!(metrics.generated_tokens, 3);
        assert!(metrics.total_time_ms >= metrics.ttft_ms);
        assert_eq!(log.last_metrics().unwrap().generated_tokens, 3);
    }

    #[test]
    fn timer_without_prefill() {
        let timer = InferenceTimer::new(ExecutionProvider::Cpu, 1, Arc::new(NoopTelemetry));
        let metrics = timer.finish();
        assert_eq!(metrics.ttft_ms, 0.0);
        assert_eq!(metrics.generated_tokens, 0);
        assert_eq!(metrics.tokens_per_sec, 0.0);
    }
}
