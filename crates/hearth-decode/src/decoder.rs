//! The greedy decoder loop.

use std::sync::Arc;

use hearth_engine::{EngineError, InferenceSession, SessionInputs, SessionOutputs, TokenId};
use hearth_kv::KvCacheStore;
use hearth_runtime::{InferenceMetrics, InferenceTimer, NoopTelemetry, TelemetryHook};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info_span, warn, Span};

use crate::stop::{DecodeState, StopConfig, StopReason};
use crate::{GenerateError, Result};

/// Index of the largest logit. Ties keep the lowest index.
///
/// Any non-finite value is an error, never clamped.
pub fn argmax_last(logits: &[f32]) -> std::result::Result<TokenId, EngineError> {
    if logits.is_empty() {
        return Err(EngineError::Inference("empty logits slice".into()));
    }
    let mut best = 0usize;
    let mut max = f32::NEG_INFINITY;
    for (i, &v) in logits.iter().enumerate() {
        if !v.is_finite() {
            return Err(EngineError::NonFiniteLogit { index: i, value: v });
        }
        if i == 0 || v > max {
            max = v;
            best = i;
        }
    }
    Ok(best as TokenId)
}

/// Drives a session and its KV cache through greedy generations.
///
/// Owns exactly one generation state (the output tokens). A [`Generation`]
/// borrows the decoder mutably, so two generations can never overlap.
pub struct Decoder<S> {
    session: S,
    cache: KvCacheStore,
    output: Vec<TokenId>,
    state: DecodeState,
    telemetry: Arc<dyn TelemetryHook>,
}

impl<S: InferenceSession> Decoder<S> {
    pub fn new(session: S) -> Self {
        let cache = KvCacheStore::new(session.config());
        Self {
            session,
            cache,
            output: Vec::new(),
            state: DecodeState::Init,
            telemetry: Arc::new(NoopTelemetry),
        }
    }

    pub fn with_telemetry(mut self, hook: Arc<dyn TelemetryHook>) -> Self {
        self.telemetry = hook;
        self
    }

    pub fn session(&self) -> &S {
        &self.session
    }

    pub fn session_mut(&mut self) -> &mut S {
        &mut self.session
    }

    pub fn cache(&self) -> &KvCacheStore {
        &self.cache
    }

    /// Prompt plus generated tokens of the current or last generation.
    pub fn output_tokens(&self) -> &[TokenId] {
        &self.output
    }

    pub fn state(&self) -> DecodeState {
        self.state
    }

    /// Start a generation over `prompt`.
    ///
    /// Resets the KV cache and the output sequence. Nothing runs until the
    /// returned iterator is polled.
    pub fn generate(
        &mut self,
        prompt: &[TokenId],
        stop: StopConfig,
        cancel: CancellationToken,
    ) -> Result<Generation<'_, S>> {
        if prompt.is_empty() {
            return Err(GenerateError::EmptyPrompt);
        }
        if prompt.len() > stop.max_tokens {
            return Err(GenerateError::PromptTooLong {
                prompt: prompt.len(),
                budget: stop.max_tokens,
            });
        }

        self.cache.reset();
        self.output.clear();
        self.output.extend_from_slice(prompt);
        self.state = DecodeState::Init;

        let span = info_span!("generate", prompt_len = prompt.len(), max_tokens = stop.max_tokens);
        let timer = InferenceTimer::new(
            self.session.options().provider,
            prompt.len(),
            Arc::clone(&self.telemetry),
        );
        let failures_before = self.cache.dispose_failures();

        Ok(Generation {
            decoder: self,
            stop,
            cancel,
            prompt_len: prompt.len(),
            passes: 0,
            failures_before,
            discard_failures: 0,
            timer: Some(timer),
            metrics: None,
            span,
        })
    }

    /// Run a generation to its terminal state.
    pub fn generate_to_end(
        &mut self,
        prompt: &[TokenId],
        stop: StopConfig,
        cancel: CancellationToken,
    ) -> Result<GenerationReport> {
        self.generate(prompt, stop, cancel)?.finish()
    }

    /// One forward pass over `output[start..]` on top of the cache.
    fn forward(&mut self, start: usize) -> std::result::Result<SessionOutputs, EngineError> {
        let total = self.output.len();
        let mask = vec![1i64; total];
        let positions: Vec<i64> = (start..total).map(|p| p as i64).collect();
        let position_ids = if self.session.needs_position_ids() {
            Some(positions.as_slice())
        } else {
            None
        };
        let inputs = SessionInputs {
            input_ids: &self.output[start..],
            attention_mask: &mask,
            position_ids,
            past: &self.cache,
        };
        self.session.run(inputs)
    }
}

/// A running generation: a lazy, finite iterator of output snapshots.
///
/// Each item is the full token sequence (prompt included) after a non-final
/// token was accepted. The final token is not yielded; read it from
/// [`Generation::tokens`] or the [`GenerationReport`]. Snapshots are
/// suppressed when the session profiles. Dropping an unfinished generation
/// aborts it.
pub struct Generation<'a, S: InferenceSession> {
    decoder: &'a mut Decoder<S>,
    stop: StopConfig,
    cancel: CancellationToken,
    prompt_len: usize,
    passes: usize,
    failures_before: u64,
    discard_failures: u64,
    timer: Option<InferenceTimer>,
    metrics: Option<InferenceMetrics>,
    span: Span,
}

impl<S: InferenceSession> Generation<'_, S> {
    pub fn state(&self) -> DecodeState {
        self.decoder.state
    }

    pub fn tokens(&self) -> &[TokenId] {
        &self.decoder.output
    }

    pub fn forward_passes(&self) -> usize {
        self.passes
    }

    /// Summary of the generation so far.
    pub fn report(&self) -> GenerationReport {
        GenerationReport {
            tokens: self.decoder.output.clone(),
            prompt_len: self.prompt_len,
            state: self.decoder.state,
            forward_passes: self.passes,
            dispose_failures: self.decoder.cache.dispose_failures() - self.failures_before
                + self.discard_failures,
            metrics: self.metrics.clone(),
        }
    }

    /// Drive the generation to its terminal state.
    pub fn finish(mut self) -> Result<GenerationReport> {
        while let Some(item) = self.next() {
            item?;
        }
        Ok(self.report())
    }

    fn terminate(&mut self, state: DecodeState) {
        self.decoder.state = state;
        if self.decoder.session.options().profiling {
            self.decoder.session.end_profiling();
        }
        if let Some(timer) = self.timer.take() {
            self.metrics = Some(timer.finish());
        }
        debug!(
            ?state,
            passes = self.passes,
            tokens = self.decoder.output.len(),
            "generation finished"
        );
    }

    fn discard(&mut self, outputs: SessionOutputs) {
        let failed = outputs.dispose();
        if failed > 0 {
            self.discard_failures += failed as u64;
            warn!(failed, "failed to dispose outputs of a failed pass");
        }
    }

    /// Stop checks in priority order: cancel, end-of-sequence, sentinel, budget.
    fn stop_check(&self, token: TokenId) -> Option<DecodeState> {
        if self.cancel.is_cancelled() {
            Some(DecodeState::Aborted)
        } else if token == self.decoder.session.config().eos_token_id {
            Some(DecodeState::Done(StopReason::EndOfSequence))
        } else if self.stop.is_sentinel(token) {
            Some(DecodeState::Done(StopReason::Sentinel(token)))
        } else if self.decoder.output.len() >= self.stop.max_tokens {
            Some(DecodeState::Done(StopReason::Budget))
        } else {
            None
        }
    }
}

impl<S: InferenceSession> Iterator for Generation<'_, S> {
    type Item = Result<Vec<TokenId>>;

    fn next(&mut self) -> Option<Self::Item> {
        let span = self.span.clone();
        let _enter = span.enter();

        loop {
            let state = self.decoder.state;
            if state.is_terminal() {
                return None;
            }
            if self.cancel.is_cancelled() {
                self.terminate(DecodeState::Aborted);
                return None;
            }

            let start = if state == DecodeState::Init {
                if self.decoder.output.len() >= self.stop.max_tokens {
                    self.terminate(DecodeState::Done(StopReason::Budget));
                    return None;
                }
                0
            } else {
                // The newest token is the only one not yet in the cache.
                self.decoder.output.len() - 1
            };

            let outputs = match self.decoder.forward(start) {
                Ok(outputs) => outputs,
                Err(e) => {
                    self.terminate(DecodeState::Failed);
                    return Some(Err(e.into()));
                }
            };
            self.passes += 1;

            let picked = outputs.last_logits().and_then(argmax_last);
            let token = match picked {
                Ok(token) => token,
                Err(e) => {
                    self.discard(outputs);
                    self.terminate(DecodeState::Failed);
                    return Some(Err(e.into()));
                }
            };

            self.decoder.output.push(token);
            if let Some(timer) = self.timer.as_mut() {
                if state == DecodeState::Init {
                    timer.mark_prefill_complete();
                } else {
                    timer.mark_token();
                }
            }

            if let Err(e) = self.decoder.cache.update(outputs.present) {
                self.terminate(DecodeState::Failed);
                return Some(Err(e.into()));
            }
            self.decoder.state = if state == DecodeState::Init {
                DecodeState::Primed
            } else {
                DecodeState::Stepping
            };

            if let Some(end) = self.stop_check(token) {
                self.terminate(end);
                return None;
            }
            if self.decoder.session.options().profiling {
                continue;
            }
            return Some(Ok(self.decoder.output.clone()));
        }
    }
}

impl<S: InferenceSession> Drop for Generation<'_, S> {
    fn drop(&mut self) {
        if !self.decoder.state.is_terminal() {
            self.terminate(DecodeState::Aborted);
        }
    }
}

/// Outcome of a finished generation.
#[derive(Debug, Clone)]
pub struct GenerationReport {
    /// Prompt followed by every generated token.
    pub tokens: Vec<TokenId>,
    pub prompt_len: usize,
    pub state: DecodeState,
    pub forward_passes: usize,
    /// Buffers that failed to dispose during this generation.
    pub dispose_failures: u64,
    pub metrics: Option<InferenceMetrics>,
}

impl GenerationReport {
    /// Tokens after the prompt.
    pub fn generated(&self) -> &[TokenId] {
        &self.tokens[self.prompt_len.min(self.tokens.len())..]
    }

    pub fn stop_reason(&self) -> Option<StopReason> {
        match self.state {
            DecodeState::Done(reason) => Some(reason),
            _ => None,
        }
    }

    pub fn is_aborted(&self) -> bool {
        self.state == DecodeState::Aborted
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn argmax_picks_largest() {
        assert_eq!(argmax_last(&[0.1, 3.0, -2.0]).unwrap(), 1);
        assert_eq!(argmax_last(&[-5.0, -1.0, -3.0]).unwrap(), 1);
    }

    #[test]
    fn argmax_ties_keep_lowest_index() {
        assert_eq!(argmax_last(&[1.0, 4.0, 4.0, 4.0]).unwrap(), 1);
        assert_eq!(argmax_last(&[2.0, 2.0]).unwrap(), 0);
    }

    #[test]
    fn argmax_rejects_non_finite() {
        let err = argmax_last(&[1.0, f32::NAN, 2.0]).unwrap_err();
        assert!(matches!(err, EngineError::NonFiniteLogit { index: 1, .. }));
        assert!(argmax_last(&[f32::INFINITY]).is_err());
        assert!(argmax_last(&[]).is_err());
    }

    #[test]
    fn report_generated_suffix() {
        let report = GenerationReport {
            tokens: vec![1, 2, 3, 4],
            prompt_len: 2,
            state: DecodeState::Done(StopReason::Budget),
            forward_passes: 2,
            dispose_failures: 0,
            metrics: None,
        };
        assert_eq!(report.generated(), &[3, 4]);
        assert_eq!(report.stop_reason(), Some(StopReason::Budget));
        assert!(!report.is_aborted());
    }
}
