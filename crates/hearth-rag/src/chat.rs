//! The chat orchestrator: retrieve, prompt, generate, persist.

use std::sync::Arc;

use chrono::Utc;
use hearth_decode::{Decoder, GenerationReport, StopConfig};
use hearth_engine::InferenceSession;
use hearth_store::{ChatHistoryStore, ChatTurn, CorpusStore, UserId};
use hearth_tokenizer::{DecodingState, Tokenizer};
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::ChatConfig;
use crate::embed::Embedder;
use crate::prompt::{has_context, truncate_at_marker, PromptTemplates};
use crate::retrieve::Retriever;
use crate::{RagError, Result};

/// Text and report of one generated answer.
#[derive(Debug, Clone)]
pub struct Answer {
    /// Generated suffix, decoded and cut at the marker.
    pub text: String,
    /// Retrieved passage, or `None` when the corpus was empty.
    pub context: Option<String>,
    pub report: GenerationReport,
}

/// One persisted exchange.
#[derive(Debug, Clone)]
pub struct ChatReply {
    pub question: ChatTurn,
    pub answer: ChatTurn,
    pub context: Option<String>,
    pub report: Option<GenerationReport>,
    /// Why the answer is the apology.
    pub error: Option<String>,
}

impl ChatReply {
    pub fn is_apology(&self) -> bool {
        self.error.is_some()
    }
}

/// Answers user messages with retrieval-augmented greedy generation.
///
/// The decoder sits behind an async mutex, so a new generation waits until
/// the previous one is terminal. Generation itself runs on the blocking pool.
pub struct ChatService<S> {
    decoder: Arc<Mutex<Decoder<S>>>,
    tokenizer: Arc<dyn Tokenizer>,
    retriever: Retriever,
    corpus: Arc<dyn CorpusStore>,
    history: Arc<dyn ChatHistoryStore>,
    config: ChatConfig,
    templates: PromptTemplates,
}

impl<S: InferenceSession + 'static> ChatService<S> {
    pub fn new(
        decoder: Decoder<S>,
        tokenizer: Arc<dyn Tokenizer>,
        embedder: Arc<dyn Embedder>,
        corpus: Arc<dyn CorpusStore>,
        history: Arc<dyn ChatHistoryStore>,
    ) -> Self {
        let config = ChatConfig::default();
        Self {
            decoder: Arc::new(Mutex::new(decoder)),
            tokenizer,
            retriever: Retriever::new(embedder),
            corpus,
            history,
            templates: config.templates(),
            config,
        }
    }

    pub fn with_config(mut self, config: ChatConfig) -> Self {
        self.templates = config.templates();
        self.config = config;
        self
    }

    pub fn config(&self) -> &ChatConfig {
        &self.config
    }

    pub fn retriever(&self) -> &Retriever {
        &self.retriever
    }

    /// Shared handle to the decoder, e.g. to inspect its session.
    pub fn decoder(&self) -> &Arc<Mutex<Decoder<S>>> {
        &self.decoder
    }

    /// Retrieve, prompt and generate without touching the history.
    pub async fn answer(&self, question: &str, cancel: CancellationToken) -> Result<Answer> {
        self.answer_inner(question, cancel, None).await
    }

    /// Answer `message` and persist both turns under `user`.
    ///
    /// A failed answer is replaced by the configured apology and persisted
    /// the same way. Only identity, empty input and persistence failures are
    /// returned as errors.
    pub async fn respond(&self, user: &str, message: &str, cancel: CancellationToken) -> Result<ChatReply> {
        self.respond_inner(user, message, cancel, None).await
    }

    /// Like [`ChatService::respond`], sending answer text to `sink` as it is
    /// generated. Streamed text stops at the marker.
    pub async fn respond_streaming(
        &self,
        user: &str,
        message: &str,
        cancel: CancellationToken,
        sink: mpsc::UnboundedSender<String>,
    ) -> Result<ChatReply> {
        self.respond_inner(user, message, cancel, Some(sink)).await
    }

    /// Persisted turns of `user`, or a single unpersisted welcome turn.
    pub async fn load_history(&self, user: &str) -> Result<Vec<ChatTurn>> {
        let user = UserId::new(user)?;
        let turns = self.history.get(&user).await?;
        if turns.is_empty() {
            return Ok(vec![ChatTurn::assistant(self.config.welcome.clone(), Utc::now())]);
        }
        Ok(turns)
    }

    pub async fn clear_history(&self, user: &str) -> Result<()> {
        let user = UserId::new(user)?;
        self.history.clear(&user).await?;
        info!(%user, "chat history cleared");
        Ok(())
    }

    async fn respond_inner(
        &self,
        user: &str,
        message: &str,
        cancel: CancellationToken,
        sink: Option<mpsc::UnboundedSender<String>>,
    ) -> Result<ChatReply> {
        let user = UserId::new(user)?;
        let message = message.trim();
        if message.is_empty() {
            return Err(RagError::EmptyMessage);
        }

        let (text, context, report, error) = match self.answer_inner(message, cancel, sink).await {
            Ok(answer) => (answer.text, answer.context, Some(answer.report), None),
            Err(e) => {
                warn!(%user, error = %e, "answer failed, replying with apology");
                (self.config.apology.clone(), None, None, Some(e.to_string()))
            }
        };

        let timestamp = Utc::now();
        let question = ChatTurn::user(message, timestamp);
        let answer = ChatTurn::assistant(text, timestamp);
        self.history
            .append_all(&user, vec![question.clone(), answer.clone()])
            .await?;

        Ok(ChatReply {
            question,
            answer,
            context,
            report,
            error,
        })
    }

    async fn answer_inner(
        &self,
        question: &str,
        cancel: CancellationToken,
        sink: Option<mpsc::UnboundedSender<String>>,
    ) -> Result<Answer> {
        let retrieved = self
            .retriever
            .find_best_chunk(question, self.corpus.as_ref())
            .await?;
        let context = has_context(&retrieved).then(|| retrieved.clone());
        let prompt = self.templates.render(question, &retrieved);
        debug!(context = context.is_some(), prompt_chars = prompt.len(), "prompt rendered");

        let decoder = Arc::clone(&self.decoder).lock_owned().await;
        let job = GenerationJob {
            tokenizer: Arc::clone(&self.tokenizer),
            stop: self.config.stop_config(),
            marker: self.config.marker,
            prompt,
            cancel,
            sink,
        };
        let (text, report) = tokio::task::spawn_blocking(move || {
            let mut guard = decoder;
            job.run(&mut *guard)
        })
        .await
        .map_err(|e| RagError::Task(e.to_string()))??;

        info!(
            state = ?report.state,
            generated = report.generated().len(),
            passes = report.forward_passes,
            "answer generated"
        );
        Ok(Answer {
            text,
            context,
            report,
        })
    }
}

/// Everything a generation needs on the blocking pool.
struct GenerationJob {
    tokenizer: Arc<dyn Tokenizer>,
    stop: StopConfig,
    marker: Option<char>,
    prompt: String,
    cancel: CancellationToken,
    sink: Option<mpsc::UnboundedSender<String>>,
}

impl GenerationJob {
    fn run<S: InferenceSession>(self, decoder: &mut Decoder<S>) -> Result<(String, GenerationReport)> {
        let prompt_ids = self.tokenizer.encode(&self.prompt)?;
        let prompt_len = prompt_ids.len();
        let mut stream = StreamState::default();

        let mut generation = decoder.generate(&prompt_ids, self.stop.clone(), self.cancel.clone())?;
        while let Some(snapshot) = generation.next() {
            let snapshot = snapshot?;
            self.stream(&snapshot[prompt_len..], &mut stream)?;
        }
        let report = generation.report();
        drop(generation);
        self.stream(report.generated(), &mut stream)?;
        stream.decoding.finish();
        self.stream(&[], &mut stream)?;

        let raw = self.tokenizer.decode(report.generated())?;
        Ok((truncate_at_marker(&raw, self.marker), report))
    }

    /// Send newly decoded text of `generated` that lies before the marker.
    fn stream(&self, generated: &[hearth_engine::TokenId], stream: &mut StreamState) -> Result<()> {
        let Some(sink) = &self.sink else {
            return Ok(());
        };
        for &token in generated.iter().skip(stream.fed) {
            self.tokenizer.decode_token(token, &mut stream.decoding)?;
            stream.fed += 1;
        }
        let buffer = stream.decoding.buffer();
        let visible = match self.marker.and_then(|m| buffer.find(m)) {
            Some(idx) => &buffer[..idx],
            None => buffer,
        };
        if visible.len() > stream.sent {
            // A closed receiver only means nobody is watching.
            let _ = sink.send(visible[stream.sent..].to_string());
            stream.sent = visible.len();
        }
        Ok(())
    }
}

#[derive(Default)]
struct StreamState {
    decoding: DecodingState,
    fed: usize,
    sent: usize,
}
