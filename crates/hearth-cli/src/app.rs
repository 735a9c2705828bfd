//! Command implementations over the on-disk hearth home.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use chrono::Utc;
use hearth_decode::{CancellationToken, Decoder};
use hearth_engine::{ExecutionProvider, SessionOptions};
use hearth_rag::{ChatConfig, ChatReply, ChatService, HashingEmbedder, TextChunker};
use hearth_runtime::{
    write_tiny_model, CpuSession, LogTelemetry, ModelArtifacts, ProviderSelector, TinyModelSpec,
};
use hearth_store::{
    resolve_identity, ChatHistoryStore, ChatTurn, CorpusStore, Document, FileChatStore,
    FileCorpusStore, FileIdentityStore, IdentityStore, StoreLayout, UserId,
};
use hearth_tokenizer::{load_tokenizer, Tokenizer};
use tokio::sync::mpsc;
use tracing::{debug, info};
use uuid::Uuid;

use crate::Cli;

/// Chat config picked up from the home directory when `--config` is absent.
pub const CHAT_CONFIG_FILE: &str = "chat.json";

/// Budget used with the byte-level tokenizer unless one is configured.
///
/// One token per byte makes the default chat budget too small for the
/// prompt templates alone.
pub const BYTE_LEVEL_MAX_TOKENS: usize = 2048;

/// Chat turn end markers, looked up in the tokenizer vocabulary.
const TURN_END_TOKENS: [&str; 2] = ["<|end|>", "<|endoftext|>"];

pub struct App {
    layout: StoreLayout,
    model_dir: PathBuf,
    user: Option<String>,
    provider: Option<ExecutionProvider>,
    config: Option<ChatConfig>,
    identity: FileIdentityStore,
}

impl App {
    pub fn new(home: impl Into<PathBuf>) -> Self {
        let layout = StoreLayout::new(home);
        Self {
            model_dir: layout.model_dir(),
            identity: FileIdentityStore::new(layout.config_path()),
            layout,
            user: None,
            provider: None,
            config: None,
        }
    }

    /// Build from parsed arguments, loading the chat config file if any.
    pub fn from_cli(cli: &Cli) -> Result<Self> {
        let home = cli.home.clone().unwrap_or_else(StoreLayout::default_root);
        let mut app = Self::new(home)
            .with_user(cli.user.clone())
            .with_provider(cli.provider);
        if let Some(dir) = &cli.model_dir {
            app = app.with_model_dir(dir.clone());
        }

        let config_path = match &cli.config {
            Some(path) => Some(path.clone()),
            None => Some(app.layout.root().join(CHAT_CONFIG_FILE)).filter(|p| p.exists()),
        };
        if let Some(path) = config_path {
            let config = ChatConfig::load(&path)?;
            debug!(path = %path.display(), "chat config loaded");
            app = app.with_config(config);
        }
        Ok(app)
    }

    pub fn with_model_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.model_dir = dir.into();
        self
    }

    pub fn with_user(mut self, user: Option<String>) -> Self {
        self.user = user;
        self
    }

    /// Require `provider` instead of picking the best usable one.
    pub fn with_provider(mut self, provider: Option<ExecutionProvider>) -> Self {
        self.provider = provider;
        self
    }

    pub fn with_config(mut self, config: ChatConfig) -> Self {
        self.config = Some(config);
        self
    }

    pub fn layout(&self) -> &StoreLayout {
        &self.layout
    }

    pub fn model_dir(&self) -> &Path {
        &self.model_dir
    }

    pub fn init_model(&self, dir: Option<&Path>, spec: &TinyModelSpec) -> Result<ModelArtifacts> {
        let dir = dir.unwrap_or(&self.model_dir);
        let artifacts = write_tiny_model(dir, spec)
            .with_context(|| format!("failed to write model to {}", dir.display()))?;
        info!(dir = %dir.display(), layers = spec.num_hidden_layers, "tiny model written");
        Ok(artifacts)
    }

    pub async fn import(&self, file: &Path) -> Result<Document> {
        let text = tokio::fs::read_to_string(file)
            .await
            .with_context(|| format!("failed to read {}", file.display()))?;
        let chunker = TextChunker::new(self.chat_config().chunk_size)?;
        let document = chunker.import(&text, &HashingEmbedder::default())?;
        self.corpus()?.put(document.clone()).await?;
        Ok(document)
    }

    pub async fn documents(&self) -> Result<Vec<Document>> {
        Ok(self.corpus()?.list().await?)
    }

    pub async fn delete_document(&self, id: &str) -> Result<()> {
        let id = Uuid::parse_str(id.trim()).with_context(|| format!("invalid document id '{id}'"))?;
        if !self.corpus()?.delete(id).await? {
            bail!("no document with id {id}");
        }
        Ok(())
    }

    /// One retrieval-augmented turn, persisted under the resolved user.
    pub async fn ask(
        &self,
        question: &str,
        max_tokens: Option<usize>,
        cancel: CancellationToken,
        sink: Option<mpsc::UnboundedSender<String>>,
    ) -> Result<ChatReply> {
        let user = self.user().await?;

        let session = CpuSession::load_dir(&self.model_dir, self.session_options()?)
            .with_context(|| {
                format!(
                    "failed to load model from {} (run `hearth init-model` first)",
                    self.model_dir.display()
                )
            })?;
        let tokenizer: Arc<dyn Tokenizer> = Arc::from(load_tokenizer(&self.model_dir)?);
        let config = self.generation_config(tokenizer.as_ref(), max_tokens)?;
        debug!(max_tokens = config.max_tokens, sentinels = ?config.stop_sentinels, "generation config");

        let service = ChatService::new(
            Decoder::new(session).with_telemetry(Arc::new(LogTelemetry::new())),
            tokenizer,
            Arc::new(HashingEmbedder::default()),
            Arc::new(self.corpus()?),
            Arc::new(self.history_store()?),
        )
        .with_config(config);

        let reply = match sink {
            Some(sink) => service.respond_streaming(user.as_str(), question, cancel, sink).await?,
            None => service.respond(user.as_str(), question, cancel).await?,
        };
        Ok(reply)
    }

    /// Persisted turns, or the welcome turn for an empty history.
    pub async fn history(&self) -> Result<Vec<ChatTurn>> {
        let user = self.user().await?;
        let turns = self.history_store()?.get(&user).await?;
        if turns.is_empty() {
            return Ok(vec![ChatTurn::assistant(
                self.chat_config().welcome,
                Utc::now(),
            )]);
        }
        Ok(turns)
    }

    pub async fn clear_history(&self) -> Result<()> {
        let user = self.user().await?;
        self.history_store()?.clear(&user).await?;
        Ok(())
    }

    /// The stored user name.
    pub async fn whoami(&self) -> Result<Option<UserId>> {
        Ok(self.identity.get().await?)
    }

    pub async fn set_user(&self, name: &str) -> Result<UserId> {
        let user = UserId::new(name)?;
        self.identity.set(&user).await?;
        Ok(user)
    }

    async fn user(&self) -> Result<UserId> {
        resolve_identity(self.user.as_deref(), &self.identity)
            .await
            .map_err(|e| anyhow!(e).context("set a user with `hearth whoami --set NAME` or --user"))
    }

    /// Session options on the requested provider, or the best usable one.
    fn session_options(&self) -> Result<SessionOptions> {
        let selector = match self.provider {
            Some(provider) => ProviderSelector::with_provider(provider),
            None => ProviderSelector::auto(),
        }
        .context("no usable execution provider")?;
        Ok(SessionOptions::default().with_provider(selector.active()))
    }

    fn chat_config(&self) -> ChatConfig {
        self.config.clone().unwrap_or_default()
    }

    /// Budget precedence: `--max-tokens`, then the config file, then a
    /// default sized for the tokenizer in use.
    fn generation_config(&self, tokenizer: &dyn Tokenizer, max_tokens: Option<usize>) -> Result<ChatConfig> {
        let mut config = match &self.config {
            Some(config) => config.clone(),
            None if tokenizer.is_byte_level() => ChatConfig::default().with_max_tokens(BYTE_LEVEL_MAX_TOKENS),
            None => ChatConfig::default(),
        };
        if let Some(n) = max_tokens {
            config = config.with_max_tokens(n);
        }

        let sentinels: Vec<_> = TURN_END_TOKENS
            .iter()
            .filter_map(|t| tokenizer.token_id(t))
            .collect();
        if !sentinels.is_empty() {
            config = config.with_stop_sentinels(sentinels);
        }
        config.validate()?;
        Ok(config)
    }

    fn corpus(&self) -> Result<FileCorpusStore> {
        Ok(FileCorpusStore::open(self.layout.corpus_path())?)
    }

    fn history_store(&self) -> Result<FileChatStore> {
        Ok(FileChatStore::open(self.layout.history_path())?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hearth_tokenizer::ByteTokenizer;

    #[test]
    fn byte_tokenizer_gets_large_budget_and_its_sentinels() {
        let dir = tempfile::tempdir().unwrap();
        let app = App::new(dir.path());
        let config = app.generation_config(&ByteTokenizer::new(), None).unwrap();
        assert_eq!(config.max_tokens, BYTE_LEVEL_MAX_TOKENS);
        assert_eq!(config.stop_sentinels, vec![260, 256]);
    }

    #[test]
    fn explicit_budget_wins() {
        let dir = tempfile::tempdir().unwrap();
        let app = App::new(dir.path()).with_config(ChatConfig::default().with_max_tokens(900));
        let tok = ByteTokenizer::new();
        assert_eq!(app.generation_config(&tok, None).unwrap().max_tokens, 900);
        assert_eq!(app.generation_config(&tok, Some(64)).unwrap().max_tokens, 64);
        assert!(app.generation_config(&tok, Some(0)).is_err());
    }

    #[test]
    fn budget_follows_loaded_tokenizer_not_files() {
        let dir = tempfile::tempdir().unwrap();
        let app = App::new(dir.path());
        std::fs::create_dir_all(app.model_dir()).unwrap();
        std::fs::write(app.model_dir().join("tokenizer.json"), "{}").unwrap();
        let config = app.generation_config(&ByteTokenizer::new(), None).unwrap();
        assert_eq!(config.max_tokens, BYTE_LEVEL_MAX_TOKENS);
    }

    #[test]
    fn provider_defaults_to_usable_cpu() {
        let app = App::new("/tmp/hearth-home");
        assert_eq!(app.session_options().unwrap().provider, ExecutionProvider::Cpu);

        let forced = App::new("/tmp/hearth-home").with_provider(Some(ExecutionProvider::Cpu));
        assert_eq!(forced.session_options().unwrap().provider, ExecutionProvider::Cpu);
    }

    #[test]
    fn unavailable_provider_is_rejected() {
        let app = App::new("/tmp/hearth-home").with_provider(Some(ExecutionProvider::Gpu));
        let err = app.session_options().unwrap_err();
        assert!(format!("{err:#}").contains("no usable execution provider"));
    }

    #[test]
    fn model_dir_defaults_under_home() {
        let app = App::new("/tmp/hearth-home");
        assert_eq!(app.model_dir(), Path::new("/tmp/hearth-home/model"));
        let app = app.with_model_dir("/models/tiny");
        assert_eq!(app.model_dir(), Path::new("/models/tiny"));
    }
}
