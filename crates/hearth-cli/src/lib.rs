//! # hearth-cli
//!
//! Command-line surface of hearth: model bootstrap, document import, corpus
//! management, one-shot RAG questions and chat history.
//!
//! Argument parsing lives here so it can be tested; [`app::App`] does the
//! work and `main.rs` only prints.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use hearth_engine::ExecutionProvider;

pub mod app;

pub use app::App;

/// hearth: local retrieval-augmented chat
#[derive(Debug, Parser)]
#[command(name = "hearth", version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Data directory for history, corpus and identity (default ~/.hearth).
    #[arg(long, global = true, env = "HEARTH_HOME")]
    pub home: Option<PathBuf>,

    /// Model directory (default <home>/model).
    #[arg(long, global = true, env = "HEARTH_MODEL_DIR")]
    pub model_dir: Option<PathBuf>,

    /// Acting user; falls back to the stored name.
    #[arg(short, long, global = true, env = "HEARTH_USER")]
    pub user: Option<String>,

    /// Execution provider (cpu or gpu); the best usable one when absent.
    #[arg(long, global = true)]
    pub provider: Option<ExecutionProvider>,

    /// Chat config JSON file (default <home>/chat.json when present).
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Enable debug logging.
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Write a tiny seeded model that runs on the CPU session.
    InitModel {
        /// Target directory (default: the model directory).
        dir: Option<PathBuf>,

        #[arg(long, default_value_t = 2)]
        layers: usize,

        #[arg(long, default_value_t = 32)]
        hidden: usize,

        #[arg(long, default_value_t = 4)]
        heads: usize,

        #[arg(long, default_value_t = 2)]
        kv_heads: usize,

        /// Weight seed.
        #[arg(long, default_value_t = 12345)]
        seed: u64,
    },

    /// Chunk, embed and store a text or XML document.
    Import {
        file: PathBuf,
    },

    /// Manage stored documents.
    Docs {
        #[command(subcommand)]
        command: DocsCommand,
    },

    /// Ask one question; the answer streams to stdout and is saved.
    Ask {
        question: String,

        /// Total token budget, prompt included.
        #[arg(short, long)]
        max_tokens: Option<usize>,
    },

    /// Show or clear your chat history.
    History {
        #[command(subcommand)]
        command: HistoryCommand,
    },

    /// Print the stored user name, or store a new one.
    Whoami {
        #[arg(long, value_name = "NAME")]
        set: Option<String>,
    },
}

#[derive(Debug, Subcommand)]
pub enum DocsCommand {
    List,
    Delete { id: String },
}

#[derive(Debug, Subcommand)]
pub enum HistoryCommand {
    Show,
    Clear,
}

/// Log targets of the hearth crates.
const TARGETS: [&str; 9] = [
    "hearth",
    "hearth_cli",
    "hearth_engine",
    "hearth_kv",
    "hearth_runtime",
    "hearth_decode",
    "hearth_tokenizer",
    "hearth_store",
    "hearth_rag",
];

/// Default log filter, overridden by `RUST_LOG`.
pub fn default_filter(verbose: bool) -> String {
    let level = if verbose { "debug" } else { "info" };
    TARGETS
        .iter()
        .map(|t| format!("{t}={level}"))
        .collect::<Vec<_>>()
        .join(",")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_ask_with_budget() {
        let cli = Cli::try_parse_from(["hearth", "ask", "What is X?", "--max-tokens", "512"]).unwrap();
        match cli.command {
            Command::Ask {
                question,
                max_tokens,
            } => {
                assert_eq!(question, "What is X?");
                assert_eq!(max_tokens, Some(512));
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn global_flags_follow_subcommands() {
        let cli = Cli::try_parse_from([
            "hearth", "history", "show", "--user", "anna", "--home", "/tmp/h", "-v",
        ])
        .unwrap();
        assert_eq!(cli.user.as_deref(), Some("anna"));
        assert_eq!(cli.home, Some(PathBuf::from("/tmp/h")));
        assert!(cli.verbose);
        assert!(matches!(
            cli.command,
            Command::History {
                command: HistoryCommand::Show
            }
        ));
    }

    #[test]
    fn init_model_defaults_match_tiny_model() {
        let cli = Cli::try_parse_from(["hearth", "init-model"]).unwrap();
        match cli.command {
            Command::InitModel {
                dir,
                layers,
                hidden,
                heads,
                kv_heads,
                ..
            } => {
                assert_eq!(dir, None);
                assert_eq!((layers, hidden, heads, kv_heads), (2, 32, 4, 2));
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn docs_delete_takes_id() {
        let cli = Cli::try_parse_from(["hearth", "docs", "delete", "abc"]).unwrap();
        assert!(matches!(
            cli.command,
            Command::Docs {
                command: DocsCommand::Delete { ref id }
            } if id == "abc"
        ));
    }

    #[test]
    fn provider_flag_parses() {
        let cli = Cli::try_parse_from(["hearth", "ask", "q", "--provider", "CPU"]).unwrap();
        assert_eq!(cli.provider, Some(ExecutionProvider::Cpu));
        assert!(Cli::try_parse_from(["hearth", "ask", "q", "--provider", "tpu"]).is_err());
    }

    #[test]
    fn missing_subcommand_is_an_error() {
        assert!(Cli::try_parse_from(["hearth"]).is_err());
    }

    #[test]
    fn verbose_raises_filter() {
        let quiet = default_filter(false);
        assert!(quiet.starts_with("hearth=info,"));
        assert!(quiet.contains("hearth_rag=info"));
        assert!(default_filter(true).contains("hearth_decode=debug"));
    }
}
