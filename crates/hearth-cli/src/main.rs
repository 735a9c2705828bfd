use std::io::Write;

use anyhow::Result;
use clap::Parser;
use hearth_cli::{default_filter, App, Cli, Command, DocsCommand, HistoryCommand};
use hearth_decode::CancellationToken;
use hearth_runtime::TinyModelSpec;
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(default_filter(cli.verbose))),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let app = App::from_cli(&cli)?;

    match cli.command {
        Command::InitModel {
            dir,
            layers,
            hidden,
            heads,
            kv_heads,
            seed,
        } => {
            let spec = TinyModelSpec {
                hidden_size: hidden,
                num_hidden_layers: layers,
                num_attention_heads: heads,
                num_key_value_heads: kv_heads,
                seed,
                ..TinyModelSpec::default()
            };
            let artifacts = app.init_model(dir.as_deref(), &spec)?;
            println!("graph:   {}", artifacts.graph.display());
            println!("weights: {}", artifacts.weights.display());
            println!("config:  {}", artifacts.config.display());
        }
        Command::Import { file } => {
            let doc = app.import(&file).await?;
            println!("imported {} ({} chunks)", doc.id, doc.chunks.len());
        }
        Command::Docs { command } => match command {
            DocsCommand::List => {
                let docs = app.documents().await?;
                if docs.is_empty() {
                    println!("no documents");
                }
                for doc in docs {
                    println!("{}  {:>3} chunks  {}", doc.id, doc.chunks.len(), preview(&doc.content, 60));
                }
            }
            DocsCommand::Delete { id } => {
                app.delete_document(&id).await?;
                println!("deleted {id}");
            }
        },
        Command::Ask {
            question,
            max_tokens,
        } => ask(&app, &question, max_tokens).await?,
        Command::History { command } => match command {
            HistoryCommand::Show => {
                for turn in app.history().await? {
                    let who = if turn.from_user { "you" } else { "assistant" };
                    println!("[{}] {who}: {}", turn.timestamp.format("%Y-%m-%d %H:%M"), turn.text);
                }
            }
            HistoryCommand::Clear => {
                app.clear_history().await?;
                println!("history cleared");
            }
        },
        Command::Whoami { set } => match set {
            Some(name) => println!("{}", app.set_user(&name).await?),
            None => match app.whoami().await? {
                Some(user) => println!("{user}"),
                None => println!("no user set"),
            },
        },
    }

    Ok(())
}

/// Stream the answer to stdout; Ctrl-C stops generation at the next step.
async fn ask(app: &App, question: &str, max_tokens: Option<usize>) -> Result<()> {
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    let printer = tokio::spawn(async move {
        let mut out = std::io::stdout();
        while let Some(piece) = rx.recv().await {
            // stdout going away is not worth failing the turn over
            let _ = out.write_all(piece.as_bytes());
            let _ = out.flush();
        }
    });

    let cancel = CancellationToken::new();
    let interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            interrupt.cancel();
        }
    });

    let reply = app.ask(question, max_tokens, cancel, Some(tx)).await;
    printer.await?;
    let reply = reply?;
    println!();

    if reply.is_apology() {
        println!("{}", reply.answer.text);
    } else if reply.report.as_ref().is_some_and(|r| r.is_aborted()) {
        eprintln!("(cancelled)");
    }
    Ok(())
}

fn preview(text: &str, max_chars: usize) -> String {
    let line = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if line.chars().count() <= max_chars {
        return line;
    }
    let mut cut: String = line.chars().take(max_chars).collect();
    cut.push_str("...");
    cut
}
