mod logging;

use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};
use toolstream_agents::{OutputSink, Session, SessionManager, SessionState, ToolRegistry};
use toolstream_common::ToolCall;
use toolstream_config::ConfigLoader;
use tracing::info;

#[derive(Parser)]
#[command(name = "toolstream", version, about = "Streaming chat with tool calling")]
struct Cli {
    /// Path to a YAML or TOML config file
    #[arg(long, global = true, env = "TOOLSTREAM_CONFIG")]
    config: Option<PathBuf>,

    /// Default log level when RUST_LOG is unset
    #[arg(long, global = true, default_value = "warn")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Chat with the configured endpoint
    Chat {
        /// Send one prompt and exit instead of reading from stdin
        #[arg(long)]
        prompt: Option<String>,
    },
    /// List the tools that would be advertised to the model
    Tools,
}

struct ConsoleSink;

impl OutputSink for ConsoleSink {
    fn on_text(&self, text: &str) {
        let mut out = std::io::stdout().lock();
        let _ = out.write_all(text.as_bytes());
        let _ = out.flush();
    }

    fn on_tool_call(&self, call: &ToolCall) {
        let args = serde_json::to_string(&call.arguments).unwrap_or_default();
        println!("\n[tool] {}({args})", call.function);
    }

    fn on_tool_result(&self, name: &str, payload: &str) {
        println!("[result] {name}: {payload}");
    }

    fn on_complete(&self) {
        println!();
    }

    fn on_error(&self, reason: &str) {
        eprintln!("\nerror: {reason}");
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init(&cli.log_level);

    let mut loader = ConfigLoader::new();
    if let Some(path) = &cli.config {
        loader = loader.with_path(path);
    }
    let config = loader.load().context("failed to load configuration")?;
    info!(endpoint = %config.endpoint, model = %config.model, "configuration loaded");

    let manager = SessionManager::connect(config).await?;

    match cli.command {
        Command::Tools => {
            let tools = manager.context().registry.list();
            if tools.is_empty() {
                println!("no tools registered");
            }
            for tool in tools {
                println!("{:<24} {}", tool.name, tool.description);
            }
        }
        Command::Chat { prompt: Some(prompt) } => {
            let session = manager.create();
            run_prompt(&session, prompt).await?;
        }
        Command::Chat { prompt: None } => {
            let session = manager.create();
            let mut lines = BufReader::new(tokio::io::stdin()).lines();
            loop {
                print!("> ");
                std::io::stdout().flush()?;
                let Some(line) = lines.next_line().await? else {
                    break;
                };
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                if line == "exit" {
                    break;
                }
                // failures were already reported through the sink
                if run_prompt(&session, line.to_string()).await.is_err()
                    && session.state() == SessionState::Cancelled
                {
                    break;
                }
            }
        }
    }
    Ok(())
}

/// Run one exchange, cancelling it on Ctrl-C.
async fn run_prompt(session: &Session, prompt: String) -> Result<()> {
    let exchange = session.send_prompt(prompt, Arc::new(ConsoleSink))?;
    let wait = exchange.wait();
    tokio::pin!(wait);

    tokio::select! {
        outcome = &mut wait => outcome?,
        _ = tokio::signal::ctrl_c() => {
            session.cancel();
            let _ = wait.await;
            anyhow::bail!("cancelled");
        }
    }
    Ok(())
}
