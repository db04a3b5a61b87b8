use std::time::Duration;

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

mod app;
mod config;
mod handler;
mod ollama;
mod session;
#[cfg(test)]
mod test_support;
mod tui;
mod ui;

use app::App;
use config::Config;
use ollama::{CompletionRequest, OllamaClient};

#[derive(Parser)]
#[command(name = "charla")]
#[command(version, about = "Terminal chat for a local Ollama server")]
struct Cli {
    /// Model to chat with (overrides the configured default)
    #[arg(short, long)]
    model: Option<String>,

    /// Base URL of the Ollama server
    #[arg(long)]
    url: Option<String>,

    /// Completion timeout in seconds
    #[arg(long)]
    timeout: Option<u64>,

    /// Increase log verbosity (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Ask one question and print the reply to stdout
    Ask {
        /// The question to send
        question: String,
    },
    /// List the models the server has pulled
    Models,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_tracing(cli.verbose);

    let config = Config::load().unwrap_or_else(|_| Config::new());
    let (base_url, model, timeout) = resolve_settings(&cli, &config);

    let client = OllamaClient::new(&base_url);

    match cli.command {
        Some(Commands::Ask { question }) => ask(&client, &model, &question, timeout).await,
        Some(Commands::Models) => list_models(&client).await,
        None => run_tui(client, model, timeout).await,
    }
}

/// Effective settings: command-line flag, then config file, then built-in.
fn resolve_settings(cli: &Cli, config: &Config) -> (String, String, Duration) {
    let base_url = cli
        .url
        .clone()
        .unwrap_or_else(|| config.base_url().to_string());
    let model = cli
        .model
        .clone()
        .unwrap_or_else(|| config.model().to_string());
    let timeout = cli
        .timeout
        .map(Duration::from_secs)
        .unwrap_or_else(|| config.timeout());

    (base_url, model, timeout)
}

fn init_tracing(verbosity: u8) {
    let filter = match verbosity {
        0 => EnvFilter::new("warn"),
        1 => EnvFilter::new("info"),
        2 => EnvFilter::new("debug"),
        _ => EnvFilter::new("trace"),
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

/// One-shot question, no terminal UI.
async fn ask(client: &OllamaClient, model: &str, question: &str, timeout: Duration) -> Result<()> {
    if question.is_empty() {
        bail!("the question is empty, nothing to send");
    }

    let request = CompletionRequest {
        model: model.to_string(),
        prompt: question.to_string(),
        timeout,
    };

    let reply = client.complete(&request).await?;
    println!("{reply}");
    Ok(())
}

async fn list_models(client: &OllamaClient) -> Result<()> {
    let models = client.list_models().await?;

    if models.is_empty() {
        println!(
            "No models found. Pull a model with: ollama pull {}",
            config::DEFAULT_MODEL
        );
        return Ok(());
    }

    for model in models {
        println!("{model}");
    }
    Ok(())
}

async fn run_tui(client: OllamaClient, model: String, timeout: Duration) -> Result<()> {
    tui::install_panic_hook();
    let mut terminal = tui::init()?;

    let result = run_loop(&mut terminal, client, model, timeout).await;

    // Always restore the terminal, even when the loop errored
    tui::restore()?;
    result
}

async fn run_loop(
    terminal: &mut tui::Tui,
    client: OllamaClient,
    model: String,
    timeout: Duration,
) -> Result<()> {
    info!(url = client.base_url(), model = %model, "starting chat session");

    let mut events = tui::EventHandler::new();
    let mut app = App::new(client, model, timeout);
    app.refresh_availability();

    while !app.should_quit {
        terminal.draw(|frame| ui::render(&mut app, frame))?;

        if let Some(event) = events.next().await {
            handler::handle_event(&mut app, event).await?;
        }

        app.poll_tasks().await;
    }

    Ok(())
}
