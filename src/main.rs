//! prompt-improver CLI - improve a prompt with an LLM from the terminal

mod spinner;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use crossterm::style::Stylize;
use prompt_improver::{
    queue::QueueEvent, Config, Coordinator, FileStore, ImproveProvider, KeyValueStore,
    OpenRouterClient, RequestMetadata, SettingsStore, TelemetryRecorder, UiRequest,
};
use serde::Deserialize;
use serde_json::{json, Value};
use spinner::{position_message, WaitSpinner};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinSet;
use tokio_stream::{wrappers::BroadcastStream, StreamExt};
use tracing::{debug, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser)]
#[command(name = "prompt-improver")]
#[command(about = "Rewrite prompts into clearer, more effective ones using an LLM")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Verbosity level
    #[arg(short, long, default_value = "warn")]
    log_level: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Improve a prompt (reads stdin when no text is given)
    Improve {
        /// Prompt text
        text: Option<String>,

        /// Always call the provider, ignoring cached results
        #[arg(long)]
        no_cache: bool,
    },

    /// Serve UI messages as JSON lines over stdin/stdout
    Serve,

    /// Manage user settings (API key, model, system prompt)
    #[command(subcommand)]
    Settings(SettingsCommands),

    /// Inspect usage telemetry
    #[command(subcommand)]
    Telemetry(TelemetryCommands),

    /// Manage configuration
    #[command(subcommand)]
    Config(ConfigCommands),
}

#[derive(Subcommand)]
enum SettingsCommands {
    /// Show stored settings (API key masked)
    Show,

    /// Set a setting (apiKey, model, systemPrompt, typingSpeed)
    Set { key: String, value: String },

    /// Remove a setting, reverting it to its default
    Unset { key: String },

    /// Show the settings store path
    Path,
}

#[derive(Subcommand)]
enum TelemetryCommands {
    /// Show the telemetry summary
    Show {
        /// Print the raw stored JSON
        #[arg(long)]
        json: bool,
    },

    /// Zero all counters and history
    Reset,
}

#[derive(Subcommand)]
enum ConfigCommands {
    /// Initialize configuration file with defaults
    Init {
        /// Overwrite existing config
        #[arg(long)]
        force: bool,
    },

    /// Show current configuration
    Show,

    /// Show configuration file path
    Path,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = match cli.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::WARN,
    };

    // stdout carries results and the serve protocol, so logs go to stderr
    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    match cli.command {
        Commands::Improve { text, no_cache } => run_improve(text, no_cache).await?,
        Commands::Serve => run_serve().await?,
        Commands::Settings(cmd) => run_settings_command(cmd).await?,
        Commands::Telemetry(cmd) => run_telemetry_command(cmd).await?,
        Commands::Config(cmd) => run_config_command(cmd)?,
    }

    Ok(())
}

fn load_config() -> Result<Config> {
    let config = Config::load()
        .with_context(|| format!("Failed to load {}", Config::default_path().display()))?;
    config.validate()?;
    Ok(config)
}

fn open_store(config: &Config) -> Arc<dyn KeyValueStore> {
    Arc::new(FileStore::new(config.data_dir()))
}

/// How long shutdown waits for pending telemetry writes
const TELEMETRY_FLUSH_TIMEOUT: Duration = Duration::from_secs(2);

fn build_coordinator(config: &Config) -> Coordinator {
    let provider: Arc<dyn ImproveProvider> =
        Arc::new(OpenRouterClient::new(config.provider_config()));
    Coordinator::new(config, provider, open_store(config))
}

async fn shutdown(coordinator: &Coordinator) {
    if let Some(cache) = coordinator.cache() {
        debug!("Cache stats at exit:\n{}", cache.stats());
    }
    match tokio::time::timeout(TELEMETRY_FLUSH_TIMEOUT, coordinator.flush_telemetry()).await {
        Ok(true) => {}
        Ok(false) => warn!("Telemetry writer stopped before flushing"),
        Err(_) => warn!(
            "Telemetry not written after {}s, giving up",
            TELEMETRY_FLUSH_TIMEOUT.as_secs()
        ),
    }
}

async fn run_improve(text: Option<String>, no_cache: bool) -> Result<()> {
    let text = match text {
        Some(text) => text,
        None => {
            let mut buf = String::new();
            tokio::io::stdin().read_to_string(&mut buf).await?;
            buf
        }
    };

    let config = load_config()?;
    let coordinator = build_coordinator(&config);
    let mut events = coordinator.subscribe();

    let pending = coordinator.submit(text, RequestMetadata::default().labelled("cli"), !no_cache);
    let id = pending.id().to_string();
    debug!(id = %id, "Submitted improvement request");

    let mut spinner = WaitSpinner::new();
    spinner.start("Improving prompt...");
    let bar = spinner.handle();
    let watcher = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(QueueEvent::Position {
                    id: event_id,
                    position,
                    total,
                }) if event_id == id => bar.set_message(position_message(position, total)),
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    let outcome = pending.await;
    watcher.abort();
    spinner.stop();
    shutdown(&coordinator).await;

    let improvement = outcome.context("Prompt improvement failed")?;
    println!("{}", improvement.text);

    let mut footer = format!(
        "{} | {} tokens | {}ms",
        improvement.model,
        improvement.usage.total(),
        improvement.elapsed.as_millis()
    );
    if improvement.cached {
        footer.push_str(" | cached");
    }
    eprintln!("{}", footer.dark_grey());

    Ok(())
}

/// One line of the serve protocol: a UI message plus an optional correlation token
#[derive(Deserialize)]
struct Envelope {
    #[serde(default)]
    seq: Option<Value>,
    #[serde(flatten)]
    request: UiRequest,
}

async fn run_serve() -> Result<()> {
    let config = load_config()?;
    let coordinator = build_coordinator(&config);
    info!("Serving UI messages on stdin/stdout");

    let (tx, mut rx) = mpsc::unbounded_channel::<Value>();

    let writer = tokio::spawn(async move {
        let mut stdout = tokio::io::stdout();
        while let Some(value) = rx.recv().await {
            let mut line = value.to_string();
            line.push('\n');
            stdout.write_all(line.as_bytes()).await?;
            stdout.flush().await?;
        }
        Ok::<_, std::io::Error>(())
    });

    let event_tx = tx.clone();
    let mut position_events = BroadcastStream::new(coordinator.subscribe());
    let forwarder = tokio::spawn(async move {
        while let Some(event) = position_events.next().await {
            match event.map(|e| serde_json::to_value(&e)) {
                Ok(Ok(value)) => {
                    if event_tx.send(value).is_err() {
                        break;
                    }
                }
                Ok(Err(e)) => warn!("Failed to encode queue event: {}", e),
                Err(e) => debug!("Queue event stream lagged: {}", e),
            }
        }
    });

    let mut replies = JoinSet::new();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let Envelope { seq, mut request } = match serde_json::from_str::<Envelope>(line) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!("Ignoring malformed message: {}", e);
                let _ = tx.send(json!({ "error": format!("Invalid message: {e}") }));
                continue;
            }
        };

        if let UiRequest::ImprovePrompt { id, .. } = &mut request {
            id.get_or_insert_with(|| uuid::Uuid::new_v4().to_string());
        }
        let request_id = match &request {
            UiRequest::ImprovePrompt { id, .. } => id.clone(),
            UiRequest::CancelRequest { id } => Some(id.clone()),
            UiRequest::GetQueueStatus => None,
        };

        let reply = coordinator.handle_message(request);
        let tx = tx.clone();
        replies.spawn(async move {
            let reply = reply.await;
            let mut value = serde_json::to_value(&reply)
                .unwrap_or_else(|e| json!({ "error": e.to_string() }));
            if let Some(object) = value.as_object_mut() {
                if let Some(id) = request_id {
                    object.insert("id".to_string(), Value::from(id));
                }
                if let Some(seq) = seq {
                    object.insert("seq".to_string(), seq);
                }
            }
            let _ = tx.send(value);
        });
    }

    while replies.join_next().await.is_some() {}
    shutdown(&coordinator).await;
    forwarder.abort();
    drop(tx);
    writer.await??;

    Ok(())
}

async fn run_settings_command(cmd: SettingsCommands) -> Result<()> {
    let config = load_config()?;

    match cmd {
        SettingsCommands::Show => {
            let settings = SettingsStore::new(open_store(&config)).load().await?;
            let mut display = settings.clone();
            if display.api_key().is_some() {
                display.api_key = Some("***".to_string());
            }
            println!("{}", serde_json::to_string_pretty(&display)?);
            println!("Effective model: {}", settings.effective_model());
        }
        SettingsCommands::Set { key, value } => {
            SettingsStore::new(open_store(&config))
                .set_field(&key, &value)
                .await?;
            println!("{} updated", key);
        }
        SettingsCommands::Unset { key } => {
            SettingsStore::new(open_store(&config))
                .unset_field(&key)
                .await?;
            println!("{} removed", key);
        }
        SettingsCommands::Path => {
            println!("{}", FileStore::new(config.data_dir()).path().display());
        }
    }

    Ok(())
}

async fn run_telemetry_command(cmd: TelemetryCommands) -> Result<()> {
    let config = load_config()?;
    let telemetry = TelemetryRecorder::new(open_store(&config));

    match cmd {
        TelemetryCommands::Show { json } => {
            if json {
                let snapshot = telemetry.snapshot().await?;
                println!("{}", serde_json::to_string_pretty(&snapshot)?);
            } else {
                print!("{}", telemetry.summary().await?);
            }
        }
        TelemetryCommands::Reset => {
            telemetry.reset().await?;
            println!("{}", "Telemetry reset".green());
        }
    }

    Ok(())
}

fn run_config_command(cmd: ConfigCommands) -> Result<()> {
    match cmd {
        ConfigCommands::Init { force } => {
            let path = Config::default_path();

            if path.exists() && !force {
                println!("Configuration file already exists at: {}", path.display());
                println!("Use --force to overwrite");
                return Ok(());
            }

            Config::default().save()?;

            println!("Configuration file created at: {}", path.display());
            println!();
            println!("Next steps:");
            println!("  1. Store your OpenRouter API key:");
            println!("     prompt-improver settings set apiKey <your_key>");
            println!("  2. Or set the environment variable:");
            println!("     export OPENROUTER_API_KEY=<your_key>");
        }
        ConfigCommands::Show => {
            let config = load_config()?;
            println!("{}", toml::to_string_pretty(&config)?);
        }
        ConfigCommands::Path => {
            let path = Config::default_path();
            println!("{}", path.display());
            if path.exists() {
                println!("(exists)");
            } else {
                println!("(not created yet - run 'prompt-improver config init')");
            }
        }
    }

    Ok(())
}
