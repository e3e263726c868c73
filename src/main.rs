#![warn(clippy::all, clippy::pedantic)]
#![allow(
    clippy::doc_markdown,
    clippy::missing_errors_doc,
    clippy::module_name_repetitions,
    clippy::too_many_lines,
    clippy::uninlined_format_args
)]

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{fmt, EnvFilter};

use herald::channels::{spawn_supervised_listener, Channel, ChatRuntime, DiscordChannel};
use herald::config::Config;
use herald::dispatch::{Dispatcher, DISPATCH_QUEUE_DEPTH};
use herald::gateway::{run_gateway, AppState};
use herald::generator::Generator;
use herald::history::{mention_pattern, HistoryBuilder};
use herald::providers::{create_provider, Provider};

/// Herald - Discord bridge bot with an HTTP notification control plane.
#[derive(Parser, Debug)]
#[command(name = "herald")]
#[command(version)]
#[command(about = "Mention-driven LLM replies on Discord, plus HTTP-triggered notifications.", long_about = None)]
struct Cli {
    /// Config directory (default: ~/.herald, or HERALD_CONFIG_DIR)
    #[arg(long, global = true)]
    config_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start the bot and the HTTP gateway (the default)
    Run,
    /// Check configuration and connectivity
    Doctor,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging - respects RUST_LOG env var, defaults to INFO
    let subscriber = fmt::Subscriber::builder()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("Failed to initialize logging")?;

    let config = Config::load_or_init(cli.config_dir.as_deref()).await?;

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => run(config).await,
        Commands::Doctor => doctor(config).await,
    }
}

async fn run(config: Config) -> Result<()> {
    config.require_credentials()?;

    let provider: Arc<dyn Provider> = Arc::from(create_provider(
        &config.provider,
        config.api_key.as_deref(),
    )?);

    // Warm up the provider connection pool so the first real message does
    // not hit a cold-start timeout.
    if let Err(e) = provider.warmup().await {
        tracing::warn!("Provider warmup failed (non-fatal): {e}");
    }

    let generator = Arc::new(Generator::new(
        Arc::clone(&provider),
        config.persona.model.clone(),
        config.generation.temperature,
        Duration::from_secs(config.generation.timeout_secs),
    ));

    let channel = Arc::new(DiscordChannel::new(config.discord_token.clone()));
    let self_id = channel
        .identify()
        .await
        .context("Failed to resolve the bot's Discord identity")?;
    tracing::info!("Logged in as Discord user {self_id}");

    let (event_tx, event_rx) = tokio::sync::mpsc::channel(herald::channels::EVENT_QUEUE_DEPTH);
    let (dispatcher, job_rx) = Dispatcher::channel(DISPATCH_QUEUE_DEPTH);

    spawn_supervised_listener(
        Arc::clone(&channel) as Arc<dyn Channel>,
        event_tx,
        1,
        60,
    );

    let state = AppState {
        generator: Arc::clone(&generator),
        chat: Arc::clone(&channel) as Arc<dyn Channel>,
        dispatcher,
        api_key: Arc::from(config.gateway.api_key.as_str()),
        system_prompt: Arc::from(config.persona.system_prompt.as_str()),
        default_notify_channel_id: config.gateway.default_notify_channel_id,
    };
    let gateway_host = config.gateway.host.clone();
    let gateway_port = config.gateway.port;
    let gateway_task = tokio::spawn(async move {
        run_gateway(&gateway_host, gateway_port, state).await
    });

    let runtime = ChatRuntime {
        channel: Arc::clone(&channel) as Arc<dyn Channel>,
        generator,
        system_prompt: config.persona.system_prompt.clone(),
        history: HistoryBuilder::new(config.history.max_depth),
        mention: mention_pattern(&self_id),
        self_id,
    };

    tokio::select! {
        () = runtime.run(event_rx, job_rx) => {
            tracing::warn!("Chat run-loop exited");
        }
        result = gateway_task => {
            match result {
                Ok(Ok(())) => tracing::warn!("Gateway exited"),
                Ok(Err(e)) => tracing::error!("Gateway failed: {e:#}"),
                Err(e) => tracing::error!("Gateway task panicked: {e}"),
            }
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Shutting down");
        }
    }

    Ok(())
}

async fn doctor(config: Config) -> Result<()> {
    let mut failures = 0usize;

    let mut check = |label: &str, ok: bool, hint: &str| {
        if ok {
            println!("  ok   {label}");
        } else {
            println!("  FAIL {label} ({hint})");
            failures += 1;
        }
    };

    check(
        "discord token configured",
        !config.discord_token.trim().is_empty(),
        "set discord_token or HERALD_DISCORD_TOKEN",
    );
    check(
        "gateway credential configured",
        !config.gateway.api_key.trim().is_empty(),
        "set [gateway] api_key or HERALD_GATEWAY_API_KEY",
    );
    check(
        "notify default channel configured",
        config.gateway.default_notify_channel_id.is_some(),
        "optional; /notify then requires an explicit channel_id",
    );

    match create_provider(&config.provider, config.api_key.as_deref()) {
        Ok(provider) => {
            check("provider resolves", true, "");
            if let Err(e) = provider.warmup().await {
                println!("  warn provider warmup failed: {e}");
            }
        }
        Err(e) => check("provider resolves", false, &e.to_string()),
    }

    if config.discord_token.trim().is_empty() {
        println!("  skip discord connectivity (no token)");
    } else {
        let channel = DiscordChannel::new(config.discord_token.clone());
        check(
            "discord reachable",
            channel.health_check().await,
            "token rejected or network unreachable",
        );
    }

    if failures > 0 {
        anyhow::bail!("{failures} check(s) failed");
    }
    println!("All checks passed");
    Ok(())
}
