use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::{Parser, Subcommand};
#[allow(deprecated)]
use rig::client::completion::CompletionModelHandle;
use rig::client::{CompletionClient, Nothing};
use rig::providers::{anthropic, deepseek, gemini, groq, ollama, openai, openrouter};
use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;
use steward_channels::manager::ChannelManager;
use steward_channels::terminal::TerminalChannel;
use steward_channels::web::WebChannel;
use steward_config::{find_config_path, load_config, save_config, Config, RetryConfig};
use steward_core::agent::config::DEFAULT_SYSTEM_PROMPT;
use steward_core::bus::{ChannelAdapter, MessageBus, OutboundKind, OutboundMessage};
use steward_core::provider::RigProvider;
use steward_core::{
    AgentConfig, AgentLoop, ContextManager, ConversationKey, CycleOutcome, ProviderPool,
    RetryPolicy, ToolRegistry,
};

const VALID_PROVIDERS: &str = "anthropic, openai, ollama, openrouter, deepseek, groq, gemini";

/// Render markdown text for the terminal using termimad.
fn render_markdown(text: &str) -> String {
    let skin = termimad::MadSkin::default();
    format!("\n{}\n", skin.term_text(text))
}

#[derive(Parser)]
#[command(name = "steward", about = "Conversational agent runtime", version)]
struct Cli {
    /// Path to config file
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run interactive CLI chat
    Agent {
        /// Single message mode (non-interactive)
        #[arg(short, long)]
        message: Option<String>,

        /// Conversation key (format: channel:chat_id)
        #[arg(short, long, default_value = "cli:interactive")]
        session: String,
    },
    /// Start the gateway with all enabled channels
    Serve,
    /// Write a default config file if none exists
    Onboard,
    /// Show configuration and provider status
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    let base_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = format!("{base_filter},steward_core::agent=debug");
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new(filter))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config_path = cli.config.unwrap_or_else(find_config_path);

    match cli.command {
        Commands::Status => return run_status(&config_path),
        Commands::Onboard => return run_onboard(&config_path).map(|_| ()),
        _ => {}
    }

    let config = load_config(&config_path)?;

    match cli.command {
        Commands::Agent { message, session } => {
            let key = ConversationKey::parse(&session);
            let terminal = Arc::new(TerminalChannel::stdout().with_renderer(render_markdown));
            let agent = build_agent(&config, terminal)?;
            match message {
                Some(msg) => run_single_message(&agent, &key, &msg).await,
                None => run_interactive(&agent, &key).await,
            }
        }
        Commands::Serve => run_gateway(&config).await,
        Commands::Onboard | Commands::Status => Ok(()),
    }
}

/// Resolve an API key from config, falling back to an environment variable.
fn resolve_api_key(
    provider_cfg: &Option<steward_config::ProviderConfig>,
    env_var: &str,
) -> Option<String> {
    provider_cfg
        .as_ref()
        .and_then(|c| c.api_key.clone())
        .filter(|k| !k.is_empty())
        .or_else(|| std::env::var(env_var).ok().filter(|k| !k.is_empty()))
}

fn api_base(provider_cfg: &Option<steward_config::ProviderConfig>) -> Option<String> {
    provider_cfg
        .as_ref()
        .and_then(|c| c.api_base.clone())
        .filter(|b| !b.is_empty())
}

fn require_key(
    provider_cfg: &Option<steward_config::ProviderConfig>,
    env_var: &str,
    label: &str,
    field: &str,
) -> Result<String> {
    resolve_api_key(provider_cfg, env_var).ok_or_else(|| {
        anyhow::anyhow!(
            "{label} provider selected but no API key found. \
             Set providers.{field}.apiKey in config.json or {env_var} env var."
        )
    })
}

/// Create a completion model for a specific provider + model combination.
#[allow(deprecated)]
fn create_model_for(
    provider: &str,
    model_name: &str,
    config: &Config,
) -> Result<CompletionModelHandle<'static>> {
    if provider.is_empty() {
        anyhow::bail!("No provider configured.\nValid providers: {VALID_PROVIDERS}");
    }
    if model_name.is_empty() {
        anyhow::bail!("No model configured for provider '{provider}'.");
    }
    let providers = &config.providers;

    let handle = match provider {
        "anthropic" => {
            let key = require_key(&providers.anthropic, "ANTHROPIC_API_KEY", "Anthropic", "anthropic")?;
            let client: anthropic::Client = anthropic::Client::builder()
                .api_key(&key)
                .build()
                .map_err(|e| anyhow::anyhow!("Failed to create Anthropic client: {e}"))?;
            let model = client.completion_model(model_name).with_prompt_caching();
            CompletionModelHandle::new(Arc::new(model))
        }
        "openai" => {
            let key = require_key(&providers.openai, "OPENAI_API_KEY", "OpenAI", "openai")?;
            let mut builder = openai::CompletionsClient::builder().api_key(&key);
            if let Some(base) = api_base(&providers.openai) {
                tracing::info!("Using OpenAI provider with custom base: {base}");
                builder = builder.base_url(&base);
            }
            let client: openai::CompletionsClient = builder
                .build()
                .map_err(|e| anyhow::anyhow!("Failed to create OpenAI client: {e}"))?;
            CompletionModelHandle::new(Arc::new(client.completion_model(model_name)))
        }
        "ollama" => {
            let mut builder = ollama::Client::builder().api_key(Nothing);
            if let Some(base) = api_base(&providers.ollama) {
                builder = builder.base_url(&base);
            }
            let client: ollama::Client = builder
                .build()
                .map_err(|e| anyhow::anyhow!("Failed to create Ollama client: {e}"))?;
            CompletionModelHandle::new(Arc::new(client.completion_model(model_name)))
        }
        "openrouter" => {
            let key = require_key(&providers.openrouter, "OPENROUTER_API_KEY", "OpenRouter", "openrouter")?;
            let client: openrouter::Client = openrouter::Client::new(&key)
                .map_err(|e| anyhow::anyhow!("Failed to create OpenRouter client: {e}"))?;
            CompletionModelHandle::new(Arc::new(client.completion_model(model_name)))
        }
        "deepseek" => {
            let key = require_key(&providers.deepseek, "DEEPSEEK_API_KEY", "DeepSeek", "deepseek")?;
            let client: deepseek::Client = deepseek::Client::new(&key)
                .map_err(|e| anyhow::anyhow!("Failed to create DeepSeek client: {e}"))?;
            CompletionModelHandle::new(Arc::new(client.completion_model(model_name)))
        }
        "groq" => {
            let key = require_key(&providers.groq, "GROQ_API_KEY", "Groq", "groq")?;
            let client: groq::Client = groq::Client::new(&key)
                .map_err(|e| anyhow::anyhow!("Failed to create Groq client: {e}"))?;
            CompletionModelHandle::new(Arc::new(client.completion_model(model_name)))
        }
        "gemini" => {
            let key = require_key(&providers.gemini, "GEMINI_API_KEY", "Gemini", "gemini")?;
            let client: gemini::Client = gemini::Client::new(key)
                .map_err(|e| anyhow::anyhow!("Failed to create Gemini client: {e}"))?;
            CompletionModelHandle::new(Arc::new(client.completion_model(model_name)))
        }
        other => {
            anyhow::bail!("Unknown provider '{other}'. Valid providers: {VALID_PROVIDERS}");
        }
    };
    tracing::info!("Using {provider} provider with model '{model_name}'");
    Ok(handle)
}

/// Build the provider pool from `agents.models`. A "default" tier is required.
fn create_provider_pool(config: &Config) -> Result<ProviderPool> {
    let models = &config.agents.models;
    let Some(default) = models.get(ProviderPool::DEFAULT) else {
        anyhow::bail!(
            "No models configured. Set agents.models in config.json with at least a \"default\" entry.\n\
             Example:\n  \
             \"models\": {{ \"default\": {{ \"provider\": \"ollama\", \"model\": \"llama3\" }} }}"
        );
    };

    let provider_for = |tier: &str, model_ref: &steward_config::ModelRef| -> Result<Arc<RigProvider>> {
        let handle = create_model_for(&model_ref.provider, &model_ref.model, config)
            .map_err(|e| anyhow::anyhow!("Failed to create model for tier '{tier}': {e}"))?;
        tracing::info!(
            "Model tier '{tier}': {} / {}",
            model_ref.provider,
            model_ref.model
        );
        Ok(Arc::new(RigProvider::new(
            format!("{}/{}", model_ref.provider, model_ref.model),
            handle,
        )))
    };

    let mut pool = ProviderPool::new(provider_for(ProviderPool::DEFAULT, default)?);
    for (tier, model_ref) in models.iter().filter(|(t, _)| *t != ProviderPool::DEFAULT) {
        pool = pool.with_tier(tier.clone(), provider_for(tier, model_ref)?);
    }
    Ok(pool)
}

fn retry_policy(cfg: &RetryConfig, max_attempts: u32) -> RetryPolicy {
    RetryPolicy {
        max_attempts: max_attempts.max(1),
        initial_delay: Duration::from_millis(cfg.initial_delay_ms),
        max_delay: Duration::from_millis(cfg.max_delay_ms),
        // Backoff never shrinks; a NaN or negative value means a constant delay.
        multiplier: if cfg.multiplier.is_finite() {
            cfg.multiplier.max(1.0)
        } else {
            1.0
        },
        jitter: cfg.jitter,
    }
}

fn agent_config(config: &Config) -> AgentConfig {
    let defaults = &config.agents.defaults;
    let retry = &config.agents.retry;
    AgentConfig {
        system_prompt: if defaults.system_prompt.trim().is_empty() {
            DEFAULT_SYSTEM_PROMPT.to_string()
        } else {
            defaults.system_prompt.clone()
        },
        max_steps: defaults.max_steps,
        max_parallel_tools: defaults.max_parallel_tools,
        context_budget_tokens: defaults.context_budget_tokens,
        max_tokens: u64::from(defaults.max_tokens),
        temperature: f64::from(defaults.temperature),
        stream: defaults.stream,
        supersede_in_flight: defaults.supersede_in_flight,
        cycle_timeout: (defaults.cycle_timeout_secs > 0)
            .then(|| Duration::from_secs(defaults.cycle_timeout_secs)),
        max_consecutive_tool_failures: defaults.max_consecutive_tool_failures,
        retry: retry_policy(retry, retry.max_attempts),
        tool_retry: retry_policy(retry, retry.tool_max_attempts),
    }
}

fn build_agent(config: &Config, channel: Arc<dyn ChannelAdapter>) -> Result<Arc<AgentLoop>> {
    let providers = create_provider_pool(config)?;
    let tools = ToolRegistry::with_builtins();
    tracing::info!("Tools: {}", tools.names().join(", "));
    Ok(Arc::new(AgentLoop::new(
        Arc::new(ContextManager::new()),
        providers,
        Arc::new(tools),
        channel,
        agent_config(config),
    )))
}

/// Run one cycle, cancelling it on Ctrl-C.
async fn run_cycle(agent: &AgentLoop, key: &ConversationKey, input: &str) -> CycleOutcome {
    let run = agent.process_message(key, input, Vec::new());
    tokio::pin!(run);
    tokio::select! {
        outcome = &mut run => outcome,
        _ = tokio::signal::ctrl_c() => {
            agent.cancel(key);
            run.await
        }
    }
}

async fn run_single_message(agent: &AgentLoop, key: &ConversationKey, message: &str) -> Result<()> {
    match run_cycle(agent, key, message).await {
        CycleOutcome::Finalized { .. } => Ok(()),
        CycleOutcome::Failed { failure, .. } => Err(failure.into()),
    }
}

async fn run_interactive(agent: &AgentLoop, key: &ConversationKey) -> Result<()> {
    let history_dir = dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".steward")
        .join("history");
    std::fs::create_dir_all(&history_dir)?;
    let history_path = history_dir.join("cli_history");

    let mut rl = DefaultEditor::new()?;
    let _ = rl.load_history(&history_path);

    println!("steward interactive mode (type /help for commands, Ctrl-D to quit)");
    println!();

    let result = loop {
        match rl.readline("you> ") {
            Ok(line) => {
                let input = line.trim();
                if input.is_empty() {
                    continue;
                }
                let _ = rl.add_history_entry(input);

                match input {
                    "exit" | "quit" | "/exit" | "/quit" | ":q" => break Ok(()),
                    "/help" => {
                        println!("Commands:");
                        println!("  /new     - Start a new conversation");
                        println!("  /history - Show the conversation so far");
                        println!("  /help    - Show this help");
                        println!("  /quit    - Exit");
                        println!("  Ctrl-C while the agent works cancels the request.");
                        println!();
                        continue;
                    }
                    "/new" => {
                        agent.context().evict(key);
                        println!("New conversation started.");
                        println!();
                        continue;
                    }
                    "/history" => {
                        for turn in agent.snapshot(key) {
                            println!("#{} {}", turn.seq(), turn.body().kind());
                        }
                        println!();
                        continue;
                    }
                    _ => {}
                }

                if let CycleOutcome::Finalized {
                    rounds,
                    tool_invocations,
                    ..
                } = run_cycle(agent, key, input).await
                {
                    tracing::debug!("{rounds} round(s), {tool_invocations} tool call(s)");
                }
            }
            Err(ReadlineError::Interrupted) => continue,
            Err(ReadlineError::Eof) => break Ok(()),
            Err(e) => break Err(e.into()),
        }
    };

    let _ = rl.save_history(&history_path);
    result
}

/// Run the gateway: channels, the inbound dispatch loop and the idle sweep.
async fn run_gateway(config: &Config) -> Result<()> {
    tracing::info!("Starting gateway...");

    let mut bus = MessageBus::new(128);
    let agent = build_agent(config, Arc::new(bus.outbound()))?;

    let mut channel_manager = ChannelManager::new(bus.outbound_tx.subscribe());
    if config.channels.web.enabled {
        let web = WebChannel::new(
            config.channels.web.clone(),
            config.gateway.clone(),
            agent.clone(),
        );
        channel_manager.register(Arc::new(web)).await;
        tracing::info!(
            "Web channel registered on {}:{}",
            config.gateway.host,
            config.gateway.port
        );
    }

    let enabled = channel_manager.enabled_channels().await;
    if enabled.is_empty() {
        tracing::warn!("No channels enabled. Configure channels in config.json.");
    } else {
        tracing::info!("Starting channels: {}", enabled.join(", "));
    }
    channel_manager.start_all(bus.inbound_tx.clone()).await?;

    let idle = Duration::from_secs(config.gateway.idle_eviction_secs);
    let sweep = (!idle.is_zero()).then(|| {
        let agent = Arc::downgrade(&agent);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(idle.min(Duration::from_secs(60)));
            loop {
                tick.tick().await;
                let Some(agent) = agent.upgrade() else {
                    break;
                };
                let evicted = agent.evict_idle(idle);
                if !evicted.is_empty() {
                    tracing::info!("Evicted {} idle conversation(s)", evicted.len());
                }
            }
        })
    });

    tracing::info!("Gateway running. Press Ctrl-C to stop.");
    loop {
        let msg = tokio::select! {
            msg = bus.inbound_rx.recv() => match msg {
                Some(m) => m,
                None => {
                    tracing::info!("Inbound channel closed");
                    break;
                }
            },
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Shutting down...");
                break;
            }
        };

        let key = msg.key();
        match msg.content.trim() {
            "/new" => {
                let reply = if agent.context().evict(&key) {
                    "New conversation started."
                } else {
                    "Still working on your last message; send /new again once it finishes."
                };
                if bus
                    .outbound_tx
                    .send(OutboundMessage::new(&key, OutboundKind::Final, reply))
                    .is_err()
                {
                    tracing::warn!("Failed to publish /new acknowledgement");
                }
                continue;
            }
            "/cancel" => {
                agent.cancel(&key);
                continue;
            }
            _ => {}
        }

        let done = agent.on_inbound_message(key.clone(), msg.content, msg.media);
        tokio::spawn(async move {
            match done.await {
                Ok(CycleOutcome::Finalized {
                    rounds,
                    tool_invocations,
                    ..
                }) => tracing::debug!(
                    "[{key}] finished: {rounds} round(s), {tool_invocations} tool call(s)"
                ),
                Ok(CycleOutcome::Failed { failure, .. }) => {
                    tracing::debug!("[{key}] failed: {failure}")
                }
                Err(_) => tracing::warn!("[{key}] worker dropped the message"),
            }
        });
    }

    if let Some(sweep) = sweep {
        sweep.abort();
    }
    channel_manager.stop_all().await?;
    Ok(())
}

/// Write the default config to `config_path`. Returns false if one exists.
fn run_onboard(config_path: &Path) -> Result<bool> {
    if config_path.exists() {
        println!("Config already exists: {}", config_path.display());
        println!("To reset, delete it and run `steward onboard` again.");
        return Ok(false);
    }
    save_config(config_path, &Config::default())?;
    println!("Created config: {}", config_path.display());
    println!("Add a \"default\" entry under agents.models before running `steward agent`.");
    Ok(true)
}

fn run_status(config_path: &Path) -> Result<()> {
    println!("steward status");
    println!();

    if config_path.exists() {
        println!("  Config:    {} (found)", config_path.display());
    } else {
        println!("  Config:    {} (not found, using defaults; run `steward onboard`)", config_path.display());
    }

    let config = load_config(config_path)?;
    println!();

    println!("  Models:");
    if config.agents.models.is_empty() {
        println!("    (none; add a \"default\" entry to agents.models)");
    }
    let mut tiers: Vec<_> = config.agents.models.iter().collect();
    tiers.sort_by_key(|(tier, _)| (tier.as_str() != ProviderPool::DEFAULT, (*tier).clone()));
    for (tier, model_ref) in tiers {
        let ready = match create_model_for(&model_ref.provider, &model_ref.model, &config) {
            Ok(_) => "ready".to_string(),
            Err(e) => format!("unavailable: {}", e.to_string().lines().next().unwrap_or("")),
        };
        println!(
            "    {tier:<14} {} / {} ({ready})",
            model_ref.provider, model_ref.model
        );
    }
    println!();

    let agent = agent_config(&config);
    println!("  Agent:");
    println!("    Max steps:         {}", agent.max_steps);
    println!("    Parallel tools:    {}", agent.max_parallel_tools);
    println!("    Context budget:    {} tokens", agent.context_budget_tokens);
    println!("    Provider attempts: {}", agent.retry.max_attempts);
    println!(
        "    Cycle timeout:     {}",
        agent
            .cycle_timeout
            .map(|t| format!("{}s", t.as_secs()))
            .unwrap_or_else(|| "none".to_string())
    );
    println!("    Streaming:         {}", if agent.stream { "on" } else { "off" });
    println!();

    println!("  Channels:");
    println!(
        "    Web: {} ({}:{})",
        if config.channels.web.enabled { "enabled" } else { "disabled" },
        config.gateway.host,
        config.gateway.port
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn agent_config_maps_defaults() {
        let mut config = Config::default();
        config.agents.defaults.cycle_timeout_secs = 0;
        config.agents.retry.max_attempts = 5;
        config.agents.retry.tool_max_attempts = 0;

        let agent = agent_config(&config);
        assert_eq!(agent.system_prompt, DEFAULT_SYSTEM_PROMPT);
        assert_eq!(agent.max_steps, 8);
        assert_eq!(agent.cycle_timeout, None);
        assert_eq!(agent.retry.max_attempts, 5);
        assert_eq!(agent.retry.initial_delay, Duration::from_millis(500));
        assert_eq!(agent.tool_retry.max_attempts, 1);
    }

    #[test]
    fn invalid_multiplier_is_clamped() {
        let mut retry = RetryConfig {
            multiplier: -2.0,
            ..RetryConfig::default()
        };
        assert_eq!(retry_policy(&retry, 3).multiplier, 1.0);
        retry.multiplier = f64::NAN;
        assert_eq!(retry_policy(&retry, 3).multiplier, 1.0);
        retry.multiplier = 3.0;
        assert_eq!(retry_policy(&retry, 3).multiplier, 3.0);
    }

    #[test]
    fn custom_system_prompt_is_kept() {
        let mut config = Config::default();
        config.agents.defaults.system_prompt = "Be terse.".into();
        assert_eq!(agent_config(&config).system_prompt, "Be terse.");
    }

    #[test]
    fn pool_requires_default_tier() {
        let err = create_provider_pool(&Config::default()).err().unwrap();
        assert!(err.to_string().contains("\"default\""));
    }

    #[test]
    fn onboard_writes_defaults_once() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".steward").join("config.json");

        assert!(run_onboard(&path).unwrap());
        let written = load_config(&path).unwrap();
        assert_eq!(written.agents.defaults.max_steps, 8);

        std::fs::write(&path, r#"{"gateway":{"port":9000}}"#).unwrap();
        assert!(!run_onboard(&path).unwrap());
        assert_eq!(load_config(&path).unwrap().gateway.port, 9000);
    }

    #[test]
    fn unknown_provider_is_rejected() {
        let err = create_model_for("acme", "m1", &Config::default()).err().unwrap();
        assert!(err.to_string().contains("Unknown provider 'acme'"));
    }
}
