use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::{Parser, Subcommand, ValueEnum};
use futures::StreamExt;
use std::io::Write;
use std::sync::Arc;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use relay_core::{
    map_reply, with_completion, AgentLoop, AgentProgressEvent, AgentProgressHandler,
    ContextCompressor, ConversationItem, Generator, Message, Provider, ProviderGenerator, StreamProcessor,
    ToolRegistry,
};
use relay_providers::{
    ChatDeltaProcessor, OpenAIApi, OpenAIProvider, PlainTextGenerator, ResponsesProcessor,
    TextToolGenerator,
};

mod config;

use config::{expand_env, Config, WireFormat};

/// Log level for tracing output
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogLevel {
    /// Most verbose: every stream chunk
    Trace,
    /// Verbose: requests, tool execution details
    Debug,
    /// Standard: iteration starts and tool summaries
    Info,
    /// Quiet: only warnings and errors
    Warn,
    /// Minimal: only errors
    Error,
}

impl LogLevel {
    fn as_filter(&self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

#[derive(Parser)]
#[command(name = "relay")]
#[command(author, version, about = "Relay: streams a model reply while running its tool calls", long_about = None)]
pub struct Cli {
    /// Profile to use (bundles provider, prompt, model, wire format)
    #[arg(short = 'P', long)]
    pub profile: Option<String>,

    /// Model to use (overrides config/profile default)
    #[arg(short, long)]
    pub model: Option<String>,

    /// Base URL for the API (overrides config)
    #[arg(long)]
    pub base_url: Option<String>,

    /// Stream protocol to speak (overrides profile)
    #[arg(long, value_enum)]
    pub wire_format: Option<WireFormat>,

    /// Maximum model invocations per question (overrides config)
    #[arg(long)]
    pub max_iterations: Option<u32>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, value_enum, default_value = "warn")]
    pub log_level: LogLevel,

    /// Enable debug logging (shorthand for --log-level debug)
    #[arg(short, long)]
    pub debug: bool,

    /// Write debug logs to file (JSON-lines format)
    #[arg(long)]
    pub log_file: Option<std::path::PathBuf>,

    /// Disable all tools
    #[arg(long)]
    pub no_tools: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Ask a question and stream the answer
    Ask {
        prompt: String,

        /// System prompt (overrides profile)
        #[arg(short, long)]
        system: Option<String>,
    },
    /// Show current configuration
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // --debug overrides --log-level
    let log_level = if cli.debug {
        LogLevel::Debug
    } else {
        cli.log_level
    };
    let filter = EnvFilter::new(log_level.as_filter());

    if let Some(log_path) = &cli.log_file {
        let file = std::fs::File::create(log_path)
            .with_context(|| format!("Failed to create log file: {:?}", log_path))?;
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::sync::Mutex::new(file)))
            .init();
    } else {
        // stdout carries the reply, so logs go to stderr
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    }

    let config = Config::load()?;

    match &cli.command {
        Commands::Ask { prompt, system } => ask_mode(&cli, &config, prompt, system.clone()).await,
        Commands::Config => show_config(&config),
    }
}

/// Logs loop progress through tracing.
struct LogProgress;

#[async_trait]
impl AgentProgressHandler for LogProgress {
    async fn on_progress(&self, event: AgentProgressEvent) {
        match event {
            AgentProgressEvent::IterationStart {
                iteration,
                max_iterations,
            } => {
                tracing::info!(iteration, max_iterations, "Iteration start");
            }
            AgentProgressEvent::ToolExecuted { iteration, result } => {
                if result.is_error() {
                    tracing::warn!(
                        iteration,
                        tool = %result.tool_name,
                        result = %result.result_json(),
                        "Tool failed"
                    );
                } else {
                    tracing::info!(
                        iteration,
                        tool = %result.tool_name,
                        elapsed_ms = result.execution_time_ms,
                        "Tool executed"
                    );
                }
            }
            AgentProgressEvent::IterationComplete {
                iteration,
                tool_calls,
                has_assistant_content,
            } => {
                tracing::debug!(iteration, tool_calls, has_assistant_content, "Iteration complete");
            }
        }
    }
}

async fn ask_mode(cli: &Cli, config: &Config, prompt: &str, system: Option<String>) -> Result<()> {
    let settings = resolve_settings(cli, config, system)?;
    tracing::debug!(
        profile = %settings.profile_name,
        provider = %settings.provider_name,
        model = ?settings.model,
        wire_format = %settings.wire_format,
        "Resolved settings"
    );

    let provider = Arc::new(create_provider_from_settings(&settings));

    let tools = if cli.no_tools {
        ToolRegistry::new()
    } else {
        relay_tools::default_registry(config.tools.enable_web, config.tools.web_search_config())
    };
    tracing::debug!(tools = ?tools.names(), "Tool registry ready");
    let definitions = tools.definitions();

    let mut conversation: Vec<ConversationItem> = Vec::new();
    if let Some(system) = &settings.system_prompt {
        conversation.push(Message::system(system).into());
    }
    conversation.push(Message::user(prompt).into());

    let mut loop_config = config
        .agent
        .to_loop_config()
        .with_progress(Arc::new(LogProgress));
    if let Some(max) = cli.max_iterations {
        loop_config = loop_config.with_max_iterations(max);
    }

    let backend = ProviderGenerator::new(provider.clone())
        .with_model(settings.model.clone())
        .with_extra(settings.parameters.clone());

    let (processor, generator): (Arc<dyn StreamProcessor>, Arc<dyn Generator>) =
        match settings.wire_format {
            WireFormat::Chat => (
                Arc::new(ChatDeltaProcessor::new()),
                Arc::new(backend.with_tools(definitions)),
            ),
            WireFormat::Responses => (
                Arc::new(ResponsesProcessor::new()),
                Arc::new(backend.with_tools(definitions)),
            ),
            // The backend sees no native tools; the catalog travels in the prompt
            WireFormat::Text => (
                Arc::new(ChatDeltaProcessor::new()),
                Arc::new(TextToolGenerator::new(
                    PlainTextGenerator::new(backend),
                    definitions,
                )),
            ),
        };

    let reader = generator
        .generate(&conversation)
        .await
        .context("Initial request failed")?;

    let summary_model = config
        .agent
        .summary_model
        .clone()
        .or_else(|| settings.model.clone());
    let compressor = ContextCompressor::new(provider.clone() as Arc<dyn Provider>, summary_model);

    let agent = AgentLoop::new(processor.clone(), Arc::new(tools), provider, loop_config)
        .with_compressor(compressor);

    let output = with_completion(agent.run(reader, conversation, generator), |full| {
        tracing::debug!(bytes = full.len(), "Reply complete");
    });
    let mut text = map_reply(output, processor.response_map());

    let mut stdout = std::io::stdout();
    while let Some(chunk) = text.next().await {
        let chunk = chunk?;
        write!(stdout, "{}", chunk)?;
        stdout.flush()?;
    }
    writeln!(stdout)?;

    Ok(())
}

fn show_config(config: &Config) -> Result<()> {
    println!("Configuration:");
    println!("  Default profile: {}", config.default_profile);

    if !config.profiles.is_empty() {
        println!("\nProfiles:");
        for (name, profile) in &config.profiles {
            println!("  {}:", name);
            if let Some(provider) = &profile.provider {
                println!("    Provider: {}", provider);
            }
            if let Some(prompt) = &profile.prompt {
                let display = if config.prompts.contains_key(prompt) {
                    format!("@{}", prompt)
                } else if prompt.chars().count() > 50 {
                    format!("{}...", prompt.chars().take(50).collect::<String>())
                } else {
                    prompt.clone()
                };
                println!("    Prompt: {}", display);
            }
            if let Some(model) = &profile.model {
                println!("    Model: {}", model);
            }
            println!("    Wire format: {}", profile.wire_format);
            if !profile.parameters.is_empty() {
                println!(
                    "    Parameters: {}",
                    serde_json::to_string(&profile.parameters).unwrap_or_default()
                );
            }
        }
    }

    println!("\nProviders:");
    for (name, provider_config) in &config.providers {
        println!("  {}:", name);
        if let Some(model) = &provider_config.default_model {
            println!("    Default model: {}", model);
        }
        if provider_config.api_key.is_some() {
            println!("    API key: (configured)");
        }
        if let Some(base_url) = &provider_config.base_url {
            println!("    Base URL: {}", base_url);
        }
    }

    println!("\nAgent:");
    println!("  Max iterations: {}", config.agent.max_iterations);
    println!("  Tool timeout: {}s", config.agent.tool_timeout_secs);
    println!("  Summarize tool results: {}", config.agent.summarize_tool_results);
    println!("  Max context tokens: {}", config.agent.max_context_tokens);

    println!("\nTools:");
    println!("  Web: {}", config.tools.enable_web);
    if let Some(host) = &config.tools.search_host {
        println!("  Search host: {}", host);
    }
    Ok(())
}

/// Effective settings for one run after CLI, profile, and provider merge
#[derive(Debug, Clone)]
struct ResolvedSettings {
    profile_name: String,
    provider_name: String,
    api_key: String,
    base_url: Option<String>,
    model: Option<String>,
    system_prompt: Option<String>,
    wire_format: WireFormat,
    parameters: std::collections::HashMap<String, serde_json::Value>,
}

fn resolve_settings(cli: &Cli, config: &Config, system: Option<String>) -> Result<ResolvedSettings> {
    // Determine which profile to use (CLI > config default)
    let profile_name = cli
        .profile
        .clone()
        .unwrap_or_else(|| config.default_profile.clone());

    let profile = config
        .resolve_profile(&profile_name)
        .with_context(|| format!("Profile '{}' not found or missing provider", profile_name))?;

    let provider_name = profile.provider_name.clone();
    let provider_config = profile.provider_config.as_ref();

    // Resolve base URL: CLI > provider config
    let base_url = cli
        .base_url
        .clone()
        .or_else(|| provider_config.and_then(|p| p.base_url.clone()))
        .map(|url| expand_env(&url));

    // Local endpoints often need no key, so a configured base URL allows none
    let api_key = provider_config
        .and_then(|p| p.api_key.as_deref())
        .map(expand_env)
        .or_else(|| std::env::var(format!("{}_API_KEY", provider_name.to_uppercase())).ok())
        .or_else(|| base_url.as_ref().map(|_| String::new()))
        .with_context(|| {
            format!(
                "API key not found for provider '{}'. Configure it in {}",
                provider_name,
                Config::config_path()
                    .map(|p| p.display().to_string())
                    .unwrap_or_else(|_| "the config file".to_string())
            )
        })?;

    // Resolve model: CLI > profile > provider default
    let model = cli
        .model
        .clone()
        .or_else(|| profile.model.clone())
        .or_else(|| provider_config.and_then(|p| p.default_model.clone()));

    Ok(ResolvedSettings {
        profile_name,
        provider_name,
        api_key,
        base_url,
        model,
        system_prompt: system.or(profile.system_prompt),
        wire_format: cli.wire_format.unwrap_or(profile.wire_format),
        parameters: profile.parameters,
    })
}

fn create_provider_from_settings(settings: &ResolvedSettings) -> OpenAIProvider {
    let api = match settings.wire_format {
        WireFormat::Responses => OpenAIApi::Responses,
        WireFormat::Chat | WireFormat::Text => OpenAIApi::ChatCompletions,
    };

    let mut provider = OpenAIProvider::new(&settings.api_key).with_api(api);
    if let Some(model) = &settings.model {
        provider = provider.with_default_model(model);
    }
    if let Some(url) = &settings.base_url {
        provider = provider.with_base_url(url);
    }
    provider
}
