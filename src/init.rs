use std::error::Error;
use std::fmt::Display;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use crate::generation::{self, GenerationClient, ProviderKind};
use crate::streaming::{PreemptionPolicy, SessionRegistry, StreamConfig, StreamCoordinator};

// ============================================================================
// Configuration
// ============================================================================

#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub static_dir: PathBuf,
    pub ai: AiConfig,
    pub stream: StreamConfig,
}

#[derive(Debug, Clone)]
pub struct AiConfig {
    pub provider: ProviderKind,
    pub url: String,
    pub api_key: Option<String>,
    pub model: String,
    pub timeout_secs: u64,
}

impl Config {
    pub fn from_env() -> Result<Self, Box<dyn Error>> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Reads settings through `lookup` so tests need not touch the process
    /// environment.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, Box<dyn Error>> {
        let provider: ProviderKind = parse_var(&lookup, "GENERATION_PROVIDER", ProviderKind::OpenAi)?;
        let (url, model) = match provider {
            ProviderKind::OpenAi => (
                lookup("OPENAI_BASE_URL").unwrap_or_else(|| "https://api.openai.com/v1".to_string()),
                lookup("GENERATION_MODEL").unwrap_or_else(|| "gpt-4o-mini".to_string()),
            ),
            ProviderKind::Ollama => (
                lookup("OLLAMA_URL").unwrap_or_else(|| "http://127.0.0.1:11434".to_string()),
                lookup("GENERATION_MODEL").unwrap_or_else(|| "llama3.2".to_string()),
            ),
        };

        let defaults = StreamConfig::default();
        let stream = StreamConfig {
            default_max_tokens: parse_var(&lookup, "DEFAULT_MAX_TOKENS", defaults.default_max_tokens)?,
            max_output_tokens_limit: parse_var(
                &lookup,
                "MAX_OUTPUT_TOKENS_LIMIT",
                defaults.max_output_tokens_limit,
            )?,
            policy: parse_var(&lookup, "PREEMPTION_POLICY", PreemptionPolicy::Preempt)?,
        };
        if stream.default_max_tokens == 0 || stream.default_max_tokens > stream.max_output_tokens_limit {
            return Err(format!(
                "DEFAULT_MAX_TOKENS must be between 1 and {}",
                stream.max_output_tokens_limit
            )
            .into());
        }

        Ok(Self {
            host: lookup("HOST").unwrap_or_else(|| "0.0.0.0".to_string()),
            port: parse_var(&lookup, "PORT", 4444)?,
            static_dir: lookup("STATIC_DIR").unwrap_or_else(|| "public".to_string()).into(),
            ai: AiConfig {
                provider,
                url,
                api_key: lookup("OPENAI_API_KEY").filter(|key| !key.trim().is_empty()),
                model,
                timeout_secs: parse_var(&lookup, "PROVIDER_TIMEOUT_SECS", 120)?,
            },
            stream,
        })
    }
}

fn parse_var<T>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: T,
) -> Result<T, Box<dyn Error>>
where
    T: FromStr,
    T::Err: Display,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e| format!("invalid {}={:?}: {}", key, raw, e).into()),
        None => Ok(default),
    }
}

// ============================================================================
// Application State
// ============================================================================

pub struct AppState {
    pub registry: Arc<SessionRegistry>,
    pub coordinator: Arc<StreamCoordinator>,
    pub provider: &'static str,
}

impl AppState {
    pub fn new(client: Arc<dyn GenerationClient>, stream: StreamConfig) -> Arc<Self> {
        let registry = Arc::new(SessionRegistry::new());
        let provider = client.name();
        let coordinator = Arc::new(StreamCoordinator::new(registry.clone(), client, stream));
        Arc::new(Self {
            registry,
            coordinator,
            provider,
        })
    }
}

pub async fn app_init() -> Result<(Config, Arc<AppState>), Box<dyn Error>> {
    let config = Config::from_env()?;
    log::info!("✅ Configuration loaded");

    log::info!("🤖 Connecting generation provider {} ({})...", config.ai.provider, config.ai.model);
    let client = generation::connect(&config.ai)?;
    log::info!("✅ Generation provider ready at {}", config.ai.url);

    let state = AppState::new(client, config.stream.clone());
    log::info!(
        "✅ Stream coordinator ready (policy {}, default {} / max {} tokens)",
        config.stream.policy,
        config.stream.default_max_tokens,
        config.stream.max_output_tokens_limit
    );
    Ok((config, state))
}
