//! Runtime configuration
//!
//! Values come from the process environment (a `.env` file is loaded first
//! when present). Missing optional values fall back to defaults; the model
//! API key is only checked when a turn needs it.

use crate::error::AgentError;
use crate::memory::{
    ContextConfig, InMemoryMemoryStore, InMemoryMessageStore, MemoryStore, MessageStore,
    PgBackend, PgMemoryStore, PgMessageStore,
};
use crate::streaming::DEFAULT_MAX_STEPS;
use crate::Result;
use std::env;
use std::sync::Arc;
use tracing::{info, warn};

pub const DEFAULT_MODEL: &str = "gemini-2.0-flash";
pub const DEFAULT_PORT: u16 = 8080;
pub const DEFAULT_SYSTEM_PROMPT: &str = "You are a helpful assistant that can do various tasks. \
Use the available tools when they help answer the user. Some tools need the user's approval \
before they run; ask for it plainly and wait for the decision.";

#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub api_key: Option<String>,
    pub model: String,
    pub port: u16,
    pub database_url: Option<String>,
    pub context: ContextConfig,
    pub auto_summarize: bool,
    pub max_steps: usize,
    pub system_prompt: String,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            model: DEFAULT_MODEL.to_string(),
            port: DEFAULT_PORT,
            database_url: None,
            context: ContextConfig::default(),
            auto_summarize: true,
            max_steps: DEFAULT_MAX_STEPS,
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
        }
    }
}

impl AgentConfig {
    /// Load `.env` then read the process environment
    pub fn from_env() -> Result<Self> {
        dotenv::dotenv().ok();
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build from an arbitrary key lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let defaults = Self::default();

        let port = match get("PORT").or_else(|| get("API_PORT")) {
            Some(raw) => parse(&raw, "PORT")?,
            None => defaults.port,
        };

        let keep_recent = match get("SUMMARY_KEEP_RECENT") {
            Some(raw) => parse(&raw, "SUMMARY_KEEP_RECENT")?,
            None => defaults.context.keep_recent,
        };

        let batch_size = match get("SUMMARY_BATCH_SIZE") {
            Some(raw) => parse(&raw, "SUMMARY_BATCH_SIZE")?,
            None => defaults.context.batch_size,
        };

        let max_steps = match get("MAX_STEPS") {
            Some(raw) => parse(&raw, "MAX_STEPS")?,
            None => defaults.max_steps,
        };

        let auto_summarize = match get("AUTO_SUMMARIZE") {
            Some(raw) => parse_bool(&raw, "AUTO_SUMMARIZE")?,
            None => defaults.auto_summarize,
        };

        Ok(Self {
            api_key: get("GEMINI_API_KEY"),
            model: get("GEMINI_MODEL").unwrap_or(defaults.model),
            port,
            database_url: get("POSTGRES_URL").or_else(|| get("DATABASE_URL")),
            context: ContextConfig {
                keep_recent,
                batch_size,
            },
            auto_summarize,
            max_steps,
            system_prompt: get("SYSTEM_PROMPT").unwrap_or(defaults.system_prompt),
        })
    }

    /// The model API key, or a configuration error when unset
    pub fn require_api_key(&self) -> Result<&str> {
        self.api_key.as_deref().ok_or_else(|| {
            AgentError::ConfigurationError(
                "GEMINI_API_KEY is not set. Add it to the environment or .env file.".to_string(),
            )
        })
    }

    pub fn has_api_key(&self) -> bool {
        self.api_key.is_some()
    }
}

fn parse<T: std::str::FromStr>(raw: &str, key: &str) -> Result<T> {
    raw.trim().parse().map_err(|_| {
        AgentError::ConfigurationError(format!("{} has an invalid value: {}", key, raw))
    })
}

fn parse_bool(raw: &str, key: &str) -> Result<bool> {
    match raw.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(AgentError::ConfigurationError(format!(
            "{} has an invalid value: {}",
            key, raw
        ))),
    }
}

/// Message and memory stores selected by configuration
pub struct Stores {
    pub messages: Arc<dyn MessageStore>,
    pub memories: Arc<dyn MemoryStore>,
}

/// Postgres when a database URL is configured, otherwise in-memory
pub fn build_stores(config: &AgentConfig) -> Stores {
    if let Some(url) = config.database_url.as_deref() {
        match PgBackend::connect_lazy(url) {
            Ok(backend) => {
                info!("Conversation storage backend: postgres");
                return Stores {
                    messages: Arc::new(PgMessageStore::new(backend.clone())),
                    memories: Arc::new(PgMemoryStore::new(backend)),
                };
            }
            Err(error) => {
                warn!(
                    "Failed to initialize postgres backend, falling back to in-memory: {}",
                    error
                );
            }
        }
    }

    info!("Conversation storage backend: in-memory");
    Stores {
        messages: Arc::new(InMemoryMessageStore::new()),
        memories: Arc::new(InMemoryMemoryStore::new()),
    }
}
