use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{anyhow, Context};
use tracing::{info, warn};

use crate::aggregator::ContentRelease;

pub const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
pub const DEFAULT_MODEL: &str = "gpt-3.5-turbo";

#[derive(Debug, Clone)]
pub struct UpstreamConfig {
    pub api_key: String,
    pub base_url: String,
    pub default_model: String,
}

/// Per-request bounds applied by the orchestrator.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OrchestratorLimits {
    pub max_followup_rounds: u32,
    pub upstream_timeout: Duration,
    pub tool_execution_timeout: Duration,
    pub content_release: ContentRelease,
}

impl Default for OrchestratorLimits {
    fn default() -> Self {
        Self {
            max_followup_rounds: 5,
            upstream_timeout: Duration::from_secs(60),
            tool_execution_timeout: Duration::from_secs(30),
            content_release: ContentRelease::Immediate,
        }
    }
}

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub listen_addr: SocketAddr,
    pub upstream: UpstreamConfig,
    pub limits: OrchestratorLimits,
    pub tool_catalog_path: Option<PathBuf>,
}

impl GatewayConfig {
    /// Read the process environment; call `dotenv` first to honor `.env`.
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let api_key = lookup("OPENAI_API_KEY")
            .filter(|key| !key.trim().is_empty())
            .ok_or_else(|| anyhow!("OPENAI_API_KEY must be set (environment or .env file)"))?;
        if api_key.starts_with("sk-") {
            info!("OpenAI API key loaded successfully");
        } else {
            warn!("OPENAI_API_KEY doesn't start with 'sk-'; assuming an OpenAI-compatible upstream");
        }

        let base_url = lookup("OPENAI_BASE_URL")
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_string())
            .trim_end_matches('/')
            .to_string();
        let default_model = lookup("OPENAI_MODEL").unwrap_or_else(|| DEFAULT_MODEL.to_string());

        let defaults = OrchestratorLimits::default();
        let limits = OrchestratorLimits {
            max_followup_rounds: parsed(&lookup, "MAX_FOLLOWUP_ROUNDS")?
                .unwrap_or(defaults.max_followup_rounds),
            upstream_timeout: parsed(&lookup, "UPSTREAM_TIMEOUT_SECS")?
                .map(Duration::from_secs)
                .unwrap_or(defaults.upstream_timeout),
            tool_execution_timeout: parsed(&lookup, "TOOL_EXECUTION_TIMEOUT_SECS")?
                .map(Duration::from_secs)
                .unwrap_or(defaults.tool_execution_timeout),
            content_release: parsed(&lookup, "HOLD_ROUND_CONTENT")?
                .map(ContentRelease::from_hold_flag)
                .unwrap_or(defaults.content_release),
        };

        Ok(Self {
            listen_addr: parsed(&lookup, "GATEWAY_ADDR")?
                .unwrap_or_else(|| SocketAddr::from(([127, 0, 0, 1], 3000))),
            upstream: UpstreamConfig {
                api_key,
                base_url,
                default_model,
            },
            limits,
            tool_catalog_path: lookup("TOOL_CATALOG_PATH").map(PathBuf::from),
        })
    }
}

fn parsed<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> anyhow::Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    lookup(key)
        .map(|raw| raw.trim().parse::<T>())
        .transpose()
        .with_context(|| format!("invalid value for {key}"))
}
