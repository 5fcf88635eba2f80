use std::error::Error;
use std::sync::Arc;
use std::time::Duration;

use crate::models::ChatConfig;
use crate::session::{HttpStreamTransport, RestAgentBackend};
use crate::state::AppState;

// ============================================================================
// Configuration
// ============================================================================

#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub agent_api_url: String,
    pub inference_url: String,
    pub connect_timeout: Duration,
    /// Parameters a newly added slot starts with.
    pub defaults: ChatConfig,
}

impl Config {
    pub fn from_env() -> Result<Self, Box<dyn std::error::Error>> {
        let defaults = ChatConfig {
            model: std::env::var("DEFAULT_MODEL").unwrap_or_else(|_| "llama3.2".to_string()),
            temperature: std::env::var("DEFAULT_TEMPERATURE")
                .unwrap_or_else(|_| "0.7".to_string())
                .parse()?,
            system_prompt: String::new(),
            max_tokens: std::env::var("DEFAULT_MAX_TOKENS")
                .unwrap_or_else(|_| "1024".to_string())
                .parse()?,
        };
        defaults.validate()?;

        Ok(Self {
            host: std::env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
            port: std::env::var("PORT")
                .unwrap_or_else(|_| "3000".to_string())
                .parse()?,
            agent_api_url: std::env::var("AGENT_API_URL")?,
            inference_url: std::env::var("INFERENCE_URL")
                .unwrap_or_else(|_| "http://127.0.0.1:8090".to_string()),
            connect_timeout: Duration::from_secs(
                std::env::var("CONNECT_TIMEOUT_SECS")
                    .unwrap_or_else(|_| "10".to_string())
                    .parse()?,
            ),
            defaults,
        })
    }
}

pub async fn app_init() -> Result<(Config, Arc<AppState>), Box<dyn Error>> {
    let config = Config::from_env()?;
    log::info!("✅ Configuration loaded");

    log::info!("🤖 Agent API: {}", config.agent_api_url);
    let backend = Arc::new(RestAgentBackend::new(
        config.agent_api_url.clone(),
        config.connect_timeout,
    )?);
    log::info!("✅ Agent backend client ready");

    log::info!("🔌 Inference gateway: {}", config.inference_url);
    let transport = Arc::new(HttpStreamTransport::new(
        config.inference_url.clone(),
        config.connect_timeout,
    )?);
    log::info!("✅ Slot transport ready");

    let state = Arc::new(AppState::new(backend, transport, config.defaults.clone()));
    Ok((config, state))
}
