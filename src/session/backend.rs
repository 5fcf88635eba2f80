use async_trait::async_trait;
use std::time::Duration;

use crate::error::{ErrorContext, Result};
use crate::models::{AgentRecord, AgentSettingsPatch};

/// Where agent metadata lives and where edited settings are persisted.
#[async_trait]
pub trait AgentBackend: Send + Sync {
    async fn fetch_agent(&self, agent_id: &str) -> Result<AgentRecord>;

    /// Persist settings and return the agent as the backend now stores it.
    async fn update_agent_settings(
        &self,
        agent_id: &str,
        patch: &AgentSettingsPatch,
    ) -> Result<AgentRecord>;
}

/// JSON REST client: `GET {base}/agents/{id}` and `PATCH {base}/agents/{id}/settings`.
#[derive(Debug, Clone)]
pub struct RestAgentBackend {
    client: reqwest::Client,
    base_url: String,
}

impl RestAgentBackend {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    fn agent_url(&self, agent_id: &str) -> String {
        format!("{}/agents/{}", self.base_url, agent_id)
    }
}

#[async_trait]
impl AgentBackend for RestAgentBackend {
    async fn fetch_agent(&self, agent_id: &str) -> Result<AgentRecord> {
        log::debug!("Fetching agent {}", agent_id);
        let agent = self
            .client
            .get(self.agent_url(agent_id))
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .context(format!("Fetching agent {}", agent_id))?
            .json::<AgentRecord>()
            .await
            .context("Decoding agent")?;
        Ok(agent)
    }

    async fn update_agent_settings(
        &self,
        agent_id: &str,
        patch: &AgentSettingsPatch,
    ) -> Result<AgentRecord> {
        let agent = self
            .client
            .patch(format!("{}/settings", self.agent_url(agent_id)))
            .json(patch)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .context(format!("Saving settings of agent {}", agent_id))?
            .json::<AgentRecord>()
            .await
            .context("Decoding agent")?;
        log::info!("💾 Saved settings of agent {} ({})", agent_id, agent.model);
        Ok(agent)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;
    use crate::session::testing::sample_agent;
    use axum::extract::{Path, State};
    use axum::http::StatusCode;
    use axum::routing::{get, patch};
    use axum::{Json, Router};
    use std::sync::{Arc, Mutex};

    type Store = Arc<Mutex<AgentRecord>>;

    async fn get_agent(
        State(store): State<Store>,
        Path(id): Path<String>,
    ) -> std::result::Result<Json<AgentRecord>, StatusCode> {
        let agent = store.lock().unwrap().clone();
        if agent.id == id {
            Ok(Json(agent))
        } else {
            Err(StatusCode::NOT_FOUND)
        }
    }

    async fn patch_settings(
        State(store): State<Store>,
        Path(_id): Path<String>,
        Json(patch): Json<AgentSettingsPatch>,
    ) -> Json<AgentRecord> {
        let mut agent = store.lock().unwrap();
        agent.apply(&patch);
        Json(agent.clone())
    }

    async fn spawn_backend() -> (String, Store) {
        let store: Store = Arc::new(Mutex::new(sample_agent()));
        let app = Router::new()
            .route("/agents/{id}", get(get_agent))
            .route("/agents/{id}/settings", patch(patch_settings))
            .with_state(store.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (format!("http://{}/", addr), store)
    }

    #[tokio::test]
    async fn test_fetch_and_patch_agent() {
        let (base, store) = spawn_backend().await;
        let backend = RestAgentBackend::new(base, Duration::from_secs(5)).unwrap();

        let agent = backend.fetch_agent("agent-1").await.unwrap();
        assert_eq!(agent.model, "gpt-4o-mini");

        let patch = AgentSettingsPatch::from(&crate::models::ChatConfig::new("claude").with_max_tokens(64));
        let saved = backend.update_agent_settings("agent-1", &patch).await.unwrap();
        assert_eq!(saved.model, "claude");
        assert_eq!(saved.max_tokens, 64);
        assert_eq!(store.lock().unwrap().model, "claude");
    }

    #[tokio::test]
    async fn test_missing_agent_is_not_found() {
        let (base, _store) = spawn_backend().await;
        let backend = RestAgentBackend::new(base, Duration::from_secs(5)).unwrap();

        let err = backend.fetch_agent("nobody").await.unwrap_err();
        assert_eq!(err.code, ErrorCode::NotFound);
    }
}
