use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::{AppError, Result};
use crate::models::ChatConfig;
use crate::session::{AgentBackend, SessionHandle, TestSessionController, Transport};

// ============================================================================
// APPLICATION STATE
// ============================================================================

pub struct AppState {
    pub backend: Arc<dyn AgentBackend>,
    pub transport: Arc<dyn Transport>,
    pub defaults: ChatConfig,
    pub sessions: SessionRegistry,
}

impl AppState {
    pub fn new(
        backend: Arc<dyn AgentBackend>,
        transport: Arc<dyn Transport>,
        defaults: ChatConfig,
    ) -> Self {
        Self {
            backend,
            transport,
            defaults,
            sessions: SessionRegistry::new(),
        }
    }

    /// Spawn a session, connect its slots and register it.
    pub async fn create_session(
        &self,
        agent_id: Option<String>,
        slot_count: usize,
    ) -> Result<SessionHandle> {
        let session_id = Uuid::now_v7().to_string();
        let (controller, events) = TestSessionController::new(
            session_id.clone(),
            self.transport.clone(),
            self.backend.clone(),
            self.defaults.clone(),
        );
        let handle = SessionHandle::spawn(controller, events);

        if let Err(e) = handle.start(agent_id, slot_count).await {
            handle.shutdown().await;
            return Err(e);
        }

        self.sessions.register(handle.clone()).await;
        log::info!("🧪 Session {} created with {} slot(s)", session_id, slot_count);
        Ok(handle)
    }

    pub async fn session(&self, session_id: &str) -> Result<SessionHandle> {
        self.sessions
            .get(session_id)
            .await
            .ok_or_else(|| AppError::not_found(format!("Session {}", session_id)))
    }

    pub async fn destroy_session(&self, session_id: &str) -> Result<()> {
        let handle = self
            .sessions
            .unregister(session_id)
            .await
            .ok_or_else(|| AppError::not_found(format!("Session {}", session_id)))?;
        handle.shutdown().await;
        log::info!("🗑️  Session {} destroyed", session_id);
        Ok(())
    }
}

// ============================================================================
// SESSION REGISTRY
// ============================================================================

#[derive(Clone, Default)]
pub struct SessionRegistry {
    sessions: Arc<RwLock<HashMap<String, SessionHandle>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, handle: SessionHandle) {
        let mut sessions = self.sessions.write().await;
        sessions.insert(handle.session_id().to_string(), handle);
    }

    pub async fn get(&self, session_id: &str) -> Option<SessionHandle> {
        let sessions = self.sessions.read().await;
        sessions.get(session_id).cloned()
    }

    pub async fn unregister(&self, session_id: &str) -> Option<SessionHandle> {
        let mut sessions = self.sessions.write().await;
        sessions.remove(session_id)
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Stop every session; used on server shutdown.
    pub async fn shutdown_all(&self) {
        let handles: Vec<SessionHandle> = {
            let mut sessions = self.sessions.write().await;
            sessions.drain().map(|(_, handle)| handle).collect()
        };
        for handle in handles {
            handle.shutdown().await;
        }
    }
}
