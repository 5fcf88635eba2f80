//! Scripted collaborators for exercising sessions without a network.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

use crate::error::{self, AppError};
use crate::models::{AgentRecord, AgentSettingsPatch};
use crate::session::backend::AgentBackend;
use crate::session::connection::SlotEventReceiver;
use crate::session::controller::TestSessionController;
use crate::session::events::SlotEvent;
use crate::session::transport::{
    InboundFrame, OutboundFrame, SlotAddress, Transport, TransportError, TransportLink,
};

const WAIT: Duration = Duration::from_secs(2);

// ============================================================================
// Scripted Transport
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotBehavior {
    /// Answers every query with `"{model}: {content}"`.
    Echo,
    /// Accepts queries and never answers on its own.
    Silent,
    /// Fails the handshake.
    Refuse,
}

type Injector = mpsc::UnboundedSender<Result<InboundFrame, TransportError>>;

#[derive(Default)]
pub struct ScriptedTransport {
    behaviors: Mutex<HashMap<usize, SlotBehavior>>,
    sent: Arc<Mutex<Vec<(usize, OutboundFrame)>>>,
    injectors: Mutex<HashMap<usize, Injector>>,
    connects: AtomicUsize,
}

impl ScriptedTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn behave(&self, slot: usize, behavior: SlotBehavior) {
        self.behaviors.lock().unwrap().insert(slot, behavior);
    }

    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn sent(&self) -> Vec<(usize, OutboundFrame)> {
        self.sent.lock().unwrap().clone()
    }

    pub fn sent_to(&self, slot: usize) -> Vec<OutboundFrame> {
        self.sent()
            .into_iter()
            .filter(|(s, _)| *s == slot)
            .map(|(_, frame)| frame)
            .collect()
    }

    pub fn inject(&self, slot: usize, frame: InboundFrame) {
        if let Some(tx) = self.injectors.lock().unwrap().get(&slot) {
            let _ = tx.send(Ok(frame));
        }
    }

    /// Break the slot's link as if the network dropped it.
    pub fn drop_link(&self, slot: usize) {
        if let Some(tx) = self.injectors.lock().unwrap().get(&slot) {
            let _ = tx.send(Err(TransportError::Closed));
        }
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn connect(&self, address: &SlotAddress) -> Result<Box<dyn TransportLink>, TransportError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        let behavior = self
            .behaviors
            .lock()
            .unwrap()
            .get(&address.slot)
            .copied()
            .unwrap_or(SlotBehavior::Echo);

        if behavior == SlotBehavior::Refuse {
            return Err(TransportError::Handshake("refused by script".to_string()));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        self.injectors
            .lock()
            .unwrap()
            .insert(address.slot, tx.clone());

        Ok(Box::new(ScriptedLink {
            slot: address.slot,
            behavior,
            sent: self.sent.clone(),
            tx,
            rx,
        }))
    }
}

struct ScriptedLink {
    slot: usize,
    behavior: SlotBehavior,
    sent: Arc<Mutex<Vec<(usize, OutboundFrame)>>>,
    tx: Injector,
    rx: mpsc::UnboundedReceiver<Result<InboundFrame, TransportError>>,
}

#[async_trait]
impl TransportLink for ScriptedLink {
    async fn send(&mut self, frame: OutboundFrame) -> Result<(), TransportError> {
        self.sent.lock().unwrap().push((self.slot, frame.clone()));

        if self.behavior == SlotBehavior::Echo {
            let OutboundFrame::Query {
                query_id,
                content,
                config,
            } = frame;
            let _ = self.tx.send(Ok(InboundFrame::TypingStart));
            let _ = self.tx.send(Ok(InboundFrame::Message {
                content: format!("{}: {}", config.model, content),
                query_id: Some(query_id),
            }));
            let _ = self.tx.send(Ok(InboundFrame::TypingEnd));
        }
        Ok(())
    }

    async fn recv(&mut self) -> Option<Result<InboundFrame, TransportError>> {
        self.rx.recv().await
    }
}

// ============================================================================
// In-memory Agent Backend
// ============================================================================

#[derive(Default)]
pub struct InMemoryAgentBackend {
    agents: Mutex<HashMap<String, AgentRecord>>,
    patches: AtomicUsize,
}

impl InMemoryAgentBackend {
    pub fn with_agent(agent: AgentRecord) -> Arc<Self> {
        let backend = Self::default();
        backend
            .agents
            .lock()
            .unwrap()
            .insert(agent.id.clone(), agent);
        Arc::new(backend)
    }

    pub fn insert(&self, agent: AgentRecord) {
        self.agents.lock().unwrap().insert(agent.id.clone(), agent);
    }

    pub fn agent(&self, id: &str) -> Option<AgentRecord> {
        self.agents.lock().unwrap().get(id).cloned()
    }

    pub fn patch_count(&self) -> usize {
        self.patches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AgentBackend for InMemoryAgentBackend {
    async fn fetch_agent(&self, agent_id: &str) -> error::Result<AgentRecord> {
        self.agent(agent_id)
            .ok_or_else(|| AppError::not_found(format!("Agent {}", agent_id)))
    }

    async fn update_agent_settings(
        &self,
        agent_id: &str,
        patch: &AgentSettingsPatch,
    ) -> error::Result<AgentRecord> {
        let mut agents = self.agents.lock().unwrap();
        let agent = agents
            .get_mut(agent_id)
            .ok_or_else(|| AppError::not_found(format!("Agent {}", agent_id)))?;
        agent.apply(patch);
        self.patches.fetch_add(1, Ordering::SeqCst);
        Ok(agent.clone())
    }
}

pub fn sample_agent() -> AgentRecord {
    AgentRecord {
        id: "agent-1".to_string(),
        name: "Support bot".to_string(),
        model: "gpt-4o-mini".to_string(),
        temperature: 0.3,
        system_prompt: "You answer support tickets.".to_string(),
        max_tokens: 800,
        knowledge_sources: Vec::new(),
        avatar: Some("avatars/support.png".to_string()),
    }
}

// ============================================================================
// Event helpers
// ============================================================================

pub async fn next_event(rx: &mut SlotEventReceiver) -> SlotEvent {
    tokio::time::timeout(WAIT, rx.recv())
        .await
        .expect("timed out waiting for a slot event")
        .expect("slot event channel closed")
}

/// Wait until the scripted link for `slot` has taken `count` frames off the wire.
pub async fn wait_for_sent(transport: &ScriptedTransport, slot: usize, count: usize) {
    tokio::time::timeout(WAIT, async {
        while transport.sent_to(slot).len() < count {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("timed out waiting for frames to be sent");
}

/// Feed events into the controller until `done` holds.
pub async fn pump_until<F>(
    controller: &mut TestSessionController,
    rx: &mut SlotEventReceiver,
    mut done: F,
) where
    F: FnMut(&TestSessionController) -> bool,
{
    while !done(controller) {
        let event = next_event(rx).await;
        controller.handle_event(event);
    }
}
