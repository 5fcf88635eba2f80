use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

use crate::error::{log_error, AppError, Result};
use crate::models::{
    AgentRecord, AgentSettingsPatch, ChatConfig, HistoryItem, Message, MessageKind, Sender,
};
use crate::session::backend::AgentBackend;
use crate::session::connection::{ConnectionManager, SlotEventReceiver};
use crate::session::events::{SlotEvent, SlotEventKind};
use crate::session::history::HistoryCorrelator;
use crate::session::transport::Transport;
use crate::types::{Color, ConnectionStatus, SlotPhase, MAX_SLOTS, MIN_SLOTS};

// ============================================================================
// Slot
// ============================================================================

/// One comparison lane: its parameters, its timeline and its live flags.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Slot {
    pub index: usize,
    pub config: ChatConfig,
    pub timeline: Vec<Message>,
    pub connected: bool,
    pub status: ConnectionStatus,
    pub typing: bool,
    pub phase: SlotPhase,
    /// Queries this slot still owes answers for, oldest first.
    pub pending_queries: Vec<Uuid>,
    pub color: Color,
    pub avatar: Option<String>,
}

impl Slot {
    fn new(index: usize, config: ChatConfig, avatar: Option<String>) -> Self {
        Self {
            index,
            config,
            timeline: Vec::new(),
            connected: false,
            status: ConnectionStatus::Closed,
            typing: false,
            phase: SlotPhase::Idle,
            pending_queries: Vec::new(),
            color: Color::for_slot(index),
            avatar,
        }
    }

    pub fn loading(&self) -> bool {
        self.phase.is_loading()
    }

    fn reindex(&mut self, index: usize) {
        self.index = index;
        self.color = Color::for_slot(index);
        for message in &mut self.timeline {
            if let Sender::Slot(_) = message.sender {
                message.sender = Sender::Slot(index);
            }
        }
    }

    /// Settle one pending query; the turn ends once nothing is owed.
    fn settle(&mut self, query_id: Uuid) {
        let before = self.pending_queries.len();
        self.pending_queries.retain(|id| *id != query_id);
        if self.pending_queries.len() < before && self.pending_queries.is_empty() {
            self.phase = SlotPhase::Done;
            self.typing = false;
        }
    }

    fn slot_message(&self, content: impl Into<String>) -> Message {
        Message::from_slot(
            self.index,
            content,
            Some(self.config.model.clone()),
            self.avatar.clone(),
        )
    }
}

/// A slot rebuilt from a stored history item, detached from any connection.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReplayedSlot {
    pub slot_index: usize,
    pub config: ChatConfig,
    pub timeline: Vec<Message>,
}

// ============================================================================
// Outcomes & Notices
// ============================================================================

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DispatchOutcome {
    Full,
    /// Dispatch went out, but only to the connected slots.
    Partial { connected: usize, total: usize },
}

/// Non-blocking information the consumer should surface.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Notice {
    PartialConnectivity { connected: usize, total: usize },
    SlotError { slot: usize, error: AppError },
    HistoryRecorded { item_id: Uuid },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub session_id: String,
    pub agent: Option<AgentRecord>,
    pub slots: Vec<Slot>,
    pub processing: bool,
    pub connected_count: usize,
    pub history_count: usize,
    pub history_mode: bool,
    pub selected_history: Option<Uuid>,
    pub preparing_new_message: bool,
    pub replay: Option<Vec<ReplayedSlot>>,
    pub notice: Option<Notice>,
}

// ============================================================================
// Test Session Controller
// ============================================================================

/// Drives one test session: slot layout, dispatch to every connected slot, and
/// folding slot events into timelines and correlated history.
pub struct TestSessionController {
    session_id: String,
    agent: Option<AgentRecord>,
    defaults: ChatConfig,
    slots: Vec<Slot>,
    connections: ConnectionManager,
    history: HistoryCorrelator,
    backend: Arc<dyn AgentBackend>,
    replay: Option<Vec<ReplayedSlot>>,
    notice: Option<Notice>,
}

impl TestSessionController {
    pub fn new(
        session_id: impl Into<String>,
        transport: Arc<dyn Transport>,
        backend: Arc<dyn AgentBackend>,
        defaults: ChatConfig,
    ) -> (Self, SlotEventReceiver) {
        let (connections, events) = ConnectionManager::new(transport);
        let controller = Self {
            session_id: session_id.into(),
            agent: None,
            slots: vec![Slot::new(0, defaults.clone(), None)],
            defaults,
            connections,
            history: HistoryCorrelator::new(),
            backend,
            replay: None,
            notice: None,
        };
        (controller, events)
    }

    /// Seed the slots (slot 0 from the agent when one is given) and connect.
    pub async fn start(&mut self, agent_id: Option<&str>, slot_count: usize) -> Result<()> {
        check_slot_count(slot_count)?;
        if let Some(agent_id) = agent_id {
            let agent = self.backend.fetch_agent(agent_id).await?;
            log::info!("🤖 Session {} tests agent {} ({})", self.session_id, agent.id, agent.model);
            self.agent = Some(agent);
        }

        self.slots = (0..slot_count).map(|i| self.seed_slot(i)).collect();
        self.reinitialize()
    }

    /// Rebuild every connection at the current slot count.
    ///
    /// Queries still waiting on the old connections are abandoned on every
    /// slot; answers already in are kept and complete their entries.
    pub fn reinitialize(&mut self) -> Result<()> {
        let completed = self.history.abandon_unanswered();
        self.record_completed(completed);

        for slot in &mut self.slots {
            slot.connected = false;
            slot.status = ConnectionStatus::Connecting;
            slot.typing = false;
            slot.pending_queries.clear();
            if slot.loading() {
                slot.phase = SlotPhase::Idle;
            }
        }

        let configs: Vec<ChatConfig> = self.slots.iter().map(|s| s.config.clone()).collect();
        self.connections
            .initialize_connections(&self.session_id, self.slots.len(), &configs)?;
        Ok(())
    }

    fn seed_slot(&self, index: usize) -> Slot {
        match (&self.agent, index) {
            (Some(agent), 0) => Slot::new(0, agent.chat_config(), agent.avatar.clone()),
            _ => Slot::new(index, self.defaults.clone(), None),
        }
    }

    // ------------------------------------------------------------------------
    // Slot layout
    // ------------------------------------------------------------------------

    pub fn add_slot(&mut self) -> Result<usize> {
        if self.slots.len() >= MAX_SLOTS {
            return Err(AppError::slot_limit(format!(
                "A session runs at most {} slots",
                MAX_SLOTS
            )));
        }
        let index = self.slots.len();
        self.slots
            .push(Slot::new(index, self.defaults.clone(), None));
        self.reinitialize()?;
        log::info!("➕ Session {}: added slot {}", self.session_id, index);
        Ok(index)
    }

    /// Remove the slot at `index`; later slots shift down by one.
    pub fn remove_slot(&mut self, index: usize) -> Result<()> {
        if self.slots.len() <= MIN_SLOTS {
            return Err(AppError::slot_limit(format!(
                "A session needs at least {} slot",
                MIN_SLOTS
            )));
        }
        if index >= self.slots.len() {
            return Err(AppError::slot_out_of_range(index, self.slots.len()));
        }

        let completed = self.history.abandon_slot(index);
        self.record_completed(completed);

        // The rebuild below also drops every other slot's unanswered query, so
        // an entry completes here only with the answers already received.
        self.slots.remove(index);
        for (i, slot) in self.slots.iter_mut().enumerate().skip(index) {
            slot.reindex(i);
        }
        self.reinitialize()?;
        log::info!("➖ Session {}: removed slot {}", self.session_id, index);
        Ok(())
    }

    pub fn remove_last_slot(&mut self) -> Result<()> {
        let last = self.slots.len().saturating_sub(1);
        self.remove_slot(last)
    }

    /// Add a slot, then give it the source slot's parameters.
    pub fn clone_config(&mut self, source: usize) -> Result<usize> {
        let config = self.slot(source)?.config.clone();
        let index = self.add_slot()?;
        self.slots[index].config = config.clone();
        self.connections.update_config(index, config)?;
        Ok(index)
    }

    pub fn update_config(&mut self, index: usize, config: ChatConfig) -> Result<()> {
        config.validate()?;
        let count = self.slots.len();
        let slot = self
            .slots
            .get_mut(index)
            .ok_or_else(|| AppError::slot_out_of_range(index, count))?;
        slot.config = config.clone();
        self.connections.update_config(index, config)
    }

    // ------------------------------------------------------------------------
    // Dispatch
    // ------------------------------------------------------------------------

    /// Send `text` to every connected slot.
    pub async fn dispatch_user_message(&mut self, text: &str) -> Result<DispatchOutcome> {
        if text.trim().is_empty() {
            return Err(AppError::bad_request("Message is empty"));
        }

        let total = self.slots.len();
        let connected = self.connections.connected_count();
        if connected == 0 {
            let err = AppError::no_connectivity();
            log_error(&err);
            return Err(err);
        }

        self.history.exit_history_mode();
        self.replay = None;

        for slot in &mut self.slots {
            slot.timeline.push(Message::user(text));
            if self.connections.is_connected(slot.index) {
                slot.phase = SlotPhase::AwaitingResponse;
            }
        }

        for index in 0..total {
            if !self.connections.is_connected(index) {
                continue;
            }
            match self.connections.send_message(index, text).await {
                Ok(query) => self.slots[index].pending_queries.push(query.id),
                Err(e) => {
                    log_error(&e);
                    self.slots[index].phase = SlotPhase::Idle;
                }
            }
        }

        if connected < total {
            log::warn!(
                "⚠️  Session {}: dispatching to {}/{} slots",
                self.session_id,
                connected,
                total
            );
            self.notice = Some(Notice::PartialConnectivity { connected, total });
            Ok(DispatchOutcome::Partial { connected, total })
        } else {
            Ok(DispatchOutcome::Full)
        }
    }

    /// Fold one slot event into session state. Returns `false` if it was ignored.
    pub fn handle_event(&mut self, event: SlotEvent) -> bool {
        if event.generation != self.connections.generation() {
            log::debug!(
                "Ignoring {} from slot {} (generation {})",
                event.kind.name(),
                event.slot,
                event.generation
            );
            return false;
        }
        let index = event.slot;
        let Some(slot) = self.slots.get_mut(index) else {
            return false;
        };

        let mut completed = Vec::new();
        match event.kind {
            SlotEventKind::ConnectionChanged { connected, status } => {
                slot.connected = connected;
                slot.status = status;
                if !connected {
                    slot.typing = false;
                    slot.pending_queries.clear();
                    if slot.loading() {
                        slot.phase = SlotPhase::Done;
                    }
                    completed = self.history.abandon_slot(index);
                }
            }
            SlotEventKind::TypingStarted => slot.typing = true,
            SlotEventKind::TypingEnded => slot.typing = false,
            SlotEventKind::Message { content, query_id } => {
                let message = slot.slot_message(content);
                slot.timeline.push(message);
                if let Some(query_id) = query_id {
                    slot.settle(query_id);
                }
            }
            SlotEventKind::System { content, .. } => {
                if slot.loading() {
                    slot.phase = SlotPhase::StreamingIntermediate;
                }
                if let Some(content) = content {
                    let message = slot.slot_message(content).with_kind(MessageKind::System);
                    slot.timeline.push(message);
                }
            }
            SlotEventKind::Error { error, query_id } => {
                let message = slot
                    .slot_message(error.message.clone())
                    .with_kind(MessageKind::Error);
                slot.timeline.push(message);
                if let Some(query_id) = query_id {
                    slot.settle(query_id);
                    completed.extend(self.history.abandon_query(index, query_id));
                }
                self.notice = Some(Notice::SlotError { slot: index, error });
            }
            SlotEventKind::QuerySent { query } => self.history.record_query_sent(index, query),
            SlotEventKind::ResponseReceived { response } => {
                completed.extend(self.history.record_response_received(index, response));
            }
        }

        self.record_completed(completed);
        true
    }

    fn record_completed(&mut self, items: Vec<HistoryItem>) {
        if let Some(item) = items.last() {
            self.notice = Some(Notice::HistoryRecorded { item_id: item.id });
        }
    }

    // ------------------------------------------------------------------------
    // Agent persistence
    // ------------------------------------------------------------------------

    /// Persist a slot's parameters to the agent under test.
    ///
    /// Saving slot 0 also makes the result the session's canonical agent.
    pub async fn save_config(&mut self, index: usize) -> Result<AgentRecord> {
        let config = self.slot(index)?.config.clone();
        config.validate()?;
        let agent_id = self
            .agent
            .as_ref()
            .map(|a| a.id.clone())
            .ok_or_else(|| AppError::validation("Session has no agent to save to"))?;

        let saved = self
            .backend
            .update_agent_settings(&agent_id, &AgentSettingsPatch::from(&config))
            .await?;
        if index == 0 {
            self.agent = Some(saved.clone());
        }
        Ok(saved)
    }

    /// Change the agent under test; history is cleared and every connection rebuilt.
    pub async fn switch_agent(&mut self, agent_id: &str) -> Result<()> {
        let agent = self.backend.fetch_agent(agent_id).await?;
        log::info!("🔁 Session {} switches to agent {}", self.session_id, agent.id);

        self.history.clear_history();
        self.replay = None;
        self.agent = Some(agent);
        let primary = self.seed_slot(0);
        for slot in &mut self.slots {
            slot.timeline.clear();
            slot.phase = SlotPhase::Idle;
        }
        self.slots[0] = primary;
        self.reinitialize()
    }

    // ------------------------------------------------------------------------
    // History
    // ------------------------------------------------------------------------

    /// Rebuild per-slot timelines from a stored item. Live slots are untouched.
    pub fn load_history_item(&mut self, item: &HistoryItem) -> Vec<ReplayedSlot> {
        let replay: Vec<ReplayedSlot> = item
            .pairs
            .iter()
            .map(|pair| {
                let avatar = self
                    .slots
                    .get(pair.slot_index)
                    .and_then(|s| s.avatar.clone());
                let question = Message::user(item.query.clone()).with_timestamp(pair.query.timestamp);
                let answer = Message::from_slot(
                    pair.slot_index,
                    pair.response.content.clone(),
                    Some(pair.query.config.model.clone()),
                    avatar,
                )
                .with_timestamp(pair.response.timestamp);

                ReplayedSlot {
                    slot_index: pair.slot_index,
                    config: pair.query.config.clone(),
                    timeline: vec![question, answer],
                }
            })
            .collect();

        self.replay = Some(replay.clone());
        replay
    }

    pub fn select_history(&mut self, item_id: Uuid) -> Result<Vec<ReplayedSlot>> {
        let item = self
            .history
            .select_history(item_id)
            .cloned()
            .ok_or_else(|| AppError::not_found(format!("History item {}", item_id)))?;
        Ok(self.load_history_item(&item))
    }

    pub fn prepare_new_message(&mut self) {
        self.history.prepare_new_message();
        self.replay = None;
    }

    pub fn exit_history_mode(&mut self) {
        self.history.exit_history_mode();
        self.replay = None;
    }

    pub fn clear_history(&mut self) {
        self.history.clear_history();
        self.replay = None;
    }

    // ------------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------------

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn agent(&self) -> Option<&AgentRecord> {
        self.agent.as_ref()
    }

    pub fn slots(&self) -> &[Slot] {
        &self.slots
    }

    pub fn slot(&self, index: usize) -> Result<&Slot> {
        self.slots
            .get(index)
            .ok_or_else(|| AppError::slot_out_of_range(index, self.slots.len()))
    }

    pub fn history(&self) -> &[HistoryItem] {
        self.history.history()
    }

    pub fn correlator(&self) -> &HistoryCorrelator {
        &self.history
    }

    pub fn connected_count(&self) -> usize {
        self.connections.connected_count()
    }

    pub fn notice(&self) -> Option<&Notice> {
        self.notice.as_ref()
    }

    /// True while any slot still owes an answer.
    pub fn processing(&self) -> bool {
        self.slots.iter().any(Slot::loading)
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            session_id: self.session_id.clone(),
            agent: self.agent.clone(),
            slots: self.slots.clone(),
            processing: self.processing(),
            connected_count: self.connected_count(),
            history_count: self.history.history().len(),
            history_mode: self.history.is_history_mode(),
            selected_history: self.history.selected_id(),
            preparing_new_message: self.history.is_preparing_new_message(),
            replay: self.replay.clone(),
            notice: self.notice.clone(),
        }
    }

    pub fn shutdown(&mut self) {
        self.connections.cleanup();
        for slot in &mut self.slots {
            slot.connected = false;
            slot.status = ConnectionStatus::Closed;
            slot.typing = false;
        }
        log::info!("🛑 Session {} shut down", self.session_id);
    }
}

fn check_slot_count(count: usize) -> Result<()> {
    if (MIN_SLOTS..=MAX_SLOTS).contains(&count) {
        Ok(())
    } else {
        Err(AppError::slot_limit(format!(
            "Slot count must be between {} and {}, got {}",
            MIN_SLOTS, MAX_SLOTS, count
        )))
    }
}

// ============================================================================
// TESTS
// ============================================================================
