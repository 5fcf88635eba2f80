use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::error::{AppError, ErrorCode, Result};
use crate::models::{ChatConfig, QueryRecord, ResponseRecord};
use crate::session::events::{SlotEvent, SlotEventKind};
use crate::session::transport::{InboundFrame, OutboundFrame, SlotAddress, Transport};
use crate::types::{ConnectionStatus, MAX_SLOTS, MIN_SLOTS};

pub type SlotEventSender = mpsc::UnboundedSender<SlotEvent>;
pub type SlotEventReceiver = mpsc::UnboundedReceiver<SlotEvent>;

const OUTBOUND_CAPACITY: usize = 16;

// ============================================================================
// CONNECTION MANAGER
// ============================================================================

struct SlotConnection {
    config: ChatConfig,
    status: watch::Receiver<ConnectionStatus>,
    outbound: mpsc::Sender<OutboundFrame>,
    task: JoinHandle<()>,
}

/// Owns the live connection set of one test session.
///
/// Every slot runs in its own task; whatever a slot reports comes back as a
/// [`SlotEvent`] on the receiver handed out by [`ConnectionManager::new`].
pub struct ConnectionManager {
    transport: Arc<dyn Transport>,
    events: SlotEventSender,
    session_id: Option<String>,
    generation: u64,
    slots: Vec<SlotConnection>,
}

impl ConnectionManager {
    pub fn new(transport: Arc<dyn Transport>) -> (Self, SlotEventReceiver) {
        let (events, rx) = mpsc::unbounded_channel();
        let manager = Self {
            transport,
            events,
            session_id: None,
            generation: 0,
            slots: Vec::new(),
        };
        (manager, rx)
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    /// Tear down whatever is open and start `slot_count` fresh connections.
    ///
    /// Returns as soon as every slot worker is spawned; slots reach `Open` (or
    /// fail) on their own and report through events. Missing configs fall back
    /// to the default.
    pub fn initialize_connections(
        &mut self,
        session_id: &str,
        slot_count: usize,
        configs: &[ChatConfig],
    ) -> Result<usize> {
        if !(MIN_SLOTS..=MAX_SLOTS).contains(&slot_count) {
            return Err(AppError::slot_limit(format!(
                "Slot count must be between {} and {}, got {}",
                MIN_SLOTS, MAX_SLOTS, slot_count
            )));
        }

        self.cleanup();
        self.generation += 1;
        self.session_id = Some(session_id.to_string());

        for index in 0..slot_count {
            let config = configs.get(index).cloned().unwrap_or_default();
            let (status_tx, status_rx) = watch::channel(ConnectionStatus::Connecting);
            let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_CAPACITY);

            let worker = SlotWorker {
                address: SlotAddress::new(session_id, index),
                generation: self.generation,
                transport: self.transport.clone(),
                events: self.events.clone(),
                status: status_tx,
            };

            self.slots.push(SlotConnection {
                config,
                status: status_rx,
                outbound: outbound_tx,
                task: tokio::spawn(worker.run(outbound_rx)),
            });
        }

        log::info!(
            "🔌 Session {}: opening {} slot connection(s) (generation {})",
            session_id,
            slot_count,
            self.generation
        );
        Ok(slot_count)
    }

    /// Send `text` on one slot. `QuerySent` is emitted before the frame leaves.
    pub async fn send_message(&self, slot: usize, text: &str) -> Result<QueryRecord> {
        let connection = self.connection(slot)?;

        let status = *connection.status.borrow();
        if !status.is_open() {
            return Err(AppError::send(
                slot,
                format!("Slot {} is not connected ({})", slot, status),
            ));
        }

        let query = QueryRecord::new(slot, text, connection.config.clone());
        self.emit(
            slot,
            SlotEventKind::QuerySent {
                query: query.clone(),
            },
        );

        if connection
            .outbound
            .send(OutboundFrame::query(&query))
            .await
            .is_err()
        {
            let err = AppError::send(slot, format!("Slot {} connection is gone", slot));
            self.emit(
                slot,
                SlotEventKind::Error {
                    error: err.clone(),
                    query_id: Some(query.id),
                },
            );
            return Err(err);
        }

        Ok(query)
    }

    /// Swap the slot's parameters in place; the connection is left untouched.
    pub fn update_config(&mut self, slot: usize, config: ChatConfig) -> Result<()> {
        let count = self.slots.len();
        let connection = self
            .slots
            .get_mut(slot)
            .ok_or_else(|| AppError::slot_out_of_range(slot, count))?;
        log::debug!("Slot {} now runs {}", slot, config.model);
        connection.config = config;
        Ok(())
    }

    pub fn status(&self, slot: usize) -> Option<ConnectionStatus> {
        self.slots.get(slot).map(|c| *c.status.borrow())
    }

    pub fn is_connected(&self, slot: usize) -> bool {
        self.status(slot).is_some_and(|s| s.is_open())
    }

    pub fn connected_count(&self) -> usize {
        self.slots
            .iter()
            .filter(|c| c.status.borrow().is_open())
            .count()
    }

    /// Close every connection. Safe to call any number of times.
    pub fn cleanup(&mut self) {
        if self.slots.is_empty() {
            return;
        }
        for connection in self.slots.drain(..) {
            connection.task.abort();
        }
        log::info!(
            "🔌 Session {}: closed all slot connections",
            self.session_id.as_deref().unwrap_or("-")
        );
    }

    fn connection(&self, slot: usize) -> Result<&SlotConnection> {
        self.slots
            .get(slot)
            .ok_or_else(|| AppError::slot_out_of_range(slot, self.slots.len()))
    }

    fn emit(&self, slot: usize, kind: SlotEventKind) {
        let _ = self.events.send(SlotEvent::new(self.generation, slot, kind));
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        for connection in &self.slots {
            connection.task.abort();
        }
    }
}

// ============================================================================
// SLOT WORKER
// ============================================================================

struct SlotWorker {
    address: SlotAddress,
    generation: u64,
    transport: Arc<dyn Transport>,
    events: SlotEventSender,
    status: watch::Sender<ConnectionStatus>,
}

impl SlotWorker {
    async fn run(self, mut outbound: mpsc::Receiver<OutboundFrame>) {
        let slot = self.address.slot;
        log::debug!("Slot {} connecting", slot);

        let mut link = match self.transport.connect(&self.address).await {
            Ok(link) => link,
            Err(e) => {
                log::warn!("⚠️  Slot {} failed to connect: {}", slot, e);
                self.status.send_replace(ConnectionStatus::Error);
                self.emit(SlotEventKind::Error {
                    error: AppError::connection(slot, format!("Connection failed: {}", e)),
                    query_id: None,
                });
                self.close();
                return;
            }
        };

        self.status.send_replace(ConnectionStatus::Open);
        log::info!("✅ Slot {} connected", slot);
        self.emit(SlotEventKind::ConnectionChanged {
            connected: true,
            status: ConnectionStatus::Open,
        });

        // Queries sent and not yet answered, oldest first. Untagged terminal
        // frames answer the front.
        let mut pending: VecDeque<Uuid> = VecDeque::new();

        loop {
            tokio::select! {
                biased;

                frame = outbound.recv() => {
                    let Some(frame) = frame else { break };
                    let query_id = frame.query_id();
                    pending.push_back(query_id);
                    if let Err(e) = link.send(frame).await {
                        log::warn!("⚠️  Slot {} send failed: {}", slot, e);
                        pending.retain(|id| *id != query_id);
                        self.emit(SlotEventKind::Error {
                            error: AppError::send(slot, format!("Send failed: {}", e)),
                            query_id: Some(query_id),
                        });
                    }
                }
                inbound = link.recv() => match inbound {
                    Some(Ok(frame)) => self.dispatch_inbound(frame, &mut pending),
                    Some(Err(e)) => {
                        log::warn!("⚠️  Slot {} connection lost: {}", slot, e);
                        self.status.send_replace(ConnectionStatus::Error);
                        self.emit(SlotEventKind::Error {
                            error: AppError::connection(slot, format!("Connection lost: {}", e)),
                            query_id: pending.pop_front(),
                        });
                        break;
                    }
                    None => {
                        log::info!("Slot {} closed by remote", slot);
                        break;
                    }
                },
            }
        }

        link.close().await;
        self.close();
    }

    fn dispatch_inbound(&self, frame: InboundFrame, pending: &mut VecDeque<Uuid>) {
        let slot = self.address.slot;
        match frame {
            InboundFrame::TypingStart => self.emit(SlotEventKind::TypingStarted),
            InboundFrame::TypingEnd => self.emit(SlotEventKind::TypingEnded),
            InboundFrame::System { content } => self.emit(SlotEventKind::System {
                content,
                query_id: pending.front().copied(),
            }),
            InboundFrame::Message { content, query_id } => {
                let query_id = match query_id {
                    Some(id) => {
                        pending.retain(|p| *p != id);
                        Some(id)
                    }
                    None => pending.pop_front(),
                };
                self.emit(SlotEventKind::Message {
                    content: content.clone(),
                    query_id,
                });
                match query_id {
                    Some(query_id) => self.emit(SlotEventKind::ResponseReceived {
                        response: ResponseRecord::new(slot, query_id, content),
                    }),
                    None => log::debug!("Slot {} sent an unsolicited message", slot),
                }
            }
            InboundFrame::Error { message } => {
                let error = AppError::new(ErrorCode::ExternalServiceError, message)
                    .with_details(serde_json::json!({ "slot": slot }));
                self.emit(SlotEventKind::Error {
                    error,
                    query_id: pending.pop_front(),
                });
            }
        }
    }

    fn close(&self) {
        self.status.send_replace(ConnectionStatus::Closed);
        self.emit(SlotEventKind::ConnectionChanged {
            connected: false,
            status: ConnectionStatus::Closed,
        });
    }

    fn emit(&self, kind: SlotEventKind) {
        let _ = self
            .events
            .send(SlotEvent::new(self.generation, self.address.slot, kind));
    }
}

// ============================================================================
// TESTS
// ============================================================================
