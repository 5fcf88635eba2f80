use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::AppError;
use crate::models::{QueryRecord, ResponseRecord};
use crate::types::ConnectionStatus;

/// Everything a slot connection reports, tagged with the slot it came from.
///
/// `generation` identifies the connection set that produced the event; it is
/// bumped on every (re)initialization so events from torn-down connections can
/// be told apart from live ones.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlotEvent {
    pub generation: u64,
    pub slot: usize,
    #[serde(flatten)]
    pub kind: SlotEventKind,
}

impl SlotEvent {
    pub fn new(generation: u64, slot: usize, kind: SlotEventKind) -> Self {
        Self {
            generation,
            slot,
            kind,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SlotEventKind {
    // Lifecycle events
    ConnectionChanged {
        connected: bool,
        status: ConnectionStatus,
    },

    // Typing indicator
    TypingStarted,
    TypingEnded,

    // Content events
    Message {
        content: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        query_id: Option<Uuid>,
    },

    /// Keep-alive or processing marker; the slot has not finished its turn.
    System {
        #[serde(skip_serializing_if = "Option::is_none")]
        content: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        query_id: Option<Uuid>,
    },

    // Error events
    Error {
        error: AppError,
        /// Set when the failure ends a specific query.
        #[serde(skip_serializing_if = "Option::is_none")]
        query_id: Option<Uuid>,
    },

    // Correlation events
    QuerySent {
        query: QueryRecord,
    },

    ResponseReceived {
        response: ResponseRecord,
    },
}

impl SlotEventKind {
    pub fn name(&self) -> &'static str {
        match self {
            Self::ConnectionChanged { .. } => "connection_changed",
            Self::TypingStarted => "typing_started",
            Self::TypingEnded => "typing_ended",
            Self::Message { .. } => "message",
            Self::System { .. } => "system",
            Self::Error { .. } => "error",
            Self::QuerySent { .. } => "query_sent",
            Self::ResponseReceived { .. } => "response_received",
        }
    }
}
