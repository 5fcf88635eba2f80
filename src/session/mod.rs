// Public module exports
pub mod backend;
pub mod connection;
pub mod controller;
pub mod events;
pub mod history;
pub mod runner;
pub mod transport;

#[cfg(test)]
pub(crate) mod testing;

// Re-export main types for convenience
pub use backend::{AgentBackend, RestAgentBackend};
pub use connection::{ConnectionManager, SlotEventReceiver, SlotEventSender};
pub use controller::{DispatchOutcome, Notice, ReplayedSlot, SessionSnapshot, Slot, TestSessionController};
pub use events::{SlotEvent, SlotEventKind};
pub use history::HistoryCorrelator;
pub use runner::SessionHandle;
pub use transport::{
    HttpStreamTransport, InboundFrame, OutboundFrame, SlotAddress, Transport, TransportError,
    TransportLink,
};
