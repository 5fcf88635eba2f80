pub mod error;
pub mod handlers;
pub mod init;
pub mod models;
pub mod session;
pub mod state;
pub mod types;

pub use crate::session::{SessionHandle, TestSessionController};
pub use crate::state::AppState;
