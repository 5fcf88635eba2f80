use tokio::sync::{broadcast, mpsc, oneshot};
use uuid::Uuid;

use crate::error::{AppError, Result};
use crate::models::{AgentRecord, ChatConfig, HistoryItem};
use crate::session::connection::SlotEventReceiver;
use crate::session::controller::{DispatchOutcome, ReplayedSlot, SessionSnapshot, TestSessionController};

const COMMAND_CAPACITY: usize = 32;
const SNAPSHOT_CAPACITY: usize = 64;

type Reply<T> = oneshot::Sender<Result<T>>;

enum SessionCommand {
    Start {
        agent_id: Option<String>,
        slot_count: usize,
        reply: Reply<()>,
    },
    AddSlot {
        reply: Reply<usize>,
    },
    RemoveSlot {
        index: Option<usize>,
        reply: Reply<()>,
    },
    CloneConfig {
        source: usize,
        reply: Reply<usize>,
    },
    UpdateConfig {
        index: usize,
        config: ChatConfig,
        reply: Reply<()>,
    },
    SaveConfig {
        index: usize,
        reply: Reply<AgentRecord>,
    },
    Dispatch {
        text: String,
        reply: Reply<DispatchOutcome>,
    },
    SwitchAgent {
        agent_id: String,
        reply: Reply<()>,
    },
    SelectHistory {
        item_id: Uuid,
        reply: Reply<Vec<ReplayedSlot>>,
    },
    PrepareNewMessage {
        reply: Reply<()>,
    },
    ExitHistoryMode {
        reply: Reply<()>,
    },
    History {
        reply: Reply<Vec<HistoryItem>>,
    },
    Snapshot {
        reply: Reply<SessionSnapshot>,
    },
    Shutdown,
}

/// Cloneable handle to a session task that owns its controller.
///
/// Every state change is published as a [`SessionSnapshot`] to subscribers.
#[derive(Clone, Debug)]
pub struct SessionHandle {
    session_id: String,
    commands: mpsc::Sender<SessionCommand>,
    snapshots: broadcast::Sender<SessionSnapshot>,
}

impl SessionHandle {
    pub fn spawn(controller: TestSessionController, events: SlotEventReceiver) -> Self {
        let (commands, command_rx) = mpsc::channel(COMMAND_CAPACITY);
        let (snapshots, _) = broadcast::channel(SNAPSHOT_CAPACITY);
        let handle = Self {
            session_id: controller.session_id().to_string(),
            commands,
            snapshots: snapshots.clone(),
        };
        tokio::spawn(run(controller, events, command_rx, snapshots));
        handle
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionSnapshot> {
        self.snapshots.subscribe()
    }

    async fn request<T>(&self, command: impl FnOnce(Reply<T>) -> SessionCommand) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(command(tx))
            .await
            .map_err(|_| self.gone())?;
        rx.await.map_err(|_| self.gone())?
    }

    fn gone(&self) -> AppError {
        AppError::not_found(format!("Session {}", self.session_id))
    }

    pub async fn start(&self, agent_id: Option<String>, slot_count: usize) -> Result<()> {
        self.request(|reply| SessionCommand::Start {
            agent_id,
            slot_count,
            reply,
        })
        .await
    }

    pub async fn add_slot(&self) -> Result<usize> {
        self.request(|reply| SessionCommand::AddSlot { reply }).await
    }

    /// `None` removes the last slot.
    pub async fn remove_slot(&self, index: Option<usize>) -> Result<()> {
        self.request(|reply| SessionCommand::RemoveSlot { index, reply })
            .await
    }

    pub async fn clone_config(&self, source: usize) -> Result<usize> {
        self.request(|reply| SessionCommand::CloneConfig { source, reply })
            .await
    }

    pub async fn update_config(&self, index: usize, config: ChatConfig) -> Result<()> {
        self.request(|reply| SessionCommand::UpdateConfig {
            index,
            config,
            reply,
        })
        .await
    }

    pub async fn save_config(&self, index: usize) -> Result<AgentRecord> {
        self.request(|reply| SessionCommand::SaveConfig { index, reply })
            .await
    }

    pub async fn dispatch(&self, text: impl Into<String>) -> Result<DispatchOutcome> {
        let text = text.into();
        self.request(|reply| SessionCommand::Dispatch { text, reply })
            .await
    }

    pub async fn switch_agent(&self, agent_id: impl Into<String>) -> Result<()> {
        let agent_id = agent_id.into();
        self.request(|reply| SessionCommand::SwitchAgent { agent_id, reply })
            .await
    }

    pub async fn select_history(&self, item_id: Uuid) -> Result<Vec<ReplayedSlot>> {
        self.request(|reply| SessionCommand::SelectHistory { item_id, reply })
            .await
    }

    pub async fn prepare_new_message(&self) -> Result<()> {
        self.request(|reply| SessionCommand::PrepareNewMessage { reply })
            .await
    }

    pub async fn exit_history_mode(&self) -> Result<()> {
        self.request(|reply| SessionCommand::ExitHistoryMode { reply })
            .await
    }

    pub async fn history(&self) -> Result<Vec<HistoryItem>> {
        self.request(|reply| SessionCommand::History { reply }).await
    }

    pub async fn snapshot(&self) -> Result<SessionSnapshot> {
        self.request(|reply| SessionCommand::Snapshot { reply }).await
    }

    pub async fn shutdown(&self) {
        let _ = self.commands.send(SessionCommand::Shutdown).await;
    }
}

async fn run(
    mut controller: TestSessionController,
    mut events: SlotEventReceiver,
    mut commands: mpsc::Receiver<SessionCommand>,
    snapshots: broadcast::Sender<SessionSnapshot>,
) {
    log::debug!("Session {} task started", controller.session_id());
    loop {
        tokio::select! {
            command = commands.recv() => {
                let Some(command) = command else { break };
                let Some(changed) = execute(&mut controller, command).await else { break };
                if changed {
                    let _ = snapshots.send(controller.snapshot());
                }
            }
            Some(event) = events.recv() => {
                if controller.handle_event(event) {
                    let _ = snapshots.send(controller.snapshot());
                }
            }
        }
    }
    controller.shutdown();
}

/// Run one command. `None` stops the session; otherwise whether state changed.
async fn execute(controller: &mut TestSessionController, command: SessionCommand) -> Option<bool> {
    let changed = match command {
        SessionCommand::Start {
            agent_id,
            slot_count,
            reply,
        } => {
            let _ = reply.send(controller.start(agent_id.as_deref(), slot_count).await);
            true
        }
        SessionCommand::AddSlot { reply } => {
            let _ = reply.send(controller.add_slot());
            true
        }
        SessionCommand::RemoveSlot { index, reply } => {
            let result = match index {
                Some(index) => controller.remove_slot(index),
                None => controller.remove_last_slot(),
            };
            let _ = reply.send(result);
            true
        }
        SessionCommand::CloneConfig { source, reply } => {
            let _ = reply.send(controller.clone_config(source));
            true
        }
        SessionCommand::UpdateConfig {
            index,
            config,
            reply,
        } => {
            let _ = reply.send(controller.update_config(index, config));
            true
        }
        SessionCommand::SaveConfig { index, reply } => {
            let _ = reply.send(controller.save_config(index).await);
            true
        }
        SessionCommand::Dispatch { text, reply } => {
            let _ = reply.send(controller.dispatch_user_message(&text).await);
            true
        }
        SessionCommand::SwitchAgent { agent_id, reply } => {
            let _ = reply.send(controller.switch_agent(&agent_id).await);
            true
        }
        SessionCommand::SelectHistory { item_id, reply } => {
            let _ = reply.send(controller.select_history(item_id));
            true
        }
        SessionCommand::PrepareNewMessage { reply } => {
            controller.prepare_new_message();
            let _ = reply.send(Ok(()));
            true
        }
        SessionCommand::ExitHistoryMode { reply } => {
            controller.exit_history_mode();
            let _ = reply.send(Ok(()));
            true
        }
        SessionCommand::History { reply } => {
            let _ = reply.send(Ok(controller.history().to_vec()));
            false
        }
        SessionCommand::Snapshot { reply } => {
            let _ = reply.send(Ok(controller.snapshot()));
            false
        }
        SessionCommand::Shutdown => return None,
    };
    Some(changed)
}
