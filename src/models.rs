use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::error::{Result, ValidationError, ValidationErrors};
use crate::types::{MAX_TOKENS_RANGE, TEMPERATURE_RANGE};

// ============================================================================
// Chat Config
// ============================================================================

/// Model parameters a slot runs with.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatConfig {
    pub model: String,
    pub temperature: f32,
    #[serde(default)]
    pub system_prompt: String,
    pub max_tokens: u32,
}

impl ChatConfig {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            ..Self::default()
        }
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = prompt.into();
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub fn validate(&self) -> Result<()> {
        let mut errors = ValidationErrors::new();
        if self.model.trim().is_empty() {
            errors.add(ValidationError::new("model", "Model is required").with_code("REQUIRED"));
        }
        if !TEMPERATURE_RANGE.contains(&self.temperature) {
            errors.add(
                ValidationError::new(
                    "temperature",
                    format!(
                        "Temperature must be between {} and {}",
                        TEMPERATURE_RANGE.min, TEMPERATURE_RANGE.max
                    ),
                )
                .with_code("RANGE"),
            );
        }
        if !MAX_TOKENS_RANGE.contains(&self.max_tokens) {
            errors.add(
                ValidationError::new(
                    "max_tokens",
                    format!(
                        "Max tokens must be between {} and {}",
                        MAX_TOKENS_RANGE.min, MAX_TOKENS_RANGE.max
                    ),
                )
                .with_code("RANGE"),
            );
        }
        errors.into_result()
    }
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            model: "llama3.2".to_string(),
            temperature: 0.7,
            system_prompt: String::new(),
            max_tokens: 1024,
        }
    }
}

// ============================================================================
// Timeline Messages
// ============================================================================

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", content = "index", rename_all = "snake_case")]
pub enum Sender {
    User,
    Slot(usize),
}

impl fmt::Display for Sender {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::User => write!(f, "user"),
            Self::Slot(index) => write!(f, "slot-{}", index),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Chat,
    /// Intermediate processing output; does not end the slot's turn.
    System,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Message {
    pub id: Uuid,
    pub content: String,
    pub sender: Sender,
    pub kind: MessageKind,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub avatar: Option<String>,
}

impl Message {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            id: Uuid::now_v7(),
            content: content.into(),
            sender: Sender::User,
            kind: MessageKind::Chat,
            timestamp: Utc::now(),
            model: None,
            avatar: None,
        }
    }

    pub fn from_slot(
        slot: usize,
        content: impl Into<String>,
        model: Option<String>,
        avatar: Option<String>,
    ) -> Self {
        Self {
            id: Uuid::now_v7(),
            content: content.into(),
            sender: Sender::Slot(slot),
            kind: MessageKind::Chat,
            timestamp: Utc::now(),
            model,
            avatar,
        }
    }

    pub fn with_kind(mut self, kind: MessageKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }
}

// ============================================================================
// Correlation Records
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QueryRecord {
    pub id: Uuid,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    pub config: ChatConfig,
    pub slot_index: usize,
}

impl QueryRecord {
    pub fn new(slot_index: usize, content: impl Into<String>, config: ChatConfig) -> Self {
        Self {
            id: Uuid::now_v7(),
            content: content.into(),
            timestamp: Utc::now(),
            config,
            slot_index,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResponseRecord {
    pub id: Uuid,
    pub query_id: Uuid,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    pub slot_index: usize,
}

impl ResponseRecord {
    pub fn new(slot_index: usize, query_id: Uuid, content: impl Into<String>) -> Self {
        Self {
            id: Uuid::now_v7(),
            query_id,
            content: content.into(),
            timestamp: Utc::now(),
            slot_index,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HistoryPair {
    pub slot_index: usize,
    pub query: QueryRecord,
    pub response: ResponseRecord,
}

/// One user query and every participating slot's answer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HistoryItem {
    pub id: Uuid,
    pub query: String,
    pub timestamp: DateTime<Utc>,
    pub pairs: Vec<HistoryPair>,
}

impl HistoryItem {
    pub fn slot_count(&self) -> usize {
        self.pairs.len()
    }

    pub fn response_for(&self, slot_index: usize) -> Option<&ResponseRecord> {
        self.pairs
            .iter()
            .find(|p| p.slot_index == slot_index)
            .map(|p| &p.response)
    }
}

// ============================================================================
// Agent Records (REST backend contract)
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct KnowledgeSource {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub kind: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AgentRecord {
    pub id: String,
    #[serde(default)]
    pub name: String,
    pub model: String,
    pub temperature: f32,
    #[serde(default)]
    pub system_prompt: String,
    pub max_tokens: u32,
    #[serde(default)]
    pub knowledge_sources: Vec<KnowledgeSource>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar: Option<String>,
}

impl AgentRecord {
    pub fn chat_config(&self) -> ChatConfig {
        ChatConfig {
            model: self.model.clone(),
            temperature: self.temperature,
            system_prompt: self.system_prompt.clone(),
            max_tokens: self.max_tokens,
        }
    }

    pub fn apply(&mut self, patch: &AgentSettingsPatch) {
        self.model = patch.model.clone();
        self.temperature = patch.temperature;
        self.system_prompt = patch.system_prompt.clone();
        self.max_tokens = patch.max_tokens;
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AgentSettingsPatch {
    pub model: String,
    pub temperature: f32,
    pub system_prompt: String,
    pub max_tokens: u32,
}

impl From<&ChatConfig> for AgentSettingsPatch {
    fn from(config: &ChatConfig) -> Self {
        Self {
            model: config.model.clone(),
            temperature: config.temperature,
            system_prompt: config.system_prompt.clone(),
            max_tokens: config.max_tokens,
        }
    }
}
