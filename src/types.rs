use serde::{Deserialize, Serialize};
use std::fmt;
use strum_macros::{Display, EnumString};

/// Hard upper bound on parallel comparison lanes.
pub const MAX_SLOTS: usize = 4;
pub const MIN_SLOTS: usize = 1;

// ============================================================================
// Connection Status
// ============================================================================

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ConnectionStatus {
    Connecting,
    Open,
    Closed,
    Error,
}

impl ConnectionStatus {
    pub fn is_open(&self) -> bool {
        matches!(self, Self::Open)
    }

    /// `Error` and `Closed` both leave the slot unusable until reinitialized.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Closed | Self::Error)
    }
}

impl Default for ConnectionStatus {
    fn default() -> Self {
        Self::Closed
    }
}

// ============================================================================
// Slot Phase
// ============================================================================

/// Per-slot response lifecycle for the current dispatch.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum SlotPhase {
    Idle,
    AwaitingResponse,
    StreamingIntermediate,
    Done,
}

impl SlotPhase {
    pub fn is_loading(&self) -> bool {
        matches!(self, Self::AwaitingResponse | Self::StreamingIntermediate)
    }
}

impl Default for SlotPhase {
    fn default() -> Self {
        Self::Idle
    }
}

// ============================================================================
// Color Helper (for UI)
// ============================================================================

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct Color {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

impl Color {
    pub const fn rgb(r: u8, g: u8, b: u8) -> Self {
        Self { r, g, b }
    }

    pub fn to_hex(&self) -> String {
        format!("#{:02x}{:02x}{:02x}", self.r, self.g, self.b)
    }

    /// Accent colour for a lane; stable for a given index.
    pub fn for_slot(index: usize) -> Self {
        SLOT_PALETTE[index % SLOT_PALETTE.len()]
    }
}

impl fmt::Display for Color {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

const SLOT_PALETTE: [Color; MAX_SLOTS] = [
    Color::rgb(0x3b, 0x82, 0xf6),
    Color::rgb(0x10, 0xb9, 0x81),
    Color::rgb(0xf5, 0x9e, 0x0b),
    Color::rgb(0xec, 0x48, 0x99),
];

// ============================================================================
// Range Helper
// ============================================================================

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct Range<T> {
    pub min: T,
    pub max: T,
}

impl<T: PartialOrd> Range<T> {
    pub const fn new_unchecked(min: T, max: T) -> Self {
        Self { min, max }
    }

    pub fn contains(&self, value: &T) -> bool {
        value >= &self.min && value <= &self.max
    }
}

pub const TEMPERATURE_RANGE: Range<f32> = Range::new_unchecked(0.0, 1.0);
pub const MAX_TOKENS_RANGE: Range<u32> = Range::new_unchecked(1, 32_768);

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn test_status_display_and_parse() {
        assert_eq!(ConnectionStatus::Open.to_string(), "open");
        assert_eq!(
            ConnectionStatus::from_str("connecting").unwrap(),
            ConnectionStatus::Connecting
        );
        assert!(ConnectionStatus::Error.is_terminal());
        assert!(!ConnectionStatus::Connecting.is_open());
    }

    #[test]
    fn test_phase_loading() {
        assert!(SlotPhase::AwaitingResponse.is_loading());
        assert!(SlotPhase::StreamingIntermediate.is_loading());
        assert!(!SlotPhase::Done.is_loading());
        assert!(!SlotPhase::Idle.is_loading());
        assert_eq!(SlotPhase::StreamingIntermediate.to_string(), "streaming_intermediate");
    }

    #[test]
    fn test_slot_colors_are_distinct() {
        let colors: Vec<_> = (0..MAX_SLOTS).map(Color::for_slot).collect();
        for (i, a) in colors.iter().enumerate() {
            for b in colors.iter().skip(i + 1) {
                assert_ne!(a, b);
            }
        }
        assert_eq!(Color::for_slot(0).to_hex(), "#3b82f6");
    }

    #[test]
    fn test_ranges() {
        assert!(TEMPERATURE_RANGE.contains(&0.0));
        assert!(TEMPERATURE_RANGE.contains(&1.0));
        assert!(!TEMPERATURE_RANGE.contains(&1.2));
        assert!(!MAX_TOKENS_RANGE.contains(&0));
    }
}
