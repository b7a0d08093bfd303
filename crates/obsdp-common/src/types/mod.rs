//! Common types used across OBSDP

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{ObsdpError, Result};

/// Numeric id of a registered data source
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SourceId(pub i32);

impl std::fmt::Display for SourceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One of the two interchangeable instance slots
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum SlotId {
    Zero,
    One,
}

impl SlotId {
    pub const ALL: [SlotId; 2] = [SlotId::Zero, SlotId::One];

    pub fn index(self) -> usize {
        match self {
            SlotId::Zero => 0,
            SlotId::One => 1,
        }
    }

    /// The slot that is not `self`
    pub fn other(self) -> SlotId {
        match self {
            SlotId::Zero => SlotId::One,
            SlotId::One => SlotId::Zero,
        }
    }
}

impl From<SlotId> for u8 {
    fn from(slot: SlotId) -> Self {
        slot.index() as u8
    }
}

impl TryFrom<u8> for SlotId {
    type Error = ObsdpError;

    fn try_from(value: u8) -> Result<Self> {
        SlotId::try_from(i64::from(value))
    }
}

impl TryFrom<i64> for SlotId {
    type Error = ObsdpError;

    /// Instance selectors outside `{0, 1}` are rejected before they reach the engine
    fn try_from(value: i64) -> Result<Self> {
        match value {
            0 => Ok(SlotId::Zero),
            1 => Ok(SlotId::One),
            other => Err(ObsdpError::invalid_argument(format!(
                "instance must be 0 or 1, got {other}"
            ))),
        }
    }
}

impl std::fmt::Display for SlotId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.index())
    }
}

/// Opaque, time-ordered identifier of a validation report
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ReportId(pub Uuid);

impl ReportId {
    /// New id derived from the current time (UUIDv7)
    pub fn generate() -> Self {
        ReportId(Uuid::now_v7())
    }
}

impl std::str::FromStr for ReportId {
    type Err = ObsdpError;

    fn from_str(s: &str) -> Result<Self> {
        Uuid::parse_str(s.trim())
            .map(ReportId)
            .map_err(|_| ObsdpError::invalid_argument(format!("malformed report id: {s}")))
    }
}

impl std::fmt::Display for ReportId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Text in Swedish and English
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalizedText {
    pub sv: String,
    pub en: String,
}

impl LocalizedText {
    pub fn new(sv: impl Into<String>, en: impl Into<String>) -> Self {
        Self {
            sv: sv.into(),
            en: en.into(),
        }
    }

    /// Same text in both languages, for proper names
    pub fn same(text: impl Into<String>) -> Self {
        let text = text.into();
        Self {
            sv: text.clone(),
            en: text,
        }
    }
}
