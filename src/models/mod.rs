//! Data models for the CAME Connect bridge

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

// ============================================================================
// Phase / Command
// ============================================================================

/// Gate phase as reported by the vendor cloud
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Phase {
    Open,
    Closed,
    /// Seen when STOP is issued mid-travel
    Stopped,
    Opening,
    Closing,
}

impl Phase {
    pub const OPEN: i64 = 16;
    pub const CLOSED: i64 = 17;
    pub const STOPPED: i64 = 19;
    pub const OPENING: i64 = 32;
    pub const CLOSING: i64 = 33;

    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            Self::OPEN => Some(Phase::Open),
            Self::CLOSED => Some(Phase::Closed),
            Self::STOPPED => Some(Phase::Stopped),
            Self::OPENING => Some(Phase::Opening),
            Self::CLOSING => Some(Phase::Closing),
            _ => None,
        }
    }

    pub fn code(&self) -> i64 {
        match self {
            Phase::Open => Self::OPEN,
            Phase::Closed => Self::CLOSED,
            Phase::Stopped => Self::STOPPED,
            Phase::Opening => Self::OPENING,
            Phase::Closing => Self::CLOSING,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Phase::Open => "Open",
            Phase::Closed => "Closed",
            Phase::Stopped => "Stopped",
            Phase::Opening => "Opening",
            Phase::Closing => "Closing",
        }
    }

    pub fn is_moving(&self) -> bool {
        matches!(self, Phase::Opening | Phase::Closing)
    }
}

/// Commands accepted by `/automations/{device}/commands/{id}`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateCommand {
    Open,
    Close,
    Stop,
}

impl GateCommand {
    pub fn id(&self) -> u32 {
        match self {
            GateCommand::Open => 2,
            GateCommand::Close => 5,
            GateCommand::Stop => 129,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            GateCommand::Open => "open",
            GateCommand::Close => "close",
            GateCommand::Stop => "stop",
        }
    }
}

/// One decoded push update: raw phase code plus optional percent
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhaseEvent {
    pub phase: i64,
    pub percent: Option<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Opening,
    Closing,
}

/// How the coordinator keeps the snapshot fresh
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
pub enum RefreshPolicy {
    /// REST poll every `poll_interval`, no push channel
    #[serde(rename = "periodic")]
    Periodic,
    /// One REST seed, then WebSocket updates only
    #[serde(rename = "push")]
    PushOnly,
    #[default]
    #[serde(rename = "hybrid")]
    Hybrid,
}

impl RefreshPolicy {
    pub fn polls(&self) -> bool {
        matches!(self, RefreshPolicy::Periodic | RefreshPolicy::Hybrid)
    }

    pub fn uses_push(&self) -> bool {
        matches!(self, RefreshPolicy::PushOnly | RefreshPolicy::Hybrid)
    }
}

// ============================================================================
// Device snapshot
// ============================================================================

/// Index of the `States` entry carrying `[phase, percent]`
pub const STATUS_SLOT: usize = 2;

/// Normalized `/devicestatus`-shaped document.
///
/// Only the hub builds these, so `States[2].Data` always holds
/// `[phase_code, percent]` as two integers.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(transparent)]
pub struct DeviceSnapshot {
    doc: Value,
}

impl DeviceSnapshot {
    pub(crate) fn from_normalized(doc: Value) -> Self {
        Self { doc }
    }

    pub fn as_value(&self) -> &Value {
        &self.doc
    }

    /// The raw `[phase, percent]` pair
    pub fn status_pair(&self) -> [i64; 2] {
        let data = self.doc["States"][STATUS_SLOT]["Data"].as_array();
        let at = |i: usize| data.and_then(|d| d.get(i)).and_then(Value::as_i64);
        [at(0).unwrap_or(Phase::CLOSED), at(1).unwrap_or(0)]
    }

    pub fn phase_code(&self) -> i64 {
        self.status_pair()[0]
    }

    pub fn phase(&self) -> Option<Phase> {
        Phase::from_code(self.phase_code())
    }

    pub fn position(&self) -> i64 {
        self.status_pair()[1]
    }

    pub fn phase_label(&self) -> Option<&'static str> {
        self.phase().map(|p| p.label())
    }

    /// `None` when the phase code is not one we know
    pub fn is_moving(&self) -> Option<bool> {
        match self.phase()? {
            Phase::Opening | Phase::Closing => Some(true),
            Phase::Open | Phase::Closed => Some(false),
            Phase::Stopped => None,
        }
    }

    /// Cloud hub connectivity
    pub fn online(&self) -> Option<bool> {
        self.doc.get("Online").and_then(Value::as_bool)
    }

    pub fn last_seen(&self) -> Option<DateTime<Utc>> {
        let raw = self.doc.get("LastSeen")?.as_str()?;
        if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
            return Some(dt.with_timezone(&Utc));
        }
        // Naive timestamps are UTC
        NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
            .ok()
            .map(|naive| naive.and_utc())
    }

    /// Last non-zero `ErrorCode`/`ResponseCode` across all state slots
    pub fn error_code(&self) -> Option<i64> {
        let states = self.doc.get("States")?.as_array()?;
        let mut last_nonzero = None;
        for state in states {
            for key in ["ErrorCode", "ResponseCode"] {
                if let Some(code) = state.get(key).and_then(Value::as_i64) {
                    if code != 0 {
                        last_nonzero = Some(code);
                    }
                }
            }
        }
        last_nonzero
    }
}

// ============================================================================
// Gate state (cover view)
// ============================================================================

/// Position/direction view the coordinator derives from published snapshots
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct GateState {
    pub phase_code: Option<i64>,
    pub position: Option<i64>,
    pub direction: Option<Direction>,
}

impl GateState {
    pub fn phase(&self) -> Option<Phase> {
        self.phase_code.and_then(Phase::from_code)
    }

    pub fn is_closed(&self) -> Option<bool> {
        match self.phase() {
            Some(Phase::Closed) => Some(true),
            Some(Phase::Open | Phase::Opening | Phase::Closing) => Some(false),
            _ => self.position.map(|pos| pos == 0),
        }
    }

    pub fn is_opening(&self) -> Option<bool> {
        match self.phase() {
            Some(Phase::Opening) => Some(true),
            Some(Phase::Closing) => Some(false),
            _ => self.direction.map(|d| d == Direction::Opening),
        }
    }

    pub fn is_closing(&self) -> Option<bool> {
        match self.phase() {
            Some(Phase::Closing) => Some(true),
            Some(Phase::Opening) => Some(false),
            _ => self.direction.map(|d| d == Direction::Closing),
        }
    }
}
