//! JSON wire protocol spoken over the control/status WebSockets.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::track::{Track, TrackService};

/// Inbound command verbs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandKind {
    Play,
    Skip,
    Loop,
    LoopOff,
    Radio,
    RadioOff,
    Shuffle,
    ShuffleOff,
    Disconnect,
}

/// A single client command: `{"type": "...", "query": ..., "service": ..., "trace_id": ...}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandMessage {
    #[serde(rename = "type")]
    pub kind: CommandKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service: Option<TrackService>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
}

/// Server-to-client payload, for both the periodic state broadcast and
/// targeted error replies. Durations travel as integer nanoseconds.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct StateMessage {
    pub is_error: bool,
    pub error_message: String,
    pub current: Track,
    pub position: u64,
    pub length: u64,
    #[serde(rename = "loop")]
    pub looped: bool,
    pub radio: bool,
    pub shuffle: bool,
    pub queue: Vec<Track>,
}

impl StateMessage {
    /// An error reply; the playback fields keep their zero values.
    #[must_use]
    pub fn from_error(message: &str) -> Self {
        Self {
            is_error: true,
            error_message: message.to_owned(),
            ..Self::default()
        }
    }
}

/// Nanosecond representation used by the wire.
#[must_use]
pub fn duration_to_nanos(duration: Duration) -> u64 {
    u64::try_from(duration.as_nanos()).unwrap_or(u64::MAX)
}
