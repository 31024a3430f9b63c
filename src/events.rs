use serde::Serialize;

/// Capacity of the broadcast channel carrying session state changes.
pub const EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PlaybackState {
    Idle,
    Resolving,
    Ready,
    Playing,
    Stopped,
    Error,
}

#[derive(Debug, Clone, Serialize)]
pub struct StateChangedPayload {
    pub track_id: String,
    pub state: PlaybackState,
}
