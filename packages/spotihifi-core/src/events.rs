//! Player-state events and observer fan-out.
//!
//! The engine depends on the [`PlayerObserver`] trait rather than on any
//! concrete transport, so connected clients, tests and alternative
//! frontends all subscribe the same way. Observers are invoked on the
//! engine thread and must not block.

use serde_json::{json, Value};

use crate::catalog::Track;

/// Playback states as they appear in `pb-event` notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlayerState {
    Playing,
    Paused,
    Skip,
    Stopped,
}

impl PlayerState {
    /// Wire spelling of the state.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Playing => "playing",
            Self::Paused => "paused",
            Self::Skip => "skip",
            Self::Stopped => "stopped",
        }
    }
}

impl std::fmt::Display for PlayerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Builds the `{ state, track? }` event object delivered to observers.
#[must_use]
pub fn player_state_event(state: PlayerState, track: Option<&Track>) -> Value {
    let mut event = json!({ "state": state.as_str() });
    if let Some(track) = track {
        event["track"] = serde_json::to_value(track).unwrap_or(Value::Null);
    }
    event
}

/// Subscriber for player-state events.
///
/// Called on the engine thread; implementations hand the event off (queue,
/// channel) instead of doing I/O inline.
pub trait PlayerObserver: Send + Sync {
    /// Delivers one `{ state, track? }` event object.
    fn player_state_event(&self, event: Value);
}
