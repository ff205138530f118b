use serde::Serialize;

/// Lifecycle of a streaming session.
///
/// `Idle → Streaming ⇄ Paused → Stopped → Disposed`; file processing goes
/// straight from `Idle` to `Stopped`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Idle,
    Streaming,
    Paused,
    Stopped,
    Disposed,
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            SessionState::Idle => "idle",
            SessionState::Streaming => "streaming",
            SessionState::Paused => "paused",
            SessionState::Stopped => "stopped",
            SessionState::Disposed => "disposed",
        };
        f.write_str(name)
    }
}

impl SessionState {
    /// Whether a pipeline is alive in this state.
    pub fn is_running(self) -> bool {
        matches!(self, SessionState::Streaming | SessionState::Paused)
    }
}
