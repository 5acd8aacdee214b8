use serde::Serialize;

/// Lifecycle of the server-side UI this client is attached to.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UiState {
    #[default]
    Initializing,
    Running,
    Terminated,
}

#[derive(Debug, Default)]
pub struct UiLifecycle {
    state: UiState,
}

impl UiLifecycle {
    pub fn state(&self) -> UiState {
        self.state
    }

    pub fn is_running(&self) -> bool {
        self.state == UiState::Running
    }

    pub fn is_terminated(&self) -> bool {
        self.state == UiState::Terminated
    }

    /// Moves to `next`. Returns whether anything changed. Terminated is final.
    pub fn set_state(&mut self, next: UiState) -> bool {
        if self.state == next || self.state == UiState::Terminated {
            return false;
        }
        tracing::debug!(target: "uplink::lifecycle", from = ?self.state, to = ?next, "ui state");
        self.state = next;
        true
    }
}

/// What a host would render as the loading / connection indicator.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionIndicator {
    #[default]
    Connected,
    Loading,
    Reconnecting,
    ConnectionLost,
}
