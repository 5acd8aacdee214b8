use serde::Serialize;
use serde_json::Value;

use crate::lifecycle::{ConnectionIndicator, UiState};

/// Reconnect dialog as a host should currently render it.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct DialogState {
    pub visible: bool,
    pub reconnecting: bool,
    pub modal: bool,
    pub text: String,
}

/// Everything the client reports outward. Several subscribers may observe
/// the same stream.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientEvent {
    Lifecycle { state: UiState },
    Indicator { indicator: ConnectionIndicator },
    ReconnectDialog { dialog: DialogState },
    /// Script invocations from the server, in order, after the state tree
    /// has processed the accompanying changes.
    Execute { commands: Vec<Value> },
    /// Navigate away. `None` reloads the current location.
    Redirect { url: Option<String> },
    Reload,
    SessionExpired,
    UnrecoverableError {
        caption: Option<String>,
        message: Option<String>,
        details: Option<String>,
        url: Option<String>,
    },
    CommunicationError {
        details: String,
        status: Option<u16>,
    },
}

impl ClientEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ClientEvent::Lifecycle {
                state: UiState::Terminated
            }
        )
    }
}
