//! Asynchronous event types.
//!
//! Events are delivered through [`tokio::sync::broadcast`] channels. They
//! are emitted once and never replayed: a subscriber that needs the current
//! picture seeds it from the `Added` events it observes, or asks the
//! registry for a snapshot.

use std::fmt;
use std::net::SocketAddr;

use crate::types::{GuiClient, Radio, RadioKey};

/// What happened to the subject of a [`ChangeEvent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeAction {
    Added,
    Updated,
    Deleted,
}

/// A change in the set of known radios or their client sessions.
///
/// The snapshot carried by each variant is the state after the change (for
/// `Deleted`, the last known state).
#[derive(Debug, Clone, PartialEq)]
pub enum ChangeEvent {
    /// A radio appeared, changed, or went away.
    Radio { action: ChangeAction, radio: Radio },
    /// A client session on a radio appeared, changed, or went away.
    Client {
        action: ChangeAction,
        radio: RadioKey,
        client: GuiClient,
    },
}

impl ChangeEvent {
    /// The action of this event, regardless of subject.
    pub fn action(&self) -> ChangeAction {
        match self {
            ChangeEvent::Radio { action, .. } | ChangeEvent::Client { action, .. } => *action,
        }
    }
}

/// Connection state of a TCP channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Connecting,
    Connected,
    Secured,
    Disconnected,
}

impl fmt::Display for ChannelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ChannelState::Connecting => "connecting",
            ChannelState::Connected => "connected",
            ChannelState::Secured => "secured",
            ChannelState::Disconnected => "disconnected",
        };
        write!(f, "{s}")
    }
}

/// Emitted by TCP channels (command channel, relay listener) on every
/// state transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelStatus {
    pub state: ChannelState,
    pub host: String,
    pub port: u16,
    /// The error that ended the session, if any.
    pub error: Option<String>,
}

impl ChannelStatus {
    pub fn new(state: ChannelState, host: impl Into<String>, port: u16) -> Self {
        Self {
            state,
            host: host.into(),
            port,
            error: None,
        }
    }

    pub fn disconnected(host: impl Into<String>, port: u16, error: Option<String>) -> Self {
        Self {
            state: ChannelState::Disconnected,
            host: host.into(),
            port,
            error,
        }
    }
}

/// Emitted by a stream channel on bind, registration and unbind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamStatus {
    /// The receive socket is bound.
    Bound { local: SocketAddr, remote: SocketAddr },
    /// Every bind attempt failed.
    BindFailed {
        /// The first port tried.
        port: u16,
        attempts: u32,
        error: String,
    },
    /// The first data frame arrived after `register`.
    Registered { handle: u32 },
    /// The socket was closed.
    Unbound,
}
