//! # Subscription State Machines
//!
//! Explicit states for both ends of a live query. Transitions that make no
//! sense for the current state return `None`; callers keep their state.
//!
//! Client: `Connecting -> Open -> Streaming`, then on close either
//! `Reconnecting -> Connecting` or `Closed`.
//!
//! Server: `Watching -> Classifying -> Emitting -> Watching`, ending in
//! `Closed`.

use std::fmt;

/// Client-side subscription state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Connecting,
    Open,
    Streaming,
    Reconnecting,
    Closed,
}

/// Input to the client state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientEvent {
    /// Socket connected
    Opened,
    /// Subscription body sent
    HandshakeSent,
    /// Socket closed or failed
    Dropped { terminal: bool },
    /// Reconnect delay elapsed
    RetryElapsed,
    /// Consumer unsubscribed
    Cancelled,
}

impl ClientState {
    /// Apply an event
    pub fn next(self, event: ClientEvent) -> Option<ClientState> {
        use ClientEvent::*;
        use ClientState::*;

        match (self, event) {
            (Closed, _) => None,
            (_, Cancelled) => Some(Closed),
            (Connecting, Opened) => Some(Open),
            (Open, HandshakeSent) => Some(Streaming),
            (Connecting | Open | Streaming, Dropped { terminal: true }) => Some(Closed),
            (Connecting | Open | Streaming, Dropped { terminal: false }) => Some(Reconnecting),
            (Reconnecting, RetryElapsed) => Some(Connecting),
            _ => None,
        }
    }

    /// Whether a socket is owned in this state
    pub fn owns_connection(&self) -> bool {
        matches!(self, ClientState::Open | ClientState::Streaming)
    }

    pub fn is_closed(&self) -> bool {
        matches!(self, ClientState::Closed)
    }
}

impl fmt::Display for ClientState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ClientState::Connecting => "connecting",
            ClientState::Open => "open",
            ClientState::Streaming => "streaming",
            ClientState::Reconnecting => "reconnecting",
            ClientState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Why a server-side subscription ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseCause {
    /// Feed failed or ended
    Error,
    /// Client went away or the feed was closed locally
    Disconnect,
}

/// Server-side subscription state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    Watching,
    Classifying,
    Emitting,
    Closed(CloseCause),
}

/// Input to the server state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerEvent {
    /// Feed produced a change
    ChangeReceived,
    /// Change qualifies for this subscription
    Qualified,
    /// Change does not qualify
    Skipped,
    /// Message handed to the socket
    Emitted,
    /// Feed errored or ended
    FeedFailed,
    /// Subscription released
    Disconnected,
}

impl ServerState {
    /// Apply an event
    pub fn next(self, event: ServerEvent) -> Option<ServerState> {
        use ServerEvent::*;
        use ServerState::*;

        match (self, event) {
            (Closed(_), _) => None,
            (_, FeedFailed) => Some(Closed(CloseCause::Error)),
            (_, Disconnected) => Some(Closed(CloseCause::Disconnect)),
            (Watching, ChangeReceived) => Some(Classifying),
            (Classifying, Qualified) => Some(Emitting),
            (Classifying, Skipped) => Some(Watching),
            (Emitting, Emitted) => Some(Watching),
            _ => None,
        }
    }

    pub fn is_closed(&self) -> bool {
        matches!(self, ServerState::Closed(_))
    }
}
