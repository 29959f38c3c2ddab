//! Per-transport state machine.
//!
//! `Created -> Connecting -> Connected`, with `Closed` terminal from any
//! state. The record is pure state; the engine calls that drive it live in
//! [`crate::negotiator`].

use media_engine::TransportId;

use crate::errors::SignalError;
use crate::protocol::TransportDirection;

/// Lifecycle state of one transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    /// Allocated; ICE/DTLS parameters handed to the client.
    Created,
    /// DTLS connect in flight at the engine.
    Connecting,
    /// DTLS established; the transport can carry producers/consumers.
    Connected,
    /// Terminal.
    Closed,
}

/// How a `connect` request should proceed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectDisposition {
    /// First connect: call into the engine.
    Proceed,
    /// Retry of an already-established connect: succeed without touching
    /// the engine.
    AlreadyConnected,
}

/// One transport owned by a peer session.
#[derive(Debug)]
pub struct TransportRecord {
    id: TransportId,
    direction: TransportDirection,
    state: TransportState,
}

impl TransportRecord {
    #[must_use]
    pub fn new(id: TransportId, direction: TransportDirection) -> Self {
        Self {
            id,
            direction,
            state: TransportState::Created,
        }
    }

    #[must_use]
    pub fn id(&self) -> TransportId {
        self.id
    }

    #[must_use]
    pub fn direction(&self) -> TransportDirection {
        self.direction
    }

    #[must_use]
    pub fn state(&self) -> TransportState {
        self.state
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.state == TransportState::Connected
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.state == TransportState::Closed
    }

    /// Decide how a `connect` request proceeds, moving to `Connecting` when
    /// an engine call is warranted.
    pub fn begin_connect(&mut self) -> Result<ConnectDisposition, SignalError> {
        match self.state {
            TransportState::Created => {
                self.state = TransportState::Connecting;
                Ok(ConnectDisposition::Proceed)
            }
            TransportState::Connected => Ok(ConnectDisposition::AlreadyConnected),
            TransportState::Connecting => Err(SignalError::NegotiationFailed(
                "transport connect already in progress".to_string(),
            )),
            TransportState::Closed => Err(SignalError::TransportClosed(self.id.to_string())),
        }
    }

    /// The engine accepted the DTLS connect.
    pub fn complete_connect(&mut self) {
        if self.state == TransportState::Connecting {
            self.state = TransportState::Connected;
        }
    }

    /// The engine rejected or timed out the DTLS connect. Terminal.
    pub fn fail_connect(&mut self) {
        self.state = TransportState::Closed;
    }

    /// Close from any state. Idempotent.
    pub fn close(&mut self) {
        self.state = TransportState::Closed;
    }
}
