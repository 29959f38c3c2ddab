//! Signaling core error types.
//!
//! Error types map to numeric wire error codes for client responses.
//! Internal details are logged server-side but not exposed to clients.

use thiserror::Error;

/// Signaling error type.
///
/// Maps to wire error codes:
/// - `RouterNotReady`, `PeerNotReady`: `NOT_READY` (1)
/// - `RoomNotFound`, `TransportNotFound`, `TransportClosed`,
///   `ProducerNotFound`: `NOT_FOUND` (2)
/// - `IncompatibleCapabilities`, `TransportConnectFailed`,
///   `NegotiationFailed`: `NEGOTIATION` (3)
/// - `Disconnected`: `DISCONNECTED` (4)
/// - `AlreadyInRoom`: `CONFLICT` (5)
/// - `Internal`: `INTERNAL_ERROR` (6)
/// - `RoomFull`: `CAPACITY_EXCEEDED` (7)
/// - `InvalidRequest`: `INVALID_REQUEST` (8)
#[derive(Debug, Error)]
pub enum SignalError {
    /// The global router has not finished initializing.
    #[error("Router not ready")]
    RouterNotReady,

    /// The peer session is not in a state that permits the operation.
    #[error("Peer not ready: {0}")]
    PeerNotReady(String),

    /// Room not found.
    #[error("Room not found: {0}")]
    RoomNotFound(String),

    /// Transport not found.
    #[error("Transport not found: {0}")]
    TransportNotFound(String),

    /// Transport exists but has been closed.
    #[error("Transport closed: {0}")]
    TransportClosed(String),

    /// Producer not found.
    #[error("Producer not found: {0}")]
    ProducerNotFound(String),

    /// Device and router share no usable codec.
    #[error("Incompatible capabilities")]
    IncompatibleCapabilities,

    /// The engine rejected the DTLS connect for a transport.
    #[error("Transport connect failed: {0}")]
    TransportConnectFailed(String),

    /// Media negotiation failed (engine rejection or engine failure).
    #[error("Negotiation failed: {0}")]
    NegotiationFailed(String),

    /// The peer is disconnected (or being failed out).
    #[error("Peer disconnected")]
    Disconnected,

    /// The peer is already a member of a room.
    #[error("Already in room: {0}")]
    AlreadyInRoom(String),

    /// Internal error.
    #[error("Internal error: {0}")]
    Internal(String),

    /// Room member capacity reached.
    #[error("Room full: {0}")]
    RoomFull(String),

    /// Malformed or unparseable request frame.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

impl SignalError {
    /// Returns the numeric wire error code for this error.
    #[must_use]
    pub fn error_code(&self) -> i32 {
        match self {
            SignalError::RouterNotReady | SignalError::PeerNotReady(_) => 1, // NOT_READY
            SignalError::RoomNotFound(_)
            | SignalError::TransportNotFound(_)
            | SignalError::TransportClosed(_)
            | SignalError::ProducerNotFound(_) => 2, // NOT_FOUND
            SignalError::IncompatibleCapabilities
            | SignalError::TransportConnectFailed(_)
            | SignalError::NegotiationFailed(_) => 3, // NEGOTIATION
            SignalError::Disconnected => 4,     // DISCONNECTED
            SignalError::AlreadyInRoom(_) => 5, // CONFLICT
            SignalError::Internal(_) => 6,      // INTERNAL_ERROR
            SignalError::RoomFull(_) => 7,      // CAPACITY_EXCEEDED
            SignalError::InvalidRequest(_) => 8, // INVALID_REQUEST
        }
    }

    /// Returns a client-safe error message (no internal details).
    #[must_use]
    pub fn client_message(&self) -> String {
        match self {
            SignalError::RouterNotReady => "Media router is not ready yet".to_string(),
            SignalError::PeerNotReady(detail) => detail.clone(),
            SignalError::RoomNotFound(_) => "Room not found".to_string(),
            SignalError::TransportNotFound(_) => "Transport not found".to_string(),
            SignalError::TransportClosed(_) => "Transport is closed".to_string(),
            SignalError::ProducerNotFound(_) => "Producer not found".to_string(),
            SignalError::IncompatibleCapabilities => {
                "Device capabilities are not compatible with the router".to_string()
            }
            SignalError::TransportConnectFailed(_) => "Transport connection failed".to_string(),
            SignalError::NegotiationFailed(_) => "Media negotiation failed".to_string(),
            SignalError::Disconnected => "Peer disconnected".to_string(),
            SignalError::AlreadyInRoom(_) => "Already in a room, leave it first".to_string(),
            SignalError::Internal(_) => "An internal error occurred".to_string(),
            SignalError::RoomFull(_) => "Room is at capacity".to_string(),
            SignalError::InvalidRequest(msg) => msg.clone(),
        }
    }
}
