//! Wire protocol: newline-delimited JSON over the signaling connection.
//!
//! Every client request carries a numeric correlation `id`; the matching
//! response echoes it. Server-initiated pushes (`newProducer`,
//! `producerClosed`) are tagged notifications interleaved on the same
//! connection, so the client can demultiplex on the top-level `type` field:
//!
//! ```json
//! {"id":3,"method":"createTransport","params":{"direction":"send"}}
//! {"type":"response","id":3,"result":{"id":"...","iceParameters":{...}}}
//! {"type":"notification","event":"newProducer","data":{...}}
//! ```

use std::fmt;

use media_engine::{
    ConsumerDescriptor, ConsumerId, DtlsParameters, MediaKind, ProducerId, RtpCapabilities,
    RtpParameters, TransportDescriptor, TransportId,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::SignalError;

/// Identifies one signaling connection (one peer).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(Uuid);

impl PeerId {
    /// Allocate a fresh, globally unique id.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for PeerId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Direction of a transport relative to the peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportDirection {
    /// Client-to-server media (the peer produces on it).
    Send,
    /// Server-to-client media (the peer consumes on it).
    Recv,
}

impl fmt::Display for TransportDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportDirection::Send => f.write_str("send"),
            TransportDirection::Recv => f.write_str("recv"),
        }
    }
}

/// One client request frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientRequest {
    /// Correlation id, echoed by the response.
    pub id: u64,
    #[serde(flatten)]
    pub body: RequestBody,
}

/// The request methods of the signaling protocol.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "method", content = "params", rename_all = "camelCase")]
pub enum RequestBody {
    #[serde(rename_all = "camelCase")]
    JoinRoom { room_id: String },
    #[serde(rename_all = "camelCase")]
    InitDevice { rtp_capabilities: RtpCapabilities },
    #[serde(rename_all = "camelCase")]
    CreateTransport { direction: TransportDirection },
    #[serde(rename_all = "camelCase")]
    ConnectTransport {
        transport_id: TransportId,
        dtls_parameters: DtlsParameters,
    },
    #[serde(rename_all = "camelCase")]
    Produce {
        transport_id: TransportId,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
    },
    #[serde(rename_all = "camelCase")]
    PauseProducer { producer_id: ProducerId },
    #[serde(rename_all = "camelCase")]
    ResumeProducer { producer_id: ProducerId },
    #[serde(rename_all = "camelCase")]
    CloseProducer { producer_id: ProducerId },
    #[serde(rename_all = "camelCase")]
    CloseTransport { transport_id: TransportId },
    #[serde(rename_all = "camelCase")]
    Consume { producer_id: ProducerId },
    ListProducers,
    LeaveRoom,
}

impl RequestBody {
    /// Method name, for logging.
    #[must_use]
    pub fn method(&self) -> &'static str {
        match self {
            RequestBody::JoinRoom { .. } => "joinRoom",
            RequestBody::InitDevice { .. } => "initDevice",
            RequestBody::CreateTransport { .. } => "createTransport",
            RequestBody::ConnectTransport { .. } => "connectTransport",
            RequestBody::Produce { .. } => "produce",
            RequestBody::PauseProducer { .. } => "pauseProducer",
            RequestBody::ResumeProducer { .. } => "resumeProducer",
            RequestBody::CloseProducer { .. } => "closeProducer",
            RequestBody::CloseTransport { .. } => "closeTransport",
            RequestBody::Consume { .. } => "consume",
            RequestBody::ListProducers => "listProducers",
            RequestBody::LeaveRoom => "leaveRoom",
        }
    }
}

/// One entry of the room's producer snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProducerSnapshot {
    pub producer_id: ProducerId,
    pub peer_id: PeerId,
    pub kind: MediaKind,
    pub paused: bool,
}

/// Successful `joinRoom` payload: the router capability descriptor the
/// client initializes its device from.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct JoinedResponse {
    pub rtp_capabilities: RtpCapabilities,
}

/// Successful `produce` payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ProducedResponse {
    pub producer_id: ProducerId,
}

/// Successful `listProducers` payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProducerListResponse {
    pub producers: Vec<ProducerSnapshot>,
}

/// Empty acknowledgement payload.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AckResponse {}

/// Successful response payloads.
///
/// Untagged: the payload shape is implied by the request method. Variant
/// order matters for deserialization (`Consumed` before `Produced`, `Ack`
/// last).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ResponseBody {
    Joined(JoinedResponse),
    TransportCreated(TransportDescriptor),
    Consumed(ConsumerDescriptor),
    Produced(ProducedResponse),
    Producers(ProducerListResponse),
    Ack(AckResponse),
}

/// Error payload of a failed response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireError {
    pub code: i32,
    pub message: String,
}

impl From<&SignalError> for WireError {
    fn from(err: &SignalError) -> Self {
        WireError {
            code: err.error_code(),
            message: err.client_message(),
        }
    }
}

/// Server-initiated pushes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "camelCase")]
pub enum Notification {
    /// A producer appeared in the peer's room. If the peer already holds a
    /// connected receive transport, `consumer` carries its eagerly paired
    /// consumer; otherwise the peer pulls via `consume` when ready.
    #[serde(rename_all = "camelCase")]
    NewProducer {
        producer_id: ProducerId,
        peer_id: PeerId,
        kind: MediaKind,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        consumer: Option<ConsumerDescriptor>,
    },
    /// A producer in the peer's room went away. If the peer held a consumer
    /// for it, `consumer_id` names the consumer that was closed server-side.
    #[serde(rename_all = "camelCase")]
    ProducerClosed {
        producer_id: ProducerId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        consumer_id: Option<ConsumerId>,
    },
}

/// Every frame the server writes: a correlated response or a push.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ServerMessage {
    #[serde(rename_all = "camelCase")]
    Response {
        id: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result: Option<ResponseBody>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<WireError>,
    },
    Notification {
        #[serde(flatten)]
        notification: Notification,
    },
}

impl ServerMessage {
    /// A successful response echoing the request id.
    #[must_use]
    pub fn ok(id: u64, result: ResponseBody) -> Self {
        ServerMessage::Response {
            id,
            result: Some(result),
            error: None,
        }
    }

    /// A failed response echoing the request id.
    #[must_use]
    pub fn error(id: u64, err: &SignalError) -> Self {
        ServerMessage::Response {
            id,
            result: None,
            error: Some(WireError::from(err)),
        }
    }

    /// A server-initiated push.
    #[must_use]
    pub fn notification(notification: Notification) -> Self {
        ServerMessage::Notification { notification }
    }
}
