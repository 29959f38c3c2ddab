//! Media engine adapter boundary.
//!
//! The signaling core never touches RTP packets. Everything it needs from the
//! media plane goes through the [`MediaEngineAdapter`] trait:
//!
//! - router creation (one per media domain, capability descriptor negotiated
//!   once at startup)
//! - transport allocation (ICE candidates + DTLS fingerprint) and DTLS connect
//! - producer/consumer creation and deterministic teardown
//!
//! Handles returned by the engine are opaque correlation tokens; here they
//! double as the globally unique resource ids visible on the wire.
//!
//! [`LocalMediaEngine`] is a deterministic in-process implementation used by
//! the default server binary and by tests. A production deployment would back
//! the same trait with a real SFU media stack.

pub mod adapter;
pub mod local;
pub mod types;

pub use adapter::{MediaEngineAdapter, MediaEngineError};
pub use local::LocalMediaEngine;
pub use types::{
    ConsumerDescriptor, ConsumerId, DtlsFingerprint, DtlsParameters, DtlsRole, IceCandidate,
    IceParameters, MediaKind, ProducerId, RouterId, RtpCapabilities, RtpCodecCapability,
    RtpCodecParameters, RtpParameters, TransportDescriptor, TransportId,
};
