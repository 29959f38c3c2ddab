//! Shared media data model: resource ids, RTP capability/parameter
//! descriptors, and the ICE/DTLS material handed to clients during transport
//! negotiation.
//!
//! The descriptor shapes follow the conventional SFU wire layout
//! (`iceParameters` / `iceCandidates` / `dtlsParameters`) so that existing
//! client device libraries can consume them directly.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

macro_rules! resource_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(Uuid);

        impl $name {
            /// Allocate a fresh, globally unique id.
            #[must_use]
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                self.0.fmt(f)
            }
        }
    };
}

resource_id!(
    /// Identifies one router (media domain) inside the engine.
    RouterId
);
resource_id!(
    /// Identifies one negotiated network-layer media connection.
    TransportId
);
resource_id!(
    /// Identifies one media stream a peer sends into the system.
    ProducerId
);
resource_id!(
    /// Identifies one media stream a peer receives from a producer.
    ConsumerId
);

/// Media kind of a producer or consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Audio,
    Video,
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MediaKind::Audio => f.write_str("audio"),
            MediaKind::Video => f.write_str("video"),
        }
    }
}

/// One codec a router or device can handle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtpCodecCapability {
    pub kind: MediaKind,
    /// Codec mime type, e.g. `audio/opus` or `video/VP8`.
    pub mime_type: String,
    pub clock_rate: u32,
    /// Channel count for audio codecs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channels: Option<u16>,
}

impl RtpCodecCapability {
    /// Whether two capabilities describe the same codec (mime type is
    /// compared case-insensitively per RFC 6838, clock rate exactly).
    #[must_use]
    pub fn matches(&self, other: &RtpCodecCapability) -> bool {
        self.kind == other.kind
            && self.clock_rate == other.clock_rate
            && self.mime_type.eq_ignore_ascii_case(&other.mime_type)
    }
}

/// The set of codecs a router or device supports. Used to compute a
/// compatible negotiation between the two.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtpCapabilities {
    pub codecs: Vec<RtpCodecCapability>,
}

impl RtpCapabilities {
    /// Codecs supported by both sides.
    #[must_use]
    pub fn intersect(&self, other: &RtpCapabilities) -> RtpCapabilities {
        RtpCapabilities {
            codecs: self
                .codecs
                .iter()
                .filter(|c| other.codecs.iter().any(|o| c.matches(o)))
                .cloned()
                .collect(),
        }
    }

    /// A device is compatible with a router when the codec intersection is
    /// non-empty.
    #[must_use]
    pub fn is_compatible_with(&self, other: &RtpCapabilities) -> bool {
        !self.intersect(other).codecs.is_empty()
    }

    /// Whether these capabilities can receive the given codec.
    #[must_use]
    pub fn supports(&self, mime_type: &str) -> bool {
        self.codecs
            .iter()
            .any(|c| c.mime_type.eq_ignore_ascii_case(mime_type))
    }
}

/// Negotiated codec parameters carried by a producer or consumer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtpCodecParameters {
    pub mime_type: String,
    pub payload_type: u8,
    pub clock_rate: u32,
}

/// RTP parameter descriptor for one stream.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtpParameters {
    pub codecs: Vec<RtpCodecParameters>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mid: Option<String>,
}

impl RtpParameters {
    /// Mime type of the primary codec, if any.
    #[must_use]
    pub fn primary_mime_type(&self) -> Option<&str> {
        self.codecs.first().map(|c| c.mime_type.as_str())
    }
}

/// DTLS role of one endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DtlsRole {
    Auto,
    Client,
    Server,
}

/// One certificate fingerprint, e.g. algorithm `sha-256`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DtlsFingerprint {
    pub algorithm: String,
    pub value: String,
}

/// DTLS parameters exchanged during transport connect.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DtlsParameters {
    pub role: DtlsRole,
    pub fingerprints: Vec<DtlsFingerprint>,
}

/// ICE credentials for one transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceParameters {
    pub username_fragment: String,
    pub password: String,
}

/// One ICE candidate offered to the client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub foundation: String,
    pub priority: u32,
    pub ip: String,
    pub port: u16,
    pub protocol: String,
}

/// Everything a client needs to establish one transport: id, ICE candidates
/// and credentials, and the server's DTLS fingerprint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportDescriptor {
    pub id: TransportId,
    pub ice_parameters: IceParameters,
    pub ice_candidates: Vec<IceCandidate>,
    pub dtls_parameters: DtlsParameters,
}

/// Everything a client needs to start receiving one paired stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumerDescriptor {
    pub id: ConsumerId,
    pub producer_id: ProducerId,
    pub kind: MediaKind,
    pub rtp_parameters: RtpParameters,
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn opus() -> RtpCodecCapability {
        RtpCodecCapability {
            kind: MediaKind::Audio,
            mime_type: "audio/opus".to_string(),
            clock_rate: 48_000,
            channels: Some(2),
        }
    }

    fn vp8() -> RtpCodecCapability {
        RtpCodecCapability {
            kind: MediaKind::Video,
            mime_type: "video/VP8".to_string(),
            clock_rate: 90_000,
            channels: None,
        }
    }

    #[test]
    fn test_codec_match_is_case_insensitive() {
        let mut other = vp8();
        other.mime_type = "video/vp8".to_string();
        assert!(vp8().matches(&other));
    }

    #[test]
    fn test_codec_match_requires_clock_rate() {
        let mut other = vp8();
        other.clock_rate = 30_000;
        assert!(!vp8().matches(&other));
    }

    #[test]
    fn test_capability_intersection() {
        let router = RtpCapabilities {
            codecs: vec![opus(), vp8()],
        };
        let audio_only = RtpCapabilities {
            codecs: vec![opus()],
        };

        let shared = router.intersect(&audio_only);
        assert_eq!(shared.codecs.len(), 1);
        assert!(router.is_compatible_with(&audio_only));

        let h264_only = RtpCapabilities {
            codecs: vec![RtpCodecCapability {
                kind: MediaKind::Video,
                mime_type: "video/H264".to_string(),
                clock_rate: 90_000,
                channels: None,
            }],
        };
        assert!(!router.is_compatible_with(&h264_only));
    }

    #[test]
    fn test_resource_ids_are_unique() {
        assert_ne!(ProducerId::new(), ProducerId::new());
        assert_ne!(TransportId::new(), TransportId::new());
    }

    #[test]
    fn test_transport_descriptor_wire_shape() {
        let descriptor = TransportDescriptor {
            id: TransportId::new(),
            ice_parameters: IceParameters {
                username_fragment: "ufrag".to_string(),
                password: "pwd".to_string(),
            },
            ice_candidates: vec![IceCandidate {
                foundation: "udpcandidate".to_string(),
                priority: 1_015,
                ip: "127.0.0.1".to_string(),
                port: 44_444,
                protocol: "udp".to_string(),
            }],
            dtls_parameters: DtlsParameters {
                role: DtlsRole::Auto,
                fingerprints: vec![DtlsFingerprint {
                    algorithm: "sha-256".to_string(),
                    value: "AB:CD".to_string(),
                }],
            },
        };

        let json = serde_json::to_value(&descriptor).unwrap();
        assert!(json.get("iceParameters").is_some());
        assert!(json.get("iceCandidates").is_some());
        assert!(json.get("dtlsParameters").is_some());
        assert_eq!(json["dtlsParameters"]["role"], "auto");
    }

    #[test]
    fn test_media_kind_serde() {
        assert_eq!(serde_json::to_string(&MediaKind::Video).unwrap(), "\"video\"");
        let kind: MediaKind = serde_json::from_str("\"audio\"").unwrap();
        assert_eq!(kind, MediaKind::Audio);
    }
}
