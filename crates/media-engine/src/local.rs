//! `LocalMediaEngine` - deterministic in-process engine implementation.
//!
//! Keeps the same handle bookkeeping a real SFU media stack would
//! (router -> transport -> producer/consumer parentage, cascade on close)
//! without moving any packets. ICE credentials and DTLS fingerprints are
//! fabricated randomly so transport descriptors look like the real thing.
//!
//! Used by the default server binary and throughout the test suite.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use rand::distributions::{Alphanumeric, DistString};
use rand::Rng;
use tokio::sync::Mutex;
use tracing::debug;

use crate::adapter::{MediaEngineAdapter, MediaEngineError};
use crate::types::{
    ConsumerDescriptor, ConsumerId, DtlsFingerprint, DtlsParameters, DtlsRole, IceCandidate,
    IceParameters, MediaKind, ProducerId, RouterId, RtpCapabilities, RtpCodecCapability,
    RtpParameters, TransportDescriptor, TransportId,
};

struct RouterRecord {
    capabilities: RtpCapabilities,
}

struct TransportRecord {
    #[allow(dead_code)] // kept for parentage symmetry; routers are never closed
    router_id: RouterId,
    connected: bool,
}

struct ProducerRecord {
    transport_id: TransportId,
    kind: MediaKind,
    rtp_parameters: RtpParameters,
}

struct ConsumerRecord {
    transport_id: TransportId,
    producer_id: ProducerId,
}

#[derive(Default)]
struct EngineState {
    routers: HashMap<RouterId, RouterRecord>,
    transports: HashMap<TransportId, TransportRecord>,
    producers: HashMap<ProducerId, ProducerRecord>,
    consumers: HashMap<ConsumerId, ConsumerRecord>,
    closed_transports: HashSet<TransportId>,
}

/// In-process media engine double.
#[derive(Default)]
pub struct LocalMediaEngine {
    state: Mutex<EngineState>,
    connect_calls: AtomicU64,
}

impl LocalMediaEngine {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of times `connect_transport` reached the engine. Lets tests
    /// assert that idempotent client retries are absorbed upstream.
    #[must_use]
    pub fn connect_call_count(&self) -> u64 {
        self.connect_calls.load(Ordering::Relaxed)
    }

    /// Transports currently open in the engine.
    pub async fn open_transport_count(&self) -> usize {
        self.state.lock().await.transports.len()
    }

    /// Producers currently open in the engine.
    pub async fn open_producer_count(&self) -> usize {
        self.state.lock().await.producers.len()
    }

    /// Consumers currently open in the engine.
    pub async fn open_consumer_count(&self) -> usize {
        self.state.lock().await.consumers.len()
    }

    fn fabricate_ice() -> (IceParameters, Vec<IceCandidate>) {
        let mut rng = rand::thread_rng();
        let ice_parameters = IceParameters {
            username_fragment: Alphanumeric.sample_string(&mut rng, 8),
            password: Alphanumeric.sample_string(&mut rng, 24),
        };
        let candidate = IceCandidate {
            foundation: "udpcandidate".to_string(),
            priority: 1_015,
            ip: "127.0.0.1".to_string(),
            port: rng.gen_range(40_000..50_000),
            protocol: "udp".to_string(),
        };
        (ice_parameters, vec![candidate])
    }

    fn fabricate_fingerprint() -> DtlsFingerprint {
        let mut rng = rand::thread_rng();
        let digest: [u8; 32] = rng.gen();
        let value = digest
            .iter()
            .map(|b| format!("{b:02X}"))
            .collect::<Vec<_>>()
            .join(":");
        DtlsFingerprint {
            algorithm: "sha-256".to_string(),
            value,
        }
    }
}

#[async_trait]
impl MediaEngineAdapter for LocalMediaEngine {
    async fn create_router(
        &self,
        media_codecs: Vec<RtpCodecCapability>,
    ) -> Result<(RouterId, RtpCapabilities), MediaEngineError> {
        if media_codecs.is_empty() {
            return Err(MediaEngineError::Rejected(
                "router requires at least one codec".to_string(),
            ));
        }

        let router_id = RouterId::new();
        let capabilities = RtpCapabilities {
            codecs: media_codecs,
        };

        let mut state = self.state.lock().await;
        state.routers.insert(
            router_id,
            RouterRecord {
                capabilities: capabilities.clone(),
            },
        );

        debug!(target: "signal.media", router_id = %router_id, "Router created");
        Ok((router_id, capabilities))
    }

    async fn create_transport(
        &self,
        router_id: RouterId,
    ) -> Result<TransportDescriptor, MediaEngineError> {
        let mut state = self.state.lock().await;
        if !state.routers.contains_key(&router_id) {
            return Err(MediaEngineError::UnknownHandle(router_id.to_string()));
        }

        let transport_id = TransportId::new();
        state.transports.insert(
            transport_id,
            TransportRecord {
                router_id,
                connected: false,
            },
        );

        let (ice_parameters, ice_candidates) = Self::fabricate_ice();
        debug!(target: "signal.media", transport_id = %transport_id, "Transport created");

        Ok(TransportDescriptor {
            id: transport_id,
            ice_parameters,
            ice_candidates,
            dtls_parameters: DtlsParameters {
                role: DtlsRole::Auto,
                fingerprints: vec![Self::fabricate_fingerprint()],
            },
        })
    }

    async fn connect_transport(
        &self,
        transport_id: TransportId,
        dtls_parameters: DtlsParameters,
    ) -> Result<(), MediaEngineError> {
        self.connect_calls.fetch_add(1, Ordering::Relaxed);

        let mut state = self.state.lock().await;
        if state.closed_transports.contains(&transport_id) {
            return Err(MediaEngineError::Closed(transport_id.to_string()));
        }
        let transport = state
            .transports
            .get_mut(&transport_id)
            .ok_or_else(|| MediaEngineError::UnknownHandle(transport_id.to_string()))?;

        if transport.connected {
            return Err(MediaEngineError::Rejected(
                "transport already connected".to_string(),
            ));
        }
        if dtls_parameters.fingerprints.is_empty() {
            return Err(MediaEngineError::Rejected(
                "DTLS parameters carry no fingerprint".to_string(),
            ));
        }

        transport.connected = true;
        debug!(target: "signal.media", transport_id = %transport_id, "Transport connected");
        Ok(())
    }

    async fn create_producer(
        &self,
        transport_id: TransportId,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
    ) -> Result<ProducerId, MediaEngineError> {
        let mut state = self.state.lock().await;
        if state.closed_transports.contains(&transport_id) {
            return Err(MediaEngineError::Closed(transport_id.to_string()));
        }
        let transport = state
            .transports
            .get(&transport_id)
            .ok_or_else(|| MediaEngineError::UnknownHandle(transport_id.to_string()))?;
        if !transport.connected {
            return Err(MediaEngineError::Rejected(
                "transport not connected".to_string(),
            ));
        }

        let mime_type = rtp_parameters
            .primary_mime_type()
            .ok_or_else(|| MediaEngineError::Rejected("no codecs offered".to_string()))?;
        let expected_prefix = match kind {
            MediaKind::Audio => "audio/",
            MediaKind::Video => "video/",
        };
        if !mime_type
            .to_ascii_lowercase()
            .starts_with(expected_prefix)
        {
            return Err(MediaEngineError::Rejected(format!(
                "codec {mime_type} does not match kind {kind}"
            )));
        }

        let producer_id = ProducerId::new();
        state.producers.insert(
            producer_id,
            ProducerRecord {
                transport_id,
                kind,
                rtp_parameters,
            },
        );

        debug!(
            target: "signal.media",
            producer_id = %producer_id,
            transport_id = %transport_id,
            kind = %kind,
            "Producer created"
        );
        Ok(producer_id)
    }

    async fn create_consumer(
        &self,
        transport_id: TransportId,
        producer_id: ProducerId,
        rtp_capabilities: RtpCapabilities,
    ) -> Result<ConsumerDescriptor, MediaEngineError> {
        let mut state = self.state.lock().await;
        if state.closed_transports.contains(&transport_id) {
            return Err(MediaEngineError::Closed(transport_id.to_string()));
        }
        if !state
            .transports
            .get(&transport_id)
            .map(|t| t.connected)
            .unwrap_or(false)
        {
            return Err(MediaEngineError::UnknownHandle(transport_id.to_string()));
        }

        let (kind, rtp_parameters) = {
            let producer = state
                .producers
                .get(&producer_id)
                .ok_or_else(|| MediaEngineError::UnknownHandle(producer_id.to_string()))?;

            let mime_type = producer
                .rtp_parameters
                .primary_mime_type()
                .unwrap_or_default();
            if !rtp_capabilities.supports(mime_type) {
                return Err(MediaEngineError::Rejected(format!(
                    "consuming device cannot receive {mime_type}"
                )));
            }
            (producer.kind, producer.rtp_parameters.clone())
        };

        let consumer_id = ConsumerId::new();
        state.consumers.insert(
            consumer_id,
            ConsumerRecord {
                transport_id,
                producer_id,
            },
        );

        debug!(
            target: "signal.media",
            consumer_id = %consumer_id,
            producer_id = %producer_id,
            transport_id = %transport_id,
            "Consumer created"
        );
        Ok(ConsumerDescriptor {
            id: consumer_id,
            producer_id,
            kind,
            rtp_parameters,
        })
    }

    async fn close_transport(&self, transport_id: TransportId) -> Result<(), MediaEngineError> {
        let mut state = self.state.lock().await;
        if state.transports.remove(&transport_id).is_none() {
            // Idempotent: already closed or never existed.
            return Ok(());
        }
        state.closed_transports.insert(transport_id);

        // Cascade to bound producers and consumers.
        let orphaned: Vec<ProducerId> = state
            .producers
            .iter()
            .filter(|(_, p)| p.transport_id == transport_id)
            .map(|(id, _)| *id)
            .collect();
        for producer_id in &orphaned {
            state.producers.remove(producer_id);
        }
        state.consumers.retain(|_, c| {
            c.transport_id != transport_id && !orphaned.contains(&c.producer_id)
        });

        debug!(target: "signal.media", transport_id = %transport_id, "Transport closed");
        Ok(())
    }

    async fn close_producer(&self, producer_id: ProducerId) -> Result<(), MediaEngineError> {
        let mut state = self.state.lock().await;
        if state.producers.remove(&producer_id).is_none() {
            return Ok(());
        }
        // A consumer never outlives its source producer.
        state.consumers.retain(|_, c| c.producer_id != producer_id);

        debug!(target: "signal.media", producer_id = %producer_id, "Producer closed");
        Ok(())
    }

    async fn close_consumer(&self, consumer_id: ConsumerId) -> Result<(), MediaEngineError> {
        let mut state = self.state.lock().await;
        state.consumers.remove(&consumer_id);
        debug!(target: "signal.media", consumer_id = %consumer_id, "Consumer closed");
        Ok(())
    }
}
