//! `RouterRegistry` - the single global router.
//!
//! Created once at startup from the configured codec set and immutable
//! afterwards. Joins and capability lookups fail `RouterNotReady` until
//! initialization completes, mirroring the deferred-router startup of the
//! reference deployment.

use std::sync::Arc;

use media_engine::{MediaEngineAdapter, RouterId, RtpCapabilities, RtpCodecCapability};
use tokio::sync::RwLock;
use tracing::info;

use crate::errors::SignalError;

struct RouterEntry {
    router_id: RouterId,
    capabilities: RtpCapabilities,
}

/// Holds the global router once the engine has created it.
pub struct RouterRegistry {
    adapter: Arc<dyn MediaEngineAdapter>,
    inner: RwLock<Option<RouterEntry>>,
}

impl RouterRegistry {
    #[must_use]
    pub fn new(adapter: Arc<dyn MediaEngineAdapter>) -> Self {
        Self {
            adapter,
            inner: RwLock::new(None),
        }
    }

    /// Create the global router from the given codec set. Idempotent: a
    /// second call leaves the existing router in place.
    pub async fn initialize(
        &self,
        media_codecs: Vec<RtpCodecCapability>,
    ) -> Result<(), SignalError> {
        let mut inner = self.inner.write().await;
        if inner.is_some() {
            return Ok(());
        }

        let (router_id, capabilities) = self
            .adapter
            .create_router(media_codecs)
            .await
            .map_err(|e| SignalError::Internal(format!("router creation failed: {e}")))?;

        info!(
            target: "signal.router",
            router_id = %router_id,
            codecs = capabilities.codecs.len(),
            "Global router created"
        );
        *inner = Some(RouterEntry {
            router_id,
            capabilities,
        });
        Ok(())
    }

    /// The router's capability descriptor, handed to joining clients.
    pub async fn capabilities(&self) -> Result<RtpCapabilities, SignalError> {
        self.inner
            .read()
            .await
            .as_ref()
            .map(|entry| entry.capabilities.clone())
            .ok_or(SignalError::RouterNotReady)
    }

    /// The router's engine handle.
    pub async fn router_id(&self) -> Result<RouterId, SignalError> {
        self.inner
            .read()
            .await
            .as_ref()
            .map(|entry| entry.router_id)
            .ok_or(SignalError::RouterNotReady)
    }

    pub async fn is_ready(&self) -> bool {
        self.inner.read().await.is_some()
    }
}
