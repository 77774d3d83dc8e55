//! Cluster membership as seen by a joining node.
//!
//! Bootstrap only needs two things from membership: the partitioner the
//! cluster agreed on, and a way to announce that the node finished streaming
//! and now owns its tokens. [`RingMembership`] is the in-process
//! implementation: it applies ownership to [`TokenMetadata`] and broadcasts
//! the change to listeners and a channel.

use crate::cluster::events::{EndpointEvent, EndpointEventListener};
use crate::dht::{Partitioner, Token};
use crate::error::BootstrapFailure;
use crate::locator::TokenMetadata;
use crate::types::Endpoint;
use async_trait::async_trait;
use parking_lot::RwLock;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Cluster membership service.
#[async_trait]
pub trait ClusterMembership: Send + Sync {
    /// Partitioner shared by every ring member.
    fn partitioner(&self) -> Arc<dyn Partitioner>;

    /// Announce that `endpoint` is joining with `tokens`.
    async fn announce_joining(&self, _endpoint: Endpoint, _tokens: &[Token]) {}

    /// Mark `endpoint` normal as the owner of `tokens`.
    async fn finish_bootstrapping(
        &self,
        endpoint: Endpoint,
        tokens: &[Token],
    ) -> Result<(), BootstrapFailure>;
}

/// Membership backed by the local ring.
pub struct RingMembership {
    /// Ring this node maintains.
    metadata: Arc<TokenMetadata>,

    /// Cluster partitioner.
    partitioner: Arc<dyn Partitioner>,

    /// Event listeners.
    listeners: RwLock<Vec<Arc<dyn EndpointEventListener>>>,

    /// Channel for membership events.
    event_tx: mpsc::UnboundedSender<EndpointEvent>,
}

impl RingMembership {
    /// Create membership over `metadata`.
    pub fn new(
        metadata: Arc<TokenMetadata>,
        partitioner: Arc<dyn Partitioner>,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<EndpointEvent>) {
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        let membership = Arc::new(Self {
            metadata,
            partitioner,
            listeners: RwLock::new(Vec::new()),
            event_tx,
        });

        (membership, event_rx)
    }

    /// Add an event listener.
    pub fn add_listener(&self, listener: Arc<dyn EndpointEventListener>) {
        self.listeners.write().push(listener);
    }

    /// Ring this membership writes to.
    pub fn metadata(&self) -> &Arc<TokenMetadata> {
        &self.metadata
    }

    /// Notify all listeners of an event.
    fn notify(&self, event: EndpointEvent) {
        // Receiver may have been dropped
        let _ = self.event_tx.send(event.clone());

        for listener in self.listeners.read().iter() {
            listener.on_event(&event);
        }
    }

    /// Record that another endpoint owns `tokens`, e.g. learned via gossip.
    pub fn handle_endpoint_normal(&self, endpoint: Endpoint, tokens: &[Token]) {
        debug!(%endpoint, tokens = tokens.len(), "Endpoint owns tokens");
        self.metadata.update_normal_tokens(tokens, endpoint);
        self.notify(EndpointEvent::Normal {
            endpoint,
            tokens: tokens.to_vec(),
        });
    }

    /// Drop an endpoint that left the ring.
    pub fn handle_endpoint_left(&self, endpoint: Endpoint) {
        if !self.metadata.is_member(&endpoint) {
            return;
        }
        info!(%endpoint, "Endpoint left ring");
        self.metadata.remove_endpoint(&endpoint);
        self.notify(EndpointEvent::Left { endpoint });
    }
}

#[async_trait]
impl ClusterMembership for RingMembership {
    fn partitioner(&self) -> Arc<dyn Partitioner> {
        self.partitioner.clone()
    }

    async fn announce_joining(&self, endpoint: Endpoint, tokens: &[Token]) {
        self.notify(EndpointEvent::Joining {
            endpoint,
            tokens: tokens.to_vec(),
        });
    }

    async fn finish_bootstrapping(
        &self,
        endpoint: Endpoint,
        tokens: &[Token],
    ) -> Result<(), BootstrapFailure> {
        // Another node may have claimed one of our tokens while we streamed.
        for token in tokens {
            if let Some(owner) = self.metadata.get_endpoint(token) {
                if owner != endpoint {
                    warn!(
                        %endpoint,
                        %token,
                        %owner,
                        "Token claimed by another endpoint during bootstrap"
                    );
                    return Err(BootstrapFailure::Membership(format!(
                        "token {} is already owned by {}",
                        token, owner
                    )));
                }
            }
        }

        self.metadata.update_normal_tokens(tokens, endpoint);
        info!(%endpoint, tokens = tokens.len(), "Endpoint is now normal");
        self.notify(EndpointEvent::Normal {
            endpoint,
            tokens: tokens.to_vec(),
        });
        Ok(())
    }
}

impl std::fmt::Debug for RingMembership {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RingMembership")
            .field("members", &self.metadata.endpoints().len())
            .field("partitioner", &self.partitioner)
            .field("listeners", &self.listeners.read().len())
            .finish()
    }
}
