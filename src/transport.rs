//! Messaging seam between peers.
//!
//! The protocol consumes an ordered, reliable peer-to-peer channel:
//! `send` delivers an opaque envelope to a DID, `recv` yields inbound
//! `(from_did, envelope)` pairs in arrival order. Integrity and
//! authenticity of the wrapping are the transport's responsibility.
//!
//! [`ChannelTransport`] is the in-process implementation: a shared
//! [`ChannelNetwork`] broker routes envelopes between registered peers
//! over tokio channels. It backs the test suite and local demos.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, mpsc};

use crate::error::ConsensusError;

#[async_trait::async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn send(&self, to: &str, envelope: Vec<u8>) -> Result<(), ConsensusError>;

    /// Next inbound envelope, or `None` once the peer is disconnected.
    async fn recv(&self) -> Option<(String, Vec<u8>)>;
}

type PeerSender = mpsc::UnboundedSender<(String, Vec<u8>)>;

/// Shared broker routing envelopes between in-process peers.
#[derive(Clone, Default)]
pub struct ChannelNetwork {
    peers: Arc<Mutex<HashMap<String, PeerSender>>>,
}

impl ChannelNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a peer DID and hand back its transport endpoint.
    pub async fn join(&self, did: &str) -> ChannelTransport {
        let (tx, rx) = mpsc::unbounded_channel();
        self.peers.lock().await.insert(did.to_string(), tx);
        ChannelTransport {
            me: did.to_string(),
            network: self.clone(),
            inbound: Mutex::new(rx),
        }
    }
}

/// In-process transport endpoint for one peer.
pub struct ChannelTransport {
    me: String,
    network: ChannelNetwork,
    inbound: Mutex<mpsc::UnboundedReceiver<(String, Vec<u8>)>>,
}

impl ChannelTransport {
    pub fn did(&self) -> &str {
        &self.me
    }
}

#[async_trait::async_trait]
impl Transport for ChannelTransport {
    async fn send(&self, to: &str, envelope: Vec<u8>) -> Result<(), ConsensusError> {
        let peers = self.network.peers.lock().await;
        let sender = peers
            .get(to)
            .ok_or_else(|| ConsensusError::Transport(format!("peer {to} not in network")))?;
        sender
            .send((self.me.clone(), envelope))
            .map_err(|_| ConsensusError::Transport(format!("peer {to} disconnected")))
    }

    async fn recv(&self) -> Option<(String, Vec<u8>)> {
        self.inbound.lock().await.recv().await
    }
}
