use std::fmt;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::mpsc;

use crate::envelope::{IceCandidate, SessionDescription};
use crate::error::CollaboratorError;
use crate::registry::ConnectionHandle;

/// Key of a negotiation context.
///
/// Server-side sessions belong to the offering connection; peer-to-peer
/// negotiations belong to the identity being offered to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum ContextKey {
    Server(ConnectionHandle),
    Peer(String),
}

impl fmt::Display for ContextKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ContextKey::Server(handle) => write!(f, "server-{handle}"),
            ContextKey::Peer(name) => write!(f, "peer-{name}"),
        }
    }
}

/// Event raised by a peer session, tagged with the context generation that owns it.
#[derive(Debug, Clone, PartialEq)]
pub struct PeerEvent {
    pub key: ContextKey,
    pub generation: u64,
    pub kind: PeerEventKind,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PeerEventKind {
    LocalCandidate(IceCandidate),
    TrackStarted,
    /// Decoded mono samples at 48 kHz.
    Samples(Vec<f32>),
    TrackEnded,
    Failed(String),
}

/// Channel a peer session reports its events on.
#[derive(Clone)]
pub struct PeerEventSink {
    key: ContextKey,
    generation: u64,
    tx: mpsc::Sender<PeerEvent>,
}

impl PeerEventSink {
    pub fn new(key: ContextKey, generation: u64, tx: mpsc::Sender<PeerEvent>) -> Self {
        Self {
            key,
            generation,
            tx,
        }
    }

    pub async fn emit(&self, kind: PeerEventKind) -> bool {
        self.tx
            .send(PeerEvent {
                key: self.key.clone(),
                generation: self.generation,
                kind,
            })
            .await
            .is_ok()
    }

    pub fn key(&self) -> &ContextKey {
        &self.key
    }
}

/// Factory for server-side peer sessions.
#[async_trait]
pub trait PeerConnector: Send + Sync {
    async fn connect(&self, events: PeerEventSink)
        -> Result<Box<dyn PeerSession>, CollaboratorError>;

    /// Whether sessions emit [`PeerEventKind::Samples`]. Recording needs it.
    fn delivers_samples(&self) -> bool {
        false
    }
}

/// One server-side peer connection. All media-plane work happens behind it.
#[async_trait]
pub trait PeerSession: Send + Sync {
    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), CollaboratorError>;

    async fn create_answer(&self) -> Result<SessionDescription, CollaboratorError>;

    async fn set_local_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), CollaboratorError>;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), CollaboratorError>;

    async fn close(&self);
}
