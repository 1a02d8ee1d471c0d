use std::{
    collections::HashMap,
    fmt,
    sync::Arc,
    time::{SystemTime, UNIX_EPOCH},
};

use bytes::Bytes;
use metrics::counter;
use parking_lot::Mutex;
use serde::Serialize;
use slab::Slab;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{DeliveryFailureReason, RegistryError};

pub const DEFAULT_OUTBOUND_DEPTH: usize = 64;

/// Opaque handle for one accepted transport session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct ConnectionHandle(Uuid);

impl ConnectionHandle {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Open,
    Closing,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PeerRole {
    Server,
    Client,
}

/// Frame queued for a connection's writer task.
#[derive(Debug, Clone, PartialEq)]
pub enum OutboundFrame {
    Binary(Bytes),
    Text(String),
    Close { code: u16, reason: String },
}

impl OutboundFrame {
    pub fn len(&self) -> usize {
        match self {
            OutboundFrame::Binary(bytes) => bytes.len(),
            OutboundFrame::Text(text) => text.len(),
            OutboundFrame::Close { .. } => 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Clone)]
pub struct ConnectionRegistry {
    inner: Arc<RegistryInner>,
}

struct RegistryInner {
    outbound_depth: usize,
    members: Mutex<Members>,
}

#[derive(Default)]
struct Members {
    slab: Slab<ConnectionEntry>,
    index_map: HashMap<ConnectionHandle, usize>,
    identities: HashMap<String, ConnectionHandle>,
}

struct ConnectionEntry {
    handle: ConnectionHandle,
    identity: Option<String>,
    role: Option<PeerRole>,
    state: ConnectionState,
    sender: Option<mpsc::Sender<OutboundFrame>>,
    connected_at: u64,
}

pub struct Registration {
    pub handle: ConnectionHandle,
    pub receiver: mpsc::Receiver<OutboundFrame>,
    pub active_connections: usize,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct BroadcastMetrics {
    pub delivered: usize,
    pub bytes: usize,
    pub dropped: usize,
    pub closed: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConnectionSnapshot {
    pub handle: ConnectionHandle,
    pub identity: Option<String>,
    pub role: Option<PeerRole>,
    pub state: ConnectionState,
    pub connected_at: u64,
}

impl ConnectionRegistry {
    pub fn new(outbound_depth: usize) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                outbound_depth: outbound_depth.max(1),
                members: Mutex::new(Members::default()),
            }),
        }
    }

    /// Adds an OPEN connection and hands back the receiving half of its outbound queue.
    pub fn register(&self, handle: ConnectionHandle) -> Result<Registration, RegistryError> {
        let (tx, rx) = mpsc::channel(self.inner.outbound_depth);
        let mut members = self.inner.members.lock();
        if members.index_map.contains_key(&handle) {
            return Err(RegistryError::DuplicateHandle(handle));
        }
        let key = members.slab.insert(ConnectionEntry {
            handle,
            identity: None,
            role: None,
            state: ConnectionState::Open,
            sender: Some(tx),
            connected_at: now_millis(),
        });
        members.index_map.insert(handle, key);
        Ok(Registration {
            handle,
            receiver: rx,
            active_connections: members.slab.len(),
        })
    }

    /// Removes the entry. Unknown handles are ignored.
    pub fn unregister(&self, handle: ConnectionHandle) -> usize {
        let mut members = self.inner.members.lock();
        if let Some(index) = members.index_map.remove(&handle) {
            let entry = members.slab.remove(index);
            if let Some(identity) = entry.identity {
                if members.identities.get(&identity) == Some(&handle) {
                    members.identities.remove(&identity);
                }
            }
        }
        members.slab.len()
    }

    /// Best-effort fan-out to every OPEN member except `exclude`.
    ///
    /// The member set is snapshotted before any delivery is attempted; a
    /// failing target is marked CLOSING and skipped, the rest still receive.
    pub fn broadcast(&self, frame: OutboundFrame, exclude: ConnectionHandle) -> BroadcastMetrics {
        self.fan_out(frame, Some(exclude))
    }

    /// Queues a close frame for every OPEN member; their writers exit after sending it.
    pub fn close_all(&self, code: u16, reason: &str) -> usize {
        self.fan_out(
            OutboundFrame::Close {
                code,
                reason: reason.to_string(),
            },
            None,
        )
        .delivered
    }

    fn fan_out(&self, frame: OutboundFrame, exclude: Option<ConnectionHandle>) -> BroadcastMetrics {
        let targets: Vec<(ConnectionHandle, mpsc::Sender<OutboundFrame>)> = {
            let members = self.inner.members.lock();
            members
                .slab
                .iter()
                .filter(|(_, entry)| {
                    Some(entry.handle) != exclude && entry.state == ConnectionState::Open
                })
                .filter_map(|(_, entry)| entry.sender.clone().map(|tx| (entry.handle, tx)))
                .collect()
        };

        let mut metrics = BroadcastMetrics::default();
        let bytes = frame.len();
        for (handle, sender) in targets {
            match deliver(&sender, frame.clone()) {
                Ok(()) => {
                    metrics.delivered += 1;
                    metrics.bytes += bytes;
                }
                Err(reason) => {
                    match reason {
                        DeliveryFailureReason::Backpressure => metrics.dropped += 1,
                        _ => metrics.closed += 1,
                    }
                    warn!(connection = %handle, reason = %reason, "broadcast delivery failed");
                    self.mark_closing(handle, reason);
                }
            }
        }
        metrics
    }

    /// Queues a frame for a single connection.
    pub fn send_to(
        &self,
        handle: ConnectionHandle,
        frame: OutboundFrame,
    ) -> Result<(), RegistryError> {
        let sender = {
            let members = self.inner.members.lock();
            let entry = members
                .index_map
                .get(&handle)
                .and_then(|index| members.slab.get(*index))
                .ok_or_else(|| RegistryError::NotFound(handle.to_string()))?;
            match (&entry.state, &entry.sender) {
                (ConnectionState::Open, Some(sender)) => sender.clone(),
                _ => {
                    return Err(RegistryError::DeliveryFailure {
                        handle,
                        reason: DeliveryFailureReason::Closing,
                    })
                }
            }
        };

        deliver(&sender, frame).map_err(|reason| {
            self.mark_closing(handle, reason);
            RegistryError::DeliveryFailure { handle, reason }
        })
    }

    /// Marks the connection CLOSING and drops its outbound queue so the writer drains and exits.
    pub fn mark_closing(&self, handle: ConnectionHandle, reason: DeliveryFailureReason) {
        let mut members = self.inner.members.lock();
        let Some(index) = members.index_map.get(&handle).copied() else {
            return;
        };
        if let Some(entry) = members.slab.get_mut(index) {
            if entry.state == ConnectionState::Open {
                entry.state = ConnectionState::Closing;
                entry.sender = None;
                counter!(
                    "beach_conch_delivery_failures_total",
                    1,
                    "reason" => reason.metric_label()
                );
                debug!(connection = %handle, reason = %reason, "connection marked closing");
            }
        }
    }

    pub fn lookup(&self, identity: &str) -> Result<ConnectionHandle, RegistryError> {
        let members = self.inner.members.lock();
        members
            .identities
            .get(identity)
            .copied()
            .filter(|handle| members.index_map.contains_key(handle))
            .ok_or_else(|| RegistryError::NotFound(identity.to_string()))
    }

    /// Fails when another live connection already holds `identity`.
    pub fn check_identity(
        &self,
        handle: ConnectionHandle,
        identity: &str,
    ) -> Result<(), RegistryError> {
        let members = self.inner.members.lock();
        match members.identities.get(identity).copied() {
            Some(holder) if holder != handle && members.index_map.contains_key(&holder) => {
                Err(RegistryError::IdentityInUse {
                    identity: identity.to_string(),
                    holder,
                })
            }
            _ => Ok(()),
        }
    }

    /// Binds `identity` to the connection, replacing any identity it held before.
    pub fn assign_identity(
        &self,
        handle: ConnectionHandle,
        identity: &str,
    ) -> Result<(), RegistryError> {
        let mut members = self.inner.members.lock();
        let index = members
            .index_map
            .get(&handle)
            .copied()
            .ok_or_else(|| RegistryError::NotFound(handle.to_string()))?;
        if let Some(holder) = members.identities.get(identity).copied() {
            if holder == handle {
                return Ok(());
            }
            return Err(RegistryError::IdentityInUse {
                identity: identity.to_string(),
                holder,
            });
        }

        let previous = members
            .slab
            .get_mut(index)
            .and_then(|entry| entry.identity.replace(identity.to_string()));
        if let Some(previous) = previous {
            members.identities.remove(&previous);
        }
        members.identities.insert(identity.to_string(), handle);
        Ok(())
    }

    pub fn set_role(&self, handle: ConnectionHandle, role: PeerRole) {
        let mut members = self.inner.members.lock();
        if let Some(index) = members.index_map.get(&handle).copied() {
            if let Some(entry) = members.slab.get_mut(index) {
                entry.role = Some(role);
            }
        }
    }

    pub fn identity_of(&self, handle: ConnectionHandle) -> Option<String> {
        let members = self.inner.members.lock();
        members
            .index_map
            .get(&handle)
            .and_then(|index| members.slab.get(*index))
            .and_then(|entry| entry.identity.clone())
    }

    /// Absent handles report CLOSED.
    pub fn state_of(&self, handle: ConnectionHandle) -> ConnectionState {
        let members = self.inner.members.lock();
        members
            .index_map
            .get(&handle)
            .and_then(|index| members.slab.get(*index))
            .map(|entry| entry.state)
            .unwrap_or(ConnectionState::Closed)
    }

    pub fn len(&self) -> usize {
        self.inner.members.lock().slab.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn snapshot(&self) -> Vec<ConnectionSnapshot> {
        let members = self.inner.members.lock();
        let mut snapshot: Vec<ConnectionSnapshot> = members
            .slab
            .iter()
            .map(|(_, entry)| ConnectionSnapshot {
                handle: entry.handle,
                identity: entry.identity.clone(),
                role: entry.role,
                state: entry.state,
                connected_at: entry.connected_at,
            })
            .collect();
        snapshot.sort_by_key(|entry| entry.connected_at);
        snapshot
    }
}

fn deliver(
    sender: &mpsc::Sender<OutboundFrame>,
    frame: OutboundFrame,
) -> Result<(), DeliveryFailureReason> {
    sender.try_send(frame).map_err(|err| match err {
        TrySendError::Full(_) => DeliveryFailureReason::Backpressure,
        TrySendError::Closed(_) => DeliveryFailureReason::Disconnected,
    })
}

pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
