use bytes::Bytes;
use metrics::counter;
use tracing::{debug, warn};

use crate::archive::FrameArchive;
use crate::coordinator::{SessionCoordinator, SignalOutcome};
use crate::envelope::SignalingEnvelope;
use crate::error::{EnvelopeError, RouteError};
use crate::registry::{BroadcastMetrics, ConnectionHandle, OutboundFrame};

/// One frame read off a client connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    Binary(Bytes),
    Text(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteOutcome {
    Relayed(BroadcastMetrics),
    Signaled(SignalOutcome),
    /// Envelope of a type this server does not handle.
    Ignored,
}

/// Classifies inbound frames: media is fanned out, envelopes go to the coordinator.
#[derive(Clone)]
pub struct MessageRouter {
    coordinator: SessionCoordinator,
    archive: Option<FrameArchive>,
}

impl MessageRouter {
    pub fn new(coordinator: SessionCoordinator, archive: Option<FrameArchive>) -> Self {
        Self {
            coordinator,
            archive,
        }
    }

    pub fn coordinator(&self) -> &SessionCoordinator {
        &self.coordinator
    }

    pub async fn route(
        &self,
        source: ConnectionHandle,
        inbound: Inbound,
    ) -> Result<RouteOutcome, RouteError> {
        match inbound {
            Inbound::Binary(frame) => Ok(RouteOutcome::Relayed(self.relay(source, frame))),
            Inbound::Text(text) => self.signal(source, &text).await,
        }
    }

    fn relay(&self, source: ConnectionHandle, frame: Bytes) -> BroadcastMetrics {
        if let Some(archive) = &self.archive {
            archive.spawn_store(frame.clone());
        }

        let size = frame.len();
        let metrics = self
            .coordinator
            .registry()
            .broadcast(OutboundFrame::Binary(frame), source);
        counter!("beach_conch_frames_received_total", 1);
        if metrics.delivered > 0 {
            counter!("beach_conch_frames_relayed_total", metrics.delivered as u64);
            counter!("beach_conch_bytes_relayed_total", metrics.bytes as u64);
        }
        debug!(
            connection = %source,
            bytes = size,
            delivered = metrics.delivered,
            dropped = metrics.dropped,
            closed = metrics.closed,
            "media frame relayed"
        );
        metrics
    }

    async fn signal(&self, source: ConnectionHandle, text: &str) -> Result<RouteOutcome, RouteError> {
        let envelope = match SignalingEnvelope::parse(text) {
            Ok(envelope) => envelope,
            Err(EnvelopeError::UnknownType(kind)) => {
                counter!("beach_conch_envelopes_rejected_total", 1, "reason" => "unknown_type");
                warn!(connection = %source, kind = %kind, "dropping envelope of unknown type");
                return Ok(RouteOutcome::Ignored);
            }
            Err(err) => {
                let err = RouteError::from(err);
                self.rejected(source, "text", &err);
                return Err(err);
            }
        };

        let kind = envelope.kind();
        match self.coordinator.handle(source, envelope).await {
            Ok(outcome) => {
                debug!(connection = %source, kind, outcome = ?outcome, "envelope handled");
                Ok(RouteOutcome::Signaled(outcome))
            }
            Err(err) => {
                let err = RouteError::from(err);
                self.rejected(source, kind, &err);
                Err(err)
            }
        }
    }

    fn rejected(&self, source: ConnectionHandle, kind: &str, err: &RouteError) {
        counter!("beach_conch_envelopes_rejected_total", 1, "reason" => err.metric_label());
        warn!(
            connection = %source,
            kind,
            reason = err.metric_label(),
            error = %err,
            "envelope dropped"
        );
    }
}
