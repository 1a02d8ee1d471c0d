use thiserror::Error;

use crate::registry::ConnectionHandle;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("connection {0} is already registered")]
    DuplicateHandle(ConnectionHandle),
    #[error("no live connection for {0}")]
    NotFound(String),
    #[error("identity {identity:?} is held by connection {holder}")]
    IdentityInUse {
        identity: String,
        holder: ConnectionHandle,
    },
    #[error("delivery to {handle} failed: {reason}")]
    DeliveryFailure {
        handle: ConnectionHandle,
        reason: DeliveryFailureReason,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryFailureReason {
    /// Outbound queue full; the consumer is not keeping up.
    Backpressure,
    /// Receiving half of the outbound queue is gone.
    Disconnected,
    /// Connection already marked CLOSING.
    Closing,
}

impl std::fmt::Display for DeliveryFailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.metric_label())
    }
}

impl DeliveryFailureReason {
    pub fn metric_label(&self) -> &'static str {
        match self {
            DeliveryFailureReason::Backpressure => "backpressure",
            DeliveryFailureReason::Disconnected => "disconnected",
            DeliveryFailureReason::Closing => "closing",
        }
    }
}

#[derive(Debug, Error)]
pub enum EnvelopeError {
    #[error("malformed envelope: {0}")]
    Malformed(String),
    #[error("unknown envelope type {0:?}")]
    UnknownType(String),
}

/// Failure reported by the peer-connection collaborator.
#[derive(Debug, Error)]
pub enum CollaboratorError {
    #[error("peer connection setup failed: {0}")]
    Setup(String),
    #[error("session description rejected: {0}")]
    Description(String),
    #[error("ice candidate rejected: {0}")]
    Candidate(String),
    #[error("peer connection closed")]
    Closed,
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("answer does not match an outstanding offer")]
    UnexpectedAnswer,
    #[error("no active negotiation for this candidate")]
    NoActiveSession,
    #[error("unknown signaling target {0:?}")]
    UnknownTarget(String),
    #[error("collaborator failure: {0}")]
    Collaborator(#[from] CollaboratorError),
    #[error(transparent)]
    Registry(#[from] RegistryError),
}

#[derive(Debug, Error)]
pub enum RecorderError {
    #[error("failed to create recording directory {dir:?}: {source}")]
    OutputDir {
        dir: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to spawn encoder {program:?}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("encoder stdin unavailable")]
    StdinUnavailable,
    #[error("failed writing to encoder: {0}")]
    Write(#[source] std::io::Error),
    #[error("encoder exited with {status}: {stderr}")]
    ExitStatus {
        status: std::process::ExitStatus,
        stderr: String,
    },
    #[error("failed waiting for encoder: {0}")]
    Wait(#[source] std::io::Error),
}

#[derive(Debug, Error)]
pub enum RouteError {
    #[error(transparent)]
    Envelope(#[from] EnvelopeError),
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error(transparent)]
    Registry(#[from] RegistryError),
}

impl RegistryError {
    pub fn metric_label(&self) -> &'static str {
        match self {
            RegistryError::DuplicateHandle(_) => "duplicate_handle",
            RegistryError::NotFound(_) => "not_found",
            RegistryError::IdentityInUse { .. } => "identity_in_use",
            RegistryError::DeliveryFailure { .. } => "delivery_failure",
        }
    }
}

impl SessionError {
    pub fn metric_label(&self) -> &'static str {
        match self {
            SessionError::UnexpectedAnswer => "unexpected_answer",
            SessionError::NoActiveSession => "no_active_session",
            SessionError::UnknownTarget(_) => "unknown_target",
            SessionError::Collaborator(_) => "collaborator_failure",
            SessionError::Registry(err) => err.metric_label(),
        }
    }
}

impl RouteError {
    pub fn metric_label(&self) -> &'static str {
        match self {
            RouteError::Envelope(EnvelopeError::Malformed(_)) => "malformed_envelope",
            RouteError::Envelope(EnvelopeError::UnknownType(_)) => "unknown_type",
            RouteError::Session(err) => err.metric_label(),
            RouteError::Registry(err) => err.metric_label(),
        }
    }

    /// Unknown envelope types are never reported back to the sender.
    pub fn is_reportable(&self) -> bool {
        !matches!(self, RouteError::Envelope(EnvelopeError::UnknownType(_)))
    }
}
