//! Signaling envelopes exchanged as JSON text frames.
//!
//! Wire shape: `{type, name?, target?, sdp?, candidate?}` with `type` one of
//! `join`, `audio-offer`, `audio-answer`, `new-ice-candidate`. The server
//! additionally emits `error` envelopes when error replies are enabled.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::EnvelopeError;
use crate::registry::PeerRole;

pub const SERVER_TARGET: &str = "server";

/// Addressee of an envelope: the process itself or a named peer connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Target {
    Server,
    Peer(String),
}

impl Target {
    fn from_wire(raw: Option<String>) -> Self {
        match raw {
            None => Target::Server,
            Some(name) if name.is_empty() || name == SERVER_TARGET => Target::Server,
            Some(name) => Target::Peer(name),
        }
    }

    pub fn label(&self) -> &str {
        match self {
            Target::Server => SERVER_TARGET,
            Target::Peer(name) => name,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpKind,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }
}

/// Browser `RTCIceCandidateInit` shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_m_line_index: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username_fragment: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignalingEnvelope {
    Join {
        name: String,
        role: Option<PeerRole>,
    },
    Offer {
        name: Option<String>,
        target: Target,
        sdp: String,
    },
    Answer {
        name: Option<String>,
        target: Target,
        sdp: String,
    },
    IceCandidate {
        name: Option<String>,
        target: Target,
        candidate: IceCandidate,
    },
}

#[derive(Debug, Deserialize)]
struct InboundWire {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    target: Option<String>,
    #[serde(default)]
    role: Option<PeerRole>,
    #[serde(default)]
    sdp: Option<Value>,
    #[serde(default)]
    candidate: Option<Value>,
}

impl SignalingEnvelope {
    pub fn parse(text: &str) -> Result<Self, EnvelopeError> {
        let wire: InboundWire =
            serde_json::from_str(text).map_err(|err| EnvelopeError::Malformed(err.to_string()))?;
        let name = wire.name.filter(|name| !name.trim().is_empty());

        match wire.kind.as_str() {
            "join" => Ok(SignalingEnvelope::Join {
                name: name.ok_or_else(|| missing("name"))?,
                role: wire.role,
            }),
            "audio-offer" => Ok(SignalingEnvelope::Offer {
                name,
                target: Target::from_wire(wire.target),
                sdp: sdp_text(wire.sdp, SdpKind::Offer)?,
            }),
            "audio-answer" => Ok(SignalingEnvelope::Answer {
                name,
                target: Target::from_wire(wire.target),
                sdp: sdp_text(wire.sdp, SdpKind::Answer)?,
            }),
            "new-ice-candidate" => {
                let raw = wire.candidate.ok_or_else(|| missing("candidate"))?;
                let candidate = match raw {
                    Value::String(candidate) => IceCandidate {
                        candidate,
                        sdp_mid: None,
                        sdp_m_line_index: None,
                        username_fragment: None,
                    },
                    other => serde_json::from_value(other)
                        .map_err(|err| EnvelopeError::Malformed(format!("candidate: {err}")))?,
                };
                Ok(SignalingEnvelope::IceCandidate {
                    name,
                    target: Target::from_wire(wire.target),
                    candidate,
                })
            }
            other => Err(EnvelopeError::UnknownType(other.to_string())),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            SignalingEnvelope::Join { .. } => "join",
            SignalingEnvelope::Offer { .. } => "audio-offer",
            SignalingEnvelope::Answer { .. } => "audio-answer",
            SignalingEnvelope::IceCandidate { .. } => "new-ice-candidate",
        }
    }
}

fn missing(field: &str) -> EnvelopeError {
    EnvelopeError::Malformed(format!("missing field `{field}`"))
}

/// Accepts either a bare SDP string or a `{type, sdp}` description object.
fn sdp_text(raw: Option<Value>, expected: SdpKind) -> Result<String, EnvelopeError> {
    match raw.ok_or_else(|| missing("sdp"))? {
        Value::String(sdp) if !sdp.is_empty() => Ok(sdp),
        Value::String(_) => Err(EnvelopeError::Malformed("empty sdp".into())),
        other => {
            let description: SessionDescription = serde_json::from_value(other)
                .map_err(|err| EnvelopeError::Malformed(format!("sdp: {err}")))?;
            if description.kind != expected {
                return Err(EnvelopeError::Malformed(format!(
                    "sdp type {:?} in {:?} envelope",
                    description.kind, expected
                )));
            }
            Ok(description.sdp)
        }
    }
}

/// Envelopes the server writes to clients.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type")]
pub enum OutboundEnvelope {
    #[serde(rename = "audio-offer")]
    Offer {
        name: String,
        target: String,
        sdp: SessionDescription,
    },
    #[serde(rename = "audio-answer")]
    Answer {
        name: String,
        target: String,
        sdp: SessionDescription,
    },
    #[serde(rename = "new-ice-candidate")]
    IceCandidate {
        name: String,
        target: String,
        candidate: IceCandidate,
    },
    #[serde(rename = "error")]
    Error { reason: String, message: String },
}

impl OutboundEnvelope {
    pub fn to_json(&self) -> String {
        // Every field is a plain string or struct of strings.
        serde_json::to_string(self).unwrap_or_else(|_| String::from("{}"))
    }
}
