//! WebSocket audio relay and signaling server.
//!
//! Binary frames from one client are fanned out to every other connected
//! client. Text frames carry signaling envelopes: offers, answers and ICE
//! candidates are either forwarded between named peers or negotiated with a
//! server-side peer connection whose audio can be recorded through an
//! external encoder.

pub mod archive;
pub mod assets;
pub mod config;
pub mod coordinator;
pub mod envelope;
pub mod error;
pub mod pcm;
pub mod peer;
pub mod recorder;
pub mod registry;
pub mod router;
pub mod rtc;
pub mod server;
pub mod telemetry;
