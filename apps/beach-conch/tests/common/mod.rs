#![allow(dead_code)]

use std::{
    future::Future,
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use beach_conch::{
    config::ServerConfig,
    envelope::{IceCandidate, SessionDescription},
    error::CollaboratorError,
    peer::{PeerConnector, PeerEventSink, PeerSession},
    registry::DEFAULT_OUTBOUND_DEPTH,
};
use parking_lot::Mutex;

pub const SCRIPTED_ANSWER: &str = "v=0\r\ns=scripted-answer\r\n";

/// Peer connector that records every call and hands out scripted answers.
#[derive(Default)]
pub struct ScriptedConnector {
    calls: Arc<Mutex<Vec<String>>>,
    sinks: Mutex<Vec<PeerEventSink>>,
    fail_connect: AtomicBool,
    fail_candidates: AtomicBool,
    decodes: AtomicBool,
}

impl ScriptedConnector {
    pub fn failing_connect() -> Self {
        let connector = Self::default();
        connector.fail_connect.store(true, Ordering::SeqCst);
        connector
    }

    pub fn failing_candidates() -> Self {
        let connector = Self::default();
        connector.fail_candidates.store(true, Ordering::SeqCst);
        connector
    }

    /// Sessions that report decoded samples, so recording is enabled.
    pub fn decoding() -> Self {
        let connector = Self::default();
        connector.decodes.store(true, Ordering::SeqCst);
        connector
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    /// Event sink handed to the n-th connected session.
    pub fn sink(&self, index: usize) -> PeerEventSink {
        self.sinks.lock()[index].clone()
    }

    pub fn sessions(&self) -> usize {
        self.sinks.lock().len()
    }
}

#[async_trait]
impl PeerConnector for ScriptedConnector {
    async fn connect(
        &self,
        events: PeerEventSink,
    ) -> Result<Box<dyn PeerSession>, CollaboratorError> {
        if self.fail_connect.load(Ordering::SeqCst) {
            return Err(CollaboratorError::Setup("scripted connect failure".into()));
        }
        self.calls.lock().push(format!("connect:{}", events.key()));
        self.sinks.lock().push(events);
        Ok(Box::new(ScriptedSession {
            calls: Arc::clone(&self.calls),
            fail_candidates: self.fail_candidates.load(Ordering::SeqCst),
        }))
    }

    fn delivers_samples(&self) -> bool {
        self.decodes.load(Ordering::SeqCst)
    }
}

struct ScriptedSession {
    calls: Arc<Mutex<Vec<String>>>,
    fail_candidates: bool,
}

#[async_trait]
impl PeerSession for ScriptedSession {
    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), CollaboratorError> {
        self.calls
            .lock()
            .push(format!("set_remote:{}", description.sdp));
        Ok(())
    }

    async fn create_answer(&self) -> Result<SessionDescription, CollaboratorError> {
        self.calls.lock().push("create_answer".into());
        Ok(SessionDescription::answer(SCRIPTED_ANSWER))
    }

    async fn set_local_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), CollaboratorError> {
        self.calls
            .lock()
            .push(format!("set_local:{}", description.sdp));
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), CollaboratorError> {
        if self.fail_candidates {
            return Err(CollaboratorError::Candidate("scripted candidate failure".into()));
        }
        self.calls
            .lock()
            .push(format!("add_candidate:{}", candidate.candidate));
        Ok(())
    }

    async fn close(&self) {
        self.calls.lock().push("close".into());
    }
}

pub fn candidate(text: &str) -> IceCandidate {
    IceCandidate {
        candidate: text.to_string(),
        sdp_mid: Some("0".into()),
        sdp_m_line_index: Some(0),
        username_fragment: None,
    }
}

pub fn test_config() -> ServerConfig {
    ServerConfig {
        listen_addr: "127.0.0.1:0".parse().unwrap(),
        http_addr: "127.0.0.1:0".parse().unwrap(),
        assets_dir: PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("assets"),
        archive: None,
        media_type: "audio/webm; codecs=opus".into(),
        outbound_buffer: DEFAULT_OUTBOUND_DEPTH,
        error_replies: false,
        ice_servers: Vec::new(),
        recorder: None,
        shutdown_grace: Duration::from_millis(0),
    }
}

/// Polls `check` until it holds or two seconds pass.
pub async fn eventually<F>(mut check: F) -> bool
where
    F: FnMut() -> bool,
{
    for _ in 0..200 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}

/// Resolves to `None` when `future` does not finish within `millis`.
pub async fn within<T>(millis: u64, future: impl Future<Output = T>) -> Option<T> {
    tokio::time::timeout(Duration::from_millis(millis), future)
        .await
        .ok()
}
