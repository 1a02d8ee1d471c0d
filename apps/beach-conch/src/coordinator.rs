use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc, Weak,
};

use dashmap::DashMap;
use metrics::counter;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::{sync::mpsc, task::JoinHandle};
use tracing::{debug, info, warn};

use crate::envelope::{
    IceCandidate, OutboundEnvelope, SessionDescription, SignalingEnvelope, Target, SERVER_TARGET,
};
use crate::error::{CollaboratorError, SessionError};
use crate::peer::{ContextKey, PeerConnector, PeerEvent, PeerEventKind, PeerEventSink, PeerSession};
use crate::recorder::{RecorderConfig, RecordingHandle};
use crate::registry::{ConnectionHandle, ConnectionRegistry, OutboundFrame, PeerRole};

const PEER_EVENT_DEPTH: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NegotiationState {
    Idle,
    OfferSent,
    Answered,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Counterpart {
    Server,
    Peer {
        handle: ConnectionHandle,
        name: String,
    },
}

impl Counterpart {
    fn handle(&self) -> Option<ConnectionHandle> {
        match self {
            Counterpart::Server => None,
            Counterpart::Peer { handle, .. } => Some(*handle),
        }
    }
}

/// What a handled envelope led to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignalOutcome {
    Joined,
    Answered(ContextKey),
    OfferForwarded(ContextKey),
    AnswerForwarded(ContextKey),
    CandidateApplied(ContextKey),
    CandidateForwarded(ContextKey),
}

/// Bookkeeping for one offer/answer/candidate exchange.
struct NegotiationContext {
    generation: u64,
    key: ContextKey,
    origin: ConnectionHandle,
    origin_label: String,
    counterpart: Counterpart,
    live: Mutex<LiveState>,
}

struct LiveState {
    state: NegotiationState,
    peer: Option<Arc<dyn PeerSession>>,
    recording: Option<RecordingHandle>,
}

impl NegotiationContext {
    fn involves(&self, handle: ConnectionHandle) -> bool {
        self.origin == handle || self.counterpart.handle() == Some(handle)
    }

    fn state(&self) -> NegotiationState {
        self.live.lock().state
    }

    fn peer(&self) -> Option<Arc<dyn PeerSession>> {
        self.live.lock().peer.clone()
    }

    /// Releases the collaborator and ends any recording.
    async fn shutdown(&self) {
        let (peer, recording) = {
            let mut live = self.live.lock();
            live.state = NegotiationState::Idle;
            (live.peer.take(), live.recording.take())
        };
        // Dropping the handle closes the encoder's input; its task logs the outcome.
        drop(recording);
        if let Some(peer) = peer {
            peer.close().await;
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ContextSnapshot {
    pub key: ContextKey,
    pub generation: u64,
    pub origin: ConnectionHandle,
    pub origin_label: String,
    pub counterpart: Counterpart,
    pub state: NegotiationState,
    pub recording: bool,
}

#[derive(Clone)]
pub struct SessionCoordinator {
    inner: Arc<CoordinatorInner>,
}

struct CoordinatorInner {
    registry: ConnectionRegistry,
    connector: Arc<dyn PeerConnector>,
    contexts: DashMap<ContextKey, Arc<NegotiationContext>>,
    events: mpsc::Sender<PeerEvent>,
    generation: AtomicU64,
    recorder: Option<RecorderConfig>,
}

impl SessionCoordinator {
    /// Builds the coordinator and spawns the task that consumes peer events.
    pub fn new(
        registry: ConnectionRegistry,
        connector: Arc<dyn PeerConnector>,
        recorder: Option<RecorderConfig>,
    ) -> (Self, JoinHandle<()>) {
        let recorder = match recorder {
            Some(config) if !connector.delivers_samples() => {
                warn!(
                    dir = %config.dir.display(),
                    "peer collaborator does not decode audio; recording disabled"
                );
                None
            }
            other => other,
        };
        let (tx, rx) = mpsc::channel(PEER_EVENT_DEPTH);
        let coordinator = Self {
            inner: Arc::new(CoordinatorInner {
                registry,
                connector,
                contexts: DashMap::new(),
                events: tx,
                generation: AtomicU64::new(0),
                recorder,
            }),
        };
        let pump = tokio::spawn(run_event_pump(Arc::downgrade(&coordinator.inner), rx));
        (coordinator, pump)
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.inner.registry
    }

    pub fn records_sessions(&self) -> bool {
        self.inner.recorder.is_some()
    }

    pub async fn handle(
        &self,
        source: ConnectionHandle,
        envelope: SignalingEnvelope,
    ) -> Result<SignalOutcome, SessionError> {
        match envelope {
            SignalingEnvelope::Join { name, role } => {
                self.inner.registry.assign_identity(source, &name)?;
                self.inner
                    .registry
                    .set_role(source, role.unwrap_or(PeerRole::Client));
                Ok(SignalOutcome::Joined)
            }
            SignalingEnvelope::Offer {
                name: Some(name),
                target,
                sdp,
            } => {
                // The claimed name only sticks once the offer went through.
                self.inner.registry.check_identity(source, &name)?;
                let outcome = self.offer(source, Some(&name), target, sdp).await?;
                if let Err(err) = self.inner.registry.assign_identity(source, &name) {
                    warn!(connection = %source, error = %err, "offerer name not bound");
                }
                Ok(outcome)
            }
            SignalingEnvelope::Offer {
                name: None,
                target,
                sdp,
            } => self.handle_offer(source, target, sdp).await,
            SignalingEnvelope::Answer { target, sdp, .. } => {
                self.handle_answer(source, target, sdp)
            }
            SignalingEnvelope::IceCandidate {
                target, candidate, ..
            } => self.handle_ice_candidate(source, target, candidate).await,
        }
    }

    /// Starts (or replaces) a negotiation. Server-targeted offers are answered
    /// locally through the peer collaborator; peer-targeted offers are forwarded.
    pub async fn handle_offer(
        &self,
        origin: ConnectionHandle,
        target: Target,
        sdp: String,
    ) -> Result<SignalOutcome, SessionError> {
        self.offer(origin, None, target, sdp).await
    }

    async fn offer(
        &self,
        origin: ConnectionHandle,
        claimed: Option<&str>,
        target: Target,
        sdp: String,
    ) -> Result<SignalOutcome, SessionError> {
        let label = match claimed {
            Some(name) => name.to_string(),
            None => self.label_of(origin),
        };
        match target {
            Target::Server => self.offer_to_server(origin, label, sdp).await,
            Target::Peer(name) => self.offer_to_peer(origin, label, name, sdp).await,
        }
    }

    async fn offer_to_server(
        &self,
        origin: ConnectionHandle,
        label: String,
        sdp: String,
    ) -> Result<SignalOutcome, SessionError> {
        let key = ContextKey::Server(origin);
        let context = self
            .open_context(key.clone(), origin, label, Counterpart::Server)
            .await;
        let sink = PeerEventSink::new(key.clone(), context.generation, self.inner.events.clone());

        let peer: Arc<dyn PeerSession> = match self.inner.connector.connect(sink).await {
            Ok(peer) => Arc::from(peer),
            Err(err) => return Err(self.collaborator_failed(&context, err).await),
        };
        context.live.lock().peer = Some(Arc::clone(&peer));

        let answer = match answer_offer(peer.as_ref(), sdp).await {
            Ok(answer) => answer,
            Err(err) => return Err(self.collaborator_failed(&context, err).await),
        };

        if !self.is_current(&context) {
            // Torn down while the collaborator was busy (origin disconnected).
            peer.close().await;
            return Err(SessionError::NoActiveSession);
        }

        context.live.lock().state = NegotiationState::Answered;
        self.inner.registry.send_to(
            origin,
            OutboundFrame::Text(
                OutboundEnvelope::Answer {
                    name: SERVER_TARGET.to_string(),
                    target: context.origin_label.clone(),
                    sdp: answer,
                }
                .to_json(),
            ),
        )?;
        counter!("beach_conch_negotiations_total", 1, "outcome" => "answered");
        info!(context = %key, "server answered offer");
        Ok(SignalOutcome::Answered(key))
    }

    async fn offer_to_peer(
        &self,
        origin: ConnectionHandle,
        label: String,
        name: String,
        sdp: String,
    ) -> Result<SignalOutcome, SessionError> {
        let target = self
            .inner
            .registry
            .lookup(&name)
            .map_err(|_| SessionError::UnknownTarget(name.clone()))?;
        if target == origin {
            return Err(SessionError::UnknownTarget(name));
        }

        let key = ContextKey::Peer(name.clone());
        let context = self
            .open_context(
                key.clone(),
                origin,
                label,
                Counterpart::Peer {
                    handle: target,
                    name: name.clone(),
                },
            )
            .await;

        let forwarded = OutboundEnvelope::Offer {
            name: context.origin_label.clone(),
            target: name,
            sdp: SessionDescription::offer(sdp),
        };
        if let Err(err) = self
            .inner
            .registry
            .send_to(target, OutboundFrame::Text(forwarded.to_json()))
        {
            self.teardown_context(&context).await;
            return Err(err.into());
        }
        debug!(context = %key, "offer forwarded");
        Ok(SignalOutcome::OfferForwarded(key))
    }

    /// Accepts an answer only from the counterpart of an OFFER_SENT context.
    pub fn handle_answer(
        &self,
        source: ConnectionHandle,
        target: Target,
        sdp: String,
    ) -> Result<SignalOutcome, SessionError> {
        let Target::Peer(offerer) = target else {
            return Err(SessionError::UnexpectedAnswer);
        };
        let identity = self
            .inner
            .registry
            .identity_of(source)
            .ok_or(SessionError::UnexpectedAnswer)?;
        let key = ContextKey::Peer(identity.clone());
        let context = self.context(&key).ok_or(SessionError::UnexpectedAnswer)?;
        if context.counterpart.handle() != Some(source) || context.origin_label != offerer {
            return Err(SessionError::UnexpectedAnswer);
        }

        {
            let mut live = context.live.lock();
            if live.state != NegotiationState::OfferSent {
                return Err(SessionError::UnexpectedAnswer);
            }
            live.state = NegotiationState::Answered;
        }

        let forwarded = OutboundEnvelope::Answer {
            name: identity,
            target: offerer,
            sdp: SessionDescription::answer(sdp),
        };
        self.inner
            .registry
            .send_to(context.origin, OutboundFrame::Text(forwarded.to_json()))?;
        counter!("beach_conch_negotiations_total", 1, "outcome" => "answered");
        debug!(context = %key, "answer forwarded");
        Ok(SignalOutcome::AnswerForwarded(key))
    }

    /// Candidates are only accepted once a context links the two sides.
    pub async fn handle_ice_candidate(
        &self,
        source: ConnectionHandle,
        target: Target,
        candidate: IceCandidate,
    ) -> Result<SignalOutcome, SessionError> {
        match target {
            Target::Server => {
                let key = ContextKey::Server(source);
                let context = self.context(&key).ok_or(SessionError::NoActiveSession)?;
                let peer = context.peer().ok_or(SessionError::NoActiveSession)?;
                if let Err(err) = peer.add_ice_candidate(candidate).await {
                    return Err(self.collaborator_failed(&context, err).await);
                }
                Ok(SignalOutcome::CandidateApplied(key))
            }
            Target::Peer(name) => {
                let (context, recipient, sender_label) = self
                    .candidate_route(source, &name)
                    .ok_or(SessionError::NoActiveSession)?;
                let forwarded = OutboundEnvelope::IceCandidate {
                    name: sender_label,
                    target: name,
                    candidate,
                };
                self.inner
                    .registry
                    .send_to(recipient, OutboundFrame::Text(forwarded.to_json()))?;
                Ok(SignalOutcome::CandidateForwarded(context.key.clone()))
            }
        }
    }

    /// Finds the context a peer-addressed candidate belongs to and who receives it.
    fn candidate_route(
        &self,
        source: ConnectionHandle,
        target_name: &str,
    ) -> Option<(Arc<NegotiationContext>, ConnectionHandle, String)> {
        // Offering side talking to the target it offered to.
        if let Some(context) = self.context(&ContextKey::Peer(target_name.to_string())) {
            if context.origin == source {
                if let Some(recipient) = context.counterpart.handle() {
                    let label = context.origin_label.clone();
                    return Some((context, recipient, label));
                }
            }
        }

        // Answering side talking back to the offerer.
        let identity = self.inner.registry.identity_of(source)?;
        let context = self.context(&ContextKey::Peer(identity.clone()))?;
        if context.counterpart.handle() == Some(source) && context.origin_label == target_name {
            let recipient = context.origin;
            return Some((context, recipient, identity));
        }
        None
    }

    /// Drops every context the connection takes part in.
    pub async fn teardown_connection(&self, handle: ConnectionHandle) -> usize {
        let affected: Vec<Arc<NegotiationContext>> = self
            .inner
            .contexts
            .iter()
            .filter(|entry| entry.value().involves(handle))
            .map(|entry| Arc::clone(entry.value()))
            .collect();

        let mut removed = 0usize;
        for context in affected {
            if self.teardown_context(&context).await {
                removed += 1;
            }
        }
        removed
    }

    /// IDLE when no context exists for `key`.
    pub fn state_of(&self, key: &ContextKey) -> NegotiationState {
        self.context(key)
            .map(|context| context.state())
            .unwrap_or(NegotiationState::Idle)
    }

    pub fn active_contexts(&self) -> usize {
        self.inner.contexts.len()
    }

    pub fn snapshot(&self) -> Vec<ContextSnapshot> {
        let contexts: Vec<Arc<NegotiationContext>> = self
            .inner
            .contexts
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        contexts
            .into_iter()
            .map(|context| {
                let live = context.live.lock();
                ContextSnapshot {
                    key: context.key.clone(),
                    generation: context.generation,
                    origin: context.origin,
                    origin_label: context.origin_label.clone(),
                    counterpart: context.counterpart.clone(),
                    state: live.state,
                    recording: live.recording.is_some(),
                }
            })
            .collect()
    }

    pub async fn handle_peer_event(&self, event: PeerEvent) {
        let Some(context) = self
            .context(&event.key)
            .filter(|context| context.generation == event.generation)
        else {
            debug!(context = %event.key, generation = event.generation, "stale peer event ignored");
            return;
        };

        match event.kind {
            PeerEventKind::LocalCandidate(candidate) => {
                let envelope = OutboundEnvelope::IceCandidate {
                    name: SERVER_TARGET.to_string(),
                    target: context.origin_label.clone(),
                    candidate,
                };
                if let Err(err) = self
                    .inner
                    .registry
                    .send_to(context.origin, OutboundFrame::Text(envelope.to_json()))
                {
                    debug!(context = %event.key, error = %err, "local candidate not delivered");
                }
            }
            PeerEventKind::TrackStarted => {
                info!(context = %event.key, "remote audio track started");
                let Some(config) = self.inner.recorder.as_ref() else {
                    return;
                };
                if context.live.lock().recording.is_some() {
                    return;
                }
                let label = event.key.to_string();
                let started = match config.prepare().await {
                    Ok(()) => RecordingHandle::start(config.command_for(&label), label),
                    Err(err) => Err(err),
                };
                match started {
                    Ok(recording) if self.is_current(&context) => {
                        context.live.lock().recording = Some(recording)
                    }
                    Ok(_) => debug!(context = %event.key, "context gone before recording started"),
                    Err(err) => {
                        counter!("beach_conch_recording_failures_total", 1);
                        warn!(context = %event.key, error = %err, "failed to start recording");
                        self.teardown_context(&context).await;
                    }
                }
            }
            PeerEventKind::Samples(samples) => {
                let live = context.live.lock();
                if let Some(recording) = live.recording.as_ref() {
                    if !recording.push(samples) {
                        counter!("beach_conch_recording_dropped_blocks_total", 1);
                    }
                }
            }
            PeerEventKind::TrackEnded => {
                info!(context = %event.key, "remote audio track ended");
                self.teardown_context(&context).await;
            }
            PeerEventKind::Failed(reason) => {
                counter!("beach_conch_collaborator_failures_total", 1);
                warn!(context = %event.key, reason = %reason, "peer connection failed");
                self.teardown_context(&context).await;
            }
        }
    }

    fn context(&self, key: &ContextKey) -> Option<Arc<NegotiationContext>> {
        self.inner
            .contexts
            .get(key)
            .map(|entry| Arc::clone(entry.value()))
    }

    /// Identity of the connection, or its handle when anonymous.
    fn label_of(&self, handle: ConnectionHandle) -> String {
        self.inner
            .registry
            .identity_of(handle)
            .unwrap_or_else(|| handle.to_string())
    }

    fn is_current(&self, context: &Arc<NegotiationContext>) -> bool {
        self.context(&context.key)
            .map(|current| Arc::ptr_eq(&current, context))
            .unwrap_or(false)
    }

    /// Installs a fresh OFFER_SENT context, replacing whatever held the key.
    async fn open_context(
        &self,
        key: ContextKey,
        origin: ConnectionHandle,
        origin_label: String,
        counterpart: Counterpart,
    ) -> Arc<NegotiationContext> {
        let generation = self.inner.generation.fetch_add(1, Ordering::Relaxed) + 1;
        let context = Arc::new(NegotiationContext {
            generation,
            key: key.clone(),
            origin,
            origin_label,
            counterpart,
            live: Mutex::new(LiveState {
                state: NegotiationState::OfferSent,
                peer: None,
                recording: None,
            }),
        });

        let previous = self.inner.contexts.insert(key.clone(), Arc::clone(&context));
        counter!("beach_conch_negotiations_total", 1, "outcome" => "started");
        if let Some(previous) = previous {
            counter!("beach_conch_negotiations_total", 1, "outcome" => "replaced");
            info!(context = %key, generation, "negotiation replaced by new offer");
            previous.shutdown().await;
        }
        context
    }

    /// Removes the context if it is still the installed one for its key.
    async fn teardown_context(&self, context: &Arc<NegotiationContext>) -> bool {
        let removed = self
            .inner
            .contexts
            .remove_if(&context.key, |_, current| Arc::ptr_eq(current, context))
            .is_some();
        if removed {
            counter!("beach_conch_negotiations_total", 1, "outcome" => "torn_down");
            debug!(context = %context.key, generation = context.generation, "negotiation torn down");
        }
        context.shutdown().await;
        removed
    }

    async fn collaborator_failed(
        &self,
        context: &Arc<NegotiationContext>,
        err: CollaboratorError,
    ) -> SessionError {
        counter!("beach_conch_collaborator_failures_total", 1);
        warn!(context = %context.key, error = %err, "peer collaborator failed");
        self.teardown_context(context).await;
        SessionError::Collaborator(err)
    }
}

async fn answer_offer(
    peer: &dyn PeerSession,
    sdp: String,
) -> Result<SessionDescription, CollaboratorError> {
    peer.set_remote_description(SessionDescription::offer(sdp))
        .await?;
    let answer = peer.create_answer().await?;
    peer.set_local_description(answer.clone()).await?;
    Ok(answer)
}

async fn run_event_pump(inner: Weak<CoordinatorInner>, mut rx: mpsc::Receiver<PeerEvent>) {
    while let Some(event) = rx.recv().await {
        let Some(inner) = inner.upgrade() else {
            break;
        };
        SessionCoordinator { inner }.handle_peer_event(event).await;
    }
    debug!("peer event pump stopped");
}
