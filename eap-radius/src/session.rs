//! Per-peer EAP session state, held across RADIUS round-trips.

use std::any::Any;
use std::sync::Arc;

use eap_radius_protocol::{EapPacket, Method};
use uuid::Uuid;

use crate::method::{CallbackSlot, MethodHandle};
use crate::radius::InstanceId;
use crate::store::Correlator;

/// One request/response pair of the EAP conversation.
///
/// `request` is the packet this server sends to the peer; `response` is the
/// peer's packet. At least one side is always populated: a round is created
/// around an incoming response, and the method fills in the request.
#[derive(Debug, Default)]
pub struct EapRound {
    /// The packet to send (or already sent) to the peer.
    pub request: Option<EapPacket>,

    /// The peer's packet this round answers.
    pub response: Option<EapPacket>,
}

impl EapRound {
    /// A round opened by a peer response.
    pub fn from_response(response: EapPacket) -> Self {
        Self {
            request: None,
            response: Some(response),
        }
    }
}

/// Why a session reached its terminal state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Terminal {
    /// Success was sent to the peer.
    Success,

    /// Failure was sent to the peer.
    Failure,
}

/// Lifecycle state of a session.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    /// Created, no method selected yet.
    New,

    /// A method is driving the conversation.
    Running,

    /// The current round was proxied; the session is parked on the request
    /// until the home server replies.
    AwaitingProxyReply,

    /// Success has been sent, but LEAP still owes the peer one trailing
    /// AP-Challenge round before the session dies.
    LeapTrailer,

    /// Success or Failure was emitted; no further rounds may be processed.
    Terminal(Terminal),
}

/// The long-lived state of one peer's EAP conversation.
pub struct EapSession {
    id: Uuid,
    instance: InstanceId,
    correlator: Correlator,
    pub(crate) claim: Option<Correlator>,
    state: SessionState,
    method: Method,
    process: CallbackSlot,
    handle: Option<Arc<MethodHandle>>,

    /// The round being processed.
    pub this_round: Option<EapRound>,

    /// The previous round, kept for identifier chaining checks.
    pub prev_round: Option<EapRound>,

    /// The peer's EAP-Identity, captured from the opening response.
    pub identity: Option<String>,

    /// Method-owned state. Only the running method downcasts this; it is
    /// dropped before the method number changes and when the session dies.
    pub opaque: Option<Box<dyn Any + Send>>,

    /// Whether a TLS-based method is running.
    pub tls: bool,
}

impl EapSession {
    /// A fresh session owned by the given module instance.
    pub fn new(instance: InstanceId, correlator: Correlator) -> Self {
        Self {
            id: Uuid::new_v4(),
            instance,
            correlator,
            claim: None,
            state: SessionState::New,
            method: Method::INVALID,
            process: CallbackSlot::SessionInit,
            handle: None,
            this_round: None,
            prev_round: None,
            identity: None,
            opaque: None,
            tls: false,
        }
    }

    /// Log identifier of this session.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// The module instance owning this session.
    pub fn instance(&self) -> InstanceId {
        self.instance
    }

    /// The correlator the session is (or will be) stored under.
    pub fn correlator(&self) -> &Correlator {
        &self.correlator
    }

    /// Replaces the correlator ahead of the next freeze.
    pub fn set_correlator(&mut self, correlator: Correlator) {
        self.correlator = correlator;
    }

    /// The session's lifecycle state.
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// The currently-running method number.
    pub fn method(&self) -> Method {
        self.method
    }

    /// Selects the running method. Any previous method's opaque state is
    /// dropped before the number changes.
    pub fn set_method(&mut self, method: Method) {
        if self.method != method {
            self.opaque = None;
        }

        self.method = method;
        if self.state == SessionState::New {
            self.state = SessionState::Running;
        }
    }

    /// Which entry point the next dispatch invokes.
    pub fn process_slot(&self) -> CallbackSlot {
        self.process
    }

    /// Points the next dispatch at the given entry point. Methods flip this
    /// to [`CallbackSlot::Process`] at the end of their `session_init`.
    pub fn set_process(&mut self, slot: CallbackSlot) {
        self.process = slot;
    }

    /// Pins the handle of the running method for the session's lifetime.
    pub(crate) fn pin(&mut self, handle: Arc<MethodHandle>) {
        self.handle = Some(handle);
    }

    /// The handle of the running method, once one has been selected.
    pub fn handle(&self) -> Option<&Arc<MethodHandle>> {
        self.handle.as_ref()
    }

    /// Drops the running method's opaque state.
    pub fn clear_opaque(&mut self) {
        self.opaque = None;
    }

    /// Opens a new round around a peer response.
    pub fn attach_response(&mut self, response: EapPacket) {
        self.this_round = Some(EapRound::from_response(response));
    }

    /// Retains the session for another round: the current round becomes the
    /// previous one.
    pub fn advance_round(&mut self) {
        self.prev_round = self.this_round.take();
    }

    /// Marks Success/Failure as emitted; the session dies on freeze.
    pub fn mark_terminal(&mut self, terminal: Terminal) {
        self.state = SessionState::Terminal(terminal);
    }

    /// Marks the session as waiting for a proxied reply.
    pub fn mark_awaiting_proxy(&mut self) {
        self.state = SessionState::AwaitingProxyReply;
    }

    /// Resumes a proxied session after the post-proxy callback succeeded.
    pub fn resume_running(&mut self) {
        if self.state == SessionState::AwaitingProxyReply {
            self.state = SessionState::Running;
        }
    }

    /// Marks the session as retained solely for LEAP's trailing round.
    pub fn mark_leap_trailer(&mut self) {
        self.state = SessionState::LeapTrailer;
    }

    /// Whether Success or Failure has been emitted.
    pub fn is_terminal(&self) -> bool {
        matches!(self.state, SessionState::Terminal(_))
    }

    /// The identifier the next request to the peer must carry.
    fn next_identifier(&self) -> u8 {
        self.response_identifier().wrapping_add(1)
    }

    /// The identifier of the response being answered.
    fn response_identifier(&self) -> u8 {
        self.this_round
            .as_ref()
            .and_then(|round| round.response.as_ref())
            .or_else(|| {
                self.prev_round
                    .as_ref()
                    .and_then(|round| round.request.as_ref())
            })
            .map_or(0, EapPacket::identifier)
    }

    fn place_request(&mut self, request: EapPacket) {
        match &mut self.this_round {
            Some(round) => round.request = Some(request),
            None => {
                self.this_round = Some(EapRound {
                    request: Some(request),
                    response: None,
                });
            }
        }
    }

    /// Composes a Request to the peer into the current round, chaining the
    /// identifier off the response being answered (RFC 3748 section 4.1).
    pub fn compose_request(&mut self, method: Method, data: Vec<u8>) {
        let identifier = self.next_identifier();
        self.place_request(EapPacket::request(identifier, method, data));
    }

    /// Composes a Response to the peer into the current round (only LEAP's
    /// trailing AP-Challenge round does this).
    pub fn compose_response(&mut self, method: Method, data: Vec<u8>) {
        let identifier = self.next_identifier();
        self.place_request(EapPacket::response(identifier, method, data));
    }

    /// Composes a Success; its identifier matches the response it answers
    /// (RFC 3748 section 4.2).
    pub fn compose_success(&mut self) {
        let identifier = self.response_identifier();
        self.place_request(EapPacket::success(identifier));
    }

    /// Composes a Failure; its identifier matches the response it answers.
    pub fn compose_failure(&mut self) {
        let identifier = self.response_identifier();
        self.place_request(EapPacket::failure(identifier));
    }
}

impl std::fmt::Debug for EapSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EapSession")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("method", &self.method)
            .field("identity", &self.identity)
            .field("tls", &self.tls)
            .finish_non_exhaustive()
    }
}
