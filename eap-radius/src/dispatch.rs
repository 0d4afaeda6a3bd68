//! The dispatcher: the four hooks the RADIUS host invokes, method
//! selection, NAK negotiation, and reply composition.

use std::sync::Mutex;

use eap_radius_protocol::{Code, EapPacket, Method, NakData, MAX_FRAGMENT_LEN};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{debug, error, warn};

use crate::config::{ConfigSection, EapConfig};
use crate::method::CallbackSlot;
use crate::radius::{
    attr, tunnel_password, Attribute, DataKind, InstanceId, Packet, PacketCode, Request, Value,
    VENDOR_CISCO, VENDOR_NONE,
};
use crate::rcode::Rcode;
use crate::registry::{BootstrapError, MethodLoader, MethodRegistry};
use crate::session::{EapSession, SessionState, Terminal};
use crate::store::{Correlator, SessionStore, ThawError};
use crate::tunnel::TunnelCallback;

const LEAP_KEY_PREFIX: &[u8] = b"leap:session-key=";

/// `leap:session-key=` plus a two-octet salt and 32 octets of ciphertext.
const LEAP_KEY_LEN: usize = 17 + 34;

/// What the eap-start probe concluded about a request.
#[derive(Clone, Copy, PartialEq, Eq)]
enum Probe {
    /// No EAP-Message at all; not our business.
    Noop,

    /// An EAP-Start was answered with an Identity request.
    Handled,

    /// The probe itself failed.
    Fail,

    /// An opening EAP-Message with no `State`; a conversation is starting.
    Opening,

    /// An EAP-Message with `State`; an ongoing conversation.
    Continuing,
}

/// One configured instance of the EAP module.
pub struct EapModule {
    name: String,
    instance: InstanceId,
    config: EapConfig,
    registry: MethodRegistry,
    store: SessionStore,
    rng: Mutex<StdRng>,
}

impl EapModule {
    /// Bootstraps an instance from its configuration section, loading every
    /// configured method. Fatal errors abort module loading.
    pub fn bootstrap(cs: &ConfigSection, loader: &dyn MethodLoader) -> Result<Self, BootstrapError> {
        let config = EapConfig::parse(cs)?;
        let registry = MethodRegistry::bootstrap(cs, &config, loader)?;
        let name = cs.instance().unwrap_or("eap").to_owned();

        Ok(Self {
            name,
            instance: InstanceId::next(),
            store: SessionStore::new(config.session_lifetime),
            rng: Mutex::new(StdRng::from_entropy()),
            config,
            registry,
        })
    }

    /// The instance name, as installed into `Auth-Type`.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// This instance's request-data key.
    pub fn instance(&self) -> InstanceId {
        self.instance
    }

    /// The session store, for host-driven introspection.
    pub fn store(&self) -> &SessionStore {
        &self.store
    }

    /// The authorize hook: answer EAP-Start, then route EAP requests to this
    /// module's authenticate hook via `Auth-Type`.
    pub fn authorize(&self, request: &mut Request) -> Rcode {
        // once a proxy reply is in play, authorization already happened
        if request.proxy.is_some() {
            return Rcode::Noop;
        }

        let probe = self.eap_start(request);
        match probe {
            Probe::Noop => return Rcode::Noop,
            Probe::Fail => return Rcode::Fail,
            Probe::Handled => return Rcode::Handled,
            Probe::Opening | Probe::Continuing => {}
        }

        match request.control.find(VENDOR_NONE, attr::AUTH_TYPE) {
            None => {
                request.control.add(Attribute::string(
                    VENDOR_NONE,
                    attr::AUTH_TYPE,
                    self.name.clone(),
                ));
            }
            Some(_) => {
                debug!("Auth-Type already set.  Not setting to {}", self.name);
            }
        }

        if probe == Probe::Opening {
            Rcode::Ok
        } else {
            Rcode::Updated
        }
    }

    /// The authenticate hook: reassemble the EAP packet, thaw or create the
    /// session, run method selection, and stage the reply.
    pub fn authenticate(&self, request: &mut Request) -> Rcode {
        if !request.packet.vps.contains(VENDOR_NONE, attr::EAP_MESSAGE) {
            error!(
                "Auth-Type = {} was set for a request that does not contain an EAP-Message attribute!",
                self.name
            );
            return Rcode::Invalid;
        }

        let packet = match EapPacket::from_fragments(request.packet.vps.eap_fragments()) {
            Ok(packet) => packet,
            Err(err) => {
                error!("Malformed EAP Message: {err}");
                return Rcode::Fail;
            }
        };

        let mut session = match self.session_continue(packet, request) {
            Ok(session) => session,
            Err(rcode) => return rcode,
        };

        let rcode = self.method_select(request, &mut session);

        match rcode {
            Rcode::Invalid => {
                self.eap_fail(request, &mut session);
                self.store.freeze(session);
                return Rcode::Invalid;
            }
            Rcode::Noop => {
                // another module owns conversations of this type
                self.store.discard(session);
                return Rcode::Noop;
            }
            _ => {}
        }

        // the method may have proxied the round instead of answering it
        if request.data_contains(self.instance, DataKind::SessionProxied) {
            session.mark_awaiting_proxy();
            self.store.release(&mut session);
            request.data_put(self.instance, DataKind::Session, session);
            return Rcode::Updated;
        }

        let rcode = self.compose(request, &mut session);
        self.retain_or_destroy(&mut session, true);

        // LEAP's Accept must still carry State for the trailing round
        if session.state() == SessionState::LeapTrailer {
            let correlator = Correlator::generate(&mut *self.rng.lock().expect("rng poisoned"));
            request.reply.vps.add(Attribute::octets(
                VENDOR_NONE,
                attr::STATE,
                correlator.octets(),
            ));
            session.set_correlator(correlator);
        }

        self.finish_username(request);
        self.store.freeze(session);

        rcode
    }

    /// The post-proxy hook: resume a proxied tunnel session through its
    /// parked callback, or rewrap a `leap:session-key` from the home server.
    pub fn post_proxy(&self, request: &mut Request) -> Rcode {
        if request
            .data_take::<bool>(self.instance, DataKind::SessionProxied)
            .is_some()
        {
            return self.post_proxy_session(request);
        }
        debug!("No pre-existing eap_session found");

        // a proxy reply without EAP state is allowed
        let Some(proxy) = request.proxy.as_mut() else {
            return Rcode::Noop;
        };
        if proxy.reply.is_none() {
            return Rcode::Noop;
        }

        let client_secret = request.secret.clone();
        let client_vector = request.packet.vector;
        let salt: [u8; 2] = self.rng.lock().expect("rng poisoned").gen();

        let Some(home_secret) = proxy.home_server.as_ref().map(|home| home.secret.clone()) else {
            error!("Proxy reply has no home server to decode leap:session-key under");
            return Rcode::Fail;
        };
        let proxy_vector = proxy.packet.vector;

        let Some(reply) = proxy.reply.as_mut() else {
            return Rcode::Noop;
        };

        // the format is VERY specific
        let Some(vp) = reply.vps.iter_mut().find(|vp| {
            vp.vendor == VENDOR_CISCO
                && vp.attr == attr::CISCO_AVPAIR
                && vp.value.as_octets().is_some_and(|octets| {
                    octets.len() >= LEAP_KEY_PREFIX.len()
                        && octets[..LEAP_KEY_PREFIX.len()].eq_ignore_ascii_case(LEAP_KEY_PREFIX)
                })
        }) else {
            return Rcode::Noop;
        };

        let octets = vp
            .value
            .as_octets()
            .expect("matched attribute has octets")
            .to_vec();
        if octets.len() != LEAP_KEY_LEN {
            debug!(
                "Cisco-AVPair with leap:session-key has incorrect length. Got {}, expected {}",
                octets.len(),
                LEAP_KEY_LEN
            );
            return Rcode::Noop;
        }

        // decrypt under the home server's secret and the proxy authenticator
        let plaintext = match tunnel_password::decode(
            &octets[LEAP_KEY_PREFIX.len()..],
            &home_secret,
            &proxy_vector,
        ) {
            Ok(plaintext) => plaintext,
            Err(err) => {
                error!("Decoding leap:session-key failed: {err}");
                return Rcode::Fail;
            }
        };
        if plaintext.len() != 16 {
            error!("Decoded key length is incorrect, must be 16 bytes");
            return Rcode::Fail;
        }

        // re-encrypt under the NAS's secret and the original authenticator
        let reencoded =
            match tunnel_password::encode(&plaintext, salt, &client_secret, &client_vector) {
                Ok(reencoded) => reencoded,
                Err(err) => {
                    error!("Encoding leap:session-key failed: {err}");
                    return Rcode::Fail;
                }
            };

        let mut value = octets[..LEAP_KEY_PREFIX.len()].to_vec();
        value.extend_from_slice(&reencoded);
        vp.value = Value::Octets(value);

        Rcode::Updated
    }

    fn post_proxy_session(&self, request: &mut Request) -> Rcode {
        let Some(mut session) = request.data_take::<EapSession>(self.instance, DataKind::Session)
        else {
            error!("Proxied marker found but no session was parked on the request");
            return Rcode::Fail;
        };

        let Some(callback) =
            request.data_take::<TunnelCallback>(self.instance, DataKind::TunnelCallback)
        else {
            error!("Failed to retrieve callback for tunneled session!");
            self.store.discard(session);
            return Rcode::Fail;
        };

        debug!("Doing post-proxy callback");
        if let Err(err) = (*callback)(&mut session, request) {
            debug!("Failed in post-proxy callback: {err}");
            self.eap_fail(request, &mut session);
            self.store.freeze(session);
            return Rcode::Reject;
        }

        session.resume_running();
        self.compose(request, &mut session);
        // couldn't have been LEAP, there's no tunnel
        self.retain_or_destroy(&mut session, false);
        self.finish_username(request);
        self.store.freeze(session);

        Rcode::Ok
    }

    /// The post-auth hook: when the request was rejected upstream, make sure
    /// the peer sees an EAP-Failure rather than a bare Access-Reject.
    pub fn post_auth(&self, request: &mut Request) -> Rcode {
        // only act when something previously rejected the request
        let rejected = request
            .control
            .find(VENDOR_NONE, attr::POST_AUTH_TYPE)
            .and_then(|vp| vp.value.as_str())
            .is_some_and(|value| value.eq_ignore_ascii_case(crate::radius::AUTH_TYPE_REJECT));
        if !rejected {
            return Rcode::Noop;
        }

        if !request.packet.vps.contains(VENDOR_NONE, attr::EAP_MESSAGE) {
            debug!("Request didn't contain an EAP-Message, not inserting EAP-Failure");
            return Rcode::Noop;
        }
        if request.reply.vps.contains(VENDOR_NONE, attr::EAP_MESSAGE) {
            debug!("Reply already contained an EAP-Message, not inserting EAP-Failure");
            return Rcode::Noop;
        }

        let packet = match EapPacket::from_fragments(request.packet.vps.eap_fragments()) {
            Ok(packet) => packet,
            Err(err) => {
                error!("Malformed EAP Message: {err}");
                return Rcode::Fail;
            }
        };

        let Ok(mut session) = self.session_continue(packet, request) else {
            debug!("Failed to get eap_session, probably already removed, not inserting EAP-Failure");
            return Rcode::Noop;
        };

        error!("Request was previously rejected, inserting EAP-Failure");
        self.eap_fail(request, &mut session);
        self.store.freeze(session);

        Rcode::Updated
    }

    /// Probes a request for EAP-Start and stages the Identity request that
    /// answers it.
    fn eap_start(&self, request: &mut Request) -> Probe {
        let fragments: Vec<&[u8]> = request.packet.vps.eap_fragments().collect();
        if fragments.is_empty() {
            return Probe::Noop;
        }

        // EAP-Start is an empty EAP-Message, or one carrying a bare header
        let total: usize = fragments.iter().map(|fragment| fragment.len()).sum();
        if total == 0 || (fragments.len() == 1 && fragments[0].len() == 2) {
            debug!("Got EAP_START message");

            let identity_request = EapPacket::request(0, Method::IDENTITY, Vec::new());
            let Ok(wire) = identity_request.encode() else {
                return Probe::Fail;
            };

            Self::add_eap_message(&mut request.reply, &wire);
            request.reply.code = Some(PacketCode::AccessChallenge);
            return Probe::Handled;
        }

        if !request.packet.vps.contains(VENDOR_NONE, attr::STATE) {
            return Probe::Opening;
        }

        debug!("Continuing on-going EAP conversation");
        Probe::Continuing
    }

    /// Thaws the session this packet belongs to, or creates one for an
    /// opening Identity response.
    fn session_continue(
        &self,
        packet: EapPacket,
        request: &mut Request,
    ) -> Result<Box<EapSession>, Rcode> {
        let state = request
            .packet
            .vps
            .find(VENDOR_NONE, attr::STATE)
            .and_then(|vp| vp.value.as_octets())
            .map(<[u8]>::to_vec);

        if let Some(state) = &state {
            match self.store.thaw(state) {
                Ok(mut session) => {
                    // the response must answer the previous round's request
                    let expected = session
                        .prev_round
                        .as_ref()
                        .and_then(|round| round.request.as_ref())
                        .map(EapPacket::identifier);
                    if let Some(expected) = expected {
                        if expected != packet.identifier() {
                            error!(
                                "Last request and response identifiers do not match: expected {expected}, got {}",
                                packet.identifier()
                            );
                            self.store.discard(session);
                            return Err(Rcode::Invalid);
                        }
                    }

                    debug!("Continuing EAP session {}", session.id());
                    session.attach_response(packet);
                    return Ok(session);
                }
                Err(ThawError::Busy) => {
                    error!("Peer retransmitted while the previous round is still being processed");
                    return Err(Rcode::Invalid);
                }
                Err(ThawError::NotFound) => {
                    debug!("No session found for State, treating as a new conversation");
                }
            }
        }

        // only an Identity response may open a session
        if packet.code() != Code::Response || packet.method() != Method::IDENTITY {
            error!("Received a non-Identity packet for which no session exists");
            return Err(Rcode::Invalid);
        }

        let correlator = Correlator::generate(&mut *self.rng.lock().expect("rng poisoned"));
        let mut session = Box::new(EapSession::new(self.instance, correlator));
        session.identity = packet
            .body()
            .as_ref()
            .map(|body| String::from_utf8_lossy(body.data()).into_owned());
        debug!(
            "Created EAP session {} for identity {:?}",
            session.id(),
            session.identity
        );
        session.attach_response(packet);

        Ok(session)
    }

    /// Selects the callback for this round based on the peer's response and
    /// invokes it.
    fn method_select(&self, request: &mut Request, session: &mut EapSession) -> Rcode {
        let Some(response_method) = session
            .this_round
            .as_ref()
            .and_then(|round| round.response.as_ref())
            .map(EapPacket::method)
        else {
            return Rcode::Invalid;
        };

        // don't trust anyone
        if response_method.num() == 0 || response_method.num() >= Method::MAX {
            error!(
                "Peer sent EAP type number {}, which is outside known range",
                response_method.num()
            );
            return Rcode::Invalid;
        }

        // Two levels of tunnelling is a nonsensical configuration, unless
        // the outermost request is itself bound to a home server (i.e. it is
        // being processed through a proxying virtual server).
        if let Some(parent) = &request.parent {
            if let Some(grandparent) = &parent.parent {
                if !grandparent.home_server {
                    error!("Multiple levels of TLS nesting are invalid");
                    return Rcode::Invalid;
                }
            }
        }

        debug!("Peer sent packet with EAP method {response_method}");

        match response_method {
            Method::IDENTITY => {
                // allow per-user configuration of EAP types
                let mut next = self.registry.default_method();
                if let Some(num) = request
                    .control
                    .find(VENDOR_NONE, attr::EAP_TYPE)
                    .and_then(|vp| vp.value.as_integer())
                {
                    debug!("Setting method from control EAP-Type");
                    next = u8::try_from(num).map_or(Method::INVALID, Method::new);
                }

                if !next.is_authentication() || !self.registry.contains(next) {
                    error!("Tried to start unsupported EAP type {next}");
                    return Rcode::Invalid;
                }

                session.set_method(next);
                session.set_process(CallbackSlot::SessionInit);
            }

            Method::NAK => {
                // the old method's state dies before any new method runs
                session.clear_opaque();

                let proposed: Vec<u8> = session
                    .this_round
                    .as_ref()
                    .and_then(|round| round.response.as_ref())
                    .and_then(NakData::from_response)
                    .map(|nak| nak.proposed().collect())
                    .unwrap_or_default();

                let Some(next) = self.process_nak(request, session.method(), &proposed) else {
                    return Rcode::Invalid;
                };

                session.set_method(next);
                session.set_process(CallbackSlot::SessionInit);
            }

            method => {
                if !self.registry.contains(method) {
                    if self.config.ignore_unknown_types {
                        debug!("Ignoring unknown EAP type {method}");
                        return Rcode::Noop;
                    }

                    error!("Client asked for unsupported EAP type {method}");
                    return Rcode::Invalid;
                }

                session.set_method(method);
            }
        }

        let Some(handle) = self.registry.get(session.method()).cloned() else {
            error!("Client asked for unsupported EAP type {}", session.method());
            return Rcode::Invalid;
        };
        session.pin(handle.clone());

        debug!("Calling submodule {}", handle.name());

        // tag the request with the submodule's name while it runs
        let caller = request.module.take();
        request.module = Some(handle.name().to_owned());
        let result = match session.process_slot() {
            CallbackSlot::SessionInit => handle.submodule().session_init(request, session),
            CallbackSlot::Process => handle.submodule().process(request, session),
        };
        request.module = caller;

        if let Err(err) = result {
            error!(
                "Failed in EAP {} session.  EAP sub-module failed: {err}",
                session.method()
            );
            return Rcode::Invalid;
        }

        Rcode::Ok
    }

    /// NAK negotiation: pick the first mutually acceptable type from the
    /// peer's ordered proposal list.
    fn process_nak(&self, request: &Request, current: Method, nak: &[u8]) -> Option<Method> {
        if nak.is_empty() {
            error!("Peer sent empty (invalid) NAK. Can't select method to continue with");
            return None;
        }

        let pinned = request
            .control
            .find(VENDOR_NONE, attr::EAP_TYPE)
            .and_then(|vp| vp.value.as_integer());

        for &num in nak {
            // type 0 is valid, and means there are no common choices
            if num == 0 {
                debug!("Peer NAK'd indicating it is not willing to continue");
                return None;
            }

            let proposed = Method::new(num);

            // requesting identity, notification or nak inside a NAK is bogus
            if num < Method::MD5.num() {
                error!("Peer NAK'd asking for bad type {proposed}");
                return None;
            }

            if num >= Method::MAX || !self.registry.contains(proposed) {
                debug!("Peer NAK'd asking for unsupported EAP type {proposed}, skipping...");
                continue;
            }

            // prevent a firestorm if the client is confused
            if proposed == current {
                debug!("Peer NAK'd our request for {current} with a request for {proposed}, skipping...");
                warn!("!!! We requested to use EAP type {current}");
                warn!("!!! The supplicant rejected that, and requested to use the same EAP type.");
                warn!("!!!     i.e. the supplicant said 'I don't like {current}, please use {proposed} instead.");
                warn!("!!! The supplicant software is broken and does not work properly.");
                warn!("!!! Please upgrade it to software that works.");
                continue;
            }

            // enforce per-user configuration of EAP types
            if let Some(pin) = pinned {
                if pin != u32::from(num) {
                    debug!("Peer wants {proposed}, while we require EAP type {pin}, skipping");
                    continue;
                }
            }

            debug!("Found mutually acceptable type {proposed}");
            return Some(proposed);
        }

        error!("No mutually acceptable types found");
        None
    }

    /// Wraps the session's composed packet into the RADIUS reply and sets
    /// the reply code.
    fn compose(&self, request: &mut Request, session: &mut EapSession) -> Rcode {
        let (wire, code) = {
            let Some(reply_packet) = session
                .this_round
                .as_ref()
                .and_then(|round| round.request.as_ref())
            else {
                error!("Method did not compose a packet to send");
                return Rcode::Fail;
            };

            match reply_packet.encode() {
                Ok(wire) => (wire, reply_packet.code()),
                Err(err) => {
                    error!("Failed encoding EAP packet: {err}");
                    return Rcode::Fail;
                }
            }
        };

        Self::add_eap_message(&mut request.reply, &wire);

        match code {
            Code::Request => {
                // a fresh correlator for every continued round
                let correlator = Correlator::generate(&mut *self.rng.lock().expect("rng poisoned"));
                request.reply.vps.add(Attribute::octets(
                    VENDOR_NONE,
                    attr::STATE,
                    correlator.octets(),
                ));
                session.set_correlator(correlator);
                request.reply.code = Some(PacketCode::AccessChallenge);
                Rcode::Handled
            }

            // LEAP's trailing round sends a Response inside the Accept
            Code::Success | Code::Response => {
                request.reply.code = Some(PacketCode::AccessAccept);
                Rcode::Ok
            }

            Code::Failure => {
                request.reply.code = Some(PacketCode::AccessReject);
                Rcode::Reject
            }
        }
    }

    /// Composes an EAP-Failure over whatever reply was staged so far.
    fn eap_fail(&self, request: &mut Request, session: &mut EapSession) {
        request.reply.vps.remove_all(VENDOR_NONE, attr::EAP_MESSAGE);
        session.compose_failure();
        self.compose(request, session);
        session.mark_terminal(Terminal::Failure);
    }

    /// Decides whether the session survives this round: yes for a real
    /// Request to the peer, and for LEAP's trailing round after Success
    /// (when `allow_leap` holds).
    fn retain_or_destroy(&self, session: &mut EapSession, allow_leap: bool) {
        enum Retain {
            No,
            Yes,
            LeapTrailer,
        }

        let retain = {
            let round = session.this_round.as_ref();
            let to_peer = round.and_then(|r| r.request.as_ref());
            let response = round.and_then(|r| r.response.as_ref());

            match to_peer {
                Some(packet)
                    if packet.code() == Code::Request
                        && packet.method().num() >= Method::MD5.num() =>
                {
                    Retain::Yes
                }

                // LEAP sends Success at stage 4 but the State and session
                // must survive for the AP Challenge
                Some(packet)
                    if allow_leap
                        && packet.code() == Code::Success
                        && response.map(EapPacket::method) == Some(Method::LEAP) =>
                {
                    Retain::LeapTrailer
                }

                _ => Retain::No,
            }
        };

        match retain {
            Retain::Yes => {
                session.advance_round();
            }
            Retain::LeapTrailer => {
                session.mark_leap_trailer();
                session.advance_round();
            }
            Retain::No => {
                debug!("Cleaning up EAP session");
                let terminal = match session
                    .this_round
                    .as_ref()
                    .and_then(|round| round.request.as_ref())
                    .map(EapPacket::code)
                {
                    Some(Code::Failure) | None => Terminal::Failure,
                    _ => Terminal::Success,
                };
                session.mark_terminal(terminal);
            }
        }
    }

    /// RFC 2869 section 2.3.1: an Access-Accept concluding an EAP exchange
    /// MUST carry a User-Name.
    fn finish_username(&self, request: &mut Request) {
        if request.reply.code != Some(PacketCode::AccessAccept) {
            return;
        }
        let Some(username) = request.username.clone() else {
            return;
        };

        if !request.reply.vps.contains(VENDOR_NONE, attr::USER_NAME) {
            request
                .reply
                .vps
                .add(Attribute::string(VENDOR_NONE, attr::USER_NAME, username));
        }

        // the Cisco AP1230 over-reads the value by one octet, so it gets a
        // terminator and one octet of slack
        if self.config.accounting_username_bug {
            if let Some(vp) = request.reply.vps.find_mut(VENDOR_NONE, attr::USER_NAME) {
                if let Some(octets) = vp.value.as_octets() {
                    let mut padded = octets.to_vec();
                    padded.extend_from_slice(&[0, 0]);
                    vp.value = Value::Octets(padded);
                }
            }
        }
    }

    fn add_eap_message(reply: &mut Packet, wire: &[u8]) {
        for chunk in wire.chunks(MAX_FRAGMENT_LEN) {
            reply
                .vps
                .add(Attribute::octets(VENDOR_NONE, attr::EAP_MESSAGE, chunk));
        }

        // the RADIUS layer computes the real value on the way out
        if !reply.vps.contains(VENDOR_NONE, attr::MESSAGE_AUTHENTICATOR) {
            reply.vps.add(Attribute::octets(
                VENDOR_NONE,
                attr::MESSAGE_AUTHENTICATOR,
                vec![0; 16],
            ));
        }
    }
}
