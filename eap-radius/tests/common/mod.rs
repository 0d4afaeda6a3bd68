//! Host-side fakes shared by the integration tests: an EAP-MD5 method, a
//! scripted TLS driver, an inner virtual server, and request builders.

#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use md5::{Digest, Md5};

use eap_radius::config::{ConfigSection, TunnelConfig};
use eap_radius::method::{CallbackSlot, EapMethod, MethodError};
use eap_radius::radius::{
    attr, Attribute, HomeServer, Packet, PacketCode, Proxy, Request, VENDOR_NONE,
};
use eap_radius::registry::{LoadError, MethodLoader};
use eap_radius::session::EapSession;
use eap_radius::tls::{TlsConfig, TlsDriver, TlsError, TlsProvider, TlsStatus};
use eap_radius::tunnel::{InnerServer, TunnelMethod};
use eap_radius::{Code, EapModule, EapPacket, Method, Rcode};

/// The password every test user authenticates with.
pub const PASSWORD: &[u8] = b"hunter2";

/// The MD5 challenge the test method always issues.
pub const CHALLENGE: [u8; 16] = [
    0xd0, 0x0d, 0x1e, 0x5a, 0x1a, 0xd5, 0x0f, 0xfe, 0xe1, 0x00, 0x2b, 0xad, 0xb0, 0x0b, 0x5c,
    0xa1,
];

/// The name of the inner-tunnel virtual server the fakes know about.
pub const INNER_SERVER: &str = "inner-tunnel";

// ===== EAP-MD5 test method =====

struct Md5State {
    challenge: [u8; 16],
}

/// A minimal EAP-MD5 method: one challenge, one verification.
pub struct Md5Method {
    password: Vec<u8>,
}

impl Md5Method {
    pub fn new(password: &[u8]) -> Self {
        Self {
            password: password.to_vec(),
        }
    }
}

/// The MD5-Challenge response value: MD5(identifier || secret || challenge).
pub fn md5_response_value(identifier: u8, password: &[u8], challenge: &[u8]) -> [u8; 16] {
    let mut hasher = Md5::new();
    hasher.update([identifier]);
    hasher.update(password);
    hasher.update(challenge);
    hasher.finalize().into()
}

impl EapMethod for Md5Method {
    fn name(&self) -> &'static str {
        "eap_md5"
    }

    fn session_init(
        &self,
        _request: &mut Request,
        session: &mut EapSession,
    ) -> Result<(), MethodError> {
        let mut data = vec![CHALLENGE.len() as u8];
        data.extend_from_slice(&CHALLENGE);
        session.compose_request(Method::MD5, data);

        session.opaque = Some(Box::new(Md5State {
            challenge: CHALLENGE,
        }));
        session.set_process(CallbackSlot::Process);
        Ok(())
    }

    fn process(&self, _request: &mut Request, session: &mut EapSession) -> Result<(), MethodError> {
        let state = session
            .opaque
            .as_ref()
            .and_then(|opaque| opaque.downcast_ref::<Md5State>())
            .ok_or_else(|| MethodError::new("no MD5 state"))?;
        let challenge = state.challenge;

        let (identifier, value) = {
            let response = session
                .this_round
                .as_ref()
                .and_then(|round| round.response.as_ref())
                .ok_or_else(|| MethodError::new("no response in round"))?;
            let data = response
                .body()
                .as_ref()
                .map(|body| body.data().clone())
                .unwrap_or_default();
            if data.len() < 17 || usize::from(data[0]) != 16 {
                return Err(MethodError::new("malformed MD5 response"));
            }
            (response.identifier(), data[1..17].to_vec())
        };

        if value == md5_response_value(identifier, &self.password, &challenge) {
            session.compose_success();
        } else {
            session.compose_failure();
        }
        Ok(())
    }
}

// ===== LEAP stub (only the session-lifecycle shape, no crypto) =====

enum LeapStage {
    Challenge,
    Trailer,
}

pub struct LeapStub;

impl EapMethod for LeapStub {
    fn name(&self) -> &'static str {
        "eap_leap"
    }

    fn session_init(
        &self,
        _request: &mut Request,
        session: &mut EapSession,
    ) -> Result<(), MethodError> {
        session.compose_request(Method::LEAP, b"peer-challenge".to_vec());
        session.opaque = Some(Box::new(LeapStage::Challenge));
        session.set_process(CallbackSlot::Process);
        Ok(())
    }

    fn process(&self, _request: &mut Request, session: &mut EapSession) -> Result<(), MethodError> {
        let stage = session
            .opaque
            .as_mut()
            .and_then(|opaque| opaque.downcast_mut::<LeapStage>())
            .ok_or_else(|| MethodError::new("no LEAP state"))?;

        match stage {
            LeapStage::Challenge => {
                *stage = LeapStage::Trailer;
                session.compose_success();
            }
            LeapStage::Trailer => {
                session.compose_response(Method::LEAP, b"ap-response".to_vec());
            }
        }
        Ok(())
    }
}

// ===== scripted TLS driver =====

struct FakeTlsDriver {
    flights_needed: u8,
    flights_seen: u8,
    established: bool,
    resumed: bool,
    outgoing: Vec<u8>,
    tunnel_data: Vec<u8>,
}

impl TlsDriver for FakeTlsDriver {
    fn process(&mut self, message: &[u8]) -> TlsStatus {
        if self.established {
            // "decryption" is a pass-through
            self.tunnel_data = message.to_vec();
            return TlsStatus::RecordRecvComplete;
        }

        self.flights_seen += 1;
        if self.flights_seen >= self.flights_needed {
            self.established = true;
            self.outgoing.extend_from_slice(b"FINISHED");
            TlsStatus::Established
        } else {
            self.outgoing.extend_from_slice(b"SERVERHELLO");
            TlsStatus::Handled
        }
    }

    fn take_outgoing(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.outgoing)
    }

    fn take_tunnel_data(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.tunnel_data)
    }

    fn seal(&mut self, plaintext: &[u8]) -> Result<(), TlsError> {
        self.outgoing.extend_from_slice(plaintext);
        Ok(())
    }

    fn export_keying_material(&self, label: &str, length: usize) -> Result<Vec<u8>, TlsError> {
        Ok(keying_material(label, length))
    }

    fn resumed(&self) -> bool {
        self.resumed
    }
}

/// The deterministic per-label keying material the fake driver exports, so
/// tests can assert on derived keys.
pub fn keying_material(label: &str, length: usize) -> Vec<u8> {
    let label = label.as_bytes();
    (0..length)
        .map(|i| label[i % label.len()] ^ (i as u8))
        .collect()
}

/// Provider whose sessions establish after a fixed number of peer flights.
pub struct FakeTlsProvider {
    pub flights_needed: u8,
    pub resumed: bool,
}

impl TlsProvider for FakeTlsProvider {
    fn new_session(
        &self,
        _conf: &TlsConfig,
        _require_client_cert: bool,
    ) -> Result<Box<dyn TlsDriver>, TlsError> {
        Ok(Box::new(FakeTlsDriver {
            flights_needed: self.flights_needed,
            flights_seen: 0,
            established: false,
            resumed: self.resumed,
            outgoing: Vec::new(),
            tunnel_data: Vec::new(),
        }))
    }
}

// ===== inner virtual server =====

/// How the fake inner server treats the tunneled conversation.
#[derive(Clone, Copy, PartialEq, Eq)]
pub enum InnerMode {
    /// Identity -> MSCHAPv2 challenge -> accept.
    EapConversation,

    /// Proxy the first inner packet to a home server.
    Proxy,

    /// Reject everything.
    Reject,
}

pub struct FakeInnerServer {
    mode: InnerMode,
    /// Virtual server names dispatched to, in order.
    pub calls: Mutex<Vec<String>>,
}

impl FakeInnerServer {
    pub fn new(mode: InnerMode) -> Self {
        Self {
            mode,
            calls: Mutex::new(Vec::new()),
        }
    }
}

impl InnerServer for FakeInnerServer {
    fn has_server(&self, name: &str) -> bool {
        name == INNER_SERVER
    }

    fn process(&self, virtual_server: &str, _auth_type: &str, request: &mut Request) -> Rcode {
        self.calls.lock().unwrap().push(virtual_server.to_owned());

        match self.mode {
            InnerMode::Reject => Rcode::Reject,

            InnerMode::Proxy => {
                request.proxy = Some(Proxy {
                    packet: Packet::new(Some(PacketCode::AccessRequest)),
                    reply: None,
                    home_server: Some(HomeServer {
                        secret: b"homesecret".to_vec(),
                    }),
                });
                Rcode::Updated
            }

            InnerMode::EapConversation => {
                let Ok(inner) = EapPacket::from_fragments(request.packet.vps.eap_fragments())
                else {
                    return Rcode::Invalid;
                };

                match (inner.code(), inner.method()) {
                    (Code::Response, Method::IDENTITY) => {
                        let challenge = EapPacket::request(
                            inner.identifier().wrapping_add(1),
                            Method::MSCHAPV2,
                            vec![0x01],
                        );
                        stage_eap_reply(&mut request.reply, &challenge);
                        request.reply.code = Some(PacketCode::AccessChallenge);
                        Rcode::Handled
                    }
                    (Code::Response, Method::MSCHAPV2) => {
                        request.reply.code = Some(PacketCode::AccessAccept);
                        Rcode::Ok
                    }
                    _ => Rcode::Invalid,
                }
            }
        }
    }
}

// ===== method loader =====

/// Loads the test methods: real tunnel skeleton for PEAP, fakes for the
/// rest.
pub struct TestLoader {
    pub inner: Arc<FakeInnerServer>,
    pub provider: Arc<FakeTlsProvider>,
}

impl TestLoader {
    pub fn new(mode: InnerMode) -> Self {
        Self {
            inner: Arc::new(FakeInnerServer::new(mode)),
            provider: Arc::new(FakeTlsProvider {
                flights_needed: 2,
                resumed: false,
            }),
        }
    }
}

impl MethodLoader for TestLoader {
    fn load(
        &self,
        method: Method,
        cs: &ConfigSection,
    ) -> Result<Arc<dyn EapMethod>, LoadError> {
        match method {
            Method::MD5 => Ok(Arc::new(Md5Method::new(PASSWORD))),
            Method::LEAP => Ok(Arc::new(LeapStub)),
            Method::PEAP => {
                let config = TunnelConfig::parse(cs)?;
                let tunnel = TunnelMethod::peap(
                    config,
                    Arc::new(TlsConfig::new("tls-common")),
                    Arc::clone(&self.provider) as Arc<dyn TlsProvider>,
                    Arc::clone(&self.inner) as Arc<dyn InnerServer>,
                )?;
                Ok(Arc::new(tunnel))
            }
            other => Err(LoadError::NotFound(other.name().to_owned())),
        }
    }
}

/// The standard test module: MD5, PEAP and LEAP registered, MD5 default.
pub fn eap_module(loader: &TestLoader) -> EapModule {
    eap_module_with(loader, ConfigSection::new("eap"))
}

/// A test module built from `base` plus the standard method subsections.
pub fn eap_module_with(loader: &TestLoader, base: ConfigSection) -> EapModule {
    let cs = base
        .with_child(ConfigSection::new("md5"))
        .with_child(ConfigSection::new("leap"))
        .with_child(ConfigSection::new("peap").with_item("virtual_server", INNER_SERVER));

    EapModule::bootstrap(&cs, loader).expect("test module should bootstrap")
}

// ===== request builders and reply inspectors =====

/// An Access-Request carrying the given EAP packet.
pub fn access_request(eap: &EapPacket) -> Request {
    let wire = eap.encode().expect("test packet should encode");

    let mut packet = Packet::new(Some(PacketCode::AccessRequest));
    for chunk in wire.chunks(253) {
        packet
            .vps
            .add(Attribute::octets(VENDOR_NONE, attr::EAP_MESSAGE, chunk));
    }

    let mut request = Request::new(packet);
    request.secret = b"clientsecret".to_vec();
    request.username = Some("bob".to_owned());
    request
}

/// Copies the State attribute of a previous reply into the next request.
pub fn carry_state(request: &mut Request, previous: &Request) {
    let state = reply_state(previous).expect("previous reply should carry State");
    request
        .packet
        .vps
        .add(Attribute::octets(VENDOR_NONE, attr::STATE, state));
}

/// The State attribute staged in a reply.
pub fn reply_state(request: &Request) -> Option<Vec<u8>> {
    request
        .reply
        .vps
        .find(VENDOR_NONE, attr::STATE)
        .and_then(|vp| vp.value.as_octets())
        .map(<[u8]>::to_vec)
}

/// The EAP packet staged in a reply.
pub fn reply_eap_packet(request: &Request) -> EapPacket {
    EapPacket::from_fragments(request.reply.vps.eap_fragments())
        .expect("reply should carry a decodable EAP packet")
}

/// Frames an EAP packet into a reply as EAP-Message fragments.
pub fn stage_eap_reply(reply: &mut Packet, eap: &EapPacket) {
    let wire = eap.encode().expect("test packet should encode");
    for chunk in wire.chunks(253) {
        reply
            .vps
            .add(Attribute::octets(VENDOR_NONE, attr::EAP_MESSAGE, chunk));
    }
}

/// Runs authorize + authenticate for one round, as the policy engine would.
pub fn run_round(module: &EapModule, request: &mut Request) -> (Rcode, Rcode) {
    let authorize = module.authorize(request);
    let authenticate = module.authenticate(request);
    (authorize, authenticate)
}
