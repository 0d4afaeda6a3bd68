//! Tunnelled-method skeleton: a TLS outer conversation carrying an inner
//! EAP exchange (the PEAP/TTLS pattern).
//!
//! The outer handshake is driven by the [`tls`](crate::tls) layer. Once the
//! tunnel is up, decrypted payloads are framed as inner requests and
//! dispatched into a named virtual server through [`InnerServer`]; the inner
//! result decides whether the peer sees another Request, a Success with MPPE
//! keys, or a Failure. An inner server may instead proxy the exchange to a
//! home server, in which case the session suspends and a parked callback
//! finishes the round when the proxied reply arrives.

use std::any::Any;
use std::sync::Arc;

use eap_radius_protocol::{Code, EapPacket, Method, MAX_FRAGMENT_LEN};
use tracing::{debug, error};

use crate::config::TunnelConfig;
use crate::method::{CallbackSlot, EapMethod, MethodError};
use crate::radius::{attr, Attribute, DataKind, Packet, PacketCode, Request, VENDOR_NONE};
use crate::rcode::Rcode;
use crate::registry::LoadError;
use crate::session::EapSession;
use crate::tls::{self, EapTlsSession, TlsConfig, TlsProvider, TlsStatus};

/// Where the inner conversation stands.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TunnelStatus {
    /// The tunnel is unusable; only a Failure can follow.
    Invalid,

    /// Created; the Start request has been sent.
    Start,

    /// The outer handshake is in progress.
    Authentication,

    /// The handshake just finished; nothing has run inside yet.
    TunnelEstablished,

    /// The tunneled Identity request is outstanding.
    InnerIdentity,

    /// The inner identity arrived; the inner conversation is being opened.
    Phase2Init,

    /// The inner method exchange is running.
    Phase2,

    /// The inner conversation concluded.
    Finished,
}

/// Whether the outer TLS session was resumed from a cached one.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Resumption {
    /// Not yet known; decided when the handshake completes.
    Maybe,

    /// Resumed; phase 2 is skipped.
    Yes,

    /// A full handshake was run.
    No,
}

/// Per-session tunnel state, stored in the TLS session's opaque slot.
#[derive(Debug)]
pub struct TunnelState {
    /// Phase of the inner conversation.
    pub status: TunnelStatus,

    /// Session-resumption bookkeeping.
    pub resumption: Resumption,

    /// The identity presented inside the tunnel.
    pub username: Option<String>,

    /// Run a Statement-of-Health exchange before the inner identity round.
    pub soh: bool,

    /// Set while the SoH request is outstanding.
    pub awaiting_soh: bool,

    /// Virtual server receiving the SoH payload.
    pub soh_virtual_server: Option<String>,

    /// Virtual server the inner conversation runs in.
    pub virtual_server: String,

    /// Proxy the inner conversation as EAP rather than decapsulated.
    pub proxy_as_eap: bool,
}

/// The named-virtual-server boundary: the host's policy engine, as seen from
/// inside a tunnel.
pub trait InnerServer: Send + Sync {
    /// Whether a virtual server of that name exists.
    fn has_server(&self, name: &str) -> bool;

    /// Runs an inner-tunnel request through the named virtual server,
    /// routing authentication to the named Auth-Type module.
    fn process(&self, virtual_server: &str, auth_type: &str, request: &mut Request) -> Rcode;
}

/// A tunnel method's continuation, parked on the request while the inner
/// exchange is proxied and invoked by the post-proxy hook.
pub type TunnelCallback =
    Box<dyn FnOnce(&mut EapSession, &mut Request) -> Result<(), MethodError> + Send>;

// EAP expanded header selecting Microsoft's SoH method (vendor 0x137,
// vendor-type 0x21)
const SOH_TYPE_DATA: [u8; 7] = [0x00, 0x01, 0x37, 0x00, 0x00, 0x00, 0x21];

/// The EAP expanded type number.
const EXPANDED: u8 = 254;

/// A tunnelled EAP method instance.
pub struct TunnelMethod {
    name: &'static str,
    method: Method,
    prf_label: &'static str,
    include_length: bool,
    config: TunnelConfig,
    tls_conf: Arc<TlsConfig>,
    provider: Arc<dyn TlsProvider>,
    server: Arc<dyn InnerServer>,
}

impl TunnelMethod {
    /// Instantiates the PEAP flavour. PEAP v0 mandates that first fragments
    /// omit the message length.
    pub fn peap(
        config: TunnelConfig,
        tls_conf: Arc<TlsConfig>,
        provider: Arc<dyn TlsProvider>,
        server: Arc<dyn InnerServer>,
    ) -> Result<Self, LoadError> {
        Self::instantiate(
            "eap_peap",
            Method::PEAP,
            "client EAP encryption",
            false,
            config,
            tls_conf,
            provider,
            server,
        )
    }

    /// Instantiates the TTLS flavour.
    pub fn ttls(
        config: TunnelConfig,
        tls_conf: Arc<TlsConfig>,
        provider: Arc<dyn TlsProvider>,
        server: Arc<dyn InnerServer>,
    ) -> Result<Self, LoadError> {
        Self::instantiate(
            "eap_ttls",
            Method::TTLS,
            "ttls keying material",
            true,
            config,
            tls_conf,
            provider,
            server,
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn instantiate(
        name: &'static str,
        method: Method,
        prf_label: &'static str,
        include_length: bool,
        config: TunnelConfig,
        tls_conf: Arc<TlsConfig>,
        provider: Arc<dyn TlsProvider>,
        server: Arc<dyn InnerServer>,
    ) -> Result<Self, LoadError> {
        if !server.has_server(&config.virtual_server) {
            return Err(LoadError::Instantiate(format!(
                "unknown virtual server '{}'",
                config.virtual_server
            )));
        }

        if let Some(soh_server) = &config.soh_virtual_server {
            if !server.has_server(soh_server) {
                return Err(LoadError::Instantiate(format!(
                    "unknown virtual server '{soh_server}'"
                )));
            }
        }

        Ok(Self {
            name,
            method,
            prf_label,
            include_length,
            config,
            tls_conf,
            provider,
            server,
        })
    }

    /// The method number this instance serves.
    pub fn method(&self) -> Method {
        self.method
    }

    fn tunnel_state(&self) -> TunnelState {
        TunnelState {
            status: TunnelStatus::Start,
            resumption: Resumption::Maybe,
            username: None,
            soh: self.config.soh,
            awaiting_soh: false,
            soh_virtual_server: self.config.soh_virtual_server.clone(),
            virtual_server: self.config.virtual_server.clone(),
            proxy_as_eap: self.config.proxy_tunneled_request_as_eap,
        }
    }

    fn tunnel_mut(ts: &mut EapTlsSession) -> Result<&mut TunnelState, MethodError> {
        ts.opaque
            .as_mut()
            .and_then(|opaque| opaque.downcast_mut::<TunnelState>())
            .ok_or_else(|| MethodError::new("TLS session has no tunnel state"))
    }

    /// The handshake just finished: either skip phase 2 for a resumed
    /// session, or open the inner conversation.
    fn establish(
        &self,
        request: &mut Request,
        session: &mut EapSession,
        ts: &mut EapTlsSession,
    ) -> Result<(), MethodError> {
        let resumed = ts.tls.resumed();
        {
            let tunnel = Self::tunnel_mut(ts)?;
            tunnel.status = TunnelStatus::TunnelEstablished;
            tunnel.resumption = if resumed && tunnel.resumption == Resumption::Maybe {
                Resumption::Yes
            } else {
                Resumption::No
            };
        }

        if resumed {
            debug!("Session resumed, skipping inner authentication");
            Self::tunnel_mut(ts)?.status = TunnelStatus::Finished;
            return tls::success(session, ts, request)
                .map_err(|err| MethodError::new(err.to_string()));
        }

        self.phase2_start(session, ts)
    }

    /// Seals the first inner frame: the SoH request when configured, the
    /// tunneled Identity request otherwise.
    fn phase2_start(
        &self,
        session: &mut EapSession,
        ts: &mut EapTlsSession,
    ) -> Result<(), MethodError> {
        let send_soh = {
            let tunnel = Self::tunnel_mut(ts)?;
            tunnel.soh && !tunnel.awaiting_soh && tunnel.status == TunnelStatus::TunnelEstablished
        };

        let frame = if send_soh {
            debug!("Sending SoH request inside the tunnel");
            Self::tunnel_mut(ts)?.awaiting_soh = true;
            EapPacket::request(0, Method::new(EXPANDED), SOH_TYPE_DATA.to_vec())
        } else {
            debug!("Sending tunneled Identity request");
            Self::tunnel_mut(ts)?.status = TunnelStatus::InnerIdentity;
            EapPacket::request(0, Method::IDENTITY, Vec::new())
        };

        let wire = frame
            .encode()
            .map_err(|err| MethodError::new(err.to_string()))?;
        ts.tls
            .seal(&wire)
            .map_err(|err| MethodError::new(err.to_string()))?;

        tls::request(session, ts);
        Ok(())
    }

    /// A complete inner frame arrived: dispatch it and map the result.
    fn inner_round(
        &self,
        request: &mut Request,
        session: &mut EapSession,
        ts: &mut EapTlsSession,
    ) -> Result<(), MethodError> {
        let data = ts.tls.take_tunnel_data();
        debug!("Session established.  Decoding tunneled data");

        if Self::tunnel_mut(ts)?.awaiting_soh {
            return self.soh_round(session, ts, &data);
        }

        let inner = match EapPacket::decode(&data) {
            Ok(inner) => inner,
            Err(err) => {
                error!("Tunneled data is not a valid EAP packet: {err}");
                tls::fail(session);
                return Err(MethodError::new("malformed tunneled EAP packet"));
            }
        };

        {
            let tunnel = Self::tunnel_mut(ts)?;
            if tunnel.status == TunnelStatus::InnerIdentity
                && inner.code() == Code::Response
                && inner.method() == Method::IDENTITY
            {
                let identity = inner
                    .body()
                    .as_ref()
                    .map(|body| String::from_utf8_lossy(body.data()).into_owned())
                    .unwrap_or_default();
                debug!("Got inner identity '{identity}'");
                tunnel.username = Some(identity);
                tunnel.status = TunnelStatus::Phase2Init;
            }
        }

        let (virtual_server, username) = {
            let tunnel = Self::tunnel_mut(ts)?;
            (tunnel.virtual_server.clone(), tunnel.username.clone())
        };

        let mut inner_request = self.build_inner_request(request, &data, username.as_deref());
        let rcode = self.server.process(
            &virtual_server,
            &self.config.inner_eap_module,
            &mut inner_request,
        );
        debug!("Got tunneled reply rcode {rcode}");

        self.map_inner(rcode, request, session, ts, inner_request)
    }

    /// The peer answered the SoH request: run it through the SoH virtual
    /// server, then open the inner EAP conversation.
    fn soh_round(
        &self,
        session: &mut EapSession,
        ts: &mut EapTlsSession,
        data: &[u8],
    ) -> Result<(), MethodError> {
        let (soh_server, virtual_server) = {
            let tunnel = Self::tunnel_mut(ts)?;
            tunnel.awaiting_soh = false;
            // one SoH exchange per session
            tunnel.soh = false;
            (tunnel.soh_virtual_server.clone(), tunnel.virtual_server.clone())
        };
        let soh_server = soh_server.unwrap_or(virtual_server);

        let mut soh_request = Packet::new(Some(PacketCode::AccessRequest));
        for chunk in data.chunks(MAX_FRAGMENT_LEN) {
            soh_request
                .vps
                .add(Attribute::octets(VENDOR_NONE, attr::EAP_MESSAGE, chunk));
        }
        let mut soh_request = Request::new(soh_request);

        debug!("Dispatching SoH payload to virtual server {soh_server}");
        let rcode = self
            .server
            .process(&soh_server, &self.config.inner_eap_module, &mut soh_request);
        if rcode == Rcode::Reject {
            Self::tunnel_mut(ts)?.status = TunnelStatus::Invalid;
            tls::fail(session);
            return Err(MethodError::new("SoH policy rejected the peer"));
        }

        self.phase2_start(session, ts)
    }

    /// Frames the decrypted payload as an inner-tunnel request.
    fn build_inner_request(
        &self,
        outer: &Request,
        inner_wire: &[u8],
        username: Option<&str>,
    ) -> Request {
        let mut packet = Packet::new(Some(PacketCode::AccessRequest));
        for chunk in inner_wire.chunks(MAX_FRAGMENT_LEN) {
            packet
                .vps
                .add(Attribute::octets(VENDOR_NONE, attr::EAP_MESSAGE, chunk));
        }
        packet.vps.add(Attribute::octets(
            VENDOR_NONE,
            attr::MESSAGE_AUTHENTICATOR,
            vec![0; 16],
        ));
        if let Some(name) = username {
            packet
                .vps
                .add(Attribute::string(VENDOR_NONE, attr::USER_NAME, name));
        }

        let mut inner = Request::new(packet);
        inner.username = username.map(str::to_owned);
        inner.secret = outer.secret.clone();
        inner.parent = Some(Box::new(outer.parent_summary()));
        inner
    }

    fn map_inner(
        &self,
        rcode: Rcode,
        request: &mut Request,
        session: &mut EapSession,
        ts: &mut EapTlsSession,
        mut inner_request: Request,
    ) -> Result<(), MethodError> {
        match rcode {
            Rcode::Reject => {
                Self::tunnel_mut(ts)?.status = TunnelStatus::Invalid;
                tls::fail(session);
                Err(MethodError::new("tunneled authentication was rejected"))
            }

            Rcode::Handled => {
                // re-encrypt the inner reply and keep the peer talking
                let reply_wire: Vec<u8> = inner_request
                    .reply
                    .vps
                    .eap_fragments()
                    .flatten()
                    .copied()
                    .collect();
                if reply_wire.is_empty() {
                    tls::fail(session);
                    return Err(MethodError::new(
                        "inner server handled the request but staged no EAP reply",
                    ));
                }

                ts.tls
                    .seal(&reply_wire)
                    .map_err(|err| MethodError::new(err.to_string()))?;
                {
                    let tunnel = Self::tunnel_mut(ts)?;
                    if tunnel.status == TunnelStatus::Phase2Init {
                        tunnel.status = TunnelStatus::Phase2;
                    }
                }
                tls::request(session, ts);
                Ok(())
            }

            Rcode::Ok => {
                Self::tunnel_mut(ts)?.status = TunnelStatus::Finished;
                tls::success(session, ts, request).map_err(|err| MethodError::new(err.to_string()))
            }

            Rcode::Updated => self.park_proxied(request, session, &mut inner_request),

            other => {
                Self::tunnel_mut(ts)?.status = TunnelStatus::Invalid;
                tls::fail(session);
                Err(MethodError::new(format!(
                    "unexpected rcode {other} from inner virtual server"
                )))
            }
        }
    }

    /// The inner server proxied the exchange: move the proxy sub-request to
    /// the outer request and park the continuation for the post-proxy hook.
    fn park_proxied(
        &self,
        outer: &mut Request,
        session: &mut EapSession,
        inner_request: &mut Request,
    ) -> Result<(), MethodError> {
        let Some(mut proxy) = inner_request.proxy.take() else {
            return Err(MethodError::new(
                "inner server returned updated without a proxy sub-request",
            ));
        };

        if !self.config.proxy_tunneled_request_as_eap {
            // the home server gets the decapsulated inner protocol
            proxy.packet.vps.remove_all(VENDOR_NONE, attr::EAP_MESSAGE);
        }

        outer.proxy = Some(proxy);

        let instance = session.instance();
        outer.data_put(
            instance,
            DataKind::TunnelCallback,
            Box::new(Self::postproxy_callback()),
        );
        outer.data_put(instance, DataKind::SessionProxied, Box::new(true));

        debug!("Tunneled session will be proxied; suspending until the home server replies");
        Ok(())
    }

    /// The continuation run by the post-proxy hook: map the home server's
    /// reply back onto the tunnel.
    fn postproxy_callback() -> TunnelCallback {
        Box::new(|session, request| {
            let Some(opaque) = session.opaque.take() else {
                return Err(MethodError::new("proxied session has no TLS state"));
            };
            let mut ts = match opaque.downcast::<EapTlsSession>() {
                Ok(ts) => ts,
                Err(original) => {
                    session.opaque = Some(original);
                    return Err(MethodError::new("opaque state is not an EAP-TLS session"));
                }
            };

            let reply_code = request
                .proxy
                .as_ref()
                .and_then(|proxy| proxy.reply.as_ref())
                .and_then(|reply| reply.code);

            let result = match reply_code {
                Some(PacketCode::AccessAccept) => {
                    debug!("Home server accepted the tunneled session");
                    if let Ok(tunnel) = Self::tunnel_mut(&mut ts) {
                        tunnel.status = TunnelStatus::Finished;
                    }
                    tls::success(session, &ts, request)
                        .map_err(|err| MethodError::new(err.to_string()))
                }

                Some(PacketCode::AccessChallenge) => {
                    let wire: Vec<u8> = request
                        .proxy
                        .as_ref()
                        .and_then(|proxy| proxy.reply.as_ref())
                        .map(|reply| reply.vps.eap_fragments().flatten().copied().collect())
                        .unwrap_or_default();

                    match ts.tls.seal(&wire) {
                        Ok(()) => {
                            tls::request(session, &mut ts);
                            Ok(())
                        }
                        Err(err) => {
                            tls::fail(session);
                            Err(MethodError::new(err.to_string()))
                        }
                    }
                }

                _ => {
                    debug!("Home server rejected the tunneled session");
                    if let Ok(tunnel) = Self::tunnel_mut(&mut ts) {
                        tunnel.status = TunnelStatus::Invalid;
                    }
                    tls::fail(session);
                    Err(MethodError::new("home server rejected the tunneled session"))
                }
            };

            session.opaque = Some(ts as Box<dyn Any + Send>);
            result
        })
    }
}

impl EapMethod for TunnelMethod {
    fn name(&self) -> &'static str {
        self.name
    }

    fn session_init(
        &self,
        request: &mut Request,
        session: &mut EapSession,
    ) -> Result<(), MethodError> {
        session.tls = true;

        // the per-request control attribute overrides static configuration
        let client_cert = match request
            .control
            .find(VENDOR_NONE, attr::EAP_TLS_REQUIRE_CLIENT_CERT)
            .and_then(|vp| vp.value.as_integer())
        {
            Some(num) => num != 0,
            None => self.config.require_client_cert,
        };

        let driver = self
            .provider
            .new_session(&self.tls_conf, client_cert)
            .map_err(|err| MethodError::new(err.to_string()))?;

        let mut ts = EapTlsSession::new(driver, self.tls_conf.fragment_size);
        ts.prf_label = Some(self.prf_label);
        ts.include_length = self.include_length;
        // version bits of the flag octet; only version 0 is spoken
        ts.base_flags = 0x00;
        ts.opaque = Some(Box::new(self.tunnel_state()));

        tls::start(session, &ts);
        session.opaque = Some(Box::new(ts));
        session.set_process(CallbackSlot::Process);

        Ok(())
    }

    fn process(&self, request: &mut Request, session: &mut EapSession) -> Result<(), MethodError> {
        let Some(opaque) = session.opaque.take() else {
            return Err(MethodError::new("session has no TLS state"));
        };
        let mut opaque = match opaque.downcast::<EapTlsSession>() {
            Ok(opaque) => opaque,
            Err(original) => {
                session.opaque = Some(original);
                return Err(MethodError::new("opaque state is not an EAP-TLS session"));
            }
        };
        let ts = opaque.as_mut();

        // a resumed session may arrive without tunnel data
        if ts.opaque.is_none() {
            ts.opaque = Some(Box::new(self.tunnel_state()));
        }
        if let Ok(tunnel) = Self::tunnel_mut(ts) {
            if tunnel.status == TunnelStatus::Start {
                tunnel.status = TunnelStatus::Authentication;
            }
        }

        let status = tls::process(session, ts);

        let result = match status {
            TlsStatus::Handled => Ok(()),
            TlsStatus::Established => self.establish(request, session, ts),
            TlsStatus::RecordRecvComplete => self.inner_round(request, session, ts),
            TlsStatus::Invalid | TlsStatus::Fail => {
                error!("[eap-tls process] = {status}");
                Err(MethodError::new("TLS exchange failed"))
            }
        };

        session.opaque = Some(opaque);
        result
    }
}
