//! The TLS library boundary and the EAP-TLS record layer.
//!
//! The TLS implementation itself lives behind [`TlsDriver`]; this module
//! owns everything EAP-specific about carrying TLS: the flag octet, ACKs,
//! fragmentation of outgoing flights, reassembly of incoming ones, and the
//! derivation of MPPE key material from the finished handshake.

use std::any::Any;
use std::fmt;

use byteorder::{ByteOrder, NetworkEndian};
use eap_radius_protocol::{Code, TlsFlags};
use thiserror::Error;
use tracing::debug;

use crate::radius::{attr, Attribute, Request, VENDOR_MICROSOFT};
use crate::session::EapSession;

/// Outcome of feeding one peer flight through the TLS layer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TlsStatus {
    /// The peer packet was not usable.
    Invalid,

    /// The TLS exchange needs more flights; a reply has been composed and
    /// the session continues unchanged.
    Handled,

    /// The handshake just completed.
    Established,

    /// A complete application record arrived; its cleartext is ready in the
    /// driver.
    RecordRecvComplete,

    /// The TLS exchange failed.
    Fail,
}

impl fmt::Display for TlsStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}",
            match self {
                Self::Invalid => "invalid",
                Self::Handled => "handled",
                Self::Established => "established",
                Self::RecordRecvComplete => "record recv complete",
                Self::Fail => "fail",
            }
        )
    }
}

/// An error at the TLS library boundary.
#[non_exhaustive]
#[derive(Debug, Error)]
pub enum TlsError {
    /// A TLS session could not be created.
    #[error("failed initializing TLS session: {0}")]
    SessionInit(String),

    /// Application data could not be encrypted.
    #[error("failed encrypting application data: {0}")]
    Seal(String),

    /// Keying material could not be exported.
    #[error("failed exporting keying material")]
    KeyExport,
}

/// A server-side TLS session, as provided by the TLS library.
///
/// Records are processed synchronously against buffers; the driver never
/// touches the network.
pub trait TlsDriver: Send {
    /// Consumes one reassembled TLS message from the peer, advancing the
    /// handshake or decrypting application data.
    fn process(&mut self, message: &[u8]) -> TlsStatus;

    /// Drains the records queued to be sent to the peer.
    fn take_outgoing(&mut self) -> Vec<u8>;

    /// Takes the cleartext of the application record that completed with
    /// [`TlsStatus::RecordRecvComplete`].
    fn take_tunnel_data(&mut self) -> Vec<u8>;

    /// Encrypts application data into the outgoing record queue.
    fn seal(&mut self, plaintext: &[u8]) -> Result<(), TlsError>;

    /// Exports keying material from the established session under the given
    /// label (RFC 5705).
    fn export_keying_material(&self, label: &str, length: usize) -> Result<Vec<u8>, TlsError>;

    /// Whether the established session was resumed from a cached one.
    fn resumed(&self) -> bool;
}

/// Creates TLS sessions from the shared TLS configuration.
pub trait TlsProvider: Send + Sync {
    /// Opens a fresh server-side session.
    fn new_session(
        &self,
        conf: &TlsConfig,
        require_client_cert: bool,
    ) -> Result<Box<dyn TlsDriver>, TlsError>;
}

/// The shared `tls` configuration subsection. Certificates, ciphers and the
/// rest belong to the TLS library; this core only carries the settings it
/// has to act on itself.
#[derive(Clone, Debug)]
pub struct TlsConfig {
    /// Name of this configuration, referenced by methods' `tls` items.
    pub name: String,

    /// Demand a client certificate unless a per-request control attribute
    /// overrides it.
    pub require_client_cert: bool,

    /// Largest TLS payload carried in a single EAP packet.
    pub fragment_size: usize,
}

impl TlsConfig {
    /// Default number of TLS octets per EAP packet.
    pub const DEFAULT_FRAGMENT_SIZE: usize = 1024;

    /// A named configuration with defaults.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            require_client_cert: false,
            fragment_size: Self::DEFAULT_FRAGMENT_SIZE,
        }
    }
}

/// Per-session EAP-TLS state: the driver plus the record-layer bookkeeping
/// shared by every TLS-based method.
pub struct EapTlsSession {
    /// The TLS session itself.
    pub tls: Box<dyn TlsDriver>,

    /// Include the four-octet message length in first fragments. PEAP v0
    /// requires this off.
    pub include_length: bool,

    /// Bits ORed into every flag octet sent; PEAP carries its version here.
    pub base_flags: u8,

    /// Label for keying material export when composing Success.
    pub prf_label: Option<&'static str>,

    /// Tunnel state of the method running inside the TLS session.
    pub opaque: Option<Box<dyn Any + Send>>,

    fragment_size: usize,
    assembly: Vec<u8>,
    outgoing: Vec<u8>,
    sent: usize,
}

impl EapTlsSession {
    /// Wraps a fresh driver.
    pub fn new(tls: Box<dyn TlsDriver>, fragment_size: usize) -> Self {
        Self {
            tls,
            include_length: true,
            base_flags: 0,
            prf_label: None,
            opaque: None,
            fragment_size,
            assembly: Vec::new(),
            outgoing: Vec::new(),
            sent: 0,
        }
    }

    fn has_pending_fragments(&self) -> bool {
        self.sent < self.outgoing.len()
    }
}

/// Composes the EAP-TLS Start request that opens the handshake.
pub fn start(session: &mut EapSession, ts: &EapTlsSession) {
    let method = session.method();
    session.compose_request(method, vec![TlsFlags::START.bits() | ts.base_flags]);
}

/// Composes a Failure to the peer.
pub fn fail(session: &mut EapSession) {
    session.compose_failure();
}

/// Composes the next EAP-TLS request: whatever the driver has queued, or the
/// next fragment of a flight already being sent.
pub fn request(session: &mut EapSession, ts: &mut EapTlsSession) {
    ts.outgoing.extend(ts.tls.take_outgoing());

    let total = ts.outgoing.len();
    let first = ts.sent == 0;
    let chunk_len = (total - ts.sent).min(ts.fragment_size);
    let chunk = &ts.outgoing[ts.sent..ts.sent + chunk_len];

    let mut flags = TlsFlags::empty();
    if ts.sent + chunk_len < total {
        flags |= TlsFlags::MORE_FRAGMENTS;
    }
    if first && ts.include_length {
        flags |= TlsFlags::LENGTH_INCLUDED;
    }

    let mut data = Vec::with_capacity(1 + 4 + chunk_len);
    data.push(flags.bits() | ts.base_flags);
    if flags.contains(TlsFlags::LENGTH_INCLUDED) {
        let mut length_field = [0; 4];
        NetworkEndian::write_u32(&mut length_field, total as u32);
        data.extend_from_slice(&length_field);
    }
    data.extend_from_slice(chunk);

    if flags.contains(TlsFlags::MORE_FRAGMENTS) {
        ts.sent += chunk_len;
    } else {
        ts.outgoing.clear();
        ts.sent = 0;
    }

    let method = session.method();
    session.compose_request(method, data);
}

/// Composes a Success and hands the authenticator its MPPE keys, derived
/// from the exported keying material: the first 32 octets become
/// MS-MPPE-Recv-Key, the second 32 MS-MPPE-Send-Key.
pub fn success(
    session: &mut EapSession,
    ts: &EapTlsSession,
    request: &mut Request,
) -> Result<(), TlsError> {
    if let Some(label) = ts.prf_label {
        let keys = ts.tls.export_keying_material(label, 64)?;

        request.reply.vps.add(Attribute::octets(
            VENDOR_MICROSOFT,
            attr::MS_MPPE_RECV_KEY,
            &keys[..32],
        ));
        request.reply.vps.add(Attribute::octets(
            VENDOR_MICROSOFT,
            attr::MS_MPPE_SEND_KEY,
            &keys[32..64],
        ));
    }

    session.compose_success();
    Ok(())
}

/// Drives one round of the TLS exchange from the peer response in the
/// session's current round.
pub fn process(session: &mut EapSession, ts: &mut EapTlsSession) -> TlsStatus {
    let Some(response) = session
        .this_round
        .as_ref()
        .and_then(|round| round.response.as_ref())
    else {
        return TlsStatus::Invalid;
    };

    if response.code() != Code::Response || response.method() != session.method() {
        debug!(
            "Peer sent {} {}, expected a response for the running TLS method",
            response.code(),
            response.method()
        );
        return TlsStatus::Invalid;
    }

    let Some(data) = response.body().as_ref().map(|body| body.data().as_slice()) else {
        return TlsStatus::Invalid;
    };
    if data.is_empty() {
        debug!("Peer sent a TLS packet with no flag octet");
        return TlsStatus::Invalid;
    }

    let (flags, _version) = TlsFlags::split(data[0]);
    let mut payload = &data[1..];

    if flags.contains(TlsFlags::START) {
        debug!("Peer sent an unexpected EAP-TLS Start");
        return TlsStatus::Invalid;
    }

    if flags.contains(TlsFlags::LENGTH_INCLUDED) {
        // the declared total is advisory; reassembly counts actual octets
        if payload.len() < 4 {
            return TlsStatus::Invalid;
        }
        payload = &payload[4..];
    }

    if flags.contains(TlsFlags::MORE_FRAGMENTS) {
        ts.assembly.extend_from_slice(payload);
        debug!(
            "Got TLS fragment, ACKing ({} octets buffered)",
            ts.assembly.len()
        );

        let method = session.method();
        session.compose_request(method, vec![ts.base_flags]);
        return TlsStatus::Handled;
    }

    if payload.is_empty() && ts.assembly.is_empty() {
        // a bare ACK: the peer wants the next fragment of our flight
        if ts.has_pending_fragments() {
            request(session, ts);
            return TlsStatus::Handled;
        }

        debug!("Peer ACKed, but there is nothing left to send");
        return TlsStatus::Invalid;
    }

    let message = if ts.assembly.is_empty() {
        payload.to_vec()
    } else {
        let mut message = std::mem::take(&mut ts.assembly);
        message.extend_from_slice(payload);
        message
    };

    let status = ts.tls.process(&message);
    debug!("[eap-tls process] = {status}");

    if status == TlsStatus::Handled {
        request(session, ts);
    }

    status
}
