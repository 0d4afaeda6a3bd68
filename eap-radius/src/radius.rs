//! Boundary types for the RADIUS host.
//!
//! This core does not parse RADIUS packets or compose wire replies; the host
//! hands each hook a decoded [`Request`] and consumes the attribute lists the
//! hooks leave behind. The types here are that contract: attributes looked up
//! by `(vendor, attribute)` pair, the request with its packet/reply/control
//! lists, and the per-request data store used to park session handles and
//! tunnel callbacks between hooks.

use std::any::Any;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

pub mod tunnel_password;

/// Vendor number of attributes from the base RADIUS dictionary.
pub const VENDOR_NONE: u32 = 0;

/// Cisco's enterprise number.
pub const VENDOR_CISCO: u32 = 9;

/// Microsoft's enterprise number.
pub const VENDOR_MICROSOFT: u32 = 311;

/// Attribute numbers this core reads or writes.
///
/// Wire attributes use their IANA numbers. Control attributes are internal
/// to the server and never appear on the wire; they live in a reserved range
/// starting at 1000, matching the host's dictionary.
pub mod attr {
    /// User-Name (RFC 2865).
    pub const USER_NAME: u32 = 1;

    /// State, the session correlator (RFC 2865).
    pub const STATE: u32 = 24;

    /// EAP-Message (RFC 3579).
    pub const EAP_MESSAGE: u32 = 79;

    /// Message-Authenticator (RFC 3579).
    pub const MESSAGE_AUTHENTICATOR: u32 = 80;

    /// Cisco-AVPair, under [`VENDOR_CISCO`](super::VENDOR_CISCO).
    pub const CISCO_AVPAIR: u32 = 1;

    /// MS-MPPE-Send-Key, under [`VENDOR_MICROSOFT`](super::VENDOR_MICROSOFT).
    pub const MS_MPPE_SEND_KEY: u32 = 16;

    /// MS-MPPE-Recv-Key, under [`VENDOR_MICROSOFT`](super::VENDOR_MICROSOFT).
    pub const MS_MPPE_RECV_KEY: u32 = 17;

    /// Auth-Type: routes the request to a module's authenticate hook.
    pub const AUTH_TYPE: u32 = 1000;

    /// Post-Auth-Type: selects the post-auth policy section.
    pub const POST_AUTH_TYPE: u32 = 1001;

    /// EAP-Type: administrator's per-user pin of the EAP method.
    pub const EAP_TYPE: u32 = 1002;

    /// EAP-TLS-Require-Client-Cert: per-user client-certificate override.
    pub const EAP_TLS_REQUIRE_CLIENT_CERT: u32 = 1003;
}

/// The `Auth-Type` / `Post-Auth-Type` value naming the reject policy.
pub const AUTH_TYPE_REJECT: &str = "Reject";

/// A decoded attribute value.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Value {
    /// Raw octets.
    Octets(Vec<u8>),

    /// Printable text.
    String(String),

    /// A 32-bit integer.
    Integer(u32),
}

impl Value {
    /// The value as raw octets; text values expose their bytes.
    pub fn as_octets(&self) -> Option<&[u8]> {
        match self {
            Self::Octets(octets) => Some(octets),
            Self::String(text) => Some(text.as_bytes()),
            Self::Integer(_) => None,
        }
    }

    /// The value as text.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(text) => Some(text),
            _ => None,
        }
    }

    /// The value as an integer.
    pub fn as_integer(&self) -> Option<u32> {
        match self {
            Self::Integer(num) => Some(*num),
            _ => None,
        }
    }
}

/// A single attribute-value pair.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Attribute {
    /// Vendor number, [`VENDOR_NONE`] for base dictionary attributes.
    pub vendor: u32,

    /// Attribute number within the vendor's dictionary.
    pub attr: u32,

    /// The decoded value.
    pub value: Value,
}

impl Attribute {
    /// Builds an octet-valued attribute.
    pub fn octets(vendor: u32, attr: u32, value: impl Into<Vec<u8>>) -> Self {
        Self {
            vendor,
            attr,
            value: Value::Octets(value.into()),
        }
    }

    /// Builds a text-valued attribute.
    pub fn string(vendor: u32, attr: u32, value: impl Into<String>) -> Self {
        Self {
            vendor,
            attr,
            value: Value::String(value.into()),
        }
    }

    /// Builds an integer-valued attribute.
    pub fn integer(vendor: u32, attr: u32, value: u32) -> Self {
        Self {
            vendor,
            attr,
            value: Value::Integer(value),
        }
    }
}

/// An ordered attribute list.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct List(Vec<Attribute>);

impl List {
    /// An empty list.
    pub fn new() -> Self {
        Self::default()
    }

    /// The first attribute matching `(vendor, attr)`.
    pub fn find(&self, vendor: u32, attr: u32) -> Option<&Attribute> {
        self.0
            .iter()
            .find(|vp| vp.vendor == vendor && vp.attr == attr)
    }

    /// Mutable variant of [`find`](Self::find).
    pub fn find_mut(&mut self, vendor: u32, attr: u32) -> Option<&mut Attribute> {
        self.0
            .iter_mut()
            .find(|vp| vp.vendor == vendor && vp.attr == attr)
    }

    /// All attributes matching `(vendor, attr)`, in list order.
    pub fn find_all(&self, vendor: u32, attr: u32) -> impl Iterator<Item = &Attribute> {
        self.0
            .iter()
            .filter(move |vp| vp.vendor == vendor && vp.attr == attr)
    }

    /// Whether any attribute matches `(vendor, attr)`.
    pub fn contains(&self, vendor: u32, attr: u32) -> bool {
        self.find(vendor, attr).is_some()
    }

    /// Appends an attribute.
    pub fn add(&mut self, attribute: Attribute) {
        self.0.push(attribute);
    }

    /// Removes every attribute matching `(vendor, attr)`.
    pub fn remove_all(&mut self, vendor: u32, attr: u32) {
        self.0.retain(|vp| vp.vendor != vendor || vp.attr != attr);
    }

    /// Iterates over all attributes in list order.
    pub fn iter(&self) -> impl Iterator<Item = &Attribute> {
        self.0.iter()
    }

    /// Mutable variant of [`iter`](Self::iter).
    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Attribute> {
        self.0.iter_mut()
    }

    /// The concatenation-ready EAP-Message fragment values, in list order.
    pub fn eap_fragments(&self) -> impl Iterator<Item = &[u8]> {
        self.find_all(VENDOR_NONE, attr::EAP_MESSAGE)
            .filter_map(|vp| vp.value.as_octets())
    }
}

/// RADIUS packet codes this core touches.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PacketCode {
    /// Access-Request.
    AccessRequest,

    /// Access-Accept.
    AccessAccept,

    /// Access-Reject.
    AccessReject,

    /// Access-Challenge.
    AccessChallenge,
}

/// A decoded RADIUS packet: its code, attribute list, and authenticator.
#[derive(Clone, Debug)]
pub struct Packet {
    /// The packet code; `None` until a module decides the reply.
    pub code: Option<PacketCode>,

    /// The attribute list.
    pub vps: List,

    /// The request/response authenticator vector.
    pub vector: [u8; 16],
}

impl Packet {
    /// An empty packet with the given code.
    pub fn new(code: Option<PacketCode>) -> Self {
        Self {
            code,
            vps: List::new(),
            vector: [0; 16],
        }
    }
}

/// The home server a request was proxied to.
#[derive(Clone, Debug)]
pub struct HomeServer {
    /// Shared secret with the home server.
    pub secret: Vec<u8>,
}

/// A proxy sub-request attached to a request being forwarded.
#[derive(Debug)]
pub struct Proxy {
    /// The packet sent to the home server.
    pub packet: Packet,

    /// The home server's reply, once received.
    pub reply: Option<Packet>,

    /// The home server the request was sent to.
    pub home_server: Option<HomeServer>,
}

/// What a tunnel method records about the request it spawns an inner request
/// from, so nesting checks can walk the chain without holding borrows across
/// requests.
#[derive(Clone, Debug)]
pub struct ParentSummary {
    /// Whether the parent request was bound to a home server.
    pub home_server: bool,

    /// The parent's own parent, when the parent was itself an inner-tunnel
    /// request.
    pub parent: Option<Box<ParentSummary>>,
}

/// Opaque identity of a module instance, used to key per-request data.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct InstanceId(u64);

impl InstanceId {
    /// Allocates a process-unique instance id.
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

/// The kinds of data a module parks on a request between hooks.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum DataKind {
    /// A suspended [`EapSession`](crate::session::EapSession) awaiting a
    /// proxied reply.
    Session,

    /// Marker that the EAP conversation on this request was proxied.
    SessionProxied,

    /// A tunnel method's post-proxy callback.
    TunnelCallback,
}

/// One round's worth of host-side request state, as handed to each hook.
pub struct Request {
    /// The Access-Request from the NAS.
    pub packet: Packet,

    /// The reply under construction.
    pub reply: Packet,

    /// Server-internal control attributes for this request.
    pub control: List,

    /// The proxy sub-request, when this request is being forwarded.
    pub proxy: Option<Proxy>,

    /// The authenticating user's name, once known.
    pub username: Option<String>,

    /// Shared secret with the NAS the request came from.
    pub secret: Vec<u8>,

    /// Name of the module currently processing the request (log tag).
    pub module: Option<String>,

    /// Whether this request itself arrived bound to a home server.
    pub home_server: bool,

    /// Summary of the enclosing request, for inner-tunnel requests.
    pub parent: Option<Box<ParentSummary>>,

    data: Vec<((InstanceId, DataKind), Box<dyn Any + Send>)>,
}

impl Request {
    /// A fresh request around a decoded Access-Request packet.
    pub fn new(packet: Packet) -> Self {
        Self {
            packet,
            reply: Packet::new(None),
            control: List::new(),
            proxy: None,
            username: None,
            secret: Vec::new(),
            module: None,
            home_server: false,
            parent: None,
            data: Vec::new(),
        }
    }

    /// The parent summary an inner request spawned from this one should carry.
    pub fn parent_summary(&self) -> ParentSummary {
        ParentSummary {
            home_server: self.home_server,
            parent: self.parent.clone(),
        }
    }

    /// Parks a value on the request under `(instance, kind)`.
    ///
    /// A later put under the same key replaces the earlier value.
    pub fn data_put(&mut self, instance: InstanceId, kind: DataKind, value: Box<dyn Any + Send>) {
        self.data_take_raw(instance, kind);
        self.data.push(((instance, kind), value));
    }

    /// Removes and returns the value parked under `(instance, kind)`.
    pub fn data_take<T: Any>(&mut self, instance: InstanceId, kind: DataKind) -> Option<Box<T>> {
        let raw = self.data_take_raw(instance, kind)?;
        raw.downcast().ok()
    }

    /// Whether a value is parked under `(instance, kind)`.
    pub fn data_contains(&self, instance: InstanceId, kind: DataKind) -> bool {
        self.data.iter().any(|(key, _)| *key == (instance, kind))
    }

    fn data_take_raw(
        &mut self,
        instance: InstanceId,
        kind: DataKind,
    ) -> Option<Box<dyn Any + Send>> {
        let index = self
            .data
            .iter()
            .position(|(key, _)| *key == (instance, kind))?;
        Some(self.data.remove(index).1)
    }
}

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Request")
            .field("packet", &self.packet)
            .field("reply", &self.reply)
            .field("control", &self.control)
            .field("username", &self.username)
            .field("module", &self.module)
            .field("home_server", &self.home_server)
            .finish_non_exhaustive()
    }
}
