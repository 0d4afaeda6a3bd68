//! # eap-radius
//!
//! The EAP ([RFC3748](https://www.rfc-editor.org/rfc/rfc3748)) dispatch and
//! session-management core of a RADIUS authentication server.
//!
//! The RADIUS host hands each decoded Access-Request to the four hooks of
//! an [`EapModule`]: `authorize` answers EAP-Start and routes EAP traffic
//! here, `authenticate` runs one round of the per-peer conversation,
//! `post_proxy` resumes proxied tunnel sessions and rewraps LEAP session
//! keys, and `post_auth` turns upstream rejections into proper EAP-Failure
//! packets. Between rounds sessions are frozen into a correlator-keyed
//! [`store`] under the RADIUS `State` attribute.
//!
//! EAP methods themselves are pluggable: the [`registry`] loads one handler
//! per configured type, and the [`tunnel`] module provides the TLS-wrapped
//! skeleton (PEAP/TTLS) that carries an inner EAP conversation into a named
//! virtual server.
//!
//! Packet de/serialization lives in the re-exported
//! [`protocol`](eap_radius_protocol) crate.

#![warn(missing_docs)]

pub mod config;
pub mod dispatch;
pub mod method;
pub mod radius;
pub mod rcode;
pub mod registry;
pub mod session;
pub mod store;
pub mod tls;
pub mod tunnel;

pub use dispatch::EapModule;
pub use rcode::Rcode;

// reexported for ease of access
pub use eap_radius_protocol as protocol;
pub use eap_radius_protocol::{Code, EapPacket, Method};
