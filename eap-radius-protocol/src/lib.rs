//! # eap-radius-protocol
//!
//! EAP ([RFC3748](https://www.rfc-editor.org/rfc/rfc3748)) packet
//! de/serialization, as carried inside RADIUS EAP-Message attributes
//! ([RFC3579](https://www.rfc-editor.org/rfc/rfc3579)).
//!
//! This crate only knows about the EAP wire format: the four-octet packet
//! header, the optional type octet, fragment reassembly, the NAK payload,
//! and the flag octet shared by the TLS-based methods. Session handling and
//! method dispatch live in the `eap-radius` crate.

#![no_std]
#![cfg_attr(feature = "docsrs", feature(doc_auto_cfg))]
#![warn(missing_docs)]
#![warn(clippy::cast_lossless)]
#![warn(clippy::cast_possible_truncation)]

extern crate alloc;

#[cfg(feature = "std")]
extern crate std;

use core::fmt;

mod method;
pub use method::Method;

mod packet;
pub use packet::{Code, EapPacket, TypeData, HEADER_LEN, MAX_FRAGMENT_LEN};

mod nak;
pub use nak::NakData;

mod tls;
pub use tls::{TlsFlags, TLS_VERSION_MASK};

/// An error that occurred when deserializing an EAP packet.
#[non_exhaustive]
#[derive(Debug, PartialEq, Eq)]
pub enum DecodeError {
    /// No EAP-Message fragments were supplied at all.
    NoFragments,

    /// The reassembled buffer was shorter than an EAP packet header.
    Truncated {
        /// Number of octets actually available.
        actual: usize,
    },

    /// Invalid code octet.
    InvalidCode(u8),

    /// The header's length field was smaller than the header itself.
    RuntLength(u16),

    /// The header's length field claimed more octets than were supplied.
    LengthMismatch {
        /// Length declared in the packet header.
        declared: u16,
        /// Number of octets actually available.
        actual: usize,
    },

    /// A Request or Response packet did not include a type octet.
    MissingType,
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoFragments => write!(f, "no EAP-Message fragments in attribute list"),
            Self::Truncated { actual } => write!(
                f,
                "buffer of {actual} octets is too short for an EAP header"
            ),
            Self::InvalidCode(code) => write!(f, "invalid EAP code octet: {code:#x}"),
            Self::RuntLength(length) => {
                write!(f, "declared length {length} is shorter than the EAP header")
            }
            Self::LengthMismatch { declared, actual } => write!(
                f,
                "declared length {declared} exceeds the {actual} octets supplied"
            ),
            Self::MissingType => write!(f, "Request/Response packet has no type octet"),
        }
    }
}

/// An error that occurred when serializing an EAP packet.
#[non_exhaustive]
#[derive(Debug, PartialEq, Eq)]
pub enum EncodeError {
    /// The packet would not fit the sixteen-bit length field.
    DataTooLong {
        /// The packet length that overflowed the field.
        length: usize,
    },
}

impl fmt::Display for EncodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DataTooLong { length } => write!(
                f,
                "packet of {length} octets does not fit the 16-bit EAP length field"
            ),
        }
    }
}

// Error trait is only available on std (on stable) so this has to be std-gated
#[cfg(feature = "std")]
mod error_impls {
    use std::error::Error;

    impl Error for super::DecodeError {}
    impl Error for super::EncodeError {}
}
