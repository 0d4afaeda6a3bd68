//! The flag octet shared by the TLS-based EAP methods.

use bitflags::bitflags;

/// Mask of the version bits in the flag octet.
///
/// PEAP abuses the low bits of the flag octet to carry its protocol version;
/// plain EAP-TLS keeps them zero.
pub const TLS_VERSION_MASK: u8 = 0b0000_0111;

/// Flag bits of the EAP-TLS flag octet ([RFC5216 section 4.1]).
///
/// [RFC5216 section 4.1]: https://www.rfc-editor.org/rfc/rfc5216#section-4.1
#[repr(transparent)]
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub struct TlsFlags(u8);

bitflags! {
    impl TlsFlags: u8 {
        /// The four-octet TLS message length field follows the flag octet.
        const LENGTH_INCLUDED = 0b1000_0000;

        /// More fragments of this TLS message follow in later packets.
        const MORE_FRAGMENTS  = 0b0100_0000;

        /// EAP-TLS Start: the authenticator's invitation to begin the
        /// handshake; carries no TLS data.
        const START           = 0b0010_0000;
    }
}

impl TlsFlags {
    /// Splits a raw flag octet into its flag bits and version bits.
    pub fn split(octet: u8) -> (Self, u8) {
        (
            Self::from_bits_truncate(octet),
            octet & TLS_VERSION_MASK,
        )
    }
}

impl core::fmt::Display for TlsFlags {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        if self.is_empty() {
            return write!(f, "none");
        }

        let mut names = self.iter_names().peekable();
        while let Some((name, _)) = names.next() {
            if names.peek().is_some() {
                write!(f, "{name} ")?;
            } else {
                write!(f, "{name}")?;
            }
        }

        Ok(())
    }
}
