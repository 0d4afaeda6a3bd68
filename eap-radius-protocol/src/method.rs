//! EAP method numbers and name translation.

use core::fmt;

/// A numeric EAP method type, as carried in the type octet of Request and
/// Response packets.
///
/// Numbers 1-3 are the meta-types of [RFC3748 section 5]; real
/// authentication methods start at [`Method::MD5`]. The dictionary below
/// covers the methods a RADIUS server is commonly configured with; any other
/// number in range is representable but prints as `unknown`.
///
/// [RFC3748 section 5]: https://www.rfc-editor.org/rfc/rfc3748#section-5
#[repr(transparent)]
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct Method(u8);

impl Method {
    /// Sentinel for "no method selected".
    pub const INVALID: Self = Self(0);

    /// Identity exchange.
    pub const IDENTITY: Self = Self(1);

    /// Notification (display message to the peer).
    pub const NOTIFICATION: Self = Self(2);

    /// Legacy NAK, a peer's proposal of alternate methods.
    pub const NAK: Self = Self(3);

    /// MD5-Challenge.
    pub const MD5: Self = Self(4);

    /// One-Time Password.
    pub const OTP: Self = Self(5);

    /// Generic Token Card.
    pub const GTC: Self = Self(6);

    /// EAP-TLS (RFC 5216).
    pub const TLS: Self = Self(13);

    /// Cisco LEAP.
    pub const LEAP: Self = Self(17);

    /// EAP-SIM (RFC 4186).
    pub const SIM: Self = Self(18);

    /// EAP-TTLS (RFC 5281).
    pub const TTLS: Self = Self(21);

    /// EAP-AKA (RFC 4187).
    pub const AKA: Self = Self(23);

    /// PEAP.
    pub const PEAP: Self = Self(25);

    /// EAP-MSCHAPv2.
    pub const MSCHAPV2: Self = Self(26);

    /// EAP-FAST (RFC 4851).
    pub const FAST: Self = Self(43);

    /// EAP-PWD (RFC 5931).
    pub const PWD: Self = Self(52);

    /// Exclusive upper bound of the method numbers this core will dispatch.
    pub const MAX: u8 = 53;

    /// Wraps a raw method number.
    pub const fn new(num: u8) -> Self {
        Self(num)
    }

    /// The raw method number.
    pub const fn num(self) -> u8 {
        self.0
    }

    /// Whether this number names a real authentication method, i.e. is
    /// neither a meta-type (Identity/Notification/NAK) nor out of range.
    pub const fn is_authentication(self) -> bool {
        self.0 >= Self::MD5.0 && self.0 < Self::MAX
    }

    /// Looks a method up by its configuration name.
    pub fn from_name(name: &str) -> Option<Self> {
        let method = match name {
            "identity" => Self::IDENTITY,
            "notification" => Self::NOTIFICATION,
            "nak" => Self::NAK,
            "md5" => Self::MD5,
            "otp" => Self::OTP,
            "gtc" => Self::GTC,
            "tls" => Self::TLS,
            "leap" => Self::LEAP,
            "sim" => Self::SIM,
            "ttls" => Self::TTLS,
            "aka" => Self::AKA,
            "peap" => Self::PEAP,
            "mschapv2" => Self::MSCHAPV2,
            "fast" => Self::FAST,
            "pwd" => Self::PWD,
            _ => return None,
        };

        Some(method)
    }

    /// The configuration name of this method, or `"unknown"`.
    pub const fn name(self) -> &'static str {
        match self.0 {
            1 => "identity",
            2 => "notification",
            3 => "nak",
            4 => "md5",
            5 => "otp",
            6 => "gtc",
            13 => "tls",
            17 => "leap",
            18 => "sim",
            21 => "ttls",
            23 => "aka",
            25 => "peap",
            26 => "mschapv2",
            43 => "fast",
            52 => "pwd",
            _ => "unknown",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name(), self.0)
    }
}

impl From<u8> for Method {
    fn from(num: u8) -> Self {
        Self(num)
    }
}
