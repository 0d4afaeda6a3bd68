//! EAP packet <-> binary format conversions.

use alloc::vec::Vec;

use byteorder::{ByteOrder, NetworkEndian};
use getset::{CopyGetters, Getters};
use num_enum::{TryFromPrimitive, TryFromPrimitiveError};

use crate::method::Method;
use crate::{DecodeError, EncodeError};

#[cfg(test)]
mod tests;

/// Length of the fixed EAP packet header: code, identifier, two length octets.
pub const HEADER_LEN: usize = 4;

/// Largest payload of a single EAP-Message attribute; a RADIUS attribute
/// value holds at most 253 octets ([RFC3579 section 3.1]).
///
/// [RFC3579 section 3.1]: https://www.rfc-editor.org/rfc/rfc3579#section-3.1
pub const MAX_FRAGMENT_LEN: usize = 253;

/// The code octet of an EAP packet ([RFC3748 section 4]).
///
/// [RFC3748 section 4]: https://www.rfc-editor.org/rfc/rfc3748#section-4
#[repr(u8)]
#[derive(Debug, PartialEq, Eq, Clone, Copy, Hash, TryFromPrimitive)]
pub enum Code {
    /// Request, sent by the authenticator.
    Request = 1,

    /// Response, sent by the peer.
    Response = 2,

    /// Success; terminates the conversation.
    Success = 3,

    /// Failure; terminates the conversation.
    Failure = 4,
}

impl Code {
    /// Whether packets of this code carry a type octet and type data.
    pub const fn carries_data(self) -> bool {
        matches!(self, Self::Request | Self::Response)
    }
}

impl core::fmt::Display for Code {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(
            f,
            "{}",
            match self {
                Self::Request => "Request",
                Self::Response => "Response",
                Self::Success => "Success",
                Self::Failure => "Failure",
            }
        )
    }
}

#[doc(hidden)]
impl From<TryFromPrimitiveError<Code>> for DecodeError {
    fn from(value: TryFromPrimitiveError<Code>) -> Self {
        Self::InvalidCode(value.number)
    }
}

/// The type octet and trailing data of a Request or Response packet.
#[derive(Clone, Debug, PartialEq, Eq, Getters, CopyGetters)]
pub struct TypeData {
    #[getset(get_copy = "pub")]
    /// The method number from the type octet.
    method: Method,

    #[getset(get = "pub")]
    /// The octets following the type octet; may be empty.
    data: Vec<u8>,
}

impl TypeData {
    /// Bundles a method number with its type data.
    pub fn new(method: Method, data: Vec<u8>) -> Self {
        Self { method, data }
    }
}

/// A full EAP packet.
///
/// Success and Failure packets have no body; the constructors make an
/// inconsistent combination unrepresentable. The sixteen-bit length field
/// exists only on the wire: [`encode`](Self::encode) computes it and
/// [`decode`](Self::decode) validates it.
#[derive(Clone, Debug, PartialEq, Eq, Getters, CopyGetters)]
pub struct EapPacket {
    #[getset(get_copy = "pub")]
    /// The packet code.
    code: Code,

    #[getset(get_copy = "pub")]
    /// The packet identifier, used to match Responses to Requests.
    identifier: u8,

    #[getset(get = "pub")]
    /// Type octet and data; always present for Request/Response, never for
    /// Success/Failure.
    body: Option<TypeData>,
}

impl EapPacket {
    /// Builds a Request packet.
    pub fn request(identifier: u8, method: Method, data: Vec<u8>) -> Self {
        Self {
            code: Code::Request,
            identifier,
            body: Some(TypeData::new(method, data)),
        }
    }

    /// Builds a Response packet.
    pub fn response(identifier: u8, method: Method, data: Vec<u8>) -> Self {
        Self {
            code: Code::Response,
            identifier,
            body: Some(TypeData::new(method, data)),
        }
    }

    /// Builds a Success packet.
    pub fn success(identifier: u8) -> Self {
        Self {
            code: Code::Success,
            identifier,
            body: None,
        }
    }

    /// Builds a Failure packet.
    pub fn failure(identifier: u8) -> Self {
        Self {
            code: Code::Failure,
            identifier,
            body: None,
        }
    }

    /// The method number of the body, or [`Method::INVALID`] for
    /// Success/Failure packets.
    ///
    /// Mirrors the wire where a missing type octet reads as type zero, which
    /// keeps range checks on the dispatch path uniform.
    pub fn method(&self) -> Method {
        self.body
            .as_ref()
            .map_or(Method::INVALID, |body| body.method())
    }

    /// The number of octets this packet occupies on the wire.
    pub fn wire_size(&self) -> usize {
        HEADER_LEN
            + self
                .body
                .as_ref()
                .map_or(0, |body| 1 + body.data().len())
    }

    /// Serializes the packet into a single contiguous buffer.
    ///
    /// The caller (the RADIUS layer) is responsible for splitting the result
    /// into EAP-Message attributes at [`MAX_FRAGMENT_LEN`] boundaries.
    pub fn encode(&self) -> Result<Vec<u8>, EncodeError> {
        let wire_size = self.wire_size();
        let length =
            u16::try_from(wire_size).map_err(|_| EncodeError::DataTooLong { length: wire_size })?;

        let mut buffer = Vec::with_capacity(wire_size);
        buffer.push(self.code as u8);
        buffer.push(self.identifier);

        let mut length_field = [0; 2];
        NetworkEndian::write_u16(&mut length_field, length);
        buffer.extend_from_slice(&length_field);

        if let Some(body) = &self.body {
            buffer.push(body.method().num());
            buffer.extend_from_slice(body.data());
        }

        Ok(buffer)
    }

    /// Deserializes a packet from a contiguous buffer.
    ///
    /// The buffer may be longer than the declared length (RADIUS padding);
    /// trailing octets beyond it are ignored. A declared length shorter than
    /// the buffer contents it needs is an error, as is a Request/Response
    /// too short to carry its type octet.
    pub fn decode(buffer: &[u8]) -> Result<Self, DecodeError> {
        if buffer.len() < HEADER_LEN {
            return Err(DecodeError::Truncated {
                actual: buffer.len(),
            });
        }

        let code = Code::try_from(buffer[0])?;
        let identifier = buffer[1];
        let declared = NetworkEndian::read_u16(&buffer[2..4]);
        let length = usize::from(declared);

        if length < HEADER_LEN {
            return Err(DecodeError::RuntLength(declared));
        }
        if length > buffer.len() {
            return Err(DecodeError::LengthMismatch {
                declared,
                actual: buffer.len(),
            });
        }

        let body = if code.carries_data() {
            if length < HEADER_LEN + 1 {
                return Err(DecodeError::MissingType);
            }

            Some(TypeData::new(
                Method::new(buffer[HEADER_LEN]),
                buffer[HEADER_LEN + 1..length].to_vec(),
            ))
        } else {
            None
        };

        Ok(Self {
            code,
            identifier,
            body,
        })
    }

    /// Reassembles a packet from EAP-Message attribute values, concatenated
    /// in attribute order, then decodes it.
    pub fn from_fragments<'frag, I>(fragments: I) -> Result<Self, DecodeError>
    where
        I: IntoIterator<Item = &'frag [u8]>,
    {
        let mut buffer = Vec::new();
        let mut seen = false;

        for fragment in fragments {
            seen = true;
            buffer.extend_from_slice(fragment);
        }

        if !seen {
            return Err(DecodeError::NoFragments);
        }

        Self::decode(&buffer)
    }
}
