//! Legacy NAK (type 3) payload handling.

use crate::packet::{Code, EapPacket};
use crate::Method;

/// A view of the type data of a NAK response: the peer's ordered list of
/// proposed alternate method numbers ([RFC3748 section 5.3.1]).
///
/// A zero octet in the list is the sentinel for "no acceptable alternative".
/// The list may also be empty, which broken supplicants do send; negotiation
/// treats that the same as the sentinel.
///
/// [RFC3748 section 5.3.1]: https://www.rfc-editor.org/rfc/rfc3748#section-5.3.1
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NakData<'data> {
    data: &'data [u8],
}

impl<'data> NakData<'data> {
    /// Extracts the NAK payload from a peer packet.
    ///
    /// Returns `None` unless the packet is a Response of type NAK.
    pub fn from_response(packet: &'data EapPacket) -> Option<Self> {
        match packet.body() {
            Some(body) if packet.code() == Code::Response && body.method() == Method::NAK => {
                Some(Self { data: body.data() })
            }
            _ => None,
        }
    }

    /// Whether the peer proposed nothing at all.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// The proposed method numbers, in the peer's order of preference.
    pub fn proposed(&self) -> impl Iterator<Item = u8> + 'data {
        self.data.iter().copied()
    }
}

#[cfg(test)]
mod tests {
    use alloc::vec;

    use super::*;

    #[test]
    fn payload_of_nak_response() {
        let packet = EapPacket::response(3, Method::NAK, vec![13, 21, 0]);

        let nak = NakData::from_response(&packet).expect("packet is a NAK response");
        assert!(!nak.is_empty());
        assert_eq!(nak.proposed().collect::<vec::Vec<_>>(), vec![13, 21, 0]);
    }

    #[test]
    fn non_nak_packets_have_no_payload() {
        assert_eq!(
            NakData::from_response(&EapPacket::response(3, Method::MD5, vec![1])),
            None
        );
        assert_eq!(
            NakData::from_response(&EapPacket::request(3, Method::NAK, vec![4])),
            None
        );
        assert_eq!(NakData::from_response(&EapPacket::success(3)), None);
    }

    #[test]
    fn empty_nak_is_detected() {
        let packet = EapPacket::response(0, Method::NAK, vec![]);

        let nak = NakData::from_response(&packet).expect("packet is a NAK response");
        assert!(nak.is_empty());
    }
}
