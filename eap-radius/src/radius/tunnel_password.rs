//! Tunnel-Password obfuscation ([RFC2868 section 3.5]).
//!
//! The plaintext is prefixed with a length octet, zero-padded to whole
//! blocks, and XORed against a pseudo-pad built by iterating MD5 over the
//! shared secret, the request authenticator, and a two-octet salt. Used by
//! the post-proxy rewrap of `leap:session-key` attributes, which are encoded
//! under one secret/authenticator pair and must be re-encoded under another.
//!
//! [RFC2868 section 3.5]: https://www.rfc-editor.org/rfc/rfc2868#section-3.5

use md5::{Digest, Md5};
use thiserror::Error;

/// Size of the salt preceding the ciphertext.
pub const SALT_LEN: usize = 2;

/// MD5 output size, which is also the cipher block size.
const BLOCK_LEN: usize = 16;

/// An error while encoding or decoding a Tunnel-Password value.
#[non_exhaustive]
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TunnelPasswordError {
    /// Ciphertext was not a salt followed by whole blocks.
    #[error("tunnel-password data of {0} octets is not a salt plus whole blocks")]
    BadCiphertextLength(usize),

    /// The decrypted length octet exceeded the octets present, which means
    /// the wrong secret or authenticator was used.
    #[error("tunnel-password length octet {length} exceeds the {available} octets present")]
    BadPlaintextLength {
        /// The decrypted length octet.
        length: u8,
        /// Plaintext octets actually available after the length octet.
        available: usize,
    },

    /// The plaintext does not fit the single length octet.
    #[error("plaintext of {0} octets does not fit a tunnel-password attribute")]
    PlaintextTooLong(usize),
}

/// Encodes `plaintext`, returning the salt followed by the ciphertext.
///
/// The high bit of the salt is forced on, as the RFC requires.
pub fn encode(
    plaintext: &[u8],
    salt: [u8; SALT_LEN],
    secret: &[u8],
    vector: &[u8; 16],
) -> Result<Vec<u8>, TunnelPasswordError> {
    let length =
        u8::try_from(plaintext.len()).map_err(|_| TunnelPasswordError::PlaintextTooLong(plaintext.len()))?;

    let salt = [salt[0] | 0x80, salt[1]];

    // length octet + plaintext, zero-padded to whole blocks
    let padded_len = (1 + plaintext.len()).div_ceil(BLOCK_LEN) * BLOCK_LEN;
    let mut buffer = Vec::with_capacity(SALT_LEN + padded_len);
    buffer.extend_from_slice(&salt);
    buffer.push(length);
    buffer.extend_from_slice(plaintext);
    buffer.resize(SALT_LEN + padded_len, 0);

    let mut pad = first_pad(secret, vector, &salt);
    for chunk in buffer[SALT_LEN..].chunks_mut(BLOCK_LEN) {
        for (octet, pad_octet) in chunk.iter_mut().zip(pad) {
            *octet ^= pad_octet;
        }

        // next pad block is keyed by the ciphertext just produced
        pad = next_pad(secret, chunk);
    }

    Ok(buffer)
}

/// Decodes a salt-plus-ciphertext value, returning the plaintext.
pub fn decode(
    data: &[u8],
    secret: &[u8],
    vector: &[u8; 16],
) -> Result<Vec<u8>, TunnelPasswordError> {
    if data.len() < SALT_LEN + BLOCK_LEN || (data.len() - SALT_LEN) % BLOCK_LEN != 0 {
        return Err(TunnelPasswordError::BadCiphertextLength(data.len()));
    }

    let (salt, ciphertext) = data.split_at(SALT_LEN);

    let mut plaintext = Vec::with_capacity(ciphertext.len());
    let mut pad = first_pad(secret, vector, salt);
    for chunk in ciphertext.chunks(BLOCK_LEN) {
        for (octet, pad_octet) in chunk.iter().zip(pad) {
            plaintext.push(octet ^ pad_octet);
        }

        pad = next_pad(secret, chunk);
    }

    let length = plaintext[0];
    let available = plaintext.len() - 1;
    if usize::from(length) > available {
        return Err(TunnelPasswordError::BadPlaintextLength { length, available });
    }

    plaintext.drain(..1);
    plaintext.truncate(usize::from(length));

    Ok(plaintext)
}

fn first_pad(secret: &[u8], vector: &[u8; 16], salt: &[u8]) -> [u8; BLOCK_LEN] {
    let mut hasher = Md5::new();
    hasher.update(secret);
    hasher.update(vector);
    hasher.update(salt);
    hasher.finalize().into()
}

fn next_pad(secret: &[u8], previous_ciphertext: &[u8]) -> [u8; BLOCK_LEN] {
    let mut hasher = Md5::new();
    hasher.update(secret);
    hasher.update(previous_ciphertext);
    hasher.finalize().into()
}
