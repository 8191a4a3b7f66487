//! Security type 2: VNC-Auth (DES challenge/response).
//!
//! The key-prep quirk (truncate/pad the password to 8 bytes, then
//! bit-reverse each byte before using it as a DES key) is specific to
//! the RFB protocol and has no relation to a "real" DES key schedule;
//! see e.g. TightVNC/TigerVNC's `d3des.c` for the reference behavior.

use cipher::{generic_array::GenericArray, BlockEncrypt, KeyInit};
use des::Des;
use std::io::{Read, Write};
use zeroize::Zeroizing;

use crate::error::{Error, Result};
use crate::transport::BoxedTransport;

use super::{
    AuthenticationHandler, AuthenticationOutcome, CredentialRequest, Credentials, SecurityType,
    SecurityTypeId,
};

const CHALLENGE_LEN: usize = 16;

fn reverse_bits(mut b: u8) -> u8 {
    let mut out = 0u8;
    for _ in 0..8 {
        out = (out << 1) | (b & 1);
        b >>= 1;
    }
    out
}

/// Builds the DES key from a VNC password: truncated/padded to 8 bytes,
/// each byte bit-reversed.
fn make_des_key(password: &str) -> Zeroizing<[u8; 8]> {
    let mut key = Zeroizing::new([0u8; 8]);
    for (slot, byte) in key.iter_mut().zip(password.as_bytes().iter()) {
        *slot = *byte;
    }
    for b in key.iter_mut() {
        *b = reverse_bits(*b);
    }
    key
}

fn des_encrypt_block(key: &[u8; 8], block: &[u8]) -> [u8; 8] {
    let cipher = Des::new_from_slice(key).expect("DES key is always 8 bytes");
    let mut buf = GenericArray::clone_from_slice(block);
    cipher.encrypt_block(&mut buf);
    let mut out = [0u8; 8];
    out.copy_from_slice(&buf);
    out
}

/// Computes the 16-byte DES response to a VNC-Auth challenge. Shared
/// with VeNCrypt's `*Vnc` subtypes, which run the same challenge over a
/// TLS-wrapped transport instead of a plain one.
pub(crate) fn des_challenge_response(challenge: &[u8; CHALLENGE_LEN], password: &str) -> [u8; CHALLENGE_LEN] {
    let key = make_des_key(password);
    let mut response = [0u8; CHALLENGE_LEN];
    response[..8].copy_from_slice(&des_encrypt_block(&key, &challenge[..8]));
    response[8..].copy_from_slice(&des_encrypt_block(&key, &challenge[8..]));
    response
}

pub struct VncAuth {
    expects_security_result: bool,
}

impl VncAuth {
    pub fn new(expects_security_result: bool) -> VncAuth {
        VncAuth { expects_security_result }
    }
}

impl SecurityType for VncAuth {
    fn id(&self) -> SecurityTypeId {
        SecurityTypeId::VNC_AUTH
    }

    fn authenticate(
        &self,
        mut transport: BoxedTransport,
        handler: &mut dyn AuthenticationHandler,
    ) -> Result<(BoxedTransport, AuthenticationOutcome)> {
        let mut challenge = [0u8; CHALLENGE_LEN];
        transport.read_exact(&mut challenge)?;

        let password = match handler.provide_credentials(CredentialRequest::Password) {
            Some(Credentials::Password(password)) => password,
            _ => return Err(Error::AuthenticationUnavailable),
        };
        let response = des_challenge_response(&challenge, &password);

        transport.write_all(&response)?;
        transport.flush()?;

        Ok((transport, AuthenticationOutcome::plain(self.expects_security_result)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reverse_bits_is_involution() {
        for b in 0u8..=255 {
            assert_eq!(reverse_bits(reverse_bits(b)), b);
        }
    }

    #[test]
    fn reverse_bits_known_values() {
        assert_eq!(reverse_bits(0x00), 0x00);
        assert_eq!(reverse_bits(0x01), 0x80);
        assert_eq!(reverse_bits(0xFF), 0xFF);
        assert_eq!(reverse_bits(0x0A), 0x50);
    }

    #[test]
    fn des_key_truncates_and_pads_short_passwords() {
        let key = make_des_key("ab");
        assert_eq!(key[0], reverse_bits(b'a'));
        assert_eq!(key[1], reverse_bits(b'b'));
        assert_eq!(key[2], reverse_bits(0));
    }

    #[test]
    fn des_key_truncates_long_passwords_to_eight_bytes() {
        let key = make_des_key("0123456789");
        assert_eq!(key[7], reverse_bits(b'7'));
    }
}
