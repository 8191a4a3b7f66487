//! Security types 5/6/129/130: RA2/RA2ne RSA-AES mutual authentication.
//!
//! Both sides generate an RSA key pair, exchange public keys, and each
//! encrypts a 16-byte random for the other with the peer's public key.
//! The two randoms feed a hash (SHA-1 for the plain variants, SHA-256
//! for the `_256` variants) that derives a pair of independent AES-128
//! session keys, which wrap the transport in AES-EAX framing
//! (§4.3.5) *before* the RSA public keys are cross-checked (to defeat a
//! MITM that substitutes its own keys) and a final username/password (or
//! password-only) exchange runs over the now-authenticated channel.
//!
//! RA2ne drops the AES-EAX wrapper again immediately after the MITM
//! check — everything from that point on (including the credential
//! exchange) is sent in clear over the base transport.

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use num_bigint::{BigUint, RandBigInt};
use num_integer::Integer;
use num_traits::{One, Zero};
use rand::RngCore;
use sha1::Sha1;
use sha2::{Digest, Sha256};
use std::io::{Read, Write};
use std::sync::Arc;
use zeroize::Zeroizing;

use crate::error::{Error, Result};
use crate::pool::BufferPool;
use crate::transport::aes_eax::AesEaxTransport;
use crate::transport::BoxedTransport;

use super::{
    AuthenticationHandler, AuthenticationOutcome, CredentialRequest, Credentials, SecurityType,
    SecurityTypeId,
};

const CLIENT_KEY_BITS: usize = 2048;
const MIN_SERVER_BITS: usize = 1024;
const MAX_SERVER_BITS: usize = 8192;

/// Which hash function derives the AES-EAX session keys and the
/// MITM-check hash.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RaHash {
    Sha1,
    Sha256,
}

impl RaHash {
    fn digest(self, parts: &[&[u8]]) -> Vec<u8> {
        match self {
            RaHash::Sha1 => {
                let mut h = Sha1::new();
                for p in parts {
                    h.update(p);
                }
                h.finalize().to_vec()
            }
            RaHash::Sha256 => {
                let mut h = Sha256::new();
                for p in parts {
                    h.update(p);
                }
                h.finalize().to_vec()
            }
        }
    }
}

/// Which sub-authentication runs once the encrypted tunnel is up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Subtype {
    UsernameAndPassword = 1,
    PasswordOnly = 2,
}

struct RsaPublicKey {
    bits: usize,
    n: BigUint,
    e: BigUint,
}

struct RsaPrivateKey {
    bits: usize,
    n: BigUint,
    d: BigUint,
}

fn byte_len(bits: usize) -> usize {
    bits.div_ceil(8)
}

fn read_rsa_public_key<R: Read>(reader: &mut R) -> Result<RsaPublicKey> {
    let bits = reader.read_u32::<BigEndian>()? as usize;
    if !(MIN_SERVER_BITS..=MAX_SERVER_BITS).contains(&bits) {
        return Err(Error::Protocol(format!(
            "RA2 server RSA key size {bits} out of accepted range"
        )));
    }
    let len = byte_len(bits);
    let mut modulus = vec![0u8; len];
    reader.read_exact(&mut modulus)?;
    let mut exponent = vec![0u8; len];
    reader.read_exact(&mut exponent)?;
    Ok(RsaPublicKey {
        bits,
        n: BigUint::from_bytes_be(&modulus),
        e: BigUint::from_bytes_be(&exponent),
    })
}

fn write_rsa_public_key<W: Write>(writer: &mut W, key: &RsaPublicKey) -> Result<()> {
    let len = byte_len(key.bits);
    writer.write_u32::<BigEndian>(key.bits as u32)?;
    writer.write_all(&pad_be(&key.n.to_bytes_be(), len))?;
    writer.write_all(&pad_be(&key.e.to_bytes_be(), len))?;
    Ok(())
}

fn pad_be(bytes: &[u8], len: usize) -> Vec<u8> {
    let mut out = vec![0u8; len];
    let start = len.saturating_sub(bytes.len());
    out[start..].copy_from_slice(&bytes[bytes.len().saturating_sub(len)..]);
    out
}

/// Miller-Rabin with a fixed round count, adequate for freshly generated
/// cryptographic primes (candidates are already filtered to odd numbers
/// with a plausible bit length).
fn is_probably_prime(n: &BigUint, rounds: u32) -> bool {
    let two = BigUint::from(2u8);
    if *n < two {
        return false;
    }
    if *n == two {
        return true;
    }
    if n.is_even() {
        return false;
    }

    let n_minus_one = n - 1u8;
    let mut d = n_minus_one.clone();
    let mut r = 0u32;
    while d.is_even() {
        d >>= 1;
        r += 1;
    }

    let mut rng = rand::thread_rng();
    'witness: for _ in 0..rounds {
        let a = rng.gen_biguint_range(&two, &(n - 2u8));
        let mut x = a.modpow(&d, n);
        if x.is_one() || x == n_minus_one {
            continue;
        }
        for _ in 0..r - 1 {
            x = x.modpow(&two, n);
            if x == n_minus_one {
                continue 'witness;
            }
        }
        return false;
    }
    true
}

fn random_prime(bits: usize) -> BigUint {
    let mut rng = rand::thread_rng();
    loop {
        let mut candidate = rng.gen_biguint(bits as u64);
        candidate.set_bit(bits as u64 - 1, true);
        candidate.set_bit(0, true);
        if is_probably_prime(&candidate, 24) {
            return candidate;
        }
    }
}

fn generate_keypair(bits: usize) -> (RsaPrivateKey, RsaPublicKey) {
    let half = bits / 2;
    let e = BigUint::from(65537u32);
    loop {
        let p = random_prime(half);
        let q = random_prime(bits - half);
        if p == q {
            continue;
        }
        let n = &p * &q;
        let phi = (&p - 1u8) * (&q - 1u8);
        if phi.gcd(&e) != BigUint::one() {
            continue;
        }
        let d = match mod_inverse(&e, &phi) {
            Some(d) => d,
            None => continue,
        };
        return (
            RsaPrivateKey { bits, n: n.clone(), d },
            RsaPublicKey { bits, n, e },
        );
    }
}

/// Modular inverse of `a` mod `m` via the extended Euclidean algorithm.
fn mod_inverse(a: &BigUint, m: &BigUint) -> Option<BigUint> {
    let (g, x, _) = extended_gcd(&as_signed(a), &as_signed(m));
    if g != num_bigint::BigInt::one() {
        return None;
    }
    let m_signed = as_signed(m);
    let result = ((x % &m_signed) + &m_signed) % &m_signed;
    result.to_biguint()
}

fn as_signed(n: &BigUint) -> num_bigint::BigInt {
    num_bigint::BigInt::from_biguint(num_bigint::Sign::Plus, n.clone())
}

fn extended_gcd(
    a: &num_bigint::BigInt,
    b: &num_bigint::BigInt,
) -> (num_bigint::BigInt, num_bigint::BigInt, num_bigint::BigInt) {
    if b.is_zero() {
        (a.clone(), num_bigint::BigInt::one(), num_bigint::BigInt::zero())
    } else {
        let (g, x1, y1) = extended_gcd(b, &(a % b));
        let y = &x1 - (a / b) * &y1;
        (g, y1, y)
    }
}

/// PKCS#1 v1.5 encryption of a short message (≤ `k - 11` bytes) using
/// type-2 (random nonzero) padding, per RFC 8017 §7.2.1.
fn pkcs1_encrypt(message: &[u8], key: &RsaPublicKey) -> Vec<u8> {
    let k = byte_len(key.bits);
    assert!(message.len() + 11 <= k, "message too long for RSA key size");
    let mut padded = vec![0u8; k];
    padded[1] = 2;
    let ps_len = k - message.len() - 3;
    let mut rng = rand::thread_rng();
    let mut i = 2;
    while i < 2 + ps_len {
        let mut b = [0u8; 1];
        rng.fill_bytes(&mut b);
        if b[0] != 0 {
            padded[i] = b[0];
            i += 1;
        }
    }
    padded[2 + ps_len] = 0;
    padded[3 + ps_len..].copy_from_slice(message);

    let m = BigUint::from_bytes_be(&padded);
    let c = m.modpow(&key.e, &key.n);
    pad_be(&c.to_bytes_be(), k)
}

/// PKCS#1 v1.5 decryption. Returns the recovered message, or a protocol
/// error if the padding is malformed (deliberately not distinguishing
/// padding-oracle-relevant failure modes beyond what this client needs —
/// the server is the untrusted-input side of this channel, not a
/// padding-oracle adversary we defend interactively against).
fn pkcs1_decrypt(ciphertext: &[u8], key: &RsaPrivateKey) -> Result<Vec<u8>> {
    let k = byte_len(key.bits);
    let c = BigUint::from_bytes_be(ciphertext);
    let m = c.modpow(&key.d, &key.n);
    let padded = pad_be(&m.to_bytes_be(), k);
    if padded[0] != 0 || padded[1] != 2 {
        return Err(Error::Protocol("RA2: malformed PKCS#1 padding".into()));
    }
    let rest = &padded[2..];
    let sep = rest
        .iter()
        .position(|&b| b == 0)
        .ok_or_else(|| Error::Protocol("RA2: PKCS#1 padding has no separator".into()))?;
    Ok(rest[sep + 1..].to_vec())
}

fn read_length_prefixed<R: Read>(reader: &mut R) -> Result<Vec<u8>> {
    let len = reader.read_u16::<BigEndian>()? as usize;
    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf)?;
    Ok(buf)
}

fn write_length_prefixed<W: Write>(writer: &mut W, data: &[u8]) -> Result<()> {
    writer.write_u16::<BigEndian>(data.len() as u16)?;
    writer.write_all(data)?;
    Ok(())
}

pub struct Ra2 {
    id: SecurityTypeId,
    hash: RaHash,
    /// RA2ne variants drop the AES-EAX wrapper right after the MITM
    /// check instead of keeping it for the rest of the session.
    no_encryption: bool,
    expects_security_result: bool,
    pool: Arc<BufferPool>,
}

impl Ra2 {
    pub fn new(
        id: SecurityTypeId,
        hash: RaHash,
        no_encryption: bool,
        expects_security_result: bool,
        pool: Arc<BufferPool>,
    ) -> Ra2 {
        Ra2 { id, hash, no_encryption, expects_security_result, pool }
    }
}

impl SecurityType for Ra2 {
    fn id(&self) -> SecurityTypeId {
        self.id
    }

    fn authenticate(
        &self,
        mut transport: BoxedTransport,
        handler: &mut dyn AuthenticationHandler,
    ) -> Result<(BoxedTransport, AuthenticationOutcome)> {
        let server_public = read_rsa_public_key(&mut transport)?;
        let (client_private, client_public) = generate_keypair(CLIENT_KEY_BITS);
        write_rsa_public_key(&mut transport, &client_public)?;
        transport.flush()?;

        let server_random_ct = read_length_prefixed(&mut transport)?;
        let server_random = Zeroizing::new(pkcs1_decrypt(&server_random_ct, &client_private)?);
        if server_random.len() != 16 {
            return Err(Error::Protocol(
                "RA2: server random has wrong length after decryption".into(),
            ));
        }

        let mut client_random = Zeroizing::new([0u8; 16]);
        rand::thread_rng().fill_bytes(client_random.as_mut());
        let client_random_ct = pkcs1_encrypt(client_random.as_ref(), &server_public);
        write_length_prefixed(&mut transport, &client_random_ct)?;
        transport.flush()?;

        let mut client_key = Zeroizing::new([0u8; 16]);
        client_key.copy_from_slice(
            &self.hash.digest(&[server_random.as_slice(), client_random.as_slice()])[..16],
        );
        let mut server_key = Zeroizing::new([0u8; 16]);
        server_key.copy_from_slice(
            &self.hash.digest(&[client_random.as_slice(), server_random.as_slice()])[..16],
        );

        let mut eax_tunnel = AesEaxTransport::new(transport, &client_key, &server_key, self.pool.clone());

        let server_pub_bytes = encode_public_key(&server_public);
        let client_pub_bytes = encode_public_key(&client_public);

        let expected_hash_len = match self.hash {
            RaHash::Sha1 => 20,
            RaHash::Sha256 => 32,
        };
        let mut server_hash = vec![0u8; expected_hash_len];
        eax_tunnel.read_exact(&mut server_hash)?;
        let expected = self
            .hash
            .digest(&[server_pub_bytes.as_slice(), client_pub_bytes.as_slice()]);
        if server_hash != expected {
            return Err(Error::KeyMismatch);
        }

        let client_hash = self
            .hash
            .digest(&[client_pub_bytes.as_slice(), server_pub_bytes.as_slice()]);
        eax_tunnel.write_all(&client_hash)?;
        eax_tunnel.flush()?;

        // RA2ne: the MITM check above used the AES-EAX wrapper, but
        // everything from here on — including the credential exchange
        // below — reverts to the bare transport.
        let mut tunnel: BoxedTransport = if self.no_encryption {
            eax_tunnel.into_inner()
        } else {
            Box::new(eax_tunnel)
        };

        let subtype = tunnel.read_u8()?;
        match subtype {
            1 => {
                let (username, password) =
                    match handler.provide_credentials(CredentialRequest::UsernameAndPassword) {
                        Some(Credentials::UsernameAndPassword { username, password }) => {
                            (username, password)
                        }
                        _ => return Err(Error::AuthenticationUnavailable),
                    };
                tunnel.write_u8(username.len() as u8)?;
                tunnel.write_u8(password.len() as u8)?;
                tunnel.write_all(username.as_bytes())?;
                tunnel.write_all(password.as_bytes())?;
            }
            2 => {
                let password = match handler.provide_credentials(CredentialRequest::PasswordOnly) {
                    Some(Credentials::Password(password)) => password,
                    _ => return Err(Error::AuthenticationUnavailable),
                };
                tunnel.write_u8(password.len() as u8)?;
                tunnel.write_all(password.as_bytes())?;
            }
            other => {
                return Err(Error::unexpected("RA2 credential subtype", other));
            }
        }
        tunnel.flush()?;

        Ok((tunnel, AuthenticationOutcome::plain(self.expects_security_result)))
    }
}

fn encode_public_key(key: &RsaPublicKey) -> Vec<u8> {
    let len = byte_len(key.bits);
    let mut out = Vec::with_capacity(4 + 2 * len);
    out.extend_from_slice(&(key.bits as u32).to_be_bytes());
    out.extend_from_slice(&pad_be(&key.n.to_bytes_be(), len));
    out.extend_from_slice(&pad_be(&key.e.to_bytes_be(), len));
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pkcs1_round_trip() {
        let (private, public) = generate_keypair(1024);
        let message = b"0123456789abcdef";
        let ct = pkcs1_encrypt(message, &public);
        let pt = pkcs1_decrypt(&ct, &private).unwrap();
        assert_eq!(pt, message);
    }

    #[test]
    fn session_key_derivation_is_directional() {
        let server_random = [0x11u8; 16];
        let client_random = [0x22u8; 16];
        let client_key = &RaHash::Sha1.digest(&[&server_random, &client_random])[..16];
        let server_key = &RaHash::Sha1.digest(&[&client_random, &server_random])[..16];
        assert_ne!(client_key, server_key);
    }

    #[test]
    fn generated_modulus_has_requested_bit_length() {
        let (_, public) = generate_keypair(512);
        assert_eq!(public.n.bits(), 512);
    }
}
