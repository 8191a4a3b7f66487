//! AES-EAX frame wrapper used by the RA2 security family.
//!
//! Each frame is `[u16 plaintext_len][ciphertext][16-byte MAC]`. The
//! 2-byte length field is the EAX associated data. The nonce is a
//! per-direction monotonic 64-bit counter, little-endian, left-padded
//! to the cipher's 16-byte nonce. Read and write counters are tracked
//! independently so a connection that only ever writes (or only ever
//! reads) never desyncs the other direction.

use std::io::{self, Read, Write};
use std::sync::Arc;

use aead::{AeadInPlace, KeyInit};
use eax::Eax;
use aes::Aes128;

use super::{BoxedTransport, Transport};
use crate::error::{Error, Result};
use crate::pool::BufferPool;

type Cipher = Eax<Aes128>;

const MAC_LEN: usize = 16;
const NONCE_LEN: usize = 16;
const LEN_PREFIX: usize = 2;

fn nonce_from_counter(counter: u64) -> aead::Nonce<Cipher> {
    let mut nonce = [0u8; NONCE_LEN];
    nonce[..8].copy_from_slice(&counter.to_le_bytes());
    aead::Nonce::<Cipher>::clone_from_slice(&nonce)
}

/// Wraps a transport in AES-EAX framing using independent read/write
/// 16-byte keys, as RA2's key schedule produces (`clientSessionKey`
/// for one direction, `serverSessionKey` for the other).
pub struct AesEaxTransport {
    base: BoxedTransport,
    writer_cipher: Cipher,
    reader_cipher: Cipher,
    write_counter: u64,
    read_counter: u64,
    pool: Arc<BufferPool>,
    /// Plaintext bytes decoded from the current frame but not yet
    /// returned to the caller of `read`.
    pending: Vec<u8>,
    pending_pos: usize,
}

impl AesEaxTransport {
    pub fn new(
        base: BoxedTransport,
        write_key: &[u8; 16],
        read_key: &[u8; 16],
        pool: Arc<BufferPool>,
    ) -> AesEaxTransport {
        AesEaxTransport {
            base,
            writer_cipher: Cipher::new(write_key.into()),
            reader_cipher: Cipher::new(read_key.into()),
            write_counter: 0,
            read_counter: 0,
            pool,
            pending: Vec::new(),
            pending_pos: 0,
        }
    }

    /// Unwraps the AES-EAX framing and returns the base transport,
    /// discarding any buffered-but-unread plaintext. Used by RA2ne,
    /// which authenticates over an AES-EAX tunnel but reverts to the
    /// bare transport for the rest of the session.
    pub fn into_inner(self) -> BoxedTransport {
        self.base
    }

    fn fill_pending(&mut self) -> io::Result<()> {
        let mut len_buf = [0u8; LEN_PREFIX];
        self.base.read_exact(&mut len_buf)?;
        let plaintext_len = u16::from_be_bytes(len_buf) as usize;

        let mut ciphertext = self.pool.take(plaintext_len);
        self.base.read_exact(&mut ciphertext)?;
        let mut tag = [0u8; MAC_LEN];
        self.base.read_exact(&mut tag)?;

        let nonce = nonce_from_counter(self.read_counter);
        self.reader_cipher
            .decrypt_in_place_detached(&nonce, &len_buf, &mut ciphertext, (&tag).into())
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, Error::AuthenticationTagMismatch))?;
        self.read_counter += 1;

        self.pending.clear();
        self.pending.extend_from_slice(&ciphertext);
        self.pending_pos = 0;
        Ok(())
    }
}

impl Read for AesEaxTransport {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.pending_pos >= self.pending.len() {
            self.fill_pending()?;
        }
        let available = &self.pending[self.pending_pos..];
        let n = available.len().min(buf.len());
        buf[..n].copy_from_slice(&available[..n]);
        self.pending_pos += n;
        Ok(n)
    }
}

impl Write for AesEaxTransport {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if buf.len() > u16::MAX as usize {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "frame too large for AES-EAX framing",
            ));
        }
        let len_buf = (buf.len() as u16).to_be_bytes();
        let mut plaintext = self.pool.take(buf.len());
        plaintext.copy_from_slice(buf);

        let nonce = nonce_from_counter(self.write_counter);
        let tag = self
            .writer_cipher
            .encrypt_in_place_detached(&nonce, &len_buf, &mut plaintext)
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "AES-EAX encryption failed"))?;
        self.write_counter += 1;

        self.base.write_all(&len_buf)?;
        self.base.write_all(&plaintext)?;
        self.base.write_all(&tag)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.base.flush()
    }
}

impl Transport for AesEaxTransport {
    fn is_encrypted(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    /// A transport backed by an in-memory byte vector, for loopback
    /// round-trip tests that don't need a real socket.
    struct MemTransport {
        inner: Cursor<Vec<u8>>,
    }

    impl Read for MemTransport {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            self.inner.read(buf)
        }
    }
    impl Write for MemTransport {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.inner.write(buf)
        }
        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }
    impl Transport for MemTransport {
        fn is_encrypted(&self) -> bool {
            false
        }
    }

    fn loopback_pair(key: [u8; 16]) -> (AesEaxTransport, AesEaxTransport) {
        let pool = Arc::new(BufferPool::new());
        let mem = Arc::new(std::sync::Mutex::new(Vec::<u8>::new()));

        struct Shared(Arc<std::sync::Mutex<Vec<u8>>>, usize);
        impl Read for Shared {
            fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
                let data = self.0.lock().unwrap();
                let available = &data[self.1..];
                let n = available.len().min(buf.len());
                buf[..n].copy_from_slice(&available[..n]);
                self.1 += n;
                Ok(n)
            }
        }
        impl Write for Shared {
            fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
                self.0.lock().unwrap().extend_from_slice(buf);
                Ok(buf.len())
            }
            fn flush(&mut self) -> io::Result<()> {
                Ok(())
            }
        }
        impl Transport for Shared {
            fn is_encrypted(&self) -> bool {
                false
            }
        }

        let writer_side: BoxedTransport = Box::new(Shared(mem.clone(), 0));
        let reader_side: BoxedTransport = Box::new(Shared(mem, 0));
        (
            AesEaxTransport::new(writer_side, &key, &key, pool.clone()),
            AesEaxTransport::new(reader_side, &key, &key, pool),
        )
    }

    #[test]
    fn round_trip_recovers_plaintext_and_advances_counters() {
        let key = [0x0Fu8; 16];
        let (mut writer, mut reader) = loopback_pair(key);

        writer.write_all(&[0x01, 0x02, 0x03]).unwrap();
        let mut out = [0u8; 3];
        reader.read_exact(&mut out).unwrap();

        assert_eq!(out, [0x01, 0x02, 0x03]);
        assert_eq!(writer.write_counter, 1);
        assert_eq!(reader.read_counter, 1);
    }

    #[test]
    fn tampered_ciphertext_fails_mac_check() {
        let key = [0x42u8; 16];
        let pool = Arc::new(BufferPool::new());
        let buf: Arc<std::sync::Mutex<Vec<u8>>> = Arc::new(std::sync::Mutex::new(Vec::new()));

        struct Shared(Arc<std::sync::Mutex<Vec<u8>>>, usize);
        impl Read for Shared {
            fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
                let data = self.0.lock().unwrap();
                let available = &data[self.1..];
                let n = available.len().min(buf.len());
                buf[..n].copy_from_slice(&available[..n]);
                self.1 += n;
                Ok(n)
            }
        }
        impl Write for Shared {
            fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
                self.0.lock().unwrap().extend_from_slice(buf);
                Ok(buf.len())
            }
            fn flush(&mut self) -> io::Result<()> {
                Ok(())
            }
        }
        impl Transport for Shared {
            fn is_encrypted(&self) -> bool {
                false
            }
        }

        let mut writer = AesEaxTransport::new(Box::new(Shared(buf.clone(), 0)), &key, &key, pool.clone());
        writer.write_all(&[0xAA; 4]).unwrap();
        // Flip a ciphertext byte in place.
        {
            let mut data = buf.lock().unwrap();
            let idx = LEN_PREFIX;
            data[idx] ^= 0xFF;
        }
        let mut reader = AesEaxTransport::new(Box::new(Shared(buf, 0)), &key, &key, pool);
        let mut out = [0u8; 4];
        assert!(reader.read_exact(&mut out).is_err());
    }
}
