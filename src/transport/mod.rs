//! Byte-stream transports the connection engine can run the RFB
//! handshake over: a plain TCP socket, wrapped in TLS by VeNCrypt, or
//! wrapped in AES-EAX framing by the RA2 security family.

pub mod aes_eax;
#[cfg(feature = "tls")]
pub mod tls;

use std::io::{self, Read, Write};
use std::net::TcpStream;

use crate::cancel::CancellationToken;
use crate::error::Result;

/// A bidirectional byte stream with explicit flush and an
/// `is_encrypted` flag the handshake and diagnostics can inspect.
/// Implementations forward `Read`/`Write` to their inner transport, so
/// wrapping one transport in another (TLS, then AES-EAX) composes
/// naturally.
pub trait Transport: Read + Write + Send {
    fn is_encrypted(&self) -> bool;

    /// Best-effort hint that a blocking read should return promptly.
    /// The default impl is a no-op; socket-backed transports override
    /// it to set a short read timeout so the receive worker can observe
    /// cancellation between messages instead of blocking forever.
    fn set_poll_timeout(&mut self, _timeout: Option<std::time::Duration>) -> io::Result<()> {
        Ok(())
    }
}

/// A plain, unencrypted TCP transport.
pub struct TcpTransport {
    stream: TcpStream,
}

impl TcpTransport {
    pub fn connect(host: &str, port: u16) -> Result<TcpTransport> {
        let stream = TcpStream::connect((host, port))?;
        stream.set_nodelay(true)?;
        Ok(TcpTransport { stream })
    }

    pub fn from_stream(stream: TcpStream) -> Result<TcpTransport> {
        stream.set_nodelay(true)?;
        Ok(TcpTransport { stream })
    }

    pub fn try_clone(&self) -> Result<TcpTransport> {
        Ok(TcpTransport {
            stream: self.stream.try_clone()?,
        })
    }
}

impl Read for TcpTransport {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.stream.read(buf)
    }
}

impl Write for TcpTransport {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.stream.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.stream.flush()
    }
}

impl Transport for TcpTransport {
    fn is_encrypted(&self) -> bool {
        false
    }

    fn set_poll_timeout(&mut self, timeout: Option<std::time::Duration>) -> io::Result<()> {
        self.stream.set_read_timeout(timeout)
    }
}

/// A boxed transport, the type the handshake actually passes around so
/// that a security type's `authenticate` can swap in a wrapped
/// transport without the caller needing to know its concrete type.
pub type BoxedTransport = Box<dyn Transport>;

/// The poll timeout installed on socket-backed transports for the
/// duration of a cancellable read, so a blocked receive worker notices
/// cancellation within one tick instead of hanging until the next byte
/// arrives.
pub const CANCEL_POLL_INTERVAL: std::time::Duration = std::time::Duration::from_millis(200);

/// Reads until `buf` is full, rechecking `cancel` between chunks so a
/// blocked receive worker can be stopped without data actually arriving
/// on the wire. Relies on [`Transport::set_poll_timeout`] to bound how
/// long any one underlying read call blocks; transports that leave it a
/// no-op (the default) simply block normally and only observe
/// cancellation between whole reads.
pub fn read_exact_cancellable<T: Transport + ?Sized>(
    transport: &mut T,
    buf: &mut [u8],
    cancel: &CancellationToken,
) -> Result<()> {
    transport.set_poll_timeout(Some(CANCEL_POLL_INTERVAL))?;
    let mut filled = 0;
    while filled < buf.len() {
        cancel.check()?;
        match transport.read(&mut buf[filled..]) {
            Ok(0) => return Err(crate::Error::Disconnected),
            Ok(n) => filled += n,
            Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {
                continue;
            }
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}
