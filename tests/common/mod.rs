//! Shared helpers for the loopback integration tests: a minimal,
//! synchronous mock RFB server built directly on `std::net::TcpListener`
//! (matching this crate's own synchronous transport model rather than
//! pulling in an async runtime just for test fixtures).

use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};

pub fn bind_loopback() -> (TcpListener, u16) {
    let listener = TcpListener::bind("127.0.0.1:0").expect("binding a loopback test listener");
    let port = listener.local_addr().unwrap().port();
    (listener, port)
}

pub fn write_u16(stream: &mut TcpStream, value: u16) {
    stream.write_all(&value.to_be_bytes()).unwrap();
}

pub fn write_u32(stream: &mut TcpStream, value: u32) {
    stream.write_all(&value.to_be_bytes()).unwrap();
}

/// Writes the RFB version banner, reads back the client's reply and
/// returns it verbatim (callers don't currently need to inspect it).
pub fn exchange_version(stream: &mut TcpStream, banner: &[u8; 12]) -> [u8; 12] {
    stream.write_all(banner).unwrap();
    let mut reply = [0u8; 12];
    stream.read_exact(&mut reply).unwrap();
    reply
}

/// Offers a single security type (RFB 3.7+ list form) and reads back the
/// client's one-byte choice.
pub fn offer_security_types(stream: &mut TcpStream, types: &[u8]) -> u8 {
    stream.write_all(&[types.len() as u8]).unwrap();
    stream.write_all(types).unwrap();
    let mut choice = [0u8; 1];
    stream.read_exact(&mut choice).unwrap();
    choice[0]
}

pub fn write_security_result_ok(stream: &mut TcpStream) {
    write_u32(stream, 0);
}

pub fn write_security_result_failed(stream: &mut TcpStream, reason: &str) {
    write_u32(stream, 1);
    write_u32(stream, reason.len() as u32);
    stream.write_all(reason.as_bytes()).unwrap();
}

/// Reads and discards the one-byte `ClientInit` shared-flag.
pub fn read_client_init(stream: &mut TcpStream) {
    let mut shared = [0u8; 1];
    stream.read_exact(&mut shared).unwrap();
}

/// Writes a `ServerInit` advertising a 32bpp/depth-24 true-colour,
/// little-endian format with RGB in the usual byte order (matching
/// `PixelFormat::rgb888`) — `width x height` pixels and `name`.
pub fn write_server_init(stream: &mut TcpStream, width: u16, height: u16, name: &str) {
    write_u16(stream, width);
    write_u16(stream, height);
    stream.write_all(&[32]).unwrap(); // bits-per-pixel
    stream.write_all(&[24]).unwrap(); // depth
    stream.write_all(&[0]).unwrap(); // big-endian flag
    stream.write_all(&[1]).unwrap(); // true-colour flag
    write_u16(stream, 255); // red-max
    write_u16(stream, 255); // green-max
    write_u16(stream, 255); // blue-max
    stream.write_all(&[16]).unwrap(); // red-shift
    stream.write_all(&[8]).unwrap(); // green-shift
    stream.write_all(&[0]).unwrap(); // blue-shift
    stream.write_all(&[0, 0, 0]).unwrap(); // padding
    write_u32(stream, name.len() as u32);
    stream.write_all(name.as_bytes()).unwrap();
}

/// Writes a `FramebufferUpdate` with a single Raw-encoded rectangle.
/// `pixels` must already be packed in the wire pixel format advertised
/// by `write_server_init` (4 bytes per pixel, `[blue, green, red, 0]`).
pub fn write_raw_framebuffer_update(stream: &mut TcpStream, x: u16, y: u16, width: u16, height: u16, pixels: &[u8]) {
    stream.write_all(&[0]).unwrap(); // message type: FramebufferUpdate
    stream.write_all(&[0]).unwrap(); // padding
    write_u16(stream, 1); // rectangle count
    write_u16(stream, x);
    write_u16(stream, y);
    write_u16(stream, width);
    write_u16(stream, height);
    write_u32(stream, 0); // encoding: Raw
    stream.write_all(pixels).unwrap();
}

/// Spawns a thread that reads and discards whatever the client sends
/// (`SetPixelFormat`/`SetEncodings`/`FramebufferUpdateRequest`) until
/// the connection closes, so the client's send worker never blocks on a
/// full socket buffer for the rest of the test.
pub fn spawn_drain(mut stream: TcpStream) {
    std::thread::spawn(move || {
        let mut sink = [0u8; 4096];
        loop {
            match stream.read(&mut sink) {
                Ok(0) | Err(_) => break,
                Ok(_) => continue,
            }
        }
    });
}
