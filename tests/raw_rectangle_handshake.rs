//! End-to-end: RFB 3.8 handshake with security type None, followed by a
//! single Raw-encoded `FramebufferUpdate`, against a loopback mock
//! server.

mod common;

use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rvnc_core::collab::{CursorHandler, FramebufferHandle, OutputHandler, RenderTarget};
use rvnc_core::security::{AuthenticationHandler, CredentialRequest, Credentials};
use rvnc_core::{ConnectParams, ConnectionState, PixelFormat, Rectangle, RfbConnection, TransportParams};

struct NoAuth;

impl AuthenticationHandler for NoAuth {
    fn provide_credentials(&mut self, _request: CredentialRequest) -> Option<Credentials> {
        None
    }
}

struct NoOutput;
impl OutputHandler for NoOutput {}

struct NoCursor;
impl CursorHandler for NoCursor {
    fn update_cursor(&mut self, _width: u16, _height: u16, _hotspot: (u16, u16), _rgba: &[u8]) {}
    fn update_x_cursor(
        &mut self,
        _width: u16,
        _height: u16,
        _hotspot: (u16, u16),
        _primary: (u8, u8, u8),
        _secondary: (u8, u8, u8),
        _bitmap: &[u8],
        _mask: &[u8],
    ) {
    }
}

#[derive(Default)]
struct SharedFramebuffer {
    pixels: Mutex<Vec<u8>>,
}

struct RecordingTarget {
    shared: Arc<SharedFramebuffer>,
    format: PixelFormat,
    updated: mpsc::Sender<Rectangle>,
}

struct RecordingHandle<'a> {
    guard: std::sync::MutexGuard<'a, Vec<u8>>,
    format: PixelFormat,
    width: u16,
    height: u16,
}

impl<'a> FramebufferHandle for RecordingHandle<'a> {
    fn pixels(&mut self) -> &mut [u8] {
        &mut self.guard
    }
    fn format(&self) -> &PixelFormat {
        &self.format
    }
    fn width(&self) -> u16 {
        self.width
    }
    fn height(&self) -> u16 {
        self.height
    }
}

impl RenderTarget for RecordingTarget {
    fn grab_framebuffer(&mut self, width: u16, height: u16, _track_changes: bool) -> Box<dyn FramebufferHandle + '_> {
        let mut guard = self.shared.pixels.lock().unwrap();
        guard.resize(width as usize * height as usize * self.format.bytes_per_pixel(), 0);
        Box::new(RecordingHandle { guard, format: self.format.clone(), width, height })
    }

    fn on_framebuffer_updated(&mut self, dirty: Option<Rectangle>) {
        let _ = self.updated.send(dirty.unwrap_or(Rectangle::new(0, 0, 0, 0)));
    }
}

#[test]
fn handshake_and_raw_rectangle_paint_the_framebuffer() {
    let (listener, port) = common::bind_loopback();

    let server = std::thread::spawn(move || {
        let (mut stream, _) = listener.accept().unwrap();
        common::exchange_version(&mut stream, b"RFB 003.008\n");
        let choice = common::offer_security_types(&mut stream, &[1]); // None
        assert_eq!(choice, 1);
        common::write_security_result_ok(&mut stream);
        common::read_client_init(&mut stream);
        common::write_server_init(&mut stream, 2, 1, "loopback test desktop");

        common::spawn_drain(stream.try_clone().unwrap());

        // Red pixel then green pixel, packed little-endian as
        // [blue, green, red, pad] per the ServerInit format above.
        let pixels = [0x00, 0x00, 0xFF, 0x00, 0x00, 0xFF, 0x00, 0x00];
        common::write_raw_framebuffer_update(&mut stream, 0, 0, 2, 1, &pixels);

        // Keep the connection open a bit so the client's close() races
        // a live socket rather than an already-reset one.
        std::thread::sleep(Duration::from_millis(300));
    });

    let shared = Arc::new(SharedFramebuffer::default());
    let (tx, rx) = mpsc::channel();
    let target = RecordingTarget { shared: shared.clone(), format: PixelFormat::rgb888(), updated: tx };

    let mut params = ConnectParams::new(TransportParams::new("127.0.0.1", port));
    params.max_reconnect_attempts = Some(0);

    let connection = RfbConnection::new(
        params,
        Box::new(NoAuth),
        Box::new(target),
        Box::new(NoOutput),
        Box::new(NoCursor),
    );

    connection.start().expect("handshake against the mock server should succeed");
    assert_eq!(connection.connection_state(), ConnectionState::Connected);

    let dirty = rx.recv_timeout(Duration::from_secs(5)).expect("framebuffer update notification");
    assert_eq!(dirty, Rectangle::new(0, 0, 2, 1));

    let pixels = shared.pixels.lock().unwrap().clone();
    assert_eq!(pixels, vec![0x00, 0x00, 0xFF, 0x00, 0x00, 0xFF, 0x00, 0x00]);

    connection.close();
    assert_eq!(connection.connection_state(), ConnectionState::Closed);

    server.join().unwrap();
}
