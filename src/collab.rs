//! Collaborator contracts (spec §6): the traits the embedding
//! application implements so the connection engine can render pixels,
//! react to side-effects, and authenticate without this crate knowing
//! anything about UI toolkits, OS input capture or process
//! configuration.

use std::time::Duration;

use crate::pixel::PixelFormat;
use crate::rect::Rectangle;
pub use crate::security::{AuthenticationHandler, CredentialRequest, Credentials};

/// A scoped handle to the embedder's writable pixel buffer, acquired by
/// the receive worker for the duration of a single rectangle decode (or
/// a batch of them within one `FramebufferUpdate`). Dropping it is the
/// signal to the embedder that it may now repaint.
pub trait FramebufferHandle {
    /// Raw writable bytes, `width * height * format().bytes_per_pixel()`
    /// long, in row-major order.
    fn pixels(&mut self) -> &mut [u8];
    fn format(&self) -> &PixelFormat;
    fn width(&self) -> u16;
    fn height(&self) -> u16;
}

/// The render target collaborator: owns the pixels the decoders write
/// into and the surface that eventually gets redrawn.
pub trait RenderTarget: Send {
    /// Acquires a scoped reference to the framebuffer sized
    /// `width x height`. `track_changes` asks the render target to
    /// compute a dirty rectangle by diffing against its previous
    /// snapshot; implementations that don't support this may ignore it.
    fn grab_framebuffer(
        &mut self,
        width: u16,
        height: u16,
        track_changes: bool,
    ) -> Box<dyn FramebufferHandle + '_>;

    /// Called once the receive worker releases the handle from
    /// `grab_framebuffer`, with the rectangle that was just written (or
    /// `None` if the whole buffer should be considered dirty, e.g. after
    /// a resize). Implementations typically invalidate a widget here.
    fn on_framebuffer_updated(&mut self, dirty: Option<Rectangle>);
}

/// Side-effect callbacks that don't touch pixels: bell, clipboard,
/// desktop name, xvp results, pointer-mode and LED state changes.
pub trait OutputHandler: Send {
    fn bell(&mut self) {}
    fn clipboard_text(&mut self, _text: &str) {}
    /// An extended-clipboard payload for a MIME-ish format the plain
    /// `clipboard_text` callback can't represent (e.g. multiple
    /// formats, binary payloads after zlib inflation).
    fn clipboard_extended(&mut self, _format: &str, _data: &[u8]) {}
    fn desktop_name_changed(&mut self, _name: &str) {}
    fn xvp_result(&mut self, _succeeded: bool, _operation: u8) {}
    fn pointer_mode_changed(&mut self, _relative: bool) {}
    fn led_state_changed(&mut self, _state: u8) {}
}

/// Cursor shape delivery (pseudo-encodings `Cursor`/`XCursor`/
/// `CursorWithAlpha`). Compositing the cursor onto the display is
/// explicitly out of scope (spec §1 Non-goals) — this only delivers
/// shape + hotspot.
pub trait CursorHandler: Send {
    fn update_cursor(&mut self, width: u16, height: u16, hotspot: (u16, u16), rgba: &[u8]);
    fn update_cursor_with_alpha(
        &mut self,
        width: u16,
        height: u16,
        hotspot: (u16, u16),
        rgba_premultiplied: &[u8],
    ) {
        self.update_cursor(width, height, hotspot, rgba_premultiplied)
    }
    fn update_x_cursor(
        &mut self,
        width: u16,
        height: u16,
        hotspot: (u16, u16),
        primary: (u8, u8, u8),
        secondary: (u8, u8, u8),
        bitmap: &[u8],
        mask: &[u8],
    );
    fn hide_cursor(&mut self) {}
}

/// How to reach the server: TCP host/port, plus the TLS parameters
/// VeNCrypt's `TLS*`/`X509*` subtypes need.
#[derive(Debug, Clone)]
pub struct TransportParams {
    pub host: String,
    pub port: u16,
    /// Hostname used for TLS SNI / certificate validation. Defaults to
    /// `host` if not set explicitly.
    pub tls_server_name: Option<String>,
}

impl TransportParams {
    pub fn new(host: impl Into<String>, port: u16) -> TransportParams {
        TransportParams {
            host: host.into(),
            port,
            tls_server_name: None,
        }
    }

    pub fn server_name(&self) -> &str {
        self.tls_server_name.as_deref().unwrap_or(&self.host)
    }
}

/// Everything the connection engine needs to establish and run a
/// session, gathered in one place per spec §6 "Connect parameters".
pub struct ConnectParams {
    pub transport: TransportParams,
    pub allow_shared_connection: bool,
    /// Tight compression level, `-1` for server default.
    pub preferred_compression_level: i8,
    pub max_reconnect_attempts: Option<u32>,
    pub reconnect_delay: Duration,
    pub framebuffer_update_interval: Duration,
    pub pointer_event_interval: Duration,
    pub post_init_delay: Duration,
    pub post_set_encodings_delay: Duration,
    pub render_flags: RenderFlags,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RenderFlags {
    pub update_by_rectangle: bool,
    pub visualize_rectangles: bool,
}

impl ConnectParams {
    pub fn new(transport: TransportParams) -> ConnectParams {
        ConnectParams {
            transport,
            allow_shared_connection: true,
            preferred_compression_level: -1,
            max_reconnect_attempts: Some(5),
            reconnect_delay: Duration::from_secs(2),
            framebuffer_update_interval: Duration::from_millis(40),
            pointer_event_interval: Duration::from_millis(10),
            post_init_delay: Duration::from_millis(0),
            post_set_encodings_delay: Duration::from_millis(0),
            render_flags: RenderFlags::default(),
        }
    }
}
