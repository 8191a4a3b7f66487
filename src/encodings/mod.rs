//! The rectangle decoder registry (spec §4.6).
//!
//! Encoding ids partition into *frame* encodings, which carry pixel
//! data for a rectangle, and *pseudo* encodings, whose rectangle only
//! conveys side-band control data (cursor shape, desktop resize,
//! end-of-update markers, ...). [`EncodingRegistry::decode`] dispatches
//! on the numeric id and returns a [`DecodeOutcome`] describing any
//! side effect beyond "pixels were written to the framebuffer" — the
//! framebuffer write itself happens in place as a side effect of the
//! call, mirroring how the pixel cursor in spec §4.2 is threaded
//! through the decoder rather than returned.

mod copy_rect;
mod cursor;
mod hextile;
mod pseudo;
mod raw;
mod rre;
mod tight;
mod zlib_stream;
mod zrle;

use std::io::Read;
use std::sync::Arc;

use crate::colormap::ColorMap;
use crate::error::{Error, Result};
use crate::framebuffer::FrameBuffer;
use crate::pixel::PixelFormat;
use crate::pool::BufferPool;
use crate::rect::{Rectangle, Screen};

pub mod ids {
    pub const RAW: i32 = 0;
    pub const COPY_RECT: i32 = 1;
    pub const RRE: i32 = 2;
    pub const CORRE: i32 = 4;
    pub const HEXTILE: i32 = 5;
    pub const ZLIB: i32 = 6;
    pub const TIGHT: i32 = 7;
    pub const ZRLE: i32 = 16;

    pub const DESKTOP_SIZE: i32 = -223;
    pub const LAST_RECT: i32 = -224;
    pub const CURSOR: i32 = -239;
    pub const X_CURSOR: i32 = -240;
    pub const QEMU_POINTER_MOTION_CHANGE: i32 = -257;
    pub const QEMU_EXTENDED_KEY_EVENT: i32 = -258;
    pub const QEMU_AUDIO: i32 = -259;
    pub const QEMU_LED_STATE: i32 = -261;
    pub const DESKTOP_NAME: i32 = -307;
    pub const EXTENDED_DESKTOP_SIZE: i32 = -308;
    pub const CURSOR_WITH_ALPHA: i32 = -314;

    /// Client→server hints with no receive-side payload: compression
    /// level (`-256..=-247`) and JPEG quality level (`-32..=-23`).
    pub fn is_compression_hint(id: i32) -> bool {
        (-256..=-247).contains(&id)
    }
    pub fn is_jpeg_quality_hint(id: i32) -> bool {
        (-32..=-23).contains(&id)
    }
}

/// Side effects a decode pass can produce beyond writing framebuffer
/// pixels in place.
#[derive(Debug, Clone)]
pub enum DecodeOutcome {
    /// Ordinary frame encoding; the framebuffer was updated in place.
    FramePainted,
    /// `DesktopSize` pseudo-encoding: the framebuffer must be resized.
    /// The next `FramebufferUpdateRequest` MUST be non-incremental.
    DesktopResized { width: u16, height: u16 },
    /// `ExtendedDesktopSize` pseudo-encoding.
    ExtendedDesktopResized {
        width: u16,
        height: u16,
        reason: u8,
        status: u8,
        screens: Vec<Screen>,
    },
    /// `LastRect`: the server is done even if it advertised more
    /// rectangles than it actually sent.
    LastRect,
    DesktopNameChanged(String),
    Cursor {
        width: u16,
        height: u16,
        hotspot: (u16, u16),
        rgba: Vec<u8>,
    },
    XCursor {
        width: u16,
        height: u16,
        hotspot: (u16, u16),
        primary: (u8, u8, u8),
        secondary: (u8, u8, u8),
        bitmap: Vec<u8>,
        mask: Vec<u8>,
    },
    CursorWithAlpha {
        width: u16,
        height: u16,
        hotspot: (u16, u16),
        rgba_premultiplied: Vec<u8>,
    },
    PointerModeChanged { relative: bool },
    ExtendedKeyEventSupported,
    LedStateChanged(u8),
    QemuAudio,
}

/// Everything a decoder needs, bundled so adding one doesn't require
/// touching every call site.
pub struct DecodeContext<'a> {
    pub framebuffer: &'a mut FrameBuffer,
    pub colormap: &'a ColorMap,
    pub pool: &'a Arc<BufferPool>,
    pub server_format: &'a PixelFormat,
}

/// Holds the decoder state that MUST persist across rectangles and
/// across whole `FramebufferUpdate` messages: zlib inflate streams
/// (Zlib/ZRLE/Tight) and Hextile's background/foreground carry-over.
#[derive(Default)]
pub struct EncodingRegistry {
    zlib: zlib_stream::ZlibStream,
    zrle: zlib_stream::ZlibStream,
    tight: tight::TightState,
    hextile: hextile::HextileState,
}

impl EncodingRegistry {
    pub fn new() -> EncodingRegistry {
        EncodingRegistry::default()
    }

    /// Resets all persistent inflate streams. Required whenever the
    /// server's pixel format or the encoding set changes in a way that
    /// would desync a mid-stream zlib decompressor (e.g. after a
    /// `SetPixelFormat`).
    pub fn reset_streams(&mut self) {
        self.zlib = zlib_stream::ZlibStream::default();
        self.zrle = zlib_stream::ZlibStream::default();
        self.tight = tight::TightState::default();
    }

    pub fn decode<R: Read>(
        &mut self,
        reader: &mut R,
        ctx: &mut DecodeContext,
        rect: Rectangle,
        encoding: i32,
    ) -> Result<DecodeOutcome> {
        match encoding {
            ids::RAW => raw::decode(reader, ctx, rect),
            ids::COPY_RECT => copy_rect::decode(reader, ctx, rect),
            ids::RRE => rre::decode_rre(reader, ctx, rect),
            ids::CORRE => rre::decode_corre(reader, ctx, rect),
            ids::HEXTILE => hextile::decode(reader, ctx, rect, &mut self.hextile),
            ids::ZLIB => zlib_stream::decode_zlib_encoding(reader, ctx, rect, &mut self.zlib),
            ids::TIGHT => tight::decode(reader, ctx, rect, &mut self.tight),
            ids::ZRLE => zrle::decode(reader, ctx, rect, &mut self.zrle),
            ids::DESKTOP_SIZE => pseudo::decode_desktop_size(rect),
            ids::EXTENDED_DESKTOP_SIZE => pseudo::decode_extended_desktop_size(reader, rect),
            ids::LAST_RECT => Ok(DecodeOutcome::LastRect),
            ids::DESKTOP_NAME => pseudo::decode_desktop_name(reader),
            ids::CURSOR => cursor::decode_cursor(reader, ctx, rect),
            ids::X_CURSOR => cursor::decode_x_cursor(reader, rect),
            ids::CURSOR_WITH_ALPHA => cursor::decode_cursor_with_alpha(reader, ctx, rect),
            ids::QEMU_POINTER_MOTION_CHANGE => Ok(DecodeOutcome::PointerModeChanged {
                relative: rect.x == 1,
            }),
            ids::QEMU_EXTENDED_KEY_EVENT => Ok(DecodeOutcome::ExtendedKeyEventSupported),
            ids::QEMU_LED_STATE => Ok(DecodeOutcome::LedStateChanged(rect.x as u8)),
            ids::QEMU_AUDIO => Ok(DecodeOutcome::QemuAudio),
            other => Err(Error::Protocol(format!(
                "unknown encoding id {other}: cannot skip (length is not self-describing)"
            ))),
        }
    }
}

pub(crate) use ids::*;
