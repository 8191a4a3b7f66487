//! The message dispatcher (spec §4.5): wire opcodes for the messages
//! that aren't rectangle-carrying `FramebufferUpdate` payloads (those
//! are handled by [`crate::encodings`] once the receive loop has peeled
//! off the rectangle header).
//!
//! Incoming opcodes are not self-describing in length — an unknown one
//! cannot be skipped, only treated as a fatal protocol error that ends
//! the receive loop (spec §4.5 "Unknown opcodes cannot be skipped").

pub mod incoming;
pub mod outgoing;

pub use incoming::{ExtendedClipboardMessage, IncomingMessage};
pub use outgoing::OutgoingMessage;

pub mod opcodes {
    pub const FRAMEBUFFER_UPDATE: u8 = 0;
    pub const SET_COLOR_MAP_ENTRIES: u8 = 1;
    pub const BELL: u8 = 2;
    pub const SERVER_CUT_TEXT: u8 = 3;
    pub const XVP_SERVER: u8 = 250;

    pub const SET_PIXEL_FORMAT: u8 = 0;
    pub const SET_ENCODINGS: u8 = 2;
    pub const FRAMEBUFFER_UPDATE_REQUEST: u8 = 3;
    pub const KEY_EVENT: u8 = 4;
    pub const POINTER_EVENT: u8 = 5;
    pub const CLIENT_CUT_TEXT: u8 = 6;
    pub const XVP_CLIENT: u8 = 250;
    pub const QEMU_CLIENT: u8 = 255;
}
