//! Client-to-server messages (spec §4.5). Each variant knows its own
//! wire opcode and fixed layout; `write` serializes directly to the
//! send worker's transport.

use byteorder::WriteBytesExt;
use std::io::Write;

use crate::error::Result;
use crate::pixel::PixelFormat;

use super::opcodes;

#[derive(Debug, Clone)]
pub enum OutgoingMessage {
    SetPixelFormat(PixelFormat),
    SetEncodings(Vec<i32>),
    FramebufferUpdateRequest { incremental: bool, x: u16, y: u16, width: u16, height: u16 },
    KeyEvent { down: bool, keysym: u32 },
    PointerEvent { buttons: u8, x: u16, y: u16 },
    ClientCutText(String),
    QemuExtendedKeyEvent { down: bool, keysym: u32, keycode: u32 },
    XvpClient { version: u8, op: u8 },
}

impl OutgoingMessage {
    /// The wire opcode this message is sent under, for the
    /// `UsedMessageTypes` bookkeeping the connection state keeps.
    pub fn opcode(&self) -> u8 {
        match self {
            OutgoingMessage::SetPixelFormat(_) => opcodes::SET_PIXEL_FORMAT,
            OutgoingMessage::SetEncodings(_) => opcodes::SET_ENCODINGS,
            OutgoingMessage::FramebufferUpdateRequest { .. } => opcodes::FRAMEBUFFER_UPDATE_REQUEST,
            OutgoingMessage::KeyEvent { .. } => opcodes::KEY_EVENT,
            OutgoingMessage::PointerEvent { .. } => opcodes::POINTER_EVENT,
            OutgoingMessage::ClientCutText(_) => opcodes::CLIENT_CUT_TEXT,
            OutgoingMessage::QemuExtendedKeyEvent { .. } => opcodes::QEMU_CLIENT,
            OutgoingMessage::XvpClient { .. } => opcodes::XVP_CLIENT,
        }
    }

    pub fn write<W: Write>(&self, w: &mut W) -> Result<()> {
        match self {
            OutgoingMessage::SetPixelFormat(format) => {
                crate::protocol::write_set_pixel_format(w, format)?;
            }
            OutgoingMessage::SetEncodings(encodings) => {
                w.write_u8(opcodes::SET_ENCODINGS)?;
                w.write_u8(0)?;
                w.write_u16::<byteorder::BigEndian>(encodings.len() as u16)?;
                for &encoding in encodings {
                    w.write_i32::<byteorder::BigEndian>(encoding)?;
                }
            }
            OutgoingMessage::FramebufferUpdateRequest { incremental, x, y, width, height } => {
                w.write_u8(opcodes::FRAMEBUFFER_UPDATE_REQUEST)?;
                w.write_u8(if *incremental { 1 } else { 0 })?;
                w.write_u16::<byteorder::BigEndian>(*x)?;
                w.write_u16::<byteorder::BigEndian>(*y)?;
                w.write_u16::<byteorder::BigEndian>(*width)?;
                w.write_u16::<byteorder::BigEndian>(*height)?;
            }
            OutgoingMessage::KeyEvent { down, keysym } => {
                w.write_u8(opcodes::KEY_EVENT)?;
                w.write_u8(if *down { 1 } else { 0 })?;
                w.write_u16::<byteorder::BigEndian>(0)?;
                w.write_u32::<byteorder::BigEndian>(*keysym)?;
            }
            OutgoingMessage::PointerEvent { buttons, x, y } => {
                w.write_u8(opcodes::POINTER_EVENT)?;
                w.write_u8(*buttons)?;
                w.write_u16::<byteorder::BigEndian>(*x)?;
                w.write_u16::<byteorder::BigEndian>(*y)?;
            }
            OutgoingMessage::ClientCutText(text) => {
                w.write_u8(opcodes::CLIENT_CUT_TEXT)?;
                w.write_all(&[0u8; 3])?;
                let bytes: Vec<u8> = text.chars().map(|c| if (c as u32) < 256 { c as u8 } else { b'?' }).collect();
                w.write_u32::<byteorder::BigEndian>(bytes.len() as u32)?;
                w.write_all(&bytes)?;
            }
            OutgoingMessage::QemuExtendedKeyEvent { down, keysym, keycode } => {
                w.write_u8(opcodes::QEMU_CLIENT)?;
                w.write_u8(0)?; // QEMU extended-key sub-message
                w.write_u16::<byteorder::BigEndian>(if *down { 1 } else { 0 })?;
                w.write_u32::<byteorder::BigEndian>(*keysym)?;
                w.write_u32::<byteorder::BigEndian>(*keycode)?;
            }
            OutgoingMessage::XvpClient { version, op } => {
                w.write_u8(opcodes::XVP_CLIENT)?;
                w.write_u8(0)?;
                w.write_u8(*version)?;
                w.write_u8(*op)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pixel::PixelFormat;

    #[test]
    fn set_encodings_writes_count_and_entries() {
        let msg = OutgoingMessage::SetEncodings(vec![0, 1, -239]);
        let mut buf = Vec::new();
        msg.write(&mut buf).unwrap();
        assert_eq!(buf[0], opcodes::SET_ENCODINGS);
        assert_eq!(u16::from_be_bytes([buf[2], buf[3]]), 3);
        assert_eq!(buf.len(), 4 + 3 * 4);
    }

    #[test]
    fn framebuffer_update_request_layout() {
        let msg = OutgoingMessage::FramebufferUpdateRequest { incremental: true, x: 1, y: 2, width: 3, height: 4 };
        let mut buf = Vec::new();
        msg.write(&mut buf).unwrap();
        assert_eq!(buf, vec![opcodes::FRAMEBUFFER_UPDATE_REQUEST, 1, 0, 1, 0, 2, 0, 3, 0, 4]);
    }

    #[test]
    fn cut_text_replaces_non_latin1_with_question_mark() {
        let msg = OutgoingMessage::ClientCutText("a\u{1F600}b".to_string());
        let mut buf = Vec::new();
        msg.write(&mut buf).unwrap();
        assert_eq!(&buf[8..], b"a?b");
    }

    #[test]
    fn set_pixel_format_delegates_to_protocol_writer() {
        let msg = OutgoingMessage::SetPixelFormat(PixelFormat::rgb888());
        let mut buf = Vec::new();
        msg.write(&mut buf).unwrap();
        assert_eq!(buf[0], opcodes::SET_PIXEL_FORMAT);
        assert_eq!(buf.len(), 1 + 3 + 16);
    }
}
