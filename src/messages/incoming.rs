//! Server-to-client message headers (spec §4.5), everything except the
//! `FramebufferUpdate` rectangle stream itself (that's
//! [`crate::encodings::EncodingRegistry`]'s job once this module has
//! peeled off the one-byte opcode and the message's own fixed header).

use byteorder::{BigEndian, ReadBytesExt};
use std::io::Read;

use crate::colormap::ColorMapEntry;
use crate::error::{Error, Result};

use super::opcodes;

/// One parsed incoming message header. `FramebufferUpdate` only carries
/// the rectangle count — the caller reads `rect_count` rectangle
/// headers itself, dispatching each to the encoding registry.
#[derive(Debug)]
pub enum IncomingMessage {
    FramebufferUpdate { rect_count: u16 },
    SetColorMapEntries { first_color: u16, entries: Vec<ColorMapEntry> },
    Bell,
    ServerCutText(CutText),
    XvpServer { version: u8, code: u8 },
}

#[derive(Debug)]
pub enum CutText {
    Plain(String),
    Extended(ExtendedClipboardMessage),
}

/// Extended-clipboard action, decoded from the top byte of the control
/// word's flags (bits 24-28). Only one action bit is ever set per
/// message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClipboardAction {
    Caps,
    Request,
    Peek,
    Notify,
    Provide,
}

pub const FORMAT_TEXT: u32 = 1 << 0;
pub const FORMAT_RTF: u32 = 1 << 1;
pub const FORMAT_HTML: u32 = 1 << 2;
pub const FORMAT_DIB: u32 = 1 << 3;
pub const FORMAT_FILES: u32 = 1 << 4;
const FORMAT_BITS: [u32; 5] = [FORMAT_TEXT, FORMAT_RTF, FORMAT_HTML, FORMAT_DIB, FORMAT_FILES];

const ACTION_CAPS: u32 = 1 << 24;
const ACTION_REQUEST: u32 = 1 << 25;
const ACTION_PEEK: u32 = 1 << 26;
const ACTION_NOTIFY: u32 = 1 << 27;
const ACTION_PROVIDE: u32 = 1 << 28;

#[derive(Debug)]
pub struct ExtendedClipboardMessage {
    pub action: ClipboardAction,
    /// Format bits the message applies to (`FORMAT_*`).
    pub formats: u32,
    /// `Caps`: the server's advertised per-format size limit, in the
    /// same order as the set bits in `formats` (ascending bit index).
    pub caps_max_sizes: Vec<u32>,
    /// `Provide`: the zlib-inflated per-format payloads, one entry per
    /// set bit in `formats`, ascending bit index.
    pub provided: Vec<Vec<u8>>,
}

/// RFB cut-text strings are Latin-1, not UTF-8: every byte maps
/// directly to the Unicode code point of the same value.
pub fn latin1_to_string(bytes: &[u8]) -> String {
    bytes.iter().map(|&b| b as char).collect()
}

pub fn read_header<R: Read>(reader: &mut R) -> Result<IncomingMessage> {
    let opcode = reader.read_u8()?;
    match opcode {
        opcodes::FRAMEBUFFER_UPDATE => {
            let mut padding = [0u8; 1];
            reader.read_exact(&mut padding)?;
            let rect_count = reader.read_u16::<BigEndian>()?;
            Ok(IncomingMessage::FramebufferUpdate { rect_count })
        }
        opcodes::SET_COLOR_MAP_ENTRIES => {
            let mut padding = [0u8; 1];
            reader.read_exact(&mut padding)?;
            let first_color = reader.read_u16::<BigEndian>()?;
            let count = reader.read_u16::<BigEndian>()?;
            let mut entries = Vec::with_capacity(count as usize);
            for _ in 0..count {
                entries.push(ColorMapEntry {
                    red: reader.read_u16::<BigEndian>()?,
                    green: reader.read_u16::<BigEndian>()?,
                    blue: reader.read_u16::<BigEndian>()?,
                });
            }
            Ok(IncomingMessage::SetColorMapEntries { first_color, entries })
        }
        opcodes::BELL => Ok(IncomingMessage::Bell),
        opcodes::SERVER_CUT_TEXT => {
            let mut padding = [0u8; 3];
            reader.read_exact(&mut padding)?;
            let raw_len = reader.read_i32::<BigEndian>()?;
            if raw_len < 0 {
                let len = (raw_len as i64).unsigned_abs() as usize;
                let mut payload = vec![0u8; len];
                reader.read_exact(&mut payload)?;
                Ok(IncomingMessage::ServerCutText(CutText::Extended(
                    parse_extended_clipboard(&payload)?,
                )))
            } else {
                let mut bytes = vec![0u8; raw_len as usize];
                reader.read_exact(&mut bytes)?;
                Ok(IncomingMessage::ServerCutText(CutText::Plain(latin1_to_string(&bytes))))
            }
        }
        opcodes::XVP_SERVER => {
            let mut padding = [0u8; 1];
            reader.read_exact(&mut padding)?;
            let version = reader.read_u8()?;
            let code = reader.read_u8()?;
            Ok(IncomingMessage::XvpServer { version, code })
        }
        other => Err(Error::Protocol(format!(
            "unknown incoming message opcode {other}: cannot skip (length is not self-describing)"
        ))),
    }
}

fn parse_extended_clipboard(payload: &[u8]) -> Result<ExtendedClipboardMessage> {
    if payload.len() < 4 {
        return Err(Error::Protocol("extended clipboard control word too short".into()));
    }
    let flags = u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]);
    let formats = flags & 0xFFFF;
    let mut body = &payload[4..];

    let action = if flags & ACTION_CAPS != 0 {
        ClipboardAction::Caps
    } else if flags & ACTION_REQUEST != 0 {
        ClipboardAction::Request
    } else if flags & ACTION_PEEK != 0 {
        ClipboardAction::Peek
    } else if flags & ACTION_NOTIFY != 0 {
        ClipboardAction::Notify
    } else if flags & ACTION_PROVIDE != 0 {
        ClipboardAction::Provide
    } else {
        return Err(Error::Protocol("extended clipboard control word has no action bit set".into()));
    };

    let mut caps_max_sizes = Vec::new();
    if action == ClipboardAction::Caps {
        for bit in FORMAT_BITS {
            if formats & bit != 0 {
                caps_max_sizes.push(body.read_u32::<BigEndian>()?);
            }
        }
    }

    let mut provided = Vec::new();
    if action == ClipboardAction::Provide {
        let inflated = inflate_clipboard_payload(body)?;
        let mut cursor = &inflated[..];
        for bit in FORMAT_BITS {
            if formats & bit != 0 {
                let len = cursor.read_u32::<BigEndian>()? as usize;
                let mut data = vec![0u8; len];
                cursor.read_exact(&mut data)?;
                provided.push(data);
            }
        }
    }

    Ok(ExtendedClipboardMessage { action, formats, caps_max_sizes, provided })
}

fn inflate_clipboard_payload(compressed: &[u8]) -> Result<Vec<u8>> {
    use std::io::Write;
    let mut decoder = flate2::write::ZlibDecoder::new(Vec::new());
    decoder
        .write_all(compressed)
        .map_err(|e| Error::decoder("extended-clipboard", e.to_string()))?;
    decoder.finish().map_err(|e| Error::decoder("extended-clipboard", e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_cut_text_round_trips_latin1() {
        let mut data = vec![opcodes::SERVER_CUT_TEXT];
        data.extend_from_slice(&[0u8; 3]); // padding
        data.extend_from_slice(&5i32.to_be_bytes());
        data.extend_from_slice(b"hello");
        let mut reader = &data[..];
        let msg = read_header(&mut reader).unwrap();
        match msg {
            IncomingMessage::ServerCutText(CutText::Plain(s)) => assert_eq!(s, "hello"),
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn negative_length_is_rejected_without_compressed_body() {
        // flags = Caps | FORMAT_TEXT, but body is too short for the
        // one u32 max-size entry the caps bit promises.
        let flags: u32 = (1 << 24) | FORMAT_TEXT;
        let mut payload = flags.to_be_bytes().to_vec();
        payload.extend_from_slice(&1u16.to_be_bytes()); // short, not a full u32
        assert!(parse_extended_clipboard(&payload).is_err());
    }

    #[test]
    fn caps_message_reports_advertised_limits() {
        let flags: u32 = (1 << 24) | FORMAT_TEXT | FORMAT_HTML;
        let mut payload = flags.to_be_bytes().to_vec();
        payload.extend_from_slice(&1000u32.to_be_bytes());
        payload.extend_from_slice(&2000u32.to_be_bytes());
        let msg = parse_extended_clipboard(&payload).unwrap();
        assert_eq!(msg.action, ClipboardAction::Caps);
        assert_eq!(msg.caps_max_sizes, vec![1000, 2000]);
    }

    #[test]
    fn bell_has_no_payload() {
        let data = [opcodes::BELL];
        let mut reader = &data[..];
        assert!(matches!(read_header(&mut reader).unwrap(), IncomingMessage::Bell));
    }
}
