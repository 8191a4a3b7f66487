//! Pseudo-encodings that carry no pixel data: desktop resize
//! notifications and the desktop name. Qemu's pointer-mode/extended-key
//! /LED-state/audio pseudo-encodings are dispatched directly in
//! `EncodingRegistry::decode` since they need nothing but the
//! rectangle's own fields.

use byteorder::{BigEndian, ReadBytesExt};
use std::io::Read;

use crate::error::Result;
use crate::rect::{Rectangle, Screen};

use super::DecodeOutcome;

/// `DesktopSize` (-223): the rectangle's width/height are the new
/// framebuffer dimensions; there's no further payload.
pub fn decode_desktop_size(rect: Rectangle) -> Result<DecodeOutcome> {
    Ok(DecodeOutcome::DesktopResized {
        width: rect.width,
        height: rect.height,
    })
}

/// `ExtendedDesktopSize` (-308): the rectangle's `x`/`y` fields are
/// repurposed to carry a reason code and a status code; width/height
/// are the new framebuffer dimensions. The payload describes the
/// resulting multi-monitor screen layout.
pub fn decode_extended_desktop_size<R: Read>(reader: &mut R, rect: Rectangle) -> Result<DecodeOutcome> {
    let screen_count = reader.read_u8()?;
    let mut padding = [0u8; 3];
    reader.read_exact(&mut padding)?;

    let mut screens = Vec::with_capacity(screen_count as usize);
    for _ in 0..screen_count {
        let id = reader.read_u32::<BigEndian>()?;
        let x = reader.read_u16::<BigEndian>()?;
        let y = reader.read_u16::<BigEndian>()?;
        let width = reader.read_u16::<BigEndian>()?;
        let height = reader.read_u16::<BigEndian>()?;
        let flags = reader.read_u32::<BigEndian>()?;
        screens.push(Screen {
            id,
            bounds: Rectangle::new(x, y, width, height),
            flags,
        });
    }

    Ok(DecodeOutcome::ExtendedDesktopResized {
        width: rect.width,
        height: rect.height,
        reason: rect.x as u8,
        status: rect.y as u8,
        screens,
    })
}

/// `DesktopName` (-307): a length-prefixed UTF-8 string replacing the
/// name given at handshake time.
pub fn decode_desktop_name<R: Read>(reader: &mut R) -> Result<DecodeOutcome> {
    let len = reader.read_u32::<BigEndian>()? as usize;
    let mut bytes = vec![0u8; len];
    reader.read_exact(&mut bytes)?;
    Ok(DecodeOutcome::DesktopNameChanged(String::from_utf8_lossy(&bytes).into_owned()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn desktop_size_reports_new_dimensions() {
        let outcome = decode_desktop_size(Rectangle::new(0, 0, 1024, 768)).unwrap();
        match outcome {
            DecodeOutcome::DesktopResized { width, height } => {
                assert_eq!((width, height), (1024, 768));
            }
            _ => panic!("wrong outcome variant"),
        }
    }

    #[test]
    fn extended_desktop_size_parses_screen_list() {
        let mut data = vec![1u8, 0, 0, 0]; // 1 screen + padding
        data.extend_from_slice(&7u32.to_be_bytes()); // id
        data.extend_from_slice(&0u16.to_be_bytes()); // x
        data.extend_from_slice(&0u16.to_be_bytes()); // y
        data.extend_from_slice(&1920u16.to_be_bytes()); // width
        data.extend_from_slice(&1080u16.to_be_bytes()); // height
        data.extend_from_slice(&0u32.to_be_bytes()); // flags
        let mut reader = &data[..];
        let outcome = decode_extended_desktop_size(&mut reader, Rectangle::new(0, 0, 1920, 1080)).unwrap();
        match outcome {
            DecodeOutcome::ExtendedDesktopResized { screens, .. } => {
                assert_eq!(screens.len(), 1);
                assert_eq!(screens[0].id, 7);
                assert_eq!(screens[0].bounds.width, 1920);
            }
            _ => panic!("wrong outcome variant"),
        }
    }
}
