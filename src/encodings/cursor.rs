//! Cursor shape pseudo-encodings. The rectangle's `(x, y)` carries the
//! cursor's hotspot rather than a framebuffer position for all three
//! variants; none of them touch the framebuffer itself.

use byteorder::{BigEndian, ReadBytesExt};
use std::io::Read;

use crate::error::{Error, Result};
use crate::rect::Rectangle;

use super::{DecodeContext, DecodeOutcome};

fn mask_row_bytes(width: u16) -> usize {
    (width as usize).div_ceil(8)
}

/// Spec §4.6: cursor pseudo-encodings must reject cursors larger than
/// 256x256; spec §7 classifies an oversized rectangle as a fatal
/// decoder error rather than something to clamp or skip.
fn reject_oversized_cursor(label: &'static str, rect: Rectangle) -> Result<()> {
    if rect.width > 256 || rect.height > 256 {
        return Err(Error::decoder(
            label,
            format!("cursor {}x{} exceeds the 256x256 limit", rect.width, rect.height),
        ));
    }
    Ok(())
}

/// `Cursor` (-239): a full RGBA cursor image, pixel data in the
/// server's current pixel format followed by a 1-bpp visibility mask.
pub fn decode_cursor<R: Read>(reader: &mut R, ctx: &mut DecodeContext, rect: Rectangle) -> Result<DecodeOutcome> {
    reject_oversized_cursor("cursor", rect)?;
    let area = rect.area();
    let pixels = crate::pixel::read_pixels(reader, ctx.server_format, area)?;

    let row_bytes = mask_row_bytes(rect.width);
    let mut mask = vec![0u8; row_bytes * rect.height as usize];
    reader.read_exact(&mut mask)?;

    let format = ctx.server_format;
    let mut rgba = Vec::with_capacity(area * 4);
    for (i, &raw) in pixels.iter().enumerate() {
        let row = i / rect.width.max(1) as usize;
        let col = i % rect.width.max(1) as usize;
        let visible = (mask[row * row_bytes + col / 8] >> (7 - col % 8)) & 1 != 0;
        let (r, g, b, _a) = format.channels(raw);
        let scale = |v: u16, max: u16| -> u8 {
            if max == 0 {
                0
            } else {
                ((v as u32 * 255) / max as u32) as u8
            }
        };
        rgba.push(scale(r, format.red_max));
        rgba.push(scale(g, format.green_max));
        rgba.push(scale(b, format.blue_max));
        rgba.push(if visible { 255 } else { 0 });
    }

    Ok(DecodeOutcome::Cursor {
        width: rect.width,
        height: rect.height,
        hotspot: (rect.x, rect.y),
        rgba,
    })
}

/// `XCursor` (-240): a 1-bpp bitmap using two explicit RGB colours
/// plus a separate visibility mask, mirroring the classic X11 cursor
/// representation.
pub fn decode_x_cursor<R: Read>(reader: &mut R, rect: Rectangle) -> Result<DecodeOutcome> {
    reject_oversized_cursor("x-cursor", rect)?;
    let area = rect.area();
    let (primary, secondary) = if area > 0 {
        let mut read_rgb = || -> Result<(u8, u8, u8)> { Ok((reader.read_u8()?, reader.read_u8()?, reader.read_u8()?)) };
        (read_rgb()?, read_rgb()?)
    } else {
        ((0, 0, 0), (0, 0, 0))
    };

    let row_bytes = mask_row_bytes(rect.width);
    let plane_len = row_bytes * rect.height as usize;
    let mut bitmap = vec![0u8; plane_len];
    reader.read_exact(&mut bitmap)?;
    let mut mask = vec![0u8; plane_len];
    reader.read_exact(&mut mask)?;

    Ok(DecodeOutcome::XCursor {
        width: rect.width,
        height: rect.height,
        hotspot: (rect.x, rect.y),
        primary,
        secondary,
        bitmap,
        mask,
    })
}

/// `CursorWithAlpha` (-314): an inner encoding selector (only Raw is
/// supported; TRLE-compressed cursor data is rare enough in the wild
/// that we surface a clear error rather than silently corrupting the
/// cursor) followed by straight RGBA8888 pixel data.
pub fn decode_cursor_with_alpha<R: Read>(
    reader: &mut R,
    _ctx: &mut DecodeContext,
    rect: Rectangle,
) -> Result<DecodeOutcome> {
    reject_oversized_cursor("cursor-with-alpha", rect)?;
    let inner_encoding = reader.read_i32::<BigEndian>()?;
    if inner_encoding != super::ids::RAW {
        return Err(Error::decoder(
            "cursor-with-alpha",
            format!("unsupported inner encoding {inner_encoding}, only Raw is implemented"),
        ));
    }
    let mut rgba_premultiplied = vec![0u8; rect.area() * 4];
    reader.read_exact(&mut rgba_premultiplied)?;

    Ok(DecodeOutcome::CursorWithAlpha {
        width: rect.width,
        height: rect.height,
        hotspot: (rect.x, rect.y),
        rgba_premultiplied,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::colormap::ColorMap;
    use crate::framebuffer::FrameBuffer;
    use crate::pixel::PixelFormat;
    use crate::pool::BufferPool;
    use std::sync::Arc;

    #[test]
    fn cursor_mask_controls_alpha_channel() {
        let mut fb = FrameBuffer::new(4, 4, PixelFormat::rgba8888());
        let format = PixelFormat::rgba8888();
        let colormap = ColorMap::new();
        let pool = Arc::new(BufferPool::new());
        let mut ctx = DecodeContext { framebuffer: &mut fb, colormap: &colormap, pool: &pool, server_format: &format };

        let mut data = Vec::new();
        // 2x1 cursor, both pixels white.
        data.extend_from_slice(&0x00FFFFFFu32.to_le_bytes());
        data.extend_from_slice(&0x00FFFFFFu32.to_le_bytes());
        data.push(0b1000_0000); // only the first pixel is visible

        let mut reader = &data[..];
        let outcome = decode_cursor(&mut reader, &mut ctx, Rectangle::new(1, 2, 2, 1)).unwrap();
        match outcome {
            DecodeOutcome::Cursor { hotspot, rgba, .. } => {
                assert_eq!(hotspot, (1, 2));
                assert_eq!(rgba[3], 255);
                assert_eq!(rgba[7], 0);
            }
            _ => panic!("wrong outcome variant"),
        }
    }

    #[test]
    fn oversized_cursor_is_rejected() {
        let mut fb = FrameBuffer::new(4, 4, PixelFormat::rgba8888());
        let format = PixelFormat::rgba8888();
        let colormap = ColorMap::new();
        let pool = Arc::new(BufferPool::new());
        let mut ctx = DecodeContext { framebuffer: &mut fb, colormap: &colormap, pool: &pool, server_format: &format };

        let mut reader: &[u8] = &[];
        let err = decode_cursor(&mut reader, &mut ctx, Rectangle::new(0, 0, 257, 257)).unwrap_err();
        assert!(matches!(err, Error::Decoder { .. }));
    }

    #[test]
    fn oversized_x_cursor_is_rejected_before_reading_bitmap() {
        let mut reader: &[u8] = &[];
        let err = decode_x_cursor(&mut reader, Rectangle::new(0, 0, 300, 10)).unwrap_err();
        assert!(matches!(err, Error::Decoder { .. }));
    }
}
