//! RRE (id 2) and CoRRE (id 4) encodings: a background fill followed by
//! a list of solid-colour sub-rectangles. CoRRE is RRE with the
//! sub-rectangle count capped at 255x255 and coordinates/sizes carried
//! as bytes instead of u16s, which keeps per-subrectangle overhead down
//! for small tiles.

use byteorder::{BigEndian, ReadBytesExt};
use std::io::Read;

use crate::error::Result;
use crate::rect::Rectangle;

use super::{DecodeContext, DecodeOutcome};

pub fn decode_rre<R: Read>(reader: &mut R, ctx: &mut DecodeContext, rect: Rectangle) -> Result<DecodeOutcome> {
    let count = reader.read_u32::<BigEndian>()?;
    let background = ctx.server_format.read_raw_pixel(reader)?;
    ctx.framebuffer.fill_rect(rect, convert(ctx, background));

    for _ in 0..count {
        let pixel = ctx.server_format.read_raw_pixel(reader)?;
        let x = reader.read_u16::<BigEndian>()?;
        let y = reader.read_u16::<BigEndian>()?;
        let w = reader.read_u16::<BigEndian>()?;
        let h = reader.read_u16::<BigEndian>()?;
        let sub = Rectangle::new(rect.x + x, rect.y + y, w, h);
        let raw = convert(ctx, pixel);
        ctx.framebuffer.fill_rect(sub, raw);
    }
    Ok(DecodeOutcome::FramePainted)
}

pub fn decode_corre<R: Read>(reader: &mut R, ctx: &mut DecodeContext, rect: Rectangle) -> Result<DecodeOutcome> {
    let count = reader.read_u32::<BigEndian>()?;
    let background = ctx.server_format.read_raw_pixel(reader)?;
    ctx.framebuffer.fill_rect(rect, convert(ctx, background));

    for _ in 0..count {
        let pixel = ctx.server_format.read_raw_pixel(reader)?;
        let x = reader.read_u8()?;
        let y = reader.read_u8()?;
        let w = reader.read_u8()?;
        let h = reader.read_u8()?;
        let sub = Rectangle::new(rect.x + x as u16, rect.y + y as u16, w as u16, h as u16);
        let raw = convert(ctx, pixel);
        ctx.framebuffer.fill_rect(sub, raw);
    }
    Ok(DecodeOutcome::FramePainted)
}

fn convert(ctx: &DecodeContext, raw: u32) -> u32 {
    crate::pixel::convert_pixel(raw, ctx.server_format, ctx.framebuffer.format(), Some(ctx.colormap))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::colormap::ColorMap;
    use crate::framebuffer::FrameBuffer;
    use crate::pixel::PixelFormat;
    use crate::pool::BufferPool;
    use std::sync::Arc;

    fn ctx_harness() -> (FrameBuffer, PixelFormat, ColorMap, Arc<BufferPool>) {
        (
            FrameBuffer::new(8, 8, PixelFormat::rgba8888()),
            PixelFormat::rgba8888(),
            ColorMap::new(),
            Arc::new(BufferPool::new()),
        )
    }

    #[test]
    fn rre_fills_background_then_subrects() {
        let (mut fb, format, colormap, pool) = ctx_harness();
        let mut ctx = DecodeContext { framebuffer: &mut fb, colormap: &colormap, pool: &pool, server_format: &format };
        let mut data = Vec::new();
        data.extend_from_slice(&1u32.to_be_bytes());
        data.extend_from_slice(&0u32.to_le_bytes()); // background = 0
        data.extend_from_slice(&0xFFu32.to_le_bytes()); // subrect pixel
        data.extend_from_slice(&1u16.to_be_bytes()); // x
        data.extend_from_slice(&1u16.to_be_bytes()); // y
        data.extend_from_slice(&2u16.to_be_bytes()); // w
        data.extend_from_slice(&2u16.to_be_bytes()); // h
        let mut reader = &data[..];
        decode_rre(&mut reader, &mut ctx, Rectangle::new(0, 0, 8, 8)).unwrap();
        assert_eq!(fb.get_pixel(0, 0), 0);
        assert_eq!(fb.get_pixel(1, 1), 0xFF);
    }

    #[test]
    fn corre_reads_byte_sized_subrect_geometry() {
        let (mut fb, format, colormap, pool) = ctx_harness();
        let mut ctx = DecodeContext { framebuffer: &mut fb, colormap: &colormap, pool: &pool, server_format: &format };
        let mut data = Vec::new();
        data.extend_from_slice(&1u32.to_be_bytes());
        data.extend_from_slice(&0u32.to_le_bytes());
        data.extend_from_slice(&0xABu32.to_le_bytes());
        data.extend_from_slice(&[2u8, 2, 1, 1]);
        let mut reader = &data[..];
        decode_corre(&mut reader, &mut ctx, Rectangle::new(0, 0, 8, 8)).unwrap();
        assert_eq!(fb.get_pixel(2, 2), 0xAB);
    }
}
