//! Hextile encoding (id 5): the rectangle is tiled into (at most) 16x16
//! blocks, each carrying its own subencoding mask. Background and
//! foreground colours carry over from one tile to the next within a
//! rectangle, which is why this needs any state at all — a tile that
//! doesn't specify `BackgroundSpecified`/`ForegroundSpecified` reuses
//! whatever the previous tile established.

use byteorder::ReadBytesExt;
use std::io::Read;

use crate::error::Result;
use crate::rect::Rectangle;

use super::{DecodeContext, DecodeOutcome};

const RAW: u8 = 0x01;
const BACKGROUND_SPECIFIED: u8 = 0x02;
const FOREGROUND_SPECIFIED: u8 = 0x04;
const ANY_SUBRECTS: u8 = 0x08;
const SUBRECTS_COLOURED: u8 = 0x10;

const TILE_SIZE: u16 = 16;

/// Carries no cross-rectangle state of its own; background/foreground
/// carry-over only needs to survive tile-to-tile within one rectangle,
/// which [`decode`] tracks with local variables. Kept as a named type
/// (rather than removed) so the registry's per-encoding state table
/// stays uniform and future stateful needs (e.g. tile checksums) have
/// somewhere to live.
#[derive(Default)]
pub struct HextileState;

pub fn decode<R: Read>(
    reader: &mut R,
    ctx: &mut DecodeContext,
    rect: Rectangle,
    _state: &mut HextileState,
) -> Result<DecodeOutcome> {
    let mut background: u32 = 0;
    let mut foreground: u32 = 0;

    let mut y = rect.y;
    while y < rect.y + rect.height {
        let tile_h = TILE_SIZE.min(rect.y + rect.height - y);
        let mut x = rect.x;
        while x < rect.x + rect.width {
            let tile_w = TILE_SIZE.min(rect.x + rect.width - x);
            let tile_rect = Rectangle::new(x, y, tile_w, tile_h);
            let mask = reader.read_u8()?;

            if mask & RAW != 0 {
                let pixels = crate::pixel::read_pixels(reader, ctx.server_format, tile_rect.area())?;
                ctx.framebuffer.blit(tile_rect, &pixels, ctx.server_format, Some(ctx.colormap));
                x += tile_w;
                continue;
            }

            if mask & BACKGROUND_SPECIFIED != 0 {
                background = ctx.server_format.read_raw_pixel(reader)?;
            }
            if mask & FOREGROUND_SPECIFIED != 0 {
                foreground = ctx.server_format.read_raw_pixel(reader)?;
            }
            ctx.framebuffer.fill_rect(tile_rect, convert(ctx, background));

            if mask & ANY_SUBRECTS != 0 {
                let count = reader.read_u8()?;
                let coloured = mask & SUBRECTS_COLOURED != 0;
                for _ in 0..count {
                    let pixel = if coloured {
                        ctx.server_format.read_raw_pixel(reader)?
                    } else {
                        foreground
                    };
                    let xy = reader.read_u8()?;
                    let wh = reader.read_u8()?;
                    let sx = xy >> 4;
                    let sy = xy & 0x0F;
                    let sw = (wh >> 4) + 1;
                    let sh = (wh & 0x0F) + 1;
                    let sub = Rectangle::new(x + sx as u16, y + sy as u16, sw as u16, sh as u16);
                    let raw = convert(ctx, pixel);
                    ctx.framebuffer.fill_rect(sub, raw);
                }
            }
            x += tile_w;
        }
        y += tile_h;
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

    #[test]
    fn background_only_tile_fills_whole_tile() {
        let mut fb = FrameBuffer::new(16, 16, PixelFormat::rgba8888());
        let format = PixelFormat::rgba8888();
        let colormap = ColorMap::new();
        let pool = Arc::new(BufferPool::new());
        let mut ctx = DecodeContext { framebuffer: &mut fb, colormap: &colormap, pool: &pool, server_format: &format };
        let mut data = Vec::new();
        data.push(BACKGROUND_SPECIFIED);
        data.extend_from_slice(&0x55u32.to_le_bytes());
        let mut reader = &data[..];
        let mut state = HextileState::default();
        decode(&mut reader, &mut ctx, Rectangle::new(0, 0, 16, 16), &mut state).unwrap();
        assert_eq!(fb.get_pixel(0, 0), 0x55);
        assert_eq!(fb.get_pixel(15, 15), 0x55);
    }

    #[test]
    fn background_carries_over_to_tile_without_one() {
        let mut fb = FrameBuffer::new(32, 16, PixelFormat::rgba8888());
        let format = PixelFormat::rgba8888();
        let colormap = ColorMap::new();
        let pool = Arc::new(BufferPool::new());
        let mut ctx = DecodeContext { framebuffer: &mut fb, colormap: &colormap, pool: &pool, server_format: &format };
        let mut data = Vec::new();
        data.push(BACKGROUND_SPECIFIED);
        data.extend_from_slice(&0x77u32.to_le_bytes());
        data.push(0); // second tile: no bits set, reuse background
        let mut reader = &data[..];
        let mut state = HextileState::default();
        decode(&mut reader, &mut ctx, Rectangle::new(0, 0, 32, 16), &mut state).unwrap();
        assert_eq!(fb.get_pixel(20, 0), 0x77);
    }
}
