//! Raw encoding (id 0): pixels in row-major order, no compression.

use std::io::Read;

use crate::error::Result;
use crate::pixel::read_pixels;
use crate::rect::Rectangle;

use super::{DecodeContext, DecodeOutcome};

pub fn decode<R: Read>(reader: &mut R, ctx: &mut DecodeContext, rect: Rectangle) -> Result<DecodeOutcome> {
    let pixels = read_pixels(reader, ctx.server_format, rect.area())?;
    ctx.framebuffer.blit(rect, &pixels, ctx.server_format, Some(ctx.colormap));
    Ok(DecodeOutcome::FramePainted)
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
    fn decodes_a_solid_rectangle() {
        let mut fb = FrameBuffer::new(4, 4, PixelFormat::rgba8888());
        let format = PixelFormat::rgba8888();
        let colormap = ColorMap::new();
        let pool = Arc::new(BufferPool::new());
        let mut ctx = DecodeContext {
            framebuffer: &mut fb,
            colormap: &colormap,
            pool: &pool,
            server_format: &format,
        };
        let rect = Rectangle::new(1, 1, 2, 2);
        let mut data = Vec::new();
        for _ in 0..rect.area() {
            data.extend_from_slice(&0x11223344u32.to_le_bytes());
        }
        let mut reader = &data[..];
        decode(&mut reader, &mut ctx, rect).unwrap();
        assert_eq!(fb.get_pixel(1, 1), 0x11223344);
        assert_eq!(fb.get_pixel(0, 0), 0);
    }
}
