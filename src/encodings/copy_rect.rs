//! CopyRect encoding (id 1): move pixels already present in the
//! framebuffer from a source position to the rectangle's destination.

use byteorder::{BigEndian, ReadBytesExt};
use std::io::Read;

use crate::error::Result;
use crate::rect::Rectangle;

use super::{DecodeContext, DecodeOutcome};

pub fn decode<R: Read>(reader: &mut R, ctx: &mut DecodeContext, rect: Rectangle) -> Result<DecodeOutcome> {
    let src_x = reader.read_u16::<BigEndian>()?;
    let src_y = reader.read_u16::<BigEndian>()?;
    ctx.framebuffer.copy_rect(rect, src_x, src_y);
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
    fn moves_pixels_from_source_to_destination() {
        let mut fb = FrameBuffer::new(4, 1, PixelFormat::rgba8888());
        fb.put_pixel(0, 0, 7);
        let format = PixelFormat::rgba8888();
        let colormap = ColorMap::new();
        let pool = Arc::new(BufferPool::new());
        let mut ctx = DecodeContext {
            framebuffer: &mut fb,
            colormap: &colormap,
            pool: &pool,
            server_format: &format,
        };
        let payload = [0u8, 0, 0, 0];
        let mut reader = &payload[..];
        decode(&mut reader, &mut ctx, Rectangle::new(2, 0, 1, 1)).unwrap();
        assert_eq!(fb.get_pixel(2, 0), 7);
    }
}
