//! Shared zlib inflate-stream plumbing for the Zlib (id 6) and ZRLE
//! (id 16) encodings, both of which multiplex a single persistent
//! `deflate` stream across rectangles and even across whole
//! `FramebufferUpdate` messages — restarting the stream per-rectangle
//! would lose the shared dictionary and desync the server, which never
//! resets its compressor.

use byteorder::{BigEndian, ReadBytesExt};
use flate2::{Decompress, FlushDecompress, Status};
use std::io::Read;

use crate::error::{Error, Result};
use crate::rect::Rectangle;

use super::{DecodeContext, DecodeOutcome};

pub struct ZlibStream {
    inflate: Decompress,
}

impl Default for ZlibStream {
    fn default() -> ZlibStream {
        ZlibStream {
            inflate: Decompress::new(true),
        }
    }
}

impl ZlibStream {
    /// Feeds the whole of `compressed` into the persistent stream and
    /// returns whatever plaintext it produced. The server sync-flushes
    /// at each rectangle boundary, so by the time all of `compressed`
    /// has been consumed every byte it can yield has been yielded —
    /// this doesn't need to know the plaintext length up front, unlike
    /// a one-shot inflate.
    pub fn inflate_all(&mut self, compressed: &[u8]) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(compressed.len() * 3 + 64);
        let mut chunk = vec![0u8; 16 * 1024];
        let before_in = self.inflate.total_in();
        let mut in_pos = 0usize;

        loop {
            let before_out = self.inflate.total_out();
            let status = self
                .inflate
                .decompress(&compressed[in_pos..], &mut chunk, FlushDecompress::None)
                .map_err(|e| Error::decoder("zlib", e.to_string()))?;
            let produced = (self.inflate.total_out() - before_out) as usize;
            out.extend_from_slice(&chunk[..produced]);
            in_pos = (self.inflate.total_in() - before_in) as usize;

            if in_pos >= compressed.len() || status == Status::StreamEnd {
                break;
            }
        }
        Ok(out)
    }

    /// Convenience wrapper for callers (plain Zlib encoding) that know
    /// the exact plaintext length in advance and want it validated.
    pub fn inflate_exact(&mut self, compressed: &[u8], expected_len: usize) -> Result<Vec<u8>> {
        let out = self.inflate_all(compressed)?;
        if out.len() != expected_len {
            return Err(Error::decoder(
                "zlib",
                format!("expected {expected_len} bytes of plaintext, got {}", out.len()),
            ));
        }
        Ok(out)
    }
}

pub fn decode_zlib_encoding<R: Read>(
    reader: &mut R,
    ctx: &mut DecodeContext,
    rect: Rectangle,
    stream: &mut ZlibStream,
) -> Result<DecodeOutcome> {
    let len = reader.read_u32::<BigEndian>()? as usize;
    let mut compressed = ctx.pool.take(len);
    reader.read_exact(&mut compressed)?;

    let bpp = ctx.server_format.bytes_per_pixel();
    let expected = rect.area() * bpp;
    let raw = stream.inflate_exact(&compressed, expected)?;

    let mut cursor = &raw[..];
    let pixels = crate::pixel::read_pixels(&mut cursor, ctx.server_format, rect.area())?;
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
    use std::io::Write;
    use std::sync::Arc;

    #[test]
    fn decodes_a_zlib_compressed_rectangle() {
        let mut fb = FrameBuffer::new(2, 2, PixelFormat::rgba8888());
        let format = PixelFormat::rgba8888();
        let colormap = ColorMap::new();
        let pool = Arc::new(BufferPool::new());

        let mut raw_pixels = Vec::new();
        for _ in 0..4 {
            raw_pixels.extend_from_slice(&0x10203040u32.to_le_bytes());
        }
        let mut encoder = flate2::write::ZlibEncoder::new(Vec::new(), flate2::Compression::default());
        encoder.write_all(&raw_pixels).unwrap();
        let compressed = encoder.finish().unwrap();

        let mut payload = Vec::new();
        payload.extend_from_slice(&(compressed.len() as u32).to_be_bytes());
        payload.extend_from_slice(&compressed);

        let mut ctx = DecodeContext { framebuffer: &mut fb, colormap: &colormap, pool: &pool, server_format: &format };
        let mut stream = ZlibStream::default();
        let mut reader = &payload[..];
        decode_zlib_encoding(&mut reader, &mut ctx, Rectangle::new(0, 0, 2, 2), &mut stream).unwrap();
        assert_eq!(fb.get_pixel(1, 1), 0x10203040);
    }
}
