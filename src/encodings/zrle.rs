//! ZRLE encoding (id 16): the rectangle is split into 64x64 tiles; the
//! whole tile stream for one rectangle is zlib-compressed as a single
//! blob (length-prefixed, persistent stream like plain Zlib), and each
//! tile inside is run-length- or palette-encoded. Pixels within a tile
//! are carried in "CPIXEL" form — the same channel layout as the
//! server's pixel format but with the padding byte dropped for 32bpp
//! formats, since ZRLE never needs the high byte.

use byteorder::{BigEndian, ReadBytesExt};
use std::io::Read;

use crate::error::{Error, Result};
use crate::pixel::PixelFormat;
use crate::rect::Rectangle;

use super::zlib_stream::ZlibStream;
use super::{DecodeContext, DecodeOutcome};

const TILE_SIZE: u16 = 64;

/// Reads one CPIXEL: `bytes_per_cpixel` bytes, which is
/// `bytes_per_pixel()` for every format except "true colour, 32bpp,
/// depth <= 24", where the padding byte is dropped and only 3 bytes
/// are sent (in whichever order the 24 significant bits appear, which
/// matches the byte order `read_raw_pixel` would use if it only read
/// 3 bytes).
fn read_cpixel<R: Read>(reader: &mut R, format: &PixelFormat) -> Result<u32> {
    if format.bits_per_pixel == 32 && format.depth <= 24 {
        let shifts_are_byte_aligned =
            format.red_shift % 8 == 0 && format.green_shift % 8 == 0 && format.blue_shift % 8 == 0;
        if !shifts_are_byte_aligned {
            return Err(Error::decoder(
                "zrle",
                "CPIXEL shortcut requires byte-aligned channel shifts",
            ));
        }
        let mut bytes = [0u8; 3];
        reader.read_exact(&mut bytes)?;
        // The three significant bytes arrive in the same order a full
        // 4-byte read would put them in, minus the dropped high byte.
        Ok(if format.big_endian {
            u32::from_be_bytes([0, bytes[0], bytes[1], bytes[2]])
        } else {
            u32::from_le_bytes([bytes[0], bytes[1], bytes[2], 0])
        })
    } else {
        format.read_raw_pixel(reader)
    }
}

fn decode_tile<R: Read>(reader: &mut R, ctx: &DecodeContext, tile: Rectangle) -> Result<Vec<u32>> {
    let format = ctx.server_format;
    let mode = reader.read_u8()?;
    let area = tile.area();

    if mode == 0 {
        // Raw CPIXELs.
        let mut pixels = Vec::with_capacity(area);
        for _ in 0..area {
            pixels.push(read_cpixel(reader, format)?);
        }
        return Ok(pixels);
    }

    if mode == 1 {
        // Solid tile: one CPIXEL for the whole area.
        let pixel = read_cpixel(reader, format)?;
        return Ok(vec![pixel; area]);
    }

    if (2..=16).contains(&mode) {
        // Packed palette: `mode` colours, indices packed at
        // 1/2/4/8 bits per pixel depending on the palette size.
        let palette_size = mode as usize;
        let mut palette = Vec::with_capacity(palette_size);
        for _ in 0..palette_size {
            palette.push(read_cpixel(reader, format)?);
        }
        let bits_per_index: u32 = if palette_size <= 2 {
            1
        } else if palette_size <= 4 {
            2
        } else {
            4
        };
        let mut pixels = Vec::with_capacity(area);
        for _ in 0..tile.height {
            let row_bytes = ((tile.width as u32 * bits_per_index) as usize).div_ceil(8);
            let mut row = vec![0u8; row_bytes];
            reader.read_exact(&mut row)?;
            for x in 0..tile.width {
                let bit_offset = x as u32 * bits_per_index;
                let byte = row[(bit_offset / 8) as usize];
                let shift = 8 - bits_per_index - (bit_offset % 8);
                let mask = (1u32 << bits_per_index) - 1;
                let index = ((byte as u32 >> shift) & mask) as usize;
                pixels.push(*palette.get(index).unwrap_or(&0));
            }
        }
        return Ok(pixels);
    }

    if mode == 128 {
        // Plain RLE: repeated (pixel, run-length) pairs until the tile
        // is full.
        let mut pixels = Vec::with_capacity(area);
        while pixels.len() < area {
            let pixel = read_cpixel(reader, format)?;
            let run = read_run_length(reader)?;
            for _ in 0..run {
                pixels.push(pixel);
            }
        }
        return Ok(pixels);
    }

    if mode >= 130 {
        // Palette RLE: palette of `mode - 128` colours, then
        // (index-or-run-flag, [run-length]) entries.
        let palette_size = (mode - 128) as usize;
        let mut palette = Vec::with_capacity(palette_size);
        for _ in 0..palette_size {
            palette.push(read_cpixel(reader, format)?);
        }
        let mut pixels = Vec::with_capacity(area);
        while pixels.len() < area {
            let index_byte = reader.read_u8()?;
            if index_byte & 0x80 != 0 {
                let index = (index_byte & 0x7F) as usize;
                let run = read_run_length(reader)?;
                let pixel = *palette.get(index).unwrap_or(&0);
                for _ in 0..run {
                    pixels.push(pixel);
                }
            } else {
                let pixel = *palette.get(index_byte as usize).unwrap_or(&0);
                pixels.push(pixel);
            }
        }
        return Ok(pixels);
    }

    Err(Error::decoder("zrle", format!("unknown tile subencoding {mode}")))
}

/// ZRLE run lengths are encoded as a sequence of bytes: add 255 for
/// every 0xFF byte, then add the final (non-0xFF) byte, plus 1.
fn read_run_length<R: Read>(reader: &mut R) -> Result<usize> {
    let mut run = 1usize;
    loop {
        let b = reader.read_u8()?;
        run += b as usize;
        if b != 0xFF {
            break;
        }
    }
    Ok(run)
}

pub fn decode<R: Read>(
    reader: &mut R,
    ctx: &mut DecodeContext,
    rect: Rectangle,
    stream: &mut ZlibStream,
) -> Result<DecodeOutcome> {
    let len = reader.read_u32::<BigEndian>()? as usize;
    let mut compressed = ctx.pool.take(len);
    reader.read_exact(&mut compressed)?;

    let format = ctx.server_format;
    let plaintext = stream.inflate_all(&compressed)?;

    let mut cursor = &plaintext[..];
    let mut y = rect.y;
    while y < rect.y + rect.height {
        let tile_h = TILE_SIZE.min(rect.y + rect.height - y);
        let mut x = rect.x;
        while x < rect.x + rect.width {
            let tile_w = TILE_SIZE.min(rect.x + rect.width - x);
            let tile_rect = Rectangle::new(x, y, tile_w, tile_h);
            let pixels = decode_tile(&mut cursor, ctx, tile_rect)?;
            ctx.framebuffer.blit(tile_rect, &pixels, format, Some(ctx.colormap));
            x += tile_w;
        }
        y += tile_h;
    }
    Ok(DecodeOutcome::FramePainted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::colormap::ColorMap;
    use crate::framebuffer::FrameBuffer;
    use crate::pool::BufferPool;
    use std::io::Write;
    use std::sync::Arc;

    #[test]
    fn decodes_a_single_solid_tile() {
        let mut fb = FrameBuffer::new(8, 8, PixelFormat::rgba8888());
        let format = PixelFormat::rgba8888();
        let colormap = ColorMap::new();
        let pool = Arc::new(BufferPool::new());

        // rgba8888 is 32bpp with depth 24, so the CPIXEL shortcut drops
        // the padding byte: only 3 bytes are sent for this tile's pixel.
        let mut tile_stream = Vec::new();
        tile_stream.push(1u8); // solid tile
        tile_stream.extend_from_slice(&[0x0B, 0x0C, 0x0D]);

        let mut encoder = flate2::write::ZlibEncoder::new(Vec::new(), flate2::Compression::default());
        encoder.write_all(&tile_stream).unwrap();
        let compressed = encoder.finish().unwrap();

        let mut payload = Vec::new();
        payload.extend_from_slice(&(compressed.len() as u32).to_be_bytes());
        payload.extend_from_slice(&compressed);

        let mut ctx = DecodeContext { framebuffer: &mut fb, colormap: &colormap, pool: &pool, server_format: &format };
        let mut stream = ZlibStream::default();
        let mut reader = &payload[..];
        decode(&mut reader, &mut ctx, Rectangle::new(0, 0, 8, 8), &mut stream).unwrap();
        assert_eq!(fb.get_pixel(3, 3), 0x000D0C0B);
    }

    #[test]
    fn run_length_decodes_multi_byte_escape() {
        let data = [0xFFu8, 0xFFu8, 2u8];
        let mut reader = &data[..];
        assert_eq!(read_run_length(&mut reader).unwrap(), 1 + 255 + 255 + 2);
    }
}
