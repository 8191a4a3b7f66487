//! Pixel format descriptor and the conversion routines used to translate
//! server-encoded pixels into the client's framebuffer format.

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Read, Write};

use crate::error::{Error, Result};

/// Describes how a pixel is laid out on the wire (or in the client's own
/// framebuffer). Binary layout matches the 16-byte RFB `PIXEL_FORMAT`
/// structure, extended with an alpha channel for destination formats that
/// want one (the wire format never carries alpha; `has_alpha` only
/// matters for the client-owned destination format).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PixelFormat {
    pub name: String,
    pub bits_per_pixel: u8,
    pub depth: u8,
    pub big_endian: bool,
    pub true_color: bool,
    pub has_alpha: bool,
    pub red_max: u16,
    pub green_max: u16,
    pub blue_max: u16,
    pub alpha_max: u16,
    pub red_shift: u8,
    pub green_shift: u8,
    pub blue_shift: u8,
    pub alpha_shift: u8,
}

fn popcount(max: u16) -> u32 {
    max.count_ones()
}

impl PixelFormat {
    /// Builds a format, enforcing the invariants from the data model:
    /// `depth >= popcount(red_max)+popcount(green_max)+popcount(blue_max)`,
    /// each channel's `shift + bitcount(max) <= bits_per_pixel`, and
    /// `alpha_max == alpha_shift == 0` whenever `has_alpha` is false.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        name: impl Into<String>,
        bits_per_pixel: u8,
        depth: u8,
        big_endian: bool,
        true_color: bool,
        has_alpha: bool,
        red_max: u16,
        green_max: u16,
        blue_max: u16,
        alpha_max: u16,
        red_shift: u8,
        green_shift: u8,
        blue_shift: u8,
        alpha_shift: u8,
    ) -> Result<PixelFormat> {
        let (alpha_max, alpha_shift) = if has_alpha {
            (alpha_max, alpha_shift)
        } else {
            (0, 0)
        };

        let channel_bits =
            popcount(red_max) + popcount(green_max) + popcount(blue_max) + popcount(alpha_max);
        if (depth as u32) < channel_bits {
            return Err(Error::Protocol(format!(
                "pixel format depth {depth} too small for channel masks (need >= {channel_bits})"
            )));
        }
        for (shift, max, label) in [
            (red_shift, red_max, "red"),
            (green_shift, green_max, "green"),
            (blue_shift, blue_max, "blue"),
            (alpha_shift, alpha_max, "alpha"),
        ] {
            if shift as u32 + popcount(max) > bits_per_pixel as u32 {
                return Err(Error::Protocol(format!(
                    "{label} channel shift {shift} + bits {} exceeds bits_per_pixel {bits_per_pixel}",
                    popcount(max)
                )));
            }
        }

        Ok(PixelFormat {
            name: name.into(),
            bits_per_pixel,
            depth,
            big_endian,
            true_color,
            has_alpha,
            red_max,
            green_max,
            blue_max,
            alpha_max,
            red_shift,
            green_shift,
            blue_shift,
            alpha_shift,
        })
    }

    /// `ceil(bits_per_pixel / 8)`.
    pub fn bytes_per_pixel(&self) -> usize {
        (self.bits_per_pixel as usize).div_ceil(8)
    }

    /// Standard little-endian 32bpp RGBA8888, used as the client's
    /// internal framebuffer format unless the embedder asks for another.
    pub fn rgba8888() -> PixelFormat {
        PixelFormat::new(
            "RGBA8888", 32, 24, false, true, true, 255, 255, 255, 255, 0, 8, 16, 24,
        )
        .expect("builtin format is always valid")
    }

    /// Big-endian 32bpp RGB888 with no alpha, the RFB spec's suggested
    /// "safe" fallback format used when the server's declared format is
    /// impossible to honor.
    pub fn rgb888() -> PixelFormat {
        PixelFormat::new(
            "RGB888", 32, 24, true, true, false, 255, 255, 255, 0, 16, 8, 0, 0,
        )
        .expect("builtin format is always valid")
    }

    /// Two formats are binary-compatible when a raw byte copy from one
    /// to the other reproduces the same colour, i.e. same bits-per-pixel,
    /// endianness and channel masks. The name is never compared; alpha is
    /// only compared unless `ignore_alpha` is set.
    pub fn is_binary_compatible(&self, other: &PixelFormat, ignore_alpha: bool) -> bool {
        let alpha_ok = ignore_alpha
            || (self.has_alpha == other.has_alpha
                && self.alpha_max == other.alpha_max
                && self.alpha_shift == other.alpha_shift);
        self.bits_per_pixel == other.bits_per_pixel
            && self.big_endian == other.big_endian
            && self.true_color == other.true_color
            && self.red_max == other.red_max
            && self.green_max == other.green_max
            && self.blue_max == other.blue_max
            && self.red_shift == other.red_shift
            && self.green_shift == other.green_shift
            && self.blue_shift == other.blue_shift
            && alpha_ok
    }

    /// Reads a raw pixel value (1/2/4 bytes depending on
    /// `bits_per_pixel`) honoring this format's endianness.
    pub fn read_raw_pixel<R: Read>(&self, reader: &mut R) -> Result<u32> {
        Ok(match self.bits_per_pixel {
            8 => reader.read_u8()? as u32,
            16 => {
                if self.big_endian {
                    reader.read_u16::<BigEndian>()? as u32
                } else {
                    reader.read_u16::<byteorder::LittleEndian>()? as u32
                }
            }
            32 => {
                if self.big_endian {
                    reader.read_u32::<BigEndian>()?
                } else {
                    reader.read_u32::<byteorder::LittleEndian>()?
                }
            }
            other => return Err(Error::Protocol(format!("unsupported bits_per_pixel {other}"))),
        })
    }

    pub fn write_raw_pixel<W: Write>(&self, writer: &mut W, value: u32) -> Result<()> {
        match self.bits_per_pixel {
            8 => writer.write_u8(value as u8)?,
            16 => {
                if self.big_endian {
                    writer.write_u16::<BigEndian>(value as u16)?
                } else {
                    writer.write_u16::<byteorder::LittleEndian>(value as u16)?
                }
            }
            32 => {
                if self.big_endian {
                    writer.write_u32::<BigEndian>(value)?
                } else {
                    writer.write_u32::<byteorder::LittleEndian>(value)?
                }
            }
            other => return Err(Error::Protocol(format!("unsupported bits_per_pixel {other}"))),
        }
        Ok(())
    }

    /// Disassembles a raw pixel value into normalized 16-bit channel
    /// samples (`0..=max`, not yet rescaled to any other format).
    pub fn channels(&self, raw: u32) -> (u16, u16, u16, u16) {
        let extract = |shift: u8, max: u16| -> u16 {
            if max == 0 {
                0
            } else {
                ((raw >> shift) & max as u32) as u16
            }
        };
        (
            extract(self.red_shift, self.red_max),
            extract(self.green_shift, self.green_max),
            extract(self.blue_shift, self.blue_max),
            if self.has_alpha {
                extract(self.alpha_shift, self.alpha_max)
            } else {
                0
            },
        )
    }

    /// Packs normalized channel samples (already scaled to this format's
    /// maxes) into a raw pixel value.
    pub fn pack(&self, r: u16, g: u16, b: u16, a: u16) -> u32 {
        let mut value = (r as u32) << self.red_shift
            | (g as u32) << self.green_shift
            | (b as u32) << self.blue_shift;
        if self.has_alpha {
            value |= (a as u32) << self.alpha_shift;
        }
        value
    }
}

/// Linearly rescales a channel sample from one max to another, per the
/// conversion rule `dst = (src * dst_max) / src_max`.
pub fn rescale(sample: u16, src_max: u16, dst_max: u16) -> u16 {
    if src_max == 0 || dst_max == 0 {
        return 0;
    }
    ((sample as u32 * dst_max as u32) / src_max as u32) as u16
}

pub(crate) const PIXEL_FORMAT_WIRE_LEN: usize = 16;

/// Reads the 16-byte wire `PIXEL_FORMAT` structure. The resulting format
/// always has `name` empty and `has_alpha` false — the wire format never
/// carries either.
pub fn read_wire_pixel_format<R: Read>(reader: &mut R) -> Result<PixelFormat> {
    let bits_per_pixel = reader.read_u8()?;
    let depth = reader.read_u8()?;
    let big_endian = reader.read_u8()? != 0;
    let true_color = reader.read_u8()? != 0;
    let red_max = reader.read_u16::<BigEndian>()?;
    let green_max = reader.read_u16::<BigEndian>()?;
    let blue_max = reader.read_u16::<BigEndian>()?;
    let red_shift = reader.read_u8()?;
    let green_shift = reader.read_u8()?;
    let blue_shift = reader.read_u8()?;
    let mut padding = [0u8; 3];
    reader.read_exact(&mut padding)?;

    match PixelFormat::new(
        "", bits_per_pixel, depth, big_endian, true_color, false, red_max, green_max, blue_max, 0,
        red_shift, green_shift, blue_shift, 0,
    ) {
        Ok(format) => Ok(format),
        Err(_) => {
            // Defensive parsing per the handshake spec: correct an
            // impossible format to plain RGB888 rather than fail outright.
            log::warn!(
                "server pixel format failed validation (bpp={bits_per_pixel} depth={depth} \
                 shifts={red_shift}/{green_shift}/{blue_shift}); falling back to RGB888"
            );
            Ok(PixelFormat::rgb888())
        }
    }
}

pub fn write_wire_pixel_format<W: Write>(format: &PixelFormat, writer: &mut W) -> Result<()> {
    writer.write_u8(format.bits_per_pixel)?;
    writer.write_u8(format.depth)?;
    writer.write_u8(format.big_endian as u8)?;
    writer.write_u8(format.true_color as u8)?;
    writer.write_u16::<BigEndian>(format.red_max)?;
    writer.write_u16::<BigEndian>(format.green_max)?;
    writer.write_u16::<BigEndian>(format.blue_max)?;
    writer.write_u8(format.red_shift)?;
    writer.write_u8(format.green_shift)?;
    writer.write_u8(format.blue_shift)?;
    writer.write_all(&[0u8; 3])?;
    Ok(())
}

/// Reads `count` consecutive raw pixels in `format`'s encoding.
pub fn read_pixels<R: Read>(reader: &mut R, format: &PixelFormat, count: usize) -> Result<Vec<u32>> {
    let mut out = Vec::with_capacity(count);
    for _ in 0..count {
        out.push(format.read_raw_pixel(reader)?);
    }
    Ok(out)
}

/// Converts one pixel from `src_format` (raw wire bytes already
/// disassembled into `raw`, resolved through `colormap` if indexed) into
/// `dst_format`, returning the raw destination pixel value.
pub fn convert_pixel(
    raw: u32,
    src_format: &PixelFormat,
    dst_format: &PixelFormat,
    colormap: Option<&crate::colormap::ColorMap>,
) -> u32 {
    if !src_format.true_color {
        let entry = colormap
            .and_then(|map| map.get(raw as usize))
            .copied()
            .unwrap_or_default();
        return entry.to_pixel(dst_format);
    }

    let (r, g, b, a) = src_format.channels(raw);
    let r = rescale(r, src_format.red_max, dst_format.red_max);
    let g = rescale(g, src_format.green_max, dst_format.green_max);
    let b = rescale(b, src_format.blue_max, dst_format.blue_max);
    let a = if dst_format.has_alpha {
        if src_format.has_alpha {
            rescale(a, src_format.alpha_max, dst_format.alpha_max)
        } else {
            dst_format.alpha_max
        }
    } else {
        0
    };
    dst_format.pack(r, g, b, a)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alpha_fields_zero_iff_has_alpha_false() {
        let f = PixelFormat::new("x", 32, 24, false, true, false, 255, 255, 255, 17, 0, 8, 16, 24)
            .unwrap();
        assert_eq!(f.alpha_max, 0);
        assert_eq!(f.alpha_shift, 0);

        let f = PixelFormat::new("x", 32, 32, false, true, true, 255, 255, 255, 255, 0, 8, 16, 24)
            .unwrap();
        assert_eq!(f.alpha_max, 255);
        assert_eq!(f.alpha_shift, 24);
    }

    #[test]
    fn bytes_per_pixel_matches_ceil_div8() {
        for (bpp, expected) in [(8, 1), (16, 2), (32, 4)] {
            let f = PixelFormat::new(
                "x", bpp, bpp, false, true, false, 0, 0, 0, 0, 0, 0, 0, 0,
            )
            .unwrap();
            assert_eq!(f.bytes_per_pixel(), expected);
        }
    }

    #[test]
    fn binary_compatible_reflexive() {
        let f = PixelFormat::rgba8888();
        assert!(f.is_binary_compatible(&f, false));
    }

    #[test]
    fn binary_compatible_ignores_alpha_only_when_asked() {
        let a = PixelFormat::rgba8888();
        let mut b = a.clone();
        b.has_alpha = false;
        b.alpha_max = 0;
        b.alpha_shift = 0;
        assert!(!a.is_binary_compatible(&b, false));
        assert!(a.is_binary_compatible(&b, true));
    }

    #[test]
    fn rejects_impossible_shift() {
        let err = PixelFormat::new("x", 8, 8, false, true, false, 255, 255, 255, 0, 4, 4, 4, 0);
        assert!(err.is_err());
    }
}
