//! Handshake and initializer (spec §4.4): protocol version negotiation,
//! security-type negotiation, `ClientInit`/`ServerInit` and the
//! defensive corrections the spec requires for pixel formats and
//! desktop names that fall outside what this client can safely honor.

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Read, Write};

use crate::error::{Error, Result};
use crate::pixel::{self, PixelFormat};

const MAX_SANE_NAME_LEN: u32 = 4096;
const DEFAULT_DESKTOP_NAME: &str = "VNC Server";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct RfbVersion {
    pub major: u8,
    pub minor: u8,
}

impl RfbVersion {
    pub const V3_3: RfbVersion = RfbVersion { major: 3, minor: 3 };
    pub const V3_7: RfbVersion = RfbVersion { major: 3, minor: 7 };
    pub const V3_8: RfbVersion = RfbVersion { major: 3, minor: 8 };
    pub const V3_9: RfbVersion = RfbVersion { major: 3, minor: 9 };

    /// The highest version this client speaks. RFB 3.9 (UltraVNC) is
    /// accepted on read but this client never claims it itself — it
    /// caps its own reply at 3.8, which every 3.9 server also accepts.
    pub const CLIENT_MAX: RfbVersion = RfbVersion::V3_8;

    fn from_bytes(buf: &[u8; 12]) -> Result<RfbVersion> {
        match buf {
            b"RFB 003.003\n" => Ok(RfbVersion::V3_3),
            b"RFB 003.007\n" => Ok(RfbVersion::V3_7),
            b"RFB 003.008\n" => Ok(RfbVersion::V3_8),
            b"RFB 003.009\n" => Ok(RfbVersion::V3_9),
            // Apple Remote Desktop reports a nonstandard minor version
            // but otherwise behaves like 3.8.
            b"RFB 003.889\n" => Ok(RfbVersion::V3_8),
            other => Err(Error::unexpected(
                "protocol version",
                String::from_utf8_lossy(other),
            )),
        }
    }

    fn to_bytes(self) -> [u8; 12] {
        let mut buf = [0u8; 12];
        let text = format!("RFB {:03}.{:03}\n", self.major, self.minor);
        buf.copy_from_slice(text.as_bytes());
        buf
    }

    /// True from 3.7 onward, where security negotiation sends a list
    /// instead of the server unilaterally dictating one type.
    pub fn uses_security_list(self) -> bool {
        self >= RfbVersion::V3_7
    }

    /// True from 3.8 onward, where a failed `SecurityResult` carries a
    /// UTF-8 reason string.
    pub fn security_result_has_reason(self) -> bool {
        self >= RfbVersion::V3_8
    }
}

pub fn read_version<R: Read>(reader: &mut R) -> Result<RfbVersion> {
    let mut buf = [0u8; 12];
    reader.read_exact(&mut buf)?;
    RfbVersion::from_bytes(&buf)
}

/// Replies with the client's version, capped at [`RfbVersion::CLIENT_MAX`].
pub fn write_version<W: Write>(writer: &mut W, server_version: RfbVersion) -> Result<RfbVersion> {
    let reply = server_version.min(RfbVersion::CLIENT_MAX);
    writer.write_all(&reply.to_bytes())?;
    writer.flush()?;
    Ok(reply)
}

/// RFB 3.3: the server unilaterally picks one security type (or 0 with
/// a failure reason if it refuses the connection outright).
pub fn read_security_type_33<R: Read>(reader: &mut R) -> Result<Option<u8>> {
    let value = reader.read_u32::<BigEndian>()?;
    if value == 0 {
        let reason = read_string_u32(reader)?;
        return Err(Error::Server(reason));
    }
    Ok(Some(value as u8))
}

/// RFB 3.7+: the server offers a list the client picks from.
pub fn read_security_types_37<R: Read>(reader: &mut R) -> Result<Vec<u8>> {
    let count = reader.read_u8()?;
    if count == 0 {
        let reason = read_string_u32(reader)?;
        return Err(Error::Server(reason));
    }
    let mut types = Vec::with_capacity(count as usize);
    for _ in 0..count {
        types.push(reader.read_u8()?);
    }
    Ok(types)
}

pub fn write_security_type_choice<W: Write>(writer: &mut W, id: u8) -> Result<()> {
    writer.write_u8(id)?;
    writer.flush()?;
    Ok(())
}

/// Reads the `SecurityResult` word, and — on failure, version
/// permitting — the UTF-8 reason string that follows it.
pub fn read_security_result<R: Read>(reader: &mut R, version: RfbVersion) -> Result<()> {
    let status = reader.read_u32::<BigEndian>()?;
    if status == 0 {
        return Ok(());
    }
    let reason = if version.security_result_has_reason() {
        read_string_u32(reader)?
    } else {
        String::new()
    };
    Err(Error::AuthenticationFailure(reason))
}

pub fn write_client_init<W: Write>(writer: &mut W, shared: bool) -> Result<()> {
    writer.write_u8(shared as u8)?;
    writer.flush()?;
    Ok(())
}

/// The parsed and defensively-corrected contents of `ServerInit`.
#[derive(Debug, Clone)]
pub struct ServerInit {
    pub width: u16,
    pub height: u16,
    pub pixel_format: PixelFormat,
    pub name: String,
    /// Set when the server's declared pixel format had to be
    /// auto-corrected (oversized bpp collapsed to 32, or an impossible
    /// format replaced with RGB888); the caller MUST follow up with a
    /// `SetPixelFormat` so the server agrees with what this client will
    /// actually use.
    pub needs_pixel_format_renegotiation: bool,
}

pub fn read_server_init<R: Read>(reader: &mut R) -> Result<ServerInit> {
    let width = reader.read_u16::<BigEndian>()?;
    let height = reader.read_u16::<BigEndian>()?;

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

    let (pixel_format, needs_pixel_format_renegotiation) = if bits_per_pixel > 32 {
        // Defensive parsing (spec §4.4 step 5): some servers declare an
        // oversized bpp while every channel shift still fits in 32
        // bits. Rather than fail outright, adopt an effective 32-bpp
        // format and ask the server to match it via SetPixelFormat.
        let fits_in_32_bits = [
            (red_shift, red_max),
            (green_shift, green_max),
            (blue_shift, blue_max),
        ]
        .iter()
        .all(|(shift, max)| *shift as u32 + max.count_ones() <= 32);

        if fits_in_32_bits {
            match PixelFormat::new(
                "", 32, depth.min(24), big_endian, true_color, false, red_max, green_max,
                blue_max, 0, red_shift, green_shift, blue_shift, 0,
            ) {
                Ok(format) => (format, true),
                Err(_) => (PixelFormat::rgb888(), true),
            }
        } else {
            log::warn!(
                "server pixel format bpp={bits_per_pixel} has channel shifts that don't fit \
                 in 32 bits; falling back to RGB888"
            );
            (PixelFormat::rgb888(), true)
        }
    } else {
        match PixelFormat::new(
            "", bits_per_pixel, depth, big_endian, true_color, false, red_max, green_max,
            blue_max, 0, red_shift, green_shift, blue_shift, 0,
        ) {
            Ok(format) => (format, false),
            Err(_) => {
                log::warn!(
                    "server pixel format failed validation (bpp={bits_per_pixel} depth={depth}); \
                     falling back to RGB888"
                );
                (PixelFormat::rgb888(), true)
            }
        }
    };

    let name_len = reader.read_u32::<BigEndian>()?;
    let name = if name_len > MAX_SANE_NAME_LEN {
        log::warn!("server desktop name length {name_len} exceeds sanity cap; using default");
        let mut drain = vec![0u8; name_len as usize];
        reader.read_exact(&mut drain)?;
        DEFAULT_DESKTOP_NAME.to_string()
    } else {
        let mut buf = vec![0u8; name_len as usize];
        reader.read_exact(&mut buf)?;
        String::from_utf8_lossy(&buf).into_owned()
    };

    // Some servers (observed in the wild) report authentication
    // rejection by stuffing an error string into what should be the
    // desktop name instead of using the SecurityResult reason.
    if looks_like_error_message(&name) {
        return Err(Error::AuthenticationFailure(name));
    }

    Ok(ServerInit {
        width,
        height,
        pixel_format,
        name,
        needs_pixel_format_renegotiation,
    })
}

fn looks_like_error_message(text: &str) -> bool {
    let lower = text.to_ascii_lowercase();
    lower.starts_with("invalid") || lower.starts_with("error")
}

fn read_string_u32<R: Read>(reader: &mut R) -> Result<String> {
    let len = reader.read_u32::<BigEndian>()?;
    let mut buf = vec![0u8; len as usize];
    reader.read_exact(&mut buf)?;
    Ok(String::from_utf8_lossy(&buf).into_owned())
}

pub fn write_set_pixel_format<W: Write>(writer: &mut W, format: &PixelFormat) -> Result<()> {
    writer.write_u8(0)?; // message type
    writer.write_all(&[0u8; 3])?;
    pixel::write_wire_pixel_format(format, writer)?;
    writer.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn reads_and_caps_version() {
        let mut buf = Vec::new();
        let server = RfbVersion::V3_9;
        let reply = write_version(&mut buf, server).unwrap();
        assert_eq!(reply, RfbVersion::V3_8);
    }

    #[test]
    fn security_list_empty_surfaces_reason() {
        let mut data = vec![0u8]; // count = 0
        data.extend_from_slice(&4u32.to_be_bytes());
        data.extend_from_slice(b"nope");
        let mut cursor = Cursor::new(data);
        let err = read_security_types_37(&mut cursor).unwrap_err();
        assert!(matches!(err, Error::Server(ref s) if s == "nope"));
    }

    #[test]
    fn oversized_name_length_falls_back_to_default() {
        let mut data = Vec::new();
        data.extend_from_slice(&4u16.to_be_bytes()); // width
        data.extend_from_slice(&2u16.to_be_bytes()); // height
        data.push(32); // bpp
        data.push(24); // depth
        data.push(0); // big endian
        data.push(1); // true color
        data.extend_from_slice(&255u16.to_be_bytes());
        data.extend_from_slice(&255u16.to_be_bytes());
        data.extend_from_slice(&255u16.to_be_bytes());
        data.push(16);
        data.push(8);
        data.push(0);
        data.extend_from_slice(&[0u8; 3]);
        data.extend_from_slice(&(MAX_SANE_NAME_LEN + 1).to_be_bytes());
        data.extend(std::iter::repeat(b'x').take((MAX_SANE_NAME_LEN + 1) as usize));

        let mut cursor = Cursor::new(data);
        let init = read_server_init(&mut cursor).unwrap();
        assert_eq!(init.name, DEFAULT_DESKTOP_NAME);
    }

    #[test]
    fn error_like_name_is_treated_as_auth_failure() {
        let mut data = Vec::new();
        data.extend_from_slice(&4u16.to_be_bytes());
        data.extend_from_slice(&2u16.to_be_bytes());
        data.push(32);
        data.push(24);
        data.push(0);
        data.push(1);
        data.extend_from_slice(&255u16.to_be_bytes());
        data.extend_from_slice(&255u16.to_be_bytes());
        data.extend_from_slice(&255u16.to_be_bytes());
        data.push(16);
        data.push(8);
        data.push(0);
        data.extend_from_slice(&[0u8; 3]);
        let message = b"Invalid password";
        data.extend_from_slice(&(message.len() as u32).to_be_bytes());
        data.extend_from_slice(message);

        let mut cursor = Cursor::new(data);
        let err = read_server_init(&mut cursor).unwrap_err();
        assert!(matches!(err, Error::AuthenticationFailure(_)));
    }
}
