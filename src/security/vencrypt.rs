//! Security type 19: VeNCrypt.
//!
//! A sub-handshake that negotiates a nested security subtype — possibly
//! upgrading the transport to TLS first — and then runs that subtype's
//! own authentication (none, VNC-Auth, or a plaintext username/password
//! exchange) over the (now possibly encrypted) transport.

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Read, Write};
use std::sync::Arc;
use zeroize::Zeroizing;

use crate::error::{Error, Result};
#[cfg(feature = "tls")]
use crate::transport::tls::{client_config, AcceptAllVerifier, TlsTransport};
use crate::transport::BoxedTransport;

use super::{
    AuthenticationHandler, AuthenticationOutcome, CredentialRequest, Credentials, SecurityType,
    SecurityTypeId,
};

/// VeNCrypt 0.2 subtype ids, in the client's preference order (most
/// capable first). A reimplementation MUST NOT silently trust every
/// certificate forever — see [`crate::transport::tls::CertificateVerifier`]
/// for the hook this client exposes instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Subtype {
    X509Plain = 262,
    X509Vnc = 261,
    X509None = 260,
    TlsPlain = 259,
    TlsVnc = 258,
    TlsNone = 257,
    Plain = 256,
}

const PREFERENCE: [Subtype; 7] = [
    Subtype::X509Plain,
    Subtype::X509Vnc,
    Subtype::X509None,
    Subtype::TlsPlain,
    Subtype::TlsVnc,
    Subtype::TlsNone,
    Subtype::Plain,
];

impl Subtype {
    fn from_id(id: u32) -> Option<Subtype> {
        PREFERENCE.into_iter().find(|s| *s as u32 == id)
    }

    fn upgrades_tls(self) -> bool {
        !matches!(self, Subtype::Plain)
    }

    /// Whether this subtype's inner authentication is VNC-Auth (as
    /// opposed to plaintext credentials or nothing at all).
    fn inner_is_vnc(self) -> bool {
        matches!(self, Subtype::X509Vnc | Subtype::TlsVnc)
    }

    fn inner_is_plain(self) -> bool {
        matches!(self, Subtype::X509Plain | Subtype::TlsPlain | Subtype::Plain)
    }
}

pub struct VeNCrypt {
    /// Hostname used for TLS SNI / certificate validation.
    server_name: String,
    /// Whether a `SecurityResult` follows this security type at the
    /// outer handshake layer (depends on negotiated protocol version).
    expects_security_result: bool,
}

impl VeNCrypt {
    pub fn new(server_name: impl Into<String>, expects_security_result: bool) -> VeNCrypt {
        VeNCrypt {
            server_name: server_name.into(),
            expects_security_result,
        }
    }
}

impl SecurityType for VeNCrypt {
    fn id(&self) -> SecurityTypeId {
        SecurityTypeId::VENCRYPT
    }

    fn authenticate(
        &self,
        mut transport: BoxedTransport,
        handler: &mut dyn AuthenticationHandler,
    ) -> Result<(BoxedTransport, AuthenticationOutcome)> {
        let server_major = transport.read_u8()?;
        let server_minor = transport.read_u8()?;

        // Prefer 0.2; fall back to whatever the server offers if it
        // cannot speak 0.2 at all.
        let (major, minor) = if server_major >= 1 || (server_major == 0 && server_minor >= 2) {
            (0u8, 2u8)
        } else {
            (server_major, server_minor)
        };
        transport.write_u8(major)?;
        transport.write_u8(minor)?;
        transport.flush()?;

        let accepted = transport.read_u8()?;
        if accepted != 0 {
            return Err(Error::NoAcceptableSecurityType(
                "server rejected VeNCrypt version".into(),
            ));
        }

        let subtype = if minor >= 2 {
            let count = transport.read_u8()?;
            let mut candidates = Vec::with_capacity(count as usize);
            for _ in 0..count {
                candidates.push(transport.read_u32::<BigEndian>()?);
            }
            PREFERENCE
                .into_iter()
                .find(|pref| candidates.contains(&(*pref as u32)))
                .ok_or_else(|| {
                    Error::NoAcceptableSecurityType("no supported VeNCrypt subtype".into())
                })?
        } else {
            let count = transport.read_u8()?;
            let mut candidates = Vec::with_capacity(count as usize);
            for _ in 0..count {
                candidates.push(transport.read_u8()? as u32);
            }
            PREFERENCE
                .into_iter()
                .find(|pref| candidates.contains(&(*pref as u32)))
                .ok_or_else(|| {
                    Error::NoAcceptableSecurityType("no supported VeNCrypt subtype".into())
                })?
        };

        transport.write_u32::<BigEndian>(subtype as u32)?;
        transport.flush()?;
        let subtype_accepted = transport.read_u8()?;
        if subtype_accepted == 0 {
            return Err(Error::NoAcceptableSecurityType(format!(
                "server rejected VeNCrypt subtype {}",
                subtype as u32
            )));
        }

        let mut tunnel: BoxedTransport = if subtype.upgrades_tls() {
            #[cfg(feature = "tls")]
            {
                let config = client_config(Arc::new(AcceptAllVerifier));
                Box::new(TlsTransport::upgrade(transport, &self.server_name, config)?)
            }
            #[cfg(not(feature = "tls"))]
            {
                let _ = &self.server_name;
                return Err(Error::Protocol(
                    "VeNCrypt TLS subtype negotiated but the `tls` feature is disabled".into(),
                ));
            }
        } else {
            transport
        };

        if subtype.inner_is_vnc() {
            let mut challenge = [0u8; 16];
            tunnel.read_exact(&mut challenge)?;
            let password = match handler.provide_credentials(CredentialRequest::Password) {
                Some(Credentials::Password(password)) => password,
                _ => return Err(Error::AuthenticationUnavailable),
            };
            let response = super::vnc_auth::des_challenge_response(&challenge, &password);
            tunnel.write_all(&response)?;
            tunnel.flush()?;
        } else if subtype.inner_is_plain() {
            let (username, password) =
                match handler.provide_credentials(CredentialRequest::UsernameAndPassword) {
                    Some(Credentials::UsernameAndPassword { username, password }) => {
                        (username, password)
                    }
                    _ => return Err(Error::AuthenticationUnavailable),
                };
            write_plain_credentials(&mut tunnel, &username, &password)?;
            let result = tunnel.read_u8()?;
            if result != 0 {
                let mut pad = [0u8; 3];
                let reason = if tunnel.read_exact(&mut pad).is_ok() {
                    let len = tunnel.read_u32::<BigEndian>().unwrap_or(0) as usize;
                    let mut message = vec![0u8; len];
                    tunnel
                        .read_exact(&mut message)
                        .ok()
                        .map(|_| String::from_utf8_lossy(&message).into_owned())
                        .unwrap_or_else(|| "authentication rejected".into())
                } else {
                    "authentication rejected".into()
                };
                return Err(Error::AuthenticationFailure(reason));
            }
        }

        Ok((
            tunnel,
            AuthenticationOutcome::plain(self.expects_security_result),
        ))
    }
}

fn write_plain_credentials<W: Write>(
    writer: &mut W,
    username: &str,
    password: &Zeroizing<String>,
) -> Result<()> {
    writer.write_u32::<BigEndian>(username.len() as u32)?;
    writer.write_u32::<BigEndian>(password.len() as u32)?;
    writer.write_all(username.as_bytes())?;
    writer.write_all(password.as_bytes())?;
    writer.flush()?;
    Ok(())
}
