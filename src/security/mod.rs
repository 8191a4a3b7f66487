//! Pluggable RFB security types.
//!
//! Each security type consumes the handshake bytes defined by the
//! wire protocol for its numeric id, optionally asks the caller's
//! [`AuthenticationHandler`] for credentials, and returns an
//! [`AuthenticationOutcome`] describing whether a tunnel transport now
//! replaces the base one and whether a `SecurityResult` word still
//! follows.

pub mod none;
#[cfg(feature = "ra2")]
pub mod ra2;
pub mod vencrypt;
pub mod vnc_auth;

use crate::error::Result;
use crate::transport::BoxedTransport;

/// The numeric RFB security type id, as sent on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SecurityTypeId(pub u8);

impl SecurityTypeId {
    pub const INVALID: SecurityTypeId = SecurityTypeId(0);
    pub const NONE: SecurityTypeId = SecurityTypeId(1);
    pub const VNC_AUTH: SecurityTypeId = SecurityTypeId(2);
    pub const RA2: SecurityTypeId = SecurityTypeId(5);
    pub const RA2NE: SecurityTypeId = SecurityTypeId(6);
    pub const VENCRYPT: SecurityTypeId = SecurityTypeId(19);
    pub const RA2_256: SecurityTypeId = SecurityTypeId(129);
    pub const RA2NE_256: SecurityTypeId = SecurityTypeId(130);
}

/// What a request for credentials is for, passed to the
/// [`AuthenticationHandler`] so a UI can prompt appropriately.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialRequest {
    /// VNC-Auth: a single password, no username.
    Password,
    /// VeNCrypt Plain / RA2 user+password subtype.
    UsernameAndPassword,
    /// RA2 password-only subtype.
    PasswordOnly,
}

/// Credentials supplied in response to a [`CredentialRequest`].
#[derive(Clone)]
pub enum Credentials {
    Password(zeroize::Zeroizing<String>),
    UsernameAndPassword {
        username: String,
        password: zeroize::Zeroizing<String>,
    },
}

/// Supplies credentials on demand. Implementations may block on user
/// interaction; callers treat the call as happening on the handshake
/// thread and therefore subject to the same cancellation token as the
/// rest of the handshake.
pub trait AuthenticationHandler: Send {
    fn provide_credentials(&mut self, request: CredentialRequest) -> Option<Credentials>;
}

/// The result of running a security type's handshake.
pub struct AuthenticationOutcome {
    /// Replaces the base transport when a tunnel (TLS, AES-EAX) was
    /// negotiated; `None` means continue using the transport as-is.
    pub tunnel: Option<BoxedTransport>,
    /// Whether a 4-byte `SecurityResult` word still follows on the
    /// (possibly now-tunnelled) transport.
    pub expects_security_result: bool,
}

impl AuthenticationOutcome {
    pub fn plain(expects_security_result: bool) -> AuthenticationOutcome {
        AuthenticationOutcome {
            tunnel: None,
            expects_security_result,
        }
    }

    pub fn tunnelled(tunnel: BoxedTransport, expects_security_result: bool) -> AuthenticationOutcome {
        AuthenticationOutcome {
            tunnel: Some(tunnel),
            expects_security_result,
        }
    }
}

/// Implemented by every security type. `transport` is taken by value
/// and either returned untouched inside [`AuthenticationOutcome`] or
/// replaced by a tunnel; this mirrors the wrapper-owns-its-base
/// relationship described for transports themselves.
pub trait SecurityType {
    fn id(&self) -> SecurityTypeId;

    fn authenticate(
        &self,
        transport: BoxedTransport,
        handler: &mut dyn AuthenticationHandler,
    ) -> Result<(BoxedTransport, AuthenticationOutcome)>;
}
