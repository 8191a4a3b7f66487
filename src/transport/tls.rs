//! Synchronous TLS transport used by the VeNCrypt `TLS*`/`X509*`
//! subtypes. `rustls::ClientConnection` is transport-agnostic, so it is
//! driven directly over a blocking [`Transport`] rather than through an
//! async connector.

use std::io::{self, Read, Write};
use std::sync::Arc;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, ClientConnection, DigitallySignedStruct, RootCertStore, SignatureScheme};

use super::{BoxedTransport, Transport};
use crate::error::{Error, Result};

/// Pluggable certificate acceptance policy. The spec requires an
/// explicit verification hook rather than silent trust-everything, so
/// this is a real trait with [`AcceptAllVerifier`] as one deliberately
/// opt-in implementation, not the only one.
pub trait CertificateVerifier: ServerCertVerifier {}
impl<T: ServerCertVerifier> CertificateVerifier for T {}

/// Accepts every certificate presented by the server. Selecting this
/// verifier is a conscious choice by the embedder (it is never the
/// implicit default for `connect` without the caller picking it).
#[derive(Debug)]
pub struct AcceptAllVerifier;

impl ServerCertVerifier for AcceptAllVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        vec![
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::RSA_PKCS1_SHA384,
            SignatureScheme::RSA_PKCS1_SHA512,
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::ECDSA_NISTP384_SHA384,
            SignatureScheme::ECDSA_NISTP521_SHA512,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::RSA_PSS_SHA384,
            SignatureScheme::RSA_PSS_SHA512,
            SignatureScheme::ED25519,
        ]
    }
}

/// Builds the rustls client config used to upgrade a transport. Passing
/// a [`CertificateVerifier`] other than [`AcceptAllVerifier`] is how an
/// embedder opts into real chain validation.
pub fn client_config(verifier: Arc<dyn ServerCertVerifier>) -> Arc<ClientConfig> {
    let mut config = ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(verifier)
        .with_no_client_auth();
    config.enable_early_data = false;
    Arc::new(config)
}

/// A TLS-wrapped transport. Upgrades happen in place over the base
/// transport, which is left blocking; `rustls::ClientConnection` is
/// driven by alternating plaintext `Read`/`Write` calls against it.
pub struct TlsTransport {
    conn: ClientConnection,
    base: BoxedTransport,
}

impl TlsTransport {
    /// Performs the TLS handshake over `base` for `server_name`,
    /// consuming it. `config` carries the certificate verification
    /// policy the caller selected.
    pub fn upgrade(
        mut base: BoxedTransport,
        server_name: &str,
        config: Arc<ClientConfig>,
    ) -> Result<TlsTransport> {
        let name = ServerName::try_from(server_name.to_string())
            .map_err(|_| Error::unexpected("tls server name", server_name))?;
        let mut conn = ClientConnection::new(config, name)
            .map_err(|e| Error::Protocol(format!("tls setup failed: {e}")))?;

        while conn.is_handshaking() {
            if conn.wants_write() {
                conn.write_tls(&mut base)?;
            }
            if conn.wants_read() {
                let read = conn.read_tls(&mut base)?;
                if read == 0 {
                    return Err(Error::Disconnected);
                }
                conn.process_new_packets()
                    .map_err(|e| Error::Protocol(format!("tls handshake failed: {e}")))?;
            }
        }

        Ok(TlsTransport { conn, base })
    }
}

impl Read for TlsTransport {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            match self.conn.reader().read(buf) {
                Ok(0) if !buf.is_empty() => {
                    let received = self.conn.read_tls(&mut self.base)?;
                    if received == 0 {
                        return Ok(0);
                    }
                    self.conn
                        .process_new_packets()
                        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
                }
                other => return other,
            }
        }
    }
}

impl Write for TlsTransport {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let written = self.conn.writer().write(buf)?;
        self.conn.write_tls(&mut self.base)?;
        Ok(written)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.conn.writer().flush()?;
        self.conn.write_tls(&mut self.base)?;
        self.base.flush()
    }
}

impl Transport for TlsTransport {
    fn is_encrypted(&self) -> bool {
        true
    }

    fn set_poll_timeout(&mut self, timeout: Option<std::time::Duration>) -> io::Result<()> {
        self.base.set_poll_timeout(timeout)
    }
}
