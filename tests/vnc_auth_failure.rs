//! End-to-end: a server that rejects VNC-Auth with a failure reason
//! surfaces `Error::AuthenticationFailure` from `start()` and leaves the
//! connection `Closed` with an `AuthenticationError` interruption.

mod common;

use std::io::{Read, Write};
use std::sync::{Arc, Mutex};

use rvnc_core::collab::{CursorHandler, FramebufferHandle, OutputHandler, RenderTarget};
use rvnc_core::security::{AuthenticationHandler, CredentialRequest, Credentials};
use rvnc_core::{ConnectParams, ConnectionState, InterruptionReason, Rectangle, RfbConnection, TransportParams};

struct WrongPassword;

impl AuthenticationHandler for WrongPassword {
    fn provide_credentials(&mut self, request: CredentialRequest) -> Option<Credentials> {
        match request {
            CredentialRequest::Password => Some(Credentials::Password("not-the-password".to_string().into())),
            _ => None,
        }
    }
}

struct NoOutput;
impl OutputHandler for NoOutput {}

struct NoCursor;
impl CursorHandler for NoCursor {
    fn update_cursor(&mut self, _width: u16, _height: u16, _hotspot: (u16, u16), _rgba: &[u8]) {}
    fn update_x_cursor(
        &mut self,
        _width: u16,
        _height: u16,
        _hotspot: (u16, u16),
        _primary: (u8, u8, u8),
        _secondary: (u8, u8, u8),
        _bitmap: &[u8],
        _mask: &[u8],
    ) {
    }
}

struct UnusedTarget;
impl RenderTarget for UnusedTarget {
    fn grab_framebuffer(&mut self, _width: u16, _height: u16, _track_changes: bool) -> Box<dyn FramebufferHandle + '_> {
        unreachable!("authentication fails before any framebuffer is ever requested")
    }
    fn on_framebuffer_updated(&mut self, _dirty: Option<Rectangle>) {}
}

#[test]
fn rejected_vnc_auth_surfaces_as_authentication_failure() {
    let (listener, port) = common::bind_loopback();

    let server = std::thread::spawn(move || {
        let (mut stream, _) = listener.accept().unwrap();
        common::exchange_version(&mut stream, b"RFB 003.008\n");
        let choice = common::offer_security_types(&mut stream, &[2]); // VNC-Auth
        assert_eq!(choice, 2);

        let challenge = [0x42u8; 16];
        stream.write_all(&challenge).unwrap();
        let mut response = [0u8; 16];
        stream.read_exact(&mut response).unwrap();

        common::write_security_result_failed(&mut stream, "wrong password");

        // Drain anything further the client might still send before it
        // notices the failure and tears the socket down.
        let mut sink = [0u8; 64];
        let _ = stream.read(&mut sink);
    });

    let params = ConnectParams::new(TransportParams::new("127.0.0.1", port));
    let connection = RfbConnection::new(
        params,
        Box::new(WrongPassword),
        Box::new(UnusedTarget),
        Box::new(NoOutput),
        Box::new(NoCursor),
    );

    let observed_reason: Arc<Mutex<Option<InterruptionReason>>> = Arc::new(Mutex::new(None));
    let observed_reason_in_observer = observed_reason.clone();
    connection.on_state_changed(move |change| {
        if change.current == ConnectionState::Closed {
            *observed_reason_in_observer.lock().unwrap() = change.reason;
        }
    });

    let err = connection.start().expect_err("server rejected the VNC-Auth response");
    assert!(matches!(err, rvnc_core::Error::AuthenticationFailure(ref reason) if reason == "wrong password"));
    assert_eq!(connection.connection_state(), ConnectionState::Closed);
    assert_eq!(*observed_reason.lock().unwrap(), Some(InterruptionReason::AuthenticationError));

    server.join().unwrap();
}
