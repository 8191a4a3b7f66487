//! Security type 1: no authentication, no tunnel.

use crate::error::Result;
use crate::transport::BoxedTransport;

use super::{AuthenticationHandler, AuthenticationOutcome, SecurityType, SecurityTypeId};

/// The trivial security type. Consumes no handshake bytes; whether a
/// `SecurityResult` word follows depends on the negotiated protocol
/// version, which the handshake layer tracks, not this type itself —
/// callers pass that in via [`NoSecurity::new`].
pub struct NoSecurity {
    expects_security_result: bool,
}

impl NoSecurity {
    pub fn new(expects_security_result: bool) -> NoSecurity {
        NoSecurity { expects_security_result }
    }
}

impl SecurityType for NoSecurity {
    fn id(&self) -> SecurityTypeId {
        SecurityTypeId::NONE
    }

    fn authenticate(
        &self,
        transport: BoxedTransport,
        _handler: &mut dyn AuthenticationHandler,
    ) -> Result<(BoxedTransport, AuthenticationOutcome)> {
        Ok((transport, AuthenticationOutcome::plain(self.expects_security_result)))
    }
}
