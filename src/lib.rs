//! A client-side implementation of the Remote Framebuffer (RFB/VNC)
//! protocol: handshake, pluggable authentication, a rectangle decoder
//! family and a pixel plotter, independent of any UI toolkit.
//!
//! The crate does not open a window, capture input or touch the host
//! clipboard — an embedder supplies those as the collaborator traits in
//! [`collab`] ([`RenderTarget`], [`OutputHandler`], [`CursorHandler`],
//! [`AuthenticationHandler`]) and drives the connection through
//! [`RfbConnection`].
//!
//! ```no_run
//! use rvnc_core::{ConnectParams, RfbConnection, TransportParams};
//! # use rvnc_core::collab::{FramebufferHandle, OutputHandler, CursorHandler, RenderTarget};
//! # use rvnc_core::security::{AuthenticationHandler, CredentialRequest, Credentials};
//! # struct MyRenderTarget; struct MyOutput; struct MyCursor; struct MyAuth;
//! # impl RenderTarget for MyRenderTarget {
//! #     fn grab_framebuffer(&mut self, _: u16, _: u16, _: bool) -> Box<dyn FramebufferHandle + '_> { unimplemented!() }
//! #     fn on_framebuffer_updated(&mut self, _: Option<rvnc_core::Rectangle>) {}
//! # }
//! # impl OutputHandler for MyOutput {}
//! # impl CursorHandler for MyCursor {
//! #     fn update_cursor(&mut self, _: u16, _: u16, _: (u16, u16), _: &[u8]) {}
//! #     fn update_x_cursor(&mut self, _: u16, _: u16, _: (u16, u16), _: (u8,u8,u8), _: (u8,u8,u8), _: &[u8], _: &[u8]) {}
//! # }
//! # impl AuthenticationHandler for MyAuth {
//! #     fn provide_credentials(&mut self, _: CredentialRequest) -> Option<Credentials> { None }
//! # }
//! let params = ConnectParams::new(TransportParams::new("localhost", 5900));
//! let connection = RfbConnection::new(
//!     params,
//!     Box::new(MyAuth),
//!     Box::new(MyRenderTarget),
//!     Box::new(MyOutput),
//!     Box::new(MyCursor),
//! );
//! connection.start()?;
//! # Ok::<(), rvnc_core::Error>(())
//! ```

pub mod cancel;
pub mod collab;
pub mod colormap;
mod connection;
pub mod encodings;
pub mod error;
pub mod framebuffer;
pub mod messages;
pub mod pixel;
pub mod pool;
pub mod protocol;
pub mod queue;
pub mod rect;
pub mod security;
pub mod state;
pub mod transport;

pub use collab::{ConnectParams, RenderFlags, TransportParams};
pub use connection::RfbConnection;
pub use error::{Error, Result};
pub use pixel::PixelFormat;
pub use protocol::RfbVersion;
pub use rect::{Rectangle, Screen};
pub use security::{AuthenticationHandler, CredentialRequest, Credentials};
pub use state::{ConnectionState, InterruptionReason, PropertyChange, StateChange};
