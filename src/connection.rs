//! The connection engine (spec §4.8): the root entity that owns the
//! handshake, the two background workers, and the observable lifecycle
//! state, and ties every other module together into a usable client.

use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use crate::cancel::CancellationToken;
use crate::collab::{AuthenticationHandler, ConnectParams, CursorHandler, OutputHandler, RenderTarget};
use crate::encodings::{self, ids, DecodeContext, DecodeOutcome, EncodingRegistry};
use crate::error::{Error, Result};
use crate::framebuffer::FrameBuffer;
use crate::messages::incoming::{self, ClipboardAction, CutText, IncomingMessage};
use crate::messages::outgoing::OutgoingMessage;
use crate::pixel::PixelFormat;
use crate::pool::BufferPool;
use crate::protocol::{self, RfbVersion, ServerInit};
use crate::queue::{self, FramebufferUpdateRequestParams, SendQueue, SendWorker};
use crate::rect::Rectangle;
use crate::security::{self, AuthenticationOutcome, SecurityType, SecurityTypeId};
use crate::state::{ConnectionState, ConnectionStateMachine, InterruptionReason, PropertyChange, StateChange};
use crate::transport::{BoxedTransport, TcpTransport, Transport};

/// Encodings this client advertises, most-preferred first (spec §4.5
/// "order matters"). Pseudo-encodings for the side-band features this
/// client understands are appended after the frame encodings.
const DEFAULT_ENCODINGS: &[i32] = &[
    ids::TIGHT,
    ids::ZRLE,
    ids::HEXTILE,
    ids::ZLIB,
    ids::CORRE,
    ids::RRE,
    ids::COPY_RECT,
    ids::RAW,
    ids::DESKTOP_SIZE,
    ids::EXTENDED_DESKTOP_SIZE,
    ids::LAST_RECT,
    ids::CURSOR,
    ids::X_CURSOR,
    ids::CURSOR_WITH_ALPHA,
    ids::DESKTOP_NAME,
    ids::QEMU_EXTENDED_KEY_EVENT,
];

fn build_security_candidates(
    server_name: &str,
    pool: &Arc<BufferPool>,
    version: RfbVersion,
) -> Vec<Box<dyn SecurityType>> {
    let mut candidates: Vec<Box<dyn SecurityType>> = Vec::new();
    candidates.push(Box::new(security::vencrypt::VeNCrypt::new(server_name, true)));
    #[cfg(feature = "ra2")]
    {
        use crate::security::ra2::{Ra2, RaHash};
        candidates.push(Box::new(Ra2::new(SecurityTypeId::RA2_256, RaHash::Sha256, false, true, pool.clone())));
        candidates.push(Box::new(Ra2::new(SecurityTypeId::RA2NE_256, RaHash::Sha256, true, true, pool.clone())));
        candidates.push(Box::new(Ra2::new(SecurityTypeId::RA2, RaHash::Sha1, false, true, pool.clone())));
        candidates.push(Box::new(Ra2::new(SecurityTypeId::RA2NE, RaHash::Sha1, true, true, pool.clone())));
    }
    #[cfg(not(feature = "ra2"))]
    let _ = pool;
    candidates.push(Box::new(security::vnc_auth::VncAuth::new(true)));
    // Security type None skips the SecurityResult word entirely in RFB
    // 3.3/3.7; RFB 3.8 sends it (and a reason string on failure) for
    // every security type, None included.
    candidates.push(Box::new(security::none::NoSecurity::new(version >= RfbVersion::V3_8)));
    candidates
}

/// Runs the handshake (spec §4.4) to completion: version negotiation,
/// security-type selection and authentication, `ClientInit`/`ServerInit`.
/// Returns the (possibly tunnelled) transport and the parsed
/// `ServerInit`, ready for the workers to take over.
fn handshake(
    mut transport: BoxedTransport,
    params: &ConnectParams,
    auth_handler: &mut dyn AuthenticationHandler,
    pool: &Arc<BufferPool>,
) -> Result<(BoxedTransport, ServerInit, RfbVersion)> {
    let server_version = protocol::read_version(&mut transport)?;
    let version = protocol::write_version(&mut transport, server_version)?;
    log::info!("negotiated RFB version {}.{}", version.major, version.minor);

    let candidates = build_security_candidates(params.transport.server_name(), pool, version);

    let chosen = if version.uses_security_list() {
        let offered = protocol::read_security_types_37(&mut transport)?;
        let pick = candidates
            .into_iter()
            .find(|candidate| offered.contains(&candidate.id().0))
            .ok_or_else(|| Error::NoAcceptableSecurityType(format!("server offered {offered:?}")))?;
        protocol::write_security_type_choice(&mut transport, pick.id().0)?;
        pick
    } else {
        let dictated = protocol::read_security_type_33(&mut transport)?;
        let id = dictated.expect("read_security_type_33 returns Err, not None, on refusal");
        candidates
            .into_iter()
            .find(|candidate| candidate.id().0 == id)
            .ok_or_else(|| Error::NoAcceptableSecurityType(format!("server dictated type {id}")))?
    };

    log::debug!("selected security type {:?}", chosen.id());
    let (mut transport, AuthenticationOutcome { expects_security_result, .. }) =
        chosen.authenticate(transport, auth_handler)?;

    if expects_security_result {
        protocol::read_security_result(&mut transport, version)?;
    }

    protocol::write_client_init(&mut transport, params.allow_shared_connection)?;
    let server_init = protocol::read_server_init(&mut transport)?;

    if !params.post_init_delay.is_zero() {
        std::thread::sleep(params.post_init_delay);
    }

    Ok((transport, server_init, version))
}

struct SharedTransport<'a> {
    inner: &'a Mutex<BoxedTransport>,
}

impl<'a> Read for SharedTransport<'a> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.inner.lock().unwrap().read(buf)
    }
}

impl<'a> Write for SharedTransport<'a> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.inner.lock().unwrap().write(buf)
    }
    fn flush(&mut self) -> io::Result<()> {
        self.inner.lock().unwrap().flush()
    }
}

impl<'a> Transport for SharedTransport<'a> {
    fn is_encrypted(&self) -> bool {
        self.inner.lock().unwrap().is_encrypted()
    }
}

const RECEIVE_POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Reads exactly `buf.len()` bytes from the shared transport, locking
/// it only for the duration of each underlying `read` call so the send
/// worker gets a turn between chunks instead of being starved for the
/// whole message.
fn shared_read_exact(
    shared: &Mutex<BoxedTransport>,
    buf: &mut [u8],
    cancel: &CancellationToken,
) -> Result<()> {
    let mut filled = 0;
    while filled < buf.len() {
        cancel.check()?;
        let mut guard = shared.lock().unwrap();
        guard.set_poll_timeout(Some(RECEIVE_POLL_INTERVAL))?;
        match guard.read(&mut buf[filled..]) {
            Ok(0) => return Err(Error::Disconnected),
            Ok(n) => filled += n,
            Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {
                drop(guard);
                continue;
            }
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}

/// A `Read` adapter over the shared transport for the receive worker,
/// so message parsers written against a plain `Read` (the ones in
/// `messages::incoming` and `encodings`) don't need to know about
/// sharing or cancellation.
struct ReceiveReader<'a> {
    shared: &'a Mutex<BoxedTransport>,
    cancel: &'a CancellationToken,
}

impl<'a> Read for ReceiveReader<'a> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match shared_read_exact(self.shared, &mut buf[..1.min(buf.len())], self.cancel) {
            Ok(()) if buf.is_empty() => Ok(0),
            Ok(()) => Ok(1),
            Err(Error::Cancelled) => Err(io::Error::new(io::ErrorKind::Other, "cancelled")),
            Err(Error::Disconnected) => Ok(0),
            Err(Error::Transport(e)) => Err(e),
            Err(other) => Err(io::Error::new(io::ErrorKind::Other, other.to_string())),
        }
    }
}

/// Bundles everything the receive worker's rectangle loop needs beyond
/// what it reads off the wire.
struct ReceiveEnvironment<'conn> {
    fsm: &'conn ConnectionStateMachine,
    pool: &'conn Arc<BufferPool>,
    framebuffer: Mutex<FrameBuffer>,
    render_target: &'conn Mutex<Box<dyn RenderTarget>>,
    output_handler: &'conn Mutex<Box<dyn OutputHandler>>,
    cursor_handler: &'conn Mutex<Box<dyn CursorHandler>>,
    send_queue: &'conn SendQueue,
    render_flags: crate::collab::RenderFlags,
    property_observers: &'conn dyn Fn(PropertyChange),
}

fn run_receive_loop(
    shared: &Mutex<BoxedTransport>,
    cancel: &CancellationToken,
    env: &ReceiveEnvironment,
    mut registry: EncodingRegistry,
) -> Result<()> {
    loop {
        cancel.check()?;
        let mut reader = ExactReader { shared, cancel };
        let header = incoming::read_header(&mut reader)?;
        match header {
            IncomingMessage::FramebufferUpdate { rect_count } => {
                handle_framebuffer_update(shared, cancel, env, &mut registry, rect_count)?;
            }
            IncomingMessage::SetColorMapEntries { first_color, entries } => {
                let mut protocol = env.fsm.protocol();
                protocol.color_map = protocol.color_map.with_update(first_color, &entries);
            }
            IncomingMessage::Bell => env.output_handler.lock().unwrap().bell(),
            IncomingMessage::ServerCutText(CutText::Plain(text)) => {
                env.output_handler.lock().unwrap().clipboard_text(&text);
            }
            IncomingMessage::ServerCutText(CutText::Extended(msg)) => {
                handle_extended_clipboard(env, msg);
            }
            IncomingMessage::XvpServer { version, code } => {
                let mut protocol = env.fsm.protocol();
                protocol.xvp_supported = true;
                protocol.xvp_version = version;
                drop(protocol);
                env.output_handler.lock().unwrap().xvp_result(code == 1, code);
            }
        }
    }
}

fn handle_extended_clipboard(env: &ReceiveEnvironment, msg: incoming::ExtendedClipboardMessage) {
    match msg.action {
        ClipboardAction::Caps => {
            let mut protocol = env.fsm.protocol();
            protocol.extended_clipboard_formats = msg.formats;
        }
        ClipboardAction::Provide => {
            let names = ["text", "rtf", "html", "dib", "files"];
            let mut handler = env.output_handler.lock().unwrap();
            for (data, name) in msg.provided.iter().zip(
                names.iter().enumerate().filter(|(i, _)| msg.formats & (1 << i) != 0).map(|(_, n)| n),
            ) {
                handler.clipboard_extended(name, data);
            }
        }
        ClipboardAction::Request | ClipboardAction::Peek | ClipboardAction::Notify => {
            log::debug!("extended clipboard control message {:?} ignored (no reply implemented)", msg.action);
        }
    }
}

/// A `Read` impl that reads exactly one byte per call through the
/// shared, cancellable transport — enough for the byteorder/std
/// `read_exact`-based parsers in `messages`/`encodings` to work
/// unmodified, at the cost of a lock acquisition per byte on the
/// decode hot path. Rectangle payloads read in bulk through
/// [`shared_read_exact`] directly instead of through this adapter; see
/// `decode_rectangle`.
struct ExactReader<'a> {
    shared: &'a Mutex<BoxedTransport>,
    cancel: &'a CancellationToken,
}

impl<'a> Read for ExactReader<'a> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        match shared_read_exact(self.shared, buf, self.cancel) {
            Ok(()) => Ok(buf.len()),
            Err(Error::Cancelled) => Err(io::Error::new(io::ErrorKind::Other, "cancelled")),
            Err(Error::Transport(e)) => Err(e),
            Err(other) => Err(io::Error::new(io::ErrorKind::Other, other.to_string())),
        }
    }
}

fn handle_framebuffer_update(
    shared: &Mutex<BoxedTransport>,
    cancel: &CancellationToken,
    env: &ReceiveEnvironment,
    registry: &mut EncodingRegistry,
    rect_count: u16,
) -> Result<()> {
    use byteorder::{BigEndian, ReadBytesExt};

    let mut dirty: Option<Rectangle> = None;
    let mut remaining = rect_count;
    loop {
        if remaining == 0 {
            break;
        }
        remaining -= 1;
        let mut reader = ExactReader { shared, cancel };
        let x = reader.read_u16::<BigEndian>()?;
        let y = reader.read_u16::<BigEndian>()?;
        let width = reader.read_u16::<BigEndian>()?;
        let height = reader.read_u16::<BigEndian>()?;
        let encoding = reader.read_i32::<BigEndian>()?;
        let rect = Rectangle::new(x, y, width, height);

        env.fsm.mark_encoding_type_used(encoding);

        let server_format = env.fsm.protocol().pixel_format.clone();
        let mut framebuffer = env.framebuffer.lock().unwrap();
        let color_map = env.fsm.protocol().color_map.clone();
        let mut ctx = DecodeContext {
            framebuffer: &mut framebuffer,
            colormap: &color_map,
            pool: env.pool,
            server_format: &server_format,
        };
        let outcome = registry.decode(&mut reader, &mut ctx, rect, encoding)?;
        drop(framebuffer);

        match outcome {
            DecodeOutcome::FramePainted => {
                dirty = Some(match dirty {
                    Some(existing) => union_rect(existing, rect),
                    None => rect,
                });
            }
            DecodeOutcome::DesktopResized { width, height } => {
                env.framebuffer.lock().unwrap().resize(width, height);
                let mut protocol = env.fsm.protocol();
                protocol.framebuffer_width = width;
                protocol.framebuffer_height = height;
                drop(protocol);
                (env.property_observers)(PropertyChange::FramebufferSize { width, height });
                registry.reset_streams();
                dirty = None;
            }
            DecodeOutcome::ExtendedDesktopResized { width, height, screens, .. } => {
                env.framebuffer.lock().unwrap().resize(width, height);
                let mut protocol = env.fsm.protocol();
                protocol.framebuffer_width = width;
                protocol.framebuffer_height = height;
                protocol.screens = screens.clone();
                drop(protocol);
                (env.property_observers)(PropertyChange::FramebufferSize { width, height });
                (env.property_observers)(PropertyChange::ScreenLayout(screens));
                registry.reset_streams();
                dirty = None;
            }
            DecodeOutcome::LastRect => break,
            DecodeOutcome::DesktopNameChanged(name) => {
                env.fsm.protocol().desktop_name = name.clone();
                (env.property_observers)(PropertyChange::DesktopName(name.clone()));
                env.output_handler.lock().unwrap().desktop_name_changed(&name);
            }
            DecodeOutcome::Cursor { width, height, hotspot, rgba } => {
                env.cursor_handler.lock().unwrap().update_cursor(width, height, hotspot, &rgba);
            }
            DecodeOutcome::XCursor { width, height, hotspot, primary, secondary, bitmap, mask } => {
                env.cursor_handler
                    .lock()
                    .unwrap()
                    .update_x_cursor(width, height, hotspot, primary, secondary, &bitmap, &mask);
            }
            DecodeOutcome::CursorWithAlpha { width, height, hotspot, rgba_premultiplied } => {
                env.cursor_handler.lock().unwrap().update_cursor_with_alpha(
                    width,
                    height,
                    hotspot,
                    &rgba_premultiplied,
                );
            }
            DecodeOutcome::PointerModeChanged { relative } => {
                env.fsm.protocol().qemu_pointer_relative = relative;
                env.output_handler.lock().unwrap().pointer_mode_changed(relative);
            }
            DecodeOutcome::ExtendedKeyEventSupported => {
                env.fsm.protocol().qemu_extended_key_event = true;
            }
            DecodeOutcome::LedStateChanged(state) => {
                env.output_handler.lock().unwrap().led_state_changed(state);
            }
            DecodeOutcome::QemuAudio => {}
        }
    }

    publish_framebuffer(env, dirty);

    let (width, height) = {
        let protocol = env.fsm.protocol();
        (protocol.framebuffer_width, protocol.framebuffer_height)
    };
    env.send_queue.enqueue_framebuffer_update_request(FramebufferUpdateRequestParams {
        incremental: true,
        x: 0,
        y: 0,
        width,
        height,
    });

    Ok(())
}

fn union_rect(a: Rectangle, b: Rectangle) -> Rectangle {
    let x = a.x.min(b.x);
    let y = a.y.min(b.y);
    let right = a.right().max(b.right());
    let bottom = a.bottom().max(b.bottom());
    Rectangle::new(x, y, (right - x as u32) as u16, (bottom - y as u32) as u16)
}

fn publish_framebuffer(env: &ReceiveEnvironment, dirty: Option<Rectangle>) {
    let framebuffer = env.framebuffer.lock().unwrap();
    let mut target = env.render_target.lock().unwrap();
    let track_changes = env.render_flags.update_by_rectangle;
    {
        let mut handle = target.grab_framebuffer(framebuffer.width(), framebuffer.height(), track_changes);
        handle.pixels().copy_from_slice(framebuffer.data());
    }
    target.on_framebuffer_updated(dirty);
}

/// A one-shot signal the first of the two workers to exit fires,
/// carrying the `Result` it exited with. The reconnect supervisor
/// blocks on this instead of joining either `JoinHandle` directly, so
/// it learns a session has died without taking ownership of the thread
/// handles away from whichever of `close`/`force_reconnect`/`Drop`
/// ends up actually joining them.
#[derive(Clone)]
struct SessionOutcome(Arc<(Mutex<Option<Result<(), (InterruptionReason, String)>>>, std::sync::Condvar)>);

impl SessionOutcome {
    fn new() -> SessionOutcome {
        SessionOutcome(Arc::new((Mutex::new(None), std::sync::Condvar::new())))
    }

    /// Records the outcome of a worker thread exiting, if nothing has
    /// been recorded yet (first worker to exit wins), and wakes any
    /// waiter. Takes a reference so the caller can still return the
    /// original, unconsumed `Result` from its thread closure.
    fn signal(&self, result: &Result<()>) {
        let (lock, cvar) = &*self.0;
        let mut slot = lock.lock().unwrap();
        if slot.is_none() {
            *slot = Some(result.as_ref().map(|_| ()).map_err(|err| (classify(err), err.to_string())));
            cvar.notify_all();
        }
    }

    /// Blocks until a worker has signalled, returning the reason and
    /// cause it exited with, or `Ok(())` if it exited cleanly (which
    /// only happens when the session was torn down deliberately).
    fn wait(&self) -> Result<(), (InterruptionReason, String)> {
        let (lock, cvar) = &*self.0;
        let mut slot = lock.lock().unwrap();
        while slot.is_none() {
            slot = cvar.wait(slot).unwrap();
        }
        slot.take().unwrap()
    }
}

/// Everything the connection engine needs to run a single connected
/// session: the shared transport, the send/receive worker handles, and
/// the per-session cancellation token that tears them down.
struct ActiveSession {
    worker_cancel: CancellationToken,
    send_queue: Arc<SendQueue>,
    receive_thread: JoinHandle<Result<()>>,
    send_thread: JoinHandle<Result<()>>,
    outcome: SessionOutcome,
}

/// The root entity (spec §3 `RfbConnection`): owns protocol state, the
/// transport, and the collaborator slots, and drives the lifecycle FSM
/// through `start`/`close`/`force_reconnect`.
pub struct RfbConnection {
    params: Mutex<ConnectParams>,
    auth_handler: Mutex<Box<dyn AuthenticationHandler>>,
    render_target: Mutex<Box<dyn RenderTarget>>,
    output_handler: Mutex<Box<dyn OutputHandler>>,
    cursor_handler: Mutex<Box<dyn CursorHandler>>,
    fsm: Arc<ConnectionStateMachine>,
    pool: Arc<BufferPool>,
    lifecycle: Mutex<()>,
    session: Mutex<Option<ActiveSession>>,
    attempt_count: AtomicU32,
    state_observers: Mutex<Vec<Box<dyn Fn(&StateChange) + Send>>>,
    property_observers: Mutex<Vec<Box<dyn Fn(&PropertyChange) + Send>>>,
    /// Set by `close`/`force_reconnect` before they tear a session down
    /// themselves, so the reconnect supervisor (woken by the same
    /// teardown) knows to stand down instead of starting a reconnect
    /// loop over a session death the caller already handled.
    manual_teardown: std::sync::atomic::AtomicBool,
    /// Cancels a pending reconnect backoff sleep; checked between
    /// attempts so `close` doesn't have to wait out a full delay. Held
    /// in a `Mutex` because `force_reconnect` replaces it with a fresh,
    /// uncancelled token for the supervisor it spawns afterward — a
    /// `CancellationToken` is cancel-once and cannot be un-cancelled.
    reconnect_cancel: Mutex<CancellationToken>,
    reconnect_supervisor: Mutex<Option<JoinHandle<()>>>,
}

impl RfbConnection {
    pub fn new(
        params: ConnectParams,
        auth_handler: Box<dyn AuthenticationHandler>,
        render_target: Box<dyn RenderTarget>,
        output_handler: Box<dyn OutputHandler>,
        cursor_handler: Box<dyn CursorHandler>,
    ) -> RfbConnection {
        RfbConnection {
            params: Mutex::new(params),
            auth_handler: Mutex::new(auth_handler),
            render_target: Mutex::new(render_target),
            output_handler: Mutex::new(output_handler),
            cursor_handler: Mutex::new(cursor_handler),
            fsm: Arc::new(ConnectionStateMachine::new()),
            pool: Arc::new(BufferPool::new()),
            lifecycle: Mutex::new(()),
            session: Mutex::new(None),
            attempt_count: AtomicU32::new(0),
            state_observers: Mutex::new(Vec::new()),
            property_observers: Mutex::new(Vec::new()),
            manual_teardown: std::sync::atomic::AtomicBool::new(false),
            reconnect_cancel: Mutex::new(CancellationToken::new()),
            reconnect_supervisor: Mutex::new(None),
        }
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.fsm.connection_state()
    }

    pub fn on_state_changed(&self, observer: impl Fn(&StateChange) + Send + 'static) {
        self.state_observers.lock().unwrap().push(Box::new(observer));
    }

    pub fn on_property_changed(&self, observer: impl Fn(&PropertyChange) + Send + 'static) {
        self.property_observers.lock().unwrap().push(Box::new(observer));
    }

    fn notify_state(
        &self,
        current: ConnectionState,
        reason: Option<InterruptionReason>,
        cause: Option<String>,
        attempt_count: u32,
        is_manual: bool,
    ) {
        let change = self.fsm.transition(current, reason, cause, attempt_count, is_manual);
        for observer in self.state_observers.lock().unwrap().iter() {
            observer(&change);
        }
    }

    fn notify_property(&self, change: PropertyChange) {
        for observer in self.property_observers.lock().unwrap().iter() {
            observer(&change);
        }
    }

    /// Single-shot initial connect. Fails surfacing the cause; does not
    /// retry (retries only happen once a previously-`Connected` session
    /// is interrupted — see `run_session_and_reconnect`).
    pub fn start(&self) -> Result<()> {
        let _lock = self.lifecycle.lock().unwrap();
        self.notify_state(ConnectionState::Connecting, None, None, 0, true);
        match self.connect_once() {
            Ok(session) => {
                *self.session.lock().unwrap() = Some(session);
                self.notify_state(ConnectionState::Connected, None, None, 0, true);
                self.spawn_reconnect_supervisor();
                Ok(())
            }
            Err(err) => {
                self.notify_state(
                    ConnectionState::Closed,
                    Some(classify(&err)),
                    Some(err.to_string()),
                    0,
                    true,
                );
                Err(err)
            }
        }
    }

    /// Tears down the active session, stands down the reconnect
    /// supervisor and cancels any backoff sleep it's in. Idempotent:
    /// calling `close` on an already-closed connection is a no-op.
    pub fn close(&self) {
        let _lock = self.lifecycle.lock().unwrap();
        if self.connection_state() == ConnectionState::Closed {
            return;
        }
        self.manual_teardown.store(true, Ordering::SeqCst);
        self.reconnect_cancel.lock().unwrap().cancel();
        if let Some(session) = self.session.lock().unwrap().take() {
            session.worker_cancel.cancel();
            let _ = session.receive_thread.join();
            let _ = session.send_thread.join();
            session.outcome.signal(&Err(Error::Cancelled));
        }
        if let Some(supervisor) = self.reconnect_supervisor.lock().unwrap().take() {
            let _ = supervisor.join();
        }
        self.notify_state(ConnectionState::Closed, None, None, 0, true);
    }

    /// Manually tears down and re-runs the handshake once, bypassing
    /// the reconnect backoff delay. Stands down any running supervisor
    /// for the duration of the call so it doesn't race this thread's
    /// own reconnect attempt; spawns a fresh one to watch the new
    /// session on success. On failure no supervisor is left running —
    /// callers that want continued automatic retries should prefer
    /// letting the existing supervisor handle the interruption instead
    /// of calling this.
    pub fn force_reconnect(&self) -> Result<()> {
        let _lock = self.lifecycle.lock().unwrap();
        self.manual_teardown.store(true, Ordering::SeqCst);
        if let Some(supervisor) = self.reconnect_supervisor.lock().unwrap().take() {
            self.reconnect_cancel.lock().unwrap().cancel();
            let _ = supervisor.join();
        }
        if let Some(session) = self.session.lock().unwrap().take() {
            session.worker_cancel.cancel();
            let _ = session.receive_thread.join();
            let _ = session.send_thread.join();
            session.outcome.signal(&Err(Error::Cancelled));
        }
        self.notify_state(ConnectionState::Reconnecting, None, None, self.attempt_count.load(Ordering::SeqCst), true);
        let result = self.connect_once();
        self.manual_teardown.store(false, Ordering::SeqCst);
        match result {
            Ok(session) => {
                *self.session.lock().unwrap() = Some(session);
                self.attempt_count.store(0, Ordering::SeqCst);
                self.notify_state(ConnectionState::Connected, None, None, 0, true);
                *self.reconnect_cancel.lock().unwrap() = CancellationToken::new();
                self.spawn_reconnect_supervisor();
                Ok(())
            }
            Err(err) => {
                self.notify_state(ConnectionState::ReconnectFailed, Some(classify(&err)), Some(err.to_string()), 0, true);
                Err(err)
            }
        }
    }

    fn connect_once(&self) -> Result<ActiveSession> {
        let params = self.params.lock().unwrap();
        let host = params.transport.host.clone();
        let port = params.transport.port;
        log::info!("connecting to {host}:{port}");
        let transport: BoxedTransport = Box::new(TcpTransport::connect(&host, port)?);

        let mut auth_handler = self.auth_handler.lock().unwrap();
        let (transport, server_init, version) =
            handshake(transport, &params, &mut **auth_handler, &self.pool)?;
        drop(auth_handler);

        {
            let mut protocol = self.fsm.protocol();
            protocol.version = Some(version);
            protocol.pixel_format = server_init.pixel_format.clone();
            protocol.framebuffer_width = server_init.width;
            protocol.framebuffer_height = server_init.height;
            protocol.desktop_name = server_init.name.clone();
        }
        self.notify_property(PropertyChange::ProtocolVersion(version));
        self.notify_property(PropertyChange::FramebufferSize { width: server_init.width, height: server_init.height });
        self.notify_property(PropertyChange::DesktopName(server_init.name.clone()));

        let framebuffer = FrameBuffer::new(server_init.width, server_init.height, server_init.pixel_format.clone());

        let worker_cancel = CancellationToken::new();
        let (send_queue, send_worker) =
            queue::channel(params.framebuffer_update_interval, params.pointer_event_interval);

        self.enqueue_initial_messages(&send_queue, &server_init, &params);

        let shared_transport = Arc::new(Mutex::new(transport));
        let tick = params.framebuffer_update_interval.min(Duration::from_millis(50));
        let outcome = SessionOutcome::new();

        let receive_thread = {
            let shared_transport = Arc::clone(&shared_transport);
            let cancel = worker_cancel.clone();
            let fsm = Arc::clone(&self.fsm);
            let pool = Arc::clone(&self.pool);
            let render_target: *const Mutex<Box<dyn RenderTarget>> = &self.render_target;
            let output_handler: *const Mutex<Box<dyn OutputHandler>> = &self.output_handler;
            let cursor_handler: *const Mutex<Box<dyn CursorHandler>> = &self.cursor_handler;
            let self_ptr: *const RfbConnection = self;
            let send_queue_for_worker = Arc::clone(&send_queue);
            let render_flags = params.render_flags;
            let outcome = outcome.clone();
            // SAFETY: `RfbConnection` outlives every worker thread it
            // spawns — `close`/`force_reconnect`/`Drop` always join both
            // threads before the connection (and therefore these
            // `Mutex`es, and `self_ptr` itself) can be dropped.
            std::thread::Builder::new()
                .name("rvnc-receive".into())
                .spawn(move || -> Result<()> {
                    let property_sink = move |change: PropertyChange| {
                        unsafe { &*self_ptr }.notify_property(change);
                    };
                    let env = ReceiveEnvironment {
                        fsm: &fsm,
                        pool: &pool,
                        framebuffer: Mutex::new(framebuffer),
                        render_target: unsafe { &*render_target },
                        output_handler: unsafe { &*output_handler },
                        cursor_handler: unsafe { &*cursor_handler },
                        send_queue: &send_queue_for_worker,
                        render_flags,
                        property_observers: &property_sink,
                    };
                    let result = run_receive_loop(&shared_transport, &cancel, &env, EncodingRegistry::new());
                    outcome.signal(&result);
                    result
                })
                .expect("spawning the receive worker thread")
        };

        let send_thread = {
            let shared_transport = Arc::clone(&shared_transport);
            let cancel = worker_cancel.clone();
            let send_queue = Arc::clone(&send_queue);
            let outcome = outcome.clone();
            std::thread::Builder::new()
                .name("rvnc-send".into())
                .spawn(move || -> Result<()> {
                    let mut handle = SharedTransport { inner: &shared_transport };
                    let result = send_worker.run(&mut handle, &send_queue, &cancel, tick);
                    outcome.signal(&result);
                    result
                })
                .expect("spawning the send worker thread")
        };

        Ok(ActiveSession { worker_cancel, send_queue, receive_thread, send_thread, outcome })
    }

    fn enqueue_initial_messages(&self, queue: &SendQueue, server_init: &ServerInit, params: &ConnectParams) {
        self.fsm.mark_message_type_used(crate::messages::opcodes::SET_PIXEL_FORMAT);
        queue.enqueue(OutgoingMessage::SetPixelFormat(server_init.pixel_format.clone()));

        let mut encodings: Vec<i32> = DEFAULT_ENCODINGS.to_vec();
        if (0..=9).contains(&params.preferred_compression_level) {
            encodings.push(-256 + params.preferred_compression_level as i32);
        }
        self.fsm.mark_message_type_used(crate::messages::opcodes::SET_ENCODINGS);
        queue.enqueue(OutgoingMessage::SetEncodings(encodings));

        if !params.post_set_encodings_delay.is_zero() {
            std::thread::sleep(params.post_set_encodings_delay);
        }

        self.fsm.mark_message_type_used(crate::messages::opcodes::FRAMEBUFFER_UPDATE_REQUEST);
        queue.enqueue_framebuffer_update_request(FramebufferUpdateRequestParams {
            incremental: false,
            x: 0,
            y: 0,
            width: server_init.width,
            height: server_init.height,
        });
    }

    /// Sends a pointer event, throttled per spec §4.7. Coordinates are
    /// clamped to `[0, 32767]`; conflicting wheel-up/wheel-down bits
    /// (spec §4.5) are dropped rather than forwarded.
    pub fn send_pointer_event(&self, buttons: u8, x: u16, y: u16) {
        const WHEEL_UP: u8 = 0x08;
        const WHEEL_DOWN: u8 = 0x10;
        let mut buttons = buttons;
        if buttons & WHEEL_UP != 0 && buttons & WHEEL_DOWN != 0 {
            buttons &= !(WHEEL_UP | WHEEL_DOWN);
        }
        if let Some(session) = self.session.lock().unwrap().as_ref() {
            self.fsm.mark_message_type_used(crate::messages::opcodes::POINTER_EVENT);
            session.send_queue.enqueue_pointer_event(queue::PointerEventParams {
                buttons,
                x: x.min(32767),
                y: y.min(32767),
            });
        }
    }

    pub fn send_key_event(&self, down: bool, keysym: u32) {
        if let Some(session) = self.session.lock().unwrap().as_ref() {
            self.fsm.mark_message_type_used(crate::messages::opcodes::KEY_EVENT);
            session.send_queue.enqueue(OutgoingMessage::KeyEvent { down, keysym });
        }
    }

    pub fn send_client_cut_text(&self, text: impl Into<String>) {
        if let Some(session) = self.session.lock().unwrap().as_ref() {
            self.fsm.mark_message_type_used(crate::messages::opcodes::CLIENT_CUT_TEXT);
            session.send_queue.enqueue(OutgoingMessage::ClientCutText(text.into()));
        }
    }

    /// Spawns the background thread that watches the current session's
    /// workers and drives `Interrupted → Reconnecting → (Connected |
    /// ReconnectFailed)*` once they exit on their own (as opposed to
    /// being torn down by `close`/`force_reconnect`, which stand this
    /// loop down via `manual_teardown` before it can race them).
    fn spawn_reconnect_supervisor(&self) {
        let self_ptr: *const RfbConnection = self;
        // SAFETY: `RfbConnection` outlives every thread it spawns —
        // `close` always joins this thread before the connection (and
        // therefore everything it points back into) can be dropped.
        let handle = std::thread::Builder::new()
            .name("rvnc-reconnect".into())
            .spawn(move || {
                let connection = unsafe { &*self_ptr };
                connection.supervise_reconnects();
            })
            .expect("spawning the reconnect supervisor thread");
        *self.reconnect_supervisor.lock().unwrap() = Some(handle);
    }

    /// Body of the reconnect supervisor thread. Blocks on the current
    /// session's outcome, then — unless the caller is already tearing
    /// things down manually — announces `Interrupted` and retries with
    /// the configured backoff until `max_reconnect_attempts` is
    /// exhausted, a manual `close`/`force_reconnect` wakes it instead,
    /// or a retry succeeds (at which point it goes back to watching the
    /// new session).
    fn supervise_reconnects(&self) {
        loop {
            let outcome = match self.session.lock().unwrap().as_ref() {
                Some(session) => session.outcome.clone(),
                None => return,
            };
            let result = outcome.wait();
            if self.manual_teardown.load(Ordering::SeqCst) {
                return;
            }
            let (mut reason, mut cause) = match result {
                Ok(()) => return,
                Err(rc) => rc,
            };
            self.notify_state(ConnectionState::Interrupted, Some(reason), Some(cause.clone()), 0, false);

            loop {
                if self.manual_teardown.load(Ordering::SeqCst) {
                    return;
                }
                let max_attempts = self.params.lock().unwrap().max_reconnect_attempts;
                let attempt = self.attempt_count.fetch_add(1, Ordering::SeqCst) + 1;
                if let Some(max) = max_attempts {
                    if attempt > max {
                        self.notify_state(ConnectionState::Closed, Some(reason), Some(cause), attempt - 1, false);
                        return;
                    }
                }
                self.notify_state(ConnectionState::Reconnecting, Some(reason), Some(cause.clone()), attempt, false);

                let delay = self.params.lock().unwrap().reconnect_delay;
                let cancel = self.reconnect_cancel.lock().unwrap().clone();
                cancel.wait_timeout(delay);
                if self.manual_teardown.load(Ordering::SeqCst) {
                    return;
                }

                let _lock = self.lifecycle.lock().unwrap();
                if self.manual_teardown.load(Ordering::SeqCst) {
                    return;
                }
                if let Some(stale) = self.session.lock().unwrap().take() {
                    stale.worker_cancel.cancel();
                    let _ = stale.receive_thread.join();
                    let _ = stale.send_thread.join();
                }
                match self.connect_once() {
                    Ok(session) => {
                        *self.session.lock().unwrap() = Some(session);
                        self.attempt_count.store(0, Ordering::SeqCst);
                        self.notify_state(ConnectionState::Connected, None, None, attempt, false);
                        break;
                    }
                    Err(err) => {
                        reason = classify(&err);
                        cause = err.to_string();
                        self.notify_state(ConnectionState::ReconnectFailed, Some(reason), Some(cause.clone()), attempt, false);
                    }
                }
            }
        }
    }
}

fn classify(err: &Error) -> InterruptionReason {
    match err {
        Error::Transport(_) | Error::Disconnected => InterruptionReason::TransportError,
        Error::Cancelled => InterruptionReason::Cancelled,
        Error::AuthenticationFailure(_) | Error::AuthenticationUnavailable | Error::KeyMismatch | Error::AuthenticationTagMismatch => {
            InterruptionReason::AuthenticationError
        }
        _ => InterruptionReason::ProtocolError,
    }
}

impl Drop for RfbConnection {
    fn drop(&mut self) {
        self.manual_teardown.store(true, Ordering::SeqCst);
        self.reconnect_cancel.lock().unwrap().cancel();
        if let Some(session) = self.session.lock().unwrap().take() {
            session.worker_cancel.cancel();
            let _ = session.receive_thread.join();
            let _ = session.send_thread.join();
            session.outcome.signal(&Err(Error::Cancelled));
        }
        if let Some(supervisor) = self.reconnect_supervisor.lock().unwrap().take() {
            let _ = supervisor.join();
        }
    }
}
