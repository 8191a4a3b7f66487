//! The outgoing message FIFO (spec §4.7): a bounded-in-spirit queue fed
//! by the application and drained by the send worker, with dedicated
//! throttling for framebuffer-update-requests and pointer events so a
//! caller hammering either one can't flood the wire.

use std::sync::mpsc;
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::cancel::CancellationToken;
use crate::error::Result;
use crate::messages::outgoing::OutgoingMessage;
use crate::transport::Transport;

const COMPLETION_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// A one-shot signal a `send_and_wait` caller blocks on until the send
/// worker has serialized its message.
#[derive(Clone)]
struct Completion(Arc<(Mutex<bool>, Condvar)>);

impl Completion {
    fn new() -> Completion {
        Completion(Arc::new((Mutex::new(false), Condvar::new())))
    }

    fn signal(&self) {
        let (lock, cvar) = &*self.0;
        *lock.lock().unwrap() = true;
        cvar.notify_all();
    }

    fn wait(&self, cancel: &CancellationToken) -> Result<()> {
        let (lock, cvar) = &*self.0;
        let mut done = lock.lock().unwrap();
        while !*done {
            cancel.check()?;
            let (guard, timeout) = cvar.wait_timeout(done, COMPLETION_POLL_INTERVAL).unwrap();
            done = guard;
            if timeout.timed_out() {
                continue;
            }
        }
        Ok(())
    }
}

struct QueueItem {
    message: OutgoingMessage,
    completion: Option<Completion>,
}

#[derive(Clone, Copy, Debug)]
pub struct FramebufferUpdateRequestParams {
    pub incremental: bool,
    pub x: u16,
    pub y: u16,
    pub width: u16,
    pub height: u16,
}

impl FramebufferUpdateRequestParams {
    fn into_message(self) -> OutgoingMessage {
        OutgoingMessage::FramebufferUpdateRequest {
            incremental: self.incremental,
            x: self.x,
            y: self.y,
            width: self.width,
            height: self.height,
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub struct PointerEventParams {
    pub buttons: u8,
    pub x: u16,
    pub y: u16,
}

impl PointerEventParams {
    fn into_message(self) -> OutgoingMessage {
        OutgoingMessage::PointerEvent { buttons: self.buttons, x: self.x, y: self.y }
    }
}

/// Per-kind throttle: enforces a minimum gap between sends, coalescing
/// anything that arrives before the gap has elapsed into a single
/// deferred slot — the last request enqueued during the window wins.
struct Throttle<T> {
    min_interval: Duration,
    last_sent: Option<Instant>,
    deferred: Option<T>,
}

impl<T: Copy> Throttle<T> {
    fn new(min_interval: Duration) -> Throttle<T> {
        Throttle { min_interval, last_sent: None, deferred: None }
    }

    /// Returns `Some(value)` if the caller should send immediately,
    /// otherwise stashes it as the (possibly replaced) deferred value.
    fn admit(&mut self, value: T, now: Instant) -> Option<T> {
        let due = match self.last_sent {
            None => true,
            Some(last) => now.duration_since(last) >= self.min_interval,
        };
        if due {
            self.last_sent = Some(now);
            self.deferred = None;
            Some(value)
        } else {
            self.deferred = Some(value);
            None
        }
    }

    /// Called periodically by the worker: if a deferred value is
    /// waiting and the interval has now elapsed, releases it.
    fn take_due(&mut self, now: Instant) -> Option<T> {
        let due = match self.last_sent {
            None => true,
            Some(last) => now.duration_since(last) >= self.min_interval,
        };
        if due && self.deferred.is_some() {
            self.last_sent = Some(now);
            self.deferred.take()
        } else {
            None
        }
    }
}

/// The application-facing handle: enqueue messages, optionally waiting
/// for the send worker to have serialized them.
pub struct SendQueue {
    tx: mpsc::Sender<QueueItem>,
    fbur: Mutex<Throttle<FramebufferUpdateRequestParams>>,
    pointer: Mutex<Throttle<PointerEventParams>>,
}

/// The worker-facing half: owns the receiving end and drains it onto a
/// transport.
pub struct SendWorker {
    rx: mpsc::Receiver<QueueItem>,
}

/// Builds a connected `(SendQueue, SendWorker)` pair. The queue is
/// wrapped in `Arc` because both the application (enqueuing from
/// whatever thread it calls from) and the send worker thread (draining
/// deferred throttle slots) need a handle to the same throttle state.
pub fn channel(fbur_interval: Duration, pointer_interval: Duration) -> (Arc<SendQueue>, SendWorker) {
    let (tx, rx) = mpsc::channel();
    (
        Arc::new(SendQueue {
            tx,
            fbur: Mutex::new(Throttle::new(fbur_interval)),
            pointer: Mutex::new(Throttle::new(pointer_interval)),
        }),
        SendWorker { rx },
    )
}

impl SendQueue {
    /// Enqueues `message` without waiting for it to be sent.
    pub fn enqueue(&self, message: OutgoingMessage) {
        let _ = self.tx.send(QueueItem { message, completion: None });
    }

    /// Enqueues `message` and blocks until the send worker has
    /// serialized it (or cancellation fires).
    pub fn send_and_wait(&self, message: OutgoingMessage, cancel: &CancellationToken) -> Result<()> {
        let completion = Completion::new();
        if self.tx.send(QueueItem { message, completion: Some(completion.clone()) }).is_err() {
            return Err(crate::Error::Disconnected);
        }
        completion.wait(cancel)
    }

    /// Throttled `FramebufferUpdateRequest`. The first call after
    /// construction is always admitted immediately, matching the
    /// first-request-must-be-non-incremental invariant enforced by the
    /// caller (the initializer always passes `incremental: false` on
    /// its first call).
    pub fn enqueue_framebuffer_update_request(&self, params: FramebufferUpdateRequestParams) {
        let mut throttle = self.fbur.lock().unwrap();
        if let Some(admitted) = throttle.admit(params, Instant::now()) {
            drop(throttle);
            self.enqueue(admitted.into_message());
        }
    }

    pub fn enqueue_pointer_event(&self, params: PointerEventParams) {
        let mut throttle = self.pointer.lock().unwrap();
        if let Some(admitted) = throttle.admit(params, Instant::now()) {
            drop(throttle);
            self.enqueue(admitted.into_message());
        }
    }

    /// Releases any deferred framebuffer-update-request or pointer
    /// event whose throttle window has now elapsed, pushing it onto the
    /// FIFO for the worker to pick up on its next iteration.
    fn release_due_deferred(&self) {
        let now = Instant::now();
        if let Some(params) = self.fbur.lock().unwrap().take_due(now) {
            self.enqueue(params.into_message());
        }
        if let Some(params) = self.pointer.lock().unwrap().take_due(now) {
            self.enqueue(params.into_message());
        }
    }
}

impl SendWorker {
    /// Drains the FIFO onto `transport` until cancelled or the queue's
    /// sender half is dropped. `tick` bounds how often deferred,
    /// throttled messages get a chance to fire even when nothing new
    /// has been enqueued.
    pub fn run<T: Transport + ?Sized>(
        &self,
        transport: &mut T,
        queue: &SendQueue,
        cancel: &CancellationToken,
        tick: Duration,
    ) -> Result<()> {
        loop {
            cancel.check()?;
            queue.release_due_deferred();
            match self.rx.recv_timeout(tick) {
                Ok(item) => {
                    item.message.write(transport)?;
                    transport.flush()?;
                    if let Some(completion) = item.completion {
                        completion.signal();
                    }
                }
                Err(mpsc::RecvTimeoutError::Timeout) => continue,
                Err(mpsc::RecvTimeoutError::Disconnected) => return Ok(()),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn throttle_admits_first_request_immediately() {
        let mut throttle: Throttle<u32> = Throttle::new(Duration::from_millis(40));
        assert_eq!(throttle.admit(1, Instant::now()), Some(1));
    }

    #[test]
    fn throttle_coalesces_bursts_into_one_deferred_slot() {
        let mut throttle: Throttle<u32> = Throttle::new(Duration::from_millis(40));
        let t0 = Instant::now();
        assert_eq!(throttle.admit(1, t0), Some(1));
        assert_eq!(throttle.admit(2, t0), None);
        assert_eq!(throttle.admit(3, t0), None);
        // Last one wins.
        assert_eq!(throttle.deferred, Some(3));
    }

    #[test]
    fn throttle_releases_deferred_once_interval_elapses() {
        let mut throttle: Throttle<u32> = Throttle::new(Duration::from_millis(40));
        let t0 = Instant::now();
        throttle.admit(1, t0);
        throttle.admit(2, t0);
        assert_eq!(throttle.take_due(t0), None);
        let later = t0 + Duration::from_millis(41);
        assert_eq!(throttle.take_due(later), Some(2));
        assert_eq!(throttle.take_due(later), None);
    }

    struct MemTransport(Vec<u8>);

    impl std::io::Read for MemTransport {
        fn read(&mut self, _buf: &mut [u8]) -> std::io::Result<usize> {
            Ok(0)
        }
    }
    impl std::io::Write for MemTransport {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }
    impl Transport for MemTransport {
        fn is_encrypted(&self) -> bool {
            false
        }
    }

    #[test]
    fn enqueue_and_drain_round_trip() {
        let (queue, worker) = channel(Duration::from_millis(40), Duration::from_millis(10));
        queue.enqueue(OutgoingMessage::ClientCutText("hi".into()));

        let cancel = CancellationToken::new();
        let cancel_for_worker = cancel.clone();
        let queue_for_worker = Arc::clone(&queue);
        let handle = std::thread::spawn(move || {
            let mut transport = MemTransport(Vec::new());
            // Cancellation (injected by the test below) ends the loop
            // with `Error::Cancelled`, which is expected here.
            let _ = worker.run(&mut transport, &queue_for_worker, &cancel_for_worker, Duration::from_millis(5));
            transport
        });

        std::thread::sleep(Duration::from_millis(20));
        cancel.cancel();
        let transport = handle.join().unwrap();
        assert_eq!(transport.0.first(), Some(&crate::messages::opcodes::CLIENT_CUT_TEXT));
    }
}
