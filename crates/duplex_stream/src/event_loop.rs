// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::io::{self, ErrorKind};
use std::pin::pin;
use std::rc::Rc;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::task::{Context, Poll as TaskPoll};
use std::time::Duration;

use futures::task::{ArcWake, waker};
use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Registry, Token};
use tracing::{Level, event};

use crate::{Descriptor, Direction, Notifier, ReadyCallback};

/// Reserved for the cross-thread waker. Descriptors never map to it.
const WAKE_TOKEN: Token = Token(usize::MAX);

const EVENTS_CAPACITY: usize = 256;

/// A single-threaded [`Notifier`] backed by the operating system's readiness facility
/// (epoll, kqueue) through `mio`.
///
/// Registrations are one-shot: each callback runs at most once, from within
/// [`turn()`][Self::turn]. Re-registering a descriptor re-reports its current readiness, so a
/// stream that re-arms after a would-block is notified as soon as the descriptor is ready again,
/// even if it already was.
///
/// [`block_on()`][Self::block_on] drives a future to completion by alternating polls of the
/// future with turns of the loop.
///
/// # Example
///
/// ```no_run
/// use duplex_stream::{EventLoop, StreamConnector};
///
/// # fn main() -> duplex_stream::Result<()> {
/// let event_loop = EventLoop::new()?;
/// let connector = StreamConnector::new(event_loop.notifier());
///
/// event_loop.block_on(async {
///     let stream = connector.connect("localhost", 8080).await?;
///     stream.write_once(&b"ping"[..])?.await
/// })??;
/// # Ok(())
/// # }
/// ```
pub struct EventLoop {
    inner: Rc<Inner>,
}

struct Inner {
    poll: RefCell<Poll>,
    events: RefCell<Events>,
    registry: Registry,
    waker: Arc<mio::Waker>,
    registrations: RefCell<HashMap<Descriptor, Registration>>,
}

#[derive(Default)]
struct Registration {
    readable: Option<ReadyCallback>,
    writable: Option<ReadyCallback>,

    // Whether the descriptor is known to the poller. Entries outlive their callbacks, as a
    // fired registration leaves the descriptor registered with the poller.
    in_poller: bool,
}

impl Registration {
    fn slot(&mut self, direction: Direction) -> &mut Option<ReadyCallback> {
        match direction {
            Direction::Readable => &mut self.readable,
            Direction::Writable => &mut self.writable,
        }
    }

    fn interest(&self) -> Option<Interest> {
        match (self.readable.is_some(), self.writable.is_some()) {
            (true, true) => Some(Interest::READABLE | Interest::WRITABLE),
            (true, false) => Some(Interest::READABLE),
            (false, true) => Some(Interest::WRITABLE),
            (false, false) => None,
        }
    }

    fn armed(&self) -> usize {
        usize::from(self.readable.is_some()) + usize::from(self.writable.is_some())
    }
}

impl EventLoop {
    /// Creates an event loop with nothing registered.
    ///
    /// # Errors
    ///
    /// Returns an error if the operating system refuses to create the poller.
    pub fn new() -> io::Result<Self> {
        let poll = Poll::new()?;
        let registry = poll.registry().try_clone()?;
        let waker = Arc::new(mio::Waker::new(poll.registry(), WAKE_TOKEN)?);

        event!(Level::TRACE, message = "new event loop");

        Ok(Self {
            inner: Rc::new(Inner {
                poll: RefCell::new(poll),
                events: RefCell::new(Events::with_capacity(EVENTS_CAPACITY)),
                registry,
                waker,
                registrations: RefCell::new(HashMap::new()),
            }),
        })
    }

    /// A handle to this loop for registering readiness interest.
    #[must_use]
    pub fn notifier(&self) -> Rc<dyn Notifier> {
        Rc::clone(&self.inner) as Rc<dyn Notifier>
    }

    /// The number of registrations waiting to fire.
    #[must_use]
    pub fn registration_count(&self) -> usize {
        self.inner
            .registrations
            .borrow()
            .values()
            .map(Registration::armed)
            .sum()
    }

    /// Waits up to `timeout` (forever if `None`) for readiness and runs the callbacks of every
    /// ready registration.
    ///
    /// Returns the number of callbacks that ran. An interrupted wait returns 0.
    ///
    /// # Errors
    ///
    /// Returns an error if waiting on the poller fails.
    pub fn turn(&self, timeout: Option<Duration>) -> io::Result<usize> {
        self.inner.turn(timeout)
    }

    /// Drives `future` to completion on the current thread.
    ///
    /// The future may be woken from any thread, which interrupts a pending wait for readiness.
    ///
    /// # Errors
    ///
    /// Returns an error if waiting on the poller fails, or if the future is pending while
    /// nothing is registered with the loop. Nothing could ever complete it in that case, so
    /// this is reported instead of blocking forever.
    pub fn block_on<F: Future>(&self, future: F) -> crate::Result<F::Output> {
        let signal = Arc::new(WakeSignal {
            woken: AtomicBool::new(false),
            waker: Arc::clone(&self.inner.waker),
        });
        let task_waker = waker(Arc::clone(&signal));
        let mut cx = Context::from_waker(&task_waker);

        let mut future = pin!(future);

        loop {
            if let TaskPoll::Ready(output) = future.as_mut().poll(&mut cx) {
                return Ok(output);
            }

            while !signal.woken.swap(false, Ordering::AcqRel) {
                if self.registration_count() == 0 {
                    return Err(io::Error::other(
                        "future is pending but nothing is registered with the event loop",
                    )
                    .into());
                }

                self.turn(None)?;
            }
        }
    }
}

impl fmt::Debug for EventLoop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventLoop")
            .field("registrations", &self.registration_count())
            .finish_non_exhaustive()
    }
}

impl Inner {
    fn turn(&self, timeout: Option<Duration>) -> io::Result<usize> {
        let mut events = self.events.borrow_mut();

        if let Err(e) = self.poll.borrow_mut().poll(&mut events, timeout) {
            if e.kind() == ErrorKind::Interrupted {
                return Ok(0);
            }

            return Err(e);
        }

        let mut ready = Vec::new();

        {
            let mut registrations = self.registrations.borrow_mut();

            for mio_event in &*events {
                if mio_event.token() == WAKE_TOKEN {
                    continue;
                }

                let Ok(raw) = i32::try_from(mio_event.token().0) else {
                    continue;
                };

                let Some(registration) = registrations.get_mut(&Descriptor::from_raw(raw)) else {
                    continue;
                };

                // Errors and hang-ups are reported to both directions; the transport call
                // that follows surfaces the actual condition.
                let failed = mio_event.is_error();

                if mio_event.is_readable() || mio_event.is_read_closed() || failed {
                    ready.extend(registration.readable.take());
                }

                if mio_event.is_writable() || mio_event.is_write_closed() || failed {
                    ready.extend(registration.writable.take());
                }
            }
        }

        drop(events);

        let count = ready.len();

        if count > 0 {
            event!(Level::TRACE, message = "dispatching readiness", callbacks = count);
        }

        // Callbacks run outside every borrow, as they register again.
        for callback in ready {
            callback();
        }

        Ok(count)
    }

    fn update_poller(&self, descriptor: Descriptor, registration: &mut Registration) -> io::Result<()> {
        let Some(interest) = registration.interest() else {
            return Ok(());
        };

        let raw = descriptor.as_raw();
        let token = Token(usize::try_from(raw).map_err(|e| io::Error::new(ErrorKind::InvalidInput, e))?);
        let mut source = SourceFd(&raw);

        if registration.in_poller {
            match self.registry.reregister(&mut source, token, interest) {
                Ok(()) => return Ok(()),
                // The descriptor was closed and its number reused since it was last registered.
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(e),
            }
        }

        self.registry.register(&mut source, token, interest)?;
        registration.in_poller = true;

        Ok(())
    }
}

impl Notifier for Inner {
    fn register(
        &self,
        descriptor: Descriptor,
        direction: Direction,
        callback: ReadyCallback,
    ) -> io::Result<()> {
        let mut registrations = self.registrations.borrow_mut();
        let registration = registrations.entry(descriptor).or_default();

        let replaced = registration.slot(direction).replace(callback);

        if let Err(e) = self.update_poller(descriptor, registration) {
            let rejected = std::mem::replace(registration.slot(direction), replaced);
            drop(registrations);
            drop(rejected);

            return Err(e);
        }

        drop(registrations);
        drop(replaced);

        event!(Level::TRACE, message = "registered", descriptor = %descriptor, direction = ?direction);

        Ok(())
    }

    fn deregister(&self, descriptor: Descriptor, direction: Direction) {
        let removed = {
            let mut registrations = self.registrations.borrow_mut();

            let Some(registration) = registrations.get_mut(&descriptor) else {
                return;
            };

            let removed = registration.slot(direction).take();

            if registration.interest().is_some() {
                if removed.is_some()
                    && let Err(e) = self.update_poller(descriptor, registration)
                {
                    event!(Level::DEBUG, message = "narrowing interest failed", descriptor = %descriptor, error = %e);
                }
            } else if let Some(registration) = registrations.remove(&descriptor)
                && registration.in_poller
                && let Err(e) = self.registry.deregister(&mut SourceFd(&descriptor.as_raw()))
            {
                // Closing the descriptor already removed it from the poller.
                event!(Level::TRACE, message = "descriptor already gone from poller", descriptor = %descriptor, error = %e);
            }

            removed
        };

        drop(removed);
    }
}

/// Wakes a task blocked in [`EventLoop::block_on()`], from any thread.
struct WakeSignal {
    woken: AtomicBool,
    waker: Arc<mio::Waker>,
}

impl ArcWake for WakeSignal {
    fn wake_by_ref(arc_self: &Arc<Self>) {
        if !arc_self.woken.swap(true, Ordering::AcqRel)
            && let Err(e) = arc_self.waker.wake()
        {
            event!(Level::DEBUG, message = "interrupting the event loop failed", error = %e);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;
    use std::io::Write;
    use std::os::fd::AsRawFd;
    use std::os::unix::net::UnixStream;

    use super::*;
    use crate::Error;

    const SHORT: Option<Duration> = Some(Duration::from_millis(50));

    fn counting_callback(counter: &Rc<Cell<usize>>) -> ReadyCallback {
        let counter = Rc::clone(counter);
        Box::new(move || counter.set(counter.get() + 1))
    }

    fn socket_pair() -> (UnixStream, UnixStream) {
        let (a, b) = UnixStream::pair().unwrap();
        a.set_nonblocking(true).unwrap();
        b.set_nonblocking(true).unwrap();
        (a, b)
    }

    #[test]
    fn readable_callback_fires_once() {
        let event_loop = EventLoop::new().unwrap();
        let notifier = event_loop.notifier();
        let (mut a, b) = socket_pair();
        let descriptor = Descriptor::from_raw(b.as_raw_fd());
        let fired = Rc::new(Cell::new(0));

        notifier.register(descriptor, Direction::Readable, counting_callback(&fired)).unwrap();
        assert_eq!(event_loop.registration_count(), 1);

        a.write_all(b"x").unwrap();

        assert_eq!(event_loop.turn(SHORT).unwrap(), 1);
        assert_eq!(fired.get(), 1);
        assert_eq!(event_loop.registration_count(), 0);

        // The data is still unread, but the registration is spent.
        assert_eq!(event_loop.turn(Some(Duration::ZERO)).unwrap(), 0);
        assert_eq!(fired.get(), 1);
    }

    #[test]
    fn registering_again_reports_existing_readiness() {
        let event_loop = EventLoop::new().unwrap();
        let notifier = event_loop.notifier();
        let (mut a, b) = socket_pair();
        let descriptor = Descriptor::from_raw(b.as_raw_fd());
        let fired = Rc::new(Cell::new(0));

        a.write_all(b"x").unwrap();

        notifier.register(descriptor, Direction::Readable, counting_callback(&fired)).unwrap();
        assert_eq!(event_loop.turn(SHORT).unwrap(), 1);

        notifier.register(descriptor, Direction::Readable, counting_callback(&fired)).unwrap();
        assert_eq!(event_loop.turn(SHORT).unwrap(), 1);

        assert_eq!(fired.get(), 2);
    }

    #[test]
    fn writable_and_readable_are_independent() {
        let event_loop = EventLoop::new().unwrap();
        let notifier = event_loop.notifier();
        let (_a, b) = socket_pair();
        let descriptor = Descriptor::from_raw(b.as_raw_fd());
        let readable = Rc::new(Cell::new(0));
        let writable = Rc::new(Cell::new(0));

        notifier.register(descriptor, Direction::Readable, counting_callback(&readable)).unwrap();
        notifier.register(descriptor, Direction::Writable, counting_callback(&writable)).unwrap();

        // Nothing to read, but the send buffer is empty.
        assert_eq!(event_loop.turn(SHORT).unwrap(), 1);
        assert_eq!(readable.get(), 0);
        assert_eq!(writable.get(), 1);
        assert_eq!(event_loop.registration_count(), 1);
    }

    #[test]
    fn deregistered_callback_never_fires() {
        let event_loop = EventLoop::new().unwrap();
        let notifier = event_loop.notifier();
        let (mut a, b) = socket_pair();
        let descriptor = Descriptor::from_raw(b.as_raw_fd());
        let fired = Rc::new(Cell::new(0));

        notifier.register(descriptor, Direction::Readable, counting_callback(&fired)).unwrap();
        notifier.deregister(descriptor, Direction::Readable);
        notifier.deregister(descriptor, Direction::Readable);

        a.write_all(b"x").unwrap();

        assert_eq!(event_loop.turn(Some(Duration::ZERO)).unwrap(), 0);
        assert_eq!(fired.get(), 0);
        assert_eq!(event_loop.registration_count(), 0);
    }

    #[test]
    fn peer_hang_up_is_readable() {
        let event_loop = EventLoop::new().unwrap();
        let notifier = event_loop.notifier();
        let (a, b) = socket_pair();
        let descriptor = Descriptor::from_raw(b.as_raw_fd());
        let fired = Rc::new(Cell::new(0));

        notifier.register(descriptor, Direction::Readable, counting_callback(&fired)).unwrap();
        drop(a);

        assert_eq!(event_loop.turn(SHORT).unwrap(), 1);
        assert_eq!(fired.get(), 1);
    }

    #[test]
    fn block_on_returns_ready_output() {
        let event_loop = EventLoop::new().unwrap();

        assert_eq!(event_loop.block_on(async { 7 }).unwrap(), 7);
    }

    #[test]
    fn block_on_reports_stall() {
        let event_loop = EventLoop::new().unwrap();

        let result = event_loop.block_on(futures::future::pending::<()>());

        assert!(matches!(result, Err(Error::Io(e)) if e.kind() == ErrorKind::Other));
    }

    #[test]
    fn block_on_waits_for_readiness() {
        let event_loop = EventLoop::new().unwrap();
        let notifier = event_loop.notifier();
        let (mut a, b) = socket_pair();
        let descriptor = Descriptor::from_raw(b.as_raw_fd());

        a.write_all(b"x").unwrap();

        event_loop
            .block_on(crate::notifier::wait_ready(&notifier, descriptor, Direction::Readable))
            .unwrap()
            .unwrap();

        assert_eq!(event_loop.registration_count(), 0);
    }

    #[test]
    fn wake_from_other_thread_interrupts_turn() {
        let event_loop = EventLoop::new().unwrap();
        let signal = Arc::new(WakeSignal {
            woken: AtomicBool::new(false),
            waker: Arc::clone(&event_loop.inner.waker),
        });

        let remote = Arc::clone(&signal);
        let thread = std::thread::spawn(move || ArcWake::wake_by_ref(&remote));

        // The wake token itself dispatches nothing.
        assert_eq!(event_loop.turn(Some(testing_aids::TEST_TIMEOUT)).unwrap(), 0);

        thread.join().unwrap();
        assert!(signal.woken.load(Ordering::Acquire));
    }
}
