// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::cell::RefCell;
use std::fmt;
use std::io::{self, ErrorKind};
use std::rc::Rc;

use bytes::{Buf, Bytes, BytesMut};
use tracing::{Level, event};

use crate::completion::{Completion, CompletionHandle, completion};
use crate::transport::is_transient;
use crate::{Descriptor, Direction, Error, Notifier, ReadyCallback, Result, StreamOptions, Transport};

/// The outcome of a successful [`DuplexStream::read_once()`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ReadOutcome {
    /// At least one and at most the requested number of bytes.
    Data(Bytes),

    /// The peer closed its sending side. No more data will arrive.
    EndOfStream,
}

impl ReadOutcome {
    /// Whether this is the end-of-stream marker.
    #[must_use]
    pub const fn is_end_of_stream(&self) -> bool {
        matches!(self, Self::EndOfStream)
    }

    /// The received bytes, empty at end of stream.
    #[must_use]
    pub fn into_bytes(self) -> Bytes {
        match self {
            Self::Data(bytes) => bytes,
            Self::EndOfStream => Bytes::new(),
        }
    }
}

/// Handle of a pending [`DuplexStream::read_once()`].
pub type ReadHandle = CompletionHandle<ReadOutcome>;

/// Handle of a pending [`DuplexStream::write_once()`].
pub type WriteHandle = CompletionHandle<()>;

/// A bidirectional byte stream over a non-blocking [`Transport`], driven by a [`Notifier`].
///
/// The stream allows at most one pending read and at most one pending write at any time. Each
/// operation returns a handle that resolves exactly once. Readiness notifications are only
/// requested while an operation actually needs them, so an idle stream holds no registrations.
///
/// Writes never lose or reorder data: whatever the transport does not accept immediately is
/// queued inside the stream and flushed on subsequent writable notifications. The handle of
/// the write resolves only once the queue has drained.
///
/// # Closing
///
/// [`close()`][Self::close] is idempotent. If output is still queued, closing is deferred until
/// the queue drains, so a close never truncates a write. Once the transport is closed, every
/// operation fails with [`Error::StreamClosed`].
///
/// # Thread safety
///
/// This type is single-threaded. It is driven from the thread that owns its notifier.
pub struct DuplexStream<T: Transport + 'static> {
    shared: Rc<Shared<T>>,
}

struct Shared<T: Transport> {
    notifier: Rc<dyn Notifier>,

    // Registrations are keyed by the descriptor the stream was created with, which stays
    // valid for deregistration even after the transport is gone.
    descriptor: Descriptor,

    state: RefCell<StreamState<T>>,
}

struct StreamState<T> {
    // `None` once closed.
    transport: Option<T>,

    pending_read: Option<PendingRead>,
    pending_write: Option<Completion<()>>,

    // Bytes of the current (or a canceled) write that the transport has not accepted yet.
    unsent: BytesMut,

    read_armed: bool,
    write_armed: bool,

    closing: bool,
    close_on_eof: bool,
}

struct PendingRead {
    completion: Completion<ReadOutcome>,
    max_bytes: usize,
}

impl<T: Transport + 'static> DuplexStream<T> {
    /// Creates a stream with the default [`StreamOptions`].
    #[must_use]
    pub fn new(transport: T, notifier: Rc<dyn Notifier>) -> Self {
        Self::with_options(transport, notifier, StreamOptions::default())
    }

    /// Creates a stream with the given policy.
    #[must_use]
    pub fn with_options(transport: T, notifier: Rc<dyn Notifier>, options: StreamOptions) -> Self {
        let descriptor = transport.descriptor();

        event!(Level::TRACE, message = "new stream", descriptor = %descriptor, close_on_eof = options.close_on_eof());

        Self {
            shared: Rc::new(Shared {
                notifier,
                descriptor,
                state: RefCell::new(StreamState {
                    transport: Some(transport),
                    pending_read: None,
                    pending_write: None,
                    unsent: BytesMut::new(),
                    read_armed: false,
                    write_armed: false,
                    closing: false,
                    close_on_eof: options.close_on_eof(),
                }),
            }),
        }
    }

    /// Starts a read of up to `max_bytes` bytes.
    ///
    /// The read waits for the descriptor to become readable and then issues a single read to the
    /// transport. The returned handle resolves with the data, with [`ReadOutcome::EndOfStream`],
    /// or with the error reported by the transport.
    ///
    /// Dropping the handle abandons the read. The stream notices on the next readable
    /// notification and resolves nothing. A new read may be started right away.
    ///
    /// # Errors
    ///
    /// Returns [`Error::StreamClosed`] if the stream is closed, or an I/O error if the notifier
    /// refuses the registration.
    ///
    /// # Panics
    ///
    /// Panics if `max_bytes` is zero or if a read is already pending.
    pub fn read_once(&self, max_bytes: usize) -> Result<ReadHandle> {
        assert!(max_bytes > 0, "a read requires more than 0 bytes of capacity");

        let (completion, handle) = completion();

        let needs_arming = {
            let mut state = self.shared.state.borrow_mut();

            if state.transport.is_none() {
                return Err(Error::StreamClosed);
            }

            if let Some(pending) = &state.pending_read {
                assert!(
                    pending.completion.is_canceled(),
                    "a read is already pending on this stream"
                );
            }

            state.pending_read = Some(PendingRead { completion, max_bytes });

            // An abandoned read may still hold the registration, which now serves this read.
            !state.read_armed
        };

        if needs_arming && let Err(e) = self.shared.arm(Direction::Readable) {
            drop(self.shared.state.borrow_mut().pending_read.take());
            return Err(e.into());
        }

        Ok(handle)
    }

    /// Starts writing `data`.
    ///
    /// The stream first tries to write synchronously. If the transport accepts everything, the
    /// returned handle is already resolved and no readiness registration is made. Otherwise the
    /// remainder is queued and flushed as the descriptor becomes writable.
    ///
    /// Writing an empty buffer resolves immediately without touching the transport.
    ///
    /// Dropping the handle does not withdraw the data: bytes already queued are still flushed,
    /// only the notification is skipped.
    ///
    /// # Errors
    ///
    /// Returns [`Error::StreamClosed`] if the stream is closed or closing, or an I/O error if the
    /// notifier refuses the registration.
    ///
    /// # Panics
    ///
    /// Panics if a write is already pending.
    pub fn write_once(&self, data: impl Into<Bytes>) -> Result<WriteHandle> {
        let data: Bytes = data.into();
        let (completion, handle) = completion();

        let mut guard = self.shared.state.borrow_mut();
        let state = &mut *guard;

        if state.transport.is_none() || state.closing {
            return Err(Error::StreamClosed);
        }

        if let Some(pending) = &state.pending_write {
            assert!(
                pending.is_canceled(),
                "a write is already pending on this stream"
            );
        }

        if !state.unsent.is_empty() {
            // The remainder of an abandoned write is still draining. New data goes behind it
            // and the existing registration completes this write.
            state.unsent.extend_from_slice(&data);
            state.pending_write = Some(completion);
            return Ok(handle);
        }

        state.pending_write = None;

        if data.is_empty() {
            completion.resolve(Ok(()));
            return Ok(handle);
        }

        let Some(transport) = state.transport.as_mut() else {
            return Err(Error::StreamClosed);
        };

        let written = match transport.try_write(&data) {
            Ok(n) => n,
            Err(e) if is_transient(&e) => 0,
            Err(e) => {
                drop(guard);
                completion.resolve(Err(Error::Io(e)));
                return Ok(handle);
            }
        };

        if written >= data.len() {
            drop(guard);
            completion.resolve(Ok(()));
            return Ok(handle);
        }

        event!(
            Level::TRACE,
            message = "write queued",
            descriptor = %self.shared.descriptor,
            written,
            queued = data.len() - written
        );

        state.unsent.extend_from_slice(&data[written..]);
        state.pending_write = Some(completion);
        drop(guard);

        if let Err(e) = self.shared.arm(Direction::Writable) {
            let mut state = self.shared.state.borrow_mut();
            state.unsent.clear();
            let pending = state.pending_write.take();
            drop(state);
            drop(pending);

            return Err(e.into());
        }

        Ok(handle)
    }

    /// Closes the stream.
    ///
    /// With nothing queued for writing, the transport is closed immediately and a pending read
    /// resolves with [`Error::StreamClosed`]. Otherwise the close is deferred until the queued
    /// output has been flushed. Calling this more than once has no further effect.
    pub fn close(&self) {
        self.shared.close();
    }

    /// The descriptor of the transport, or `None` once the stream is closed.
    #[must_use]
    pub fn descriptor(&self) -> Option<Descriptor> {
        self.shared
            .state
            .borrow()
            .transport
            .as_ref()
            .map(Transport::descriptor)
    }

    /// Whether [`close()`][Self::close] has been requested, by the caller or by end of stream.
    #[must_use]
    pub fn is_closing(&self) -> bool {
        self.shared.state.borrow().closing
    }

    /// Whether the transport has been closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.shared.state.borrow().transport.is_none()
    }

    /// The number of written bytes the transport has not accepted yet.
    #[must_use]
    pub fn queued_len(&self) -> usize {
        self.shared.state.borrow().unsent.len()
    }
}

impl<T: Transport + 'static> fmt::Debug for DuplexStream<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.shared.state.borrow();

        f.debug_struct("DuplexStream")
            .field("descriptor", &self.shared.descriptor)
            .field("closed", &state.transport.is_none())
            .field("closing", &state.closing)
            .field("read_pending", &state.pending_read.is_some())
            .field("write_pending", &state.pending_write.is_some())
            .field("queued", &state.unsent.len())
            .finish_non_exhaustive()
    }
}

impl<T: Transport + 'static> Shared<T> {
    /// Requests a one-shot callback for `direction`. The callback holds only a weak reference,
    /// so a registration never keeps a dropped stream alive.
    fn arm(self: &Rc<Self>, direction: Direction) -> io::Result<()> {
        let weak = Rc::downgrade(self);

        let callback: ReadyCallback = Box::new(move || {
            if let Some(shared) = weak.upgrade() {
                match direction {
                    Direction::Readable => shared.on_readable(),
                    Direction::Writable => shared.on_writable(),
                }
            }
        });

        self.notifier.register(self.descriptor, direction, callback)?;

        let mut state = self.state.borrow_mut();
        match direction {
            Direction::Readable => state.read_armed = true,
            Direction::Writable => state.write_armed = true,
        }

        Ok(())
    }

    fn on_readable(self: &Rc<Self>) {
        let mut guard = self.state.borrow_mut();
        let state = &mut *guard;

        // The registration was consumed by firing.
        state.read_armed = false;

        let Some(pending) = state.pending_read.take() else {
            return;
        };

        if pending.completion.is_canceled() {
            event!(Level::TRACE, message = "read abandoned before readiness", descriptor = %self.descriptor);
            return;
        }

        let Some(transport) = state.transport.as_mut() else {
            drop(guard);
            pending.completion.resolve(Err(Error::StreamClosed));
            return;
        };

        let mut buf = BytesMut::zeroed(pending.max_bytes);

        match transport.try_read(&mut buf) {
            Ok(0) => {
                let close_on_eof = state.close_on_eof;
                drop(guard);

                event!(Level::TRACE, message = "end of stream", descriptor = %self.descriptor, close_on_eof);

                pending.completion.resolve(Ok(ReadOutcome::EndOfStream));

                if close_on_eof {
                    self.close();
                }
            }
            Ok(n) => {
                drop(guard);

                buf.truncate(n);
                pending.completion.resolve(Ok(ReadOutcome::Data(buf.freeze())));
            }
            Err(e) if is_transient(&e) => {
                state.pending_read = Some(pending);
                drop(guard);

                event!(Level::TRACE, message = "read would block, re-arming", descriptor = %self.descriptor);

                if let Err(e) = self.arm(Direction::Readable) {
                    self.fail_read(e);
                }
            }
            Err(e) => {
                drop(guard);

                event!(Level::DEBUG, message = "read failed", descriptor = %self.descriptor, error = %e);

                pending.completion.resolve(Err(Error::Io(e)));
            }
        }
    }

    fn on_writable(self: &Rc<Self>) {
        let mut guard = self.state.borrow_mut();
        let state = &mut *guard;

        state.write_armed = false;

        if state.unsent.is_empty() {
            return;
        }

        let Some(transport) = state.transport.as_mut() else {
            state.unsent.clear();
            let pending = state.pending_write.take();
            drop(guard);

            if let Some(pending) = pending {
                pending.resolve(Err(Error::StreamClosed));
            }
            return;
        };

        let result = match transport.try_write(&state.unsent) {
            Ok(0) => Err(io::Error::from(ErrorKind::WriteZero)),
            other => other,
        };

        match result {
            Ok(n) if n < state.unsent.len() => {
                state.unsent.advance(n);

                event!(
                    Level::TRACE,
                    message = "partial flush",
                    descriptor = %self.descriptor,
                    written = n,
                    queued = state.unsent.len()
                );

                drop(guard);

                if let Err(e) = self.arm(Direction::Writable) {
                    self.fail_write(Error::Io(e));
                }
            }
            Ok(_) => {
                state.unsent.clear();
                let pending = state.pending_write.take();
                let closing = state.closing;
                drop(guard);

                if let Some(pending) = pending {
                    pending.resolve(Ok(()));
                }

                if closing {
                    event!(Level::TRACE, message = "write queue drained, completing deferred close", descriptor = %self.descriptor);
                    self.close_now();
                }
            }
            Err(e) if is_transient(&e) => {
                drop(guard);

                if let Err(e) = self.arm(Direction::Writable) {
                    self.fail_write(Error::Io(e));
                }
            }
            Err(e) => {
                drop(guard);

                event!(Level::DEBUG, message = "write failed", descriptor = %self.descriptor, error = %e);

                self.fail_write(Error::Io(e));
            }
        }
    }

    fn fail_read(&self, error: io::Error) {
        let pending = self.state.borrow_mut().pending_read.take();

        if let Some(pending) = pending {
            pending.completion.resolve(Err(Error::Io(error)));
        }
    }

    /// Resolves the pending write with `error`, discarding the queue. A deferred close is
    /// carried out, as nothing is left to flush.
    fn fail_write(&self, error: Error) {
        let (pending, closing) = {
            let mut state = self.state.borrow_mut();
            state.unsent.clear();
            (state.pending_write.take(), state.closing)
        };

        if let Some(pending) = pending {
            pending.resolve(Err(error));
        }

        if closing {
            self.close_now();
        }
    }

    fn close(&self) {
        {
            let mut state = self.state.borrow_mut();

            if state.closing || state.transport.is_none() {
                return;
            }

            state.closing = true;

            if !state.unsent.is_empty() {
                event!(
                    Level::TRACE,
                    message = "deferring close until the write queue drains",
                    descriptor = %self.descriptor,
                    queued = state.unsent.len()
                );
                return;
            }
        }

        self.close_now();
    }

    fn close_now(&self) {
        let (transport, pending_read, pending_write, read_armed, write_armed) = {
            let mut state = self.state.borrow_mut();
            state.closing = true;
            state.unsent.clear();

            (
                state.transport.take(),
                state.pending_read.take(),
                state.pending_write.take(),
                std::mem::replace(&mut state.read_armed, false),
                std::mem::replace(&mut state.write_armed, false),
            )
        };

        if read_armed {
            self.notifier.deregister(self.descriptor, Direction::Readable);
        }

        if write_armed {
            self.notifier.deregister(self.descriptor, Direction::Writable);
        }

        if let Some(transport) = transport {
            event!(Level::TRACE, message = "closing transport", descriptor = %self.descriptor);
            transport.close();
        }

        if let Some(pending) = pending_read {
            pending.completion.resolve(Err(Error::StreamClosed));
        }

        if let Some(pending) = pending_write {
            pending.resolve(Err(Error::StreamClosed));
        }
    }
}

impl<T: Transport> Drop for Shared<T> {
    fn drop(&mut self) {
        let state = self.state.get_mut();

        if state.read_armed {
            self.notifier.deregister(self.descriptor, Direction::Readable);
        }

        if state.write_armed {
            self.notifier.deregister(self.descriptor, Direction::Writable);
        }

        if let Some(transport) = state.transport.take() {
            event!(Level::TRACE, message = "closing transport of dropped stream", descriptor = %self.descriptor);
            transport.close();
        }
    }
}
