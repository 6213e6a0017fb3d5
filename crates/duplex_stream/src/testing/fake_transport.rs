// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::fmt;
use std::io::{self, ErrorKind};
use std::rc::Rc;

use crate::{Descriptor, Transport};

/// A [`Transport`] that replays scripted results.
///
/// Reads are served from a queue of scripted results. A scripted chunk larger than the read
/// buffer is split across reads. Once the script is exhausted, reads report end of stream,
/// or would-block if the transport was built with [`keep_open()`][FakeTransportBuilder::keep_open].
///
/// Writes consume scripted results while there are any and otherwise accept up to
/// [`max_write_size()`][FakeTransportBuilder::max_write_size] bytes per call.
///
/// Everything the transport does is observable through the [`FakeTransportHandle`] returned
/// alongside it.
pub struct FakeTransport {
    descriptor: Descriptor,
    state: Rc<RefCell<FakeState>>,
}

#[derive(Debug)]
enum ScriptedRead {
    Data(Vec<u8>),
    WouldBlock,
    Error(ErrorKind),
    EndOfStream,
}

#[derive(Debug)]
enum ScriptedWrite {
    WouldBlock,
    Error(ErrorKind),
}

#[derive(Debug, Default)]
struct FakeState {
    reads: VecDeque<ScriptedRead>,
    writes: VecDeque<ScriptedWrite>,
    keep_open: bool,
    max_write_size: Option<usize>,
    written: Vec<u8>,
    read_calls: usize,
    write_calls: usize,
    closed: bool,
}

impl FakeTransport {
    /// Starts scripting a fake transport.
    #[must_use]
    pub fn builder() -> FakeTransportBuilder {
        FakeTransportBuilder {
            descriptor: Descriptor::from_raw(0),
            state: FakeState::default(),
        }
    }
}

impl Transport for FakeTransport {
    fn descriptor(&self) -> Descriptor {
        self.descriptor
    }

    #[cfg_attr(test, mutants::skip)] // This is test logic - pointless to mutate.
    fn try_read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut state = self.state.borrow_mut();
        state.read_calls += 1;

        match state.reads.pop_front() {
            Some(ScriptedRead::Data(mut data)) => {
                let len = data.len().min(buf.len());
                buf[..len].copy_from_slice(&data[..len]);

                if len < data.len() {
                    state.reads.push_front(ScriptedRead::Data(data.split_off(len)));
                }

                Ok(len)
            }
            Some(ScriptedRead::WouldBlock) => Err(ErrorKind::WouldBlock.into()),
            Some(ScriptedRead::Error(kind)) => Err(kind.into()),
            Some(ScriptedRead::EndOfStream) => Ok(0),
            None if state.keep_open => Err(ErrorKind::WouldBlock.into()),
            None => Ok(0),
        }
    }

    #[cfg_attr(test, mutants::skip)] // This is test logic - pointless to mutate.
    fn try_write(&mut self, data: &[u8]) -> io::Result<usize> {
        let mut state = self.state.borrow_mut();
        state.write_calls += 1;

        match state.writes.pop_front() {
            Some(ScriptedWrite::WouldBlock) => Err(ErrorKind::WouldBlock.into()),
            Some(ScriptedWrite::Error(kind)) => Err(kind.into()),
            None => {
                let len = state.max_write_size.map_or(data.len(), |max| max.min(data.len()));
                state.written.extend_from_slice(&data[..len]);
                Ok(len)
            }
        }
    }

    fn close(self) {
        self.state.borrow_mut().closed = true;
    }
}

impl fmt::Debug for FakeTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FakeTransport")
            .field("descriptor", &self.descriptor)
            .field("state", &self.state.borrow())
            .finish()
    }
}

/// Scripts the behavior of a [`FakeTransport`].
#[derive(Debug)]
#[must_use]
pub struct FakeTransportBuilder {
    descriptor: Descriptor,
    state: FakeState,
}

impl FakeTransportBuilder {
    /// Sets the descriptor the transport reports.
    pub const fn descriptor(mut self, descriptor: Descriptor) -> Self {
        self.descriptor = descriptor;
        self
    }

    /// Appends a chunk of received data to the read script.
    pub fn read(mut self, data: impl AsRef<[u8]>) -> Self {
        self.state.reads.push_back(ScriptedRead::Data(data.as_ref().to_vec()));
        self
    }

    /// Appends a would-block result to the read script.
    pub fn read_would_block(mut self) -> Self {
        self.state.reads.push_back(ScriptedRead::WouldBlock);
        self
    }

    /// Appends an error to the read script.
    pub fn read_error(mut self, kind: ErrorKind) -> Self {
        self.state.reads.push_back(ScriptedRead::Error(kind));
        self
    }

    /// Appends an end of stream to the read script.
    pub fn read_eof(mut self) -> Self {
        self.state.reads.push_back(ScriptedRead::EndOfStream);
        self
    }

    /// Reports would-block instead of end of stream once the read script is exhausted.
    pub const fn keep_open(mut self) -> Self {
        self.state.keep_open = true;
        self
    }

    /// Appends a would-block result to the write script.
    pub fn write_would_block(mut self) -> Self {
        self.state.writes.push_back(ScriptedWrite::WouldBlock);
        self
    }

    /// Appends an error to the write script.
    pub fn write_error(mut self, kind: ErrorKind) -> Self {
        self.state.writes.push_back(ScriptedWrite::Error(kind));
        self
    }

    /// Limits how many bytes each unscripted write accepts.
    ///
    /// # Panics
    ///
    /// Panics if `max` is zero.
    pub fn max_write_size(mut self, max: usize) -> Self {
        assert!(max > 0, "a fake transport must accept at least one byte per write");

        self.state.max_write_size = Some(max);
        self
    }

    /// Creates the transport and the handle for observing it.
    pub fn build(self) -> (FakeTransport, FakeTransportHandle) {
        let state = Rc::new(RefCell::new(self.state));

        (
            FakeTransport {
                descriptor: self.descriptor,
                state: Rc::clone(&state),
            },
            FakeTransportHandle { state },
        )
    }
}

/// Observes and extends a [`FakeTransport`] after it has been handed to a stream.
#[derive(Clone)]
pub struct FakeTransportHandle {
    state: Rc<RefCell<FakeState>>,
}

impl FakeTransportHandle {
    /// All bytes the transport has accepted, in order.
    #[must_use]
    pub fn written(&self) -> Vec<u8> {
        self.state.borrow().written.clone()
    }

    /// Whether [`Transport::close()`] has been called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.state.borrow().closed
    }

    /// The number of `try_read()` calls so far.
    #[must_use]
    pub fn read_calls(&self) -> usize {
        self.state.borrow().read_calls
    }

    /// The number of `try_write()` calls so far.
    #[must_use]
    pub fn write_calls(&self) -> usize {
        self.state.borrow().write_calls
    }

    /// Appends a chunk of received data to the read script.
    pub fn push_read(&self, data: impl AsRef<[u8]>) {
        self.state
            .borrow_mut()
            .reads
            .push_back(ScriptedRead::Data(data.as_ref().to_vec()));
    }

    /// Appends an end of stream to the read script.
    pub fn push_eof(&self) {
        self.state.borrow_mut().reads.push_back(ScriptedRead::EndOfStream);
    }
}

impl fmt::Debug for FakeTransportHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FakeTransportHandle")
            .field("state", &self.state.borrow())
            .finish()
    }
}
