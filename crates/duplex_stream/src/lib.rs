// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

#![cfg_attr(coverage_nightly, feature(coverage_attribute))]
#![cfg_attr(docsrs, feature(doc_cfg))]

//! Readiness-driven duplex byte streams with single-slot completions and bounded buffered
//! framing.
//!
//! A [`DuplexStream`] turns readiness notifications ("this socket is readable now") into
//! one-shot completions ("this read produced these bytes"). Each stream allows one pending read
//! and one pending write at a time. Reads resolve with data, with
//! [`ReadOutcome::EndOfStream`] or with an error. Writes resolve once every byte has been handed
//! to the operating system, however many readiness rounds that takes.
//!
//! A [`BufferedReader`] adds framing on top of a stream: reads of a given size, reads up to a
//! separator and reads until end of stream, all within a fixed upper bound on buffered memory.
//! [`StreamWriter`] is its counterpart for writes.
//!
//! Streams are driven by a [`Notifier`]. [`EventLoop`] is the production implementation,
//! built on the operating system's readiness facility. [`StreamConnector`] and
//! [`StreamAcceptor`] produce socket-backed streams that use it.
//!
//! Everything in this crate is single-threaded. Streams, their handles and the event loop stay
//! on the thread that created them.
//!
//! # Example
//!
//! ```no_run
//! use duplex_stream::{BufferedReader, EventLoop, StreamConnector, StreamWriter};
//!
//! # fn main() -> duplex_stream::Result<()> {
//! let event_loop = EventLoop::new()?;
//! let connector = StreamConnector::new(event_loop.notifier());
//!
//! let greeting = event_loop.block_on(async {
//!     let stream = connector.connect("127.0.0.1", 7).await?;
//!
//!     StreamWriter::new(&stream).write_line("hello").await?;
//!
//!     let mut reader = BufferedReader::new(&stream);
//!     reader.read_line().await
//! })??;
//!
//! assert_eq!(greeting, "hello\n");
//! # Ok(())
//! # }
//! ```
//!
//! The `test-util` feature enables test doubles for driving streams without sockets. These are
//! in the `testing` module.

mod completion;
mod error;
#[cfg(unix)]
mod event_loop;
#[cfg(unix)]
mod net;
mod notifier;
mod options;
mod reader;
mod stream;
mod transport;
mod writer;

pub use completion::CompletionHandle;
pub use error::{Error, Result};
#[cfg(unix)]
pub use event_loop::EventLoop;
#[cfg(unix)]
pub use net::{SocketStream, StreamAcceptor, StreamConnector, resolve};
pub use notifier::{Descriptor, Direction, Notifier, ReadyCallback};
pub use options::{AcceptorOptions, DEFAULT_ACCEPT_BACKLOG, DEFAULT_CHUNK_SIZE, DEFAULT_MAX_BUFFER_SIZE, ReaderOptions, StreamOptions};
pub use reader::BufferedReader;
pub use stream::{DuplexStream, ReadHandle, ReadOutcome, WriteHandle};
#[cfg(unix)]
pub use transport::SocketTransport;
pub use transport::Transport;
pub use writer::StreamWriter;

#[cfg(any(test, feature = "test-util"))]
#[cfg_attr(docsrs, doc(cfg(feature = "test-util")))]
pub mod testing;
