// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::io::{self, ErrorKind};

use crate::Descriptor;

/// The byte-level capability a [`DuplexStream`][crate::DuplexStream] drives.
///
/// Both transfer methods are non-blocking: when the operating system cannot make progress right
/// away they fail with [`ErrorKind::WouldBlock`] (or [`ErrorKind::Interrupted`]) and the stream
/// waits for the next readiness notification before retrying.
///
/// The transport exclusively owns the underlying primitive. [`close()`][Transport::close]
/// releases it, after which the stream never touches the transport again.
pub trait Transport {
    /// The descriptor that readiness notifications are registered for.
    fn descriptor(&self) -> Descriptor;

    /// Reads up to `buf.len()` bytes without blocking.
    ///
    /// `Ok(0)` signals that the peer has closed its sending side.
    ///
    /// # Errors
    ///
    /// Returns a would-block error if no data is available yet, or the error reported by the
    /// operating system.
    fn try_read(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// Writes a prefix of `data` without blocking and returns its length.
    ///
    /// # Errors
    ///
    /// Returns a would-block error if the send buffer is full, or the error reported by the
    /// operating system.
    fn try_write(&mut self, data: &[u8]) -> io::Result<usize>;

    /// Releases the underlying primitive.
    fn close(self)
    where
        Self: Sized;
}

/// Whether the error only means "not now" and the operation should wait for readiness.
pub(crate) fn is_transient(error: &io::Error) -> bool {
    matches!(error.kind(), ErrorKind::WouldBlock | ErrorKind::Interrupted)
}

#[cfg(unix)]
mod socket {
    use std::io::{self, Read, Write};
    use std::net::{Shutdown, SocketAddr};
    use std::os::fd::AsRawFd;

    use mio::net::TcpStream;
    use tracing::{Level, event};

    use super::Transport;
    use crate::Descriptor;

    /// A [`Transport`] over a connected, non-blocking TCP socket.
    #[derive(Debug)]
    pub struct SocketTransport {
        socket: TcpStream,
    }

    impl SocketTransport {
        /// Wraps a connected non-blocking socket.
        #[must_use]
        pub const fn new(socket: TcpStream) -> Self {
            Self { socket }
        }

        /// Wraps a connected standard library socket, switching it to non-blocking mode.
        ///
        /// # Errors
        ///
        /// Returns an error if the socket cannot be switched to non-blocking mode.
        pub fn from_std(socket: std::net::TcpStream) -> io::Result<Self> {
            socket.set_nonblocking(true)?;

            Ok(Self::new(TcpStream::from_std(socket)))
        }

        /// The address of the remote peer.
        ///
        /// # Errors
        ///
        /// Returns an error if the socket is no longer connected.
        pub fn peer_addr(&self) -> io::Result<SocketAddr> {
            self.socket.peer_addr()
        }

        /// The local address the socket is bound to.
        ///
        /// # Errors
        ///
        /// Returns an error if the operating system cannot report the address.
        pub fn local_addr(&self) -> io::Result<SocketAddr> {
            self.socket.local_addr()
        }
    }

    impl Transport for SocketTransport {
        fn descriptor(&self) -> Descriptor {
            Descriptor::from_raw(self.socket.as_raw_fd())
        }

        fn try_read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            self.socket.read(buf)
        }

        fn try_write(&mut self, data: &[u8]) -> io::Result<usize> {
            self.socket.write(data)
        }

        fn close(self) {
            // The peer sees FIN even if a duplicated descriptor keeps the socket alive.
            if let Err(e) = self.socket.shutdown(Shutdown::Both) {
                event!(
                    Level::TRACE,
                    message = "socket shutdown failed before close",
                    descriptor = %self.descriptor(),
                    error = %e
                );
            }
        }
    }
}

#[cfg(unix)]
pub use socket::SocketTransport;
