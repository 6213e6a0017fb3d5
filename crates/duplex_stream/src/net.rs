// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::fmt;
use std::io::{self, ErrorKind};
use std::net::{IpAddr, SocketAddr, ToSocketAddrs};
use std::ops::ControlFlow;
use std::os::fd::AsRawFd;
use std::rc::Rc;

use futures::future::select_all;
use mio::net::{TcpListener, TcpStream};
use socket2::{Domain, Protocol, Socket, Type};
use tracing::{Level, event};

use crate::notifier::wait_ready;
use crate::transport::is_transient;
use crate::{
    AcceptorOptions, Descriptor, Direction, DuplexStream, Error, Notifier, Result, SocketTransport, StreamOptions,
};

/// A [`DuplexStream`] over a TCP socket.
pub type SocketStream = DuplexStream<SocketTransport>;

/// Resolves `host` and `port` to socket addresses.
///
/// IPv4 and IPv6 literals (optionally in brackets) are returned as-is without consulting the
/// system resolver. Literals with a zone index (`fe80::1%eth0`) and host names go through the
/// system resolver, which may block.
///
/// # Errors
///
/// Returns an error if resolution fails or yields no addresses.
///
/// # Example
///
/// ```
/// use duplex_stream::resolve;
///
/// let addrs = resolve("[::1]", 443)?;
/// assert_eq!(addrs[0].to_string(), "[::1]:443");
/// # Ok::<(), std::io::Error>(())
/// ```
pub fn resolve(host: &str, port: u16) -> io::Result<Vec<SocketAddr>> {
    if let Some(ip) = ip_literal(host) {
        return Ok(vec![SocketAddr::new(ip, port)]);
    }

    let addrs: Vec<_> = (host, port).to_socket_addrs()?.collect();

    if addrs.is_empty() {
        return Err(io::Error::new(
            ErrorKind::NotFound,
            format!("no addresses found for {host}"),
        ));
    }

    Ok(addrs)
}

fn ip_literal(host: &str) -> Option<IpAddr> {
    let host = host
        .strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host);

    if host.contains('%') {
        return None;
    }

    host.parse().ok()
}

/// Establishes outgoing TCP connections as [`SocketStream`]s.
///
/// Connecting never blocks the thread: the socket is created non-blocking and the connector
/// waits for it to become writable through the notifier.
pub struct StreamConnector {
    notifier: Rc<dyn Notifier>,
    options: StreamOptions,
}

impl StreamConnector {
    /// Creates a connector whose streams use `notifier`.
    #[must_use]
    pub fn new(notifier: Rc<dyn Notifier>) -> Self {
        Self {
            notifier,
            options: StreamOptions::default(),
        }
    }

    /// Sets the policy of the streams this connector creates.
    #[must_use]
    pub fn with_stream_options(mut self, options: StreamOptions) -> Self {
        self.options = options;
        self
    }

    /// Connects to `host` and `port`, trying each resolved address in turn.
    ///
    /// # Errors
    ///
    /// Returns the resolution error, or the error of the last address tried if none accepted the
    /// connection.
    pub async fn connect(&self, host: &str, port: u16) -> Result<SocketStream> {
        let mut last_error = None;

        for addr in resolve(host, port)? {
            match self.connect_addr(addr).await {
                Ok(stream) => return Ok(stream),
                Err(e) => {
                    event!(Level::DEBUG, message = "connect attempt failed", %addr, error = %e);
                    last_error = Some(e);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| Error::Io(ErrorKind::NotFound.into())))
    }

    /// Connects to a single address.
    ///
    /// # Errors
    ///
    /// Returns the error reported by the operating system if the connection fails.
    pub async fn connect_addr(&self, addr: SocketAddr) -> Result<SocketStream> {
        let socket = TcpStream::connect(addr)?;
        let descriptor = Descriptor::from_raw(socket.as_raw_fd());

        loop {
            wait_ready(&self.notifier, descriptor, Direction::Writable).await?;

            if let Some(e) = socket.take_error()? {
                return Err(e.into());
            }

            match socket.peer_addr() {
                Ok(_) => break,
                // Spurious wakeup, the handshake is still in progress.
                Err(e) if e.kind() == ErrorKind::NotConnected || is_transient(&e) => {}
                Err(e) => return Err(e.into()),
            }
        }

        event!(Level::TRACE, message = "connected", %addr, descriptor = %descriptor);

        Ok(DuplexStream::with_options(
            SocketTransport::new(socket),
            Rc::clone(&self.notifier),
            self.options,
        ))
    }
}

impl fmt::Debug for StreamConnector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamConnector")
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

/// Accepts incoming TCP connections as [`SocketStream`]s.
///
/// The acceptor listens on every address the host resolves to, so a name like `localhost`
/// serves both IPv4 and IPv6 clients on a dual-stack host. IPv6 listeners are v6-only and never
/// claim the IPv4 side of the port.
pub struct StreamAcceptor {
    // Never empty.
    listeners: Vec<TcpListener>,
    notifier: Rc<dyn Notifier>,
    options: AcceptorOptions,
}

impl StreamAcceptor {
    /// Listens on every address `host` and `port` resolve to.
    ///
    /// Port 0 binds an ephemeral port per address, see [`local_addrs()`][Self::local_addrs].
    ///
    /// # Errors
    ///
    /// Returns the resolution error, or the first error binding any of the addresses.
    pub fn listen(notifier: Rc<dyn Notifier>, host: &str, port: u16) -> Result<Self> {
        Self::listen_with_options(notifier, host, port, AcceptorOptions::default())
    }

    /// Like [`listen()`][Self::listen], with custom options.
    ///
    /// # Errors
    ///
    /// Returns the resolution error, or the first error binding any of the addresses.
    pub fn listen_with_options(
        notifier: Rc<dyn Notifier>,
        host: &str,
        port: u16,
        options: AcceptorOptions,
    ) -> Result<Self> {
        let addrs = distinct(resolve(host, port)?);

        Self::listen_on(notifier, &addrs, options)
    }

    fn listen_on(notifier: Rc<dyn Notifier>, addrs: &[SocketAddr], options: AcceptorOptions) -> Result<Self> {
        if addrs.is_empty() {
            return Err(Error::Io(ErrorKind::NotFound.into()));
        }

        let listeners = addrs
            .iter()
            .map(|addr| bind_listener(*addr, options.backlog()))
            .collect::<io::Result<Vec<_>>>()?;

        Ok(Self {
            listeners,
            notifier,
            options,
        })
    }

    /// The addresses the listeners are bound to, in resolution order.
    ///
    /// # Errors
    ///
    /// Returns an error if the operating system cannot report an address.
    pub fn local_addrs(&self) -> io::Result<Vec<SocketAddr>> {
        self.listeners.iter().map(TcpListener::local_addr).collect()
    }

    /// Accepts the next connection on any of the listeners, waiting for one if none is queued.
    ///
    /// # Errors
    ///
    /// Returns the error reported by the operating system.
    pub async fn accept(&self) -> Result<(SocketStream, SocketAddr)> {
        loop {
            for listener in &self.listeners {
                if let Some((socket, peer)) = try_accept(listener)? {
                    return Ok((self.stream_for(socket, peer), peer));
                }
            }

            self.wait_readable().await?;
        }
    }

    /// Accepts connections and hands each one to `handler` until it returns
    /// [`ControlFlow::Break`].
    ///
    /// At most [`AcceptorOptions::backlog()`] connections are accepted from each listener per
    /// readiness notification, so a flood of connections cannot monopolize the thread.
    ///
    /// # Errors
    ///
    /// Returns the first error reported by the operating system.
    pub async fn serve<H>(&self, mut handler: H) -> Result<()>
    where
        H: FnMut(SocketStream, SocketAddr) -> ControlFlow<()>,
    {
        loop {
            for listener in &self.listeners {
                for _ in 0..self.options.backlog() {
                    let Some((socket, peer)) = try_accept(listener)? else {
                        break;
                    };

                    if handler(self.stream_for(socket, peer), peer).is_break() {
                        return Ok(());
                    }
                }
            }

            self.wait_readable().await?;
        }
    }

    // Resolves once any listener reports a queued connection. The other registrations are
    // withdrawn when their futures drop.
    async fn wait_readable(&self) -> Result<()> {
        let waits = self.listeners.iter().map(|listener| {
            Box::pin(wait_ready(
                &self.notifier,
                Descriptor::from_raw(listener.as_raw_fd()),
                Direction::Readable,
            ))
        });

        let (result, _, _) = select_all(waits).await;

        result
    }

    fn stream_for(&self, socket: TcpStream, peer: SocketAddr) -> SocketStream {
        event!(Level::TRACE, message = "accepted", %peer, descriptor = socket.as_raw_fd());

        DuplexStream::with_options(
            SocketTransport::new(socket),
            Rc::clone(&self.notifier),
            self.options.stream_options(),
        )
    }
}

impl fmt::Debug for StreamAcceptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamAcceptor")
            .field("listeners", &self.listeners)
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

fn bind_listener(addr: SocketAddr, backlog: usize) -> io::Result<TcpListener> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;

    if addr.is_ipv6() {
        socket.set_only_v6(true)?;
    }

    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(i32::try_from(backlog).unwrap_or(i32::MAX))?;

    let listener = TcpListener::from_std(socket.into());

    event!(Level::TRACE, message = "listening", %addr, descriptor = listener.as_raw_fd());

    Ok(listener)
}

/// Accepts one queued connection, `None` if the queue is empty.
fn try_accept(listener: &TcpListener) -> Result<Option<(TcpStream, SocketAddr)>> {
    loop {
        match listener.accept() {
            Ok(accepted) => return Ok(Some(accepted)),
            // The peer gave up while queued, the next one may already be waiting.
            Err(e) if e.kind() == ErrorKind::ConnectionAborted => {}
            Err(e) if is_transient(&e) => return Ok(None),
            Err(e) => return Err(e.into()),
        }
    }
}

// Resolvers may report the same address more than once.
fn distinct(addrs: Vec<SocketAddr>) -> Vec<SocketAddr> {
    let mut unique = Vec::with_capacity(addrs.len());

    for addr in addrs {
        if !unique.contains(&addr) {
            unique.push(addr);
        }
    }

    unique
}
