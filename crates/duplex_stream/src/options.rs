// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

/// The default maximum number of bytes a [`BufferedReader`][crate::BufferedReader] may hold.
pub const DEFAULT_MAX_BUFFER_SIZE: usize = 65536;

/// The default number of bytes a [`BufferedReader`][crate::BufferedReader] requests per fill.
pub const DEFAULT_CHUNK_SIZE: usize = 16384;

/// The default number of pending connections drained per readiness notification.
pub const DEFAULT_ACCEPT_BACKLOG: usize = 100;

/// Sizing of the receive buffer owned by a [`BufferedReader`][crate::BufferedReader].
///
/// The maximum buffer size bounds memory use deterministically: a fill that would grow the
/// buffer beyond it fails with [`Error::BufferOverrun`][crate::Error::BufferOverrun] instead of
/// truncating data.
///
/// # Example
///
/// ```
/// use duplex_stream::ReaderOptions;
///
/// let options = ReaderOptions::new()
///     .with_max_buffer_size(512)
///     .with_chunk_size(128);
///
/// assert_eq!(options.max_buffer_size(), 512);
/// assert_eq!(options.chunk_size(), 128);
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ReaderOptions {
    max_buffer_size: usize,
    chunk_size: usize,
}

impl ReaderOptions {
    /// Creates options with the default sizes: a 64 KiB buffer limit and 16 KiB fills.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            max_buffer_size: DEFAULT_MAX_BUFFER_SIZE,
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }

    /// Sets the maximum number of bytes the receive buffer may hold after a fill.
    #[must_use]
    pub const fn with_max_buffer_size(mut self, bytes: usize) -> Self {
        self.max_buffer_size = bytes;
        self
    }

    /// Sets how many bytes each fill requests from the stream.
    #[must_use]
    pub const fn with_chunk_size(mut self, bytes: usize) -> Self {
        self.chunk_size = bytes;
        self
    }

    /// The maximum number of bytes the receive buffer may hold.
    #[must_use]
    pub const fn max_buffer_size(&self) -> usize {
        self.max_buffer_size
    }

    /// The number of bytes each fill requests from the stream.
    #[must_use]
    pub const fn chunk_size(&self) -> usize {
        self.chunk_size
    }
}

impl Default for ReaderOptions {
    fn default() -> Self {
        Self::new()
    }
}

/// Behavior policy of a [`DuplexStream`][crate::DuplexStream].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StreamOptions {
    close_on_eof: bool,
}

impl StreamOptions {
    /// Creates options with the default policy, which closes the stream on end of stream.
    #[must_use]
    pub const fn new() -> Self {
        Self { close_on_eof: true }
    }

    /// Sets whether the stream closes itself once a read observes end of stream.
    ///
    /// Queued output is still flushed before the descriptor is closed.
    #[must_use]
    pub const fn with_close_on_eof(mut self, close_on_eof: bool) -> Self {
        self.close_on_eof = close_on_eof;
        self
    }

    /// Whether the stream closes itself once a read observes end of stream.
    #[must_use]
    pub const fn close_on_eof(&self) -> bool {
        self.close_on_eof
    }
}

impl Default for StreamOptions {
    fn default() -> Self {
        Self::new()
    }
}

/// Behavior of a [`StreamAcceptor`][crate::StreamAcceptor].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AcceptorOptions {
    backlog: usize,
    stream_options: StreamOptions,
}

impl AcceptorOptions {
    /// Creates options that drain up to 100 connections per readiness notification.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            backlog: DEFAULT_ACCEPT_BACKLOG,
            stream_options: StreamOptions::new(),
        }
    }

    /// Sets how many pending connections are accepted per readiness notification.
    ///
    /// The same value is the listen backlog of every listening socket.
    #[must_use]
    pub const fn with_backlog(mut self, backlog: usize) -> Self {
        self.backlog = backlog;
        self
    }

    /// Sets the policy applied to every accepted stream.
    #[must_use]
    pub const fn with_stream_options(mut self, stream_options: StreamOptions) -> Self {
        self.stream_options = stream_options;
        self
    }

    /// How many pending connections are accepted per readiness notification.
    #[must_use]
    pub const fn backlog(&self) -> usize {
        self.backlog
    }

    /// The policy applied to every accepted stream.
    #[must_use]
    pub const fn stream_options(&self) -> StreamOptions {
        self.stream_options
    }
}

impl Default for AcceptorOptions {
    fn default() -> Self {
        Self::new()
    }
}
