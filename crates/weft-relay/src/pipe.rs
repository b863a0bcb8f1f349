//! Byte-pipe handles supplied by the embedding process.

use tokio::io::{AsyncRead, AsyncWrite};

/// Boxed read half of a byte pipe.
pub type BoxReader = Box<dyn AsyncRead + Send + Unpin>;

/// Boxed write half of a byte pipe.
pub type BoxWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// One bidirectional byte pipe, as a read/write half pair.
///
/// The fabric does not open connections itself; embedders hand it pipes
/// (sockets, in-memory duplexes, child-process fds) in this shape.
pub struct SocketPair {
    /// Read half.
    pub reader: BoxReader,
    /// Write half.
    pub writer: BoxWriter,
}

impl SocketPair {
    /// Pair up a read half and a write half.
    pub fn new(
        reader: impl AsyncRead + Send + Unpin + 'static,
        writer: impl AsyncWrite + Send + Unpin + 'static,
    ) -> Self {
        Self { reader: Box::new(reader), writer: Box::new(writer) }
    }

    /// Split one bidirectional stream into a pair.
    pub fn split(stream: impl AsyncRead + AsyncWrite + Send + Unpin + 'static) -> Self {
        let (reader, writer) = tokio::io::split(stream);
        Self { reader: Box::new(reader), writer: Box::new(writer) }
    }
}

impl std::fmt::Debug for SocketPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SocketPair").finish_non_exhaustive()
    }
}
