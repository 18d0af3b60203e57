//! Async socket IO as completion delivery.
//!
//! The port adapts a kernel readiness queue to a completion model: callers
//! start receives/sends by transferring a buffer and a completion handler
//! into the port, workers drain finished operations out of it and run the
//! handlers. Which worker performs the kernel wait is decided per pass by a
//! try-lock race; everyone else parks on the completion channel.

pub(crate) mod acceptor;
pub(crate) mod port;

use std::net::SocketAddr;

pub use acceptor::TcpAcceptor;
pub use port::CompletionPort;

/// Handle to a socket associated with a [`CompletionPort`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SocketId(pub(crate) usize);

/// Outcome of one async operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoStatus {
    Success,
    /// The socket was closed (or the port stopped) with the operation in
    /// flight. Delivered with `bytes = 0` so owners can release resources.
    Cancelled,
    /// The kernel refused the operation in a way the port cannot classify.
    SystemFailure,
}

/// Owned IO buffer handed across the port boundary and returned through
/// the completion.
#[derive(Debug, Default)]
pub struct IoBuffer {
    buf: Vec<u8>,
}

impl IoBuffer {
    /// Zero-filled buffer of `len` bytes; receive targets must be
    /// non-empty.
    pub fn zeroed(len: usize) -> IoBuffer {
        IoBuffer { buf: vec![0; len] }
    }

    pub fn from_vec(buf: Vec<u8>) -> IoBuffer {
        IoBuffer { buf }
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.buf
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.buf
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.buf
    }
}

/// Delivered to a receive/send completion handler. `buffer` is the one the
/// operation was started with, handed back for reuse.
#[derive(Debug)]
pub struct IoResult {
    pub status: IoStatus,
    pub bytes: usize,
    pub buffer: IoBuffer,
    pub socket: SocketId,
}

/// Delivered to an acceptor's `on_accept` callback. The accepted socket is
/// already associated with the group's port.
#[derive(Clone)]
pub struct Accepted {
    pub socket: SocketId,
    pub peer: SocketAddr,
    pub port: CompletionPort,
}
