//! The completion port.
//!
//! One port per async-IO worker group. Requests transfer ownership of their
//! buffer and handler into the port; completions transfer them back out to
//! whichever worker dequeues. Internally a mio `Poll` supplies readiness;
//! the drive pass converts readiness into finished operations. Exactly one
//! worker runs the drive pass at a time (poll-lock try-lock race); the
//! others park on the completion channel and are woken by its sends.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::sync::atomic::Ordering::{AcqRel, Acquire, Relaxed};
use std::sync::atomic::{AtomicBool, AtomicUsize};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, unbounded};
use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Registry, Token, Waker};
use tracing::{debug, trace, warn};

use crate::error::RuntimeError;
use crate::task::TaskRef;

use super::acceptor::TcpAcceptor;
use super::{IoBuffer, IoResult, IoStatus, SocketId};

const WAKE: Token = Token(0);
const EVENT_CAPACITY: usize = 1024;

pub(crate) type IoHandler = Box<dyn FnOnce(IoResult) + Send>;

/// One unit of finished work handed to a dequeuing worker.
pub(crate) enum Completion {
    Io {
        handler: IoHandler,
        result: IoResult,
    },
    Accept {
        acceptor: Arc<TcpAcceptor>,
        accepted: Option<(TcpStream, SocketAddr)>,
        status: IoStatus,
    },
    /// User-enqueued work; delivered to exactly one worker.
    Task(TaskRef),
    /// Terminate sentinel; one per port thread, enqueued by `stop`.
    Shutdown,
}

impl fmt::Debug for Completion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Completion::Io { result, .. } => {
                f.debug_struct("Io").field("result", result).finish()
            }
            Completion::Accept {
                accepted, status, ..
            } => f
                .debug_struct("Accept")
                .field("accepted", accepted)
                .field("status", status)
                .finish(),
            Completion::Task(_) => write!(f, "Task(..)"),
            Completion::Shutdown => write!(f, "Shutdown"),
        }
    }
}

#[derive(Debug)]
pub(crate) enum DequeueError {
    /// No completion within the timeout; not an error for the tick loop.
    Timeout,
    /// The port has stopped and this worker consumed its sentinel.
    Shutdown,
    SystemFailure(io::Error),
}

struct PendingRecv {
    buffer: IoBuffer,
    handler: IoHandler,
}

struct PendingSend {
    buffer: IoBuffer,
    written: usize,
    handler: IoHandler,
}

enum SocketEntry {
    Stream {
        stream: TcpStream,
        readable: bool,
        writable: bool,
        recv: Option<PendingRecv>,
        send: VecDeque<PendingSend>,
    },
    Listener {
        listener: TcpListener,
        acceptor: Arc<TcpAcceptor>,
        readable: bool,
        armed: bool,
    },
}

struct Poller {
    poll: Poll,
    events: Events,
}

struct PortShared {
    poller: Mutex<Poller>,
    registry: Registry,
    waker: Waker,
    sockets: Mutex<HashMap<Token, SocketEntry>>,
    /// Sockets with freshly posted requests, to progress even without a
    /// new readiness event.
    kicked: Mutex<Vec<Token>>,
    tx: Sender<Completion>,
    rx: Receiver<Completion>,
    next_token: AtomicUsize,
    stopped: AtomicBool,
    threads: u32,
}

/// Cheap-clone handle to one worker group's async IO system.
#[derive(Clone)]
pub struct CompletionPort {
    shared: Arc<PortShared>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

impl CompletionPort {
    /// Create a port that will be drained by `threads` workers. No threads
    /// are created here.
    pub fn start(threads: u32) -> Result<CompletionPort, RuntimeError> {
        let poll = Poll::new()?;
        let waker = Waker::new(poll.registry(), WAKE)?;
        let registry = poll.registry().try_clone()?;
        let (tx, rx) = unbounded();

        Ok(CompletionPort {
            shared: Arc::new(PortShared {
                poller: Mutex::new(Poller {
                    poll,
                    events: Events::with_capacity(EVENT_CAPACITY),
                }),
                registry,
                waker,
                sockets: Mutex::new(HashMap::new()),
                kicked: Mutex::new(Vec::new()),
                tx,
                rx,
                next_token: AtomicUsize::new(1),
                stopped: AtomicBool::new(false),
                threads,
            }),
        })
    }

    pub fn is_stopped(&self) -> bool {
        self.shared.stopped.load(Acquire)
    }

    fn alloc_token(&self) -> Token {
        Token(self.shared.next_token.fetch_add(1, Relaxed))
    }

    fn wake(&self) {
        if let Err(e) = self.shared.waker.wake() {
            warn!("port waker failed: {e}");
        }
    }

    fn kick(&self, token: Token) {
        lock(&self.shared.kicked).push(token);
        self.wake();
    }

    fn push(&self, completion: Completion) {
        // the channel is unbounded and both ends live in `shared`
        let _ = self.shared.tx.send(completion);
    }

    /// Bind a connected socket's completion delivery to this port for the
    /// socket's lifetime.
    pub fn associate(&self, stream: std::net::TcpStream) -> Result<SocketId, RuntimeError> {
        stream.set_nonblocking(true)?;
        self.associate_mio(TcpStream::from_std(stream))
    }

    pub(crate) fn associate_mio(&self, mut stream: TcpStream) -> Result<SocketId, RuntimeError> {
        if self.is_stopped() {
            return Err(RuntimeError::ShuttingDown);
        }

        let token = self.alloc_token();
        self.shared
            .registry
            .register(&mut stream, token, Interest::READABLE | Interest::WRITABLE)?;

        lock(&self.shared.sockets).insert(
            token,
            SocketEntry::Stream {
                stream,
                readable: false,
                writable: false,
                recv: None,
                send: VecDeque::new(),
            },
        );

        Ok(SocketId(token.0))
    }

    pub(crate) fn register_listener(
        &self,
        mut listener: TcpListener,
        acceptor: Arc<TcpAcceptor>,
    ) -> Result<SocketId, RuntimeError> {
        if self.is_stopped() {
            return Err(RuntimeError::ShuttingDown);
        }

        let token = self.alloc_token();
        self.shared
            .registry
            .register(&mut listener, token, Interest::READABLE)?;

        lock(&self.shared.sockets).insert(
            token,
            SocketEntry::Listener {
                listener,
                acceptor,
                readable: false,
                armed: false,
            },
        );

        Ok(SocketId(token.0))
    }

    /// Post one async accept on a registered listener. The next inbound
    /// connection produces exactly one accept completion.
    pub(crate) fn arm_accept(&self, socket: SocketId) {
        let token = Token(socket.0);
        {
            let mut sockets = lock(&self.shared.sockets);
            if let Some(SocketEntry::Listener { armed, .. }) = sockets.get_mut(&token) {
                *armed = true;
            }
        }
        self.kick(token);
    }

    /// Start an async receive. The port owns `buffer` and `handler` until
    /// the completion is dequeued; the dequeuing worker runs the handler
    /// and thereby returns the buffer.
    pub fn begin_receive(
        &self,
        socket: SocketId,
        buffer: IoBuffer,
        handler: impl FnOnce(IoResult) + Send + 'static,
    ) -> Result<(), RuntimeError> {
        debug_assert!(!buffer.is_empty(), "receive buffer must be non-empty");

        let token = Token(socket.0);
        let mut pending = Some(PendingRecv {
            buffer,
            handler: Box::new(handler),
        });

        {
            let mut sockets = lock(&self.shared.sockets);
            if !self.is_stopped() {
                if let Some(SocketEntry::Stream { recv, .. }) = sockets.get_mut(&token) {
                    if recv.is_some() {
                        return Err(RuntimeError::ReceivePending);
                    }
                    *recv = pending.take();
                }
            }
        }

        match pending {
            // closed socket or stopping port: fail-safe delivery so the
            // owner still releases its resources
            Some(pending) => {
                self.push(Completion::Io {
                    handler: pending.handler,
                    result: IoResult {
                        status: IoStatus::Cancelled,
                        bytes: 0,
                        buffer: pending.buffer,
                        socket,
                    },
                });
            }
            None => self.kick(token),
        }
        Ok(())
    }

    /// Start an async send of the whole buffer. Partial kernel writes are
    /// retried inside the port; the completion reports the full length.
    pub fn begin_send(
        &self,
        socket: SocketId,
        buffer: IoBuffer,
        handler: impl FnOnce(IoResult) + Send + 'static,
    ) -> Result<(), RuntimeError> {
        let token = Token(socket.0);
        let mut pending = Some(PendingSend {
            buffer,
            written: 0,
            handler: Box::new(handler),
        });

        {
            let mut sockets = lock(&self.shared.sockets);
            if !self.is_stopped() {
                if let Some(SocketEntry::Stream { send, .. }) = sockets.get_mut(&token) {
                    send.push_back(pending.take().expect("pending set above"));
                }
            }
        }

        match pending {
            Some(pending) => {
                self.push(Completion::Io {
                    handler: pending.handler,
                    result: IoResult {
                        status: IoStatus::Cancelled,
                        bytes: 0,
                        buffer: pending.buffer,
                        socket,
                    },
                });
            }
            None => self.kick(token),
        }
        Ok(())
    }

    /// Hand a task to exactly one dequeuing worker of this port's group.
    pub fn post(&self, task: TaskRef) {
        self.push(Completion::Task(task));
        self.wake();
    }

    /// Close an associated socket. In-flight operations complete as
    /// `Cancelled` with zero bytes.
    pub fn close(&self, socket: SocketId) {
        let token = Token(socket.0);
        let entry = lock(&self.shared.sockets).remove(&token);
        if let Some(entry) = entry {
            self.cancel_entry(socket, entry);
        }
    }

    fn cancel_entry(&self, socket: SocketId, entry: SocketEntry) {
        match entry {
            SocketEntry::Stream {
                mut stream,
                recv,
                send,
                ..
            } => {
                let _ = self.shared.registry.deregister(&mut stream);
                if let Some(pending) = recv {
                    self.push(Completion::Io {
                        handler: pending.handler,
                        result: IoResult {
                            status: IoStatus::Cancelled,
                            bytes: 0,
                            buffer: pending.buffer,
                            socket,
                        },
                    });
                }
                for pending in send {
                    self.push(Completion::Io {
                        handler: pending.handler,
                        result: IoResult {
                            status: IoStatus::Cancelled,
                            bytes: 0,
                            buffer: pending.buffer,
                            socket,
                        },
                    });
                }
            }
            SocketEntry::Listener {
                mut listener,
                acceptor,
                armed,
                ..
            } => {
                let _ = self.shared.registry.deregister(&mut listener);
                if armed {
                    self.push(Completion::Accept {
                        acceptor,
                        accepted: None,
                        status: IoStatus::Cancelled,
                    });
                }
            }
        }
    }

    /// Stop the port. Every in-flight request is delivered as a cancelled
    /// completion before this returns, then one shutdown sentinel per port
    /// thread is enqueued.
    pub fn stop(&self) {
        if self.shared.stopped.swap(true, AcqRel) {
            debug!("port already stopped");
            return;
        }

        self.wake();
        // wait out any drive pass in flight so cancellations are final
        let _poller = lock(&self.shared.poller);

        let entries: Vec<(Token, SocketEntry)> = lock(&self.shared.sockets).drain().collect();
        for (token, entry) in entries {
            self.cancel_entry(SocketId(token.0), entry);
        }

        for _ in 0..self.shared.threads.max(1) {
            self.push(Completion::Shutdown);
        }
    }

    /// Drain completions that are already queued, without driving IO.
    /// Returns true when a shutdown sentinel was consumed.
    fn try_fill(&self, out: &mut Vec<Completion>, max: usize) -> bool {
        while out.len() < max {
            match self.shared.rx.try_recv() {
                Ok(Completion::Shutdown) => return true,
                Ok(completion) => out.push(completion),
                Err(_) => break,
            }
        }
        false
    }

    /// Dequeue up to `max` completions into `out`. At most one kernel wait
    /// of `timeout` happens per call; `None` blocks until work arrives.
    pub(crate) fn dequeue_batch(
        &self,
        out: &mut Vec<Completion>,
        max: usize,
        timeout: Option<Duration>,
    ) -> Result<(), DequeueError> {
        if self.try_fill(out, max) {
            return self.after_sentinel(out);
        }
        if !out.is_empty() {
            return Ok(());
        }

        if let Ok(mut poller) = self.shared.poller.try_lock() {
            self.drive(&mut poller, timeout)
                .map_err(DequeueError::SystemFailure)?;
            drop(poller);

            if self.try_fill(out, max) {
                return self.after_sentinel(out);
            }
            if out.is_empty() {
                return Err(DequeueError::Timeout);
            }
            Ok(())
        } else {
            // another worker is driving; park on the channel
            let first = match timeout {
                Some(timeout) => match self.shared.rx.recv_timeout(timeout) {
                    Ok(completion) => completion,
                    Err(RecvTimeoutError::Timeout) => return Err(DequeueError::Timeout),
                    Err(RecvTimeoutError::Disconnected) => return Err(DequeueError::Shutdown),
                },
                None => match self.shared.rx.recv() {
                    Ok(completion) => completion,
                    Err(_) => return Err(DequeueError::Shutdown),
                },
            };

            if matches!(first, Completion::Shutdown) {
                return Err(DequeueError::Shutdown);
            }
            out.push(first);
            if self.try_fill(out, max) {
                return self.after_sentinel(out);
            }
            Ok(())
        }
    }

    /// Dequeue a single completion.
    pub(crate) fn dequeue(&self, timeout: Option<Duration>) -> Result<Completion, DequeueError> {
        let mut out = Vec::with_capacity(1);
        self.dequeue_batch(&mut out, 1, timeout)?;
        Ok(out.pop().expect("non-empty batch"))
    }

    /// A sentinel surfaced mid-batch: keep the work we already collected
    /// and put the sentinel back for the next dequeuer.
    fn after_sentinel(&self, out: &mut Vec<Completion>) -> Result<(), DequeueError> {
        if out.is_empty() {
            return Err(DequeueError::Shutdown);
        }
        self.push(Completion::Shutdown);
        Ok(())
    }

    /// One readiness pass: poll the kernel, fold events into the socket
    /// table, progress every touched socket.
    fn drive(&self, poller: &mut Poller, timeout: Option<Duration>) -> io::Result<()> {
        if self.is_stopped() {
            return Ok(());
        }

        if let Err(e) = poller.poll.poll(&mut poller.events, timeout) {
            if e.kind() == io::ErrorKind::Interrupted {
                return Ok(());
            }
            return Err(e);
        }

        let mut touched: Vec<Token> = std::mem::take(&mut *lock(&self.shared.kicked));

        {
            let mut sockets = lock(&self.shared.sockets);
            for event in poller.events.iter() {
                let token = event.token();
                if token == WAKE {
                    continue;
                }
                match sockets.get_mut(&token) {
                    Some(SocketEntry::Stream {
                        readable, writable, ..
                    }) => {
                        if event.is_readable() {
                            *readable = true;
                        }
                        if event.is_writable() {
                            *writable = true;
                        }
                    }
                    Some(SocketEntry::Listener { readable, .. }) => {
                        if event.is_readable() {
                            *readable = true;
                        }
                    }
                    None => continue,
                }
                touched.push(token);
            }

            for token in touched {
                self.progress_locked(&mut sockets, token);
            }
        }

        Ok(())
    }

    /// Progress pending operations on one socket as far as readiness
    /// allows. Completions go out through the channel; handlers run later
    /// on whichever worker dequeues them.
    fn progress_locked(&self, sockets: &mut HashMap<Token, SocketEntry>, token: Token) {
        let socket = SocketId(token.0);
        let Some(entry) = sockets.get_mut(&token) else {
            return;
        };

        match entry {
            SocketEntry::Stream {
                stream,
                readable,
                writable,
                recv,
                send,
            } => {
                while *readable && recv.is_some() {
                    let pending = recv.as_mut().expect("checked above");
                    match stream.read(pending.buffer.as_mut_slice()) {
                        Ok(bytes) => {
                            let pending = recv.take().expect("checked above");
                            self.push(Completion::Io {
                                handler: pending.handler,
                                result: IoResult {
                                    status: IoStatus::Success,
                                    bytes,
                                    buffer: pending.buffer,
                                    socket,
                                },
                            });
                        }
                        Err(e) if e.kind() == io::ErrorKind::WouldBlock => *readable = false,
                        Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                        Err(e) => {
                            trace!("recv failed on {socket:?}: {e}");
                            let pending = recv.take().expect("checked above");
                            self.push(Completion::Io {
                                handler: pending.handler,
                                result: IoResult {
                                    status: IoStatus::Cancelled,
                                    bytes: 0,
                                    buffer: pending.buffer,
                                    socket,
                                },
                            });
                        }
                    }
                }

                while *writable && !send.is_empty() {
                    let front = send.front_mut().expect("checked above");
                    let remaining = &front.buffer.as_slice()[front.written..];
                    match stream.write(remaining) {
                        Ok(0) => {
                            let pending = send.pop_front().expect("checked above");
                            self.push(Completion::Io {
                                handler: pending.handler,
                                result: IoResult {
                                    status: IoStatus::Cancelled,
                                    bytes: 0,
                                    buffer: pending.buffer,
                                    socket,
                                },
                            });
                        }
                        Ok(n) => {
                            front.written += n;
                            if front.written == front.buffer.len() {
                                let pending = send.pop_front().expect("checked above");
                                let bytes = pending.buffer.len();
                                self.push(Completion::Io {
                                    handler: pending.handler,
                                    result: IoResult {
                                        status: IoStatus::Success,
                                        bytes,
                                        buffer: pending.buffer,
                                        socket,
                                    },
                                });
                            }
                        }
                        Err(e) if e.kind() == io::ErrorKind::WouldBlock => *writable = false,
                        Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                        Err(e) => {
                            trace!("send failed on {socket:?}: {e}");
                            let pending = send.pop_front().expect("checked above");
                            self.push(Completion::Io {
                                handler: pending.handler,
                                result: IoResult {
                                    status: IoStatus::Cancelled,
                                    bytes: 0,
                                    buffer: pending.buffer,
                                    socket,
                                },
                            });
                        }
                    }
                }
            }

            SocketEntry::Listener {
                listener,
                acceptor,
                readable,
                armed,
            } => {
                if *armed && *readable {
                    match listener.accept() {
                        Ok((stream, peer)) => {
                            *armed = false;
                            self.push(Completion::Accept {
                                acceptor: acceptor.clone(),
                                accepted: Some((stream, peer)),
                                status: IoStatus::Success,
                            });
                        }
                        Err(e) if e.kind() == io::ErrorKind::WouldBlock => *readable = false,
                        Err(e) => {
                            warn!("accept failed: {e}");
                            *armed = false;
                            self.push(Completion::Accept {
                                acceptor: acceptor.clone(),
                                accepted: None,
                                status: IoStatus::SystemFailure,
                            });
                        }
                    }
                }
            }
        }
    }
}
