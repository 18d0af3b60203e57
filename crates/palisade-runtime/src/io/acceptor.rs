//! Async TCP accept.
//!
//! An acceptor owns one listen socket bound through its group's completion
//! port. Each armed accept resolves to exactly one completion; the handler
//! associates the new socket, hands it to the user callback, and re-arms.
//! A cancelled completion (port stop, acceptor stop) simply does not
//! re-arm.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering::{AcqRel, Acquire};
use std::sync::{Arc, Mutex};

use mio::net::{TcpListener, TcpStream};
use socket2::{Domain, Protocol, Socket, Type};
use tracing::{debug, info, warn};

use crate::config::TcpAcceptorConfig;
use crate::error::RuntimeError;

use super::port::CompletionPort;
use super::{Accepted, IoStatus, SocketId};

pub struct TcpAcceptor {
    config: TcpAcceptorConfig,
    port: CompletionPort,
    accepting: AtomicBool,
    listener: Mutex<Option<SocketId>>,
    bound_addr: Mutex<Option<SocketAddr>>,
}

impl TcpAcceptor {
    pub(crate) fn new(config: TcpAcceptorConfig, port: CompletionPort) -> Arc<TcpAcceptor> {
        Arc::new(TcpAcceptor {
            config,
            port,
            accepting: AtomicBool::new(false),
            listener: Mutex::new(None),
            bound_addr: Mutex::new(None),
        })
    }

    pub fn config(&self) -> &TcpAcceptorConfig {
        &self.config
    }

    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Acquire)
    }

    /// Bind, listen, associate with the port, and post the first accept.
    /// Calling on an acceptor that is already accepting is a no-op.
    pub fn start_accepting_async(self: &Arc<Self>) -> Result<(), RuntimeError> {
        if self.accepting.swap(true, AcqRel) {
            debug!(id = self.config.id, "acceptor already accepting");
            return Ok(());
        }

        let result = self.bind_and_listen().map_err(RuntimeError::from).and_then(
            |listener| -> Result<(), RuntimeError> {
                let bound = listener.local_addr().ok();
                let socket = self.port.register_listener(listener, self.clone())?;
                *self.listener.lock().unwrap_or_else(|e| e.into_inner()) = Some(socket);
                *self.bound_addr.lock().unwrap_or_else(|e| e.into_inner()) = bound;
                self.port.arm_accept(socket);
                info!(
                    id = self.config.id,
                    addr = %self.config.addr,
                    "acceptor listening"
                );
                Ok(())
            },
        );

        if let Err(e) = result {
            warn!(id = self.config.id, addr = %self.config.addr, "acceptor failed to start: {e}");
            self.accepting.store(false, std::sync::atomic::Ordering::Release);
            return Err(e);
        }

        Ok(())
    }

    /// Stop accepting and close the listen socket. The outstanding accept
    /// resolves as cancelled and does not re-arm.
    pub fn stop_accepting_async(&self) {
        if !self.accepting.swap(false, AcqRel) {
            debug!(id = self.config.id, "acceptor already stopped");
            return;
        }

        let socket = self
            .listener
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(socket) = socket {
            self.port.close(socket);
        }
        info!(id = self.config.id, addr = %self.config.addr, "acceptor stopped");
    }

    fn bind_and_listen(&self) -> io::Result<TcpListener> {
        let socket = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP))?;
        socket.set_nonblocking(true)?;
        socket.set_reuse_address(true)?;
        socket.bind(&SocketAddr::V4(self.config.addr).into())?;
        socket.listen(self.config.backlog.min(i32::MAX as u32) as i32)?;

        let std_listener: std::net::TcpListener = socket.into();
        Ok(TcpListener::from_std(std_listener))
    }

    /// Local address the listener is bound to; resolved at start, which
    /// makes port-0 configs usable.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.bound_addr.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Worker-side completion handler: associate, notify, re-arm.
    pub(crate) fn complete_accept(
        self: &Arc<Self>,
        accepted: Option<(TcpStream, SocketAddr)>,
        status: IoStatus,
    ) {
        if status != IoStatus::Success {
            if self.is_accepting() {
                warn!(id = self.config.id, "accept failed, acceptor stopping");
                self.stop_accepting_async();
            }
            return;
        }

        let Some((stream, peer)) = accepted else {
            return;
        };

        match self.port.associate_mio(stream) {
            Ok(socket) => {
                (self.config.on_accept)(Accepted {
                    socket,
                    peer,
                    port: self.port.clone(),
                });

                if self.is_accepting() {
                    let armed = self.listener.lock().unwrap_or_else(|e| e.into_inner());
                    if let Some(listener) = *armed {
                        self.port.arm_accept(listener);
                    }
                }
            }
            Err(e) => {
                // dropping the stream closes the accepted socket; the
                // group keeps running
                warn!(
                    id = self.config.id,
                    "failed to associate accepted socket: {e}"
                );
                self.stop_accepting_async();
            }
        }
    }
}
