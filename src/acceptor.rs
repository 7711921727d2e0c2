// Connection establishment layer for proxy servers.
//
// SPDX-License-Identifier: Apache-2.0
//
// Licensed under the Apache License, Version 2.0 (the "License"); you may not use this file except
// in compliance with the License. You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software distributed under the License
// is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express
// or implied. See the License for the specific language governing permissions and limitations under
// the License.

#![allow(unused_variables)] // because we need them for feature-gated logger

//! Accept loop: owns the listening socket and turns inbound connection
//! attempts into registered, processor-assigned frontend connections.

use std::io;
use std::net::{self, SocketAddr, TcpListener, TcpStream};
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{Receiver, TryRecvError};
use socket2::{Domain, Protocol, Socket, Type};

use crate::connection::{ConnectionFactory, FrontendConnection};
use crate::controller::{Controller, Ctl};
use crate::ident::IdGenerator;
use crate::poller::{IoType, Poll, Waker, WakerRecv};
use crate::pool::{ProcessorPool, Reactor, ReactorPool};
use crate::POLL_TIMEOUT;

/// OS-level queue depth for not-yet-accepted inbound connections.
pub const LISTEN_BACKLOG: i32 = 100;

/// Receive-buffer size hint applied to the listening socket.
pub const RECV_BUF_SIZE: usize = 1024 * 16 * 2;

/// Configuration of the accept loop. All fields default to fixed constants;
/// only the bind address is mandatory.
#[derive(Clone, Debug)]
pub struct AcceptorConfig {
    pub bind: SocketAddr,
    pub backlog: i32,
    pub recv_buf_size: usize,
    pub poll_timeout: Duration,
}

impl AcceptorConfig {
    pub fn new(bind: SocketAddr) -> Self {
        AcceptorConfig {
            bind,
            backlog: LISTEN_BACKLOG,
            recv_buf_size: RECV_BUF_SIZE,
            poll_timeout: POLL_TIMEOUT,
        }
    }
}

/// Handle to the accept loop running in a dedicated thread.
///
/// The loop blocks on its poll engine with a bounded timeout, accepts one
/// pending connection per readiness event, builds the frontend connection via
/// the factory, assigns it the next frontend id and a processor, and hands it
/// to the next reactor. Any per-connection failure closes the raw socket and
/// leaves the loop running.
pub struct Acceptor<P: Poll> {
    thread: JoinHandle<()>,
    controller: Controller<(), <P::Waker as Waker>::Send>,
    local_addr: SocketAddr,
    heartbeats: Arc<AtomicU64>,
}

impl<P: Poll + 'static> Acceptor<P> {
    /// Binds the listening socket and spawns the accept-loop thread.
    ///
    /// The socket is bound with `SO_REUSEADDR`, the configured receive-buffer
    /// hint and backlog, and put into non-blocking mode before the thread
    /// starts, so bind errors surface here and the resolved address (with an
    /// ephemeral port, if port 0 was requested) is known immediately.
    ///
    /// # Error
    ///
    /// Errors with a system/OS error if binding the listener or spawning the
    /// thread failed.
    pub fn bind<F, R>(
        name: &str,
        config: AcceptorConfig,
        factory: F,
        processors: Arc<ProcessorPool<<F::Conn as FrontendConnection>::Processor>>,
        reactors: Arc<ReactorPool<R>>,
        mut poller: P,
    ) -> io::Result<Self>
    where
        F: ConnectionFactory,
        R: Reactor<F::Conn>,
        <F::Conn as FrontendConnection>::Processor: Clone + Send + Sync + 'static,
    {
        let listener = bind_listener(&config)?;
        let local_addr = listener.local_addr()?;

        let (ctl_send, ctl_recv) = crossbeam_channel::unbounded();
        let (waker_send, waker_recv) = P::Waker::pair()?;
        let controller = Controller::new(ctl_send, waker_send);
        let heartbeats = Arc::new(AtomicU64::new(0));

        let loop_heartbeats = heartbeats.clone();
        let thread = thread::Builder::new().name(name.to_string()).spawn(move || {
            #[cfg(feature = "log")]
            log::debug!(target: "acceptor", "Registering waker (fd {})", waker_recv.as_raw_fd());
            poller.register(&waker_recv, IoType::read_only());
            poller.register(&listener, IoType::read_only());

            #[cfg(feature = "log")]
            log::info!(target: "acceptor", "Listening on {local_addr}");

            let runtime = AcceptorRuntime {
                listener_fd: listener.as_raw_fd(),
                listener,
                poller,
                waker_fd: waker_recv.as_raw_fd(),
                waker: waker_recv,
                ctl_recv,
                factory,
                ids: IdGenerator::frontend(),
                processors,
                reactors,
                heartbeats: loop_heartbeats,
                poll_timeout: config.poll_timeout,
            };
            runtime.run();
        })?;

        Ok(Acceptor {
            thread,
            controller,
            local_addr,
            heartbeats,
        })
    }

    /// Address the listening socket is bound to.
    pub fn local_addr(&self) -> SocketAddr { self.local_addr }

    /// Number of completed loop iterations; advances at least once per poll
    /// timeout even with zero traffic.
    pub fn heartbeats(&self) -> u64 { self.heartbeats.load(Ordering::Relaxed) }

    /// Stops the loop and joins its thread. The listening socket is closed on
    /// exit; already handed-off connections are unaffected.
    pub fn shutdown(self) -> thread::Result<()> {
        let _ = self.controller.shutdown();
        self.thread.join()
    }
}

fn bind_listener(config: &AcceptorConfig) -> io::Result<TcpListener> {
    let socket = Socket::new(Domain::for_address(config.bind), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.set_recv_buffer_size(config.recv_buf_size)?;
    socket.set_nonblocking(true)?;
    socket.bind(&config.bind.into())?;
    socket.listen(config.backlog)?;
    Ok(socket.into())
}

struct AcceptorRuntime<F: ConnectionFactory, R, P: Poll> {
    listener: TcpListener,
    listener_fd: RawFd,
    poller: P,
    waker: <P::Waker as Waker>::Recv,
    waker_fd: RawFd,
    ctl_recv: Receiver<Ctl<()>>,
    factory: F,
    ids: IdGenerator,
    processors: Arc<ProcessorPool<<F::Conn as FrontendConnection>::Processor>>,
    reactors: Arc<ReactorPool<R>>,
    heartbeats: Arc<AtomicU64>,
    poll_timeout: Duration,
}

impl<F, R, P> AcceptorRuntime<F, R, P>
where
    F: ConnectionFactory,
    R: Reactor<F::Conn>,
    P: Poll,
{
    fn run(mut self) {
        loop {
            self.heartbeats.fetch_add(1, Ordering::Relaxed);

            // Blocking
            if let Err(err) = self.poller.poll(Some(self.poll_timeout)) {
                #[cfg(feature = "log")]
                log::warn!(target: "acceptor", "Poll failed: {err}");
            }

            loop {
                match self.ctl_recv.try_recv() {
                    Ok(Ctl::Cmd(())) => {}
                    Ok(Ctl::Shutdown) | Err(TryRecvError::Disconnected) => {
                        #[cfg(feature = "log")]
                        log::info!(target: "acceptor", "Shutdown");
                        return;
                    }
                    Err(TryRecvError::Empty) => break,
                }
            }

            while let Some((fd, res)) = self.poller.next() {
                if fd == self.waker_fd {
                    self.waker.reset();
                } else if fd == self.listener_fd {
                    match res {
                        Ok(io) if io.read => self.accept(),
                        Ok(_) => {}
                        Err(err) => {
                            // The listener itself stays registered; a spurious
                            // poll failure must not kill the loop.
                            #[cfg(feature = "log")]
                            log::error!(target: "acceptor", "Listening socket {err}");
                        }
                    }
                } else {
                    // A descriptor nothing in this loop knows about: drop its
                    // registration so it can't fire again.
                    self.poller.unregister(&fd);
                }
            }
        }
    }

    /// Accepts one pending connection and runs it through the establishment
    /// sequence: non-blocking mode, factory, accepted flag, id, processor,
    /// reactor handoff. Every failure path closes the raw socket and returns
    /// to the loop.
    fn accept(&mut self) {
        let (stream, peer) = match self.listener.accept() {
            Ok(pair) => pair,
            // Readiness can evaporate between poll and accept; not an error.
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => return,
            Err(err) => {
                #[cfg(feature = "log")]
                log::warn!(target: "acceptor", "Accept failed: {err}");
                return;
            }
        };

        #[cfg(feature = "log")]
        log::debug!(target: "acceptor", "Accepted connection from {peer}");

        if let Err(err) = stream.set_nonblocking(true) {
            #[cfg(feature = "log")]
            log::warn!(target: "acceptor", "Can't set {peer} non-blocking: {err}");
            close_stream(stream);
            return;
        }

        // On error the factory owns the stream and releases it.
        let mut conn = match self.factory.make(stream, peer) {
            Ok(conn) => conn,
            Err(err) => {
                #[cfg(feature = "log")]
                log::warn!(target: "acceptor", "Connection factory refused {peer}: {err}");
                return;
            }
        };

        conn.set_accepted(true);
        conn.set_id(self.ids.next_id());
        conn.set_processor(self.processors.next_processor());
        self.reactors.next_reactor().post_register(conn);
    }
}

/// Best-effort close of a condemned socket: shut down both directions, log
/// secondary errors, never propagate them.
fn close_stream(stream: TcpStream) {
    if let Err(err) = stream.shutdown(net::Shutdown::Both) {
        #[cfg(feature = "log")]
        log::error!(target: "acceptor", "Error closing accepted socket: {err}");
    }
    drop(stream);
}
