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

//! Connect loop: consumes a queue of outbound requests and turns them into
//! established, processor-assigned backend connections via non-blocking
//! connect.

use std::collections::HashMap;
use std::io;
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::thread::JoinHandle;

use crossbeam_channel::{Receiver, TryRecvError};

use crate::connection::BackendConnection;
use crate::controller::{Controller, Ctl};
use crate::ident::IdGenerator;
use crate::poller::{IoFail, IoType, Poll, Waker, WakerRecv};
use crate::pool::{ProcessorPool, Reactor, ReactorPool};
use crate::POLL_TIMEOUT;

/// Handle to the connect loop running in a dedicated thread.
///
/// Requests enqueued via [`Connector::request_connect`] (or a cloned
/// [`Controller`]) are drained by the loop, which registers each socket for
/// write readiness, initiates a non-blocking connect and, once the attempt
/// resolves, either hands the established connection to the next reactor or
/// closes it and notifies its owner through
/// [`BackendConnection::on_connect_failed`].
///
/// There is no per-request timeout: an attempt that never resolves occupies
/// its poll registration until the socket errors out or the loop shuts down.
pub struct Connector<C: BackendConnection, P: Poll> {
    thread: JoinHandle<()>,
    controller: Controller<C, <P::Waker as Waker>::Send>,
    heartbeats: Arc<AtomicU64>,
}

impl<C, P> Connector<C, P>
where
    C: BackendConnection,
    C::Processor: Clone + Send + Sync + 'static,
    P: Poll + 'static,
{
    /// Spawns the connect-loop thread.
    ///
    /// # Error
    ///
    /// Errors with a system/OS error if it was impossible to spawn the thread
    /// or create the waker.
    pub fn new<R>(
        name: &str,
        processors: Arc<ProcessorPool<C::Processor>>,
        reactors: Arc<ReactorPool<R>>,
        mut poller: P,
    ) -> io::Result<Self>
    where
        R: Reactor<C>,
    {
        let (ctl_send, ctl_recv) = crossbeam_channel::unbounded();
        let (waker_send, waker_recv) = P::Waker::pair()?;
        let controller = Controller::new(ctl_send, waker_send);
        let heartbeats = Arc::new(AtomicU64::new(0));

        let loop_heartbeats = heartbeats.clone();
        let thread = thread::Builder::new().name(name.to_string()).spawn(move || {
            #[cfg(feature = "log")]
            log::debug!(target: "connector", "Registering waker (fd {})", waker_recv.as_raw_fd());
            poller.register(&waker_recv, IoType::read_only());

            let runtime = ConnectorRuntime {
                poller,
                waker_fd: waker_recv.as_raw_fd(),
                waker: waker_recv,
                ctl_recv,
                pending: empty!(),
                ids: IdGenerator::backend(),
                processors,
                reactors,
                heartbeats: loop_heartbeats,
            };
            runtime.run();
        })?;

        Ok(Connector {
            thread,
            controller,
            heartbeats,
        })
    }

    /// Enqueues an outbound connection request and wakes the loop.
    ///
    /// Never blocks. There is no synchronous result: success is delivered by
    /// handing the connection to a reactor, failure through
    /// [`BackendConnection::on_connect_failed`]. An error here means only
    /// that the loop thread has already exited.
    pub fn request_connect(&self, connection: C) -> io::Result<()> {
        self.controller.cmd(connection)
    }

    /// A cloneable producer handle for issuing connect requests from other
    /// threads.
    pub fn controller(&self) -> Controller<C, <P::Waker as Waker>::Send> {
        self.controller.clone()
    }

    /// Number of completed loop iterations; advances at least once per poll
    /// timeout even with zero traffic.
    pub fn heartbeats(&self) -> u64 { self.heartbeats.load(Ordering::Relaxed) }

    /// Stops the loop and joins its thread. Requests still pending or queued
    /// are closed with a shutdown reason; handed-off connections are
    /// unaffected.
    pub fn shutdown(self) -> thread::Result<()> {
        let _ = self.controller.shutdown();
        self.thread.join()
    }
}

struct ConnectorRuntime<C: BackendConnection, R, P: Poll> {
    poller: P,
    waker: <P::Waker as Waker>::Recv,
    waker_fd: RawFd,
    ctl_recv: Receiver<Ctl<C>>,
    /// Requests with a connect in flight, keyed by their socket descriptor.
    pending: HashMap<RawFd, C>,
    ids: IdGenerator,
    processors: Arc<ProcessorPool<C::Processor>>,
    reactors: Arc<ReactorPool<R>>,
    heartbeats: Arc<AtomicU64>,
}

impl<C, R, P> ConnectorRuntime<C, R, P>
where
    C: BackendConnection,
    R: Reactor<C>,
    P: Poll,
{
    fn run(mut self) {
        loop {
            self.heartbeats.fetch_add(1, Ordering::Relaxed);

            // Blocking
            if let Err(err) = self.poller.poll(Some(POLL_TIMEOUT)) {
                #[cfg(feature = "log")]
                log::warn!(target: "connector", "Poll failed: {err}");
            }

            // New requests are drained and registered strictly before any
            // completion events are handled; a connect registered here can
            // only complete in a later iteration.
            loop {
                match self.ctl_recv.try_recv() {
                    Ok(Ctl::Cmd(connection)) => self.register_connect(connection),
                    Ok(Ctl::Shutdown) | Err(TryRecvError::Disconnected) => {
                        return self.handle_shutdown();
                    }
                    Err(TryRecvError::Empty) => break,
                }
            }

            while let Some((fd, res)) = self.poller.next() {
                if fd == self.waker_fd {
                    self.waker.reset();
                } else if self.pending.contains_key(&fd) {
                    self.finish_connect(fd, res);
                } else {
                    // A descriptor nothing in this loop knows about: drop its
                    // registration so it can't fire again.
                    self.poller.unregister(&fd);
                }
            }
        }
    }

    /// Registers the socket for connect-completion events and initiates the
    /// non-blocking connect. On failure the request is abandoned: the
    /// registration is dropped and the connection closed with the error as
    /// reason. Retrying, if desired, is the caller's business.
    fn register_connect(&mut self, mut connection: C) {
        let fd = connection.channel().as_raw_fd();
        self.poller.register(connection.channel(), IoType::write_only());

        match initiate(&connection) {
            Ok(()) => {
                #[cfg(feature = "log")]
                log::debug!(target: "connector",
                    "Connecting to {} (fd {fd})", connection.server_addr());
                self.pending.insert(fd, connection);
            }
            Err(err) => {
                #[cfg(feature = "log")]
                log::warn!(target: "connector",
                    "Can't initiate connect to {}: {err}", connection.server_addr());
                self.poller.unregister(connection.channel());
                connection.close(&err.to_string());
            }
        }
    }

    /// Finalizes a resolved connect attempt.
    ///
    /// The poll registration is dropped before anything else so the
    /// descriptor can never fire in this loop again. On success the
    /// connection gets its local port, backend id, processor and reactor; on
    /// failure it is closed with the error as reason and its owner is
    /// notified exactly once.
    fn finish_connect(&mut self, fd: RawFd, res: Result<IoType, IoFail>) {
        let Some(mut connection) = self.pending.remove(&fd) else {
            return;
        };
        self.poller.unregister(connection.channel());

        match established(&connection, res) {
            Ok(local_port) => {
                #[cfg(feature = "log")]
                log::debug!(target: "connector",
                    "Connected to {} from local port {local_port}", connection.server_addr());
                connection.set_local_port(local_port);
                connection.set_id(self.ids.next_id());
                connection.set_processor(self.processors.next_processor());
                self.reactors.next_reactor().post_register(connection);
            }
            Err(err) => {
                #[cfg(feature = "log")]
                log::warn!(target: "connector",
                    "Connect to {} failed: {err}", connection.server_addr());
                connection.close(&err.to_string());
                connection.on_connect_failed(&err);
            }
        }
    }

    fn handle_shutdown(mut self) {
        #[cfg(feature = "log")]
        log::info!(target: "connector", "Shutdown");

        for (_, mut connection) in self.pending.drain() {
            connection.close("connector shutdown");
        }
        // Requests which were enqueued but never made it into the loop.
        while let Ok(Ctl::Cmd(mut connection)) = self.ctl_recv.try_recv() {
            connection.close("connector shutdown");
        }
    }
}

/// Starts the non-blocking connect towards the connection's backend address.
/// An in-progress result is success: completion is reported by the poller.
fn initiate(connection: &impl BackendConnection) -> io::Result<()> {
    let channel = connection.channel();
    channel.set_nonblocking(true)?;
    match channel.connect(&connection.server_addr().into()) {
        Ok(()) => Ok(()),
        Err(err) if connect_in_progress(&err) => Ok(()),
        Err(err) => Err(err),
    }
}

fn connect_in_progress(err: &io::Error) -> bool {
    err.raw_os_error() == Some(libc::EINPROGRESS) || err.kind() == io::ErrorKind::WouldBlock
}

/// Resolves a fired connect event into the locally-bound port, or the error
/// which condemned the attempt. `SO_ERROR` is consulted first so a refused or
/// reset connect reports its real cause rather than the poll-level failure.
fn established(
    connection: &impl BackendConnection,
    res: Result<IoType, IoFail>,
) -> io::Result<u16> {
    let channel = connection.channel();
    if let Some(err) = channel.take_error()? {
        return Err(err);
    }
    if let Err(fail) = res {
        return Err(fail.into());
    }
    let local = channel.local_addr()?;
    Ok(local.as_socket().map(|addr| addr.port()).unwrap_or_default())
}

#[cfg(test)]
mod tests {
    use std::net::{SocketAddr, TcpListener};
    use std::sync::Mutex;
    use std::time::{Duration, Instant};

    use socket2::{Domain, Protocol, Socket, Type};

    use super::*;
    use crate::poller::popol::Poller;

    #[derive(Default)]
    struct ConnState {
        id: u64,
        local_port: u16,
        processor: u32,
        closed: Vec<String>,
        failed: Vec<String>,
        registered: bool,
    }

    struct TestConn {
        channel: Socket,
        addr: SocketAddr,
        state: Arc<Mutex<ConnState>>,
    }

    impl BackendConnection for TestConn {
        type Processor = u32;

        fn server_addr(&self) -> SocketAddr { self.addr }
        fn channel(&self) -> &Socket { &self.channel }
        fn set_id(&mut self, id: u64) { self.state.lock().unwrap().id = id; }
        fn set_processor(&mut self, processor: u32) {
            self.state.lock().unwrap().processor = processor;
        }
        fn set_local_port(&mut self, port: u16) {
            self.state.lock().unwrap().local_port = port;
        }
        fn close(&mut self, reason: &str) {
            self.state.lock().unwrap().closed.push(reason.to_string());
        }
        fn on_connect_failed(&mut self, err: &io::Error) {
            self.state.lock().unwrap().failed.push(err.to_string());
        }
    }

    fn new_conn(addr: SocketAddr) -> (TestConn, Arc<Mutex<ConnState>>) {
        let channel = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP)).unwrap();
        let state = Arc::new(Mutex::new(ConnState::default()));
        (
            TestConn {
                channel,
                addr,
                state: state.clone(),
            },
            state,
        )
    }

    struct SinkReactor;

    impl Reactor<TestConn> for SinkReactor {
        fn post_register(&self, connection: TestConn) {
            connection.state.lock().unwrap().registered = true;
        }
    }

    fn start_connector() -> Connector<TestConn, Poller> {
        Connector::new(
            "test-connector",
            Arc::new(ProcessorPool::new(vec![7u32])),
            Arc::new(ReactorPool::new(vec![SinkReactor])),
            Poller::new(),
        )
        .unwrap()
    }

    fn wait_until(cond: impl Fn() -> bool, timeout: Duration) {
        let start = Instant::now();
        while !cond() {
            assert!(start.elapsed() < timeout, "condition not met within {timeout:?}");
            thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn connects_and_hands_off_to_reactor() {
        let backend = TcpListener::bind("127.0.0.1:0").unwrap();
        let connector = start_connector();

        let (conn, state) = new_conn(backend.local_addr().unwrap());
        connector.request_connect(conn).unwrap();
        wait_until(|| state.lock().unwrap().registered, Duration::from_secs(10));

        let st = state.lock().unwrap();
        assert_eq!(st.id, 1);
        assert_eq!(st.processor, 7);
        assert_ne!(st.local_port, 0);
        assert!(st.closed.is_empty(), "established connection must not be closed");
        assert!(st.failed.is_empty(), "established connection must not report failure");
        drop(st);

        connector.shutdown().unwrap();
    }

    #[test]
    fn refused_connect_closes_and_notifies_exactly_once() {
        // Bind and immediately drop to obtain a port nobody listens on.
        let port = {
            let probe = TcpListener::bind("127.0.0.1:0").unwrap();
            probe.local_addr().unwrap().port()
        };
        let connector = start_connector();

        let (conn, state) = new_conn(SocketAddr::from(([127, 0, 0, 1], port)));
        connector.request_connect(conn).unwrap();
        wait_until(|| !state.lock().unwrap().failed.is_empty(), Duration::from_secs(10));

        let st = state.lock().unwrap();
        assert_eq!(st.closed.len(), 1, "exactly one close");
        assert_eq!(st.failed.len(), 1, "exactly one failure notification");
        assert!(!st.registered, "failed connection must never reach a reactor");
        assert_eq!(st.id, 0, "failed connection must consume no id");
        drop(st);

        connector.shutdown().unwrap();
    }

    #[test]
    fn enqueue_wakes_parked_loop() {
        let backend = TcpListener::bind("127.0.0.1:0").unwrap();
        let connector = start_connector();

        // Let the loop park inside its bounded poll.
        thread::sleep(Duration::from_millis(150));

        let (conn, state) = new_conn(backend.local_addr().unwrap());
        let enqueued = Instant::now();
        connector.controller().cmd(conn).unwrap();
        wait_until(|| state.lock().unwrap().registered, Duration::from_secs(10));

        // Observed well before the 1000 ms poll timeout would have elapsed.
        assert!(
            enqueued.elapsed() < Duration::from_millis(300),
            "request sat out the poll timeout: {:?}",
            enqueued.elapsed()
        );
        connector.shutdown().unwrap();
    }

    #[test]
    fn shutdown_closes_pending_and_queued_requests() {
        use crate::poller::PipeWaker;

        let backend = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = backend.local_addr().unwrap();

        // Drive the runtime directly so the shutdown happens deterministically
        // between connect initiation and completion.
        let (ctl_send, ctl_recv) = crossbeam_channel::unbounded();
        let (_waker_send, waker_recv) = PipeWaker::pair().unwrap();
        let mut poller = Poller::new();
        poller.register(&waker_recv, IoType::read_only());

        let mut runtime = ConnectorRuntime {
            poller,
            waker_fd: waker_recv.as_raw_fd(),
            waker: waker_recv,
            ctl_recv,
            pending: empty!(),
            ids: IdGenerator::backend(),
            processors: Arc::new(ProcessorPool::new(vec![7u32])),
            reactors: Arc::new(ReactorPool::new(vec![SinkReactor])),
            heartbeats: Arc::new(AtomicU64::new(0)),
        };

        let (in_flight, in_flight_state) = new_conn(addr);
        runtime.register_connect(in_flight);

        let (queued, queued_state) = new_conn(addr);
        ctl_send.send(Ctl::Cmd(queued)).unwrap();

        runtime.handle_shutdown();

        for state in [in_flight_state, queued_state] {
            let st = state.lock().unwrap();
            assert_eq!(st.closed, vec!["connector shutdown".to_string()]);
            assert!(st.failed.is_empty());
            assert!(!st.registered);
        }
    }
}
