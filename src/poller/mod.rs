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

//! Readiness polling abstraction used by the accept and connect loops.

#[cfg(feature = "popol")]
pub mod popol;

use std::fmt::{self, Display, Formatter};
use std::io::{self, Read, Write};
use std::os::unix::io::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::sync::Arc;
use std::time::Duration;

/// I/O readiness an event loop waits for, or which has fired for a registered
/// file descriptor.
///
/// The accept loop waits for `read` on its listening socket (a pending inbound
/// connection); the connect loop waits for `write` on each connecting socket
/// (connect completion).
#[derive(Copy, Clone, Ord, PartialOrd, Eq, PartialEq, Hash, Debug)]
pub struct IoType {
    /// I/O source has data to read (for a listener: a connection to accept).
    pub read: bool,
    /// I/O source is ready for write operations (for a connecting socket: the
    /// connect attempt has resolved).
    pub write: bool,
}

impl IoType {
    pub fn read_only() -> Self {
        Self {
            read: true,
            write: false,
        }
    }

    pub fn write_only() -> Self {
        Self {
            read: false,
            write: true,
        }
    }
}

impl Display for IoType {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match (self.read, self.write) {
            (true, true) => f.write_str("read-write"),
            (true, false) => f.write_str("read"),
            (false, true) => f.write_str("write"),
            (false, false) => f.write_str("none"),
        }
    }
}

/// Failure reported by the poll engine for a registered file descriptor.
#[derive(Copy, Clone, Debug, Display, Error)]
#[display(doc_comments)]
pub enum IoFail {
    /// connection reset or hangup reported by the poll (POSIX events {0:#b})
    Connectivity(i16),
    /// OS-level poll error (POSIX events {0:#b})
    Os(i16),
}

impl From<IoFail> for io::Error {
    fn from(fail: IoFail) -> Self {
        match fail {
            IoFail::Connectivity(_) => {
                io::Error::new(io::ErrorKind::ConnectionReset, fail.to_string())
            }
            IoFail::Os(_) => io::Error::new(io::ErrorKind::Other, fail.to_string()),
        }
    }
}

/// Readiness-notification engine owned by a single event-loop thread.
///
/// Registered file descriptors are keyed by their raw value; fired events are
/// drained through the `Iterator` implementation after each [`Poll::poll`]
/// call. No thread other than the owning loop may touch the poll state; the
/// only cross-thread interaction is a [`Waker`] registered like any other
/// read source.
pub trait Poll
where Self: Send + Iterator<Item = (RawFd, Result<IoType, IoFail>)>
{
    /// Waker type compatible with this poll engine.
    type Waker: Waker;

    fn register(&mut self, fd: &impl AsRawFd, interest: IoType);
    fn unregister(&mut self, fd: &impl AsRawFd);

    fn poll(&mut self, timeout: Option<Duration>) -> io::Result<usize>;
}

/// Writing side of a waker: interrupts a blocked poll from any thread.
pub trait WakerSend: Send + Sync + Clone {
    fn wake(&self) -> io::Result<()>;
}

/// Reading side of a waker, owned by the event-loop thread and registered
/// with its poll engine as a read source.
pub trait WakerRecv: AsRawFd + Send {
    /// Drains pending wakeup tokens so the next poll blocks again.
    fn reset(&self);
}

/// A pair of waker endpoints for interrupting a blocked [`Poll::poll`] call.
pub trait Waker: Send {
    type Send: WakerSend;
    type Recv: WakerRecv;

    fn pair() -> Result<(Self::Send, Self::Recv), io::Error>;
}

/// Waker over a non-blocking socket pair.
pub enum PipeWaker {}

impl Waker for PipeWaker {
    type Send = PipeWakerSend;
    type Recv = PipeWakerRecv;

    fn pair() -> Result<(Self::Send, Self::Recv), io::Error> {
        let (writer, reader) = UnixStream::pair()?;
        writer.set_nonblocking(true)?;
        reader.set_nonblocking(true)?;
        Ok((PipeWakerSend(Arc::new(writer)), PipeWakerRecv(reader)))
    }
}

/// Sending half of a [`PipeWaker`]; cheap to clone and share across producer
/// threads.
#[derive(Clone)]
pub struct PipeWakerSend(Arc<UnixStream>);

impl WakerSend for PipeWakerSend {
    fn wake(&self) -> io::Result<()> {
        match (&*self.0).write(&[0x1]) {
            Ok(_) => Ok(()),
            // Pipe full: the loop has unconsumed wakeups and will run anyway.
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => Ok(()),
            Err(err) => Err(err),
        }
    }
}

/// Receiving half of a [`PipeWaker`], registered with the loop's poll engine.
pub struct PipeWakerRecv(UnixStream);

impl AsRawFd for PipeWakerRecv {
    fn as_raw_fd(&self) -> RawFd { self.0.as_raw_fd() }
}

impl WakerRecv for PipeWakerRecv {
    fn reset(&self) {
        let mut buf = [0u8; 32];
        loop {
            match (&self.0).read(&mut buf) {
                Ok(0) => break,
                Ok(_) => continue,
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(_err) => {
                    #[cfg(feature = "log")]
                    log::error!(target: "waker", "Failed to reset waker: {_err}");
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pipe_waker_wakes_and_resets() {
        let (send, recv) = PipeWaker::pair().unwrap();

        let mut buf = [0u8; 1];
        assert_eq!((&recv.0).read(&mut buf).unwrap_err().kind(), io::ErrorKind::WouldBlock);

        send.wake().unwrap();
        assert_eq!((&recv.0).read(&mut buf).unwrap(), 1);

        send.wake().unwrap();
        send.wake().unwrap();
        recv.reset();
        assert_eq!((&recv.0).read(&mut buf).unwrap_err().kind(), io::ErrorKind::WouldBlock);
    }

    #[test]
    fn wake_from_another_thread() {
        let (send, recv) = PipeWaker::pair().unwrap();
        let handle = std::thread::spawn(move || send.wake());
        handle.join().unwrap().unwrap();

        let mut buf = [0u8; 1];
        assert_eq!((&recv.0).read(&mut buf).unwrap(), 1);
    }
}
