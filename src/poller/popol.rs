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

use std::collections::VecDeque;
use std::io;
use std::os::unix::io::{AsRawFd, RawFd};
use std::time::Duration;

use crate::poller::{IoFail, IoType, PipeWaker, Poll};

/// Poll engine backed by the [`popol`] library.
pub struct Poller {
    poll: popol::Sources<RawFd>,
    events: VecDeque<(RawFd, Result<IoType, IoFail>)>,
}

impl Poller {
    pub fn new() -> Self {
        Self {
            poll: popol::Sources::new(),
            events: empty!(),
        }
    }
}

impl Default for Poller {
    fn default() -> Self { Poller::new() }
}

impl Poll for Poller {
    type Waker = PipeWaker;

    fn register(&mut self, fd: &impl AsRawFd, interest: IoType) {
        #[cfg(feature = "log")]
        log::trace!(target: "popol", "Registering {} for `{interest}`", fd.as_raw_fd());
        self.poll.register(fd.as_raw_fd(), fd, interest.into());
    }

    fn unregister(&mut self, fd: &impl AsRawFd) {
        #[cfg(feature = "log")]
        log::trace!(target: "popol", "Unregistering {}", fd.as_raw_fd());
        self.poll.unregister(&fd.as_raw_fd());
    }

    fn poll(&mut self, timeout: Option<Duration>) -> io::Result<usize> {
        let len = self.events.len();
        let mut fired = Vec::new();

        // Blocking call
        match self.poll.poll(&mut fired, timeout) {
            Ok(_) => {}
            Err(err) if err.kind() == io::ErrorKind::TimedOut => {
                #[cfg(feature = "log")]
                log::trace!(target: "popol", "Poll timed out with zero events generated");
                return Ok(0);
            }
            Err(err) => return Err(err),
        }

        for event in fired {
            let res = if event.is_hangup() {
                Err(IoFail::Connectivity(event.raw_events()))
            } else if event.is_error() || event.is_invalid() {
                Err(IoFail::Os(event.raw_events()))
            } else {
                Ok(IoType {
                    read: event.is_readable(),
                    write: event.is_writable(),
                })
            };
            self.events.push_back((event.key, res))
        }

        Ok(self.events.len() - len)
    }
}

impl Iterator for Poller {
    type Item = (RawFd, Result<IoType, IoFail>);

    fn next(&mut self) -> Option<Self::Item> { self.events.pop_front() }
}

impl From<IoType> for popol::Interest {
    fn from(ev: IoType) -> Self {
        let mut e = popol::interest::NONE;
        if ev.read {
            e |= popol::interest::READ;
        }
        if ev.write {
            e |= popol::interest::WRITE;
        }
        e
    }
}
