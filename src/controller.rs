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

use std::io;

use crossbeam_channel as chan;

use crate::poller::WakerSend;

pub(crate) enum Ctl<C> {
    Cmd(C),
    Shutdown,
}

/// Producer-side API of an event loop: an unbounded command queue combined
/// with the loop's waker.
///
/// Sending a command both enqueues it and interrupts the loop's blocked poll,
/// so the command is observed within one wakeup cycle instead of waiting out
/// the poll timeout. For the [`crate::Connector`] the command type is the
/// pending outbound connection itself; any number of clones may send from
/// arbitrary threads.
pub struct Controller<C, W: WakerSend> {
    ctl_send: chan::Sender<Ctl<C>>,
    waker: W,
}

impl<C, W: WakerSend> Clone for Controller<C, W> {
    fn clone(&self) -> Self {
        Controller {
            ctl_send: self.ctl_send.clone(),
            waker: self.waker.clone(),
        }
    }
}

impl<C, W: WakerSend> Controller<C, W> {
    pub(crate) fn new(ctl_send: chan::Sender<Ctl<C>>, waker: W) -> Self { Self { ctl_send, waker } }

    /// Send a command to the loop and wake it up.
    ///
    /// Never blocks; fails only if the loop thread has already exited.
    pub fn cmd(&self, command: C) -> Result<(), io::Error> {
        self.ctl_send.send(Ctl::Cmd(command)).map_err(|_| io::ErrorKind::BrokenPipe)?;
        self.wake()
    }

    /// Ask the loop to terminate.
    pub fn shutdown(self) -> Result<(), Self> {
        #[cfg(feature = "log")]
        log::info!(target: "controller", "Initiating event loop shutdown...");

        let res1 = self.ctl_send.send(Ctl::Shutdown);
        let res2 = self.wake();
        res1.or(res2).map_err(|_| self)
    }

    pub(crate) fn wake(&self) -> io::Result<()> {
        #[cfg(feature = "log")]
        log::trace!(target: "controller", "Waking the event loop");
        self.waker.wake()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::poller::{PipeWaker, Waker, WakerRecv};

    #[test]
    fn cmd_enqueues_and_wakes() {
        let (ctl_send, ctl_recv) = chan::unbounded();
        let (waker_send, waker_recv) = PipeWaker::pair().unwrap();
        let controller = Controller::new(ctl_send, waker_send);

        controller.cmd(42u32).unwrap();
        match ctl_recv.try_recv() {
            Ok(Ctl::Cmd(n)) => assert_eq!(n, 42),
            _ => panic!("command not delivered"),
        }
        // A wakeup token must be pending.
        waker_recv.reset();

        assert!(controller.clone().shutdown().is_ok());
        assert!(matches!(ctl_recv.try_recv(), Ok(Ctl::Shutdown)));
    }

    #[test]
    fn cmd_fails_once_receiver_is_gone() {
        let (ctl_send, ctl_recv) = chan::unbounded::<Ctl<u32>>();
        let (waker_send, _waker_recv) = PipeWaker::pair().unwrap();
        let controller = Controller::new(ctl_send, waker_send);

        drop(ctl_recv);
        assert_eq!(controller.cmd(1).unwrap_err().kind(), io::ErrorKind::BrokenPipe);
    }
}
