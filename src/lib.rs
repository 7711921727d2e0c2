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

#![deny(
    non_upper_case_globals,
    non_camel_case_types,
    non_snake_case,
    unused_mut,
    unused_imports,
    dead_code
)]
#![cfg_attr(docsrs, feature(doc_auto_cfg))]

//! Connection establishment layer for proxy servers.
//!
//! The crate runs two symmetric single-threaded event loops:
//!
//! - the [`Acceptor`] owns a listening socket and turns inbound connection
//!   attempts into registered, processor-assigned frontend connections;
//! - the [`Connector`] owns a queue of outbound requests and turns them into
//!   established, processor-assigned backend connections via non-blocking
//!   connect.
//!
//! Both loops hand every completed connection to a [`Reactor`] chosen
//! round-robin from a [`ReactorPool`]. The handoff is a one-time ownership
//! transfer: once [`Reactor::post_register`] is called this layer never
//! touches the connection again; all subsequent read/write multiplexing
//! belongs to the reactor.
//!
//! Each loop blocks only in its bounded poll call and is woken early by a
//! cross-thread waker whenever new work arrives, so an outbound request
//! enqueued from an arbitrary thread is observed within one wakeup cycle
//! rather than after the full poll timeout.

#[macro_use]
extern crate amplify;

pub mod poller;
mod acceptor;
mod connection;
mod connector;
mod controller;
mod ident;
mod pool;

use std::time::Duration;

pub use acceptor::{Acceptor, AcceptorConfig, LISTEN_BACKLOG, RECV_BUF_SIZE};
pub use connection::{BackendConnection, ConnectionFactory, FrontendConnection};
pub use connector::Connector;
pub use controller::Controller;
pub use ident::{IdGenerator, BACKEND_ID_CEILING, FRONTEND_ID_CEILING};
pub use pool::{ProcessorPool, Reactor, ReactorPool};

/// Bound on a single blocking poll call in both event loops.
///
/// The bound exists so the per-loop heartbeat counter keeps advancing with
/// zero traffic; it is not needed for correctness, since both loops are woken
/// explicitly when new work arrives.
pub const POLL_TIMEOUT: Duration = Duration::from_millis(1000);
