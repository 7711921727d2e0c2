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

//! Boundary contracts for the connections flowing through the accept and
//! connect loops.
//!
//! This layer does not own connection construction: frontend connections come
//! from a [`ConnectionFactory`], backend connections from the caller issuing
//! the connect request. The traits here are the exact mutation surface the
//! loops need before handing a connection to a reactor.

use std::io;
use std::net::{SocketAddr, TcpStream};

use socket2::Socket;

/// A connection accepted from a peer by the [`crate::Acceptor`].
///
/// After acceptance the loop marks the connection accepted, assigns it the
/// next frontend identifier and a processor, and transfers it to a reactor.
pub trait FrontendConnection: Send + 'static {
    /// Application-level worker handle assigned round-robin to every
    /// established connection.
    type Processor: Clone;

    fn set_accepted(&mut self, accepted: bool);
    fn set_id(&mut self, id: u64);
    fn set_processor(&mut self, processor: Self::Processor);

    /// Closes the connection with a human-readable reason. Must release the
    /// underlying socket; secondary close errors must not propagate.
    fn close(&mut self, reason: &str);
}

/// An outbound connection request consumed by the [`crate::Connector`].
///
/// The caller creates the connection around an unconnected socket and the
/// target address; the connect loop initiates the non-blocking connect,
/// finalizes it on write readiness and either hands the connection to a
/// reactor or reports the failure back through [`Self::on_connect_failed`].
pub trait BackendConnection: Send + 'static {
    /// Application-level worker handle assigned round-robin to every
    /// established connection.
    type Processor: Clone;

    /// Address of the backend server to connect to.
    fn server_addr(&self) -> SocketAddr;

    /// The underlying, not-yet-connected socket.
    fn channel(&self) -> &Socket;

    fn set_id(&mut self, id: u64);
    fn set_processor(&mut self, processor: Self::Processor);

    /// Records the locally-bound port once the connect has completed.
    fn set_local_port(&mut self, port: u16);

    /// Closes the connection with a human-readable reason. Must release the
    /// underlying socket; secondary close errors must not propagate.
    fn close(&mut self, reason: &str);

    /// Notifies the owner of the request that the connect attempt failed.
    ///
    /// Called exactly once per failed attempt, always after [`Self::close`].
    fn on_connect_failed(&mut self, err: &io::Error);
}

/// Builds a [`FrontendConnection`] around a freshly accepted socket.
///
/// Invoked once per accepted socket from the accept-loop thread. On error the
/// factory owns the stream and must release it; the loop logs the failure and
/// keeps running.
pub trait ConnectionFactory: Send + 'static {
    type Conn: FrontendConnection;

    fn make(&self, stream: TcpStream, peer: SocketAddr) -> io::Result<Self::Conn>;
}
