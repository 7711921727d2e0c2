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

//! Round-robin pools of the downstream collaborators: reactors, which take
//! ownership of established connections, and processors, which service
//! application-level work.

use std::sync::atomic::{AtomicUsize, Ordering};

/// An I/O-multiplexing worker owning read/write event processing for the
/// connections handed to it.
///
/// [`Reactor::post_register`] is a one-way ownership transfer: after it
/// returns, the posting loop never touches the connection's socket, poll
/// registration or lifecycle again. It must be safe to call concurrently from
/// the accept-loop and connect-loop threads.
pub trait Reactor<C>: Send + Sync + 'static {
    fn post_register(&self, connection: C);
}

/// Fixed-size set of reactors selected cyclically, one position per
/// established connection.
pub struct ReactorPool<R> {
    reactors: Vec<R>,
    cursor: AtomicUsize,
}

impl<R> ReactorPool<R> {
    /// # Panics
    ///
    /// Panics if `reactors` is empty.
    pub fn new(reactors: Vec<R>) -> Self {
        assert!(!reactors.is_empty(), "reactor pool must not be empty");
        ReactorPool {
            reactors,
            cursor: AtomicUsize::new(0),
        }
    }

    pub fn next_reactor(&self) -> &R {
        let idx = self.cursor.fetch_add(1, Ordering::Relaxed) % self.reactors.len();
        &self.reactors[idx]
    }

    pub fn len(&self) -> usize { self.reactors.len() }

    pub fn is_empty(&self) -> bool { self.reactors.is_empty() }
}

/// Fixed-size set of processor handles selected cyclically.
///
/// The pool never blocks and never fails; the handles are cheap clones (an
/// `Arc` or a channel sender in practice).
pub struct ProcessorPool<P> {
    processors: Vec<P>,
    cursor: AtomicUsize,
}

impl<P: Clone> ProcessorPool<P> {
    /// # Panics
    ///
    /// Panics if `processors` is empty.
    pub fn new(processors: Vec<P>) -> Self {
        assert!(!processors.is_empty(), "processor pool must not be empty");
        ProcessorPool {
            processors,
            cursor: AtomicUsize::new(0),
        }
    }

    pub fn next_processor(&self) -> P {
        let idx = self.cursor.fetch_add(1, Ordering::Relaxed) % self.processors.len();
        self.processors[idx].clone()
    }

    pub fn len(&self) -> usize { self.processors.len() }

    pub fn is_empty(&self) -> bool { self.processors.is_empty() }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    #[test]
    fn reactors_cycle_in_registration_order() {
        let pool = ReactorPool::new(vec!['a', 'b', 'c']);
        let picks = (0..9).map(|_| *pool.next_reactor()).collect::<String>();
        assert_eq!(picks, "abcabcabc");
    }

    #[test]
    fn reactor_distribution_is_exact_modulo() {
        let pool = ReactorPool::new(vec![0usize, 1, 2, 3]);
        let mut counts = HashMap::new();
        for _ in 0..100 {
            *counts.entry(*pool.next_reactor()).or_insert(0u32) += 1;
        }
        assert_eq!(counts[&0], 25);
        assert_eq!(counts[&1], 25);
        assert_eq!(counts[&2], 25);
        assert_eq!(counts[&3], 25);
    }

    #[test]
    fn processors_cycle_in_registration_order() {
        let pool = ProcessorPool::new(vec![10u32, 20, 30]);
        let picks = (0..6).map(|_| pool.next_processor()).collect::<Vec<_>>();
        assert_eq!(picks, vec![10, 20, 30, 10, 20, 30]);
    }

    #[test]
    #[should_panic(expected = "must not be empty")]
    fn empty_reactor_pool_is_rejected() { ReactorPool::<()>::new(vec![]); }
}
