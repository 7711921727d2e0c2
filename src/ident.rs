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

use std::sync::Mutex;

/// Wrap ceiling for frontend (accepted) connection identifiers.
pub const FRONTEND_ID_CEILING: u64 = u32::MAX as u64;

/// Wrap ceiling for backend (outbound) connection identifiers.
pub const BACKEND_ID_CEILING: u64 = i64::MAX as u64;

/// Monotonic connection identifier generator with a wrap ceiling.
///
/// Returned values are always in `(0, ceiling]` and strictly increase until
/// the ceiling is reached, after which the sequence restarts from 1. Ids are
/// therefore not globally unique across a wrap boundary; within one wrap
/// period each id is handed out exactly once.
///
/// Safe to call from any number of threads; in practice each generator is
/// owned by a single event loop.
#[derive(Debug)]
pub struct IdGenerator {
    ceiling: u64,
    counter: Mutex<u64>,
}

impl IdGenerator {
    /// Generator for frontend connection ids, wrapping at [`FRONTEND_ID_CEILING`].
    pub const fn frontend() -> Self { Self::with_ceiling(FRONTEND_ID_CEILING) }

    /// Generator for backend connection ids, wrapping at [`BACKEND_ID_CEILING`].
    pub const fn backend() -> Self { Self::with_ceiling(BACKEND_ID_CEILING) }

    /// Generator wrapping at an arbitrary non-zero ceiling.
    pub const fn with_ceiling(ceiling: u64) -> Self {
        IdGenerator {
            ceiling,
            counter: Mutex::new(0),
        }
    }

    /// Returns the next identifier, resetting to 1 past the ceiling.
    pub fn next_id(&self) -> u64 {
        let mut counter = self.counter.lock().expect("id generator lock poisoned");
        if *counter >= self.ceiling {
            *counter = 0;
        }
        *counter += 1;
        *counter
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::Arc;
    use std::thread;

    use super::*;

    #[test]
    fn ids_start_at_one_and_increase() {
        let ids = IdGenerator::frontend();
        assert_eq!(ids.next_id(), 1);
        assert_eq!(ids.next_id(), 2);
        assert_eq!(ids.next_id(), 3);
    }

    #[test]
    fn wraps_to_one_at_ceiling() {
        let ids = IdGenerator::with_ceiling(5);
        let first_round = (0..5).map(|_| ids.next_id()).collect::<Vec<_>>();
        assert_eq!(first_round, vec![1, 2, 3, 4, 5]);
        // One call past the ceiling restarts the sequence, skipping 0.
        assert_eq!(ids.next_id(), 1);
    }

    #[test]
    fn concurrent_ids_are_distinct() {
        let ids = Arc::new(IdGenerator::backend());
        let mut handles = Vec::new();
        for _ in 0..4 {
            let ids = ids.clone();
            handles.push(thread::spawn(move || {
                (0..1000).map(|_| ids.next_id()).collect::<Vec<_>>()
            }));
        }
        let mut seen = HashSet::new();
        for handle in handles {
            for id in handle.join().unwrap() {
                assert!(seen.insert(id), "id {id} handed out twice");
            }
        }
        assert_eq!(seen.len(), 4000);
    }
}
