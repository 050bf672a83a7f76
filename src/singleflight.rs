//! In-flight call coalescing.
//!
//! At most one computation runs per key. Callers arriving while it is pending
//! block until it finishes and receive a clone of the same result. The key is
//! released when the leading call returns, fails or unwinds, so the next call
//! after completion always starts fresh.

use crate::storage::lock;
use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex};

enum Slot<T> {
    Pending,
    Done(T),
    /// The leader unwound before producing a value
    Abandoned,
}

struct Call<T> {
    slot: Mutex<Slot<T>>,
    ready: Condvar,
}

impl<T: Clone> Call<T> {
    fn new() -> Self {
        Self {
            slot: Mutex::new(Slot::Pending),
            ready: Condvar::new(),
        }
    }

    /// Block until the leader settles. `None` means it was abandoned.
    fn wait(&self) -> Option<T> {
        let mut slot = lock(&self.slot);
        loop {
            match &*slot {
                Slot::Pending => {
                    slot = self
                        .ready
                        .wait(slot)
                        .unwrap_or_else(|poisoned| poisoned.into_inner());
                }
                Slot::Done(value) => return Some(value.clone()),
                Slot::Abandoned => return None,
            }
        }
    }

    fn settle(&self, next: Slot<T>) {
        *lock(&self.slot) = next;
        self.ready.notify_all();
    }
}

/// Map from key to the shared slot of the call currently running for it
pub struct SingleFlight<T> {
    calls: Mutex<HashMap<String, Arc<Call<T>>>>,
}

impl<T> Default for SingleFlight<T> {
    fn default() -> Self {
        Self {
            calls: Mutex::new(HashMap::new()),
        }
    }
}

/// Removes the key and wakes waiters when the leader leaves `run`, on every path
struct Release<'a, T: Clone> {
    flight: &'a SingleFlight<T>,
    key: &'a str,
    call: Arc<Call<T>>,
    value: Option<T>,
}

impl<T: Clone> Drop for Release<'_, T> {
    fn drop(&mut self) {
        lock(&self.flight.calls).remove(self.key);
        match self.value.take() {
            Some(value) => self.call.settle(Slot::Done(value)),
            None => self.call.settle(Slot::Abandoned),
        }
    }
}

impl<T: Clone> SingleFlight<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `f` for `key`, or join the call already in flight for it
    pub fn run<F>(&self, key: &str, f: F) -> T
    where
        F: FnOnce() -> T,
    {
        let (call, leader) = {
            let mut calls = lock(&self.calls);
            match calls.get(key) {
                Some(existing) => (Arc::clone(existing), false),
                None => {
                    let call = Arc::new(Call::new());
                    calls.insert(key.to_string(), Arc::clone(&call));
                    (call, true)
                }
            }
        };

        if !leader {
            tracing::debug!(key, "joining in-flight call");
            return match call.wait() {
                Some(value) => value,
                // Leader panicked; take over with our own closure
                None => self.run(key, f),
            };
        }

        let mut release = Release {
            flight: self,
            key,
            call,
            value: None,
        };
        let value = f();
        release.value = Some(value.clone());
        drop(release);
        value
    }

    /// Whether a call is currently pending for `key`
    pub fn in_flight(&self, key: &str) -> bool {
        lock(&self.calls).contains_key(key)
    }

    /// Number of callers (leader included) holding the pending call for `key`
    pub fn holders(&self, key: &str) -> usize {
        lock(&self.calls)
            .get(key)
            // One reference belongs to the map itself
            .map(|call| Arc::strong_count(call).saturating_sub(1))
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Barrier;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_concurrent_callers_share_one_call() {
        let flight = Arc::new(SingleFlight::<u32>::new());
        let calls = Arc::new(AtomicUsize::new(0));
        let barrier = Arc::new(Barrier::new(4));

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let flight = Arc::clone(&flight);
                let calls = Arc::clone(&calls);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    flight.run("analytics", || {
                        calls.fetch_add(1, Ordering::SeqCst);
                        thread::sleep(Duration::from_millis(150));
                        42
                    })
                })
            })
            .collect();

        let results: Vec<u32> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert_eq!(results, vec![42, 42, 42, 42]);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(!flight.in_flight("analytics"));
    }

    #[test]
    fn test_key_released_after_failure() {
        let flight = SingleFlight::<Result<u32, String>>::new();
        let first = flight.run("k", || Err("boom".to_string()));
        assert_eq!(first, Err("boom".to_string()));
        assert!(!flight.in_flight("k"));

        let second = flight.run("k", || Ok(7));
        assert_eq!(second, Ok(7));
    }

    #[test]
    fn test_distinct_keys_do_not_coalesce() {
        let flight = SingleFlight::<u32>::new();
        let calls = AtomicUsize::new(0);
        flight.run("a", || calls.fetch_add(1, Ordering::SeqCst) as u32);
        flight.run("b", || calls.fetch_add(1, Ordering::SeqCst) as u32);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_key_released_after_panic() {
        let flight = Arc::new(SingleFlight::<u32>::new());
        let panicking = Arc::clone(&flight);
        let result = thread::spawn(move || panicking.run("k", || panic!("leader died"))).join();
        assert!(result.is_err());
        assert!(!flight.in_flight("k"));
        assert_eq!(flight.run("k", || 5), 5);
    }

    #[test]
    fn test_holders_counts_waiters() {
        let flight = Arc::new(SingleFlight::<u32>::new());
        let started = Arc::new(Barrier::new(2));

        let leader_flight = Arc::clone(&flight);
        let leader_started = Arc::clone(&started);
        let leader = thread::spawn(move || {
            leader_flight.run("k", || {
                leader_started.wait();
                thread::sleep(Duration::from_millis(200));
                1
            })
        });

        started.wait();
        assert_eq!(flight.holders("k"), 1);

        let waiter_flight = Arc::clone(&flight);
        let waiter = thread::spawn(move || waiter_flight.run("k", || 2));

        assert_eq!(leader.join().unwrap(), 1);
        // The waiter either joined the leader or ran after release
        let waited = waiter.join().unwrap();
        assert!(waited == 1 || waited == 2);
        assert_eq!(flight.holders("k"), 0);
    }
}
