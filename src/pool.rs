//! # Concurrent Free-List Pool
//!
//! This module provides [`ConcurrentPool`], a free-list object pool that
//! amortizes allocation for frequently recycled helper objects.
//!
//! ## Design
//!
//! The pool keeps two disjoint singly-linked stacks of node wrappers:
//!
//! - *available*: nodes carrying a reusable value
//! - *spare shells*: empty wrappers whose value has been handed out, kept
//!   only so a later [`put`](ConcurrentPool::put) does not allocate a new
//!   wrapper
//!
//! Every node is reachable from exactly one of the two stacks at any time.
//! All operations run under section 0 of an owned [`HybridLock`]. The total
//! number of wrappers ever allocated equals the high-water mark of gets
//! without a matching put.
//!
//! The pool does not verify that a value passed to `put` came from a prior
//! `get`, nor that it was not already returned once. Callers are fully
//! trusted; this is allocation avoidance, not checkout tracking.

use std::cell::UnsafeCell;
use std::fmt;

use crate::sync::HybridLock;

/// The lock section guarding all pool state.
const POOL_SECTION: usize = 0;

/// One wrapper in either stack.
struct Node<T> {
    /// `Some` while the node sits on the available stack.
    value: Option<T>,
    next: Option<Box<Node<T>>>,
}

impl<T> Node<T> {
    fn empty() -> Box<Self> {
        Box::new(Self {
            value: None,
            next: None,
        })
    }
}

/// Mutable pool state, serialized by the owning lock.
struct PoolState<T> {
    available: Option<Box<Node<T>>>,
    spare: Option<Box<Node<T>>>,
    available_len: usize,
    spare_len: usize,
    /// Historical count of wrapper allocations.
    nodes_allocated: usize,
}

/// A lock-guarded free-list pool of `T`.
pub struct ConcurrentPool<T> {
    lock: HybridLock,
    state: UnsafeCell<PoolState<T>>,
}

// Safety: all access to `state` happens while holding POOL_SECTION of the
// owned lock, which admits exactly one owner at a time.
unsafe impl<T: Send> Send for ConcurrentPool<T> {}
unsafe impl<T: Send> Sync for ConcurrentPool<T> {}

impl<T> ConcurrentPool<T> {
    /// Creates an empty pool.
    pub fn new() -> Self {
        Self::with_lock(HybridLock::new())
    }

    /// Creates an empty pool whose lock spins `spin_limit` times before
    /// parking, e.g. from [`RuntimeConfig::spin_limit`].
    ///
    /// [`RuntimeConfig::spin_limit`]: crate::config::RuntimeConfig
    pub fn with_spin_limit(spin_limit: u32) -> Self {
        Self::with_lock(HybridLock::with_spin_limit(spin_limit))
    }

    fn with_lock(lock: HybridLock) -> Self {
        Self {
            lock,
            state: UnsafeCell::new(PoolState {
                available: None,
                spare: None,
                available_len: 0,
                spare_len: 0,
                nodes_allocated: 0,
            }),
        }
    }

    /// Returns a ready-to-use instance, recycling one when available.
    ///
    /// If the available stack is empty, `factory` produces a fresh value.
    /// Either way the emptied wrapper moves to the spare-shell stack, so a
    /// later `put` can reuse it without allocating.
    pub fn get<F>(&self, factory: F) -> T
    where
        F: FnOnce() -> T,
    {
        let _guard = self
            .lock
            .section(POOL_SECTION)
            .expect("pool section index is constant and in range");
        // Safety: POOL_SECTION is held for the whole call.
        let state = unsafe { &mut *self.state.get() };

        let (mut node, value) = match Self::pop(&mut state.available) {
            Some(mut node) => {
                state.available_len -= 1;
                let value = node
                    .value
                    .take()
                    .expect("available nodes always carry a value");
                (node, value)
            }
            None => {
                state.nodes_allocated += 1;
                (Node::empty(), factory())
            }
        };

        node.next = None;
        Self::push(&mut state.spare, node);
        state.spare_len += 1;
        value
    }

    /// Relinquishes an instance back to the pool.
    ///
    /// Reuses a spare shell when one exists, allocating a wrapper only when
    /// the shell stack is empty. Most-recently-returned values are handed out
    /// first; no further fairness is promised.
    pub fn put(&self, value: T) {
        let _guard = self
            .lock
            .section(POOL_SECTION)
            .expect("pool section index is constant and in range");
        // Safety: POOL_SECTION is held for the whole call.
        let state = unsafe { &mut *self.state.get() };

        let mut node = match Self::pop(&mut state.spare) {
            Some(node) => {
                state.spare_len -= 1;
                node
            }
            None => {
                state.nodes_allocated += 1;
                Node::empty()
            }
        };

        node.value = Some(value);
        Self::push(&mut state.available, node);
        state.available_len += 1;
    }

    /// Total wrapper nodes ever allocated by this pool.
    pub fn node_count(&self) -> usize {
        self.read_state(|state| state.nodes_allocated)
    }

    /// Number of values currently available for reuse.
    pub fn available_len(&self) -> usize {
        self.read_state(|state| state.available_len)
    }

    /// Number of empty wrappers currently parked on the shell stack.
    pub fn spare_len(&self) -> usize {
        self.read_state(|state| state.spare_len)
    }

    fn read_state<R>(&self, f: impl FnOnce(&PoolState<T>) -> R) -> R {
        let _guard = self
            .lock
            .section(POOL_SECTION)
            .expect("pool section index is constant and in range");
        // Safety: POOL_SECTION is held for the whole call.
        f(unsafe { &*self.state.get() })
    }

    fn push(stack: &mut Option<Box<Node<T>>>, mut node: Box<Node<T>>) {
        node.next = stack.take();
        *stack = Some(node);
    }

    fn pop(stack: &mut Option<Box<Node<T>>>) -> Option<Box<Node<T>>> {
        let mut node = stack.take()?;
        *stack = node.next.take();
        Some(node)
    }
}

impl<T> Default for ConcurrentPool<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for ConcurrentPool<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConcurrentPool")
            .field("available", &self.available_len())
            .field("spare", &self.spare_len())
            .field("nodes_allocated", &self.node_count())
            .finish()
    }
}

impl<T> Drop for ConcurrentPool<T> {
    fn drop(&mut self) {
        // Unlink iteratively so deep stacks cannot overflow the drop recursion.
        let state = self.state.get_mut();
        for stack in [&mut state.available, &mut state.spare] {
            while let Some(mut node) = stack.take() {
                *stack = node.next.take();
            }
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_get_allocates_when_empty() {
        let pool: ConcurrentPool<String> = ConcurrentPool::new();
        let made = AtomicUsize::new(0);

        for _ in 0..5 {
            let _ = pool.get(|| {
                made.fetch_add(1, Ordering::SeqCst);
                String::from("fresh")
            });
        }

        // No puts: every get hits the factory and leaves a spare shell.
        assert_eq!(made.load(Ordering::SeqCst), 5);
        assert_eq!(pool.node_count(), 5);
        assert_eq!(pool.spare_len(), 5);
        assert_eq!(pool.available_len(), 0);
    }

    #[test]
    fn test_put_then_get_reuses_value() {
        let pool: ConcurrentPool<Vec<u8>> = ConcurrentPool::new();

        let v = pool.get(|| vec![1, 2, 3]);
        pool.put(v);
        assert_eq!(pool.available_len(), 1);

        let reused = pool.get(|| panic!("factory must not run on reuse"));
        assert_eq!(reused, vec![1, 2, 3]);
    }

    #[test]
    fn test_wrapper_high_water_mark() {
        let pool: ConcurrentPool<u32> = ConcurrentPool::new();

        // Two outstanding at peak.
        let a = pool.get(|| 1);
        let b = pool.get(|| 2);
        pool.put(a);
        pool.put(b);

        // Any amount of balanced churn afterwards reuses the same wrappers.
        for _ in 0..100 {
            let v = pool.get(|| unreachable!("pool has values available"));
            pool.put(v);
        }

        assert_eq!(pool.node_count(), 2);
    }

    #[test]
    fn test_with_spin_limit_behaves_identically() {
        // A zero spin limit parks immediately on contention but changes no
        // observable pool behavior.
        let pool: ConcurrentPool<u32> = ConcurrentPool::with_spin_limit(0);
        let v = pool.get(|| 9);
        pool.put(v);
        assert_eq!(pool.get(|| 0), 9);
    }

    #[test]
    fn test_lifo_discipline() {
        let pool: ConcurrentPool<&'static str> = ConcurrentPool::new();
        pool.put("older");
        pool.put("newer");

        assert_eq!(pool.get(|| "fresh"), "newer");
        assert_eq!(pool.get(|| "fresh"), "older");
    }

    #[test]
    fn test_concurrent_churn() {
        let pool: Arc<ConcurrentPool<Box<u64>>> = Arc::new(ConcurrentPool::new());
        let made = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let pool = pool.clone();
                let made = made.clone();
                thread::spawn(move || {
                    for _ in 0..500 {
                        let v = pool.get(|| {
                            made.fetch_add(1, Ordering::SeqCst);
                            Box::new(0u64)
                        });
                        pool.put(v);
                    }
                })
            })
            .collect();

        for h in handles {
            h.join().unwrap();
        }

        // At most one value outstanding per thread at any instant, so neither
        // values nor wrappers can exceed the thread count.
        assert!(made.load(Ordering::SeqCst) <= 8);
        assert!(pool.node_count() <= 8);
        assert_eq!(pool.available_len(), made.load(Ordering::SeqCst));
    }
}
