//! Property-based tests for the tether runtime.
//!
//! Uses proptest to generate random inputs and verify invariants hold.

use proptest::prelude::*;
use tether_runtime::{handle_table, ConcurrentPool, HybridLock, SECTION_COUNT};

/// Strategy for valid section indices.
fn valid_section() -> impl Strategy<Value = usize> {
    0..SECTION_COUNT
}

proptest! {
    /// Every in-range section can be entered and exited.
    #[test]
    fn lock_accepts_valid_sections(index in valid_section()) {
        let lock = HybridLock::new();
        prop_assert!(lock.enter(index).is_ok());
        prop_assert!(lock.is_held(index).unwrap());
        prop_assert!(lock.exit(index).is_ok());
        prop_assert!(!lock.is_held(index).unwrap());
    }

    /// Every out-of-range section is rejected by every operation.
    #[test]
    fn lock_rejects_invalid_sections(index in SECTION_COUNT..usize::MAX) {
        let lock = HybridLock::new();
        prop_assert!(lock.enter(index).is_err());
        prop_assert!(lock.exit(index).is_err());
        prop_assert!(lock.is_held(index).is_err());
        prop_assert!(lock.section(index).is_err());
    }

    /// Holding one section never makes another section appear held.
    #[test]
    fn lock_sections_are_independent(held in valid_section(), probed in valid_section()) {
        let lock = HybridLock::new();
        let guard = lock.section(held).unwrap();
        prop_assert_eq!(lock.is_held(probed).unwrap(), probed == held);
        drop(guard);
        prop_assert!(!lock.is_held(held).unwrap());
    }

    /// The pool never allocates more wrappers than the peak number of values
    /// simultaneously checked out, plus the unmatched puts.
    #[test]
    fn pool_allocation_bounded_by_peak(ops in prop::collection::vec(any::<bool>(), 1..200)) {
        let pool: ConcurrentPool<u64> = ConcurrentPool::new();
        let mut outstanding = Vec::new();
        let mut peak = 0usize;

        for take in ops {
            if take {
                outstanding.push(pool.get(|| 0));
                peak = peak.max(outstanding.len());
            } else if let Some(value) = outstanding.pop() {
                pool.put(value);
            }
        }

        prop_assert!(pool.node_count() <= peak);
        prop_assert_eq!(
            pool.available_len() + outstanding.len(),
            pool.node_count()
        );
    }

    /// Returned values come back out before the factory runs again.
    #[test]
    fn pool_recycles_before_allocating(rounds in 1usize..50) {
        let pool: ConcurrentPool<String> = ConcurrentPool::new();
        let mut factory_calls = 0usize;

        for _ in 0..rounds {
            let value = pool.get(|| {
                factory_calls += 1;
                String::from("fresh")
            });
            pool.put(value);
        }

        // Strict serial get/put needs exactly one allocation.
        prop_assert_eq!(factory_calls, 1);
        prop_assert_eq!(pool.node_count(), 1);
    }

    /// Pinned values resolve back to themselves and release exactly once.
    #[test]
    fn handle_pin_resolve_release(payload in any::<u64>()) {
        let table = handle_table();
        let handle = table.pin(std::sync::Arc::new(payload));
        let token = handle.token();

        prop_assert!(!token.is_null());
        let resolved = table.resolve::<u64>(token);
        prop_assert_eq!(resolved.as_deref(), Some(&payload));

        prop_assert!(handle.release());
        prop_assert!(table.resolve::<u64>(token).is_none());
        prop_assert!(!table.release_raw(token));
    }

    /// Tokens are never reissued while the earlier pin is alive.
    #[test]
    fn handle_tokens_are_distinct(count in 1usize..50) {
        let table = handle_table();
        let handles: Vec<_> = (0..count)
            .map(|i| table.pin(std::sync::Arc::new(i)))
            .collect();

        let mut tokens: Vec<u64> = handles.iter().map(|h| h.token().as_u64()).collect();
        tokens.sort_unstable();
        tokens.dedup();
        prop_assert_eq!(tokens.len(), count);

        for handle in handles {
            handle.release();
        }
    }
}

#[cfg(test)]
mod stress_tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::thread;

    use tether_runtime::{ConcurrentPool, HybridLock, SECTION_COUNT};

    /// Stress test: every section exclusion holds under heavy contention.
    #[test]
    fn stress_all_sections_concurrently() {
        const NUM_THREADS: usize = 8;
        const ITERATIONS: usize = 2_000;

        let lock = Arc::new(HybridLock::new());
        let counters: Arc<Vec<AtomicUsize>> =
            Arc::new((0..SECTION_COUNT).map(|_| AtomicUsize::new(0)).collect());
        let overlaps = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..NUM_THREADS)
            .map(|t| {
                let lock = Arc::clone(&lock);
                let counters = Arc::clone(&counters);
                let overlaps = Arc::clone(&overlaps);

                thread::spawn(move || {
                    for i in 0..ITERATIONS {
                        let section = (t + i) % SECTION_COUNT;
                        let _guard = lock.section(section).unwrap();
                        // Inside the section we are the only writer, so the
                        // counter must read back even.
                        if counters[section].fetch_add(1, Ordering::SeqCst) % 2 != 0 {
                            overlaps.fetch_add(1, Ordering::SeqCst);
                        }
                        counters[section].fetch_add(1, Ordering::SeqCst);
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(overlaps.load(Ordering::SeqCst), 0);
        for counter in counters.iter() {
            assert_eq!(counter.load(Ordering::SeqCst) % 2, 0);
        }
    }

    /// Stress test: concurrent pool churn never loses or duplicates wrappers.
    #[test]
    fn stress_pool_churn() {
        const NUM_THREADS: usize = 8;
        const ITERATIONS: usize = 5_000;

        let pool: Arc<ConcurrentPool<Vec<u8>>> = Arc::new(ConcurrentPool::new());

        let handles: Vec<_> = (0..NUM_THREADS)
            .map(|_| {
                let pool = Arc::clone(&pool);
                thread::spawn(move || {
                    for _ in 0..ITERATIONS {
                        let value = pool.get(|| Vec::with_capacity(16));
                        pool.put(value);
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        // At most one value per thread is out at any instant.
        assert!(pool.node_count() <= NUM_THREADS);
        assert_eq!(
            pool.available_len() + pool.spare_len(),
            pool.node_count()
        );
    }
}
