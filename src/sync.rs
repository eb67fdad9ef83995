//! # Hybrid Section Lock
//!
//! This module provides [`HybridLock`], a mutual-exclusion primitive that
//! multiplexes up to 32 independently addressable critical sections over a
//! single machine word and a single shared wait object.
//!
//! ## Design
//!
//! Each section is one bit of an `AtomicU32`. `enter` acquires a section by
//! atomically OR-ing its bit and inspecting the previous value: a 0 -> 1
//! transition means ownership. A contended caller busy-spins a bounded number
//! of times before parking on the one condvar shared by all 32 sections.
//!
//! Sharing one wait object avoids allocating a wait primitive per section, at
//! the cost of spurious wake-ups across unrelated sections. Correctness is
//! preserved because every waiter re-checks only its own bit after waking.
//! This is intended for low-contention, short critical sections.
//!
//! No timeouts are provided; a caller that never exits a section deadlocks
//! all other users of that section.

use std::fmt;
use std::hint;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Condvar, Mutex};

use thiserror::Error;

/// Number of independently addressable critical sections per lock.
pub const SECTION_COUNT: usize = 32;

/// Default number of busy-spin attempts before parking.
pub const DEFAULT_SPIN_LIMIT: u32 = 100;

/// Error type for section lock operations.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum LockError {
    /// The section index was outside `0..SECTION_COUNT`.
    #[error("section index out of range: {index} (valid: 0..{SECTION_COUNT})")]
    IndexOutOfRange {
        /// The offending index.
        index: usize,
    },
}

/// A spin-then-park lock over 32 independent critical sections.
///
/// All sections share one state word and one wait object. Acquiring section
/// `i` never blocks holders or acquirers of section `j != i`, although a
/// parked waiter may be woken spuriously when any section is released.
pub struct HybridLock {
    /// Bit `i` is set iff section `i` is held.
    bits: AtomicU32,
    /// The single wait object shared by all sections.
    gate: Mutex<()>,
    /// Signalled by every `exit`, regardless of section.
    wakeup: Condvar,
    /// Busy-spin attempts before parking.
    spin_limit: u32,
}

impl HybridLock {
    /// Creates a new lock with all sections free.
    pub fn new() -> Self {
        Self::with_spin_limit(DEFAULT_SPIN_LIMIT)
    }

    /// Creates a new lock with a custom spin limit.
    ///
    /// A limit of 0 parks immediately on contention.
    pub fn with_spin_limit(spin_limit: u32) -> Self {
        Self {
            bits: AtomicU32::new(0),
            gate: Mutex::new(()),
            wakeup: Condvar::new(),
            spin_limit,
        }
    }

    /// Acquires exclusive ownership of `index`, blocking until available.
    pub fn enter(&self, index: usize) -> Result<(), LockError> {
        let bit = Self::section_bit(index)?;
        let mut spins = 0u32;
        loop {
            // Previous bit 0 means this call made the free -> held transition.
            if self.bits.fetch_or(bit, Ordering::AcqRel) & bit == 0 {
                return Ok(());
            }
            if spins < self.spin_limit {
                spins += 1;
                hint::spin_loop();
                continue;
            }
            // Park on the shared wait object. The bit is re-checked under the
            // gate so a release cannot slip between the check and the wait.
            let guard = self.gate.lock().unwrap();
            if self.bits.load(Ordering::Acquire) & bit != 0 {
                let _guard = self.wakeup.wait(guard).unwrap();
            }
            spins = 0;
        }
    }

    /// Releases ownership of `index` and wakes all parked waiters.
    ///
    /// Waiters of unrelated sections treat the wake-up as spurious and park
    /// again after re-checking their own bit.
    pub fn exit(&self, index: usize) -> Result<(), LockError> {
        let bit = Self::section_bit(index)?;
        let _guard = self.gate.lock().unwrap();
        self.bits.fetch_and(!bit, Ordering::AcqRel);
        self.wakeup.notify_all();
        Ok(())
    }

    /// Acquires `index` and returns an RAII guard that exits it on drop.
    pub fn section(&self, index: usize) -> Result<SectionGuard<'_>, LockError> {
        self.enter(index)?;
        Ok(SectionGuard { lock: self, index })
    }

    /// The number of busy-spin attempts this lock makes before parking.
    pub fn spin_limit(&self) -> u32 {
        self.spin_limit
    }

    /// Returns whether section `index` is currently held.
    pub fn is_held(&self, index: usize) -> Result<bool, LockError> {
        let bit = Self::section_bit(index)?;
        Ok(self.bits.load(Ordering::Acquire) & bit != 0)
    }

    /// Validate an index and convert it to its state-word bit.
    fn section_bit(index: usize) -> Result<u32, LockError> {
        if index >= SECTION_COUNT {
            return Err(LockError::IndexOutOfRange { index });
        }
        Ok(1u32 << index)
    }
}

impl Default for HybridLock {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for HybridLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HybridLock")
            .field("bits", &format_args!("{:#034b}", self.bits.load(Ordering::Relaxed)))
            .field("spin_limit", &self.spin_limit)
            .finish()
    }
}

/// RAII guard for a held critical section.
///
/// Releases the section when dropped.
pub struct SectionGuard<'a> {
    lock: &'a HybridLock,
    index: usize,
}

impl SectionGuard<'_> {
    /// The section index this guard holds.
    pub fn index(&self) -> usize {
        self.index
    }
}

impl Drop for SectionGuard<'_> {
    fn drop(&mut self) {
        // The index was validated on entry.
        let _ = self.lock.exit(self.index);
    }
}

impl fmt::Debug for SectionGuard<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SectionGuard")
            .field("index", &self.index)
            .finish()
    }
}

// ============================================================================
// Tests
// ============================================================================
