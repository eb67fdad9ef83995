//! # Native Runtime Interface
//!
//! This module defines the narrow surface the adapter consumes from the
//! native library: periodic timer registration, per-thread storage, and a
//! last-error string. The surface is a trait so tests can substitute mock
//! runtimes, and so the crate does not link the real binding layer.
//!
//! [`HostRuntime`] is the in-process implementation: timer callbacks are
//! delivered from one named dispatcher thread the runtime manages itself,
//! concurrently with arbitrary other code and potentially before the
//! registration call has returned. Per-thread storage rows live in genuine
//! thread-local state whose owner runs destructor trampolines when the OS
//! thread exits.
//!
//! Callbacks cross this boundary only as fixed `extern "C"` trampoline
//! function pointers paired with an opaque [`RawToken`]; the native side
//! never holds a managed reference.

use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use tracing::trace;

use crate::config::DEFAULT_TIMER_THREAD;
use crate::handle::RawToken;

/// Trampoline signature for millisecond timers.
///
/// Receives the current interval and returns the next one; 0 deregisters the
/// timer on the native side.
pub type TimerTrampolineMs = extern "C" fn(token: RawToken, interval_ms: u32) -> u32;

/// Trampoline signature for nanosecond timers.
pub type TimerTrampolineNs = extern "C" fn(token: RawToken, interval_ns: u64) -> u64;

/// Trampoline invoked when the OS thread owning a storage row exits.
pub type TlsDestructor = extern "C" fn(token: RawToken);

/// Identifier of a native timer. `0` means "no timer" and signals
/// registration failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerId(u64);

impl TimerId {
    /// The sentinel "no timer registered" id.
    pub const NONE: TimerId = TimerId(0);

    /// Builds an id from its integer form.
    pub fn from_u64(raw: u64) -> Self {
        Self(raw)
    }

    /// The id as a plain integer.
    pub fn as_u64(self) -> u64 {
        self.0
    }

    /// Returns whether this is the sentinel id.
    pub fn is_none(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for TimerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The native entry points this adapter layer consumes.
pub trait NativeRuntime: Send + Sync + 'static {
    /// Registers a periodic millisecond timer.
    ///
    /// Returns [`TimerId::NONE`] on failure. The trampoline may fire on a
    /// runtime-managed thread before this call returns.
    fn register_timer_ms(
        &self,
        interval_ms: u32,
        trampoline: TimerTrampolineMs,
        token: RawToken,
    ) -> TimerId;

    /// Registers a periodic nanosecond timer. See [`register_timer_ms`].
    ///
    /// [`register_timer_ms`]: NativeRuntime::register_timer_ms
    fn register_timer_ns(
        &self,
        interval_ns: u64,
        trampoline: TimerTrampolineNs,
        token: RawToken,
    ) -> TimerId;

    /// Cancels a timer, returning whether it was still registered.
    fn cancel_timer(&self, id: TimerId) -> bool;

    /// Reads the calling thread's storage row for `slot`.
    ///
    /// A slot word of 0 is atomically assigned a fresh id exactly once,
    /// shared thereafter by all threads referencing the same word. Returns
    /// [`RawToken::NULL`] when the calling thread has no row.
    fn tls_get(&self, slot: &AtomicU32) -> RawToken;

    /// Stores `token` in the calling thread's row for `slot`, registering
    /// `destructor` to run when this OS thread exits. Returns success.
    fn tls_set(&self, slot: &AtomicU32, token: RawToken, destructor: TlsDestructor) -> bool;

    /// Text of the most recent failure reported by this runtime.
    fn last_error(&self) -> String;
}

// ============================================================================
// Host timer dispatcher
// ============================================================================

/// Rescheduling state for one registered timer.
#[derive(Clone, Copy)]
enum Schedule {
    Ms {
        interval: u32,
        trampoline: TimerTrampolineMs,
    },
    Ns {
        interval: u64,
        trampoline: TimerTrampolineNs,
    },
}

impl Schedule {
    fn period(&self) -> Duration {
        match self {
            Schedule::Ms { interval, .. } => Duration::from_millis(u64::from(*interval)),
            Schedule::Ns { interval, .. } => Duration::from_nanos(*interval),
        }
    }

    /// Invoke the trampoline; the result is the next interval in this
    /// schedule's native unit, 0 to deregister.
    fn fire(&self, token: RawToken) -> u64 {
        match self {
            Schedule::Ms {
                interval,
                trampoline,
            } => u64::from(trampoline(token, *interval)),
            Schedule::Ns {
                interval,
                trampoline,
            } => trampoline(token, *interval),
        }
    }

    fn apply_next(&mut self, next: u64) {
        match self {
            Schedule::Ms { interval, .. } => *interval = next as u32,
            Schedule::Ns { interval, .. } => *interval = next,
        }
    }
}

struct TimerEntry {
    due: Instant,
    schedule: Schedule,
    token: RawToken,
}

#[derive(Default)]
struct TimerTable {
    entries: Mutex<HashMap<u64, TimerEntry>>,
}

/// In-process implementation of [`NativeRuntime`].
pub struct HostRuntime {
    timers: Arc<TimerTable>,
    wake_tx: Sender<()>,
    next_timer_id: AtomicU64,
    last_error: Mutex<String>,
}

impl HostRuntime {
    /// Creates a host runtime with the default dispatcher thread name.
    pub fn new() -> Self {
        Self::with_thread_name(DEFAULT_TIMER_THREAD)
    }

    /// Creates a host runtime whose dispatcher thread carries `name`.
    pub fn with_thread_name(name: &str) -> Self {
        let timers = Arc::new(TimerTable::default());
        let (wake_tx, wake_rx) = unbounded();

        let dispatcher_timers = timers.clone();
        thread::Builder::new()
            .name(name.to_string())
            .spawn(move || dispatch_loop(dispatcher_timers, wake_rx))
            .expect("failed to spawn timer dispatcher thread");

        Self {
            timers,
            wake_tx,
            next_timer_id: AtomicU64::new(1),
            last_error: Mutex::new(String::new()),
        }
    }

    fn insert(&self, schedule: Schedule, token: RawToken) -> TimerId {
        let id = self.next_timer_id.fetch_add(1, Ordering::Relaxed);
        let entry = TimerEntry {
            due: Instant::now() + schedule.period(),
            schedule,
            token,
        };
        self.timers.entries.lock().insert(id, entry);
        // Wake the dispatcher so it picks up the new deadline; if it already
        // exited, the timer simply never fires.
        let _ = self.wake_tx.send(());
        trace!(timer = id, token = %token, "timer registered");
        TimerId(id)
    }

    fn fail(&self, message: &str) -> TimerId {
        *self.last_error.lock() = message.to_string();
        TimerId::NONE
    }
}

impl Default for HostRuntime {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for HostRuntime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostRuntime")
            .field("timers", &self.timers.entries.lock().len())
            .finish()
    }
}

impl NativeRuntime for HostRuntime {
    fn register_timer_ms(
        &self,
        interval_ms: u32,
        trampoline: TimerTrampolineMs,
        token: RawToken,
    ) -> TimerId {
        if interval_ms == 0 {
            return self.fail("timer interval must be nonzero");
        }
        self.insert(
            Schedule::Ms {
                interval: interval_ms,
                trampoline,
            },
            token,
        )
    }

    fn register_timer_ns(
        &self,
        interval_ns: u64,
        trampoline: TimerTrampolineNs,
        token: RawToken,
    ) -> TimerId {
        if interval_ns == 0 {
            return self.fail("timer interval must be nonzero");
        }
        self.insert(
            Schedule::Ns {
                interval: interval_ns,
                trampoline,
            },
            token,
        )
    }

    fn cancel_timer(&self, id: TimerId) -> bool {
        let removed = self.timers.entries.lock().remove(&id.as_u64()).is_some();
        if removed {
            trace!(timer = id.as_u64(), "timer cancelled");
        } else {
            *self.last_error.lock() = format!("no such timer: {}", id.as_u64());
        }
        removed
    }

    fn tls_get(&self, slot: &AtomicU32) -> RawToken {
        let id = resolve_slot_id(slot);
        THREAD_ROWS.with(|rows| {
            rows.borrow()
                .rows
                .get(&id)
                .map(|row| row.token)
                .unwrap_or(RawToken::NULL)
        })
    }

    fn tls_set(&self, slot: &AtomicU32, token: RawToken, destructor: TlsDestructor) -> bool {
        let id = resolve_slot_id(slot);
        THREAD_ROWS.with(|rows| {
            rows.borrow_mut().rows.insert(id, TlsRow { token, destructor });
        });
        true
    }

    fn last_error(&self) -> String {
        self.last_error.lock().clone()
    }
}

/// The dispatcher loop: park until the next deadline or a wake, then fire
/// everything due. Trampolines are invoked with the schedule lock released
/// so a cancellation issued from inside a callback cannot deadlock.
fn dispatch_loop(timers: Arc<TimerTable>, wake_rx: Receiver<()>) {
    loop {
        let now = Instant::now();
        let next_due = timers.entries.lock().values().map(|e| e.due).min();

        match next_due {
            None => match wake_rx.recv() {
                Ok(()) => continue,
                Err(_) => break,
            },
            Some(due) if due > now => match wake_rx.recv_timeout(due - now) {
                Ok(()) => continue,
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            },
            Some(_) => {}
        }

        let now = Instant::now();
        let due: Vec<(u64, Schedule, RawToken)> = timers
            .entries
            .lock()
            .iter()
            .filter(|(_, entry)| entry.due <= now)
            .map(|(&id, entry)| (id, entry.schedule, entry.token))
            .collect();

        for (id, schedule, token) in due {
            let next = schedule.fire(token);
            let mut entries = timers.entries.lock();
            // A cancel racing with this invocation may already have removed
            // the entry; both sides tolerate the other winning.
            if let Some(entry) = entries.get_mut(&id) {
                if next == 0 {
                    entries.remove(&id);
                    trace!(timer = id, "timer deregistered by callback");
                } else {
                    entry.schedule.apply_next(next);
                    entry.due = Instant::now() + entry.schedule.period();
                }
            }
        }
    }
    trace!("timer dispatcher exiting");
}

// ============================================================================
// Host per-thread storage
// ============================================================================

/// One stored row: the pinned token plus the destructor to run at thread exit.
struct TlsRow {
    token: RawToken,
    destructor: TlsDestructor,
}

/// All rows owned by one OS thread, keyed by slot id.
#[derive(Default)]
struct ThreadRows {
    rows: HashMap<u32, TlsRow>,
}

impl Drop for ThreadRows {
    fn drop(&mut self) {
        // The owning OS thread is exiting; run every registered destructor.
        for (_, row) in self.rows.drain() {
            (row.destructor)(row.token);
        }
    }
}

thread_local! {
    static THREAD_ROWS: RefCell<ThreadRows> = RefCell::new(ThreadRows::default());
}

/// Resolve a slot word to its id, performing the one-time allocation.
///
/// The first caller to reach this with a 0 word installs a fresh id via
/// compare-exchange; a racing loser adopts the winner's id.
fn resolve_slot_id(slot: &AtomicU32) -> u32 {
    static NEXT_SLOT_ID: AtomicU32 = AtomicU32::new(1);

    let current = slot.load(Ordering::Acquire);
    if current != 0 {
        return current;
    }
    let fresh = NEXT_SLOT_ID.fetch_add(1, Ordering::Relaxed);
    match slot.compare_exchange(0, fresh, Ordering::AcqRel, Ordering::Acquire) {
        Ok(_) => fresh,
        Err(existing) => existing,
    }
}

// ============================================================================
// Tests
// ============================================================================
