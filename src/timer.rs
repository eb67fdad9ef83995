//! # Native Callback Timer
//!
//! [`CallbackTimer`] is a periodically rescheduled native timer whose
//! callback is delivered through the cross-boundary handle table. The
//! callback receives the current interval and returns the next one; 0 asks
//! the native runtime to stop firing.
//!
//! ## Lifetime
//!
//! Construction pins a wrapper (weak back-reference to the timer plus the
//! user callback), registers the native timer with a fixed `extern "C"`
//! trampoline and the wrapper's token, then registers with the owning
//! context's [`ResourceRegistry`]. The timer keeps only weak references
//! toward its owner, so holding a timer never keeps the context alive.
//!
//! Teardown is reached from two paths — explicit/`Drop` self-disposal and
//! the owner's bulk sweep — that converge on one idempotent core gated by
//! the shared dispose lock. After either path the native id reads as the
//! sentinel [`TimerId::NONE`] and further calls are no-ops. A callback
//! returning 0 also runs the self-disposal path, so the pinned wrapper and
//! registry entry do not outlive the native timer.
//!
//! Callback invocations are not serialized against each other: the native
//! runtime may fire again before a slow callback returns, and may fire
//! before construction itself returns for very short intervals.

use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use thiserror::Error;
use tracing::{debug, warn};

use crate::context::RuntimeContext;
use crate::handle::{handle_table, PinnedHandle, RawToken};
use crate::native::{NativeRuntime, TimerId};
use crate::registry::{Disposable, ResourceId, ResourceRegistry};
use crate::sync::HybridLock;

/// Error type for timer construction.
#[derive(Debug, Error)]
pub enum TimerError {
    /// The rescheduling interval was zero.
    #[error("timer interval must be nonzero")]
    ZeroInterval,

    /// The native runtime refused the registration.
    #[error("native timer registration failed: {message}")]
    Native {
        /// Error text reported by the native runtime.
        message: String,
    },
}

/// Rescheduling interval, in one of the two mutually exclusive native units.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerInterval {
    /// Millisecond-granularity scheduling.
    Millis(u32),
    /// Nanosecond-granularity scheduling.
    Nanos(u64),
}

impl TimerInterval {
    /// Returns whether the interval is zero in its unit.
    pub fn is_zero(self) -> bool {
        match self {
            TimerInterval::Millis(ms) => ms == 0,
            TimerInterval::Nanos(ns) => ns == 0,
        }
    }
}

impl fmt::Display for TimerInterval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TimerInterval::Millis(ms) => write!(f, "{ms}ms"),
            TimerInterval::Nanos(ns) => write!(f, "{ns}ns"),
        }
    }
}

/// User callback: current interval in, next interval out, in the unit
/// selected at construction. Returning 0 cancels the timer.
pub type TimerCallback = dyn FnMut(u64) -> u64 + Send;

/// The pinned object native code resolves on every tick.
///
/// Holds the user callback and a weak back-reference to the timer internals
/// so a 0 return can run self-disposal without keeping the timer alive.
struct TimerWrapper {
    timer: Weak<TimerInner>,
    callback: Mutex<Box<TimerCallback>>,
}

/// Shared timer state, reachable from the public handle, the registry (weak)
/// and the pinned wrapper (weak).
struct TimerInner {
    resource_id: ResourceId,
    /// Native id; 0 is the disposed sentinel.
    native_id: AtomicU64,
    /// Released exactly once by whichever disposal path runs first.
    handle: Mutex<Option<PinnedHandle>>,
    /// Weak back-reference to the owner's registry; dropped at teardown.
    registry: Mutex<Option<Weak<ResourceRegistry>>>,
    /// Clone of the owning registry's dispose lock, kept strongly so
    /// teardown stays gated even after the registry is gone.
    dispose_lock: Arc<HybridLock>,
    runtime: Arc<dyn NativeRuntime>,
    interval: TimerInterval,
}

impl TimerInner {
    /// The idempotent teardown core shared by both disposal paths.
    ///
    /// `deregister` is false during the owner's bulk sweep, where the
    /// registry is already being drained. Gated by this resource's section
    /// of the shared dispose lock: idempotence checks alone are not atomic
    /// against a concurrent disposer.
    fn teardown(&self, deregister: bool) {
        let _guard = self
            .dispose_lock
            .section(self.resource_id.dispose_section())
            .expect("dispose sections are always in range");

        let id = self.native_id.load(Ordering::Acquire);
        if id == 0 {
            return;
        }

        if deregister {
            let registry = self.registry.lock().clone();
            if let Some(registry) = registry.and_then(|weak| weak.upgrade()) {
                registry.remove(self.resource_id);
            }
        }

        if let Some(handle) = self.handle.lock().take() {
            handle.release();
        }

        if !self.runtime.cancel_timer(TimerId::from_u64(id)) {
            // Already gone natively, e.g. after a 0-returning callback.
            debug!(timer = id, "native timer was already deregistered");
        }

        self.native_id.store(0, Ordering::Release);
        *self.registry.lock() = None;
        debug!(timer = id, resource = %self.resource_id, "timer disposed");
    }
}

impl Disposable for TimerInner {
    fn resource_id(&self) -> ResourceId {
        self.resource_id
    }

    fn force_dispose(&self) {
        self.teardown(false);
    }
}

/// A periodically rescheduled native timer owned by a [`RuntimeContext`].
pub struct CallbackTimer {
    inner: Arc<TimerInner>,
}

impl CallbackTimer {
    /// Registers a new periodic timer with the owner's native runtime.
    ///
    /// `callback` receives the current interval and returns the next one in
    /// the same unit; 0 cancels. It runs on a runtime-managed thread,
    /// concurrently with other code and possibly before this constructor
    /// returns. Fails with [`TimerError::ZeroInterval`] before any native
    /// call, or [`TimerError::Native`] when registration is refused — in
    /// which case the pinned wrapper is released before the error
    /// propagates, leaving no residual handle or registry entry.
    pub fn new<F>(
        owner: &RuntimeContext,
        interval: TimerInterval,
        callback: F,
    ) -> Result<Self, TimerError>
    where
        F: FnMut(u64) -> u64 + Send + 'static,
    {
        if interval.is_zero() {
            return Err(TimerError::ZeroInterval);
        }

        let runtime = owner.native().clone();
        let inner = Arc::new(TimerInner {
            resource_id: ResourceId::next(),
            native_id: AtomicU64::new(0),
            handle: Mutex::new(None),
            registry: Mutex::new(Some(Arc::downgrade(owner.registry()))),
            dispose_lock: owner.registry().dispose_lock().clone(),
            runtime: runtime.clone(),
            interval,
        });

        let wrapper = Arc::new(TimerWrapper {
            timer: Arc::downgrade(&inner),
            callback: Mutex::new(Box::new(callback)),
        });
        let handle = handle_table().pin(wrapper);
        let token = handle.token();

        let id = match interval {
            TimerInterval::Millis(ms) => runtime.register_timer_ms(ms, trampoline_ms, token),
            TimerInterval::Nanos(ns) => runtime.register_timer_ns(ns, trampoline_ns, token),
        };
        if id.is_none() {
            handle.release();
            return Err(TimerError::Native {
                message: runtime.last_error(),
            });
        }

        // Publish under the dispose section so a callback that cancels
        // immediately cannot interleave with this bookkeeping.
        {
            let _guard = inner
                .dispose_lock
                .section(inner.resource_id.dispose_section())
                .expect("dispose sections are always in range");
            inner.native_id.store(id.as_u64(), Ordering::Release);
            *inner.handle.lock() = Some(handle);
        }
        owner
            .registry()
            .register(inner.resource_id, Arc::downgrade(&inner) as Weak<dyn Disposable>);

        debug!(timer = id.as_u64(), %interval, "timer registered");
        Ok(Self { inner })
    }

    /// Self-initiated disposal. Idempotent; safe to race with the owner's
    /// bulk teardown.
    pub fn dispose(&self) {
        self.inner.teardown(true);
    }

    /// The current native id; [`TimerId::NONE`] after disposal.
    pub fn native_id(&self) -> TimerId {
        TimerId::from_u64(self.inner.native_id.load(Ordering::Acquire))
    }

    /// Returns whether the timer has been torn down by either path.
    pub fn is_disposed(&self) -> bool {
        self.native_id().is_none()
    }

    /// The rescheduling interval selected at construction.
    pub fn interval(&self) -> TimerInterval {
        self.inner.interval
    }
}

impl Drop for CallbackTimer {
    fn drop(&mut self) {
        self.inner.teardown(true);
    }
}

/// Timers are identified by their native id.
impl PartialEq for CallbackTimer {
    fn eq(&self, other: &Self) -> bool {
        self.native_id() == other.native_id()
    }
}

impl fmt::Debug for CallbackTimer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallbackTimer")
            .field("native_id", &self.native_id().as_u64())
            .field("interval", &self.inner.interval)
            .finish()
    }
}

impl fmt::Display for CallbackTimer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "timer {}", self.native_id())
    }
}

// ============================================================================
// Trampolines
// ============================================================================

/// The single native-callable entry point for millisecond timers.
///
/// A next interval beyond the millisecond range saturates to `u32::MAX`;
/// plain truncation could hand the native side a spurious 0, deregistering
/// the timer while the managed side still considers it active.
extern "C" fn trampoline_ms(token: RawToken, interval_ms: u32) -> u32 {
    u32::try_from(dispatch(token, u64::from(interval_ms))).unwrap_or(u32::MAX)
}

/// The single native-callable entry point for nanosecond timers.
extern "C" fn trampoline_ns(token: RawToken, interval_ns: u64) -> u64 {
    dispatch(token, interval_ns)
}

/// Resolve the token and forward to the user callback.
///
/// An unresolvable token means the timer was disposed between the native
/// tick and this call; returning 0 lets the native side drop the timer. A
/// 0 from the user callback additionally runs self-disposal so the pinned
/// wrapper and registry entry follow the native timer out.
fn dispatch(token: RawToken, interval: u64) -> u64 {
    let Some(wrapper) = handle_table().resolve::<TimerWrapper>(token) else {
        return 0;
    };

    let next = {
        let mut callback = wrapper.callback.lock();
        match catch_unwind(AssertUnwindSafe(|| callback(interval))) {
            Ok(next) => next,
            Err(_) => {
                warn!(token = %token, "timer callback panicked; cancelling timer");
                0
            }
        }
    };

    if next == 0 {
        if let Some(inner) = wrapper.timer.upgrade() {
            inner.teardown(true);
        }
    }
    next
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::native::{TimerTrampolineMs, TimerTrampolineNs, TlsDestructor};
    use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize};

    /// Records registrations and lets tests fire the trampoline by hand.
    #[derive(Default)]
    struct MockRuntime {
        fail_registration: AtomicBool,
        next_id: AtomicU64,
        registered: Mutex<Vec<(TimerId, TimerTrampolineMs, RawToken)>>,
        cancelled: Mutex<Vec<TimerId>>,
    }

    impl MockRuntime {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                next_id: AtomicU64::new(1),
                ..Self::default()
            })
        }

        fn failing() -> Arc<Self> {
            let mock = Self::new();
            mock.fail_registration.store(true, Ordering::SeqCst);
            mock
        }

        fn fire_last(&self) -> u32 {
            let (_, trampoline, token) = *self
                .registered
                .lock()
                .last()
                .expect("a timer was registered");
            trampoline(token, 100)
        }
    }

    impl NativeRuntime for MockRuntime {
        fn register_timer_ms(
            &self,
            _interval_ms: u32,
            trampoline: TimerTrampolineMs,
            token: RawToken,
        ) -> TimerId {
            if self.fail_registration.load(Ordering::SeqCst) {
                return TimerId::NONE;
            }
            let id = TimerId::from_u64(self.next_id.fetch_add(1, Ordering::SeqCst));
            self.registered.lock().push((id, trampoline, token));
            id
        }

        fn register_timer_ns(
            &self,
            _interval_ns: u64,
            _trampoline: TimerTrampolineNs,
            _token: RawToken,
        ) -> TimerId {
            if self.fail_registration.load(Ordering::SeqCst) {
                return TimerId::NONE;
            }
            TimerId::from_u64(self.next_id.fetch_add(1, Ordering::SeqCst))
        }

        fn cancel_timer(&self, id: TimerId) -> bool {
            self.cancelled.lock().push(id);
            true
        }

        fn tls_get(&self, _slot: &AtomicU32) -> RawToken {
            RawToken::NULL
        }

        fn tls_set(&self, _slot: &AtomicU32, _token: RawToken, _destructor: TlsDestructor) -> bool {
            false
        }

        fn last_error(&self) -> String {
            "mock registration failure".to_string()
        }
    }

    fn context_with(mock: Arc<MockRuntime>) -> RuntimeContext {
        RuntimeContext::with_native(mock)
    }

    #[test]
    fn test_zero_interval_rejected_before_native_call() {
        let mock = MockRuntime::new();
        let ctx = context_with(mock.clone());

        let err = CallbackTimer::new(&ctx, TimerInterval::Millis(0), |i| i).unwrap_err();
        assert!(matches!(err, TimerError::ZeroInterval));
        assert!(mock.registered.lock().is_empty());

        let err = CallbackTimer::new(&ctx, TimerInterval::Nanos(0), |i| i).unwrap_err();
        assert!(matches!(err, TimerError::ZeroInterval));
    }

    #[test]
    fn test_registration_failure_cleans_up() {
        let ctx = context_with(MockRuntime::failing());

        // The sentinel's strong count falls back to 1 only once the pinned
        // wrapper (and with it the callback) has been dropped.
        let sentinel = Arc::new(());
        let captured = sentinel.clone();
        let err = CallbackTimer::new(&ctx, TimerInterval::Millis(10), move |i| {
            let _ = &captured;
            i
        })
        .unwrap_err();
        assert!(matches!(err, TimerError::Native { ref message } if message.contains("mock")));

        // No residual handle, no registry entry.
        assert_eq!(Arc::strong_count(&sentinel), 1);
        assert!(ctx.registry().is_empty());
    }

    #[test]
    fn test_successful_registration_tracks_resource() {
        let mock = MockRuntime::new();
        let ctx = context_with(mock.clone());

        let timer = CallbackTimer::new(&ctx, TimerInterval::Millis(10), |i| i).unwrap();
        assert!(!timer.native_id().is_none());
        assert!(!timer.is_disposed());
        assert_eq!(ctx.registry().len(), 1);
        assert_eq!(timer.interval(), TimerInterval::Millis(10));
    }

    #[test]
    fn test_dispose_is_idempotent() {
        let mock = MockRuntime::new();
        let ctx = context_with(mock.clone());

        let timer = CallbackTimer::new(&ctx, TimerInterval::Millis(10), |i| i).unwrap();
        let id = timer.native_id();

        timer.dispose();
        assert!(timer.is_disposed());
        assert!(ctx.registry().is_empty());
        assert_eq!(mock.cancelled.lock().as_slice(), &[id]);

        // Second self-dispose and a later bulk sweep are both no-ops.
        timer.dispose();
        ctx.registry().dispose_all();
        assert_eq!(mock.cancelled.lock().len(), 1);
        assert_eq!(timer.native_id(), TimerId::NONE);
    }

    #[test]
    fn test_bulk_teardown_disposes_active_timer() {
        let mock = MockRuntime::new();
        let ctx = context_with(mock.clone());

        let timer = CallbackTimer::new(&ctx, TimerInterval::Millis(10), |i| i).unwrap();
        ctx.registry().dispose_all();

        assert!(timer.is_disposed());
        assert_eq!(mock.cancelled.lock().len(), 1);
    }

    #[test]
    fn test_drop_disposes() {
        let mock = MockRuntime::new();
        let ctx = context_with(mock.clone());

        {
            let _timer = CallbackTimer::new(&ctx, TimerInterval::Millis(10), |i| i).unwrap();
        }
        assert!(ctx.registry().is_empty());
        assert_eq!(mock.cancelled.lock().len(), 1);
    }

    #[test]
    fn test_trampoline_forwards_and_reschedules() {
        let mock = MockRuntime::new();
        let ctx = context_with(mock.clone());

        let seen = Arc::new(AtomicUsize::new(0));
        let seen2 = seen.clone();
        let _timer = CallbackTimer::new(&ctx, TimerInterval::Millis(100), move |interval| {
            seen2.fetch_add(1, Ordering::SeqCst);
            interval
        })
        .unwrap();

        assert_eq!(mock.fire_last(), 100);
        assert_eq!(mock.fire_last(), 100);
        assert_eq!(seen.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_oversized_next_interval_saturates() {
        let mock = MockRuntime::new();
        let ctx = context_with(mock.clone());

        let timer =
            CallbackTimer::new(&ctx, TimerInterval::Millis(100), |_| u64::from(u32::MAX) + 1)
                .unwrap();

        // The out-of-range reschedule clamps instead of wrapping to 0, so
        // the native side keeps firing and the timer stays active.
        assert_eq!(mock.fire_last(), u32::MAX);
        assert!(!timer.is_disposed());
        assert_eq!(ctx.registry().len(), 1);
    }

    #[test]
    fn test_callback_returning_zero_self_disposes() {
        let mock = MockRuntime::new();
        let ctx = context_with(mock.clone());

        let sentinel = Arc::new(());
        let captured = sentinel.clone();
        let timer = CallbackTimer::new(&ctx, TimerInterval::Millis(100), move |_| {
            let _ = &captured;
            0
        })
        .unwrap();

        assert_eq!(mock.fire_last(), 0);
        assert!(timer.is_disposed());
        assert!(ctx.registry().is_empty());
        // The wrapper pin was released, dropping the callback.
        assert_eq!(Arc::strong_count(&sentinel), 1);
    }

    #[test]
    fn test_trampoline_after_dispose_returns_zero() {
        let mock = MockRuntime::new();
        let ctx = context_with(mock.clone());

        let timer = CallbackTimer::new(&ctx, TimerInterval::Millis(100), |i| i).unwrap();
        timer.dispose();

        // The handle is gone, so the native side is told to stop.
        assert_eq!(mock.fire_last(), 0);
    }

    #[test]
    fn test_panicking_callback_cancels() {
        let mock = MockRuntime::new();
        let ctx = context_with(mock.clone());

        let timer = CallbackTimer::new(&ctx, TimerInterval::Millis(100), |_| {
            panic!("callback exploded")
        })
        .unwrap();

        assert_eq!(mock.fire_last(), 0);
        assert!(timer.is_disposed());
    }

    #[test]
    fn test_equality_and_display_by_native_id() {
        let mock = MockRuntime::new();
        let ctx = context_with(mock.clone());

        let a = CallbackTimer::new(&ctx, TimerInterval::Millis(10), |i| i).unwrap();
        let b = CallbackTimer::new(&ctx, TimerInterval::Millis(10), |i| i).unwrap();

        assert_ne!(a, b);
        assert_eq!(format!("{a}"), format!("timer {}", a.native_id().as_u64()));

        // Both disposed timers read the sentinel and compare equal.
        a.dispose();
        b.dispose();
        assert_eq!(a, b);
    }
}
