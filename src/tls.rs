//! # Per-Thread Storage Slot
//!
//! [`ThreadLocalSlot`] stores one value per OS thread behind a native
//! per-thread storage row. The slot's 32-bit id starts unallocated (0) and
//! is assigned atomically by the native layer on first use from any thread;
//! after that every thread shares the same id but resolves an independent
//! row.
//!
//! Each row holds the token of a pinned value cell. Re-setting on a thread
//! that already has a live row overwrites the cell in place — no new handle,
//! no destructor re-registration. When the owning OS thread exits, the
//! native layer invokes the destructor trampoline, which clears the cell and
//! releases the pin.
//!
//! No lock is needed beyond the native guarantee that the one-time id
//! allocation is race-free: rows belong to exactly one thread.

use std::fmt;
use std::marker::PhantomData;
use std::sync::atomic::AtomicU32;
use std::sync::Arc;

use parking_lot::Mutex;
use thiserror::Error;
use tracing::trace;

use crate::context::RuntimeContext;
use crate::handle::{handle_table, RawToken};
use crate::native::NativeRuntime;

/// Error type for per-thread storage operations.
#[derive(Debug, Error)]
pub enum TlsError {
    /// The native runtime refused to store the row.
    #[error("native thread-local store failed: {message}")]
    Native {
        /// Error text reported by the native runtime.
        message: String,
    },
}

/// The pinned cell one thread's row points at.
struct TlsCell<T> {
    value: Mutex<Option<T>>,
}

/// A per-thread value slot backed by native thread-local storage.
pub struct ThreadLocalSlot<T> {
    /// Lazily allocated shared slot id; 0 until the native layer assigns it.
    id: AtomicU32,
    runtime: Arc<dyn NativeRuntime>,
    _marker: PhantomData<fn() -> T>,
}

impl<T: Clone + Send + Sync + 'static> ThreadLocalSlot<T> {
    /// Creates a slot bound to `owner`'s native runtime.
    ///
    /// The slot id is not allocated until some thread first touches the
    /// native layer through this slot.
    pub fn new(owner: &RuntimeContext) -> Self {
        Self {
            id: AtomicU32::new(0),
            runtime: owner.native().clone(),
            _marker: PhantomData,
        }
    }

    /// Reads the calling thread's value, if one was set on this thread.
    pub fn get(&self) -> Option<T> {
        let token = self.runtime.tls_get(&self.id);
        if token.is_null() {
            return None;
        }
        let cell = handle_table().resolve::<TlsCell<T>>(token)?;
        let value = cell.value.lock();
        value.clone()
    }

    /// Stores `value` for the calling thread.
    ///
    /// Overwrites in place when this thread already has a live row; fresh
    /// rows pin a new cell and register the thread-exit destructor. A native
    /// store failure leaves no residual cell or handle behind.
    pub fn set(&self, value: T) -> Result<(), TlsError> {
        let token = self.runtime.tls_get(&self.id);
        if !token.is_null() {
            if let Some(cell) = handle_table().resolve::<TlsCell<T>>(token) {
                *cell.value.lock() = Some(value);
                return Ok(());
            }
        }

        let cell = Arc::new(TlsCell {
            value: Mutex::new(Some(value)),
        });
        let handle = handle_table().pin(cell.clone());
        let token = handle.token();

        if !self.runtime.tls_set(&self.id, token, tls_destructor::<T>) {
            *cell.value.lock() = None;
            handle.release();
            return Err(TlsError::Native {
                message: self.runtime.last_error(),
            });
        }

        // Release responsibility now belongs to the native row's destructor.
        let _ = handle.into_raw();
        Ok(())
    }
}

impl<T> fmt::Debug for ThreadLocalSlot<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadLocalSlot")
            .field("id", &self.id.load(std::sync::atomic::Ordering::Relaxed))
            .finish()
    }
}

/// The single native-callable destructor entry point.
///
/// Runs on the exiting OS thread: clears the cell, then releases the pin by
/// raw token. Tolerates an already-released token.
extern "C" fn tls_destructor<T: Clone + Send + Sync + 'static>(token: RawToken) {
    if let Some(cell) = handle_table().resolve::<TlsCell<T>>(token) {
        *cell.value.lock() = None;
    }
    if handle_table().release_raw(token) {
        trace!(token = %token, "thread-local row released at thread exit");
    }
}

// ============================================================================
// Tests
// ============================================================================
