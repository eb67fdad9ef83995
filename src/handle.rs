//! # Cross-Boundary Handle Table
//!
//! This module provides the pinning mechanism used to hand managed objects to
//! native code. Native code only ever holds an opaque [`RawToken`]; the value
//! itself stays in the process-wide [`HandleTable`] and is looked up again
//! when a callback fires.
//!
//! ## Lifetime discipline
//!
//! A handle is valid from [`HandleTable::pin`] until the first successful
//! release, and release happens exactly once. [`PinnedHandle::release`]
//! consumes the handle, so a double release through the typed API does not
//! compile; releasing by raw token is idempotent by absence. Resolving a
//! released token fails softly with `None`, never a crash.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use parking_lot::RwLock;

/// The opaque token value native code holds in place of a managed reference.
///
/// `0` is reserved as the null token and is never issued.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct RawToken(u64);

impl RawToken {
    /// The reserved "no object" token.
    pub const NULL: RawToken = RawToken(0);

    /// Returns whether this is the null token.
    pub fn is_null(self) -> bool {
        self.0 == 0
    }

    /// The token as a plain integer, for logging and native user data.
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for RawToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// The process-wide table of pinned objects.
pub struct HandleTable {
    entries: RwLock<HashMap<u64, Arc<dyn Any + Send + Sync>>>,
    next_token: AtomicU64,
}

impl HandleTable {
    fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            next_token: AtomicU64::new(1),
        }
    }

    /// Pins `value`, returning a handle whose token native code may hold.
    pub fn pin<T: Send + Sync + 'static>(&self, value: Arc<T>) -> PinnedHandle {
        let token = RawToken(self.next_token.fetch_add(1, Ordering::Relaxed));
        self.entries.write().insert(token.as_u64(), value);
        PinnedHandle { token }
    }

    /// Resolves a token back to the pinned value.
    ///
    /// Returns `None` for the null token, a released token, or a token whose
    /// entry is of a different type.
    pub fn resolve<T: Send + Sync + 'static>(&self, token: RawToken) -> Option<Arc<T>> {
        if token.is_null() {
            return None;
        }
        let entry = self.entries.read().get(&token.as_u64())?.clone();
        entry.downcast::<T>().ok()
    }

    /// Releases the entry for `token`.
    ///
    /// Returns whether an entry was actually removed; releasing an unknown or
    /// already-released token is a no-op.
    pub fn release_raw(&self, token: RawToken) -> bool {
        if token.is_null() {
            return false;
        }
        self.entries.write().remove(&token.as_u64()).is_some()
    }

    /// Number of currently pinned objects.
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Returns whether the table holds no pinned objects.
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

impl fmt::Debug for HandleTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandleTable")
            .field("pinned", &self.len())
            .finish()
    }
}

/// Access the process-wide handle table.
pub fn handle_table() -> &'static HandleTable {
    static TABLE: OnceLock<HandleTable> = OnceLock::new();
    TABLE.get_or_init(HandleTable::new)
}

/// Owned pin of one managed object in the [`HandleTable`].
///
/// The handle does not release on drop: the owner is expected to either call
/// [`release`](PinnedHandle::release) or transfer release responsibility to
/// native storage with [`into_raw`](PinnedHandle::into_raw).
pub struct PinnedHandle {
    token: RawToken,
}

impl PinnedHandle {
    /// The token native code should hold.
    pub fn token(&self) -> RawToken {
        self.token
    }

    /// Releases the pinned entry, consuming the handle.
    ///
    /// Returns whether the entry was still present.
    pub fn release(self) -> bool {
        handle_table().release_raw(self.token)
    }

    /// Hands release responsibility to whoever stores the returned token.
    pub fn into_raw(self) -> RawToken {
        self.token
    }

    /// Reconstructs a handle from a token previously produced by `into_raw`.
    pub fn from_raw(token: RawToken) -> Self {
        Self { token }
    }
}

impl fmt::Debug for PinnedHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PinnedHandle")
            .field("token", &self.token)
            .finish()
    }
}

// ============================================================================
// Tests
// ============================================================================
