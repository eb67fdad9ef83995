//! # Resource Registry & Dual-Path Disposal
//!
//! A [`ResourceRegistry`] is owned by a long-lived runtime context and tracks
//! every native-callback-backed resource still alive. Disposal converges on
//! one idempotent teardown core reached from two entry points:
//!
//! 1. **Self-initiated**: the resource deregisters itself, releases its
//!    pinned handle, cancels the native side, and clears its id.
//! 2. **Owner-initiated**: context teardown sweeps the registry and
//!    force-disposes every survivor; the resource skips deregistration since
//!    the registry is already being drained.
//!
//! Either way the native id ends at the sentinel value 0, and a second call
//! down either path observes the sentinel and becomes a no-op. The race
//! between two concurrent disposers is gated by a section of the registry's
//! [`dispose lock`](ResourceRegistry::dispose_lock), assigned per resource id.
//!
//! Registry entries are weak: tracking a resource never keeps it alive.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::debug;

use crate::sync::{HybridLock, DEFAULT_SPIN_LIMIT, SECTION_COUNT};

/// Identifier for a registered resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ResourceId(u64);

impl ResourceId {
    /// Allocates the next process-unique id.
    pub fn next() -> Self {
        static NEXT_ID: AtomicU64 = AtomicU64::new(1);
        Self(NEXT_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// The id as a plain integer.
    pub fn as_u64(self) -> u64 {
        self.0
    }

    /// The dispose-lock section assigned to this resource.
    pub(crate) fn dispose_section(self) -> usize {
        (self.0 % SECTION_COUNT as u64) as usize
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A resource that supports owner-initiated bulk teardown.
pub trait Disposable: Send + Sync {
    /// The registry id of this resource.
    fn resource_id(&self) -> ResourceId;

    /// Runs the teardown core without deregistering from the registry.
    ///
    /// Called by the owning context while it drains its registry; must be
    /// idempotent and safe to race with self-initiated disposal.
    fn force_dispose(&self);
}

/// Tracks the disposable resources owned by one context.
pub struct ResourceRegistry {
    entries: Mutex<HashMap<u64, Weak<dyn Disposable>>>,
    dispose_lock: Arc<HybridLock>,
}

impl ResourceRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::with_spin_limit(DEFAULT_SPIN_LIMIT)
    }

    /// Creates an empty registry whose dispose lock spins `spin_limit` times
    /// before parking, e.g. from [`RuntimeConfig::spin_limit`].
    ///
    /// [`RuntimeConfig::spin_limit`]: crate::config::RuntimeConfig
    pub fn with_spin_limit(spin_limit: u32) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            dispose_lock: Arc::new(HybridLock::with_spin_limit(spin_limit)),
        }
    }

    /// The lock gating the teardown core of this registry's resources.
    ///
    /// One lock serves all of them; each resource uses the section derived
    /// from its [`ResourceId`], so unrelated teardowns rarely contend and no
    /// per-resource wait primitive is allocated. Resources keep their own
    /// clone so teardown stays gated after the registry itself is gone.
    pub(crate) fn dispose_lock(&self) -> &Arc<HybridLock> {
        &self.dispose_lock
    }

    /// Adds a resource. Called at successful construction.
    pub fn register(&self, id: ResourceId, resource: Weak<dyn Disposable>) {
        self.entries.lock().insert(id.as_u64(), resource);
    }

    /// Removes a resource entry.
    ///
    /// Tolerant of "already removed": self-initiated disposal and bulk
    /// teardown may race to remove the same entry, and either may win.
    pub fn remove(&self, id: ResourceId) -> bool {
        self.entries.lock().remove(&id.as_u64()).is_some()
    }

    /// Force-disposes every still-registered resource.
    ///
    /// Entries are drained under the lock, then disposed outside it so a
    /// resource's own teardown can re-enter `remove` without deadlocking.
    pub fn dispose_all(&self) {
        let drained: Vec<Weak<dyn Disposable>> = {
            let mut entries = self.entries.lock();
            entries.drain().map(|(_, weak)| weak).collect()
        };
        if !drained.is_empty() {
            debug!(count = drained.len(), "force-disposing registered resources");
        }
        for weak in drained {
            if let Some(resource) = weak.upgrade() {
                resource.force_dispose();
            }
        }
    }

    /// Number of tracked entries (live or not).
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Returns whether no resources are tracked.
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

impl Default for ResourceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ResourceRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceRegistry")
            .field("entries", &self.len())
            .finish()
    }
}

// ============================================================================
// Tests
// ============================================================================
