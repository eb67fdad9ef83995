//! # Runtime Context
//!
//! [`RuntimeContext`] is the long-lived owner in this layer: it holds the
//! native runtime connection, the registry of disposable resources, and the
//! configuration. Tearing a context down runs the registry's one-time bulk
//! sweep so no native callback can fire after the context is gone.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::debug;

use crate::config::RuntimeConfig;
use crate::native::{HostRuntime, NativeRuntime};
use crate::registry::ResourceRegistry;

/// Owner of the native runtime connection and every resource bound to it.
pub struct RuntimeContext {
    registry: Arc<ResourceRegistry>,
    runtime: Arc<dyn NativeRuntime>,
    config: RuntimeConfig,
    shut_down: AtomicBool,
}

impl RuntimeContext {
    /// Creates a context backed by the in-process [`HostRuntime`] with the
    /// default configuration.
    pub fn new() -> Self {
        Self::with_config(RuntimeConfig::default())
    }

    /// Creates a host-backed context honoring `config`.
    pub fn with_config(config: RuntimeConfig) -> Self {
        let runtime = Arc::new(HostRuntime::with_thread_name(&config.timer_thread_name));
        Self::build(runtime, config)
    }

    /// Creates a context over an arbitrary native runtime.
    ///
    /// This is the seam the tests use to substitute mock runtimes.
    pub fn with_native(runtime: Arc<dyn NativeRuntime>) -> Self {
        Self::build(runtime, RuntimeConfig::default())
    }

    fn build(runtime: Arc<dyn NativeRuntime>, config: RuntimeConfig) -> Self {
        Self {
            registry: Arc::new(ResourceRegistry::with_spin_limit(config.spin_limit)),
            runtime,
            config,
            shut_down: AtomicBool::new(false),
        }
    }

    /// The registry tracking this context's disposable resources.
    pub fn registry(&self) -> &Arc<ResourceRegistry> {
        &self.registry
    }

    /// The native runtime this context is bound to.
    pub fn native(&self) -> &Arc<dyn NativeRuntime> {
        &self.runtime
    }

    /// The configuration this context was built with.
    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// Force-disposes every resource still registered with this context.
    ///
    /// Runs at most once; later calls (including the one from `Drop`) are
    /// no-ops. Resources disposed here skip their own deregistration step
    /// since the registry is already being drained.
    pub fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!("runtime context shutting down");
        self.registry.dispose_all();
    }
}

impl Default for RuntimeContext {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for RuntimeContext {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl fmt::Debug for RuntimeContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RuntimeContext")
            .field("registered", &self.registry.len())
            .field("shut_down", &self.shut_down.load(Ordering::Relaxed))
            .finish()
    }
}

// ============================================================================
// Tests
// ============================================================================
