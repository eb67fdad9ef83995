//! # Tether Runtime
//!
//! A concurrency and lifetime layer for bridging managed objects into a
//! callback-driven native runtime:
//!
//! - **Hybrid lock**: 32 independent critical sections over one machine word
//!   and one shared wait object
//! - **Concurrent pool**: free-list recycling for frequently reused helpers
//! - **Handle table**: stable opaque tokens pinning objects referenced by
//!   native callbacks
//! - **Resource registry**: dual-path idempotent disposal, self-initiated or
//!   swept by the owning context at teardown
//! - **Callback timer**: a periodically rescheduled native timer delivered
//!   through a fixed `extern "C"` trampoline
//! - **Thread-local slot**: per-thread values with native thread-exit
//!   destructors
//!
//! ## Architecture
//!
//! ```text
//!  RuntimeContext ──owns──▶ ResourceRegistry ──weak──▶ CallbackTimer
//!        │                                                  │
//!        └──────▶ NativeRuntime ◀── trampoline + token ─────┤
//!                      ▲                                    │
//!  ThreadLocalSlot ────┘            HandleTable ◀── pin ────┘
//!
//!  HybridLock underlies ConcurrentPool and gates every resource's
//!  teardown core.
//! ```
//!
//! Native code never holds a managed reference: it holds a [`RawToken`]
//! issued by the [`HandleTable`] and calls back through fixed trampolines
//! that resolve the token again. Every native-callback-backed resource
//! supports two disposal paths converging on one idempotent teardown core,
//! so an owning context can guarantee no callback fires after the context
//! itself is gone.

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod config;
pub mod context;
pub mod handle;
pub mod native;
pub mod pool;
pub mod registry;
pub mod sync;
pub mod timer;
pub mod tls;

// Re-exports
pub use config::{ConfigError, RuntimeConfig, RuntimeConfigBuilder};
pub use context::RuntimeContext;
pub use handle::{handle_table, HandleTable, PinnedHandle, RawToken};
pub use native::{HostRuntime, NativeRuntime, TimerId};
pub use pool::ConcurrentPool;
pub use registry::{Disposable, ResourceId, ResourceRegistry};
pub use sync::{HybridLock, LockError, SectionGuard, SECTION_COUNT};
pub use timer::{CallbackTimer, TimerError, TimerInterval};
pub use tls::{ThreadLocalSlot, TlsError};

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
