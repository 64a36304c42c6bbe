//! Workspace placeholder crate.
//!
//! This crate exposes feature flags that map to the individual workspace
//! crates. Host integrations can depend on `affinity-workspace` and pick
//! either the full session façade (`desktop-shims`, the default) or only the
//! dispatcher and cache primitives (`dispatch-only`).

#[cfg(feature = "desktop-shims")]
pub use core_service as service;

#[cfg(feature = "dispatch-only")]
pub use core_cache as cache;

#[cfg(feature = "dispatch-only")]
pub use core_dispatch as dispatch;
