//! # Desktop Bridge Implementations
//!
//! Reference host for desktop platforms (macOS, Windows, Linux).
//!
//! ## Overview
//!
//! Game servers and UI toolkits own a primary thread that runs a loop. This
//! crate provides that loop for hosts that don't have one:
//! - `DesktopHostLoop` - dedicated, named OS thread bound as the designated
//!   thread, draining the dispatcher's queue once per tick
//!
//! ## Usage
//!
//! ```ignore
//! use bridge_desktop::DesktopHostLoop;
//! use core_dispatch::ThreadAffinityDispatcher;
//!
//! let dispatcher = ThreadAffinityDispatcher::builder().build()?;
//! let host = DesktopHostLoop::builder(dispatcher.clone())
//!     .on_tick(|tick| tracing::trace!(tick, "tick"))
//!     .start()?;
//!
//! // Continuations registered with `host.context()` now run on "server-main".
//! ```

mod host_loop;

pub use host_loop::{DesktopHostLoop, HostLoopBuilder};
