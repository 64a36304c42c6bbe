//! # Core Runtime Module
//!
//! Ambient infrastructure shared by the dispatcher, the cache and the
//! session façade:
//! - Logging and tracing infrastructure
//! - Configuration management
//! - Runtime notification bus (handler panics, dispatcher closure, evictions)
//!
//! ## Overview
//!
//! Nothing in this crate knows about threads or futures; it establishes the
//! configuration, logging conventions and event broadcasting used throughout
//! the workspace.

pub mod config;
pub mod error;
pub mod events;
pub mod logging;

pub use error::{Error, Result};
