//! Per-event thread contracts.
//!
//! Which thread an event's handlers must run on is configuration, read from
//! [`CoreConfig::event_contracts`]. This module turns those requirements into
//! the [`ThreadContext`] the dispatcher understands.

use std::collections::HashMap;

use core_dispatch::ThreadContext;
use core_runtime::config::{CoreConfig, ThreadRequirement};

/// Event name to [`ThreadContext`] resolution for one session.
#[derive(Debug, Clone)]
pub struct ThreadContracts {
    main: ThreadContext,
    contracts: HashMap<String, ThreadRequirement>,
    default: ThreadRequirement,
}

impl ThreadContracts {
    /// Contracts with no explicit entries; every event requires `main`.
    pub fn new(main: ThreadContext) -> Self {
        Self {
            main,
            contracts: HashMap::new(),
            default: ThreadRequirement::MainThread,
        }
    }

    pub fn from_config(config: &CoreConfig, main: ThreadContext) -> Self {
        Self {
            main,
            contracts: config.event_contracts.clone(),
            default: config.default_requirement,
        }
    }

    pub fn with_contract(mut self, event: impl Into<String>, requirement: ThreadRequirement) -> Self {
        self.contracts.insert(event.into(), requirement);
        self
    }

    /// The designated main thread's context.
    pub fn main(&self) -> &ThreadContext {
        &self.main
    }

    pub fn requirement_for(&self, event: &str) -> ThreadRequirement {
        self.contracts.get(event).copied().unwrap_or(self.default)
    }

    pub fn context_for(&self, event: &str) -> ThreadContext {
        match self.requirement_for(event) {
            ThreadRequirement::MainThread => self.main.clone(),
            ThreadRequirement::Anywhere => ThreadContext::Any,
        }
    }
}
