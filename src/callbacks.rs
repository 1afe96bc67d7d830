//! Lifecycle callbacks.
//!
//! Applications hook into the engine at a few well-known points. A failing
//! callback is logged and never interrupts the engine.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, RwLock};

use tracing::{debug, error};

/// Points in the engine lifecycle that accept callbacks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Hook {
    /// The dispatch strategy has been initialised.
    AfterStart,
    /// A daemon tick has finished its payload.
    AfterLoop,
    /// A worker execution context has started.
    WorkerStart,
    /// The daemon is leaving its main loop.
    BeforeExit,
}

impl fmt::Display for Hook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Hook::AfterStart => "after_start",
            Hook::AfterLoop => "after_loop",
            Hook::WorkerStart => "worker_start",
            Hook::BeforeExit => "before_exit",
        };
        f.write_str(name)
    }
}

type Callback = Arc<dyn Fn() -> anyhow::Result<()> + Send + Sync>;

/// Registry of lifecycle callbacks.
#[derive(Default)]
pub struct Callbacks {
    hooks: RwLock<HashMap<Hook, Vec<Callback>>>,
}

impl Callbacks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a callback for a hook. Callbacks run in registration order.
    pub fn define<F>(&self, hook: Hook, callback: F)
    where
        F: Fn() -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.hooks
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .entry(hook)
            .or_default()
            .push(Arc::new(callback));
    }

    /// Runs every callback registered for `hook`. Returns how many failed.
    pub fn fire(&self, hook: Hook) -> usize {
        let callbacks: Vec<Callback> = self
            .hooks
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&hook)
            .cloned()
            .unwrap_or_default();

        if callbacks.is_empty() {
            return 0;
        }

        debug!(hook = %hook, count = callbacks.len(), "Running callbacks");
        let mut failed = 0;
        for callback in callbacks {
            if let Err(e) = callback() {
                error!(hook = %hook, error = %e, "Callback failed");
                failed += 1;
            }
        }
        failed
    }

    /// Number of callbacks registered for `hook`.
    pub fn count(&self, hook: Hook) -> usize {
        self.hooks
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&hook)
            .map_or(0, Vec::len)
    }
}
