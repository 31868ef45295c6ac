//! Listener registry — script key → handlers invoked on terminal results.
//!
//! Registration is keyed by (script, name): re-registering the same name
//! replaces the handler instead of adding a second invocation. Handler
//! failures are contained; they never affect the dispatcher's own return
//! value to its direct caller.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use dashmap::DashMap;

use crucible_core::TaskResult;

/// Callback invoked with each published terminal result for a script.
pub type TaskListener = Arc<dyn Fn(&TaskResult) + Send + Sync>;

#[derive(Default)]
pub struct ListenerRegistry {
    /// script → named handlers.
    listeners: DashMap<String, Vec<(String, TaskListener)>>,
}

impl ListenerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` under (script, name). Idempotent: an existing
    /// handler with the same name is replaced, never duplicated.
    pub fn register(&self, script: &str, name: &str, handler: TaskListener) {
        let mut entry = self.listeners.entry(script.to_string()).or_default();
        if let Some(existing) = entry.iter_mut().find(|(n, _)| n == name) {
            existing.1 = handler;
        } else {
            entry.push((name.to_string(), handler));
        }
    }

    /// Remove a named handler. No-op if absent.
    pub fn deregister(&self, script: &str, name: &str) {
        if let Some(mut entry) = self.listeners.get_mut(script) {
            entry.retain(|(n, _)| n != name);
        }
    }

    /// Invoke every handler registered for the result's script. Called
    /// exactly once per published result, after publication. A panicking
    /// handler is logged and the rest still run.
    pub fn notify(&self, result: &TaskResult) {
        let handlers: Vec<(String, TaskListener)> = match self.listeners.get(&result.script) {
            Some(entry) => entry.clone(),
            None => return,
        };
        for (name, handler) in handlers {
            let outcome = std::panic::catch_unwind(AssertUnwindSafe(|| handler(result)));
            if outcome.is_err() {
                tracing::warn!(
                    task_id = %result.id,
                    script = %result.script,
                    listener = %name,
                    "task listener panicked"
                );
            }
        }
    }
}
