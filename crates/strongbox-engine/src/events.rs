//! Lifecycle events and the hooks that observe them.
//!
//! Every operation produces a pre-start event (no start or end time) when it
//! reaches the head of the queue, and a completion event (end time set) when
//! it terminates. Before a pre-start event is acted upon it passes through a
//! [`HookChain`]; any hook may deny it, in which case the operation never
//! starts.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct OperationEvent {
    pub uid: String,
    pub name: String,
    /// The managed service must be held while the operation runs.
    pub offline: bool,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
}

impl OperationEvent {
    pub fn pre_start(uid: impl Into<String>, name: impl Into<String>, offline: bool) -> Self {
        Self {
            uid: uid.into(),
            name: name.into(),
            offline,
            start_time: None,
            end_time: None,
        }
    }

    pub fn is_completion(&self) -> bool {
        self.end_time.is_some()
    }

    pub fn is_pre_start(&self) -> bool {
        self.end_time.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HookDecision {
    Allow,
    Deny(String),
}

/// Hooks run in tier order; registration order breaks ties.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum HookPriority {
    System,
    Normal,
    Monitor,
}

/// Observer of operation lifecycle events.
///
/// Hooks run on a blocking thread and may block, e.g. while waiting for the
/// managed service to stop.
pub trait LifecycleHook: Send + Sync {
    fn name(&self) -> &str;

    /// Called before an operation is allowed to start copying.
    fn before_start(&self, _event: &OperationEvent) -> HookDecision {
        HookDecision::Allow
    }

    /// Called once an operation has terminated. `next_offline` describes the
    /// operation about to start, `None` when the queue is empty.
    fn after_finish(&self, _event: &OperationEvent, _next_offline: Option<bool>) {}
}

#[derive(Clone, Default)]
pub struct HookChain {
    hooks: Vec<(HookPriority, Arc<dyn LifecycleHook>)>,
}

impl HookChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, priority: HookPriority, hook: Arc<dyn LifecycleHook>) -> Self {
        self.register(priority, hook);
        self
    }

    pub fn register(&mut self, priority: HookPriority, hook: Arc<dyn LifecycleHook>) {
        self.hooks.push((priority, hook));
        // Stable sort keeps registration order within a tier.
        self.hooks.sort_by_key(|(p, _)| *p);
    }

    pub fn len(&self) -> usize {
        self.hooks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hooks.is_empty()
    }

    /// Runs the pre-start hooks in order. The first denial wins and later hooks are skipped.
    pub fn before_start(&self, event: &OperationEvent) -> HookDecision {
        for (_, hook) in &self.hooks {
            if let HookDecision::Deny(reason) = hook.before_start(event) {
                debug!("Hook {} denied start of {}: {}", hook.name(), event.uid, reason);
                return HookDecision::Deny(format!("{}: {}", hook.name(), reason));
            }
        }
        HookDecision::Allow
    }

    pub fn after_finish(&self, event: &OperationEvent, next_offline: Option<bool>) {
        for (_, hook) in &self.hooks {
            hook.after_finish(event, next_offline);
        }
    }
}
