/// In-memory engine event log
///
/// A bounded ring buffer of notable engine transitions (instances started/finished,
/// approval gates opened/decided, fire-and-forget failures). Owned by application
/// state and injected where needed; the oldest entries fall off once full.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventKind {
    InstanceStarted,
    InstanceCompleted,
    InstanceFailed,
    InstancePaused,
    InstanceResumed,
    TaskCompleted,
    HitlRequested,
    HitlApproved,
    HitlRejected,
    OwnerNotified,
    TriggerDropped,
    TriggerFailed,
    DripSent,
    DripFailed,
    DripCompleted,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineEvent {
    pub at: DateTime<Utc>,
    pub user_id: Option<String>,
    pub kind: EventKind,
    pub instance_id: Option<String>,
    pub execution_id: Option<String>,
    pub detail: String,
}

impl EngineEvent {
    pub fn new(kind: EventKind, detail: impl Into<String>) -> Self {
        Self {
            at: Utc::now(),
            user_id: None,
            kind,
            instance_id: None,
            execution_id: None,
            detail: detail.into(),
        }
    }

    pub fn for_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn instance(mut self, instance_id: impl Into<String>) -> Self {
        self.instance_id = Some(instance_id.into());
        self
    }

    pub fn execution(mut self, execution_id: impl Into<String>) -> Self {
        self.execution_id = Some(execution_id.into());
        self
    }
}

#[derive(Debug)]
pub struct EventLog {
    capacity: usize,
    events: Mutex<VecDeque<EngineEvent>>,
}

impl EventLog {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            events: Mutex::new(VecDeque::with_capacity(capacity)),
        }
    }

    pub fn record(&self, event: EngineEvent) {
        let mut events = self.events.lock().unwrap_or_else(|e| e.into_inner());
        if events.len() == self.capacity {
            events.pop_front();
        }
        events.push_back(event);
    }

    /// Most recent events for one tenant, newest first
    pub fn recent(&self, user_id: &str, limit: usize) -> Vec<EngineEvent> {
        let events = self.events.lock().unwrap_or_else(|e| e.into_inner());
        events
            .iter()
            .rev()
            .filter(|e| e.user_id.as_deref() == Some(user_id))
            .take(limit)
            .cloned()
            .collect()
    }

    /// Most recent events of one kind across all tenants, newest first
    pub fn recent_of_kind(&self, kind: EventKind, limit: usize) -> Vec<EngineEvent> {
        let events = self.events.lock().unwrap_or_else(|e| e.into_inner());
        events
            .iter()
            .rev()
            .filter(|e| e.kind == kind)
            .take(limit)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.events.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
