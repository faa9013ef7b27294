use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::fund_request::FundRequestId;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuditCategory {
    Ingress,
    Transition,
    Resolution,
    Notification,
    Persistence,
    System,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuditOutcome {
    Success,
    Rejected,
    Failed,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditContext {
    pub request_id: Option<FundRequestId>,
    pub correlation_id: String,
    pub actor: String,
}

impl AuditContext {
    pub fn new(
        request_id: Option<FundRequestId>,
        correlation_id: impl Into<String>,
        actor: impl Into<String>,
    ) -> Self {
        Self { request_id, correlation_id: correlation_id.into(), actor: actor.into() }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditEvent {
    pub event_id: String,
    pub request_id: Option<FundRequestId>,
    pub correlation_id: String,
    pub event_type: String,
    pub category: AuditCategory,
    pub actor: String,
    pub outcome: AuditOutcome,
    pub metadata: BTreeMap<String, String>,
    pub occurred_at: DateTime<Utc>,
}

impl AuditEvent {
    pub fn new(
        context: &AuditContext,
        event_type: impl Into<String>,
        category: AuditCategory,
        outcome: AuditOutcome,
    ) -> Self {
        Self {
            event_id: Uuid::new_v4().to_string(),
            request_id: context.request_id.clone(),
            correlation_id: context.correlation_id.clone(),
            event_type: event_type.into(),
            category,
            actor: context.actor.clone(),
            outcome,
            metadata: BTreeMap::new(),
            occurred_at: Utc::now(),
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

pub trait AuditSink: Send + Sync {
    fn emit(&self, event: AuditEvent);
}

impl<T> AuditSink for Arc<T>
where
    T: AuditSink + ?Sized,
{
    fn emit(&self, event: AuditEvent) {
        (**self).emit(event)
    }
}

#[derive(Debug, Default)]
struct RingState {
    events: VecDeque<AuditEvent>,
    dropped: u64,
}

/// Keeps the most recent `capacity` events; older ones are discarded and counted.
#[derive(Clone, Debug)]
pub struct RingBufferAuditSink {
    state: Arc<Mutex<RingState>>,
    capacity: usize,
}

impl RingBufferAuditSink {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            state: Arc::new(Mutex::new(RingState {
                events: VecDeque::with_capacity(capacity),
                dropped: 0,
            })),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn events(&self) -> Vec<AuditEvent> {
        self.with_state(|state| state.events.iter().cloned().collect())
    }

    pub fn events_for(&self, request_id: &FundRequestId) -> Vec<AuditEvent> {
        self.with_state(|state| {
            state
                .events
                .iter()
                .filter(|event| event.request_id.as_ref() == Some(request_id))
                .cloned()
                .collect()
        })
    }

    pub fn dropped(&self) -> u64 {
        self.with_state(|state| state.dropped)
    }

    fn with_state<R>(&self, f: impl FnOnce(&mut RingState) -> R) -> R {
        match self.state.lock() {
            Ok(mut state) => f(&mut state),
            Err(poisoned) => f(&mut poisoned.into_inner()),
        }
    }
}

impl AuditSink for RingBufferAuditSink {
    fn emit(&self, event: AuditEvent) {
        let capacity = self.capacity;
        self.with_state(|state| {
            if state.events.len() == capacity {
                state.events.pop_front();
                state.dropped += 1;
            }
            state.events.push_back(event);
        });
    }
}
