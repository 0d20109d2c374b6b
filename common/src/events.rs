// Structured transition events for observability
// Every job and lease transition, and every caught error, produces one event.

use crate::telemetry;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, Mutex};

/// Kind of transition being reported
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    #[serde(rename = "job.deferred")]
    JobDeferred,
    #[serde(rename = "job.started")]
    JobStarted,
    #[serde(rename = "job.succeeded")]
    JobSucceeded,
    #[serde(rename = "job.retrying")]
    JobRetrying,
    #[serde(rename = "job.failed")]
    JobFailed,
    #[serde(rename = "job.recovered")]
    JobRecovered,
    #[serde(rename = "lease.acquired")]
    LeaseAcquired,
    #[serde(rename = "lease.renewed")]
    LeaseRenewed,
    #[serde(rename = "lease.renewal_failed")]
    LeaseRenewalFailed,
    #[serde(rename = "lease.grace")]
    LeaseGrace,
    #[serde(rename = "lease.expired")]
    LeaseExpired,
    #[serde(rename = "cycle.aborted")]
    CycleAborted,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::JobDeferred => "job.deferred",
            EventKind::JobStarted => "job.started",
            EventKind::JobSucceeded => "job.succeeded",
            EventKind::JobRetrying => "job.retrying",
            EventKind::JobFailed => "job.failed",
            EventKind::JobRecovered => "job.recovered",
            EventKind::LeaseAcquired => "lease.acquired",
            EventKind::LeaseRenewed => "lease.renewed",
            EventKind::LeaseRenewalFailed => "lease.renewal_failed",
            EventKind::LeaseGrace => "lease.grace",
            EventKind::LeaseExpired => "lease.expired",
            EventKind::CycleAborted => "cycle.aborted",
        }
    }

    /// Events operators should be alerted on
    pub fn is_alert(&self) -> bool {
        matches!(
            self,
            EventKind::JobFailed
                | EventKind::LeaseGrace
                | EventKind::LeaseExpired
                | EventKind::CycleAborted
        )
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One observability record: `{timestamp, entity_id, from_state, to_state, reason}`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransitionEvent {
    pub timestamp: DateTime<Utc>,
    pub kind: EventKind,
    pub entity_id: String,
    pub from_state: String,
    pub to_state: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl TransitionEvent {
    pub fn new(
        timestamp: DateTime<Utc>,
        kind: EventKind,
        entity_id: impl Into<String>,
        from_state: impl fmt::Display,
        to_state: impl fmt::Display,
    ) -> Self {
        Self {
            timestamp,
            kind,
            entity_id: entity_id.into(),
            from_state: from_state.to_string(),
            to_state: to_state.to_string(),
            reason: None,
        }
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }
}

/// Destination for transition events
pub trait EventSink: Send + Sync {
    fn emit(&self, event: TransitionEvent);
}

/// Writes events as structured log records and counts them
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingEventSink;

impl EventSink for TracingEventSink {
    fn emit(&self, event: TransitionEvent) {
        telemetry::record_event(event.kind);

        let reason = event.reason.as_deref().unwrap_or("");
        if event.kind.is_alert() {
            tracing::warn!(
                event = event.kind.as_str(),
                timestamp = %event.timestamp,
                entity_id = %event.entity_id,
                from_state = %event.from_state,
                to_state = %event.to_state,
                reason,
                "Transition"
            );
        } else {
            tracing::info!(
                event = event.kind.as_str(),
                timestamp = %event.timestamp,
                entity_id = %event.entity_id,
                from_state = %event.from_state,
                to_state = %event.to_state,
                reason,
                "Transition"
            );
        }
    }
}

/// Keeps every event in memory
#[derive(Debug, Default, Clone)]
pub struct MemoryEventSink {
    events: Arc<Mutex<Vec<TransitionEvent>>>,
}

impl MemoryEventSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<TransitionEvent> {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn events_of(&self, kind: EventKind) -> Vec<TransitionEvent> {
        self.events()
            .into_iter()
            .filter(|e| e.kind == kind)
            .collect()
    }

    pub fn clear(&self) {
        self.events.lock().unwrap_or_else(|e| e.into_inner()).clear();
    }
}

impl EventSink for MemoryEventSink {
    fn emit(&self, event: TransitionEvent) {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(event);
    }
}

/// Forwards each event to several sinks
#[derive(Default, Clone)]
pub struct FanoutEventSink {
    sinks: Vec<Arc<dyn EventSink>>,
}

impl FanoutEventSink {
    pub fn new(sinks: Vec<Arc<dyn EventSink>>) -> Self {
        Self { sinks }
    }
}

impl EventSink for FanoutEventSink {
    fn emit(&self, event: TransitionEvent) {
        for sink in &self.sinks {
            sink.emit(event.clone());
        }
    }
}
