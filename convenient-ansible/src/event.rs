//! Engine lifecycle events and their aggregation

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use tracing::debug;

/// Kind of a lifecycle event
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    /// `playbook_on_start`
    Start,
    /// `playbook_on_task_start`
    TaskStart,
    /// `runner_on_ok`
    Ok,
    /// `runner_on_skipped`
    Skipped,
    /// `runner_on_failed`
    Failed,
    /// `runner_on_unreachable`
    Unreachable,
    /// Any other engine event, by name
    Generic(String),
}

impl EventKind {
    /// Map an engine event name to its kind
    #[must_use]
    pub fn from_event_name(name: &str) -> Self {
        match name {
            "playbook_on_start" => Self::Start,
            "playbook_on_task_start" => Self::TaskStart,
            "runner_on_ok" => Self::Ok,
            "runner_on_skipped" => Self::Skipped,
            "runner_on_failed" => Self::Failed,
            "runner_on_unreachable" => Self::Unreachable,
            other => Self::Generic(other.to_string()),
        }
    }

    /// Host-level state this event implies
    #[must_use]
    pub fn state(&self) -> &'static str {
        match self {
            Self::Start | Self::TaskStart => "running",
            Self::Ok => "successful",
            Self::Skipped => "skipped",
            Self::Failed => "failed",
            Self::Unreachable => "unreachable",
            Self::Generic(_) => "unknown",
        }
    }
}

/// One lifecycle notification from the engine
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunEvent {
    /// What happened
    pub kind: EventKind,
    /// Target host, when the event concerns one
    pub host: Option<String>,
    /// The complete event as emitted by the engine
    pub payload: Value,
}

impl RunEvent {
    /// Build an event from one engine JSON object
    #[must_use]
    pub fn from_payload(payload: Value) -> Self {
        let kind = EventKind::from_event_name(payload.get("event").and_then(Value::as_str).unwrap_or_default());
        let host = payload
            .pointer("/event_data/host")
            .and_then(Value::as_str)
            .filter(|h| !h.is_empty())
            .map(str::to_string);

        Self { kind, host, payload }
    }
}

/// Receives events in engine emission order
pub trait EventSink: Send {
    /// Called once per event, synchronously, as it is read
    fn on_event(&mut self, event: RunEvent);
}

/// Keeps the most recent event and, optionally, the most recent per host
#[derive(Debug, Default)]
pub struct EventAggregator {
    track_hosts: bool,
    last_event: Option<RunEvent>,
    per_host: BTreeMap<String, RunEvent>,
}

impl EventAggregator {
    /// Create an aggregator; `track_hosts` enables the per-host map
    #[must_use]
    pub fn new(track_hosts: bool) -> Self {
        Self {
            track_hosts,
            ..Self::default()
        }
    }

    /// Most recent event of the run
    #[must_use]
    pub fn last_event(&self) -> Option<&RunEvent> {
        self.last_event.as_ref()
    }

    /// Most recent event per host; empty unless host tracking is on
    #[must_use]
    pub fn host_events(&self) -> &BTreeMap<String, RunEvent> {
        &self.per_host
    }
}

impl EventSink for EventAggregator {
    fn on_event(&mut self, event: RunEvent) {
        debug!("event: {} host={:?}", event.kind.state(), event.host);

        if self.track_hosts
            && let Some(host) = &event.host
        {
            self.per_host.insert(host.clone(), event.clone());
        }
        self.last_event = Some(event);
    }
}
