use crate::types::{Resolution, RunId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Mutex;

/// An event in a run's event log
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: String,
    pub run_id: RunId,
    pub timestamp: DateTime<Utc>,
    pub event_type: EventType,
}

impl Event {
    pub fn new(run_id: RunId, event_type: EventType) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            run_id,
            timestamp: Utc::now(),
            event_type,
        }
    }
}

/// Types of events emitted by the automata engine.
///
/// `step` is always the full step path, e.g. `deploy/SetDeploymentEnv/check_nodes`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventType {
    // Run lifecycle events
    RunStarted {
        workflow: String,
        nodes: Vec<String>,
    },
    RunCompleted {
        ok: Vec<String>,
        ko: Vec<String>,
        duration_ms: u64,
    },
    RunCancelled {
        step: String,
        nodes: Vec<String>,
    },

    // Step lifecycle events
    StepStarted {
        step: String,
        attempt: u32,
        nodes: Vec<String>,
    },
    NodesRaised {
        step: String,
        status: Resolution,
        nodes: Vec<String>,
    },
    StepTimedOut {
        step: String,
        attempt: u32,
        timeout_ms: u64,
        nodes: Vec<String>,
    },
    StepFailed {
        step: String,
        attempt: u32,
        error: Option<String>,
        will_retry: bool,
        nodes: Vec<String>,
    },
    StepCompleted {
        step: String,
        ok: Vec<String>,
        ko: Vec<String>,
    },
    FallbackTriggered {
        scope: String,
        alternative: usize,
        nodes: Vec<String>,
    },
    BreakpointReached {
        step: String,
    },
}

impl EventType {
    pub fn step(&self) -> Option<&str> {
        match self {
            EventType::RunStarted { .. }
            | EventType::RunCompleted { .. }
            | EventType::FallbackTriggered { .. } => None,
            EventType::RunCancelled { step, .. }
            | EventType::StepStarted { step, .. }
            | EventType::NodesRaised { step, .. }
            | EventType::StepTimedOut { step, .. }
            | EventType::StepFailed { step, .. }
            | EventType::StepCompleted { step, .. }
            | EventType::BreakpointReached { step } => Some(step),
        }
    }
}

/// Event log writer trait
#[async_trait::async_trait]
pub trait EventLog: Send + Sync {
    /// Append an event to the log
    async fn append(&self, event: Event) -> anyhow::Result<()>;

    /// Get all events for a run
    async fn get_run_events(&self, run_id: RunId) -> anyhow::Result<Vec<Event>>;

    /// Persist anything still buffered
    async fn flush(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Event log kept in memory, used when the caller does not need persistence
#[derive(Default)]
pub struct MemoryEventLog {
    events: Mutex<Vec<Event>>,
}

impl MemoryEventLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of every event appended so far
    pub fn events(&self) -> Vec<Event> {
        self.events.lock().unwrap().clone()
    }
}

#[async_trait::async_trait]
impl EventLog for MemoryEventLog {
    async fn append(&self, event: Event) -> anyhow::Result<()> {
        self.events.lock().unwrap().push(event);
        Ok(())
    }

    async fn get_run_events(&self, run_id: RunId) -> anyhow::Result<Vec<Event>> {
        Ok(self
            .events
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.run_id == run_id)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_log_filters_by_run() {
        let log = MemoryEventLog::new();
        let run_a = RunId::new();
        let run_b = RunId::new();

        log.append(Event::new(
            run_a,
            EventType::BreakpointReached {
                step: "deploy/SetDeploymentEnv".to_string(),
            },
        ))
        .await
        .unwrap();
        log.append(Event::new(
            run_b,
            EventType::RunStarted {
                workflow: "deploy".to_string(),
                nodes: vec![],
            },
        ))
        .await
        .unwrap();

        let events = log.get_run_events(run_a).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type.step(), Some("deploy/SetDeploymentEnv"));
        assert_eq!(log.events().len(), 2);
    }

    #[test]
    fn test_event_serialization_is_tagged() {
        let event = EventType::NodesRaised {
            step: "deploy/BroadcastEnv/send_environment".to_string(),
            status: Resolution::Ok,
            nodes: vec!["node-1".to_string()],
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "nodes_raised");
        assert_eq!(json["status"], "ok");
    }
}
