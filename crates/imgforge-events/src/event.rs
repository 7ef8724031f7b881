use imgforge_core::BuildStatus;
use serde::{Deserialize, Serialize};

/// Tagged union of everything a build-event subscriber can observe
/// (spec §3 "Event").
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Event {
    #[serde(rename = "log")]
    Log { line: String, ts: String },
    #[serde(rename = "status")]
    Status { new_state: BuildStatus, ts: String },
    #[serde(rename = "heartbeat")]
    Heartbeat { ts: String },
}

impl Event {
    pub fn is_terminal_status(&self) -> bool {
        matches!(self, Event::Status { new_state, .. } if new_state.is_terminal())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_event_serializes_with_type_tag() {
        let event = Event::Log {
            line: "hello".to_string(),
            ts: "2025-01-01T00:00:00Z".to_string(),
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"type\":\"log\""));
        assert!(json.contains("\"line\":\"hello\""));
    }

    #[test]
    fn test_is_terminal_status() {
        let terminal = Event::Status {
            new_state: BuildStatus::Ready,
            ts: "t".to_string(),
        };
        let non_terminal = Event::Status {
            new_state: BuildStatus::Building,
            ts: "t".to_string(),
        };
        assert!(terminal.is_terminal_status());
        assert!(!non_terminal.is_terminal_status());
        assert!(!Event::Heartbeat { ts: "t".to_string() }.is_terminal_status());
    }
}
