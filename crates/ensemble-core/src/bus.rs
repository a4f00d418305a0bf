//! Inter-agent message types carried by the mediator

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::result::TaskResult;

pub const BROADCAST_RECEIVER: &str = "*";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Request,
    Response,
    Delegation,
    HelpRequest,
    Status,
    Feedback,
    Broadcast,
    Cancel,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessagePriority {
    Low,
    Normal,
    High,
    Critical,
}

impl MessagePriority {
    pub fn level(&self) -> u8 {
        match self {
            MessagePriority::Low => 1,
            MessagePriority::Normal => 5,
            MessagePriority::High => 8,
            MessagePriority::Critical => 10,
        }
    }
}

impl Default for MessagePriority {
    fn default() -> Self {
        MessagePriority::Normal
    }
}

/// One message on the bus. Resolved exactly once when `requires_response`
/// is set: fulfilled, timed out, or cancelled.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusMessage {
    pub id: Uuid,
    pub sender: String,
    pub receiver: String,
    pub kind: MessageKind,
    #[serde(default)]
    pub priority: MessagePriority,
    #[serde(default)]
    pub content: Map<String, Value>,
    #[serde(default)]
    pub context: Map<String, Value>,
    #[serde(default)]
    pub parent_id: Option<Uuid>,
    pub requires_response: bool,
    #[serde(with = "duration_secs")]
    pub timeout: Duration,
    pub timestamp: DateTime<Utc>,
}

impl BusMessage {
    pub fn new(sender: impl Into<String>, receiver: impl Into<String>, kind: MessageKind) -> Self {
        Self {
            id: Uuid::new_v4(),
            sender: sender.into(),
            receiver: receiver.into(),
            kind,
            priority: MessagePriority::Normal,
            content: Map::new(),
            context: Map::new(),
            parent_id: None,
            requires_response: true,
            timeout: Duration::from_secs(60),
            timestamp: Utc::now(),
        }
    }

    pub fn with_priority(mut self, priority: MessagePriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_content(mut self, key: impl Into<String>, value: Value) -> Self {
        self.content.insert(key.into(), value);
        self
    }

    pub fn with_context(mut self, context: Map<String, Value>) -> Self {
        self.context = context;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_parent(mut self, parent: Uuid) -> Self {
        self.parent_id = Some(parent);
        self
    }

    pub fn fire_and_forget(mut self) -> Self {
        self.requires_response = false;
        self
    }

    pub fn is_broadcast(&self) -> bool {
        self.receiver == BROADCAST_RECEIVER
    }

    pub fn involves(&self, agent: &str) -> bool {
        self.sender == agent || self.receiver == agent
    }
}

mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_f64(d.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(d)?;
        Ok(Duration::from_secs_f64(secs.max(0.0)))
    }
}

/// Outcome of one completed delegation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DelegationResult {
    pub success: bool,
    #[serde(default)]
    pub result: Option<TaskResult>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub delegated_to: Option<String>,
    pub execution_time: f64,
}

impl DelegationResult {
    pub fn succeeded(delegated_to: impl Into<String>, result: TaskResult, elapsed: f64) -> Self {
        Self {
            success: true,
            result: Some(result),
            error: None,
            delegated_to: Some(delegated_to.into()),
            execution_time: elapsed,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            result: None,
            error: Some(error.into()),
            delegated_to: None,
            execution_time: 0.0,
        }
    }

    pub fn failed_for(
        delegated_to: impl Into<String>,
        error: impl Into<String>,
        elapsed: f64,
    ) -> Self {
        Self {
            success: false,
            result: None,
            error: Some(error.into()),
            delegated_to: Some(delegated_to.into()),
            execution_time: elapsed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_builder_defaults() {
        let msg = BusMessage::new("a", "b", MessageKind::Request);
        assert!(msg.requires_response);
        assert_eq!(msg.priority, MessagePriority::Normal);
        assert_eq!(msg.timeout, Duration::from_secs(60));
        assert!(!msg.is_broadcast());
    }

    #[test]
    fn broadcast_receiver_is_star() {
        let msg = BusMessage::new("a", BROADCAST_RECEIVER, MessageKind::Broadcast);
        assert!(msg.is_broadcast());
        assert!(msg.involves("a"));
        assert!(!msg.involves("b"));
    }

    #[test]
    fn priority_levels_are_ordered() {
        assert!(MessagePriority::Critical.level() > MessagePriority::High.level());
        assert!(MessagePriority::High.level() > MessagePriority::Normal.level());
        assert!(MessagePriority::Normal.level() > MessagePriority::Low.level());
    }

    #[test]
    fn message_serde_round_trip() {
        let msg = BusMessage::new("a", "b", MessageKind::Delegation)
            .with_timeout(Duration::from_millis(1500))
            .with_content("subtask", serde_json::json!("do it"));
        let json = serde_json::to_string(&msg).unwrap();
        let parsed: BusMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.id, msg.id);
        assert_eq!(parsed.timeout, Duration::from_millis(1500));
        assert_eq!(parsed.content["subtask"], "do it");
    }
}
