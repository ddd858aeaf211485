//! Message envelope for inter-agent communication.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Types of messages in the system, used for routing and handling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    TaskAssign,
    TaskResult,
    TaskComplete,
    TaskFailed,
    TaskProgress,
    AgentNotification,
    AgentStatus,
    ReflexionRequest,
    ReflexionResponse,
    MemoryUpdate,
    WorkflowEvent,
    System,
    Broadcast,
}

/// Message priority levels. Serialized as their numeric weight. Priority is
/// metadata for higher layers; the transport ignores it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum MessagePriority {
    Low,
    Normal,
    High,
    Urgent,
}

impl Default for MessagePriority {
    fn default() -> Self {
        MessagePriority::Normal
    }
}

impl From<MessagePriority> for u8 {
    fn from(p: MessagePriority) -> u8 {
        match p {
            MessagePriority::Low => 1,
            MessagePriority::Normal => 5,
            MessagePriority::High => 7,
            MessagePriority::Urgent => 10,
        }
    }
}

impl TryFrom<u8> for MessagePriority {
    type Error = String;

    fn try_from(v: u8) -> Result<Self, Self::Error> {
        match v {
            1 => Ok(MessagePriority::Low),
            5 => Ok(MessagePriority::Normal),
            7 => Ok(MessagePriority::High),
            10 => Ok(MessagePriority::Urgent),
            other => Err(format!("invalid message priority: {other}")),
        }
    }
}

/// The wire envelope carried by the broker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: Uuid,
    pub message_type: MessageType,
    pub sender_id: String,
    /// Absent recipient means broadcast.
    #[serde(default)]
    pub recipient_id: Option<String>,
    pub channel: String,
    #[serde(default)]
    pub payload: Map<String, Value>,
    #[serde(default)]
    pub priority: MessagePriority,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
    /// Pairs a response with its request.
    #[serde(default)]
    pub correlation_id: Option<String>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl Message {
    /// Create a message addressed to a channel.
    pub fn new(
        message_type: MessageType,
        sender_id: impl Into<String>,
        channel: impl Into<String>,
        payload: Map<String, Value>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            message_type,
            sender_id: sender_id.into(),
            recipient_id: None,
            channel: channel.into(),
            payload,
            priority: MessagePriority::Normal,
            created_at: Utc::now(),
            expires_at: None,
            correlation_id: None,
            metadata: Map::new(),
        }
    }

    /// Task assignment for an agent's inbox channel, carrying the task's
    /// externalized view under the `task` key.
    pub fn task_assign(
        sender_id: impl Into<String>,
        recipient_id: impl Into<String>,
        task_view: Value,
        priority: MessagePriority,
    ) -> Self {
        let recipient = recipient_id.into();
        let mut payload = Map::new();
        payload.insert("task".to_string(), task_view);
        let mut msg = Self::new(
            MessageType::TaskAssign,
            sender_id,
            format!("agent:{recipient}"),
            payload,
        );
        msg.recipient_id = Some(recipient);
        msg.priority = priority;
        msg
    }

    /// Task result envelope addressed back to the orchestrator.
    #[allow(clippy::too_many_arguments)]
    pub fn task_result(
        sender_id: impl Into<String>,
        recipient_id: impl Into<String>,
        task_id: &str,
        success: bool,
        output: Value,
        artifacts: Vec<String>,
        error: Option<String>,
        duration_seconds: f64,
    ) -> Self {
        let recipient = recipient_id.into();
        let mut payload = Map::new();
        payload.insert("task_id".to_string(), Value::String(task_id.to_string()));
        payload.insert("success".to_string(), Value::Bool(success));
        payload.insert("output".to_string(), output);
        payload.insert(
            "artifacts".to_string(),
            Value::Array(artifacts.into_iter().map(Value::String).collect()),
        );
        if let Some(err) = error {
            payload.insert("error".to_string(), Value::String(err));
        }
        payload.insert(
            "duration_seconds".to_string(),
            serde_json::json!(duration_seconds),
        );
        let message_type = if success {
            MessageType::TaskComplete
        } else {
            MessageType::TaskFailed
        };
        let mut msg = Self::new(message_type, sender_id, format!("agent:{recipient}"), payload);
        msg.recipient_id = Some(recipient);
        msg
    }

    /// Build the response to a request, echoing its correlation id onto the
    /// `response:<correlation>` channel.
    pub fn response_to(
        request: &Message,
        sender_id: impl Into<String>,
        message_type: MessageType,
        payload: Map<String, Value>,
    ) -> Option<Self> {
        let corr = request.correlation_id.clone()?;
        let mut msg = Self::new(message_type, sender_id, format!("response:{corr}"), payload);
        msg.recipient_id = Some(request.sender_id.clone());
        msg.correlation_id = Some(corr);
        Some(msg)
    }

    /// Set an expiry relative to now.
    pub fn with_ttl(mut self, ttl: chrono::Duration) -> Self {
        self.expires_at = Some(Utc::now() + ttl);
        self
    }

    pub fn with_priority(mut self, priority: MessagePriority) -> Self {
        self.priority = priority;
        self
    }

    /// Whether the message's expiry has passed. Expired messages are never
    /// delivered.
    pub fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|at| Utc::now() > at)
    }

    /// Whether the message has no specific recipient.
    pub fn is_broadcast(&self) -> bool {
        self.recipient_id.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_serde_round_trip() {
        let mut payload = Map::new();
        payload.insert("hello".into(), Value::String("world".into()));
        let mut msg = Message::new(MessageType::System, "maestro", "system", payload);
        msg.correlation_id = Some("corr-1".into());
        msg.priority = MessagePriority::Urgent;

        let json = serde_json::to_string(&msg).unwrap();
        let back: Message = serde_json::from_str(&json).unwrap();
        assert_eq!(back, msg);
    }

    #[test]
    fn priority_serializes_numerically() {
        let json = serde_json::to_value(MessagePriority::High).unwrap();
        assert_eq!(json, serde_json::json!(7));
        assert!(serde_json::from_value::<MessagePriority>(serde_json::json!(8)).is_err());
    }

    #[test]
    fn expiry_in_the_past_marks_expired() {
        let msg = Message::new(MessageType::System, "s", "system", Map::new());
        assert!(!msg.is_expired());

        let expired = msg.clone().with_ttl(chrono::Duration::milliseconds(-1));
        assert!(expired.is_expired());
    }

    #[test]
    fn task_assign_targets_agent_inbox() {
        let msg = Message::task_assign(
            "maestro",
            "backend-1",
            serde_json::json!({"id": "t1"}),
            MessagePriority::High,
        );
        assert_eq!(msg.channel, "agent:backend-1");
        assert_eq!(msg.recipient_id.as_deref(), Some("backend-1"));
        assert_eq!(msg.payload["task"]["id"], "t1");
        assert!(!msg.is_broadcast());
    }

    #[test]
    fn response_echoes_correlation_id() {
        let mut request = Message::new(MessageType::ReflexionRequest, "a", "agent:b", Map::new());
        request.correlation_id = Some("xyz".into());

        let response =
            Message::response_to(&request, "b", MessageType::ReflexionResponse, Map::new())
                .unwrap();
        assert_eq!(response.correlation_id.as_deref(), Some("xyz"));
        assert_eq!(response.channel, "response:xyz");

        let uncorrelated = Message::new(MessageType::System, "a", "x", Map::new());
        assert!(Message::response_to(&uncorrelated, "b", MessageType::System, Map::new()).is_none());
    }
}
