//! Message envelope
//!
//! The envelope is the only thing that moves between components: an
//! immutable value carrying sender/receiver identity, a conversation
//! thread, a typed kind tag and an opaque JSON payload. Replies preserve
//! the thread and correlation links of the original message.

use crate::ids::{MessageId, ThreadId, WorkerId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Opaque structured payload carried by an envelope
pub type Payload = serde_json::Map<String, serde_json::Value>;

/// Closed set of message kinds understood by the mesh
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    /// Imperative command, interpreted through the `command` payload field
    Command,

    /// Reply to a command or query
    Response,

    /// Error report, usually a reply to a failed message
    Error,

    /// Periodic worker status beacon
    Heartbeat,

    /// Orchestrator assigning a task to a worker
    #[serde(rename = "agent_task_assign")]
    TaskAssign,

    /// Worker reporting successful task completion
    #[serde(rename = "agent_task_complete")]
    TaskComplete,

    /// Worker reporting task failure
    #[serde(rename = "agent_task_fail")]
    TaskFail,

    /// Terminal notification for a whole workflow execution
    WorkflowComplete,
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MessageKind::Command => "command",
            MessageKind::Response => "response",
            MessageKind::Error => "error",
            MessageKind::Heartbeat => "heartbeat",
            MessageKind::TaskAssign => "agent_task_assign",
            MessageKind::TaskComplete => "agent_task_complete",
            MessageKind::TaskFail => "agent_task_fail",
            MessageKind::WorkflowComplete => "workflow_complete",
        };
        f.write_str(s)
    }
}

/// Advisory message priority; not a delivery-order guarantee
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

/// Immutable message unit routed between workers and the orchestrator
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub id: MessageId,
    pub sender_id: WorkerId,
    pub receiver_id: WorkerId,
    pub kind: MessageKind,
    pub thread_id: ThreadId,
    pub payload: Payload,
    pub timestamp: DateTime<Utc>,
    pub priority: Priority,
    pub reply_to: Option<MessageId>,
    pub correlation_id: Option<String>,
}

impl Envelope {
    /// Build a new envelope with a fresh id and the current timestamp
    pub fn new(
        sender_id: WorkerId,
        receiver_id: WorkerId,
        kind: MessageKind,
        thread_id: ThreadId,
        payload: Payload,
    ) -> Self {
        Self {
            id: MessageId::new(),
            sender_id,
            receiver_id,
            kind,
            thread_id,
            payload,
            timestamp: Utc::now(),
            priority: Priority::Normal,
            reply_to: None,
            correlation_id: None,
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_correlation(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    /// Build a reply to this envelope
    ///
    /// The reply keeps the original thread and correlation id, links back
    /// to the original message id and swaps the receiver to the original
    /// sender. It gets a fresh id of its own.
    pub fn reply(&self, sender_id: WorkerId, kind: MessageKind, payload: Payload) -> Self {
        Self {
            id: MessageId::new(),
            sender_id,
            receiver_id: self.sender_id.clone(),
            kind,
            thread_id: self.thread_id.clone(),
            payload,
            timestamp: Utc::now(),
            priority: self.priority,
            reply_to: Some(self.id),
            correlation_id: self.correlation_id.clone(),
        }
    }

    /// Copy of this envelope readdressed to another worker, with a fresh id
    ///
    /// Used by broadcast fan-out so every delivered copy stays uniquely
    /// identifiable.
    pub fn readdressed(&self, receiver_id: WorkerId) -> Self {
        Self {
            id: MessageId::new(),
            receiver_id,
            ..self.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload(key: &str, value: &str) -> Payload {
        let mut map = Payload::new();
        map.insert(key.to_string(), serde_json::json!(value));
        map
    }

    #[test]
    fn reply_preserves_thread_and_correlation() {
        let original = Envelope::new(
            WorkerId::from("orchestrator"),
            WorkerId::from("severity_analyzer"),
            MessageKind::Command,
            ThreadId::new("wf-42").expect("non-empty"),
            payload("command", "execute_task"),
        )
        .with_correlation("task-1");

        let reply = original.reply(
            WorkerId::from("severity_analyzer"),
            MessageKind::Response,
            payload("status", "accepted"),
        );

        assert_eq!(reply.thread_id, original.thread_id);
        assert_eq!(reply.correlation_id, original.correlation_id);
        assert_eq!(reply.reply_to, Some(original.id));
        assert_eq!(reply.receiver_id, original.sender_id);
        assert_ne!(reply.id, original.id);
    }

    #[test]
    fn readdressed_copy_gets_fresh_id() {
        let original = Envelope::new(
            WorkerId::from("orchestrator"),
            WorkerId::from("a"),
            MessageKind::Heartbeat,
            ThreadId::generate(),
            Payload::new(),
        );
        let copy = original.readdressed(WorkerId::from("b"));

        assert_ne!(copy.id, original.id);
        assert_eq!(copy.receiver_id, WorkerId::from("b"));
        assert_eq!(copy.thread_id, original.thread_id);
    }

    #[test]
    fn kind_serializes_to_wire_names() {
        let json = serde_json::to_string(&MessageKind::TaskComplete).expect("serialize");
        assert_eq!(json, "\"agent_task_complete\"");
        let json = serde_json::to_string(&MessageKind::Command).expect("serialize");
        assert_eq!(json, "\"command\"");
    }

    #[test]
    fn priority_ordering() {
        assert!(Priority::Low < Priority::Normal);
        assert!(Priority::High < Priority::Critical);
        assert_eq!(Priority::default(), Priority::Normal);
    }
}
