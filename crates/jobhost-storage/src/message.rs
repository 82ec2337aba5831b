//! Message types for queue operations including core domain identifiers.

use crate::error::ValidationError;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;
use uuid::Uuid;

/// Suffix appended to a queue name to form its poison queue name
pub const POISON_QUEUE_SUFFIX: &str = "-poison";

// ============================================================================
// Core Domain Identifiers
// ============================================================================

/// Validated queue name: 3-63 characters, lowercase ASCII letters, digits and
/// single hyphens, starting and ending with a letter or digit.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct QueueName(String);

impl QueueName {
    /// Create new queue name with validation
    pub fn new(name: String) -> Result<Self, ValidationError> {
        if name.len() < 3 || name.len() > 63 {
            return Err(ValidationError::OutOfRange {
                field: "queue_name".to_string(),
                message: "must be 3-63 characters".to_string(),
            });
        }

        if !name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
        {
            return Err(ValidationError::InvalidFormat {
                field: "queue_name".to_string(),
                message: "only lowercase ASCII letters, digits and hyphens allowed".to_string(),
            });
        }

        if name.starts_with('-') || name.ends_with('-') || name.contains("--") {
            return Err(ValidationError::InvalidFormat {
                field: "queue_name".to_string(),
                message: "no leading/trailing hyphens or consecutive hyphens".to_string(),
            });
        }

        Ok(Self(name))
    }

    /// Name of the poison queue paired with this queue (`{name}-poison`)
    pub fn poison_queue_name(&self) -> QueueName {
        // Built from an already validated name; only the length may exceed
        // the service limit, which the service reports on first use.
        Self(format!("{}{}", self.0, POISON_QUEUE_SUFFIX))
    }

    /// Check if this queue is itself a poison queue
    pub fn is_poison_queue(&self) -> bool {
        self.0.ends_with(POISON_QUEUE_SUFFIX)
    }

    /// Get queue name as string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for QueueName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for QueueName {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s.to_string())
    }
}

/// Identifier assigned to a message when it is added to a queue
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageId(String);

impl MessageId {
    /// Generate new random message ID
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Get message ID as string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for MessageId {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err(ValidationError::Required {
                field: "message_id".to_string(),
            });
        }

        Ok(Self(s.to_string()))
    }
}

/// Opaque token proving the caller is the current holder of a dequeued message.
///
/// Every fetch and every visibility update issues a new receipt; operations
/// presenting an older receipt fail with a pop-receipt mismatch.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PopReceipt(String);

impl PopReceipt {
    /// Generate a fresh receipt
    pub fn new() -> Self {
        Self(Uuid::new_v4().simple().to_string())
    }

    /// Get receipt as string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for PopReceipt {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for PopReceipt {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for PopReceipt {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err(ValidationError::Required {
                field: "pop_receipt".to_string(),
            });
        }

        Ok(Self(s.to_string()))
    }
}

/// Timestamp wrapper for consistent time handling
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Timestamp(DateTime<Utc>);

impl Timestamp {
    /// Create timestamp for current time
    pub fn now() -> Self {
        Self(Utc::now())
    }

    /// Create timestamp from DateTime
    pub fn from_datetime(dt: DateTime<Utc>) -> Self {
        Self(dt)
    }

    /// Get underlying DateTime
    pub fn as_datetime(&self) -> DateTime<Utc> {
        self.0
    }

    /// Timestamp `duration` after this one, saturating on overflow
    pub fn add(&self, duration: Duration) -> Self {
        let delta = chrono::Duration::from_std(duration).unwrap_or(chrono::Duration::MAX);
        Self(
            self.0
                .checked_add_signed(delta)
                .unwrap_or(DateTime::<Utc>::MAX_UTC),
        )
    }

    /// RFC 3339 rendering used in binding data
    pub fn to_rfc3339(&self) -> String {
        self.0.to_rfc3339()
    }
}

impl std::fmt::Display for Timestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.format("%Y-%m-%d %H:%M:%S UTC"))
    }
}

// ============================================================================
// Message Envelope
// ============================================================================

/// A queue message as seen by the runtime.
///
/// Messages built with [`QueueMessage::new`] are unsent: they have no pop
/// receipt and a zero dequeue count. Messages returned by a fetch carry the
/// receipt and next-visible time assigned by the queue.
#[derive(Debug, Clone, PartialEq)]
pub struct QueueMessage {
    pub id: MessageId,
    pub body: Bytes,
    pub dequeue_count: u32,
    pub pop_receipt: Option<PopReceipt>,
    pub insertion_time: Option<Timestamp>,
    pub expiration_time: Option<Timestamp>,
    pub next_visible_time: Option<Timestamp>,
    /// Id of the function instance that enqueued this message, if any
    pub causality_id: Option<Uuid>,
}

impl QueueMessage {
    /// Create a new unsent message with the given body
    pub fn new(body: impl Into<Bytes>) -> Self {
        Self {
            id: MessageId::new(),
            body: body.into(),
            dequeue_count: 0,
            pop_receipt: None,
            insertion_time: None,
            expiration_time: None,
            next_visible_time: None,
            causality_id: None,
        }
    }

    /// Record the function instance that produced this message
    pub fn with_causality_id(mut self, causality_id: Uuid) -> Self {
        self.causality_id = Some(causality_id);
        self
    }

    /// Body interpreted as UTF-8, replacing invalid sequences
    pub fn body_as_string(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    /// Copy of this message suitable for adding to another queue: same body
    /// and causality, fresh identity.
    pub fn copy_for_enqueue(&self) -> Self {
        let mut copy = Self::new(self.body.clone());
        copy.causality_id = self.causality_id;
        copy
    }
}

#[cfg(test)]
#[path = "message_tests.rs"]
mod tests;
