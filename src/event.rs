//! Event encoding, decoding, and the record types shared by the backend,
//! the actor, and projections.
//!
//! No I/O happens here.

use std::fmt;
use std::time::SystemTime;

use serde::ser::Error as _;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::aggregate::Aggregate;
use crate::command::CommandContext;

/// Identity of one aggregate instance's event stream.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StreamKey {
    /// Aggregate type name (e.g. `"card"`).
    pub aggregate_type: String,
    /// Instance identifier within that type.
    pub instance_id: String,
}

impl StreamKey {
    /// Build the key for instance `instance_id` of aggregate type `A`.
    pub fn of<A: Aggregate>(instance_id: &str) -> Self {
        Self {
            aggregate_type: A::AGGREGATE_TYPE.to_owned(),
            instance_id: instance_id.to_owned(),
        }
    }
}

impl fmt::Display for StreamKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.aggregate_type, self.instance_id)
    }
}

/// Infrastructure metadata stamped on every event.
///
/// The aggregate identity makes each event self-describing, so projections
/// can route events without consulting a registry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventMetadata {
    /// Aggregate type name (e.g. `"card"`).
    pub aggregate_type: String,
    /// Aggregate instance identifier.
    pub instance_id: String,
    /// Actor identity from the command context, if provided.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actor: Option<String>,
    /// Correlation ID from the command context, if provided.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    /// Extra metadata from the command context, if provided.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extra: Option<serde_json::Value>,
}

/// An event about to be appended, before the backend assigns positions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProposedEvent {
    /// Client-assigned UUID v4 event ID.
    pub event_id: Uuid,
    /// Event type tag extracted from the adjacently tagged domain event.
    pub event_type: String,
    /// JSON payload (the `"data"` portion of the domain event).
    pub payload: serde_json::Value,
    /// Infrastructure metadata.
    pub metadata: EventMetadata,
}

/// An event as persisted by the backend and delivered to aggregates and
/// projections.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredEvent {
    /// Client-assigned event ID.
    pub event_id: Uuid,
    /// Aggregate type (e.g. `"card"`).
    pub aggregate_type: String,
    /// Aggregate instance identifier.
    pub instance_id: String,
    /// Zero-based version within the stream.
    pub stream_version: u64,
    /// Zero-based position in the global log.
    pub global_position: u64,
    /// Event type tag (e.g. `"Endorsed"`).
    pub event_type: String,
    /// Domain event payload.
    pub payload: serde_json::Value,
    /// Infrastructure metadata.
    pub metadata: EventMetadata,
    /// Backend-assigned timestamp (Unix epoch milliseconds).
    pub recorded_at: u64,
}

impl StoredEvent {
    /// The stream this event belongs to.
    pub fn stream_key(&self) -> StreamKey {
        StreamKey {
            aggregate_type: self.aggregate_type.clone(),
            instance_id: self.instance_id.clone(),
        }
    }
}

/// Current wall-clock time as Unix epoch milliseconds.
///
/// A clock set before the epoch reads as `0` rather than failing.
pub fn now_millis() -> u64 {
    SystemTime::UNIX_EPOCH
        .elapsed()
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Encode a domain event into a [`ProposedEvent`].
///
/// The domain event must use `#[serde(tag = "type", content = "data")]`:
/// `"type"` becomes [`ProposedEvent::event_type`] and `"data"` (absent for
/// unit variants) becomes the payload.
///
/// # Errors
///
/// Returns `serde_json::Error` if the event cannot be serialized or does
/// not have the adjacently tagged shape.
pub fn encode_domain_event<A: Aggregate>(
    event: &A::DomainEvent,
    ctx: &CommandContext,
    instance_id: &str,
) -> serde_json::Result<ProposedEvent> {
    let value = serde_json::to_value(event)?;
    let serde_json::Value::Object(mut obj) = value else {
        return Err(serde_json::Error::custom(
            "domain event must serialize to a JSON object",
        ));
    };

    let event_type = match obj.remove("type") {
        Some(serde_json::Value::String(tag)) => tag,
        _ => {
            return Err(serde_json::Error::custom(
                "domain event must carry a string \"type\" tag",
            ));
        }
    };
    let payload = obj.remove("data").unwrap_or(serde_json::Value::Null);

    Ok(ProposedEvent {
        event_id: Uuid::new_v4(),
        event_type,
        payload,
        metadata: EventMetadata {
            aggregate_type: A::AGGREGATE_TYPE.to_owned(),
            instance_id: instance_id.to_owned(),
            actor: ctx.actor.as_ref().map(|a| a.as_str().to_owned()),
            correlation_id: ctx.correlation_id.clone(),
            extra: ctx.metadata.clone(),
        },
    })
}

/// Decode a stored event back into `A`'s domain event.
///
/// Returns `None` for events of another aggregate type and for unknown or
/// malformed event types, which callers skip for forward compatibility.
pub fn decode_domain_event<A: Aggregate>(stored: &StoredEvent) -> Option<A::DomainEvent> {
    if stored.aggregate_type != A::AGGREGATE_TYPE {
        return None;
    }
    let tagged = if stored.payload.is_null() {
        serde_json::json!({ "type": stored.event_type })
    } else {
        serde_json::json!({ "type": stored.event_type, "data": stored.payload })
    };
    serde_json::from_value(tagged).ok()
}
