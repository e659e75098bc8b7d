//! Request-scoped metadata carried alongside aggregate commands.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ids::ActorId;

/// Who issued a command and on behalf of which request.
///
/// Every event the command produces records these values in its
/// [`EventMetadata`](crate::event::EventMetadata), giving an audit trail
/// of endorsements without widening the event payloads.
///
/// # Examples
///
/// ```
/// use cardfold::{ActorId, CommandContext};
/// use serde_json::json;
///
/// let ctx = CommandContext::default()
///     .with_actor(ActorId::new("user-42").unwrap())
///     .with_correlation_id("req-abc-123")
///     .with_metadata(json!({"source": "api"}));
///
/// assert_eq!(ctx.actor.as_ref().map(|a| a.as_str()), Some("user-42"));
/// assert_eq!(ctx.correlation_id.as_deref(), Some("req-abc-123"));
/// assert!(ctx.metadata.is_some());
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CommandContext {
    pub actor: Option<ActorId>,
    /// Typically the HTTP request id.
    pub correlation_id: Option<String>,
    /// Free-form JSON copied to `EventMetadata::extra`.
    pub metadata: Option<Value>,
}

impl CommandContext {
    pub fn with_actor(mut self, actor: ActorId) -> Self {
        self.actor = Some(actor);
        self
    }

    pub fn with_correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }

    pub fn with_metadata(mut self, meta: Value) -> Self {
        self.metadata = Some(meta);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn default_context_has_no_fields_set() {
        let ctx = CommandContext::default();
        assert_eq!(ctx.actor, None);
        assert_eq!(ctx.correlation_id, None);
        assert_eq!(ctx.metadata, None);
    }

    #[test]
    fn builder_chains_all_fields() {
        let ctx = CommandContext::default()
            .with_actor(ActorId::new("admin").unwrap())
            .with_correlation_id(String::from("req-abc"))
            .with_metadata(json!({"source": "test"}));

        assert_eq!(ctx.actor.as_ref().map(ActorId::as_str), Some("admin"));
        assert_eq!(ctx.correlation_id.as_deref(), Some("req-abc"));
        assert_eq!(ctx.metadata, Some(json!({"source": "test"})));
    }

    #[test]
    fn actor_serializes_as_plain_string() {
        let ctx = CommandContext::default().with_actor(ActorId::new("user-1").unwrap());
        let value = serde_json::to_value(&ctx).expect("serialization should succeed");
        assert_eq!(value["actor"], "user-1");
    }

    #[test]
    fn invalid_actor_is_rejected_on_deserialize() {
        let result = serde_json::from_value::<CommandContext>(json!({
            "actor": "not valid!",
            "correlation_id": null,
            "metadata": null
        }));
        assert!(result.is_err());
    }
}
