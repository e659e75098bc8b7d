//! The endorsement toggle: flip an actor's like or favorite on a card and
//! report the resulting membership and count.
//!
//! Each toggle is a single event appended to the card's stream,
//! conditional on the version the decision was made against. Within a
//! process the card's actor serializes toggles; across processes the
//! conditional append plus catch-up-and-retry prevents lost updates.

use crate::card::{Card, CardCommand};
use crate::command::CommandContext;
use crate::endorsement::{EndorsementStatus, Relation};
use crate::error::ServiceError;
use crate::ids::{ActorId, ResourceId};
use crate::store::AggregateStore;

/// Toggles and reads endorsements on cards.
#[derive(Debug, Clone)]
pub struct ToggleService {
    store: AggregateStore,
}

impl ToggleService {
    pub fn new(store: AggregateStore) -> Self {
        Self { store }
    }

    /// Flip `actor`'s `relation` on card `resource_id` and return the state
    /// after the flip.
    ///
    /// # Errors
    ///
    /// * [`ServiceError::Unauthorized`] -- no actor; nothing is read or written.
    /// * [`ServiceError::Validation`] -- `resource_id` is malformed.
    /// * [`ServiceError::NotFound`] -- the card is missing or deleted.
    /// * [`ServiceError::Conflict`] -- concurrent writers exhausted the retry budget.
    pub async fn toggle(
        &self,
        resource_id: &str,
        relation: Relation,
        actor: Option<&ActorId>,
    ) -> Result<EndorsementStatus, ServiceError> {
        self.toggle_with_context(resource_id, relation, actor, CommandContext::default())
            .await
    }

    /// [`toggle`](Self::toggle) with caller-supplied context (e.g. a
    /// request correlation id). The actor is stamped onto `ctx`.
    pub async fn toggle_with_context(
        &self,
        resource_id: &str,
        relation: Relation,
        actor: Option<&ActorId>,
        ctx: CommandContext,
    ) -> Result<EndorsementStatus, ServiceError> {
        let actor = actor.ok_or(ServiceError::Unauthorized)?;
        let resource_id = ResourceId::new(resource_id)?;

        let handle = self.store.get::<Card>(resource_id.as_str()).await?;
        let outcome = handle
            .execute(
                CardCommand::Toggle {
                    relation,
                    actor: actor.clone(),
                },
                ctx.with_actor(actor.clone()),
            )
            .await?;

        let status = outcome.state.endorsements(relation).status_for(Some(actor));
        tracing::info!(
            resource_id = %resource_id,
            %relation,
            actor = %actor,
            is_endorsed = status.is_endorsed,
            count = status.count,
            version = outcome.version,
            "endorsement toggled"
        );
        Ok(status)
    }

    /// Current membership of `actor` (anonymous callers are never members)
    /// and the current count. Does not write.
    ///
    /// # Errors
    ///
    /// * [`ServiceError::Validation`] -- `resource_id` is malformed.
    /// * [`ServiceError::NotFound`] -- the card is missing or deleted.
    pub async fn status(
        &self,
        resource_id: &str,
        relation: Relation,
        actor: Option<&ActorId>,
    ) -> Result<EndorsementStatus, ServiceError> {
        let resource_id = ResourceId::new(resource_id)?;
        let card = self
            .store
            .get::<Card>(resource_id.as_str())
            .await?
            .state()
            .await?;
        if !card.is_live() {
            return Err(ServiceError::NotFound);
        }
        Ok(card.endorsements(relation).status_for(actor))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::backend::MemoryBackend;
    use crate::card::CardDetails;

    async fn service_with_card(id: &str) -> ToggleService {
        let store = AggregateStore::builder(Arc::new(MemoryBackend::new()))
            .open()
            .expect("open should succeed");
        store
            .get::<Card>(id)
            .await
            .unwrap()
            .execute(
                CardCommand::Create {
                    owner: ActorId::new("owner").unwrap(),
                    details: CardDetails::titled("Card"),
                    created_at: 0,
                },
                CommandContext::default(),
            )
            .await
            .expect("create should succeed");
        ToggleService::new(store)
    }

    fn actor(id: &str) -> ActorId {
        ActorId::new(id).unwrap()
    }

    #[tokio::test]
    async fn anonymous_toggle_is_unauthorized() {
        let service = service_with_card("r").await;
        let result = service.toggle("r", Relation::Like, None).await;
        assert_eq!(result, Err(ServiceError::Unauthorized));
    }

    #[tokio::test]
    async fn anonymous_toggle_is_unauthorized_even_for_missing_card() {
        let service = service_with_card("r").await;
        let result = service.toggle("missing", Relation::Like, None).await;
        assert_eq!(result, Err(ServiceError::Unauthorized));
    }

    #[tokio::test]
    async fn malformed_id_is_a_validation_error() {
        let service = service_with_card("r").await;
        let result = service
            .toggle("no spaces", Relation::Like, Some(&actor("u1")))
            .await;
        assert!(matches!(result, Err(ServiceError::Validation(_))));
        let result = service.status("", Relation::Like, None).await;
        assert!(matches!(result, Err(ServiceError::Validation(_))));
    }

    #[tokio::test]
    async fn toggle_returns_post_toggle_state() {
        let service = service_with_card("r").await;
        let u1 = actor("u1");
        let on = service.toggle("r", Relation::Favorite, Some(&u1)).await.unwrap();
        assert_eq!(
            on,
            EndorsementStatus {
                is_endorsed: true,
                count: 1
            }
        );
        let off = service.toggle("r", Relation::Favorite, Some(&u1)).await.unwrap();
        assert_eq!(
            off,
            EndorsementStatus {
                is_endorsed: false,
                count: 0
            }
        );
    }

    #[tokio::test]
    async fn status_of_missing_card_is_not_found() {
        let service = service_with_card("r").await;
        let result = service.status("nope", Relation::Like, None).await;
        assert_eq!(result, Err(ServiceError::NotFound));
    }
}
