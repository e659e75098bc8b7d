//! Card lifecycle: creation, editing, deletion, and reads.

use crate::auth::Principal;
use crate::card::{Card, CardCommand, CardDetails};
use crate::catalog::{CardCatalog, CardView, ListQuery};
use crate::command::CommandContext;
use crate::error::ServiceError;
use crate::event::now_millis;
use crate::ids::{ActorId, ResourceId};
use crate::store::AggregateStore;

/// Creates, edits, deletes, and reads cards.
///
/// Single-card reads go to the card's aggregate and are strongly
/// consistent. Listings come from the [`CardCatalog`] projection, which is
/// caught up on every read.
#[derive(Debug, Clone)]
pub struct CardService {
    store: AggregateStore,
}

impl CardService {
    pub fn new(store: AggregateStore) -> Self {
        Self { store }
    }

    /// Create a card owned by `principal`.
    ///
    /// # Errors
    ///
    /// [`ServiceError::Forbidden`] unless the principal is a business
    /// account or administrator; [`ServiceError::Validation`] for bad details.
    pub async fn create(
        &self,
        principal: &Principal,
        details: CardDetails,
    ) -> Result<CardView, ServiceError> {
        if !principal.can_create() {
            return Err(ServiceError::Forbidden(
                "only business accounts may create cards".into(),
            ));
        }
        let id = ResourceId::generate();
        let outcome = self
            .store
            .get::<Card>(id.as_str())
            .await?
            .execute(
                CardCommand::Create {
                    owner: principal.id.clone(),
                    details,
                    created_at: now_millis(),
                },
                context_for(principal),
            )
            .await?;

        tracing::info!(card_id = %id, owner = %principal.id, "card created");
        CardView::from_card(&id, &outcome.state, Some(&principal.id)).ok_or(ServiceError::NotFound)
    }

    /// Replace the details of card `id`.
    ///
    /// # Errors
    ///
    /// [`ServiceError::NotFound`], [`ServiceError::Forbidden`] for anyone but
    /// the owner or an administrator, or [`ServiceError::Validation`].
    pub async fn update(
        &self,
        principal: &Principal,
        id: &str,
        details: CardDetails,
    ) -> Result<CardView, ServiceError> {
        let id = ResourceId::new(id)?;
        let outcome = self
            .store
            .get::<Card>(id.as_str())
            .await?
            .execute(
                CardCommand::Update {
                    editor: principal.clone(),
                    details,
                },
                context_for(principal),
            )
            .await?;

        tracing::info!(card_id = %id, editor = %principal.id, "card updated");
        CardView::from_card(&id, &outcome.state, Some(&principal.id)).ok_or(ServiceError::NotFound)
    }

    /// Delete card `id` together with all of its endorsements.
    ///
    /// # Errors
    ///
    /// [`ServiceError::NotFound`] or [`ServiceError::Forbidden`].
    pub async fn delete(&self, principal: &Principal, id: &str) -> Result<(), ServiceError> {
        let id = ResourceId::new(id)?;
        self.store
            .get::<Card>(id.as_str())
            .await?
            .execute(
                CardCommand::Delete {
                    requested_by: principal.clone(),
                },
                context_for(principal),
            )
            .await?;
        tracing::info!(card_id = %id, by = %principal.id, "card deleted");
        Ok(())
    }

    /// Read card `id`, flagging the caller's endorsements when known.
    ///
    /// # Errors
    ///
    /// [`ServiceError::NotFound`] if the card is missing or deleted.
    pub async fn get(&self, id: &str, caller: Option<&ActorId>) -> Result<CardView, ServiceError> {
        let id = ResourceId::new(id)?;
        let card = self.store.get::<Card>(id.as_str()).await?.state().await?;
        CardView::from_card(&id, &card, caller).ok_or(ServiceError::NotFound)
    }

    /// One page of the catalog.
    pub async fn list(
        &self,
        query: &ListQuery,
        caller: Option<&ActorId>,
    ) -> Result<Vec<CardView>, ServiceError> {
        let views: Vec<CardView> = self
            .store
            .with_projection(|catalog: &CardCatalog| catalog.list(query, caller).collect())
            .await?;
        Ok(views)
    }

    /// Every card `actor` has favorited.
    pub async fn favorites_of(&self, actor: &ActorId) -> Result<Vec<CardView>, ServiceError> {
        let views: Vec<CardView> = self
            .store
            .with_projection(|catalog: &CardCatalog| catalog.favorites_of(actor).collect())
            .await?;
        Ok(views)
    }
}

fn context_for(principal: &Principal) -> CommandContext {
    CommandContext::default().with_actor(principal.id.clone())
}
