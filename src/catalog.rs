//! The card catalog: a read model of every live card, used for listings,
//! sorting by endorsement counts, and each user's saved favorites.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::card::{Card, CardDetails, CardEvent};
use crate::endorsement::{EndorsementSet, Relation};
use crate::event::{StoredEvent, decode_domain_event};
use crate::ids::{ActorId, ResourceId};
use crate::projection::Projection;

/// Page size used when a query does not specify one.
pub const DEFAULT_LIST_LIMIT: usize = 50;
/// Largest page a query may request.
pub const MAX_LIST_LIMIT: usize = 200;

/// One live card as the catalog sees it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CardEntry {
    pub owner: ActorId,
    pub details: CardDetails,
    pub created_at: u64,
    pub likes: EndorsementSet,
    pub favorites: EndorsementSet,
}

impl CardEntry {
    pub fn endorsements(&self, relation: Relation) -> &EndorsementSet {
        match relation {
            Relation::Like => &self.likes,
            Relation::Favorite => &self.favorites,
        }
    }

    fn endorsements_mut(&mut self, relation: Relation) -> &mut EndorsementSet {
        match relation {
            Relation::Like => &mut self.likes,
            Relation::Favorite => &mut self.favorites,
        }
    }
}

/// Field a listing is ordered by.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortKey {
    Likes,
    Favorites,
    #[default]
    Created,
    Title,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    Asc,
    #[default]
    Desc,
}

/// Listing parameters, as accepted in a query string.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ListQuery {
    pub sort: SortKey,
    pub order: SortOrder,
    pub offset: usize,
    /// Clamped to `1..=MAX_LIST_LIMIT`.
    pub limit: usize,
    /// Only cards created by this actor.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub owner: Option<ActorId>,
}

impl Default for ListQuery {
    fn default() -> Self {
        Self {
            sort: SortKey::default(),
            order: SortOrder::default(),
            offset: 0,
            limit: DEFAULT_LIST_LIMIT,
            owner: None,
        }
    }
}

impl ListQuery {
    pub fn effective_limit(&self) -> usize {
        self.limit.clamp(1, MAX_LIST_LIMIT)
    }
}

/// A card as returned to API callers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CardView {
    pub id: ResourceId,
    #[serde(flatten)]
    pub details: CardDetails,
    pub owner: ActorId,
    pub created_at: u64,
    pub like_count: u64,
    pub favorite_count: u64,
    /// Present only for authenticated callers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_liked_by_caller: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_favorited_by_caller: Option<bool>,
}

impl CardView {
    fn build(
        id: ResourceId,
        owner: ActorId,
        details: CardDetails,
        created_at: u64,
        likes: &EndorsementSet,
        favorites: &EndorsementSet,
        caller: Option<&ActorId>,
    ) -> Self {
        Self {
            id,
            details,
            owner,
            created_at,
            like_count: likes.count(),
            favorite_count: favorites.count(),
            is_liked_by_caller: caller.map(|c| likes.contains(c)),
            is_favorited_by_caller: caller.map(|c| favorites.contains(c)),
        }
    }

    /// View of a catalog entry.
    pub fn from_entry(id: &ResourceId, entry: &CardEntry, caller: Option<&ActorId>) -> Self {
        Self::build(
            id.clone(),
            entry.owner.clone(),
            entry.details.clone(),
            entry.created_at,
            &entry.likes,
            &entry.favorites,
            caller,
        )
    }

    /// View of aggregate state; `None` unless the card is live.
    pub fn from_card(id: &ResourceId, card: &Card, caller: Option<&ActorId>) -> Option<Self> {
        if !card.is_live() {
            return None;
        }
        Some(Self::build(
            id.clone(),
            card.owner.clone()?,
            card.details.clone(),
            card.created_at,
            &card.likes,
            &card.favorites,
            caller,
        ))
    }
}

/// Projection of every live card. Deleted cards are dropped.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CardCatalog {
    cards: BTreeMap<ResourceId, CardEntry>,
}

impl Projection for CardCatalog {
    const NAME: &'static str = "card-catalog";

    fn apply(&mut self, event: &StoredEvent) {
        let Some(card_event) = decode_domain_event::<Card>(event) else {
            return;
        };
        let Ok(id) = ResourceId::new(event.instance_id.as_str()) else {
            tracing::warn!(instance_id = %event.instance_id, "card event with invalid id");
            return;
        };

        match card_event {
            CardEvent::Created {
                owner,
                details,
                created_at,
            } => {
                self.cards.insert(
                    id,
                    CardEntry {
                        owner,
                        details,
                        created_at,
                        likes: EndorsementSet::default(),
                        favorites: EndorsementSet::default(),
                    },
                );
            }
            CardEvent::Updated { details } => {
                if let Some(entry) = self.cards.get_mut(&id) {
                    entry.details = details;
                }
            }
            CardEvent::Endorsed { relation, actor } => {
                if let Some(entry) = self.cards.get_mut(&id) {
                    entry.endorsements_mut(relation).insert(actor);
                }
            }
            CardEvent::Withdrawn { relation, actor } => {
                if let Some(entry) = self.cards.get_mut(&id) {
                    entry.endorsements_mut(relation).remove(&actor);
                }
            }
            CardEvent::Deleted => {
                self.cards.remove(&id);
            }
        }
    }
}

impl CardCatalog {
    pub fn get(&self, id: &ResourceId) -> Option<&CardEntry> {
        self.cards.get(id)
    }

    /// Number of live cards.
    pub fn len(&self) -> usize {
        self.cards.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cards.is_empty()
    }

    /// One page of cards, ordered by `query.sort` and `query.order`.
    ///
    /// Cards with equal sort keys are ordered by id ascending whatever the
    /// direction, so pages are stable across calls.
    pub fn list<'a>(
        &'a self,
        query: &ListQuery,
        caller: Option<&'a ActorId>,
    ) -> impl Iterator<Item = CardView> + 'a {
        let mut rows: Vec<(&ResourceId, &CardEntry)> = self
            .cards
            .iter()
            .filter(|(_, e)| query.owner.as_ref().is_none_or(|o| &e.owner == o))
            .collect();

        let (sort, order) = (query.sort, query.order);
        rows.sort_by(|(a_id, a), (b_id, b)| {
            let primary = compare(sort, a, b);
            let primary = match order {
                SortOrder::Asc => primary,
                SortOrder::Desc => primary.reverse(),
            };
            primary.then_with(|| a_id.cmp(b_id))
        });

        rows.into_iter()
            .skip(query.offset)
            .take(query.effective_limit())
            .map(move |(id, entry)| CardView::from_entry(id, entry, caller))
    }

    /// Every card `actor` has favorited, ordered by id.
    pub fn favorites_of<'a>(&'a self, actor: &'a ActorId) -> impl Iterator<Item = CardView> + 'a {
        self.cards
            .iter()
            .filter(move |(_, e)| e.favorites.contains(actor))
            .map(move |(id, e)| CardView::from_entry(id, e, Some(actor)))
    }
}

fn compare(sort: SortKey, a: &CardEntry, b: &CardEntry) -> Ordering {
    match sort {
        SortKey::Likes => a.likes.count().cmp(&b.likes.count()),
        SortKey::Favorites => a.favorites.count().cmp(&b.favorites.count()),
        SortKey::Created => a.created_at.cmp(&b.created_at),
        SortKey::Title => a
            .details
            .title
            .chars()
            .flat_map(char::to_lowercase)
            .cmp(b.details.title.chars().flat_map(char::to_lowercase)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::CommandContext;
    use crate::event::encode_domain_event;

    struct Log {
        position: u64,
        catalog: CardCatalog,
    }

    impl Log {
        fn new() -> Self {
            Self {
                position: 0,
                catalog: CardCatalog::default(),
            }
        }

        fn emit(&mut self, card: &str, event: CardEvent) {
            let proposed =
                encode_domain_event::<Card>(&event, &CommandContext::default(), card).unwrap();
            let stored = StoredEvent {
                event_id: proposed.event_id,
                aggregate_type: proposed.metadata.aggregate_type.clone(),
                instance_id: card.to_owned(),
                stream_version: 0,
                global_position: self.position,
                event_type: proposed.event_type,
                payload: proposed.payload,
                metadata: proposed.metadata,
                recorded_at: 0,
            };
            self.position += 1;
            self.catalog.apply(&stored);
        }

        fn create(&mut self, card: &str, owner: &str, title: &str, created_at: u64) {
            self.emit(
                card,
                CardEvent::Created {
                    owner: actor(owner),
                    details: CardDetails::titled(title),
                    created_at,
                },
            );
        }

        fn endorse(&mut self, card: &str, relation: Relation, who: &str) {
            self.emit(
                card,
                CardEvent::Endorsed {
                    relation,
                    actor: actor(who),
                },
            );
        }
    }

    fn actor(id: &str) -> ActorId {
        ActorId::new(id).unwrap()
    }

    fn ids(views: impl Iterator<Item = CardView>) -> Vec<String> {
        views.map(|v| v.id.to_string()).collect()
    }

    fn seeded() -> Log {
        let mut log = Log::new();
        log.create("a", "biz", "Zeta", 3);
        log.create("b", "biz", "alpha", 1);
        log.create("c", "other", "Mid", 2);
        log.endorse("b", Relation::Like, "u1");
        log.endorse("b", Relation::Like, "u2");
        log.endorse("c", Relation::Like, "u1");
        log.endorse("a", Relation::Favorite, "u1");
        log
    }

    #[test]
    fn default_listing_is_newest_first() {
        let log = seeded();
        let views = log.catalog.list(&ListQuery::default(), None);
        assert_eq!(ids(views), vec!["a", "c", "b"]);
    }

    #[test]
    fn sort_by_likes_desc_breaks_ties_by_id() {
        let log = seeded();
        let query = ListQuery {
            sort: SortKey::Likes,
            ..ListQuery::default()
        };
        // a has 0 likes, b 2, c 1.
        assert_eq!(ids(log.catalog.list(&query, None)), vec!["b", "c", "a"]);

        let mut log = log;
        log.endorse("a", Relation::Like, "u3");
        // a and c tie at 1 like: id ascending in both directions.
        assert_eq!(ids(log.catalog.list(&query, None)), vec!["b", "a", "c"]);
        let asc = ListQuery {
            order: SortOrder::Asc,
            ..query
        };
        assert_eq!(ids(log.catalog.list(&asc, None)), vec!["a", "c", "b"]);
    }

    #[test]
    fn title_sort_ignores_case() {
        let log = seeded();
        let query = ListQuery {
            sort: SortKey::Title,
            order: SortOrder::Asc,
            ..ListQuery::default()
        };
        assert_eq!(ids(log.catalog.list(&query, None)), vec!["b", "c", "a"]);
    }

    #[test]
    fn offset_limit_and_owner_filter() {
        let log = seeded();
        let query = ListQuery {
            order: SortOrder::Asc,
            offset: 1,
            limit: 1,
            ..ListQuery::default()
        };
        assert_eq!(ids(log.catalog.list(&query, None)), vec!["c"]);

        let query = ListQuery {
            owner: Some(actor("biz")),
            ..ListQuery::default()
        };
        assert_eq!(ids(log.catalog.list(&query, None)), vec!["a", "b"]);
    }

    #[test]
    fn limit_is_clamped() {
        let over = ListQuery {
            limit: 10_000,
            ..ListQuery::default()
        };
        assert_eq!(over.effective_limit(), MAX_LIST_LIMIT);
        let zero = ListQuery {
            limit: 0,
            ..ListQuery::default()
        };
        assert_eq!(zero.effective_limit(), 1);
    }

    #[test]
    fn caller_flags_only_for_authenticated_callers() {
        let log = seeded();
        let u1 = actor("u1");
        let query = ListQuery::default();

        let anon: Vec<_> = log.catalog.list(&query, None).collect();
        assert!(anon.iter().all(|v| v.is_liked_by_caller.is_none()));

        let views: Vec<_> = log.catalog.list(&query, Some(&u1)).collect();
        let b = views.iter().find(|v| v.id.as_str() == "b").unwrap();
        assert_eq!(b.is_liked_by_caller, Some(true));
        assert_eq!(b.is_favorited_by_caller, Some(false));
        assert_eq!(b.like_count, 2);
    }

    #[test]
    fn withdraw_and_delete_update_the_catalog() {
        let mut log = seeded();
        log.emit(
            "b",
            CardEvent::Withdrawn {
                relation: Relation::Like,
                actor: actor("u2"),
            },
        );
        assert_eq!(
            log.catalog
                .get(&ResourceId::new("b").unwrap())
                .unwrap()
                .endorsements(Relation::Like)
                .count(),
            1
        );

        log.emit("a", CardEvent::Deleted);
        assert_eq!(log.catalog.len(), 2);
        assert!(log.catalog.favorites_of(&actor("u1")).next().is_none());
    }

    #[test]
    fn favorites_of_lists_saved_cards_by_id() {
        let mut log = seeded();
        log.endorse("c", Relation::Favorite, "u1");
        let u1 = actor("u1");
        let saved: Vec<_> = log.catalog.favorites_of(&u1).collect();
        assert_eq!(ids(saved.clone().into_iter()), vec!["a", "c"]);
        assert!(saved.iter().all(|v| v.is_favorited_by_caller == Some(true)));
        assert!(log.catalog.favorites_of(&actor("u2")).next().is_none());
    }

    #[test]
    fn query_string_defaults_and_parsing() {
        let q: ListQuery =
            serde_json::from_value(serde_json::json!({ "sort": "likes", "order": "asc" }))
                .unwrap();
        assert_eq!(q.sort, SortKey::Likes);
        assert_eq!(q.order, SortOrder::Asc);
        assert_eq!(q.limit, DEFAULT_LIST_LIMIT);
        assert!(serde_json::from_value::<ListQuery>(serde_json::json!({ "sort": "rank" })).is_err());
    }

    #[test]
    fn view_serializes_flat_camel_case() {
        let log = seeded();
        let view = log.catalog.list(&ListQuery::default(), None).next().unwrap();
        let json = serde_json::to_value(&view).unwrap();
        assert_eq!(json["id"], "a");
        assert_eq!(json["title"], "Zeta");
        assert_eq!(json["likeCount"], 0);
        assert_eq!(json["favoriteCount"], 1);
        assert!(json.get("isLikedByCaller").is_none());
    }
}
