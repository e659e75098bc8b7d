//! The card aggregate: a business card with like and favorite endorsements.
//!
//! Every state change, including each endorsement toggle, is one event in
//! the card's stream. The membership sets and their cached counts live in
//! the same aggregate, so one append covers both.

use serde::{Deserialize, Serialize};

use crate::aggregate::Aggregate;
use crate::auth::Principal;
use crate::endorsement::{EndorsementSet, Relation};
use crate::ids::ActorId;

const MAX_TITLE_LEN: usize = 256;
const MAX_FIELD_LEN: usize = 2048;

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

/// The editable, descriptive part of a card.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CardDetails {
    /// Display name on the card. Required.
    pub title: String,
    #[serde(default)]
    pub subtitle: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub phone: String,
    /// Contact email; empty or a plausible `local@domain.tld`.
    #[serde(default)]
    pub email: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub web: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
}

impl CardDetails {
    /// Details with only a title set.
    pub fn titled(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            ..Self::default()
        }
    }

    /// Validate field contents.
    ///
    /// # Errors
    ///
    /// Returns [`CardError::Invalid`] naming the first offending field.
    pub fn validate(&self) -> Result<(), CardError> {
        let title = self.title.trim();
        if title.is_empty() {
            return Err(CardError::Invalid("title must not be empty".into()));
        }
        if title.chars().count() > MAX_TITLE_LEN {
            return Err(CardError::Invalid(format!(
                "title exceeds {MAX_TITLE_LEN} characters"
            )));
        }
        if !self.email.is_empty() && !looks_like_email(&self.email) {
            return Err(CardError::Invalid(format!(
                "malformed email: {}",
                self.email
            )));
        }

        let long_field = [
            ("subtitle", Some(&self.subtitle)),
            ("description", Some(&self.description)),
            ("phone", Some(&self.phone)),
            ("web", self.web.as_ref()),
            ("imageUrl", self.image_url.as_ref()),
            ("address", self.address.as_ref()),
        ]
        .into_iter()
        .find(|(_, v)| v.is_some_and(|v| v.chars().count() > MAX_FIELD_LEN));
        if let Some((name, _)) = long_field {
            return Err(CardError::Invalid(format!(
                "{name} exceeds {MAX_FIELD_LEN} characters"
            )));
        }
        Ok(())
    }
}

fn looks_like_email(value: &str) -> bool {
    let mut parts = value.splitn(2, '@');
    let (Some(local), Some(domain)) = (parts.next(), parts.next()) else {
        return false;
    };
    !local.is_empty()
        && !domain.contains('@')
        && !value.chars().any(char::is_whitespace)
        && domain
            .split_once('.')
            .is_some_and(|(host, tld)| !host.is_empty() && !tld.is_empty())
}

/// A business card.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Card {
    /// The actor who created the card.
    pub owner: Option<ActorId>,
    pub details: CardDetails,
    pub likes: EndorsementSet,
    pub favorites: EndorsementSet,
    /// Creation time, Unix epoch milliseconds.
    pub created_at: u64,
    /// Guards against a second `Create` on the same id.
    pub created: bool,
    pub deleted: bool,
}

impl Card {
    /// Created and not deleted.
    pub fn is_live(&self) -> bool {
        self.created && !self.deleted
    }

    /// The endorsement set for `relation`.
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

    fn ensure_manageable_by(&self, principal: &Principal) -> Result<(), CardError> {
        if principal.can_manage(self.owner.as_ref()) {
            Ok(())
        } else {
            Err(CardError::Forbidden)
        }
    }
}

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

/// Commands accepted by the [`Card`] aggregate.
#[derive(Debug, Clone)]
pub enum CardCommand {
    /// Create the card.
    Create {
        owner: ActorId,
        details: CardDetails,
        created_at: u64,
    },
    /// Replace the card's details.
    Update {
        editor: Principal,
        details: CardDetails,
    },
    /// Flip `actor`'s membership in the `relation` set.
    Toggle { relation: Relation, actor: ActorId },
    /// Delete the card and every endorsement on it.
    Delete { requested_by: Principal },
}

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

/// Domain events produced by the [`Card`] aggregate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum CardEvent {
    Created {
        owner: ActorId,
        details: CardDetails,
        created_at: u64,
    },
    Updated {
        details: CardDetails,
    },
    /// `actor` joined the `relation` set.
    Endorsed { relation: Relation, actor: ActorId },
    /// `actor` left the `relation` set.
    Withdrawn { relation: Relation, actor: ActorId },
    Deleted,
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors that can occur when handling a [`CardCommand`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CardError {
    /// The card was never created or has been deleted.
    #[error("card not found")]
    NotFound,
    /// A card with this id already exists (or existed).
    #[error("card already exists")]
    AlreadyExists,
    /// The caller neither owns the card nor is an administrator.
    #[error("only the owner or an administrator may change this card")]
    Forbidden,
    /// Field validation failed.
    #[error("{0}")]
    Invalid(String),
}

impl Aggregate for Card {
    const AGGREGATE_TYPE: &'static str = "card";

    type Command = CardCommand;
    type DomainEvent = CardEvent;
    type Error = CardError;

    fn handle(&self, cmd: CardCommand) -> Result<Vec<CardEvent>, CardError> {
        match cmd {
            CardCommand::Create {
                owner,
                details,
                created_at,
            } => {
                if self.created {
                    return Err(CardError::AlreadyExists);
                }
                details.validate()?;
                Ok(vec![CardEvent::Created {
                    owner,
                    details,
                    created_at,
                }])
            }
            CardCommand::Update { editor, details } => {
                if !self.is_live() {
                    return Err(CardError::NotFound);
                }
                self.ensure_manageable_by(&editor)?;
                details.validate()?;
                if details == self.details {
                    return Ok(vec![]);
                }
                Ok(vec![CardEvent::Updated { details }])
            }
            CardCommand::Toggle { relation, actor } => {
                if !self.is_live() {
                    return Err(CardError::NotFound);
                }
                if self.endorsements(relation).contains(&actor) {
                    Ok(vec![CardEvent::Withdrawn { relation, actor }])
                } else {
                    Ok(vec![CardEvent::Endorsed { relation, actor }])
                }
            }
            CardCommand::Delete { requested_by } => {
                if !self.is_live() {
                    return Err(CardError::NotFound);
                }
                self.ensure_manageable_by(&requested_by)?;
                Ok(vec![CardEvent::Deleted])
            }
        }
    }

    fn apply(mut self, event: &CardEvent) -> Self {
        match event {
            CardEvent::Created {
                owner,
                details,
                created_at,
            } => {
                self.owner = Some(owner.clone());
                self.details = details.clone();
                self.created_at = *created_at;
                self.created = true;
            }
            CardEvent::Updated { details } => self.details = details.clone(),
            CardEvent::Endorsed { relation, actor } => {
                self.endorsements_mut(*relation).insert(actor.clone());
            }
            CardEvent::Withdrawn { relation, actor } => {
                self.endorsements_mut(*relation).remove(actor);
            }
            CardEvent::Deleted => {
                self.deleted = true;
                self.likes.clear();
                self.favorites.clear();
            }
        }
        self
    }

    fn verify(&self) -> bool {
        self.likes.check().is_ok() && self.favorites.check().is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::Role;
    use proptest::prelude::*;

    fn actor(id: &str) -> ActorId {
        ActorId::new(id).expect("valid actor id")
    }

    fn principal(id: &str, role: Role) -> Principal {
        Principal::new(actor(id), role)
    }

    fn fold(card: Card, events: Vec<CardEvent>) -> Card {
        events.iter().fold(card, |state, e| state.apply(e))
    }

    fn execute(card: Card, cmd: CardCommand) -> Result<Card, CardError> {
        let events = card.handle(cmd)?;
        Ok(fold(card, events))
    }

    fn live_card() -> Card {
        execute(
            Card::default(),
            CardCommand::Create {
                owner: actor("owner"),
                details: CardDetails::titled("Futurist"),
                created_at: 42,
            },
        )
        .expect("create should succeed")
    }

    fn toggle(card: Card, relation: Relation, who: &str) -> Card {
        execute(
            card,
            CardCommand::Toggle {
                relation,
                actor: actor(who),
            },
        )
        .expect("toggle should succeed")
    }

    #[test]
    fn create_sets_owner_and_empty_endorsements() {
        let card = live_card();
        assert!(card.is_live());
        assert_eq!(card.owner, Some(actor("owner")));
        assert_eq!(card.created_at, 42);
        assert_eq!(card.likes.count(), 0);
        assert_eq!(card.favorites.count(), 0);
    }

    #[test]
    fn create_twice_is_rejected() {
        let result = live_card().handle(CardCommand::Create {
            owner: actor("other"),
            details: CardDetails::titled("Again"),
            created_at: 1,
        });
        assert_eq!(result, Err(CardError::AlreadyExists));
    }

    #[test]
    fn create_validates_details() {
        let result = Card::default().handle(CardCommand::Create {
            owner: actor("o"),
            details: CardDetails::titled("   "),
            created_at: 0,
        });
        assert!(matches!(result, Err(CardError::Invalid(_))));
    }

    #[test]
    fn email_validation() {
        let mut details = CardDetails::titled("T");
        for ok in ["", "a@b.co", "first.last@example.org"] {
            details.email = ok.into();
            assert!(details.validate().is_ok(), "{ok} should be accepted");
        }
        for bad in ["nope", "@b.co", "a@b", "a@@b.co", "a b@c.de", "a@.com"] {
            details.email = bad.into();
            assert!(details.validate().is_err(), "{bad} should be rejected");
        }
    }

    #[test]
    fn toggle_on_then_off() {
        let card = toggle(live_card(), Relation::Like, "u1");
        assert!(card.likes.contains(&actor("u1")));
        assert_eq!(card.likes.count(), 1);

        let card = toggle(card, Relation::Like, "u1");
        assert!(!card.likes.contains(&actor("u1")));
        assert_eq!(card.likes.count(), 0);
    }

    #[test]
    fn likes_and_favorites_are_independent() {
        let card = toggle(live_card(), Relation::Favorite, "u1");
        assert_eq!(card.favorites.count(), 1);
        assert_eq!(card.likes.count(), 0);
        assert!(!card.likes.contains(&actor("u1")));
    }

    #[test]
    fn toggle_missing_card_is_not_found() {
        let result = Card::default().handle(CardCommand::Toggle {
            relation: Relation::Like,
            actor: actor("u1"),
        });
        assert_eq!(result, Err(CardError::NotFound));
    }

    #[test]
    fn delete_clears_endorsements_and_blocks_toggles() {
        let card = toggle(live_card(), Relation::Like, "u1");
        let card = toggle(card, Relation::Favorite, "u2");
        let card = execute(
            card,
            CardCommand::Delete {
                requested_by: principal("owner", Role::Business),
            },
        )
        .expect("owner may delete");

        assert!(!card.is_live());
        assert_eq!(card.likes.count(), 0);
        assert_eq!(card.favorites.count(), 0);
        assert_eq!(
            card.handle(CardCommand::Toggle {
                relation: Relation::Like,
                actor: actor("u1"),
            }),
            Err(CardError::NotFound)
        );
    }

    #[test]
    fn only_owner_or_admin_may_update() {
        let card = live_card();
        let stranger = card.handle(CardCommand::Update {
            editor: principal("someone", Role::Business),
            details: CardDetails::titled("Hijacked"),
        });
        assert_eq!(stranger, Err(CardError::Forbidden));

        let admin = card
            .handle(CardCommand::Update {
                editor: principal("root", Role::Admin),
                details: CardDetails::titled("Moderated"),
            })
            .expect("admin may update");
        assert_eq!(admin.len(), 1);
    }

    #[test]
    fn unchanged_update_is_noop() {
        let card = live_card();
        let events = card
            .handle(CardCommand::Update {
                editor: principal("owner", Role::Business),
                details: card.details.clone(),
            })
            .expect("update should succeed");
        assert!(events.is_empty());
    }

    #[test]
    fn verify_flags_inconsistent_snapshot_state() {
        let mut card = toggle(live_card(), Relation::Like, "u1");
        assert!(card.verify());
        card.likes = serde_json::from_value(serde_json::json!({
            "endorsers": ["u1"],
            "count": 5
        }))
        .unwrap();
        assert!(!card.verify());
    }

    fn actor_strategy() -> impl Strategy<Value = String> {
        prop::sample::select(vec!["a", "b", "c", "d", "e"]).prop_map(str::to_owned)
    }

    fn relation_strategy() -> impl Strategy<Value = Relation> {
        prop::sample::select(Relation::ALL.to_vec())
    }

    proptest! {
        // count == |endorsers| after every toggle, across arbitrary actors.
        #[test]
        fn count_matches_membership_after_every_toggle(
            ops in prop::collection::vec((relation_strategy(), actor_strategy()), 0..64)
        ) {
            let mut card = live_card();
            for (relation, who) in ops {
                card = toggle(card, relation, &who);
                for r in Relation::ALL {
                    let set = card.endorsements(r);
                    prop_assert_eq!(set.count() as usize, set.endorsers().count());
                    prop_assert!(set.check().is_ok());
                }
            }
        }

        // Toggling twice by the same actor restores the exact prior state.
        #[test]
        fn double_toggle_is_identity(
            prefix in prop::collection::vec((relation_strategy(), actor_strategy()), 0..32),
            relation in relation_strategy(),
            who in actor_strategy(),
        ) {
            let mut card = live_card();
            for (r, w) in prefix {
                card = toggle(card, r, &w);
            }
            let before = card.clone();
            let after = toggle(toggle(card, relation, &who), relation, &who);
            prop_assert_eq!(after, before);
        }

        // Toggling an existing endorsement removes exactly one.
        #[test]
        fn toggle_of_member_decrements_by_exactly_one(
            members in prop::collection::btree_set(actor_strategy(), 1..5),
            relation in relation_strategy(),
        ) {
            let mut card = live_card();
            for m in &members {
                card = toggle(card, relation, m);
            }
            let who = members.iter().next().cloned().unwrap();
            let before = card.endorsements(relation).count();
            let card = toggle(card, relation, &who);
            let set = card.endorsements(relation);
            prop_assert_eq!(set.count(), before - 1);
            prop_assert_eq!(set.count() as usize, set.endorsers().count());
            prop_assert!(!set.contains(&actor(&who)));
        }
    }
}
