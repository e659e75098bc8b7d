//! Endorsement relations and the membership set with its cached count.
//!
//! A card carries one [`EndorsementSet`] per [`Relation`]. The set and its
//! count always travel together inside the card aggregate, so a single
//! event append updates both.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::ids::ActorId;

/// The kinds of endorsement an actor can toggle on a card.
///
/// Likes and favorites are independent relations driven by the same toggle
/// mechanism: liking a card never favorites it, and vice versa.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Relation {
    /// A public "like", counted on the card.
    Like,
    /// A favorite, which also places the card in the actor's saved list.
    Favorite,
}

impl Relation {
    /// All relations, in a stable order.
    pub const ALL: [Relation; 2] = [Relation::Like, Relation::Favorite];

    /// Singular name (`"like"`, `"favorite"`).
    pub fn as_str(self) -> &'static str {
        match self {
            Relation::Like => "like",
            Relation::Favorite => "favorite",
        }
    }

    /// Plural URL segment (`"likes"`, `"favorites"`).
    pub fn path_segment(self) -> &'static str {
        match self {
            Relation::Like => "likes",
            Relation::Favorite => "favorites",
        }
    }

    /// Parse a plural URL segment as produced by [`path_segment`](Self::path_segment).
    pub fn from_path_segment(segment: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|r| r.path_segment() == segment)
    }
}

impl fmt::Display for Relation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when a string does not name a [`Relation`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown relation: {0}")]
pub struct UnknownRelation(pub String);

impl FromStr for Relation {
    type Err = UnknownRelation;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|r| r.as_str() == s || r.path_segment() == s)
            .ok_or_else(|| UnknownRelation(s.to_owned()))
    }
}

/// The cached count disagrees with the membership set.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("cached count {count} disagrees with {members} endorsers")]
pub struct InvariantViolation {
    /// The cached count.
    pub count: u64,
    /// The actual number of members.
    pub members: usize,
}

/// The set of actors endorsing a card under one relation, plus its cached
/// cardinality.
///
/// `count` is maintained by [`insert`](Self::insert) and
/// [`remove`](Self::remove) and is only ever changed when membership
/// actually changes, so `count == endorsers.len()` holds after every call.
/// [`check`](Self::check) verifies it for state that came from outside
/// (e.g. a persisted snapshot).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndorsementSet {
    endorsers: BTreeSet<ActorId>,
    count: u64,
}

impl EndorsementSet {
    /// Whether `actor` currently endorses.
    pub fn contains(&self, actor: &ActorId) -> bool {
        self.endorsers.contains(actor)
    }

    /// The cached endorsement count.
    pub fn count(&self) -> u64 {
        self.count
    }

    /// Iterate over the endorsing actors in ascending id order.
    pub fn endorsers(&self) -> impl Iterator<Item = &ActorId> {
        self.endorsers.iter()
    }

    /// Add `actor`. Returns `false` (and leaves the count alone) if the
    /// actor was already a member.
    pub fn insert(&mut self, actor: ActorId) -> bool {
        let inserted = self.endorsers.insert(actor);
        if inserted {
            self.count += 1;
        }
        inserted
    }

    /// Remove `actor`. Returns `false` (and leaves the count alone) if the
    /// actor was not a member.
    pub fn remove(&mut self, actor: &ActorId) -> bool {
        let removed = self.endorsers.remove(actor);
        if removed {
            self.count -= 1;
        }
        removed
    }

    /// Drop every endorsement.
    pub fn clear(&mut self) {
        self.endorsers.clear();
        self.count = 0;
    }

    /// Verify that the cached count matches the membership set.
    ///
    /// # Errors
    ///
    /// Returns [`InvariantViolation`] when they disagree.
    pub fn check(&self) -> Result<(), InvariantViolation> {
        if self.count as usize == self.endorsers.len() {
            Ok(())
        } else {
            Err(InvariantViolation {
                count: self.count,
                members: self.endorsers.len(),
            })
        }
    }

    /// Membership of `actor` (anonymous callers are never members) together
    /// with the current count.
    pub fn status_for(&self, actor: Option<&ActorId>) -> EndorsementStatus {
        EndorsementStatus {
            is_endorsed: actor.is_some_and(|a| self.contains(a)),
            count: self.count,
        }
    }
}

/// Result of a toggle or status query: the caller's membership and the
/// resource's current count.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EndorsementStatus {
    /// Whether the caller endorses the resource.
    pub is_endorsed: bool,
    /// How many actors endorse the resource.
    pub count: u64,
}
