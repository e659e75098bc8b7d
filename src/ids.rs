//! Validated identifiers for cards (resources) and actors.
//!
//! Both identifiers share one grammar: 1 to 64 characters drawn from ASCII
//! letters, digits, `-` and `_`. Anything else is rejected with a
//! [`ValidationError`] before it can reach storage.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Maximum length of any identifier, in bytes.
pub const MAX_ID_LEN: usize = 64;

/// A malformed identifier.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    /// The identifier was empty.
    #[error("{kind} must not be empty")]
    Empty {
        /// Which identifier was being parsed.
        kind: &'static str,
    },

    /// The identifier exceeded [`MAX_ID_LEN`].
    #[error("{kind} exceeds {max} characters")]
    TooLong {
        /// Which identifier was being parsed.
        kind: &'static str,
        /// The limit that was exceeded.
        max: usize,
    },

    /// The identifier contained a character outside the allowed set.
    #[error("{kind} contains invalid character {ch:?}")]
    InvalidChar {
        /// Which identifier was being parsed.
        kind: &'static str,
        /// The first offending character.
        ch: char,
    },
}

fn validate(kind: &'static str, value: &str) -> Result<(), ValidationError> {
    if value.is_empty() {
        return Err(ValidationError::Empty { kind });
    }
    if value.len() > MAX_ID_LEN {
        return Err(ValidationError::TooLong {
            kind,
            max: MAX_ID_LEN,
        });
    }
    match value
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || *c == '-' || *c == '_'))
    {
        Some(ch) => Err(ValidationError::InvalidChar { kind, ch }),
        None => Ok(()),
    }
}

macro_rules! validated_id {
    ($(#[$meta:meta])* $name:ident, $kind:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(try_from = "String", into = "String")]
        pub struct $name(String);

        impl $name {
            /// Parse and validate an identifier.
            ///
            /// # Errors
            ///
            /// Returns [`ValidationError`] if the value is empty, too long,
            /// or contains characters outside `[A-Za-z0-9_-]`.
            pub fn new(value: impl Into<String>) -> Result<Self, ValidationError> {
                let value = value.into();
                validate($kind, &value)?;
                Ok(Self(value))
            }

            /// Borrow the identifier as a string slice.
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl TryFrom<String> for $name {
            type Error = ValidationError;

            fn try_from(value: String) -> Result<Self, Self::Error> {
                Self::new(value)
            }
        }

        impl From<$name> for String {
            fn from(id: $name) -> Self {
                id.0
            }
        }

        impl FromStr for $name {
            type Err = ValidationError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::new(s)
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }
    };
}

validated_id!(
    /// Identifier of an endorsable resource (a card).
    ///
    /// Immutable after creation; doubles as the aggregate instance id.
    ResourceId,
    "resource id"
);

validated_id!(
    /// Identifier of an authenticated actor (a user).
    ActorId,
    "actor id"
);

impl ResourceId {
    /// Generate a fresh random identifier for a newly created card.
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_alphanumeric_dash_underscore() {
        let id = ResourceId::new("card_01-abc").expect("valid id");
        assert_eq!(id.as_str(), "card_01-abc");
        assert_eq!(id.to_string(), "card_01-abc");
    }

    #[test]
    fn rejects_empty() {
        assert_eq!(
            ActorId::new(""),
            Err(ValidationError::Empty { kind: "actor id" })
        );
    }

    #[test]
    fn rejects_too_long() {
        let long = "a".repeat(MAX_ID_LEN + 1);
        assert!(matches!(
            ResourceId::new(long),
            Err(ValidationError::TooLong { max: MAX_ID_LEN, .. })
        ));
    }

    #[test]
    fn rejects_path_characters() {
        let err = ResourceId::new("../etc").unwrap_err();
        assert_eq!(
            err,
            ValidationError::InvalidChar {
                kind: "resource id",
                ch: '.'
            }
        );
        assert_eq!(err.to_string(), "resource id contains invalid character '.'");
    }

    #[test]
    fn generated_ids_are_valid_and_distinct() {
        let a = ResourceId::generate();
        let b = ResourceId::generate();
        assert_ne!(a, b);
        assert!(ResourceId::new(a.as_str()).is_ok());
    }

    #[test]
    fn deserialization_validates() {
        let ok: ActorId = serde_json::from_str("\"alice\"").expect("valid actor id");
        assert_eq!(ok.as_str(), "alice");

        let bad = serde_json::from_str::<ActorId>("\"al ice\"");
        assert!(bad.is_err(), "space must be rejected during deserialization");
    }

    #[test]
    fn serializes_as_plain_string() {
        let id = ActorId::new("bob").unwrap();
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"bob\"");
    }
}
