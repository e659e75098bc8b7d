//! Principals, roles, and bearer-token resolution.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::ids::ActorId;

/// What an authenticated principal is allowed to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// May endorse cards.
    User,
    /// May additionally create cards.
    Business,
    /// May additionally edit and delete any card.
    Admin,
}

/// An authenticated caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Principal {
    pub id: ActorId,
    pub role: Role,
}

impl Principal {
    pub fn new(id: ActorId, role: Role) -> Self {
        Self { id, role }
    }

    /// Business accounts and administrators may create cards.
    pub fn can_create(&self) -> bool {
        matches!(self.role, Role::Business | Role::Admin)
    }

    /// The owner of a card, or any administrator, may edit or delete it.
    pub fn can_manage(&self, owner: Option<&ActorId>) -> bool {
        self.role == Role::Admin || owner == Some(&self.id)
    }
}

/// Why a credential could not be turned into a [`Principal`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuthError {
    /// The `Authorization` header is not of the form `Bearer <token>`.
    #[error("malformed authorization header")]
    Malformed,
    /// The token is unknown, revoked, or expired.
    #[error("invalid or expired token")]
    InvalidToken,
}

/// Resolves bearer tokens to principals.
///
/// Implementations must be cheap to call: resolution happens on every
/// request that carries a credential.
pub trait IdentityProvider: Send + Sync + 'static {
    /// Resolve `token` to the principal it identifies.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::InvalidToken`] when the token is not recognized.
    fn resolve(&self, token: &str) -> Result<Principal, AuthError>;
}

/// A fixed token table, typically loaded from a JSON file of the form
/// `{ "<token>": { "id": "<actor id>", "role": "user" } }`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StaticTokens {
    tokens: HashMap<String, Principal>,
}

impl StaticTokens {
    /// Register `token` for `principal`, replacing any previous mapping.
    pub fn with_token(mut self, token: impl Into<String>, principal: Principal) -> Self {
        self.tokens.insert(token.into(), principal);
        self
    }

    /// Number of registered tokens.
    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

impl IdentityProvider for StaticTokens {
    fn resolve(&self, token: &str) -> Result<Principal, AuthError> {
        self.tokens
            .get(token)
            .cloned()
            .ok_or(AuthError::InvalidToken)
    }
}

/// Extract the token from an `Authorization` header value.
///
/// The scheme is matched case-insensitively.
///
/// # Errors
///
/// Returns [`AuthError::Malformed`] if the scheme is not `Bearer` or the
/// token is empty.
pub fn parse_bearer(header: &str) -> Result<&str, AuthError> {
    let (scheme, token) = header.trim().split_once(' ').ok_or(AuthError::Malformed)?;
    let token = token.trim();
    if !scheme.eq_ignore_ascii_case("bearer") || token.is_empty() {
        return Err(AuthError::Malformed);
    }
    Ok(token)
}
