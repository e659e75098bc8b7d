//! Event-sourced business cards with atomic like and favorite toggles.
//!
//! Each card is an aggregate whose events live in a single append-only
//! log. Endorsement toggles are conditional appends, so concurrent writers
//! on the same card can never lose an update, and the catalog projection
//! folds the same log into sortable listings.

mod actor;
pub use actor::{AggregateHandle, CommandOutcome, RetryPolicy};
mod aggregate;
pub use aggregate::Aggregate;
mod auth;
pub use auth::{AuthError, IdentityProvider, Principal, Role, StaticTokens, parse_bearer};
mod backend;
pub use backend::{
    AppendOutcome, BackendError, BoxFuture, EventBackend, ExpectedVersion, FileBackend,
    MemoryBackend,
};
mod card;
pub use card::{Card, CardCommand, CardDetails, CardError, CardEvent};
mod catalog;
pub use catalog::{
    CardCatalog, CardEntry, CardView, DEFAULT_LIST_LIMIT, ListQuery, MAX_LIST_LIMIT, SortKey,
    SortOrder,
};
pub mod client;
mod command;
pub mod config;
mod endorsement;
pub use endorsement::{
    EndorsementSet, EndorsementStatus, InvariantViolation, Relation, UnknownRelation,
};
mod error;
mod event;
pub use event::{
    EventMetadata, ProposedEvent, StoredEvent, StreamKey, decode_domain_event, encode_domain_event,
    now_millis,
};
pub mod http;
mod ids;
pub use ids::{ActorId, MAX_ID_LEN, ResourceId, ValidationError};
mod projection;
mod service;
mod snapshot;
mod storage;
mod store;
mod toggle;

pub use command::CommandContext;
pub use error::{ExecuteError, ProjectionError, ServiceError, StateError};
pub use projection::Projection;
pub use service::CardService;
pub use snapshot::Snapshot;
pub use storage::StoreLayout;
pub use store::{AggregateStore, AggregateStoreBuilder, DEFAULT_IDLE_TIMEOUT};
pub use toggle::ToggleService;
