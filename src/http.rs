//! JSON-over-HTTP surface for cards and their endorsements.
//!
//! Every failure is rendered as `{ "code", "message" }` with a stable code,
//! so a client can tell an expired session (`UNAUTHORIZED`) from a deleted
//! card (`NOT_FOUND`) and react accordingly.

use std::sync::Arc;

use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::{FromRequestParts, Path, Query, State};
use axum::http::header::AUTHORIZATION;
use axum::http::request::Parts;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::auth::{AuthError, IdentityProvider, Principal, parse_bearer};
use crate::card::CardDetails;
use crate::catalog::{CardView, ListQuery};
use crate::command::CommandContext;
use crate::endorsement::{EndorsementStatus, Relation};
use crate::error::ServiceError;
use crate::ids::ActorId;
use crate::service::CardService;
use crate::store::AggregateStore;
use crate::toggle::ToggleService;

/// Header whose value, when present, is recorded as the correlation id of
/// the events a request produces.
pub const REQUEST_ID_HEADER: &str = "x-request-id";

// =============================================================================
// State
// =============================================================================

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    toggles: ToggleService,
    cards: CardService,
    identity: Arc<dyn IdentityProvider>,
}

impl AppState {
    pub fn new(store: AggregateStore, identity: Arc<dyn IdentityProvider>) -> Self {
        Self {
            toggles: ToggleService::new(store.clone()),
            cards: CardService::new(store),
            identity,
        }
    }
}

// =============================================================================
// Errors
// =============================================================================

/// Error body returned by every failing route.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiError {
    /// Stable code for programmatic handling.
    pub code: String,
    /// Human-readable message.
    pub message: String,
}

impl ApiError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }
}

/// An [`ApiError`] paired with its HTTP status.
#[derive(Debug, Clone)]
pub struct ApiErrorResponse {
    pub status: StatusCode,
    pub error: ApiError,
}

impl ApiErrorResponse {
    pub fn new(status: StatusCode, code: &str, message: impl Into<String>) -> Self {
        Self {
            status,
            error: ApiError::new(code, message),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, "NOT_FOUND", message)
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, "UNAUTHORIZED", message)
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "VALIDATION_ERROR", message)
    }
}

impl IntoResponse for ApiErrorResponse {
    fn into_response(self) -> Response {
        (self.status, Json(self.error)).into_response()
    }
}

impl From<ServiceError> for ApiErrorResponse {
    fn from(err: ServiceError) -> Self {
        match err {
            ServiceError::NotFound => Self::not_found(err.to_string()),
            ServiceError::Unauthorized => Self::unauthorized(err.to_string()),
            ServiceError::Forbidden(msg) => Self::new(StatusCode::FORBIDDEN, "FORBIDDEN", msg),
            ServiceError::Conflict => Self::new(StatusCode::CONFLICT, "CONFLICT", err.to_string()),
            ServiceError::Validation(msg) => Self::validation(msg),
            ServiceError::Unavailable(detail) => {
                // Storage details stay in the log.
                tracing::error!(%detail, "request failed");
                Self::new(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "INTERNAL_ERROR",
                    "an internal error occurred",
                )
            }
        }
    }
}

impl From<AuthError> for ApiErrorResponse {
    fn from(err: AuthError) -> Self {
        Self::unauthorized(err.to_string())
    }
}

impl From<JsonRejection> for ApiErrorResponse {
    fn from(rejection: JsonRejection) -> Self {
        Self::validation(rejection.body_text())
    }
}

impl From<QueryRejection> for ApiErrorResponse {
    fn from(rejection: QueryRejection) -> Self {
        Self::validation(rejection.body_text())
    }
}

type ApiResult<T> = Result<T, ApiErrorResponse>;

// =============================================================================
// Caller extraction
// =============================================================================

/// The resolved caller of a request.
///
/// A request without an `Authorization` header is anonymous. A request
/// whose header is present but malformed or carries an unknown token is
/// rejected with `401`, even on read-only routes.
#[derive(Debug, Clone)]
pub struct Caller(pub Option<Principal>);

impl Caller {
    pub fn actor(&self) -> Option<&ActorId> {
        self.0.as_ref().map(|p| &p.id)
    }

    fn require(&self) -> Result<&Principal, ServiceError> {
        self.0.as_ref().ok_or(ServiceError::Unauthorized)
    }
}

impl FromRequestParts<AppState> for Caller {
    type Rejection = ApiErrorResponse;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let Some(value) = parts.headers.get(AUTHORIZATION) else {
            return Ok(Caller(None));
        };
        let header = value.to_str().map_err(|_| AuthError::Malformed)?;
        let token = parse_bearer(header)?;
        let principal = state.identity.resolve(token)?;
        tracing::debug!(actor = %principal.id, role = ?principal.role, "caller resolved");
        Ok(Caller(Some(principal)))
    }
}

fn command_context(headers: &HeaderMap) -> CommandContext {
    let ctx = CommandContext::default();
    match headers.get(REQUEST_ID_HEADER).and_then(|v| v.to_str().ok()) {
        Some(id) if !id.is_empty() => ctx.with_correlation_id(id),
        _ => ctx,
    }
}

fn relation_of(segment: &str) -> ApiResult<Relation> {
    Relation::from_path_segment(segment)
        .ok_or_else(|| ApiErrorResponse::not_found(format!("no such relation '{segment}'")))
}

// =============================================================================
// Handlers
// =============================================================================

#[derive(Debug, Serialize)]
struct Health {
    status: &'static str,
}

async fn health() -> Json<Health> {
    Json(Health { status: "ok" })
}

async fn create_card(
    State(state): State<AppState>,
    caller: Caller,
    body: Result<Json<CardDetails>, JsonRejection>,
) -> ApiResult<(StatusCode, Json<CardView>)> {
    let principal = caller.require()?;
    let Json(details) = body?;
    let view = state.cards.create(principal, details).await?;
    Ok((StatusCode::CREATED, Json(view)))
}

async fn list_cards(
    State(state): State<AppState>,
    caller: Caller,
    query: Result<Query<ListQuery>, QueryRejection>,
) -> ApiResult<Json<Vec<CardView>>> {
    let Query(query) = query?;
    let views = state.cards.list(&query, caller.actor()).await?;
    Ok(Json(views))
}

async fn get_card(
    State(state): State<AppState>,
    caller: Caller,
    Path(id): Path<String>,
) -> ApiResult<Json<CardView>> {
    Ok(Json(state.cards.get(&id, caller.actor()).await?))
}

async fn update_card(
    State(state): State<AppState>,
    caller: Caller,
    Path(id): Path<String>,
    body: Result<Json<CardDetails>, JsonRejection>,
) -> ApiResult<Json<CardView>> {
    let principal = caller.require()?;
    let Json(details) = body?;
    Ok(Json(state.cards.update(principal, &id, details).await?))
}

async fn delete_card(
    State(state): State<AppState>,
    caller: Caller,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    let principal = caller.require()?;
    state.cards.delete(principal, &id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn toggle_endorsement(
    State(state): State<AppState>,
    caller: Caller,
    headers: HeaderMap,
    Path((id, segment)): Path<(String, String)>,
) -> ApiResult<Json<EndorsementStatus>> {
    let relation = relation_of(&segment)?;
    let status = state
        .toggles
        .toggle_with_context(&id, relation, caller.actor(), command_context(&headers))
        .await?;
    Ok(Json(status))
}

async fn endorsement_status(
    State(state): State<AppState>,
    caller: Caller,
    Path((id, segment)): Path<(String, String)>,
) -> ApiResult<Json<EndorsementStatus>> {
    let relation = relation_of(&segment)?;
    Ok(Json(
        state.toggles.status(&id, relation, caller.actor()).await?,
    ))
}

async fn my_favorites(
    State(state): State<AppState>,
    caller: Caller,
) -> ApiResult<Json<Vec<CardView>>> {
    let principal = caller.require()?;
    Ok(Json(state.cards.favorites_of(&principal.id).await?))
}

async fn fallback() -> ApiErrorResponse {
    ApiErrorResponse::not_found("no such route")
}

/// Build the application router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/cards", post(create_card).get(list_cards))
        .route(
            "/cards/{id}",
            get(get_card).put(update_card).delete(delete_card),
        )
        .route(
            "/cards/{id}/{relation}",
            post(toggle_endorsement).get(endorsement_status),
        )
        .route("/me/favorites", get(my_favorites))
        .fallback(fallback)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}
