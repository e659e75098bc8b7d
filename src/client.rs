//! Typed HTTP client for the card API.
//!
//! The bearer token lives in a shared [`RwLock`] so an application can swap
//! it at any time. When the server answers `401`, the client asks its
//! [`TokenRefresher`] for a fresh credential and retries, at most
//! [`RetryBudget`] times per call.

use std::fmt;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use reqwest::{Method, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;

use crate::backend::BoxFuture;
use crate::card::CardDetails;
use crate::catalog::{CardView, ListQuery};
use crate::endorsement::{EndorsementStatus, Relation};
use crate::http::ApiError;
use crate::ids::{ResourceId, ValidationError};

/// Failure of a client call.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// The credential was rejected and the refresh budget is spent.
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    /// The card does not exist or has been deleted.
    #[error("not found: {0}")]
    NotFound(String),
    /// The server could not resolve concurrent writers.
    #[error("conflict: {0}")]
    Conflict(String),
    /// Any other non-success response.
    #[error("{status} {code}: {message}")]
    Api {
        status: u16,
        code: String,
        message: String,
    },
    /// The request never produced a response.
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),
    /// A card id was rejected before any request was sent.
    #[error(transparent)]
    Validation(#[from] ValidationError),
}

/// Produces a fresh bearer token after the server rejects the current one.
pub trait TokenRefresher: Send + Sync + 'static {
    fn refresh(&self) -> BoxFuture<'_, Result<String, ClientError>>;
}

/// How many times a single call may refresh its credential after a `401`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryBudget(pub u32);

impl Default for RetryBudget {
    fn default() -> Self {
        Self(1)
    }
}

/// Client for a cardfold server.
///
/// Clone is cheap: clones share the connection pool and the token.
#[derive(Clone)]
pub struct CardsClient {
    http: reqwest::Client,
    base_url: String,
    token: Arc<RwLock<String>>,
    refresher: Option<Arc<dyn TokenRefresher>>,
    budget: RetryBudget,
}

impl fmt::Debug for CardsClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CardsClient")
            .field("base_url", &self.base_url)
            .field("refresher", &self.refresher.is_some())
            .field("budget", &self.budget)
            .finish_non_exhaustive()
    }
}

impl CardsClient {
    /// Client for the server at `base_url` (e.g. `http://127.0.0.1:8080`),
    /// initially anonymous.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Transport`] if the HTTP client cannot be built.
    pub fn new(base_url: impl Into<String>) -> Result<Self, ClientError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .connect_timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_owned(),
            token: Arc::new(RwLock::new(String::new())),
            refresher: None,
            budget: RetryBudget::default(),
        })
    }

    /// Share `token` with the caller; writes to it apply to the next request.
    /// An empty token sends no `Authorization` header.
    pub fn with_token(mut self, token: Arc<RwLock<String>>) -> Self {
        self.token = token;
        self
    }

    pub fn with_refresher(mut self, refresher: Arc<dyn TokenRefresher>) -> Self {
        self.refresher = Some(refresher);
        self
    }

    pub fn with_retry_budget(mut self, budget: RetryBudget) -> Self {
        self.budget = budget;
        self
    }

    /// The shared token cell.
    pub fn token(&self) -> &Arc<RwLock<String>> {
        &self.token
    }

    /// Flip the caller's `relation` on card `id`.
    pub async fn toggle(&self, id: &str, relation: Relation) -> Result<EndorsementStatus, ClientError> {
        let path = format!("{}/{}", card_path(id)?, relation.path_segment());
        self.json(self.send(Method::POST, &path, |r| r).await?).await
    }

    pub async fn status(&self, id: &str, relation: Relation) -> Result<EndorsementStatus, ClientError> {
        let path = format!("{}/{}", card_path(id)?, relation.path_segment());
        self.json(self.send(Method::GET, &path, |r| r).await?).await
    }

    pub async fn list(&self, query: &ListQuery) -> Result<Vec<CardView>, ClientError> {
        self.json(self.send(Method::GET, "/cards", |r| r.query(query)).await?)
            .await
    }

    pub async fn get(&self, id: &str) -> Result<CardView, ClientError> {
        self.json(self.send(Method::GET, &card_path(id)?, |r| r).await?)
            .await
    }

    pub async fn create(&self, details: &CardDetails) -> Result<CardView, ClientError> {
        self.json(self.send(Method::POST, "/cards", |r| r.json(details)).await?)
            .await
    }

    pub async fn delete(&self, id: &str) -> Result<(), ClientError> {
        self.send(Method::DELETE, &card_path(id)?, |r| r)
            .await
            .map(drop)
    }

    /// Cards the caller has favorited.
    pub async fn favorites(&self) -> Result<Vec<CardView>, ClientError> {
        self.json(self.send(Method::GET, "/me/favorites", |r| r).await?)
            .await
    }

    fn current_token(&self) -> String {
        match self.token.read() {
            Ok(token) => token.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn store_token(&self, fresh: String) {
        match self.token.write() {
            Ok(mut token) => *token = fresh,
            Err(poisoned) => *poisoned.into_inner() = fresh,
        }
    }

    /// Send a request, refreshing the credential after a `401` while the
    /// budget lasts. Non-success responses become [`ClientError`]s.
    async fn send(
        &self,
        method: Method,
        path: &str,
        build: impl Fn(RequestBuilder) -> RequestBuilder,
    ) -> Result<Response, ClientError> {
        let url = format!("{}{path}", self.base_url);
        let mut refreshes = 0;
        loop {
            let mut request = build(self.http.request(method.clone(), &url));
            let token = self.current_token();
            if !token.is_empty() {
                request = request.bearer_auth(token);
            }
            let response = request.send().await?;

            if response.status() == StatusCode::UNAUTHORIZED
                && refreshes < self.budget.0
                && let Some(refresher) = &self.refresher
            {
                refreshes += 1;
                tracing::debug!(%url, attempt = refreshes, "credential rejected, refreshing");
                let fresh = refresher.refresh().await?;
                self.store_token(fresh);
                continue;
            }
            return check(response).await;
        }
    }

    async fn json<T: DeserializeOwned>(&self, response: Response) -> Result<T, ClientError> {
        Ok(response.json().await?)
    }
}

/// `/cards/{id}` for a well-formed id.
fn card_path(id: &str) -> Result<String, ClientError> {
    let id = ResourceId::new(id)?;
    Ok(format!("/cards/{id}"))
}

async fn check(response: Response) -> Result<Response, ClientError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(error_for(status, &body))
}

fn error_for(status: StatusCode, body: &str) -> ClientError {
    let error = serde_json::from_str::<ApiError>(body).unwrap_or_else(|_| {
        ApiError::new(
            status.canonical_reason().unwrap_or("UNKNOWN"),
            body.to_owned(),
        )
    });
    match status {
        StatusCode::UNAUTHORIZED => ClientError::Unauthorized(error.message),
        StatusCode::NOT_FOUND => ClientError::NotFound(error.message),
        StatusCode::CONFLICT => ClientError::Conflict(error.message),
        _ => ClientError::Api {
            status: status.as_u16(),
            code: error.code,
            message: error.message,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_budget_is_a_single_refresh() {
        assert_eq!(RetryBudget::default(), RetryBudget(1));
    }

    #[test]
    fn error_bodies_map_to_typed_errors() {
        let body = r#"{"code":"NOT_FOUND","message":"card not found"}"#;
        assert!(matches!(
            error_for(StatusCode::NOT_FOUND, body),
            ClientError::NotFound(m) if m == "card not found"
        ));
        assert!(matches!(
            error_for(StatusCode::UNAUTHORIZED, "{}"),
            ClientError::Unauthorized(_)
        ));
        match error_for(StatusCode::FORBIDDEN, r#"{"code":"FORBIDDEN","message":"no"}"#) {
            ClientError::Api { status, code, .. } => {
                assert_eq!(status, 403);
                assert_eq!(code, "FORBIDDEN");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn card_paths_only_accept_valid_ids() {
        assert_eq!(card_path("c-1_x").unwrap(), "/cards/c-1_x");
        for bad in ["", "a/b", "../admin", "x?sort=likes", "a b"] {
            assert!(
                matches!(card_path(bad), Err(ClientError::Validation(_))),
                "{bad:?} should be rejected"
            );
        }
    }

    #[tokio::test]
    async fn malformed_ids_fail_before_any_request() {
        // Nothing listens on the discard port; a sent request would be a
        // transport error instead.
        let client = CardsClient::new("http://127.0.0.1:9").unwrap();
        let results = [
            client.toggle("a/b", Relation::Like).await.map(drop),
            client.status("../x", Relation::Favorite).await.map(drop),
            client.get("x?y").await.map(drop),
            client.delete("").await,
        ];
        for result in results {
            assert!(matches!(result, Err(ClientError::Validation(_))), "{result:?}");
        }
    }

    #[test]
    fn base_url_trailing_slash_is_trimmed() {
        let client = CardsClient::new("http://localhost:8080/").unwrap();
        assert_eq!(client.base_url, "http://localhost:8080");
    }

    #[test]
    fn token_writes_are_visible_to_the_client() {
        let token = Arc::new(RwLock::new("a".to_owned()));
        let client = CardsClient::new("http://localhost").unwrap().with_token(token.clone());
        *token.write().unwrap() = "b".into();
        assert_eq!(client.current_token(), "b");
        client.store_token("c".into());
        assert_eq!(*token.read().unwrap(), "c");
    }
}
