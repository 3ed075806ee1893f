//! HTTP client for the remote row store.
//!
//! Speaks the row store's REST dialect: one resource path per table,
//! filter predicates as query parameters, `Prefer` headers to control
//! returned representations. Holds no retry logic; callers own retry
//! policy.

use std::time::Duration;

use reqwest::Client;
use serde::{Serialize, de::DeserializeOwned};

use crate::error::StoreError;
use crate::filter::Filter;
use crate::session::SharedSession;

/// Accept header that asks the store for exactly one JSON object
/// instead of a one-element array. The store answers 406 when the
/// result is not exactly one row.
const SINGLE_OBJECT: &str = "application/vnd.pgrst.object+json";

/// Client for reading and writing rows in the remote store.
#[derive(Debug, Clone)]
pub struct StoreClient {
    http: Client,
    base_url: String,
    api_key: String,
    session: SharedSession,
}

impl StoreClient {
    /// Create a new client for the given store URL.
    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        session: SharedSession,
    ) -> Self {
        let http = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(30))
            .build()
            .expect("failed to build HTTP client");

        Self {
            http,
            base_url: base_url.into(),
            api_key: api_key.into(),
            session,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn table_url(&self, table: &str) -> String {
        format!("{}/rest/v1/{}", self.base_url, table)
    }

    /// Bearer token for the current request: the session's access token
    /// when signed in, the anonymous API key otherwise.
    async fn bearer(&self) -> String {
        match self.session.read().await.as_ref() {
            Some(session) => session.access_token.clone(),
            None => self.api_key.clone(),
        }
    }

    /// Read all rows matching the filter.
    pub async fn select<T: DeserializeOwned>(
        &self,
        table: &str,
        filter: Filter,
    ) -> Result<Vec<T>, StoreError> {
        let response = self
            .http
            .get(self.table_url(table))
            .header("apikey", &self.api_key)
            .header("Authorization", format!("Bearer {}", self.bearer().await))
            .query(filter.params())
            .send()
            .await?;

        self.handle_response(table, response).await
    }

    /// Read exactly one row. Zero matching rows is `NotFound`.
    pub async fn select_one<T: DeserializeOwned>(
        &self,
        table: &str,
        id: &str,
        filter: Filter,
    ) -> Result<T, StoreError> {
        let response = self
            .http
            .get(self.table_url(table))
            .header("apikey", &self.api_key)
            .header("Authorization", format!("Bearer {}", self.bearer().await))
            .header("Accept", SINGLE_OBJECT)
            .query(filter.params())
            .send()
            .await?;

        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND || status == reqwest::StatusCode::NOT_ACCEPTABLE
        {
            return Err(StoreError::NotFound {
                table: table.to_string(),
                id: Some(id.to_string()),
            });
        }

        self.handle_response(table, response).await
    }

    /// Insert one row and return its stored representation.
    pub async fn insert<T: DeserializeOwned, B: Serialize>(
        &self,
        table: &str,
        body: &B,
        filter: Filter,
    ) -> Result<T, StoreError> {
        let response = self
            .http
            .post(self.table_url(table))
            .header("apikey", &self.api_key)
            .header("Authorization", format!("Bearer {}", self.bearer().await))
            .header("Accept", SINGLE_OBJECT)
            .header("Prefer", "return=representation")
            .query(filter.params())
            .json(body)
            .send()
            .await?;

        // A 406 here means the inserted row was not readable back, which
        // is a row-policy effect rather than a missing row.
        if response.status() == reqwest::StatusCode::NOT_ACCEPTABLE {
            return Err(StoreError::PermissionDenied {
                table: table.to_string(),
                detail: "inserted row is not visible".to_string(),
            });
        }

        self.handle_response(table, response).await
    }

    /// Insert one or more rows without asking for them back.
    pub async fn insert_minimal<B: Serialize>(
        &self,
        table: &str,
        body: &B,
    ) -> Result<(), StoreError> {
        let response = self
            .http
            .post(self.table_url(table))
            .header("apikey", &self.api_key)
            .header("Authorization", format!("Bearer {}", self.bearer().await))
            .header("Prefer", "return=minimal")
            .json(body)
            .send()
            .await?;

        self.handle_empty_response(table, response).await
    }

    /// Update all rows matching the filter and return the new
    /// representations.
    pub async fn update<T: DeserializeOwned, B: Serialize>(
        &self,
        table: &str,
        filter: Filter,
        body: &B,
    ) -> Result<Vec<T>, StoreError> {
        let response = self
            .http
            .patch(self.table_url(table))
            .header("apikey", &self.api_key)
            .header("Authorization", format!("Bearer {}", self.bearer().await))
            .header("Prefer", "return=representation")
            .query(filter.params())
            .json(body)
            .send()
            .await?;

        self.handle_response(table, response).await
    }

    /// Update without asking for the rows back.
    pub async fn update_minimal<B: Serialize>(
        &self,
        table: &str,
        filter: Filter,
        body: &B,
    ) -> Result<(), StoreError> {
        let response = self
            .http
            .patch(self.table_url(table))
            .header("apikey", &self.api_key)
            .header("Authorization", format!("Bearer {}", self.bearer().await))
            .header("Prefer", "return=minimal")
            .query(filter.params())
            .json(body)
            .send()
            .await?;

        self.handle_empty_response(table, response).await
    }

    /// Delete all rows matching the filter.
    pub async fn delete(&self, table: &str, filter: Filter) -> Result<(), StoreError> {
        let response = self
            .http
            .delete(self.table_url(table))
            .header("apikey", &self.api_key)
            .header("Authorization", format!("Bearer {}", self.bearer().await))
            .header("Prefer", "return=minimal")
            .query(filter.params())
            .send()
            .await?;

        self.handle_empty_response(table, response).await
    }

    /// Handle HTTP response and parse JSON.
    async fn handle_response<T: DeserializeOwned>(
        &self,
        table: &str,
        response: reqwest::Response,
    ) -> Result<T, StoreError> {
        let status = response.status();

        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            let retry_after_secs = response
                .headers()
                .get("Retry-After")
                .and_then(|v| v.to_str().ok())
                .and_then(|s| s.parse().ok());
            return Err(StoreError::RateLimited {
                table: table.to_string(),
                retry_after_secs,
            });
        }

        if !status.is_success() {
            let text = response.text().await.map_err(|e| {
                StoreError::Unknown(format!(
                    "request failed ({}): failed to read response: {}",
                    status, e
                ))
            })?;
            return Err(classify_error(table, status, &text));
        }

        let body = response.json().await?;
        Ok(body)
    }

    /// Like [`handle_response`](Self::handle_response) for requests that
    /// asked for `return=minimal`.
    async fn handle_empty_response(
        &self,
        table: &str,
        response: reqwest::Response,
    ) -> Result<(), StoreError> {
        let status = response.status();

        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            let retry_after_secs = response
                .headers()
                .get("Retry-After")
                .and_then(|v| v.to_str().ok())
                .and_then(|s| s.parse().ok());
            return Err(StoreError::RateLimited {
                table: table.to_string(),
                retry_after_secs,
            });
        }

        if !status.is_success() {
            let text = response.text().await.map_err(|e| {
                StoreError::Unknown(format!(
                    "request failed ({}): failed to read response: {}",
                    status, e
                ))
            })?;
            return Err(classify_error(table, status, &text));
        }

        Ok(())
    }
}

/// Error body format used by the row store.
#[derive(Debug, serde::Deserialize)]
struct StoreErrorBody {
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

/// Map a non-success status and body onto the error taxonomy. Database
/// error codes in the body take precedence over the HTTP status, since
/// the store folds several of them into generic 4xx responses.
fn classify_error(table: &str, status: reqwest::StatusCode, body: &str) -> StoreError {
    let parsed = serde_json::from_str::<StoreErrorBody>(body).ok();
    let detail = parsed
        .as_ref()
        .and_then(|b| b.message.clone())
        .unwrap_or_else(|| body.to_string());

    if let Some(code) = parsed.as_ref().and_then(|b| b.code.as_deref()) {
        match code {
            // unique_violation, foreign_key_violation
            "23505" | "23503" => {
                return StoreError::Conflict {
                    table: table.to_string(),
                    detail,
                };
            }
            // insufficient_privilege
            "42501" => {
                return StoreError::PermissionDenied {
                    table: table.to_string(),
                    detail,
                };
            }
            _ => {}
        }
    }

    match status.as_u16() {
        401 | 403 => StoreError::PermissionDenied {
            table: table.to_string(),
            detail,
        },
        404 => StoreError::NotFound {
            table: table.to_string(),
            id: None,
        },
        409 => StoreError::Conflict {
            table: table.to_string(),
            detail,
        },
        _ => StoreError::Unknown(format!("request failed ({status}): {detail}")),
    }
}
