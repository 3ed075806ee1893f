//! Session state and the identity-service client.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::StoreError;

/// An authenticated session issued by the identity service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub user_id: Uuid,
    pub email: String,
    pub access_token: String,
    pub refresh_token: String,
    pub expires_at: DateTime<Utc>,
}

/// Shared session slot, written by [`AuthClient`] and read by
/// [`StoreClient`](crate::StoreClient) when attaching credentials.
pub type SharedSession = Arc<RwLock<Option<Session>>>;

/// Create an empty session slot.
pub fn new_session_slot() -> SharedSession {
    Arc::new(RwLock::new(None))
}

/// Outcome of a sign-up attempt. The session is present only when the
/// server did not require email verification.
#[derive(Debug, Clone)]
pub struct SignUpOutcome {
    pub user_id: Uuid,
    pub email: String,
    pub session: Option<Session>,
}

/// Profile fields recorded with a new account.
#[derive(Debug, Clone, Serialize)]
pub struct SignUpMetadata {
    pub full_name: String,
    pub is_provider: bool,
}

/// Client for the identity service.
#[derive(Debug, Clone)]
pub struct AuthClient {
    http: Client,
    auth_url: String,
    api_key: String,
    session: SharedSession,
}

#[derive(Debug, Deserialize)]
struct AuthUser {
    id: Uuid,
    email: String,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    refresh_token: String,
    expires_in: i64,
    user: AuthUser,
}

/// Sign-up responses come in two shapes: a full token grant when the
/// server auto-confirms, or a bare user object while verification is
/// pending.
#[derive(Debug, Deserialize)]
struct SignUpResponse {
    #[serde(default)]
    access_token: Option<String>,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    expires_in: Option<i64>,
    #[serde(default)]
    user: Option<AuthUser>,
    #[serde(default)]
    id: Option<Uuid>,
    #[serde(default)]
    email: Option<String>,
}

/// Error body format used by the identity service.
#[derive(Debug, Deserialize)]
struct AuthErrorBody {
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    error_description: Option<String>,
    #[serde(default)]
    msg: Option<String>,
}

impl AuthClient {
    /// Create a new client for the given identity-service URL.
    pub fn new(auth_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        let http = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(30))
            .build()
            .expect("failed to build HTTP client");

        Self {
            http,
            auth_url: auth_url.into(),
            api_key: api_key.into(),
            session: new_session_slot(),
        }
    }

    /// The shared slot this client writes sessions into. Hand this to
    /// [`StoreClient::new`](crate::StoreClient::new) so row requests
    /// carry the user's credentials.
    pub fn session_slot(&self) -> SharedSession {
        Arc::clone(&self.session)
    }

    /// Exchange credentials for a session and install it.
    pub async fn sign_in(&self, email: &str, password: &str) -> Result<Session, StoreError> {
        #[derive(Serialize)]
        struct PasswordGrant<'a> {
            email: &'a str,
            password: &'a str,
        }

        let url = format!("{}/token?grant_type=password", self.auth_url);

        let response = self
            .http
            .post(&url)
            .header("apikey", &self.api_key)
            .json(&PasswordGrant { email, password })
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.map_err(|e| {
                StoreError::Auth(format!(
                    "sign-in failed ({}): failed to read response: {}",
                    status, e
                ))
            })?;
            return Err(StoreError::Auth(auth_error_detail(&text)));
        }

        let token: TokenResponse = response.json().await?;
        let session = session_from_grant(token);
        debug!(user_id = %session.user_id, "authenticated with identity service");

        *self.session.write().await = Some(session.clone());
        Ok(session)
    }

    /// Register a new account. Installs a session when the server
    /// auto-confirms; otherwise verification is pending and the caller
    /// should direct the user to their inbox.
    pub async fn sign_up(
        &self,
        email: &str,
        password: &str,
        metadata: &SignUpMetadata,
    ) -> Result<SignUpOutcome, StoreError> {
        #[derive(Serialize)]
        struct SignUpRequest<'a> {
            email: &'a str,
            password: &'a str,
            data: &'a SignUpMetadata,
        }

        let url = format!("{}/signup", self.auth_url);

        let response = self
            .http
            .post(&url)
            .header("apikey", &self.api_key)
            .json(&SignUpRequest {
                email,
                password,
                data: metadata,
            })
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.map_err(|e| {
                StoreError::Auth(format!(
                    "sign-up failed ({}): failed to read response: {}",
                    status, e
                ))
            })?;
            return Err(StoreError::Auth(auth_error_detail(&text)));
        }

        let body: SignUpResponse = response.json().await?;

        if let (Some(access_token), Some(refresh_token), Some(user)) =
            (body.access_token, body.refresh_token, body.user)
        {
            let session = session_from_grant(TokenResponse {
                access_token,
                refresh_token,
                expires_in: body.expires_in.unwrap_or(3600),
                user,
            });
            debug!(user_id = %session.user_id, "signed up with auto-confirm");
            *self.session.write().await = Some(session.clone());
            return Ok(SignUpOutcome {
                user_id: session.user_id,
                email: session.email.clone(),
                session: Some(session),
            });
        }

        let user_id = body
            .id
            .ok_or_else(|| StoreError::Auth("sign-up response missing user".to_string()))?;
        debug!(user_id = %user_id, "signed up, verification pending");

        Ok(SignUpOutcome {
            user_id,
            email: body.email.unwrap_or_else(|| email.to_string()),
            session: None,
        })
    }

    /// Ask the identity service to send the verification email again.
    pub async fn resend_verification(&self, email: &str) -> Result<(), StoreError> {
        #[derive(Serialize)]
        struct ResendRequest<'a> {
            #[serde(rename = "type")]
            kind: &'a str,
            email: &'a str,
        }

        let url = format!("{}/resend", self.auth_url);

        let response = self
            .http
            .post(&url)
            .header("apikey", &self.api_key)
            .json(&ResendRequest {
                kind: "signup",
                email,
            })
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(StoreError::Auth(format!(
                "resend failed ({}): {}",
                status,
                auth_error_detail(&text)
            )));
        }

        Ok(())
    }

    /// Revoke the session server-side and clear it locally. The local
    /// slot is cleared even when the revocation call fails.
    pub async fn sign_out(&self) -> Result<(), StoreError> {
        let token = self
            .session
            .read()
            .await
            .as_ref()
            .map(|s| s.access_token.clone());

        if let Some(token) = token {
            let url = format!("{}/logout", self.auth_url);
            let result = self
                .http
                .post(&url)
                .header("apikey", &self.api_key)
                .header("Authorization", format!("Bearer {}", token))
                .send()
                .await;

            match result {
                Ok(response) if !response.status().is_success() => {
                    warn!(status = %response.status(), "sign-out rejected by identity service");
                }
                Err(e) => {
                    warn!(error = %e, "sign-out request failed");
                }
                Ok(_) => {}
            }
        }

        *self.session.write().await = None;
        Ok(())
    }

    /// Trade the refresh token for a new session.
    pub async fn refresh_session(&self) -> Result<Session, StoreError> {
        let refresh_token = {
            let session = self.session.read().await;
            session
                .as_ref()
                .map(|s| s.refresh_token.clone())
                .ok_or_else(|| StoreError::Auth("no session to refresh".to_string()))?
        };

        #[derive(Serialize)]
        struct RefreshGrant<'a> {
            refresh_token: &'a str,
        }

        let url = format!("{}/token?grant_type=refresh_token", self.auth_url);

        let response = self
            .http
            .post(&url)
            .header("apikey", &self.api_key)
            .json(&RefreshGrant {
                refresh_token: &refresh_token,
            })
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(StoreError::Auth(format!(
                "refresh failed ({}): {}",
                status,
                auth_error_detail(&text)
            )));
        }

        let token: TokenResponse = response.json().await?;
        let session = session_from_grant(token);
        debug!(user_id = %session.user_id, "refreshed session");

        *self.session.write().await = Some(session.clone());
        Ok(session)
    }

    /// The current session, if signed in.
    pub async fn session(&self) -> Option<Session> {
        self.session.read().await.clone()
    }

    /// The signed-in user's id, if any.
    pub async fn user_id(&self) -> Option<Uuid> {
        self.session.read().await.as_ref().map(|s| s.user_id)
    }
}

fn session_from_grant(token: TokenResponse) -> Session {
    Session {
        user_id: token.user.id,
        email: token.user.email,
        access_token: token.access_token,
        refresh_token: token.refresh_token,
        expires_at: Utc::now() + chrono::Duration::seconds(token.expires_in),
    }
}

/// Pick the most descriptive message out of an identity-service error
/// body, falling back to the raw text.
fn auth_error_detail(text: &str) -> String {
    if let Ok(body) = serde_json::from_str::<AuthErrorBody>(text) {
        if let Some(detail) = body.error_description.or(body.msg).or(body.error) {
            return detail;
        }
    }
    text.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const USER_ID: &str = "11111111-2222-3333-4444-555555555555";

    #[tokio::test]
    async fn test_sign_in_installs_session() {
        let mock_server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/auth/v1/token"))
            .and(query_param("grant_type", "password"))
            .and(header("apikey", "test-key"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "access_token": "access-1",
                "token_type": "bearer",
                "expires_in": 3600,
                "refresh_token": "refresh-1",
                "user": { "id": USER_ID, "email": "dana@example.com" }
            })))
            .mount(&mock_server)
            .await;

        let auth = AuthClient::new(format!("{}/auth/v1", mock_server.uri()), "test-key");
        let session = auth.sign_in("dana@example.com", "hunter2").await.unwrap();

        assert_eq!(session.email, "dana@example.com");
        assert_eq!(session.access_token, "access-1");
        assert_eq!(auth.user_id().await, Some(USER_ID.parse().unwrap()));
    }

    #[tokio::test]
    async fn test_sign_in_failure_surfaces_description() {
        let mock_server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/auth/v1/token"))
            .respond_with(ResponseTemplate::new(400).set_body_json(serde_json::json!({
                "error": "invalid_grant",
                "error_description": "Invalid login credentials"
            })))
            .mount(&mock_server)
            .await;

        let auth = AuthClient::new(format!("{}/auth/v1", mock_server.uri()), "test-key");
        let err = auth
            .sign_in("dana@example.com", "wrong")
            .await
            .unwrap_err();

        match err {
            StoreError::Auth(detail) => assert_eq!(detail, "Invalid login credentials"),
            other => panic!("expected Auth error, got {other}"),
        }
        assert!(auth.session().await.is_none());
    }

    #[tokio::test]
    async fn test_sign_up_pending_verification_has_no_session() {
        let mock_server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/auth/v1/signup"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "id": USER_ID,
                "email": "pat@example.com",
                "confirmation_sent_at": "2024-03-01T12:00:00Z"
            })))
            .mount(&mock_server)
            .await;

        let auth = AuthClient::new(format!("{}/auth/v1", mock_server.uri()), "test-key");
        let outcome = auth
            .sign_up(
                "pat@example.com",
                "hunter2",
                &SignUpMetadata {
                    full_name: "Pat Provider".to_string(),
                    is_provider: true,
                },
            )
            .await
            .unwrap();

        assert_eq!(outcome.user_id, USER_ID.parse::<Uuid>().unwrap());
        assert!(outcome.session.is_none());
        assert!(auth.session().await.is_none());
    }

    #[tokio::test]
    async fn test_sign_up_auto_confirm_installs_session() {
        let mock_server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/auth/v1/signup"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "access_token": "access-2",
                "refresh_token": "refresh-2",
                "expires_in": 3600,
                "user": { "id": USER_ID, "email": "pat@example.com" }
            })))
            .mount(&mock_server)
            .await;

        let auth = AuthClient::new(format!("{}/auth/v1", mock_server.uri()), "test-key");
        let outcome = auth
            .sign_up(
                "pat@example.com",
                "hunter2",
                &SignUpMetadata {
                    full_name: "Pat Provider".to_string(),
                    is_provider: true,
                },
            )
            .await
            .unwrap();

        assert!(outcome.session.is_some());
        assert_eq!(auth.user_id().await, Some(USER_ID.parse().unwrap()));
    }

    #[tokio::test]
    async fn test_sign_out_clears_session_despite_server_error() {
        let mock_server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/auth/v1/logout"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&mock_server)
            .await;

        let auth = AuthClient::new(format!("{}/auth/v1", mock_server.uri()), "test-key");
        *auth.session_slot().write().await = Some(Session {
            user_id: USER_ID.parse().unwrap(),
            email: "dana@example.com".to_string(),
            access_token: "access-1".to_string(),
            refresh_token: "refresh-1".to_string(),
            expires_at: Utc::now(),
        });

        auth.sign_out().await.unwrap();
        assert!(auth.session().await.is_none());
    }

    #[tokio::test]
    async fn test_refresh_without_session_is_an_auth_error() {
        let auth = AuthClient::new("http://127.0.0.1:9/auth/v1", "test-key");
        let err = auth.refresh_session().await.unwrap_err();
        assert!(matches!(err, StoreError::Auth(_)));
    }
}
