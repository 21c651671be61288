use std::sync::Arc;

use chrono::Utc;
use padel_core::{AppError, HttpMethod};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use thiserror::Error;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::executor::{RequestExecutor, RequestOptions};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthUser {
    pub id: String,
    #[serde(default)]
    pub email: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthSession {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    /// Unix timestamp (seconds) at which the access token expires.
    #[serde(default)]
    pub expires_at: Option<i64>,
    pub user: AuthUser,
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum SessionError {
    #[error("email and password are required")]
    MissingCredentials,
    #[error(transparent)]
    Request(#[from] AppError),
}

/// Signed-in identity, published through a `watch` so consumers can react
/// to sign-in, sign-out and forced expiry.
#[derive(Debug, Clone)]
pub struct SessionStore {
    tx: Arc<watch::Sender<Option<AuthSession>>>,
}

impl SessionStore {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(None);
        Self { tx: Arc::new(tx) }
    }

    pub fn current(&self) -> Option<AuthSession> {
        self.tx.borrow().clone()
    }

    pub fn access_token(&self) -> Option<String> {
        self.tx
            .borrow()
            .as_ref()
            .map(|session| session.access_token.clone())
    }

    pub fn user_id(&self) -> Option<String> {
        self.tx
            .borrow()
            .as_ref()
            .map(|session| session.user.id.clone())
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<AuthSession>> {
        self.tx.subscribe()
    }

    pub fn set(&self, session: AuthSession) {
        info!(user_id = %session.user.id, "session established");
        self.tx.send_replace(Some(session));
    }

    /// Returns whether a session was active.
    pub fn clear(&self) -> bool {
        self.tx.send_replace(None).is_some()
    }

    /// Drop the session after the backend rejected its token.
    pub fn expire(&self) -> bool {
        let expired = self.tx.send_if_modified(|current| current.take().is_some());
        if expired {
            warn!("session expired; signing out");
        }
        expired
    }
}

impl Default for SessionStore {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    expires_in: Option<i64>,
    #[serde(default)]
    expires_at: Option<i64>,
    user: AuthUser,
}

/// Password sign-in and sign-out against the auth service.
#[derive(Clone)]
pub struct AuthClient {
    executor: Arc<RequestExecutor>,
}

impl AuthClient {
    pub fn new(executor: Arc<RequestExecutor>) -> Self {
        Self { executor }
    }

    pub async fn sign_in_with_password(
        &self,
        email: &str,
        password: &str,
    ) -> Result<AuthSession, SessionError> {
        if email.trim().is_empty() || password.is_empty() {
            return Err(SessionError::MissingCredentials);
        }

        let mut url = self.executor.endpoint().auth("token");
        url.query_pairs_mut().append_pair("grant_type", "password");
        let token: TokenResponse = self
            .executor
            .request(
                HttpMethod::Post,
                url,
                Some(json!({ "email": email.trim(), "password": password })),
                RequestOptions::default(),
            )
            .await?;

        let expires_at = token
            .expires_at
            .or_else(|| token.expires_in.map(|secs| Utc::now().timestamp() + secs));
        let session = AuthSession {
            access_token: token.access_token,
            refresh_token: token.refresh_token,
            expires_at,
            user: token.user,
        };
        self.executor.session().set(session.clone());
        Ok(session)
    }

    /// Revoke the session remotely and clear it locally. The local session is
    /// cleared even when the remote call fails.
    pub async fn sign_out(&self) -> Result<(), SessionError> {
        if self.executor.session().current().is_none() {
            return Ok(());
        }
        let url = self.executor.endpoint().auth("logout");
        let remote = self
            .executor
            .request::<Value>(HttpMethod::Post, url, None, RequestOptions::default())
            .await;
        self.executor.session().clear();
        info!("signed out");
        remote.map(|_| ()).map_err(SessionError::from)
    }
}
