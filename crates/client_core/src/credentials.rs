use std::{fmt, sync::Arc};

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::Deserialize;
use shared::domain::CurrentUser;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::error::{ChatError, ChatResult};

/// Opaque bearer credential presented to the backend.
#[derive(Clone, PartialEq, Eq)]
pub struct BearerToken {
    value: String,
    subject: Option<String>,
    expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Default, Deserialize)]
struct TokenClaims {
    #[serde(default)]
    sub: Option<String>,
    #[serde(default)]
    exp: Option<i64>,
}

impl BearerToken {
    /// Token without known expiry.
    pub fn new(value: impl Into<String>) -> Self {
        Self {
            value: value.into(),
            subject: None,
            expires_at: None,
        }
    }

    /// Reads `sub`/`exp` from a JWT without verifying its signature; the
    /// backend is the verifier. Non-JWT tokens are accepted as opaque.
    pub fn from_jwt(value: impl Into<String>) -> Self {
        let value = value.into();
        let mut validation = Validation::new(Algorithm::HS256);
        validation.insecure_disable_signature_validation();
        validation.validate_exp = false;
        validation.validate_aud = false;
        validation.required_spec_claims.clear();

        match decode::<TokenClaims>(&value, &DecodingKey::from_secret(&[]), &validation) {
            Ok(data) => Self {
                subject: data.claims.sub,
                expires_at: data
                    .claims
                    .exp
                    .and_then(|exp| Utc.timestamp_opt(exp, 0).single()),
                value,
            },
            Err(err) => {
                debug!("credentials: token is not a readable JWT ({err}); treating as opaque");
                Self::new(value)
            }
        }
    }

    pub fn as_str(&self) -> &str {
        &self.value
    }

    pub fn subject(&self) -> Option<&str> {
        self.subject.as_deref()
    }

    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        self.expires_at
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|expires_at| expires_at <= now)
    }
}

impl fmt::Debug for BearerToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BearerToken")
            .field("value", &"<redacted>")
            .field("subject", &self.subject)
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

#[async_trait]
pub trait CredentialProvider: Send + Sync {
    /// Fresh credential for the current session, or `NoSession`.
    async fn credential(&self) -> ChatResult<BearerToken>;
}

pub struct MissingCredentialProvider;

#[async_trait]
impl CredentialProvider for MissingCredentialProvider {
    async fn credential(&self) -> ChatResult<BearerToken> {
        Err(ChatError::NoSession)
    }
}

/// A bare token, for calls made before the identity behind it is known.
#[async_trait]
impl CredentialProvider for BearerToken {
    async fn credential(&self) -> ChatResult<BearerToken> {
        if self.is_expired_at(Utc::now()) {
            return Err(ChatError::NoSession);
        }
        Ok(self.clone())
    }
}

#[derive(Debug, Clone)]
pub struct AuthSession {
    pub user: CurrentUser,
    pub token: BearerToken,
}

/// In-memory holder of the signed-in session, shared by every component
/// that needs the current identity or a credential.
#[derive(Debug, Clone, Default)]
pub struct SessionStore {
    inner: Arc<RwLock<Option<AuthSession>>>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn sign_in(&self, session: AuthSession) {
        *self.inner.write().await = Some(session);
    }

    pub async fn sign_out(&self) {
        self.inner.write().await.take();
    }

    pub async fn current_user(&self) -> Option<CurrentUser> {
        self.inner
            .read()
            .await
            .as_ref()
            .map(|session| session.user.clone())
    }
}

#[async_trait]
impl CredentialProvider for SessionStore {
    async fn credential(&self) -> ChatResult<BearerToken> {
        let guard = self.inner.read().await;
        let Some(session) = guard.as_ref() else {
            return Err(ChatError::NoSession);
        };
        if session.token.is_expired_at(Utc::now()) {
            warn!(
                user_id = %session.user.id,
                "credentials: session token expired; sign in again"
            );
            return Err(ChatError::NoSession);
        }
        Ok(session.token.clone())
    }
}

#[cfg(test)]
#[path = "tests/credentials_tests.rs"]
mod tests;
