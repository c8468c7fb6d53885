//! Bearer-token acquisition for backends with expiring auth.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use indexmap::IndexMap;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credential {
    pub access_token: String,
    pub expires_at: SystemTime,
}

impl Credential {
    pub fn new(access_token: impl Into<String>, expires_at: SystemTime) -> Self {
        Self {
            access_token: access_token.into(),
            expires_at,
        }
    }

    pub fn is_expired_at(&self, now: SystemTime) -> bool {
        now >= self.expires_at
    }
}

#[derive(Debug, Clone, Error)]
pub enum AuthError {
    #[error("auth request failed: {0}")]
    Request(String),
    #[error("credentials rejected ({status}): {body}")]
    Rejected { status: u16, body: String },
    #[error("invalid auth response: {0}")]
    InvalidResponse(String),
}

/// One authenticate round-trip (client id/secret -> token + expiry).
#[async_trait]
pub trait Authenticator: Send + Sync {
    async fn authenticate(&self) -> Result<Credential, AuthError>;
}

/// Caches the current credential and refreshes it once it expires. Callers
/// that arrive while a refresh is in flight wait for that refresh instead of
/// starting their own.
pub struct CredentialManager {
    authenticator: Arc<dyn Authenticator>,
    current: Mutex<Option<Credential>>,
}

impl CredentialManager {
    pub fn new(authenticator: Arc<dyn Authenticator>) -> Self {
        Self {
            authenticator,
            current: Mutex::new(None),
        }
    }

    pub async fn get_token(&self) -> Result<String, AuthError> {
        let mut guard = self.current.lock().await;
        if let Some(credential) = guard.as_ref() {
            if !credential.is_expired_at(SystemTime::now()) {
                return Ok(credential.access_token.clone());
            }
            debug!(target: "ai_agent::credentials", "access token expired, refreshing");
        }

        let credential = self.authenticator.authenticate().await?;
        let token = credential.access_token.clone();
        *guard = Some(credential);
        Ok(token)
    }

    /// Drops the cached credential so the next call re-authenticates.
    pub async fn invalidate(&self) {
        self.current.lock().await.take();
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientCredentialsConfig {
    pub auth_url: String,
    pub client_id: String,
    pub client_secret: String,
    #[serde(default)]
    pub scope: Option<String>,
    #[serde(default)]
    pub headers: IndexMap<String, String>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

/// OAuth-style client-credentials exchange over HTTP.
pub struct ClientCredentialsAuthenticator {
    client: Client,
    config: ClientCredentialsConfig,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    /// Absolute expiry in epoch milliseconds.
    #[serde(default)]
    expires_at: Option<u64>,
    /// Relative lifetime in seconds.
    #[serde(default)]
    expires_in: Option<u64>,
}

impl ClientCredentialsAuthenticator {
    pub fn new(config: ClientCredentialsConfig) -> Result<Self, AuthError> {
        let timeout = Duration::from_millis(config.timeout_ms.unwrap_or(20_000));
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|err| AuthError::Request(format!("building auth client: {err}")))?;
        Ok(Self { client, config })
    }
}

#[async_trait]
impl Authenticator for ClientCredentialsAuthenticator {
    async fn authenticate(&self) -> Result<Credential, AuthError> {
        let mut form = vec![("grant_type", "client_credentials")];
        if let Some(scope) = self.config.scope.as_deref() {
            form.push(("scope", scope));
        }

        let mut request = self
            .client
            .post(&self.config.auth_url)
            .basic_auth(&self.config.client_id, Some(&self.config.client_secret))
            .header("RqUID", Uuid::new_v4().to_string())
            .form(&form);
        for (key, value) in &self.config.headers {
            request = request.header(key, value);
        }

        let response = request
            .send()
            .await
            .map_err(|err| AuthError::Request(err.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AuthError::Rejected {
                status: status.as_u16(),
                body,
            });
        }

        let payload: TokenResponse = response
            .json()
            .await
            .map_err(|err| AuthError::InvalidResponse(err.to_string()))?;
        let credential = credential_from_response(payload, SystemTime::now())?;
        info!(target: "ai_agent::credentials", "obtained access token");
        Ok(credential)
    }
}

fn credential_from_response(
    payload: TokenResponse,
    now: SystemTime,
) -> Result<Credential, AuthError> {
    let expires_at = match (payload.expires_at, payload.expires_in) {
        (Some(epoch_ms), _) => UNIX_EPOCH.checked_add(Duration::from_millis(epoch_ms)),
        (None, Some(seconds)) => now.checked_add(Duration::from_secs(seconds)),
        (None, None) => {
            return Err(AuthError::InvalidResponse(
                "response carries neither expires_at nor expires_in".into(),
            ))
        }
    };
    let expires_at = expires_at
        .ok_or_else(|| AuthError::InvalidResponse("token expiry out of range".into()))?;
    Ok(Credential::new(payload.access_token, expires_at))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingAuthenticator {
        calls: AtomicUsize,
        lifetime: Duration,
        delay: Duration,
    }

    impl CountingAuthenticator {
        fn new(lifetime: Duration) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                lifetime,
                delay: Duration::ZERO,
            })
        }

        fn slow(lifetime: Duration, delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                lifetime,
                delay,
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Authenticator for CountingAuthenticator {
        async fn authenticate(&self) -> Result<Credential, AuthError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            Ok(Credential::new(
                format!("token-{n}"),
                SystemTime::now() + self.lifetime,
            ))
        }
    }

    struct FailingAuthenticator;

    #[async_trait]
    impl Authenticator for FailingAuthenticator {
        async fn authenticate(&self) -> Result<Credential, AuthError> {
            Err(AuthError::Rejected {
                status: 401,
                body: "bad secret".into(),
            })
        }
    }

    #[tokio::test]
    async fn back_to_back_calls_authenticate_once() {
        let auth = CountingAuthenticator::new(Duration::from_secs(600));
        let manager = CredentialManager::new(auth.clone());

        let first = manager.get_token().await.unwrap();
        let second = manager.get_token().await.unwrap();

        assert_eq!(first, "token-1");
        assert_eq!(second, "token-1");
        assert_eq!(auth.calls(), 1);
    }

    #[tokio::test]
    async fn expired_token_is_replaced() {
        let auth = CountingAuthenticator::new(Duration::ZERO);
        let manager = CredentialManager::new(auth.clone());

        assert_eq!(manager.get_token().await.unwrap(), "token-1");
        assert_eq!(manager.get_token().await.unwrap(), "token-2");
        assert_eq!(auth.calls(), 2);
    }

    #[tokio::test]
    async fn concurrent_callers_share_one_refresh() {
        let auth = CountingAuthenticator::slow(Duration::from_secs(600), Duration::from_millis(50));
        let manager = Arc::new(CredentialManager::new(auth.clone()));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let manager = manager.clone();
                tokio::spawn(async move { manager.get_token().await })
            })
            .collect();
        for handle in futures::future::join_all(handles).await {
            assert_eq!(handle.unwrap().unwrap(), "token-1");
        }
        assert_eq!(auth.calls(), 1);
    }

    #[tokio::test]
    async fn failures_are_not_cached() {
        let manager = CredentialManager::new(Arc::new(FailingAuthenticator));
        assert!(matches!(
            manager.get_token().await,
            Err(AuthError::Rejected { status: 401, .. })
        ));
        assert!(manager.get_token().await.is_err());
    }

    #[tokio::test]
    async fn invalidate_forces_reauthentication() {
        let auth = CountingAuthenticator::new(Duration::from_secs(600));
        let manager = CredentialManager::new(auth.clone());
        manager.get_token().await.unwrap();
        manager.invalidate().await;
        assert_eq!(manager.get_token().await.unwrap(), "token-2");
    }

    #[test]
    fn token_response_accepts_absolute_or_relative_expiry() {
        let now = UNIX_EPOCH + Duration::from_secs(1_000);
        let absolute = credential_from_response(
            TokenResponse {
                access_token: "a".into(),
                expires_at: Some(1_700_000_000_000),
                expires_in: None,
            },
            now,
        )
        .unwrap();
        assert_eq!(
            absolute.expires_at,
            UNIX_EPOCH + Duration::from_millis(1_700_000_000_000)
        );

        let relative = credential_from_response(
            TokenResponse {
                access_token: "b".into(),
                expires_at: None,
                expires_in: Some(1800),
            },
            now,
        )
        .unwrap();
        assert_eq!(relative.expires_at, now + Duration::from_secs(1800));

        assert!(credential_from_response(
            TokenResponse {
                access_token: "c".into(),
                expires_at: None,
                expires_in: None,
            },
            now,
        )
        .is_err());
    }

    #[test]
    fn overflowing_expiry_is_an_invalid_response() {
        let result = credential_from_response(
            TokenResponse {
                access_token: "d".into(),
                expires_at: None,
                expires_in: Some(u64::MAX),
            },
            SystemTime::now(),
        );
        assert!(matches!(result, Err(AuthError::InvalidResponse(_))), "{result:?}");
    }
}
