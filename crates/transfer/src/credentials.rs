//! Bearer credentials for remote calls.
//!
//! Coordinators receive a [`CredentialProvider`] at construction; there is no
//! process-wide token state. [`CachedCredentials`] keeps the current token
//! and its expiry behind a lock and refreshes it through a pluggable
//! [`TokenRefresher`].

use std::future::Future;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::{BoxFuture, TransferError};

/// Tokens this close to expiry (seconds) are refreshed before use.
const EXPIRY_SKEW_SECS: i64 = 60;

/// Supplies a currently valid access token.
pub trait CredentialProvider: Send + Sync {
    /// Returns a token, refreshing first if it is known to be expired.
    fn token(&self) -> BoxFuture<'_, Result<String, TransferError>>;

    /// Forces a refresh after the remote rejected `stale`.
    ///
    /// If the current token already differs from `stale`, another caller
    /// refreshed it in the meantime and it is returned as is.
    fn refresh<'a>(&'a self, stale: &'a str) -> BoxFuture<'a, Result<String, TransferError>>;
}

/// A fixed token that cannot be refreshed.
#[derive(Clone)]
pub struct StaticCredentials {
    token: String,
}

impl StaticCredentials {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }
}

impl CredentialProvider for StaticCredentials {
    fn token(&self) -> BoxFuture<'_, Result<String, TransferError>> {
        Box::pin(async move { Ok(self.token.clone()) })
    }

    fn refresh<'a>(&'a self, _stale: &'a str) -> BoxFuture<'a, Result<String, TransferError>> {
        Box::pin(async { Err(TransferError::CredentialExpired) })
    }
}

/// Result of a token grant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenGrant {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
}

/// Exchanges a refresh token for a new grant.
pub trait TokenRefresher: Send + Sync {
    fn refresh<'a>(&'a self, refresh_token: &'a str) -> BoxFuture<'a, Result<TokenGrant, TransferError>>;
}

/// Token cache with expiry tracking and explicit refresh.
pub struct CachedCredentials {
    state: Mutex<TokenGrant>,
    refresher: Option<Arc<dyn TokenRefresher>>,
}

impl CachedCredentials {
    pub fn new(grant: TokenGrant) -> Self {
        Self {
            state: Mutex::new(grant),
            refresher: None,
        }
    }

    pub fn with_refresher(mut self, refresher: Arc<dyn TokenRefresher>) -> Self {
        self.refresher = Some(refresher);
        self
    }

    /// Returns a copy of the current grant.
    pub async fn current(&self) -> TokenGrant {
        self.state.lock().await.clone()
    }

    async fn renew(&self, state: &mut TokenGrant) -> Result<String, TransferError> {
        let Some(refresher) = &self.refresher else {
            return Err(TransferError::CredentialExpired);
        };
        let Some(refresh_token) = state.refresh_token.clone() else {
            warn!("access token expired and no refresh token is configured");
            return Err(TransferError::CredentialExpired);
        };
        let grant = refresher.refresh(&refresh_token).await?;
        info!(expires_at = ?grant.expires_at, "access token refreshed");
        state.access_token = grant.access_token;
        if grant.refresh_token.is_some() {
            state.refresh_token = grant.refresh_token;
        }
        state.expires_at = grant.expires_at;
        Ok(state.access_token.clone())
    }
}

fn is_expired(grant: &TokenGrant, now: DateTime<Utc>) -> bool {
    grant
        .expires_at
        .is_some_and(|at| at - Duration::seconds(EXPIRY_SKEW_SECS) <= now)
}

impl CredentialProvider for CachedCredentials {
    fn token(&self) -> BoxFuture<'_, Result<String, TransferError>> {
        Box::pin(async move {
            let mut state = self.state.lock().await;
            if is_expired(&state, Utc::now()) && self.refresher.is_some() {
                return self.renew(&mut state).await;
            }
            Ok(state.access_token.clone())
        })
    }

    fn refresh<'a>(&'a self, stale: &'a str) -> BoxFuture<'a, Result<String, TransferError>> {
        Box::pin(async move {
            let mut state = self.state.lock().await;
            if state.access_token != stale {
                return Ok(state.access_token.clone());
            }
            self.renew(&mut state).await
        })
    }
}

/// Runs `call` with a token; if the remote reports the credential expired,
/// refreshes once and runs it again.
pub async fn authorized<T, F, Fut>(
    credentials: &dyn CredentialProvider,
    mut call: F,
) -> Result<T, TransferError>
where
    F: FnMut(String) -> Fut,
    Fut: Future<Output = Result<T, TransferError>>,
{
    let token = credentials.token().await?;
    match call(token.clone()).await {
        Err(TransferError::CredentialExpired) => {
            info!("remote rejected access token, refreshing");
            let fresh = credentials.refresh(&token).await?;
            call(fresh).await
        }
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct CountingRefresher {
        calls: AtomicU32,
    }

    impl CountingRefresher {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicU32::new(0),
            })
        }
    }

    impl TokenRefresher for CountingRefresher {
        fn refresh<'a>(
            &'a self,
            refresh_token: &'a str,
        ) -> BoxFuture<'a, Result<TokenGrant, TransferError>> {
            Box::pin(async move {
                let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
                Ok(TokenGrant {
                    access_token: format!("fresh-{n}"),
                    refresh_token: Some(format!("{refresh_token}+")),
                    expires_at: Some(Utc::now() + Duration::days(30)),
                })
            })
        }
    }

    fn grant(expires_at: Option<DateTime<Utc>>) -> TokenGrant {
        TokenGrant {
            access_token: "old".into(),
            refresh_token: Some("r".into()),
            expires_at,
        }
    }

    #[tokio::test]
    async fn valid_token_is_returned_without_refresh() {
        let refresher = CountingRefresher::new();
        let creds = CachedCredentials::new(grant(Some(Utc::now() + Duration::hours(1))))
            .with_refresher(refresher.clone());
        assert_eq!(creds.token().await.unwrap(), "old");
        assert_eq!(refresher.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn expired_token_is_refreshed_proactively() {
        let refresher = CountingRefresher::new();
        let creds = CachedCredentials::new(grant(Some(Utc::now() - Duration::hours(1))))
            .with_refresher(refresher.clone());
        assert_eq!(creds.token().await.unwrap(), "fresh-1");
        assert_eq!(creds.current().await.refresh_token.as_deref(), Some("r+"));
        // The new grant is valid, so the next call does not refresh again.
        assert_eq!(creds.token().await.unwrap(), "fresh-1");
        assert_eq!(refresher.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn refresh_of_already_replaced_token_is_skipped() {
        let refresher = CountingRefresher::new();
        let creds = CachedCredentials::new(grant(None)).with_refresher(refresher.clone());
        assert_eq!(creds.refresh("old").await.unwrap(), "fresh-1");
        assert_eq!(creds.refresh("old").await.unwrap(), "fresh-1");
        assert_eq!(refresher.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn refresh_without_refresher_fails() {
        let creds = CachedCredentials::new(grant(None));
        assert!(matches!(
            creds.refresh("old").await,
            Err(TransferError::CredentialExpired)
        ));
        assert!(matches!(
            StaticCredentials::new("t").refresh("t").await,
            Err(TransferError::CredentialExpired)
        ));
    }

    #[tokio::test]
    async fn authorized_refreshes_once_on_expiry() {
        let refresher = CountingRefresher::new();
        let creds = CachedCredentials::new(grant(None)).with_refresher(refresher.clone());
        let seen = std::sync::Mutex::new(Vec::new());

        let result = authorized(&creds, |token| {
            seen.lock().unwrap().push(token.clone());
            async move {
                if token == "old" {
                    Err(TransferError::CredentialExpired)
                } else {
                    Ok(token)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), "fresh-1");
        assert_eq!(*seen.lock().unwrap(), vec!["old", "fresh-1"]);
    }

    #[tokio::test]
    async fn authorized_does_not_loop_on_repeated_expiry() {
        let refresher = CountingRefresher::new();
        let creds = CachedCredentials::new(grant(None)).with_refresher(refresher.clone());
        let calls = AtomicU32::new(0);

        let result: Result<(), _> = authorized(&creds, |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(TransferError::CredentialExpired) }
        })
        .await;

        assert!(matches!(result, Err(TransferError::CredentialExpired)));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(refresher.calls.load(Ordering::SeqCst), 1);
    }
}
