//! OAuth refresh-token grant.

use chrono::{Duration, Utc};
use tracing::debug;

use panbd_transfer::{BoxFuture, TokenGrant, TokenRefresher, TransferError};

use crate::client::{PanClient, read_json};
use crate::error::ClientError;
use crate::types::TokenReply;

/// Exchanges a refresh token for a new access token.
pub struct RefreshTokenGrant {
    client: PanClient,
    app_key: String,
    secret_key: String,
}

impl RefreshTokenGrant {
    pub fn new(client: PanClient, app_key: impl Into<String>, secret_key: impl Into<String>) -> Self {
        Self {
            client,
            app_key: app_key.into(),
            secret_key: secret_key.into(),
        }
    }

    /// Requests a new grant from the OAuth endpoint.
    pub async fn exchange(&self, refresh_token: &str) -> Result<TokenGrant, ClientError> {
        if self.app_key.is_empty() || self.secret_key.is_empty() {
            return Err(ClientError::Config(
                "app key and secret key are required to refresh tokens".into(),
            ));
        }

        let url = format!("{}/oauth/2.0/token", self.client.endpoints().oauth);
        let resp = self
            .client
            .http()
            .get(&url)
            .query(&[
                ("grant_type", "refresh_token"),
                ("refresh_token", refresh_token),
                ("client_id", self.app_key.as_str()),
                ("client_secret", self.secret_key.as_str()),
            ])
            .send()
            .await?;

        let status = resp.status();
        let reply: TokenReply = if status.is_success() {
            read_json(resp).await?
        } else {
            // The token endpoint reports rejections as 400 with an `error` field.
            let body = resp.text().await.unwrap_or_default();
            serde_json::from_str(&body).map_err(|_| ClientError::Status {
                status: status.as_u16(),
                body,
            })?
        };

        if let Some(error) = reply.error {
            let detail = reply.error_description.unwrap_or_default();
            return Err(ClientError::Auth(format!("{error}: {detail}")));
        }
        let access_token = reply
            .access_token
            .filter(|t| !t.is_empty())
            .ok_or_else(|| ClientError::InvalidResponse("token reply without access_token".into()))?;
        let expires_at = reply.expires_in.map(|secs| Utc::now() + Duration::seconds(secs));

        debug!(expires_at = ?expires_at, "token endpoint issued a new grant");
        Ok(TokenGrant {
            access_token,
            refresh_token: reply.refresh_token.or_else(|| Some(refresh_token.to_string())),
            expires_at,
        })
    }
}

impl TokenRefresher for RefreshTokenGrant {
    fn refresh<'a>(&'a self, refresh_token: &'a str) -> BoxFuture<'a, Result<TokenGrant, TransferError>> {
        Box::pin(async move { Ok(self.exchange(refresh_token).await?) })
    }
}
