//! OAuth access-token cache with background-ahead refresh.
//!
//! Access tokens live only in process memory, keyed by channel. A token
//! within five minutes of expiry is refreshed before use; a failed refresh
//! surfaces `ReauthRequired`, which quiesces uploads for that channel until
//! the operator renews the stored refresh token.

use crate::error::ClientError;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{info, warn};

/// Refresh when the cached token has less than this long to live.
const REFRESH_MARGIN_MINUTES: i64 = 5;

const TOKEN_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
struct CachedToken {
    access_token: String,
    expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct OauthConfig {
    pub token_url: String,
    pub client_id: String,
    pub client_secret: String,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: i64,
}

pub struct OauthCache {
    config: OauthConfig,
    http: reqwest::Client,
    tokens: Mutex<HashMap<String, CachedToken>>,
}

impl OauthCache {
    pub fn new(config: OauthConfig) -> Result<Self, ClientError> {
        let http = reqwest::Client::builder()
            .timeout(TOKEN_TIMEOUT)
            .build()
            .map_err(ClientError::from_reqwest)?;
        Ok(Self {
            config,
            http,
            tokens: Mutex::new(HashMap::new()),
        })
    }

    /// Get a usable access token for a channel, refreshing if the cached one
    /// is missing or inside the expiry margin.
    pub async fn access_token(
        &self,
        channel: &str,
        refresh_token: &str,
    ) -> Result<String, ClientError> {
        {
            let tokens = self.tokens.lock().await;
            if let Some(cached) = tokens.get(channel) {
                let margin = ChronoDuration::minutes(REFRESH_MARGIN_MINUTES);
                if cached.expires_at - Utc::now() > margin {
                    return Ok(cached.access_token.clone());
                }
            }
        }
        self.refresh(channel, refresh_token).await
    }

    /// Drop a channel's cached token (after reauth or credential rotation).
    pub async fn invalidate(&self, channel: &str) {
        self.tokens.lock().await.remove(channel);
    }

    async fn refresh(&self, channel: &str, refresh_token: &str) -> Result<String, ClientError> {
        let params = [
            ("client_id", self.config.client_id.as_str()),
            ("client_secret", self.config.client_secret.as_str()),
            ("refresh_token", refresh_token),
            ("grant_type", "refresh_token"),
        ];
        let response = self
            .http
            .post(&self.config.token_url)
            .form(&params)
            .send()
            .await
            .map_err(|e| {
                warn!(channel, error = %e, "token refresh transport failure");
                ClientError::from_reqwest(e)
            })?;

        let status = response.status();
        if !status.is_success() {
            warn!(channel, status = status.as_u16(), "token refresh rejected");
            return Err(ClientError::ReauthRequired {
                channel: channel.to_string(),
            });
        }

        let token: TokenResponse = response.json().await.map_err(|_| {
            ClientError::ReauthRequired {
                channel: channel.to_string(),
            }
        })?;

        let cached = CachedToken {
            access_token: token.access_token.clone(),
            expires_at: Utc::now() + ChronoDuration::seconds(token.expires_in.max(60)),
        };
        self.tokens.lock().await.insert(channel.to_string(), cached);
        info!(channel, "access token refreshed");
        Ok(token.access_token)
    }

    /// Seed the cache directly; used by tests and by credential rotation.
    pub async fn seed(&self, channel: &str, access_token: &str, expires_at: DateTime<Utc>) {
        self.tokens.lock().await.insert(
            channel.to_string(),
            CachedToken {
                access_token: access_token.to_string(),
                expires_at,
            },
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cache() -> OauthCache {
        OauthCache::new(OauthConfig {
            token_url: "http://127.0.0.1:1/token".into(),
            client_id: "id".into(),
            client_secret: "secret".into(),
        })
        .unwrap()
    }

    #[tokio::test]
    async fn fresh_cached_token_is_served_without_refresh() {
        let cache = cache();
        cache
            .seed("alpha", "tok-1", Utc::now() + ChronoDuration::hours(1))
            .await;
        let token = cache.access_token("alpha", "refresh").await.unwrap();
        assert_eq!(token, "tok-1");
    }

    #[tokio::test]
    async fn token_inside_margin_triggers_refresh() {
        let cache = cache();
        // Two minutes left: inside the five-minute margin, so the cache must
        // hit the (unreachable) token endpoint and fail.
        cache
            .seed("alpha", "tok-1", Utc::now() + ChronoDuration::minutes(2))
            .await;
        let result = cache.access_token("alpha", "refresh").await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn invalidate_forgets_the_token() {
        let cache = cache();
        cache
            .seed("alpha", "tok-1", Utc::now() + ChronoDuration::hours(1))
            .await;
        cache.invalidate("alpha").await;
        assert!(cache.access_token("alpha", "refresh").await.is_err());
    }
}
