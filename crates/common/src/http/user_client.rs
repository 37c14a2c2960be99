use crate::domain::{DomainError, DomainResult, User, UserClient};
use anyhow::Context;
use async_trait::async_trait;
use reqwest::{Client, StatusCode, Url};
use std::time::Duration;
use tracing::{debug, instrument, warn};

/// Value sent in the `Origin` header of every upstream request
pub const ORIGIN: &str = "user-sync";

#[derive(Debug, Clone)]
pub struct UserApiConfig {
    /// Scheme and host, e.g. `http://users.internal`
    pub base_url: String,
    pub api_version: u32,
    pub timeout: Duration,
}

impl Default for UserApiConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8080".to_string(),
            api_version: 2,
            timeout: Duration::from_millis(1000),
        }
    }
}

/// Fetches canonical users from `GET {base_url}/v{api_version}/users/{id}`
#[derive(Clone)]
pub struct HttpUserClient {
    http_client: Client,
    base_url: Url,
    api_version: u32,
}

impl HttpUserClient {
    pub fn new(config: &UserApiConfig) -> anyhow::Result<Self> {
        let base_url = Url::parse(&config.base_url)
            .with_context(|| format!("invalid user API base url: {}", config.base_url))?;
        if base_url.cannot_be_a_base() {
            anyhow::bail!("user API base url cannot be a base: {}", config.base_url);
        }

        let http_client = Client::builder()
            .timeout(config.timeout)
            .build()
            .context("failed to build HTTP client")?;

        Ok(Self {
            http_client,
            base_url,
            api_version: config.api_version,
        })
    }

    fn user_url(&self, user_id: &str) -> DomainResult<Url> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| DomainError::Upstream(format!("cannot build url for user {user_id}")))?
            .pop_if_empty()
            .push(&format!("v{}", self.api_version))
            .push("users")
            .push(user_id);
        Ok(url)
    }
}

#[async_trait]
impl UserClient for HttpUserClient {
    #[instrument(skip(self))]
    async fn get_user(&self, user_id: &str) -> DomainResult<User> {
        let url = self.user_url(user_id)?;
        debug!(url = %url, "fetching user");

        let response = self
            .http_client
            .get(url)
            .header(reqwest::header::ORIGIN, ORIGIN)
            .send()
            .await
            .map_err(|e| {
                warn!(user_id, error = %e, "user API request failed");
                DomainError::Upstream(e.to_string())
            })?;

        let status = response.status();
        if status != StatusCode::OK {
            warn!(user_id, status = status.as_u16(), "user API returned an error status");
            return Err(DomainError::UpstreamStatus {
                user_id: user_id.to_string(),
                status: status.as_u16(),
            });
        }

        let mut user: User = response.json().await.map_err(|e| {
            warn!(user_id, error = %e, "failed to decode user API response");
            DomainError::Upstream(format!("undecodable user body: {e}"))
        })?;

        if user.id.is_empty() {
            user.id = user_id.to_string();
        }

        Ok(user)
    }
}
