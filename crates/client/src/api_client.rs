//! HTTP backend for page loads, mutations and device tokens.

use std::time::Duration;

use async_trait::async_trait;
use inbox_shared::{
    base_url_for_host, join_url, ApiError, FeedPage, FeedType, Identity, MutationKind,
    PageRequest, UserToken, HEADER_TENANT_ID, HEADER_USER_ID,
};
use reqwest::{Client, RequestBuilder};
use serde::de::DeserializeOwned;

use crate::config::ClientConfig;

/// Backend calls the engine makes on behalf of a session.
///
/// [`ApiClient`] talks HTTP; tests plug in in-memory fakes.
#[async_trait]
pub trait InboxBackend: Send + Sync + 'static {
    /// One page of `request.feed`, newest first, starting after `request.cursor`.
    async fn fetch_page(&self, session: &Identity, request: &PageRequest)
        -> Result<FeedPage, ApiError>;

    async fn mutate(
        &self,
        session: &Identity,
        message_id: &str,
        kind: MutationKind,
    ) -> Result<(), ApiError>;

    async fn mark_all_read(&self, session: &Identity, feed: &FeedType) -> Result<(), ApiError>;

    async fn track_click(&self, session: &Identity, message_id: &str) -> Result<(), ApiError>;

    async fn put_user_token(&self, session: &Identity, token: &UserToken) -> Result<(), ApiError>;

    async fn delete_user_token(&self, session: &Identity, token: &str) -> Result<(), ApiError>;
}

/// HTTP client for the inbox API.
#[derive(Debug, Clone)]
pub struct ApiClient {
    client: Client,
    base_url: String,
    timeout: Duration,
}

impl ApiClient {
    /// Create a new API client
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url_for_host(&base_url.into()),
            timeout: ClientConfig::default().request_timeout,
        }
    }

    pub fn from_config(config: &ClientConfig) -> Self {
        Self::new(config.api_url.clone()).with_timeout(config.request_timeout)
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn url(&self, session: &Identity, path: &str) -> String {
        let base = match &session.endpoints.api_url {
            Some(url) => base_url_for_host(url),
            None => self.base_url.clone(),
        };
        join_url(&base, path)
    }

    fn authorize(&self, rb: RequestBuilder, session: &Identity) -> RequestBuilder {
        let mut rb = rb
            .bearer_auth(session.token.as_str())
            .header(HEADER_USER_ID, &session.user_id)
            .timeout(self.timeout);
        if let Some(tenant) = &session.tenant_id {
            rb = rb.header(HEADER_TENANT_ID, tenant);
        }
        rb
    }

    /// Send a request and return the body of a successful response.
    async fn execute(&self, rb: RequestBuilder) -> Result<String, ApiError> {
        let resp = rb.send().await.map_err(map_reqwest_error)?;

        let status = resp.status().as_u16();
        let is_success = resp.status().is_success();

        let text = resp
            .text()
            .await
            .map_err(|e| ApiError::Network(format!("failed to read body: {e}")))?;

        if !is_success {
            return Err(ApiError::Http { status, body: text });
        }
        Ok(text)
    }

    async fn get_json<TRes: DeserializeOwned>(
        &self,
        session: &Identity,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<TRes, ApiError> {
        let rb = self.authorize(self.client.get(self.url(session, path)), session).query(query);
        let text = self.execute(rb).await?;
        serde_json::from_str(&text).map_err(|e| ApiError::Deserialize(e.to_string()))
    }

    async fn post(&self, session: &Identity, path: &str, query: &[(&str, String)]) -> Result<(), ApiError> {
        let rb = self.authorize(self.client.post(self.url(session, path)), session).query(query);
        self.execute(rb).await.map(|_| ())
    }
}

fn map_reqwest_error(e: reqwest::Error) -> ApiError {
    if e.is_timeout() {
        ApiError::Timeout
    } else {
        ApiError::Network(e.to_string())
    }
}

fn token_path(session: &Identity, token: &str) -> String {
    format!(
        "/users/{}/tokens/{}",
        urlencoding::encode(&session.user_id),
        urlencoding::encode(token)
    )
}

#[async_trait]
impl InboxBackend for ApiClient {
    async fn fetch_page(
        &self,
        session: &Identity,
        request: &PageRequest,
    ) -> Result<FeedPage, ApiError> {
        let mut query = vec![
            ("feed", request.feed.tag()),
            ("limit", request.limit.to_string()),
        ];
        if let Some(cursor) = &request.cursor {
            query.push(("cursor", cursor.clone()));
        }
        self.get_json(session, "/inbox/messages", &query).await
    }

    async fn mutate(
        &self,
        session: &Identity,
        message_id: &str,
        kind: MutationKind,
    ) -> Result<(), ApiError> {
        let path = format!(
            "/inbox/messages/{}/{}",
            urlencoding::encode(message_id),
            kind.action()
        );
        self.post(session, &path, &[]).await
    }

    async fn mark_all_read(&self, session: &Identity, feed: &FeedType) -> Result<(), ApiError> {
        self.post(session, "/inbox/messages/read-all", &[("feed", feed.tag())])
            .await
    }

    async fn track_click(&self, session: &Identity, message_id: &str) -> Result<(), ApiError> {
        let path = format!("/inbox/messages/{}/click", urlencoding::encode(message_id));
        self.post(session, &path, &[]).await
    }

    async fn put_user_token(&self, session: &Identity, token: &UserToken) -> Result<(), ApiError> {
        let url = self.url(session, &token_path(session, &token.token));
        let rb = self.authorize(self.client.put(url), session).json(&serde_json::json!({
            "provider": token.provider,
            "device": token.device,
        }));
        self.execute(rb).await.map(|_| ())
    }

    async fn delete_user_token(&self, session: &Identity, token: &str) -> Result<(), ApiError> {
        let url = self.url(session, &token_path(session, token));
        let rb = self.authorize(self.client.delete(url), session);
        self.execute(rb).await.map(|_| ())
    }
}
