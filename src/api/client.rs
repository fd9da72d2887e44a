// WeCare API HTTP client.
// Handles bearer authentication, 401 refresh-and-replay, and response status mapping.

use std::sync::Arc;
use std::time::Duration;

use reqwest::{
    Client, Method, Response, StatusCode,
    header::{ACCEPT, HeaderMap, HeaderValue, USER_AGENT},
};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{info, warn};

use crate::auth::TokenManager;
use crate::config::Config;
use crate::error::{Result, WeCareError};
use crate::perf::PerformanceMonitor;

use super::types::ApiMessage;

/// Build the shared reqwest client.
pub fn build_http_client(config: &Config) -> Result<Client> {
    let mut headers = HeaderMap::new();
    headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
    headers.insert(USER_AGENT, HeaderValue::from_static("wecare-sync"));

    Client::builder()
        .default_headers(headers)
        .timeout(config.request_timeout())
        .build()
        .map_err(WeCareError::Http)
}

/// Join a base URL and an endpoint path.
pub fn join_url(base_url: &str, endpoint: &str) -> String {
    format!(
        "{}/{}",
        base_url.trim_end_matches('/'),
        endpoint.trim_start_matches('/')
    )
}

/// Check response status and convert errors.
pub async fn check_response(response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    match status {
        StatusCode::UNAUTHORIZED => Err(WeCareError::Unauthorized),
        StatusCode::NOT_FOUND => Err(WeCareError::NotFound(response.url().to_string())),
        status => {
            let message = error_message(response).await;
            if status.is_server_error() {
                Err(WeCareError::Server { status, message })
            } else {
                Err(WeCareError::Status { status, message })
            }
        }
    }
}

/// Pull `message` out of a JSON error body, falling back to the raw text.
async fn error_message(response: Response) -> String {
    let text = response.text().await.unwrap_or_default();
    serde_json::from_str::<ApiMessage>(&text)
        .ok()
        .and_then(|body| body.message)
        .unwrap_or(text)
}

/// Authenticated client for the WeCare REST API.
pub struct ApiClient {
    http: Client,
    base_url: String,
    auth: Arc<TokenManager>,
    monitor: Arc<PerformanceMonitor>,
    /// Base delay of the endpoint retry policies.
    retry_delay: Duration,
}

impl ApiClient {
    pub fn new(
        http: Client,
        base_url: impl Into<String>,
        auth: Arc<TokenManager>,
        monitor: Arc<PerformanceMonitor>,
    ) -> Self {
        Self {
            http,
            base_url: base_url.into(),
            auth,
            monitor,
            retry_delay: Duration::from_secs(1),
        }
    }

    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    pub fn retry_delay(&self) -> Duration {
        self.retry_delay
    }

    pub fn auth(&self) -> &Arc<TokenManager> {
        &self.auth
    }

    pub fn monitor(&self) -> &Arc<PerformanceMonitor> {
        &self.monitor
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Make a GET request to the API.
    pub async fn get(&self, endpoint: &str) -> Result<Response> {
        self.send(Method::GET, endpoint, None).await
    }

    /// GET and decode a JSON body.
    pub async fn get_json<T: DeserializeOwned>(&self, endpoint: &str) -> Result<T> {
        let response = self.get(endpoint).await?;
        Ok(response.json().await?)
    }

    /// POST a JSON body and decode the JSON response.
    pub async fn post_json<T: DeserializeOwned>(&self, endpoint: &str, body: &Value) -> Result<T> {
        let response = self.send(Method::POST, endpoint, Some(body)).await?;
        Ok(response.json().await?)
    }

    /// GET a JSON body, timed as `api-<name>` by the performance monitor.
    pub async fn get_timed<T: DeserializeOwned>(&self, name: &str, endpoint: &str) -> Result<T> {
        self.monitor.time(name, self.get_json(endpoint)).await
    }

    async fn send(&self, method: Method, endpoint: &str, body: Option<&Value>) -> Result<Response> {
        let url = join_url(&self.base_url, endpoint);
        let token = self.auth.token();
        let response = self
            .request(method.clone(), &url, body, token.as_deref())
            .send()
            .await?;

        if response.status() != StatusCode::UNAUTHORIZED {
            return check_response(response).await;
        }

        if token.is_none() {
            return Err(WeCareError::Unauthorized);
        }

        // One refresh-and-replay; a failed refresh has already cleared the credential
        info!(url = %url, "Request unauthorized, refreshing credential");
        let token = self.auth.refresh().await?;
        let retried = self
            .request(method, &url, body, Some(&token))
            .send()
            .await?;

        if retried.status() == StatusCode::UNAUTHORIZED {
            warn!(url = %url, "Still unauthorized after refresh, clearing credential");
            self.auth.logout();
        }
        check_response(retried).await
    }

    fn request(
        &self,
        method: Method,
        url: &str,
        body: Option<&Value>,
        token: Option<&str>,
    ) -> reqwest::RequestBuilder {
        let mut request = self.http.request(method, url);
        if let Some(token) = token {
            request = request.bearer_auth(token);
        }
        if let Some(body) = body {
            request = request.json(body);
        }
        request
    }
}
