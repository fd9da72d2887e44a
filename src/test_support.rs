// Shared fixtures for HTTP-backed tests.

use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use reqwest::Client;
use serde_json::{Value, json};

use crate::api::ApiClient;
use crate::auth::{CredentialStore, TokenManager};
use crate::cache::MemoryBackend;
use crate::clock::{SharedClock, SystemClock};
use crate::perf::PerformanceMonitor;

/// A throwaway API server on a loopback port with a client wired to it.
pub(crate) struct TestApi {
    base_url: String,
    auth: Arc<TokenManager>,
    backend: Arc<MemoryBackend>,
    monitor: Arc<PerformanceMonitor>,
}

impl TestApi {
    pub(crate) async fn spawn(router: Router) -> Self {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });

        let base_url = format!("http://{}", addr);
        let backend = Arc::new(MemoryBackend::new());
        let clock: SharedClock = Arc::new(SystemClock);
        let auth = Arc::new(TokenManager::new(
            Client::new(),
            base_url.clone(),
            CredentialStore::new(backend.clone()),
            clock,
        ));

        Self {
            base_url,
            auth,
            backend,
            monitor: Arc::new(PerformanceMonitor::new()),
        }
    }

    pub(crate) fn client(&self) -> ApiClient {
        self.client_for(&self.base_url)
    }

    pub(crate) fn client_for(&self, base_url: &str) -> ApiClient {
        ApiClient::new(
            Client::new(),
            base_url,
            self.auth.clone(),
            self.monitor.clone(),
        )
        .with_retry_delay(Duration::from_millis(10))
    }

    pub(crate) fn auth(&self) -> &Arc<TokenManager> {
        &self.auth
    }

    pub(crate) fn backend(&self) -> &Arc<MemoryBackend> {
        &self.backend
    }

    pub(crate) fn monitor(&self) -> &Arc<PerformanceMonitor> {
        &self.monitor
    }

    pub(crate) fn base_url(&self) -> &str {
        &self.base_url
    }
}

/// An unsigned JWT carrying `payload`.
pub(crate) fn jwt_with_payload(payload: &Value) -> String {
    let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"HS256","typ":"JWT"}"#);
    let body = URL_SAFE_NO_PAD.encode(payload.to_string());
    format!("{}.{}.sig", header, body)
}

/// An unsigned JWT whose `exp` lies `from_now` in the future.
pub(crate) fn jwt_expiring_in(from_now: chrono::Duration) -> String {
    let exp = (chrono::Utc::now() + from_now).timestamp();
    jwt_with_payload(&json!({ "sub": "42", "exp": exp }))
}
