// Token lifecycle manager.
// Refreshes the bearer credential before it expires, on a timer and on demand.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use reqwest::Client;
use serde_json::Value;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::api::client::{check_response, join_url};
use crate::api::types::{RefreshRequest, RefreshResponse};
use crate::clock::SharedClock;
use crate::config::Config;
use crate::error::{Result, WeCareError};
use crate::signal::{LifecycleEvent, Signals, next_event};

use super::token::{Credential, CredentialStore, DEFAULT_EXPIRY_BUFFER, is_expiring};

/// Default period of the background expiry check.
pub const DEFAULT_CHECK_INTERVAL: Duration = Duration::from_secs(4 * 60);

const DEFAULT_REFRESH_PATH: &str = "/api/auth/refresh";
const CURRENT_USER_PATH: &str = "/api/auth/me";

pub struct TokenManager {
    http: Client,
    base_url: String,
    refresh_path: String,
    credentials: CredentialStore,
    clock: SharedClock,
    buffer: Duration,
    check_interval: Duration,
    /// Serialises check-and-refresh so concurrent callers never refresh twice.
    refresh_lock: tokio::sync::Mutex<()>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl TokenManager {
    pub fn new(
        http: Client,
        base_url: impl Into<String>,
        credentials: CredentialStore,
        clock: SharedClock,
    ) -> Self {
        Self {
            http,
            base_url: base_url.into(),
            refresh_path: DEFAULT_REFRESH_PATH.to_string(),
            credentials,
            clock,
            buffer: DEFAULT_EXPIRY_BUFFER,
            check_interval: DEFAULT_CHECK_INTERVAL,
            refresh_lock: tokio::sync::Mutex::new(()),
            task: Mutex::new(None),
        }
    }

    pub fn from_config(
        config: &Config,
        http: Client,
        credentials: CredentialStore,
        clock: SharedClock,
    ) -> Self {
        Self::new(http, config.api_base_url.clone(), credentials, clock)
            .with_refresh_path(config.refresh_path.clone())
            .with_expiry_buffer(config.expiry_buffer())
            .with_check_interval(config.token_check_interval())
    }

    pub fn with_refresh_path(mut self, path: impl Into<String>) -> Self {
        self.refresh_path = path.into();
        self
    }

    pub fn with_expiry_buffer(mut self, buffer: Duration) -> Self {
        self.buffer = buffer;
        self
    }

    pub fn with_check_interval(mut self, interval: Duration) -> Self {
        self.check_interval = interval;
        self
    }

    pub fn token(&self) -> Option<String> {
        self.credentials.get()
    }

    pub fn credential(&self) -> Option<Credential> {
        self.credentials.credential()
    }

    pub fn is_authenticated(&self) -> bool {
        self.token().is_some()
    }

    /// `Authorization` header value for the current credential.
    pub fn auth_header(&self) -> Option<String> {
        self.token().map(|token| format!("Bearer {}", token))
    }

    pub fn login(&self, token: &str) -> Result<()> {
        self.credentials.set(token)?;
        info!("Credential stored");
        Ok(())
    }

    pub fn logout(&self) {
        if self.credentials.clear() {
            info!("Credential cleared");
        }
    }

    /// True if the stored credential is missing, unreadable, or inside the buffer.
    pub fn is_expiring(&self) -> bool {
        match self.token() {
            Some(token) => is_expiring(&token, self.clock.now(), self.buffer),
            None => true,
        }
    }

    /// Exchange the current credential for a new one.
    ///
    /// On failure the stored credential is removed before the error is returned.
    pub async fn refresh(&self) -> Result<String> {
        let _guard = self.refresh_lock.lock().await;
        self.refresh_locked().await
    }

    async fn refresh_locked(&self) -> Result<String> {
        match self.request_refresh().await {
            Ok(token) => {
                self.credentials.set(&token)?;
                info!("Token refreshed");
                Ok(token)
            }
            Err(e) => {
                if self.credentials.clear() {
                    warn!(error = %e, "Token refresh failed, credential cleared");
                }
                Err(e)
            }
        }
    }

    async fn request_refresh(&self) -> Result<String> {
        let token = self.credentials.get().ok_or(WeCareError::MissingToken)?;
        let url = join_url(&self.base_url, &self.refresh_path);
        let response = self
            .http
            .post(&url)
            .bearer_auth(&token)
            .json(&RefreshRequest { token: &token })
            .send()
            .await?;
        let body: RefreshResponse = check_response(response).await?.json().await?;
        body.into_token()
            .ok_or_else(|| WeCareError::InvalidToken("refresh response carried no token".into()))
    }

    /// Refresh if a credential is stored and close to expiry.
    ///
    /// Returns whether a refresh happened. Without a credential this is a no-op.
    pub async fn check_and_refresh(&self) -> Result<bool> {
        let _guard = self.refresh_lock.lock().await;
        let Some(token) = self.credentials.get() else {
            return Ok(false);
        };
        if !is_expiring(&token, self.clock.now(), self.buffer) {
            debug!("Credential still fresh");
            return Ok(false);
        }
        self.refresh_locked().await.map(|_| true)
    }

    /// Check run whenever a protected route is entered.
    pub async fn on_navigation(&self) -> Result<bool> {
        self.check_and_refresh().await
    }

    /// Fetch the authenticated user; clears the credential if that fails.
    pub async fn fetch_user(&self) -> Result<Value> {
        let token = self.token().ok_or(WeCareError::MissingToken)?;
        let url = join_url(&self.base_url, CURRENT_USER_PATH);
        let result = async {
            let response = self.http.get(&url).bearer_auth(&token).send().await?;
            Ok(check_response(response).await?.json::<Value>().await?)
        }
        .await;

        if let Err(e) = &result {
            warn!(error = %e, "Failed to fetch user, clearing credential");
            self.credentials.clear();
        }
        result
    }

    async fn run_check(&self) {
        match self.check_and_refresh().await {
            Ok(true) => info!("Token refreshed automatically"),
            Ok(false) => {}
            Err(e) => error!(error = %e, "Failed to refresh token"),
        }
    }

    /// Check immediately, then every check interval and whenever the app becomes visible.
    pub fn start(self: &Arc<Self>, signals: &Signals) {
        let manager = Arc::clone(self);
        let mut events = Some(signals.subscribe());

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(manager.check_interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    event = visibility(&mut events) => {
                        if event.is_none() {
                            events = None;
                            continue;
                        }
                    }
                }

                manager.run_check().await;
            }
        });

        if let Some(previous) = self.task.lock().replace(handle) {
            previous.abort();
        }
    }

    /// Stop the background check.
    pub fn stop(&self) {
        if let Some(handle) = self.task.lock().take() {
            handle.abort();
        }
    }

    pub fn is_running(&self) -> bool {
        self.task.lock().as_ref().is_some_and(|h| !h.is_finished())
    }
}

/// Next `Visible` event; never resolves once the hub has gone away.
async fn visibility(events: &mut Option<broadcast::Receiver<LifecycleEvent>>) -> Option<()> {
    match events.as_mut() {
        Some(receiver) => next_event(receiver, LifecycleEvent::Visible).await,
        None => std::future::pending().await,
    }
}

impl Drop for TokenManager {
    fn drop(&mut self) {
        self.stop();
    }
}
