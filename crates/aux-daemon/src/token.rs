//! Credential lifecycle for the one delegated token pair.
//!
//! The daemon holds exactly one access/refresh pair on behalf of the host.
//! Refreshing it is single-flight: rapid duplicate refresh attempts risk the
//! authority invalidating the shared refresh token, so concurrent callers
//! that observe an expiring token all wait on one upstream call.

use aux_proto::config::UpstreamConfig;
use aux_proto::protocol::AuthStatus;
use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;
use tokio::sync::{Mutex, RwLock};
use tracing::{info, warn};

use crate::error::AdmissionError;

/// Refresh this long before the recorded expiry rather than riding it down
/// to zero.
const EXPIRY_SKEW_SECS: i64 = 60;

#[derive(Debug, Clone)]
struct CredentialState {
    access_token: String,
    refresh_token: String,
    expires_at: DateTime<Utc>,
}

impl CredentialState {
    fn is_fresh(&self, now: DateTime<Utc>) -> bool {
        now < self.expires_at - Duration::seconds(EXPIRY_SKEW_SECS)
    }
}

/// Token endpoint response (RFC 6749 §5.1). `refresh_token` is optional on
/// refresh grants; the previous one stays valid when omitted.
#[derive(Debug, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    #[serde(default)]
    pub token_type: String,
    #[serde(default)]
    pub expires_in: Option<u64>,
    #[serde(default)]
    pub refresh_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TokenErrorResponse {
    error: String,
    #[serde(default)]
    error_description: Option<String>,
}

pub struct TokenManager {
    cfg: UpstreamConfig,
    http: reqwest::Client,
    state: RwLock<Option<CredentialState>>,
    /// Serialises refresh attempts. Holders re-check state after acquiring:
    /// the winner refreshes, everyone else finds a fresh token waiting.
    refresh_gate: Mutex<()>,
}

impl TokenManager {
    pub fn new(cfg: UpstreamConfig, http: reqwest::Client) -> Self {
        Self {
            cfg,
            http,
            state: RwLock::new(None),
            refresh_gate: Mutex::new(()),
        }
    }

    /// Exchange an authorization code (plus its PKCE verifier) for the
    /// initial token pair and install it.
    pub async fn exchange_code(
        &self,
        code: &str,
        verifier: &str,
    ) -> Result<(), AdmissionError> {
        let response = self
            .http
            .post(&self.cfg.token_url)
            .form(&[
                ("grant_type", "authorization_code"),
                ("code", code),
                ("redirect_uri", self.cfg.redirect_uri.as_str()),
                ("client_id", self.cfg.client_id.as_str()),
                ("code_verifier", verifier),
            ])
            .send()
            .await
            .map_err(transport_error)?;

        if !response.status().is_success() {
            let detail = error_detail(response).await;
            return Err(AdmissionError::Auth(format!(
                "token exchange failed: {detail}"
            )));
        }

        let token: TokenResponse = response
            .json()
            .await
            .map_err(|e| AdmissionError::Auth(format!("bad token response: {e}")))?;
        self.install(token).await
    }

    /// Store a freshly exchanged pair. The initial grant must carry a
    /// refresh token or the daemon could never outlive the first expiry.
    pub async fn install(&self, token: TokenResponse) -> Result<(), AdmissionError> {
        let refresh_token = token.refresh_token.ok_or_else(|| {
            AdmissionError::Auth("token response carried no refresh token".to_string())
        })?;
        let expires_at = expiry_from(token.expires_in);
        let mut state = self.state.write().await;
        *state = Some(CredentialState {
            access_token: token.access_token,
            refresh_token,
            expires_at,
        });
        info!("credential installed, expires at {}", expires_at);
        Ok(())
    }

    /// Returns a bearer token that is valid for at least the skew window,
    /// refreshing first if needed.
    pub async fn acquire(&self) -> Result<String, AdmissionError> {
        let now = Utc::now();
        {
            let state = self.state.read().await;
            match state.as_ref() {
                None => return Err(not_authenticated()),
                Some(s) if s.is_fresh(now) => return Ok(s.access_token.clone()),
                Some(_) => {}
            }
        }

        let _gate = self.refresh_gate.lock().await;
        // Re-check: another caller may have finished the refresh while we
        // waited on the gate.
        let now = Utc::now();
        {
            let state = self.state.read().await;
            match state.as_ref() {
                None => return Err(not_authenticated()),
                Some(s) if s.is_fresh(now) => return Ok(s.access_token.clone()),
                Some(_) => {}
            }
        }
        self.refresh_locked().await
    }

    /// Reactive path: an upstream call using `stale_token` came back
    /// unauthorized. Refresh once, unless a concurrent caller already did.
    pub async fn refresh_after_unauthorized(
        &self,
        stale_token: &str,
    ) -> Result<String, AdmissionError> {
        let _gate = self.refresh_gate.lock().await;
        {
            let state = self.state.read().await;
            match state.as_ref() {
                None => return Err(not_authenticated()),
                Some(s) if s.access_token != stale_token => {
                    return Ok(s.access_token.clone())
                }
                Some(_) => {}
            }
        }
        self.refresh_locked().await
    }

    /// One refresh call. Caller must hold `refresh_gate`.
    async fn refresh_locked(&self) -> Result<String, AdmissionError> {
        let refresh_token = {
            let state = self.state.read().await;
            match state.as_ref() {
                None => return Err(not_authenticated()),
                Some(s) => s.refresh_token.clone(),
            }
        };

        let response = self
            .http
            .post(&self.cfg.token_url)
            .form(&[
                ("grant_type", "refresh_token"),
                ("refresh_token", refresh_token.as_str()),
                ("client_id", self.cfg.client_id.as_str()),
            ])
            .send()
            .await
            .map_err(transport_error)?;

        let status = response.status();
        if status.is_client_error() {
            // The authority rejected the refresh token (revoked, reused, or
            // otherwise dead). The whole pair is now useless; drop it so
            // every later request reports "not authenticated" until the
            // host redoes the handshake.
            let detail = error_detail(response).await;
            warn!("refresh rejected by token authority: {detail}; clearing credential");
            self.clear().await;
            return Err(AdmissionError::Auth(format!("refresh rejected: {detail}")));
        }
        if !status.is_success() {
            return Err(AdmissionError::UpstreamUnavailable(format!(
                "token endpoint returned {status}"
            )));
        }

        let token: TokenResponse = response.json().await.map_err(|e| {
            AdmissionError::UpstreamUnavailable(format!("bad token response: {e}"))
        })?;

        let mut state = self.state.write().await;
        let new_state = CredentialState {
            access_token: token.access_token.clone(),
            // A refresh response may rotate the refresh token; keep the old
            // one when it does not.
            refresh_token: token.refresh_token.unwrap_or(refresh_token),
            expires_at: expiry_from(token.expires_in),
        };
        info!("credential refreshed, expires at {}", new_state.expires_at);
        *state = Some(new_state);
        Ok(token.access_token)
    }

    pub async fn status(&self) -> AuthStatus {
        let state = self.state.read().await;
        match state.as_ref() {
            Some(s) => AuthStatus {
                authenticated: true,
                expires_at: Some(s.expires_at),
            },
            None => AuthStatus {
                authenticated: false,
                expires_at: None,
            },
        }
    }

    pub async fn clear(&self) {
        let mut state = self.state.write().await;
        *state = None;
    }

    #[cfg(test)]
    async fn install_raw(&self, access: &str, refresh: &str, expires_at: DateTime<Utc>) {
        let mut state = self.state.write().await;
        *state = Some(CredentialState {
            access_token: access.to_string(),
            refresh_token: refresh.to_string(),
            expires_at,
        });
    }
}

fn not_authenticated() -> AdmissionError {
    AdmissionError::Auth("no credential; the host must complete the login handshake".to_string())
}

fn expiry_from(expires_in: Option<u64>) -> DateTime<Utc> {
    Utc::now() + Duration::seconds(expires_in.unwrap_or(3600) as i64)
}

fn transport_error(e: reqwest::Error) -> AdmissionError {
    if e.is_timeout() {
        AdmissionError::UpstreamUnavailable("token endpoint timed out".to_string())
    } else {
        AdmissionError::UpstreamUnavailable(e.to_string())
    }
}

async fn error_detail(response: reqwest::Response) -> String {
    let status = response.status();
    let text = response.text().await.unwrap_or_default();
    match serde_json::from_str::<TokenErrorResponse>(&text) {
        Ok(body) => body.error_description.unwrap_or(body.error),
        Err(_) => format!("{status}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::routing::post;
    use axum::{Json, Router};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    async fn spawn_token_endpoint(
        hits: Arc<AtomicUsize>,
        reject: bool,
    ) -> String {
        let app = Router::new().route(
            "/api/token",
            post(move || {
                let hits = hits.clone();
                async move {
                    hits.fetch_add(1, Ordering::SeqCst);
                    // Hold the response briefly so concurrent callers pile
                    // up on the gate instead of racing past it.
                    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
                    if reject {
                        (
                            axum::http::StatusCode::BAD_REQUEST,
                            Json(serde_json::json!({
                                "error": "invalid_grant",
                                "error_description": "Refresh token revoked",
                            })),
                        )
                    } else {
                        (
                            axum::http::StatusCode::OK,
                            Json(serde_json::json!({
                                "access_token": "fresh-token",
                                "token_type": "Bearer",
                                "expires_in": 3600,
                            })),
                        )
                    }
                }
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}/api/token")
    }

    fn manager(token_url: String) -> TokenManager {
        let cfg = UpstreamConfig {
            client_id: "client".to_string(),
            token_url,
            ..UpstreamConfig::default()
        };
        TokenManager::new(cfg, reqwest::Client::new())
    }

    #[tokio::test]
    async fn test_acquire_without_credential_is_auth_error() {
        let mgr = manager("http://127.0.0.1:9/never".to_string());
        let err = mgr.acquire().await.unwrap_err();
        assert_eq!(err.kind(), "auth_error");
    }

    #[tokio::test]
    async fn test_fresh_token_is_returned_without_refresh() {
        let hits = Arc::new(AtomicUsize::new(0));
        let url = spawn_token_endpoint(hits.clone(), false).await;
        let mgr = manager(url);
        mgr.install_raw("live", "r1", Utc::now() + Duration::hours(1))
            .await;
        assert_eq!(mgr.acquire().await.unwrap(), "live");
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_proactive_refresh_inside_skew_window() {
        let hits = Arc::new(AtomicUsize::new(0));
        let url = spawn_token_endpoint(hits.clone(), false).await;
        let mgr = manager(url);
        // expires in 30s, inside the 60s skew
        mgr.install_raw("stale", "r1", Utc::now() + Duration::seconds(30))
            .await;
        assert_eq!(mgr.acquire().await.unwrap(), "fresh-token");
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_concurrent_expired_observers_refresh_once() {
        let hits = Arc::new(AtomicUsize::new(0));
        let url = spawn_token_endpoint(hits.clone(), false).await;
        let mgr = Arc::new(manager(url));
        mgr.install_raw("stale", "r1", Utc::now() - Duration::seconds(1))
            .await;

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let mgr = mgr.clone();
            tasks.push(tokio::spawn(async move { mgr.acquire().await }));
        }
        for task in tasks {
            assert_eq!(task.await.unwrap().unwrap(), "fresh-token");
        }
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_rejected_refresh_clears_credential() {
        let hits = Arc::new(AtomicUsize::new(0));
        let url = spawn_token_endpoint(hits.clone(), true).await;
        let mgr = manager(url);
        mgr.install_raw("stale", "revoked", Utc::now() - Duration::seconds(1))
            .await;

        let err = mgr.acquire().await.unwrap_err();
        assert_eq!(err.kind(), "auth_error");
        // pair is gone: the next attempt fails before any upstream call
        assert!(!mgr.status().await.authenticated);
        let err = mgr.acquire().await.unwrap_err();
        assert_eq!(err.kind(), "auth_error");
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_reactive_refresh_skips_when_already_refreshed() {
        let hits = Arc::new(AtomicUsize::new(0));
        let url = spawn_token_endpoint(hits.clone(), false).await;
        let mgr = manager(url);
        mgr.install_raw("replacement", "r1", Utc::now() + Duration::hours(1))
            .await;
        // Caller saw a 401 on "old", but the state already moved on.
        let token = mgr.refresh_after_unauthorized("old").await.unwrap();
        assert_eq!(token, "replacement");
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }
}
