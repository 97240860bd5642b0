//! One-time-use correlation between an authorization redirect and the PKCE
//! verifier generated for it.
//!
//! The verifier never leaves the daemon; the authorization URL only carries
//! its S256 challenge. Records expire after ten minutes of logical time, and
//! are consumed exactly once whether completion succeeds or fails.

use std::collections::HashMap;

use aux_proto::config::UpstreamConfig;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use chrono::{DateTime, Duration, Utc};
use rand::RngCore as _;
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;
use url::Url;

use crate::error::AdmissionError;

const HANDSHAKE_TTL_MINUTES: i64 = 10;

#[derive(Debug)]
struct HandshakeRecord {
    verifier: String,
    created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct BeginLogin {
    pub state: String,
    pub authorize_url: String,
}

#[derive(Default)]
pub struct HandshakeStore {
    entries: Mutex<HashMap<String, HandshakeRecord>>,
}

impl HandshakeStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a login: mint verifier + state, stash the record, and hand back
    /// the fully assembled upstream authorization URL.
    pub async fn begin(&self, cfg: &UpstreamConfig) -> Result<BeginLogin, AdmissionError> {
        let verifier = random_urlsafe(32);
        let state = random_urlsafe(16);
        let challenge = pkce_challenge(&verifier);

        let mut auth_url = Url::parse(&cfg.authorize_url).map_err(|e| {
            AdmissionError::UpstreamUnavailable(format!(
                "authorize URL in config is not a valid URL: {e}"
            ))
        })?;
        auth_url
            .query_pairs_mut()
            .append_pair("response_type", "code")
            .append_pair("client_id", &cfg.client_id)
            .append_pair("redirect_uri", &cfg.redirect_uri)
            .append_pair("scope", &cfg.scopes)
            .append_pair("state", &state)
            .append_pair("code_challenge", &challenge)
            .append_pair("code_challenge_method", "S256");

        let now = Utc::now();
        let mut entries = self.entries.lock().await;
        // Opportunistic sweep; `complete` enforces expiry regardless.
        entries.retain(|_, r| now - r.created_at <= ttl());
        entries.insert(
            state.clone(),
            HandshakeRecord {
                verifier,
                created_at: now,
            },
        );

        Ok(BeginLogin {
            state,
            authorize_url: auth_url.to_string(),
        })
    }

    /// Consume the record for `state` and return its verifier. The record is
    /// removed on every lookup, so a replayed state fails even when the
    /// first completion failed downstream.
    pub async fn complete(&self, state: &str) -> Result<String, AdmissionError> {
        let record = {
            let mut entries = self.entries.lock().await;
            entries
                .remove(state)
                .ok_or(AdmissionError::HandshakeNotFound)?
        };
        if Utc::now() - record.created_at > ttl() {
            return Err(AdmissionError::HandshakeNotFound);
        }
        Ok(record.verifier)
    }
}

fn ttl() -> Duration {
    Duration::minutes(HANDSHAKE_TTL_MINUTES)
}

/// `n` random bytes, base64url without padding.
pub fn random_urlsafe(n: usize) -> String {
    let mut bytes = vec![0u8; n];
    rand::thread_rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

fn pkce_challenge(verifier: &str) -> String {
    let digest = Sha256::digest(verifier.as_bytes());
    URL_SAFE_NO_PAD.encode(digest)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> UpstreamConfig {
        UpstreamConfig {
            client_id: "client-id".to_string(),
            ..UpstreamConfig::default()
        }
    }

    #[test]
    fn test_challenge_matches_rfc7636_vector() {
        // RFC 7636 appendix B
        let challenge = pkce_challenge("dBjftJeZ4CVP-mB92K27uhbUJU1p1r_wW1gFWFOEjXk");
        assert_eq!(challenge, "E9Melhoa2OwvFrEMTJguCHaoeK1t8URWbuGJSstw-cM");
    }

    #[tokio::test]
    async fn test_begin_builds_authorize_url() {
        let store = HandshakeStore::new();
        let login = store.begin(&cfg()).await.unwrap();
        let url = Url::parse(&login.authorize_url).unwrap();
        let pairs: std::collections::HashMap<_, _> = url.query_pairs().collect();
        assert_eq!(pairs["response_type"], "code");
        assert_eq!(pairs["client_id"], "client-id");
        assert_eq!(pairs["code_challenge_method"], "S256");
        assert_eq!(pairs["state"], login.state.as_str());
        // challenge is derived, not the verifier itself
        let verifier = store.complete(&login.state).await.unwrap();
        assert_ne!(pairs["code_challenge"], verifier.as_str());
        assert_eq!(pairs["code_challenge"], pkce_challenge(&verifier).as_str());
    }

    #[tokio::test]
    async fn test_record_consumed_exactly_once() {
        let store = HandshakeStore::new();
        let login = store.begin(&cfg()).await.unwrap();
        assert!(store.complete(&login.state).await.is_ok());
        let err = store.complete(&login.state).await.unwrap_err();
        assert_eq!(err.kind(), "not_found");
    }

    #[tokio::test]
    async fn test_unknown_state_fails_not_found() {
        let store = HandshakeStore::new();
        let err = store.complete("nope").await.unwrap_err();
        assert_eq!(err.kind(), "not_found");
    }

    #[tokio::test]
    async fn test_expired_record_rejected_even_without_sweep() {
        let store = HandshakeStore::new();
        let login = store.begin(&cfg()).await.unwrap();
        {
            let mut entries = store.entries.lock().await;
            let record = entries.get_mut(&login.state).unwrap();
            record.created_at = Utc::now() - Duration::minutes(11);
        }
        let err = store.complete(&login.state).await.unwrap_err();
        assert_eq!(err.kind(), "not_found");
    }

    #[tokio::test]
    async fn test_begin_sweeps_stale_entries() {
        let store = HandshakeStore::new();
        let old = store.begin(&cfg()).await.unwrap();
        {
            let mut entries = store.entries.lock().await;
            let record = entries.get_mut(&old.state).unwrap();
            record.created_at = Utc::now() - Duration::minutes(11);
        }
        let _ = store.begin(&cfg()).await.unwrap();
        let entries = store.entries.lock().await;
        assert!(!entries.contains_key(&old.state));
    }

    #[test]
    fn test_random_urlsafe_entropy_length() {
        let a = random_urlsafe(32);
        let b = random_urlsafe(32);
        assert_ne!(a, b);
        // 32 bytes -> 43 chars of unpadded base64url
        assert_eq!(a.len(), 43);
    }
}
