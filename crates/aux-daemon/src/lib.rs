//! auxd: hands the aux cord to the room without handing over the account.
//!
//! One operator ("host") completes a delegated login once; after that, many
//! untrusted guests can search the catalog and queue tracks through this
//! daemon. Every enqueue runs the admission pipeline: quota hold, vibe
//! check, then the single upstream write, committing quota only on success.

use std::sync::Arc;

use aux_proto::config::Config;
use tracing::info;

pub mod error;
pub mod handshake;
pub mod http;
pub mod pipeline;
pub mod quota;
pub mod token;
pub mod upstream;
pub mod vibe;

use handshake::HandshakeStore;
use quota::QuotaTracker;
use token::TokenManager;
use upstream::UpstreamClient;
use vibe::VibeFilter;

/// Every service the request handlers touch, each behind its own lock. No
/// ambient globals; handlers receive this via axum state.
pub struct AppContext {
    pub config: Config,
    pub tokens: Arc<TokenManager>,
    pub handshakes: HandshakeStore,
    pub quota: QuotaTracker,
    pub vibe: VibeFilter,
    pub upstream: UpstreamClient,
    /// Shared secret gating host-only operations.
    pub host_key: String,
}

impl AppContext {
    pub fn new(config: Config) -> anyhow::Result<Arc<Self>> {
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(config.upstream.timeout_secs))
            .build()?;

        let tokens = Arc::new(TokenManager::new(config.upstream.clone(), http.clone()));
        let upstream = UpstreamClient::new(&config, http, Arc::clone(&tokens));

        let host_key = match &config.host.key {
            Some(key) => key.clone(),
            None => {
                let key = handshake::random_urlsafe(24);
                info!("no host key configured; using generated key for this run: {key}");
                key
            }
        };

        Ok(Arc::new(Self {
            tokens,
            handshakes: HandshakeStore::new(),
            quota: QuotaTracker::new(config.quota.limit, config.quota.window_minutes),
            vibe: VibeFilter::new(&config.vibe.default_preset),
            upstream,
            host_key,
            config,
        }))
    }
}
