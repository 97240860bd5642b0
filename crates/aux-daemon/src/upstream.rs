//! Typed client for the mediated music service's Web API.
//!
//! Every call goes through `call()`, which attaches the current bearer token
//! (refreshing proactively via the token manager) and performs exactly one
//! reactive refresh-and-retry when the service answers 401. A second 401 on
//! the retried request is terminal and drops the credential pair.

use std::sync::Arc;

use aux_proto::config::Config;
use aux_proto::protocol::{AudioProfile, NowPlaying, QueueSnapshot, Track};
use reqwest::{RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use tracing::{debug, warn};

use crate::error::AdmissionError;
use crate::token::TokenManager;

/// Upstream never returns more queue entries than this; enforced here too so
/// a misbehaving mock cannot balloon the projection.
const QUEUE_CAP: usize = 20;

pub struct UpstreamClient {
    http: reqwest::Client,
    api_base: String,
    search_limit: u32,
    tokens: Arc<TokenManager>,
}

// ── upstream wire shapes ──────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct ApiTrack {
    id: Option<String>,
    name: String,
    #[serde(default)]
    artists: Vec<ApiArtist>,
    #[serde(default)]
    album: Option<ApiAlbum>,
    #[serde(default)]
    duration_ms: u64,
}

#[derive(Debug, Deserialize)]
struct ApiArtist {
    name: String,
}

#[derive(Debug, Deserialize)]
struct ApiAlbum {
    name: String,
    #[serde(default)]
    images: Vec<ApiImage>,
}

#[derive(Debug, Deserialize)]
struct ApiImage {
    url: String,
}

#[derive(Debug, Deserialize)]
struct PlayingBody {
    item: Option<ApiTrack>,
    #[serde(default)]
    progress_ms: Option<u64>,
    #[serde(default)]
    is_playing: bool,
}

#[derive(Debug, Deserialize)]
struct QueueBody {
    #[serde(default)]
    currently_playing: Option<ApiTrack>,
    #[serde(default)]
    queue: Vec<ApiTrack>,
}

#[derive(Debug, Deserialize)]
struct SearchBody {
    tracks: SearchTracks,
}

#[derive(Debug, Deserialize)]
struct SearchTracks {
    #[serde(default)]
    items: Vec<ApiTrack>,
}

#[derive(Debug, Deserialize)]
struct FeaturesBody {
    energy: f32,
    valence: f32,
    tempo: f32,
    danceability: f32,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Debug, Deserialize)]
struct ErrorDetail {
    #[serde(default)]
    message: String,
    #[serde(default)]
    reason: Option<String>,
}

impl From<ApiTrack> for Track {
    fn from(t: ApiTrack) -> Self {
        Track {
            id: t.id.unwrap_or_default(),
            name: t.name,
            artists: t.artists.into_iter().map(|a| a.name).collect(),
            album: t.album.as_ref().map(|a| a.name.clone()).unwrap_or_default(),
            artwork_url: t
                .album
                .and_then(|a| a.images.into_iter().next())
                .map(|i| i.url),
            duration_ms: t.duration_ms,
        }
    }
}

// ── client ────────────────────────────────────────────────────────────────────

impl UpstreamClient {
    pub fn new(config: &Config, http: reqwest::Client, tokens: Arc<TokenManager>) -> Self {
        Self {
            http,
            api_base: config.upstream.api_base.trim_end_matches('/').to_string(),
            search_limit: config.search.limit,
            tokens,
        }
    }

    /// Dispatch with the current bearer token; on 401, refresh once and
    /// retry once. Never loops further.
    async fn call(&self, builder: RequestBuilder) -> Result<Response, AdmissionError> {
        let token = self.tokens.acquire().await?;
        let retry = builder.try_clone();

        let response = builder
            .bearer_auth(&token)
            .send()
            .await
            .map_err(transport_error)?;
        if response.status() != StatusCode::UNAUTHORIZED {
            return check_status(response).await;
        }

        debug!("upstream answered 401, attempting reactive refresh");
        let Some(retry) = retry else {
            return Err(AdmissionError::Auth(
                "credential rejected upstream".to_string(),
            ));
        };
        let token = self.tokens.refresh_after_unauthorized(&token).await?;
        let response = retry
            .bearer_auth(&token)
            .send()
            .await
            .map_err(transport_error)?;
        if response.status() == StatusCode::UNAUTHORIZED {
            warn!("freshly refreshed credential still unauthorized; clearing");
            self.tokens.clear().await;
            return Err(AdmissionError::Auth(
                "upstream rejected a freshly refreshed credential".to_string(),
            ));
        }
        check_status(response).await
    }

    pub async fn currently_playing(&self) -> Result<Option<NowPlaying>, AdmissionError> {
        let response = self
            .call(self.http.get(format!("{}/me/player/currently-playing", self.api_base)))
            .await?;
        if response.status() == StatusCode::NO_CONTENT {
            return Ok(None);
        }
        let body: PlayingBody = decode(response).await?;
        Ok(body.item.map(|item| NowPlaying {
            track: item.into(),
            progress_ms: body.progress_ms.unwrap_or(0),
            is_playing: body.is_playing,
        }))
    }

    pub async fn queue(&self) -> Result<QueueSnapshot, AdmissionError> {
        let response = self
            .call(self.http.get(format!("{}/me/player/queue", self.api_base)))
            .await?;
        let mut body: QueueBody = decode(response).await?;
        body.queue.truncate(QUEUE_CAP);
        Ok(QueueSnapshot {
            now_playing: body.currently_playing.map(Track::from),
            entries: body.queue.into_iter().map(Track::from).collect(),
        })
    }

    pub async fn search(&self, query: &str) -> Result<Vec<Track>, AdmissionError> {
        let limit = self.search_limit.to_string();
        let response = self
            .call(
                self.http
                    .get(format!("{}/search", self.api_base))
                    .query(&[("q", query), ("type", "track"), ("limit", limit.as_str())]),
            )
            .await?;
        let body: SearchBody = decode(response).await?;
        Ok(body.tracks.items.into_iter().map(Track::from).collect())
    }

    /// The one shared write privilege: append a track to the host's queue.
    pub async fn append_to_queue(&self, track_id: &str) -> Result<(), AdmissionError> {
        let uri = format!("spotify:track:{track_id}");
        self.call(
            self.http
                .post(format!("{}/me/player/queue", self.api_base))
                .query(&[("uri", uri.as_str())]),
        )
        .await?;
        Ok(())
    }

    pub async fn audio_profile(&self, track_id: &str) -> Result<AudioProfile, AdmissionError> {
        let response = self
            .call(
                self.http
                    .get(format!("{}/audio-features/{track_id}", self.api_base)),
            )
            .await?;
        let body: FeaturesBody = decode(response).await?;
        Ok(AudioProfile {
            energy: body.energy,
            valence: body.valence,
            tempo: body.tempo,
            danceability: body.danceability,
        })
    }
}

async fn decode<T: serde::de::DeserializeOwned>(response: Response) -> Result<T, AdmissionError> {
    response
        .json()
        .await
        .map_err(|e| AdmissionError::UpstreamUnavailable(format!("bad upstream response: {e}")))
}

fn transport_error(e: reqwest::Error) -> AdmissionError {
    if e.is_timeout() {
        AdmissionError::UpstreamUnavailable("upstream call timed out".to_string())
    } else {
        AdmissionError::UpstreamUnavailable(e.to_string())
    }
}

/// Map a non-401 upstream status to the error taxonomy. The "no active
/// device" answer gets its own kind because the remedy is the host starting
/// playback somewhere, not retrying.
async fn check_status(response: Response) -> Result<Response, AdmissionError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let text = response.text().await.unwrap_or_default();
    let detail = serde_json::from_str::<ErrorBody>(&text).ok().map(|b| b.error);
    let message = detail
        .as_ref()
        .map(|d| d.message.clone())
        .filter(|m| !m.is_empty())
        .unwrap_or_else(|| format!("upstream returned {status}"));

    let no_active_device = detail
        .as_ref()
        .and_then(|d| d.reason.as_deref())
        .map(|r| r == "NO_ACTIVE_DEVICE")
        .unwrap_or(false)
        || message.to_ascii_lowercase().contains("no active device");
    if no_active_device {
        return Err(AdmissionError::NoActiveTarget);
    }

    match status {
        StatusCode::BAD_REQUEST | StatusCode::NOT_FOUND => {
            Err(AdmissionError::InvalidRequest(message))
        }
        StatusCode::FORBIDDEN => Err(AdmissionError::Auth(message)),
        _ => Err(AdmissionError::UpstreamUnavailable(message)),
    }
}
