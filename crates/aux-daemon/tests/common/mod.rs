//! Shared test harness: a throwaway in-process stand-in for the music
//! service (token endpoint + the handful of Web API routes the daemon
//! touches), with toggles for the failure modes the admission pipeline has
//! to survive.

// Each test binary uses a different slice of the harness.
#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use aux_proto::config::Config;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde_json::json;

#[derive(Default)]
pub struct MockState {
    pub token_hits: AtomicUsize,
    pub appends: AtomicUsize,
    /// Bearer value the API currently accepts; refresh rotates it.
    pub valid_bearer: Mutex<String>,
    /// Token endpoint answers 400 invalid_grant (revoked refresh token).
    pub reject_refresh: AtomicBool,
    /// Queue-append answers 502.
    pub fail_append: AtomicBool,
    /// Queue-append answers the no-active-device error.
    pub no_active_device: AtomicBool,
    /// Audio-features answers 500 for every track.
    pub fail_features: AtomicBool,
    pub playing_track_id: Mutex<Option<String>>,
    /// track id -> [energy, valence, tempo, danceability]
    pub features: Mutex<HashMap<String, [f32; 4]>>,
}

pub struct MockUpstream {
    pub state: Arc<MockState>,
    pub base: String,
}

impl MockUpstream {
    pub fn set_features(&self, track_id: &str, profile: [f32; 4]) {
        self.state
            .features
            .lock()
            .unwrap()
            .insert(track_id.to_string(), profile);
    }

    pub fn set_playing(&self, track_id: Option<&str>) {
        *self.state.playing_track_id.lock().unwrap() = track_id.map(str::to_string);
    }

    pub fn appends(&self) -> usize {
        self.state.appends.load(Ordering::SeqCst)
    }

    pub fn token_hits(&self) -> usize {
        self.state.token_hits.load(Ordering::SeqCst)
    }

    /// Daemon config pointed entirely at this mock.
    pub fn config(&self, quota_limit: u32) -> Config {
        let mut config = Config::default();
        config.upstream.client_id = "test-client".to_string();
        config.upstream.token_url = format!("{}/api/token", self.base);
        config.upstream.api_base = format!("{}/v1", self.base);
        config.upstream.authorize_url = format!("{}/authorize", self.base);
        config.quota.limit = quota_limit;
        config.host.key = Some("host-secret".to_string());
        config
    }
}

pub async fn spawn_upstream() -> MockUpstream {
    let state = Arc::new(MockState {
        valid_bearer: Mutex::new("valid-token".to_string()),
        ..MockState::default()
    });

    let app = Router::new()
        .route("/api/token", axum::routing::post(token))
        .route(
            "/v1/me/player/currently-playing",
            get(currently_playing),
        )
        .route("/v1/me/player/queue", get(queue).post(append))
        .route("/v1/audio-features/:id", get(audio_features))
        .route("/v1/search", get(search))
        .with_state(state.clone());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    MockUpstream {
        state,
        base: format!("http://{addr}"),
    }
}

fn track_json(id: &str) -> serde_json::Value {
    json!({
        "id": id,
        "name": format!("Track {id}"),
        "artists": [{"name": "Mock Artist"}],
        "album": {"name": "Mock Album", "images": [{"url": "http://img.example/cover.jpg"}]},
        "duration_ms": 200_000,
    })
}

fn authorized(state: &MockState, headers: &HeaderMap) -> bool {
    let expected = format!("Bearer {}", state.valid_bearer.lock().unwrap());
    headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .map(|v| v == expected)
        .unwrap_or(false)
}

fn unauthorized() -> Response {
    (
        StatusCode::UNAUTHORIZED,
        Json(json!({"error": {"status": 401, "message": "The access token expired"}})),
    )
        .into_response()
}

async fn token(State(state): State<Arc<MockState>>) -> Response {
    if state.reject_refresh.load(Ordering::SeqCst) {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({
                "error": "invalid_grant",
                "error_description": "Refresh token revoked",
            })),
        )
            .into_response();
    }
    let n = state.token_hits.fetch_add(1, Ordering::SeqCst) + 1;
    let fresh = format!("refreshed-{n}");
    *state.valid_bearer.lock().unwrap() = fresh.clone();
    Json(json!({
        "access_token": fresh,
        "token_type": "Bearer",
        "expires_in": 3600,
        "refresh_token": "rotated-refresh",
    }))
    .into_response()
}

async fn currently_playing(
    State(state): State<Arc<MockState>>,
    headers: HeaderMap,
) -> Response {
    if !authorized(&state, &headers) {
        return unauthorized();
    }
    let playing = state.playing_track_id.lock().unwrap().clone();
    match playing {
        Some(id) => Json(json!({
            "item": track_json(&id),
            "progress_ms": 1000,
            "is_playing": true,
        }))
        .into_response(),
        None => StatusCode::NO_CONTENT.into_response(),
    }
}

async fn queue(State(state): State<Arc<MockState>>, headers: HeaderMap) -> Response {
    if !authorized(&state, &headers) {
        return unauthorized();
    }
    let playing = state.playing_track_id.lock().unwrap().clone();
    Json(json!({
        "currently_playing": playing.map(|id| track_json(&id)),
        "queue": [track_json("queued0000000000000001")],
    }))
    .into_response()
}

async fn append(State(state): State<Arc<MockState>>, headers: HeaderMap) -> Response {
    if !authorized(&state, &headers) {
        return unauthorized();
    }
    if state.no_active_device.load(Ordering::SeqCst) {
        return (
            StatusCode::NOT_FOUND,
            Json(json!({
                "error": {
                    "status": 404,
                    "message": "Player command failed: No active device found",
                    "reason": "NO_ACTIVE_DEVICE",
                }
            })),
        )
            .into_response();
    }
    if state.fail_append.load(Ordering::SeqCst) {
        return (
            StatusCode::BAD_GATEWAY,
            Json(json!({"error": {"status": 502, "message": "upstream hiccup"}})),
        )
            .into_response();
    }
    state.appends.fetch_add(1, Ordering::SeqCst);
    StatusCode::NO_CONTENT.into_response()
}

async fn audio_features(
    State(state): State<Arc<MockState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Response {
    if !authorized(&state, &headers) {
        return unauthorized();
    }
    if state.fail_features.load(Ordering::SeqCst) {
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({"error": {"status": 500, "message": "analysis backend down"}})),
        )
            .into_response();
    }
    let features = state.features.lock().unwrap();
    match features.get(&id) {
        Some([energy, valence, tempo, danceability]) => Json(json!({
            "energy": energy,
            "valence": valence,
            "tempo": tempo,
            "danceability": danceability,
        }))
        .into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(json!({"error": {"status": 404, "message": "analysis not found"}})),
        )
            .into_response(),
    }
}

async fn search(State(state): State<Arc<MockState>>, headers: HeaderMap) -> Response {
    if !authorized(&state, &headers) {
        return unauthorized();
    }
    Json(json!({
        "tracks": {
            "items": [track_json("result0000000000000001"), track_json("result0000000000000002")],
        }
    }))
    .into_response()
}
