//! Guest-facing HTTP API.
//!
//! Handlers stay thin: identity extraction, a host-key check on the two
//! host-only operations, then a call into the admission core. Every failure
//! leaves through one place (`IntoResponse for AdmissionError`) so the wire
//! shape and status mapping cannot drift per endpoint.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{ConnectInfo, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Redirect, Response};
use axum::routing::get;
use axum::{Json, Router};
use chrono::Utc;
use serde::Deserialize;
use tower_http::cors::CorsLayer;
use tracing::info;

use aux_proto::protocol::{ApiError, AuthStatus, EnqueueRequest, VibeRequest};

use crate::error::AdmissionError;
use crate::{pipeline, AppContext};

pub fn router(ctx: Arc<AppContext>) -> Router {
    Router::new()
        .route("/api/auth/login", get(begin_login))
        .route("/api/auth/callback", get(complete_login))
        .route("/api/auth/status", get(auth_status))
        .route("/api/auth/logout", axum::routing::post(logout))
        .route("/api/now-playing", get(now_playing))
        .route("/api/queue", get(get_queue).post(enqueue))
        .route("/api/search", get(search))
        .route("/api/quota", get(quota_status))
        .route("/api/vibe", get(get_vibe).put(set_vibe))
        .route("/api/vibe/check", get(check_vibe))
        .layer(CorsLayer::permissive())
        .with_state(ctx)
}

pub async fn serve(ctx: Arc<AppContext>) -> anyhow::Result<()> {
    let addr = format!(
        "{}:{}",
        ctx.config.http.bind_address, ctx.config.http.port
    );
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("guest API listening on http://{}", addr);
    axum::serve(
        listener,
        router(ctx).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;
    Ok(())
}

/// Quota buckets key on the display layer's per-browser id when it sends
/// one, else the peer address. Best-effort only; guests are unauthenticated
/// by design.
fn client_id(headers: &HeaderMap, peer: SocketAddr) -> String {
    headers
        .get("x-client-id")
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| peer.ip().to_string())
}

fn require_host_key(ctx: &AppContext, headers: &HeaderMap) -> Result<(), AdmissionError> {
    let presented = headers
        .get("x-host-key")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    if presented == ctx.host_key {
        Ok(())
    } else {
        Err(AdmissionError::Forbidden)
    }
}

// ── auth ──────────────────────────────────────────────────────────────────────

async fn begin_login(
    State(ctx): State<Arc<AppContext>>,
) -> Result<Redirect, AdmissionError> {
    let login = ctx.handshakes.begin(&ctx.config.upstream).await?;
    Ok(Redirect::temporary(&login.authorize_url))
}

#[derive(Debug, Deserialize)]
struct CallbackParams {
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    state: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

async fn complete_login(
    State(ctx): State<Arc<AppContext>>,
    Query(params): Query<CallbackParams>,
) -> Result<Json<AuthStatus>, AdmissionError> {
    if let Some(denied) = params.error {
        return Err(AdmissionError::InvalidRequest(format!(
            "authorization was refused upstream: {denied}"
        )));
    }
    let code = params
        .code
        .filter(|c| !c.is_empty())
        .ok_or_else(|| AdmissionError::InvalidRequest("missing authorization code".to_string()))?;
    let state = params
        .state
        .filter(|s| !s.is_empty())
        .ok_or_else(|| AdmissionError::InvalidRequest("missing state token".to_string()))?;

    let verifier = ctx.handshakes.complete(&state).await?;
    ctx.tokens.exchange_code(&code, &verifier).await?;
    info!("host completed the login handshake");
    Ok(Json(ctx.tokens.status().await))
}

async fn auth_status(State(ctx): State<Arc<AppContext>>) -> Json<AuthStatus> {
    Json(ctx.tokens.status().await)
}

async fn logout(
    State(ctx): State<Arc<AppContext>>,
    headers: HeaderMap,
) -> Result<Json<AuthStatus>, AdmissionError> {
    require_host_key(&ctx, &headers)?;
    ctx.tokens.clear().await;
    info!("host cleared the credential");
    Ok(Json(ctx.tokens.status().await))
}

// ── read-through projections ──────────────────────────────────────────────────

async fn now_playing(State(ctx): State<Arc<AppContext>>) -> Result<Response, AdmissionError> {
    let playing = ctx.upstream.currently_playing().await?;
    Ok(Json(playing).into_response())
}

async fn get_queue(State(ctx): State<Arc<AppContext>>) -> Result<Response, AdmissionError> {
    let queue = ctx.upstream.queue().await?;
    Ok(Json(queue).into_response())
}

#[derive(Debug, Deserialize)]
struct SearchParams {
    #[serde(default)]
    q: String,
}

async fn search(
    State(ctx): State<Arc<AppContext>>,
    Query(params): Query<SearchParams>,
) -> Result<Response, AdmissionError> {
    if params.q.trim().is_empty() {
        return Err(AdmissionError::InvalidRequest(
            "search query must not be empty".to_string(),
        ));
    }
    let tracks = ctx.upstream.search(params.q.trim()).await?;
    Ok(Json(aux_proto::protocol::SearchResults { tracks }).into_response())
}

// ── admission ─────────────────────────────────────────────────────────────────

async fn enqueue(
    State(ctx): State<Arc<AppContext>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Json(request): Json<EnqueueRequest>,
) -> Result<Response, AdmissionError> {
    let client = client_id(&headers, peer);
    let receipt = pipeline::enqueue(&ctx, &client, &request.track_id).await?;
    Ok((StatusCode::CREATED, Json(receipt)).into_response())
}

async fn quota_status(
    State(ctx): State<Arc<AppContext>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> Response {
    let client = client_id(&headers, peer);
    Json(ctx.quota.peek(&client)).into_response()
}

// ── vibe policy ───────────────────────────────────────────────────────────────

async fn get_vibe(State(ctx): State<Arc<AppContext>>) -> Response {
    Json(ctx.vibe.policy().await).into_response()
}

async fn set_vibe(
    State(ctx): State<Arc<AppContext>>,
    headers: HeaderMap,
    Json(request): Json<VibeRequest>,
) -> Result<Response, AdmissionError> {
    require_host_key(&ctx, &headers)?;
    let policy = ctx.vibe.set_policy(request).await?;
    Ok(Json(policy).into_response())
}

#[derive(Debug, Deserialize)]
struct CheckParams {
    track_id: String,
}

async fn check_vibe(
    State(ctx): State<Arc<AppContext>>,
    Query(params): Query<CheckParams>,
) -> Result<Response, AdmissionError> {
    let report = pipeline::check_vibe(&ctx, &params.track_id).await?;
    Ok(Json(report).into_response())
}

// ── error mapping ─────────────────────────────────────────────────────────────

impl IntoResponse for AdmissionError {
    fn into_response(self) -> Response {
        let status = match &self {
            AdmissionError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            AdmissionError::Auth(_) => StatusCode::UNAUTHORIZED,
            AdmissionError::Forbidden => StatusCode::FORBIDDEN,
            AdmissionError::HandshakeNotFound => StatusCode::NOT_FOUND,
            AdmissionError::NoActiveTarget => StatusCode::CONFLICT,
            AdmissionError::VibeRejected { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            AdmissionError::QuotaExceeded { .. } => StatusCode::TOO_MANY_REQUESTS,
            AdmissionError::UpstreamUnavailable(_) => StatusCode::BAD_GATEWAY,
        };

        let mut body = ApiError {
            error: self.kind().to_string(),
            message: self.to_string(),
            reset_at: None,
            minutes_remaining: None,
            vibe: None,
        };
        match self {
            AdmissionError::QuotaExceeded { reset_at } => {
                let seconds = (reset_at - Utc::now()).num_seconds().max(0);
                body.minutes_remaining = Some((seconds + 59) / 60);
                body.reset_at = Some(reset_at);
                body.message = format!(
                    "queue limit reached; try again in about {} minute(s)",
                    body.minutes_remaining.unwrap_or(0)
                );
            }
            AdmissionError::VibeRejected { report } => {
                body.vibe = Some(report);
            }
            _ => {}
        }

        (status, Json(body)).into_response()
    }
}
