//! The enqueue admission pipeline: the single decision path for "may client
//! C add track T right now".
//!
//! Order matters for cost: shape validation and the quota hold resolve
//! locally; the vibe check spends one upstream read; only then is the one
//! shared write privilege spent. The quota hold commits exclusively after
//! the write succeeds, so every rejection leaves quota untouched.

use aux_proto::protocol::{AudioProfile, EnqueueReceipt, Verdict, VibePolicy, VibeReport};
use tracing::{debug, info};

use crate::error::AdmissionError;
use crate::vibe;
use crate::AppContext;

/// Opaque track ids are 22 base62 characters. Guests paste all sorts of
/// things, so track URIs and share links are normalized instead of refused.
pub fn parse_track_id(raw: &str) -> Result<String, AdmissionError> {
    let mut candidate = raw.trim();
    if let Some(rest) = candidate.strip_prefix("spotify:track:") {
        candidate = rest;
    } else if let Some(rest) = candidate.strip_prefix("https://open.spotify.com/track/") {
        candidate = rest.split(['?', '#']).next().unwrap_or(rest);
    }

    if candidate.len() == 22 && candidate.chars().all(|c| c.is_ascii_alphanumeric()) {
        Ok(candidate.to_string())
    } else {
        Err(AdmissionError::InvalidRequest(format!(
            "{raw:?} is not a track id, track URI, or track link"
        )))
    }
}

pub async fn enqueue(
    ctx: &AppContext,
    client_id: &str,
    raw_track_id: &str,
) -> Result<EnqueueReceipt, AdmissionError> {
    let track_id = parse_track_id(raw_track_id)?;
    let reservation = ctx.quota.try_reserve(client_id)?;

    let policy = ctx.vibe.policy().await;
    if policy.enabled {
        let report = judge(ctx, &policy, &track_id).await;
        if report.verdict == Verdict::Mismatch {
            debug!(
                "vibe rejected track {} for client {}: {:?}",
                track_id, client_id, report.reasons
            );
            // reservation drops here; the hold is released, quota untouched
            return Err(AdmissionError::VibeRejected { report });
        }
    }

    ctx.upstream.append_to_queue(&track_id).await?;

    let quota = ctx.quota.commit(reservation);
    info!(
        "queued track {} for client {} ({} left this window)",
        track_id, client_id, quota.remaining
    );
    Ok(EnqueueReceipt { track_id, quota })
}

/// Preview: classify a candidate under the current policy without holding
/// quota or writing upstream.
pub async fn check_vibe(ctx: &AppContext, raw_track_id: &str) -> Result<VibeReport, AdmissionError> {
    let track_id = parse_track_id(raw_track_id)?;
    let policy = ctx.vibe.policy().await;
    if !policy.enabled {
        return Ok(vibe::pass_open("vibe filter is disabled", None));
    }
    Ok(judge(ctx, &policy, &track_id).await)
}

/// Fetch what the policy needs and classify. Infallible by design: any
/// profile that cannot be fetched fails open with a note instead of
/// blocking the track.
async fn judge(ctx: &AppContext, policy: &VibePolicy, track_id: &str) -> VibeReport {
    let measured = match ctx.upstream.audio_profile(track_id).await {
        Ok(profile) => profile,
        Err(e) => {
            debug!("audio profile for {} unavailable ({}); passing open", track_id, e);
            return vibe::pass_open("audio profile unavailable, track admitted unjudged", None);
        }
    };

    let reference = match &policy.mode {
        aux_proto::protocol::VibeMode::Static { .. } => None,
        aux_proto::protocol::VibeMode::Dynamic { .. } => {
            match reference_profile(ctx).await {
                Some(profile) => Some(profile),
                None => {
                    return vibe::pass_open(
                        "nothing is playing to match against, track admitted unjudged",
                        Some(measured),
                    );
                }
            }
        }
    };

    match vibe::resolve_thresholds(policy, reference.as_ref()) {
        Some(thresholds) => vibe::classify(&thresholds, measured, reference),
        None => vibe::pass_open("no thresholds to judge against, track admitted", Some(measured)),
    }
}

/// The currently-playing track's profile, or `None` if playback is idle or
/// either lookup fails.
async fn reference_profile(ctx: &AppContext) -> Option<AudioProfile> {
    let playing = ctx.upstream.currently_playing().await.ok()??;
    ctx.upstream.audio_profile(&playing.track.id).await.ok()
}
