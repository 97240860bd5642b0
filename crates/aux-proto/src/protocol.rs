use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Track metadata as projected to the display layer. Shape-mapped from the
/// upstream catalog representation; never stored by the daemon.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Track {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub artists: Vec<String>,
    #[serde(default)]
    pub album: String,
    #[serde(default)]
    pub artwork_url: Option<String>,
    #[serde(default)]
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NowPlaying {
    pub track: Track,
    pub progress_ms: u64,
    pub is_playing: bool,
}

/// Upstream caps the queue at 20 entries and offers no pagination; this is
/// always the full view.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct QueueSnapshot {
    pub now_playing: Option<Track>,
    pub entries: Vec<Track>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchResults {
    pub tracks: Vec<Track>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthStatus {
    pub authenticated: bool,
    pub expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct QuotaStatus {
    pub limit: u32,
    pub remaining: u32,
    pub reset_at: DateTime<Utc>,
}

/// The four audio dimensions the vibe filter reasons about. Energy, valence
/// and danceability are `0.0..=1.0`; tempo is absolute BPM.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct AudioProfile {
    pub energy: f32,
    pub valence: f32,
    pub tempo: f32,
    pub danceability: f32,
}

/// Inclusive `[min, max]` bounds for one dimension.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DimensionRange {
    pub min: f32,
    pub max: f32,
}

impl DimensionRange {
    pub fn new(min: f32, max: f32) -> Self {
        Self { min, max }
    }

    /// Strictly-outside test; boundary values are in range.
    pub fn contains(&self, value: f32) -> bool {
        value >= self.min && value <= self.max
    }
}

/// Per-dimension bounds. `None` means the dimension is not constrained.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct DimensionRanges {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub energy: Option<DimensionRange>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub valence: Option<DimensionRange>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tempo: Option<DimensionRange>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub danceability: Option<DimensionRange>,
}

/// Tolerance radii applied around the currently-playing reference in dynamic
/// mode. Same units as the dimensions themselves.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Tolerances {
    pub energy: f32,
    pub valence: f32,
    pub tempo: f32,
    pub danceability: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum VibeMode {
    Static { ranges: DimensionRanges },
    Dynamic { tolerance: Tolerances },
}

/// The active admission policy. A process-wide singleton on the daemon side;
/// serialized as-is for the policy read/write endpoints.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VibePolicy {
    pub preset: String,
    pub enabled: bool,
    #[serde(flatten)]
    pub mode: VibeMode,
}

impl Default for VibePolicy {
    fn default() -> Self {
        Self {
            preset: "off".to_string(),
            enabled: false,
            mode: VibeMode::Static {
                ranges: DimensionRanges::default(),
            },
        }
    }
}

/// Body of the policy-set request. `ranges` only applies to the `custom`
/// preset, `tolerance` only to `match`.
#[derive(Debug, Clone, Deserialize)]
pub struct VibeRequest {
    pub preset: String,
    #[serde(default)]
    pub ranges: Option<DimensionRanges>,
    #[serde(default)]
    pub tolerance: Option<Tolerances>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Match,
    Mismatch,
}

/// Full classification outcome, rich enough for an explain/preview UI:
/// every violated reason plus the profile and thresholds that produced them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VibeReport {
    pub verdict: Verdict,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub reasons: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub primary_reason: Option<String>,
    /// Set when the filter passed a track without judging it (fail-open).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub measured: Option<AudioProfile>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reference: Option<AudioProfile>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thresholds: Option<DimensionRanges>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EnqueueRequest {
    pub track_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnqueueReceipt {
    pub track_id: String,
    pub quota: QuotaStatus,
}

/// Error body returned by every rejecting endpoint: a stable machine-readable
/// kind plus a human-readable message, with kind-specific extras.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiError {
    pub error: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reset_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub minutes_remaining: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vibe: Option<VibeReport>,
}
