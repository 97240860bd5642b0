//! The vibe filter: does a candidate track fit what the room is feeling?
//!
//! Policies are either static (explicit per-dimension bounds, usually from a
//! preset) or dynamic ("match now playing": a tolerance window around the
//! live reference track). Missing data always fails open: a track is never
//! rejected because a profile could not be fetched.

use aux_proto::protocol::{
    AudioProfile, DimensionRange, DimensionRanges, Tolerances, Verdict, VibeMode, VibePolicy,
    VibeReport, VibeRequest,
};
use tokio::sync::RwLock;
use tracing::info;

use crate::error::AdmissionError;

/// Default tolerance radii for the `match` preset.
const MATCH_TOLERANCE: Tolerances = Tolerances {
    energy: 0.25,
    valence: 0.3,
    tempo: 30.0,
    danceability: 0.25,
};

/// Evaluation order is fixed so reason lists (and the primary reason) come
/// out deterministic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Dimension {
    Energy,
    Valence,
    Tempo,
    Danceability,
}

const DIMENSIONS: [Dimension; 4] = [
    Dimension::Energy,
    Dimension::Valence,
    Dimension::Tempo,
    Dimension::Danceability,
];

impl Dimension {
    fn measured(self, profile: &AudioProfile) -> f32 {
        match self {
            Self::Energy => profile.energy,
            Self::Valence => profile.valence,
            Self::Tempo => profile.tempo,
            Self::Danceability => profile.danceability,
        }
    }

    fn range(self, ranges: &DimensionRanges) -> Option<DimensionRange> {
        match self {
            Self::Energy => ranges.energy,
            Self::Valence => ranges.valence,
            Self::Tempo => ranges.tempo,
            Self::Danceability => ranges.danceability,
        }
    }

    fn reason(self, below: bool) -> &'static str {
        match (self, below) {
            (Self::Energy, true) => "Energy is too mellow",
            (Self::Energy, false) => "Energy is too intense",
            (Self::Valence, true) => "Mood is too sad",
            (Self::Valence, false) => "Mood is too upbeat",
            (Self::Tempo, true) => "Tempo is too slow",
            (Self::Tempo, false) => "Tempo is too fast",
            (Self::Danceability, true) => "Not danceable enough",
            (Self::Danceability, false) => "Too dancey",
        }
    }
}

/// Process-wide policy singleton behind its own lock.
pub struct VibeFilter {
    policy: RwLock<VibePolicy>,
}

impl VibeFilter {
    /// Unknown preset names fall back to `off` rather than failing startup.
    pub fn new(default_preset: &str) -> Self {
        let policy = preset(default_preset).unwrap_or_else(|| {
            if default_preset != "off" {
                info!("unknown vibe preset {default_preset:?} in config, starting disabled");
            }
            disabled_policy()
        });
        Self {
            policy: RwLock::new(policy),
        }
    }

    pub async fn policy(&self) -> VibePolicy {
        self.policy.read().await.clone()
    }

    pub async fn set_policy(&self, request: VibeRequest) -> Result<VibePolicy, AdmissionError> {
        let new = match request.preset.as_str() {
            "custom" => {
                let ranges = request.ranges.ok_or_else(|| {
                    AdmissionError::InvalidRequest(
                        "custom preset requires explicit ranges".to_string(),
                    )
                })?;
                VibePolicy {
                    preset: "custom".to_string(),
                    enabled: true,
                    mode: VibeMode::Static { ranges },
                }
            }
            "match" => VibePolicy {
                preset: "match".to_string(),
                enabled: true,
                mode: VibeMode::Dynamic {
                    tolerance: request.tolerance.unwrap_or(MATCH_TOLERANCE),
                },
            },
            name => preset(name).ok_or_else(|| {
                AdmissionError::InvalidRequest(format!("unknown vibe preset {name:?}"))
            })?,
        };

        let mut policy = self.policy.write().await;
        info!("vibe policy set to {:?} (enabled={})", new.preset, new.enabled);
        *policy = new.clone();
        Ok(new)
    }
}

fn disabled_policy() -> VibePolicy {
    VibePolicy {
        preset: "off".to_string(),
        enabled: false,
        mode: VibeMode::Static {
            ranges: DimensionRanges::default(),
        },
    }
}

/// Built-in presets. `custom` and tolerance overrides are handled in
/// `set_policy` since they need caller-supplied settings.
pub fn preset(name: &str) -> Option<VibePolicy> {
    let policy = match name {
        "off" => disabled_policy(),
        "party" => VibePolicy {
            preset: "party".to_string(),
            enabled: true,
            mode: VibeMode::Static {
                ranges: DimensionRanges {
                    energy: Some(DimensionRange::new(0.6, 1.0)),
                    tempo: Some(DimensionRange::new(100.0, 150.0)),
                    danceability: Some(DimensionRange::new(0.5, 1.0)),
                    valence: None,
                },
            },
        },
        "chill" => VibePolicy {
            preset: "chill".to_string(),
            enabled: true,
            mode: VibeMode::Static {
                ranges: DimensionRanges {
                    energy: Some(DimensionRange::new(0.0, 0.5)),
                    tempo: Some(DimensionRange::new(60.0, 115.0)),
                    valence: Some(DimensionRange::new(0.2, 0.9)),
                    danceability: None,
                },
            },
        },
        "focus" => VibePolicy {
            preset: "focus".to_string(),
            enabled: true,
            mode: VibeMode::Static {
                ranges: DimensionRanges {
                    energy: Some(DimensionRange::new(0.0, 0.6)),
                    valence: Some(DimensionRange::new(0.0, 0.7)),
                    danceability: Some(DimensionRange::new(0.0, 0.6)),
                    tempo: None,
                },
            },
        },
        "match" => VibePolicy {
            preset: "match".to_string(),
            enabled: true,
            mode: VibeMode::Dynamic {
                tolerance: MATCH_TOLERANCE,
            },
        },
        _ => return None,
    };
    Some(policy)
}

/// Resolve the policy into concrete per-dimension bounds. Dynamic mode needs
/// the live reference; `None` reference means there is nothing to resolve
/// against (caller fails open).
pub fn resolve_thresholds(
    policy: &VibePolicy,
    reference: Option<&AudioProfile>,
) -> Option<DimensionRanges> {
    match &policy.mode {
        VibeMode::Static { ranges } => Some(*ranges),
        VibeMode::Dynamic { tolerance } => reference.map(|r| derive_window(r, tolerance)),
    }
}

/// Symmetric window around the reference. The unit-interval dimensions clamp
/// to `[0, 1]`; tempo is absolute BPM, floored at 0 but unclamped above.
pub fn derive_window(reference: &AudioProfile, tolerance: &Tolerances) -> DimensionRanges {
    let unit = |center: f32, radius: f32| {
        DimensionRange::new((center - radius).max(0.0), (center + radius).min(1.0))
    };
    DimensionRanges {
        energy: Some(unit(reference.energy, tolerance.energy)),
        valence: Some(unit(reference.valence, tolerance.valence)),
        tempo: Some(DimensionRange::new(
            (reference.tempo - tolerance.tempo).max(0.0),
            reference.tempo + tolerance.tempo,
        )),
        danceability: Some(unit(reference.danceability, tolerance.danceability)),
    }
}

/// Judge a measured profile against resolved thresholds. Unconstrained
/// dimensions are skipped; a dimension violates only when strictly outside
/// its bounds.
pub fn classify(
    thresholds: &DimensionRanges,
    measured: AudioProfile,
    reference: Option<AudioProfile>,
) -> VibeReport {
    let mut reasons = Vec::new();
    for dim in DIMENSIONS {
        let Some(range) = dim.range(thresholds) else {
            continue;
        };
        let value = dim.measured(&measured);
        if !range.contains(value) {
            reasons.push(dim.reason(value < range.min).to_string());
        }
    }

    if reasons.is_empty() {
        VibeReport {
            verdict: Verdict::Match,
            reasons,
            primary_reason: None,
            note: None,
            measured: Some(measured),
            reference,
            thresholds: Some(*thresholds),
        }
    } else {
        VibeReport {
            verdict: Verdict::Mismatch,
            primary_reason: reasons.first().cloned(),
            reasons,
            note: None,
            measured: Some(measured),
            reference,
            thresholds: Some(*thresholds),
        }
    }
}

/// Fail-open result: the track is admitted and the report says why it went
/// unjudged.
pub fn pass_open(note: &str, measured: Option<AudioProfile>) -> VibeReport {
    VibeReport {
        verdict: Verdict::Match,
        reasons: Vec::new(),
        primary_reason: None,
        note: Some(note.to_string()),
        measured,
        reference: None,
        thresholds: None,
    }
}
