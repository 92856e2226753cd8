//! Visual-style presets and their step schedules.
//!
//! Every preset runs a fixed workflow graph on the compute backend. The
//! graph's stages are identified by node id, and each preset's
//! [`StepSchedule`] places those nodes on a single `0..total_steps` axis so
//! that backend events can be turned into a progress fraction:
//!
//! - *coarse* stages (checkpoint load, VAE decode, image save) report one
//!   `executing` event and map to a fixed step index;
//! - *continuous* stages (the base sampler, the face-detail refiner) report
//!   `progress` events with a sub-step value and occupy `steps` consecutive
//!   steps starting at `offset`.
//!
//! The tables are pure data and must match the node ids in the workflow
//! templates. [`StepSchedule::validate`] checks that no stage can reach the
//! final step, which is reserved for the backend's success event.

use serde::{Deserialize, Serialize};

use crate::error::CoreError;

// ---------------------------------------------------------------------------
// Workflow node ids
// ---------------------------------------------------------------------------

/// Base sampler (`KSampler`).
pub const NODE_SAMPLER: &str = "3";
/// Checkpoint loader (`CheckpointLoaderSimple`).
pub const NODE_CHECKPOINT: &str = "4";
/// Empty latent image; carries the output dimensions.
pub const NODE_LATENT: &str = "5";
/// Positive prompt encoder.
pub const NODE_POSITIVE: &str = "6";
/// Negative prompt encoder.
pub const NODE_NEGATIVE: &str = "7";
/// VAE decode.
pub const NODE_VAE_DECODE: &str = "8";
/// Image save; its output is the job artifact.
pub const NODE_SAVE: &str = "9";
/// Face-detail refinement pass.
pub const NODE_FACE_DETAILER: &str = "12";

// ---------------------------------------------------------------------------
// Presets
// ---------------------------------------------------------------------------

/// A named visual style.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Preset {
    Realistic,
    Fantasy,
    Anime,
}

/// All presets, in display order.
pub const ALL_PRESETS: &[Preset] = &[Preset::Realistic, Preset::Fantasy, Preset::Anime];

impl Preset {
    /// Parse from the database `preset` column or a request field.
    pub fn from_name(name: &str) -> Result<Self, CoreError> {
        match name {
            "realistic" => Ok(Self::Realistic),
            "fantasy" => Ok(Self::Fantasy),
            "anime" => Ok(Self::Anime),
            other => Err(CoreError::Validation(format!(
                "Unknown preset '{other}'. Must be one of: realistic, fantasy, anime"
            ))),
        }
    }

    /// Database name value.
    pub fn name(self) -> &'static str {
        match self {
            Self::Realistic => "realistic",
            Self::Fantasy => "fantasy",
            Self::Anime => "anime",
        }
    }

    /// The preset's step schedule.
    pub fn schedule(self) -> &'static StepSchedule {
        match self {
            Self::Realistic => &REALISTIC,
            Self::Fantasy => &FANTASY,
            Self::Anime => &ANIME,
        }
    }

    /// Model checkpoint file loaded by the workflow.
    pub fn checkpoint(self) -> &'static str {
        match self {
            Self::Realistic => "juggernautXL_v9.safetensors",
            Self::Fantasy => "dreamshaperXL_v21.safetensors",
            Self::Anime => "animagineXL_v31.safetensors",
        }
    }

    /// Style keywords appended to the positive prompt.
    pub fn keywords(self) -> &'static str {
        match self {
            Self::Realistic => "photorealistic, highly detailed, natural lighting, 35mm photograph",
            Self::Fantasy => "fantasy art, ethereal atmosphere, intricate detail, painterly",
            Self::Anime => "anime style, vibrant colors, clean line art, cel shading",
        }
    }
}

impl std::fmt::Display for Preset {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

// ---------------------------------------------------------------------------
// Step schedules
// ---------------------------------------------------------------------------

/// A stage that reports a single `executing` event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CoarseStage {
    pub node: &'static str,
    pub label: &'static str,
    pub step: u32,
}

/// A stage that reports `progress` events with a sub-step value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContinuousStage {
    pub node: &'static str,
    pub label: &'static str,
    /// First step occupied by this stage.
    pub offset: u32,
    /// Number of steps the stage spans.
    pub steps: u32,
}

/// Node-keyed placement of a preset's stages on the progress axis.
#[derive(Debug, PartialEq, Eq)]
pub struct StepSchedule {
    pub preset: Preset,
    pub total_steps: u32,
    pub coarse: &'static [CoarseStage],
    pub continuous: &'static [ContinuousStage],
}

const LABEL_CHECKPOINT: &str = "Loading checkpoint";
const LABEL_SAMPLING: &str = "Sampling";
const LABEL_DECODE: &str = "Decoding image";
const LABEL_FACE_DETAIL: &str = "Refining faces";
const LABEL_SAVE: &str = "Saving image";

/// Realistic: 30 sampler steps, then a face-detail pass over the final
/// third (steps 32..48).
pub static REALISTIC: StepSchedule = StepSchedule {
    preset: Preset::Realistic,
    total_steps: 48,
    coarse: &[
        CoarseStage { node: NODE_CHECKPOINT, label: LABEL_CHECKPOINT, step: 0 },
        CoarseStage { node: NODE_VAE_DECODE, label: LABEL_DECODE, step: 31 },
        CoarseStage { node: NODE_SAVE, label: LABEL_SAVE, step: 47 },
    ],
    continuous: &[
        ContinuousStage { node: NODE_SAMPLER, label: LABEL_SAMPLING, offset: 1, steps: 30 },
        ContinuousStage { node: NODE_FACE_DETAILER, label: LABEL_FACE_DETAIL, offset: 32, steps: 15 },
    ],
};

/// Fantasy: a single 35-step sampler, no refinement.
pub static FANTASY: StepSchedule = StepSchedule {
    preset: Preset::Fantasy,
    total_steps: 38,
    coarse: &[
        CoarseStage { node: NODE_CHECKPOINT, label: LABEL_CHECKPOINT, step: 0 },
        CoarseStage { node: NODE_VAE_DECODE, label: LABEL_DECODE, step: 36 },
        CoarseStage { node: NODE_SAVE, label: LABEL_SAVE, step: 37 },
    ],
    continuous: &[
        ContinuousStage { node: NODE_SAMPLER, label: LABEL_SAMPLING, offset: 1, steps: 35 },
    ],
};

/// Anime: 26 sampler steps, then a face-detail pass over the final third
/// (steps 28..42).
pub static ANIME: StepSchedule = StepSchedule {
    preset: Preset::Anime,
    total_steps: 42,
    coarse: &[
        CoarseStage { node: NODE_CHECKPOINT, label: LABEL_CHECKPOINT, step: 0 },
        CoarseStage { node: NODE_VAE_DECODE, label: LABEL_DECODE, step: 27 },
        CoarseStage { node: NODE_SAVE, label: LABEL_SAVE, step: 41 },
    ],
    continuous: &[
        ContinuousStage { node: NODE_SAMPLER, label: LABEL_SAMPLING, offset: 1, steps: 26 },
        ContinuousStage { node: NODE_FACE_DETAILER, label: LABEL_FACE_DETAIL, offset: 28, steps: 13 },
    ],
};

impl StepSchedule {
    /// Look up a coarse stage by node id.
    pub fn coarse_stage(&self, node: &str) -> Option<&CoarseStage> {
        self.coarse.iter().find(|s| s.node == node)
    }

    /// Look up a continuous stage by node id.
    pub fn continuous_stage(&self, node: &str) -> Option<&ContinuousStage> {
        self.continuous.iter().find(|s| s.node == node)
    }

    /// Highest fraction a running job may report. The last step belongs to
    /// the success event alone.
    pub fn running_ceiling(&self) -> f64 {
        f64::from(self.total_steps - 1) / f64::from(self.total_steps)
    }

    /// Fraction reached when `node` starts executing, if it is a coarse stage.
    pub fn coarse_fraction(&self, node: &str) -> Option<(&'static str, f64)> {
        let stage = self.coarse_stage(node)?;
        Some((stage.label, self.normalize(f64::from(stage.step))))
    }

    /// Fraction reached at sub-step `value` of `node`, if it is a
    /// continuous stage. The sub-step is clamped into the stage's span so a
    /// sampler running more steps than scheduled never spills into the next
    /// stage.
    pub fn continuous_fraction(&self, node: &str, value: f64) -> Option<(&'static str, f64)> {
        let stage = self.continuous_stage(node)?;
        let sub_step = if value.is_nan() {
            0.0
        } else {
            value.clamp(0.0, f64::from(stage.steps))
        };
        Some((stage.label, self.normalize(sub_step + f64::from(stage.offset))))
    }

    /// Number of steps of the base sampler.
    pub fn sampler_steps(&self) -> u32 {
        self.continuous_stage(NODE_SAMPLER)
            .map(|s| s.steps)
            .unwrap_or_default()
    }

    /// Check that the table is internally consistent:
    ///
    /// - every coarse step and every continuous span ends below
    ///   `total_steps`;
    /// - continuous spans do not overlap each other or a coarse step;
    /// - node ids are unique.
    pub fn validate(&self) -> Result<(), CoreError> {
        let preset = self.preset;
        if self.total_steps < 2 {
            return Err(CoreError::Validation(format!(
                "{preset}: total_steps must be at least 2"
            )));
        }

        for stage in self.coarse {
            if stage.step >= self.total_steps {
                return Err(CoreError::Validation(format!(
                    "{preset}: stage {} at step {} reaches total {}",
                    stage.node, stage.step, self.total_steps
                )));
            }
        }

        for stage in self.continuous {
            let end = stage.offset + stage.steps;
            if end >= self.total_steps {
                return Err(CoreError::Validation(format!(
                    "{preset}: stage {} spans {}..={end}, reaching total {}",
                    stage.node, stage.offset, self.total_steps
                )));
            }
            for other in self.continuous {
                if other.node != stage.node
                    && stage.offset < other.offset + other.steps
                    && other.offset < end
                {
                    return Err(CoreError::Validation(format!(
                        "{preset}: stages {} and {} overlap",
                        stage.node, other.node
                    )));
                }
            }
            for coarse in self.coarse {
                if (stage.offset..end).contains(&coarse.step) {
                    return Err(CoreError::Validation(format!(
                        "{preset}: coarse stage {} falls inside {}",
                        coarse.node, stage.node
                    )));
                }
            }
        }

        let mut nodes: Vec<&str> = self
            .coarse
            .iter()
            .map(|s| s.node)
            .chain(self.continuous.iter().map(|s| s.node))
            .collect();
        let count = nodes.len();
        nodes.sort_unstable();
        nodes.dedup();
        if nodes.len() != count {
            return Err(CoreError::Validation(format!(
                "{preset}: duplicate node id in schedule"
            )));
        }

        Ok(())
    }

    fn normalize(&self, step: f64) -> f64 {
        step / f64::from(self.total_steps)
    }
}
