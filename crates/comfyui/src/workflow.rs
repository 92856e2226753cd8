//! Job description builders.
//!
//! A [`WorkflowBuilder`] turns a preset plus parameters into the
//! ComfyUI API-format graph that is submitted to `/prompt`. The payload is
//! opaque to the rest of the engine.
//!
//! [`TemplateWorkflowBuilder`] patches a per-preset template compiled into
//! the binary. The node ids it writes to are the same ones the preset step
//! schedules track.

use serde_json::Value;

use atelier_core::layout::Layout;
use atelier_core::preset::{
    Preset, NODE_CHECKPOINT, NODE_FACE_DETAILER, NODE_LATENT, NODE_POSITIVE, NODE_SAMPLER,
};

const REALISTIC_TEMPLATE: &str = include_str!("../workflows/realistic.json");
const FANTASY_TEMPLATE: &str = include_str!("../workflows/fantasy.json");
const ANIME_TEMPLATE: &str = include_str!("../workflows/anime.json");

/// Parameters for one job description.
#[derive(Debug, Clone, PartialEq)]
pub struct JobParams {
    pub preset: Preset,
    /// Positive prompt, after any enhancement.
    pub text: String,
    pub seed: u32,
    pub layout: Layout,
}

#[derive(Debug, thiserror::Error)]
pub enum WorkflowError {
    #[error("Workflow template for {preset} is not valid JSON: {source}")]
    Template {
        preset: Preset,
        source: serde_json::Error,
    },

    #[error("Workflow for {preset} has no node {node} with an inputs object")]
    MissingNode { preset: Preset, node: &'static str },
}

/// Builds the backend payload for a job.
pub trait WorkflowBuilder: Send + Sync {
    fn build(&self, params: &JobParams) -> Result<Value, WorkflowError>;
}

/// Builder over the compiled-in per-preset templates.
#[derive(Debug, Clone, Copy, Default)]
pub struct TemplateWorkflowBuilder;

impl TemplateWorkflowBuilder {
    fn template(preset: Preset) -> &'static str {
        match preset {
            Preset::Realistic => REALISTIC_TEMPLATE,
            Preset::Fantasy => FANTASY_TEMPLATE,
            Preset::Anime => ANIME_TEMPLATE,
        }
    }
}

impl WorkflowBuilder for TemplateWorkflowBuilder {
    fn build(&self, params: &JobParams) -> Result<Value, WorkflowError> {
        let preset = params.preset;
        let mut workflow: Value = serde_json::from_str(Self::template(preset))
            .map_err(|source| WorkflowError::Template { preset, source })?;

        let (width, height) = params.layout.dimensions();
        let text = format!("{}, {}", params.text.trim(), preset.keywords());

        set_input(&mut workflow, preset, NODE_POSITIVE, "text", text.into())?;
        set_input(&mut workflow, preset, NODE_CHECKPOINT, "ckpt_name", preset.checkpoint().into())?;
        set_input(&mut workflow, preset, NODE_LATENT, "width", width.into())?;
        set_input(&mut workflow, preset, NODE_LATENT, "height", height.into())?;
        set_input(&mut workflow, preset, NODE_SAMPLER, "seed", params.seed.into())?;
        set_input(
            &mut workflow,
            preset,
            NODE_SAMPLER,
            "steps",
            preset.schedule().sampler_steps().into(),
        )?;

        if let Some(refiner) = preset.schedule().continuous_stage(NODE_FACE_DETAILER) {
            set_input(&mut workflow, preset, NODE_FACE_DETAILER, "seed", params.seed.into())?;
            set_input(&mut workflow, preset, NODE_FACE_DETAILER, "steps", refiner.steps.into())?;
        }

        Ok(workflow)
    }
}

fn set_input(
    workflow: &mut Value,
    preset: Preset,
    node: &'static str,
    key: &str,
    value: Value,
) -> Result<(), WorkflowError> {
    let inputs = workflow
        .get_mut(node)
        .and_then(|n| n.get_mut("inputs"))
        .and_then(Value::as_object_mut)
        .ok_or(WorkflowError::MissingNode { preset, node })?;
    inputs.insert(key.to_string(), value);
    Ok(())
}
