//! Decoding of the realtime frames ComfyUI pushes to a client.
//!
//! Each text frame is `{"type": "<kind>", "data": {...}}`. Only the kinds
//! a job handle reacts to are modelled; anything else fails to decode and
//! is dropped by the caller.

use serde::Deserialize;

/// One decoded realtime frame.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ServerEvent {
    /// Queue broadcast. Never scoped to a prompt.
    Status(QueueInfo),
    ExecutionStart(PromptRef),
    ExecutionCached(CachedNodes),
    /// `node` is `None` once the graph has been walked.
    Executing(NodeStarted),
    /// Sub-step progress from a long-running node such as a sampler.
    Progress(StepProgress),
    Executed(NodeOutput),
    ExecutionSuccess(PromptRef),
    ExecutionError(NodeFailure),
    ExecutionInterrupted(Interruption),
}

impl ServerEvent {
    /// Prompt the frame belongs to. `None` for broadcasts and for frames
    /// the server sent without a scope.
    pub fn prompt_id(&self) -> Option<&str> {
        let id = match self {
            Self::Status(_) => return None,
            Self::Executing(d) => return d.prompt_id.as_deref(),
            Self::Progress(d) => return d.prompt_id.as_deref(),
            Self::ExecutionStart(d) | Self::ExecutionSuccess(d) => &d.prompt_id,
            Self::ExecutionCached(d) => &d.prompt_id,
            Self::Executed(d) => &d.prompt_id,
            Self::ExecutionError(d) => &d.prompt_id,
            Self::ExecutionInterrupted(d) => &d.prompt_id,
        };
        Some(id.as_str())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct QueueInfo {
    #[serde(default)]
    pub status: serde_json::Value,
}

impl QueueInfo {
    pub fn queue_remaining(&self) -> Option<u64> {
        self.status.pointer("/exec_info/queue_remaining")?.as_u64()
    }
}

/// Payload carrying only the prompt id.
#[derive(Debug, Clone, Deserialize)]
pub struct PromptRef {
    pub prompt_id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CachedNodes {
    pub prompt_id: String,
    #[serde(default)]
    pub nodes: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NodeStarted {
    pub node: Option<String>,
    #[serde(default)]
    pub prompt_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StepProgress {
    pub value: f64,
    pub max: f64,
    #[serde(default)]
    pub node: Option<String>,
    #[serde(default)]
    pub prompt_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NodeOutput {
    pub node: String,
    #[serde(default)]
    pub output: serde_json::Value,
    pub prompt_id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NodeFailure {
    pub prompt_id: String,
    #[serde(default)]
    pub node_id: Option<String>,
    #[serde(default)]
    pub exception_type: Option<String>,
    #[serde(default = "unknown_failure")]
    pub exception_message: String,
}

fn unknown_failure() -> String {
    "Execution error".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct Interruption {
    pub prompt_id: String,
    #[serde(default)]
    pub node_id: Option<String>,
}

/// Decode a text frame. Unknown kinds and malformed JSON are errors.
pub fn parse_message(text: &str) -> Result<ServerEvent, serde_json::Error> {
    serde_json::from_str(text)
}
