//! Output extraction from `/history/{prompt_id}` responses.
//!
//! The history body is keyed by prompt id:
//!
//! ```json
//! { "<prompt_id>": { "outputs": { "<node>": { "images": [
//!     { "filename": "out_0001.png", "subfolder": "", "type": "output" }
//! ] } } } }
//! ```

use serde::Deserialize;

use atelier_core::preset::NODE_SAVE;

/// Reference to a file the backend wrote, as accepted by `/view`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ImageRef {
    pub filename: String,
    #[serde(default)]
    pub subfolder: String,
    #[serde(rename = "type", default = "default_folder_type")]
    pub folder_type: String,
}

fn default_folder_type() -> String {
    "output".to_string()
}

/// Find the first image output of `prompt_id`.
///
/// The save node's output is preferred; otherwise the first node (by id)
/// with an image wins, so the choice is stable across calls.
pub fn first_image(history: &serde_json::Value, prompt_id: &str) -> Option<ImageRef> {
    let outputs = history.get(prompt_id)?.get("outputs")?.as_object()?;

    let from_node = |node: &serde_json::Value| -> Option<ImageRef> {
        let image = node.get("images")?.as_array()?.first()?;
        serde_json::from_value(image.clone()).ok()
    };

    if let Some(image) = outputs.get(NODE_SAVE).and_then(from_node) {
        return Some(image);
    }

    let mut nodes: Vec<(&String, &serde_json::Value)> = outputs.iter().collect();
    nodes.sort_by(|a, b| a.0.cmp(b.0));
    nodes.into_iter().find_map(|(_, node)| from_node(node))
}
