//! ComfyUI API-format workflow graphs and parameter overrides.
//!
//! A workflow is a JSON object keyed by node ID, where each node carries a
//! `class_type` and an `inputs` object:
//!
//! ```json
//! {
//!   "3": { "class_type": "KSampler", "inputs": { "seed": 42, "model": ["4", 0] } },
//!   "6": { "class_type": "CLIPTextEncode", "inputs": { "text": "a cat" } }
//! }
//! ```
//!
//! Inputs are either literal values or links to another node's output,
//! encoded as `[source_node_id, output_index]`.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::CoreError;

// ---------------------------------------------------------------------------
// ComfyUI node class types targeted by overrides
// ---------------------------------------------------------------------------

/// KSampler node class type in ComfyUI.
const KSAMPLER_CLASS: &str = "KSampler";

/// KSampler advanced node class type (seed input is `noise_seed`).
const KSAMPLER_ADVANCED_CLASS: &str = "KSamplerAdvanced";

/// CLIP text encode node class type.
const CLIP_TEXT_ENCODE_CLASS: &str = "CLIPTextEncode";

/// Load LoRA node class type.
const LOAD_LORA_CLASS: &str = "LoraLoader";

/// Load LoRA (model only) node class type.
const LOAD_LORA_MODEL_ONLY_CLASS: &str = "LoraLoaderModelOnly";

// ---------------------------------------------------------------------------
// Graph
// ---------------------------------------------------------------------------

/// A validated, non-empty ComfyUI workflow graph.
///
/// Node order is the order of the source document; override injection
/// relies on it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Value")]
pub struct Graph(Map<String, Value>);

impl TryFrom<Value> for Graph {
    type Error = CoreError;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        Self::from_value(value)
    }
}

impl Graph {
    /// Validate a raw JSON value as a workflow graph.
    ///
    /// The value must be a non-empty object whose entries are objects with
    /// a string `class_type`. `inputs`, when present, must be an object.
    pub fn from_value(json: Value) -> Result<Self, CoreError> {
        let Value::Object(obj) = json else {
            return Err(CoreError::InvalidWorkflow(
                "Workflow JSON must be an object".to_string(),
            ));
        };

        if obj.is_empty() {
            return Err(CoreError::InvalidWorkflow(
                "Workflow JSON must contain at least one node".to_string(),
            ));
        }

        for (node_id, node) in &obj {
            let node = node.as_object().ok_or_else(|| {
                CoreError::InvalidWorkflow(format!("Node '{node_id}' must be an object"))
            })?;

            if node.get("class_type").and_then(Value::as_str).is_none() {
                return Err(CoreError::InvalidWorkflow(format!(
                    "Node '{node_id}' is missing required 'class_type' field"
                )));
            }

            match node.get("inputs") {
                None | Some(Value::Object(_)) => {}
                Some(_) => {
                    return Err(CoreError::InvalidWorkflow(format!(
                        "Node '{node_id}' has non-object 'inputs'"
                    )));
                }
            }
        }

        Ok(Self(obj))
    }

    /// Number of nodes in the graph.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Node IDs in document order.
    pub fn node_ids(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    /// The `class_type` of a node.
    pub fn class_type(&self, node_id: &str) -> Option<&str> {
        self.0.get(node_id)?.get("class_type")?.as_str()
    }

    /// A single input value of a node.
    pub fn input(&self, node_id: &str, input_name: &str) -> Option<&Value> {
        self.0.get(node_id)?.get("inputs")?.get(input_name)
    }

    /// Borrow the graph as a plain JSON object (the `/prompt` payload).
    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }

    /// Find the first node (in document order) that can receive `kind`.
    fn first_target(&self, kind: OverrideKind) -> Option<(String, &'static str)> {
        self.0.iter().find_map(|(node_id, node)| {
            let class_type = node.get("class_type")?.as_str()?;
            let input_name = kind.input_for(class_type)?;
            let value = node.get("inputs")?.get(input_name)?;
            kind.accepts(value).then(|| (node_id.clone(), input_name))
        })
    }

    fn set_input(&mut self, node_id: &str, input_name: &str, value: Value) {
        if let Some(inputs) = self
            .0
            .get_mut(node_id)
            .and_then(|node| node.get_mut("inputs"))
            .and_then(Value::as_object_mut)
        {
            inputs.insert(input_name.to_string(), value);
        }
    }
}

// ---------------------------------------------------------------------------
// Overrides
// ---------------------------------------------------------------------------

/// Parameter injections requested by a job.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Overrides {
    /// Positive prompt text.
    pub prompt: Option<String>,
    /// Sampler seed.
    pub seed: Option<u64>,
    /// LoRA file name, relative to the `loras` model directory.
    pub lora: Option<String>,
}

impl Overrides {
    pub fn is_empty(&self) -> bool {
        self.prompt.is_none() && self.seed.is_none() && self.lora.is_none()
    }
}

/// The kinds of parameter an override can target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverrideKind {
    Prompt,
    Seed,
    Lora,
}

impl OverrideKind {
    /// The input a node of `class_type` exposes for this kind, if any.
    fn input_for(self, class_type: &str) -> Option<&'static str> {
        match (self, class_type) {
            (Self::Prompt, CLIP_TEXT_ENCODE_CLASS) => Some("text"),
            (Self::Seed, KSAMPLER_CLASS) => Some("seed"),
            (Self::Seed, KSAMPLER_ADVANCED_CLASS) => Some("noise_seed"),
            (Self::Lora, LOAD_LORA_CLASS | LOAD_LORA_MODEL_ONLY_CLASS) => Some("lora_name"),
            _ => None,
        }
    }

    /// Only literal inputs of the expected shape are overwritten; links are
    /// left alone.
    fn accepts(self, value: &Value) -> bool {
        match self {
            Self::Prompt | Self::Lora => value.is_string(),
            Self::Seed => value.is_number(),
        }
    }
}

/// Node IDs mutated by [`apply_overrides`], one per override kind at most.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AppliedOverrides {
    pub prompt_node: Option<String>,
    pub seed_node: Option<String>,
    pub lora_node: Option<String>,
}

/// Inject overrides into the graph.
///
/// For each requested override, the first matching node in document order
/// is updated and every other node is left untouched, even when several
/// nodes would match. An override with no matching node is a no-op.
pub fn apply_overrides(graph: &mut Graph, overrides: &Overrides) -> AppliedOverrides {
    let mut applied = AppliedOverrides::default();

    if let Some(prompt) = &overrides.prompt {
        applied.prompt_node = inject(graph, OverrideKind::Prompt, Value::from(prompt.as_str()));
    }
    if let Some(seed) = overrides.seed {
        applied.seed_node = inject(graph, OverrideKind::Seed, Value::from(seed));
    }
    if let Some(lora) = &overrides.lora {
        applied.lora_node = inject(graph, OverrideKind::Lora, Value::from(lora.as_str()));
    }

    applied
}

fn inject(graph: &mut Graph, kind: OverrideKind, value: Value) -> Option<String> {
    let (node_id, input_name) = graph.first_target(kind)?;
    graph.set_input(&node_id, input_name, value);
    Some(node_id)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn txt2img() -> Graph {
        Graph::from_value(json!({
            "4": { "class_type": "CheckpointLoaderSimple", "inputs": { "ckpt_name": "sd15.safetensors" } },
            "10": { "class_type": "LoraLoader", "inputs": { "lora_name": "style.safetensors", "model": ["4", 0], "clip": ["4", 1] } },
            "6": { "class_type": "CLIPTextEncode", "inputs": { "text": "positive", "clip": ["10", 1] } },
            "7": { "class_type": "CLIPTextEncode", "inputs": { "text": "negative", "clip": ["10", 1] } },
            "3": { "class_type": "KSampler", "inputs": { "seed": 1, "model": ["10", 0], "positive": ["6", 0] } },
            "9": { "class_type": "SaveImage", "inputs": { "images": ["8", 0] } }
        }))
        .unwrap()
    }

    #[test]
    fn rejects_non_object() {
        let err = Graph::from_value(json!([1, 2])).unwrap_err();
        assert!(err.to_string().contains("must be an object"));
    }

    #[test]
    fn rejects_empty_graph() {
        let err = Graph::from_value(json!({})).unwrap_err();
        assert!(err.to_string().contains("at least one node"));
    }

    #[test]
    fn rejects_node_without_class_type() {
        let err = Graph::from_value(json!({ "1": { "inputs": {} } })).unwrap_err();
        assert!(err.to_string().contains("'1'"));
    }

    #[test]
    fn rejects_non_object_inputs() {
        assert!(Graph::from_value(json!({ "1": { "class_type": "X", "inputs": [] } })).is_err());
    }

    #[test]
    fn deserializes_through_validation() {
        let ok: Result<Graph, _> =
            serde_json::from_str(r#"{"1":{"class_type":"SaveImage","inputs":{}}}"#);
        assert!(ok.is_ok());
        let bad: Result<Graph, _> = serde_json::from_str("{}");
        assert!(bad.is_err());
    }

    #[test]
    fn preserves_document_order() {
        let graph = txt2img();
        let ids: Vec<&str> = graph.node_ids().collect();
        assert_eq!(ids, vec!["4", "10", "6", "7", "3", "9"]);
    }

    #[test]
    fn prompt_override_mutates_only_first_match() {
        let mut graph = txt2img();
        let before = graph.clone();
        let applied = apply_overrides(
            &mut graph,
            &Overrides {
                prompt: Some("a red fox".into()),
                ..Default::default()
            },
        );

        assert_eq!(applied.prompt_node.as_deref(), Some("6"));
        assert_eq!(graph.input("6", "text"), Some(&json!("a red fox")));
        assert_eq!(graph.input("7", "text"), Some(&json!("negative")));

        for id in before.node_ids().filter(|id| *id != "6") {
            assert_eq!(before.as_map()[id], graph.as_map()[id], "node {id} changed");
        }
    }

    #[test]
    fn prompt_override_skips_linked_text() {
        let mut graph = Graph::from_value(json!({
            "1": { "class_type": "CLIPTextEncode", "inputs": { "text": ["5", 0] } },
            "2": { "class_type": "CLIPTextEncode", "inputs": { "text": "literal" } }
        }))
        .unwrap();

        let applied = apply_overrides(
            &mut graph,
            &Overrides {
                prompt: Some("new".into()),
                ..Default::default()
            },
        );

        assert_eq!(applied.prompt_node.as_deref(), Some("2"));
        assert_eq!(graph.input("1", "text"), Some(&json!(["5", 0])));
    }

    #[test]
    fn seed_override_targets_ksampler_and_advanced() {
        let mut graph = txt2img();
        let applied = apply_overrides(
            &mut graph,
            &Overrides {
                seed: Some(1234),
                ..Default::default()
            },
        );
        assert_eq!(applied.seed_node.as_deref(), Some("3"));
        assert_eq!(graph.input("3", "seed"), Some(&json!(1234)));

        let mut advanced = Graph::from_value(json!({
            "5": { "class_type": "KSamplerAdvanced", "inputs": { "noise_seed": 7 } }
        }))
        .unwrap();
        let applied = apply_overrides(
            &mut advanced,
            &Overrides {
                seed: Some(99),
                ..Default::default()
            },
        );
        assert_eq!(applied.seed_node.as_deref(), Some("5"));
        assert_eq!(advanced.input("5", "noise_seed"), Some(&json!(99)));
    }

    #[test]
    fn lora_override_replaces_lora_name() {
        let mut graph = txt2img();
        let applied = apply_overrides(
            &mut graph,
            &Overrides {
                lora: Some("action-lora/v1.safetensors".into()),
                ..Default::default()
            },
        );
        assert_eq!(applied.lora_node.as_deref(), Some("10"));
        assert_eq!(
            graph.input("10", "lora_name"),
            Some(&json!("action-lora/v1.safetensors"))
        );
    }

    #[test]
    fn unmatched_overrides_are_noops() {
        let mut graph = Graph::from_value(json!({
            "1": { "class_type": "WanT2VNode", "inputs": { "prompt": "x", "seed": 3 } }
        }))
        .unwrap();
        let before = graph.clone();

        let applied = apply_overrides(
            &mut graph,
            &Overrides {
                prompt: Some("p".into()),
                seed: Some(5),
                lora: Some("l".into()),
            },
        );

        assert_eq!(applied, AppliedOverrides::default());
        assert_eq!(graph, before);
    }

    #[test]
    fn empty_overrides() {
        assert!(Overrides::default().is_empty());
        assert!(!Overrides {
            seed: Some(0),
            ..Default::default()
        }
        .is_empty());
    }
}
