// SPDX-License-Identifier: MIT OR Apache-2.0
//! agent-workflow
#![deny(unsafe_code)]
#![warn(missing_docs)]
//!
//! Loads a ComfyUI-style node graph (a mapping from string node id to
//! `{class_type, inputs}`), applies override/parameter mutations onto it,
//! rewrites template `LoraLoader` chains, and runs the structural checks
//! required before submission to the renderer.

use agent_core::{WorkflowMutation, WorkflowParameterBinding, WorkflowRef};
use agent_error::{AgentError, ReasonCode};
use serde_json::{Map, Number, Value};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::future::Future;
use thiserror::Error;

/// A node graph: string node id → `{class_type, inputs: {...}}`.
pub type NodeGraph = Map<String, Value>;

/// Failures raised while loading, mutating, or validating a workflow.
#[derive(Debug, Error)]
pub enum WorkflowError {
    /// None of `inline`/`localPath`/`minioKey` were populated.
    #[error("workflow reference provides no source (need inline, local path, or object-store key)")]
    NoSource,
    /// The loaded payload was not a JSON object, or a node was structurally unusable.
    #[error("invalid workflow payload: {0}")]
    Invalid(String),
    /// A mutation or LoRA rewrite referenced a node id that doesn't exist.
    #[error("workflow node {0} not found")]
    UnknownNode(i64),
    /// A dotted mutation path could not be resolved because an intermediate was not a mapping.
    #[error("cannot resolve path '{0}' on node {1}")]
    InvalidPath(String, i64),
    /// One or more structural validation checks failed.
    #[error("workflow validation failed: {0}")]
    ValidationFailed(String),
    /// One or more parameter bindings did not read back the expected value.
    #[error("parameter binding mismatch: {0}")]
    BindingMismatch(String),
    /// A local filesystem operation failed.
    #[error("local filesystem error at {path}: {source}")]
    Io {
        /// Path the operation was acting on.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
    /// The workflow payload was not valid JSON.
    #[error("malformed workflow JSON: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<WorkflowError> for AgentError {
    fn from(err: WorkflowError) -> Self {
        let code = match &err {
            WorkflowError::Io { .. } => ReasonCode::SystemError,
            _ => ReasonCode::ValidationError,
        };
        let message = err.to_string();
        AgentError::new(code, message).with_source(err)
    }
}

/// Load a workflow graph per source precedence: inline > local file >
/// object-store key. `download` is only invoked for the object-store case,
/// and receives `(bucket, key, destination)`.
///
/// # Errors
///
/// Returns [`WorkflowError::NoSource`] if none of the three sources are
/// populated, [`WorkflowError::Io`]/[`WorkflowError::Json`] on read/parse
/// failure, or whatever `download` returns.
pub async fn load_workflow<F, Fut>(
    workflow_ref: &WorkflowRef,
    fallback_bucket: &str,
    workflow_dir: &Path,
    download: F,
) -> Result<NodeGraph, WorkflowError>
where
    F: FnOnce(String, String, PathBuf) -> Fut,
    Fut: Future<Output = Result<(), WorkflowError>>,
{
    if let Some(inline) = &workflow_ref.inline {
        tracing::debug!(target: "agent.workflow", workflow_id = %workflow_ref.id, "using inline workflow payload");
        return parse_graph(inline.clone());
    }

    if let Some(local_path) = &workflow_ref.local_path {
        tracing::debug!(target: "agent.workflow", workflow_id = %workflow_ref.id, path = %local_path.display(), "loading workflow from local path");
        let body = tokio::fs::read_to_string(local_path)
            .await
            .map_err(|source| WorkflowError::Io { path: local_path.clone(), source })?;
        return parse_graph(serde_json::from_str(&body)?);
    }

    if let Some(key) = &workflow_ref.minio_key {
        let bucket = workflow_ref.bucket.clone().unwrap_or_else(|| fallback_bucket.to_string());
        let destination = workflow_dir.join(format!("{}.json", workflow_ref.id));
        tracing::debug!(target: "agent.workflow", workflow_id = %workflow_ref.id, bucket = %bucket, key = %key, "fetching workflow from object store");
        download(bucket, key.clone(), destination.clone()).await?;
        let body = tokio::fs::read_to_string(&destination)
            .await
            .map_err(|source| WorkflowError::Io { path: destination.clone(), source })?;
        return parse_graph(serde_json::from_str(&body)?);
    }

    Err(WorkflowError::NoSource)
}

fn parse_graph(value: Value) -> Result<NodeGraph, WorkflowError> {
    match value {
        Value::Object(map) => Ok(map),
        _ => Err(WorkflowError::Invalid("workflow payload is not a JSON object".to_string())),
    }
}

/// Apply `mutations` to `graph` in order, failing on the first one that
/// references an unknown node id or a non-mapping path intermediate.
///
/// # Errors
///
/// Returns [`WorkflowError::UnknownNode`] or [`WorkflowError::InvalidPath`].
pub fn apply_mutations(graph: &mut NodeGraph, mutations: &[WorkflowMutation]) -> Result<(), WorkflowError> {
    for mutation in mutations {
        apply_mutation(graph, mutation)?;
    }
    Ok(())
}

fn apply_mutation(graph: &mut NodeGraph, mutation: &WorkflowMutation) -> Result<(), WorkflowError> {
    let key = mutation.node.to_string();
    let node = graph.get_mut(&key).ok_or(WorkflowError::UnknownNode(mutation.node))?;
    assign_path(node, &mutation.path, mutation.value.clone(), mutation.node)
}

fn assign_path(node: &mut Value, dotted_path: &str, value: Value, node_id: i64) -> Result<(), WorkflowError> {
    let parts: Vec<&str> = dotted_path.split('.').collect();
    let mut target = node;
    for part in &parts[..parts.len() - 1] {
        if !target.is_object() {
            return Err(WorkflowError::InvalidPath(dotted_path.to_string(), node_id));
        }
        let obj = target.as_object_mut().expect("checked is_object above");
        let entry = obj.entry((*part).to_string()).or_insert(Value::Object(Map::new()));
        if entry.is_null() {
            *entry = Value::Object(Map::new());
        }
        target = entry;
    }
    let Some(last) = parts.last() else {
        return Err(WorkflowError::InvalidPath(dotted_path.to_string(), node_id));
    };
    if !target.is_object() {
        return Err(WorkflowError::InvalidPath(dotted_path.to_string(), node_id));
    }
    target.as_object_mut().expect("checked is_object above").insert((*last).to_string(), value);
    Ok(())
}

fn read_path<'a>(node: &'a Value, dotted_path: &str) -> Option<&'a Value> {
    let mut target = node;
    for part in dotted_path.split('.') {
        target = target.as_object()?.get(part)?;
    }
    Some(target)
}

/// Bind each `workflowParameters` entry whose parameter exists in
/// `resolved_parameters` onto the graph, then re-read every bound path and
/// cross-check it with a type-aware equality. Mismatches aggregate into one
/// failure.
///
/// # Errors
///
/// Returns [`WorkflowError::UnknownNode`]/[`WorkflowError::InvalidPath`] from
/// the mutation pass, or [`WorkflowError::BindingMismatch`] listing every
/// binding whose re-read value didn't match.
pub fn attach_parameters(
    graph: &mut NodeGraph,
    bindings: &[WorkflowParameterBinding],
    resolved_parameters: &BTreeMap<String, Value>,
) -> Result<(), WorkflowError> {
    let mutations: Vec<WorkflowMutation> = bindings
        .iter()
        .filter_map(|binding| {
            resolved_parameters.get(&binding.parameter).map(|value| WorkflowMutation {
                node: binding.node,
                path: binding.path.clone(),
                value: value.clone(),
            })
        })
        .collect();
    apply_mutations(graph, &mutations)?;
    verify_bindings(graph, bindings, resolved_parameters)
}

fn verify_bindings(
    graph: &NodeGraph,
    bindings: &[WorkflowParameterBinding],
    resolved_parameters: &BTreeMap<String, Value>,
) -> Result<(), WorkflowError> {
    let mut mismatches = Vec::new();
    for binding in bindings {
        let Some(expected) = resolved_parameters.get(&binding.parameter) else {
            continue;
        };
        let node_key = binding.node.to_string();
        let Some(node) = graph.get(&node_key) else {
            mismatches.push(format!("node {} not found for parameter '{}'", binding.node, binding.parameter));
            continue;
        };
        match read_path(node, &binding.path) {
            Some(actual) if values_equal(expected, actual) => {}
            Some(actual) => mismatches.push(format!(
                "node {} path '{}': expected {expected}, got {actual}",
                binding.node, binding.path
            )),
            None => mismatches.push(format!(
                "node {} path '{}': value missing after binding",
                binding.node, binding.path
            )),
        }
    }
    if mismatches.is_empty() {
        Ok(())
    } else {
        Err(WorkflowError::BindingMismatch(mismatches.join("; ")))
    }
}

fn values_equal(expected: &Value, actual: &Value) -> bool {
    match (expected, actual) {
        (Value::String(a), Value::String(b)) => a.trim() == b.trim(),
        (Value::Bool(a), Value::Bool(b)) => a == b,
        (Value::Number(a), Value::Number(b)) => numbers_equal(a, b),
        _ => expected == actual,
    }
}

fn numbers_equal(a: &Number, b: &Number) -> bool {
    match (a.as_i64(), b.as_i64()) {
        (Some(x), Some(y)) => x == y,
        _ => {
            let (Some(af), Some(bf)) = (a.as_f64(), b.as_f64()) else { return false };
            let tolerance = if a.is_i64() || b.is_i64() { 0.5 } else { 1e-3 };
            (af - bf).abs() <= tolerance
        }
    }
}

const KSAMPLER_EXACT: &str = "KSampler";
const KSAMPLER_SUBSTRING_MATCHES: &[&str] = &["ksampleradvanced"];

fn is_ksampler_class(class_type: &str) -> bool {
    if class_type == KSAMPLER_EXACT {
        return true;
    }
    let lower = class_type.to_lowercase();
    KSAMPLER_SUBSTRING_MATCHES.iter().any(|needle| lower.contains(needle))
}

fn read_input_reference(node: &Value, field: &str) -> Option<(String, i64)> {
    let arr = node.get("inputs")?.get(field)?.as_array()?;
    if arr.len() != 2 {
        return None;
    }
    let target = ref_target_id(&arr[0])?;
    let index = arr[1].as_i64()?;
    Some((target, index))
}

fn ref_target_id(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn references_clip_text_encode(graph: &NodeGraph, target_id: &str) -> bool {
    graph
        .get(target_id)
        .and_then(|n| n.get("class_type"))
        .and_then(Value::as_str)
        .map(|s| s.to_lowercase().contains("cliptextencode"))
        .unwrap_or(false)
}

/// Structural checks required before a graph may be submitted:
/// every `KSampler`-family node's `positive`/`negative` inputs must
/// reference a `CLIPTextEncode` node, and every string input with an
/// allow-list entry must name an allowed value.
///
/// # Errors
///
/// Returns [`WorkflowError::ValidationFailed`] listing every violation.
pub fn validate_graph(graph: &NodeGraph, allowed_values: &BTreeMap<String, HashSet<String>>) -> Result<(), WorkflowError> {
    let mut violations = Vec::new();

    for (id, node) in graph.iter() {
        let class_type = node.get("class_type").and_then(Value::as_str).unwrap_or("");
        if is_ksampler_class(class_type) {
            for field in ["positive", "negative"] {
                match read_input_reference(node, field) {
                    Some((target_id, _)) if references_clip_text_encode(graph, &target_id) => {}
                    Some((target_id, _)) => violations.push(format!(
                        "node {id} inputs.{field} references node {target_id}, which is not a CLIPTextEncode node"
                    )),
                    None => violations.push(format!(
                        "node {id} inputs.{field} is not a 2-element [target_id, index] reference"
                    )),
                }
            }
        }

        if let Some(inputs) = node.get("inputs").and_then(Value::as_object) {
            for (key, value) in inputs {
                let Some(allowed) = allowed_values.get(key) else { continue };
                if let Some(candidate) = value.as_str() {
                    if !allowed.contains(candidate) {
                        violations.push(format!("node {id} inputs.{key} = '{candidate}' is not an allowed value"));
                    }
                }
            }
        }
    }

    if violations.is_empty() {
        Ok(())
    } else {
        Err(WorkflowError::ValidationFailed(violations.join("; ")))
    }
}

/// A LoRA to place into the rewritten chain, in application order.
#[derive(Debug, Clone)]
pub struct LoraPlacement {
    /// Visible filename the `LoraLoader` node should load.
    pub lora_name: String,
    /// Model-branch strength, already clamped and rounded.
    pub strength_model: f64,
    /// Clip-branch strength, already clamped and rounded.
    pub strength_clip: f64,
}

const LORA_LOADER_CLASS: &str = "LoraLoader";

/// Collapse every template `LoraLoader` node in the graph into a chain
/// matching `loras` (one node per entry, in order), splicing the chain's
/// head onto the first template's original `(model, clip)` inputs and
/// redirecting every external reference to the chain's tail.
///
/// If the graph has no `LoraLoader` template, this is a no-op. If `loras`
/// is empty, the remaining template is deleted and its references
/// redirected upstream.
///
/// # Errors
///
/// Returns [`WorkflowError::Invalid`] if the template is missing its
/// `model`/`clip` inputs.
pub fn rewrite_lora_chain(graph: &mut NodeGraph, loras: &[LoraPlacement]) -> Result<(), WorkflowError> {
    let mut template_ids: Vec<i64> = graph
        .iter()
        .filter(|(_, node)| node.get("class_type").and_then(Value::as_str) == Some(LORA_LOADER_CLASS))
        .filter_map(|(key, _)| key.parse::<i64>().ok())
        .collect();
    template_ids.sort_unstable();

    let Some(&first_id) = template_ids.first() else {
        return Ok(());
    };
    let first_key = first_id.to_string();

    let (upstream_model, upstream_clip) = {
        let template = graph.get(&first_key).ok_or(WorkflowError::UnknownNode(first_id))?;
        let inputs = template
            .get("inputs")
            .and_then(Value::as_object)
            .ok_or_else(|| WorkflowError::Invalid("LoraLoader template has no inputs".to_string()))?;
        let model = inputs
            .get("model")
            .cloned()
            .ok_or_else(|| WorkflowError::Invalid("LoraLoader template missing inputs.model".to_string()))?;
        let clip = inputs
            .get("clip")
            .cloned()
            .ok_or_else(|| WorkflowError::Invalid("LoraLoader template missing inputs.clip".to_string()))?;
        (model, clip)
    };

    let first_model = ref_value(&first_key, 0);
    let first_clip = ref_value(&first_key, 1);
    for &extra_id in &template_ids[1..] {
        redirect_references(graph, extra_id, &first_model, &first_clip);
        graph.remove(&extra_id.to_string());
    }

    if loras.is_empty() {
        redirect_references(graph, first_id, &upstream_model, &upstream_clip);
        graph.remove(&first_key);
        return Ok(());
    }

    apply_lora_fields(graph.get_mut(&first_key).expect("first template still present"), &loras[0]);

    let mut next_id = graph.keys().filter_map(|k| k.parse::<i64>().ok()).max().unwrap_or(first_id) + 1;
    let mut tail_id = first_id;
    let prototype = graph.get(&first_key).expect("first template still present").clone();
    let mut chain_ids = HashSet::new();

    for placement in &loras[1..] {
        let new_id = next_id;
        next_id += 1;
        let mut node = prototype.clone();
        set_input_ref(&mut node, "model", &tail_id.to_string(), 0);
        set_input_ref(&mut node, "clip", &tail_id.to_string(), 1);
        apply_lora_fields(&mut node, placement);
        graph.insert(new_id.to_string(), node);
        chain_ids.insert(new_id.to_string());
        tail_id = new_id;
    }

    if tail_id != first_id {
        let tail_model = ref_value(&tail_id.to_string(), 0);
        let tail_clip = ref_value(&tail_id.to_string(), 1);
        redirect_outputs_of(graph, first_id, tail_id, &chain_ids, &tail_model, &tail_clip);
    }

    Ok(())
}

fn ref_value(node_id: &str, index: i64) -> Value {
    Value::Array(vec![Value::String(node_id.to_string()), Value::Number(index.into())])
}

fn set_input_ref(node: &mut Value, field: &str, node_id: &str, index: i64) {
    if let Some(inputs) = node.get_mut("inputs").and_then(Value::as_object_mut) {
        inputs.insert(field.to_string(), ref_value(node_id, index));
    }
}

fn apply_lora_fields(node: &mut Value, placement: &LoraPlacement) {
    if let Some(inputs) = node.get_mut("inputs").and_then(Value::as_object_mut) {
        inputs.insert("lora_name".to_string(), Value::String(placement.lora_name.clone()));
        inputs.insert(
            "strength_model".to_string(),
            Number::from_f64(placement.strength_model).map(Value::Number).unwrap_or(Value::Null),
        );
        inputs.insert(
            "strength_clip".to_string(),
            Number::from_f64(placement.strength_clip).map(Value::Number).unwrap_or(Value::Null),
        );
    }
}

/// Rewrite every reference to `[from_id, 0]`/`[from_id, 1]` elsewhere in the
/// graph to point at `replacement_model`/`replacement_clip` instead.
fn redirect_references(graph: &mut NodeGraph, from_id: i64, replacement_model: &Value, replacement_clip: &Value) {
    let from_str = from_id.to_string();
    for node in graph.values_mut() {
        let Some(inputs) = node.get_mut("inputs").and_then(Value::as_object_mut) else { continue };
        for value in inputs.values_mut() {
            redirect_if_matches(value, &from_str, replacement_model, replacement_clip);
        }
    }
}

/// Like [`redirect_references`], but skips the newly-allocated chain nodes
/// themselves (`chain_ids`) so the chain's own internal links, already set
/// by [`set_input_ref`], are left alone. Every other node, regardless of id,
/// is a legitimate external consumer and gets redirected.
fn redirect_outputs_of(
    graph: &mut NodeGraph,
    from_id: i64,
    tail_id: i64,
    chain_ids: &HashSet<String>,
    replacement_model: &Value,
    replacement_clip: &Value,
) {
    let from_str = from_id.to_string();
    let tail_str = tail_id.to_string();
    for (id, node) in graph.iter_mut() {
        if *id == tail_str || chain_ids.contains(id) {
            continue;
        }
        let Some(inputs) = node.get_mut("inputs").and_then(Value::as_object_mut) else { continue };
        for value in inputs.values_mut() {
            redirect_if_matches(value, &from_str, replacement_model, replacement_clip);
        }
    }
}

fn redirect_if_matches(value: &mut Value, from_str: &str, replacement_model: &Value, replacement_clip: &Value) {
    let Some(arr) = value.as_array() else { return };
    if arr.len() != 2 {
        return;
    }
    let Some(target) = ref_target_id(&arr[0]) else { return };
    if target != from_str {
        return;
    }
    let index = arr[1].as_i64().unwrap_or(0);
    *value = if index == 0 { replacement_model.clone() } else { replacement_clip.clone() };
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn node(class_type: &str, inputs: Value) -> Value {
        json!({ "class_type": class_type, "inputs": inputs })
    }

    #[tokio::test]
    async fn load_workflow_prefers_inline_over_other_sources() {
        let mut workflow_ref = WorkflowRef {
            id: "wf1".to_string(),
            version: None,
            minio_key: Some("ignored.json".to_string()),
            local_path: None,
            inline: Some(json!({"1": {"class_type": "Foo", "inputs": {}}})),
            bucket: None,
        };
        workflow_ref.minio_key = Some("ignored.json".to_string());
        let graph = load_workflow(&workflow_ref, "bucket", Path::new("/tmp"), |_, _, _| async { unreachable!() })
            .await
            .unwrap();
        assert!(graph.contains_key("1"));
    }

    #[tokio::test]
    async fn load_workflow_errors_with_no_source() {
        let workflow_ref = WorkflowRef {
            id: "wf2".to_string(),
            version: None,
            minio_key: None,
            local_path: None,
            inline: None,
            bucket: None,
        };
        let err = load_workflow(&workflow_ref, "bucket", Path::new("/tmp"), |_, _, _| async { Ok(()) })
            .await
            .unwrap_err();
        assert!(matches!(err, WorkflowError::NoSource));
    }

    #[test]
    fn apply_mutations_sets_nested_path_creating_intermediates() {
        let mut graph = Map::new();
        graph.insert("3".to_string(), node("KSamplerSelect", json!({})));
        apply_mutations(
            &mut graph,
            &[WorkflowMutation { node: 3, path: "inputs.sampler_name".to_string(), value: json!("euler") }],
        )
        .unwrap();
        assert_eq!(graph["3"]["inputs"]["sampler_name"], json!("euler"));
    }

    #[test]
    fn apply_mutations_rejects_unknown_node() {
        let mut graph = Map::new();
        let err = apply_mutations(&mut graph, &[WorkflowMutation { node: 99, path: "inputs.x".to_string(), value: json!(1) }])
            .unwrap_err();
        assert!(matches!(err, WorkflowError::UnknownNode(99)));
    }

    #[test]
    fn attach_parameters_binds_and_verifies() {
        let mut graph = Map::new();
        graph.insert("5".to_string(), node("KSampler", json!({"steps": 1})));
        let bindings = vec![WorkflowParameterBinding { parameter: "steps".to_string(), node: 5, path: "inputs.steps".to_string() }];
        let mut resolved = BTreeMap::new();
        resolved.insert("steps".to_string(), json!(30));
        attach_parameters(&mut graph, &bindings, &resolved).unwrap();
        assert_eq!(graph["5"]["inputs"]["steps"], json!(30));
    }

    #[test]
    fn attach_parameters_tolerates_int_vs_float_within_half() {
        let mut graph = Map::new();
        graph.insert("5".to_string(), node("EmptyNode", json!({})));
        apply_mutations(&mut graph, &[WorkflowMutation { node: 5, path: "inputs.cfg".to_string(), value: json!(7.2) }]).unwrap();
        let bindings = vec![WorkflowParameterBinding { parameter: "cfg".to_string(), node: 5, path: "inputs.cfg".to_string() }];
        let mut resolved = BTreeMap::new();
        resolved.insert("cfg".to_string(), json!(7)); // int vs float within 0.5
        attach_parameters(&mut graph, &bindings, &resolved).unwrap();
    }

    #[test]
    fn attach_parameters_reports_mismatch() {
        let mut graph = Map::new();
        graph.insert("5".to_string(), node("EmptyNode", json!({"steps": 1})));
        let bindings = vec![WorkflowParameterBinding { parameter: "steps".to_string(), node: 5, path: "inputs.other".to_string() }];
        let mut resolved = BTreeMap::new();
        resolved.insert("steps".to_string(), json!(30));
        let err = attach_parameters(&mut graph, &bindings, &resolved).unwrap_err();
        assert!(matches!(err, WorkflowError::BindingMismatch(_)));
    }

    #[test]
    fn validate_graph_requires_clip_text_encode_upstream_of_ksampler() {
        let mut graph = Map::new();
        graph.insert("1".to_string(), node("CLIPTextEncode", json!({})));
        graph.insert("2".to_string(), node("EmptyLatentImage", json!({})));
        graph.insert(
            "3".to_string(),
            node("KSampler", json!({"positive": ["1", 0], "negative": ["2", 0]})),
        );
        let err = validate_graph(&graph, &BTreeMap::new()).unwrap_err();
        let WorkflowError::ValidationFailed(message) = err else { panic!("expected ValidationFailed") };
        assert!(message.contains("negative"));
        assert!(!message.contains("positive"));
    }

    #[test]
    fn validate_graph_accepts_ksampler_advanced_variant() {
        let mut graph = Map::new();
        graph.insert("1".to_string(), node("CLIPTextEncode", json!({})));
        graph.insert(
            "2".to_string(),
            node("KSamplerAdvanced", json!({"positive": ["1", 0], "negative": ["1", 0]})),
        );
        validate_graph(&graph, &BTreeMap::new()).unwrap();
    }

    #[test]
    fn validate_graph_enforces_allow_list_on_string_inputs() {
        let mut graph = Map::new();
        graph.insert("1".to_string(), node("CheckpointLoaderSimple", json!({"ckpt_name": "not-allowed.safetensors"})));
        let mut allowed = BTreeMap::new();
        allowed.insert("ckpt_name".to_string(), HashSet::from(["ok.safetensors".to_string()]));
        let err = validate_graph(&graph, &allowed).unwrap_err();
        assert!(matches!(err, WorkflowError::ValidationFailed(_)));
    }

    #[test]
    fn rewrite_lora_chain_is_noop_without_template() {
        let mut graph = Map::new();
        graph.insert("1".to_string(), node("CheckpointLoaderSimple", json!({})));
        rewrite_lora_chain(&mut graph, &[]).unwrap();
        assert_eq!(graph.len(), 1);
    }

    #[test]
    fn rewrite_lora_chain_deletes_template_when_no_loras() {
        let mut graph = Map::new();
        graph.insert("1".to_string(), node("CheckpointLoaderSimple", json!({})));
        graph.insert("2".to_string(), node("LoraLoader", json!({"model": ["1", 0], "clip": ["1", 1]})));
        graph.insert("3".to_string(), node("KSampler", json!({"model": ["2", 0]})));

        rewrite_lora_chain(&mut graph, &[]).unwrap();

        assert!(!graph.contains_key("2"));
        assert_eq!(graph["3"]["inputs"]["model"], json!(["1", 0]));
    }

    #[test]
    fn rewrite_lora_chain_reuses_template_for_single_lora() {
        let mut graph = Map::new();
        graph.insert("1".to_string(), node("CheckpointLoaderSimple", json!({})));
        graph.insert("2".to_string(), node("LoraLoader", json!({"model": ["1", 0], "clip": ["1", 1]})));
        graph.insert("3".to_string(), node("KSampler", json!({"model": ["2", 0]})));

        let loras = vec![LoraPlacement { lora_name: "a.safetensors".to_string(), strength_model: 0.8, strength_clip: 0.8 }];
        rewrite_lora_chain(&mut graph, &loras).unwrap();

        assert_eq!(graph["2"]["inputs"]["lora_name"], json!("a.safetensors"));
        assert_eq!(graph["3"]["inputs"]["model"], json!(["2", 0]));
    }

    #[test]
    fn rewrite_lora_chain_extends_for_multiple_loras() {
        let mut graph = Map::new();
        graph.insert("1".to_string(), node("CheckpointLoaderSimple", json!({})));
        graph.insert("2".to_string(), node("LoraLoader", json!({"model": ["1", 0], "clip": ["1", 1]})));
        graph.insert("3".to_string(), node("KSampler", json!({"model": ["2", 0], "clip": ["2", 1]})));

        let loras = vec![
            LoraPlacement { lora_name: "a.safetensors".to_string(), strength_model: 0.8, strength_clip: 0.8 },
            LoraPlacement { lora_name: "b.safetensors".to_string(), strength_model: 0.5, strength_clip: 0.5 },
        ];
        rewrite_lora_chain(&mut graph, &loras).unwrap();

        assert!(graph.contains_key("4"), "a new node should have been allocated for the second LoRA");
        assert_eq!(graph["4"]["inputs"]["model"], json!(["2", 0]));
        assert_eq!(graph["4"]["inputs"]["clip"], json!(["2", 1]));
        assert_eq!(graph["4"]["inputs"]["lora_name"], json!("b.safetensors"));
        assert_eq!(graph["3"]["inputs"]["model"], json!(["4", 0]));
        assert_eq!(graph["3"]["inputs"]["clip"], json!(["4", 1]));
    }

    #[test]
    fn rewrite_lora_chain_collapses_extra_templates() {
        let mut graph = Map::new();
        graph.insert("1".to_string(), node("CheckpointLoaderSimple", json!({})));
        graph.insert("2".to_string(), node("LoraLoader", json!({"model": ["1", 0], "clip": ["1", 1]})));
        graph.insert("3".to_string(), node("LoraLoader", json!({"model": ["2", 0], "clip": ["2", 1]})));
        graph.insert("4".to_string(), node("KSampler", json!({"model": ["3", 0]})));

        let loras = vec![LoraPlacement { lora_name: "a.safetensors".to_string(), strength_model: 1.0, strength_clip: 1.0 }];
        rewrite_lora_chain(&mut graph, &loras).unwrap();

        assert!(!graph.contains_key("3"), "extra template should be removed");
        assert_eq!(graph["4"]["inputs"]["model"], json!(["2", 0]));
    }
}
