// SPDX-License-Identifier: MIT OR Apache-2.0
//! agent-renderer
#![deny(unsafe_code)]
#![warn(missing_docs)]
//!
//! HTTP client for the render backend: submits workflows, polls history to
//! completion (honouring a cooperative cancellation signal and a deadline),
//! reports queue activity, extracts output images from a finished history,
//! and answers "is this value allowed for this node input" from either the
//! backend's own introspection endpoint or a filesystem fallback scan.

use agent_cancel::CancellationToken;
use agent_config::{PathConfig, RendererConfig};
use agent_error::{AgentError, ReasonCode};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use thiserror::Error;

/// Failures raised while talking to the renderer.
#[derive(Debug, Error)]
pub enum RendererError {
    /// The renderer returned a non-2xx response to a submission.
    #[error("renderer rejected workflow submission ({status}): {body}")]
    Rejected {
        /// HTTP status code.
        status: u16,
        /// Response body, verbatim.
        body: String,
    },
    /// The submission response had neither `prompt_id` nor `id`.
    #[error("renderer response missing prompt_id")]
    MissingPromptId,
    /// The polled history reported a failed/error status.
    #[error("render job {prompt_id} failed: {status}")]
    JobFailed {
        /// The prompt id that failed.
        prompt_id: String,
        /// The renderer's reported status string.
        status: String,
        /// The full history payload, for diagnostics.
        history: Value,
    },
    /// The cancellation signal fired before the job reached a terminal state.
    #[error("render job {0} cancelled")]
    Cancelled(String),
    /// The poll deadline elapsed before the job reached a terminal state.
    #[error("render job {0} timed out")]
    TimedOut(String),
    /// A transport-level failure talking to the renderer.
    #[error("renderer request failed: {0}")]
    Transport(#[from] reqwest::Error),
}

impl From<RendererError> for AgentError {
    fn from(err: RendererError) -> Self {
        let code = match &err {
            RendererError::TimedOut(_) => ReasonCode::Timeout,
            RendererError::Cancelled(_) => ReasonCode::Canceled,
            RendererError::Rejected { .. } | RendererError::MissingPromptId | RendererError::JobFailed { .. } => {
                ReasonCode::ValidationError
            }
            RendererError::Transport(_) => ReasonCode::TransientError,
        };
        let message = err.to_string();
        AgentError::new(code, message).with_source(err)
    }
}

/// Queue depth snapshot returned by [`RendererClient::describe_activity`].
#[derive(Debug, Clone, serde::Serialize)]
pub struct ActivitySnapshot {
    /// Number of pending (queued, not yet running) prompts, if extractable.
    pub pending: Option<i64>,
    /// Number of running prompts, if extractable.
    pub running: Option<i64>,
    /// Raw queue payload for diagnostics, when the request succeeded.
    pub raw: Option<Value>,
}

/// One discovered output image: node that produced it, filename, subfolder,
/// and ComfyUI's declared image type (`output`/`temp`/...).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputFile {
    /// The node id that emitted this image.
    pub node_id: String,
    /// Filename relative to `subfolder`.
    pub filename: String,
    /// Subfolder under the renderer's output root, possibly empty.
    pub subfolder: String,
    /// Declared image type, e.g. `"output"`.
    pub image_type: String,
}

/// HTTP client bound to a single render backend.
pub struct RendererClient {
    http: reqwest::Client,
    base_url: String,
    config: RendererConfig,
    object_info_cache: Mutex<Option<(Instant, HashMap<String, HashSet<String>>)>>,
}

impl RendererClient {
    /// Build a client from renderer configuration.
    ///
    /// # Errors
    ///
    /// Returns [`RendererError::Transport`] if the underlying HTTP client
    /// cannot be constructed (e.g. an invalid TLS configuration).
    pub fn new(config: RendererConfig) -> Result<Self, RendererError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs_f64(config.timeout_seconds as f64))
            .build()?;
        let base_url = config.api_url.trim_end_matches('/').to_string();
        Ok(Self { http, base_url, config, object_info_cache: Mutex::new(None) })
    }

    /// Submit `workflow` (a full node-graph payload) and return the
    /// assigned prompt id.
    ///
    /// # Errors
    ///
    /// Returns [`RendererError::Rejected`] on a non-2xx response,
    /// [`RendererError::MissingPromptId`] if the body lacks both
    /// `prompt_id` and `id`, or [`RendererError::Transport`] on a
    /// transport failure.
    pub async fn submit(&self, workflow: &Value, client_id: Option<&str>) -> Result<String, RendererError> {
        let payload = serde_json::json!({
            "prompt": workflow,
            "client_id": client_id.unwrap_or(&self.config.client_id),
        });
        tracing::info!(target: "agent.renderer", "submitting workflow");
        let response = self.http.post(format!("{}/prompt", self.base_url)).json(&payload).send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::error!(target: "agent.renderer", status = status.as_u16(), %body, "renderer rejected submission");
            return Err(RendererError::Rejected { status: status.as_u16(), body });
        }
        let data: Value = response.json().await?;
        data.get("prompt_id")
            .or_else(|| data.get("id"))
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or(RendererError::MissingPromptId)
    }

    /// Poll history for `prompt_id` until it reaches a terminal state, the
    /// cancellation signal fires, or `timeout` elapses.
    ///
    /// # Errors
    ///
    /// Returns [`RendererError::Cancelled`], [`RendererError::TimedOut`], or
    /// [`RendererError::JobFailed`] when the corresponding outcome is
    /// observed. Transient HTTP errors while polling are logged and do not
    /// abort the loop.
    pub async fn wait_for_completion(
        &self,
        prompt_id: &str,
        timeout: Duration,
        cancel_signal: &CancellationToken,
    ) -> Result<Value, RendererError> {
        let deadline = Instant::now() + timeout;
        let poll_interval = Duration::from_secs_f64(self.config.poll_interval_seconds.max(0.01));
        loop {
            if cancel_signal.is_cancelled() {
                return Err(RendererError::Cancelled(prompt_id.to_string()));
            }
            if Instant::now() > deadline {
                return Err(RendererError::TimedOut(prompt_id.to_string()));
            }

            match self.fetch_history(prompt_id).await {
                Ok(history) => {
                    let status = history
                        .get("status")
                        .and_then(|s| s.get("status"))
                        .and_then(Value::as_str)
                        .unwrap_or("");
                    if matches!(status, "completed" | "success") {
                        tracing::info!(target: "agent.renderer", prompt_id, "render job completed");
                        return Ok(history);
                    }
                    if matches!(status, "failed" | "error") {
                        return Err(RendererError::JobFailed {
                            prompt_id: prompt_id.to_string(),
                            status: status.to_string(),
                            history,
                        });
                    }
                }
                Err(error) => {
                    tracing::warn!(target: "agent.renderer", prompt_id, %error, "failed to query render history");
                }
            }

            tokio::time::sleep(poll_interval).await;
        }
    }

    async fn fetch_history(&self, prompt_id: &str) -> Result<Value, RendererError> {
        let response = self.http.get(format!("{}/history/{prompt_id}", self.base_url)).send().await?;
        let response = response.error_for_status()?;
        let mut history: Value = response.json().await?;
        if let Some(wrapped) = history.get(prompt_id).cloned() {
            history = wrapped;
        }
        Ok(history)
    }

    /// Query the renderer's queue endpoint for pending/running counts.
    /// Non-fatal on failure: returns an all-`None` snapshot.
    pub async fn describe_activity(&self) -> ActivitySnapshot {
        let attempt = async {
            let response = self.http.get(format!("{}/queue", self.base_url)).send().await?;
            let response = response.error_for_status()?;
            response.json::<Value>().await
        };
        match attempt.await {
            Ok(data) => ActivitySnapshot {
                pending: extract_length_or_int(data.get("queue_pending")),
                running: extract_length_or_int(data.get("queue_running")),
                raw: Some(data),
            },
            Err(error) => {
                tracing::debug!(target: "agent.renderer", %error, "failed to query renderer queue state");
                ActivitySnapshot { pending: None, running: None, raw: None }
            }
        }
    }

    /// Walk `history.outputs.<node>.images[]` and return every discovered
    /// output image, optionally filtered to `expected_node_ids`.
    pub fn extract_output_files(history: &Value, expected_node_ids: Option<&[String]>) -> Vec<OutputFile> {
        let allowed: Option<HashSet<&str>> = expected_node_ids.map(|ids| ids.iter().map(String::as_str).collect());
        let Some(outputs) = history.get("outputs").and_then(Value::as_object) else {
            return Vec::new();
        };
        let mut discovered = Vec::new();
        for (node_id, node) in outputs {
            if let Some(allowed) = &allowed {
                if !allowed.contains(node_id.as_str()) {
                    continue;
                }
            }
            let Some(images) = node.get("images").and_then(Value::as_array) else { continue };
            for image in images {
                let Some(filename) = image.get("filename").and_then(Value::as_str) else { continue };
                let subfolder = image.get("subfolder").and_then(Value::as_str).unwrap_or("").to_string();
                let image_type = image.get("type").and_then(Value::as_str).unwrap_or("output").to_string();
                discovered.push(OutputFile {
                    node_id: node_id.clone(),
                    filename: filename.to_string(),
                    subfolder,
                    image_type,
                });
            }
        }
        discovered
    }

    /// Return the cached allow-list mapping (input name → allowed values),
    /// refreshing it from the renderer's introspection endpoint (falling
    /// back to a filesystem scan) if the TTL has elapsed.
    pub async fn allowed_names(&self, paths: &PathConfig) -> HashMap<String, HashSet<String>> {
        let ttl = Duration::from_secs_f64(self.config.object_info_cache_seconds.max(0.0));
        {
            let cache = self.object_info_cache.lock().expect("object info cache lock poisoned");
            if let Some((fetched_at, mapping)) = cache.as_ref() {
                if fetched_at.elapsed() < ttl {
                    return mapping.clone();
                }
            }
        }

        let mapping = match self.fetch_object_info().await {
            Ok(mapping) if !mapping.is_empty() => mapping,
            Ok(_) => scan_filesystem_allow_list(paths),
            Err(error) => {
                tracing::warn!(target: "agent.renderer", %error, "falling back to filesystem scan for allowed names");
                scan_filesystem_allow_list(paths)
            }
        };

        *self.object_info_cache.lock().expect("object info cache lock poisoned") = Some((Instant::now(), mapping.clone()));
        mapping
    }

    /// Drop the cached allow-list mapping so the next lookup re-fetches it.
    /// Called after the engine materialises a new asset the renderer has
    /// not seen yet.
    pub fn invalidate_allowed_names_cache(&self) {
        *self.object_info_cache.lock().expect("object info cache lock poisoned") = None;
    }

    async fn fetch_object_info(&self) -> Result<HashMap<String, HashSet<String>>, RendererError> {
        let response = self.http.get(format!("{}/object_info", self.base_url)).send().await?;
        let response = response.error_for_status()?;
        let payload: Value = response.json().await?;
        Ok(parse_object_info(&payload))
    }
}

fn extract_length_or_int(value: Option<&Value>) -> Option<i64> {
    match value {
        Some(Value::Array(items)) => Some(items.len() as i64),
        Some(Value::Object(items)) => Some(items.len() as i64),
        Some(Value::Number(n)) => n.as_i64(),
        _ => None,
    }
}

fn parse_object_info(payload: &Value) -> HashMap<String, HashSet<String>> {
    let mut mapping = HashMap::new();
    let Some(nodes) = payload.as_object() else { return mapping };
    for node in nodes.values() {
        let Some(node) = node.as_object() else { continue };
        for section_key in ["inputs", "required", "optional"] {
            if let Some(section) = node.get(section_key).and_then(Value::as_object) {
                collect_inputs(section, &mut mapping);
            }
        }
    }
    mapping
}

fn collect_inputs(section: &serde_json::Map<String, Value>, mapping: &mut HashMap<String, HashSet<String>>) {
    for (key, value) in section {
        if let Some(obj) = value.as_object() {
            if !obj.contains_key("choices") && !obj.contains_key("default") {
                collect_inputs(obj, mapping);
                continue;
            }
        }
        let choices = collect_choices(value);
        if !choices.is_empty() {
            mapping.entry(key.clone()).or_default().extend(choices);
        }
    }
}

fn collect_choices(value: &Value) -> HashSet<String> {
    let mut discovered = HashSet::new();
    match value {
        Value::Object(obj) => {
            if let Some(choices) = obj.get("choices") {
                discovered.extend(collect_choices(choices));
            }
            if let Some(Value::String(default)) = obj.get("default") {
                discovered.insert(agent_assets::normalize_name(default));
            }
            for inner in obj.values() {
                if inner.is_object() || inner.is_array() {
                    discovered.extend(collect_choices(inner));
                }
            }
        }
        Value::Array(items) => {
            for item in items {
                discovered.extend(collect_choices(item));
            }
        }
        Value::String(s) => {
            discovered.insert(agent_assets::normalize_name(s));
        }
        _ => {}
    }
    discovered
}

fn scan_filesystem_allow_list(paths: &PathConfig) -> HashMap<String, HashSet<String>> {
    let base_root = paths.base_models.parent().map(Path::to_path_buf).unwrap_or_else(|| paths.base_models.clone());
    let vae_dir = base_root.join("vae");
    let clip_dir = base_root.join("clip");

    let base_models = collect_safetensors(&paths.base_models);
    let loras = collect_safetensors(&paths.loras);

    let mut mapping = HashMap::new();
    for key in ["ckpt_name", "refiner_ckpt_name", "model_name"] {
        if !base_models.is_empty() {
            mapping.insert(key.to_string(), base_models.clone());
        }
    }
    let vae = collect_safetensors(&vae_dir);
    if !vae.is_empty() {
        mapping.insert("vae_name".to_string(), vae);
    }
    let clip = collect_safetensors(&clip_dir);
    if !clip.is_empty() {
        mapping.insert("clip_name".to_string(), clip);
    }
    if !loras.is_empty() {
        mapping.insert("lora_name".to_string(), loras);
    }
    mapping
}

fn collect_safetensors(dir: &Path) -> HashSet<String> {
    if !dir.is_dir() {
        return HashSet::new();
    }
    walkdir::WalkDir::new(dir)
        .max_depth(1)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|entry| entry.file_type().is_file())
        .filter(|entry| entry.path().extension().is_some_and(|ext| ext == "safetensors"))
        .filter_map(|entry| entry.file_name().to_str().map(agent_assets::normalize_name))
        .collect()
}
