// SPDX-License-Identifier: MIT OR Apache-2.0
//! agent-engine
#![deny(unsafe_code)]
#![warn(missing_docs)]
//!
//! The single-slot job engine: admission gate, the full per-job
//! pipeline (asset materialisation, parameter context, workflow
//! build/validation, renderer submission and polling, artifact upload,
//! callback emission, receipt persistence, and cleanup), and
//! cooperative cancellation.

mod assets;
mod cleanup;
mod params;
mod timeout;
mod upload;

pub use params::{LoraInput, ParamError};

use agent_assets::AssetResolver;
use agent_cancel::{CancellationRegistry, CancellationToken};
use agent_config::AgentConfig;
use agent_core::{
    ArtifactRecord, CallbackTargets, DispatchEnvelope, GeneratorState, JobRuntimeState, ResolvedAsset,
    WorkflowParameterBinding,
};
use agent_error::{AgentError, ReasonCode};
use agent_objectstore::ObjectStoreClient;
use agent_receipt::{ensure_job_log_dir, AppliedWorkflow, EventLog, JobManifest};
use agent_renderer::{OutputFile, RendererClient, RendererError};
use agent_retry::{status_idempotency_key, terminal_idempotency_key, CallbackClient, CallbackTransportConfig};
use agent_workflow::{apply_mutations, attach_parameters, load_workflow, rewrite_lora_chain, validate_graph, LoraPlacement, NodeGraph};
use agent_core::WorkflowMutation;
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// Derive per-placement LoRA chain entries from resolved assets and their
/// object-store metadata, in envelope order.
pub fn build_lora_placements(resolved: &[(ResolvedAsset, BTreeMap<String, String>)]) -> Vec<LoraPlacement> {
    resolved
        .iter()
        .map(|(asset, metadata)| LoraPlacement {
            lora_name: asset.display_name.clone(),
            strength_model: params::derive_lora_strength(metadata, &["strength_model", "strength_clip", "strength"]),
            strength_clip: params::derive_lora_strength(metadata, &["strength_clip", "strength_model", "strength"]),
        })
        .collect()
}

/// Apply workflow overrides, rewrite the LoRA chain, bind resolved
/// parameters onto the graph, and run structural/allow-list validation.
/// A pure transformation over an already-loaded graph; no network or
/// filesystem access.
///
/// # Errors
///
/// Returns whatever [`agent_workflow`] step fails first: mutation,
/// chain rewriting, parameter binding, or validation.
pub fn prepare_graph(
    mut graph: NodeGraph,
    overrides: &[WorkflowMutation],
    lora_placements: &[LoraPlacement],
    bindings: &[WorkflowParameterBinding],
    resolved_parameters: &BTreeMap<String, Value>,
    allowed_values: &BTreeMap<String, HashSet<String>>,
) -> Result<NodeGraph, AgentError> {
    apply_mutations(&mut graph, overrides)?;
    rewrite_lora_chain(&mut graph, lora_placements)?;
    attach_parameters(&mut graph, bindings, resolved_parameters)?;
    validate_graph(&graph, allowed_values)?;
    Ok(graph)
}

/// Everything the completion callback needs, gathered once a job's
/// pipeline finishes successfully.
struct CompletionData {
    prompt_id: Option<String>,
    artifacts: Vec<ArtifactRecord>,
    warnings: Vec<String>,
    model_display_name: String,
    lora_display_names: Vec<String>,
    seed: i64,
    steps: u32,
    cfg_scale: f64,
    sampler: Option<String>,
    scheduler: Option<String>,
    width: u32,
    height: u32,
    denoise: Option<f64>,
    started_at: chrono::DateTime<chrono::Utc>,
    finished_at: chrono::DateTime<chrono::Utc>,
}

#[derive(Clone)]
struct ActiveJob {
    job_id: String,
    client_id: String,
    callback_target: Option<String>,
    runtime: Arc<tokio::sync::Mutex<JobRuntimeState>>,
}

/// Owns the single admission slot and every egress client a job's
/// pipeline drives: the asset resolver, object store, renderer,
/// callback emitter, and cancellation registry.
pub struct Engine {
    config: Arc<AgentConfig>,
    resolver: Arc<AssetResolver>,
    object_store: ObjectStoreClient,
    renderer: Arc<RendererClient>,
    callbacks: CallbackClient,
    cancellation: CancellationRegistry,
    slot: Arc<tokio::sync::Mutex<()>>,
    active: Arc<std::sync::Mutex<Option<ActiveJob>>>,
}

impl Engine {
    /// Build an engine from loaded configuration.
    ///
    /// # Errors
    ///
    /// Returns an [`AgentError`] if the object-store or renderer HTTP
    /// clients cannot be constructed.
    pub fn new(config: AgentConfig) -> Result<Self, AgentError> {
        let object_store = ObjectStoreClient::new(&config.objectstore)?;
        let renderer = RendererClient::new(config.renderer.clone())?;
        let callbacks = CallbackClient::new(CallbackTransportConfig {
            base_url: config.callbacks.base_url.clone(),
            timeout: Duration::from_secs(config.callbacks.timeout_seconds),
            max_retries: config.callbacks.max_retries,
            retry_backoff_seconds: config.callbacks.retry_backoff_seconds,
            verify_tls: config.callbacks.verify_tls,
        });
        Ok(Self {
            config: Arc::new(config),
            resolver: Arc::new(AssetResolver::new()),
            object_store,
            renderer: Arc::new(renderer),
            callbacks,
            cancellation: CancellationRegistry::new(),
            slot: Arc::new(tokio::sync::Mutex::new(())),
            active: Arc::new(std::sync::Mutex::new(None)),
        })
    }

    /// Whether the admission slot is currently held.
    pub fn is_busy(&self) -> bool {
        self.slot.try_lock().is_err()
    }

    /// Queue-depth snapshot from the renderer, for the health endpoint.
    pub async fn describe_activity(&self) -> agent_renderer::ActivitySnapshot {
        self.renderer.describe_activity().await
    }

    /// Acquire the admission slot without waiting.
    pub fn try_reserve(&self) -> Option<tokio::sync::OwnedMutexGuard<()>> {
        self.slot.clone().try_lock_owned().ok()
    }

    /// Run `envelope` to completion holding a slot guard acquired via
    /// [`Engine::try_reserve`]. The guard is dropped (releasing the slot)
    /// once the pipeline finishes.
    pub async fn run_reserved(&self, guard: tokio::sync::OwnedMutexGuard<()>, envelope: DispatchEnvelope) {
        self.execute(envelope).await;
        drop(guard);
    }

    /// Wait for the admission slot, then run `envelope`. Used only where
    /// blocking until the slot frees is the desired behaviour (tests and
    /// sequential harnesses); the HTTP surface always uses
    /// [`Engine::try_reserve`] and returns `409` immediately on miss.
    pub async fn handle_job(&self, envelope: DispatchEnvelope) {
        let _guard = self.slot.clone().lock_owned().await;
        self.execute(envelope).await;
    }

    /// Request cancellation of `job_id`, authenticated by `token`. Returns
    /// `false` if the token is empty, unknown, or doesn't match. On
    /// success, also fires a best-effort "cancelling" status heartbeat if
    /// the job configured a status callback.
    pub fn request_cancel(&self, job_id: &str, token: &str) -> bool {
        let accepted = self.cancellation.request_cancel(job_id, token);
        if accepted {
            let active = self.active.lock().expect("active job lock poisoned").clone();
            if let Some(active) = active.filter(|job| job.job_id == job_id) {
                let callbacks = self.callbacks.clone();
                tokio::spawn(async move {
                    let Some(target) = active.callback_target else { return };
                    let seq = active.runtime.lock().await.next_heartbeat();
                    let body = json!({
                        "job_id": active.job_id,
                        "client_id": active.client_id,
                        "state": "cancelling",
                        "timestamp": chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
                        "heartbeat_seq": seq,
                    });
                    let key = status_idempotency_key(&active.job_id, "CANCELLING", seq);
                    callbacks.post(&target, &key, &body).await;
                });
            }
        }
        accepted
    }

    async fn execute(&self, envelope: DispatchEnvelope) {
        let job_id = envelope.job_id.clone();
        let client_id = self.config.renderer.client_id.clone();
        let callback_targets = envelope.callbacks.clone().unwrap_or_default();
        let runtime = Arc::new(tokio::sync::Mutex::new(JobRuntimeState::new()));

        let log_dir = match ensure_job_log_dir(&self.config.paths.outputs, &job_id).await {
            Ok(dir) => Some(dir),
            Err(error) => {
                tracing::warn!(target: "agent.engine", job_id = %job_id, %error, "failed to create job log directory");
                None
            }
        };
        let event_log = log_dir.as_ref().map(|dir| EventLog::new(dir));
        if let Some(log) = &event_log {
            let _ = log.append("accepted", None).await;
        }

        let cancel_signal = match &envelope.cancel_token {
            Some(token) if !token.trim().is_empty() => {
                let signal = self.cancellation.register(job_id.clone(), token.clone());
                if let Some(log) = &event_log {
                    let _ = log.append("cancellation_registered", None).await;
                }
                signal
            }
            _ => CancellationToken::new(),
        };

        *self.active.lock().expect("active job lock poisoned") = Some(ActiveJob {
            job_id: job_id.clone(),
            client_id: client_id.clone(),
            callback_target: callback_targets.status.clone(),
            runtime: runtime.clone(),
        });

        self.emit_status(&job_id, &client_id, &callback_targets, &runtime, GeneratorState::Queued, None).await;
        if let Some(log) = &event_log {
            let _ = log.append("queued", None).await;
        }

        let outcome = self
            .run_pipeline(&envelope, &job_id, &client_id, &callback_targets, &runtime, &cancel_signal, event_log.as_ref(), log_dir.as_deref())
            .await;

        self.cancellation.unregister(&job_id);
        *self.active.lock().expect("active job lock poisoned") = None;

        match outcome {
            Ok(data) => {
                if let Some(log) = &event_log {
                    let _ = log.append("completed", None).await;
                }
                self.emit_completion(&job_id, &client_id, &callback_targets, data).await;
            }
            Err(error) => {
                let event_name = if error.code == ReasonCode::Canceled { "cancelled" } else { "failed" };
                if let Some(log) = &event_log {
                    let _ = log.append(event_name, Some(json!({"reason_code": error.code.as_str()}))).await;
                }
                self.emit_failure(&job_id, &client_id, &callback_targets, &error).await;
            }
        }

        if let Some(log) = &event_log {
            let _ = log.append("finalized", None).await;
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_pipeline(
        &self,
        envelope: &DispatchEnvelope,
        job_id: &str,
        client_id: &str,
        callback_targets: &CallbackTargets,
        runtime: &Arc<tokio::sync::Mutex<JobRuntimeState>>,
        cancel_signal: &CancellationToken,
        event_log: Option<&EventLog>,
        log_dir: Option<&Path>,
    ) -> Result<CompletionData, AgentError> {
        let started_at = chrono::Utc::now();

        let model_metadata =
            self.object_store.get_object_metadata(&envelope.base_model.bucket, &envelope.base_model.key).await;
        let resolved_model = match assets::resolve_model(
            self.resolver.clone(),
            self.object_store.clone(),
            envelope.base_model.clone(),
            model_metadata,
            self.config.paths.base_models.clone(),
        )
        .await
        {
            Ok(resolved) => resolved,
            Err(error) => return Err(AgentError::from(error)),
        };

        let mut used_visible_names = HashSet::new();
        let mut resolved_loras: Vec<(ResolvedAsset, BTreeMap<String, String>)> = Vec::new();
        for (index, lora_asset) in envelope.loras.iter().enumerate() {
            let metadata = self.object_store.get_object_metadata(&lora_asset.bucket, &lora_asset.key).await;
            match assets::resolve_lora(
                self.resolver.clone(),
                self.object_store.clone(),
                lora_asset.clone(),
                metadata.clone(),
                self.config.paths.loras.clone(),
                envelope.user.username.clone(),
                job_id.to_string(),
                index,
                None,
                used_visible_names.clone(),
            )
            .await
            {
                Ok((resolved, updated_used)) => {
                    used_visible_names = updated_used;
                    resolved_loras.push((resolved, metadata));
                }
                Err(error) => {
                    self.cleanup_assets(&resolved_model, &resolved_loras).await;
                    return Err(AgentError::from(error));
                }
            }
        }

        let outcome = self
            .run_after_materialization(
                envelope,
                job_id,
                client_id,
                callback_targets,
                runtime,
                cancel_signal,
                event_log,
                log_dir,
                &resolved_model,
                &resolved_loras,
                started_at,
            )
            .await;

        self.cleanup_assets(&resolved_model, &resolved_loras).await;

        outcome
    }

    async fn cleanup_assets(&self, model: &ResolvedAsset, loras: &[(ResolvedAsset, BTreeMap<String, String>)]) {
        cleanup::cleanup_base_model(model, &self.config.cleanup, &self.config.persistent_model_keys).await;
        let lora_assets: Vec<ResolvedAsset> = loras.iter().map(|(resolved, _)| resolved.clone()).collect();
        cleanup::cleanup_loras(&lora_assets, &self.config.cleanup, &self.config.persistent_model_keys).await;
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_after_materialization(
        &self,
        envelope: &DispatchEnvelope,
        job_id: &str,
        client_id: &str,
        callback_targets: &CallbackTargets,
        runtime: &Arc<tokio::sync::Mutex<JobRuntimeState>>,
        cancel_signal: &CancellationToken,
        event_log: Option<&EventLog>,
        log_dir: Option<&Path>,
        resolved_model: &ResolvedAsset,
        resolved_loras: &[(ResolvedAsset, BTreeMap<String, String>)],
        started_at: chrono::DateTime<chrono::Utc>,
    ) -> Result<CompletionData, AgentError> {
        if cancel_signal.is_cancelled() {
            return Err(AgentError::new(ReasonCode::Canceled, "cancelled before submission"));
        }

        let any_downloaded = resolved_model.downloaded || resolved_loras.iter().any(|(resolved, _)| resolved.downloaded);
        if any_downloaded {
            self.renderer.invalidate_allowed_names_cache();
            tokio::time::sleep(Duration::from_secs_f64(self.config.renderer.model_refresh_delay_seconds.max(0.0))).await;
        }

        let lora_inputs: Vec<params::LoraInput<'_>> = resolved_loras
            .iter()
            .map(|(resolved, metadata)| params::LoraInput { display_name: &resolved.display_name, metadata })
            .collect();
        let resolved_parameters = params::build_parameter_context(
            &envelope.parameters,
            &resolved_model.display_name,
            &lora_inputs,
            &self.config.workflow_defaults,
        )
        .map_err(|error| AgentError::new(ReasonCode::ValidationError, error.to_string()))?;

        let object_store = self.object_store.clone();
        let graph = load_workflow(
            &envelope.workflow,
            &envelope.output.bucket,
            &self.config.paths.workflows,
            move |bucket, key, destination| {
                let object_store = object_store.clone();
                async move {
                    object_store.download_to_path(&bucket, &key, &destination).await.map_err(|error| {
                        agent_workflow::WorkflowError::Io { path: destination, source: std::io::Error::other(error.to_string()) }
                    })
                }
            },
        )
        .await?;

        let allowed_values: BTreeMap<String, HashSet<String>> =
            self.renderer.allowed_names(&self.config.paths).await.into_iter().collect();

        let lora_placements = build_lora_placements(resolved_loras);
        let graph = prepare_graph(
            graph,
            &envelope.workflow_overrides,
            &lora_placements,
            &envelope.workflow_parameters,
            &resolved_parameters,
            &allowed_values,
        )?;

        if let Some(log) = event_log {
            let _ = log.append("context_resolved", None).await;
        }

        let steps = resolved_parameters.get("steps").and_then(Value::as_u64).unwrap_or(0) as u32;
        let job_timeout = timeout::compute_timeout(
            self.config.renderer.timeout_seconds as f64,
            steps,
            self.config.renderer.per_step_timeout_seconds,
            self.config.renderer.img2img_timeout_multiplier,
            &graph,
        );

        if cancel_signal.is_cancelled() {
            return Err(AgentError::new(ReasonCode::Canceled, "cancelled before submission"));
        }

        let prompt_id = self.renderer.submit(&Value::Object(graph.clone()), Some(client_id)).await?;
        {
            let mut state = runtime.lock().await;
            state.prompt_id = Some(prompt_id.clone());
        }

        if let Some(dir) = log_dir {
            let manifest = JobManifest {
                schema_version: agent_receipt::MANIFEST_SCHEMA_VERSION,
                envelope: envelope.clone(),
                resolved_parameters: resolved_parameters.clone(),
                workflow: Value::Object(graph.clone()),
            };
            if let Err(error) = manifest.write_to(dir).await {
                tracing::warn!(target: "agent.engine", job_id, %error, "failed to persist job manifest");
            }
            let applied = AppliedWorkflow { prompt: Value::Object(graph.clone()), client_id: client_id.to_string() };
            if let Err(error) = applied.write_to(dir).await {
                tracing::warn!(target: "agent.engine", job_id, %error, "failed to persist applied workflow");
            }
        }

        self.emit_status(job_id, client_id, callback_targets, runtime, GeneratorState::Running, Some(&prompt_id)).await;
        if let Some(log) = event_log {
            let _ = log.append("running", None).await;
        }

        let history = match self.renderer.wait_for_completion(&prompt_id, job_timeout, cancel_signal).await {
            Ok(history) => history,
            Err(RendererError::JobFailed { history, status, prompt_id: failed_prompt_id }) => {
                let node_errors =
                    history.get("status").and_then(|s| s.get("node_errors").or_else(|| s.get("nodeErrors"))).cloned();
                let mut error =
                    AgentError::new(ReasonCode::ValidationError, format!("render job {failed_prompt_id} failed: {status}"));
                if let Some(node_errors) = node_errors {
                    error = error.with_context("node_errors", node_errors);
                }
                return Err(error);
            }
            Err(other) => return Err(AgentError::from(other)),
        };

        self.emit_status(job_id, client_id, callback_targets, runtime, GeneratorState::Uploading, Some(&prompt_id)).await;
        if let Some(log) = event_log {
            let _ = log.append("uploading", None).await;
        }

        let outputs: Vec<OutputFile> = RendererClient::extract_output_files(&history, None);
        let negative_prompt = envelope.parameters.negative_prompt.clone().unwrap_or_default();
        let seed = resolved_parameters.get("seed").and_then(Value::as_i64).unwrap_or(0);
        let loras_joined = resolved_loras.iter().map(|(resolved, _)| resolved.display_name.clone()).collect::<Vec<_>>().join(",");

        let upload_ctx = upload::UploadContext {
            job_id,
            username: &envelope.user.username,
            prompt: &envelope.parameters.prompt,
            negative_prompt: &negative_prompt,
            seed,
            steps,
            model: &resolved_model.display_name,
            loras: &loras_joined,
            bucket: &envelope.output.bucket,
        };
        let (artifacts, warnings) = upload::upload_outputs(&self.object_store, &self.config.paths, &upload_ctx, &outputs).await;

        Ok(CompletionData {
            prompt_id: Some(prompt_id),
            artifacts,
            warnings,
            model_display_name: resolved_model.display_name.clone(),
            lora_display_names: resolved_loras.iter().map(|(resolved, _)| resolved.display_name.clone()).collect(),
            seed,
            steps,
            cfg_scale: resolved_parameters.get("cfg_scale").and_then(Value::as_f64).unwrap_or(0.0),
            sampler: resolved_parameters.get("sampler").and_then(Value::as_str).map(str::to_string),
            scheduler: resolved_parameters.get("scheduler").and_then(Value::as_str).map(str::to_string),
            width: resolved_parameters.get("width").and_then(Value::as_u64).unwrap_or(0) as u32,
            height: resolved_parameters.get("height").and_then(Value::as_u64).unwrap_or(0) as u32,
            denoise: resolved_parameters.get("denoise").and_then(Value::as_f64),
            started_at,
            finished_at: chrono::Utc::now(),
        })
    }

    async fn emit_status(
        &self,
        job_id: &str,
        client_id: &str,
        targets: &CallbackTargets,
        runtime: &Arc<tokio::sync::Mutex<JobRuntimeState>>,
        state: GeneratorState,
        prompt_id: Option<&str>,
    ) {
        let Some(target) = &targets.status else { return };
        let seq = runtime.lock().await.next_heartbeat();
        let state_str = serde_json::to_value(state).ok().and_then(|v| v.as_str().map(str::to_string)).unwrap_or_default();
        let mut body = json!({
            "job_id": job_id,
            "client_id": client_id,
            "state": state_str,
            "timestamp": chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
            "heartbeat_seq": seq,
        });
        if let Some(prompt_id) = prompt_id {
            body["prompt_id"] = json!(prompt_id);
        }
        let key = status_idempotency_key(job_id, &state_str, seq);
        self.callbacks.post(target, &key, &body).await;
    }

    async fn emit_completion(&self, job_id: &str, client_id: &str, targets: &CallbackTargets, data: CompletionData) {
        let Some(target) = &targets.completion else { return };
        let mut params = json!({
            "model": data.model_display_name,
            "seed": data.seed,
            "steps": data.steps,
            "cfg": data.cfg_scale,
            "width": data.width,
            "height": data.height,
        });
        if let Some(sampler) = &data.sampler {
            params["sampler"] = json!(sampler);
        }
        if let Some(scheduler) = &data.scheduler {
            params["scheduler"] = json!(scheduler);
        }
        if let Some(denoise) = data.denoise {
            params["denoise"] = json!(denoise);
        }
        if !data.lora_display_names.is_empty() {
            params["loras"] = json!(data.lora_display_names.iter().map(|name| json!({ "name": name })).collect::<Vec<_>>());
        }

        let duration_ms = (data.finished_at - data.started_at).num_milliseconds();
        let body = json!({
            "job_id": job_id,
            "client_id": client_id,
            "state": "SUCCESS",
            "timestamp": chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
            "prompt_id": data.prompt_id,
            "artifacts": data.artifacts,
            "params": params,
            "meta": {"status_str": "success", "completed": true},
            "timing": {
                "started_at": data.started_at.to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
                "finished_at": data.finished_at.to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
                "duration_ms": duration_ms,
            },
            "warnings": data.warnings,
        });
        let key = terminal_idempotency_key(job_id, "SUCCESS");
        self.callbacks.post(target, &key, &body).await;
    }

    async fn emit_failure(&self, job_id: &str, client_id: &str, targets: &CallbackTargets, error: &AgentError) {
        let Some(target) = &targets.failure else { return };
        let state = if error.code == ReasonCode::Canceled { "CANCELED" } else { "FAILED" };
        let mut body = json!({
            "job_id": job_id,
            "client_id": client_id,
            "state": state,
            "timestamp": chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
            "reason_code": error.code.as_str(),
            "reason": error.message,
        });
        if let Some(source) = &error.source {
            body["error_type"] = json!(source.to_string());
        }
        if let Some(node_errors) = error.context.get("node_errors") {
            body["node_errors"] = json!(agent_error::truncate_node_errors(&node_errors.to_string()));
        }
        let key = terminal_idempotency_key(job_id, state);
        self.callbacks.post(target, &key, &body).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use agent_workflow::NodeGraph;
    use serde_json::json;

    fn sample_graph() -> NodeGraph {
        let mut graph = NodeGraph::new();
        graph.insert(
            "1".to_string(),
            json!({"class_type": "CheckpointLoaderSimple", "inputs": {"ckpt_name": "model.safetensors"}}),
        );
        graph.insert("2".to_string(), json!({"class_type": "CLIPTextEncode", "inputs": {"text": "positive"}}));
        graph.insert("3".to_string(), json!({"class_type": "CLIPTextEncode", "inputs": {"text": "negative"}}));
        graph.insert(
            "4".to_string(),
            json!({
                "class_type": "LoraLoader",
                "inputs": {"model": ["1", 0], "clip": ["1", 1], "lora_name": "template.safetensors", "strength_model": 1.0, "strength_clip": 1.0}
            }),
        );
        graph.insert(
            "5".to_string(),
            json!({
                "class_type": "KSampler",
                "inputs": {"positive": ["2", 0], "negative": ["3", 0], "model": ["4", 0]}
            }),
        );
        graph
    }

    #[test]
    fn build_lora_placements_derives_strength_from_metadata() {
        let mut metadata = BTreeMap::new();
        metadata.insert("strength_model".to_string(), "0.7".to_string());
        let resolved = ResolvedAsset {
            asset: agent_core::AssetRef {
                bucket: "b".to_string(),
                key: "loras/hero.safetensors".to_string(),
                cache_strategy: agent_core::CacheStrategy::Ephemeral,
                checksum: None,
                display_name: None,
                original_name: None,
            },
            cache_path: "/tmp/hero.safetensors".into(),
            display_name: "hero.safetensors".to_string(),
            link_path: "/tmp/hero.safetensors".into(),
            downloaded: true,
            link_created: true,
        };
        let placements = build_lora_placements(&[(resolved, metadata)]);
        assert_eq!(placements.len(), 1);
        assert_eq!(placements[0].lora_name, "hero.safetensors");
        assert_eq!(placements[0].strength_model, 0.7);
    }

    #[test]
    fn prepare_graph_rewrites_chain_and_validates_successfully() {
        let graph = sample_graph();
        let placements = vec![LoraPlacement { lora_name: "hero.safetensors".to_string(), strength_model: 0.8, strength_clip: 0.8 }];
        let resolved_parameters = BTreeMap::new();
        let allowed_values = BTreeMap::new();
        let result = prepare_graph(graph, &[], &placements, &[], &resolved_parameters, &allowed_values);
        assert!(result.is_ok(), "{result:?}");
        let graph = result.unwrap();
        let node4 = &graph["4"];
        assert_eq!(node4["inputs"]["lora_name"], json!("hero.safetensors"));
    }

    #[test]
    fn prepare_graph_surfaces_validation_failure_for_bad_ksampler_reference() {
        let mut graph = sample_graph();
        graph.get_mut("5").unwrap()["inputs"]["positive"] = json!(["1", 0]);
        let result = prepare_graph(graph, &[], &[], &[], &BTreeMap::new(), &BTreeMap::new());
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn admission_gate_allows_only_one_reservation_at_a_time() {
        let slot = Arc::new(tokio::sync::Mutex::new(()));
        let first = slot.clone().try_lock_owned();
        assert!(first.is_ok());
        let second = slot.clone().try_lock_owned();
        assert!(second.is_err());
        drop(first);
        assert!(slot.try_lock_owned().is_ok());
    }
}
