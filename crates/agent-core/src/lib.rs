// SPDX-License-Identifier: MIT OR Apache-2.0
//! agent-core
#![deny(unsafe_code)]
#![warn(missing_docs)]
//!
//! Wire data model for the GPU render agent.
//!
//! Every type here round-trips through `serde_json` exactly as the
//! dispatch envelope, callback payloads, and persisted job logs require.
//! If you only take one dependency in a new crate in this workspace,
//! take this one.

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

pub use agent_error::{FailureCategory, ReasonCode};

/// Caller identity carried on a dispatch envelope.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct UserContext {
    /// Controller-assigned user id.
    pub id: String,
    /// Display username, used in artifact metadata.
    pub username: String,
}

/// How long a materialised asset may live on disk once the job ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum CacheStrategy {
    /// Never deleted by cleanup, regardless of config flags.
    Persistent,
    /// Eligible for deletion per the cleanup policy.
    Ephemeral,
}

impl Default for CacheStrategy {
    fn default() -> Self {
        Self::Ephemeral
    }
}

/// A reference to a model or LoRA object in the object store.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct AssetRef {
    /// Bucket the object lives in.
    pub bucket: String,
    /// Object key within the bucket.
    pub key: String,
    /// Whether cleanup is allowed to remove this asset after the job.
    #[serde(default)]
    pub cache_strategy: CacheStrategy,
    /// Known content hash, if the controller already has one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
    /// Preferred display name, highest precedence in name derivation.
    #[serde(default, rename = "displayName", skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    /// Second-precedence display name, from the upstream asset catalogue.
    #[serde(default, rename = "originalName", skip_serializing_if = "Option::is_none")]
    pub original_name: Option<String>,
}

/// Source of a workflow graph: exactly one variant is populated.
///
/// `serde`'s derive cannot express the "exactly one of" invariant
/// directly, so this is deserialized permissively and checked by
/// [`WorkflowRef::validate`].
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct WorkflowRef {
    /// Workflow identifier, used to name scratch files.
    pub id: String,
    /// Optional version tag, passthrough only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    /// Object-store key for the workflow JSON.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub minio_key: Option<String>,
    /// Local filesystem path to the workflow JSON.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_path: Option<PathBuf>,
    /// Workflow graph supplied inline in the envelope.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inline: Option<serde_json::Value>,
    /// Bucket for `minio_key`; falls back to the base model's bucket.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bucket: Option<String>,
}

impl WorkflowRef {
    /// Returns `Ok(())` iff exactly one workflow source is populated.
    pub fn validate(&self) -> Result<(), String> {
        let present = [
            self.inline.is_some(),
            self.local_path.is_some(),
            self.minio_key.is_some(),
        ]
        .into_iter()
        .filter(|p| *p)
        .count();
        match present {
            1 => Ok(()),
            0 => Err("workflow reference must provide inline, localPath, or minioKey".into()),
            _ => Err("workflow reference must provide exactly one source".into()),
        }
    }
}

/// Destination for uploaded output artifacts.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct OutputSpec {
    /// Bucket to upload artifacts to.
    pub bucket: String,
    /// Key prefix; `.rstrip('/')` is applied before joining filenames.
    pub prefix: String,
}

/// Target width/height for generated images.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema)]
pub struct Resolution {
    /// Width in pixels, must be > 0.
    pub width: u32,
    /// Height in pixels, must be > 0.
    pub height: u32,
}

/// User-supplied generation parameters.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct JobParameters {
    /// Positive prompt text.
    pub prompt: String,
    /// Negative prompt text.
    #[serde(default, rename = "negativePrompt", skip_serializing_if = "Option::is_none")]
    pub negative_prompt: Option<String>,
    /// Generation seed; normalised/generated in the parameter context if absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed: Option<i64>,
    /// Classifier-free guidance scale.
    #[serde(default, rename = "cfgScale", skip_serializing_if = "Option::is_none")]
    pub cfg_scale: Option<f64>,
    /// Sampling step count.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub steps: Option<u32>,
    /// Output resolution.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolution: Option<Resolution>,
    /// Free-form passthrough fields merged over workflow defaults.
    ///
    /// Reserved keys (`prompt`, `seed`, `steps`, `width`, `height`,
    /// `cfg_scale`) are rejected by the parameter-context builder;
    /// `sampler`/`scheduler` are explicitly permitted here.
    #[serde(default)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

/// A single node-path mutation applied to a workflow graph.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct WorkflowMutation {
    /// Target node id inside the graph.
    pub node: i64,
    /// Dot-separated path on the node to update, e.g. `inputs.ckpt_name`.
    pub path: String,
    /// Replacement value.
    pub value: serde_json::Value,
}

/// Binds a resolved parameter-context value onto a workflow node path.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct WorkflowParameterBinding {
    /// Name looked up in the resolved parameter context.
    pub parameter: String,
    /// Target node id.
    pub node: i64,
    /// Dot-separated path on the node to update.
    pub path: String,
}

/// Controller-provided callback URLs, relative or absolute.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct CallbackTargets {
    /// Non-terminal heartbeat status callback.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    /// Success-terminal callback.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completion: Option<String>,
    /// Failure-terminal callback (also used for cancellation).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<String>,
    /// Cooperative cancellation request URL (unused by the agent's own
    /// HTTP surface, which exposes cancellation directly — kept for
    /// controllers that prefer to be told where to push cancellation).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cancel: Option<String>,
}

/// The immutable request body describing a single render job.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DispatchEnvelope {
    /// Unique job id, assigned by the controller.
    pub job_id: String,
    /// Who requested the job.
    pub user: UserContext,
    /// Workflow graph source and id.
    pub workflow: WorkflowRef,
    /// Checkpoint model to materialise.
    pub base_model: AssetRef,
    /// Ordered list of LoRA assets to materialise and chain.
    #[serde(default)]
    pub loras: Vec<AssetRef>,
    /// Generation parameters.
    pub parameters: JobParameters,
    /// Where to upload output artifacts.
    pub output: OutputSpec,
    /// Scheduling priority hint; passthrough only, not interpreted here.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<String>,
    /// Opaque controller timestamp; passthrough only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requested_at: Option<String>,
    /// Token that [`crate::DispatchEnvelope::cancel_token`] callers use to
    /// cancel this job cooperatively. Accepts either casing on the wire.
    #[serde(
        default,
        alias = "cancel_token",
        rename = "cancelToken",
        skip_serializing_if = "Option::is_none"
    )]
    pub cancel_token: Option<String>,
    /// Raw node-path mutations applied before parameter binding.
    #[serde(default, rename = "workflowOverrides")]
    pub workflow_overrides: Vec<WorkflowMutation>,
    /// Parameter-to-node bindings resolved after parameter context build.
    #[serde(default, rename = "workflowParameters")]
    pub workflow_parameters: Vec<WorkflowParameterBinding>,
    /// Where to report status/completion/failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub callbacks: Option<CallbackTargets>,
}

/// Result of materialising an [`AssetRef`] onto local disk.
#[derive(Debug, Clone)]
pub struct ResolvedAsset {
    /// The asset this resolution was performed for.
    pub asset: AssetRef,
    /// Real file on disk holding the downloaded bytes.
    pub cache_path: PathBuf,
    /// Human-meaningful name, unique within its directory, visible to the renderer.
    pub display_name: String,
    /// Path the renderer actually opens (a symlink, or equal to `cache_path`
    /// when the directory does not support symlinks).
    pub link_path: PathBuf,
    /// Whether the cache file was freshly downloaded this run.
    pub downloaded: bool,
    /// Whether the visible link/file was freshly created this run.
    pub link_created: bool,
}

/// In-memory state scoped to a single job's lifetime.
#[derive(Debug, Clone)]
pub struct JobRuntimeState {
    /// Wall-clock start time, used in callback timestamps.
    pub started_at: DateTime<Utc>,
    /// Monotonic start instant, used for timeout/duration computation.
    pub started_monotonic: std::time::Instant,
    /// Monotonically increasing sequence number for status heartbeats.
    pub heartbeat_seq: u64,
    /// The renderer's handle for the submitted prompt, once known.
    pub prompt_id: Option<String>,
}

impl JobRuntimeState {
    /// Start a new runtime state with `heartbeat_seq` at zero.
    pub fn new() -> Self {
        Self {
            started_at: Utc::now(),
            started_monotonic: std::time::Instant::now(),
            heartbeat_seq: 0,
            prompt_id: None,
        }
    }

    /// Advance and return the next heartbeat sequence number, starting at 1.
    pub fn next_heartbeat(&mut self) -> u64 {
        self.heartbeat_seq += 1;
        self.heartbeat_seq
    }
}

impl Default for JobRuntimeState {
    fn default() -> Self {
        Self::new()
    }
}

/// A single uploaded output file.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ArtifactRecord {
    /// Renderer node id that produced this output.
    pub node_id: String,
    /// Original filename on the renderer's output directory.
    pub filename: String,
    /// Subfolder under the renderer's output directory, if any.
    #[serde(default)]
    pub subfolder: String,
    /// Path relative to the renderer output root.
    pub rel_path: PathBuf,
    /// Absolute path the file was read from before upload.
    pub abs_path: PathBuf,
    /// MIME type inferred from the extension.
    pub mime: String,
    /// Hex-encoded SHA-256 of the file contents.
    pub sha256: String,
    /// File size in bytes.
    pub size_bytes: u64,
    /// Destination bucket.
    pub bucket: String,
    /// Destination key.
    pub key: String,
    /// Optional publicly reachable URL, if the store exposes one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    /// Output kind; always `"image"` for this generation pipeline.
    #[serde(default = "default_kind")]
    pub kind: String,
}

fn default_kind() -> String {
    "image".to_string()
}

/// The public job-state enum reported to the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GeneratorState {
    /// Accepted, waiting for the execution pipeline to start.
    Queued,
    /// Resolving the parameter context and validating the envelope.
    Preparing,
    /// Downloading/symlinking model and LoRA assets.
    Materializing,
    /// Submitted to the renderer, `prompt_id` now known.
    Submitted,
    /// Renderer is actively processing the prompt.
    Running,
    /// Renderer finished; uploading output artifacts.
    Uploading,
    /// Terminal: job completed successfully.
    Success,
    /// Terminal: job failed.
    Failed,
    /// Terminal: job was cooperatively cancelled.
    Canceled,
}

impl GeneratorState {
    /// Terminal states produce exactly one completion/failure callback.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Success | Self::Failed | Self::Canceled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn workflow_ref_requires_exactly_one_source() {
        let mut wf = WorkflowRef {
            id: "w1".into(),
            version: None,
            minio_key: None,
            local_path: None,
            inline: None,
            bucket: None,
        };
        assert!(wf.validate().is_err());
        wf.inline = Some(serde_json::json!({}));
        assert!(wf.validate().is_ok());
        wf.local_path = Some("x.json".into());
        assert!(wf.validate().is_err());
    }

    #[test]
    fn cancel_token_alias_accepts_snake_case() {
        let body = serde_json::json!({
            "jobId": "j1",
            "user": {"id": "u", "username": "u"},
            "workflow": {"id": "w", "inline": {}},
            "baseModel": {"bucket": "b", "key": "k"},
            "parameters": {"prompt": "p"},
            "output": {"bucket": "o", "prefix": "p"},
            "cancel_token": "tok-1"
        });
        let env: DispatchEnvelope = serde_json::from_value(body).unwrap();
        assert_eq!(env.cancel_token.as_deref(), Some("tok-1"));
    }

    #[test]
    fn generator_state_terminal_classification() {
        assert!(GeneratorState::Success.is_terminal());
        assert!(GeneratorState::Failed.is_terminal());
        assert!(GeneratorState::Canceled.is_terminal());
        assert!(!GeneratorState::Running.is_terminal());
        assert!(!GeneratorState::Queued.is_terminal());
    }

    #[test]
    fn generator_state_serializes_screaming_snake_case() {
        let s = serde_json::to_string(&GeneratorState::Submitted).unwrap();
        assert_eq!(s, "\"SUBMITTED\"");
    }
}
