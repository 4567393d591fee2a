// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = "Persisted job manifests, event logs, and artifact hashing."]
#![deny(unsafe_code)]
#![warn(missing_docs)]

//! Everything a job writes under `<outputs>/logs/<jobId>/`: a manifest
//! snapshot, an append-only event log, the applied-workflow payload, and
//! the SHA-256 hashing used both for artifact metadata and for the
//! manifest's own content-addressing.

mod builder;

pub use builder::JobManifestBuilder;

use agent_core::DispatchEnvelope;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::io::AsyncWriteExt;

/// Errors raised while persisting or reading job state.
#[derive(Debug, Error)]
pub enum ReceiptError {
    /// Filesystem I/O failed.
    #[error("io error at {path}: {source}")]
    Io {
        /// Path the operation was attempted against.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
    /// JSON (de)serialization failed.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Current manifest schema version, embedded in every written manifest.
pub const MANIFEST_SCHEMA_VERSION: u32 = 1;

/// Returns `<outputs>/logs/<jobId>`, creating it if absent.
pub async fn ensure_job_log_dir(outputs_root: &Path, job_id: &str) -> Result<PathBuf, ReceiptError> {
    let dir = outputs_root.join("logs").join(job_id);
    tokio::fs::create_dir_all(&dir)
        .await
        .map_err(|source| ReceiptError::Io {
            path: dir.clone(),
            source,
        })?;
    Ok(dir)
}

/// A snapshot of the envelope, resolved parameters, and workflow at the
/// moment a job was submitted to the renderer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobManifest {
    /// Manifest format version; bump on breaking layout changes.
    pub schema_version: u32,
    /// The dispatch envelope as received.
    pub envelope: DispatchEnvelope,
    /// The fully resolved parameter context (see the job engine's
    /// parameter-context construction).
    pub resolved_parameters: BTreeMap<String, serde_json::Value>,
    /// The workflow graph as submitted, after mutation and LoRA chaining.
    pub workflow: serde_json::Value,
}

impl JobManifest {
    /// Write this manifest to `<dir>/manifest-<UTC-RFC3339>.json`.
    pub async fn write_to(&self, dir: &Path) -> Result<PathBuf, ReceiptError> {
        let stamp = Utc::now().format("%Y%m%dT%H%M%S%.3fZ");
        let path = dir.join(format!("manifest-{stamp}.json"));
        let body = serde_json::to_vec_pretty(self)?;
        write_file(&path, &body).await?;
        Ok(path)
    }
}

/// The submitted renderer payload, persisted verbatim for audit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppliedWorkflow {
    /// The node-graph prompt as submitted.
    pub prompt: serde_json::Value,
    /// The client id used on the submit call.
    pub client_id: String,
}

impl AppliedWorkflow {
    /// Write this payload to `<dir>/applied-workflow.json`.
    pub async fn write_to(&self, dir: &Path) -> Result<PathBuf, ReceiptError> {
        let path = dir.join("applied-workflow.json");
        let body = serde_json::to_vec_pretty(self)?;
        write_file(&path, &body).await?;
        Ok(path)
    }
}

/// One append-only line in a job's `events.jsonl`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventRecord {
    /// When the event occurred.
    pub timestamp: DateTime<Utc>,
    /// Event name, one of the fixed set the job engine emits
    /// (`accepted`, `context_resolved`, `queued`,
    /// `cancellation_registered`, `running`, `uploading`, `completed`,
    /// `failed`, `cancelled`, `finalized`, `cancel_requested`).
    pub event: String,
    /// Optional structured detail payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

/// Appends [`EventRecord`]s to `<dir>/events.jsonl`, one JSON object per line.
#[derive(Debug, Clone)]
pub struct EventLog {
    path: PathBuf,
}

impl EventLog {
    /// Open (without creating yet) the event log for `dir`.
    pub fn new(dir: &Path) -> Self {
        Self {
            path: dir.join("events.jsonl"),
        }
    }

    /// Append one event, creating the file if this is the first write.
    pub async fn append(
        &self,
        event: impl Into<String>,
        details: Option<serde_json::Value>,
    ) -> Result<(), ReceiptError> {
        let record = EventRecord {
            timestamp: Utc::now(),
            event: event.into(),
            details,
        };
        let mut line = serde_json::to_string(&record)?;
        line.push('\n');
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .map_err(|source| ReceiptError::Io {
                path: self.path.clone(),
                source,
            })?;
        file.write_all(line.as_bytes())
            .await
            .map_err(|source| ReceiptError::Io {
                path: self.path.clone(),
                source,
            })?;
        Ok(())
    }
}

async fn write_file(path: &Path, body: &[u8]) -> Result<(), ReceiptError> {
    tokio::fs::write(path, body)
        .await
        .map_err(|source| ReceiptError::Io {
            path: path.to_path_buf(),
            source,
        })
}

/// Stream-hash a file's contents with SHA-256, reading in 1 MiB chunks so
/// large checkpoint/artifact files never need to be fully buffered.
pub async fn compute_sha256(path: &Path) -> Result<String, ReceiptError> {
    use tokio::io::AsyncReadExt;

    let mut file = tokio::fs::File::open(path)
        .await
        .map_err(|source| ReceiptError::Io {
            path: path.to_path_buf(),
            source,
        })?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 1024 * 1024];
    loop {
        let n = file
            .read(&mut buf)
            .await
            .map_err(|source| ReceiptError::Io {
                path: path.to_path_buf(),
                source,
            })?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

/// Hash raw bytes with SHA-256; used where data is already in memory
/// (e.g. hashing a manifest body before writing it).
pub fn hash_bytes(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use agent_core::{AssetRef, CacheStrategy, JobParameters, OutputSpec, UserContext, WorkflowRef};

    fn sample_envelope() -> DispatchEnvelope {
        DispatchEnvelope {
            job_id: "J1".into(),
            user: UserContext {
                id: "u1".into(),
                username: "alice".into(),
            },
            workflow: WorkflowRef {
                id: "w1".into(),
                version: None,
                minio_key: None,
                local_path: None,
                inline: Some(serde_json::json!({})),
                bucket: None,
            },
            base_model: AssetRef {
                bucket: "m".into(),
                key: "ckpts/sdxl.safetensors".into(),
                cache_strategy: CacheStrategy::Ephemeral,
                checksum: None,
                display_name: None,
                original_name: None,
            },
            loras: vec![],
            parameters: JobParameters {
                prompt: "p".into(),
                negative_prompt: None,
                seed: Some(42),
                cfg_scale: Some(7.0),
                steps: Some(20),
                resolution: None,
                extra: BTreeMap::new(),
            },
            output: OutputSpec {
                bucket: "o".into(),
                prefix: "out/J1".into(),
            },
            priority: None,
            requested_at: None,
            cancel_token: None,
            workflow_overrides: vec![],
            workflow_parameters: vec![],
            callbacks: None,
        }
    }

    #[tokio::test]
    async fn manifest_round_trips_through_disk() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = ensure_job_log_dir(tmp.path(), "J1").await.unwrap();
        let manifest = JobManifest {
            schema_version: MANIFEST_SCHEMA_VERSION,
            envelope: sample_envelope(),
            resolved_parameters: BTreeMap::new(),
            workflow: serde_json::json!({"1": {"class_type": "KSampler"}}),
        };
        let path = manifest.write_to(&dir).await.unwrap();
        assert!(path.exists());
        let body = tokio::fs::read(&path).await.unwrap();
        let back: JobManifest = serde_json::from_slice(&body).unwrap();
        assert_eq!(back.envelope.job_id, "J1");
        assert_eq!(back.schema_version, 1);
    }

    #[tokio::test]
    async fn event_log_appends_one_json_line_per_call() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = ensure_job_log_dir(tmp.path(), "J1").await.unwrap();
        let log = EventLog::new(&dir);
        log.append("accepted", None).await.unwrap();
        log.append("queued", Some(serde_json::json!({"slot": 0})))
            .await
            .unwrap();

        let contents = tokio::fs::read_to_string(dir.join("events.jsonl"))
            .await
            .unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 2);
        let first: EventRecord = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first.event, "accepted");
        let second: EventRecord = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(second.event, "queued");
        assert!(second.details.is_some());
    }

    #[tokio::test]
    async fn applied_workflow_writes_fixed_filename() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = ensure_job_log_dir(tmp.path(), "J1").await.unwrap();
        let applied = AppliedWorkflow {
            prompt: serde_json::json!({"1": {}}),
            client_id: "gpu-agent".into(),
        };
        let path = applied.write_to(&dir).await.unwrap();
        assert_eq!(path.file_name().unwrap(), "applied-workflow.json");
    }

    #[tokio::test]
    async fn sha256_matches_known_vector() {
        let tmp = tempfile::tempdir().unwrap();
        let file_path = tmp.path().join("hello.txt");
        tokio::fs::write(&file_path, b"hello world").await.unwrap();
        let hash = compute_sha256(&file_path).await.unwrap();
        assert_eq!(
            hash,
            "b94d27b9934d3e08a52e52d7da7dacefbce77cac34af1dc8bda5c0db9db7bec"
        );
    }

    #[test]
    fn hash_bytes_is_deterministic() {
        let a = hash_bytes(b"same input");
        let b = hash_bytes(b"same input");
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
    }
}
