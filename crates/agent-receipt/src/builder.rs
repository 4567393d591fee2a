// SPDX-License-Identifier: MIT OR Apache-2.0

//! Fluent builder for constructing [`JobManifest`](crate::JobManifest)s.

use crate::{JobManifest, MANIFEST_SCHEMA_VERSION};
use agent_core::DispatchEnvelope;
use std::collections::BTreeMap;

/// Fluent builder for constructing [`JobManifest`]s ergonomically.
///
/// # Examples
///
/// ```
/// # use agent_core::*;
/// # use std::collections::BTreeMap;
/// # let envelope = DispatchEnvelope {
/// #     job_id: "J1".into(),
/// #     user: UserContext { id: "u".into(), username: "u".into() },
/// #     workflow: WorkflowRef { id: "w".into(), version: None, minio_key: None, local_path: None, inline: Some(serde_json::json!({})), bucket: None },
/// #     base_model: AssetRef { bucket: "b".into(), key: "k".into(), cache_strategy: CacheStrategy::Ephemeral, checksum: None, display_name: None, original_name: None },
/// #     loras: vec![],
/// #     parameters: JobParameters { prompt: "p".into(), negative_prompt: None, seed: None, cfg_scale: None, steps: None, resolution: None, extra: BTreeMap::new() },
/// #     output: OutputSpec { bucket: "o".into(), prefix: "p".into() },
/// #     priority: None, requested_at: None, cancel_token: None,
/// #     workflow_overrides: vec![], workflow_parameters: vec![], callbacks: None,
/// # };
/// use agent_receipt::JobManifestBuilder;
///
/// let manifest = JobManifestBuilder::new(envelope)
///     .workflow(serde_json::json!({"1": {"class_type": "KSampler"}}))
///     .build();
/// assert_eq!(manifest.schema_version, 1);
/// ```
#[derive(Debug)]
pub struct JobManifestBuilder {
    envelope: DispatchEnvelope,
    resolved_parameters: BTreeMap<String, serde_json::Value>,
    workflow: serde_json::Value,
}

impl JobManifestBuilder {
    /// Start a manifest for the given envelope.
    #[must_use]
    pub fn new(envelope: DispatchEnvelope) -> Self {
        Self {
            envelope,
            resolved_parameters: BTreeMap::new(),
            workflow: serde_json::Value::Null,
        }
    }

    /// Attach the resolved parameter context.
    #[must_use]
    pub fn resolved_parameters(
        mut self,
        params: BTreeMap<String, serde_json::Value>,
    ) -> Self {
        self.resolved_parameters = params;
        self
    }

    /// Attach the fully mutated/chained workflow graph.
    #[must_use]
    pub fn workflow(mut self, workflow: serde_json::Value) -> Self {
        self.workflow = workflow;
        self
    }

    /// Consume the builder and produce a [`JobManifest`].
    #[must_use]
    pub fn build(self) -> JobManifest {
        JobManifest {
            schema_version: MANIFEST_SCHEMA_VERSION,
            envelope: self.envelope,
            resolved_parameters: self.resolved_parameters,
            workflow: self.workflow,
        }
    }
}
