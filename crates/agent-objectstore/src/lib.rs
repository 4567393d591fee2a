// SPDX-License-Identifier: MIT OR Apache-2.0
//! agent-objectstore
#![deny(unsafe_code)]
#![warn(missing_docs)]
//!
//! S3-compatible (MinIO) object-store client: download assets to local
//! disk, upload rendered artifacts with checksum metadata, and answer
//! existence/metadata queries. Signature scheme is always v4; the
//! configured endpoint may be plain HTTP for in-cluster MinIO deployments.

use agent_config::ObjectStoreConfig;
use agent_error::{AgentError, ReasonCode};
use aws_config::BehaviorVersion;
use aws_sdk_s3::config::{Credentials, Region};
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

const HASH_CHUNK_BYTES: usize = 1024 * 1024;

/// Failures raised by object-store operations.
#[derive(Debug, Error)]
pub enum ObjectStoreError {
    /// `head_object`/`ensure_objects` found no such object.
    #[error("object missing: s3://{bucket}/{key}")]
    NotFound {
        /// Bucket the object was expected in.
        bucket: String,
        /// Key that was looked up.
        key: String,
    },
    /// The S3-compatible endpoint rejected or failed a request.
    #[error("object store request failed: {0}")]
    Request(String),
    /// A local filesystem operation on `path` failed.
    #[error("local filesystem error at {path}: {source}")]
    Io {
        /// Path the operation was acting on.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
    /// The client could not be constructed from the given configuration.
    #[error("failed to build object store client: {0}")]
    ClientBuild(String),
}

impl From<ObjectStoreError> for AgentError {
    fn from(err: ObjectStoreError) -> Self {
        let code = match &err {
            ObjectStoreError::NotFound { .. } | ObjectStoreError::Io { .. } | ObjectStoreError::ClientBuild(_) => {
                ReasonCode::SystemError
            }
            ObjectStoreError::Request(_) => ReasonCode::TransientError,
        };
        let message = err.to_string();
        AgentError::new(code, message).with_source(err)
    }
}

/// Stream `path` in 1 MiB chunks and return its hex-encoded SHA-256 digest.
///
/// # Errors
///
/// Returns [`ObjectStoreError::Io`] if `path` cannot be opened or read.
pub async fn compute_sha256(path: &Path) -> Result<String, ObjectStoreError> {
    let mut file = tokio::fs::File::open(path)
        .await
        .map_err(|source| ObjectStoreError::Io { path: path.to_path_buf(), source })?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; HASH_CHUNK_BYTES];
    loop {
        let read = file
            .read(&mut buf)
            .await
            .map_err(|source| ObjectStoreError::Io { path: path.to_path_buf(), source })?;
        if read == 0 {
            break;
        }
        hasher.update(&buf[..read]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

/// S3-compatible client bound to a single MinIO/S3 endpoint.
#[derive(Debug, Clone)]
pub struct ObjectStoreClient {
    client: Client,
}

impl ObjectStoreClient {
    /// Build a client from agent configuration.
    ///
    /// Uses path-style addressing (required by most self-hosted MinIO
    /// deployments) and static credentials; the endpoint's own scheme
    /// (`http://`/`https://`) governs plaintext vs TLS.
    ///
    /// # Errors
    ///
    /// Returns [`ObjectStoreError::ClientBuild`] if the endpoint cannot be
    /// parsed into a valid client configuration.
    pub fn new(config: &ObjectStoreConfig) -> Result<Self, ObjectStoreError> {
        let region = config.region.clone().unwrap_or_else(|| "us-east-1".to_string());
        let credentials = Credentials::new(
            config.access_key.clone(),
            config.secret_key.clone(),
            None,
            None,
            "agent-config",
        );
        let s3_config = aws_sdk_s3::Config::builder()
            .behavior_version(BehaviorVersion::latest())
            .endpoint_url(&config.endpoint)
            .region(Region::new(region))
            .credentials_provider(credentials)
            .force_path_style(true)
            .build();
        Ok(Self { client: Client::from_conf(s3_config) })
    }

    /// Download `bucket`/`key` into `destination`, creating parent
    /// directories as needed.
    ///
    /// # Errors
    ///
    /// Returns [`ObjectStoreError::Request`] on a transport/service failure,
    /// or [`ObjectStoreError::Io`] if the destination cannot be written.
    pub async fn download_to_path(&self, bucket: &str, key: &str, destination: &Path) -> Result<(), ObjectStoreError> {
        if let Some(parent) = destination.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|source| ObjectStoreError::Io { path: parent.to_path_buf(), source })?;
        }
        tracing::info!(target: "agent.objectstore", bucket, key, destination = %destination.display(), "downloading object");
        let mut response = self
            .client
            .get_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| ObjectStoreError::Request(e.to_string()))?;

        let mut file = tokio::fs::File::create(destination)
            .await
            .map_err(|source| ObjectStoreError::Io { path: destination.to_path_buf(), source })?;
        while let Some(chunk) = response
            .body
            .try_next()
            .await
            .map_err(|e| ObjectStoreError::Request(e.to_string()))?
        {
            file.write_all(&chunk)
                .await
                .map_err(|source| ObjectStoreError::Io { path: destination.to_path_buf(), source })?;
        }
        file.flush()
            .await
            .map_err(|source| ObjectStoreError::Io { path: destination.to_path_buf(), source })?;
        Ok(())
    }

    /// Upload `source` to `bucket`/`key`, attaching `metadata` plus a
    /// `sha256` entry computed from `source` if one wasn't already supplied.
    /// Returns the sha256 hex digest that was attached.
    ///
    /// # Errors
    ///
    /// Returns [`ObjectStoreError::Io`] if `source` cannot be read, or
    /// [`ObjectStoreError::Request`] on a transport/service failure.
    pub async fn upload_file(
        &self,
        bucket: &str,
        key: &str,
        source: &Path,
        mut metadata: BTreeMap<String, String>,
    ) -> Result<String, ObjectStoreError> {
        let sha256 = match metadata.get("sha256") {
            Some(existing) => existing.clone(),
            None => {
                let digest = compute_sha256(source).await?;
                metadata.insert("sha256".to_string(), digest.clone());
                digest
            }
        };

        tracing::info!(target: "agent.objectstore", bucket, key, source = %source.display(), "uploading object");
        let body = ByteStream::from_path(source)
            .await
            .map_err(|e| ObjectStoreError::Io { path: source.to_path_buf(), source: std::io::Error::other(e) })?;

        let mut request = self.client.put_object().bucket(bucket).key(key).body(body);
        for (k, v) in &metadata {
            request = request.metadata(k, v);
        }
        request.send().await.map_err(|e| ObjectStoreError::Request(e.to_string()))?;
        Ok(sha256)
    }

    /// Verify every `(bucket, key)` pair exists via `head_object`.
    ///
    /// # Errors
    ///
    /// Returns the first [`ObjectStoreError::NotFound`] encountered.
    pub async fn ensure_objects(&self, assets: &[(String, String)]) -> Result<(), ObjectStoreError> {
        for (bucket, key) in assets {
            self.client
                .head_object()
                .bucket(bucket)
                .key(key)
                .send()
                .await
                .map_err(|_| ObjectStoreError::NotFound { bucket: bucket.clone(), key: key.clone() })?;
        }
        Ok(())
    }

    /// Fetch an object's user metadata, case-folded to lowercase keys.
    /// Non-fatal: returns an empty map on any failure.
    pub async fn get_object_metadata(&self, bucket: &str, key: &str) -> BTreeMap<String, String> {
        match self.client.head_object().bucket(bucket).key(key).send().await {
            Ok(response) => response
                .metadata()
                .cloned()
                .unwrap_or_default()
                .into_iter()
                .map(|(k, v)| (k.to_lowercase(), v))
                .collect(),
            Err(error) => {
                tracing::debug!(target: "agent.objectstore", bucket, key, %error, "metadata lookup failed");
                BTreeMap::new()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn compute_sha256_matches_known_vector() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("hello.txt");
        tokio::fs::write(&path, b"hello world").await.unwrap();
        let digest = compute_sha256(&path).await.unwrap();
        assert_eq!(digest, "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9");
    }

    #[tokio::test]
    async fn compute_sha256_streams_across_multiple_chunk_boundaries() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("big.bin");
        let data = vec![7u8; HASH_CHUNK_BYTES * 2 + 17];
        tokio::fs::write(&path, &data).await.unwrap();

        let mut hasher = Sha256::new();
        hasher.update(&data);
        let expected = format!("{:x}", hasher.finalize());

        assert_eq!(compute_sha256(&path).await.unwrap(), expected);
    }

    #[test]
    fn client_build_rejects_nothing_up_front_for_valid_config() {
        let config = ObjectStoreConfig {
            endpoint: "http://127.0.0.1:9000".to_string(),
            access_key: "minioadmin".to_string(),
            secret_key: "minioadmin".to_string(),
            secure: false,
            region: None,
            verify_tls: true,
        };
        assert!(ObjectStoreClient::new(&config).is_ok());
    }

    #[test]
    fn not_found_error_maps_to_system_reason_code() {
        let err = ObjectStoreError::NotFound { bucket: "b".to_string(), key: "k".to_string() };
        let agent_err: AgentError = err.into();
        assert_eq!(agent_err.category(), agent_error::FailureCategory::System);
    }

    #[test]
    fn request_error_maps_to_transient_reason_code() {
        let err = ObjectStoreError::Request("timed out".to_string());
        let agent_err: AgentError = err.into();
        assert_eq!(agent_err.category(), agent_error::FailureCategory::Transient);
    }
}
