//! Output-artifact upload: renders a destination key per output image,
//! attaches generation metadata, and appends an [`ArtifactRecord`].

use agent_config::PathConfig;
use agent_core::ArtifactRecord;
use agent_objectstore::ObjectStoreClient;
use agent_renderer::OutputFile;
use std::collections::BTreeMap;
use std::path::Path;

/// Inputs shared by every artifact uploaded for one job.
pub struct UploadContext<'a> {
    /// Job id, used in the destination key and metadata.
    pub job_id: &'a str,
    /// Requesting user's username, attached as metadata.
    pub username: &'a str,
    /// Positive prompt, attached as metadata.
    pub prompt: &'a str,
    /// Negative prompt, attached as metadata (empty string if absent).
    pub negative_prompt: &'a str,
    /// Normalised seed, attached as metadata.
    pub seed: i64,
    /// Step count, attached as metadata.
    pub steps: u32,
    /// Base model display name, attached as metadata.
    pub model: &'a str,
    /// Comma-joined LoRA display names, attached as metadata.
    pub loras: &'a str,
    /// Destination bucket.
    pub bucket: &'a str,
}

/// Upload every discovered output image, skipping (and recording a
/// warning for) any whose source file is missing on disk.
///
/// Returns the uploaded [`ArtifactRecord`]s and a list of warnings for
/// missing files, both in the order `outputs` was given.
pub async fn upload_outputs(
    client: &ObjectStoreClient,
    paths: &PathConfig,
    ctx: &UploadContext<'_>,
    outputs: &[OutputFile],
) -> (Vec<ArtifactRecord>, Vec<String>) {
    let mut artifacts = Vec::new();
    let mut warnings = Vec::new();

    for (index, output) in outputs.iter().enumerate() {
        let mut source_dir = paths.outputs.clone();
        if !output.subfolder.is_empty() {
            source_dir = source_dir.join(&output.subfolder);
        }
        let source = source_dir.join(&output.filename);

        let Ok(file_metadata) = tokio::fs::metadata(&source).await else {
            tracing::warn!(target: "agent.engine", path = %source.display(), "expected output file is missing");
            warnings.push(output.filename.clone());
            continue;
        };

        let extension = Path::new(&output.filename).extension().and_then(std::ffi::OsStr::to_str).unwrap_or("png");
        let destination_key = format!("comfy-outputs/{}/{:02}_{}.{extension}", ctx.job_id, index + 1, ctx.seed);

        let mut metadata = BTreeMap::new();
        metadata.insert("prompt".to_string(), ctx.prompt.to_string());
        metadata.insert("negative_prompt".to_string(), ctx.negative_prompt.to_string());
        metadata.insert("seed".to_string(), ctx.seed.to_string());
        metadata.insert("steps".to_string(), ctx.steps.to_string());
        metadata.insert("user".to_string(), ctx.username.to_string());
        metadata.insert("job_id".to_string(), ctx.job_id.to_string());
        metadata.insert("model".to_string(), ctx.model.to_string());
        metadata.insert("loras".to_string(), ctx.loras.to_string());
        metadata.insert("image_type".to_string(), output.image_type.clone());

        match client.upload_file(ctx.bucket, &destination_key, &source, metadata).await {
            Ok(sha256) => artifacts.push(ArtifactRecord {
                node_id: output.node_id.clone(),
                filename: output.filename.clone(),
                subfolder: output.subfolder.clone(),
                rel_path: Path::new(&output.subfolder).join(&output.filename),
                abs_path: source.clone(),
                mime: mime_for_extension(extension),
                sha256,
                size_bytes: file_metadata.len(),
                bucket: ctx.bucket.to_string(),
                key: destination_key,
                url: None,
                kind: "image".to_string(),
            }),
            Err(error) => {
                tracing::warn!(target: "agent.engine", %error, filename = %output.filename, "failed to upload output artifact");
                warnings.push(output.filename.clone());
            }
        }
    }

    (artifacts, warnings)
}

fn mime_for_extension(extension: &str) -> String {
    match extension.to_lowercase().as_str() {
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "webp" => "image/webp",
        "gif" => "image/gif",
        _ => "application/octet-stream",
    }
    .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mime_for_extension_covers_common_image_types() {
        assert_eq!(mime_for_extension("png"), "image/png");
        assert_eq!(mime_for_extension("JPG"), "image/jpeg");
        assert_eq!(mime_for_extension("bin"), "application/octet-stream");
    }
}
