//! Post-job cache/link cleanup.

use agent_config::CleanupConfig;
use agent_core::{CacheStrategy, ResolvedAsset};

/// Remove `asset`'s cache file and, independently, its visible link, iff
/// its cache strategy isn't persistent, the corresponding `flag` is set,
/// and the file/link was materialised (not reused) this run. The asset's
/// basename is also checked against `persistent_model_keys` — files named
/// there are never removed, regardless of `cacheStrategy`. Unlink
/// failures are logged, never propagated.
pub async fn cleanup_asset(resolved: &ResolvedAsset, flag: bool, persistent_model_keys: &[String]) {
    if resolved.asset.cache_strategy == CacheStrategy::Persistent || !flag {
        return;
    }
    if is_persistent_by_key(resolved, persistent_model_keys) {
        tracing::debug!(target: "agent.engine", path = %resolved.cache_path.display(), "skipping cleanup for persistent-keyed asset");
        return;
    }

    if resolved.downloaded {
        remove_best_effort(&resolved.cache_path).await;
    }
    if resolved.link_created && resolved.link_path != resolved.cache_path {
        remove_best_effort(&resolved.link_path).await;
    }
}

fn is_persistent_by_key(resolved: &ResolvedAsset, persistent_model_keys: &[String]) -> bool {
    let key_basename = std::path::Path::new(&resolved.asset.key).file_name().and_then(|n| n.to_str());
    persistent_model_keys
        .iter()
        .any(|key| std::path::Path::new(key).file_name().and_then(|n| n.to_str()) == key_basename)
}

async fn remove_best_effort(path: &std::path::Path) {
    if let Err(error) = tokio::fs::remove_file(path).await {
        if error.kind() != std::io::ErrorKind::NotFound {
            tracing::warn!(target: "agent.engine", path = %path.display(), %error, "failed to remove asset during cleanup");
        }
    }
}

/// Run [`cleanup_asset`] for a base model, governed by
/// `cleanup.delete_downloaded_models`.
pub async fn cleanup_base_model(resolved: &ResolvedAsset, cleanup: &CleanupConfig, persistent_model_keys: &[String]) {
    cleanup_asset(resolved, cleanup.delete_downloaded_models, persistent_model_keys).await;
}

/// Run [`cleanup_asset`] for every resolved LoRA, governed by
/// `cleanup.delete_downloaded_loras`.
pub async fn cleanup_loras(resolved: &[ResolvedAsset], cleanup: &CleanupConfig, persistent_model_keys: &[String]) {
    for asset in resolved {
        cleanup_asset(asset, cleanup.delete_downloaded_loras, persistent_model_keys).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use agent_core::AssetRef;
    use std::path::PathBuf;

    fn resolved(cache_strategy: CacheStrategy, downloaded: bool, link_created: bool, path: PathBuf) -> ResolvedAsset {
        ResolvedAsset {
            asset: AssetRef {
                bucket: "b".to_string(),
                key: "models/sd15.safetensors".to_string(),
                cache_strategy,
                checksum: None,
                display_name: None,
                original_name: None,
            },
            cache_path: path.clone(),
            display_name: "sd15.safetensors".to_string(),
            link_path: path,
            downloaded,
            link_created,
        }
    }

    #[tokio::test]
    async fn persistent_assets_are_never_removed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.safetensors");
        tokio::fs::write(&path, b"x").await.unwrap();
        let asset = resolved(CacheStrategy::Persistent, true, true, path.clone());

        cleanup_asset(&asset, true, &[]).await;

        assert!(path.exists());
    }

    #[tokio::test]
    async fn ephemeral_assets_are_removed_when_flag_is_set_and_freshly_created() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.safetensors");
        tokio::fs::write(&path, b"x").await.unwrap();
        let asset = resolved(CacheStrategy::Ephemeral, true, true, path.clone());

        cleanup_asset(&asset, true, &[]).await;

        assert!(!path.exists());
    }

    #[tokio::test]
    async fn reused_cache_is_not_removed_even_when_ephemeral() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.safetensors");
        tokio::fs::write(&path, b"x").await.unwrap();
        let asset = resolved(CacheStrategy::Ephemeral, false, false, path.clone());

        cleanup_asset(&asset, true, &[]).await;

        assert!(path.exists());
    }

    #[tokio::test]
    async fn persistent_model_keys_override_ephemeral_strategy() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sd15.safetensors");
        tokio::fs::write(&path, b"x").await.unwrap();
        let asset = resolved(CacheStrategy::Ephemeral, true, true, path.clone());

        cleanup_asset(&asset, true, &["some/prefix/sd15.safetensors".to_string()]).await;

        assert!(path.exists());
    }
}
