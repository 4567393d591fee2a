//! Bridges the synchronous [`agent_assets::AssetResolver`] (filesystem
//! naming/symlink logic) with the async [`agent_objectstore::ObjectStoreClient`]
//! download it drives on a cache miss.
//!
//! `AssetResolver::resolve_model`/`resolve_lora` are synchronous — they
//! decide whether a download is needed and, if so, invoke a blocking
//! closure to perform it. Since that decision also touches the
//! filesystem, the whole resolution runs on a blocking-pool thread; the
//! closure hands back into the async runtime with `Handle::block_on` to
//! run the actual network download.

use agent_assets::{AssetError, AssetResolver, LoraContext};
use agent_core::{AssetRef, ResolvedAsset};
use agent_objectstore::ObjectStoreClient;
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

fn map_store_error(err: agent_objectstore::ObjectStoreError) -> AssetError {
    AssetError::Fetch(err.to_string())
}

/// Materialise a base model checkpoint.
pub async fn resolve_model(
    resolver: Arc<AssetResolver>,
    client: ObjectStoreClient,
    asset: AssetRef,
    object_store_metadata: BTreeMap<String, String>,
    visible_dir: PathBuf,
) -> Result<ResolvedAsset, AssetError> {
    let handle = tokio::runtime::Handle::current();
    tokio::task::spawn_blocking(move || {
        resolver.resolve_model(&asset, &object_store_metadata, &visible_dir, |cache_path: &Path| {
            handle
                .block_on(client.download_to_path(&asset.bucket, &asset.key, cache_path))
                .map_err(map_store_error)
        })
    })
    .await
    .expect("asset resolution task panicked")
}

/// Materialise one LoRA, applying per-job naming and the primary-LoRA
/// override. `used_visible_names` tracks names already claimed by
/// earlier LoRAs in the same job and must be threaded sequentially.
#[allow(clippy::too_many_arguments)]
pub async fn resolve_lora(
    resolver: Arc<AssetResolver>,
    client: ObjectStoreClient,
    asset: AssetRef,
    object_store_metadata: BTreeMap<String, String>,
    visible_dir: PathBuf,
    owner_username: String,
    job_id: String,
    index: usize,
    primary_override: Option<String>,
    mut used_visible_names: HashSet<String>,
) -> Result<(ResolvedAsset, HashSet<String>), AssetError> {
    let handle = tokio::runtime::Handle::current();
    let result = tokio::task::spawn_blocking(move || {
        let outcome = resolver.resolve_lora(
            &asset,
            &object_store_metadata,
            &visible_dir,
            |cache_path: &Path| {
                handle
                    .block_on(client.download_to_path(&asset.bucket, &asset.key, cache_path))
                    .map_err(map_store_error)
            },
            LoraContext {
                owner_username: &owner_username,
                job_id: &job_id,
                index,
                primary_override: primary_override.as_deref(),
                used_visible_names: &mut used_visible_names,
            },
        );
        (outcome, used_visible_names)
    })
    .await
    .expect("asset resolution task panicked");

    let (outcome, used_visible_names) = result;
    outcome.map(|resolved| (resolved, used_visible_names))
}
