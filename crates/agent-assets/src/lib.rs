// SPDX-License-Identifier: MIT OR Apache-2.0
//! agent-assets
#![deny(unsafe_code)]
#![warn(missing_docs)]
//!
//! Materialises a model or LoRA [`AssetRef`] onto local disk as a
//! human-meaningful, collision-free filename the renderer can open.
//!
//! Each target directory (`<base_models>/`, `<loras>/`) holds the visible
//! names plus a `cache/` subdirectory of the real bytes. Visible names are
//! symlinks into `cache/` where the filesystem supports it, and plain files
//! (with `cache_path == link_path`) where it doesn't.

use agent_core::{AssetRef, ResolvedAsset};
use agent_error::{AgentError, ReasonCode};
use sha1::{Digest, Sha1};
use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use thiserror::Error;

/// Extension applied when a name has none of its own.
pub const DEFAULT_EXTENSION: &str = ".safetensors";

/// Failures raised while resolving or materialising an asset.
#[derive(Debug, Error)]
pub enum AssetError {
    /// A filesystem operation on `path` failed.
    #[error("asset io error at {path}: {source}")]
    Io {
        /// Path the operation was acting on.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: io::Error,
    },
    /// The caller's `ensure_cached` callback failed to populate the cache file.
    #[error("failed to populate cache: {0}")]
    Fetch(String),
    /// Symbolic links are required but unsupported on this platform.
    #[error("symbolic links are unsupported on this platform")]
    UnsupportedPlatform,
}

impl From<AssetError> for AgentError {
    fn from(err: AssetError) -> Self {
        let message = err.to_string();
        AgentError::new(ReasonCode::SystemError, message).with_source(err)
    }
}

/// Strip directory components, mirroring `os.path.basename`.
#[must_use]
pub fn normalize_name(name: &str) -> String {
    Path::new(name.trim())
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or_default()
        .to_string()
}

/// Ensure `name` carries a suffix, defaulting the stem to `"model"` when empty.
#[must_use]
pub fn ensure_extension(name: &str, fallback: &str) -> String {
    let normalized = normalize_name(name);
    let candidate = Path::new(&normalized);
    let suffix = candidate
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| format!(".{e}"))
        .unwrap_or_else(|| fallback.to_string());
    let stem = candidate
        .file_stem()
        .and_then(|s| s.to_str())
        .filter(|s| !s.is_empty())
        .unwrap_or("model");
    format!("{stem}{suffix}")
}

/// Prefer `display_name`, falling back to `fallback_name`, then `"model"`.
#[must_use]
pub fn derive_pretty_name(display_name: Option<&str>, fallback_name: &str, default_suffix: &str) -> String {
    let preferred = display_name
        .map(normalize_name)
        .filter(|s| !s.is_empty());
    let base = preferred.unwrap_or_else(|| normalize_name(fallback_name));
    let base = if base.is_empty() { "model".to_string() } else { base };
    ensure_extension(&base, default_suffix)
}

/// First `length` hex characters of the SHA-1 digest of `source`.
#[must_use]
pub fn build_collision_suffix(source: &str, length: usize) -> String {
    let mut hasher = Sha1::new();
    hasher.update(source.as_bytes());
    let digest = hasher.finalize();
    let hex: String = digest.iter().map(|b| format!("{b:02x}")).collect();
    hex[..length.min(hex.len())].to_string()
}

/// Derive the display name for an asset: `displayName` > `originalName` >
/// object-store metadata (`original-name`, `original_name`, `display-name`) >
/// the key's basename.
#[must_use]
pub fn derive_display_name(asset: &AssetRef, object_store_metadata: &BTreeMap<String, String>) -> String {
    let preferred = asset
        .display_name
        .as_deref()
        .filter(|s| !s.trim().is_empty())
        .or_else(|| asset.original_name.as_deref().filter(|s| !s.trim().is_empty()))
        .map(str::to_string)
        .or_else(|| {
            ["original-name", "original_name", "display-name"]
                .iter()
                .find_map(|key| object_store_metadata.get(*key))
                .filter(|s| !s.trim().is_empty())
                .cloned()
        });
    derive_pretty_name(preferred.as_deref(), &asset.key, DEFAULT_EXTENSION)
}

/// Cache filename for an asset, derived from its source key rather than its
/// display name — the cache's identity is the bytes, not the visible label.
fn cache_file_name(asset: &AssetRef) -> String {
    ensure_extension(&normalize_name(&asset.key), DEFAULT_EXTENSION)
}

fn cache_dir_for(visible_dir: &Path) -> PathBuf {
    visible_dir.join("cache")
}

fn append_collision_suffix(name: &str, seed: &str) -> String {
    let path = Path::new(name);
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| format!(".{e}"))
        .unwrap_or_default();
    let stem = path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or(name);
    format!("{stem}__{}{ext}", build_collision_suffix(seed, 6))
}

fn split_stem_ext(name: &str) -> (&str, String) {
    let path = Path::new(name);
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| format!(".{e}"))
        .unwrap_or_else(|| DEFAULT_EXTENSION.to_string());
    let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or(name);
    (stem, ext)
}

fn per_job_lora_name(base_display: &str, owner_slug: &str, job6: &str) -> String {
    let (stem, ext) = split_stem_ext(base_display);
    format!("{stem}__{owner_slug}__{job6}{ext}")
}

fn dedupe_against_used(name: &str, used: &HashSet<String>, job_id: &str, index: usize) -> String {
    if !used.contains(name) {
        return name.to_string();
    }
    let mut counter = 1u32;
    loop {
        let seed = format!("{job_id}:{index}:{counter}");
        let candidate = append_collision_suffix(name, &seed);
        if !used.contains(&candidate) {
            return candidate;
        }
        counter += 1;
    }
}

/// Sanitise a username into a filename-safe, lowercase, hyphenated slug.
#[must_use]
pub fn sanitize_owner_slug(username: &str) -> String {
    let mut slug = String::new();
    let mut pending_sep = false;
    for ch in username.trim().to_lowercase().chars() {
        if ch.is_ascii_alphanumeric() {
            if pending_sep && !slug.is_empty() {
                slug.push('-');
            }
            pending_sep = false;
            slug.push(ch);
        } else {
            pending_sep = true;
        }
    }
    if slug.is_empty() { "user".to_string() } else { slug }
}

fn move_file(src: &Path, dst: &Path) -> Result<(), AssetError> {
    if let Some(parent) = dst.parent() {
        fs::create_dir_all(parent).map_err(|source| AssetError::Io { path: parent.to_path_buf(), source })?;
    }
    match fs::rename(src, dst) {
        Ok(()) => Ok(()),
        Err(_) => {
            fs::copy(src, dst).map_err(|source| AssetError::Io { path: dst.to_path_buf(), source })?;
            fs::remove_file(src).map_err(|source| AssetError::Io { path: src.to_path_buf(), source })?;
            Ok(())
        }
    }
}

fn migrate_legacy_cache(cache_dir: &Path, cache_name: &str) -> Result<(), AssetError> {
    let normalized_path = cache_dir.join(cache_name);
    if normalized_path.exists() {
        return Ok(());
    }
    if let Some(stem) = Path::new(cache_name).file_stem().and_then(|s| s.to_str()) {
        let legacy_path = cache_dir.join(stem);
        if legacy_path.is_file() {
            tracing::info!(target: "agent.assets", from = %legacy_path.display(), to = %normalized_path.display(), "migrating legacy cache file");
            move_file(&legacy_path, &normalized_path)?;
        }
    }
    Ok(())
}

#[cfg(unix)]
fn create_symlink_file(target: &Path, link: &Path) -> Result<(), AssetError> {
    std::os::unix::fs::symlink(target, link).map_err(|source| AssetError::Io { path: link.to_path_buf(), source })
}

#[cfg(not(unix))]
fn create_symlink_file(_target: &Path, _link: &Path) -> Result<(), AssetError> {
    Err(AssetError::UnsupportedPlatform)
}

fn points_to_same_target(existing: &Path, target: &Path, base: &Path) -> bool {
    let existing_abs = if existing.is_absolute() { existing.to_path_buf() } else { base.join(existing) };
    let norm = |p: &Path| p.canonicalize().unwrap_or_else(|_| p.to_path_buf());
    norm(&existing_abs) == norm(target)
}

fn create_symlink(
    visible_dir: &Path,
    desired_name: &str,
    target: &Path,
    collision_seed: &str,
    force_replace: bool,
) -> Result<(PathBuf, bool), AssetError> {
    if force_replace {
        let link_path = visible_dir.join(desired_name);
        match fs::symlink_metadata(&link_path) {
            Ok(meta) if meta.file_type().is_symlink() => {
                if let Ok(existing) = fs::read_link(&link_path) {
                    if points_to_same_target(&existing, target, visible_dir) {
                        return Ok((link_path, false));
                    }
                }
                fs::remove_file(&link_path).map_err(|source| AssetError::Io { path: link_path.clone(), source })?;
            }
            Ok(_) => {
                fs::remove_file(&link_path).map_err(|source| AssetError::Io { path: link_path.clone(), source })?;
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(source) => return Err(AssetError::Io { path: link_path, source }),
        }
        create_symlink_file(target, &link_path)?;
        return Ok((link_path, true));
    }

    let mut attempt = 0u32;
    loop {
        let candidate_name = if attempt == 0 {
            desired_name.to_string()
        } else {
            append_collision_suffix(desired_name, &format!("{collision_seed}#{attempt}"))
        };
        let link_path = visible_dir.join(&candidate_name);
        match fs::symlink_metadata(&link_path) {
            Ok(meta) if meta.file_type().is_symlink() => {
                let existing = fs::read_link(&link_path).map_err(|source| AssetError::Io { path: link_path.clone(), source })?;
                if points_to_same_target(&existing, target, visible_dir) {
                    return Ok((link_path, false));
                }
                attempt += 1;
            }
            Ok(_) => {
                attempt += 1;
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                create_symlink_file(target, &link_path)?;
                return Ok((link_path, true));
            }
            Err(source) => return Err(AssetError::Io { path: link_path, source }),
        }
    }
}

/// Caches, per canonicalised directory, whether symlinks are supported there.
#[derive(Debug, Default)]
struct SymlinkSupport {
    cache: Mutex<BTreeMap<PathBuf, bool>>,
}

impl SymlinkSupport {
    fn probe(&self, dir: &Path) -> Result<bool, AssetError> {
        fs::create_dir_all(dir).map_err(|source| AssetError::Io { path: dir.to_path_buf(), source })?;
        let key = dir.canonicalize().unwrap_or_else(|_| dir.to_path_buf());
        if let Some(supported) = self.cache.lock().expect("symlink support cache lock poisoned").get(&key) {
            return Ok(*supported);
        }
        let supported = probe_symlink_support(dir)?;
        self.cache
            .lock()
            .expect("symlink support cache lock poisoned")
            .insert(key, supported);
        Ok(supported)
    }
}

#[cfg(unix)]
fn probe_symlink_support(dir: &Path) -> Result<bool, AssetError> {
    let probe_target = dir.join(".agent-assets-probe-target");
    let probe_link = dir.join(".agent-assets-probe-link");
    let _ = fs::remove_file(&probe_link);
    let _ = fs::remove_file(&probe_target);
    fs::write(&probe_target, b"probe").map_err(|source| AssetError::Io { path: probe_target.clone(), source })?;
    let supported = std::os::unix::fs::symlink(&probe_target, &probe_link).is_ok();
    let _ = fs::remove_file(&probe_link);
    let _ = fs::remove_file(&probe_target);
    Ok(supported)
}

#[cfg(not(unix))]
fn probe_symlink_support(_dir: &Path) -> Result<bool, AssetError> {
    Ok(false)
}

/// Per-LoRA context needed for per-job naming and the primary-LoRA override.
pub struct LoraContext<'a> {
    /// Username of the job's owner, sanitised into the visible filename.
    pub owner_username: &'a str,
    /// Job id, hashed into the visible filename for uniqueness.
    pub job_id: &'a str,
    /// Position of this LoRA within the envelope's `loras` list.
    pub index: usize,
    /// Explicit name override for the primary (`index == 0`) LoRA.
    pub primary_override: Option<&'a str>,
    /// Visible names already claimed by earlier LoRAs in this job.
    pub used_visible_names: &'a mut HashSet<String>,
}

/// Materialises [`AssetRef`]s onto local disk under a collision-safe name.
#[derive(Debug, Default)]
pub struct AssetResolver {
    symlink_support: SymlinkSupport,
}

impl AssetResolver {
    /// Create a resolver with an empty symlink-support cache.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolve a base model: `display_name` derived purely from asset
    /// metadata, no per-job suffixing.
    ///
    /// `ensure_cached` is invoked with the cache path only when the cache
    /// file does not already exist; it is responsible for populating it.
    ///
    /// # Errors
    ///
    /// Returns [`AssetError`] on any filesystem failure, or if
    /// `ensure_cached` fails to populate the cache file.
    pub fn resolve_model(
        &self,
        asset: &AssetRef,
        object_store_metadata: &BTreeMap<String, String>,
        visible_dir: &Path,
        ensure_cached: impl FnMut(&Path) -> Result<(), AssetError>,
    ) -> Result<ResolvedAsset, AssetError> {
        let display_name = derive_display_name(asset, object_store_metadata);
        let cache_name = cache_file_name(asset);
        let (cache_path, link_path, downloaded, link_created) = self.materialize(
            visible_dir,
            &display_name,
            &cache_name,
            &asset.key,
            false,
            ensure_cached,
        )?;
        Ok(ResolvedAsset {
            asset: asset.clone(),
            cache_path,
            display_name,
            link_path,
            downloaded,
            link_created,
        })
    }

    /// Resolve a LoRA: same name derivation as a model, plus the primary-LoRA
    /// override and the owner/job-id per-job suffixing.
    ///
    /// # Errors
    ///
    /// Returns [`AssetError`] on any filesystem failure, or if
    /// `ensure_cached` fails to populate the cache file.
    pub fn resolve_lora(
        &self,
        asset: &AssetRef,
        object_store_metadata: &BTreeMap<String, String>,
        visible_dir: &Path,
        ensure_cached: impl FnMut(&Path) -> Result<(), AssetError>,
        ctx: LoraContext<'_>,
    ) -> Result<ResolvedAsset, AssetError> {
        let is_primary = ctx.index == 0;
        let (base_display, force_replace) = match (is_primary, ctx.primary_override) {
            (true, Some(override_name)) if !override_name.trim().is_empty() => {
                (derive_pretty_name(Some(override_name), &asset.key, DEFAULT_EXTENSION), true)
            }
            _ => (derive_display_name(asset, object_store_metadata), false),
        };

        let owner_slug = sanitize_owner_slug(ctx.owner_username);
        let job6 = build_collision_suffix(ctx.job_id, 6);
        let per_job_name = per_job_lora_name(&base_display, &owner_slug, &job6);
        let final_name = dedupe_against_used(&per_job_name, ctx.used_visible_names, ctx.job_id, ctx.index);
        ctx.used_visible_names.insert(final_name.clone());

        let cache_name = cache_file_name(asset);
        let (cache_path, link_path, downloaded, link_created) = self.materialize(
            visible_dir,
            &final_name,
            &cache_name,
            &asset.key,
            force_replace,
            ensure_cached,
        )?;
        Ok(ResolvedAsset {
            asset: asset.clone(),
            cache_path,
            display_name: final_name,
            link_path,
            downloaded,
            link_created,
        })
    }

    fn materialize(
        &self,
        visible_dir: &Path,
        desired_visible_name: &str,
        cache_name: &str,
        collision_seed: &str,
        force_replace: bool,
        mut ensure_cached: impl FnMut(&Path) -> Result<(), AssetError>,
    ) -> Result<(PathBuf, PathBuf, bool, bool), AssetError> {
        fs::create_dir_all(visible_dir).map_err(|source| AssetError::Io { path: visible_dir.to_path_buf(), source })?;
        let cache_dir = cache_dir_for(visible_dir);
        fs::create_dir_all(&cache_dir).map_err(|source| AssetError::Io { path: cache_dir.clone(), source })?;
        let cache_path = cache_dir.join(cache_name);
        migrate_legacy_cache(&cache_dir, cache_name)?;

        let supports_symlink = self.symlink_support.probe(visible_dir)?;

        if !supports_symlink {
            let link_path = visible_dir.join(desired_visible_name);
            if link_path.exists() && !force_replace {
                return Ok((link_path.clone(), link_path, false, false));
            }
            let downloaded = if cache_path.exists() {
                false
            } else {
                ensure_cached(&cache_path)?;
                true
            };
            if force_replace && link_path.exists() {
                fs::remove_file(&link_path).map_err(|source| AssetError::Io { path: link_path.clone(), source })?;
            }
            if cache_path.exists() {
                move_file(&cache_path, &link_path)?;
            }
            return Ok((link_path.clone(), link_path, downloaded, true));
        }

        let downloaded = if cache_path.exists() {
            false
        } else {
            ensure_cached(&cache_path)?;
            true
        };
        let (link_path, link_created) =
            create_symlink(visible_dir, desired_visible_name, &cache_path, collision_seed, force_replace)?;
        Ok((cache_path, link_path, downloaded, link_created))
    }
}
