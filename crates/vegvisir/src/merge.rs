//! Shard consolidation.
//!
//! Two merge strategies exist. Index-manifest layouts are merged in memory:
//! the index pins which parameter lives in which shard, so the mapping is
//! rebuilt cheaply and nothing is persisted. Bare numbered shards carry no
//! such map; their merge concatenates shared parameters along the leading
//! dimension and the result is written back into the component directory as
//! a durable cache, `combined_<dir>.safetensors`, reused by later calls.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::anyhow;

use crate::error::{Result, VegvisirError};
use crate::shards::ShardMarker;
use crate::weights::{TensorData, WeightMapping};

/// Name of the persisted consolidation artifact for a component directory.
pub fn combined_file_name(dir: &Path) -> String {
    let component = dir
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("component");
    format!("combined_{component}.safetensors")
}

/// Builds a weight mapping from an index-manifest layout.
///
/// Every referenced shard is loaded, and only the keys the index names are
/// copied into the result.
pub fn from_index(
    dir: &Path,
    index_path: &Path,
    weight_map: &BTreeMap<String, String>,
) -> Result<WeightMapping> {
    let mut shard_files: Vec<&String> = weight_map.values().collect();
    shard_files.sort();
    shard_files.dedup();

    log::info!(
        "merging {} indexed shards ({} tensors) from {:?}",
        shard_files.len(),
        weight_map.len(),
        dir.file_name().unwrap_or_default()
    );

    let mut merged = WeightMapping::new();
    for file_name in shard_files {
        let shard_path = dir.join(file_name);
        let mut shard = WeightMapping::from_file_filtered(&shard_path, |name| {
            weight_map.get(name).is_some_and(|f| f == file_name)
        })?;

        for (key, mapped_file) in weight_map {
            if mapped_file != file_name {
                continue;
            }
            let tensor = shard.remove(key).ok_or_else(|| VegvisirError::LoadFailed {
                path: shard_path.clone(),
                source: anyhow!(
                    "tensor '{}' is listed in {:?} but missing from its shard",
                    key,
                    index_path.file_name().unwrap_or_default()
                ),
            })?;
            merged.insert(key.clone(), tensor);
        }
    }

    Ok(merged)
}

/// Consolidates bare numbered shards into one persisted file.
///
/// Shared parameter keys are concatenated along their leading dimension;
/// keys whose shapes are incompatible across shards are skipped with a
/// warning, so the result may be a partial reconstruction. The write happens
/// at most once per directory: an existing combined file is reused without
/// recomputation.
pub fn consolidate(dir: &Path, shards: &[(ShardMarker, PathBuf)]) -> Result<PathBuf> {
    let combined = dir.join(combined_file_name(dir));
    if combined.is_file() {
        log::debug!("reusing consolidated shards at {:?}", combined);
        return Ok(combined);
    }

    log::info!(
        "consolidating {} shards in {:?}",
        shards.len(),
        dir.file_name().unwrap_or_default()
    );

    let mut maps = Vec::with_capacity(shards.len());
    for (_, path) in shards {
        maps.push(WeightMapping::from_file(path)?);
    }

    let keys: Vec<String> = {
        let mut keys: Vec<String> = maps
            .iter()
            .flat_map(|m| m.names().map(str::to_string))
            .collect();
        keys.sort();
        keys.dedup();
        keys
    };

    let mut merged = WeightMapping::new();
    for key in keys {
        let parts: Vec<TensorData> = maps.iter_mut().filter_map(|m| m.remove(&key)).collect();
        match concat_leading(parts)? {
            Some(tensor) => merged.insert(key, tensor),
            None => log::warn!(
                "skipping '{}': shard shapes are incompatible, merge continues without it",
                key
            ),
        }
    }

    merged.save(&combined)?;
    log::info!("wrote consolidated artifact {:?}", combined);
    Ok(combined)
}

/// Concatenates tensors along the leading dimension. All parts must share
/// the dtype and every trailing dimension; a single part passes through
/// unchanged. Returns `Ok(None)` on any shape or dtype mismatch.
fn concat_leading(mut parts: Vec<TensorData>) -> Result<Option<TensorData>> {
    if parts.len() <= 1 {
        return Ok(parts.pop());
    }
    let first = &parts[0];
    if first.shape.is_empty() {
        return Ok(None);
    }

    let dtype = first.dtype;
    let trailing = first.shape[1..].to_vec();
    if !parts
        .iter()
        .all(|t| t.dtype == dtype && t.shape.len() == trailing.len() + 1 && t.shape[1..] == trailing[..])
    {
        return Ok(None);
    }

    let leading: usize = parts.iter().map(|t| t.shape[0]).sum();
    let mut shape = Vec::with_capacity(trailing.len() + 1);
    shape.push(leading);
    shape.extend_from_slice(&trailing);

    let total_bytes: usize = parts.iter().map(|t| t.data.len()).sum();
    let mut data = Vec::new();
    data.try_reserve_exact(total_bytes)
        .map_err(|_| VegvisirError::OutOfMemory { wanted: total_bytes })?;
    for part in &parts {
        data.extend_from_slice(&part.data);
    }

    Ok(Some(TensorData { dtype, shape, data }))
}
