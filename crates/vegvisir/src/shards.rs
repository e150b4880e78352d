//! Shard layout detection and component resolution.
//!
//! A weight component directory holds one of three layouts:
//!
//! - a single weight file,
//! - numbered shard files plus a `*.safetensors.index.json` mapping parameter
//!   names to shard files,
//! - bare numbered shard files with no index.
//!
//! [`resolve_component`] turns a directory plus a [`ShardSelection`] into an
//! [`Artifact`] the external loader can consume.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::{Result, VegvisirError};
use crate::merge;
use crate::weights::WeightMapping;

/// File extensions recognized as weight containers.
pub const WEIGHT_EXTENSIONS: &[&str] = &["safetensors", "bin"];

const INDEX_SUFFIX: &str = ".safetensors.index.json";

/// Which portion of a sharded component to resolve.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShardSelection {
    /// The whole component, consolidating shards when necessary.
    All,
    /// A single 1-based shard.
    Part(usize),
}

/// The `k-of-n` marker embedded in a shard file name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShardMarker {
    pub part: usize,
    pub total: usize,
}

/// Parses a `k-of-n` marker out of a weight file name, e.g.
/// `model-00001-of-00002.safetensors`.
pub fn shard_marker(file_name: &str) -> Option<ShardMarker> {
    let stem = file_name.split('.').next()?;
    let tokens: Vec<&str> = stem.split(['-', '_']).collect();

    for window in tokens.windows(3) {
        if window[1] != "of" {
            continue;
        }
        let (part, total) = match (window[0].parse(), window[2].parse()) {
            (Ok(p), Ok(t)) => (p, t),
            _ => continue,
        };
        if part >= 1 && part <= total {
            return Some(ShardMarker { part, total });
        }
    }
    None
}

/// Detected layout of one component directory.
#[derive(Debug)]
pub enum ComponentLayout {
    /// Exactly one usable weight file.
    Single(PathBuf),

    /// Shards described by an index manifest.
    Indexed {
        index_path: PathBuf,
        /// Parameter name to shard file name.
        weight_map: BTreeMap<String, String>,
    },

    /// Numbered shards with no index, ordered by part.
    Bare { shards: Vec<(ShardMarker, PathBuf)> },
}

impl ComponentLayout {
    /// The file whose content hash identifies this layout for the load
    /// cache: the weight file itself, or the index manifest for indexed
    /// layouts. Bare layouts are identified by their consolidated artifact.
    pub fn cache_source(&self) -> Option<&Path> {
        match self {
            Self::Single(path) => Some(path),
            Self::Indexed { index_path, .. } => Some(index_path),
            Self::Bare { .. } => None,
        }
    }
}

fn is_weight_file(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| WEIGHT_EXTENSIONS.contains(&ext))
}

/// Inspects a component directory and determines its shard layout.
pub fn detect_layout(dir: &Path) -> Result<ComponentLayout> {
    if !dir.is_dir() {
        return Err(VegvisirError::DirectoryNotFound {
            path: dir.to_path_buf(),
        });
    }

    let mut weight_files = Vec::new();
    let mut index_path = None;

    let entries = std::fs::read_dir(dir).map_err(|e| VegvisirError::io(dir, e))?;
    for entry in entries {
        let entry = entry.map_err(|e| VegvisirError::io(dir, e))?;
        let path = entry.path();
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };

        if name.ends_with(INDEX_SUFFIX) {
            index_path = Some(path);
        } else if path.is_file() && is_weight_file(&path) {
            weight_files.push(path);
        }
    }
    weight_files.sort();

    if let Some(index_path) = index_path {
        let weight_map = parse_index(&index_path)?;
        return Ok(ComponentLayout::Indexed {
            index_path,
            weight_map,
        });
    }

    let mut shards: Vec<(ShardMarker, PathBuf)> = weight_files
        .iter()
        .filter_map(|path| {
            let name = path.file_name()?.to_str()?;
            shard_marker(name).map(|marker| (marker, path.clone()))
        })
        .collect();

    if shards.len() >= 2 {
        shards.sort_by_key(|(marker, _)| marker.part);
        return Ok(ComponentLayout::Bare { shards });
    }

    if weight_files.len() > 1 {
        log::debug!(
            "{:?} holds {} weight files without shard markers, using the first",
            dir.file_name().unwrap_or_default(),
            weight_files.len()
        );
    }
    match weight_files.into_iter().next() {
        Some(single) => Ok(ComponentLayout::Single(single)),
        None => Err(VegvisirError::NoWeightFile {
            dir: dir.to_path_buf(),
        }),
    }
}

/// On-disk shape of a `*.safetensors.index.json` file. Extra fields such as
/// `metadata` are ignored.
#[derive(Debug, Deserialize)]
struct ShardIndexFile {
    weight_map: BTreeMap<String, String>,
}

fn parse_index(path: &Path) -> Result<BTreeMap<String, String>> {
    let content = std::fs::read_to_string(path).map_err(|e| VegvisirError::io(path, e))?;
    let index: ShardIndexFile =
        serde_json::from_str(&content).map_err(|e| VegvisirError::ShardIndex {
            path: path.to_path_buf(),
            source: e,
        })?;
    Ok(index.weight_map)
}

/// A resolved component artifact: either a file the external loader reads
/// itself, or an already-merged weight mapping.
#[derive(Debug)]
pub enum Artifact {
    File(PathBuf),
    Weights(WeightMapping),
}

impl Artifact {
    pub fn file_path(&self) -> Option<&Path> {
        match self {
            Self::File(path) => Some(path),
            Self::Weights(_) => None,
        }
    }

    pub fn weights(&self) -> Option<&WeightMapping> {
        match self {
            Self::File(_) => None,
            Self::Weights(weights) => Some(weights),
        }
    }
}

/// Resolves a component directory to an artifact.
pub fn resolve_component(dir: &Path, selection: ShardSelection) -> Result<Artifact> {
    let layout = detect_layout(dir)?;
    resolve_layout(dir, &layout, selection)
}

/// Resolves an already-detected layout.
pub fn resolve_layout(
    dir: &Path,
    layout: &ComponentLayout,
    selection: ShardSelection,
) -> Result<Artifact> {
    match layout {
        // A single file satisfies every selection.
        ComponentLayout::Single(path) => Ok(Artifact::File(path.clone())),

        ComponentLayout::Indexed { index_path, weight_map } => match selection {
            ShardSelection::All => {
                let weights = merge::from_index(dir, index_path, weight_map)?;
                Ok(Artifact::Weights(weights))
            }
            ShardSelection::Part(part) => {
                let mut total = 0;
                for file_name in weight_map.values() {
                    let Some(marker) = shard_marker(file_name) else {
                        continue;
                    };
                    total = total.max(marker.total);
                    if marker.part == part {
                        return Ok(Artifact::File(dir.join(file_name)));
                    }
                }
                Err(VegvisirError::ShardNotFound {
                    dir: dir.to_path_buf(),
                    part,
                    total,
                })
            }
        },

        ComponentLayout::Bare { shards } => match selection {
            ShardSelection::All => {
                let combined = merge::consolidate(dir, shards)?;
                Ok(Artifact::File(combined))
            }
            ShardSelection::Part(part) => shards
                .iter()
                .find(|(marker, _)| marker.part == part)
                .map(|(_, path)| Artifact::File(path.clone()))
                .ok_or_else(|| VegvisirError::ShardNotFound {
                    dir: dir.to_path_buf(),
                    part,
                    total: shards.iter().map(|(m, _)| m.total).max().unwrap_or(0),
                }),
        },
    }
}
