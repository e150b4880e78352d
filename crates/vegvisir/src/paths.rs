//! Models-root configuration and model-directory discovery.

use std::path::{Path, PathBuf};

use walkdir::WalkDir;

use crate::error::{Result, VegvisirError};
use crate::manifest::{ModelIndex, MANIFEST_FILE};

/// Environment variable overriding the models root.
pub const MODELS_DIR_ENV: &str = "VEGVISIR_MODELS_DIR";

/// Component subdirectories the scan never descends into. A model's root is
/// recognized by its manifest; its component directories can hold thousands
/// of files and never contain nested models.
pub const COMPONENT_DIRS: &[&str] = &[
    "unet",
    "transformer",
    "vae",
    "vae_approx",
    "text_encoder",
    "text_encoder_2",
    "text_encoder_3",
    "tokenizer",
    "tokenizer_2",
    "tokenizer_3",
    "scheduler",
    "safety_checker",
    "feature_extractor",
    "embeddings",
];

/// The configured directory tree that holds model directories.
#[derive(Debug, Clone)]
pub struct ModelsRoot {
    path: PathBuf,
}

impl ModelsRoot {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Reads the root from `VEGVISIR_MODELS_DIR`.
    pub fn from_env() -> Option<Self> {
        std::env::var_os(MODELS_DIR_ENV).map(|dir| Self::new(PathBuf::from(dir)))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Finds every model directory under the root.
    ///
    /// A directory counts as a model directory when it contains
    /// `model_index.json`. The walk follows symlinks and prunes descent into
    /// [`COMPONENT_DIRS`]; results are sorted by relative name.
    pub fn scan(&self) -> Result<Vec<ModelDirectory>> {
        if !self.path.is_dir() {
            return Err(VegvisirError::DirectoryNotFound {
                path: self.path.clone(),
            });
        }

        let mut models = Vec::new();
        let walker = WalkDir::new(&self.path)
            .follow_links(true)
            .into_iter()
            .filter_entry(|entry| {
                !(entry.file_type().is_dir()
                    && entry.depth() > 0
                    && entry
                        .file_name()
                        .to_str()
                        .is_some_and(|name| COMPONENT_DIRS.contains(&name)))
            });

        for entry in walker {
            let entry = entry.map_err(|e| {
                let path = e
                    .path()
                    .map(Path::to_path_buf)
                    .unwrap_or_else(|| self.path.clone());
                match e.into_io_error() {
                    Some(io) => VegvisirError::io(path, io),
                    None => VegvisirError::DirectoryNotFound { path },
                }
            })?;

            if entry.file_type().is_dir() && entry.path().join(MANIFEST_FILE).is_file() {
                let path = entry.path().to_path_buf();
                let name = path
                    .strip_prefix(&self.path)
                    .unwrap_or(&path)
                    .to_string_lossy()
                    .into_owned();
                models.push(ModelDirectory { path, name });
            }
        }

        models.sort_by(|a, b| a.name.cmp(&b.name));
        log::info!(
            "found {} model directories under {:?}",
            models.len(),
            self.path
        );
        Ok(models)
    }
}

/// One discovered model directory.
#[derive(Debug, Clone)]
pub struct ModelDirectory {
    path: PathBuf,
    name: String,
}

impl ModelDirectory {
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Root-relative display name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Parses this directory's manifest, if it still exists.
    pub fn manifest(&self) -> Result<Option<ModelIndex>> {
        ModelIndex::load(&self.path)
    }
}
