//! Parsing of the `model_index.json` manifest.
//!
//! The manifest declares the pipeline class a model directory was exported
//! from and which named components it carries. Component entries are
//! two-element `[library, class]` arrays; an entry of `null` (or a pair of
//! nulls) means the component slot exists in the schema but is absent from
//! this export, so it does not count as present.

use std::collections::BTreeSet;
use std::path::Path;

use serde_json::Value;

use crate::error::{Result, VegvisirError};

/// File name that marks a directory as one model's root.
pub const MANIFEST_FILE: &str = "model_index.json";

/// Parsed `model_index.json`.
#[derive(Debug, Clone)]
pub struct ModelIndex {
    /// Declared pipeline class name (`_class_name`).
    pub class_name: String,
    /// Component keys declared present (non-underscore, non-null entries).
    pub components: BTreeSet<String>,
    /// The `requires_safety_checker` flag, when declared.
    pub requires_safety_checker: Option<bool>,
}

impl ModelIndex {
    /// Loads the manifest from a model directory. Returns `Ok(None)` when
    /// the directory has no manifest file.
    pub fn load(dir: &Path) -> Result<Option<Self>> {
        let path = dir.join(MANIFEST_FILE);
        if !path.is_file() {
            return Ok(None);
        }
        Self::parse(&path).map(Some)
    }

    /// Parses a manifest file.
    pub fn parse(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| VegvisirError::io(path, e))?;
        let json: Value =
            serde_json::from_str(&content).map_err(|e| VegvisirError::Manifest {
                path: path.to_path_buf(),
                source: e,
            })?;

        let class_name = json
            .get("_class_name")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();

        let mut components = BTreeSet::new();
        if let Some(object) = json.as_object() {
            for (key, value) in object {
                if key.starts_with('_') {
                    continue;
                }
                if component_declared(value) {
                    components.insert(key.clone());
                }
            }
        }

        let requires_safety_checker = json
            .get("requires_safety_checker")
            .and_then(Value::as_bool);

        Ok(Self {
            class_name,
            components,
            requires_safety_checker,
        })
    }

    /// Whether the manifest declares the given component.
    pub fn has_component(&self, key: &str) -> bool {
        self.components.contains(key)
    }
}

fn component_declared(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Array(entries) => entries.iter().any(|v| !v.is_null()),
        _ => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::write_manifest;

    #[test]
    fn test_parse_components_and_flags() {
        let dir = tempfile::tempdir().unwrap();
        write_manifest(
            dir.path(),
            serde_json::json!({
                "_class_name": "StableDiffusionPipeline",
                "_diffusers_version": "0.21.0",
                "text_encoder": ["transformers", "CLIPTextModel"],
                "unet": ["diffusers", "UNet2DConditionModel"],
                "vae": ["diffusers", "AutoencoderKL"],
                "scheduler": ["diffusers", "PNDMScheduler"],
                "tokenizer": ["transformers", "CLIPTokenizer"],
                "feature_extractor": [null, null],
                "requires_safety_checker": true
            }),
        );

        let index = ModelIndex::load(dir.path()).unwrap().unwrap();
        assert_eq!(index.class_name, "StableDiffusionPipeline");
        assert!(index.has_component("unet"));
        assert!(index.has_component("text_encoder"));
        // null-pair entries are schema slots, not present components
        assert!(!index.has_component("feature_extractor"));
        // underscore keys are metadata, never components
        assert!(!index.has_component("_diffusers_version"));
        assert_eq!(index.requires_safety_checker, Some(true));
    }

    #[test]
    fn test_missing_manifest_is_none() {
        let dir = tempfile::tempdir().unwrap();
        assert!(ModelIndex::load(dir.path()).unwrap().is_none());
    }

    #[test]
    fn test_malformed_manifest_errors() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(MANIFEST_FILE), b"{ not json").unwrap();

        let result = ModelIndex::load(dir.path());
        assert!(matches!(result, Err(VegvisirError::Manifest { .. })));
    }
}
