//! Model-family tags and the classification rules that assign them.
//!
//! Classification prefers the declarative manifest; directories without one
//! (or whose manifest matches no rule) fall back to folder-shape heuristics.
//! The fallback is inherently ambiguous for families that share a layout, and
//! that ambiguity is reported as a value rather than resolved by guessing.

use std::path::Path;

use strum_macros::EnumIter;

use crate::error::{Result, VegvisirError};
use crate::manifest::ModelIndex;

/// A generative-model architecture family, distinguished by its component
/// set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, EnumIter)]
pub enum ModelFamily {
    /// Stable Diffusion 1.5: single text encoder, UNet backbone.
    Sd15,

    /// Stable Diffusion 2.1: same layout as 1.5, disambiguated by manifest
    /// flags only.
    Sd21,

    /// Stable Diffusion XL: dual text encoders, UNet backbone.
    Sdxl,

    /// Stable Diffusion 3: triple text encoders, transformer backbone.
    Sd3,

    /// AuraFlow: single text encoder, transformer backbone.
    AuraFlow,

    /// Flux: transformer backbone with a sharded second text encoder.
    Flux,
}

impl ModelFamily {
    /// Human-readable display name.
    pub fn display_name(&self) -> &'static str {
        match self {
            Self::Sd15 => "SD 1.5",
            Self::Sd21 => "SD 2.1",
            Self::Sdxl => "SDXL",
            Self::Sd3 => "SD3",
            Self::AuraFlow => "AuraFlow",
            Self::Flux => "Flux",
        }
    }

    /// Subdirectory holding the diffusion backbone weights.
    pub fn diffusion_dir(&self) -> &'static str {
        match self {
            Self::Sd15 | Self::Sd21 | Self::Sdxl => "unet",
            Self::Sd3 | Self::AuraFlow | Self::Flux => "transformer",
        }
    }

    /// Text-encoder subdirectories, in load order.
    pub fn text_encoder_dirs(&self) -> &'static [&'static str] {
        match self {
            Self::Sd15 | Self::Sd21 | Self::AuraFlow => &["text_encoder"],
            Self::Sdxl | Self::Flux => &["text_encoder", "text_encoder_2"],
            Self::Sd3 => &["text_encoder", "text_encoder_2", "text_encoder_3"],
        }
    }

    /// Subdirectories that must exist for this family, beyond the manifest.
    pub fn required_dirs(&self) -> Vec<&'static str> {
        let mut dirs = vec![self.diffusion_dir(), "vae"];
        dirs.extend_from_slice(self.text_encoder_dirs());
        dirs
    }

    /// All known families, in rule-precedence order.
    pub fn all() -> impl Iterator<Item = ModelFamily> {
        use strum::IntoEnumIterator;
        ModelFamily::iter()
    }
}

impl std::fmt::Display for ModelFamily {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.display_name())
    }
}

/// Outcome of classifying a model directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    /// Exactly one family matched.
    Known(ModelFamily),

    /// The folder shape is shared by several families; the caller must
    /// choose one explicitly.
    Ambiguous(&'static [ModelFamily]),
}

impl Classification {
    /// Unwraps the single matching family, failing with
    /// [`VegvisirError::AmbiguousFamily`] otherwise.
    pub fn into_family(self, dir: &Path) -> Result<ModelFamily> {
        match self {
            Self::Known(family) => Ok(family),
            Self::Ambiguous(candidates) => Err(VegvisirError::AmbiguousFamily {
                dir: dir.to_path_buf(),
                candidates,
            }),
        }
    }
}

/// One manifest-matching rule.
///
/// Rules are evaluated in the order they appear in [`FAMILY_CRITERIA`]; the
/// first full match wins. Order therefore encodes precedence among families
/// that share a class name.
#[derive(Debug, Clone, Copy)]
pub struct FamilyCriteria {
    pub family: ModelFamily,
    /// Declared `_class_name` the manifest must carry.
    pub class_name: &'static str,
    /// Component keys that must all be declared.
    pub required: &'static [&'static str],
    /// Component keys that must not be declared.
    pub forbidden: &'static [&'static str],
    /// Expected `requires_safety_checker` value, when it disambiguates.
    pub requires_safety_checker: Option<bool>,
    /// Expected presence of a `feature_extractor` component, when it
    /// disambiguates.
    pub feature_extractor: Option<bool>,
}

impl FamilyCriteria {
    fn matches(&self, index: &ModelIndex) -> bool {
        if index.class_name != self.class_name {
            return false;
        }
        if !self.required.iter().all(|key| index.has_component(key)) {
            return false;
        }
        if self.forbidden.iter().any(|key| index.has_component(key)) {
            return false;
        }
        if let Some(expected) = self.requires_safety_checker {
            if index.requires_safety_checker != Some(expected) {
                return false;
            }
        }
        if let Some(expected) = self.feature_extractor {
            if index.has_component("feature_extractor") != expected {
                return false;
            }
        }
        true
    }
}

/// The ordered rule table. Sd15 precedes Sd21: they share a class name and
/// are told apart by the safety-checker and feature-extractor flags.
pub const FAMILY_CRITERIA: &[FamilyCriteria] = &[
    FamilyCriteria {
        family: ModelFamily::Sd15,
        class_name: "StableDiffusionPipeline",
        required: &["text_encoder", "unet", "vae", "scheduler", "tokenizer"],
        forbidden: &["text_encoder_2"],
        requires_safety_checker: Some(true),
        feature_extractor: Some(false),
    },
    FamilyCriteria {
        family: ModelFamily::Sd21,
        class_name: "StableDiffusionPipeline",
        required: &["text_encoder", "unet", "vae", "scheduler", "tokenizer"],
        forbidden: &["text_encoder_2"],
        requires_safety_checker: Some(false),
        feature_extractor: Some(true),
    },
    FamilyCriteria {
        family: ModelFamily::Sdxl,
        class_name: "StableDiffusionXLPipeline",
        required: &[
            "text_encoder",
            "text_encoder_2",
            "unet",
            "vae",
            "scheduler",
            "tokenizer",
            "tokenizer_2",
        ],
        forbidden: &[],
        requires_safety_checker: None,
        feature_extractor: None,
    },
    FamilyCriteria {
        family: ModelFamily::Sd3,
        class_name: "StableDiffusion3Pipeline",
        required: &[
            "text_encoder",
            "text_encoder_2",
            "text_encoder_3",
            "transformer",
            "vae",
            "scheduler",
            "tokenizer",
            "tokenizer_2",
            "tokenizer_3",
        ],
        forbidden: &[],
        requires_safety_checker: None,
        feature_extractor: None,
    },
    FamilyCriteria {
        family: ModelFamily::AuraFlow,
        class_name: "AuraFlowPipeline",
        required: &["text_encoder", "transformer", "vae", "scheduler", "tokenizer"],
        forbidden: &[],
        requires_safety_checker: None,
        feature_extractor: None,
    },
    FamilyCriteria {
        family: ModelFamily::Flux,
        class_name: "FluxPipeline",
        required: &["text_encoder", "transformer", "vae", "scheduler", "tokenizer"],
        forbidden: &[],
        requires_safety_checker: None,
        feature_extractor: None,
    },
];

/// Classifies a model directory.
///
/// A manifest is consulted first; when it is absent or matches no rule, the
/// folder shape decides. Shapes shared by several families yield
/// [`Classification::Ambiguous`].
pub fn classify(dir: &Path) -> Result<Classification> {
    if !dir.is_dir() {
        return Err(VegvisirError::DirectoryNotFound {
            path: dir.to_path_buf(),
        });
    }

    if let Some(index) = ModelIndex::load(dir)? {
        for criteria in FAMILY_CRITERIA {
            if criteria.matches(&index) {
                log::debug!(
                    "classified {:?} as {} via manifest class '{}'",
                    dir.file_name().unwrap_or_default(),
                    criteria.family,
                    index.class_name
                );
                return Ok(Classification::Known(criteria.family));
            }
        }
        log::debug!(
            "manifest in {:?} matched no rule (class '{}'), trying folder shape",
            dir.file_name().unwrap_or_default(),
            index.class_name
        );
    }

    classify_by_shape(dir).ok_or_else(|| VegvisirError::UnknownFamily {
        dir: dir.to_path_buf(),
    })
}

fn classify_by_shape(dir: &Path) -> Option<Classification> {
    let text_encoder = dir.join("text_encoder").is_dir();
    let text_encoder_2 = dir.join("text_encoder_2").is_dir();
    let text_encoder_3 = dir.join("text_encoder_3").is_dir();
    let transformer = dir.join("transformer").is_dir();

    if transformer && text_encoder_3 {
        Some(Classification::Known(ModelFamily::Sd3))
    } else if text_encoder && text_encoder_2 && !transformer {
        Some(Classification::Known(ModelFamily::Sdxl))
    } else if text_encoder && transformer {
        Some(Classification::Ambiguous(&[
            ModelFamily::AuraFlow,
            ModelFamily::Flux,
        ]))
    } else if text_encoder {
        Some(Classification::Ambiguous(&[
            ModelFamily::Sd15,
            ModelFamily::Sd21,
        ]))
    } else {
        None
    }
}
