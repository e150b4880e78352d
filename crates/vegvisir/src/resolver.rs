//! High-level artifact resolution for whole model directories.
//!
//! [`ArtifactResolver`] ties the pieces together: scan the models root,
//! classify a directory, map the family to its component subdirectories,
//! resolve each component through the shard layer, and keep the load cache
//! honest along the way. Its outputs are exactly what an external
//! model-construction call consumes.

use std::path::{Path, PathBuf};

use strum_macros::EnumIter;

use crate::cache::{ComponentKind, LoadCache};
use crate::error::{Result, VegvisirError};
use crate::family::{self, Classification, ModelFamily};
use crate::paths::{ModelDirectory, ModelsRoot};
use crate::shards::{self, Artifact, ShardSelection};

/// VAE selection: the model's own autoencoder or a tiny approximate one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumIter)]
pub enum VaeVariant {
    /// The `vae/` component shipped with the model.
    Default,
    Taesd,
    Taesdxl,
    Taesd3,
    Taef1,
}

impl VaeVariant {
    /// File stem of the approximate autoencoder, `None` for `Default`.
    pub fn file_stem(&self) -> Option<&'static str> {
        match self {
            Self::Default => None,
            Self::Taesd => Some("taesd"),
            Self::Taesdxl => Some("taesdxl"),
            Self::Taesd3 => Some("taesd3"),
            Self::Taef1 => Some("taef1"),
        }
    }
}

/// The text-encoder flavor tag handed to the external loader alongside the
/// encoder artifacts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumIter)]
pub enum ClipType {
    StableDiffusion,
    StableCascade,
    Sd3,
    StableAudio,
    Sdxl,
    Flux,
}

impl ClipType {
    /// The flavor a family's encoders load as.
    pub fn for_family(family: ModelFamily) -> Self {
        match family {
            ModelFamily::Sd15 | ModelFamily::Sd21 | ModelFamily::AuraFlow => Self::StableDiffusion,
            ModelFamily::Sdxl => Self::Sdxl,
            ModelFamily::Sd3 => Self::Sd3,
            ModelFamily::Flux => Self::Flux,
        }
    }
}

/// Options for [`ArtifactResolver::load_all`].
#[derive(Debug, Clone, Copy)]
pub struct LoadOptions {
    /// Explicit family, required when classification is ambiguous.
    pub family: Option<ModelFamily>,
    /// Shard selection for the diffusion backbone.
    pub diffusion_parts: ShardSelection,
    /// Shard selection for sharded text encoders.
    pub clip_parts: ShardSelection,
    pub vae_variant: VaeVariant,
}

impl Default for LoadOptions {
    fn default() -> Self {
        Self {
            family: None,
            diffusion_parts: ShardSelection::All,
            clip_parts: ShardSelection::All,
            vae_variant: VaeVariant::Default,
        }
    }
}

/// Everything a host needs to construct one model.
#[derive(Debug)]
pub struct ResolvedModel {
    pub family: ModelFamily,
    pub clip_type: ClipType,
    pub diffusion: Artifact,
    pub text_encoders: Vec<Artifact>,
    pub vae: Artifact,
}

/// Resolves model directories under a configured root into loadable
/// artifacts.
#[derive(Debug)]
pub struct ArtifactResolver {
    root: ModelsRoot,
    cache: LoadCache,
}

impl ArtifactResolver {
    pub fn new(root: ModelsRoot) -> Self {
        Self {
            root,
            cache: LoadCache::new(),
        }
    }

    pub fn root(&self) -> &ModelsRoot {
        &self.root
    }

    pub fn cache(&self) -> &LoadCache {
        &self.cache
    }

    /// Model directories under the root.
    pub fn models(&self) -> Result<Vec<ModelDirectory>> {
        self.root.scan()
    }

    /// Classifies a model directory without resolving anything.
    pub fn classify(&self, model_dir: &Path) -> Result<Classification> {
        family::classify(model_dir)
    }

    /// Resolves the diffusion backbone (unet or transformer).
    pub fn diffusion_model(
        &self,
        model_dir: &Path,
        family: Option<ModelFamily>,
        parts: ShardSelection,
    ) -> Result<Artifact> {
        let family = self.family_for(model_dir, family)?;
        let component_dir = self.required_dir(model_dir, family.diffusion_dir())?;
        log::info!(
            "resolving {} backbone from {:?}",
            family,
            component_dir
        );
        self.resolve_component(ComponentKind::Diffusion, &component_dir, parts)
    }

    /// Resolves the family's text encoders, in load order.
    ///
    /// Sharded encoder directories (Flux's second encoder) consolidate under
    /// `ShardSelection::All`; single-file directories ignore the selection.
    pub fn text_encoders(
        &self,
        model_dir: &Path,
        family: Option<ModelFamily>,
        parts: ShardSelection,
    ) -> Result<Vec<Artifact>> {
        let family = self.family_for(model_dir, family)?;
        let mut artifacts = Vec::new();
        for name in family.text_encoder_dirs() {
            let component_dir = self.required_dir(model_dir, name)?;
            artifacts.push(self.resolve_component(
                ComponentKind::TextEncoder,
                &component_dir,
                parts,
            )?);
        }
        Ok(artifacts)
    }

    /// Resolves the VAE.
    ///
    /// Approximate variants look for `<stem>.safetensors` under `vae_approx/`
    /// first, then `vae/`.
    pub fn vae(&self, model_dir: &Path, variant: VaeVariant) -> Result<Artifact> {
        match variant.file_stem() {
            None => {
                let component_dir = self.required_dir(model_dir, "vae")?;
                self.resolve_component(ComponentKind::Vae, &component_dir, ShardSelection::All)
            }
            Some(stem) => {
                let file_name = format!("{stem}.safetensors");
                let candidates = [
                    model_dir.join("vae_approx").join(&file_name),
                    model_dir.join("vae").join(&file_name),
                ];
                for candidate in &candidates {
                    if candidate.is_file() {
                        self.cache.maybe_invalidate(ComponentKind::Vae, candidate)?;
                        return Ok(Artifact::File(candidate.clone()));
                    }
                }
                Err(VegvisirError::NoWeightFile {
                    dir: model_dir.join("vae_approx"),
                })
            }
        }
    }

    /// Resolves the diffusion backbone, text encoders, and VAE in one call.
    pub fn load_all(&self, model_dir: &Path, options: &LoadOptions) -> Result<ResolvedModel> {
        let family = self.family_for(model_dir, options.family)?;

        let diffusion = self.diffusion_model(model_dir, Some(family), options.diffusion_parts)?;
        let text_encoders = self.text_encoders(model_dir, Some(family), options.clip_parts)?;
        let vae = self.vae(model_dir, options.vae_variant)?;

        Ok(ResolvedModel {
            family,
            clip_type: ClipType::for_family(family),
            diffusion,
            text_encoders,
            vae,
        })
    }

    fn family_for(&self, model_dir: &Path, family: Option<ModelFamily>) -> Result<ModelFamily> {
        match family {
            Some(family) => Ok(family),
            None => family::classify(model_dir)?.into_family(model_dir),
        }
    }

    /// The family tag fixes which subdirectories must exist; a missing one
    /// is a hard failure, never silently skipped.
    fn required_dir(&self, model_dir: &Path, name: &str) -> Result<PathBuf> {
        let dir = model_dir.join(name);
        if !dir.is_dir() {
            return Err(VegvisirError::DirectoryNotFound { path: dir });
        }
        Ok(dir)
    }

    fn resolve_component(
        &self,
        kind: ComponentKind,
        component_dir: &Path,
        selection: ShardSelection,
    ) -> Result<Artifact> {
        let result = self.resolve_component_inner(kind, component_dir, selection);
        if let Err(VegvisirError::PermissionDenied { .. }) = &result {
            // Operational side effect only; the original error is returned
            // unchanged either way.
            quarantine(component_dir);
        }
        result
    }

    fn resolve_component_inner(
        &self,
        kind: ComponentKind,
        component_dir: &Path,
        selection: ShardSelection,
    ) -> Result<Artifact> {
        let layout = shards::detect_layout(component_dir)?;

        let artifact = match shards::resolve_layout(component_dir, &layout, selection) {
            Err(VegvisirError::OutOfMemory { wanted }) => {
                log::warn!(
                    "out of memory reserving {} bytes for {:?}; clearing load cache and retrying once",
                    wanted,
                    component_dir
                );
                self.cache.clear();
                shards::resolve_layout(component_dir, &layout, selection)?
            }
            other => other?,
        };

        let source = match &artifact {
            Artifact::File(path) => Some(path.clone()),
            Artifact::Weights(_) => layout.cache_source().map(Path::to_path_buf),
        };
        if let Some(source) = source {
            self.cache.maybe_invalidate(kind, &source)?;
        }

        Ok(artifact)
    }
}

/// Renames a component directory that failed with a permission error to
/// `<dir>.corrupted` so operators notice it. Best-effort: a rename failure
/// is logged and ignored.
fn quarantine(dir: &Path) {
    let Some(name) = dir.file_name().and_then(|n| n.to_str()) else {
        return;
    };
    let target = dir.with_file_name(format!("{name}.corrupted"));
    match std::fs::rename(dir, &target) {
        Ok(()) => log::warn!("quarantined unreadable component directory as {:?}", target),
        Err(e) => log::warn!("failed to quarantine {:?}: {}", dir, e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{create_safetensors_file, write_manifest};
    use serde_json::json;

    fn write_component(model_dir: &Path, component: &str, file: &str, key: &str) {
        let dir = model_dir.join(component);
        std::fs::create_dir_all(&dir).unwrap();
        create_safetensors_file(&dir, file, &[(key, vec![1.0, 2.0], vec![2])]);
    }

    fn build_sd15(model_dir: &Path) {
        std::fs::create_dir_all(model_dir).unwrap();
        write_manifest(
            model_dir,
            json!({
                "_class_name": "StableDiffusionPipeline",
                "text_encoder": ["transformers", "CLIPTextModel"],
                "unet": ["diffusers", "UNet2DConditionModel"],
                "vae": ["diffusers", "AutoencoderKL"],
                "scheduler": ["diffusers", "PNDMScheduler"],
                "tokenizer": ["transformers", "CLIPTokenizer"],
                "requires_safety_checker": true
            }),
        );
        write_component(model_dir, "unet", "diffusion_pytorch_model.safetensors", "unet.w");
        write_component(model_dir, "vae", "diffusion_pytorch_model.safetensors", "vae.w");
        write_component(model_dir, "text_encoder", "model.safetensors", "te.w");
    }

    fn build_flux(model_dir: &Path) {
        std::fs::create_dir_all(model_dir).unwrap();
        write_manifest(
            model_dir,
            json!({
                "_class_name": "FluxPipeline",
                "text_encoder": ["transformers", "CLIPTextModel"],
                "text_encoder_2": ["transformers", "T5EncoderModel"],
                "transformer": ["diffusers", "FluxTransformer2DModel"],
                "vae": ["diffusers", "AutoencoderKL"],
                "scheduler": ["diffusers", "FlowMatchEulerDiscreteScheduler"],
                "tokenizer": ["transformers", "CLIPTokenizer"]
            }),
        );
        write_component(model_dir, "transformer", "diffusion_pytorch_model.safetensors", "tr.w");
        write_component(model_dir, "vae", "diffusion_pytorch_model.safetensors", "vae.w");
        write_component(model_dir, "text_encoder", "model.safetensors", "te.w");

        let te2 = model_dir.join("text_encoder_2");
        std::fs::create_dir_all(&te2).unwrap();
        create_safetensors_file(
            &te2,
            "model-00001-of-00002.safetensors",
            &[("enc.w", vec![1.0, 2.0], vec![1, 2])],
        );
        create_safetensors_file(
            &te2,
            "model-00002-of-00002.safetensors",
            &[("enc.w", vec![3.0, 4.0], vec![1, 2])],
        );
    }

    #[test]
    fn test_load_all_sd15() {
        let root = tempfile::tempdir().unwrap();
        let model_dir = root.path().join("dreamlike");
        build_sd15(&model_dir);

        let resolver = ArtifactResolver::new(ModelsRoot::new(root.path()));
        let resolved = resolver.load_all(&model_dir, &LoadOptions::default()).unwrap();

        assert_eq!(resolved.family, ModelFamily::Sd15);
        assert_eq!(resolved.clip_type, ClipType::StableDiffusion);
        assert_eq!(
            resolved.diffusion.file_path().unwrap(),
            model_dir.join("unet/diffusion_pytorch_model.safetensors")
        );
        assert_eq!(resolved.text_encoders.len(), 1);
        assert!(resolved.vae.file_path().is_some());
    }

    #[test]
    fn test_flux_second_encoder_consolidates() {
        let root = tempfile::tempdir().unwrap();
        let model_dir = root.path().join("flux-dev");
        build_flux(&model_dir);

        let resolver = ArtifactResolver::new(ModelsRoot::new(root.path()));
        let encoders = resolver
            .text_encoders(&model_dir, None, ShardSelection::All)
            .unwrap();

        assert_eq!(encoders.len(), 2);
        assert_eq!(
            encoders[0].file_path().unwrap(),
            model_dir.join("text_encoder/model.safetensors")
        );
        let combined = encoders[1].file_path().unwrap();
        assert_eq!(
            combined,
            model_dir.join("text_encoder_2/combined_text_encoder_2.safetensors")
        );
        assert!(combined.is_file());
    }

    #[test]
    fn test_missing_required_dir_is_hard_failure() {
        let root = tempfile::tempdir().unwrap();
        let model_dir = root.path().join("broken");
        build_sd15(&model_dir);
        std::fs::remove_dir_all(model_dir.join("unet")).unwrap();

        let resolver = ArtifactResolver::new(ModelsRoot::new(root.path()));
        let result = resolver.diffusion_model(&model_dir, None, ShardSelection::All);
        assert!(matches!(
            result,
            Err(VegvisirError::DirectoryNotFound { .. })
        ));
    }

    #[test]
    fn test_ambiguous_directory_requires_override() {
        let root = tempfile::tempdir().unwrap();
        let model_dir = root.path().join("no-manifest");
        std::fs::create_dir_all(&model_dir).unwrap();
        write_component(&model_dir, "unet", "diffusion_pytorch_model.safetensors", "unet.w");
        write_component(&model_dir, "vae", "diffusion_pytorch_model.safetensors", "vae.w");
        write_component(&model_dir, "text_encoder", "model.safetensors", "te.w");

        let resolver = ArtifactResolver::new(ModelsRoot::new(root.path()));

        let result = resolver.diffusion_model(&model_dir, None, ShardSelection::All);
        assert!(matches!(result, Err(VegvisirError::AmbiguousFamily { .. })));

        // an explicit family resolves the same directory
        let artifact = resolver
            .diffusion_model(&model_dir, Some(ModelFamily::Sd15), ShardSelection::All)
            .unwrap();
        assert!(artifact.file_path().is_some());
    }

    #[test]
    fn test_switching_diffusion_source_clears_other_slots() {
        let root = tempfile::tempdir().unwrap();
        let model_a = root.path().join("model-a");
        let model_b = root.path().join("model-b");
        build_sd15(&model_a);
        build_sd15(&model_b);
        // make model-b's unet differ in content from model-a's
        create_safetensors_file(
            &model_b.join("unet"),
            "diffusion_pytorch_model.safetensors",
            &[("unet.w", vec![9.0, 9.0, 9.0], vec![3])],
        );

        let resolver = ArtifactResolver::new(ModelsRoot::new(root.path()));
        resolver
            .diffusion_model(&model_a, None, ShardSelection::All)
            .unwrap();
        resolver
            .text_encoders(&model_a, None, ShardSelection::All)
            .unwrap();
        resolver.vae(&model_a, VaeVariant::Default).unwrap();
        assert_eq!(resolver.cache().len(), 3);

        resolver
            .diffusion_model(&model_b, None, ShardSelection::All)
            .unwrap();
        assert_eq!(resolver.cache().len(), 1);
        assert!(resolver
            .cache()
            .cached_digest(ComponentKind::TextEncoder)
            .is_none());
        assert!(resolver.cache().cached_digest(ComponentKind::Vae).is_none());
    }

    #[test]
    fn test_quarantine_renames_directory() {
        let root = tempfile::tempdir().unwrap();
        let dir = root.path().join("unet");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("weights.safetensors"), b"x").unwrap();

        quarantine(&dir);

        assert!(!dir.exists());
        assert!(root.path().join("unet.corrupted").is_dir());

        // a second attempt has nothing to rename and must not panic
        quarantine(&dir);
    }

    #[test]
    fn test_vae_variant_lookup_and_fallback() {
        let root = tempfile::tempdir().unwrap();
        let model_dir = root.path().join("model");
        build_sd15(&model_dir);

        let resolver = ArtifactResolver::new(ModelsRoot::new(root.path()));

        // not present anywhere
        let missing = resolver.vae(&model_dir, VaeVariant::Taesd);
        assert!(matches!(missing, Err(VegvisirError::NoWeightFile { .. })));

        // falls back to the vae directory when vae_approx is absent
        create_safetensors_file(
            &model_dir.join("vae"),
            "taesd.safetensors",
            &[("t", vec![1.0], vec![1])],
        );
        let fallback = resolver.vae(&model_dir, VaeVariant::Taesd).unwrap();
        assert_eq!(
            fallback.file_path().unwrap(),
            model_dir.join("vae/taesd.safetensors")
        );

        // vae_approx wins when both exist
        let approx_dir = model_dir.join("vae_approx");
        std::fs::create_dir_all(&approx_dir).unwrap();
        create_safetensors_file(&approx_dir, "taesd.safetensors", &[("t", vec![2.0], vec![1])]);
        let preferred = resolver.vae(&model_dir, VaeVariant::Taesd).unwrap();
        assert_eq!(
            preferred.file_path().unwrap(),
            approx_dir.join("taesd.safetensors")
        );
    }
}
