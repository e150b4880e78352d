//! Vegvisir: artifact resolution for diffusers-layout model directories.
//!
//! Given a models directory tree, this crate discovers model directories,
//! infers which architecture family each one holds (declarative manifest
//! first, folder-shape heuristics second), reassembles weight components
//! that were split across shard files, and hands resolved file paths or
//! in-memory weight mappings to an external model-loading runtime.
//!
//! ```ignore
//! use vegvisir::prelude::*;
//!
//! let resolver = ArtifactResolver::new(ModelsRoot::new("/data/models"));
//! for model in resolver.models()? {
//!     let resolved = resolver.load_all(model.path(), &LoadOptions::default())?;
//!     println!("{}: {}", model.name(), resolved.family);
//! }
//! ```

pub mod cache;
pub mod error;
pub mod family;
pub mod manifest;
pub mod merge;
pub mod paths;
pub mod resolver;
pub mod shards;
pub mod weights;

// Re-export commonly used items
pub use cache::{ComponentKind, LoadCache};
pub use error::{Result, VegvisirError};
pub use family::{classify, Classification, FamilyCriteria, ModelFamily, FAMILY_CRITERIA};
pub use manifest::{ModelIndex, MANIFEST_FILE};
pub use paths::{ModelDirectory, ModelsRoot, MODELS_DIR_ENV};
pub use resolver::{ArtifactResolver, ClipType, LoadOptions, ResolvedModel, VaeVariant};
pub use shards::{resolve_component, Artifact, ComponentLayout, ShardSelection};
pub use weights::{DType, TensorData, WeightMapping};

// Prelude for easy imports
pub mod prelude {
    pub use crate::cache::{ComponentKind, LoadCache};
    pub use crate::error::{Result, VegvisirError};
    pub use crate::family::{Classification, ModelFamily};
    pub use crate::paths::{ModelDirectory, ModelsRoot};
    pub use crate::resolver::{ArtifactResolver, LoadOptions, VaeVariant};
    pub use crate::shards::{Artifact, ShardSelection};
    pub use crate::weights::WeightMapping;
}
