//! Load cache invalidation keyed by component kind.
//!
//! The external loader keeps large in-memory tensors per component kind.
//! Switching any one component must not leave stale cross-references between
//! the three, so while mismatch *detection* is per kind, *invalidation* is
//! global: a changed content hash clears every slot. Correctness over
//! precision.
//!
//! The cache is an explicit struct rather than ambient global state; a
//! single interior `Mutex` mediates every read-check-update sequence, so the
//! hash-compare-then-clear step cannot interleave between concurrent
//! callers.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use sha2::{Digest, Sha256};
use strum_macros::EnumIter;

use crate::error::{Result, VegvisirError};

/// The three component kinds the loader caches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, EnumIter)]
pub enum ComponentKind {
    /// UNet or transformer backbone.
    Diffusion,
    /// Text encoder(s).
    TextEncoder,
    /// Variational autoencoder.
    Vae,
}

impl ComponentKind {
    fn slot(self) -> usize {
        match self {
            Self::Diffusion => 0,
            Self::TextEncoder => 1,
            Self::Vae => 2,
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            Self::Diffusion => "diffusion",
            Self::TextEncoder => "text encoder",
            Self::Vae => "vae",
        }
    }
}

#[derive(Debug, Clone)]
struct Slot {
    source: PathBuf,
    digest: [u8; 32],
}

/// Three-slot cache of last-loaded component sources.
#[derive(Debug, Default)]
pub struct LoadCache {
    slots: Mutex<[Option<Slot>; 3]>,
}

impl LoadCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Compares the content hash of `path` against the stored hash for
    /// `kind`. On mismatch every slot is cleared, the new hash is stored for
    /// `kind`, and `true` is returned. A match is a no-op returning `false`,
    /// as is the first sighting of a kind, which stores its hash without
    /// touching the other slots.
    pub fn maybe_invalidate(&self, kind: ComponentKind, path: &Path) -> Result<bool> {
        let digest = file_digest(path)?;
        let mut slots = self.slots.lock().unwrap();

        let invalidate = match &slots[kind.slot()] {
            Some(slot) if slot.digest == digest => {
                log::debug!(
                    "{} cache hit for {:?}",
                    kind.display_name(),
                    path.file_name().unwrap_or_default()
                );
                return Ok(false);
            }
            Some(slot) => {
                log::info!(
                    "{} source changed ({:?} -> {:?}), clearing all cache slots",
                    kind.display_name(),
                    slot.source.file_name().unwrap_or_default(),
                    path.file_name().unwrap_or_default()
                );
                true
            }
            None => false,
        };

        if invalidate {
            for slot in slots.iter_mut() {
                *slot = None;
            }
        }
        slots[kind.slot()] = Some(Slot {
            source: path.to_path_buf(),
            digest,
        });
        Ok(invalidate)
    }

    /// Clears every slot.
    pub fn clear(&self) {
        let mut slots = self.slots.lock().unwrap();
        let count = slots.iter().filter(|s| s.is_some()).count();
        for slot in slots.iter_mut() {
            *slot = None;
        }
        if count > 0 {
            log::info!("cleared {} load cache slots", count);
        }
    }

    /// Number of occupied slots.
    pub fn len(&self) -> usize {
        self.slots.lock().unwrap().iter().filter(|s| s.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Hex digest stored for a kind, if any.
    pub fn cached_digest(&self, kind: ComponentKind) -> Option<String> {
        self.slots.lock().unwrap()[kind.slot()]
            .as_ref()
            .map(|slot| hex::encode(slot.digest))
    }

    /// Source path stored for a kind, if any.
    pub fn cached_source(&self, kind: ComponentKind) -> Option<PathBuf> {
        self.slots.lock().unwrap()[kind.slot()]
            .as_ref()
            .map(|slot| slot.source.clone())
    }
}

/// Streams a file through SHA-256.
fn file_digest(path: &Path) -> Result<[u8; 32]> {
    let mut file = File::open(path).map_err(|e| VegvisirError::io(path, e))?;
    let mut hasher = Sha256::new();
    std::io::copy(&mut file, &mut hasher).map_err(|e| VegvisirError::io(path, e))?;
    Ok(hasher.finalize().into())
}
