//! Enrolled identities and their reference descriptors.
//!
//! A [`Gallery`] is built once by the training pipeline, persisted as a
//! self-describing JSON artifact and reloaded wholesale at startup. Every
//! entry keeps all of its per-sample descriptors (for k-NN matching) and
//! their mean (the prototype, for centroid matching).

use crate::types::Descriptor;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs;
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Version of the on-disk artifact layout.
pub const ARTIFACT_FORMAT_VERSION: u32 = 1;

#[derive(Error, Debug)]
pub enum GalleryError {
    #[error("{path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed gallery artifact: {0}")]
    Json(#[from] serde_json::Error),
    #[error("unsupported gallery format version {0}")]
    UnsupportedVersion(u32),
    #[error("gallery dimension must be positive")]
    ZeroDimension,
    #[error("identity `{identity}` has a {actual}-value descriptor, gallery dimension is {expected}")]
    DimensionMismatch {
        identity: String,
        expected: usize,
        actual: usize,
    },
    #[error("identity `{0}` has no descriptors")]
    EmptyEntry(String),
    #[error("identity `{0}` is enrolled twice")]
    DuplicateIdentity(String),
    #[error("gallery checksum mismatch: artifact says {stored}, contents hash to {computed}")]
    ChecksumMismatch { stored: String, computed: String },
    #[error("gallery was built by extractor `{found}`, expected `{expected}`")]
    ExtractorMismatch { expected: String, found: String },
    #[error("gallery dimension is {found}, expected {expected}")]
    WrongDimension { expected: usize, found: usize },
}

/// One enrolled identity.
#[derive(Debug, Clone, PartialEq)]
pub struct GalleryEntry {
    identity: String,
    descriptors: Vec<Descriptor>,
    prototype: Descriptor,
}

impl GalleryEntry {
    /// Build an entry; the prototype is the mean of `descriptors`.
    pub fn new(identity: impl Into<String>, descriptors: Vec<Descriptor>) -> Result<Self, GalleryError> {
        let identity = identity.into();
        let prototype = match Descriptor::mean(&descriptors) {
            Some(mean) => mean,
            None if descriptors.is_empty() => return Err(GalleryError::EmptyEntry(identity)),
            None => {
                let expected = descriptors[0].len();
                let actual = descriptors
                    .iter()
                    .map(Descriptor::len)
                    .find(|&len| len != expected)
                    .unwrap_or(expected);
                return Err(GalleryError::DimensionMismatch {
                    identity,
                    expected,
                    actual,
                });
            }
        };
        Ok(Self {
            identity,
            descriptors,
            prototype,
        })
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn descriptors(&self) -> &[Descriptor] {
        &self.descriptors
    }

    pub fn prototype(&self) -> &Descriptor {
        &self.prototype
    }
}

/// Read-only collection of enrolled identities, ordered by identity.
#[derive(Debug, Clone, PartialEq)]
pub struct Gallery {
    extractor: String,
    dimension: usize,
    entries: Vec<GalleryEntry>,
    created_at: Option<DateTime<Utc>>,
}

impl Gallery {
    pub fn new(extractor: impl Into<String>, dimension: usize) -> Self {
        Self {
            extractor: extractor.into(),
            dimension,
            entries: Vec::new(),
            created_at: None,
        }
    }

    /// Enroll an identity with its per-sample descriptors.
    pub fn insert(
        &mut self,
        identity: impl Into<String>,
        descriptors: Vec<Descriptor>,
    ) -> Result<(), GalleryError> {
        let entry = GalleryEntry::new(identity, descriptors)?;
        self.push_entry(entry)
    }

    fn push_entry(&mut self, entry: GalleryEntry) -> Result<(), GalleryError> {
        if entry.prototype.len() != self.dimension {
            return Err(GalleryError::DimensionMismatch {
                identity: entry.identity,
                expected: self.dimension,
                actual: entry.prototype.len(),
            });
        }
        match self
            .entries
            .binary_search_by(|e| e.identity.as_str().cmp(&entry.identity))
        {
            Ok(_) => Err(GalleryError::DuplicateIdentity(entry.identity)),
            Err(pos) => {
                self.entries.insert(pos, entry);
                Ok(())
            }
        }
    }

    pub fn extractor(&self) -> &str {
        &self.extractor
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    pub fn entries(&self) -> &[GalleryEntry] {
        &self.entries
    }

    pub fn get(&self, identity: &str) -> Option<&GalleryEntry> {
        self.entries
            .binary_search_by(|e| e.identity.as_str().cmp(identity))
            .ok()
            .map(|i| &self.entries[i])
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Total stored descriptors across identities.
    pub fn descriptor_count(&self) -> usize {
        self.entries.iter().map(|e| e.descriptors.len()).sum()
    }

    /// When the artifact this gallery was loaded from was written.
    pub fn created_at(&self) -> Option<DateTime<Utc>> {
        self.created_at
    }

    /// Write the artifact to `path` via a temporary file and rename.
    pub fn save(&self, path: &Path) -> Result<(), GalleryError> {
        let io_err = |source| GalleryError::Io {
            path: path.to_path_buf(),
            source,
        };

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(io_err)?;
        }

        let identities: Vec<ArtifactEntry> = self
            .entries
            .iter()
            .map(|e| ArtifactEntry {
                identity: e.identity.clone(),
                descriptors: e.descriptors.clone(),
                prototype: Some(e.prototype.clone()),
            })
            .collect();
        let artifact = Artifact {
            format_version: ARTIFACT_FORMAT_VERSION,
            extractor: self.extractor.clone(),
            dimension: self.dimension,
            created_at: Utc::now(),
            checksum: Some(checksum(&self.extractor, self.dimension, &identities)),
            identities,
        };

        let tmp = path.with_extension("tmp");
        let file = fs::File::create(&tmp).map_err(io_err)?;
        let mut writer = BufWriter::new(file);
        serde_json::to_writer_pretty(&mut writer, &artifact)?;
        writer.flush().map_err(io_err)?;
        drop(writer);
        fs::rename(&tmp, path).map_err(io_err)?;

        tracing::info!(
            path = %path.display(),
            identities = self.entries.len(),
            descriptors = self.descriptor_count(),
            "saved gallery"
        );
        Ok(())
    }

    /// Load an artifact written by [`save`](Self::save) or by hand.
    ///
    /// Entries with only a prototype use it as their single descriptor;
    /// entries with only descriptors get their prototype recomputed.
    pub fn load(path: &Path) -> Result<Self, GalleryError> {
        let file = fs::File::open(path).map_err(|source| GalleryError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let artifact: Artifact = serde_json::from_reader(BufReader::new(file))?;

        if artifact.format_version != ARTIFACT_FORMAT_VERSION {
            return Err(GalleryError::UnsupportedVersion(artifact.format_version));
        }
        if artifact.dimension == 0 {
            return Err(GalleryError::ZeroDimension);
        }
        if let Some(stored) = &artifact.checksum {
            let computed = checksum(&artifact.extractor, artifact.dimension, &artifact.identities);
            if *stored != computed {
                return Err(GalleryError::ChecksumMismatch {
                    stored: stored.clone(),
                    computed,
                });
            }
        }

        let mut gallery = Gallery::new(artifact.extractor, artifact.dimension);
        gallery.created_at = Some(artifact.created_at);
        for stored in artifact.identities {
            let entry = match (stored.descriptors.is_empty(), stored.prototype) {
                (true, Some(prototype)) => GalleryEntry {
                    identity: stored.identity,
                    descriptors: vec![prototype.clone()],
                    prototype,
                },
                (true, None) => return Err(GalleryError::EmptyEntry(stored.identity)),
                (false, prototype) => {
                    let mut entry = GalleryEntry::new(stored.identity, stored.descriptors)?;
                    if let Some(prototype) = prototype {
                        if prototype.len() != entry.prototype.len() {
                            return Err(GalleryError::DimensionMismatch {
                                identity: entry.identity,
                                expected: entry.prototype.len(),
                                actual: prototype.len(),
                            });
                        }
                        entry.prototype = prototype;
                    }
                    entry
                }
            };
            gallery.push_entry(entry)?;
        }

        tracing::info!(
            path = %path.display(),
            extractor = %gallery.extractor,
            dimension = gallery.dimension,
            identities = gallery.entries.len(),
            "loaded gallery"
        );
        Ok(gallery)
    }

    /// Load and require a specific extractor configuration and dimension.
    pub fn load_for(path: &Path, extractor: &str, dimension: usize) -> Result<Self, GalleryError> {
        let gallery = Self::load(path)?;
        if gallery.extractor != extractor {
            return Err(GalleryError::ExtractorMismatch {
                expected: extractor.to_string(),
                found: gallery.extractor,
            });
        }
        if gallery.dimension != dimension {
            return Err(GalleryError::WrongDimension {
                expected: dimension,
                found: gallery.dimension,
            });
        }
        Ok(gallery)
    }
}

#[derive(Serialize, Deserialize)]
struct Artifact {
    format_version: u32,
    extractor: String,
    dimension: usize,
    created_at: DateTime<Utc>,
    #[serde(default)]
    checksum: Option<String>,
    identities: Vec<ArtifactEntry>,
}

#[derive(Serialize, Deserialize)]
struct ArtifactEntry {
    identity: String,
    #[serde(default)]
    descriptors: Vec<Descriptor>,
    #[serde(default)]
    prototype: Option<Descriptor>,
}

/// SHA-256 over the artifact contents exactly as stored.
fn checksum(extractor: &str, dimension: usize, identities: &[ArtifactEntry]) -> String {
    fn put_vector(hasher: &mut Sha256, d: &Descriptor) {
        hasher.update((d.len() as u64).to_le_bytes());
        for v in d.values() {
            hasher.update(v.to_le_bytes());
        }
    }

    let mut hasher = Sha256::new();

    hasher.update((extractor.len() as u64).to_le_bytes());
    hasher.update(extractor.as_bytes());
    hasher.update((dimension as u64).to_le_bytes());
    for entry in identities {
        hasher.update((entry.identity.len() as u64).to_le_bytes());
        hasher.update(entry.identity.as_bytes());
        hasher.update((entry.descriptors.len() as u64).to_le_bytes());
        for d in &entry.descriptors {
            put_vector(&mut hasher, d);
        }
        match &entry.prototype {
            Some(p) => {
                hasher.update([1u8]);
                put_vector(&mut hasher, p);
            }
            None => hasher.update([0u8]),
        }
    }
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(values: &[f32]) -> Descriptor {
        Descriptor::new(values.to_vec())
    }

    fn sample_gallery() -> Gallery {
        let mut g = Gallery::new("test:3", 3);
        g.insert("bob", vec![d(&[0.0, 1.0, 0.0]), d(&[0.0, 0.8, 0.2])]).unwrap();
        g.insert("alice", vec![d(&[1.0, 0.0, 0.0])]).unwrap();
        g
    }

    #[test]
    fn test_entries_sorted_with_prototypes() {
        let g = sample_gallery();
        let names: Vec<&str> = g.entries().iter().map(|e| e.identity()).collect();
        assert_eq!(names, ["alice", "bob"]);
        assert_eq!(g.descriptor_count(), 3);

        let bob = g.get("bob").unwrap();
        assert_eq!(bob.descriptors().len(), 2);
        assert!((bob.prototype().values()[1] - 0.9).abs() < 1e-6);
        assert!((bob.prototype().values()[2] - 0.1).abs() < 1e-6);
    }

    #[test]
    fn test_insert_rejects_bad_entries() {
        let mut g = Gallery::new("test:3", 3);
        assert!(matches!(g.insert("x", vec![]), Err(GalleryError::EmptyEntry(_))));
        assert!(matches!(
            g.insert("x", vec![d(&[1.0, 0.0])]),
            Err(GalleryError::DimensionMismatch { expected: 3, actual: 2, .. })
        ));
        assert!(matches!(
            g.insert("x", vec![d(&[1.0, 0.0, 0.0]), d(&[1.0])]),
            Err(GalleryError::DimensionMismatch { .. })
        ));
        g.insert("x", vec![d(&[1.0, 0.0, 0.0])]).unwrap();
        assert!(matches!(
            g.insert("x", vec![d(&[1.0, 0.0, 0.0])]),
            Err(GalleryError::DuplicateIdentity(_))
        ));
        assert!(g.get("missing").is_none());
    }

    #[test]
    fn test_save_load_preserves_contents() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/gallery.json");
        let g = sample_gallery();
        g.save(&path).unwrap();

        let loaded = Gallery::load(&path).unwrap();
        assert_eq!(loaded.extractor(), "test:3");
        assert_eq!(loaded.dimension(), 3);
        assert_eq!(loaded.entries(), g.entries());
        assert!(loaded.created_at().is_some());
        assert!(!path.with_extension("tmp").exists());
    }

    #[test]
    fn test_load_for_rejects_other_extractor() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gallery.json");
        sample_gallery().save(&path).unwrap();

        assert!(Gallery::load_for(&path, "test:3", 3).is_ok());
        assert!(matches!(
            Gallery::load_for(&path, "lbph:r1:g8x8:s200", 3),
            Err(GalleryError::ExtractorMismatch { .. })
        ));
        assert!(matches!(
            Gallery::load_for(&path, "test:3", 512),
            Err(GalleryError::WrongDimension { expected: 512, found: 3 })
        ));
    }

    #[test]
    fn test_tampered_artifact_fails_checksum() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gallery.json");
        sample_gallery().save(&path).unwrap();

        let mut json: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        json["identities"][0]["descriptors"][0][0] = serde_json::json!(0.5);
        fs::write(&path, json.to_string()).unwrap();

        assert!(matches!(
            Gallery::load(&path),
            Err(GalleryError::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn test_load_prototype_only_artifact() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("prototypes.json");
        let json = serde_json::json!({
            "format_version": ARTIFACT_FORMAT_VERSION,
            "extractor": "embedding:facenet:160:3",
            "dimension": 3,
            "created_at": "2026-01-01T00:00:00Z",
            "identities": [
                { "identity": "A", "prototype": [1.0, 0.0, 0.0] },
                { "identity": "B", "descriptors": [[0.0, 1.0, 0.0], [0.0, 0.0, 1.0]] }
            ]
        });
        fs::write(&path, json.to_string()).unwrap();

        let g = Gallery::load(&path).unwrap();
        assert_eq!(g.get("A").unwrap().descriptors(), &[d(&[1.0, 0.0, 0.0])]);
        assert_eq!(g.get("B").unwrap().prototype(), &d(&[0.0, 0.5, 0.5]));
    }

    #[test]
    fn test_load_rejects_bad_version_and_shapes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("g.json");

        let mut json = serde_json::json!({
            "format_version": 99,
            "extractor": "x",
            "dimension": 2,
            "created_at": "2026-01-01T00:00:00Z",
            "identities": []
        });
        fs::write(&path, json.to_string()).unwrap();
        assert!(matches!(Gallery::load(&path), Err(GalleryError::UnsupportedVersion(99))));

        json["format_version"] = serde_json::json!(ARTIFACT_FORMAT_VERSION);
        json["identities"] = serde_json::json!([{ "identity": "A", "prototype": [1.0, 0.0, 0.0] }]);
        fs::write(&path, json.to_string()).unwrap();
        assert!(matches!(Gallery::load(&path), Err(GalleryError::DimensionMismatch { .. })));

        json["identities"] = serde_json::json!([{ "identity": "A" }]);
        fs::write(&path, json.to_string()).unwrap();
        assert!(matches!(Gallery::load(&path), Err(GalleryError::EmptyEntry(_))));
    }

    #[test]
    fn test_load_missing_file() {
        assert!(matches!(
            Gallery::load(Path::new("/nonexistent/gallery.json")),
            Err(GalleryError::Io { .. })
        ));
    }
}
