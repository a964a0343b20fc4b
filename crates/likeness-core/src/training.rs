//! Offline enrollment: labeled image directories → [`Gallery`].

use crate::extractor::{ExtractionError, FeatureExtractor};
use crate::gallery::{Gallery, GalleryError};
use crate::types::Descriptor;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Image file extensions picked up when scanning a dataset directory.
pub const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "bmp", "webp"];

#[derive(Error, Debug)]
pub enum TrainingError {
    #[error("{path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("dataset has no identities")]
    EmptyDataset,
    #[error("identity `{0}` produced no descriptors")]
    IdentityEmpty(String),
    #[error("no descriptors could be extracted from any sample")]
    NoDescriptors,
    #[error("sample {path}: {source}")]
    Extraction {
        path: PathBuf,
        #[source]
        source: ExtractionError,
    },
    #[error(transparent)]
    Gallery(#[from] GalleryError),
}

/// One identity's ordered sample files.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LabeledSamples {
    pub identity: String,
    pub samples: Vec<PathBuf>,
}

/// Labeled training samples, ordered by identity.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Dataset {
    identities: Vec<LabeledSamples>,
}

impl Dataset {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an identity. Identities are kept sorted; adding an existing one
    /// appends to its samples.
    pub fn add(&mut self, identity: impl Into<String>, samples: Vec<PathBuf>) {
        let identity = identity.into();
        match self
            .identities
            .binary_search_by(|l| l.identity.as_str().cmp(&identity))
        {
            Ok(i) => self.identities[i].samples.extend(samples),
            Err(i) => self.identities.insert(i, LabeledSamples { identity, samples }),
        }
    }

    /// Scan `root/<identity>/<image>`; the subdirectory name is the identity.
    ///
    /// Files are taken in name order, optionally capped per identity. Other
    /// files, hidden entries and nested directories are ignored.
    pub fn from_dir(root: &Path, max_per_identity: Option<usize>) -> Result<Self, TrainingError> {
        let mut dataset = Self::new();
        for dir in sorted_entries(root)? {
            if !dir.is_dir() {
                continue;
            }
            let Some(identity) = visible_name(&dir) else {
                continue;
            };

            let mut samples: Vec<PathBuf> = sorted_entries(&dir)?
                .into_iter()
                .filter(|p| p.is_file() && visible_name(p).is_some() && is_image(p))
                .collect();
            if let Some(max) = max_per_identity {
                samples.truncate(max);
            }
            tracing::debug!(identity = %identity, samples = samples.len(), "found identity");
            dataset.add(identity, samples);
        }
        Ok(dataset)
    }

    pub fn identities(&self) -> &[LabeledSamples] {
        &self.identities
    }

    pub fn len(&self) -> usize {
        self.identities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.identities.is_empty()
    }

    pub fn sample_count(&self) -> usize {
        self.identities.iter().map(|l| l.samples.len()).sum()
    }
}

fn sorted_entries(dir: &Path) -> Result<Vec<PathBuf>, TrainingError> {
    let io_err = |source| TrainingError::Io {
        path: dir.to_path_buf(),
        source,
    };
    let mut paths = fs::read_dir(dir)
        .map_err(io_err)?
        .map(|entry| entry.map(|e| e.path()))
        .collect::<Result<Vec<_>, _>>()
        .map_err(io_err)?;
    paths.sort();
    Ok(paths)
}

fn visible_name(path: &Path) -> Option<String> {
    let name = path.file_name()?.to_str()?;
    (!name.starts_with('.')).then(|| name.to_string())
}

fn is_image(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| IMAGE_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

/// Outcome of one enrollment run.
#[derive(Debug)]
pub struct TrainingReport {
    pub gallery: Gallery,
    /// Samples that yielded a descriptor.
    pub enrolled_samples: usize,
    /// Samples where no face was found.
    pub absent_samples: usize,
    /// Samples that could not be decoded or encoded.
    pub failed_samples: usize,
    /// Identities left out because none of their samples survived.
    pub excluded: Vec<String>,
}

/// Extract every sample and enroll each identity with all of its descriptors.
///
/// Per-sample failures are logged and skipped. An identity left with no
/// descriptors is excluded with a warning. The run fails only when the
/// dataset is empty or nothing at all could be enrolled.
pub fn build_gallery(
    extractor: &mut FeatureExtractor,
    dataset: &Dataset,
) -> Result<TrainingReport, TrainingError> {
    if dataset.is_empty() {
        return Err(TrainingError::EmptyDataset);
    }

    let mut gallery = Gallery::new(extractor.id(), extractor.dimension());
    let mut enrolled_samples = 0;
    let mut absent_samples = 0;
    let mut failed_samples = 0;
    let mut excluded = Vec::new();

    for labeled in dataset.identities() {
        let mut descriptors = Vec::with_capacity(labeled.samples.len());
        for path in &labeled.samples {
            match extract_sample(extractor, path) {
                Ok(Some(descriptor)) => descriptors.push(descriptor),
                Ok(None) => {
                    absent_samples += 1;
                    tracing::debug!(path = %path.display(), "no face in sample");
                }
                Err(e) => {
                    failed_samples += 1;
                    tracing::warn!(identity = %labeled.identity, error = %e, "skipping sample");
                }
            }
        }

        if descriptors.is_empty() {
            let err = TrainingError::IdentityEmpty(labeled.identity.clone());
            tracing::warn!(error = %err, "identity excluded from gallery");
            excluded.push(labeled.identity.clone());
            continue;
        }

        enrolled_samples += descriptors.len();
        tracing::info!(
            identity = %labeled.identity,
            descriptors = descriptors.len(),
            "enrolled identity"
        );
        gallery.insert(labeled.identity.clone(), descriptors)?;
    }

    if gallery.is_empty() {
        return Err(TrainingError::NoDescriptors);
    }

    tracing::info!(
        identities = gallery.len(),
        enrolled_samples,
        absent_samples,
        failed_samples,
        excluded = excluded.len(),
        "gallery built"
    );
    Ok(TrainingReport {
        gallery,
        enrolled_samples,
        absent_samples,
        failed_samples,
        excluded,
    })
}

fn extract_sample(
    extractor: &mut FeatureExtractor,
    path: &Path,
) -> Result<Option<Descriptor>, TrainingError> {
    let wrap = |source| TrainingError::Extraction {
        path: path.to_path_buf(),
        source,
    };
    let image = image::open(path).map_err(|source| {
        wrap(ExtractionError::Unreadable {
            path: path.to_path_buf(),
            source,
        })
    })?;
    extractor.extract(&image).map_err(wrap)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extractor::tests::FixedDetector;
    use crate::histogram::LbphParams;
    use crate::types::FaceRegion;
    use image::{GrayImage, Luma};

    fn small_lbph() -> FeatureExtractor {
        FeatureExtractor::histogram(LbphParams {
            radius: 1,
            grid_x: 2,
            grid_y: 2,
            input_size: 16,
        })
    }

    fn write_face(path: &Path, seed: u32) {
        GrayImage::from_fn(24, 24, |x, y| Luma([((x * seed + y * 7 + seed) % 251) as u8]))
            .save(path)
            .unwrap();
    }

    /// alice: 2 faces, bob: 1 face + 1 corrupt file, carol: corrupt only.
    fn write_dataset(root: &Path) {
        for name in ["alice", "bob", "carol"] {
            fs::create_dir_all(root.join(name)).unwrap();
        }
        write_face(&root.join("alice/2.png"), 3);
        write_face(&root.join("alice/1.png"), 5);
        write_face(&root.join("bob/a.png"), 11);
        fs::write(root.join("bob/b.jpg"), b"not an image").unwrap();
        fs::write(root.join("carol/x.png"), b"garbage").unwrap();
        fs::write(root.join("alice/notes.txt"), b"ignored").unwrap();
        fs::write(root.join("README"), b"ignored").unwrap();
    }

    #[test]
    fn test_from_dir_sorted_and_filtered() {
        let dir = tempfile::tempdir().unwrap();
        write_dataset(dir.path());

        let dataset = Dataset::from_dir(dir.path(), None).unwrap();
        let names: Vec<&str> = dataset.identities().iter().map(|l| l.identity.as_str()).collect();
        assert_eq!(names, ["alice", "bob", "carol"]);
        let alice = &dataset.identities()[0].samples;
        assert_eq!(alice.len(), 2);
        assert!(alice[0].ends_with("1.png"));
        assert_eq!(dataset.sample_count(), 5);

        let capped = Dataset::from_dir(dir.path(), Some(1)).unwrap();
        assert_eq!(capped.sample_count(), 3);
    }

    #[test]
    fn test_build_excludes_empty_identity() {
        let dir = tempfile::tempdir().unwrap();
        write_dataset(dir.path());
        let dataset = Dataset::from_dir(dir.path(), None).unwrap();

        let report = build_gallery(&mut small_lbph(), &dataset).unwrap();
        assert_eq!(report.gallery.len(), 2);
        assert_eq!(report.gallery.get("alice").unwrap().descriptors().len(), 2);
        assert_eq!(report.gallery.get("bob").unwrap().descriptors().len(), 1);
        assert_eq!(report.excluded, ["carol"]);
        assert_eq!(report.enrolled_samples, 3);
        assert_eq!(report.failed_samples, 2);
        assert_eq!(report.gallery.extractor(), "lbph:r1:g2x2:s16");
    }

    #[test]
    fn test_build_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        write_dataset(dir.path());
        let dataset = Dataset::from_dir(dir.path(), None).unwrap();

        let first = build_gallery(&mut small_lbph(), &dataset).unwrap();
        let second = build_gallery(&mut small_lbph(), &dataset).unwrap();
        assert_eq!(first.gallery.entries(), second.gallery.entries());
    }

    #[test]
    fn test_absent_faces_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("dave")).unwrap();
        write_face(&dir.path().join("dave/1.png"), 3);
        let dataset = Dataset::from_dir(dir.path(), None).unwrap();

        let mut no_faces = small_lbph().with_locator(Box::new(FixedDetector(vec![])));
        assert!(matches!(
            build_gallery(&mut no_faces, &dataset),
            Err(TrainingError::NoDescriptors)
        ));

        let region = FaceRegion::new(2.0, 2.0, 20.0, 20.0);
        let mut located = small_lbph().with_locator(Box::new(FixedDetector(vec![region])));
        let report = build_gallery(&mut located, &dataset).unwrap();
        assert_eq!(report.absent_samples, 0);
        assert_eq!(report.gallery.len(), 1);
    }

    #[test]
    fn test_empty_dataset() {
        let dir = tempfile::tempdir().unwrap();
        let dataset = Dataset::from_dir(dir.path(), None).unwrap();
        assert!(matches!(
            build_gallery(&mut small_lbph(), &dataset),
            Err(TrainingError::EmptyDataset)
        ));
    }

    #[test]
    fn test_dataset_add_merges() {
        let mut dataset = Dataset::new();
        dataset.add("b", vec![PathBuf::from("1.png")]);
        dataset.add("a", vec![]);
        dataset.add("b", vec![PathBuf::from("2.png")]);
        assert_eq!(dataset.len(), 2);
        assert_eq!(dataset.identities()[0].identity, "a");
        assert_eq!(dataset.identities()[1].samples.len(), 2);
    }
}
