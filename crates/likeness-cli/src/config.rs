use anyhow::{Context, Result};
use clap::ValueEnum;
use likeness_core::classifier::{Classifier, ClassifierError, Metric, Strategy, StrategyKind, Threshold};
use likeness_core::recognizer::EmbedderInput;
use likeness_core::LbphParams;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Which descriptor the extractor produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum ExtractorKind {
    /// ONNX embedding network on aligned face crops.
    Embedding,
    /// LBP spatial histograms on grayscale crops.
    Histogram,
    /// Five-point landmark geometry.
    Landmarks,
}

impl std::str::FromStr for ExtractorKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        <Self as ValueEnum>::from_str(s, true)
    }
}

/// Runtime configuration: TOML file, then `LIKENESS_*` variables, then flags.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub extractor: ExtractorKind,
    pub classifier_strategy: StrategyKind,
    /// Defaults to the extractor's natural metric when unset.
    pub distance_metric: Option<Metric>,
    /// Neighbor count for the k-NN strategy.
    pub k: usize,
    /// Defaults per metric when unset; see [`Config::threshold`].
    pub accept_threshold: Option<Threshold>,
    /// Expected length of the embedding network's output.
    pub embedding_dimension: usize,
    pub embedding_model: String,
    pub embedding_input_size: u32,
    pub embedding_mean: f32,
    pub embedding_std: f32,
    pub detector_model: String,
    pub detection_confidence: f32,
    pub model_dir: PathBuf,
    pub gallery_path: PathBuf,
    /// Camera index, device path, image file or directory of frames.
    pub video_source: String,
    pub capture_width: u32,
    pub capture_height: u32,
    pub lbph: LbphParams,
    pub max_per_identity: Option<usize>,
}

impl Default for Config {
    fn default() -> Self {
        let data_dir = data_dir();
        Self {
            extractor: ExtractorKind::Embedding,
            classifier_strategy: StrategyKind::Prototype,
            distance_metric: None,
            k: 3,
            accept_threshold: None,
            embedding_dimension: 512,
            embedding_model: "w600k_r50.onnx".to_string(),
            embedding_input_size: EmbedderInput::ARCFACE.size,
            embedding_mean: EmbedderInput::ARCFACE.mean,
            embedding_std: EmbedderInput::ARCFACE.std,
            detector_model: "det_10g.onnx".to_string(),
            detection_confidence: 0.5,
            model_dir: data_dir.join("models"),
            gallery_path: data_dir.join("gallery.json"),
            video_source: "0".to_string(),
            capture_width: 640,
            capture_height: 480,
            lbph: LbphParams::default(),
            max_per_identity: None,
        }
    }
}

impl Config {
    /// Read `path`, or `$LIKENESS_CONFIG`, or start from defaults; then apply
    /// the environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = path
            .map(Path::to_path_buf)
            .or_else(|| std::env::var("LIKENESS_CONFIG").ok().map(PathBuf::from));

        let mut config = match &path {
            Some(path) => {
                let text = std::fs::read_to_string(path)
                    .with_context(|| format!("reading config {}", path.display()))?;
                toml::from_str(&text).with_context(|| format!("parsing config {}", path.display()))?
            }
            None => Config::default(),
        };
        config.apply_env(|key| std::env::var(key).ok());
        tracing::debug!(config = ?config, file = ?path, "configuration loaded");
        Ok(config)
    }

    /// Override fields from `LIKENESS_*` variables looked up through `var`.
    pub fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(v) = env_parsed(&var, "LIKENESS_EXTRACTOR") {
            self.extractor = v;
        }
        if let Some(v) = env_parsed(&var, "LIKENESS_STRATEGY") {
            self.classifier_strategy = v;
        }
        if let Some(v) = env_parsed(&var, "LIKENESS_METRIC") {
            self.distance_metric = Some(v);
        }
        if let Some(v) = env_parsed(&var, "LIKENESS_K") {
            self.k = v;
        }
        if let Some(v) = env_parsed(&var, "LIKENESS_MAX_DISTANCE") {
            self.accept_threshold = Some(Threshold::MaxDistance(v));
        }
        if let Some(v) = env_parsed(&var, "LIKENESS_MIN_SIMILARITY") {
            self.accept_threshold = Some(Threshold::MinSimilarity(v));
        }
        if let Some(v) = env_parsed(&var, "LIKENESS_EMBEDDING_DIMENSION") {
            self.embedding_dimension = v;
        }
        if let Some(v) = var("LIKENESS_EMBEDDING_MODEL") {
            self.embedding_model = v;
        }
        if let Some(v) = var("LIKENESS_DETECTOR_MODEL") {
            self.detector_model = v;
        }
        if let Some(v) = var("LIKENESS_MODEL_DIR") {
            self.model_dir = PathBuf::from(v);
        }
        if let Some(v) = var("LIKENESS_GALLERY") {
            self.gallery_path = PathBuf::from(v);
        }
        if let Some(v) = var("LIKENESS_VIDEO_SOURCE") {
            self.video_source = v;
        }
    }

    /// Configured metric, or the one suited to the extractor.
    pub fn metric(&self) -> Metric {
        self.distance_metric.unwrap_or(match self.extractor {
            ExtractorKind::Embedding => Metric::Cosine,
            ExtractorKind::Histogram => Metric::ChiSquare,
            ExtractorKind::Landmarks => Metric::Euclidean,
        })
    }

    /// Configured threshold, or the default for the metric.
    pub fn threshold(&self) -> Threshold {
        self.accept_threshold.unwrap_or(match self.metric() {
            Metric::Cosine => Threshold::MinSimilarity(0.5),
            Metric::ChiSquare => Threshold::MaxDistance(55.0),
            // Unit vectors: distance 1.0 is cosine similarity 0.5.
            Metric::Euclidean => Threshold::MaxDistance(1.0),
        })
    }

    pub fn classifier(&self) -> Result<Classifier, ClassifierError> {
        Classifier::new(
            Strategy::from_kind(self.classifier_strategy, self.k),
            self.metric(),
            self.threshold(),
        )
    }

    pub fn embedder_input(&self) -> EmbedderInput {
        EmbedderInput {
            size: self.embedding_input_size,
            mean: self.embedding_mean,
            std: self.embedding_std,
        }
    }

    pub fn detector_model_path(&self) -> PathBuf {
        self.model_dir.join(&self.detector_model)
    }

    pub fn embedding_model_path(&self) -> PathBuf {
        self.model_dir.join(&self.embedding_model)
    }

    /// Reject combinations that cannot work before any model is loaded.
    pub fn validate(&self) -> Result<()> {
        self.classifier().context("invalid classifier configuration")?;
        if self.extractor == ExtractorKind::Histogram {
            self.lbph
                .validate()
                .map_err(|e| anyhow::anyhow!("invalid lbph configuration: {e}"))?;
        }
        if self.extractor == ExtractorKind::Embedding {
            anyhow::ensure!(self.embedding_dimension > 0, "embedding_dimension must be positive");
            anyhow::ensure!(self.embedding_input_size > 0, "embedding_input_size must be positive");
            anyhow::ensure!(self.embedding_std != 0.0, "embedding_std must be non-zero");
        }
        Ok(())
    }
}

/// `$XDG_DATA_HOME/likeness`, falling back to `~/.local/share/likeness`.
fn data_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("likeness")
}

fn env_parsed<T: std::str::FromStr>(var: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    let value = var(key)?;
    match value.trim().parse() {
        Ok(v) => Some(v),
        Err(_) => {
            tracing::warn!(key, value = %value, "ignoring unparsable environment override");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_per_extractor() {
        let config = Config::default();
        assert_eq!(config.metric(), Metric::Cosine);
        assert_eq!(config.threshold(), Threshold::MinSimilarity(0.5));
        assert!(config.classifier().is_ok());

        let lbph = Config {
            extractor: ExtractorKind::Histogram,
            ..Config::default()
        };
        assert_eq!(lbph.metric(), Metric::ChiSquare);
        assert_eq!(lbph.threshold(), Threshold::MaxDistance(55.0));
    }

    #[test]
    fn test_toml_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("likeness.toml");
        std::fs::write(
            &path,
            r#"
extractor = "histogram"
classifier_strategy = "knn"
k = 5
distance_metric = "chi_square"
accept_threshold = { max_distance = 40.0 }
video_source = "/dev/video2"

[lbph]
grid_x = 4
grid_y = 4
"#,
        )
        .unwrap();

        let config = Config::load(Some(&path)).unwrap();
        assert_eq!(config.extractor, ExtractorKind::Histogram);
        assert_eq!(config.classifier_strategy, StrategyKind::Knn);
        assert_eq!(config.k, 5);
        assert_eq!(config.threshold(), Threshold::MaxDistance(40.0));
        assert_eq!(config.lbph.grid_x, 4);
        assert_eq!(config.lbph.input_size, 200);
        assert_eq!(
            config.classifier().unwrap().strategy(),
            Strategy::Knn { k: 5 }
        );
    }

    #[test]
    fn test_unknown_key_rejected() {
        assert!(toml::from_str::<Config>("threshhold = 3").is_err());
    }

    #[test]
    fn test_env_overrides() {
        let mut config = Config::default();
        config.apply_env(env(&[
            ("LIKENESS_EXTRACTOR", "histogram"),
            ("LIKENESS_STRATEGY", "knn"),
            ("LIKENESS_K", "7"),
            ("LIKENESS_MAX_DISTANCE", "30"),
            ("LIKENESS_MODEL_DIR", "/opt/models"),
            ("LIKENESS_EMBEDDING_DIMENSION", "not-a-number"),
        ]));
        assert_eq!(config.extractor, ExtractorKind::Histogram);
        assert_eq!(config.classifier_strategy, StrategyKind::Knn);
        assert_eq!(config.k, 7);
        assert_eq!(config.threshold(), Threshold::MaxDistance(30.0));
        assert_eq!(config.detector_model_path(), PathBuf::from("/opt/models/det_10g.onnx"));
        assert_eq!(config.embedding_dimension, 512);
    }

    #[test]
    fn test_mismatched_threshold_rejected() {
        let config = Config {
            accept_threshold: Some(Threshold::MaxDistance(0.4)),
            ..Config::default()
        };
        assert!(matches!(
            config.classifier(),
            Err(ClassifierError::ThresholdPolarity { .. })
        ));
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_k_rejected() {
        let config = Config {
            classifier_strategy: StrategyKind::Knn,
            k: 0,
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }
}
