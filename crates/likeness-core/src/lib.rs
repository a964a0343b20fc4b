//! likeness-core: closed-set face identification.
//!
//! Faces are turned into fixed-length descriptors (ONNX embeddings, LBP
//! histograms or landmark geometry), enrolled into a persisted gallery and
//! matched by k-NN or prototype classification, either on still images or
//! frame by frame through [`RealtimeLoop`].

pub mod alignment;
pub mod classifier;
pub mod detector;
pub mod engine;
pub mod extractor;
pub mod gallery;
pub mod histogram;
pub mod realtime;
pub mod recognizer;
pub mod training;
pub mod types;

pub use classifier::{Classifier, Metric, Strategy, StrategyKind, Threshold};
pub use detector::{FaceDetector, ScrfdDetector};
pub use engine::{Engine, Identification};
pub use extractor::{Encoder, FeatureExtractor};
pub use gallery::Gallery;
pub use histogram::LbphParams;
pub use realtime::{CancelToken, FrameSink, FrameSource, RealtimeLoop};
pub use recognizer::{EmbedderInput, EmbeddingModel, OnnxEmbedder};
pub use training::{build_gallery, Dataset, TrainingReport};
pub use types::{Descriptor, FaceRegion, Frame, MatchResult, Polarity};
