//! Matching a probe descriptor against the gallery.
//!
//! Every metric carries a [`Polarity`], and ranking and acceptance go
//! through it, so distance and similarity metrics share one code path.

use crate::gallery::Gallery;
use crate::types::{Descriptor, MatchResult, Polarity};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Invalid classifier configuration.
#[derive(Error, Debug, PartialEq)]
pub enum ClassifierError {
    #[error("k must be at least 1")]
    ZeroK,
    #[error("{threshold:?} cannot be used with the {metric} metric")]
    ThresholdPolarity { metric: Metric, threshold: Threshold },
    #[error("threshold must be finite, got {0}")]
    NonFiniteThreshold(f32),
    #[error("unknown {what} `{value}`")]
    UnknownName { what: &'static str, value: String },
}

#[derive(Error, Debug, PartialEq)]
pub enum ClassifyError {
    #[error("probe has {actual} values, gallery descriptors have {expected}")]
    DimensionMismatch { expected: usize, actual: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Metric {
    Euclidean,
    Cosine,
    /// Symmetric chi-square distance for normalized histograms.
    ChiSquare,
}

impl Metric {
    pub fn polarity(self) -> Polarity {
        match self {
            Metric::Euclidean | Metric::ChiSquare => Polarity::LowerIsBetter,
            Metric::Cosine => Polarity::HigherIsBetter,
        }
    }

    /// Score `a` against `b`. A NaN score becomes the worst possible score.
    pub fn score(self, a: &Descriptor, b: &Descriptor) -> f32 {
        let score = match self {
            Metric::Euclidean => a.euclidean_distance(b),
            Metric::Cosine => a.cosine_similarity(b),
            Metric::ChiSquare => a.chi_square_distance(b),
        };
        if score.is_nan() {
            self.polarity().worst()
        } else {
            score
        }
    }
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Metric::Euclidean => "euclidean",
            Metric::Cosine => "cosine",
            Metric::ChiSquare => "chi_square",
        })
    }
}

impl FromStr for Metric {
    type Err = ClassifierError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace('-', "_").as_str() {
            "euclidean" => Ok(Metric::Euclidean),
            "cosine" => Ok(Metric::Cosine),
            "chi_square" | "chisquare" => Ok(Metric::ChiSquare),
            _ => Err(ClassifierError::UnknownName {
                what: "distance metric",
                value: s.to_string(),
            }),
        }
    }
}

/// Acceptance threshold; the variant fixes the comparison direction.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Threshold {
    /// Accept scores `<=` this distance.
    MaxDistance(f32),
    /// Accept scores `>=` this similarity.
    MinSimilarity(f32),
}

impl Threshold {
    pub fn polarity(self) -> Polarity {
        match self {
            Threshold::MaxDistance(_) => Polarity::LowerIsBetter,
            Threshold::MinSimilarity(_) => Polarity::HigherIsBetter,
        }
    }

    pub fn value(self) -> f32 {
        match self {
            Threshold::MaxDistance(v) | Threshold::MinSimilarity(v) => v,
        }
    }

    pub fn accepts(self, score: f32) -> bool {
        match self {
            Threshold::MaxDistance(max) => score <= max,
            Threshold::MinSimilarity(min) => score >= min,
        }
    }
}

/// Strategy name as it appears in configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    Knn,
    Prototype,
}

impl FromStr for StrategyKind {
    type Err = ClassifierError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "knn" => Ok(StrategyKind::Knn),
            "prototype" | "centroid" => Ok(StrategyKind::Prototype),
            _ => Err(ClassifierError::UnknownName {
                what: "classifier strategy",
                value: s.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    /// Majority vote among the `k` best-scoring stored descriptors.
    Knn { k: usize },
    /// Best-scoring identity prototype.
    Prototype,
}

impl Strategy {
    pub fn from_kind(kind: StrategyKind, k: usize) -> Self {
        match kind {
            StrategyKind::Knn => Strategy::Knn { k },
            StrategyKind::Prototype => Strategy::Prototype,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Classifier {
    strategy: Strategy,
    metric: Metric,
    threshold: Threshold,
}

impl Classifier {
    pub fn new(strategy: Strategy, metric: Metric, threshold: Threshold) -> Result<Self, ClassifierError> {
        if let Strategy::Knn { k: 0 } = strategy {
            return Err(ClassifierError::ZeroK);
        }
        if threshold.polarity() != metric.polarity() {
            return Err(ClassifierError::ThresholdPolarity { metric, threshold });
        }
        if !threshold.value().is_finite() {
            return Err(ClassifierError::NonFiniteThreshold(threshold.value()));
        }
        Ok(Self {
            strategy,
            metric,
            threshold,
        })
    }

    pub fn strategy(&self) -> Strategy {
        self.strategy
    }

    pub fn metric(&self) -> Metric {
        self.metric
    }

    pub fn threshold(&self) -> Threshold {
        self.threshold
    }

    /// Label `probe` with the best gallery identity, or unknown.
    pub fn classify(&self, probe: &Descriptor, gallery: &Gallery) -> Result<MatchResult, ClassifyError> {
        let polarity = self.metric.polarity();
        if gallery.is_empty() {
            return Ok(MatchResult::unknown(None, polarity.worst(), polarity));
        }
        if probe.len() != gallery.dimension() {
            return Err(ClassifyError::DimensionMismatch {
                expected: gallery.dimension(),
                actual: probe.len(),
            });
        }

        let (candidate, score) = match self.strategy {
            Strategy::Knn { k } => self.nearest_neighbors(probe, gallery, k),
            Strategy::Prototype => self.nearest_prototype(probe, gallery),
        };

        let result = if self.threshold.accepts(score) {
            MatchResult {
                identity: Some(candidate.to_string()),
                candidate: Some(candidate.to_string()),
                score,
                polarity,
            }
        } else {
            MatchResult::unknown(Some(candidate.to_string()), score, polarity)
        };
        tracing::debug!(
            candidate,
            score,
            accepted = result.is_match(),
            "classified probe"
        );
        Ok(result)
    }

    fn nearest_prototype<'g>(&self, probe: &Descriptor, gallery: &'g Gallery) -> (&'g str, f32) {
        let polarity = self.metric.polarity();
        let mut best: Option<(&str, f32)> = None;
        for entry in gallery.entries() {
            let score = self.metric.score(probe, entry.prototype());
            match best {
                Some((_, incumbent)) if !polarity.is_better(score, incumbent) => {}
                _ => best = Some((entry.identity(), score)),
            }
        }
        // Non-empty gallery, so at least one prototype was scored.
        best.unwrap_or(("", polarity.worst()))
    }

    fn nearest_neighbors<'g>(&self, probe: &Descriptor, gallery: &'g Gallery, k: usize) -> (&'g str, f32) {
        let polarity = self.metric.polarity();
        let mut scored: Vec<(&str, f32)> = gallery
            .entries()
            .iter()
            .flat_map(|entry| {
                entry
                    .descriptors()
                    .iter()
                    .map(move |d| (entry.identity(), self.metric.score(probe, d)))
            })
            .collect();
        // Stable: equal scores keep storage order.
        scored.sort_by(|a, b| polarity.compare(a.1, b.1));
        scored.truncate(k);

        // Votes and aggregate score per label, in first-seen (best-first) order.
        let mut tally: Vec<(&str, usize, f32)> = Vec::new();
        let mut index: HashMap<&str, usize> = HashMap::new();
        for &(identity, score) in &scored {
            match index.get(identity) {
                Some(&i) => {
                    tally[i].1 += 1;
                    tally[i].2 += score;
                }
                None => {
                    index.insert(identity, tally.len());
                    tally.push((identity, 1, score));
                }
            }
        }

        let mut winner: Option<(&str, usize, f32)> = None;
        for &(identity, votes, aggregate) in &tally {
            let replace = match winner {
                None => true,
                Some((_, best_votes, best_aggregate)) => {
                    votes > best_votes
                        || (votes == best_votes && polarity.is_better(aggregate, best_aggregate))
                }
            };
            if replace {
                winner = Some((identity, votes, aggregate));
            }
        }

        let nearest = scored.first().map_or(polarity.worst(), |&(_, s)| s);
        match winner {
            Some((identity, _, _)) => (identity, nearest),
            None => ("", nearest),
        }
    }
}
