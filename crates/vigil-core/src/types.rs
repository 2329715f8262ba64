use serde::{Deserialize, Serialize};

/// Image region of a detected face, in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

/// Face embedding vector (128-dimensional by default).
///
/// Immutable once built: the components are only reachable through
/// [`values`](Self::values).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Embedding {
    values: Vec<f64>,
}

impl Embedding {
    pub fn new(values: Vec<f64>) -> Self {
        Self { values }
    }

    pub fn values(&self) -> &[f64] {
        &self.values
    }

    pub fn dimension(&self) -> usize {
        self.values.len()
    }

    /// Compute Euclidean distance between two embeddings.
    ///
    /// Both sides must share a dimension; callers validate that at the
    /// extractor boundary.
    pub fn euclidean_distance(&self, other: &Embedding) -> f64 {
        debug_assert_eq!(self.values.len(), other.values.len());
        self.values
            .iter()
            .zip(other.values.iter())
            .map(|(a, b)| (a - b).powi(2))
            .sum::<f64>()
            .sqrt()
    }
}

/// One face found by the extractor, in detection order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub embedding: Embedding,
    pub location: BoundingBox,
}

/// Result of matching a probe embedding against a registry.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchResult {
    pub matched: bool,
    /// Euclidean distance of the nearest entry; `+inf` for an empty registry.
    pub distance: f64,
    /// Index of the nearest entry (if the registry was non-empty).
    pub index: Option<usize>,
    /// Identity of the nearest entry, only when `matched`.
    pub identity_id: Option<String>,
}

impl MatchResult {
    pub fn no_match() -> Self {
        Self {
            matched: false,
            distance: f64::INFINITY,
            index: None,
            identity_id: None,
        }
    }
}

/// Per-identity count of reference embeddings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IdentitySummary {
    pub identity_id: String,
    pub references: usize,
}
