//! vigil-core — Identity registry, embedding matching and the one-shot
//! enroll/verify workflows.
//!
//! Face detection and embedding extraction stay behind the
//! [`EmbeddingExtractor`] capability; capture devices behind [`FrameSource`].

pub mod error;
pub mod extractor;
pub mod matcher;
pub mod registry;
pub mod source;
pub mod types;
pub mod workflow;

pub use error::{Error, ErrorKind};
pub use extractor::{CommandExtractor, EmbeddingExtractor, ExtractError};
pub use matcher::{EuclideanMatcher, Matcher, DEFAULT_MATCH_THRESHOLD};
pub use registry::{Registry, RegistryError, RegistryStore};
pub use source::{CaptureError, FrameSource};
pub use types::{BoundingBox, Detection, Embedding, IdentitySummary, MatchResult};
pub use workflow::{EnrollOutcome, VerifyOutcome, WorkflowContext};

/// Embedding dimension used when none is configured.
pub const DEFAULT_EMBEDDING_DIM: usize = 128;
