//! Embedding extraction capability.
//!
//! The detection and embedding models live outside this crate. The
//! [`CommandExtractor`] runs an external helper: it receives a PNG path as
//! its last argument and prints a JSON array of detections on stdout.

use crate::types::Detection;
use image::{DynamicImage, ImageFormat};
use std::path::PathBuf;
use std::process::{Command, Stdio};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ExtractError {
    #[error("failed to encode image for extractor: {0}")]
    Encode(#[from] image::ImageError),
    #[error("extractor I/O: {0}")]
    Io(#[from] std::io::Error),
    #[error("extractor helper failed: {0}")]
    Helper(String),
    #[error("extractor output is not valid detection JSON: {0}")]
    Output(String),
    #[error("extractor returned {actual}-dim embedding, expected {expected}")]
    Dimension { expected: usize, actual: usize },
}

/// Turns an image into zero or more face embeddings, in detection order.
pub trait EmbeddingExtractor: Send + Sync {
    fn extract(&self, image: &DynamicImage) -> Result<Vec<Detection>, ExtractError>;

    /// [`extract`](Self::extract), rejecting any embedding whose dimension
    /// differs from `dimension`.
    fn extract_checked(
        &self,
        image: &DynamicImage,
        dimension: usize,
    ) -> Result<Vec<Detection>, ExtractError> {
        let detections = self.extract(image)?;
        if let Some(bad) = detections
            .iter()
            .find(|d| d.embedding.dimension() != dimension)
        {
            return Err(ExtractError::Dimension {
                expected: dimension,
                actual: bad.embedding.dimension(),
            });
        }
        Ok(detections)
    }
}

/// Extractor backed by an external helper program.
#[derive(Debug, Clone)]
pub struct CommandExtractor {
    program: PathBuf,
    args: Vec<String>,
}

impl CommandExtractor {
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    pub fn program(&self) -> &std::path::Path {
        &self.program
    }
}

impl EmbeddingExtractor for CommandExtractor {
    fn extract(&self, image: &DynamicImage) -> Result<Vec<Detection>, ExtractError> {
        let tmp = tempfile::Builder::new()
            .prefix("vigil-frame-")
            .suffix(".png")
            .tempfile()?;
        image.save_with_format(tmp.path(), ImageFormat::Png)?;

        let output = Command::new(&self.program)
            .args(&self.args)
            .arg(tmp.path())
            .stdin(Stdio::null())
            .output()?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ExtractError::Helper(format!(
                "{} exited with {}: {}",
                self.program.display(),
                output.status,
                stderr.trim()
            )));
        }

        let detections = parse_detections(&output.stdout)?;
        tracing::debug!(
            program = %self.program.display(),
            faces = detections.len(),
            "extractor helper finished"
        );
        Ok(detections)
    }
}

/// Parse the helper's stdout: `[{"embedding": [...], "location": {...}}, ...]`.
pub fn parse_detections(stdout: &[u8]) -> Result<Vec<Detection>, ExtractError> {
    serde_json::from_slice(stdout).map_err(|e| ExtractError::Output(e.to_string()))
}
