//! One-shot enrollment and verification over a registry store.
//!
//! Both entry points always return a structured outcome; internal
//! failures are folded into `{success|matched: false, message, kind}`.

use crate::error::{Error, ErrorKind};
use crate::extractor::EmbeddingExtractor;
use crate::matcher::{first_match, EuclideanMatcher};
use crate::registry::{RegistryError, RegistryStore};
use image::DynamicImage;
use serde::Serialize;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

/// Collaborators shared by the enroll and verify workflows.
pub struct WorkflowContext<'a> {
    pub store: &'a RegistryStore,
    pub extractor: &'a dyn EmbeddingExtractor,
    /// Maximum Euclidean distance counted as a match.
    pub threshold: f64,
    /// When set, accepted enrollment images are kept under `<dir>/<id>/`.
    pub archive_dir: Option<&'a Path>,
}

#[derive(Debug, Clone, Serialize)]
pub struct EnrollOutcome {
    pub success: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kind: Option<ErrorKind>,
}

#[derive(Debug, Clone, Serialize)]
pub struct VerifyOutcome {
    pub matched: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub identity_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub distance: Option<f64>,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kind: Option<ErrorKind>,
}

impl VerifyOutcome {
    fn failed(err: &Error) -> Self {
        Self {
            matched: false,
            identity_id: None,
            distance: None,
            message: err.to_string(),
            kind: Some(err.kind()),
        }
    }
}

/// Register one reference embedding for `identity_id` from an encoded image.
pub fn enroll(ctx: &WorkflowContext<'_>, identity_id: &str, image: &[u8]) -> EnrollOutcome {
    match try_enroll(ctx, identity_id, image) {
        Ok(entries) => {
            tracing::info!(identity = identity_id, entries, "enrolled");
            EnrollOutcome {
                success: true,
                message: format!("identity {identity_id} enrolled"),
                kind: None,
            }
        }
        Err(err) => {
            tracing::warn!(identity = identity_id, kind = %err.kind(), error = %err, "enroll failed");
            EnrollOutcome {
                success: false,
                message: err.to_string(),
                kind: Some(err.kind()),
            }
        }
    }
}

/// Identify whoever appears in an encoded image.
pub fn verify(ctx: &WorkflowContext<'_>, image: &[u8]) -> VerifyOutcome {
    match try_verify(ctx, image) {
        Ok(outcome) => {
            tracing::info!(
                matched = outcome.matched,
                identity = outcome.identity_id.as_deref().unwrap_or("-"),
                "verify finished"
            );
            outcome
        }
        Err(err) => {
            tracing::warn!(kind = %err.kind(), error = %err, "verify failed");
            VerifyOutcome::failed(&err)
        }
    }
}

fn try_enroll(ctx: &WorkflowContext<'_>, identity_id: &str, bytes: &[u8]) -> Result<usize, Error> {
    // Ids are stored verbatim; blank ones are rejected.
    if identity_id.trim().is_empty() {
        return Err(Error::Validation("identity id must not be empty".into()));
    }

    let image = decode(bytes)?;
    let detections = ctx.extractor.extract_checked(&image, ctx.store.dimension())?;
    let faces = detections.len();
    let first = detections.into_iter().next().ok_or_else(Error::no_face)?;
    if faces > 1 {
        tracing::debug!(faces, "multiple faces in enrollment image; using the first");
    }

    let archived = ctx
        .archive_dir
        .map(|dir| archive_reference(dir, identity_id, bytes))
        .transpose()?;

    ctx.store
        .append(identity_id, first.embedding)
        .map_err(|err| {
            if let Some(path) = &archived {
                discard_archived(path);
            }
            Error::from(err)
        })
}

fn try_verify(ctx: &WorkflowContext<'_>, bytes: &[u8]) -> Result<VerifyOutcome, Error> {
    let image = decode(bytes)?;
    let detections = ctx.extractor.extract_checked(&image, ctx.store.dimension())?;
    if detections.is_empty() {
        return Err(Error::no_face());
    }

    let registry = ctx.store.load()?;
    let probes = detections.iter().map(|d| &d.embedding);

    Ok(match first_match(&EuclideanMatcher, probes, &registry, ctx.threshold) {
        Some(result) => {
            let id = result.identity_id.unwrap_or_default();
            VerifyOutcome {
                matched: true,
                message: format!("match found: {id}"),
                identity_id: Some(id),
                distance: Some(result.distance),
                kind: None,
            }
        }
        None => VerifyOutcome {
            matched: false,
            identity_id: None,
            distance: None,
            message: "no match found".into(),
            kind: None,
        },
    })
}

fn decode(bytes: &[u8]) -> Result<DynamicImage, Error> {
    image::load_from_memory(bytes).map_err(|e| Error::Validation(format!("unreadable image: {e}")))
}

/// Write the accepted image to `<dir>/<sanitized id>/<timestamp>.<ext>`.
fn archive_reference(dir: &Path, identity_id: &str, bytes: &[u8]) -> Result<PathBuf, Error> {
    let ext = image::guess_format(bytes)
        .ok()
        .and_then(|f| f.extensions_str().first().copied())
        .unwrap_or("img");
    let folder = dir.join(sanitize(identity_id));
    fs::create_dir_all(&folder).map_err(|e| RegistryError::io(&folder, e))?;

    let stamp = chrono::Utc::now().format("%Y%m%d_%H%M%S_%6f").to_string();
    let mut attempt = 0u32;
    loop {
        let name = match attempt {
            0 => format!("{stamp}.{ext}"),
            n => format!("{stamp}-{n}.{ext}"),
        };
        let path = folder.join(name);
        match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(mut file) => {
                file.write_all(bytes)
                    .and_then(|()| file.sync_all())
                    .map_err(|e| {
                        let _ = fs::remove_file(&path);
                        RegistryError::io(&path, e)
                    })?;
                tracing::debug!(path = %path.display(), "reference image archived");
                return Ok(path);
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => attempt += 1,
            Err(e) => return Err(RegistryError::io(&path, e).into()),
        }
    }
}

/// Remove an archived image and its identity folder if that leaves it empty.
fn discard_archived(path: &Path) {
    if let Err(e) = fs::remove_file(path) {
        tracing::warn!(path = %path.display(), error = %e, "failed to discard archived image");
        return;
    }
    if let Some(folder) = path.parent() {
        // Fails harmlessly when other references are still archived there.
        let _ = fs::remove_dir(folder);
    }
}

/// Folder name for an opaque identity id.
///
/// Percent-encodes every byte outside `[A-Za-z0-9_-]`, so distinct ids get
/// distinct folders and none can contain a path separator or `..`.
fn sanitize(identity_id: &str) -> String {
    let mut out = String::with_capacity(identity_id.len());
    for b in identity_id.bytes() {
        if b.is_ascii_alphanumeric() || b == b'-' || b == b'_' {
            out.push(char::from(b));
        } else {
            out.push_str(&format!("%{b:02X}"));
        }
    }
    out
}
