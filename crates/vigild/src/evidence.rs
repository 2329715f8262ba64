//! Append-only evidence for presence sessions.
//!
//! Every flagged frame is written as `flagged_<timestamp>.jpg` and every
//! flag or transient error gets one JSON line in `audit.jsonl`.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use image::{DynamicImage, ImageFormat};
use serde::Serialize;
use std::borrow::Cow;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

pub const FLAG_REASON: &str = "target not detected";
const AUDIT_LOG: &str = "audit.jsonl";

#[derive(Error, Debug)]
pub enum EvidenceError {
    #[error("evidence I/O on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to encode evidence image: {0}")]
    Encode(#[from] image::ImageError),
    #[error("failed to serialize audit record: {0}")]
    Serialize(#[from] serde_json::Error),
}

fn io_err(path: &Path) -> impl FnOnce(io::Error) -> EvidenceError + '_ {
    move |source| EvidenceError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Wall-clock source for evidence timestamps.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// One cycle in which the target was not detected.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FlagEvent {
    pub timestamp: DateTime<Utc>,
    pub image: PathBuf,
    pub reason: &'static str,
    pub target: String,
}

#[derive(Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum AuditRecord<'a> {
    Flag {
        timestamp: DateTime<Utc>,
        target: &'a str,
        image: &'a Path,
        reason: &'a str,
    },
    Error {
        timestamp: DateTime<Utc>,
        target: &'a str,
        error: &'a str,
    },
}

pub struct EvidenceLogger {
    dir: PathBuf,
    clock: Arc<dyn Clock>,
    audit: File,
    last: Option<DateTime<Utc>>,
}

impl EvidenceLogger {
    /// Create the evidence directory if needed and open the audit log for appending.
    pub fn open(dir: impl Into<PathBuf>, clock: Arc<dyn Clock>) -> Result<Self, EvidenceError> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(io_err(&dir))?;
        let audit_path = dir.join(AUDIT_LOG);
        let audit = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&audit_path)
            .map_err(io_err(&audit_path))?;
        Ok(Self {
            dir,
            clock,
            audit,
            last: None,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Save `image` as evidence that `target` was absent.
    pub fn record_flag(
        &mut self,
        image: &DynamicImage,
        target: &str,
    ) -> Result<FlagEvent, EvidenceError> {
        let timestamp = self.next_timestamp();
        let path = self.write_image(image, timestamp)?;

        self.append(&AuditRecord::Flag {
            timestamp,
            target,
            image: &path,
            reason: FLAG_REASON,
        })?;

        tracing::info!(target, image = %path.display(), "flagged frame saved");
        Ok(FlagEvent {
            timestamp,
            image: path,
            reason: FLAG_REASON,
            target: target.to_string(),
        })
    }

    /// Audit a transient failure inside a session.
    pub fn record_error(&mut self, target: &str, error: &str) -> Result<(), EvidenceError> {
        let timestamp = self.next_timestamp();
        self.append(&AuditRecord::Error {
            timestamp,
            target,
            error,
        })
    }

    /// Strictly increasing within this logger, even if the clock stalls or steps back.
    fn next_timestamp(&mut self) -> DateTime<Utc> {
        let now = self.clock.now();
        let ts = match self.last {
            Some(last) if now <= last => last + ChronoDuration::microseconds(1),
            _ => now,
        };
        self.last = Some(ts);
        ts
    }

    fn write_image(
        &self,
        image: &DynamicImage,
        timestamp: DateTime<Utc>,
    ) -> Result<PathBuf, EvidenceError> {
        // JPEG has no alpha or 16-bit support.
        let encodable = match image {
            DynamicImage::ImageLuma8(_) | DynamicImage::ImageRgb8(_) => Cow::Borrowed(image),
            other => Cow::Owned(DynamicImage::ImageRgb8(other.to_rgb8())),
        };

        // Encode into a scratch file so a failed write never leaves a
        // partial image under a published name.
        let mut tmp = tempfile::Builder::new()
            .prefix(".flagged-")
            .suffix(".tmp")
            .tempfile_in(&self.dir)
            .map_err(io_err(&self.dir))?;
        {
            let mut writer = BufWriter::new(tmp.as_file_mut());
            encodable.write_to(&mut writer, ImageFormat::Jpeg)?;
            writer.flush().map_err(io_err(&self.dir))?;
        }

        let stem = format!("flagged_{}", timestamp.format("%Y%m%d_%H%M%S_%6f"));
        let mut suffix = 0u32;
        loop {
            let name = match suffix {
                0 => format!("{stem}.jpg"),
                n => format!("{stem}-{n}.jpg"),
            };
            let path = self.dir.join(name);
            match tmp.persist_noclobber(&path) {
                Ok(_) => return Ok(path),
                Err(e) if e.error.kind() == io::ErrorKind::AlreadyExists => {
                    tmp = e.file;
                    suffix += 1;
                }
                Err(e) => return Err(io_err(&path)(e.error)),
            }
        }
    }

    fn append(&mut self, record: &AuditRecord<'_>) -> Result<(), EvidenceError> {
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');
        let audit_path = self.dir.join(AUDIT_LOG);
        self.audit.write_all(&line).map_err(io_err(&audit_path))
    }
}
