//! Identity registry: index-aligned (id, embedding) pairs persisted as one
//! JSON document.
//!
//! Writes go to a temporary file in the same directory and are renamed over
//! the target, so readers only ever see a fully published registry.
//! [`RegistryStore::append`] holds an exclusive `flock` on `<file>.lock`
//! for the whole load → push → save cycle; concurrent writers in other
//! threads or processes queue behind it.

use crate::types::{Embedding, IdentitySummary};
use nix::fcntl::{Flock, FlockArg};
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

const REGISTRY_FORMAT_VERSION: u32 = 1;

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("I/O on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("registry file is corrupt: {0}")]
    Corrupt(String),
    #[error("embedding dimension mismatch: expected {expected}, got {actual}")]
    Dimension { expected: usize, actual: usize },
    #[error("failed to lock registry: {0}")]
    Lock(String),
}

impl RegistryError {
    pub(crate) fn io(path: &Path, source: io::Error) -> Self {
        RegistryError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// In-memory registry. Insertion order decides match tie-breaks.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Registry {
    ids: Vec<String>,
    embeddings: Vec<Embedding>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from parallel sequences; `None` if their lengths differ.
    pub fn from_parts(ids: Vec<String>, embeddings: Vec<Embedding>) -> Option<Self> {
        (ids.len() == embeddings.len()).then_some(Self { ids, embeddings })
    }

    pub fn push(&mut self, identity_id: impl Into<String>, embedding: Embedding) {
        self.ids.push(identity_id.into());
        self.embeddings.push(embedding);
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<(&str, &Embedding)> {
        Some((self.ids.get(index)?.as_str(), self.embeddings.get(index)?))
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Embedding)> {
        self.ids
            .iter()
            .map(String::as_str)
            .zip(self.embeddings.iter())
    }

    pub fn ids(&self) -> &[String] {
        &self.ids
    }

    pub fn embeddings(&self) -> &[Embedding] {
        &self.embeddings
    }

    pub fn contains(&self, identity_id: &str) -> bool {
        self.ids.iter().any(|id| id == identity_id)
    }

    /// All reference embeddings enrolled under `identity_id`, in insertion order.
    pub fn references_for(&self, identity_id: &str) -> Registry {
        let mut subset = Registry::new();
        for (id, embedding) in self.iter().filter(|(id, _)| *id == identity_id) {
            subset.push(id, embedding.clone());
        }
        subset
    }

    /// Reference counts per identity, ordered by first enrollment.
    pub fn identities(&self) -> Vec<IdentitySummary> {
        let mut out: Vec<IdentitySummary> = Vec::new();
        for id in &self.ids {
            match out.iter_mut().find(|s| &s.identity_id == id) {
                Some(summary) => summary.references += 1,
                None => out.push(IdentitySummary {
                    identity_id: id.clone(),
                    references: 1,
                }),
            }
        }
        out
    }
}

#[derive(Serialize)]
struct RegistryDocRef<'a> {
    version: u32,
    dimension: usize,
    ids: &'a [String],
    embeddings: &'a [Embedding],
}

#[derive(Deserialize)]
struct RegistryDoc {
    version: u32,
    dimension: usize,
    ids: Vec<String>,
    embeddings: Vec<Embedding>,
}

/// File-backed registry with a defined load / lock / append / save lifecycle.
#[derive(Debug, Clone)]
pub struct RegistryStore {
    path: PathBuf,
    dimension: usize,
}

impl RegistryStore {
    /// Bind a store to `path`. Nothing is read until [`load`](Self::load).
    pub fn open(path: impl Into<PathBuf>, dimension: usize) -> Self {
        Self {
            path: path.into(),
            dimension,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    /// Read the published registry; an absent file is an empty registry.
    pub fn load(&self) -> Result<Registry, RegistryError> {
        let bytes = match fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                tracing::debug!(path = %self.path.display(), "registry absent; starting empty");
                return Ok(Registry::new());
            }
            Err(e) => return Err(RegistryError::io(&self.path, e)),
        };

        let doc: RegistryDoc = serde_json::from_slice(&bytes)
            .map_err(|e| RegistryError::Corrupt(format!("{}: {e}", self.path.display())))?;

        if doc.version != REGISTRY_FORMAT_VERSION {
            return Err(RegistryError::Corrupt(format!(
                "unsupported format version {} (expected {REGISTRY_FORMAT_VERSION})",
                doc.version
            )));
        }
        if doc.dimension != self.dimension {
            return Err(RegistryError::Dimension {
                expected: self.dimension,
                actual: doc.dimension,
            });
        }
        if let Some(bad) = doc
            .embeddings
            .iter()
            .position(|e| e.dimension() != self.dimension)
        {
            return Err(RegistryError::Corrupt(format!(
                "entry {bad} has dimension {}, expected {}",
                doc.embeddings[bad].dimension(),
                self.dimension
            )));
        }

        let (ids_len, emb_len) = (doc.ids.len(), doc.embeddings.len());
        Registry::from_parts(doc.ids, doc.embeddings).ok_or_else(|| {
            RegistryError::Corrupt(format!("{ids_len} ids but {emb_len} embeddings"))
        })
    }

    /// Persist the whole registry atomically (temp file + fsync + rename).
    pub fn save(&self, registry: &Registry) -> Result<(), RegistryError> {
        if let Some(e) = registry
            .embeddings()
            .iter()
            .find(|e| e.dimension() != self.dimension)
        {
            return Err(RegistryError::Dimension {
                expected: self.dimension,
                actual: e.dimension(),
            });
        }

        let dir = self.parent_dir();
        fs::create_dir_all(dir).map_err(|e| RegistryError::io(dir, e))?;

        let mut tmp = tempfile::Builder::new()
            .prefix(".registry-")
            .suffix(".tmp")
            .tempfile_in(dir)
            .map_err(|e| RegistryError::io(dir, e))?;

        let doc = RegistryDocRef {
            version: REGISTRY_FORMAT_VERSION,
            dimension: self.dimension,
            ids: registry.ids(),
            embeddings: registry.embeddings(),
        };

        {
            let mut writer = BufWriter::new(tmp.as_file_mut());
            serde_json::to_writer(&mut writer, &doc)
                .map_err(|e| RegistryError::io(&self.path, e.into()))?;
            writer
                .flush()
                .map_err(|e| RegistryError::io(&self.path, e))?;
        }
        tmp.as_file()
            .sync_all()
            .map_err(|e| RegistryError::io(&self.path, e))?;

        tmp.persist(&self.path)
            .map_err(|e| RegistryError::io(&self.path, e.error))?;

        tracing::debug!(path = %self.path.display(), entries = registry.len(), "registry published");
        Ok(())
    }

    /// Append one pair and persist, as a single critical section.
    ///
    /// Returns the registry length after the append.
    pub fn append(&self, identity_id: &str, embedding: Embedding) -> Result<usize, RegistryError> {
        if embedding.dimension() != self.dimension {
            return Err(RegistryError::Dimension {
                expected: self.dimension,
                actual: embedding.dimension(),
            });
        }

        let _guard = self.lock()?;
        let mut registry = self.load()?;
        registry.push(identity_id, embedding);
        self.save(&registry)?;

        tracing::info!(
            identity = identity_id,
            entries = registry.len(),
            "registry entry appended"
        );
        Ok(registry.len())
    }

    /// Take the exclusive writer lock; released when the guard drops.
    fn lock(&self) -> Result<Flock<File>, RegistryError> {
        let dir = self.parent_dir();
        fs::create_dir_all(dir).map_err(|e| RegistryError::io(dir, e))?;

        let lock_path = self.lock_path();
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(&lock_path)
            .map_err(|e| RegistryError::io(&lock_path, e))?;

        Flock::lock(file, FlockArg::LockExclusive)
            .map_err(|(_, errno)| RegistryError::Lock(format!("{}: {errno}", lock_path.display())))
    }

    fn lock_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| "registry".into());
        name.push(".lock");
        self.path.with_file_name(name)
    }

    fn parent_dir(&self) -> &Path {
        match self.path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p,
            _ => Path::new("."),
        }
    }
}
