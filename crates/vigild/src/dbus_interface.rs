use crate::capture::CameraSource;
use crate::config::Config;
use crate::evidence::Clock;
use crate::monitor::{self, MonitorError, MonitorHandle, MonitorSettings, PresenceSession};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use vigil_core::{
    workflow, CaptureError, EmbeddingExtractor, ErrorKind, FrameSource, RegistryStore,
    WorkflowContext,
};
use zbus::interface;

pub const BUS_NAME: &str = "org.vigil.Vigil1";
pub const OBJECT_PATH: &str = "/org/vigil/Vigil1";

/// Opens the capture device for a new presence session.
pub type SourceFactory =
    dyn Fn(&Config) -> Result<Box<dyn FrameSource + Send>, CaptureError> + Send + Sync;

/// Failure returned to D-Bus callers as `"<kind>: <message>"`.
#[derive(Debug)]
pub struct ServiceError {
    pub kind: ErrorKind,
    pub message: String,
}

impl From<MonitorError> for ServiceError {
    fn from(err: MonitorError) -> Self {
        Self {
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

impl From<ServiceError> for zbus::fdo::Error {
    fn from(err: ServiceError) -> Self {
        zbus::fdo::Error::Failed(format!("{}: {}", err.kind, err.message))
    }
}

fn to_json<T: Serialize>(value: &T) -> Result<String, ServiceError> {
    serde_json::to_string(value).map_err(|e| ServiceError {
        kind: ErrorKind::Storage,
        message: format!("failed to encode reply: {e}"),
    })
}

fn internal(err: tokio::task::JoinError) -> ServiceError {
    ServiceError {
        kind: ErrorKind::Device,
        message: format!("worker task failed: {err}"),
    }
}

/// Everything a request handler needs. At most one presence session runs at a time.
pub struct ServiceState {
    pub config: Config,
    pub store: RegistryStore,
    pub extractor: Arc<dyn EmbeddingExtractor>,
    pub clock: Arc<dyn Clock>,
    open_source: Box<SourceFactory>,
    session: Mutex<Option<MonitorHandle>>,
}

impl ServiceState {
    pub fn new(
        config: Config,
        extractor: Arc<dyn EmbeddingExtractor>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self::with_source(
            config,
            extractor,
            clock,
            Box::new(|config: &Config| -> Result<Box<dyn FrameSource + Send>, CaptureError> {
                let source = CameraSource::open(&config.camera_settings())?;
                Ok(Box::new(source) as Box<dyn FrameSource + Send>)
            }),
        )
    }

    pub fn with_source(
        config: Config,
        extractor: Arc<dyn EmbeddingExtractor>,
        clock: Arc<dyn Clock>,
        open_source: Box<SourceFactory>,
    ) -> Self {
        let store = RegistryStore::open(&config.registry_path, config.embedding_dim);
        Self {
            config,
            store,
            extractor,
            clock,
            open_source,
            session: Mutex::new(None),
        }
    }

    fn workflow(&self) -> WorkflowContext<'_> {
        WorkflowContext {
            store: &self.store,
            extractor: self.extractor.as_ref(),
            threshold: self.config.match_threshold,
            archive_dir: self.config.archive_dir.as_deref(),
        }
    }

    pub async fn enroll(
        self: &Arc<Self>,
        identity_id: String,
        image: Vec<u8>,
    ) -> Result<String, ServiceError> {
        let state = Arc::clone(self);
        let outcome = tokio::task::spawn_blocking(move || {
            workflow::enroll(&state.workflow(), &identity_id, &image)
        })
        .await
        .map_err(internal)?;
        to_json(&outcome)
    }

    pub async fn verify(self: &Arc<Self>, image: Vec<u8>) -> Result<String, ServiceError> {
        let state = Arc::clone(self);
        let outcome =
            tokio::task::spawn_blocking(move || workflow::verify(&state.workflow(), &image))
                .await
                .map_err(internal)?;
        to_json(&outcome)
    }

    /// Start a session for `target`; `interval_secs == 0` uses the configured interval.
    pub async fn start_monitor(
        self: &Arc<Self>,
        target: String,
        interval_secs: u64,
    ) -> Result<String, ServiceError> {
        let mut slot = self.session.lock().await;
        if let Some(active) = slot.as_ref() {
            if !active.is_finished() {
                return Err(ServiceError {
                    kind: ErrorKind::Config,
                    message: format!("a presence session is already running ({})", active.id()),
                });
            }
        }

        let interval = match interval_secs {
            0 => self.config.monitor_interval(),
            n => Duration::from_secs(n),
        };
        let settings = MonitorSettings {
            target,
            interval,
            backoff: self.config.monitor_backoff(),
            threshold: self.config.match_threshold,
        };

        let state = Arc::clone(self);
        let session = tokio::task::spawn_blocking(move || {
            PresenceSession::start(
                settings,
                &state.store,
                Arc::clone(&state.extractor),
                &state.config.evidence_dir,
                Arc::clone(&state.clock),
                || (state.open_source)(&state.config),
            )
        })
        .await
        .map_err(internal)??;

        let handle = monitor::spawn(session)?;
        let id = handle.id().to_string();
        tracing::info!(session = %id, target = handle.target(), "presence session started");
        *slot = Some(handle);
        Ok(id)
    }

    pub async fn stop_monitor(&self, session_id: &str) -> Result<String, ServiceError> {
        let mut slot = self.session.lock().await;
        let matches = slot
            .as_ref()
            .is_some_and(|h| h.id().to_string() == session_id.trim());
        let handle = match slot.take() {
            Some(handle) if matches => handle,
            other => {
                *slot = other;
                return Err(ServiceError {
                    kind: ErrorKind::NotFound,
                    message: format!("no presence session with id {session_id:?}"),
                });
            }
        };
        let report = handle.stop().await?;
        to_json(&report)
    }

    pub async fn status(&self) -> String {
        let session = self.session.lock().await;
        let active = session.as_ref().filter(|h| !h.is_finished()).map(|h| {
            serde_json::json!({
                "session_id": h.id().to_string(),
                "target": h.target(),
            })
        });
        serde_json::json!({
            "version": env!("CARGO_PKG_VERSION"),
            "registry_path": self.store.path(),
            "dimension": self.store.dimension(),
            "threshold": self.config.match_threshold,
            "monitor_interval_secs": self.config.monitor_interval_secs,
            "extractor": self.config.extractor_program,
            "active_session": active,
        })
        .to_string()
    }

    pub async fn list_identities(self: &Arc<Self>) -> Result<String, ServiceError> {
        let state = Arc::clone(self);
        let registry = tokio::task::spawn_blocking(move || state.store.load())
            .await
            .map_err(internal)?
            .map_err(|e| ServiceError {
                kind: ErrorKind::Storage,
                message: e.to_string(),
            })?;
        to_json(&registry.identities())
    }

    /// Stop any running session; used on daemon shutdown.
    pub async fn shutdown(&self) {
        let handle = self.session.lock().await.take();
        if let Some(handle) = handle {
            match handle.stop().await {
                Ok(report) => tracing::info!(
                    session = %report.session_id,
                    flags = report.flags,
                    "session stopped on shutdown"
                ),
                Err(e) => tracing::warn!(error = %e, "session did not report on shutdown"),
            }
        }
    }
}

/// D-Bus interface for the Vigil identity daemon.
///
/// Bus name: org.vigil.Vigil1
/// Object path: /org/vigil/Vigil1
pub struct VigilService {
    pub state: Arc<ServiceState>,
}

#[interface(name = "org.vigil.Vigil1")]
impl VigilService {
    /// Register a reference embedding for `identity_id` from an encoded image.
    async fn enroll(&self, identity_id: &str, image: Vec<u8>) -> zbus::fdo::Result<String> {
        tracing::info!(identity = identity_id, bytes = image.len(), "enroll requested");
        Ok(self.state.enroll(identity_id.to_string(), image).await?)
    }

    /// Identify the face in an encoded image.
    async fn verify(&self, image: Vec<u8>) -> zbus::fdo::Result<String> {
        tracing::info!(bytes = image.len(), "verify requested");
        Ok(self.state.verify(image).await?)
    }

    async fn start_monitor(&self, target: &str, interval_secs: u64) -> zbus::fdo::Result<String> {
        tracing::info!(target, interval_secs, "start_monitor requested");
        Ok(self.state.start_monitor(target.to_string(), interval_secs).await?)
    }

    async fn stop_monitor(&self, session_id: &str) -> zbus::fdo::Result<String> {
        tracing::info!(session = session_id, "stop_monitor requested");
        Ok(self.state.stop_monitor(session_id).await?)
    }

    /// Return daemon status information.
    async fn status(&self) -> zbus::fdo::Result<String> {
        Ok(self.state.status().await)
    }

    async fn list_identities(&self) -> zbus::fdo::Result<String> {
        Ok(self.state.list_identities().await?)
    }
}
