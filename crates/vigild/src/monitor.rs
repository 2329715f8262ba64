//! Presence monitoring sessions.
//!
//! A session resolves its target's reference embeddings once, acquires the
//! capture device, then polls: capture → extract → match → flag on absence
//! → sleep. The loop checks its cancellation token between cycles and while
//! sleeping, never inside a capture or extraction call. The device is owned
//! by the session and dropped before the final report is produced.

use crate::evidence::{Clock, EvidenceError, EvidenceLogger};
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;
use vigil_core::{
    CaptureError, EmbeddingExtractor, ErrorKind, EuclideanMatcher, ExtractError, FrameSource,
    Matcher, Registry, RegistryError, RegistryStore,
};

#[derive(Error, Debug)]
pub enum MonitorError {
    #[error("{0}")]
    Config(String),
    #[error("registry unavailable: {0}")]
    Storage(#[from] RegistryError),
    #[error("evidence store unavailable: {0}")]
    Evidence(#[from] EvidenceError),
    #[error("{0}")]
    Capture(#[from] CaptureError),
    #[error("{0}")]
    Extract(#[from] ExtractError),
    #[error("failed to start monitor thread: {0}")]
    Spawn(std::io::Error),
    #[error("monitor session ended without a report")]
    Aborted,
}

impl MonitorError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            MonitorError::Config(_) => ErrorKind::Config,
            MonitorError::Storage(_) | MonitorError::Evidence(_) => ErrorKind::Storage,
            MonitorError::Capture(_)
            | MonitorError::Extract(_)
            | MonitorError::Spawn(_)
            | MonitorError::Aborted => ErrorKind::Device,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MonitorState {
    Init,
    Running,
    Stopped,
    Error,
}

#[derive(Debug, Clone)]
pub struct MonitorSettings {
    pub target: String,
    /// Sleep between cycles.
    pub interval: Duration,
    /// Sleep after a failed capture or extraction; shorter than `interval`.
    pub backoff: Duration,
    pub threshold: f64,
}

impl MonitorSettings {
    fn validate(&self) -> Result<(), MonitorError> {
        if self.target.trim().is_empty() {
            return Err(MonitorError::Config("target identity must not be empty".into()));
        }
        if self.interval.is_zero() {
            return Err(MonitorError::Config("polling interval must be > 0".into()));
        }
        if self.backoff.is_zero() || self.backoff >= self.interval {
            return Err(MonitorError::Config(format!(
                "backoff ({:?}) must be > 0 and shorter than the polling interval ({:?})",
                self.backoff, self.interval
            )));
        }
        Ok(())
    }
}

/// Counters reported when a session ends.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionReport {
    pub session_id: String,
    pub target: String,
    pub cycles: u64,
    pub present: u64,
    pub absent: u64,
    pub flags: u64,
    pub transient_failures: u64,
    pub state: MonitorState,
}

pub struct PresenceSession<S> {
    id: Uuid,
    settings: MonitorSettings,
    references: Registry,
    dimension: usize,
    extractor: Arc<dyn EmbeddingExtractor>,
    evidence: EvidenceLogger,
    source: S,
    state: MonitorState,
    report: SessionReport,
}

impl<S: FrameSource> PresenceSession<S> {
    /// Init: validate, resolve the target, open evidence storage, then
    /// acquire the device. Nothing is opened if an earlier step fails.
    pub fn start<F>(
        settings: MonitorSettings,
        store: &RegistryStore,
        extractor: Arc<dyn EmbeddingExtractor>,
        evidence_dir: &Path,
        clock: Arc<dyn Clock>,
        open_source: F,
    ) -> Result<Self, MonitorError>
    where
        F: FnOnce() -> Result<S, CaptureError>,
    {
        let id = Uuid::new_v4();
        let result = Self::init(id, settings, store, extractor, evidence_dir, clock, open_source);
        if let Err(err) = &result {
            tracing::error!(
                session = %id,
                state = ?MonitorState::Error,
                kind = %err.kind(),
                error = %err,
                "presence session failed to start"
            );
        }
        result
    }

    fn init<F>(
        id: Uuid,
        settings: MonitorSettings,
        store: &RegistryStore,
        extractor: Arc<dyn EmbeddingExtractor>,
        evidence_dir: &Path,
        clock: Arc<dyn Clock>,
        open_source: F,
    ) -> Result<Self, MonitorError>
    where
        F: FnOnce() -> Result<S, CaptureError>,
    {
        settings.validate()?;

        let references = store.load()?.references_for(&settings.target);
        if references.is_empty() {
            return Err(MonitorError::Config(format!(
                "unknown target identity {:?}",
                settings.target
            )));
        }

        let evidence = EvidenceLogger::open(evidence_dir, clock)?;
        let source = open_source()?;

        tracing::info!(
            session = %id,
            target = %settings.target,
            references = references.len(),
            interval = ?settings.interval,
            evidence = %evidence.dir().display(),
            "presence session initialized"
        );

        let report = SessionReport {
            session_id: id.to_string(),
            target: settings.target.clone(),
            cycles: 0,
            present: 0,
            absent: 0,
            flags: 0,
            transient_failures: 0,
            state: MonitorState::Init,
        };

        Ok(Self {
            id,
            settings,
            references,
            dimension: store.dimension(),
            extractor,
            evidence,
            source,
            state: MonitorState::Init,
            report,
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn target(&self) -> &str {
        &self.settings.target
    }

    pub fn state(&self) -> MonitorState {
        self.state
    }

    /// Run until `cancel` fires; the device is released before returning.
    pub async fn run(mut self, cancel: CancellationToken) -> SessionReport {
        self.transition(MonitorState::Running);

        while !cancel.is_cancelled() {
            let started = Instant::now();
            let pause = match self.cycle() {
                Ok(()) => self.settings.interval,
                Err(err) => {
                    self.report.transient_failures += 1;
                    tracing::warn!(
                        session = %self.id,
                        error = %err,
                        backoff = ?self.settings.backoff,
                        "monitor cycle failed; retrying after backoff"
                    );
                    let audited = self
                        .evidence
                        .record_error(&self.settings.target, &err.to_string());
                    if let Err(e) = audited {
                        tracing::error!(session = %self.id, error = %e, "failed to audit cycle error");
                    }
                    self.settings.backoff
                }
            };

            let took = started.elapsed();
            if took > self.settings.interval {
                tracing::warn!(
                    session = %self.id,
                    took = ?took,
                    "monitor cycle slower than polling interval"
                );
            }

            if sleep_or_cancel(&cancel, pause).await {
                break;
            }
        }

        self.transition(MonitorState::Stopped);
        let report = self.report.clone();
        drop(self);
        tracing::info!(
            session = %report.session_id,
            cycles = report.cycles,
            flags = report.flags,
            "presence session stopped"
        );
        report
    }

    fn cycle(&mut self) -> Result<(), MonitorError> {
        self.report.cycles += 1;
        let image = self.source.capture()?;

        if self.is_present(&image)? {
            self.report.present += 1;
            tracing::debug!(session = %self.id, "target present");
            return Ok(());
        }

        self.report.absent += 1;
        match self.evidence.record_flag(&image, &self.settings.target) {
            Ok(_) => self.report.flags += 1,
            Err(e) => {
                tracing::error!(session = %self.id, error = %e, "failed to record flag event");
            }
        }
        Ok(())
    }

    /// True if any detected face is within the threshold of any reference.
    fn is_present(&self, image: &image::DynamicImage) -> Result<bool, ExtractError> {
        let detections = self.extractor.extract_checked(image, self.dimension)?;
        if detections.is_empty() {
            tracing::debug!(session = %self.id, "no faces detected in frame");
            return Ok(false);
        }
        Ok(detections.iter().any(|d| {
            EuclideanMatcher
                .compare(&d.embedding, &self.references, self.settings.threshold)
                .matched
        }))
    }

    fn transition(&mut self, next: MonitorState) {
        tracing::debug!(session = %self.id, from = ?self.state, to = ?next, "monitor state");
        self.state = next;
        self.report.state = next;
    }
}

/// Returns true if cancelled before `duration` elapsed.
async fn sleep_or_cancel(cancel: &CancellationToken, duration: Duration) -> bool {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => true,
        _ = tokio::time::sleep(duration) => false,
    }
}

/// Control handle for a session running on its own thread.
pub struct MonitorHandle {
    id: Uuid,
    target: String,
    cancel: CancellationToken,
    done: oneshot::Receiver<SessionReport>,
    thread: std::thread::JoinHandle<()>,
}

/// Run `session` on a dedicated `vigil-monitor` thread with its own
/// current-thread runtime; blocking capture and extraction stay off the
/// caller's executor.
pub fn spawn<S>(session: PresenceSession<S>) -> Result<MonitorHandle, MonitorError>
where
    S: FrameSource + Send + 'static,
{
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .build()
        .map_err(MonitorError::Spawn)?;

    let id = session.id();
    let target = session.target().to_string();
    tracing::debug!(session = %id, state = ?session.state(), "handing session to monitor thread");
    let cancel = CancellationToken::new();
    let (tx, rx) = oneshot::channel();

    let token = cancel.clone();
    let thread = std::thread::Builder::new()
        .name("vigil-monitor".into())
        .spawn(move || {
            let report = runtime.block_on(session.run(token));
            let _ = tx.send(report);
        })
        .map_err(MonitorError::Spawn)?;

    Ok(MonitorHandle {
        id,
        target,
        cancel,
        done: rx,
        thread,
    })
}

impl MonitorHandle {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn is_finished(&self) -> bool {
        self.thread.is_finished()
    }

    /// Signal cancellation and wait until the device has been released.
    pub async fn stop(self) -> Result<SessionReport, MonitorError> {
        tracing::info!(session = %self.id, "stopping presence session");
        self.cancel.cancel();
        self.done.await.map_err(|_| MonitorError::Aborted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::evidence::tests::frozen;
    use image::{DynamicImage, GrayImage, Luma};
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use vigil_core::{BoundingBox, Detection, Embedding};

    const TARGET: u8 = 1;
    const STRANGER: u8 = 2;
    const EMPTY: u8 = 0;

    fn frame(key: u8) -> DynamicImage {
        DynamicImage::ImageLuma8(GrayImage::from_pixel(4, 4, Luma([key])))
    }

    /// Target at the origin, stranger far away, `EMPTY` has no faces.
    struct KeyedExtractor;

    impl EmbeddingExtractor for KeyedExtractor {
        fn extract(&self, image: &DynamicImage) -> Result<Vec<Detection>, ExtractError> {
            let values = match image.to_luma8().get_pixel(0, 0).0[0] {
                TARGET => vec![vec![0.1, 0.0]],
                STRANGER => vec![vec![5.0, 5.0]],
                _ => vec![],
            };
            Ok(values
                .into_iter()
                .map(|v| Detection {
                    embedding: Embedding::new(v),
                    location: BoundingBox { x: 0.0, y: 0.0, width: 4.0, height: 4.0 },
                })
                .collect())
        }
    }

    /// Replays a script of frames; cancels the session after the last one.
    struct ScriptedSource {
        frames: VecDeque<Result<DynamicImage, CaptureError>>,
        cancel: CancellationToken,
        released: Arc<AtomicBool>,
    }

    impl FrameSource for ScriptedSource {
        fn capture(&mut self) -> Result<DynamicImage, CaptureError> {
            let next = self
                .frames
                .pop_front()
                .unwrap_or_else(|| Err(CaptureError::Failed("script exhausted".into())));
            if self.frames.is_empty() {
                self.cancel.cancel();
            }
            next
        }
    }

    impl Drop for ScriptedSource {
        fn drop(&mut self) {
            self.released.store(true, Ordering::SeqCst);
        }
    }

    fn settings(target: &str) -> MonitorSettings {
        MonitorSettings {
            target: target.into(),
            interval: Duration::from_secs(60),
            backoff: Duration::from_secs(5),
            threshold: 0.6,
        }
    }

    fn seeded_store(dir: &Path) -> RegistryStore {
        let store = RegistryStore::open(dir.join("registry.json"), 2);
        store.append("other", Embedding::new(vec![9.0, 9.0])).unwrap();
        store.append("E1", Embedding::new(vec![0.0, 0.0])).unwrap();
        store
    }

    fn flagged_files(dir: &Path) -> Vec<std::path::PathBuf> {
        let mut files: Vec<_> = std::fs::read_dir(dir)
            .unwrap()
            .filter_map(|e| e.ok().map(|e| e.path()))
            .filter(|p| p.extension().is_some_and(|ext| ext == "jpg"))
            .collect();
        files.sort();
        files
    }

    fn audit(dir: &Path) -> Vec<serde_json::Value> {
        std::fs::read_to_string(dir.join("audit.jsonl"))
            .unwrap_or_default()
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect()
    }

    fn start_scripted(
        dir: &Path,
        store: &RegistryStore,
        script: Vec<Result<DynamicImage, CaptureError>>,
    ) -> (PresenceSession<ScriptedSource>, CancellationToken, Arc<AtomicBool>) {
        let cancel = CancellationToken::new();
        let released = Arc::new(AtomicBool::new(false));
        let source = ScriptedSource {
            frames: script.into(),
            cancel: cancel.clone(),
            released: Arc::clone(&released),
        };
        let session = PresenceSession::start(
            settings("E1"),
            store,
            Arc::new(KeyedExtractor),
            &dir.join("evidence"),
            frozen(),
            move || Ok(source),
        )
        .unwrap();
        (session, cancel, released)
    }

    #[tokio::test(start_paused = true)]
    async fn test_flags_only_absent_frames() {
        let dir = tempfile::tempdir().unwrap();
        let store = seeded_store(dir.path());
        let script = vec![
            Ok(frame(TARGET)),
            Ok(frame(STRANGER)),
            Ok(frame(TARGET)),
            Ok(frame(EMPTY)),
            Ok(frame(TARGET)),
            Ok(frame(STRANGER)),
        ];
        let (session, cancel, released) = start_scripted(dir.path(), &store, script);
        assert_eq!(session.state(), MonitorState::Init);

        let started = Instant::now();
        let report = session.run(cancel).await;

        assert_eq!(report.cycles, 6);
        assert_eq!(report.present, 3);
        assert_eq!(report.absent, 3);
        assert_eq!(report.flags, 3);
        assert_eq!(report.transient_failures, 0);
        assert_eq!(report.state, MonitorState::Stopped);
        assert!(released.load(Ordering::SeqCst), "device must be released on stop");

        // Five full intervals between six cycles; the last sleep is cut short.
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_secs(300), "{elapsed:?}");
        assert!(elapsed < Duration::from_secs(301), "{elapsed:?}");

        let evidence = dir.path().join("evidence");
        assert_eq!(flagged_files(&evidence).len(), 3);
        let records = audit(&evidence);
        assert_eq!(records.len(), 3);
        let stamps: Vec<String> = records
            .iter()
            .map(|r| {
                assert_eq!(r["kind"], "flag");
                assert_eq!(r["target"], "E1");
                r["timestamp"].as_str().unwrap().to_string()
            })
            .collect();
        let parsed: Vec<chrono::DateTime<chrono::Utc>> =
            stamps.iter().map(|s| s.parse().unwrap()).collect();
        assert!(parsed.windows(2).all(|w| w[0] < w[1]), "{stamps:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn test_capture_failure_backs_off_and_retries() {
        let dir = tempfile::tempdir().unwrap();
        let store = seeded_store(dir.path());
        let script = vec![
            Ok(frame(TARGET)),
            Err(CaptureError::Failed("select timeout".into())),
            Ok(frame(TARGET)),
        ];
        let (session, cancel, _) = start_scripted(dir.path(), &store, script);

        let started = Instant::now();
        let report = session.run(cancel).await;

        assert_eq!(report.cycles, 3);
        assert_eq!(report.present, 2);
        assert_eq!(report.flags, 0);
        assert_eq!(report.transient_failures, 1);
        // interval after the first cycle, backoff after the failure.
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_secs(65), "{elapsed:?}");
        assert!(elapsed < Duration::from_secs(66), "{elapsed:?}");

        let evidence = dir.path().join("evidence");
        assert!(flagged_files(&evidence).is_empty());
        let records = audit(&evidence);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0]["kind"], "error");
        assert!(records[0]["error"].as_str().unwrap().contains("select timeout"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_before_first_cycle() {
        let dir = tempfile::tempdir().unwrap();
        let store = seeded_store(dir.path());
        let (session, cancel, released) =
            start_scripted(dir.path(), &store, vec![Ok(frame(STRANGER)), Ok(frame(STRANGER))]);

        cancel.cancel();
        let report = session.run(cancel).await;
        assert_eq!(report.cycles, 0);
        assert_eq!(report.state, MonitorState::Stopped);
        assert!(released.load(Ordering::SeqCst));
    }

    #[test]
    fn test_unknown_target_never_opens_device() {
        let dir = tempfile::tempdir().unwrap();
        let store = seeded_store(dir.path());
        let opened = AtomicUsize::new(0);

        let result = PresenceSession::<ScriptedSource>::start(
            settings("ghost"),
            &store,
            Arc::new(KeyedExtractor),
            &dir.path().join("evidence"),
            frozen(),
            || {
                opened.fetch_add(1, Ordering::SeqCst);
                Err(CaptureError::Unavailable("should not be opened".into()))
            },
        );

        let err = result.err().expect("unknown target must fail");
        assert_eq!(err.kind(), ErrorKind::Config);
        assert_eq!(opened.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_invalid_intervals_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = seeded_store(dir.path());

        for (interval, backoff) in [(0, 0), (5, 5), (5, 10), (60, 0)] {
            let settings = MonitorSettings {
                interval: Duration::from_secs(interval),
                backoff: Duration::from_secs(backoff),
                ..settings("E1")
            };
            let result = PresenceSession::<ScriptedSource>::start(
                settings,
                &store,
                Arc::new(KeyedExtractor),
                &dir.path().join("evidence"),
                frozen(),
                || Err(CaptureError::Unavailable("unused".into())),
            );
            assert_eq!(result.err().map(|e| e.kind()), Some(ErrorKind::Config));
        }
    }

    #[test]
    fn test_storage_and_device_failures_at_start() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("registry.json");
        std::fs::write(&path, b"{broken").unwrap();
        let broken = RegistryStore::open(&path, 2);

        let result = PresenceSession::<ScriptedSource>::start(
            settings("E1"),
            &broken,
            Arc::new(KeyedExtractor),
            &dir.path().join("evidence"),
            frozen(),
            || Err(CaptureError::Unavailable("unused".into())),
        );
        assert_eq!(result.err().map(|e| e.kind()), Some(ErrorKind::Storage));

        let store = seeded_store(&dir.path().join("ok"));
        let result = PresenceSession::<ScriptedSource>::start(
            settings("E1"),
            &store,
            Arc::new(KeyedExtractor),
            &dir.path().join("evidence"),
            frozen(),
            || Err(CaptureError::Unavailable("/dev/video0 busy".into())),
        );
        assert_eq!(result.err().map(|e| e.kind()), Some(ErrorKind::Device));
    }

    /// Returns the target forever; only the handle stops it.
    struct SteadySource(Arc<AtomicBool>);

    impl FrameSource for SteadySource {
        fn capture(&mut self) -> Result<DynamicImage, CaptureError> {
            Ok(frame(TARGET))
        }
    }

    impl Drop for SteadySource {
        fn drop(&mut self) {
            self.0.store(true, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn test_handle_stop_releases_device() {
        let dir = tempfile::tempdir().unwrap();
        let store = seeded_store(dir.path());
        let released = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&released);

        let session = PresenceSession::start(
            settings("E1"),
            &store,
            Arc::new(KeyedExtractor),
            &dir.path().join("evidence"),
            frozen(),
            move || Ok(SteadySource(flag)),
        )
        .unwrap();
        let session_id = session.id();

        let handle = spawn(session).unwrap();
        assert_eq!(handle.id(), session_id);
        assert_eq!(handle.target(), "E1");

        let report = handle.stop().await.unwrap();
        assert_eq!(report.state, MonitorState::Stopped);
        assert_eq!(report.session_id, session_id.to_string());
        assert_eq!(report.flags, 0);
        assert!(released.load(Ordering::SeqCst));
    }
}
