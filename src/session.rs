use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use log::{error, info, warn};
use tokio::time::Instant;

use crate::diagnostics::DiagnosticsParser;
use crate::error::SessionError;
use crate::profile::{Orientation, Quality};
use crate::supervisor::ProcessHandle;

const MIN_CREDENTIAL_LEN: usize = 16;

/// Ingest credential; kept out of `Debug` output and logs.
#[derive(Clone, PartialEq, Eq)]
pub struct StreamKey(String);

impl StreamKey {
    pub fn new(key: impl Into<String>) -> Self {
        StreamKey(key.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for StreamKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("StreamKey(********)")
    }
}

#[derive(Debug, Clone)]
pub struct SessionDescriptor {
    pub id: String,
    pub credential: StreamKey,
    pub input_path: PathBuf,
    pub quality: Quality,
    pub orientation: Orientation,
    pub loop_input: bool,
}

impl SessionDescriptor {
    pub async fn validate(&self) -> Result<(), SessionError> {
        if self.id.trim().is_empty() {
            return Err(SessionError::InvalidDescriptor(
                "session id must not be empty".into(),
            ));
        }
        if self.credential.expose().chars().count() < MIN_CREDENTIAL_LEN {
            return Err(SessionError::InvalidDescriptor(format!(
                "stream key must be at least {} characters",
                MIN_CREDENTIAL_LEN
            )));
        }
        let metadata = tokio::fs::metadata(&self.input_path).await.map_err(|e| {
            SessionError::InvalidDescriptor(format!("{}: {}", self.input_path.display(), e))
        })?;
        if !metadata.is_file() {
            return Err(SessionError::InvalidDescriptor(format!(
                "{} is not a file",
                self.input_path.display()
            )));
        }
        tokio::fs::File::open(&self.input_path).await.map_err(|e| {
            SessionError::InvalidDescriptor(format!("{}: {}", self.input_path.display(), e))
        })?;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Idle,
    Connecting,
    Live,
    Stopping,
    Stopped,
    Failed,
}

impl ConnectionStatus {
    /// A process handle exists in exactly these states.
    pub fn is_active(self) -> bool {
        matches!(
            self,
            ConnectionStatus::Connecting | ConnectionStatus::Live | ConnectionStatus::Stopping
        )
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StatusSnapshot {
    pub status: ConnectionStatus,
    pub upload_rate_mbps: f64,
    pub dropped_frames: u64,
    /// Only tracked while live.
    pub elapsed: Option<Duration>,
    pub started_at: Option<SystemTime>,
    pub last_error: Option<String>,
}

impl StatusSnapshot {
    pub fn idle() -> Self {
        StatusSnapshot {
            status: ConnectionStatus::Idle,
            upload_rate_mbps: 0.0,
            dropped_frames: 0,
            elapsed: None,
            started_at: None,
            last_error: None,
        }
    }
}

/// Outcome of feeding diagnostics that the registry has to publish.
#[derive(Debug, PartialEq, Eq)]
pub enum DiagnosticsOutcome {
    Quiet,
    FatalStop,
}

pub struct Session {
    descriptor: Arc<SessionDescriptor>,
    epoch: u64,
    status: ConnectionStatus,
    process: Option<ProcessHandle>,
    diagnostics: DiagnosticsParser,
    started_at: Option<(Instant, SystemTime)>,
    elapsed: Option<Duration>,
    last_error: Option<String>,
    /// Set while a failed session waits in `Stopping` for its engine to exit.
    pending_failure: Option<String>,
}

impl Session {
    pub fn connecting(
        descriptor: Arc<SessionDescriptor>,
        epoch: u64,
        process: ProcessHandle,
    ) -> Self {
        Session {
            descriptor,
            epoch,
            status: ConnectionStatus::Connecting,
            process: Some(process),
            diagnostics: DiagnosticsParser::new(),
            started_at: None,
            elapsed: None,
            last_error: None,
            pending_failure: None,
        }
    }

    pub fn id(&self) -> &str {
        &self.descriptor.id
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn status(&self) -> ConnectionStatus {
        self.status
    }

    pub fn is_process_alive(&self) -> bool {
        self.process.as_ref().map_or(false, ProcessHandle::is_alive)
    }

    /// Masks the stream key wherever the engine echoes it (output URLs).
    pub fn redact(&self, text: &str) -> String {
        text.replace(self.descriptor.credential.expose(), "********")
    }

    /// Connecting -> Live if the engine survived the confirmation window,
    /// otherwise Connecting -> Failed. Returns whether the session is live.
    pub fn confirm(&mut self, now: Instant) -> bool {
        if self.status != ConnectionStatus::Connecting {
            return false;
        }
        if !self.is_process_alive() {
            self.fail("engine exited before the stream was confirmed".into());
            return false;
        }

        self.status = ConnectionStatus::Live;
        self.started_at = Some((now, SystemTime::now()));
        self.elapsed = Some(Duration::ZERO);
        self.diagnostics.reset();
        info!(
            "session {} is live (engine {:?})",
            self.id(),
            self.process.as_ref().and_then(ProcessHandle::pid)
        );
        true
    }

    /// Connecting/Live -> Stopping. The exit event completes the transition.
    pub fn begin_stop(&mut self) -> Result<(), SessionError> {
        match self.status {
            ConnectionStatus::Connecting | ConnectionStatus::Live => {}
            _ => return Err(SessionError::NotRunning(self.id().to_owned())),
        }
        self.status = ConnectionStatus::Stopping;
        self.started_at = None;
        self.elapsed = None;
        self.signal_terminate();
        info!("session {} is stopping", self.id());
        Ok(())
    }

    /// Moves the session towards `Failed`. A dead engine fails it on the
    /// spot; a running one is terminated and the session holds `Stopping`
    /// until the exit arrives, so the id is never free while a process runs.
    pub fn fail(&mut self, reason: String) {
        self.started_at = None;
        self.elapsed = None;
        self.last_error = Some(reason.clone());
        if self.is_process_alive() {
            warn!("session {} failing once its engine exits: {}", self.id(), reason);
            self.status = ConnectionStatus::Stopping;
            self.pending_failure = Some(reason);
            self.signal_terminate();
        } else {
            warn!("session {} failed: {}", self.id(), reason);
            self.process = None;
            self.status = ConnectionStatus::Failed;
        }
    }

    /// Returns false when the exit was already accounted for.
    pub fn process_exited(&mut self, code: Option<i32>) -> bool {
        let failure = match self.status {
            ConnectionStatus::Connecting => {
                Some(format!("engine exited with {:?} before going live", code))
            }
            ConnectionStatus::Live | ConnectionStatus::Stopping => self.pending_failure.take(),
            _ => return false,
        };

        self.process = None;
        self.started_at = None;
        self.elapsed = None;
        match failure {
            Some(reason) => {
                warn!("session {} failed (engine exit {:?}): {}", self.id(), code, reason);
                self.status = ConnectionStatus::Failed;
                self.last_error = Some(reason);
            }
            None => {
                info!("session {} stopped (engine exit {:?})", self.id(), code);
                self.status = ConnectionStatus::Stopped;
            }
        }
        true
    }

    pub fn on_diagnostics(&mut self, chunk: &str) -> DiagnosticsOutcome {
        let fatal = self.diagnostics.feed(chunk);
        let pattern = match fatal {
            Some(pattern) if self.status.is_active() => pattern,
            _ => return DiagnosticsOutcome::Quiet,
        };

        let err = SessionError::FatalStream {
            id: self.id().to_owned(),
            pattern,
        };
        match self.status {
            ConnectionStatus::Connecting => {
                self.fail(err.to_string());
                DiagnosticsOutcome::FatalStop
            }
            ConnectionStatus::Live => {
                warn!("{}", err);
                self.last_error = Some(err.to_string());
                // cannot fail: the status is live
                let _ = self.begin_stop();
                DiagnosticsOutcome::FatalStop
            }
            _ => DiagnosticsOutcome::Quiet,
        }
    }

    pub fn tick(&mut self, now: Instant) {
        if self.status != ConnectionStatus::Live {
            return;
        }
        if let Some((started, _)) = self.started_at {
            self.elapsed = Some(now.saturating_duration_since(started));
        }
    }

    pub fn snapshot(&self) -> StatusSnapshot {
        let metrics = self.diagnostics.metrics();
        StatusSnapshot {
            status: self.status,
            upload_rate_mbps: metrics.upload_rate_mbps,
            dropped_frames: metrics.dropped_frames,
            elapsed: self.elapsed,
            started_at: self.started_at.map(|(_, wall)| wall),
            last_error: self.last_error.clone(),
        }
    }

    fn signal_terminate(&self) {
        if let Some(process) = &self.process {
            if let Err(e) = process.terminate() {
                error!("failed to terminate engine of session {}: {}", self.id(), e);
            }
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if self.status.is_active() {
            self.signal_terminate();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::fake::{FakeEngine, FakeProcess};
    use crate::supervisor;

    fn descriptor(id: &str) -> SessionDescriptor {
        SessionDescriptor {
            id: id.into(),
            credential: StreamKey::new("0123456789abcdef"),
            input_path: PathBuf::from("Cargo.toml"),
            quality: Quality::Medium,
            orientation: Orientation::Landscape,
            loop_input: false,
        }
    }

    fn connecting(engine: &FakeEngine) -> (Session, FakeProcess) {
        let (handle, _events) = supervisor::spawn(engine, &[], Duration::from_secs(5)).unwrap();
        let index = engine.spawned() - 1;
        (
            Session::connecting(Arc::new(descriptor("cam-1")), 1, handle),
            engine.process(index),
        )
    }

    #[tokio::test]
    async fn confirm_goes_live_and_resets_metrics() {
        let engine = FakeEngine::new();
        let (mut session, _process) = connecting(&engine);
        session.on_diagnostics("speed=1.0x drop");
        assert_eq!(session.snapshot().dropped_frames, 1);

        assert!(session.confirm(Instant::now()));
        let snapshot = session.snapshot();
        assert_eq!(snapshot.status, ConnectionStatus::Live);
        assert_eq!(snapshot.dropped_frames, 0);
        assert_eq!(snapshot.upload_rate_mbps, 0.0);
        assert_eq!(snapshot.elapsed, Some(Duration::ZERO));
        assert!(snapshot.started_at.is_some());
    }

    #[tokio::test]
    async fn confirm_with_dead_engine_fails() {
        let engine = FakeEngine::new();
        let (mut session, process) = connecting(&engine);
        process.exit(1);

        assert!(!session.confirm(Instant::now()));
        assert_eq!(session.status(), ConnectionStatus::Failed);
        assert!(session.snapshot().last_error.is_some());
    }

    #[tokio::test]
    async fn stop_then_exit_ends_stopped() {
        let engine = FakeEngine::new();
        let (mut session, process) = connecting(&engine);
        session.confirm(Instant::now());

        session.begin_stop().unwrap();
        assert_eq!(session.status(), ConnectionStatus::Stopping);
        assert_eq!(process.terminations(), 1);
        assert_eq!(session.snapshot().elapsed, None);

        assert!(session.process_exited(Some(255)));
        assert_eq!(session.status(), ConnectionStatus::Stopped);
        assert!(matches!(
            session.begin_stop(),
            Err(SessionError::NotRunning(id)) if id == "cam-1"
        ));
        // a second exit report changes nothing
        assert!(!session.process_exited(Some(255)));
    }

    #[tokio::test]
    async fn exit_while_connecting_fails() {
        let engine = FakeEngine::new();
        let (mut session, _process) = connecting(&engine);
        assert!(session.process_exited(Some(1)));
        assert_eq!(session.status(), ConnectionStatus::Failed);
    }

    #[tokio::test]
    async fn fatal_pattern_while_connecting_fails_after_exit() {
        let engine = FakeEngine::new();
        engine.ignore_terminate(true);
        let (mut session, process) = connecting(&engine);

        assert_eq!(
            session.on_diagnostics("rtmp://h/app: Connection refused"),
            DiagnosticsOutcome::FatalStop
        );
        assert_eq!(session.status(), ConnectionStatus::Stopping);
        assert!(session.status().is_active());
        assert!(session.is_process_alive());
        assert_eq!(process.terminations(), 1);
        assert!(!session.confirm(Instant::now()));

        process.exit(1);
        assert!(session.process_exited(Some(1)));
        assert_eq!(session.status(), ConnectionStatus::Failed);
        assert!(!session.is_process_alive());
        let last_error = session.snapshot().last_error.unwrap();
        assert!(last_error.contains("connection refused"), "{}", last_error);
    }

    #[tokio::test]
    async fn fatal_pattern_while_live_stops() {
        let engine = FakeEngine::new();
        let (mut session, process) = connecting(&engine);
        session.confirm(Instant::now());

        assert_eq!(
            session.on_diagnostics("HTTP error 403 Forbidden"),
            DiagnosticsOutcome::FatalStop
        );
        assert_eq!(session.status(), ConnectionStatus::Stopping);
        assert_eq!(process.terminations(), 1);
        let last_error = session.snapshot().last_error.unwrap();
        assert!(last_error.contains("403"), "{}", last_error);
    }

    #[tokio::test]
    async fn dropped_frames_only_grow_while_live() {
        let engine = FakeEngine::new();
        let (mut session, _process) = connecting(&engine);
        session.confirm(Instant::now());

        let mut last = 0;
        for chunk in ["speed=1.0x", "drop", "frame=2", "error", "drop error"] {
            session.on_diagnostics(chunk);
            let dropped = session.snapshot().dropped_frames;
            assert!(dropped >= last);
            last = dropped;
        }
        assert_eq!(last, 3);
    }

    #[tokio::test]
    async fn tick_tracks_elapsed_only_while_live() {
        let engine = FakeEngine::new();
        let (mut session, _process) = connecting(&engine);
        let start = Instant::now();
        session.tick(start + Duration::from_secs(3));
        assert_eq!(session.snapshot().elapsed, None);

        session.confirm(start);
        session.tick(start + Duration::from_secs(3));
        assert_eq!(session.snapshot().elapsed, Some(Duration::from_secs(3)));
    }

    #[tokio::test]
    async fn redacts_echoed_stream_key() {
        let engine = FakeEngine::new();
        let (session, _process) = connecting(&engine);
        assert_eq!(
            session.redact("Output #0, flv, to 'rtmp://h/app/0123456789abcdef':"),
            "Output #0, flv, to 'rtmp://h/app/********':"
        );
    }

    #[tokio::test]
    async fn credential_is_redacted_and_validated() {
        let mut d = descriptor("cam-1");
        assert!(!format!("{:?}", d).contains("0123456789abcdef"));
        d.validate().await.unwrap();

        d.credential = StreamKey::new("short");
        assert!(matches!(
            d.validate().await,
            Err(SessionError::InvalidDescriptor(_))
        ));

        let mut missing = descriptor("cam-1");
        missing.input_path = PathBuf::from("/nonexistent/input.mp4");
        assert!(matches!(
            missing.validate().await,
            Err(SessionError::InvalidDescriptor(_))
        ));
    }
}
