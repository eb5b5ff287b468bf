//! Streaming session management.
//!
//! A session is one live loop bound to one output target. The
//! [`SessionManager`] keeps at most one live session per [`TargetKey`] and
//! owns the background reaper that stops sessions whose TTL has elapsed.
//!
//! ## Session lifecycle
//!
//! ```text
//! start_session ─► Starting ──sink ready──► Running ──stop/expiry──► Stopping ──► Stopped
//!                     │                        │
//!                     └──sink start failed──►  └──sink crashed──────────────────► Failed
//!                        (entry removed,
//!                         error returned)
//! ```
//!
//! Registry discipline:
//!
//! - Check-and-insert of a target key happens under one lock, so two
//!   concurrent starts on the same target cannot both succeed.
//! - Sink startup, subprocess spawn and teardown happen outside the lock.
//! - `stop_session` removes the entry only after the loop has released every
//!   resource. A Stopped/Failed entry never blocks a new start on its key.

pub mod target;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use parking_lot::{Condvar, Mutex, RwLock};
use rand::RngExt;
use serde::Serialize;

use crate::compositor::CompositorConfig;
use crate::error::{MosaicError, Result};
use crate::live::{LiveLoop, LoopConfig, LoopExit, RunningLoop};
use crate::registry::Channel;
use crate::sink::{EncoderSettings, ProcessSinkFactory, SessionArtifact, SinkContext, SinkFactory};
use crate::source::{
    DecoderFactory, FfmpegDecoderFactory, RoutingDecoderFactory, SourceSettings,
};

pub use target::{DEFAULT_RTP_PORT, OutputTarget, Protocol, TargetKey, parse_key_value_options};

/// Session state machine.
///
/// ```text
/// Starting ──ready──► Running ──stop/ttl──► Stopping ──► Stopped
///    │                   │
///    │                   ├──window closed──────────────► Stopped
///    └──start failed──►  └──sink crashed───────────────► Failed
/// ```
///
/// A sink crash is reported as `Failed`. It skips `Stopping`: the loop has
/// already released the sink and every source when the state changes, and
/// the crash reason is kept in [`Session::error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    /// Sources opening, sink not yet ready.
    Starting,
    /// Sink confirmed ready; frames flowing.
    Running,
    /// Stop requested; teardown in progress.
    Stopping,
    /// Every resource released after a stop or close.
    Stopped,
    /// The sink failed to start or crashed; every resource released.
    Failed,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Stopped | Self::Failed)
    }
}

/// Session manager settings.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Parent of the per-session scratch directories.
    pub work_dir: PathBuf,
    /// TTL for requests that do not give one. `None` means no expiry.
    pub default_ttl: Option<Duration>,
    pub reaper_interval: Duration,
    /// How long a session that ended on its own stays listed.
    pub retain_finished: Duration,
    pub compositor: CompositorConfig,
    pub source: SourceSettings,
    pub encoder: EncoderSettings,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            work_dir: std::env::temp_dir().join("mosaic-sessions"),
            default_ttl: None,
            reaper_interval: Duration::from_secs(1),
            retain_finished: Duration::from_secs(60),
            compositor: CompositorConfig::default(),
            source: SourceSettings::default(),
            encoder: EncoderSettings::default(),
        }
    }
}

/// Parameters of one start request.
#[derive(Debug, Clone)]
pub struct StartRequest {
    pub target: OutputTarget,
    pub channels: Vec<Channel>,
    /// Overrides [`SessionConfig::default_ttl`].
    pub ttl: Option<Duration>,
    /// Overrides [`SessionConfig::compositor`].
    pub compositor: Option<CompositorConfig>,
}

impl StartRequest {
    pub fn new(target: OutputTarget, channels: Vec<Channel>) -> Self {
        Self {
            target,
            channels,
            ttl: None,
            compositor: None,
        }
    }
}

fn new_session_id() -> String {
    format!("{:012x}", rand::rng().random_range(0..1u64 << 48))
}

fn unix_secs(at: SystemTime) -> u64 {
    at.duration_since(UNIX_EPOCH).map_or(0, |d| d.as_secs())
}

/// One streaming session.
///
/// Shared between the manager, the control surface and the session's own
/// live loop thread; all mutable parts sit behind locks.
pub struct Session {
    pub id: String,
    pub target: OutputTarget,
    pub key: TargetKey,
    pub channels: Vec<Channel>,
    pub started_at: SystemTime,
    pub expires_at: Option<SystemTime>,
    deadline: Option<Instant>,
    state: Mutex<SessionState>,
    state_changed: Condvar,
    artifact: RwLock<Option<SessionArtifact>>,
    pid: RwLock<Option<u32>>,
    error: RwLock<Option<String>>,
    runner: Mutex<Option<RunningLoop>>,
    final_frames: AtomicU64,
    stop_requested: AtomicBool,
    finished_at: Mutex<Option<Instant>>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("key", &self.key)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl Session {
    fn new(request: &StartRequest, ttl: Option<Duration>) -> Self {
        let started_at = SystemTime::now();
        Session {
            id: new_session_id(),
            key: request.target.key(),
            target: request.target.clone(),
            channels: request.channels.clone(),
            started_at,
            expires_at: ttl.map(|ttl| started_at + ttl),
            deadline: ttl.map(|ttl| Instant::now() + ttl),
            state: Mutex::new(SessionState::Starting),
            state_changed: Condvar::new(),
            artifact: RwLock::new(None),
            pid: RwLock::new(None),
            error: RwLock::new(None),
            runner: Mutex::new(None),
            final_frames: AtomicU64::new(0),
            stop_requested: AtomicBool::new(false),
            finished_at: Mutex::new(None),
        }
    }

    pub fn state(&self) -> SessionState {
        *self.state.lock()
    }

    fn set_state(&self, state: SessionState) {
        let mut current = self.state.lock();
        tracing::debug!(session_id = %self.id, old_state = ?*current, new_state = ?state, "state transition");
        *current = state;
        if state.is_terminal() {
            *self.finished_at.lock() = Some(Instant::now());
        }
        self.state_changed.notify_all();
    }

    /// Move to `to` only from one of `from`. Returns whether it moved.
    fn transition(&self, from: &[SessionState], to: SessionState) -> bool {
        let mut current = self.state.lock();
        if !from.contains(&*current) {
            return false;
        }
        tracing::debug!(session_id = %self.id, old_state = ?*current, new_state = ?to, "state transition");
        *current = to;
        self.state_changed.notify_all();
        true
    }

    /// Where a viewer finds the stream. Only available while Running.
    pub fn artifact(&self) -> Option<SessionArtifact> {
        if self.state() != SessionState::Running {
            return None;
        }
        self.artifact.read().clone()
    }

    /// Encoder or player process id, while one is running.
    pub fn pid(&self) -> Option<u32> {
        if self.state().is_terminal() {
            return None;
        }
        *self.pid.read()
    }

    pub fn error(&self) -> Option<String> {
        self.error.read().clone()
    }

    pub fn frames(&self) -> u64 {
        self.runner
            .lock()
            .as_ref()
            .map_or_else(|| self.final_frames.load(Ordering::Relaxed), RunningLoop::frames)
    }

    fn is_expired(&self, now: Instant) -> bool {
        self.deadline.is_some_and(|deadline| deadline <= now)
    }

    /// Block until the session is Stopped or Failed, or `timeout` elapses.
    pub fn wait(&self, timeout: Option<Duration>) -> SessionState {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut state = self.state.lock();
        while !state.is_terminal() {
            match deadline {
                Some(deadline) => {
                    if self.state_changed.wait_until(&mut state, deadline).timed_out() {
                        break;
                    }
                }
                None => self.state_changed.wait(&mut state),
            }
        }
        *state
    }

    /// Called on the loop thread once teardown is complete.
    fn finish(&self, exit: LoopExit) {
        match exit {
            LoopExit::Cancelled => {
                tracing::info!(session_id = %self.id, "session stopped");
                self.set_state(SessionState::Stopped);
            }
            LoopExit::CloseRequested => {
                tracing::info!(session_id = %self.id, "output closed by operator");
                self.set_state(SessionState::Stopped);
            }
            LoopExit::Crashed(e) => {
                tracing::warn!(session_id = %self.id, target = %self.key, error = %e, "session failed");
                *self.error.write() = Some(e.to_string());
                self.set_state(SessionState::Failed);
            }
        }
    }

    pub fn info(&self) -> SessionInfo {
        SessionInfo {
            id: self.id.clone(),
            target: self.key.to_string(),
            protocol: self.target.protocol,
            destination: self.target.destination.clone(),
            state: self.state(),
            started_at: unix_secs(self.started_at),
            expires_at: self.expires_at.map(unix_secs),
            location: self.artifact().map(|a| a.path().display().to_string()),
            channels: self.channels.iter().map(|c| c.name.clone()).collect(),
            frames: self.frames(),
            error: self.error(),
        }
    }
}

/// Read-only snapshot of a session.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub id: String,
    pub target: String,
    pub protocol: Protocol,
    pub destination: Option<String>,
    pub state: SessionState,
    /// Unix seconds.
    pub started_at: u64,
    /// Unix seconds; `None` when the session never expires.
    pub expires_at: Option<u64>,
    /// SDP or playlist path while Running.
    pub location: Option<String>,
    pub channels: Vec<String>,
    pub frames: u64,
    pub error: Option<String>,
}

struct Inner {
    sessions: Mutex<HashMap<TargetKey, Arc<Session>>>,
    config: SessionConfig,
    sinks: Arc<dyn SinkFactory>,
    decoders: Arc<dyn DecoderFactory>,
    shutting_down: AtomicBool,
    reaper: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        // Loops own their session; without a cancel they would run forever.
        for session in self.sessions.get_mut().values() {
            session.stop_requested.store(true, Ordering::SeqCst);
            if let Some(runner) = session.runner.lock().as_ref() {
                runner.cancel();
            }
        }
    }
}

/// Process-wide registry of streaming sessions.
///
/// Cheap to clone; all clones share one registry and one reaper. The reaper
/// stops when the last clone is dropped or on [`shutdown`](Self::shutdown).
#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<Inner>,
}

impl SessionManager {
    /// Manager using ffmpeg/ffplay sinks and ffmpeg (or pattern) decoders.
    pub fn new(config: SessionConfig) -> Result<Self> {
        let sinks = Arc::new(ProcessSinkFactory::new(config.encoder.clone()));
        let decoders = Arc::new(RoutingDecoderFactory::new(Arc::new(FfmpegDecoderFactory {
            program: config.encoder.encoder_program.clone(),
        })));
        Self::with_factories(config, sinks, decoders)
    }

    pub fn with_factories(
        config: SessionConfig,
        sinks: Arc<dyn SinkFactory>,
        decoders: Arc<dyn DecoderFactory>,
    ) -> Result<Self> {
        let interval = config.reaper_interval;
        let inner = Arc::new(Inner {
            sessions: Mutex::new(HashMap::new()),
            config,
            sinks,
            decoders,
            shutting_down: AtomicBool::new(false),
            reaper: Mutex::new(None),
        });

        let weak = Arc::downgrade(&inner);
        let handle = thread::Builder::new()
            .name("session-reaper".to_string())
            .spawn(move || reaper_loop(weak, interval))?;
        *inner.reaper.lock() = Some(handle);

        Ok(SessionManager { inner })
    }

    pub fn config(&self) -> &SessionConfig {
        &self.inner.config
    }

    /// Start a session on a free target.
    ///
    /// Returns once the sink is ready (state Running). Fails with
    /// [`MosaicError::TargetAlreadyActive`] if a Starting/Running/Stopping
    /// session owns the target, or with the sink's start error; in both
    /// cases no session entry remains.
    pub fn start_session(&self, request: StartRequest) -> Result<Arc<Session>> {
        if self.inner.shutting_down.load(Ordering::SeqCst) {
            return Err(MosaicError::SinkStart("session manager is shutting down".to_string()));
        }
        let ttl = request.ttl.or(self.inner.config.default_ttl);
        let session = Arc::new(Session::new(&request, ttl));

        let replaced = {
            let mut sessions = self.inner.sessions.lock();
            if let Some(existing) = sessions.get(&session.key)
                && !existing.state().is_terminal()
            {
                tracing::debug!(target = %session.key, existing = %existing.id, "target busy");
                return Err(MosaicError::TargetAlreadyActive(session.key.to_string()));
            }
            let replaced = sessions.insert(session.key.clone(), session.clone());
            tracing::debug!(session_id = %session.id, target = %session.key, total_sessions = sessions.len(), "session registered");
            replaced
        };
        // Finished sessions are released outside the registry lock.
        drop(replaced);

        let compositor = request
            .compositor
            .unwrap_or_else(|| self.inner.config.compositor.clone());
        match self.launch(&session, compositor) {
            Ok(()) => {
                tracing::info!(
                    session_id = %session.id,
                    target = %session.key,
                    channels = session.channels.len(),
                    ?ttl,
                    "session started"
                );
                Ok(session)
            }
            Err(e) => {
                tracing::warn!(session_id = %session.id, target = %session.key, error = %e, "session failed to start");
                *session.error.write() = Some(e.to_string());
                session.set_state(SessionState::Failed);
                self.remove_entry(&session);
                Err(e)
            }
        }
    }

    fn launch(&self, session: &Arc<Session>, compositor: CompositorConfig) -> Result<()> {
        let names: Vec<&str> = session.channels.iter().map(|c| c.name.as_str()).collect();
        let context = SinkContext {
            scratch_dir: self.inner.config.work_dir.join(&session.id),
            width: compositor.width,
            height: compositor.height,
            title: if names.is_empty() {
                "Mosaic".to_string()
            } else {
                format!("Mosaic {}", names.join(" "))
            },
        };
        let sink = self.inner.sinks.create(&session.target, context)?;

        let config = self.loop_config(&session.target, compositor);
        let live = LiveLoop::new(session.channels.clone(), sink, self.inner.decoders.clone(), config);

        let owner = session.clone();
        let (running, ready) = live.start(move |exit| owner.finish(exit))?;
        *session.artifact.write() = ready.artifact;
        *session.pid.write() = ready.pid;

        *session.runner.lock() = Some(running);
        if session.stop_requested.load(Ordering::SeqCst) {
            // A stop arrived while the sink was starting.
            if let Some(runner) = session.runner.lock().as_ref() {
                runner.cancel();
            }
        } else {
            session.transition(&[SessionState::Starting], SessionState::Running);
        }
        Ok(())
    }

    fn loop_config(&self, target: &OutputTarget, compositor: CompositorConfig) -> LoopConfig {
        LoopConfig {
            compositor,
            fps: target.fps,
            source: self.inner.config.source.clone().for_fps(target.fps),
        }
    }

    /// Stop a session and wait until it has released every resource.
    pub fn stop_session(&self, id: &str) -> Result<SessionState> {
        let session = self
            .get_session(id)
            .ok_or_else(|| MosaicError::SessionNotFound(id.to_string()))?;
        Ok(self.stop(&session))
    }

    fn stop(&self, session: &Arc<Session>) -> SessionState {
        session.stop_requested.store(true, Ordering::SeqCst);
        session.transition(
            &[SessionState::Starting, SessionState::Running],
            SessionState::Stopping,
        );

        let runner = session.runner.lock().take();
        let state = match runner {
            Some(mut runner) => {
                runner.cancel();
                runner.join();
                session.final_frames.store(runner.frames(), Ordering::Relaxed);
                session.wait(None)
            }
            // Still starting: the launch sees the stop flag and cancels.
            None => session.wait(None),
        };

        self.remove_entry(session);
        tracing::debug!(session_id = %session.id, state = ?state, "session released");
        state
    }

    fn remove_entry(&self, session: &Arc<Session>) {
        let removed = {
            let mut sessions = self.inner.sessions.lock();
            match sessions.get(&session.key) {
                Some(current) if Arc::ptr_eq(current, session) => sessions.remove(&session.key),
                _ => None,
            }
        };
        if removed.is_some() {
            tracing::debug!(session_id = %session.id, "session removed");
        }
    }

    pub fn get_session(&self, id: &str) -> Option<Arc<Session>> {
        self.inner
            .sessions
            .lock()
            .values()
            .find(|s| s.id == id)
            .cloned()
    }

    /// Snapshot of every listed session, oldest first.
    pub fn list_sessions(&self) -> Vec<SessionInfo> {
        let sessions: Vec<Arc<Session>> = self.inner.sessions.lock().values().cloned().collect();
        let mut infos: Vec<SessionInfo> = sessions.iter().map(|s| s.info()).collect();
        infos.sort_by(|a, b| a.started_at.cmp(&b.started_at).then_with(|| a.id.cmp(&b.id)));
        infos
    }

    /// Wait for a session to end on its own or be stopped.
    pub fn wait(&self, id: &str, timeout: Option<Duration>) -> Result<SessionState> {
        let session = self
            .get_session(id)
            .ok_or_else(|| MosaicError::SessionNotFound(id.to_string()))?;
        Ok(session.wait(timeout))
    }

    /// Stop expired sessions and purge long-finished ones.
    fn reap(&self) {
        let now = Instant::now();
        let retain = self.inner.config.retain_finished;
        let mut expired = Vec::new();
        let mut purged = Vec::new();
        {
            let mut sessions = self.inner.sessions.lock();
            sessions.retain(|_, session| {
                let state = session.state();
                if state == SessionState::Running && session.is_expired(now) {
                    expired.push(session.clone());
                }
                let stale = state.is_terminal()
                    && session
                        .finished_at
                        .lock()
                        .is_some_and(|at| now.duration_since(at) >= retain);
                if stale {
                    purged.push(session.clone());
                }
                !stale
            });
        }

        for session in &purged {
            tracing::debug!(session_id = %session.id, "finished session purged");
        }
        drop(purged);

        for session in expired {
            tracing::info!(session_id = %session.id, target = %session.key, "session expired");
            self.stop(&session);
        }
    }

    /// Stop the reaper and every session. Afterwards the registry is empty
    /// and no encoder process remains.
    pub fn shutdown(&self) {
        if self.inner.shutting_down.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(handle) = self.inner.reaper.lock().take()
            && handle.thread().id() != thread::current().id()
            && handle.join().is_err()
        {
            tracing::error!("session reaper panicked");
        }

        let sessions: Vec<Arc<Session>> = self.inner.sessions.lock().values().cloned().collect();
        tracing::info!(sessions = sessions.len(), "shutting down sessions");
        for session in &sessions {
            self.stop(session);
        }
        self.inner.sessions.lock().clear();
    }
}

fn reaper_loop(weak: Weak<Inner>, interval: Duration) {
    let tick = interval.min(Duration::from_millis(100));
    let mut last = Instant::now();
    loop {
        thread::sleep(tick);
        let Some(inner) = weak.upgrade() else {
            break;
        };
        if inner.shutting_down.load(Ordering::SeqCst) {
            break;
        }
        if last.elapsed() >= interval {
            last = Instant::now();
            SessionManager { inner }.reap();
        }
    }
    tracing::trace!("reaper exited");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::testing::{FakeBehavior, FakeSinkFactory};
    use crate::source::PatternDecoderFactory;
    use std::sync::Barrier;

    fn config(work_dir: PathBuf) -> SessionConfig {
        SessionConfig {
            work_dir,
            reaper_interval: Duration::from_millis(50),
            compositor: CompositorConfig {
                width: 64,
                height: 36,
                ..CompositorConfig::default()
            },
            ..SessionConfig::default()
        }
    }

    fn manager(config: SessionConfig, behavior: FakeBehavior) -> (SessionManager, Arc<FakeSinkFactory>) {
        let sinks = Arc::new(FakeSinkFactory::new(behavior));
        let manager = SessionManager::with_factories(
            config,
            sinks.clone(),
            Arc::new(PatternDecoderFactory::default()),
        )
        .unwrap();
        (manager, sinks)
    }

    fn channels() -> Vec<Channel> {
        vec![
            Channel::new("CAM1", "pattern://ff0000"),
            Channel::new("CAM2", "pattern://00ff00"),
        ]
    }

    fn rtp(port: u16) -> OutputTarget {
        OutputTarget::rtp("127.0.0.1", Some(port)).unwrap().with_fps(50)
    }

    #[test]
    fn loop_staleness_follows_session_fps() {
        let tmp = tempfile::tempdir().unwrap();
        let (manager, _) = manager(config(tmp.path().to_path_buf()), FakeBehavior::default());
        let compositor = manager.config().compositor.clone();

        let slow = manager.loop_config(&rtp(5004).with_fps(1), compositor.clone());
        assert_eq!(slow.fps, 1);
        assert_eq!(slow.source.stale_after, Duration::from_secs(2));

        // Fast targets keep the configured floor.
        let fast = manager.loop_config(&rtp(5004), compositor);
        assert_eq!(fast.source.stale_after, manager.config().source.stale_after);
    }

    #[test]
    fn session_ids_are_twelve_hex_digits() {
        let id = new_session_id();
        assert_eq!(id.len(), 12);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn start_list_stop() {
        let tmp = tempfile::tempdir().unwrap();
        let (manager, sinks) = manager(config(tmp.path().to_path_buf()), FakeBehavior::default());

        let session = manager.start_session(StartRequest::new(rtp(5004), channels())).unwrap();
        assert_eq!(session.state(), SessionState::Running);
        assert!(matches!(session.artifact(), Some(SessionArtifact::Sdp(_))));

        let list = manager.list_sessions();
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].id, session.id);
        assert_eq!(list[0].target, "rtp://127.0.0.1:5004");
        assert_eq!(list[0].channels, vec!["CAM1", "CAM2"]);

        assert_eq!(manager.stop_session(&session.id).unwrap(), SessionState::Stopped);
        assert!(manager.list_sessions().is_empty());
        assert_eq!(sinks.log.events(), vec!["start", "stop"]);
        // The artifact is gone with the session.
        assert!(session.artifact().is_none());
        assert!(!tmp.path().join(&session.id).exists());
    }

    #[test]
    fn same_target_twice_is_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let (manager, _) = manager(config(tmp.path().to_path_buf()), FakeBehavior::default());
        let first = manager.start_session(StartRequest::new(rtp(5004), channels())).unwrap();

        let err = manager
            .start_session(StartRequest::new(OutputTarget::rtp("rtp://127.0.0.1:5004", None).unwrap(), vec![]))
            .unwrap_err();
        assert!(matches!(err, MosaicError::TargetAlreadyActive(_)));

        // A different target is independent.
        manager.start_session(StartRequest::new(rtp(5006), channels())).unwrap();
        assert_eq!(manager.list_sessions().len(), 2);
        manager.stop_session(&first.id).unwrap();
        manager.shutdown();
    }

    #[test]
    fn concurrent_starts_on_one_target_admit_exactly_one() {
        let tmp = tempfile::tempdir().unwrap();
        let (manager, _) = manager(
            config(tmp.path().to_path_buf()),
            FakeBehavior {
                start_delay: Duration::from_millis(50),
                ..FakeBehavior::default()
            },
        );

        let barrier = Arc::new(Barrier::new(8));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let manager = manager.clone();
                let barrier = barrier.clone();
                thread::spawn(move || {
                    barrier.wait();
                    manager.start_session(StartRequest::new(rtp(5004), channels()))
                })
            })
            .collect();
        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        let ok = results.iter().filter(|r| r.is_ok()).count();
        let busy = results
            .iter()
            .filter(|r| matches!(r, Err(MosaicError::TargetAlreadyActive(_))))
            .count();
        assert_eq!(ok, 1);
        assert_eq!(busy, 7);
        manager.shutdown();
    }

    #[test]
    fn sink_start_failure_leaves_no_entry() {
        let tmp = tempfile::tempdir().unwrap();
        let (manager, _) = manager(
            config(tmp.path().to_path_buf()),
            FakeBehavior {
                fail_start: true,
                ..FakeBehavior::default()
            },
        );
        let err = manager
            .start_session(StartRequest::new(rtp(5004), channels()))
            .unwrap_err();
        assert!(err.is_start_failure());
        assert!(manager.list_sessions().is_empty());
        assert!(!tmp.path().join("anything").exists());
    }

    #[test]
    fn target_is_free_again_after_stop() {
        let tmp = tempfile::tempdir().unwrap();
        let (manager, _) = manager(config(tmp.path().to_path_buf()), FakeBehavior::default());
        let first = manager.start_session(StartRequest::new(rtp(5004), channels())).unwrap();
        manager.stop_session(&first.id).unwrap();
        let second = manager.start_session(StartRequest::new(rtp(5004), channels())).unwrap();
        assert_ne!(first.id, second.id);
        manager.shutdown();
    }

    #[test]
    fn reaper_stops_expired_sessions() {
        let tmp = tempfile::tempdir().unwrap();
        let (manager, sinks) = manager(config(tmp.path().to_path_buf()), FakeBehavior::default());
        let mut request = StartRequest::new(rtp(5004), channels());
        request.ttl = Some(Duration::from_millis(150));
        let session = manager.start_session(request).unwrap();
        assert!(session.expires_at.is_some());

        let state = session.wait(Some(Duration::from_secs(3)));
        assert_eq!(state, SessionState::Stopped);
        // Expiry goes through the same path as stop_session.
        let deadline = Instant::now() + Duration::from_secs(2);
        while manager.get_session(&session.id).is_some() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        assert!(manager.get_session(&session.id).is_none());
        assert_eq!(sinks.log.events(), vec!["start", "stop"]);
    }

    #[test]
    fn sink_crash_fails_session_and_frees_target() {
        let tmp = tempfile::tempdir().unwrap();
        let (manager, sinks) = manager(
            config(tmp.path().to_path_buf()),
            FakeBehavior {
                crash_on: Some(3),
                ..FakeBehavior::default()
            },
        );
        let session = manager.start_session(StartRequest::new(rtp(5004), channels())).unwrap();
        assert_eq!(session.wait(Some(Duration::from_secs(3))), SessionState::Failed);
        assert!(session.error().is_some_and(|e| e.contains("fake encoder died")));
        assert_eq!(sinks.log.events(), vec!["start", "stop"]);

        // Still listed as Failed, but the key can be reused.
        let info = &manager.list_sessions()[0];
        assert_eq!(info.state, SessionState::Failed);
        assert!(info.error.is_some());
        *sinks.behavior.lock() = FakeBehavior::default();
        let again = manager.start_session(StartRequest::new(rtp(5004), channels())).unwrap();
        assert_eq!(manager.list_sessions().len(), 1);
        manager.stop_session(&again.id).unwrap();
    }

    #[test]
    fn finished_sessions_are_purged_after_retention() {
        let tmp = tempfile::tempdir().unwrap();
        let mut cfg = config(tmp.path().to_path_buf());
        cfg.retain_finished = Duration::from_millis(100);
        let (manager, _) = manager(
            cfg,
            FakeBehavior {
                close_on: Some(1),
                ..FakeBehavior::default()
            },
        );
        let session = manager
            .start_session(StartRequest::new(OutputTarget::window(), channels()))
            .unwrap();
        assert_eq!(session.wait(Some(Duration::from_secs(3))), SessionState::Stopped);

        let deadline = Instant::now() + Duration::from_secs(3);
        while !manager.list_sessions().is_empty() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(20));
        }
        assert!(manager.list_sessions().is_empty());
    }

    #[test]
    fn zero_channel_session_starts() {
        let tmp = tempfile::tempdir().unwrap();
        let (manager, sinks) = manager(config(tmp.path().to_path_buf()), FakeBehavior::default());
        let session = manager
            .start_session(StartRequest::new(OutputTarget::hls("empty").unwrap(), vec![]))
            .unwrap();
        assert_eq!(session.state(), SessionState::Running);
        assert_eq!(sinks.log.sizes.lock()[0], (64, 36));
        manager.shutdown();
        assert_eq!(session.state(), SessionState::Stopped);
    }

    #[test]
    fn shutdown_drains_everything() {
        let tmp = tempfile::tempdir().unwrap();
        let (manager, _) = manager(config(tmp.path().to_path_buf()), FakeBehavior::default());
        let a = manager.start_session(StartRequest::new(rtp(5004), channels())).unwrap();
        let b = manager
            .start_session(StartRequest::new(OutputTarget::window(), channels()))
            .unwrap();
        manager.shutdown();
        assert!(manager.list_sessions().is_empty());
        assert!(a.state().is_terminal() && b.state().is_terminal());
        assert!(manager.start_session(StartRequest::new(rtp(5004), channels())).is_err());
    }

    #[test]
    fn unknown_session_id() {
        let tmp = tempfile::tempdir().unwrap();
        let (manager, _) = manager(config(tmp.path().to_path_buf()), FakeBehavior::default());
        assert!(matches!(
            manager.stop_session("nope"),
            Err(MosaicError::SessionNotFound(_))
        ));
    }

    #[test]
    fn info_serialises_camel_case() {
        let tmp = tempfile::tempdir().unwrap();
        let (manager, _) = manager(config(tmp.path().to_path_buf()), FakeBehavior::default());
        let session = manager.start_session(StartRequest::new(rtp(5004), channels())).unwrap();
        let json = serde_json::to_value(session.info()).unwrap();
        assert_eq!(json["state"], "running");
        assert_eq!(json["protocol"], "rtp");
        assert!(json["startedAt"].as_u64().is_some());
        assert!(json["expiresAt"].is_null());
        manager.shutdown();
    }
}
