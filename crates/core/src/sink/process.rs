//! Managed encoder/player subprocesses.
//!
//! Every subprocess-backed sink goes through [`ManagedProcess`]. Frames
//! reach the child's stdin through a writer thread and a one-slot queue:
//!
//! ```text
//! write_frame ──try_send──► [ 1 frame ] ──► stdin-writer ──write_all──► child stdin
//!      │ full: frame dropped
//!      └ writer busy longer than write_timeout: SinkWrite
//! ```
//!
//! so a child that stops reading never blocks the caller. Liveness is
//! polled with `try_wait`, and teardown is close stdin → bounded wait →
//! kill → reap. Killing the child also frees a writer stuck mid-frame. A
//! `ManagedProcess` that is dropped without
//! [`terminate`](ManagedProcess::terminate) is killed and reaped, so no
//! child outlives its owner.

use std::collections::BTreeMap;
use std::io::{ErrorKind, Write};
use std::path::Path;
use std::process::{Child, ChildStdin, Command, ExitStatus, Stdio};
use std::sync::Arc;
use std::sync::mpsc::{self, SyncSender, TrySendError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::error::{MosaicError, Result};

use super::PushOutcome;

const POLL_INTERVAL: Duration = Duration::from_millis(20);
/// How long a killed child's writer thread gets to notice the broken pipe.
const WRITER_JOIN_TIMEOUT: Duration = Duration::from_millis(500);
pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Default)]
struct WriterState {
    /// Set while a frame is being written.
    busy_since: Mutex<Option<Instant>>,
    failure: Mutex<Option<std::io::Error>>,
}

/// Owns the child's stdin on its own thread.
struct StdinWriter {
    frames: Option<SyncSender<Vec<u8>>>,
    state: Arc<WriterState>,
    handle: Option<JoinHandle<()>>,
}

impl StdinWriter {
    fn spawn(label: &str, mut stdin: ChildStdin) -> Result<Self> {
        let (tx, rx) = mpsc::sync_channel::<Vec<u8>>(1);
        let state = Arc::new(WriterState::default());
        let shared = state.clone();
        let handle = thread::Builder::new()
            .name(format!("{label} stdin"))
            .spawn(move || {
                for frame in rx {
                    *shared.busy_since.lock() = Some(Instant::now());
                    let result = stdin.write_all(&frame).and_then(|_| stdin.flush());
                    *shared.busy_since.lock() = None;
                    if let Err(e) = result {
                        *shared.failure.lock() = Some(e);
                        break;
                    }
                }
                // Dropping stdin here is the child's EOF.
            })?;
        Ok(Self {
            frames: Some(tx),
            state,
            handle: Some(handle),
        })
    }

    fn stalled_for(&self) -> Option<Duration> {
        self.state.busy_since.lock().map(|since| since.elapsed())
    }

    /// Stop feeding frames. The writer closes stdin once its current
    /// frame is out.
    fn close(&mut self) {
        self.frames.take();
    }

    /// Wait briefly for the writer thread; detach it if still stuck.
    fn join(&mut self, label: &str) {
        let Some(handle) = self.handle.take() else {
            return;
        };
        let deadline = Instant::now() + WRITER_JOIN_TIMEOUT;
        while !handle.is_finished() && Instant::now() < deadline {
            thread::sleep(POLL_INTERVAL);
        }
        if !handle.is_finished() {
            tracing::warn!(process = label, "stdin writer still blocked, detaching");
            return;
        }
        if handle.join().is_err() {
            tracing::error!(process = label, "stdin writer panicked");
        }
    }
}

/// A child process fed over stdin.
pub struct ManagedProcess {
    label: String,
    child: Child,
    writer: StdinWriter,
    write_timeout: Duration,
    dropped: u64,
    status: Option<ExitStatus>,
}

impl ManagedProcess {
    /// Spawn `program args...` with a piped stdin.
    pub fn spawn(label: &str, program: &str, args: &[String], cwd: Option<&Path>) -> Result<Self> {
        let mut command = Command::new(program);
        command
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::inherit());
        if let Some(dir) = cwd {
            command.current_dir(dir);
        }
        let mut child = command
            .spawn()
            .map_err(|e| MosaicError::SinkStart(format!("{label}: cannot run {program}: {e}")))?;
        let writer = match child.stdin.take().map(|stdin| StdinWriter::spawn(label, stdin)) {
            Some(Ok(writer)) => writer,
            failed => {
                let _ = child.kill();
                let _ = child.wait();
                let reason = match failed {
                    Some(Err(e)) => e.to_string(),
                    _ => "stdin unavailable".to_string(),
                };
                return Err(MosaicError::SinkStart(format!("{label}: {reason}")));
            }
        };
        tracing::info!(process = label, %program, pid = child.id(), "subprocess spawned");
        Ok(Self {
            label: label.to_string(),
            child,
            writer,
            write_timeout: DEFAULT_WRITE_TIMEOUT,
            dropped: 0,
            status: None,
        })
    }

    /// How long one frame may sit in the pipe before the child counts as
    /// stalled.
    pub fn with_write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = timeout;
        self
    }

    pub fn pid(&self) -> u32 {
        self.child.id()
    }

    /// Frames skipped because the child was still reading the previous one.
    pub fn dropped_frames(&self) -> u64 {
        self.dropped
    }

    /// Exit status if the child has already exited. Never blocks.
    pub fn has_exited(&mut self) -> Option<ExitStatus> {
        if self.status.is_none() {
            match self.child.try_wait() {
                Ok(status) => self.status = status,
                Err(e) => {
                    tracing::warn!(process = %self.label, error = %e, "try_wait failed");
                }
            }
        }
        self.status
    }

    /// Queue one raw frame for the child's stdin. Never blocks.
    ///
    /// A frame is dropped while the previous one is still queued. A child
    /// that has exited, or a broken pipe, is reported as
    /// [`MosaicError::SinkCrashed`]; a writer stuck on one frame for longer
    /// than the write timeout, or any other I/O failure, as
    /// [`MosaicError::SinkWrite`].
    pub fn write_frame(&mut self, bytes: &[u8]) -> Result<()> {
        if let Some(stalled) = self.writer.stalled_for()
            && stalled >= self.write_timeout
        {
            return Err(MosaicError::SinkWrite(format!(
                "{}: stdin blocked for {stalled:?}",
                self.label
            )));
        }
        self.offer_frame(bytes)
    }

    /// Like [`write_frame`](Self::write_frame) without the stall check.
    fn offer_frame(&mut self, bytes: &[u8]) -> Result<()> {
        if let Some(status) = self.has_exited() {
            return Err(MosaicError::SinkCrashed(format!("{}: {status}", self.label)));
        }
        let Some(frames) = self.writer.frames.as_ref() else {
            return Err(MosaicError::SinkWrite(format!("{}: stdin closed", self.label)));
        };
        match frames.try_send(bytes.to_vec()) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                self.dropped += 1;
                tracing::trace!(process = %self.label, dropped = self.dropped, "child busy, frame dropped");
                Ok(())
            }
            Err(TrySendError::Disconnected(_)) => Err(self.writer_failed()),
        }
    }

    /// Error for a writer thread that has given up.
    fn writer_failed(&mut self) -> MosaicError {
        let failure = self.writer.state.failure.lock().take();
        if let Some(e) = &failure
            && e.kind() != ErrorKind::BrokenPipe
        {
            return MosaicError::SinkWrite(format!("{}: {e}", self.label));
        }
        // The reader is gone; give the child a moment to be reapable.
        let status = self.wait_for_exit(Duration::from_millis(200));
        let reason = match (status, failure) {
            (Some(status), _) => status.to_string(),
            (None, Some(e)) => e.to_string(),
            (None, None) => "stdin writer stopped".to_string(),
        };
        MosaicError::SinkCrashed(format!("{}: {reason}", self.label))
    }

    fn wait_for_exit(&mut self, timeout: Duration) -> Option<ExitStatus> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(status) = self.has_exited() {
                return Some(status);
            }
            if Instant::now() >= deadline {
                return None;
            }
            thread::sleep(POLL_INTERVAL);
        }
    }

    /// Close stdin, wait up to `grace` for a clean exit, then kill and reap.
    ///
    /// Bounded even when the child has stopped reading mid-frame.
    pub fn terminate(&mut self, grace: Duration) -> Option<ExitStatus> {
        self.writer.close();
        let status = match self.wait_for_exit(grace) {
            Some(status) => {
                tracing::debug!(process = %self.label, pid = self.pid(), %status, "subprocess exited");
                Some(status)
            }
            None => {
                tracing::warn!(process = %self.label, pid = self.pid(), ?grace, "subprocess did not exit, killing");
                self.kill_and_reap()
            }
        };
        self.writer.join(&self.label);
        if self.dropped > 0 {
            tracing::debug!(process = %self.label, dropped = self.dropped, "frames dropped while child was busy");
        }
        status
    }

    fn kill_and_reap(&mut self) -> Option<ExitStatus> {
        if let Err(e) = self.child.kill() {
            tracing::warn!(process = %self.label, error = %e, "kill failed");
        }
        match self.child.wait() {
            Ok(status) => {
                self.status = Some(status);
                Some(status)
            }
            Err(e) => {
                tracing::error!(process = %self.label, error = %e, "wait failed");
                None
            }
        }
    }
}

impl Drop for ManagedProcess {
    fn drop(&mut self) {
        self.writer.close();
        if self.status.is_none() {
            let _ = self.child.kill();
            let _ = self.child.wait();
        }
    }
}

/// Expand an argument template.
///
/// Every `{name}` in an argument is replaced by its value from `vars`.
/// An argument that is exactly `{options}` expands to `-key value` pairs.
pub fn expand(template: &[String], vars: &[(&str, String)], options: &BTreeMap<String, String>) -> Vec<String> {
    let mut args = Vec::with_capacity(template.len() + options.len() * 2);
    for arg in template {
        if arg == "{options}" {
            for (key, value) in options {
                args.push(format!("-{key}"));
                args.push(value.clone());
            }
            continue;
        }
        let mut expanded = arg.clone();
        for (name, value) in vars {
            expanded = expanded.replace(&format!("{{{name}}}"), value);
        }
        args.push(expanded);
    }
    args
}

/// Feed `primer` to a starting encoder at `fps` until `ready` reports
/// readiness.
///
/// Fails with [`MosaicError::StartupTimeout`] when `timeout` elapses, or
/// [`MosaicError::SinkStart`] when the child exits first.
pub fn prime<T>(
    process: &mut ManagedProcess,
    primer: &[u8],
    fps: u32,
    timeout: Duration,
    mut ready: impl FnMut() -> Option<T>,
) -> Result<T> {
    let interval = Duration::from_secs(1) / fps.max(1);
    let started = Instant::now();
    loop {
        if let Some(artifact) = ready() {
            tracing::debug!(pid = process.pid(), elapsed = ?started.elapsed(), "encoder ready");
            return Ok(artifact);
        }
        if let Some(status) = process.has_exited() {
            return Err(MosaicError::SinkStart(format!(
                "{} exited during startup: {status}",
                process.label
            )));
        }
        if started.elapsed() >= timeout {
            return Err(MosaicError::StartupTimeout(timeout));
        }
        // Never blocks; a child that is not reading yet just drops primers.
        if let Err(e) = process.offer_frame(primer) {
            return Err(MosaicError::SinkStart(e.to_string()));
        }
        thread::sleep(interval);
    }
}

/// Push a frame to an encoder that must stay alive.
pub(crate) fn push_to_encoder(process: Option<&mut ManagedProcess>, bytes: &[u8]) -> Result<PushOutcome> {
    let Some(process) = process else {
        return Err(MosaicError::SinkWrite("sink not started".to_string()));
    };
    process.write_frame(bytes)?;
    Ok(PushOutcome::Continue)
}
