//! Supervision of the single conversion engine listener.
//!
//! The supervisor keeps exactly one listener alive on the engine port:
//!
//! ```text
//! Starting -> (port accepts connections) -> Listening
//!          -> (listener closed) -> Reaping -> Starting -> ...
//! ```
//!
//! The conversion queue is suspended for everything but `Listening`, so jobs
//! submitted during a restart wait instead of burning their retries against
//! a dead engine.
//!
//! Once LibreOffice has crashed, unoconv keeps launching fresh office
//! processes on every conversion unless the orphans are killed first, so a
//! closed listener always triggers a sweep of the process table before the
//! relaunch.

use crate::converter::engine_command;
use crate::error::{EngineError, SweepError};
use crate::queue::ConversionQueue;
use crate::telemetry;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use sysinfo::{Pid, ProcessRefreshKind, Signal, System, UpdateKind};
use tokio::net::TcpStream;
use tokio::sync::{oneshot, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// How long a stopped listener gets to exit before the final sweep.
const STOP_GRACE: Duration = Duration::from_secs(5);

/// Default time a launched listener gets to start accepting connections.
pub const DEFAULT_READY_TIMEOUT: Duration = Duration::from_secs(60);

const READY_POLL_START: Duration = Duration::from_millis(50);
const READY_POLL_MAX: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Starting,
    Listening,
    Reaping,
    Stopped,
}

impl fmt::Display for EngineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineState::Starting => write!(f, "starting"),
            EngineState::Listening => write!(f, "listening"),
            EngineState::Reaping => write!(f, "reaping"),
            EngineState::Stopped => write!(f, "stopped"),
        }
    }
}

/// A launched engine listener.
pub struct EngineHandle {
    port: u16,
    pid: Option<u32>,
    alive: Arc<AtomicBool>,
    closed: oneshot::Receiver<String>,
    stop: CancellationToken,
}

/// Launcher-side half of an [`EngineHandle`]: observes stop requests and
/// reports when the listener has gone away.
pub struct EngineMonitor {
    alive: Arc<AtomicBool>,
    closed: Option<oneshot::Sender<String>>,
    stop: CancellationToken,
}

impl EngineHandle {
    pub fn new(port: u16, pid: Option<u32>) -> (Self, EngineMonitor) {
        let alive = Arc::new(AtomicBool::new(true));
        let (closed_tx, closed_rx) = oneshot::channel();
        let stop = CancellationToken::new();

        let handle = Self {
            port,
            pid,
            alive: alive.clone(),
            closed: closed_rx,
            stop: stop.clone(),
        };
        let monitor = EngineMonitor {
            alive,
            closed: Some(closed_tx),
            stop,
        };
        (handle, monitor)
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Whether the listener is still accepting work.
    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    /// Asks the launcher to shut the listener down.
    pub fn stop(&self) {
        self.stop.cancel();
    }

    /// Resolves with the close reason once the listener is gone.
    ///
    /// Must not be awaited again after it has resolved.
    pub async fn closed(&mut self) -> String {
        match (&mut self.closed).await {
            Ok(reason) => reason,
            Err(_) => "engine monitor went away".to_string(),
        }
    }
}

impl EngineMonitor {
    /// Resolves once the supervisor asked for the listener to stop.
    pub async fn stopped(&self) {
        self.stop.cancelled().await
    }

    pub fn report_closed(mut self, reason: String) {
        self.alive.store(false, Ordering::SeqCst);
        if let Some(closed) = self.closed.take() {
            let _ = closed.send(reason);
        }
    }
}

impl Drop for EngineMonitor {
    fn drop(&mut self) {
        self.alive.store(false, Ordering::SeqCst);
    }
}

/// Starts engine listeners.
#[async_trait]
pub trait EngineLauncher: Send + Sync {
    /// Spawns a listener. The returned handle may not accept work yet.
    async fn launch(&self) -> Result<EngineHandle, EngineError>;

    /// Resolves once the listener on `port` accepts conversions.
    ///
    /// # Errors
    ///
    /// [`EngineError::NotReady`] if the listener did not come up in time.
    async fn wait_ready(&self, port: u16) -> Result<(), EngineError>;
}

/// Polls `127.0.0.1:port` with a capped exponential backoff until a TCP
/// connection succeeds.
///
/// # Arguments
///
/// * `port` - Engine listener port
/// * `limit` - Total time to keep trying
///
/// # Returns
///
/// `Ok(())` on the first accepted connection, or [`EngineError::NotReady`]
/// once `limit` has passed.
pub async fn wait_for_port(port: u16, limit: Duration) -> Result<(), EngineError> {
    let addr = SocketAddr::from(([127, 0, 0, 1], port));
    let deadline = Instant::now() + limit;
    let mut backoff = READY_POLL_START;

    loop {
        let attempt = tokio::time::timeout_at(deadline, TcpStream::connect(addr)).await;
        match attempt {
            Ok(Ok(_)) => return Ok(()),
            Ok(Err(e)) => debug!(port, "Engine not accepting connections yet: {}", e),
            Err(_) => {}
        }

        let now = Instant::now();
        if now >= deadline {
            return Err(EngineError::NotReady {
                port,
                waited: limit,
            });
        }
        tokio::time::sleep(backoff.min(deadline - now)).await;
        backoff = (backoff * 2).min(READY_POLL_MAX);
    }
}

/// Runs `unoconv --listener` on the engine port.
pub struct UnoconvListener {
    command: Vec<String>,
    port: u16,
    ready_timeout: Duration,
}

impl UnoconvListener {
    pub fn new(command: Vec<String>, port: u16) -> Self {
        Self {
            command,
            port,
            ready_timeout: DEFAULT_READY_TIMEOUT,
        }
    }

    /// Overrides how long a fresh listener may take to accept connections.
    pub fn with_ready_timeout(mut self, ready_timeout: Duration) -> Self {
        self.ready_timeout = ready_timeout;
        self
    }
}

#[async_trait]
impl EngineLauncher for UnoconvListener {
    async fn launch(&self) -> Result<EngineHandle, EngineError> {
        let mut cmd = engine_command(&self.command).ok_or_else(|| {
            EngineError::Launch(io::Error::new(
                io::ErrorKind::InvalidInput,
                "engine command is empty",
            ))
        })?;
        cmd.arg("--listener")
            .arg(format!("--port={}", self.port))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(EngineError::Launch)?;
        let (handle, monitor) = EngineHandle::new(self.port, child.id());

        tokio::spawn(async move {
            let reason = tokio::select! {
                status = child.wait() => match status {
                    Ok(status) => format!("listener exited with {status}"),
                    Err(e) => format!("lost track of listener: {e}"),
                },
                _ = monitor.stopped() => {
                    if let Err(e) = child.kill().await {
                        warn!("Failed to stop engine listener: {}", e);
                    }
                    "listener stopped".to_string()
                }
            };
            monitor.report_closed(reason);
        });

        Ok(handle)
    }

    async fn wait_ready(&self, port: u16) -> Result<(), EngineError> {
        wait_for_port(port, self.ready_timeout).await
    }
}

/// One entry of the OS process table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineProcess {
    pub pid: u32,
    pub name: String,
    pub command_line: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    Killed,
    AlreadyGone,
}

/// Structured access to the OS process table.
#[cfg_attr(test, mockall::automock)]
pub trait ProcessTable: Send + Sync {
    fn snapshot(&self) -> Vec<EngineProcess>;

    fn terminate(&self, pid: u32) -> Result<Termination, SweepError>;
}

/// [`ProcessTable`] backed by `sysinfo`.
pub struct SystemProcessTable {
    system: Mutex<System>,
}

impl SystemProcessTable {
    pub fn new() -> Self {
        Self {
            system: Mutex::new(System::new()),
        }
    }
}

impl Default for SystemProcessTable {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessTable for SystemProcessTable {
    fn snapshot(&self) -> Vec<EngineProcess> {
        let mut system = self.system.lock();
        // Command lines are not part of the default refresh; the sweep
        // matches on them.
        system.refresh_processes_specifics(
            ProcessRefreshKind::new().with_cmd(UpdateKind::Always),
        );
        system
            .processes()
            .iter()
            .map(|(pid, process)| EngineProcess {
                pid: pid.as_u32(),
                name: process.name().to_string(),
                command_line: process.cmd().join(" "),
            })
            .collect()
    }

    fn terminate(&self, pid: u32) -> Result<Termination, SweepError> {
        let mut system = self.system.lock();
        let target = Pid::from_u32(pid);
        if !system.refresh_process(target) {
            return Ok(Termination::AlreadyGone);
        }
        let Some(process) = system.process(target) else {
            return Ok(Termination::AlreadyGone);
        };

        let signalled = process.kill_with(Signal::Kill).unwrap_or_else(|| process.kill());
        if signalled {
            Ok(Termination::Killed)
        } else if !system.refresh_process(target) {
            Ok(Termination::AlreadyGone)
        } else {
            Err(SweepError::Refused { pid })
        }
    }
}

/// Which processes belong to the supervised engine.
#[derive(Debug, Clone)]
pub struct SweepTarget {
    pattern: String,
    port: u16,
}

impl SweepTarget {
    pub fn new(pattern: &str, port: u16) -> Self {
        Self {
            pattern: pattern.to_lowercase(),
            port,
        }
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Name or command line mentions the engine binary, and the command line
    /// mentions the engine port.
    pub fn matches(&self, process: &EngineProcess) -> bool {
        let names_engine = process.name.to_lowercase().contains(&self.pattern)
            || process.command_line.to_lowercase().contains(&self.pattern);
        names_engine && mentions_port(&process.command_line, self.port)
    }
}

fn mentions_port(command_line: &str, port: u16) -> bool {
    let port = port.to_string();
    command_line.match_indices(&port).any(|(at, _)| {
        let before = command_line[..at].chars().next_back();
        let after = command_line[at + port.len()..].chars().next();
        !before.is_some_and(|c| c.is_ascii_digit()) && !after.is_some_and(|c| c.is_ascii_digit())
    })
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Processes killed, or already gone by the time we got to them.
    pub killed: Vec<u32>,
    /// Processes that survived the kill attempt.
    pub failed: Vec<u32>,
}

/// Kills every engine process bound to the target port. Best effort: a
/// process that cannot be killed is logged and skipped.
///
/// # Arguments
///
/// * `table` - Process table to enumerate and signal
/// * `target` - Engine pattern and port identifying the processes to kill
///
/// # Returns
///
/// Which pids were taken care of and which survived.
pub fn reap(table: &dyn ProcessTable, target: &SweepTarget) -> SweepReport {
    let own_pid = std::process::id();
    let mut report = SweepReport::default();

    for process in table
        .snapshot()
        .into_iter()
        .filter(|p| p.pid != own_pid && target.matches(p))
    {
        info!(pid = process.pid, "Killing engine process");
        match table.terminate(process.pid) {
            Ok(Termination::Killed) => report.killed.push(process.pid),
            Ok(Termination::AlreadyGone) => {
                debug!(pid = process.pid, "Engine process already gone");
                report.killed.push(process.pid);
            }
            Err(e) => {
                error!(pid = process.pid, "Error killing engine process: {}", e);
                report.failed.push(process.pid);
            }
        }
    }

    report
}

/// How a freshly launched listener came up.
enum Readiness {
    Ready,
    TimedOut(EngineError),
    Closed(String),
}

/// Keeps one engine listener alive and restarts it after every close.
pub struct EngineSupervisor {
    launcher: Arc<dyn EngineLauncher>,
    processes: Arc<dyn ProcessTable>,
    queue: ConversionQueue,
    target: SweepTarget,
    relaunch_delay: Duration,
    state: watch::Sender<EngineState>,
}

impl EngineSupervisor {
    /// Creates a supervisor for `queue`.
    ///
    /// The queue is suspended right away and only resumed by [`run`] once a
    /// listener accepts connections.
    ///
    /// [`run`]: EngineSupervisor::run
    pub fn new(
        launcher: Arc<dyn EngineLauncher>,
        processes: Arc<dyn ProcessTable>,
        queue: ConversionQueue,
        target: SweepTarget,
        relaunch_delay: Duration,
    ) -> Self {
        let (state, _) = watch::channel(EngineState::Starting);
        queue.suspend();
        Self {
            launcher,
            processes,
            queue,
            target,
            relaunch_delay,
            state,
        }
    }

    /// Watches the supervisor's state transitions.
    pub fn subscribe(&self) -> watch::Receiver<EngineState> {
        self.state.subscribe()
    }

    /// Supervises the engine until `shutdown` is cancelled, then stops the
    /// listener and sweeps whatever it left behind.
    ///
    /// The queue is only resumed once a listener accepts connections, and
    /// is suspended again as soon as that listener closes.
    pub async fn run(self, shutdown: CancellationToken) {
        info!(port = self.target.port(), "Engine supervisor started");

        loop {
            self.set_state(EngineState::Starting);

            let launched = tokio::select! {
                launched = self.launcher.launch() => launched,
                _ = shutdown.cancelled() => break,
            };
            let mut handle = match launched {
                Ok(handle) => handle,
                Err(e) => {
                    error!("{}; retrying in {:?}", e, self.relaunch_delay);
                    tokio::select! {
                        _ = tokio::time::sleep(self.relaunch_delay) => continue,
                        _ = shutdown.cancelled() => break,
                    }
                }
            };

            info!(
                pid = ?handle.pid(),
                port = handle.port(),
                "Engine listener started, waiting for it to accept connections"
            );

            let readiness = tokio::select! {
                ready = self.launcher.wait_ready(handle.port()) => match ready {
                    Ok(()) => Readiness::Ready,
                    Err(e) => Readiness::TimedOut(e),
                },
                reason = handle.closed() => Readiness::Closed(reason),
                _ = shutdown.cancelled() => {
                    stop_listener(&mut handle).await;
                    break;
                }
            };

            let reason = match readiness {
                Readiness::Ready => {
                    info!(port = handle.port(), "Engine listener accepting connections");
                    self.set_state(EngineState::Listening);
                    self.queue.resume();

                    tokio::select! {
                        reason = handle.closed() => reason,
                        _ = shutdown.cancelled() => {
                            self.queue.suspend();
                            stop_listener(&mut handle).await;
                            break;
                        }
                    }
                }
                Readiness::TimedOut(e) => {
                    error!("{}", e);
                    stop_listener(&mut handle).await;
                    e.to_string()
                }
                Readiness::Closed(reason) => reason,
            };

            warn!(reason = %reason, "Engine listener closed, restarting");
            self.queue.suspend();
            self.set_state(EngineState::Reaping);

            let report = self.sweep().await;
            telemetry::record_engine_restart(self.target.port(), &report);
        }

        self.set_state(EngineState::Reaping);
        let report = self.sweep().await;
        debug!(killed = report.killed.len(), "Final engine sweep finished");
        self.set_state(EngineState::Stopped);
        info!("Engine supervisor stopped");
    }

    async fn sweep(&self) -> SweepReport {
        let processes = self.processes.clone();
        let target = self.target.clone();
        match tokio::task::spawn_blocking(move || reap(processes.as_ref(), &target)).await {
            Ok(report) => report,
            Err(e) => {
                error!("Engine sweep crashed: {}", e);
                SweepReport::default()
            }
        }
    }

    fn set_state(&self, state: EngineState) {
        debug!(state = %state, "Engine state changed");
        self.state.send_replace(state);
    }
}

/// Asks a listener to stop and gives it a grace period to exit.
async fn stop_listener(handle: &mut EngineHandle) {
    handle.stop();
    if tokio::time::timeout(STOP_GRACE, handle.closed()).await.is_err() {
        warn!("Engine listener did not stop within {:?}", STOP_GRACE);
    }
}
