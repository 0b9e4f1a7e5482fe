//! Connection supervisor
//!
//! Owns the single VPN session: spawns OpenConnect, watches its output for
//! the tunnel attach line, applies split routes, and reports every state
//! change as a status event.
//!
//! All state lives behind one lock and every event is queued while that lock
//! is held, so clients observe transitions in the order they happened. Each
//! connect attempt gets a session id; callbacks from an older session's
//! process or readers are ignored.

use super::events::EventSink;
use super::routes::apply_split_routes;
use crate::config::ServiceConfig;
use crate::ipc::message::{ErrorCode, LogStream, StatusData, VpnStatus, status_data};
use crate::openconnect::output::{Demultiplexer, LineConsumer, device_attach_matcher, spawn_line_reader};
use crate::openconnect::process::{self, ProcessExit, ProcessHandle, Termination, mask_cookie};
use crate::openconnect::TunnelDevice;
use crate::platform::RoutingManager;
use crate::profile::{DestinationNetwork, VpnProfile};
use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::process::{ChildStderr, ChildStdout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// How long output readers may keep draining after the process is gone.
const READER_DRAIN_GRACE: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct SupervisorSettings {
    pub executable: PathBuf,
    pub route_settle_delay: Duration,
    pub terminate_timeout: Duration,
    pub kill_timeout: Duration,
}

impl From<&ServiceConfig> for SupervisorSettings {
    fn from(config: &ServiceConfig) -> Self {
        Self {
            executable: config.executable.clone(),
            route_settle_delay: config.route_settle_delay(),
            terminate_timeout: config.terminate_timeout(),
            kill_timeout: config.kill_timeout(),
        }
    }
}

struct Session {
    id: u64,
    profile: VpnProfile,
    process: Option<ProcessHandle>,
    device: Option<TunnelDevice>,
    readers: CancellationToken,
}

struct State {
    status: VpnStatus,
    session: Option<Session>,
}

impl State {
    fn current(&self, id: u64) -> Option<&Session> {
        self.session.as_ref().filter(|s| s.id == id)
    }

    fn current_mut(&mut self, id: u64) -> Option<&mut Session> {
        self.session.as_mut().filter(|s| s.id == id)
    }
}

pub struct Supervisor {
    state: Mutex<State>,
    events: EventSink,
    routing: Arc<dyn RoutingManager>,
    settings: SupervisorSettings,
    next_session: AtomicU64,
    shutdown: CancellationToken,
}

impl Supervisor {
    pub fn new(
        settings: SupervisorSettings,
        events: EventSink,
        routing: Arc<dyn RoutingManager>,
    ) -> Self {
        Self {
            state: Mutex::new(State {
                status: VpnStatus::Disconnected,
                session: None,
            }),
            events,
            routing,
            settings,
            next_session: AtomicU64::new(1),
            shutdown: CancellationToken::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn status(&self) -> VpnStatus {
        self.lock().status
    }

    fn set_status(
        &self,
        state: &mut State,
        status: VpnStatus,
        message: impl Into<String>,
        data: StatusData,
    ) {
        if state.status != status {
            debug!("Status {} -> {}", state.status, status);
        }
        state.status = status;
        self.events.status(status, message, data);
    }

    /// Start a session for `profile`. Rejected unless currently disconnected.
    pub fn connect(self: &Arc<Self>, profile: VpnProfile, cookie: String) {
        let session_id = {
            let mut state = self.lock();
            if state.status != VpnStatus::Disconnected {
                let message = match state.status {
                    VpnStatus::Disconnecting => "Disconnection in progress, try again shortly",
                    _ => "Connection already in progress or established",
                };
                warn!("Rejecting connect request: {} ({})", message, state.status);
                self.events.error(
                    message,
                    ErrorCode::AlreadyInProgress,
                    Some(format!("Current status: {}", state.status)),
                );
                return;
            }

            let id = self.next_session.fetch_add(1, Ordering::Relaxed);
            info!(
                "Connecting to {} ({}), cookie {}",
                profile.name,
                profile.url,
                mask_cookie(&cookie)
            );
            let data = status_data([
                ("vpn_url", profile.url.clone()),
                ("profile_name", profile.name.clone()),
            ]);
            let message = format!("Starting connection to {}", profile.name);
            state.session = Some(Session {
                id,
                profile: profile.clone(),
                process: None,
                device: None,
                readers: self.shutdown.child_token(),
            });
            self.set_status(&mut state, VpnStatus::Connecting, message, data);
            id
        };

        let this = Arc::clone(self);
        tokio::spawn(async move {
            this.start_session(session_id, profile, cookie);
        });
    }

    fn start_session(self: Arc<Self>, id: u64, profile: VpnProfile, cookie: String) {
        let executable = match process::resolve_executable(&self.settings.executable) {
            Ok(path) => path,
            Err(e) => {
                self.fail_session(
                    id,
                    "OpenConnect executable not found",
                    ErrorCode::ExecutableNotFound,
                    Some(e.to_string()),
                );
                return;
            }
        };
        info!("Using OpenConnect at: {}", executable.display());
        info!(
            "Executing command: {}",
            process::masked_command_line(&executable, &profile.url)
        );

        let monitor = Arc::clone(&self);
        let spawned = match process::spawn(
            &executable,
            process::command_args(&profile.url, &cookie),
            move |exit| monitor.on_process_exit(id, exit),
        ) {
            Ok(spawned) => spawned,
            Err(e) => {
                self.fail_session(
                    id,
                    &format!("Failed to start OpenConnect: {}", e),
                    ErrorCode::NetworkError,
                    Some(e.to_string()),
                );
                return;
            }
        };

        let mut state = self.lock();
        let status = state.status;
        let Some(session) = state.current_mut(id) else {
            // already reaped; readers still drain to end-of-stream
            debug!("Session {} ended before its process was registered", id);
            self.start_output_readers(id, spawned.stdout, spawned.stderr, self.shutdown.child_token());
            return;
        };
        session.process = Some(spawned.handle.clone());
        let readers = session.readers.clone();
        self.start_output_readers(id, spawned.stdout, spawned.stderr, readers);

        if status == VpnStatus::Disconnecting {
            info!("Disconnect requested during startup, stopping OpenConnect");
            self.spawn_terminate(spawned.handle);
        }
    }

    fn start_output_readers(
        self: &Arc<Self>,
        id: u64,
        stdout: ChildStdout,
        stderr: ChildStderr,
        stop: CancellationToken,
    ) {
        spawn_line_reader(stdout, "stdout", self.output_consumer(id, LogStream::Stdout), stop.clone());
        spawn_line_reader(stderr, "stderr", self.output_consumer(id, LogStream::Stderr), stop);
    }

    /// Every line is republished as command output, then checked for the
    /// attach announcement.
    fn output_consumer(self: &Arc<Self>, id: u64, stream: LogStream) -> Arc<dyn LineConsumer> {
        let events = self.events.clone();
        let this = Arc::clone(self);
        Arc::new(
            Demultiplexer::new()
                .with(move |line: &str| events.command_output(line, stream))
                .with(device_attach_matcher(move |device| {
                    this.on_device_attached(id, device)
                })),
        )
    }

    fn on_device_attached(self: &Arc<Self>, id: u64, device: TunnelDevice) {
        let routes = {
            let mut state = self.lock();
            let status = state.status;
            let Some(session) = state.current_mut(id) else {
                return;
            };
            if status != VpnStatus::Connecting {
                debug!("Ignoring attach announcement while {}", status);
                return;
            }

            session.device = Some(device.clone());
            let routes = session.profile.routes.clone();
            let message = format!("Connected to {}", session.profile.name);
            let data = status_data([
                ("device_name", device.name.clone()),
                ("device_type", device.device_type.clone()),
                ("device_index", device.index.clone()),
                ("vpn_url", session.profile.url.clone()),
            ]);
            info!(
                "Connection established: {} device '{}', index {}",
                device.device_type, device.name, device.index
            );
            self.set_status(&mut state, VpnStatus::Connected, message, data);
            routes
        };

        if routes.is_empty() {
            info!("No custom routes specified, using default OpenConnect routing");
            return;
        }

        let this = Arc::clone(self);
        tokio::spawn(async move { this.apply_routes(id, device, routes).await });
    }

    async fn apply_routes(self: Arc<Self>, id: u64, device: TunnelDevice, routes: Vec<DestinationNetwork>) {
        tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => return,
            _ = tokio::time::sleep(self.settings.route_settle_delay) => {}
        }

        let still_connected = {
            let state = self.lock();
            state.current(id).is_some() && state.status == VpnStatus::Connected
        };
        if !still_connected {
            info!("Session ended before routes could be applied");
            return;
        }

        let routing = Arc::clone(&self.routing);
        let result =
            tokio::task::spawn_blocking(move || apply_split_routes(routing.as_ref(), &device, &routes))
                .await;
        match result {
            Ok(report) if !report.failed.is_empty() => warn!(
                "{} of {} routes could not be applied",
                report.failed.len(),
                report.failed.len() + report.applied.len()
            ),
            Ok(_) => {}
            Err(e) => error!("Route application task failed: {}", e),
        }
    }

    fn on_process_exit(&self, id: u64, exit: io::Result<ProcessExit>) {
        let mut state = self.lock();
        if state.current(id).is_none() {
            debug!("Ignoring exit of stale session {}", id);
            return;
        }

        match exit {
            Err(e) => {
                error!("Error monitoring OpenConnect process: {}", e);
                self.events.error(
                    "Error monitoring OpenConnect process",
                    ErrorCode::UnknownError,
                    Some(e.to_string()),
                );
                self.set_status(
                    &mut state,
                    VpnStatus::Disconnected,
                    "Connection lost",
                    status_data([
                        ("reason", e.to_string()),
                        ("was_error", "true".to_string()),
                    ]),
                );
            }
            Ok(exit) if state.status == VpnStatus::Disconnecting => {
                info!("OpenConnect stopped ({})", exit);
                self.set_status(
                    &mut state,
                    VpnStatus::Disconnected,
                    "VPN disconnected successfully",
                    status_data([
                        ("reason", "user_requested".to_string()),
                        ("was_error", "false".to_string()),
                    ]),
                );
            }
            Ok(exit) => {
                let reason = format!("OpenConnect process terminated unexpectedly ({})", exit);
                warn!("{}", reason);
                let mut data = status_data([
                    ("reason", reason.clone()),
                    ("was_error", "true".to_string()),
                ]);
                if let Some(code) = exit.code {
                    data.insert("exit_code".to_string(), code.to_string());
                }
                self.set_status(&mut state, VpnStatus::Disconnected, reason, data);
            }
        }
        self.end_session(&mut state);
    }

    /// Report a failed attempt: an error, then DISCONNECTED with `was_error`.
    fn fail_session(&self, id: u64, message: &str, code: ErrorCode, details: Option<String>) {
        error!("{}", message);
        let mut state = self.lock();
        if state.current(id).is_none() {
            return;
        }
        self.events.error(message, code, details);
        self.set_status(
            &mut state,
            VpnStatus::Disconnected,
            format!("Connection failed: {}", message),
            status_data([
                ("reason", message.to_string()),
                ("was_error", "true".to_string()),
            ]),
        );
        self.end_session(&mut state);
    }

    fn end_session(&self, state: &mut State) {
        let Some(session) = state.session.take() else {
            return;
        };
        let readers = session.readers;
        tokio::spawn(async move {
            tokio::time::sleep(READER_DRAIN_GRACE).await;
            readers.cancel();
        });
    }

    pub fn disconnect(self: &Arc<Self>) {
        let mut state = self.lock();
        self.disconnect_locked(&mut state);
    }

    fn disconnect_locked(self: &Arc<Self>, state: &mut State) {
        match state.status {
            VpnStatus::Disconnected => {
                self.set_status(
                    state,
                    VpnStatus::Disconnected,
                    "Already disconnected",
                    status_data([
                        ("reason", "already_disconnected".to_string()),
                        ("was_error", "false".to_string()),
                    ]),
                );
            }
            VpnStatus::Disconnecting => {
                self.events.error(
                    "Disconnection already in progress",
                    ErrorCode::AlreadyInProgress,
                    None,
                );
            }
            VpnStatus::Connecting | VpnStatus::Connected => {
                info!("Disconnecting VPN");
                self.set_status(
                    state,
                    VpnStatus::Disconnecting,
                    "Starting VPN disconnection",
                    status_data([("reason", "user_requested".to_string())]),
                );
                // no handle yet means startup will notice DISCONNECTING
                if let Some(handle) = state.session.as_ref().and_then(|s| s.process.clone()) {
                    self.spawn_terminate(handle);
                }
            }
        }
    }

    fn spawn_terminate(&self, handle: ProcessHandle) {
        let graceful = self.settings.terminate_timeout;
        let forced = self.settings.kill_timeout;
        tokio::spawn(async move {
            match handle.terminate(graceful, forced).await {
                Termination::Stuck => error!("OpenConnect {}", Termination::Stuck),
                Termination::Forced => warn!("OpenConnect {}", Termination::Forced),
                outcome => info!("OpenConnect {}", outcome),
            }
        });
    }

    /// Disconnect when a session is starting or up. Used when the last
    /// client goes away.
    pub fn disconnect_if_active(self: &Arc<Self>) -> bool {
        let mut state = self.lock();
        match state.status {
            VpnStatus::Connecting | VpnStatus::Connected => {
                info!("No clients left, disconnecting active VPN session");
                self.disconnect_locked(&mut state);
                true
            }
            _ => {
                debug!("No clients left, no active VPN session");
                false
            }
        }
    }

    /// Report the current state. A CONNECTED session whose process has died
    /// without being reaped yet is reported as lost.
    pub fn query_status(&self) {
        let state = self.lock();
        let (status, message, data) = match (state.status, state.session.as_ref()) {
            (VpnStatus::Connected, Some(session)) => {
                let alive = session.process.as_ref().is_some_and(|p| !p.has_exited());
                if alive {
                    let mut data = status_data([
                        ("vpn_url", session.profile.url.clone()),
                        ("profile_name", session.profile.name.clone()),
                    ]);
                    if let Some(device) = &session.device {
                        data.insert("device_name".to_string(), device.name.clone());
                        data.insert("device_type".to_string(), device.device_type.clone());
                        data.insert("device_index".to_string(), device.index.clone());
                    }
                    (
                        VpnStatus::Connected,
                        format!("Connected to {}", session.profile.name),
                        data,
                    )
                } else {
                    (
                        VpnStatus::Disconnected,
                        "Connection lost".to_string(),
                        status_data([
                            ("reason", "process_terminated".to_string()),
                            ("was_error", "true".to_string()),
                        ]),
                    )
                }
            }
            (VpnStatus::Connecting, Some(session)) => (
                VpnStatus::Connecting,
                format!("Connecting to {}", session.profile.name),
                status_data([
                    ("vpn_url", session.profile.url.clone()),
                    ("profile_name", session.profile.name.clone()),
                ]),
            ),
            (VpnStatus::Disconnecting, _) => (
                VpnStatus::Disconnecting,
                "Disconnecting VPN".to_string(),
                status_data([("reason", "user_requested".to_string())]),
            ),
            _ => (
                VpnStatus::Disconnected,
                "VPN is disconnected".to_string(),
                status_data([
                    ("reason", "not_connected".to_string()),
                    ("was_error", "false".to_string()),
                ]),
            ),
        };
        self.events.status(status, message, data);
    }

    /// Stop the active process, if any, and wait for it to go away.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let handle = {
            let mut state = self.lock();
            let handle = state.session.as_ref().and_then(|s| s.process.clone());
            if matches!(state.status, VpnStatus::Connecting | VpnStatus::Connected) {
                info!("Service stopping, disconnecting VPN");
                self.set_status(
                    &mut state,
                    VpnStatus::Disconnecting,
                    "Service stopping",
                    status_data([("reason", "service_stopping".to_string())]),
                );
            }
            handle
        };
        if let Some(handle) = handle {
            let outcome = handle
                .terminate(self.settings.terminate_timeout, self.settings.kill_timeout)
                .await;
            info!("OpenConnect stopped on shutdown: {}", outcome);
        }
    }
}
