//! OpenConnect child process: spawn, exit monitoring and termination

use std::ffi::OsString;
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use thiserror::Error;
use tokio::process::{ChildStderr, ChildStdout, Command};
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

/// Name reported as `process_name` on forwarded output lines
pub const PROCESS_NAME: &str = "openconnect";

#[derive(Error, Debug)]
pub enum ProcessError {
    #[error("OpenConnect executable not found: {0}")]
    ExecutableNotFound(String),
    #[error("Failed to start OpenConnect: {0}")]
    SpawnFailed(#[from] io::Error),
}

/// How the child ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessExit {
    pub code: Option<i32>,
}

impl ProcessExit {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

impl fmt::Display for ProcessExit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.code {
            Some(code) => write!(f, "exit code: {}", code),
            None => f.write_str("terminated by signal"),
        }
    }
}

/// Which path `terminate` ended up taking
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    AlreadyExited,
    Graceful,
    Forced,
    Stuck,
}

impl fmt::Display for Termination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Termination::AlreadyExited => "already exited",
            Termination::Graceful => "terminated gracefully",
            Termination::Forced => "force-killed",
            Termination::Stuck => "still running after kill",
        };
        f.write_str(text)
    }
}

/// Resolve the configured executable. Bare names are looked up on `PATH`.
pub fn resolve_executable(configured: &Path) -> Result<PathBuf, ProcessError> {
    let not_found = || ProcessError::ExecutableNotFound(configured.display().to_string());

    if configured.components().count() > 1 || configured.is_absolute() {
        return if configured.is_file() {
            Ok(configured.to_path_buf())
        } else {
            Err(not_found())
        };
    }

    let path_var = std::env::var_os("PATH").ok_or_else(not_found)?;
    let mut names = vec![configured.as_os_str().to_os_string()];
    if cfg!(windows) && configured.extension().is_none() {
        let mut exe = configured.as_os_str().to_os_string();
        exe.push(".exe");
        names.insert(0, exe);
    }

    for dir in std::env::split_paths(&path_var) {
        for name in &names {
            let candidate = dir.join(name);
            if candidate.is_file() {
                return Ok(candidate);
            }
        }
    }
    Err(not_found())
}

/// Arguments passed to OpenConnect: `<url> --cookie <cookie>`
pub fn command_args(url: &str, cookie: &str) -> Vec<OsString> {
    vec![url.into(), "--cookie".into(), cookie.into()]
}

/// Command line suitable for logs, with the cookie replaced.
pub fn masked_command_line(executable: &Path, url: &str) -> String {
    format!("{} {} --cookie ***", executable.display(), url)
}

/// Show at most the last 4 characters of a secret, and only when it is long
/// enough for that not to give most of it away.
pub fn mask_cookie(cookie: &str) -> String {
    let chars: Vec<char> = cookie.chars().collect();
    if chars.len() <= 8 {
        return "***".to_string();
    }
    let tail: String = chars[chars.len() - 4..].iter().collect();
    format!("***{}", tail)
}

/// Cloneable handle to a running child, used for status checks and shutdown.
#[derive(Clone)]
pub struct ProcessHandle {
    pid: Option<u32>,
    kill_tx: mpsc::Sender<()>,
    exit_rx: watch::Receiver<Option<ProcessExit>>,
}

impl fmt::Debug for ProcessHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessHandle")
            .field("pid", &self.pid)
            .field("exit", &*self.exit_rx.borrow())
            .finish()
    }
}

impl ProcessHandle {
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn has_exited(&self) -> bool {
        self.exit_rx.borrow().is_some()
    }

    /// Wait up to `timeout` for the child to exit.
    pub async fn wait_exit(&self, timeout: Duration) -> bool {
        let mut rx = self.exit_rx.clone();
        matches!(
            tokio::time::timeout(timeout, rx.wait_for(Option::is_some)).await,
            Ok(Ok(_))
        )
    }

    /// Ask the child to shut down cleanly.
    pub fn request_stop(&self) -> io::Result<()> {
        let Some(pid) = self.pid else {
            return Ok(());
        };

        #[cfg(unix)]
        {
            use nix::sys::signal::{Signal, kill};
            use nix::unistd::Pid;
            kill(Pid::from_raw(pid as i32), Signal::SIGTERM).map_err(io::Error::from)
        }

        #[cfg(windows)]
        {
            send_ctrl_break(pid)
        }
    }

    /// Kill the child outright.
    pub fn force_kill(&self) {
        if self.kill_tx.try_send(()).is_err() {
            debug!("Kill request dropped, process monitor already finished");
        }
    }

    /// Graceful stop, bounded wait, then force-kill and a second bounded wait.
    pub async fn terminate(&self, graceful: Duration, forced: Duration) -> Termination {
        if self.has_exited() {
            return Termination::AlreadyExited;
        }

        info!("Attempting graceful OpenConnect termination");
        match self.request_stop() {
            Ok(()) => {
                if self.wait_exit(graceful).await {
                    info!("OpenConnect terminated gracefully");
                    return Termination::Graceful;
                }
                warn!("OpenConnect did not terminate gracefully, forcing kill");
            }
            Err(e) => warn!("Stop request could not be delivered ({}), forcing kill", e),
        }

        self.force_kill();
        if self.wait_exit(forced).await {
            warn!("OpenConnect force-killed");
            Termination::Forced
        } else {
            error!("OpenConnect still running after kill");
            Termination::Stuck
        }
    }
}

/// Deliver CTRL_BREAK to the child's process group.
///
/// Console control events only reach processes attached to the sender's
/// console, and the child runs on its own hidden one. The service briefly
/// attaches to that console to send the event, then returns to its own
/// console if it had one. Console attachment is process-wide, hence the lock.
#[cfg(windows)]
fn send_ctrl_break(pid: u32) -> io::Result<()> {
    use std::sync::{Mutex, PoisonError};
    use windows::Win32::System::Console::{
        ATTACH_PARENT_PROCESS, AttachConsole, CTRL_BREAK_EVENT, FreeConsole,
        GenerateConsoleCtrlEvent, GetConsoleWindow,
    };

    static CONSOLE: Mutex<()> = Mutex::new(());
    let _guard = CONSOLE.lock().unwrap_or_else(PoisonError::into_inner);

    unsafe {
        let had_console = !GetConsoleWindow().0.is_null();
        if had_console {
            let _ = FreeConsole();
        }
        // The child leads its own process group, so the group id is its pid
        let sent = AttachConsole(pid).and_then(|()| {
            let sent = GenerateConsoleCtrlEvent(CTRL_BREAK_EVENT, pid);
            let _ = FreeConsole();
            sent
        });
        if had_console && AttachConsole(ATTACH_PARENT_PROCESS).is_err() {
            debug!("Could not reattach to the parent console");
        }
        sent.map_err(io::Error::other)
    }
}

/// A freshly spawned child with its output streams.
pub struct SpawnedProcess {
    pub handle: ProcessHandle,
    pub stdout: ChildStdout,
    pub stderr: ChildStderr,
}

/// Spawn `executable` with `args` and start monitoring it.
///
/// `on_exit` runs once, on the monitor task, when the child has been reaped.
pub fn spawn<F>(executable: &Path, args: Vec<OsString>, on_exit: F) -> Result<SpawnedProcess, ProcessError>
where
    F: FnOnce(io::Result<ProcessExit>) + Send + 'static,
{
    let mut command = Command::new(executable);
    command
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    #[cfg(windows)]
    {
        use windows::Win32::System::Threading::{CREATE_NEW_PROCESS_GROUP, CREATE_NO_WINDOW};
        command.creation_flags(CREATE_NEW_PROCESS_GROUP.0 | CREATE_NO_WINDOW.0);
    }

    let mut child = command.spawn()?;
    let pid = child.id();
    let (stdout, stderr) = match (child.stdout.take(), child.stderr.take()) {
        (Some(stdout), Some(stderr)) => (stdout, stderr),
        _ => {
            return Err(ProcessError::SpawnFailed(io::Error::other(
                "child output pipes unavailable",
            )));
        }
    };
    debug!("Spawned {} with pid {:?}", PROCESS_NAME, pid);

    let (kill_tx, mut kill_rx) = mpsc::channel::<()>(1);
    let (exit_tx, exit_rx) = watch::channel(None);

    tokio::spawn(async move {
        let status = tokio::select! {
            status = child.wait() => status,
            Some(()) = kill_rx.recv() => {
                if let Err(e) = child.start_kill() {
                    warn!("Failed to kill {}: {}", PROCESS_NAME, e);
                }
                child.wait().await
            }
        };

        let outcome = status.map(|s| ProcessExit { code: s.code() });
        // A wait failure still means we have lost the child
        let _ = exit_tx.send(Some(
            outcome.as_ref().copied().unwrap_or(ProcessExit { code: None }),
        ));
        on_exit(outcome);
    });

    Ok(SpawnedProcess {
        handle: ProcessHandle {
            pid,
            kill_tx,
            exit_rx,
        },
        stdout,
        stderr,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::oneshot;

    #[test]
    fn test_mask_cookie() {
        assert_eq!(mask_cookie(""), "***");
        assert_eq!(mask_cookie("short"), "***");
        assert_eq!(mask_cookie("0123456789abcdef"), "***cdef");
    }

    #[test]
    fn test_masked_command_line_hides_cookie() {
        let line = masked_command_line(Path::new("/usr/sbin/openconnect"), "vpn.example.com");
        assert_eq!(line, "/usr/sbin/openconnect vpn.example.com --cookie ***");
    }

    #[test]
    fn test_command_args() {
        let args = command_args("vpn.example.com", "c00kie");
        let args: Vec<&str> = args.iter().filter_map(|a| a.to_str()).collect();
        assert_eq!(args, vec!["vpn.example.com", "--cookie", "c00kie"]);
    }

    #[test]
    fn test_resolve_missing_executable() {
        let result = resolve_executable(Path::new("/definitely/not/here/openconnect"));
        assert!(matches!(result, Err(ProcessError::ExecutableNotFound(_))));

        let result = resolve_executable(Path::new("openconnect-binary-that-does-not-exist"));
        assert!(matches!(result, Err(ProcessError::ExecutableNotFound(_))));
    }

    #[test]
    fn test_process_exit_display() {
        assert_eq!(ProcessExit { code: Some(2) }.to_string(), "exit code: 2");
        assert_eq!(ProcessExit { code: None }.to_string(), "terminated by signal");
        assert!(ProcessExit { code: Some(0) }.success());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_resolve_on_path() {
        let resolved = resolve_executable(Path::new("sh")).unwrap();
        assert!(resolved.is_absolute());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_exit_is_reported() {
        let (tx, rx) = oneshot::channel();
        let spawned = spawn(
            Path::new("/bin/sh"),
            vec!["-c".into(), "exit 3".into()],
            move |exit| {
                let _ = tx.send(exit.unwrap());
            },
        )
        .unwrap();

        let exit = rx.await.unwrap();
        assert_eq!(exit.code, Some(3));
        assert!(spawned.handle.has_exited());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_terminate_graceful() {
        let spawned = spawn(
            Path::new("/bin/sh"),
            vec!["-c".into(), "sleep 30".into()],
            |_| {},
        )
        .unwrap();

        let outcome = spawned
            .handle
            .terminate(Duration::from_secs(3), Duration::from_secs(2))
            .await;
        assert_eq!(outcome, Termination::Graceful);
        assert!(spawned.handle.has_exited());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_undeliverable_stop_goes_straight_to_kill() {
        let (kill_tx, mut kill_rx) = mpsc::channel::<()>(1);
        let (exit_tx, exit_rx) = watch::channel(None);
        tokio::spawn(async move {
            if kill_rx.recv().await.is_some() {
                let _ = exit_tx.send(Some(ProcessExit { code: None }));
            }
        });
        // no such pid, so the stop signal cannot be delivered
        let handle = ProcessHandle {
            pid: Some(i32::MAX as u32),
            kill_tx,
            exit_rx,
        };

        let outcome = tokio::time::timeout(
            Duration::from_secs(2),
            handle.terminate(Duration::from_secs(30), Duration::from_secs(1)),
        )
        .await
        .expect("should not wait for a graceful exit");
        assert_eq!(outcome, Termination::Forced);
    }

    #[test]
    fn test_termination_display() {
        assert_eq!(Termination::Graceful.to_string(), "terminated gracefully");
        assert_eq!(Termination::Forced.to_string(), "force-killed");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_terminate_forced_when_term_ignored() {
        let spawned = spawn(
            Path::new("/bin/sh"),
            vec!["-c".into(), "trap '' TERM; while true; do sleep 0.1; done".into()],
            |_| {},
        )
        .unwrap();
        // give the shell time to install the trap
        tokio::time::sleep(Duration::from_millis(200)).await;

        let outcome = spawned
            .handle
            .terminate(Duration::from_millis(300), Duration::from_secs(2))
            .await;
        assert_eq!(outcome, Termination::Forced);
    }
}
