//! External process launching
//!
//! A [`ProcessLauncher`] spawns one executable and hands back a
//! [`ProcessHandle`]: a one-shot future resolving to the exit code, and a
//! kill switch. The launcher owns the OS process; nobody else waits on it.

use crate::error::LaunchError;
use std::fmt::Debug;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::sync::oneshot;
use tracing::warn;

/// Exit code reported when no code is available, e.g. after a signal
pub const UNKNOWN_EXIT_CODE: i32 = -1;

/// What to run
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ProcessRequest {
    /// Executable name or path
    pub program: String,
    /// Arguments
    pub args: Vec<String>,
    /// Working directory; `None` runs in the current directory
    pub working_dir: Option<PathBuf>,
    /// Command prefix reaching a remote peer, e.g. `["ssh", "node1"]`
    pub prefix: Vec<String>,
}

impl ProcessRequest {
    /// Create a request without arguments
    #[must_use]
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            ..Self::default()
        }
    }

    /// Set the arguments
    #[inline]
    #[must_use]
    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }

    /// Set the working directory
    #[inline]
    #[must_use]
    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    /// Set the remote prefix
    #[inline]
    #[must_use]
    pub fn with_prefix(mut self, prefix: Vec<String>) -> Self {
        self.prefix = prefix;
        self
    }

    /// Program and arguments actually executed, prefix included
    #[must_use]
    pub fn argv(&self) -> (String, Vec<String>) {
        match self.prefix.split_first() {
            Some((head, rest)) => {
                let mut args = rest.to_vec();
                args.push(self.program.clone());
                args.extend(self.args.iter().cloned());
                (head.clone(), args)
            }
            None => (self.program.clone(), self.args.clone()),
        }
    }

    /// Printable command line
    #[must_use]
    pub fn command_line(&self) -> String {
        let (program, args) = self.argv();
        std::iter::once(program)
            .chain(args)
            .map(|arg| {
                if arg.contains(char::is_whitespace) {
                    format!("\"{arg}\"")
                } else {
                    arg
                }
            })
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Switch terminating a live process
#[derive(Debug)]
pub struct KillSwitch(Option<oneshot::Sender<()>>);

impl KillSwitch {
    /// Wrap the sending half of a kill channel
    #[must_use]
    pub fn new(sender: oneshot::Sender<()>) -> Self {
        Self(Some(sender))
    }

    /// Request termination
    ///
    /// # Returns
    /// `false` if already used or the process is gone.
    pub fn kill(&mut self) -> bool {
        self.0.take().is_some_and(|tx| tx.send(()).is_ok())
    }
}

/// A live process
#[derive(Debug)]
pub struct ProcessHandle {
    pid: Option<u32>,
    exit: oneshot::Receiver<i32>,
    kill: KillSwitch,
}

impl ProcessHandle {
    /// Assemble a handle from its channels
    #[must_use]
    pub fn new(pid: Option<u32>, exit: oneshot::Receiver<i32>, kill: oneshot::Sender<()>) -> Self {
        Self {
            pid,
            exit,
            kill: KillSwitch::new(kill),
        }
    }

    /// OS process id, if known
    #[inline]
    #[must_use]
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Split into the exit future and the kill switch
    #[must_use]
    pub fn into_parts(self) -> (oneshot::Receiver<i32>, KillSwitch) {
        (self.exit, self.kill)
    }

    /// Wait for the exit code
    pub async fn wait(self) -> i32 {
        self.exit.await.unwrap_or(UNKNOWN_EXIT_CODE)
    }
}

/// Spawns external processes
pub trait ProcessLauncher: Send + Sync + Debug {
    /// Start a process
    ///
    /// Must be called from within a tokio runtime.
    ///
    /// # Errors
    /// Returns [`LaunchError`] if the process cannot be spawned; the error
    /// carries the attempted command line.
    fn launch(&self, request: &ProcessRequest) -> Result<ProcessHandle, LaunchError>;
}

/// [`ProcessLauncher`] backed by `tokio::process`
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioLauncher;

impl ProcessLauncher for TokioLauncher {
    fn launch(&self, request: &ProcessRequest) -> Result<ProcessHandle, LaunchError> {
        let (program, args) = request.argv();
        let mut command = tokio::process::Command::new(&program);
        command
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);
        if let Some(dir) = &request.working_dir {
            command.current_dir(dir);
        }

        let mut child = command
            .spawn()
            .map_err(|e| LaunchError::spawn(request.command_line(), e))?;
        let pid = child.id();
        let (exit_tx, exit_rx) = oneshot::channel();
        let (kill_tx, kill_rx) = oneshot::channel::<()>();

        tokio::spawn(async move {
            let status = tokio::select! {
                status = child.wait() => status,
                Ok(()) = kill_rx => {
                    if let Err(e) = child.kill().await {
                        warn!(pid, error = %e, "Could not kill process");
                    }
                    child.wait().await
                }
            };
            let code = match status {
                Ok(status) => status.code().unwrap_or(UNKNOWN_EXIT_CODE),
                Err(e) => {
                    warn!(pid, error = %e, "Could not wait for process");
                    UNKNOWN_EXIT_CODE
                }
            };
            let _ = exit_tx.send(code);
        });

        Ok(ProcessHandle::new(pid, exit_rx, kill_tx))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefix_wraps_program() {
        let request = ProcessRequest::new("fedem_gage")
            .with_args(vec!["-fco".into(), "fedem_gage.fco".into()])
            .with_prefix(vec!["ssh".into(), "node1".into()]);
        let (program, args) = request.argv();
        assert_eq!(program, "ssh");
        assert_eq!(args, vec!["node1", "fedem_gage", "-fco", "fedem_gage.fco"]);
        assert_eq!(request.command_line(), "ssh node1 fedem_gage -fco fedem_gage.fco");
    }

    #[test]
    fn command_line_quotes_spaces() {
        let request = ProcessRequest::new("ncl").with_args(vec![
            "@fedem_fatfe".into(),
            "/my models/part_fpp_001.fpp".into(),
        ]);
        assert_eq!(
            request.command_line(),
            "ncl @fedem_fatfe \"/my models/part_fpp_001.fpp\""
        );
    }

    #[test]
    fn kill_switch_fires_once() {
        let (tx, mut rx) = oneshot::channel();
        let mut switch = KillSwitch::new(tx);
        assert!(switch.kill());
        assert!(!switch.kill());
        assert_eq!(rx.try_recv(), Ok(()));
    }

    #[tokio::test]
    async fn missing_executable_is_a_spawn_error() {
        let request = ProcessRequest::new("rcy-definitely-not-installed");
        let err = TokioLauncher.launch(&request).unwrap_err();
        assert!(matches!(err, LaunchError::Spawn { ref command_line, .. } if command_line == "rcy-definitely-not-installed"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn exit_code_is_reported() {
        let request = ProcessRequest::new("sh").with_args(vec!["-c".into(), "exit 3".into()]);
        let handle = TokioLauncher.launch(&request).unwrap();
        assert_eq!(handle.wait().await, 3);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn killed_process_resolves() {
        let request = ProcessRequest::new("sleep").with_args(vec!["30".into()]);
        let handle = TokioLauncher.launch(&request).unwrap();
        let (exit, mut kill) = handle.into_parts();
        assert!(kill.kill());
        let code = exit.await.unwrap();
        assert_eq!(code, UNKNOWN_EXIT_CODE);
    }
}
