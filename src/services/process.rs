use std::fmt;
use std::io::{self, BufRead, BufReader, Read, Write};
use std::os::unix::process::{CommandExt, ExitStatusExt};
use std::path::Path;
use std::process::{ChildStdin, Command, ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use tokio::sync::watch;
use tracing::{error, info, warn};

/// How a managed process terminated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessExit {
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

impl ProcessExit {
    /// Exit codes are read as signed bytes: 0 is success and anything
    /// negative (128..=255, what shells report for a signal) was caused by
    /// the operating system rather than the server itself.
    pub fn is_clean(&self) -> bool {
        match (self.code, self.signal) {
            (Some(code), _) => (code as i8) <= 0,
            (None, Some(_)) => true,
            (None, None) => false,
        }
    }
}

impl From<ExitStatus> for ProcessExit {
    fn from(status: ExitStatus) -> Self {
        Self {
            code: status.code(),
            signal: status.signal(),
        }
    }
}

impl fmt::Display for ProcessExit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.code, self.signal) {
            (Some(code), _) => write!(f, "code {:02X}", code as u8),
            (None, Some(signal)) => write!(f, "signal {}", signal),
            (None, None) => f.write_str("unknown status"),
        }
    }
}

/// Owner of one spawned server process.
///
/// The child runs as the leader of its own process group so the whole tree
/// can be signalled at once. A reaper thread waits on it, hands the exit to
/// `on_exit` and only then publishes it to waiters.
pub struct ProcessHandle {
    pid: u32,
    stdin: Option<ChildStdin>,
    exited: watch::Receiver<Option<ProcessExit>>,
    // set as soon as the child is reaped, before `on_exit` runs
    reaped: Arc<AtomicBool>,
    started_at: DateTime<Utc>,
}

impl ProcessHandle {
    pub fn spawn<F>(
        name: &str,
        program: &str,
        args: &[String],
        working_dir: &Path,
        on_exit: F,
    ) -> io::Result<Self>
    where
        F: FnOnce(ProcessExit) + Send + 'static,
    {
        let mut child = Command::new(program)
            .args(args)
            .current_dir(working_dir)
            .process_group(0)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;

        let pid = child.id();
        info!(server = %name, "spawned '{}' with PID {}", program, pid);

        if let Some(stdout) = child.stdout.take() {
            forward_output(name, "stdout", stdout);
        }
        if let Some(stderr) = child.stderr.take() {
            forward_output(name, "stderr", stderr);
        }

        let stdin = child.stdin.take();
        let (exit_tx, exited) = watch::channel(None);
        let reaped = Arc::new(AtomicBool::new(false));
        let reaper_flag = reaped.clone();
        let server = name.to_string();
        std::thread::spawn(move || {
            let status = child.wait();
            reaper_flag.store(true, Ordering::SeqCst);
            let exit = match status {
                Ok(status) => ProcessExit::from(status),
                Err(e) => {
                    error!(server = %server, "failed to wait on server process: {}", e);
                    ProcessExit { code: None, signal: None }
                }
            };
            on_exit(exit);
            exit_tx.send_replace(Some(exit));
        });

        Ok(Self {
            pid,
            stdin,
            exited,
            reaped,
            started_at: Utc::now(),
        })
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn has_exited(&self) -> bool {
        self.exited.borrow().is_some()
    }

    /// A receiver that resolves once the process has been reaped.
    pub fn exit_receiver(&self) -> watch::Receiver<Option<ProcessExit>> {
        self.exited.clone()
    }

    pub fn send_line(&mut self, line: &str) -> io::Result<()> {
        let stdin = self
            .stdin
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::BrokenPipe, "stdin is closed"))?;
        writeln!(stdin, "{}", line)?;
        stdin.flush()
    }

    /// SIGKILLs the process and every descendant in its group.
    pub fn kill_tree(&self) -> nix::Result<()> {
        killpg(Pid::from_raw(self.pid as i32), Signal::SIGKILL)
    }
}

impl Drop for ProcessHandle {
    fn drop(&mut self) {
        if !self.reaped.load(Ordering::SeqCst) {
            if let Err(e) = self.kill_tree() {
                warn!("failed to kill process group {}: {}", self.pid, e);
            }
        }
    }
}

pub async fn wait_for_exit(exited: &mut watch::Receiver<Option<ProcessExit>>) -> Option<ProcessExit> {
    exited.wait_for(Option::is_some).await.ok().and_then(|exit| *exit)
}

fn forward_output<R: Read + Send + 'static>(name: &str, stream: &'static str, reader: R) {
    let server = name.to_string();
    std::thread::spawn(move || {
        let reader = BufReader::new(reader);
        for line in reader.lines().map_while(Result::ok) {
            info!(target: "server_output", server = %server, stream, "{}", line);
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::time::Duration;

    fn exit(code: Option<i32>, signal: Option<i32>) -> ProcessExit {
        ProcessExit { code, signal }
    }

    #[test]
    fn classifies_exit_codes() {
        assert!(exit(Some(0), None).is_clean());
        assert!(exit(Some(130), None).is_clean());
        assert!(exit(Some(143), None).is_clean());
        assert!(exit(None, Some(9)).is_clean());

        assert!(!exit(Some(1), None).is_clean());
        assert!(!exit(Some(127), None).is_clean());
        assert!(!exit(None, None).is_clean());
    }

    #[test]
    fn formats_exit() {
        assert_eq!(exit(Some(3), None).to_string(), "code 03");
        assert_eq!(exit(None, Some(9)).to_string(), "signal 9");
    }

    #[tokio::test]
    async fn reports_exit_after_callback() {
        let dir = tempfile::TempDir::new().unwrap();
        let (tx, rx) = mpsc::channel();
        let args = vec!["-c".to_string(), "read line; exit $line".to_string()];

        let mut handle = ProcessHandle::spawn("test", "bash", &args, dir.path(), move |exit| {
            tx.send(exit).unwrap();
        })
        .unwrap();
        assert!(!handle.has_exited());

        handle.send_line("4").unwrap();
        let mut exited = handle.exit_receiver();
        let waited = tokio::time::timeout(Duration::from_secs(10), wait_for_exit(&mut exited))
            .await
            .unwrap();

        assert_eq!(waited, Some(exit(Some(4), None)));
        assert_eq!(rx.try_recv().unwrap(), exit(Some(4), None));
        assert!(handle.has_exited());
    }

    #[tokio::test]
    async fn kill_tree_terminates_group() {
        let dir = tempfile::TempDir::new().unwrap();
        let args = vec!["-c".to_string(), "sleep 30 & sleep 30; wait".to_string()];
        let handle = ProcessHandle::spawn("test", "bash", &args, dir.path(), |_| {}).unwrap();

        handle.kill_tree().unwrap();
        let mut exited = handle.exit_receiver();
        let exit = tokio::time::timeout(Duration::from_secs(10), wait_for_exit(&mut exited))
            .await
            .unwrap()
            .unwrap();

        assert_eq!(exit.signal, Some(Signal::SIGKILL as i32));
        assert!(exit.is_clean());
    }
}
