//! Native strategy: the platform `ssh` client as a subprocess
//!
//! Login happens up front in a separate `ssh` run whose exit status decides
//! whether the connection succeeded, so refused connections, unknown host
//! keys and rejected credentials surface as errors from `connect`. On unix
//! that run leaves a ControlMaster behind on a private control socket; the
//! interpreter session and `scp` transfers then reuse the authenticated
//! connection instead of logging in again.

use super::SshTarget;
use crate::address::Address;
use crate::connection::{Connection, FileTransfer};
use crate::deadline::Deadline;
use crate::error::{Result, TetherError, TransferFailure};
use std::fs::File;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};

/// How long the client gets to exit on its own after its stdin closes
const EXIT_GRACE: Duration = Duration::from_secs(2);

/// How long the master gets to create its socket when no deadline is set
const SOCKET_WAIT: Duration = Duration::from_secs(5);

const POLL_INTERVAL: Duration = Duration::from_millis(20);

static SCRATCH_COUNTER: AtomicUsize = AtomicUsize::new(0);

/// Options shared by the login run and the interpreter session
fn common_args(target: &SshTarget, deadline: &Deadline) -> Vec<String> {
    let mut args = vec![
        "-T".to_string(),
        "-o".to_string(),
        "BatchMode=yes".to_string(),
        "-p".to_string(),
        target.port.to_string(),
        "-l".to_string(),
        target.username.clone(),
    ];

    if let Some(key) = &target.key_path {
        args.push("-i".to_string());
        args.push(key.display().to_string());
    }

    if let Some(left) = deadline.remaining() {
        let secs = left.as_secs() + u64::from(left.subsec_nanos() > 0);
        args.push("-o".to_string());
        args.push(format!("ConnectTimeout={}", secs.max(1)));
    }

    args
}

/// Arguments for the login run, excluding the program name.
///
/// With a control path this starts a background ControlMaster that exits
/// its foreground process once authenticated. Without one it runs `exit`
/// on the remote side.
pub fn master_args(
    target: &SshTarget,
    control_path: Option<&Path>,
    deadline: &Deadline,
) -> Vec<String> {
    let mut args = common_args(target, deadline);

    if let Some(path) = control_path {
        args.extend(["-M", "-N", "-f", "-o", "ControlMaster=yes", "-o"].map(String::from));
        args.push(format!("ControlPath={}", path.display()));
    }

    args.push("--".to_string());
    args.push(target.host.clone());
    if control_path.is_none() {
        args.push("exit".to_string());
    }
    args
}

/// Arguments for the interpreter session, excluding the program name
pub fn session_args(
    target: &SshTarget,
    control_path: Option<&Path>,
    deadline: &Deadline,
) -> Vec<String> {
    let mut args = common_args(target, deadline);

    if let Some(path) = control_path {
        args.extend(["-o", "ControlMaster=no", "-o"].map(String::from));
        args.push(format!("ControlPath={}", path.display()));
    }

    args.push("--".to_string());
    args.push(target.host.clone());
    args.push(target.remote_command());
    args
}

/// Per-connection files in the temp directory
#[derive(Debug, Clone)]
struct Scratch {
    /// Control socket, unix only
    control: Option<PathBuf>,
    /// Diagnostics of the login run
    log: PathBuf,
}

impl Scratch {
    fn new() -> Self {
        let n = SCRATCH_COUNTER.fetch_add(1, Ordering::Relaxed);
        let base = std::env::temp_dir().join(format!("tether-{}-{}", std::process::id(), n));
        Self {
            control: cfg!(unix).then(|| base.clone()),
            log: base.with_extension("log"),
        }
    }
}

/// Turn the diagnostics of a failed login run into an error
fn classify_ssh_failure(target: &SshTarget, diagnostics: &str) -> TetherError {
    let lower = diagnostics.to_lowercase();
    if lower.contains("host key verification failed")
        || lower.contains("remote host identification has changed")
    {
        TetherError::host_key(&target.host, diagnostics)
    } else if lower.contains("permission denied")
        || lower.contains("too many authentication failures")
    {
        TetherError::auth(&target.username, &target.host, diagnostics)
    } else {
        TetherError::connection(&target.host, diagnostics)
    }
}

fn spawn_failed(err: std::io::Error) -> TetherError {
    TetherError::unavailable("ssh", format!("failed to start ssh client: {}", err))
}

/// Wait for `child` to exit, killing it once the deadline passes
fn wait_within(child: &mut Child, deadline: &Deadline, host: &str) -> Result<ExitStatus> {
    loop {
        match child.try_wait() {
            Ok(Some(status)) => return Ok(status),
            Ok(None) if deadline.expired() => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(deadline.timeout_error(host));
            }
            Ok(None) => thread::sleep(POLL_INTERVAL),
            Err(e) => return Err(TetherError::connection(host, format!("waiting for ssh: {}", e))),
        }
    }
}

/// Wait for the master to create its control socket
fn wait_for_socket(path: &Path, deadline: &Deadline, host: &str) -> Result<()> {
    let started = Instant::now();
    while !path.exists() {
        if deadline.expired() {
            return Err(deadline.timeout_error(host));
        }
        if deadline.remaining().is_none() && started.elapsed() >= SOCKET_WAIT {
            return Err(TetherError::connection(host, "ssh control socket not created in time"));
        }
        thread::sleep(POLL_INTERVAL);
    }
    Ok(())
}

/// Ask the master behind `path` to exit and remove its socket
fn stop_master(target: &SshTarget, path: &Path) {
    let status = Command::new("ssh")
        .arg("-o")
        .arg(format!("ControlPath={}", path.display()))
        .arg("-O")
        .arg("exit")
        .arg("--")
        .arg(&target.host)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status();
    tracing::debug!("Stopped ssh master for {}: {:?}", target.login(), status);
    let _ = std::fs::remove_file(path);
}

/// Connection through the external `ssh` binary
#[derive(Debug)]
pub struct NativeSsh {
    target: SshTarget,
}

impl NativeSsh {
    /// Prepare a connection to `target`
    pub fn new(target: SshTarget) -> Self {
        Self { target }
    }

    /// Log in, then spawn the interpreter session and wrap its pipes
    pub fn connect(self, address: &Address, deadline: &Deadline) -> Result<Connection> {
        deadline.check(&self.target.host)?;

        let scratch = Scratch::new();
        self.login(&scratch, deadline)?;

        if let Some(control) = &scratch.control {
            if let Err(e) = wait_for_socket(control, deadline, &self.target.host) {
                stop_master(&self.target, control);
                return Err(e);
            }
        }

        let args = session_args(&self.target, scratch.control.as_deref(), deadline);
        let spawned = Command::new("ssh")
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn();

        let mut child = match spawned {
            Ok(child) => child,
            Err(e) => {
                self.abandon(&scratch);
                return Err(spawn_failed(e));
            }
        };

        tracing::debug!("Spawned ssh session for {} (pid {})", self.target.login(), child.id());

        let pipes = (child.stdin.take(), child.stdout.take(), child.stderr.take());
        let (stdin, stdout, stderr) = match pipes {
            (Some(stdin), Some(stdout), Some(stderr)) => (stdin, stdout, stderr),
            _ => {
                let _ = child.kill();
                let _ = child.wait();
                self.abandon(&scratch);
                return Err(TetherError::unavailable("ssh", "ssh client pipes unavailable"));
            }
        };

        tracing::info!("Connected to {} with the ssh client", self.target.login());

        let transfer = ScpTransfer {
            target: self.target.clone(),
            control: scratch.control.clone(),
        };
        let target = self.target;
        let control = scratch.control;

        Ok(Connection::new(address.clone(), Box::new(stdin), Box::new(stdout), Box::new(stderr))
            .with_file_transfer(transfer)
            .on_close(move || retire(child, target, control)))
    }

    /// Authenticate in a separate run and judge it by its exit status
    fn login(&self, scratch: &Scratch, deadline: &Deadline) -> Result<()> {
        let host = &self.target.host;
        let log = File::create(&scratch.log)
            .map_err(|e| TetherError::io(format!("creating {}", scratch.log.display()), e))?;

        // A backgrounded master keeps stderr open, so it goes to a file
        // rather than a pipe nobody would see closed
        let args = master_args(&self.target, scratch.control.as_deref(), deadline);
        let spawned = Command::new("ssh")
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::from(log))
            .spawn();

        let mut child = match spawned {
            Ok(child) => child,
            Err(e) => {
                let _ = std::fs::remove_file(&scratch.log);
                return Err(spawn_failed(e));
            }
        };

        let status = wait_within(&mut child, deadline, host);
        let diagnostics = std::fs::read_to_string(&scratch.log).unwrap_or_default();
        let _ = std::fs::remove_file(&scratch.log);
        let status = status?;

        if status.success() {
            tracing::debug!("ssh login to {} succeeded", self.target.login());
            return Ok(());
        }

        let diagnostics = diagnostics.trim();
        let message = if diagnostics.is_empty() {
            format!("ssh exited with {}", status)
        } else {
            diagnostics.to_string()
        };
        Err(classify_ssh_failure(&self.target, &message))
    }

    fn abandon(&self, scratch: &Scratch) {
        if let Some(control) = &scratch.control {
            stop_master(&self.target, control);
        }
    }
}

/// Give the session a grace period to exit, then kill it and stop the
/// master
fn retire(mut child: Child, target: SshTarget, control: Option<PathBuf>) -> Result<()> {
    let pid = child.id();
    thread::Builder::new()
        .name(format!("tether-ssh-{}", pid))
        .spawn(move || {
            let started = Instant::now();
            loop {
                match child.try_wait() {
                    Ok(Some(status)) => {
                        tracing::debug!("ssh client {} exited: {}", pid, status);
                        break;
                    }
                    Ok(None) if started.elapsed() < EXIT_GRACE => {
                        thread::sleep(POLL_INTERVAL);
                    }
                    _ => {
                        tracing::debug!("Killing ssh client {}", pid);
                        let _ = child.kill();
                        let _ = child.wait();
                        break;
                    }
                }
            }
            if let Some(path) = control {
                stop_master(&target, &path);
            }
        })
        .map(|_| ())
        .map_err(|e| TetherError::io("spawning ssh reaper thread", e))
}

/// File transfer with `scp` over the master connection
#[derive(Debug)]
struct ScpTransfer {
    target: SshTarget,
    control: Option<PathBuf>,
}

impl ScpTransfer {
    fn remote_location(&self, remote_path: &str) -> String {
        format!("{}:{}", self.target.login(), remote_path)
    }

    fn run(&self, from: &str, to: &str, remote_path: &str) -> Result<()> {
        let mut cmd = Command::new("scp");
        cmd.arg("-q")
            .arg("-B")
            .arg("-P")
            .arg(self.target.port.to_string());

        if let Some(path) = &self.control {
            cmd.arg("-o")
                .arg("ControlMaster=no")
                .arg("-o")
                .arg(format!("ControlPath={}", path.display()));
        }
        if let Some(key) = &self.target.key_path {
            cmd.arg("-i").arg(key);
        }
        cmd.arg("--").arg(from).arg(to);

        let output = cmd
            .stdin(Stdio::null())
            .output()
            .map_err(|e| {
                TetherError::transfer(
                    remote_path,
                    TransferFailure::Other,
                    format!("failed to run scp: {}", e),
                )
            })?;

        if output.status.success() {
            return Ok(());
        }

        let stderr = String::from_utf8_lossy(&output.stderr);
        let message = stderr.trim();
        Err(TetherError::transfer(remote_path, classify_scp_error(message), message))
    }
}

/// Map scp diagnostics to a failure kind
fn classify_scp_error(message: &str) -> TransferFailure {
    let lower = message.to_lowercase();
    if lower.contains("no such file") || lower.contains("not found") {
        TransferFailure::NotFound
    } else if lower.contains("permission denied") {
        TransferFailure::PermissionDenied
    } else if lower.contains("lost connection")
        || lower.contains("connection closed")
        || lower.contains("connection refused")
        || lower.contains("connection reset")
        || lower.contains("broken pipe")
    {
        TransferFailure::ConnectionLost
    } else {
        TransferFailure::Other
    }
}

impl FileTransfer for ScpTransfer {
    fn getfile(&self, remote_path: &str, local_path: &Path) -> Result<u64> {
        self.run(
            &self.remote_location(remote_path),
            &local_path.to_string_lossy(),
            remote_path,
        )?;
        let bytes = std::fs::metadata(local_path)
            .map_err(|e| TetherError::transfer_io(local_path, e))?
            .len();
        tracing::debug!("Downloaded {} ({} bytes) with scp", remote_path, bytes);
        Ok(bytes)
    }

    fn putfile(&self, local_path: &Path, remote_path: &str) -> Result<u64> {
        let bytes = std::fs::metadata(local_path)
            .map_err(|e| TetherError::transfer_io(local_path, e))?
            .len();
        self.run(
            &local_path.to_string_lossy(),
            &self.remote_location(remote_path),
            remote_path,
        )?;
        tracing::debug!("Uploaded {} ({} bytes) with scp", remote_path, bytes);
        Ok(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target() -> SshTarget {
        SshTarget {
            host: "example.com".into(),
            port: 2222,
            username: "alice".into(),
            password: None,
            key_path: Some(PathBuf::from("/keys/id")),
            command: vec!["python".into(), "-u".into()],
        }
    }

    #[test]
    fn test_master_args() {
        let control = PathBuf::from("/tmp/tether-1-0");
        let args = master_args(&target(), Some(&control), &Deadline::none());

        assert_eq!(&args[..7], ["-T", "-o", "BatchMode=yes", "-p", "2222", "-l", "alice"]);
        assert!(args.windows(2).any(|w| w == ["-i", "/keys/id"]));
        assert!(args.windows(3).any(|w| w == ["-M", "-N", "-f"]));
        assert!(args.windows(2).any(|w| w == ["-o", "ControlMaster=yes"]));
        assert!(args.windows(2).any(|w| w == ["-o", "ControlPath=/tmp/tether-1-0"]));
        assert!(!args.iter().any(|a| a.starts_with("ConnectTimeout")));
        assert_eq!(&args[args.len() - 2..], ["--", "example.com"]);
    }

    #[test]
    fn test_master_args_without_control() {
        let args = master_args(&target(), None, &Deadline::none());
        assert!(!args.iter().any(|a| a == "-M" || a.starts_with("ControlPath")));
        assert_eq!(&args[args.len() - 3..], ["--", "example.com", "exit"]);
    }

    #[test]
    fn test_session_args() {
        let control = PathBuf::from("/tmp/tether-1-0");
        let args = session_args(&target(), Some(&control), &Deadline::none());

        assert!(args.windows(2).any(|w| w == ["-o", "ControlMaster=no"]));
        assert!(args.windows(2).any(|w| w == ["-o", "ControlPath=/tmp/tether-1-0"]));
        assert!(!args.iter().any(|a| a == "-M" || a == "-N"));
        assert_eq!(&args[args.len() - 3..], ["--", "example.com", "python -u"]);
    }

    #[test]
    fn test_host_follows_option_terminator() {
        let mut hostile = target();
        hostile.host = "-oProxyCommand=touch /tmp/x".into();
        for args in [
            master_args(&hostile, None, &Deadline::none()),
            session_args(&hostile, None, &Deadline::none()),
        ] {
            let host_at = args.iter().position(|a| a == &hostile.host).unwrap();
            assert_eq!(args[host_at - 1], "--");
        }
    }

    #[test]
    fn test_master_args_timeout() {
        let deadline = Deadline::after(Some(Duration::from_millis(1500)));
        let args = master_args(&target(), None, &deadline);
        let timeout = args
            .iter()
            .find(|a| a.starts_with("ConnectTimeout="))
            .unwrap();
        let secs: u64 = timeout["ConnectTimeout=".len()..].parse().unwrap();
        assert!((1..=2).contains(&secs));
        assert!(!args.iter().any(|a| a.starts_with("ControlPath")));
    }

    #[test]
    fn test_scratch_paths_unique() {
        let (a, b) = (Scratch::new(), Scratch::new());
        assert_ne!(a.log, b.log);
        if cfg!(unix) {
            assert!(a.control.is_some());
            assert_ne!(a.control, b.control);
        } else {
            assert!(a.control.is_none());
        }
    }

    #[test]
    fn test_classify_ssh_failure() {
        let t = target();
        assert!(matches!(
            classify_ssh_failure(&t, "alice@example.com: Permission denied (publickey,password)."),
            TetherError::AuthenticationError { .. }
        ));
        let unknown = "No ED25519 host key is known for example.com\r\n\
                       Host key verification failed.";
        assert!(matches!(
            classify_ssh_failure(&t, unknown),
            TetherError::HostKeyError { .. }
        ));
        let refused = "ssh: connect to host example.com port 2222: Connection refused";
        assert!(matches!(
            classify_ssh_failure(&t, refused),
            TetherError::ConnectionError { .. }
        ));
        assert!(matches!(
            classify_ssh_failure(&t, "ssh exited with exit status: 255"),
            TetherError::ConnectionError { .. }
        ));
    }

    #[test]
    fn test_wait_within_deadline() {
        if Command::new("sleep").arg("0").status().is_err() {
            return;
        }
        let mut child = Command::new("sleep").arg("5").spawn().unwrap();
        let deadline = Deadline::after(Some(Duration::from_millis(100)));
        let started = Instant::now();
        let result = wait_within(&mut child, &deadline, "example.com");
        assert!(matches!(result, Err(TetherError::Timeout { .. })));
        assert!(started.elapsed() < Duration::from_secs(4));
    }

    #[test]
    fn test_classify_scp_error() {
        assert_eq!(
            classify_scp_error("scp: /srv/missing: No such file or directory"),
            TransferFailure::NotFound
        );
        assert_eq!(
            classify_scp_error("scp: /root/x: Permission denied"),
            TransferFailure::PermissionDenied
        );
        assert_eq!(classify_scp_error("lost connection"), TransferFailure::ConnectionLost);
        assert_eq!(classify_scp_error("something odd"), TransferFailure::Other);
    }

    #[test]
    fn test_remote_location() {
        let transfer = ScpTransfer {
            target: target(),
            control: None,
        };
        assert_eq!(transfer.remote_location("/srv/data"), "alice@example.com:/srv/data");
    }

    #[test]
    fn test_putfile_missing_source() {
        let dir = tempfile::TempDir::new().unwrap();
        let transfer = ScpTransfer {
            target: target(),
            control: None,
        };
        let err = transfer
            .putfile(&dir.path().join("missing"), "/srv/out")
            .unwrap_err();
        assert_eq!(err.transfer_failure(), Some(TransferFailure::NotFound));
    }
}
