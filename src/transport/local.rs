//! Local transport
//!
//! Spawns an interpreter on this host with stdin, stdout and stderr
//! connected through anonymous pipes.
//!
//! Closing the connection closes the pipes, which the child sees as end of
//! input. The child is never killed; it is reaped in the background once it
//! exits so no zombie is left behind.

use crate::address::Address;
use crate::config::ConnectOptions;
use crate::connection::{Connection, FileTransfer};
use crate::error::{Result, TetherError};
use crate::registry::Transport;
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;
use std::process::{Child, Command, Stdio};

/// Buffer size for local copies (1MB)
const COPY_BUFFER_SIZE: usize = 1024 * 1024;

/// Transport for `local:` addresses
#[derive(Debug, Clone, Default)]
pub struct LocalTransport;

impl LocalTransport {
    /// Create the transport
    pub fn new() -> Self {
        Self
    }

    /// Command used when none is given: the running executable itself
    pub fn default_command() -> Result<Vec<String>> {
        let exe = std::env::current_exe()
            .map_err(|e| TetherError::io("locating current executable", e))?;
        Ok(vec![exe.to_string_lossy().into_owned()])
    }
}

impl Transport for LocalTransport {
    fn connect(&self, address: &Address, options: &ConnectOptions) -> Result<Connection> {
        let command = match &options.command {
            Some(command) => command.clone(),
            None => Self::default_command()?,
        };
        let (program, args) = command
            .split_first()
            .ok_or_else(|| TetherError::config("local command is empty"))?;

        options.deadline().check("localhost")?;

        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| {
                TetherError::unavailable("local", format!("failed to start '{}': {}", program, e))
            })?;

        tracing::debug!("Spawned local interpreter '{}' (pid {})", program, child.id());

        let pipes = (child.stdin.take(), child.stdout.take(), child.stderr.take());
        let (stdin, stdout, stderr) = match pipes {
            (Some(stdin), Some(stdout), Some(stderr)) => (stdin, stdout, stderr),
            _ => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(TetherError::unavailable("local", "child process pipes unavailable"));
            }
        };

        Ok(Connection::new(address.clone(), Box::new(stdin), Box::new(stdout), Box::new(stderr))
            .with_file_transfer(LocalCopy)
            .on_close(move || reap(child)))
    }
}

/// Collect the child's exit status without forcing it to exit
fn reap(mut child: Child) -> Result<()> {
    match child.try_wait() {
        Ok(Some(status)) => {
            tracing::debug!("Local interpreter {} exited: {}", child.id(), status);
            Ok(())
        }
        Ok(None) => {
            let pid = child.id();
            std::thread::Builder::new()
                .name(format!("tether-reap-{}", pid))
                .spawn(move || match child.wait() {
                    Ok(status) => tracing::debug!("Local interpreter {} exited: {}", pid, status),
                    Err(e) => {
                        tracing::debug!("Waiting for local interpreter {} failed: {}", pid, e)
                    }
                })
                .map(|_| ())
                .map_err(|e| TetherError::io("spawning reaper thread", e))
        }
        Err(e) => Err(TetherError::io("checking local interpreter status", e)),
    }
}

/// Same-filesystem file transfer
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalCopy;

impl LocalCopy {
    fn copy(source: &Path, dest: &Path) -> Result<u64> {
        let source_file = File::open(source).map_err(|e| TetherError::transfer_io(source, e))?;
        let dest_file = File::create(dest).map_err(|e| TetherError::transfer_io(dest, e))?;

        let mut reader = BufReader::with_capacity(COPY_BUFFER_SIZE, source_file);
        let mut writer = BufWriter::with_capacity(COPY_BUFFER_SIZE, dest_file);

        let bytes = std::io::copy(&mut reader, &mut writer)
            .map_err(|e| TetherError::transfer_io(dest, e))?;
        writer.flush().map_err(|e| TetherError::transfer_io(dest, e))?;

        Ok(bytes)
    }
}

impl FileTransfer for LocalCopy {
    fn getfile(&self, remote_path: &str, local_path: &Path) -> Result<u64> {
        Self::copy(Path::new(remote_path), local_path)
    }

    fn putfile(&self, local_path: &Path, remote_path: &str) -> Result<u64> {
        Self::copy(local_path, Path::new(remote_path))
    }
}
