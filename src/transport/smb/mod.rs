//! SMB named-pipe transport
//!
//! Reaches an interpreter listening on a Windows named pipe. Two strategies,
//! chosen by platform alone:
//!
//! - [`PipeStrategy::Native`]: the Win32 networking and file API; only
//!   compiled and used on Windows.
//! - [`PipeStrategy::Portable`]: the built-in SMB2 client, used everywhere
//!   else and as the fallback when Windows networking is unavailable.
//!
//! A named pipe is one duplex channel, so `stderr` is always a stub and
//! there is no file transfer.

mod client;
#[cfg(windows)]
mod native;
mod ntlm;

pub use client::Smb2Opener;
#[cfg(windows)]
pub use native::Win32PipeOpener;
pub use ntlm::{nt_hash, ntowf_v2, NtlmChallenge, NtlmCredentials, Ntlmv2Response};

use crate::address::Address;
use crate::config::{local_username, ConnectOptions};
use crate::connection::{Connection, InputStream, OutputStream};
use crate::deadline::Deadline;
use crate::error::{Result, TetherError};
use crate::registry::Transport;
use std::sync::Arc;

/// SMB over direct TCP
pub const DEFAULT_SMB_PORT: u16 = 445;

/// Pipe opened when `pipe_name` is not set
pub const DEFAULT_PIPE_NAME: &str = "tether";

/// How the pipe is reached
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipeStrategy {
    /// Win32 API
    Native,
    /// Built-in SMB2 client
    Portable,
}

impl PipeStrategy {
    /// Native on Windows, portable elsewhere
    pub fn detect() -> Self {
        if cfg!(windows) {
            Self::Native
        } else {
            Self::Portable
        }
    }
}

/// Resolved parameters for one pipe connection
#[derive(Clone)]
pub struct PipeTarget {
    /// Remote host
    pub host: String,
    /// SMB port (direct TCP)
    pub port: u16,
    /// Account name
    pub username: String,
    /// Account password
    pub password: Option<String>,
    /// Account domain; empty for the host's default
    pub domain: String,
    /// Pipe name without the `\\host\pipe\` prefix
    pub pipe_name: String,
}

impl PipeTarget {
    /// Resolve address and options into connection parameters
    pub fn resolve(address: &Address, options: &ConnectOptions) -> Result<Self> {
        let host = address.target();
        if host.is_empty() {
            return Err(TetherError::address(address.raw(), "smb address needs a host"));
        }

        let username = options
            .username
            .clone()
            .or_else(local_username)
            .ok_or_else(|| TetherError::config("no username given and local user unknown"))?;

        let pipe_name = options
            .pipe_name
            .clone()
            .unwrap_or_else(|| DEFAULT_PIPE_NAME.to_string());
        if pipe_name.trim_start_matches('\\').is_empty() {
            return Err(TetherError::config("pipe name is empty"));
        }

        Ok(Self {
            host: host.to_string(),
            port: address.port_or(options.port, DEFAULT_SMB_PORT),
            username,
            password: options.password.clone(),
            domain: options.domain.clone().unwrap_or_default(),
            pipe_name,
        })
    }
}

impl std::fmt::Debug for PipeTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipeTarget")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("domain", &self.domain)
            .field("pipe_name", &self.pipe_name)
            .finish()
    }
}

/// Both ends of an opened pipe plus its release action
pub struct PipeChannel {
    /// Bytes to the interpreter
    pub writer: InputStream,
    /// Bytes from the interpreter
    pub reader: OutputStream,
    /// Releases the pipe and any session behind it
    pub teardown: Box<dyn FnOnce() -> Result<()> + Send>,
}

/// Opens a named pipe on a remote host
pub trait PipeOpener: Send + Sync {
    /// Authenticate and open `target.pipe_name`
    fn open(&self, target: &PipeTarget, deadline: &Deadline) -> Result<PipeChannel>;
}

fn open_with(
    strategy: PipeStrategy,
    target: &PipeTarget,
    deadline: &Deadline,
) -> Result<PipeChannel> {
    match strategy {
        #[cfg(windows)]
        PipeStrategy::Native => Win32PipeOpener.open(target, deadline),
        #[cfg(not(windows))]
        PipeStrategy::Native => Err(TetherError::unavailable(
            "smb",
            "the native named-pipe API exists only on Windows",
        )),
        PipeStrategy::Portable => Smb2Opener.open(target, deadline),
    }
}

/// Transport for `smb:` addresses
#[derive(Clone, Default)]
pub struct PipeTransport {
    opener: Option<Arc<dyn PipeOpener>>,
}

impl PipeTransport {
    /// Create the transport with platform strategy selection
    pub fn new() -> Self {
        Self::default()
    }

    /// Create the transport with a fixed opener
    pub fn with_opener(opener: Arc<dyn PipeOpener>) -> Self {
        Self {
            opener: Some(opener),
        }
    }

    fn open(&self, target: &PipeTarget, deadline: &Deadline) -> Result<PipeChannel> {
        if let Some(opener) = &self.opener {
            return opener.open(target, deadline);
        }

        let strategy = PipeStrategy::detect();
        tracing::debug!("Opening pipe on {} with the {:?} strategy", target.host, strategy);
        match open_with(strategy, target, deadline) {
            Err(TetherError::TransportUnavailable { message, .. })
                if strategy == PipeStrategy::Native =>
            {
                tracing::info!("Native named pipes unavailable ({}); using SMB2", message);
                open_with(PipeStrategy::Portable, target, deadline)
            }
            other => other,
        }
    }
}

impl Transport for PipeTransport {
    fn connect(&self, address: &Address, options: &ConnectOptions) -> Result<Connection> {
        let target = PipeTarget::resolve(address, options)?;
        if options.command.is_some() {
            tracing::debug!("Ignoring command option; the pipe server owns its interpreter");
        }

        let channel = self.open(&target, &options.deadline())?;
        Ok(
            Connection::without_stderr(address.clone(), channel.writer, channel.reader)
                .on_close(channel.teardown),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{self, Cursor, Read, Write};
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Opener that serves canned output and records what it was given
    #[derive(Default)]
    struct FakeOpener {
        opened: Mutex<Vec<PipeTarget>>,
        teardowns: Arc<AtomicUsize>,
    }

    impl PipeOpener for FakeOpener {
        fn open(&self, target: &PipeTarget, _deadline: &Deadline) -> Result<PipeChannel> {
            self.opened.lock().unwrap().push(target.clone());
            let teardowns = Arc::clone(&self.teardowns);
            Ok(PipeChannel {
                writer: Box::new(io::sink()),
                reader: Box::new(Cursor::new(b"from pipe".to_vec())),
                teardown: Box::new(move || {
                    teardowns.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }),
            })
        }
    }

    fn connect_fake(options: &ConnectOptions) -> (Connection, Arc<FakeOpener>) {
        let opener = Arc::new(FakeOpener::default());
        let transport = PipeTransport::with_opener(opener.clone());
        let addr = Address::parse("smb:winhost").unwrap();
        (transport.connect(&addr, options).unwrap(), opener)
    }

    #[test]
    fn test_detect() {
        if cfg!(windows) {
            assert_eq!(PipeStrategy::detect(), PipeStrategy::Native);
        } else {
            assert_eq!(PipeStrategy::detect(), PipeStrategy::Portable);
        }
    }

    #[test]
    fn test_resolve_defaults() {
        let addr = Address::parse("smb:winhost").unwrap();
        let options = ConnectOptions::new().with_username("admin").with_password("pw");
        let target = PipeTarget::resolve(&addr, &options).unwrap();

        assert_eq!(target.host, "winhost");
        assert_eq!(target.port, DEFAULT_SMB_PORT);
        assert_eq!(target.domain, "");
        assert_eq!(target.pipe_name, DEFAULT_PIPE_NAME);
        assert!(!format!("{:?}", target).contains("pw\""));
    }

    #[test]
    fn test_resolve_overrides() {
        let addr = Address::parse("smb:winhost:1445").unwrap();
        let options = ConnectOptions::new()
            .with_username("admin")
            .with_domain("CORP")
            .with_pipe_name("interp");
        let target = PipeTarget::resolve(&addr, &options).unwrap();
        assert_eq!(target.port, 1445);
        assert_eq!(target.domain, "CORP");
        assert_eq!(target.pipe_name, "interp");

        let empty = ConnectOptions::new().with_username("admin").with_pipe_name("\\");
        assert!(matches!(
            PipeTarget::resolve(&addr, &empty),
            Err(TetherError::ConfigError(_))
        ));
    }

    #[test]
    fn test_missing_host() {
        let addr = Address::parse("smb:").unwrap();
        let result = PipeTransport::new().connect(&addr, &ConnectOptions::new().with_username("u"));
        assert!(matches!(result, Err(TetherError::AddressFormat { .. })));
    }

    #[test]
    fn test_stderr_is_stub() {
        let (mut conn, _) = connect_fake(&ConnectOptions::new().with_username("u"));
        let mut buf = [0u8; 8];
        assert_eq!(conn.stderr().read(&mut buf).unwrap(), 0);
        assert_eq!(conn.stderr().read(&mut buf).unwrap(), 0);

        let mut out = String::new();
        conn.stdout().read_to_string(&mut out).unwrap();
        assert_eq!(out, "from pipe");
        conn.stdin().write_all(b"ignored").unwrap();
    }

    #[test]
    fn test_file_transfer_unsupported() {
        let (conn, _) = connect_fake(&ConnectOptions::new().with_username("u"));
        assert!(!conn.capabilities().file_transfer);
        assert!(matches!(
            conn.getfile("C:\\remote.txt", Path::new("local.txt")),
            Err(TetherError::UnsupportedOperation(_))
        ));
        assert!(matches!(
            conn.putfile(Path::new("local.txt"), "C:\\remote.txt"),
            Err(TetherError::UnsupportedOperation(_))
        ));
    }

    #[test]
    fn test_close_releases_once() {
        let options = ConnectOptions::new()
            .with_username("u")
            .with_command(["ignored"]);
        let (mut conn, opener) = connect_fake(&options);
        conn.close().unwrap();
        conn.close().unwrap();
        drop(conn);
        assert_eq!(opener.teardowns.load(Ordering::SeqCst), 1);
        assert_eq!(opener.opened.lock().unwrap()[0].username, "u");
    }

    #[test]
    #[cfg(not(windows))]
    fn test_portable_refused() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let addr = Address::parse("smb:127.0.0.1").unwrap();
        let options = ConnectOptions::new().with_username("u").with_port(port);
        let result = PipeTransport::new().connect(&addr, &options);
        assert!(matches!(result, Err(TetherError::ConnectionError { .. })));
    }
}
