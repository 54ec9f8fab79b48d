//! SSH transport
//!
//! Starts an interpreter on a remote host and tunnels its standard streams
//! over SSH. Two interchangeable strategies:
//!
//! - [`SshStrategy::Library`]: the embedded libssh2 client (`ssh2` crate).
//!   Supports password and public-key authentication and enforces the
//!   `missing_host_key_policy` against a [`HostKeyStore`].
//! - [`SshStrategy::Native`]: the platform `ssh` binary as a subprocess.
//!   Host identity checks are left to the client's own configuration
//!   (`StrictHostKeyChecking`, `UserKnownHostsFile`); the policy option is
//!   ignored for this strategy. Login failures are still reported from
//!   `connect` with the same error kinds as the library client.
//!
//! Both expose file transfer: SFTP on the library session, `scp` over the
//! native client's multiplexed connection.

mod known_hosts;
mod library;
mod native;

pub use known_hosts::*;
pub use library::{establish, RemoteSession, SessionOpener, Ssh2Opener};
pub use native::{master_args, session_args, NativeSsh};

use crate::address::Address;
use crate::config::{local_username, ConnectOptions, MissingHostKeyPolicy};
use crate::connection::Connection;
use crate::error::{Result, TetherError};
use crate::registry::Transport;
use crate::transport::{current_program_name, shell_quote};
use std::path::PathBuf;
use std::sync::Arc;

/// Default SSH port
pub const DEFAULT_SSH_PORT: u16 = 22;

/// How the SSH connection is made
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SshStrategy {
    /// Embedded libssh2 client
    Library,
    /// External `ssh` binary
    Native,
}

impl SshStrategy {
    /// Strategy that performed better on this platform
    pub fn platform_default() -> Self {
        if cfg!(windows) {
            Self::Library
        } else {
            Self::Native
        }
    }

    /// Pick a strategy from the `use_native` option.
    ///
    /// Passwords can only be supplied through the library client, so an
    /// unset preference with a password resolves to `Library`, and a forced
    /// `Native` with a password is refused.
    pub fn select(use_native: Option<bool>, has_password: bool) -> Result<Self> {
        match (use_native, has_password) {
            (Some(true), true) => Err(TetherError::unavailable(
                "ssh",
                "the native ssh client cannot authenticate with a supplied password",
            )),
            (Some(true), false) => Ok(Self::Native),
            (Some(false), _) => Ok(Self::Library),
            (None, true) => Ok(Self::Library),
            (None, false) => Ok(Self::platform_default()),
        }
    }

    /// The other strategy
    pub fn alternative(self) -> Self {
        match self {
            Self::Library => Self::Native,
            Self::Native => Self::Library,
        }
    }
}

/// Resolved parameters for one SSH connection
#[derive(Clone)]
pub struct SshTarget {
    /// Remote host
    pub host: String,
    /// Remote port
    pub port: u16,
    /// Login name
    pub username: String,
    /// Password, if password authentication is wanted
    pub password: Option<String>,
    /// Private key file to offer
    pub key_path: Option<PathBuf>,
    /// Interpreter command line
    pub command: Vec<String>,
}

impl SshTarget {
    /// Resolve address and options into connection parameters
    pub fn resolve(address: &Address, options: &ConnectOptions) -> Result<Self> {
        let host = address.target();
        if host.is_empty() {
            return Err(TetherError::address(address.raw(), "ssh address needs a host"));
        }
        if host.starts_with('-') {
            return Err(TetherError::address(address.raw(), "ssh host cannot start with '-'"));
        }

        let username = options
            .username
            .clone()
            .or_else(local_username)
            .ok_or_else(|| TetherError::config("no username given and local user unknown"))?;

        let command = match &options.command {
            Some(command) if !command.is_empty() => command.clone(),
            Some(_) => return Err(TetherError::config("ssh command is empty")),
            None => vec![current_program_name()?],
        };

        Ok(Self {
            host: host.to_string(),
            port: address.port_or(options.port, DEFAULT_SSH_PORT),
            username,
            password: options.password.clone(),
            key_path: options.key_path.clone(),
            command,
        })
    }

    /// Command line as one shell string for the remote side
    pub fn remote_command(&self) -> String {
        self.command
            .iter()
            .map(|word| shell_quote(word))
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// `user@host` for diagnostics and scp
    pub fn login(&self) -> String {
        if self.host.contains(':') {
            format!("{}@[{}]", self.username, self.host)
        } else {
            format!("{}@{}", self.username, self.host)
        }
    }
}

impl std::fmt::Debug for SshTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SshTarget")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("key_path", &self.key_path)
            .field("command", &self.command)
            .finish()
    }
}

/// Transport for `ssh:` addresses
#[derive(Clone, Default)]
pub struct SshTransport {
    /// Overrides the known_hosts file chosen from the options
    store: Option<Arc<dyn HostKeyStore>>,
}

impl SshTransport {
    /// Create the transport; host keys are checked against known_hosts
    pub fn new() -> Self {
        Self::default()
    }

    /// Create the transport with an explicit host key store
    pub fn with_host_key_store(store: Arc<dyn HostKeyStore>) -> Self {
        Self { store: Some(store) }
    }

    fn host_key_store(&self, options: &ConnectOptions) -> Result<Arc<dyn HostKeyStore>> {
        if let Some(store) = &self.store {
            return Ok(Arc::clone(store));
        }
        let path = match &options.known_hosts {
            Some(path) => path.clone(),
            None => KnownHostsFile::default_path()?,
        };
        Ok(Arc::new(KnownHostsFile::new(path)))
    }

    fn connect_with(
        &self,
        strategy: SshStrategy,
        target: &SshTarget,
        address: &Address,
        options: &ConnectOptions,
    ) -> Result<Connection> {
        let deadline = options.deadline();
        match strategy {
            SshStrategy::Library => {
                let store = self.host_key_store(options)?;
                establish(
                    &Ssh2Opener,
                    store.as_ref(),
                    options.missing_host_key_policy,
                    target,
                    address,
                    &deadline,
                )
            }
            SshStrategy::Native => {
                if options.missing_host_key_policy != MissingHostKeyPolicy::Reject {
                    tracing::debug!(
                        "missing_host_key_policy '{}' ignored by the native ssh client",
                        options.missing_host_key_policy.name()
                    );
                }
                NativeSsh::new(target.clone()).connect(address, &deadline)
            }
        }
    }
}

impl Transport for SshTransport {
    fn connect(&self, address: &Address, options: &ConnectOptions) -> Result<Connection> {
        let target = SshTarget::resolve(address, options)?;
        let strategy = SshStrategy::select(options.use_native, target.password.is_some())?;
        tracing::debug!("Connecting to {} with the {:?} ssh strategy", target.login(), strategy);

        match self.connect_with(strategy, &target, address, options) {
            // Only an automatic choice may fall back, and only when the
            // chosen strategy could not even start
            Err(TetherError::TransportUnavailable { message, .. })
                if options.use_native.is_none() =>
            {
                let fallback = strategy.alternative();
                tracing::info!(
                    "{:?} ssh strategy unavailable ({}); trying {:?}",
                    strategy,
                    message,
                    fallback
                );
                self.connect_with(fallback, &target, address, options)
            }
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strategy_selection() {
        assert_eq!(SshStrategy::select(Some(true), false).unwrap(), SshStrategy::Native);
        assert_eq!(SshStrategy::select(Some(false), false).unwrap(), SshStrategy::Library);
        assert_eq!(SshStrategy::select(Some(false), true).unwrap(), SshStrategy::Library);
        assert_eq!(SshStrategy::select(None, true).unwrap(), SshStrategy::Library);
        assert_eq!(SshStrategy::select(None, false).unwrap(), SshStrategy::platform_default());
        assert!(matches!(
            SshStrategy::select(Some(true), true),
            Err(TetherError::TransportUnavailable { .. })
        ));
    }

    #[test]
    fn test_platform_default() {
        if cfg!(windows) {
            assert_eq!(SshStrategy::platform_default(), SshStrategy::Library);
        } else {
            assert_eq!(SshStrategy::platform_default(), SshStrategy::Native);
        }
    }

    #[test]
    fn test_resolve_target() {
        let addr = Address::parse("ssh:example.com:2200").unwrap();
        let options = ConnectOptions::new()
            .with_username("alice")
            .with_command(["python", "-c", "print('hi')"]);
        let target = SshTarget::resolve(&addr, &options).unwrap();

        assert_eq!(target.host, "example.com");
        assert_eq!(target.port, 2200);
        assert_eq!(target.username, "alice");
        assert_eq!(target.login(), "alice@example.com");
        assert_eq!(target.remote_command(), r#"python -c 'print('\''hi'\'')'"#);
    }

    #[test]
    fn test_resolve_defaults() {
        let addr = Address::parse("ssh:example.com").unwrap();
        let options = ConnectOptions::new().with_username("bob");
        let target = SshTarget::resolve(&addr, &options).unwrap();
        assert_eq!(target.port, DEFAULT_SSH_PORT);
        assert_eq!(target.command.len(), 1);
        assert!(!target.command[0].is_empty());

        let override_port = ConnectOptions::new().with_username("bob").with_port(2022);
        assert_eq!(SshTarget::resolve(&addr, &override_port).unwrap().port, 2022);
    }

    #[test]
    fn test_resolve_requires_host() {
        let addr = Address::parse("ssh:").unwrap();
        let options = ConnectOptions::new().with_username("bob");
        assert!(matches!(
            SshTarget::resolve(&addr, &options),
            Err(TetherError::AddressFormat { .. })
        ));
    }

    #[test]
    fn test_resolve_rejects_option_like_host() {
        let addr = Address::parse("ssh:-oProxyCommand=touch /tmp/tether_marker").unwrap();
        let options = ConnectOptions::new().with_username("bob").with_native(true);
        assert!(matches!(
            SshTarget::resolve(&addr, &options),
            Err(TetherError::AddressFormat { .. })
        ));
        assert!(matches!(
            SshTransport::new().connect(&addr, &options),
            Err(TetherError::AddressFormat { .. })
        ));
    }

    #[test]
    fn test_password_not_in_debug() {
        let addr = Address::parse("ssh:h").unwrap();
        let options = ConnectOptions::new().with_username("u").with_password("s3cret");
        let target = SshTarget::resolve(&addr, &options).unwrap();
        assert!(!format!("{:?}", target).contains("s3cret"));
    }

    #[test]
    fn test_forced_native_with_password_refused() {
        let addr = Address::parse("ssh:127.0.0.1").unwrap();
        let options = ConnectOptions::new()
            .with_username("u")
            .with_password("p")
            .with_native(true);
        let result = SshTransport::new().connect(&addr, &options);
        assert!(matches!(result, Err(TetherError::TransportUnavailable { .. })));
    }

    #[test]
    fn test_library_refused_port() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let addr = Address::parse("ssh:127.0.0.1").unwrap();
        let options = ConnectOptions::new()
            .with_username("u")
            .with_port(port)
            .with_native(false);
        let store: Arc<dyn HostKeyStore> = Arc::new(MemoryHostKeyStore::new());
        let result = SshTransport::with_host_key_store(store).connect(&addr, &options);
        assert!(matches!(result, Err(TetherError::ConnectionError { .. })));
    }

    #[test]
    fn test_native_refused_port() {
        let installed = std::process::Command::new("ssh")
            .arg("-V")
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .status()
            .is_ok();
        if !installed {
            return;
        }

        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let addr = Address::parse("ssh:127.0.0.1").unwrap();
        let options = ConnectOptions::new()
            .with_username("u")
            .with_port(port)
            .with_native(true)
            .with_command(["cat"])
            .with_timeout(std::time::Duration::from_secs(10));
        let result = SshTransport::new().connect(&addr, &options);
        assert!(
            matches!(result, Err(TetherError::ConnectionError { .. })),
            "unexpected result: {:?}",
            result.as_ref().map(|_| "connection")
        );
    }

    #[test]
    #[ignore] // Requires an SSH server on localhost and an authorized key
    fn test_ssh_round_trip() {
        use std::io::{Read, Write};

        let addr = Address::parse("ssh:localhost").unwrap();
        let options = ConnectOptions::new()
            .with_native(false)
            .with_host_key_policy(MissingHostKeyPolicy::AutoAdd)
            .with_command(["cat"]);
        let mut conn = SshTransport::new().connect(&addr, &options).unwrap();
        conn.stdin().write_all(b"ping\n").unwrap();
        let mut reply = [0u8; 5];
        conn.stdout().read_exact(&mut reply).unwrap();
        assert_eq!(&reply, b"ping\n");
        conn.close().unwrap();
    }
}
