//! Library strategy: embedded libssh2 client
//!
//! Connection setup runs in blocking mode. Once the interpreter is started
//! the session is switched to non-blocking mode so that a thread blocked
//! reading stdout does not hold the session lock against a writer on
//! another thread; every stream retries on `WouldBlock` after waiting for
//! the socket.

use super::known_hosts::{verify_host_key, HostIdentity, HostKeyStore};
use super::SshTarget;
use crate::address::Address;
use crate::config::MissingHostKeyPolicy;
use crate::connection::{Connection, FileTransfer};
use crate::deadline::Deadline;
use crate::error::{Result, TetherError, TransferFailure};
use crate::transport::connect_tcp;
use ssh2::{BlockDirections, Channel, ErrorCode, Session, Sftp};
use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::net::TcpStream;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

const LIBSSH2_ERROR_SOCKET_SEND: i32 = -7;
const LIBSSH2_ERROR_TIMEOUT: i32 = -9;
const LIBSSH2_ERROR_SOCKET_DISCONNECT: i32 = -13;
const LIBSSH2_ERROR_EAGAIN: i32 = -37;
const LIBSSH2_ERROR_SOCKET_RECV: i32 = -43;

const LIBSSH2_FX_NO_SUCH_FILE: i32 = 2;
const LIBSSH2_FX_PERMISSION_DENIED: i32 = 3;
const LIBSSH2_FX_NO_CONNECTION: i32 = 6;
const LIBSSH2_FX_CONNECTION_LOST: i32 = 7;
const LIBSSH2_FX_NO_SUCH_PATH: i32 = 10;

/// Identity files tried when no key is configured, in order
const DEFAULT_IDENTITIES: &[&str] = &["id_ed25519", "id_ecdsa", "id_rsa"];

/// Upper bound on polite shutdown of a non-blocking session
const TEARDOWN_LIMIT: Duration = Duration::from_secs(5);

/// Socket poll interval while a non-blocking call would block
const POLL_INTERVAL_MS: i32 = 100;

/// Buffer size for SFTP transfers (1MB)
const TRANSFER_BUFFER_SIZE: usize = 1024 * 1024;

/// A transport-level session that has completed key exchange
pub trait RemoteSession: Send {
    /// Host key presented during key exchange
    fn host_identity(&self) -> Result<HostIdentity>;

    /// Authenticate as `target.username`
    fn authenticate(&mut self, target: &SshTarget) -> Result<()>;

    /// Start `command` and hand over its streams
    fn launch(self: Box<Self>, address: &Address, command: &str) -> Result<Connection>;
}

/// Opens sessions up to and including key exchange
pub trait SessionOpener {
    /// Connect and run key exchange with `host:port`
    fn open(&self, host: &str, port: u16, deadline: &Deadline) -> Result<Box<dyn RemoteSession>>;
}

/// Run the connection protocol: key exchange, host key policy,
/// authentication, then interpreter launch.
///
/// The host key is settled before any credentials are sent. On any error
/// the session is dropped, closing its socket, before the error returns.
pub fn establish(
    opener: &dyn SessionOpener,
    store: &dyn HostKeyStore,
    policy: MissingHostKeyPolicy,
    target: &SshTarget,
    address: &Address,
    deadline: &Deadline,
) -> Result<Connection> {
    let mut session = opener.open(&target.host, target.port, deadline)?;

    let identity = session.host_identity()?;
    verify_host_key(store, policy, &identity)?;

    deadline.check(&target.host)?;
    session.authenticate(target)?;
    tracing::debug!("Authenticated to {}", target.login());

    deadline.check(&target.host)?;
    session.launch(address, &target.remote_command())
}

/// [`SessionOpener`] backed by libssh2
#[derive(Debug, Clone, Copy, Default)]
pub struct Ssh2Opener;

impl SessionOpener for Ssh2Opener {
    fn open(&self, host: &str, port: u16, deadline: &Deadline) -> Result<Box<dyn RemoteSession>> {
        let tcp = connect_tcp(host, port, deadline)?;
        let socket = tcp
            .try_clone()
            .map_err(|e| TetherError::connection(host, e.to_string()))?;

        let mut session = Session::new()
            .map_err(|e| TetherError::connection(host, e.to_string()))?;
        if let Some(left) = deadline.check(host)? {
            session.set_timeout(left.as_millis().clamp(1, u32::MAX as u128) as u32);
        }

        session.set_tcp_stream(tcp);
        session
            .handshake()
            .map_err(|e| session_error(host, deadline, &e))?;

        Ok(Box::new(Ssh2Session {
            host: host.to_string(),
            port,
            session,
            socket,
        }))
    }
}

fn session_error(host: &str, deadline: &Deadline, err: &ssh2::Error) -> TetherError {
    match err.code() {
        ErrorCode::Session(LIBSSH2_ERROR_TIMEOUT) => deadline.timeout_error(host),
        _ => TetherError::connection(host, err.message()),
    }
}

struct Ssh2Session {
    host: String,
    port: u16,
    session: Session,
    socket: TcpStream,
}

impl Ssh2Session {
    fn auth_failed(&self, user: &str, message: &str) -> TetherError {
        let _ = self.session.disconnect(None, "authentication failed", None);
        TetherError::auth(user, &self.host, message)
    }

    /// Offer every identity held by the running ssh-agent
    fn try_agent(&self, user: &str) -> bool {
        let Ok(mut agent) = self.session.agent() else {
            return false;
        };
        if agent.connect().is_err() || agent.list_identities().is_err() {
            return false;
        }

        let identities = agent.identities().unwrap_or_default();
        let accepted = identities
            .iter()
            .any(|identity| agent.userauth(user, identity).is_ok());
        let _ = agent.disconnect();
        accepted
    }

    /// Offer the configured key file, or the default identities
    fn try_key_files(&self, user: &str, key_path: Option<&Path>) -> bool {
        let candidates: Vec<PathBuf> = match key_path {
            Some(path) => vec![path.to_path_buf()],
            None => dirs::home_dir()
                .map(|home| {
                    DEFAULT_IDENTITIES
                        .iter()
                        .map(|name| home.join(".ssh").join(name))
                        .collect()
                })
                .unwrap_or_default(),
        };

        candidates
            .iter()
            .filter(|path| path.exists())
            .any(|path| match self.session.userauth_pubkey_file(user, None, path, None) {
                Ok(()) => true,
                Err(e) => {
                    tracing::debug!("Key {} rejected: {}", path.display(), e.message());
                    false
                }
            })
    }
}

impl RemoteSession for Ssh2Session {
    fn host_identity(&self) -> Result<HostIdentity> {
        let (blob, _) = self
            .session
            .host_key()
            .ok_or_else(|| TetherError::host_key(&self.host, "server presented no host key"))?;
        HostIdentity::from_blob(&self.host, self.port, blob)
    }

    fn authenticate(&mut self, target: &SshTarget) -> Result<()> {
        let user = target.username.as_str();

        match &target.password {
            Some(password) => {
                if let Err(e) = self.session.userauth_password(user, password) {
                    return Err(self.auth_failed(user, e.message()));
                }
            }
            None => {
                if !self.try_agent(user) {
                    self.try_key_files(user, target.key_path.as_deref());
                }
            }
        }

        if !self.session.authenticated() {
            return Err(self.auth_failed(user, "no offered credential was accepted"));
        }
        Ok(())
    }

    fn launch(self: Box<Self>, address: &Address, command: &str) -> Result<Connection> {
        let Ssh2Session {
            host,
            session,
            socket,
            ..
        } = *self;

        let mut channel = session
            .channel_session()
            .map_err(|e| TetherError::connection(&host, e.message()))?;
        channel
            .exec(command)
            .map_err(|e| TetherError::connection(&host, e.message()))?;
        tracing::info!("Started '{}' on {}", command, host);

        session.set_timeout(0);
        session.set_blocking(false);

        let waiter = Arc::new(SocketWaiter {
            session: session.clone(),
            socket,
        });
        let stdin = NonBlocking::new(channel.stream(0), Arc::clone(&waiter));
        let stdout = NonBlocking::new(channel.stream(0), Arc::clone(&waiter));
        let stderr = NonBlocking::new(channel.stderr(), Arc::clone(&waiter));
        let transfer = SftpTransfer {
            host,
            session: session.clone(),
            waiter: Arc::clone(&waiter),
            sftp: Mutex::new(None),
        };

        Ok(
            Connection::new(address.clone(), Box::new(stdin), Box::new(stdout), Box::new(stderr))
                .with_file_transfer(transfer)
                .on_close(move || close_session(channel, session, &waiter)),
        )
    }
}

fn close_session(mut channel: Channel, session: Session, waiter: &SocketWaiter) -> Result<()> {
    let limit = Some(TEARDOWN_LIMIT);
    let _ = retry(waiter, limit, || channel.send_eof());
    let _ = retry(waiter, limit, || channel.close());
    let _ = retry(waiter, limit, || {
        session.disconnect(None, "connection closed", None)
    });
    Ok(())
}

/// Waits for the session socket to become ready in the direction libssh2
/// is blocked on
struct SocketWaiter {
    session: Session,
    socket: TcpStream,
}

impl SocketWaiter {
    fn wait(&self) {
        let directions = self.session.block_directions();

        #[cfg(unix)]
        {
            use std::os::unix::io::AsRawFd;

            let events = match directions {
                BlockDirections::Inbound => libc::POLLIN,
                BlockDirections::Outbound => libc::POLLOUT,
                BlockDirections::Both => libc::POLLIN | libc::POLLOUT,
                BlockDirections::None => {
                    std::thread::sleep(Duration::from_millis(1));
                    return;
                }
            };
            let mut fd = libc::pollfd {
                fd: self.socket.as_raw_fd(),
                events,
                revents: 0,
            };
            // SAFETY: a single valid pollfd whose socket outlives the call
            unsafe {
                libc::poll(&mut fd, 1, POLL_INTERVAL_MS);
            }
        }

        #[cfg(not(unix))]
        {
            let _ = (directions, &self.socket);
            std::thread::sleep(Duration::from_millis(5));
        }
    }
}

fn would_block(err: &ssh2::Error) -> bool {
    matches!(err.code(), ErrorCode::Session(LIBSSH2_ERROR_EAGAIN))
}

/// Repeat a non-blocking libssh2 call until it stops returning EAGAIN
fn retry<T>(
    waiter: &SocketWaiter,
    limit: Option<Duration>,
    mut op: impl FnMut() -> std::result::Result<T, ssh2::Error>,
) -> std::result::Result<T, ssh2::Error> {
    let started = Instant::now();
    loop {
        match op() {
            Err(e) if would_block(&e) && limit.map_or(true, |l| started.elapsed() < l) => {
                waiter.wait()
            }
            other => return other,
        }
    }
}

/// Blocking view of a non-blocking libssh2 stream
struct NonBlocking<S> {
    inner: S,
    waiter: Arc<SocketWaiter>,
}

impl<S> NonBlocking<S> {
    fn new(inner: S, waiter: Arc<SocketWaiter>) -> Self {
        Self { inner, waiter }
    }
}

impl<S: Read> Read for NonBlocking<S> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            match self.inner.read(buf) {
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => self.waiter.wait(),
                other => return other,
            }
        }
    }
}

impl<S: Write> Write for NonBlocking<S> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        loop {
            match self.inner.write(buf) {
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => self.waiter.wait(),
                other => return other,
            }
        }
    }

    // libssh2 writes go straight to the transport; Stream::flush would
    // instead discard unread input buffered for the channel.
    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// SFTP file transfer on the authenticated session
struct SftpTransfer {
    host: String,
    session: Session,
    waiter: Arc<SocketWaiter>,
    sftp: Mutex<Option<Sftp>>,
}

impl SftpTransfer {
    /// Run `f` with the SFTP channel, opening it on first use
    fn with_sftp<T>(&self, f: impl FnOnce(&Sftp) -> Result<T>) -> Result<T> {
        let mut slot = self.sftp.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let sftp = match slot.take() {
            Some(sftp) => sftp,
            None => retry(&self.waiter, None, || self.session.sftp())
                .map_err(|e| sftp_error(&self.host, &e))?,
        };
        let result = f(&sftp);
        *slot = Some(sftp);
        result
    }
}

impl FileTransfer for SftpTransfer {
    fn getfile(&self, remote_path: &str, local_path: &Path) -> Result<u64> {
        self.with_sftp(|sftp| {
            let remote = retry(&self.waiter, None, || sftp.open(Path::new(remote_path)))
                .map_err(|e| sftp_error(remote_path, &e))?;
            let local = File::create(local_path)
                .map_err(|e| TetherError::transfer_io(local_path, e))?;

            let mut reader = NonBlocking::new(remote, Arc::clone(&self.waiter));
            let mut writer = BufWriter::with_capacity(TRANSFER_BUFFER_SIZE, local);
            let bytes = pump(
                &mut reader,
                &mut writer,
                |e| remote_io_error(remote_path, e),
                |e| TetherError::transfer_io(local_path, e),
            )?;
            writer
                .flush()
                .map_err(|e| TetherError::transfer_io(local_path, e))?;

            tracing::debug!("Downloaded {} ({} bytes) from {}", remote_path, bytes, self.host);
            Ok(bytes)
        })
    }

    fn putfile(&self, local_path: &Path, remote_path: &str) -> Result<u64> {
        let local = File::open(local_path).map_err(|e| TetherError::transfer_io(local_path, e))?;

        self.with_sftp(|sftp| {
            let remote = retry(&self.waiter, None, || sftp.create(Path::new(remote_path)))
                .map_err(|e| sftp_error(remote_path, &e))?;

            let mut reader = BufReader::with_capacity(TRANSFER_BUFFER_SIZE, local);
            let mut writer = NonBlocking::new(remote, Arc::clone(&self.waiter));
            let bytes = pump(
                &mut reader,
                &mut writer,
                |e| TetherError::transfer_io(local_path, e),
                |e| remote_io_error(remote_path, e),
            )?;

            tracing::debug!("Uploaded {} ({} bytes) to {}", remote_path, bytes, self.host);
            Ok(bytes)
        })
    }
}

/// Copy until end of input, attributing failures to the side that failed
fn pump(
    reader: &mut impl Read,
    writer: &mut impl Write,
    read_error: impl Fn(io::Error) -> TetherError,
    write_error: impl Fn(io::Error) -> TetherError,
) -> Result<u64> {
    let mut buffer = vec![0u8; TRANSFER_BUFFER_SIZE];
    let mut total = 0u64;

    loop {
        let bytes_read = match reader.read(&mut buffer) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(read_error(e)),
        };
        writer.write_all(&buffer[..bytes_read]).map_err(&write_error)?;
        total += bytes_read as u64;
    }

    Ok(total)
}

fn remote_io_error(path: &str, err: io::Error) -> TetherError {
    let kind = match err.kind() {
        io::ErrorKind::NotFound => TransferFailure::NotFound,
        io::ErrorKind::PermissionDenied => TransferFailure::PermissionDenied,
        _ => TransferFailure::ConnectionLost,
    };
    TetherError::transfer(path, kind, err.to_string())
}

fn sftp_failure(err: &ssh2::Error) -> TransferFailure {
    match err.code() {
        ErrorCode::SFTP(LIBSSH2_FX_NO_SUCH_FILE) | ErrorCode::SFTP(LIBSSH2_FX_NO_SUCH_PATH) => {
            TransferFailure::NotFound
        }
        ErrorCode::SFTP(LIBSSH2_FX_PERMISSION_DENIED) => TransferFailure::PermissionDenied,
        ErrorCode::SFTP(LIBSSH2_FX_NO_CONNECTION)
        | ErrorCode::SFTP(LIBSSH2_FX_CONNECTION_LOST)
        | ErrorCode::Session(LIBSSH2_ERROR_SOCKET_SEND)
        | ErrorCode::Session(LIBSSH2_ERROR_SOCKET_RECV)
        | ErrorCode::Session(LIBSSH2_ERROR_SOCKET_DISCONNECT)
        | ErrorCode::Session(LIBSSH2_ERROR_TIMEOUT) => TransferFailure::ConnectionLost,
        _ => TransferFailure::Other,
    }
}

fn sftp_error(path: &str, err: &ssh2::Error) -> TetherError {
    TetherError::transfer(path, sftp_failure(err), err.message())
}
