//! Connection handle returned by every transport
//!
//! A [`Connection`] owns the three standard streams of the remote
//! interpreter, the address it was reached through, and optionally an
//! accelerated [`FileTransfer`] implementation. Closing it releases the
//! underlying OS resources exactly once; further closes are no-ops.

use crate::address::Address;
use crate::error::{Result, TetherError};
use std::fmt;
use std::io::{self, Read, Write};
use std::path::Path;

/// Writable half handed to the caller
pub type InputStream = Box<dyn Write + Send>;

/// Readable half handed to the caller
pub type OutputStream = Box<dyn Read + Send>;

/// Accelerated file transfer offered by some transports
pub trait FileTransfer: Send {
    /// Copy `remote_path` on the far side to `local_path`; returns bytes copied
    fn getfile(&self, remote_path: &str, local_path: &Path) -> Result<u64>;

    /// Copy `local_path` to `remote_path` on the far side; returns bytes copied
    fn putfile(&self, local_path: &Path, remote_path: &str) -> Result<u64>;
}

/// Optional features advertised by a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Capabilities {
    /// `getfile`/`putfile` are implemented natively by the transport
    pub file_transfer: bool,
}

/// Readable stream that is permanently at end-of-stream.
///
/// Stands in for `stderr` on transports that only carry one duplex channel.
/// Reads never block and never fail.
#[derive(Debug, Clone, Copy, Default)]
pub struct EndOfStream;

impl Read for EndOfStream {
    fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
        Ok(0)
    }
}

/// Writable stream that has been closed
#[derive(Debug, Clone, Copy, Default)]
pub struct ClosedInput;

impl Write for ClosedInput {
    fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
        Err(io::Error::new(io::ErrorKind::BrokenPipe, "input stream is closed"))
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

type Teardown = Box<dyn FnOnce() -> Result<()> + Send>;

/// An established channel to an interpreter
pub struct Connection {
    address: Address,
    stdin: InputStream,
    stdout: OutputStream,
    stderr: OutputStream,
    transfer: Option<Box<dyn FileTransfer>>,
    teardown: Option<Teardown>,
    closed: bool,
}

impl Connection {
    /// Assemble a connection from its streams
    pub fn new(
        address: Address,
        stdin: InputStream,
        stdout: OutputStream,
        stderr: OutputStream,
    ) -> Self {
        Self {
            address,
            stdin,
            stdout,
            stderr,
            transfer: None,
            teardown: None,
            closed: false,
        }
    }

    /// Assemble a connection whose transport has no error channel
    pub fn without_stderr(address: Address, stdin: InputStream, stdout: OutputStream) -> Self {
        Self::new(address, stdin, stdout, Box::new(EndOfStream))
    }

    /// Attach an accelerated file transfer implementation
    pub fn with_file_transfer(mut self, transfer: impl FileTransfer + 'static) -> Self {
        self.transfer = Some(Box::new(transfer));
        self
    }

    /// Register cleanup to run once, after the streams are dropped
    pub fn on_close(mut self, teardown: impl FnOnce() -> Result<()> + Send + 'static) -> Self {
        self.teardown = Some(Box::new(teardown));
        self
    }

    /// Address this connection was established to
    pub fn address(&self) -> &Address {
        &self.address
    }

    /// Advertised features
    pub fn capabilities(&self) -> Capabilities {
        Capabilities {
            file_transfer: self.transfer.is_some(),
        }
    }

    /// Interpreter's standard input
    pub fn stdin(&mut self) -> &mut (dyn Write + Send) {
        &mut *self.stdin
    }

    /// Interpreter's standard output
    pub fn stdout(&mut self) -> &mut (dyn Read + Send) {
        &mut *self.stdout
    }

    /// Interpreter's standard error, possibly an [`EndOfStream`] stub
    pub fn stderr(&mut self) -> &mut (dyn Read + Send) {
        &mut *self.stderr
    }

    /// Take ownership of standard input, leaving a closed stub behind
    pub fn take_stdin(&mut self) -> InputStream {
        std::mem::replace(&mut self.stdin, Box::new(ClosedInput))
    }

    /// Take ownership of standard output, leaving an end-of-stream stub behind
    pub fn take_stdout(&mut self) -> OutputStream {
        std::mem::replace(&mut self.stdout, Box::new(EndOfStream))
    }

    /// Take ownership of standard error, leaving an end-of-stream stub behind
    pub fn take_stderr(&mut self) -> OutputStream {
        std::mem::replace(&mut self.stderr, Box::new(EndOfStream))
    }

    /// Typed query for the file transfer capability
    pub fn file_transfer(&self) -> Option<&dyn FileTransfer> {
        self.transfer.as_deref()
    }

    /// Copy a remote file to a local path
    pub fn getfile(&self, remote_path: &str, local_path: &Path) -> Result<u64> {
        self.require_transfer("getfile")?.getfile(remote_path, local_path)
    }

    /// Copy a local file to a remote path
    pub fn putfile(&self, local_path: &Path, remote_path: &str) -> Result<u64> {
        self.require_transfer("putfile")?.putfile(local_path, remote_path)
    }

    fn require_transfer(&self, operation: &str) -> Result<&dyn FileTransfer> {
        if self.closed {
            return Err(TetherError::connection(
                self.address.target(),
                format!("{} on a closed connection", operation),
            ));
        }
        self.transfer.as_deref().ok_or_else(|| {
            TetherError::UnsupportedOperation(format!(
                "{} is not supported by the '{}' transport",
                operation,
                self.address.scheme()
            ))
        })
    }

    /// True once [`close`](Self::close) has run
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Release the streams and the transport's resources.
    ///
    /// Safe to call repeatedly; only the first call does anything. Streams
    /// previously taken with `take_*` belong to the caller and are not
    /// touched.
    pub fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;

        let _ = self.stdin.flush();
        drop(self.take_stdin());
        drop(self.take_stdout());
        drop(self.take_stderr());
        self.transfer = None;

        tracing::debug!("Closing connection to {}", self.address);
        match self.teardown.take() {
            Some(teardown) => teardown(),
            None => Ok(()),
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            tracing::debug!("Error closing connection to {}: {}", self.address, e);
        }
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("address", &self.address)
            .field("capabilities", &self.capabilities())
            .field("closed", &self.closed)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Default)]
    struct SharedBuffer(Arc<Mutex<Vec<u8>>>);

    impl Write for SharedBuffer {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn test_connection() -> (Connection, SharedBuffer) {
        let written = SharedBuffer::default();
        let conn = Connection::without_stderr(
            Address::parse("test:host").unwrap(),
            Box::new(written.clone()),
            Box::new(Cursor::new(b"reply".to_vec())),
        );
        (conn, written)
    }

    #[test]
    fn test_streams() {
        let (mut conn, written) = test_connection();
        conn.stdin().write_all(b"hello").unwrap();
        assert_eq!(&*written.0.lock().unwrap(), b"hello");

        let mut reply = String::new();
        conn.stdout().read_to_string(&mut reply).unwrap();
        assert_eq!(reply, "reply");
    }

    #[test]
    fn test_stub_stderr_never_blocks() {
        let (mut conn, _) = test_connection();
        let mut buf = [0u8; 64];
        for _ in 0..10 {
            assert_eq!(conn.stderr().read(&mut buf).unwrap(), 0);
        }
        let mut all = Vec::new();
        assert_eq!(conn.stderr().read_to_end(&mut all).unwrap(), 0);
    }

    #[test]
    fn test_close_is_idempotent() {
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&runs);
        let (conn, _) = test_connection();
        let mut conn = conn.on_close(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        conn.close().unwrap();
        conn.close().unwrap();
        assert!(conn.is_closed());
        drop(conn);
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_drop_runs_teardown() {
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&runs);
        let (conn, _) = test_connection();
        let conn = conn.on_close(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        drop(conn);
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_closed_streams() {
        let (mut conn, _) = test_connection();
        conn.close().unwrap();
        let err = conn.stdin().write(b"x").unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
        let mut buf = [0u8; 4];
        assert_eq!(conn.stdout().read(&mut buf).unwrap(), 0);
    }

    #[test]
    fn test_take_streams() {
        let (mut conn, written) = test_connection();
        let mut stdin = conn.take_stdin();
        stdin.write_all(b"owned").unwrap();
        assert!(conn.stdin().write(b"x").is_err());
        assert_eq!(&*written.0.lock().unwrap(), b"owned");
    }

    #[test]
    fn test_missing_transfer_is_unsupported() {
        let (conn, _) = test_connection();
        assert!(!conn.capabilities().file_transfer);
        assert!(conn.file_transfer().is_none());
        assert!(matches!(
            conn.getfile("/remote", Path::new("/local")),
            Err(TetherError::UnsupportedOperation(_))
        ));
        assert!(matches!(
            conn.putfile(Path::new("/local"), "/remote"),
            Err(TetherError::UnsupportedOperation(_))
        ));
    }

    struct CountingTransfer(Arc<AtomicUsize>);

    impl FileTransfer for CountingTransfer {
        fn getfile(&self, _remote_path: &str, _local_path: &Path) -> Result<u64> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(3)
        }

        fn putfile(&self, _local_path: &Path, _remote_path: &str) -> Result<u64> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(4)
        }
    }

    #[test]
    fn test_transfer_capability() {
        let calls = Arc::new(AtomicUsize::new(0));
        let (conn, _) = test_connection();
        let mut conn = conn.with_file_transfer(CountingTransfer(Arc::clone(&calls)));

        assert!(conn.capabilities().file_transfer);
        assert_eq!(conn.getfile("/r", Path::new("/l")).unwrap(), 3);
        assert_eq!(conn.putfile(Path::new("/l"), "/r").unwrap(), 4);
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        conn.close().unwrap();
        assert!(conn.getfile("/r", Path::new("/l")).is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
