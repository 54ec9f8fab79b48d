//! Daemon transport
//!
//! Connects over plain TCP to an interpreter that is already running and
//! listening. Nothing is spawned on the connecting side and no
//! authentication happens here; access control belongs to the listening
//! service or the network perimeter.
//!
//! [`DaemonListener`] is the companion service: it accepts connections and
//! attaches a freshly spawned interpreter to each socket.

use crate::address::Address;
use crate::config::ConnectOptions;
use crate::connection::Connection;
use crate::error::{IoResultExt, Result, TetherError};
use crate::registry::Transport;
use crate::transport::connect_tcp;
use std::io::{self, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// Port a daemon listens on unless told otherwise
pub const DEFAULT_DAEMON_PORT: u16 = 10101;

/// Transport for `daemon:` addresses
#[derive(Debug, Clone, Default)]
pub struct DaemonTransport;

impl DaemonTransport {
    /// Create the transport
    pub fn new() -> Self {
        Self
    }
}

impl Transport for DaemonTransport {
    fn connect(&self, address: &Address, options: &ConnectOptions) -> Result<Connection> {
        let host = address.target();
        if host.is_empty() {
            return Err(TetherError::address(address.raw(), "daemon address needs a host"));
        }
        let port = address.port_or(options.port, DEFAULT_DAEMON_PORT);

        if options.command.is_some() {
            tracing::debug!("Ignoring command option for daemon transport");
        }

        let stream = connect_tcp(host, port, &options.deadline())?;
        let reader = stream
            .try_clone()
            .map_err(|e| TetherError::connection(host, e.to_string()))?;
        let closer = stream
            .try_clone()
            .map_err(|e| TetherError::connection(host, e.to_string()))?;

        tracing::info!("Connected to daemon at {}:{}", host, port);

        Ok(
            Connection::without_stderr(address.clone(), Box::new(stream), Box::new(reader))
                .on_close(move || match closer.shutdown(Shutdown::Both) {
                    Err(e) if e.kind() != io::ErrorKind::NotConnected => {
                        Err(TetherError::io("shutting down daemon socket", e))
                    }
                    _ => Ok(()),
                }),
        )
    }
}

/// Listener that serves one spawned interpreter per accepted connection
pub struct DaemonListener {
    /// Listener
    listener: TcpListener,
    /// Interpreter command line
    command: Vec<String>,
    /// Shutdown flag
    shutdown: Arc<AtomicBool>,
}

impl DaemonListener {
    /// Bind to `addr` and serve `command` on each connection
    pub fn bind(addr: &str, command: Vec<String>) -> Result<Self> {
        if command.is_empty() {
            return Err(TetherError::config("daemon command is empty"));
        }
        let listener = TcpListener::bind(addr)
            .map_err(|e| TetherError::connection(addr, e.to_string()))?;

        Ok(Self {
            listener,
            command,
            shutdown: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Get the bound address
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Get shutdown flag for external control
    pub fn shutdown_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.shutdown)
    }

    /// Run the accept loop (blocking) until the shutdown flag is set
    pub fn run(&self) -> Result<()> {
        self.listener
            .set_nonblocking(true)
            .context("setting listener non-blocking")?;

        while !self.shutdown.load(Ordering::SeqCst) {
            match self.listener.accept() {
                Ok((stream, peer)) => {
                    tracing::info!("Accepted daemon connection from {}", peer);
                    let command = self.command.clone();
                    thread::spawn(move || {
                        if let Err(e) = Self::serve(stream, &command) {
                            tracing::error!("Daemon session for {} failed: {}", peer, e);
                        }
                    });
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                    thread::sleep(Duration::from_millis(10));
                }
                Err(e) => {
                    tracing::error!("Accept error: {}", e);
                }
            }
        }

        Ok(())
    }

    /// Pump bytes between one socket and one interpreter until either side ends
    fn serve(stream: TcpStream, command: &[String]) -> Result<()> {
        stream.set_nonblocking(false).context("configuring client socket")?;

        let (program, args) = command
            .split_first()
            .ok_or_else(|| TetherError::config("daemon command is empty"))?;
        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .context("spawning interpreter")?;

        let mut child_stdin = child
            .stdin
            .take()
            .ok_or_else(|| TetherError::config("interpreter stdin unavailable"))?;
        let mut child_stdout = child
            .stdout
            .take()
            .ok_or_else(|| TetherError::config("interpreter stdout unavailable"))?;

        let mut socket_reader = stream.try_clone().context("cloning client socket")?;
        let inbound = thread::spawn(move || {
            let _ = io::copy(&mut socket_reader, &mut child_stdin);
            // Dropping stdin tells the interpreter the client is gone
        });

        let mut socket_writer = stream;
        let result = io::copy(&mut child_stdout, &mut socket_writer);
        let _ = socket_writer.flush();
        let _ = socket_writer.shutdown(Shutdown::Both);
        let _ = inbound.join();

        let status = child.wait().context("waiting for interpreter")?;
        tracing::debug!("Daemon interpreter exited: {}", status);
        result.map(|_| ()).context("forwarding interpreter output")
    }
}
