//! Transport backends
//!
//! Every backend implements [`Transport`](crate::registry::Transport) and
//! returns a [`Connection`](crate::connection::Connection).
//!
//! ## Transport Comparison
//!
//! | Scheme | Mechanism | stderr | File transfer |
//! |--------|-----------|--------|---------------|
//! | `local` | child process, anonymous pipes | real | local copy |
//! | `ssh` | libssh2 session or `ssh` binary | real | SFTP / scp |
//! | `smb` | Windows named pipe (Win32 or SMB2) | stub | none |
//! | `daemon` | TCP to a running interpreter | stub | none |

mod daemon;
mod local;
pub mod smb;
pub mod ssh;

pub use daemon::*;
pub use local::*;
pub use smb::PipeTransport;
pub use ssh::SshTransport;

use crate::deadline::Deadline;
use crate::error::{Result, TetherError};
use std::net::{TcpStream, ToSocketAddrs};

/// Open a TCP connection to `host:port` within the deadline.
///
/// Every resolved address is tried in turn; the last failure is reported.
pub(crate) fn connect_tcp(host: &str, port: u16, deadline: &Deadline) -> Result<TcpStream> {
    let addrs = (host, port)
        .to_socket_addrs()
        .map_err(|e| TetherError::connection(host, format!("cannot resolve: {}", e)))?;

    let mut last_error = None;
    for addr in addrs {
        let attempt = match deadline.check(host)? {
            Some(left) => TcpStream::connect_timeout(&addr, left),
            None => TcpStream::connect(addr),
        };
        match attempt {
            Ok(stream) => {
                let _ = stream.set_nodelay(true);
                tracing::debug!("Connected to {} ({})", host, addr);
                return Ok(stream);
            }
            Err(e) => {
                tracing::debug!("Connection to {} ({}) failed: {}", host, addr, e);
                last_error = Some(deadline.map_io(host, e));
            }
        }
    }

    Err(last_error
        .unwrap_or_else(|| TetherError::connection(host, "host resolved to no addresses")))
}

/// Quote a word for a POSIX shell
pub(crate) fn shell_quote(word: &str) -> String {
    let safe = !word.is_empty()
        && word
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b"-_./=:,+@%".contains(&b));
    if safe {
        word.to_string()
    } else {
        format!("'{}'", word.replace('\'', r"'\''"))
    }
}

/// File name of the running executable, used as the default remote command
pub(crate) fn current_program_name() -> Result<String> {
    let exe = std::env::current_exe()
        .map_err(|e| TetherError::io("locating current executable", e))?;
    exe.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .ok_or_else(|| TetherError::config("current executable has no file name"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shell_quote() {
        assert_eq!(shell_quote("python"), "python");
        assert_eq!(shell_quote("-u"), "-u");
        assert_eq!(shell_quote("a b"), "'a b'");
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
        assert_eq!(shell_quote(""), "''");
    }

    #[test]
    fn test_connect_refused() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let result = connect_tcp("127.0.0.1", port, &Deadline::none());
        assert!(matches!(result, Err(TetherError::ConnectionError { .. })));
    }

    #[test]
    fn test_connect_ok() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let stream = connect_tcp("127.0.0.1", port, &Deadline::none()).unwrap();
        assert_eq!(stream.peer_addr().unwrap().port(), port);
    }
}
