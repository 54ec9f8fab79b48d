//! # Tether - Transport Layer for Remote Execution
//!
//! Tether opens a bidirectional byte channel to an interpreter process,
//! wherever it runs, and hands back its standard streams. An RPC layer on
//! top drives its own protocol over those streams; Tether only gets the
//! bytes there.
//!
//! ## Transports
//!
//! | Address | Backend |
//! |---------|---------|
//! | `local:` | child process on this host |
//! | `ssh:host[:port]` | SSH, via libssh2 or the `ssh` binary |
//! | `smb:host[:port]` | Windows named pipe, via Win32 or SMB2 |
//! | `daemon:host[:port]` | TCP to an already running interpreter |
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::io::{Read, Write};
//! use tether::ConnectOptions;
//!
//! let options = ConnectOptions::new().with_command(["python3", "-u", "agent.py"]);
//! let mut conn = tether::connect("local:", &options).unwrap();
//!
//! conn.stdin().write_all(b"ping\n").unwrap();
//! let mut reply = [0u8; 5];
//! conn.stdout().read_exact(&mut reply).unwrap();
//! conn.close().unwrap();
//! ```
//!
//! ## Custom Transports
//!
//! ```no_run
//! use tether::{Address, ConnectOptions, Connection, Result};
//!
//! tether::register("loop", |address: &Address, _options: &ConnectOptions| -> Result<Connection> {
//!     Ok(Connection::without_stderr(
//!         address.clone(),
//!         Box::new(std::io::sink()),
//!         Box::new(std::io::empty()),
//!     ))
//! })
//! .unwrap();
//! ```
//!
//! ## File Transfer
//!
//! ```no_run
//! use std::path::Path;
//! use tether::{ConnectOptions, MissingHostKeyPolicy};
//!
//! let options = ConnectOptions::new()
//!     .with_username("deploy")
//!     .with_host_key_policy(MissingHostKeyPolicy::AutoAdd);
//! let conn = tether::connect("ssh:build01", &options).unwrap();
//!
//! if conn.capabilities().file_transfer {
//!     conn.putfile(Path::new("job.tar"), "/tmp/job.tar").unwrap();
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod address;
pub mod config;
pub mod connection;
pub mod deadline;
pub mod error;
pub mod registry;
pub mod transport;

// Re-export commonly used types
pub use address::Address;
pub use config::{ConnectOptions, MissingHostKeyPolicy};
pub use connection::{Capabilities, Connection, FileTransfer};
pub use error::{Result, TetherError, TransferFailure};
pub use registry::{connect, dispatch, init_registry, register, Registry, Transport};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Prelude module for convenient imports
pub mod prelude {
    //! Convenient re-exports for common usage
    //!
    //! ```no_run
    //! use tether::prelude::*;
    //! ```

    pub use crate::address::Address;
    pub use crate::config::{ConnectOptions, MissingHostKeyPolicy};
    pub use crate::connection::{Capabilities, Connection, EndOfStream, FileTransfer};
    pub use crate::error::{Result, TetherError, TransferFailure};
    pub use crate::registry::{connect, init_registry, Registry, Transport};
    pub use crate::transport::ssh::{HostKeyStore, KnownHostsFile, SshStrategy};
    pub use crate::transport::smb::PipeStrategy;
    pub use crate::transport::{
        DaemonListener, DaemonTransport, LocalTransport, PipeTransport, SshTransport,
    };
}
