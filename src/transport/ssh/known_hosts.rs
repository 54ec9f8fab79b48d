//! Host key trust store
//!
//! [`HostKeyStore`] isolates the persisted set of known server identities so
//! the policy logic can run against [`MemoryHostKeyStore`] in tests and
//! against [`KnownHostsFile`] (OpenSSH `known_hosts` format) in production.
//!
//! Hashed (`|1|...`) and marker (`@cert-authority`, `@revoked`) lines are
//! preserved in the file but never match.

use crate::config::MissingHostKeyPolicy;
use crate::error::{Result, TetherError};
use base64::engine::general_purpose::{STANDARD, STANDARD_NO_PAD};
use base64::Engine;
use sha2::{Digest, Sha256};
use std::fs::OpenOptions;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Port whose entries are written without brackets
const STANDARD_SSH_PORT: u16 = 22;

/// Serializes appends from every store in the process
static APPEND_LOCK: Mutex<()> = Mutex::new(());

/// A server's public host key
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostIdentity {
    /// Host name or address as connected to
    pub host: String,
    /// Port as connected to
    pub port: u16,
    /// Key algorithm name, e.g. `ssh-ed25519`
    pub key_type: String,
    /// Public key blob in SSH wire format
    pub key: Vec<u8>,
}

impl HostIdentity {
    /// Build an identity from a wire-format key blob, reading the algorithm
    /// name from the blob itself
    pub fn from_blob(host: &str, port: u16, key: &[u8]) -> Result<Self> {
        let key_type = blob_key_type(key)
            .ok_or_else(|| TetherError::host_key(host, "malformed host key blob"))?;
        Ok(Self {
            host: host.to_string(),
            port,
            key_type,
            key: key.to_vec(),
        })
    }

    /// Name used for this host in `known_hosts`
    pub fn host_pattern(&self) -> String {
        host_pattern(&self.host, self.port)
    }

    /// OpenSSH-style SHA256 fingerprint
    pub fn fingerprint(&self) -> String {
        let digest = Sha256::digest(&self.key);
        format!("SHA256:{}", STANDARD_NO_PAD.encode(digest))
    }

    fn to_line(&self) -> String {
        format!(
            "{} {} {}\n",
            self.host_pattern(),
            self.key_type,
            STANDARD.encode(&self.key)
        )
    }
}

fn host_pattern(host: &str, port: u16) -> String {
    if port == STANDARD_SSH_PORT {
        host.to_string()
    } else {
        format!("[{}]:{}", host, port)
    }
}

/// Algorithm name at the start of an SSH public key blob
fn blob_key_type(blob: &[u8]) -> Option<String> {
    let len_bytes: [u8; 4] = blob.get(..4)?.try_into().ok()?;
    let len = u32::from_be_bytes(len_bytes) as usize;
    let name = blob.get(4..4usize.checked_add(len)?)?;
    std::str::from_utf8(name).ok().map(str::to_string)
}

/// Persisted set of trusted host keys
pub trait HostKeyStore: Send + Sync {
    /// Every stored key for `host:port`
    fn lookup(&self, host: &str, port: u16) -> Result<Vec<HostIdentity>>;

    /// Record a newly trusted key. Must merge with concurrent writers.
    fn remember(&self, identity: &HostIdentity) -> Result<()>;
}

/// Outcome of comparing a presented key with the store
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostKeyStatus {
    /// Key matches a stored entry
    Known,
    /// No entry of this key type for the host
    Unknown,
    /// A different key of the same type is stored
    Changed,
}

/// Compare a presented key against the store
pub fn check_host_key(store: &dyn HostKeyStore, identity: &HostIdentity) -> Result<HostKeyStatus> {
    let stored = store.lookup(&identity.host, identity.port)?;
    let same_type: Vec<_> = stored
        .iter()
        .filter(|entry| entry.key_type == identity.key_type)
        .collect();

    if same_type.iter().any(|entry| entry.key == identity.key) {
        Ok(HostKeyStatus::Known)
    } else if same_type.is_empty() {
        Ok(HostKeyStatus::Unknown)
    } else {
        Ok(HostKeyStatus::Changed)
    }
}

/// Decide whether to trust a presented key.
///
/// A changed key is refused whatever the policy; the policy only governs
/// keys never seen before.
pub fn verify_host_key(
    store: &dyn HostKeyStore,
    policy: MissingHostKeyPolicy,
    identity: &HostIdentity,
) -> Result<()> {
    let pattern = identity.host_pattern();
    match check_host_key(store, identity)? {
        HostKeyStatus::Known => {
            tracing::debug!("Host key for {} verified ({})", pattern, identity.fingerprint());
            Ok(())
        }
        HostKeyStatus::Changed => Err(TetherError::host_key(
            &pattern,
            format!(
                "{} key changed, now {}; refusing to connect",
                identity.key_type,
                identity.fingerprint()
            ),
        )),
        HostKeyStatus::Unknown => match policy {
            MissingHostKeyPolicy::Reject => Err(TetherError::host_key(
                &pattern,
                format!(
                    "unknown {} key {} (policy: reject)",
                    identity.key_type,
                    identity.fingerprint()
                ),
            )),
            MissingHostKeyPolicy::AutoAdd => {
                store.remember(identity)?;
                tracing::info!(
                    "Added {} key {} for {} to known hosts",
                    identity.key_type,
                    identity.fingerprint(),
                    pattern
                );
                Ok(())
            }
            MissingHostKeyPolicy::Warning => {
                tracing::warn!(
                    "Unknown {} key {} for {}; continuing without recording it",
                    identity.key_type,
                    identity.fingerprint(),
                    pattern
                );
                Ok(())
            }
        },
    }
}

/// OpenSSH `known_hosts` file
#[derive(Debug, Clone)]
pub struct KnownHostsFile {
    path: PathBuf,
}

impl KnownHostsFile {
    /// Store backed by `path`; the file is created on first write
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// `~/.ssh/known_hosts`
    pub fn default_path() -> Result<PathBuf> {
        dirs::home_dir()
            .map(|home| home.join(".ssh").join("known_hosts"))
            .ok_or_else(|| TetherError::config("cannot determine home directory for known_hosts"))
    }

    /// Backing file
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_entries(&self) -> Result<Vec<(Vec<String>, HostIdentity)>> {
        let text = match std::fs::read_to_string(&self.path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(TetherError::io(format!("reading {}", self.path.display()), e)),
        };
        Ok(text.lines().filter_map(parse_line).collect())
    }
}

/// Parse `names keytype base64 [comment]`
fn parse_line(line: &str) -> Option<(Vec<String>, HostIdentity)> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') || line.starts_with('@') {
        return None;
    }
    let mut fields = line.split_whitespace();
    let names: Vec<String> = fields.next()?.split(',').map(str::to_string).collect();
    let key_type = fields.next()?.to_string();
    let key = STANDARD.decode(fields.next()?).ok()?;
    Some((
        names,
        HostIdentity {
            host: String::new(),
            port: 0,
            key_type,
            key,
        },
    ))
}

impl HostKeyStore for KnownHostsFile {
    fn lookup(&self, host: &str, port: u16) -> Result<Vec<HostIdentity>> {
        let pattern = host_pattern(host, port);
        Ok(self
            .read_entries()?
            .into_iter()
            .filter(|(names, _)| names.iter().any(|name| *name == pattern))
            .map(|(_, identity)| HostIdentity {
                host: host.to_string(),
                port,
                ..identity
            })
            .collect())
    }

    fn remember(&self, identity: &HostIdentity) -> Result<()> {
        let _guard = APPEND_LOCK.lock().unwrap_or_else(|poisoned| poisoned.into_inner());

        // Another connection may have recorded the same key meanwhile
        if self
            .lookup(&identity.host, identity.port)?
            .iter()
            .any(|known| known.key_type == identity.key_type && known.key == identity.key)
        {
            return Ok(());
        }

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| TetherError::io(format!("creating {}", parent.display()), e))?;
        }

        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| TetherError::io(format!("opening {}", self.path.display()), e))?;

        let mut line = identity.to_line();
        if !ends_with_newline(&mut file)
            .map_err(|e| TetherError::io(format!("reading {}", self.path.display()), e))?
        {
            line.insert(0, '\n');
        }

        // One write per line keeps concurrent appenders from interleaving
        file.write_all(line.as_bytes())
            .map_err(|e| TetherError::io(format!("writing {}", self.path.display()), e))
    }
}

/// True for an empty file or one whose last byte is a newline
fn ends_with_newline(file: &mut std::fs::File) -> std::io::Result<bool> {
    if file.metadata()?.len() == 0 {
        return Ok(true);
    }
    file.seek(SeekFrom::End(-1))?;
    let mut last = [0u8; 1];
    file.read_exact(&mut last)?;
    Ok(last[0] == b'\n')
}

/// In-memory store for tests and embedders that manage trust themselves
#[derive(Debug, Default)]
pub struct MemoryHostKeyStore {
    entries: Mutex<Vec<HostIdentity>>,
}

impl MemoryHostKeyStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored keys
    pub fn len(&self) -> usize {
        self.entries.lock().map(|e| e.len()).unwrap_or(0)
    }

    /// True if nothing is stored
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl HostKeyStore for MemoryHostKeyStore {
    fn lookup(&self, host: &str, port: u16) -> Result<Vec<HostIdentity>> {
        let entries = self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        Ok(entries
            .iter()
            .filter(|entry| entry.host == host && entry.port == port)
            .cloned()
            .collect())
    }

    fn remember(&self, identity: &HostIdentity) -> Result<()> {
        let mut entries = self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if !entries.contains(identity) {
            entries.push(identity.clone());
        }
        Ok(())
    }
}
