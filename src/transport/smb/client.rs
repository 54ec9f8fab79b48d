//! Portable named-pipe strategy: a minimal SMB2 client
//!
//! Speaks SMB 2.0.2 and 2.1 over direct TCP: NEGOTIATE, NTLMv2 session
//! setup, TREE_CONNECT to `IPC$`, then CREATE/READ/WRITE on the pipe.
//! Requests are signed with HMAC-SHA256 when the server requires it.
//!
//! A pipe READ stays pending on the server until the interpreter writes
//! something, so responses are demultiplexed by message id on a background
//! thread; a writer never waits behind a pending read.

use super::ntlm::{self, NtlmChallenge, NtlmCredentials};
use super::{PipeChannel, PipeOpener, PipeTarget};
use crate::deadline::Deadline;
use crate::error::{Result, TetherError};
use crate::transport::connect_tcp;
use crossbeam::channel::{bounded, Receiver, RecvTimeoutError, Sender};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

const PROTOCOL_ID: &[u8; 4] = b"\xfeSMB";
const HEADER_LEN: usize = 64;

const SMB2_NEGOTIATE: u16 = 0x0000;
const SMB2_SESSION_SETUP: u16 = 0x0001;
const SMB2_LOGOFF: u16 = 0x0002;
const SMB2_TREE_CONNECT: u16 = 0x0003;
const SMB2_TREE_DISCONNECT: u16 = 0x0004;
const SMB2_CREATE: u16 = 0x0005;
const SMB2_CLOSE: u16 = 0x0006;
const SMB2_READ: u16 = 0x0008;
const SMB2_WRITE: u16 = 0x0009;

const FLAGS_SERVER_TO_REDIR: u32 = 0x0000_0001;
const FLAGS_ASYNC_COMMAND: u32 = 0x0000_0002;
const FLAGS_SIGNED: u32 = 0x0000_0008;

const DIALECT_202: u16 = 0x0202;
const DIALECT_210: u16 = 0x0210;

const NEGOTIATE_SIGNING_ENABLED: u16 = 0x0001;
const NEGOTIATE_SIGNING_REQUIRED: u16 = 0x0002;

const SESSION_FLAG_IS_GUEST: u16 = 0x0001;
const SESSION_FLAG_IS_NULL: u16 = 0x0002;

const STATUS_SUCCESS: u32 = 0x0000_0000;
const STATUS_PENDING: u32 = 0x0000_0103;
const STATUS_BUFFER_OVERFLOW: u32 = 0x8000_0005;
const STATUS_END_OF_FILE: u32 = 0xC000_0011;
const STATUS_MORE_PROCESSING_REQUIRED: u32 = 0xC000_0016;
const STATUS_ACCESS_DENIED: u32 = 0xC000_0022;
const STATUS_OBJECT_NAME_NOT_FOUND: u32 = 0xC000_0034;
const STATUS_NO_SUCH_USER: u32 = 0xC000_0064;
const STATUS_WRONG_PASSWORD: u32 = 0xC000_006A;
const STATUS_LOGON_FAILURE: u32 = 0xC000_006D;
const STATUS_ACCOUNT_RESTRICTION: u32 = 0xC000_006E;
const STATUS_PASSWORD_EXPIRED: u32 = 0xC000_0071;
const STATUS_ACCOUNT_DISABLED: u32 = 0xC000_0072;
const STATUS_PIPE_NOT_AVAILABLE: u32 = 0xC000_00AC;
const STATUS_PIPE_DISCONNECTED: u32 = 0xC000_00B0;
const STATUS_PIPE_CLOSING: u32 = 0xC000_00B1;
const STATUS_BAD_NETWORK_NAME: u32 = 0xC000_00CC;
const STATUS_CANCELLED: u32 = 0xC000_0120;
const STATUS_FILE_CLOSED: u32 = 0xC000_0128;
const STATUS_PIPE_BROKEN: u32 = 0xC000_014B;
const STATUS_ACCOUNT_LOCKED_OUT: u32 = 0xC000_0234;

/// Generic read/write access for a pipe handle
const PIPE_DESIRED_ACCESS: u32 = 0x0012_019f;
const FILE_SHARE_READ_WRITE: u32 = 0x0000_0003;
const FILE_OPEN: u32 = 0x0000_0001;
const FILE_NON_DIRECTORY_FILE: u32 = 0x0000_0040;
const IMPERSONATION: u32 = 0x0000_0002;

/// Largest single READ or WRITE
const MAX_IO_SIZE: u32 = 64 * 1024;

/// Credits asked for on every request
const CREDIT_REQUEST: u16 = 32;

/// Budget for each teardown request
const TEARDOWN_TIMEOUT: Duration = Duration::from_secs(2);

type HmacSha256 = Hmac<Sha256>;

/// Raw SMB2 message, header included
#[derive(Debug, Clone)]
struct Packet {
    data: Vec<u8>,
}

impl Packet {
    fn parse(data: Vec<u8>) -> io::Result<Self> {
        if data.len() < HEADER_LEN || &data[..4] != PROTOCOL_ID {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "not an SMB2 message"));
        }
        Ok(Self { data })
    }

    fn status(&self) -> u32 {
        le_u32(&self.data, 8).unwrap_or(u32::MAX)
    }

    fn flags(&self) -> u32 {
        le_u32(&self.data, 16).unwrap_or(0)
    }

    fn message_id(&self) -> u64 {
        le_u64(&self.data, 24).unwrap_or(u64::MAX)
    }

    fn tree_id(&self) -> u32 {
        le_u32(&self.data, 36).unwrap_or(0)
    }

    fn session_id(&self) -> u64 {
        le_u64(&self.data, 40).unwrap_or(0)
    }

    fn body(&self) -> &[u8] {
        &self.data[HEADER_LEN..]
    }

    /// Slice addressed by an offset from the start of the header
    fn buffer(&self, offset: usize, len: usize) -> Option<&[u8]> {
        self.data.get(offset..offset.checked_add(len)?)
    }
}

fn le_u16(buf: &[u8], at: usize) -> Option<u16> {
    buf.get(at..at + 2).map(|b| u16::from_le_bytes([b[0], b[1]]))
}

fn le_u32(buf: &[u8], at: usize) -> Option<u32> {
    buf.get(at..at + 4).map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
}

fn le_u64(buf: &[u8], at: usize) -> Option<u64> {
    let b = buf.get(at..at + 8)?;
    let mut raw = [0u8; 8];
    raw.copy_from_slice(b);
    Some(u64::from_le_bytes(raw))
}

fn utf16le(s: &str) -> Vec<u8> {
    s.encode_utf16().flat_map(|unit| unit.to_le_bytes()).collect()
}

/// Synchronous request header
fn header(command: u16, message_id: u64, session_id: u64, tree_id: u32) -> Vec<u8> {
    let mut h = Vec::with_capacity(HEADER_LEN);
    h.extend_from_slice(PROTOCOL_ID);
    h.extend_from_slice(&(HEADER_LEN as u16).to_le_bytes());
    h.extend_from_slice(&0u16.to_le_bytes()); // credit charge
    h.extend_from_slice(&0u32.to_le_bytes()); // status
    h.extend_from_slice(&command.to_le_bytes());
    h.extend_from_slice(&CREDIT_REQUEST.to_le_bytes());
    h.extend_from_slice(&0u32.to_le_bytes()); // flags
    h.extend_from_slice(&0u32.to_le_bytes()); // next command
    h.extend_from_slice(&message_id.to_le_bytes());
    h.extend_from_slice(&0u32.to_le_bytes()); // process id
    h.extend_from_slice(&tree_id.to_le_bytes());
    h.extend_from_slice(&session_id.to_le_bytes());
    h.extend_from_slice(&[0u8; 16]); // signature
    h
}

/// Set the signed flag and write the HMAC-SHA256 signature in place
fn sign(msg: &mut [u8], key: &[u8; 16]) -> Result<()> {
    let flags = le_u32(msg, 16).unwrap_or(0) | FLAGS_SIGNED;
    msg[16..20].copy_from_slice(&flags.to_le_bytes());
    msg[48..64].fill(0);

    let mut mac = HmacSha256::new_from_slice(key)
        .map_err(|_| TetherError::unavailable("smb", "HMAC-SHA256 key rejected"))?;
    mac.update(msg);
    let signature = mac.finalize().into_bytes();
    msg[48..64].copy_from_slice(&signature[..16]);
    Ok(())
}

/// Write one message with its 4-byte direct-TCP length prefix
fn write_frame(writer: &mut impl Write, msg: &[u8]) -> io::Result<()> {
    if msg.len() > 0x00ff_ffff {
        return Err(io::Error::new(io::ErrorKind::InvalidInput, "SMB2 message too large"));
    }
    let mut frame = Vec::with_capacity(4 + msg.len());
    frame.extend_from_slice(&(msg.len() as u32).to_be_bytes());
    frame.extend_from_slice(msg);
    writer.write_all(&frame)
}

/// Read one message, skipping session keep-alives
fn read_frame(reader: &mut impl Read) -> io::Result<Vec<u8>> {
    loop {
        let mut prefix = [0u8; 4];
        reader.read_exact(&mut prefix)?;
        let len = u32::from_be_bytes([0, prefix[1], prefix[2], prefix[3]]) as usize;
        let mut msg = vec![0u8; len];
        reader.read_exact(&mut msg)?;
        if prefix[0] == 0 {
            return Ok(msg);
        }
    }
}

/// Connection state shared with the demultiplexer thread
struct Shared {
    writer: Mutex<TcpStream>,
    pending: Mutex<HashMap<u64, Sender<Packet>>>,
    closed: AtomicBool,
}

impl Shared {
    fn shutdown(&self) {
        let writer = self.writer.lock().unwrap_or_else(|p| p.into_inner());
        let _ = writer.shutdown(Shutdown::Both);
    }
}

/// Route responses to their waiting requests until the socket closes
fn demultiplex(shared: Arc<Shared>, mut reader: TcpStream) {
    loop {
        let packet = match read_frame(&mut reader).and_then(Packet::parse) {
            Ok(packet) => packet,
            Err(e) => {
                tracing::debug!("SMB2 receive loop ended: {}", e);
                break;
            }
        };

        // Interim response; the final one reuses the message id
        if packet.status() == STATUS_PENDING && packet.flags() & FLAGS_ASYNC_COMMAND != 0 {
            continue;
        }

        let waiter = shared
            .pending
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .remove(&packet.message_id());
        match waiter {
            Some(tx) => {
                let _ = tx.send(packet);
            }
            None => tracing::trace!("Unsolicited SMB2 message id {}", packet.message_id()),
        }
    }

    shared.closed.store(true, Ordering::SeqCst);
    shared.pending.lock().unwrap_or_else(|p| p.into_inner()).clear();
}

/// One SMB2 session with a single open pipe
pub(crate) struct Smb2Client {
    host: String,
    user: String,
    shared: Arc<Shared>,
    next_message_id: AtomicU64,
    session_id: u64,
    tree_id: u32,
    signing_key: Option<[u8; 16]>,
    signing_required: bool,
    max_read: u32,
    max_write: u32,
}

impl Smb2Client {
    /// Run the full setup sequence and open the pipe
    pub(crate) fn connect(
        target: &PipeTarget,
        deadline: &Deadline,
    ) -> Result<(Arc<Self>, [u8; 16])> {
        let tcp = connect_tcp(&target.host, target.port, deadline)?;
        let reader = tcp
            .try_clone()
            .map_err(|e| TetherError::connection(&target.host, e.to_string()))?;

        let shared = Arc::new(Shared {
            writer: Mutex::new(tcp),
            pending: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
        });
        let demux_shared = Arc::clone(&shared);
        thread::Builder::new()
            .name(format!("tether-smb-{}", target.host))
            .spawn(move || demultiplex(demux_shared, reader))
            .map_err(|e| TetherError::io("spawning SMB2 receive thread", e))?;

        let mut client = Self {
            host: target.host.clone(),
            user: target.username.clone(),
            shared,
            next_message_id: AtomicU64::new(0),
            session_id: 0,
            tree_id: 0,
            signing_key: None,
            signing_required: false,
            max_read: MAX_IO_SIZE,
            max_write: MAX_IO_SIZE,
        };

        client.negotiate(deadline)?;
        client.session_setup(target, deadline)?;
        client.tree_connect(deadline)?;
        let file_id = client.open_pipe(&target.pipe_name, deadline)?;

        tracing::info!("Opened pipe '{}' on {} over SMB2", target.pipe_name, target.host);
        Ok((Arc::new(client), file_id))
    }

    fn submit(&self, command: u16, body: &[u8]) -> io::Result<Receiver<Packet>> {
        let message_id = self.next_message_id.fetch_add(1, Ordering::SeqCst);
        let mut msg = header(command, message_id, self.session_id, self.tree_id);
        msg.extend_from_slice(body);
        if let Some(key) = &self.signing_key {
            sign(&mut msg, key).map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))?;
        }

        let (tx, rx) = bounded(1);
        self.shared
            .pending
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(message_id, tx);
        if self.shared.closed.load(Ordering::SeqCst) {
            self.forget(message_id);
            return Err(io::Error::new(io::ErrorKind::NotConnected, "SMB2 connection closed"));
        }

        let mut writer = self.shared.writer.lock().unwrap_or_else(|p| p.into_inner());
        if let Err(e) = write_frame(&mut *writer, &msg) {
            drop(writer);
            self.forget(message_id);
            return Err(e);
        }
        Ok(rx)
    }

    fn forget(&self, message_id: u64) {
        self.shared
            .pending
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .remove(&message_id);
    }

    /// Request/response during setup and teardown, bounded by `deadline`
    fn request(&self, command: u16, body: &[u8], deadline: &Deadline) -> Result<Packet> {
        let rx = self
            .submit(command, body)
            .map_err(|e| deadline.map_io(&self.host, e))?;

        let received = match deadline.check(&self.host)? {
            Some(left) => rx.recv_timeout(left),
            None => rx.recv().map_err(|_| RecvTimeoutError::Disconnected),
        };
        received.map_err(|e| match e {
            RecvTimeoutError::Timeout => deadline.timeout_error(&self.host),
            RecvTimeoutError::Disconnected => {
                TetherError::connection(&self.host, "server closed the SMB2 connection")
            }
        })
    }

    /// Request/response for stream I/O; `None` once the connection is gone
    fn exchange(&self, command: u16, body: &[u8]) -> io::Result<Option<Packet>> {
        let rx = match self.submit(command, body) {
            Ok(rx) => rx,
            Err(e) if e.kind() == io::ErrorKind::NotConnected => return Ok(None),
            Err(e) => return Err(e),
        };
        Ok(rx.recv().ok())
    }

    fn status_error(&self, step: &str, status: u32) -> TetherError {
        match status {
            STATUS_LOGON_FAILURE
            | STATUS_WRONG_PASSWORD
            | STATUS_NO_SUCH_USER
            | STATUS_ACCOUNT_RESTRICTION
            | STATUS_ACCOUNT_DISABLED
            | STATUS_ACCOUNT_LOCKED_OUT
            | STATUS_PASSWORD_EXPIRED
            | STATUS_ACCESS_DENIED => TetherError::auth(
                &self.user,
                &self.host,
                format!("{} refused (status 0x{:08x})", step, status),
            ),
            STATUS_OBJECT_NAME_NOT_FOUND | STATUS_PIPE_NOT_AVAILABLE | STATUS_BAD_NETWORK_NAME => {
                TetherError::connection(
                    &self.host,
                    format!("{}: no such pipe or share (status 0x{:08x})", step, status),
                )
            }
            _ => TetherError::connection(
                &self.host,
                format!("{} failed with status 0x{:08x}", step, status),
            ),
        }
    }

    fn negotiate(&mut self, deadline: &Deadline) -> Result<()> {
        let dialects = [DIALECT_202, DIALECT_210];
        let mut body = Vec::with_capacity(36 + 2 * dialects.len());
        body.extend_from_slice(&36u16.to_le_bytes());
        body.extend_from_slice(&(dialects.len() as u16).to_le_bytes());
        body.extend_from_slice(&NEGOTIATE_SIGNING_ENABLED.to_le_bytes());
        body.extend_from_slice(&0u16.to_le_bytes()); // reserved
        body.extend_from_slice(&0u32.to_le_bytes()); // capabilities
        body.extend_from_slice(&rand::random::<[u8; 16]>()); // client guid
        body.extend_from_slice(&0u64.to_le_bytes()); // client start time
        for dialect in dialects {
            body.extend_from_slice(&dialect.to_le_bytes());
        }

        let resp = self.request(SMB2_NEGOTIATE, &body, deadline)?;
        if resp.status() != STATUS_SUCCESS {
            return Err(self.status_error("NEGOTIATE", resp.status()));
        }

        let b = resp.body();
        let malformed = || TetherError::connection(&self.host, "malformed NEGOTIATE response");
        let security_mode = le_u16(b, 2).ok_or_else(malformed)?;
        let dialect = le_u16(b, 4).ok_or_else(malformed)?;
        if !dialects.contains(&dialect) {
            return Err(TetherError::connection(
                &self.host,
                format!("server chose unsupported dialect 0x{:04x}", dialect),
            ));
        }

        let max_read = le_u32(b, 32).ok_or_else(malformed)?;
        let max_write = le_u32(b, 36).ok_or_else(malformed)?;
        self.max_read = max_read.clamp(1, MAX_IO_SIZE);
        self.max_write = max_write.clamp(1, MAX_IO_SIZE);
        self.signing_required = security_mode & NEGOTIATE_SIGNING_REQUIRED != 0;

        tracing::debug!(
            "SMB2 dialect 0x{:04x} with {}, signing {}",
            dialect,
            self.host,
            if self.signing_required { "required" } else { "optional" }
        );
        Ok(())
    }

    fn session_setup_body(token: &[u8]) -> Vec<u8> {
        const FIXED: usize = 24;
        let mut body = Vec::with_capacity(FIXED + token.len());
        body.extend_from_slice(&25u16.to_le_bytes());
        body.push(0); // flags
        body.push(NEGOTIATE_SIGNING_ENABLED as u8);
        body.extend_from_slice(&0u32.to_le_bytes()); // capabilities
        body.extend_from_slice(&0u32.to_le_bytes()); // channel
        body.extend_from_slice(&((HEADER_LEN + FIXED) as u16).to_le_bytes());
        body.extend_from_slice(&(token.len() as u16).to_le_bytes());
        body.extend_from_slice(&0u64.to_le_bytes()); // previous session
        body.extend_from_slice(token);
        body
    }

    fn security_buffer(resp: &Packet) -> Option<&[u8]> {
        let b = resp.body();
        let offset = le_u16(b, 4)? as usize;
        let len = le_u16(b, 6)? as usize;
        resp.buffer(offset, len)
    }

    fn session_setup(&mut self, target: &PipeTarget, deadline: &Deadline) -> Result<()> {
        let credentials = NtlmCredentials {
            user: target.username.clone(),
            password: target.password.clone().unwrap_or_default(),
            domain: target.domain.clone(),
        };

        let first = Self::session_setup_body(&ntlm::spnego_init(&ntlm::negotiate_message()));
        let resp = self.request(SMB2_SESSION_SETUP, &first, deadline)?;
        if resp.status() != STATUS_MORE_PROCESSING_REQUIRED {
            return Err(self.status_error("SESSION_SETUP", resp.status()));
        }
        self.session_id = resp.session_id();

        let challenge = Self::security_buffer(&resp)
            .and_then(ntlm::extract_ntlm)
            .ok_or_else(|| {
                TetherError::connection(&self.host, "no NTLM challenge in SESSION_SETUP")
            })?;
        let challenge = NtlmChallenge::parse(challenge)?;
        let (token, session_key) = ntlm::authenticate_message(&credentials, &challenge)?;

        let second = Self::session_setup_body(&ntlm::spnego_response(&token));
        let resp = self.request(SMB2_SESSION_SETUP, &second, deadline)?;
        if resp.status() != STATUS_SUCCESS {
            return Err(self.status_error("SESSION_SETUP", resp.status()));
        }

        let session_flags = le_u16(resp.body(), 2).unwrap_or(0);
        let anonymous = session_flags & (SESSION_FLAG_IS_GUEST | SESSION_FLAG_IS_NULL) != 0;
        if self.signing_required && !anonymous {
            self.signing_key = Some(session_key);
        }

        tracing::debug!("SMB2 session 0x{:x} established as {}", self.session_id, credentials.user);
        Ok(())
    }

    fn tree_connect(&mut self, deadline: &Deadline) -> Result<()> {
        const FIXED: usize = 8;
        let path = utf16le(&format!("\\\\{}\\IPC$", self.host));
        let mut body = Vec::with_capacity(FIXED + path.len());
        body.extend_from_slice(&9u16.to_le_bytes());
        body.extend_from_slice(&0u16.to_le_bytes()); // reserved
        body.extend_from_slice(&((HEADER_LEN + FIXED) as u16).to_le_bytes());
        body.extend_from_slice(&(path.len() as u16).to_le_bytes());
        body.extend_from_slice(&path);

        let resp = self.request(SMB2_TREE_CONNECT, &body, deadline)?;
        if resp.status() != STATUS_SUCCESS {
            return Err(self.status_error("TREE_CONNECT IPC$", resp.status()));
        }
        self.tree_id = resp.tree_id();
        Ok(())
    }

    fn open_pipe(&self, pipe_name: &str, deadline: &Deadline) -> Result<[u8; 16]> {
        const FIXED: usize = 56;
        let name = utf16le(pipe_name.trim_start_matches('\\'));
        let mut body = Vec::with_capacity(FIXED + name.len());
        body.extend_from_slice(&57u16.to_le_bytes());
        body.push(0); // security flags
        body.push(0); // oplock level
        body.extend_from_slice(&IMPERSONATION.to_le_bytes());
        body.extend_from_slice(&0u64.to_le_bytes()); // create flags
        body.extend_from_slice(&0u64.to_le_bytes()); // reserved
        body.extend_from_slice(&PIPE_DESIRED_ACCESS.to_le_bytes());
        body.extend_from_slice(&0u32.to_le_bytes()); // file attributes
        body.extend_from_slice(&FILE_SHARE_READ_WRITE.to_le_bytes());
        body.extend_from_slice(&FILE_OPEN.to_le_bytes());
        body.extend_from_slice(&FILE_NON_DIRECTORY_FILE.to_le_bytes());
        body.extend_from_slice(&((HEADER_LEN + FIXED) as u16).to_le_bytes());
        body.extend_from_slice(&(name.len() as u16).to_le_bytes());
        body.extend_from_slice(&0u32.to_le_bytes()); // create contexts offset
        body.extend_from_slice(&0u32.to_le_bytes()); // create contexts length
        body.extend_from_slice(&name);

        let resp = self.request(SMB2_CREATE, &body, deadline)?;
        if resp.status() != STATUS_SUCCESS {
            return Err(self.status_error(&format!("CREATE pipe '{}'", pipe_name), resp.status()));
        }

        let raw = resp
            .body()
            .get(64..80)
            .ok_or_else(|| TetherError::connection(&self.host, "malformed CREATE response"))?;
        let mut file_id = [0u8; 16];
        file_id.copy_from_slice(raw);
        Ok(file_id)
    }

    fn read_pipe(&self, file_id: &[u8; 16], buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let len = (buf.len() as u32).min(self.max_read);

        let mut body = Vec::with_capacity(49);
        body.extend_from_slice(&49u16.to_le_bytes());
        body.push(0x50); // padding: data follows the 16-byte response body
        body.push(0); // flags
        body.extend_from_slice(&len.to_le_bytes());
        body.extend_from_slice(&0u64.to_le_bytes()); // offset
        body.extend_from_slice(file_id);
        body.extend_from_slice(&1u32.to_le_bytes()); // minimum count
        body.extend_from_slice(&0u32.to_le_bytes()); // channel
        body.extend_from_slice(&0u32.to_le_bytes()); // remaining bytes
        body.extend_from_slice(&0u16.to_le_bytes()); // channel info offset
        body.extend_from_slice(&0u16.to_le_bytes()); // channel info length
        body.push(0);

        let Some(resp) = self.exchange(SMB2_READ, &body)? else {
            return Ok(0);
        };
        match resp.status() {
            STATUS_SUCCESS | STATUS_BUFFER_OVERFLOW => {
                let b = resp.body();
                let offset = b.get(2).copied().unwrap_or(0) as usize;
                let count = le_u32(b, 4).unwrap_or(0) as usize;
                let data = resp.buffer(offset, count).ok_or_else(|| {
                    io::Error::new(io::ErrorKind::InvalidData, "malformed SMB2 READ response")
                })?;
                let n = data.len().min(buf.len());
                buf[..n].copy_from_slice(&data[..n]);
                Ok(n)
            }
            STATUS_END_OF_FILE | STATUS_PIPE_BROKEN | STATUS_PIPE_DISCONNECTED | STATUS_PIPE_CLOSING
            | STATUS_FILE_CLOSED | STATUS_CANCELLED => Ok(0),
            status => Err(io::Error::new(
                io::ErrorKind::Other,
                format!("SMB2 READ failed with status 0x{:08x}", status),
            )),
        }
    }

    fn write_pipe(&self, file_id: &[u8; 16], data: &[u8]) -> io::Result<usize> {
        const FIXED: usize = 48;
        let chunk = &data[..data.len().min(self.max_write as usize)];

        let mut body = Vec::with_capacity(FIXED + chunk.len());
        body.extend_from_slice(&49u16.to_le_bytes());
        body.extend_from_slice(&((HEADER_LEN + FIXED) as u16).to_le_bytes());
        body.extend_from_slice(&(chunk.len() as u32).to_le_bytes());
        body.extend_from_slice(&0u64.to_le_bytes()); // offset
        body.extend_from_slice(file_id);
        body.extend_from_slice(&0u32.to_le_bytes()); // channel
        body.extend_from_slice(&0u32.to_le_bytes()); // remaining bytes
        body.extend_from_slice(&0u16.to_le_bytes()); // channel info offset
        body.extend_from_slice(&0u16.to_le_bytes()); // channel info length
        body.extend_from_slice(&0u32.to_le_bytes()); // flags
        body.extend_from_slice(chunk);

        let resp = self.exchange(SMB2_WRITE, &body)?.ok_or_else(|| {
            io::Error::new(io::ErrorKind::BrokenPipe, "SMB2 connection closed")
        })?;
        match resp.status() {
            STATUS_SUCCESS => Ok(le_u32(resp.body(), 4).unwrap_or(0) as usize),
            STATUS_PIPE_BROKEN
            | STATUS_PIPE_DISCONNECTED
            | STATUS_PIPE_CLOSING
            | STATUS_FILE_CLOSED => {
                Err(io::Error::new(io::ErrorKind::BrokenPipe, "pipe closed by the server"))
            }
            status => Err(io::Error::new(
                io::ErrorKind::Other,
                format!("SMB2 WRITE failed with status 0x{:08x}", status),
            )),
        }
    }

    /// Close the pipe, the tree and the session, then the socket
    fn disconnect(&self, file_id: &[u8; 16]) -> Result<()> {
        let mut close = Vec::with_capacity(24);
        close.extend_from_slice(&24u16.to_le_bytes());
        close.extend_from_slice(&0u16.to_le_bytes()); // flags
        close.extend_from_slice(&0u32.to_le_bytes()); // reserved
        close.extend_from_slice(file_id);
        let short = [4u8, 0, 0, 0];

        for (command, body) in [
            (SMB2_CLOSE, &close[..]),
            (SMB2_TREE_DISCONNECT, &short[..]),
            (SMB2_LOGOFF, &short[..]),
        ] {
            let deadline = Deadline::after(Some(TEARDOWN_TIMEOUT));
            if let Err(e) = self.request(command, body, &deadline) {
                tracing::debug!("SMB2 teardown step {} on {} failed: {}", command, self.host, e);
                break;
            }
        }

        self.shared.shutdown();
        Ok(())
    }
}

impl Drop for Smb2Client {
    fn drop(&mut self) {
        self.shared.shutdown();
    }
}

/// Readable end of the pipe
struct PipeReader {
    client: Arc<Smb2Client>,
    file_id: [u8; 16],
}

impl Read for PipeReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.client.read_pipe(&self.file_id, buf)
    }
}

/// Writable end of the pipe
struct PipeWriter {
    client: Arc<Smb2Client>,
    file_id: [u8; 16],
}

impl Write for PipeWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        self.client.write_pipe(&self.file_id, buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// [`PipeOpener`] using the built-in SMB2 client
#[derive(Debug, Clone, Copy, Default)]
pub struct Smb2Opener;

impl PipeOpener for Smb2Opener {
    fn open(&self, target: &PipeTarget, deadline: &Deadline) -> Result<PipeChannel> {
        let (client, file_id) = Smb2Client::connect(target, deadline)?;

        let reader = PipeReader {
            client: Arc::clone(&client),
            file_id,
        };
        let writer = PipeWriter {
            client: Arc::clone(&client),
            file_id,
        };

        Ok(PipeChannel {
            writer: Box::new(writer),
            reader: Box::new(reader),
            teardown: Box::new(move || client.disconnect(&file_id)),
        })
    }
}
