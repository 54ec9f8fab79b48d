//! Native named-pipe strategy (Windows only)
//!
//! Authenticates with `WNetAddConnection2W` against the host's `IPC$`
//! share, then opens `\\host\pipe\<name>` for overlapped I/O so a blocked
//! read on one thread does not serialize writes from another.

use super::{PipeChannel, PipeOpener, PipeTarget};
use crate::deadline::Deadline;
use crate::error::{Result, TetherError};
use std::ffi::OsStr;
use std::io::{self, Read, Write};
use std::iter::once;
use std::os::windows::ffi::OsStrExt;
use std::ptr;
use std::sync::Arc;
use windows_sys::Win32::Foundation::{
    CloseHandle, GetLastError, BOOL, ERROR_ACCESS_DENIED, ERROR_BAD_NETPATH, ERROR_BAD_PROVIDER,
    ERROR_BROKEN_PIPE, ERROR_FILE_NOT_FOUND, ERROR_IO_PENDING, ERROR_LOGON_FAILURE,
    ERROR_MORE_DATA, ERROR_NO_NETWORK, ERROR_NO_NET_OR_BAD_PATH, ERROR_PIPE_BUSY,
    ERROR_PIPE_NOT_CONNECTED, ERROR_SESSION_CREDENTIAL_CONFLICT, GENERIC_READ, GENERIC_WRITE,
    HANDLE, INVALID_HANDLE_VALUE, NO_ERROR,
};
use windows_sys::Win32::NetworkManagement::WNet::{
    WNetAddConnection2W, WNetCancelConnection2W, NETRESOURCEW, RESOURCETYPE_ANY,
};
use windows_sys::Win32::Storage::FileSystem::{
    CreateFileW, ReadFile, WriteFile, FILE_FLAG_OVERLAPPED, OPEN_EXISTING,
};
use windows_sys::Win32::System::Threading::CreateEventW;
use windows_sys::Win32::System::IO::{GetOverlappedResult, OVERLAPPED};

fn wide(s: &str) -> Vec<u16> {
    OsStr::new(s).encode_wide().chain(once(0)).collect()
}

/// Owned kernel handle
struct OwnedHandle(HANDLE);

// SAFETY: pipe and event handles may be used from any thread; overlapped
// operations carry their own OVERLAPPED and event.
unsafe impl Send for OwnedHandle {}
unsafe impl Sync for OwnedHandle {}

impl Drop for OwnedHandle {
    fn drop(&mut self) {
        // SAFETY: the handle is owned and closed exactly once
        unsafe {
            CloseHandle(self.0);
        }
    }
}

/// Run one overlapped operation to completion
fn overlapped(
    pipe: &OwnedHandle,
    start: impl FnOnce(*mut OVERLAPPED) -> BOOL,
) -> io::Result<usize> {
    // SAFETY: manual-reset, unsignalled, unnamed event
    let event = unsafe { CreateEventW(ptr::null(), 1, 0, ptr::null()) };
    if event.is_null() {
        return Err(io::Error::last_os_error());
    }
    let event = OwnedHandle(event);

    // SAFETY: all-zero is a valid OVERLAPPED
    let mut ov: OVERLAPPED = unsafe { std::mem::zeroed() };
    ov.hEvent = event.0;

    if start(&mut ov) == 0 {
        // SAFETY: plain thread-local error read
        let err = unsafe { GetLastError() };
        if err != ERROR_IO_PENDING && err != ERROR_MORE_DATA {
            return Err(io::Error::from_raw_os_error(err as i32));
        }
    }

    let mut transferred = 0u32;
    // SAFETY: `ov` stays alive and pinned until the wait returns
    let ok = unsafe { GetOverlappedResult(pipe.0, &ov, &mut transferred, 1) };
    if ok == 0 {
        // SAFETY: plain thread-local error read
        let err = unsafe { GetLastError() };
        if err == ERROR_MORE_DATA {
            return Ok(transferred as usize);
        }
        return Err(io::Error::from_raw_os_error(err as i32));
    }
    Ok(transferred as usize)
}

fn is_disconnect(err: &io::Error) -> bool {
    matches!(
        err.raw_os_error().map(|code| code as u32),
        Some(ERROR_BROKEN_PIPE) | Some(ERROR_PIPE_NOT_CONNECTED)
    )
}

struct Win32PipeReader(Arc<OwnedHandle>);

impl Read for Win32PipeReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let len = buf.len().min(u32::MAX as usize) as u32;
        let pipe = &self.0;
        // SAFETY: `buf` outlives the operation, which completes before return
        let result = overlapped(pipe, |ov| unsafe {
            ReadFile(pipe.0, buf.as_mut_ptr(), len, ptr::null_mut(), ov)
        });
        match result {
            Err(e) if is_disconnect(&e) => Ok(0),
            other => other,
        }
    }
}

struct Win32PipeWriter(Arc<OwnedHandle>);

impl Write for Win32PipeWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let len = buf.len().min(u32::MAX as usize) as u32;
        let pipe = &self.0;
        // SAFETY: `buf` outlives the operation, which completes before return
        overlapped(pipe, |ov| unsafe {
            WriteFile(pipe.0, buf.as_ptr(), len, ptr::null_mut(), ov)
        })
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Authenticated connection to a host's `IPC$` share
struct ShareSession {
    share: Vec<u16>,
    /// Added by us, so ours to cancel
    owned: bool,
}

/// Decide whether an `IPC$` session someone else opened may be used.
///
/// Windows allows one set of credentials per server, so the caller's
/// password cannot take effect while another session exists.
fn reuse_existing(target: &PipeTarget, share_name: &str) -> Result<()> {
    if target.password.is_some() {
        return Err(TetherError::auth(
            &target.username,
            &target.host,
            format!("an existing session to {} holds different credentials", share_name),
        ));
    }
    tracing::warn!(
        "Reusing an existing session to {}; its credentials apply instead of {}",
        share_name,
        target.username
    );
    Ok(())
}

impl ShareSession {
    fn add(target: &PipeTarget) -> Result<Self> {
        let share_name = format!(r"\\{}\IPC$", target.host);
        let mut share = wide(&share_name);
        let user = if target.domain.is_empty() {
            target.username.clone()
        } else {
            format!(r"{}\{}", target.domain, target.username)
        };
        let user = wide(&user);
        let password = target.password.as_deref().map(wide);

        // SAFETY: all-zero is a valid NETRESOURCEW
        let mut resource: NETRESOURCEW = unsafe { std::mem::zeroed() };
        resource.dwType = RESOURCETYPE_ANY;
        resource.lpRemoteName = share.as_mut_ptr();

        // SAFETY: every pointer refers to a live NUL-terminated buffer
        let status = unsafe {
            WNetAddConnection2W(
                &resource,
                password.as_ref().map_or(ptr::null(), |p| p.as_ptr()),
                user.as_ptr(),
                0,
            )
        };

        match status {
            NO_ERROR => Ok(Self { share, owned: true }),
            ERROR_SESSION_CREDENTIAL_CONFLICT => {
                reuse_existing(target, &share_name)?;
                Ok(Self { share, owned: false })
            }
            ERROR_LOGON_FAILURE | ERROR_ACCESS_DENIED => Err(TetherError::auth(
                &target.username,
                &target.host,
                format!("logon to {} refused (error {})", share_name, status),
            )),
            ERROR_NO_NETWORK | ERROR_BAD_PROVIDER | ERROR_NO_NET_OR_BAD_PATH => {
                Err(TetherError::unavailable(
                    "smb",
                    format!("Windows networking unavailable (error {})", status),
                ))
            }
            ERROR_BAD_NETPATH => {
                Err(TetherError::connection(&target.host, "network path not found"))
            }
            _ => Err(TetherError::connection(
                &target.host,
                format!("connecting to {} failed (error {})", share_name, status),
            )),
        }
    }
}

impl Drop for ShareSession {
    fn drop(&mut self) {
        if !self.owned {
            return;
        }
        // SAFETY: NUL-terminated share name
        unsafe {
            WNetCancelConnection2W(self.share.as_ptr(), 0, 0);
        }
    }
}

/// [`PipeOpener`] using the Win32 API
#[derive(Debug, Clone, Copy, Default)]
pub struct Win32PipeOpener;

impl PipeOpener for Win32PipeOpener {
    fn open(&self, target: &PipeTarget, deadline: &Deadline) -> Result<PipeChannel> {
        deadline.check(&target.host)?;
        let session = ShareSession::add(target)?;
        deadline.check(&target.host)?;

        let path = format!(r"\\{}\pipe\{}", target.host, target.pipe_name.trim_start_matches('\\'));
        let wide_path = wide(&path);
        // SAFETY: NUL-terminated path, no security attributes or template
        let handle = unsafe {
            CreateFileW(
                wide_path.as_ptr(),
                GENERIC_READ | GENERIC_WRITE,
                0,
                ptr::null(),
                OPEN_EXISTING,
                FILE_FLAG_OVERLAPPED,
                ptr::null_mut(),
            )
        };
        if handle == INVALID_HANDLE_VALUE {
            // SAFETY: plain thread-local error read
            let err = unsafe { GetLastError() };
            let host = &target.host;
            return Err(match err {
                ERROR_FILE_NOT_FOUND => {
                    TetherError::connection(host, format!("no such pipe {}", path))
                }
                ERROR_PIPE_BUSY => TetherError::connection(host, format!("pipe {} is busy", path)),
                ERROR_ACCESS_DENIED => TetherError::auth(
                    &target.username,
                    &target.host,
                    format!("access to {} denied", path),
                ),
                _ => TetherError::connection(
                    host,
                    format!("opening {} failed (error {})", path, err),
                ),
            });
        }

        tracing::info!("Opened pipe {} with the Win32 API", path);
        let pipe = Arc::new(OwnedHandle(handle));

        Ok(PipeChannel {
            writer: Box::new(Win32PipeWriter(Arc::clone(&pipe))),
            reader: Box::new(Win32PipeReader(pipe)),
            teardown: Box::new(move || {
                drop(session);
                Ok(())
            }),
        })
    }
}
