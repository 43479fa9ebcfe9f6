//! PTY channel using portable-pty.
//!
//! Opens a pseudo-terminal pair and exposes the master side as a
//! [`Terminal`]: bounded waits for output, non-blocking reads, writes and
//! window-size changes.

use portable_pty::{native_pty_system, MasterPty, PtySize, SlavePty};
use std::io::{self, Read, Write};
use std::os::fd::RawFd;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use termvisor_core::{SupervisorError, SupervisorResult};
use tracing::debug;

/// The master side of a session's pseudo-terminal.
///
/// All methods take `&self` so the handle can be shared between the
/// controller and the output pump.
pub trait Terminal: Send + Sync {
    /// Wait up to `timeout` for output. `Ok(false)` means the wait timed out.
    fn wait_readable(&self, timeout: Duration) -> SupervisorResult<bool>;

    /// Read whatever output is available without blocking.
    ///
    /// `Ok(0)` means nothing is pending; a closed channel is
    /// [`SupervisorError::ChannelClosed`].
    fn read(&self, buf: &mut [u8]) -> SupervisorResult<usize>;

    /// Forward input to the child.
    fn write(&self, data: &[u8]) -> SupervisorResult<()>;

    /// Update the window size. Returns `false` when the size is unchanged.
    fn resize(&self, rows: u16, cols: u16) -> SupervisorResult<bool>;

    /// Current window size as `(rows, cols)`.
    fn size(&self) -> (u16, u16);

    /// Read up to `buf.len()` bytes, returning 0 if nothing arrives within
    /// `timeout`.
    fn read_timeout(&self, buf: &mut [u8], timeout: Duration) -> SupervisorResult<usize> {
        if !self.wait_readable(timeout)? {
            return Ok(0);
        }
        self.read(buf)
    }
}

/// A managed PTY master.
pub struct PtyTerminal {
    /// Kept for resize (Mutex because MasterPty is not Sync).
    master: Mutex<Box<dyn MasterPty + Send>>,
    reader: Mutex<Box<dyn Read + Send>>,
    writer: Mutex<Box<dyn Write + Send>>,
    /// Raw master descriptor used for polling.
    fd: RawFd,
    size: Mutex<PtySize>,
}

/// Allocate a PTY pair with the given window size.
///
/// The slave side is returned separately so the launcher can spawn the
/// worker on it and then drop it.
pub fn open(rows: u16, cols: u16) -> SupervisorResult<(PtyTerminal, Box<dyn SlavePty + Send>)> {
    let size = PtySize {
        rows,
        cols,
        pixel_width: 0,
        pixel_height: 0,
    };

    let pair = native_pty_system()
        .openpty(size)
        .map_err(|e| SupervisorError::ResourceExhausted(format!("failed to open PTY: {e}")))?;

    let fd = pair
        .master
        .as_raw_fd()
        .ok_or_else(|| SupervisorError::ResourceExhausted("PTY master has no descriptor".into()))?;
    set_non_blocking(fd)?;

    let reader = pair
        .master
        .try_clone_reader()
        .map_err(|e| SupervisorError::ResourceExhausted(format!("failed to clone PTY reader: {e}")))?;
    let writer = pair
        .master
        .take_writer()
        .map_err(|e| SupervisorError::ResourceExhausted(format!("failed to take PTY writer: {e}")))?;

    debug!(rows, cols, "PTY opened");

    let terminal = PtyTerminal {
        master: Mutex::new(pair.master),
        reader: Mutex::new(reader),
        writer: Mutex::new(writer),
        fd,
        size: Mutex::new(size),
    };
    Ok((terminal, pair.slave))
}

impl Terminal for PtyTerminal {
    fn wait_readable(&self, timeout: Duration) -> SupervisorResult<bool> {
        let mut pollfd = libc::pollfd {
            fd: self.fd,
            events: libc::POLLIN,
            revents: 0,
        };
        let timeout_ms = timeout.as_millis().min(i32::MAX as u128) as i32;

        let result = unsafe { libc::poll(&mut pollfd, 1, timeout_ms) };
        if result < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(false);
            }
            return Err(SupervisorError::Io(err));
        }
        if result == 0 {
            return Ok(false);
        }
        if pollfd.revents & libc::POLLNVAL != 0 {
            return Err(SupervisorError::ChannelClosed);
        }
        // POLLHUP/POLLERR count as readable so the next read reports the
        // closed channel instead of spinning on poll.
        Ok(pollfd.revents & (libc::POLLIN | libc::POLLHUP | libc::POLLERR) != 0)
    }

    fn read(&self, buf: &mut [u8]) -> SupervisorResult<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let mut reader = lock_or_recover(&self.reader);
        loop {
            match reader.read(buf) {
                Ok(0) => return Err(SupervisorError::ChannelClosed),
                Ok(n) => return Ok(n),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(0),
                Err(e) => return Err(map_closed(e)),
            }
        }
    }

    fn write(&self, data: &[u8]) -> SupervisorResult<()> {
        if data.is_empty() {
            return Ok(());
        }
        let mut writer = lock_or_recover(&self.writer);
        let mut offset = 0;
        while offset < data.len() {
            match writer.write(&data[offset..]) {
                Ok(0) => return Err(SupervisorError::ChannelClosed),
                Ok(n) => offset += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => wait_writable(self.fd)?,
                Err(e) => return Err(map_closed(e)),
            }
        }
        writer.flush().map_err(map_closed)
    }

    fn resize(&self, rows: u16, cols: u16) -> SupervisorResult<bool> {
        let mut size = lock_or_recover(&self.size);
        if size.rows == rows && size.cols == cols {
            return Ok(false);
        }
        let next = PtySize {
            rows,
            cols,
            pixel_width: 0,
            pixel_height: 0,
        };
        lock_or_recover(&self.master)
            .resize(next)
            .map_err(|e| SupervisorError::Other(format!("PTY resize failed: {e}")))?;
        *size = next;
        debug!(rows, cols, "PTY resized");
        Ok(true)
    }

    fn size(&self) -> (u16, u16) {
        let size = lock_or_recover(&self.size);
        (size.rows, size.cols)
    }
}

fn lock_or_recover<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// EIO and EPIPE are how a PTY reports that the child side is gone.
fn map_closed(e: io::Error) -> SupervisorError {
    match e.raw_os_error() {
        Some(libc::EIO) | Some(libc::EPIPE) | Some(libc::EBADF) => SupervisorError::ChannelClosed,
        _ if e.kind() == io::ErrorKind::BrokenPipe => SupervisorError::ChannelClosed,
        _ => SupervisorError::Io(e),
    }
}

fn set_non_blocking(fd: RawFd) -> SupervisorResult<()> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(SupervisorError::Io(io::Error::last_os_error()));
    }
    if flags & libc::O_NONBLOCK != 0 {
        return Ok(());
    }
    let result = unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) };
    if result < 0 {
        return Err(SupervisorError::Io(io::Error::last_os_error()));
    }
    Ok(())
}

fn wait_writable(fd: RawFd) -> SupervisorResult<()> {
    let mut pollfd = libc::pollfd {
        fd,
        events: libc::POLLOUT,
        revents: 0,
    };
    let result = unsafe { libc::poll(&mut pollfd, 1, 1000) };
    if result < 0 {
        return Err(SupervisorError::Io(io::Error::last_os_error()));
    }
    if pollfd.revents & (libc::POLLERR | libc::POLLHUP | libc::POLLNVAL) != 0 {
        return Err(SupervisorError::ChannelClosed);
    }
    Ok(())
}
