// Copyright (c) 2024 The ttyport Developers
//
// Permission is hereby granted, free of charge, to any person obtaining a
// copy of this software and associated documentation files (the "Software"),
// to deal in the Software without restriction, including without limitation
// the rights to use, copy, modify, merge, publish, distribute, sublicense,
// and/or sell copies of the Software, and to permit persons to whom the
// Software is furnished to do so, subject to the following conditions:
//
// The above copyright notice and this permission notice shall be included in
// all copies or substantial portions of the Software.
//
// THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
// IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
// FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL
// THE AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
// LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING
// FROM, OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER
// DEALINGS IN THE SOFTWARE.

//! Operating system layer.
//!
//! Every system call made by [`SerialPort`] goes through the [`Backend`]
//! trait. [`Tty`] implements it on top of libc. Tests substitute
//! [`MockBackend`], which keeps the device in memory and records each call.
//!
//! [`SerialPort`]: super::SerialPort
//! [`MockBackend`]: crate::mock::MockBackend

use std::fmt;
use std::fs::OpenOptions;
use std::io;
use std::mem;
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::{IntoRawFd, RawFd};
use std::path::Path;
use std::time::Duration;

use libc::{c_int, c_void, termios};
use libc::{O_EXCL, O_NOCTTY, O_NONBLOCK};
use libc::{POLLERR, POLLHUP, POLLIN, POLLNVAL, TCIOFLUSH, TCSANOW};

use super::termios::ControlSettings;

/// System calls used to drive a serial device.
///
/// Implementations are expected to map a failing call to the `io::Error`
/// reported by the OS. Interrupted calls must be reported as
/// `io::ErrorKind::Interrupted`, so the caller can retry them.
pub trait Backend: fmt::Debug + Send + Sync {
    /// Returns `true` if any process currently holds `path` open.
    fn in_use(&self, path: &Path) -> io::Result<bool>;

    /// Opens `path` for reading and writing without making it the
    /// controlling terminal. The descriptor starts out in non-blocking mode.
    fn open(&self, path: &Path) -> io::Result<RawFd>;

    /// Enables or disables exclusive mode (`TIOCEXCL`/`TIOCNXCL`).
    fn set_exclusive(&self, fd: RawFd, exclusive: bool) -> io::Result<()>;

    fn attributes(&self, fd: RawFd) -> io::Result<ControlSettings>;

    fn set_attributes(&self, fd: RawFd, settings: &ControlSettings) -> io::Result<()>;

    fn set_nonblocking(&self, fd: RawFd, nonblocking: bool) -> io::Result<()>;

    /// Waits up to `timeout` for incoming data. Returns `false` if the timeout
    /// elapsed first.
    fn wait_readable(&self, fd: RawFd, timeout: Duration) -> io::Result<bool>;

    fn read(&self, fd: RawFd, buffer: &mut [u8]) -> io::Result<usize>;

    fn write(&self, fd: RawFd, buffer: &[u8]) -> io::Result<usize>;

    /// Discards all waiting data in the input and output queue.
    fn flush(&self, fd: RawFd) -> io::Result<()>;

    /// Blocks until all waiting outgoing data has been transmitted.
    fn drain(&self, fd: RawFd) -> io::Result<()>;

    fn close(&self, fd: RawFd) -> io::Result<()>;
}

/// Repeats `op` for as long as it fails with `io::ErrorKind::Interrupted`.
pub fn retry_interrupted<T, F>(mut op: F) -> io::Result<T>
where
    F: FnMut() -> io::Result<T>,
{
    loop {
        match op() {
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {
                tracing::trace!("system call interrupted, retrying");
            }
            result => return result,
        }
    }
}

/// libc implementation of [`Backend`].
#[derive(Debug, Default, Clone, Copy)]
pub struct Tty;

impl Tty {
    fn termios(fd: RawFd) -> io::Result<termios> {
        let mut attr: termios = unsafe { mem::zeroed() };
        parse_retval!(unsafe { libc::tcgetattr(fd, &mut attr) })?;

        Ok(attr)
    }
}

impl Backend for Tty {
    #[cfg(any(target_os = "linux", target_os = "android"))]
    fn in_use(&self, path: &Path) -> io::Result<bool> {
        proc_fd::in_use(path)
    }

    #[cfg(not(any(target_os = "linux", target_os = "android")))]
    fn in_use(&self, path: &Path) -> io::Result<bool> {
        lsof::in_use(path)
    }

    fn open(&self, path: &Path) -> io::Result<RawFd> {
        // O_NONBLOCK keeps open() from waiting on the carrier detect line.
        // Blocking mode is restored once the line settings are applied.
        let device = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(O_NOCTTY | O_NONBLOCK | O_EXCL)
            .open(path)?;

        Ok(device.into_raw_fd())
    }

    fn set_exclusive(&self, fd: RawFd, exclusive: bool) -> io::Result<()> {
        let request = if exclusive {
            libc::TIOCEXCL
        } else {
            libc::TIOCNXCL
        };

        parse_retval!(unsafe { libc::ioctl(fd, request as _) })?;

        Ok(())
    }

    fn attributes(&self, fd: RawFd) -> io::Result<ControlSettings> {
        Ok(ControlSettings::from_termios(&Tty::termios(fd)?))
    }

    fn set_attributes(&self, fd: RawFd, settings: &ControlSettings) -> io::Result<()> {
        let mut attr = Tty::termios(fd)?;
        settings.apply_to(&mut attr)?;

        parse_retval!(unsafe { libc::tcsetattr(fd, TCSANOW, &attr) })?;

        Ok(())
    }

    fn set_nonblocking(&self, fd: RawFd, nonblocking: bool) -> io::Result<()> {
        let flags = parse_retval!(unsafe { libc::fcntl(fd, libc::F_GETFL) })?;
        let flags = if nonblocking {
            flags | O_NONBLOCK
        } else {
            flags & !O_NONBLOCK
        };

        parse_retval!(unsafe { libc::fcntl(fd, libc::F_SETFL, flags) })?;

        Ok(())
    }

    fn wait_readable(&self, fd: RawFd, timeout: Duration) -> io::Result<bool> {
        let mut pollfd = libc::pollfd {
            fd,
            events: POLLIN,
            revents: 0,
        };

        let ready = parse_retval!(unsafe { libc::poll(&mut pollfd, 1, poll_timeout(timeout)) })?;

        // The descriptor was closed while waiting.
        if pollfd.revents & POLLNVAL != 0 {
            return Err(io::Error::from_raw_os_error(libc::EBADF));
        }

        // A hangup or error also counts as readable, so the following read()
        // can report it.
        Ok(ready > 0 && (pollfd.revents & (POLLIN | POLLHUP | POLLERR)) != 0)
    }

    fn read(&self, fd: RawFd, buffer: &mut [u8]) -> io::Result<usize> {
        let bytes_read = parse_retval!(unsafe {
            libc::read(fd, buffer.as_mut_ptr() as *mut c_void, buffer.len())
        })?;

        Ok(bytes_read.max(0) as usize)
    }

    fn write(&self, fd: RawFd, buffer: &[u8]) -> io::Result<usize> {
        let bytes_written = parse_retval!(unsafe {
            libc::write(fd, buffer.as_ptr() as *const c_void, buffer.len())
        })?;

        Ok(bytes_written.max(0) as usize)
    }

    fn flush(&self, fd: RawFd) -> io::Result<()> {
        parse_retval!(unsafe { libc::tcflush(fd, TCIOFLUSH) })?;

        Ok(())
    }

    fn drain(&self, fd: RawFd) -> io::Result<()> {
        parse_retval!(unsafe { libc::tcdrain(fd) })?;

        Ok(())
    }

    fn close(&self, fd: RawFd) -> io::Result<()> {
        parse_retval!(unsafe { libc::close(fd) })?;

        Ok(())
    }
}

// Converts a timeout to poll() milliseconds, rounding up so a sub-millisecond
// timeout still waits.
fn poll_timeout(timeout: Duration) -> c_int {
    let millis = (timeout.as_nanos() + 999_999) / 1_000_000;

    millis.min(c_int::MAX as u128) as c_int
}

#[cfg(any(target_os = "linux", target_os = "android"))]
mod proc_fd {
    use std::fs;
    use std::io;
    use std::path::Path;

    // Walks /proc/<pid>/fd looking for a descriptor that links to the
    // device. Processes we aren't allowed to inspect are skipped.
    pub fn in_use(path: &Path) -> io::Result<bool> {
        let target = fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf());

        for entry in fs::read_dir("/proc")? {
            let entry = entry?;

            let is_pid = entry
                .file_name()
                .to_str()
                .map_or(false, |name| name.bytes().all(|b| b.is_ascii_digit()));
            if !is_pid {
                continue;
            }

            let fds = match fs::read_dir(entry.path().join("fd")) {
                Ok(fds) => fds,
                Err(_) => continue,
            };

            for fd in fds.flatten() {
                if let Ok(link) = fs::read_link(fd.path()) {
                    if link == target {
                        return Ok(true);
                    }
                }
            }
        }

        Ok(false)
    }
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
mod lsof {
    use std::io;
    use std::path::Path;
    use std::process::{Command, Stdio};

    // lsof exits with 0 when it lists at least one process, and with 1 when
    // the file isn't open anywhere.
    pub fn in_use(path: &Path) -> io::Result<bool> {
        let status = Command::new("lsof")
            .arg("-t")
            .arg(path)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()?;

        match status.code() {
            Some(0) => Ok(true),
            Some(1) => Ok(false),
            _ => Err(io::Error::new(
                io::ErrorKind::Other,
                format!("lsof failed: {}", status),
            )),
        }
    }
}
