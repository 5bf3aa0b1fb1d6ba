// Copyright (c) 2017-2024 Rene van der Meer
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

//! Exclusive-access serial ports.
//!
//! [`SerialPort`] drives a serial device (`/dev/ttyS0`, `/dev/ttyUSB0`,
//! `/dev/ttyACM0`, ...) through the termios interface. A port is configured
//! for raw, non-canonical 8-bit communication using the line speed, parity,
//! stop bits and flow control from its [`PortConfig`].
//!
//! ## Exclusive access
//!
//! Opening a port fails with [`Error::AlreadyOpen`] if any process, including
//! the current one, already has the device open. Once opened, the descriptor
//! is put in exclusive mode (`TIOCEXCL`), so further open attempts on the
//! device are rejected by the kernel until the port is closed.
//!
//! ## Read timeouts
//!
//! With a non-zero read timeout, [`read`] waits for incoming data using
//! `poll()`, and returns [`Error::ReadTimeout`] if nothing arrives in time.
//! Without a timeout, [`read`] blocks until at least one byte is available.
//! Calls interrupted by a signal are retried.
//!
//! ## Concurrency
//!
//! `SerialPort` is `Send` and `Sync`. Opening, closing, reconfiguring and
//! timed reads are serialized by an internal lock, so closing the port waits
//! for a timed read in progress. Writes never wait for a read, and reads
//! without a timeout only hold the lock while checking the port is open. One
//! thread can write while another one is blocked on a read. Closing the port
//! while another thread is blocked on a read without a timeout leaves that
//! read waiting on a stale descriptor; use a read timeout if the port needs
//! to be closed from a different thread.
//!
//! [`read`]: SerialPort::read

use std::io;
use std::os::unix::io::RawFd;
use std::path::PathBuf;
use std::result;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use thiserror::Error;
use tracing::{debug, trace};

use crate::config::{Parity, PortConfig};

#[cfg(any(feature = "embedded-hal-0", feature = "embedded-hal-nb"))]
mod hal;
mod sys;
pub mod termios;

pub use self::sys::{retry_interrupted, Backend, Tty};
pub use self::termios::ControlSettings;

/// Errors that can occur when accessing a serial port.
#[derive(Debug, Error)]
pub enum Error {
    /// The operation isn't supported on this platform.
    #[error("not implemented yet")]
    NotImplemented,
    /// The port was never opened, or has already been closed.
    #[error("port not initialized or closed")]
    NotInitialized,
    #[error("port not open")]
    NotOpen,
    /// The device is already held open by a process.
    #[error("port is already open")]
    AlreadyOpen,
    /// The exclusive-access check couldn't determine whether the device is in
    /// use.
    #[error("access denied")]
    AccessDenied,
    /// Reserved for devices that disappear during a read. Zero-length reads are
    /// currently returned as `Ok(0)`.
    #[error("port closed")]
    PortClosed,
    /// No data arrived within the configured read timeout.
    #[error("read port time out")]
    ReadTimeout,
    #[error("invalid or not supported parity: {0}")]
    InvalidParity(String),
    #[error("invalid or not supported stop bits: {0}")]
    InvalidStopBits(u8),
    #[error("invalid or not supported flow control: {0}")]
    InvalidFlowControl(String),
    #[error("unsupported baud rate: {0}")]
    UnsupportedBaudRate(u32),
    /// Requesting or releasing exclusive mode failed.
    #[error("failed to change exclusive access: {0}")]
    ExclusiveAccess(#[source] io::Error),
    /// Waiting for incoming data failed.
    #[error("could not poll: {0}")]
    Poll(#[source] io::Error),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    /// The configuration document couldn't be parsed or serialized.
    #[error("configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Returns `true` for errors caused by an invalid configuration. These are
    /// always detected before the device is touched.
    pub fn is_config_error(&self) -> bool {
        matches!(
            self,
            Error::InvalidParity(_)
                | Error::InvalidStopBits(_)
                | Error::InvalidFlowControl(_)
                | Error::UnsupportedBaudRate(_)
                | Error::Config(_)
        )
    }
}

impl From<Error> for io::Error {
    fn from(err: Error) -> io::Error {
        let kind = match err {
            Error::Io(e) => return e,
            Error::ReadTimeout => io::ErrorKind::TimedOut,
            Error::NotInitialized | Error::NotOpen | Error::PortClosed => {
                io::ErrorKind::NotConnected
            }
            Error::AccessDenied => io::ErrorKind::PermissionDenied,
            Error::NotImplemented => io::ErrorKind::Unsupported,
            ref e if e.is_config_error() => io::ErrorKind::InvalidInput,
            _ => io::ErrorKind::Other,
        };

        io::Error::new(kind, err)
    }
}

/// Result type returned from methods that can have `port::Error`s.
pub type Result<T> = result::Result<T, Error>;

/// Common interface of serial port implementations.
pub trait Port: Send + Sync {
    /// Reads incoming data into `buffer`, returning the number of bytes read.
    fn read(&self, buffer: &mut [u8]) -> Result<usize>;

    /// Writes `buffer` with a single system call, returning the number of
    /// bytes written.
    fn write(&self, buffer: &[u8]) -> Result<usize>;

    fn close(&self) -> Result<()>;

    /// Changes the parity mode and the number of stop bits of an open port.
    fn set_parity(&self, parity: Parity, stop_bits: u8) -> Result<()>;

    /// Discards all waiting data in the input and output queue.
    fn flush(&self) -> Result<()>;
}

#[derive(Debug)]
struct State {
    fd: Option<RawFd>,
    config: PortConfig,
}

/// Provides exclusive access to a serial device.
#[derive(Debug)]
pub struct SerialPort<B: Backend = Tty> {
    backend: B,
    // Serializes reads with each other and with reconfiguration. Always
    // acquired before `state`.
    io_lock: Mutex<()>,
    state: Mutex<State>,
}

/// Opens a serial port with the specified configuration.
pub fn open_port(config: &PortConfig) -> Result<SerialPort> {
    let port = SerialPort::new();
    port.open(config)?;

    Ok(port)
}

impl SerialPort<Tty> {
    /// Constructs a new, unopened `SerialPort`.
    pub fn new() -> SerialPort<Tty> {
        SerialPort::with_backend(Tty)
    }
}

impl Default for SerialPort<Tty> {
    fn default() -> SerialPort<Tty> {
        SerialPort::new()
    }
}

impl<B: Backend> SerialPort<B> {
    /// Constructs a new, unopened `SerialPort` that performs its system calls
    /// through `backend`.
    pub fn with_backend(backend: B) -> SerialPort<B> {
        SerialPort {
            backend,
            io_lock: Mutex::new(()),
            state: Mutex::new(State {
                fd: None,
                config: PortConfig::default(),
            }),
        }
    }

    /// Returns a reference to the backend.
    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Opens the device specified by `config` and applies its line settings.
    ///
    /// If the port is already open, the current device is closed first. The
    /// configuration is validated before any system call is made. If any
    /// step after opening the device fails, the device is closed again and the
    /// port stays closed.
    pub fn open(&self, config: &PortConfig) -> Result<()> {
        let settings = termios::settings_for(config)?;

        let _io = self.io_lock.lock();
        let mut state = self.state.lock();

        if let Some(fd) = state.fd.take() {
            debug!(path = %state.config.path.display(), fd, "closing port before reopening");

            if let Err(e) = self.release(fd) {
                debug!(error = %e, "ignoring error while closing port");
            }
        }

        match self.backend.in_use(&config.path) {
            Ok(false) => (),
            Ok(true) => return Err(Error::AlreadyOpen),
            Err(e) => {
                debug!(path = %config.path.display(), error = %e, "device usage check failed");
                return Err(Error::AccessDenied);
            }
        }

        let fd = self.backend.open(&config.path)?;
        let guard = OpenGuard {
            backend: &self.backend,
            fd,
            armed: true,
        };

        self.backend
            .set_exclusive(fd, true)
            .map_err(Error::ExclusiveAccess)?;
        self.backend.set_attributes(fd, &settings)?;

        // Timeouts are handled through poll(), so reads and writes block.
        self.backend.set_nonblocking(fd, false)?;

        state.fd = Some(guard.disarm());
        state.config = config.clone();

        debug!(
            path = %config.path.display(),
            fd,
            baud_rate = settings.baud_rate().unwrap_or_default(),
            parity = %config.parity,
            stop_bits = settings.stop_bits(),
            flow_control = %config.flow_control,
            "port opened"
        );

        Ok(())
    }

    /// Closes the port.
    ///
    /// Returns [`Error::NotInitialized`] if the port isn't open. The port is
    /// considered closed after `close` returns, even if releasing exclusive
    /// mode or closing the descriptor failed.
    pub fn close(&self) -> Result<()> {
        let _io = self.io_lock.lock();
        let mut state = self.state.lock();
        let fd = state.fd.take().ok_or(Error::NotInitialized)?;

        debug!(path = %state.config.path.display(), fd, "closing port");

        self.release(fd)
    }

    // Releases exclusive mode and closes the descriptor. The descriptor is
    // closed even when releasing exclusive mode fails.
    fn release(&self, fd: RawFd) -> Result<()> {
        if let Err(e) = self.backend.set_exclusive(fd, false) {
            if let Err(close_err) = self.backend.close(fd) {
                debug!(fd, error = %close_err, "ignoring error while closing descriptor");
            }

            return Err(Error::ExclusiveAccess(e));
        }

        self.backend.close(fd)?;

        Ok(())
    }

    /// Returns `true` if the port is open.
    pub fn is_open(&self) -> bool {
        self.state.lock().fd.is_some()
    }

    /// Returns the configuration the port was last opened with, including any
    /// changes made afterwards through [`set_parity`] and
    /// [`set_read_timeout`].
    ///
    /// [`set_parity`]: #method.set_parity
    /// [`set_read_timeout`]: #method.set_read_timeout
    pub fn config(&self) -> PortConfig {
        self.state.lock().config.clone()
    }

    /// Returns the device path.
    pub fn path(&self) -> PathBuf {
        self.state.lock().config.path.clone()
    }

    /// Returns the read timeout. A zero duration means [`read`] blocks until
    /// data arrives.
    ///
    /// [`read`]: #method.read
    pub fn read_timeout(&self) -> Duration {
        self.state.lock().config.read_timeout
    }

    /// Sets the read timeout for subsequent calls to [`read`].
    ///
    /// Switching between a zero and a non-zero timeout also updates the
    /// device's minimum read size.
    ///
    /// [`read`]: #method.read
    pub fn set_read_timeout(&self, timeout: Duration) -> Result<()> {
        let _io = self.io_lock.lock();
        let mut state = self.state.lock();
        let fd = state.fd.ok_or(Error::NotOpen)?;

        if timeout.is_zero() != state.config.read_timeout.is_zero() {
            let mut settings = self.backend.attributes(fd)?;
            termios::apply_read_timeout(&mut settings, timeout);
            self.backend.set_attributes(fd, &settings)?;
        }

        state.config.read_timeout = timeout;

        debug!(fd, ?timeout, "read timeout changed");

        Ok(())
    }

    /// Returns the line settings currently active on the device.
    pub fn settings(&self) -> Result<ControlSettings> {
        let state = self.state.lock();
        let fd = state.fd.ok_or(Error::NotOpen)?;

        Ok(self.backend.attributes(fd)?)
    }

    /// Receives incoming data and stores it in `buffer`.
    ///
    /// With a read timeout configured, `read` waits up to that long for data
    /// to arrive and returns [`Error::ReadTimeout`] if none does. Otherwise
    /// `read` blocks until data is available. A zero-length read, for instance
    /// after the other end of a pseudo-terminal hung up, is returned as
    /// `Ok(0)`.
    ///
    /// Returns how many bytes were read.
    pub fn read(&self, buffer: &mut [u8]) -> Result<usize> {
        let io = self.io_lock.lock();
        let (fd, timeout) = {
            let state = self.state.lock();
            (state.fd.ok_or(Error::NotOpen)?, state.config.read_timeout)
        };

        if timeout.is_zero() {
            drop(io);

            let bytes_read = retry_interrupted(|| self.backend.read(fd, buffer))?;
            trace!(fd, bytes_read, "read");

            return Ok(bytes_read);
        }

        let deadline = Instant::now() + timeout;
        let readable = retry_interrupted(|| {
            self.backend
                .wait_readable(fd, deadline.saturating_duration_since(Instant::now()))
        })
        .map_err(Error::Poll)?;

        if !readable {
            trace!(fd, ?timeout, "read timed out");
            return Err(Error::ReadTimeout);
        }

        let bytes_read = self.backend.read(fd, buffer)?;
        trace!(fd, bytes_read, "read");

        Ok(bytes_read)
    }

    /// Sends the contents of `buffer` to the external device.
    ///
    /// `write` makes a single system call, and may write fewer bytes than
    /// requested. Returns how many bytes were written.
    pub fn write(&self, buffer: &[u8]) -> Result<usize> {
        let fd = self.state.lock().fd.ok_or(Error::NotOpen)?;

        let bytes_written = self.backend.write(fd, buffer)?;
        trace!(fd, bytes_written, "write");

        Ok(bytes_written)
    }

    /// Changes the parity mode and the number of stop bits.
    ///
    /// Only the parity and stop bit settings of the device are modified. The
    /// stored configuration is updated once the device accepts the new
    /// settings.
    pub fn set_parity(&self, parity: Parity, stop_bits: u8) -> Result<()> {
        termios::validate(parity, stop_bits)?;

        let _io = self.io_lock.lock();
        let mut state = self.state.lock();
        let fd = state.fd.ok_or(Error::NotOpen)?;

        let mut settings = self.backend.attributes(fd)?;
        termios::apply_parity(&mut settings, parity)?;
        termios::apply_stop_bits(&mut settings, stop_bits)?;
        self.backend.set_attributes(fd, &settings)?;

        state.config.parity = parity;
        state.config.stop_bits = stop_bits;

        debug!(fd, %parity, stop_bits, "line settings changed");

        Ok(())
    }

    /// Discards all waiting data in the input and output queue.
    pub fn flush(&self) -> Result<()> {
        let state = self.state.lock();
        let fd = state.fd.ok_or(Error::NotOpen)?;

        self.backend.flush(fd)?;

        Ok(())
    }

    /// Blocks until all waiting outgoing data has been transmitted.
    pub fn drain(&self) -> Result<()> {
        let fd = self.state.lock().fd.ok_or(Error::NotOpen)?;

        self.backend.drain(fd)?;

        Ok(())
    }
}

impl<B: Backend> Port for SerialPort<B> {
    fn read(&self, buffer: &mut [u8]) -> Result<usize> {
        SerialPort::read(self, buffer)
    }

    fn write(&self, buffer: &[u8]) -> Result<usize> {
        SerialPort::write(self, buffer)
    }

    fn close(&self) -> Result<()> {
        SerialPort::close(self)
    }

    fn set_parity(&self, parity: Parity, stop_bits: u8) -> Result<()> {
        SerialPort::set_parity(self, parity, stop_bits)
    }

    fn flush(&self) -> Result<()> {
        SerialPort::flush(self)
    }
}

impl<B: Backend> io::Read for SerialPort<B> {
    fn read(&mut self, buffer: &mut [u8]) -> io::Result<usize> {
        Ok(SerialPort::read(self, buffer)?)
    }
}

impl<B: Backend> io::Write for SerialPort<B> {
    fn write(&mut self, buffer: &[u8]) -> io::Result<usize> {
        Ok(SerialPort::write(self, buffer)?)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(SerialPort::drain(self)?)
    }
}

impl<B: Backend> io::Read for &SerialPort<B> {
    fn read(&mut self, buffer: &mut [u8]) -> io::Result<usize> {
        Ok(SerialPort::read(*self, buffer)?)
    }
}

impl<B: Backend> io::Write for &SerialPort<B> {
    fn write(&mut self, buffer: &[u8]) -> io::Result<usize> {
        Ok(SerialPort::write(*self, buffer)?)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(SerialPort::drain(*self)?)
    }
}

impl<B: Backend> Drop for SerialPort<B> {
    fn drop(&mut self) {
        if let Some(fd) = self.state.get_mut().fd.take() {
            if let Err(e) = self.release(fd) {
                debug!(fd, error = %e, "ignoring error while closing port");
            }
        }
    }
}

// Closes a freshly opened descriptor unless setup completes.
struct OpenGuard<'a, B: Backend> {
    backend: &'a B,
    fd: RawFd,
    armed: bool,
}

impl<B: Backend> OpenGuard<'_, B> {
    fn disarm(mut self) -> RawFd {
        self.armed = false;
        self.fd
    }
}

impl<B: Backend> Drop for OpenGuard<'_, B> {
    fn drop(&mut self) {
        if self.armed {
            debug!(fd = self.fd, "port setup failed, closing descriptor");

            if let Err(e) = self.backend.close(self.fd) {
                debug!(fd = self.fd, error = %e, "ignoring error while closing descriptor");
            }
        }
    }
}
