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

//! In-memory backend for testing code that uses [`SerialPort`].
//!
//! [`MockBackend`] simulates a serial device without touching the operating
//! system. Incoming data is queued with [`push_read`], outgoing data is
//! collected and available through [`written`], and every system call is
//! recorded so tests can verify what the port did. Individual calls can be
//! made to fail or to report an interrupted system call.
//!
//! `MockBackend` is cheaply cloneable. All clones share the same device, so
//! a test can keep one clone while the port owns another.
//!
//! ```
//! use ttyport::mock::{Call, MockBackend};
//! use ttyport::{PortConfig, SerialPort};
//!
//! let backend = MockBackend::new();
//! let port = SerialPort::with_backend(backend.clone());
//! port.open(&PortConfig::new("/dev/ttyUSB0").with_baud_rate(9_600))?;
//!
//! assert_eq!(port.write(b"AT\r\n")?, 4);
//! assert_eq!(backend.written(), b"AT\r\n".to_vec());
//!
//! port.close()?;
//! assert_eq!(backend.count(|call| matches!(call, Call::Close(_))), 1);
//! # Ok::<(), ttyport::Error>(())
//! ```
//!
//! [`SerialPort`]: crate::SerialPort
//! [`push_read`]: MockBackend::push_read
//! [`written`]: MockBackend::written

use std::collections::VecDeque;
use std::io;
use std::os::unix::io::RawFd;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;

use crate::port::{Backend, ControlSettings};

// Descriptors handed out by the mock start here, well clear of stdio.
const FIRST_FD: RawFd = 100;

/// A system call made through [`MockBackend`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    InUse(PathBuf),
    Open(PathBuf),
    SetExclusive(RawFd, bool),
    Attributes(RawFd),
    SetAttributes(RawFd),
    SetNonblocking(RawFd, bool),
    WaitReadable(RawFd),
    Read(RawFd),
    Write(RawFd, usize),
    Flush(RawFd),
    Drain(RawFd),
    Close(RawFd),
}

/// Calls that can be made to fail with [`MockBackend::fail`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Failure {
    /// The device usage check can't be performed.
    InUse,
    Open,
    /// Requesting exclusive mode.
    Exclusive,
    /// Releasing exclusive mode.
    ReleaseExclusive,
    SetAttributes,
    SetNonblocking,
    WaitReadable,
    Read,
    Write,
    Flush,
    Close,
}

#[derive(Debug)]
struct MockState {
    calls: Vec<Call>,
    next_fd: RawFd,
    open_fds: Vec<RawFd>,
    exclusive: bool,
    nonblocking: bool,
    settings: Option<ControlSettings>,
    held_elsewhere: bool,
    failures: Vec<Failure>,
    interrupts: usize,
    read_queue: VecDeque<u8>,
    write_log: Vec<u8>,
    flushed: usize,
}

impl Default for MockState {
    fn default() -> MockState {
        MockState {
            calls: Vec::new(),
            next_fd: FIRST_FD,
            open_fds: Vec::new(),
            exclusive: false,
            nonblocking: false,
            settings: None,
            held_elsewhere: false,
            failures: Vec::new(),
            interrupts: 0,
            read_queue: VecDeque::new(),
            write_log: Vec::new(),
            flushed: 0,
        }
    }
}

impl MockState {
    fn check(&self, failure: Failure) -> io::Result<()> {
        if self.failures.contains(&failure) {
            Err(io::Error::new(
                io::ErrorKind::Other,
                format!("simulated {:?} failure", failure),
            ))
        } else {
            Ok(())
        }
    }

    fn check_fd(&self, fd: RawFd) -> io::Result<()> {
        if self.open_fds.contains(&fd) {
            Ok(())
        } else {
            Err(io::Error::from_raw_os_error(libc::EBADF))
        }
    }

    fn interrupted(&mut self) -> bool {
        if self.interrupts > 0 {
            self.interrupts -= 1;
            true
        } else {
            false
        }
    }
}

/// Simulated serial device implementing [`Backend`].
#[derive(Debug, Clone, Default)]
pub struct MockBackend {
    state: Arc<Mutex<MockState>>,
}

impl MockBackend {
    pub fn new() -> MockBackend {
        MockBackend::default()
    }

    /// Queues `data` to be returned by subsequent reads.
    pub fn push_read(&self, data: &[u8]) {
        self.state.lock().read_queue.extend(data);
    }

    /// Returns all data written so far.
    pub fn written(&self) -> Vec<u8> {
        self.state.lock().write_log.clone()
    }

    /// Returns the number of bytes still waiting to be read.
    pub fn pending(&self) -> usize {
        self.state.lock().read_queue.len()
    }

    /// Simulates another process holding the device open.
    pub fn set_held_elsewhere(&self, held: bool) {
        self.state.lock().held_elsewhere = held;
    }

    /// Makes every subsequent `failure` call fail.
    pub fn fail(&self, failure: Failure) {
        let mut state = self.state.lock();
        if !state.failures.contains(&failure) {
            state.failures.push(failure);
        }
    }

    /// Removes all simulated failures.
    pub fn clear_failures(&self) {
        self.state.lock().failures.clear();
    }

    /// Makes the next `count` reads or readiness waits fail with
    /// `io::ErrorKind::Interrupted`.
    pub fn interrupt(&self, count: usize) {
        self.state.lock().interrupts = count;
    }

    /// Returns every recorded call, oldest first.
    pub fn calls(&self) -> Vec<Call> {
        self.state.lock().calls.clone()
    }

    /// Returns the number of recorded calls matching `predicate`.
    pub fn count<F: Fn(&Call) -> bool>(&self, predicate: F) -> usize {
        self.state.lock().calls.iter().filter(|call| predicate(call)).count()
    }

    pub fn clear_calls(&self) {
        self.state.lock().calls.clear();
    }

    /// Returns the descriptors currently open.
    pub fn open_descriptors(&self) -> Vec<RawFd> {
        self.state.lock().open_fds.clone()
    }

    /// Returns `true` if the device is in exclusive mode.
    pub fn is_exclusive(&self) -> bool {
        self.state.lock().exclusive
    }

    /// Returns `true` if the last descriptor was switched to non-blocking mode.
    pub fn is_nonblocking(&self) -> bool {
        self.state.lock().nonblocking
    }

    /// Returns the line settings last applied to the device.
    pub fn settings(&self) -> Option<ControlSettings> {
        self.state.lock().settings
    }

    /// Returns how many times the queues were flushed.
    pub fn flush_count(&self) -> usize {
        self.state.lock().flushed
    }
}

impl Backend for MockBackend {
    fn in_use(&self, path: &Path) -> io::Result<bool> {
        let mut state = self.state.lock();
        state.calls.push(Call::InUse(path.to_path_buf()));
        state.check(Failure::InUse)?;

        Ok(state.held_elsewhere || !state.open_fds.is_empty())
    }

    fn open(&self, path: &Path) -> io::Result<RawFd> {
        let mut state = self.state.lock();
        state.calls.push(Call::Open(path.to_path_buf()));
        state.check(Failure::Open)?;

        if state.exclusive {
            return Err(io::Error::from_raw_os_error(libc::EBUSY));
        }

        let fd = state.next_fd;
        state.next_fd += 1;
        state.open_fds.push(fd);
        state.nonblocking = true;

        Ok(fd)
    }

    fn set_exclusive(&self, fd: RawFd, exclusive: bool) -> io::Result<()> {
        let mut state = self.state.lock();
        state.calls.push(Call::SetExclusive(fd, exclusive));
        state.check_fd(fd)?;
        state.check(if exclusive {
            Failure::Exclusive
        } else {
            Failure::ReleaseExclusive
        })?;

        state.exclusive = exclusive;

        Ok(())
    }

    fn attributes(&self, fd: RawFd) -> io::Result<ControlSettings> {
        let mut state = self.state.lock();
        state.calls.push(Call::Attributes(fd));
        state.check_fd(fd)?;

        state
            .settings
            .ok_or_else(|| io::Error::from_raw_os_error(libc::ENOTTY))
    }

    fn set_attributes(&self, fd: RawFd, settings: &ControlSettings) -> io::Result<()> {
        let mut state = self.state.lock();
        state.calls.push(Call::SetAttributes(fd));
        state.check_fd(fd)?;
        state.check(Failure::SetAttributes)?;

        state.settings = Some(*settings);

        Ok(())
    }

    fn set_nonblocking(&self, fd: RawFd, nonblocking: bool) -> io::Result<()> {
        let mut state = self.state.lock();
        state.calls.push(Call::SetNonblocking(fd, nonblocking));
        state.check_fd(fd)?;
        state.check(Failure::SetNonblocking)?;

        state.nonblocking = nonblocking;

        Ok(())
    }

    fn wait_readable(&self, fd: RawFd, timeout: Duration) -> io::Result<bool> {
        {
            let mut state = self.state.lock();
            state.calls.push(Call::WaitReadable(fd));
            state.check_fd(fd)?;
            state.check(Failure::WaitReadable)?;

            if state.interrupted() {
                return Err(io::Error::from(io::ErrorKind::Interrupted));
            }

            if !state.read_queue.is_empty() {
                return Ok(true);
            }
        }

        // Nothing queued: behave like poll() and wait out the timeout.
        thread::sleep(timeout);

        Ok(!self.state.lock().read_queue.is_empty())
    }

    fn read(&self, fd: RawFd, buffer: &mut [u8]) -> io::Result<usize> {
        let mut state = self.state.lock();
        state.calls.push(Call::Read(fd));
        state.check_fd(fd)?;
        state.check(Failure::Read)?;

        if state.interrupted() {
            return Err(io::Error::from(io::ErrorKind::Interrupted));
        }

        let count = buffer.len().min(state.read_queue.len());
        for (byte, queued) in buffer.iter_mut().zip(state.read_queue.drain(..count)) {
            *byte = queued;
        }

        Ok(count)
    }

    fn write(&self, fd: RawFd, buffer: &[u8]) -> io::Result<usize> {
        let mut state = self.state.lock();
        state.calls.push(Call::Write(fd, buffer.len()));
        state.check_fd(fd)?;
        state.check(Failure::Write)?;

        state.write_log.extend_from_slice(buffer);

        Ok(buffer.len())
    }

    fn flush(&self, fd: RawFd) -> io::Result<()> {
        let mut state = self.state.lock();
        state.calls.push(Call::Flush(fd));
        state.check_fd(fd)?;
        state.check(Failure::Flush)?;

        state.read_queue.clear();
        state.flushed += 1;

        Ok(())
    }

    fn drain(&self, fd: RawFd) -> io::Result<()> {
        let mut state = self.state.lock();
        state.calls.push(Call::Drain(fd));
        state.check_fd(fd)?;

        Ok(())
    }

    fn close(&self, fd: RawFd) -> io::Result<()> {
        let mut state = self.state.lock();
        state.calls.push(Call::Close(fd));
        state.check_fd(fd)?;

        // The descriptor is released even if close() reports an error.
        state.open_fds.retain(|&open| open != fd);
        if state.open_fds.is_empty() {
            state.exclusive = false;
        }
        state.check(Failure::Close)?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn descriptors_are_tracked() {
        let backend = MockBackend::new();
        let fd = backend.open(Path::new("/dev/ttyUSB0")).unwrap();

        assert_eq!(fd, FIRST_FD);
        assert!(backend.in_use(Path::new("/dev/ttyUSB0")).unwrap());

        backend.close(fd).unwrap();
        assert!(backend.open_descriptors().is_empty());
        assert_eq!(
            backend.close(fd).unwrap_err().raw_os_error(),
            Some(libc::EBADF)
        );
    }

    #[test]
    fn exclusive_mode_rejects_open() {
        let backend = MockBackend::new();
        let fd = backend.open(Path::new("/dev/ttyUSB0")).unwrap();
        backend.set_exclusive(fd, true).unwrap();

        let err = backend.open(Path::new("/dev/ttyUSB0")).unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::EBUSY));
    }

    #[test]
    fn partial_reads() {
        let backend = MockBackend::new();
        let fd = backend.open(Path::new("/dev/ttyUSB0")).unwrap();
        backend.push_read(b"Hello, World!");

        let mut buffer = [0u8; 5];
        assert_eq!(backend.read(fd, &mut buffer).unwrap(), 5);
        assert_eq!(&buffer, b"Hello");
        assert_eq!(backend.pending(), 8);
    }

    #[test]
    fn simulated_failures() {
        let backend = MockBackend::new();
        backend.fail(Failure::Open);

        assert!(backend.open(Path::new("/dev/ttyUSB0")).is_err());

        backend.clear_failures();
        assert!(backend.open(Path::new("/dev/ttyUSB0")).is_ok());
    }

    #[test]
    fn interrupted_calls() {
        let backend = MockBackend::new();
        let fd = backend.open(Path::new("/dev/ttyUSB0")).unwrap();
        backend.interrupt(1);

        let err = backend.read(fd, &mut [0u8; 1]).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::Interrupted);
        assert_eq!(backend.read(fd, &mut [0u8; 1]).unwrap(), 0);
    }
}
