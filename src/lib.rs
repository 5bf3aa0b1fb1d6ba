//! ttyport provides exclusive access to serial devices on Linux and other
//! Unix hosts. Ports are configured through termios for raw 8-bit
//! communication, with support for all common parity modes (including stick
//! parity on Linux), one or two stop bits, hardware or software flow control
//! and read timeouts.
//!
//! A [`SerialPort`] refuses to open a device that's already held open by any
//! process, and keeps the kernel's exclusive mode enabled while it's open.
//! Ports can be opened from a [`PortConfig`] built in code, or loaded from a
//! TOML document.
//!
//! ```no_run
//! use std::time::Duration;
//!
//! use ttyport::{open_port, Parity, PortConfig};
//!
//! let config = PortConfig::new("/dev/ttyUSB0")
//!     .with_baud_rate(115_200)
//!     .with_parity(Parity::None)
//!     .with_read_timeout(Duration::from_millis(500));
//!
//! let port = open_port(&config)?;
//! port.write(b"AT\r\n")?;
//!
//! let mut buffer = [0u8; 64];
//! let length = port.read(&mut buffer)?;
//! println!("{:?}", &buffer[..length]);
//! # Ok::<(), ttyport::Error>(())
//! ```
//!
//! The library can be used in conjunction with a variety of platform-agnostic
//! drivers through its `embedded-hal` trait implementations. Both
//! `embedded-hal` v0.2.7 and `embedded-hal-nb` v1.0.0 are supported, and
//! enabled through the `embedded-hal-0` and `embedded-hal-nb` features, or
//! the `hal` feature for both.

#[cfg(not(unix))]
compile_error!("ttyport only supports Unix targets");

#[macro_use]
mod macros;

pub mod config;
pub mod mock;
pub mod port;

pub use crate::config::{FlowControl, Parity, PortConfig, DEFAULT_BAUD_RATE};
pub use crate::port::{open_port, Backend, ControlSettings, Error, Port, Result, SerialPort, Tty};
