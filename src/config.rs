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

//! Port configuration.
//!
//! A [`PortConfig`] describes everything needed to open a serial device:
//! the device path, line speed, parity, stop bits, flow control and the
//! read timeout. Configurations can be built in code, or loaded from a TOML
//! document:
//!
//! ```toml
//! path = "/dev/ttyUSB0"
//! baud_rate = 115200
//! parity = "E"
//! stop_bits = 1
//! flow_control = "hardware"
//! read_timeout_ms = 250
//! ```
//!
//! Missing keys fall back to the values of [`PortConfig::default`].

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::port::{Error, Result};

/// Line speed used when a configuration specifies a baud rate of `0`.
pub const DEFAULT_BAUD_RATE: u32 = 19_200;

/// Parity modes.
///
/// `None` omits the parity bit. `Even` and `Odd` count the total number of
/// 1-bits in the data bits. `Mark` and `Space` always set the parity bit to
/// `1` or `0` respectively.
///
/// `Guarded` transmits space parity, but also enables parity checking on
/// incoming data. Bytes received with a parity error are marked in the input
/// stream with the `0xff 0x00` prefix instead of being silently accepted.
///
/// `Space`, `Mark` and `Guarded` require stick parity support (`CMSPAR`),
/// which is only available on Linux.
#[derive(Debug, PartialEq, Eq, Copy, Clone, Serialize, Deserialize)]
pub enum Parity {
    #[serde(rename = "N", alias = "n", alias = "none")]
    None,
    #[serde(rename = "E", alias = "e", alias = "even")]
    Even,
    #[serde(rename = "O", alias = "o", alias = "odd")]
    Odd,
    #[serde(rename = "S", alias = "s", alias = "space")]
    Space,
    #[serde(rename = "M", alias = "m", alias = "mark")]
    Mark,
    #[serde(rename = "G", alias = "g", alias = "guarded")]
    Guarded,
}

impl Parity {
    /// Returns the single-letter symbol for this mode.
    pub fn symbol(self) -> char {
        match self {
            Parity::None => 'N',
            Parity::Even => 'E',
            Parity::Odd => 'O',
            Parity::Space => 'S',
            Parity::Mark => 'M',
            Parity::Guarded => 'G',
        }
    }
}

impl Default for Parity {
    fn default() -> Parity {
        Parity::None
    }
}

impl fmt::Display for Parity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Parity::None => write!(f, "None"),
            Parity::Even => write!(f, "Even"),
            Parity::Odd => write!(f, "Odd"),
            Parity::Space => write!(f, "Space"),
            Parity::Mark => write!(f, "Mark"),
            Parity::Guarded => write!(f, "Guarded"),
        }
    }
}

impl FromStr for Parity {
    type Err = Error;

    /// Accepts the symbols `N`, `E`, `O`, `S`, `M` and `G`, or the mode's
    /// full name, in any case.
    fn from_str(s: &str) -> Result<Parity> {
        match s.to_ascii_lowercase().as_str() {
            "n" | "none" => Ok(Parity::None),
            "e" | "even" => Ok(Parity::Even),
            "o" | "odd" => Ok(Parity::Odd),
            "s" | "space" => Ok(Parity::Space),
            "m" | "mark" => Ok(Parity::Mark),
            "g" | "guarded" => Ok(Parity::Guarded),
            _ => Err(Error::InvalidParity(s.to_string())),
        }
    }
}

/// Flow control modes.
///
/// `Hardware` enables RTS/CTS flow control. `Software` sets the XON/XOFF
/// input flags on the device, but the driver doesn't send or filter any
/// XON/XOFF characters on its own.
#[derive(Debug, PartialEq, Eq, Copy, Clone, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FlowControl {
    None,
    Hardware,
    Software,
}

impl Default for FlowControl {
    fn default() -> FlowControl {
        FlowControl::None
    }
}

impl fmt::Display for FlowControl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            FlowControl::None => write!(f, "None"),
            FlowControl::Hardware => write!(f, "Hardware"),
            FlowControl::Software => write!(f, "Software"),
        }
    }
}

impl TryFrom<u8> for FlowControl {
    type Error = Error;

    fn try_from(code: u8) -> Result<FlowControl> {
        match code {
            0 => Ok(FlowControl::None),
            1 => Ok(FlowControl::Hardware),
            2 => Ok(FlowControl::Software),
            _ => Err(Error::InvalidFlowControl(code.to_string())),
        }
    }
}

impl FromStr for FlowControl {
    type Err = Error;

    fn from_str(s: &str) -> Result<FlowControl> {
        match s.to_ascii_lowercase().as_str() {
            "0" | "none" => Ok(FlowControl::None),
            "1" | "hardware" | "rtscts" => Ok(FlowControl::Hardware),
            "2" | "software" | "xonxoff" => Ok(FlowControl::Software),
            _ => Err(Error::InvalidFlowControl(s.to_string())),
        }
    }
}

/// Configuration of a serial port.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PortConfig {
    /// Device path, for instance `/dev/ttyUSB0`.
    pub path: PathBuf,
    /// Line speed in bits per second. `0` selects [`DEFAULT_BAUD_RATE`].
    pub baud_rate: u32,
    pub parity: Parity,
    /// Number of stop bits. Accepted values: `0` (same as `1`), `1`, `2`.
    pub stop_bits: u8,
    pub flow_control: FlowControl,
    /// Maximum time a read waits for incoming data. A zero duration blocks
    /// until data arrives.
    #[serde(rename = "read_timeout_ms", with = "duration_ms")]
    pub read_timeout: Duration,
}

impl Default for PortConfig {
    fn default() -> PortConfig {
        PortConfig {
            path: PathBuf::from("/dev/ttyS0"),
            baud_rate: DEFAULT_BAUD_RATE,
            parity: Parity::None,
            stop_bits: 1,
            flow_control: FlowControl::None,
            read_timeout: Duration::ZERO,
        }
    }
}

impl PortConfig {
    /// Constructs a default 8N1 configuration for the device at `path`.
    pub fn new<P: AsRef<Path>>(path: P) -> PortConfig {
        PortConfig {
            path: path.as_ref().to_path_buf(),
            ..PortConfig::default()
        }
    }

    pub fn with_baud_rate(mut self, baud_rate: u32) -> PortConfig {
        self.baud_rate = baud_rate;
        self
    }

    pub fn with_parity(mut self, parity: Parity) -> PortConfig {
        self.parity = parity;
        self
    }

    pub fn with_stop_bits(mut self, stop_bits: u8) -> PortConfig {
        self.stop_bits = stop_bits;
        self
    }

    pub fn with_flow_control(mut self, flow_control: FlowControl) -> PortConfig {
        self.flow_control = flow_control;
        self
    }

    pub fn with_read_timeout(mut self, read_timeout: Duration) -> PortConfig {
        self.read_timeout = read_timeout;
        self
    }

    /// Parses a configuration from a TOML document.
    pub fn from_toml_str(document: &str) -> Result<PortConfig> {
        toml::from_str(document).map_err(|e| Error::Config(e.to_string()))
    }

    /// Loads a configuration from the TOML file at `path`.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<PortConfig> {
        let document = fs::read_to_string(path)?;

        PortConfig::from_toml_str(&document)
    }

    /// Serializes the configuration as a TOML document.
    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string(self).map_err(|e| Error::Config(e.to_string()))
    }
}

mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    // Rounds up, so a sub-millisecond timeout doesn't turn into a blocking
    // read when loaded again. TOML integers are signed 64-bit.
    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        let millis = (duration.as_nanos() + 999_999) / 1_000_000;

        serializer.serialize_u64(millis.min(i64::MAX as u128) as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
