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

//! Translation between [`PortConfig`] values and termios line settings.

use std::io;
use std::time::Duration;

use libc::{cc_t, speed_t, tcflag_t, termios};
use libc::{cfgetispeed, cfgetospeed, cfsetispeed, cfsetospeed};
use libc::{B110, B134, B150, B200, B300, B50, B600, B75};
use libc::{B115200, B19200, B230400, B38400, B57600};
use libc::{B1200, B1800, B2400, B4800, B9600};
use libc::{CLOCAL, CREAD, CRTSCTS, CS8, CSTOPB, PARENB, PARODD};
use libc::{IGNPAR, INPCK, IXOFF, IXON, PARMRK};
use libc::{VMIN, VTIME};

#[cfg(any(target_os = "linux", target_os = "android"))]
use libc::{B1000000, B1152000, B1500000, B2000000, B2500000};
#[cfg(any(target_os = "linux", target_os = "android"))]
use libc::{B3000000, B3500000, B4000000, B460800, B500000, B576000, B921600};

use crate::config::{FlowControl, Parity, PortConfig, DEFAULT_BAUD_RATE};
use crate::port::{Error, Result};

// Stick (mark/space) parity. Targets without CMSPAR only support none, even
// and odd parity.
#[cfg(any(target_os = "linux", target_os = "android"))]
const CMSPAR: tcflag_t = libc::CMSPAR;
#[cfg(not(any(target_os = "linux", target_os = "android")))]
const CMSPAR: tcflag_t = 0;

#[cfg(any(target_os = "linux", target_os = "android"))]
const BAUD_RATES: &[(u32, speed_t)] = &[
    (50, B50),
    (75, B75),
    (110, B110),
    (134, B134),
    (150, B150),
    (200, B200),
    (300, B300),
    (600, B600),
    (1_200, B1200),
    (1_800, B1800),
    (2_400, B2400),
    (4_800, B4800),
    (9_600, B9600),
    (19_200, B19200),
    (38_400, B38400),
    (57_600, B57600),
    (115_200, B115200),
    (230_400, B230400),
    (460_800, B460800),
    (500_000, B500000),
    (576_000, B576000),
    (921_600, B921600),
    (1_000_000, B1000000),
    (1_152_000, B1152000),
    (1_500_000, B1500000),
    (2_000_000, B2000000),
    (2_500_000, B2500000),
    (3_000_000, B3000000),
    (3_500_000, B3500000),
    (4_000_000, B4000000),
];

#[cfg(not(any(target_os = "linux", target_os = "android")))]
const BAUD_RATES: &[(u32, speed_t)] = &[
    (50, B50),
    (75, B75),
    (110, B110),
    (134, B134),
    (150, B150),
    (200, B200),
    (300, B300),
    (600, B600),
    (1_200, B1200),
    (1_800, B1800),
    (2_400, B2400),
    (4_800, B4800),
    (9_600, B9600),
    (19_200, B19200),
    (38_400, B38400),
    (57_600, B57600),
    (115_200, B115200),
    (230_400, B230400),
];

/// Line settings derived from a [`PortConfig`].
///
/// `ControlSettings` mirrors the fields of the platform's `termios` structure
/// that the driver manages. Any field not covered here is left untouched when
/// the settings are applied to a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlSettings {
    pub input_flags: tcflag_t,
    pub output_flags: tcflag_t,
    pub control_flags: tcflag_t,
    pub local_flags: tcflag_t,
    /// Minimum number of bytes for a non-canonical read (`VMIN`).
    pub min_bytes: cc_t,
    /// Inter-byte timer for a non-canonical read (`VTIME`), in 0.1 s units.
    pub timeout_deciseconds: cc_t,
    pub input_speed: speed_t,
    pub output_speed: speed_t,
}

impl ControlSettings {
    /// Returns the line speed in bits per second, or `None` if the speed
    /// constant isn't listed in the baud rate table.
    pub fn baud_rate(&self) -> Option<u32> {
        BAUD_RATES
            .iter()
            .find(|&&(_, speed)| speed == self.output_speed)
            .map(|&(rate, _)| rate)
    }

    pub fn parity(&self) -> Parity {
        if self.control_flags & PARENB == 0 {
            return Parity::None;
        }

        let odd = (self.control_flags & PARODD) != 0;
        let stick = CMSPAR != 0 && (self.control_flags & CMSPAR) != 0;
        let marked = (self.input_flags & (INPCK | PARMRK)) == (INPCK | PARMRK);

        match (stick, odd) {
            (false, false) => Parity::Even,
            (false, true) => Parity::Odd,
            (true, true) => Parity::Mark,
            (true, false) if marked => Parity::Guarded,
            (true, false) => Parity::Space,
        }
    }

    pub fn stop_bits(&self) -> u8 {
        if self.control_flags & CSTOPB == 0 {
            1
        } else {
            2
        }
    }

    pub fn flow_control(&self) -> FlowControl {
        if self.control_flags & CRTSCTS != 0 {
            FlowControl::Hardware
        } else if self.input_flags & (IXON | IXOFF) == (IXON | IXOFF) {
            FlowControl::Software
        } else {
            FlowControl::None
        }
    }

    pub(crate) fn from_termios(attr: &termios) -> ControlSettings {
        ControlSettings {
            input_flags: attr.c_iflag,
            output_flags: attr.c_oflag,
            control_flags: attr.c_cflag,
            local_flags: attr.c_lflag,
            min_bytes: attr.c_cc[VMIN],
            timeout_deciseconds: attr.c_cc[VTIME],
            input_speed: unsafe { cfgetispeed(attr) },
            output_speed: unsafe { cfgetospeed(attr) },
        }
    }

    pub(crate) fn apply_to(&self, attr: &mut termios) -> io::Result<()> {
        attr.c_iflag = self.input_flags;
        attr.c_oflag = self.output_flags;
        attr.c_cflag = self.control_flags;
        attr.c_lflag = self.local_flags;
        attr.c_cc[VMIN] = self.min_bytes;
        attr.c_cc[VTIME] = self.timeout_deciseconds;

        unsafe {
            parse_retval!(cfsetispeed(&mut *attr, self.input_speed))?;
            parse_retval!(cfsetospeed(&mut *attr, self.output_speed))?;
        }

        Ok(())
    }
}

/// Returns the line speeds supported on this platform, in bits per second.
pub fn supported_baud_rates() -> impl Iterator<Item = u32> {
    BAUD_RATES.iter().map(|&(rate, _)| rate)
}

fn speed_for(baud_rate: u32) -> Result<speed_t> {
    let baud_rate = if baud_rate == 0 {
        DEFAULT_BAUD_RATE
    } else {
        baud_rate
    };

    BAUD_RATES
        .iter()
        .find(|&&(rate, _)| rate == baud_rate)
        .map(|&(_, speed)| speed)
        .ok_or(Error::UnsupportedBaudRate(baud_rate))
}

/// Builds the line settings for `config`.
///
/// The device is configured for raw, non-canonical 8-bit input with the
/// receiver enabled and modem control lines ignored. `VTIME` is always zero.
/// Read timeouts are handled by polling the descriptor, not by the line
/// discipline.
pub fn settings_for(config: &PortConfig) -> Result<ControlSettings> {
    let speed = speed_for(config.baud_rate)?;

    let mut settings = ControlSettings {
        input_flags: IGNPAR,
        output_flags: 0,
        control_flags: CREAD | CLOCAL | CS8,
        local_flags: 0,
        min_bytes: 0,
        timeout_deciseconds: 0,
        input_speed: speed,
        output_speed: speed,
    };

    apply_parity(&mut settings, config.parity)?;
    apply_stop_bits(&mut settings, config.stop_bits)?;
    apply_flow_control(&mut settings, config.flow_control);
    apply_read_timeout(&mut settings, config.read_timeout);

    Ok(settings)
}

/// Sets `VMIN` for the read timeout. Without a timeout a read waits for at
/// least one byte. With a timeout, the descriptor is polled first and a read
/// returns whatever is available.
pub fn apply_read_timeout(settings: &mut ControlSettings, timeout: Duration) {
    settings.min_bytes = if timeout.is_zero() { 1 } else { 0 };
    settings.timeout_deciseconds = 0;
}

/// Checks whether `parity` and `stop_bits` can be encoded on this platform.
pub fn validate(parity: Parity, stop_bits: u8) -> Result<()> {
    if is_stick(parity) && CMSPAR == 0 {
        return Err(Error::InvalidParity(parity.symbol().to_string()));
    }

    match stop_bits {
        0..=2 => Ok(()),
        _ => Err(Error::InvalidStopBits(stop_bits)),
    }
}

fn is_stick(parity: Parity) -> bool {
    matches!(parity, Parity::Space | Parity::Mark | Parity::Guarded)
}

/// Rewrites the parity bits of `settings`.
pub fn apply_parity(settings: &mut ControlSettings, parity: Parity) -> Result<()> {
    if is_stick(parity) && CMSPAR == 0 {
        return Err(Error::InvalidParity(parity.symbol().to_string()));
    }

    settings.control_flags &= !(PARENB | PARODD | CMSPAR);
    settings.input_flags &= !(INPCK | PARMRK);
    settings.input_flags |= IGNPAR;

    settings.control_flags |= match parity {
        Parity::None => 0,
        Parity::Even => PARENB,
        Parity::Odd => PARENB | PARODD,
        Parity::Space => PARENB | CMSPAR,
        Parity::Mark => PARENB | PARODD | CMSPAR,
        Parity::Guarded => PARENB | CMSPAR,
    };

    if parity == Parity::Guarded {
        // Check incoming parity and mark errors in the input stream
        settings.input_flags |= INPCK | PARMRK;
        settings.input_flags &= !IGNPAR;
    }

    Ok(())
}

/// Rewrites the stop bit setting. `0` is treated as `1`.
pub fn apply_stop_bits(settings: &mut ControlSettings, stop_bits: u8) -> Result<()> {
    match stop_bits {
        0 | 1 => settings.control_flags &= !CSTOPB,
        2 => settings.control_flags |= CSTOPB,
        _ => return Err(Error::InvalidStopBits(stop_bits)),
    }

    Ok(())
}

pub fn apply_flow_control(settings: &mut ControlSettings, flow_control: FlowControl) {
    settings.control_flags &= !CRTSCTS;
    settings.input_flags &= !(IXON | IXOFF);

    match flow_control {
        FlowControl::None => (),
        FlowControl::Hardware => settings.control_flags |= CRTSCTS,
        FlowControl::Software => settings.input_flags |= IXON | IXOFF,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use pretty_assertions::assert_eq;
    use proptest::prelude::*;
    use proptest::sample::select;

    #[cfg(any(target_os = "linux", target_os = "android"))]
    const PARITIES: &[Parity] = &[
        Parity::None,
        Parity::Even,
        Parity::Odd,
        Parity::Space,
        Parity::Mark,
        Parity::Guarded,
    ];
    #[cfg(not(any(target_os = "linux", target_os = "android")))]
    const PARITIES: &[Parity] = &[Parity::None, Parity::Even, Parity::Odd];

    const FLOW_CONTROLS: &[FlowControl] = &[
        FlowControl::None,
        FlowControl::Hardware,
        FlowControl::Software,
    ];

    fn config(parity: Parity, stop_bits: u8, flow_control: FlowControl) -> PortConfig {
        PortConfig::new("/dev/ttyUSB0")
            .with_baud_rate(9_600)
            .with_parity(parity)
            .with_stop_bits(stop_bits)
            .with_flow_control(flow_control)
    }

    #[test]
    fn raw_8n1() {
        let settings = settings_for(&config(Parity::None, 1, FlowControl::None)).unwrap();

        assert_eq!(settings.control_flags, CREAD | CLOCAL | CS8);
        assert_eq!(settings.input_flags, IGNPAR);
        assert_eq!(settings.output_flags, 0);
        assert_eq!(settings.local_flags, 0);
        assert_eq!(settings.min_bytes, 1);
        assert_eq!(settings.timeout_deciseconds, 0);
        assert_eq!(settings.input_speed, B9600);
        assert_eq!(settings.output_speed, B9600);
        assert_eq!(settings.baud_rate(), Some(9_600));
    }

    #[test]
    fn read_timeout_disables_min_bytes() {
        let config = config(Parity::None, 1, FlowControl::None)
            .with_read_timeout(Duration::from_millis(200));
        let mut settings = settings_for(&config).unwrap();
        assert_eq!(settings.min_bytes, 0);

        apply_read_timeout(&mut settings, Duration::ZERO);
        assert_eq!(settings.min_bytes, 1);
        assert_eq!(settings.timeout_deciseconds, 0);
    }

    #[test]
    fn default_baud_rate() {
        let settings = settings_for(&PortConfig::new("/dev/ttyS0").with_baud_rate(0)).unwrap();

        assert_eq!(settings.output_speed, B19200);
        assert_eq!(settings.baud_rate(), Some(DEFAULT_BAUD_RATE));
    }

    #[test]
    fn unsupported_baud_rate() {
        let result = settings_for(&PortConfig::new("/dev/ttyS0").with_baud_rate(12_345));

        assert!(matches!(result, Err(Error::UnsupportedBaudRate(12_345))));
    }

    #[test]
    fn even_and_odd_parity() {
        let even = settings_for(&config(Parity::Even, 1, FlowControl::None)).unwrap();
        assert_eq!(even.control_flags & (PARENB | PARODD), PARENB);

        let odd = settings_for(&config(Parity::Odd, 1, FlowControl::None)).unwrap();
        assert_eq!(odd.control_flags & (PARENB | PARODD), PARENB | PARODD);
        assert_eq!(odd.input_flags, IGNPAR);
    }

    #[cfg(any(target_os = "linux", target_os = "android"))]
    #[test]
    fn stick_parity() {
        let space = settings_for(&config(Parity::Space, 1, FlowControl::None)).unwrap();
        assert_eq!(
            space.control_flags & (PARENB | PARODD | CMSPAR),
            PARENB | CMSPAR
        );

        let mark = settings_for(&config(Parity::Mark, 1, FlowControl::None)).unwrap();
        assert_eq!(
            mark.control_flags & (PARENB | PARODD | CMSPAR),
            PARENB | PARODD | CMSPAR
        );
    }

    #[cfg(any(target_os = "linux", target_os = "android"))]
    #[test]
    fn guarded_parity_marks_errors() {
        let settings = settings_for(&config(Parity::Guarded, 1, FlowControl::None)).unwrap();

        assert_eq!(
            settings.control_flags & (PARENB | PARODD | CMSPAR),
            PARENB | CMSPAR
        );
        assert_eq!(settings.input_flags & (INPCK | PARMRK), INPCK | PARMRK);
        assert_eq!(settings.input_flags & IGNPAR, 0);
    }

    #[cfg(any(target_os = "linux", target_os = "android"))]
    #[test]
    fn leaving_guarded_parity_restores_input_flags() {
        let mut settings = settings_for(&config(Parity::Guarded, 1, FlowControl::None)).unwrap();
        apply_parity(&mut settings, Parity::None).unwrap();

        assert_eq!(settings.input_flags, IGNPAR);
        assert_eq!(settings.control_flags & (PARENB | PARODD | CMSPAR), 0);
        assert_eq!(settings.parity(), Parity::None);
    }

    #[cfg(not(any(target_os = "linux", target_os = "android")))]
    #[test]
    fn stick_parity_unsupported() {
        let result = settings_for(&config(Parity::Mark, 1, FlowControl::None));

        assert!(matches!(result, Err(Error::InvalidParity(_))));
    }

    #[test]
    fn stop_bits() {
        let one = settings_for(&config(Parity::None, 0, FlowControl::None)).unwrap();
        assert_eq!(one.control_flags & CSTOPB, 0);

        let two = settings_for(&config(Parity::None, 2, FlowControl::None)).unwrap();
        assert_eq!(two.control_flags & CSTOPB, CSTOPB);

        let result = settings_for(&config(Parity::None, 3, FlowControl::None));
        assert!(matches!(result, Err(Error::InvalidStopBits(3))));
    }

    #[test]
    fn flow_control() {
        let hardware = settings_for(&config(Parity::None, 1, FlowControl::Hardware)).unwrap();
        assert_eq!(hardware.control_flags & CRTSCTS, CRTSCTS);
        assert_eq!(hardware.input_flags & (IXON | IXOFF), 0);

        let software = settings_for(&config(Parity::None, 1, FlowControl::Software)).unwrap();
        assert_eq!(software.control_flags & CRTSCTS, 0);
        assert_eq!(software.input_flags & (IXON | IXOFF), IXON | IXOFF);

        let mut none = software;
        apply_flow_control(&mut none, FlowControl::None);
        assert_eq!(none.input_flags & (IXON | IXOFF), 0);
    }

    #[test]
    fn validate_rejects_before_encoding() {
        assert!(validate(Parity::Even, 2).is_ok());
        assert!(matches!(
            validate(Parity::Even, 4),
            Err(Error::InvalidStopBits(4))
        ));
    }

    #[test]
    fn supported_rates_include_common_speeds() {
        let rates: Vec<u32> = supported_baud_rates().collect();

        for rate in [9_600, 19_200, 115_200, 230_400] {
            assert!(rates.contains(&rate));
        }
    }

    #[cfg(any(target_os = "linux", target_os = "android"))]
    #[test]
    fn extended_baud_rates() {
        let settings = settings_for(&PortConfig::new("/dev/ttyS0").with_baud_rate(921_600)).unwrap();
        assert_eq!(settings.output_speed, B921600);
        assert_eq!(settings.baud_rate(), Some(921_600));

        assert!(supported_baud_rates().any(|rate| rate == 4_000_000));
        assert!(validate(Parity::Mark, 1).is_ok());
    }

    proptest! {
        #[test]
        fn settings_decode_to_config(
            rate in select(supported_baud_rates().collect::<Vec<u32>>()),
            parity in select(PARITIES),
            stop_bits in 0u8..=2,
            flow_control in select(FLOW_CONTROLS),
        ) {
            let config = PortConfig::new("/dev/ttyS0")
                .with_baud_rate(rate)
                .with_parity(parity)
                .with_stop_bits(stop_bits)
                .with_flow_control(flow_control);

            let settings = settings_for(&config).unwrap();

            prop_assert_eq!(settings.baud_rate(), Some(rate));
            prop_assert_eq!(settings.parity(), parity);
            prop_assert_eq!(settings.stop_bits(), stop_bits.max(1));
            prop_assert_eq!(settings.flow_control(), flow_control);
            prop_assert_eq!(settings.control_flags & (CREAD | CLOCAL | CS8), CREAD | CLOCAL | CS8);
        }
    }
}
