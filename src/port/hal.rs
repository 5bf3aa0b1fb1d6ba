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

//! `embedded-hal` serial trait implementations for [`SerialPort`].
//!
//! A read that times out or returns no data is reported as `WouldBlock`.

#[cfg(feature = "embedded-hal-nb")]
use embedded_hal_nb::serial::{self, ErrorType};

use super::{Backend, Error, SerialPort};

// Reads a single byte, returning `None` if nothing arrived.
fn read_byte<B: Backend>(port: &SerialPort<B>) -> Result<Option<u8>, Error> {
    let mut buffer = [0u8; 1];

    match port.read(&mut buffer) {
        Ok(0) | Err(Error::ReadTimeout) => Ok(None),
        Ok(_) => Ok(Some(buffer[0])),
        Err(e) => Err(e),
    }
}

#[cfg(feature = "embedded-hal-nb")]
impl serial::Error for Error {
    fn kind(&self) -> serial::ErrorKind {
        serial::ErrorKind::Other
    }
}

#[cfg(feature = "embedded-hal-nb")]
impl<B: Backend> ErrorType for SerialPort<B> {
    type Error = Error;
}

/// `Read<u8>` trait implementation for `embedded-hal-nb` v1.0.0.
#[cfg(feature = "embedded-hal-nb")]
impl<B: Backend> serial::Read<u8> for SerialPort<B> {
    fn read(&mut self) -> embedded_hal_nb::nb::Result<u8, Self::Error> {
        match read_byte(self)? {
            Some(byte) => Ok(byte),
            None => Err(embedded_hal_nb::nb::Error::WouldBlock),
        }
    }
}

/// `Write<u8>` trait implementation for `embedded-hal-nb` v1.0.0.
#[cfg(feature = "embedded-hal-nb")]
impl<B: Backend> serial::Write<u8> for SerialPort<B> {
    fn write(&mut self, word: u8) -> embedded_hal_nb::nb::Result<(), Self::Error> {
        if SerialPort::write(self, &[word])? == 0 {
            Err(embedded_hal_nb::nb::Error::WouldBlock)
        } else {
            Ok(())
        }
    }

    fn flush(&mut self) -> embedded_hal_nb::nb::Result<(), Self::Error> {
        SerialPort::drain(self)?;

        Ok(())
    }
}

/// `Read<u8>` trait implementation for `embedded-hal` v0.2.7.
#[cfg(feature = "embedded-hal-0")]
impl<B: Backend> embedded_hal_0::serial::Read<u8> for SerialPort<B> {
    type Error = Error;

    fn read(&mut self) -> nb::Result<u8, Self::Error> {
        match read_byte(self)? {
            Some(byte) => Ok(byte),
            None => Err(nb::Error::WouldBlock),
        }
    }
}

/// `Write<u8>` trait implementation for `embedded-hal` v0.2.7.
#[cfg(feature = "embedded-hal-0")]
impl<B: Backend> embedded_hal_0::serial::Write<u8> for SerialPort<B> {
    type Error = Error;

    fn write(&mut self, word: u8) -> nb::Result<(), Self::Error> {
        if SerialPort::write(self, &[word])? == 0 {
            Err(nb::Error::WouldBlock)
        } else {
            Ok(())
        }
    }

    fn flush(&mut self) -> nb::Result<(), Self::Error> {
        SerialPort::drain(self)?;

        Ok(())
    }
}

#[cfg(feature = "embedded-hal-0")]
impl<B: Backend> embedded_hal_0::blocking::serial::write::Default<u8> for SerialPort<B> {}
