// serial_at_command.rs - Sends an AT command to a modem connected to a serial
// port, and prints any responses until a SIGINT (Ctrl-C) or SIGTERM signal is
// caught.
//
// The port configuration is loaded from the TOML file passed as the first
// argument. Without an argument, /dev/ttyUSB0 is opened at 115.2 kbit/s 8N1.
// Set RUST_LOG=ttyport=trace to log every read and write.
//
// Example configuration file:
//
//   path = "/dev/ttyACM0"
//   baud_rate = 9600
//   parity = "N"
//   stop_bits = 1
//   flow_control = "hardware"
//   read_timeout_ms = 1000

use std::env;
use std::error::Error;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

// The simple-signal crate is used to handle incoming signals.
use simple_signal::{self, Signal};
use tracing_subscriber::EnvFilter;

use ttyport::{open_port, PortConfig};

fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let config = match env::args().nth(1) {
        Some(path) => PortConfig::load(path)?,
        None => PortConfig::new("/dev/ttyUSB0")
            .with_baud_rate(115_200)
            .with_read_timeout(Duration::from_millis(1000)),
    };

    // A read timeout is needed so the loop below notices the signal.
    let config = if config.read_timeout.is_zero() {
        config.with_read_timeout(Duration::from_millis(1000))
    } else {
        config
    };

    let port = open_port(&config)?;
    println!("Opened {} at {} bit/s", config.path.display(), config.baud_rate);

    let running = Arc::new(AtomicBool::new(true));

    simple_signal::set_handler(&[Signal::Int, Signal::Term], {
        let running = running.clone();
        move |_| {
            running.store(false, Ordering::SeqCst);
        }
    });

    // Discard anything received before the command is sent.
    port.flush()?;
    port.write(b"AT\r\n")?;

    let mut buffer = [0u8; 256];
    while running.load(Ordering::SeqCst) {
        match port.read(&mut buffer) {
            Ok(0) => (),
            Ok(length) => print!("{}", String::from_utf8_lossy(&buffer[..length])),
            Err(ttyport::Error::ReadTimeout) => (),
            Err(e) => return Err(e.into()),
        }
    }

    port.close()?;

    Ok(())
}
