//! Open and close behavior of `SerialPort`, driven through `MockBackend`.

use std::path::PathBuf;

use pretty_assertions::assert_eq;

use ttyport::mock::{Call, Failure, MockBackend};
use ttyport::{Error, FlowControl, Parity, PortConfig, SerialPort};

fn port() -> (MockBackend, SerialPort<MockBackend>) {
    let backend = MockBackend::new();
    let port = SerialPort::with_backend(backend.clone());

    (backend, port)
}

fn config() -> PortConfig {
    PortConfig::new("/dev/ttyUSB0").with_baud_rate(9_600)
}

#[test]
fn open_configures_device() {
    let (backend, port) = port();
    port.open(&config()).unwrap();

    assert!(port.is_open());
    assert!(backend.is_exclusive());
    assert!(!backend.is_nonblocking());
    assert_eq!(backend.open_descriptors().len(), 1);

    let settings = backend.settings().unwrap();
    assert_eq!(settings.baud_rate(), Some(9_600));
    assert_eq!(settings.parity(), Parity::None);
    assert_eq!(settings.stop_bits(), 1);
    assert_eq!(settings.flow_control(), FlowControl::None);

    let fd = backend.open_descriptors()[0];
    assert_eq!(
        backend.calls(),
        vec![
            Call::InUse(PathBuf::from("/dev/ttyUSB0")),
            Call::Open(PathBuf::from("/dev/ttyUSB0")),
            Call::SetExclusive(fd, true),
            Call::SetAttributes(fd),
            Call::SetNonblocking(fd, false),
        ]
    );
}

#[test]
fn close_releases_device() {
    let (backend, port) = port();
    port.open(&config()).unwrap();
    let fd = backend.open_descriptors()[0];
    backend.clear_calls();

    port.close().unwrap();

    assert!(!port.is_open());
    assert!(!backend.is_exclusive());
    assert!(backend.open_descriptors().is_empty());
    assert_eq!(
        backend.calls(),
        vec![Call::SetExclusive(fd, false), Call::Close(fd)]
    );
}

#[test]
fn close_unopened_port() {
    let (backend, port) = port();

    assert!(matches!(port.close(), Err(Error::NotInitialized)));
    assert!(backend.calls().is_empty());
}

#[test]
fn close_twice() {
    let (_, port) = port();
    port.open(&config()).unwrap();

    port.close().unwrap();
    assert!(matches!(port.close(), Err(Error::NotInitialized)));
}

#[test]
fn reopen_closes_previous_descriptor() {
    let (backend, port) = port();
    port.open(&config()).unwrap();
    port.open(&config().with_baud_rate(115_200)).unwrap();

    let calls = backend.calls();
    let opens: Vec<usize> = calls
        .iter()
        .enumerate()
        .filter(|(_, call)| matches!(call, Call::Open(_)))
        .map(|(index, _)| index)
        .collect();
    assert_eq!(opens.len(), 2);

    let closes = calls[opens[0]..opens[1]]
        .iter()
        .filter(|call| matches!(call, Call::Close(_)))
        .count();
    assert_eq!(closes, 1);

    assert_eq!(backend.open_descriptors().len(), 1);
    assert_eq!(port.config().baud_rate, 115_200);
    assert_eq!(backend.settings().unwrap().baud_rate(), Some(115_200));
}

#[test]
fn invalid_config_makes_no_system_calls() {
    let (backend, port) = port();

    let err = port.open(&config().with_baud_rate(12_345)).unwrap_err();
    assert!(matches!(err, Error::UnsupportedBaudRate(12_345)));

    let err = port.open(&config().with_stop_bits(3)).unwrap_err();
    assert!(matches!(err, Error::InvalidStopBits(3)));
    assert!(err.is_config_error());

    assert!(backend.calls().is_empty());
    assert!(!port.is_open());
}

#[test]
fn invalid_parity_symbol_is_rejected() {
    let err = PortConfig::from_toml_str("path = \"/dev/ttyUSB0\"\nparity = \"Z\"\n").unwrap_err();
    assert!(matches!(err, Error::Config(_)));

    let err = "Z".parse::<Parity>().unwrap_err();
    assert!(matches!(err, Error::InvalidParity(ref symbol) if symbol == "Z"));
}

#[test]
fn device_held_elsewhere() {
    let (backend, port) = port();
    backend.set_held_elsewhere(true);

    assert!(matches!(port.open(&config()), Err(Error::AlreadyOpen)));
    assert_eq!(backend.count(|call| matches!(call, Call::Open(_))), 0);
    assert!(!port.is_open());
}

#[test]
fn second_port_on_same_device() {
    let backend = MockBackend::new();
    let first = SerialPort::with_backend(backend.clone());
    let second = SerialPort::with_backend(backend.clone());

    first.open(&config()).unwrap();

    assert!(matches!(second.open(&config()), Err(Error::AlreadyOpen)));
    assert!(first.is_open());
    assert!(!second.is_open());
}

#[test]
fn usage_check_failure() {
    let (backend, port) = port();
    backend.fail(Failure::InUse);

    assert!(matches!(port.open(&config()), Err(Error::AccessDenied)));
    assert_eq!(backend.count(|call| matches!(call, Call::Open(_))), 0);
}

#[test]
fn open_failure() {
    let (backend, port) = port();
    backend.fail(Failure::Open);

    assert!(matches!(port.open(&config()), Err(Error::Io(_))));
    assert!(!port.is_open());
    assert!(backend.open_descriptors().is_empty());
}

#[test]
fn exclusive_failure_closes_descriptor() {
    let (backend, port) = port();
    backend.fail(Failure::Exclusive);

    assert!(matches!(port.open(&config()), Err(Error::ExclusiveAccess(_))));
    assert!(!port.is_open());
    assert!(backend.open_descriptors().is_empty());
    assert_eq!(backend.count(|call| matches!(call, Call::Close(_))), 1);
}

#[test]
fn attributes_failure_closes_descriptor() {
    let (backend, port) = port();
    backend.fail(Failure::SetAttributes);

    assert!(matches!(port.open(&config()), Err(Error::Io(_))));
    assert!(!port.is_open());
    assert!(backend.open_descriptors().is_empty());
    assert!(!backend.is_exclusive());

    backend.clear_failures();
    port.open(&config()).unwrap();
    assert!(port.is_open());
}

#[test]
fn nonblocking_failure_closes_descriptor() {
    let (backend, port) = port();
    backend.fail(Failure::SetNonblocking);

    assert!(port.open(&config()).is_err());
    assert!(!port.is_open());
    assert!(backend.open_descriptors().is_empty());
}

#[test]
fn release_failure_still_closes() {
    let (backend, port) = port();
    port.open(&config()).unwrap();
    backend.fail(Failure::ReleaseExclusive);

    assert!(matches!(port.close(), Err(Error::ExclusiveAccess(_))));
    assert!(!port.is_open());
    assert!(backend.open_descriptors().is_empty());
    assert!(matches!(port.close(), Err(Error::NotInitialized)));
}

#[test]
fn reopen_ignores_close_failure() {
    let (backend, port) = port();
    port.open(&config()).unwrap();
    backend.fail(Failure::Close);

    port.open(&config()).unwrap();
    assert!(port.is_open());
    assert_eq!(backend.open_descriptors().len(), 1);
}

#[test]
fn drop_closes_port() {
    let backend = MockBackend::new();

    {
        let port = SerialPort::with_backend(backend.clone());
        port.open(&config()).unwrap();
        assert_eq!(backend.open_descriptors().len(), 1);
    }

    assert!(backend.open_descriptors().is_empty());
    assert!(!backend.is_exclusive());
}

#[test]
fn stored_configuration() {
    let (_, port) = port();
    let config = PortConfig::new("/dev/ttyACM0")
        .with_baud_rate(57_600)
        .with_parity(Parity::Even)
        .with_stop_bits(2)
        .with_flow_control(FlowControl::Hardware);

    port.open(&config).unwrap();

    assert_eq!(port.config(), config);
    assert_eq!(port.path(), PathBuf::from("/dev/ttyACM0"));
}
