//! Line framing and settings behavior of serial streams over the loopback
//! backend.

use std::time::Duration;

use devio::backends::loopback::{LoopbackDeviceManager, LoopbackSerialBackend};
use devio::config::OpenConfiguration;
use devio::error::DeviceError;
use devio::manager::{DeviceKey, DeviceManager};
use devio::serial::{SerialParity, SerialSettings, SerialStream};

fn open_port(path: &str) -> (std::sync::Arc<LoopbackSerialBackend>, SerialStream) {
    let mgr = LoopbackDeviceManager::new();
    let backend = mgr.add_serial(LoopbackSerialBackend::new(path));
    let device = mgr
        .try_create_serial_device(&DeviceKey::new(path))
        .expect("device");
    let mut stream = device.open(&OpenConfiguration::new()).expect("open");
    stream.set_read_timeout(Duration::from_millis(50));
    (backend, stream)
}

#[test]
fn open_applies_default_settings() {
    let (backend, stream) = open_port("loop/settings");
    assert_eq!(backend.port().applied_settings(), Some(SerialSettings::default()));
    assert_eq!(stream.baud_rate(), 9600);
    assert_eq!(stream.data_bits(), 8);
    assert_eq!(stream.parity(), SerialParity::None);
    assert_eq!(stream.stop_bits(), 1);
}

#[test]
fn set_baud_rate_reaches_the_channel() {
    let (backend, mut stream) = open_port("loop/baud");
    stream.set_baud_rate(115200).expect("set");
    let applied = backend.port().applied_settings().expect("applied");
    assert_eq!(applied.baud_rate, 115200);
    assert_eq!(stream.baud_rate(), 115200);
}

#[test]
fn read_to_consumes_ending_and_returns_prefix() {
    let (backend, stream) = open_port("loop/ending");
    backend.port().feed(b"abcXYZdef");
    assert_eq!(stream.read_to("XYZ").expect("read_to"), "abc");
    // Remaining bytes have no terminator; timeout returns what was seen.
    assert_eq!(stream.read_to("XYZ").expect("read_to"), "def");
}

#[test]
fn read_to_handles_partial_terminator_restart() {
    let (backend, stream) = open_port("loop/partial");
    // "XX" inside the payload must not end the scan early for ending "XY".
    backend.port().feed(b"aXXYb");
    assert_eq!(stream.read_to("XY").expect("read_to"), "aX");
    assert_eq!(stream.read_to("XY").expect("read_to"), "b");
}

#[test]
fn read_to_rejects_empty_ending() {
    let (_backend, stream) = open_port("loop/empty-ending");
    assert!(matches!(
        stream.read_to(""),
        Err(DeviceError::InvalidOption(_))
    ));
}

#[test]
fn write_line_and_read_line_round_trip() {
    let (backend, stream) = open_port("loop/line");
    backend.port().set_echo(true);
    stream.write_line("hello").expect("write_line");
    assert_eq!(backend.port().written(), b"hello\r\n");
    assert_eq!(stream.read_line().expect("read_line"), "hello");
}

#[test]
fn custom_line_terminator() {
    let (backend, mut stream) = open_port("loop/custom-line");
    stream.set_new_line("\n").expect("set");
    backend.port().set_echo(true);
    stream.write_line("ping").expect("write_line");
    assert_eq!(backend.port().written(), b"ping\n");
    assert_eq!(stream.read_line().expect("read_line"), "ping");
}

#[test]
fn empty_line_terminator_is_rejected() {
    let (_backend, mut stream) = open_port("loop/bad-line");
    assert!(matches!(
        stream.set_new_line(""),
        Err(DeviceError::InvalidOption(_))
    ));
    assert_eq!(stream.new_line(), "\r\n");
}

#[test]
fn non_utf8_bytes_are_replaced_not_fatal() {
    let (backend, stream) = open_port("loop/lossy");
    backend.port().feed(&[0x61, 0xFF, 0x62, b'\r', b'\n']);
    let line = stream.read_line().expect("read_line");
    assert_eq!(line, "a\u{FFFD}b");
}
