//! End-to-end open, exclusivity, and interrupt behavior over the loopback
//! backend.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use devio::backends::loopback::{LoopbackDeviceManager, LoopbackHidBackend};
use devio::config::OpenConfiguration;
use devio::error::DeviceError;
use devio::hid::HidDevice;
use devio::manager::{DeviceKey, DeviceManager};

// Run with RUST_LOG=devio=trace to watch the open protocol at work.
fn init_tracing() {
    use std::sync::OnceLock;
    static INIT: OnceLock<()> = OnceLock::new();
    INIT.get_or_init(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .try_init();
    });
}

#[cfg(target_os = "linux")]
fn isolate_lock_dir() {
    use std::sync::OnceLock;
    static DIR: OnceLock<tempfile::TempDir> = OnceLock::new();
    init_tracing();
    DIR.get_or_init(|| {
        let dir = tempfile::tempdir().expect("tempdir");
        std::env::set_var("DEVIO_LOCK_DIR", dir.path());
        dir
    });
}

fn hid_pair(path: &str) -> (Arc<LoopbackHidBackend>, HidDevice, HidDevice) {
    init_tracing();
    let mgr = LoopbackDeviceManager::new();
    let backend = mgr.add_hid(LoopbackHidBackend::new(path));
    let key = DeviceKey::new(path);
    let a = mgr.try_create_hid_device(&key).expect("device");
    let b = mgr.try_create_hid_device(&key).expect("device");
    (backend, a, b)
}

#[test]
fn open_then_read_write_round_trip() {
    let (backend, device, _) = hid_pair("loop/rw");
    let stream = device.open(&OpenConfiguration::new()).expect("open");
    stream.write(&[1, 2, 3]).expect("write");
    assert_eq!(backend.port().written(), vec![1, 2, 3]);

    backend.port().feed(&[9, 8]);
    let mut buf = [0u8; 8];
    let n = stream.read(&mut buf).expect("read");
    assert_eq!(&buf[..n], &[9, 8]);
}

#[test]
fn interrupt_unblocks_read_without_closing() {
    let (backend, device, _) = hid_pair("loop/interrupt");
    let mut stream = device.open(&OpenConfiguration::new()).expect("open");
    stream.set_read_timeout(Duration::from_secs(5));
    let stream = Arc::new(stream);

    let reader = Arc::clone(&stream);
    let handle = thread::spawn(move || {
        let mut buf = [0u8; 8];
        reader.read(&mut buf)
    });
    thread::sleep(Duration::from_millis(50));
    stream.interrupt();
    let result = handle.join().expect("join");
    assert!(matches!(result, Err(DeviceError::Interrupted)));

    // The stream is still usable after the interrupt.
    backend.port().feed(b"x");
    let mut buf = [0u8; 4];
    assert_eq!(stream.read(&mut buf).expect("read"), 1);
}

#[test]
fn read_after_close_fails_closed() {
    let (_backend, device, _) = hid_pair("loop/closed");
    let mut stream = device.open(&OpenConfiguration::new()).expect("open");
    stream.set_read_timeout(Duration::from_millis(50));
    stream.close();
    let mut buf = [0u8; 4];
    assert!(matches!(
        stream.read(&mut buf),
        Err(DeviceError::Closed)
    ));
}

#[test]
fn channel_freed_exactly_once() {
    let (backend, device, _) = hid_pair("loop/free");
    let stream = device.open(&OpenConfiguration::new()).expect("open");
    stream.close();
    stream.close();
    drop(stream);
    assert_eq!(backend.port().free_count(), 1);
}

#[test]
fn try_open_swallows_invalid_configuration() {
    use devio::config::{OpenOption, OptionValue};

    let (_backend, device, _) = hid_pair("loop/badconfig");
    let mut config = OpenConfiguration::new();
    config.set(OpenOption::Exclusive, OptionValue::Millis(7));
    assert!(device.open(&config).is_err());
    assert!(device.try_open(&config).is_none());
}

#[test]
fn try_open_swallows_channel_failure() {
    let (backend, device, _) = hid_pair("loop/refuse");
    backend.port().set_fail_open(true);
    assert!(device.try_open(&OpenConfiguration::new()).is_none());
    assert_eq!(backend.port().free_count(), 0);
}

#[cfg(target_os = "linux")]
#[test]
fn exclusive_open_rejects_second_opener_until_close() {
    isolate_lock_dir();
    let (_backend, first, second) = hid_pair("loop/exclusive");
    let config = OpenConfiguration::new()
        .exclusive(true)
        .lock_timeout(Duration::from_millis(150));

    let held = first.open(&config).expect("first open");
    let err = second.open(&config).map(|_| ()).unwrap_err();
    assert!(matches!(err, DeviceError::Timeout));

    held.close();
    drop(held);
    let reopened = second.open(&config).expect("open after close");
    reopened.close();
}

#[cfg(target_os = "linux")]
#[test]
fn failed_open_releases_exclusive_lock() {
    isolate_lock_dir();
    let (backend, device, _) = hid_pair("loop/exclusive-fail");
    let config = OpenConfiguration::new()
        .exclusive(true)
        .lock_timeout(Duration::from_millis(150));

    backend.port().set_fail_open(true);
    assert!(device.open(&config).is_err());

    // The lock from the failed attempt must not linger.
    backend.port().set_fail_open(false);
    let stream = device.open(&config).expect("open after failed attempt");
    stream.close();
}

#[cfg(target_os = "linux")]
#[test]
fn contender_interrupts_interruptible_holder() {
    isolate_lock_dir();
    let (_backend, holder_dev, contender_dev) = hid_pair("loop/contend");
    let holder_config = OpenConfiguration::new()
        .exclusive(true)
        .interruptible(true)
        .lock_timeout(Duration::from_millis(150));

    let mut holder = holder_dev.open(&holder_config).expect("holder open");
    holder.set_read_timeout(Duration::from_secs(10));
    let holder = Arc::new(holder);

    let reader = Arc::clone(&holder);
    let blocked = thread::spawn(move || {
        let mut buf = [0u8; 8];
        reader.read(&mut buf)
    });
    thread::sleep(Duration::from_millis(100));

    // The contender fails to take the lock but its knock must reach the
    // holder's blocked read.
    let contender_config = OpenConfiguration::new()
        .exclusive(true)
        .lock_timeout(Duration::from_millis(200));
    assert!(contender_dev.open(&contender_config).is_err());

    let result = blocked.join().expect("join");
    assert!(matches!(result, Err(DeviceError::Interrupted)));
    holder.close();
}
