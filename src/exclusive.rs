//! Cross-process exclusive access and interrupt delivery.
//!
//! Exclusion is an advisory `flock` on a lock file keyed by the backend's
//! stream path. flock is held per open file description, so two exclusive
//! opens conflict even inside one process. Next to the lock file lives a
//! wake FIFO: a contender writes one byte into it to ask the current holder
//! to yield, and the holder's monitor thread forwards each byte into the
//! stream as an interrupt request.

use std::collections::hash_map::DefaultHasher;
use std::fs::{File, OpenOptions};
use std::hash::{Hash, Hasher};
use std::io::{Read, Write};
use std::os::fd::{AsFd, OwnedFd};
use std::os::unix::fs::OpenOptionsExt;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::fcntl::{Flock, FlockArg, OFlag};
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use nix::sys::stat::Mode;
use nix::unistd::{mkfifo, pipe};
use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use crate::error::{DeviceError, Result};

const RETRY_INTERVAL: Duration = Duration::from_millis(50);

fn lock_dir() -> PathBuf {
    std::env::var_os("DEVIO_LOCK_DIR")
        .or_else(|| std::env::var_os("XDG_RUNTIME_DIR"))
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("/tmp"))
}

fn lock_base(stream_path: &str) -> PathBuf {
    let mut hasher = DefaultHasher::new();
    stream_path.hash(&mut hasher);
    lock_dir().join(format!("devio-{:016x}", hasher.finish()))
}

/// Holds the cross-process exclusion for one stream path.
///
/// `release` is safe to call any number of times; the first call drops the
/// lock, removes the FIFO, and stops the monitor thread.
pub(crate) struct DeviceOpenGuard {
    lock: Mutex<Option<Flock<File>>>,
    fifo_path: Option<PathBuf>,
    // Read end handed to the monitor thread by `watch`; our own write end
    // keeps the FIFO from reporting hangup while no contender is connected.
    fifo_rx: Mutex<Option<File>>,
    fifo_tx: Mutex<Option<File>>,
    shutdown_tx: Mutex<Option<OwnedFd>>,
}

impl DeviceOpenGuard {
    /// Acquires the exclusion primitive for `stream_path`, retrying up to
    /// `timeout`, then failing with [`DeviceError::Timeout`]. When waiting,
    /// the contender nudges the holder's wake FIFO once so an interruptible
    /// holder can yield.
    pub fn acquire(
        stream_path: &str,
        timeout: Duration,
        interruptible: bool,
    ) -> Result<DeviceOpenGuard> {
        let base = lock_base(stream_path);
        let lock_path = base.with_extension("lock");
        let fifo_path = base.with_extension("wake");

        let deadline = Instant::now() + timeout;
        let mut nudged = false;
        let lock = loop {
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .open(&lock_path)?;
            match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
                Ok(lock) => break lock,
                Err((_, Errno::EWOULDBLOCK)) => {
                    if !nudged {
                        nudge(&fifo_path);
                        nudged = true;
                    }
                    let now = Instant::now();
                    if now >= deadline {
                        debug!(stream_path, "exclusive lock acquisition timed out");
                        return Err(DeviceError::Timeout);
                    }
                    std::thread::sleep(RETRY_INTERVAL.min(deadline - now));
                }
                Err((_, errno)) => return Err(errno.into()),
            }
        };
        trace!(stream_path, lock = %lock_path.display(), "exclusive lock acquired");

        let mut guard = DeviceOpenGuard {
            lock: Mutex::new(Some(lock)),
            fifo_path: None,
            fifo_rx: Mutex::new(None),
            fifo_tx: Mutex::new(None),
            shutdown_tx: Mutex::new(None),
        };

        if interruptible {
            // Stale FIFOs from a crashed holder are replaced; we own the
            // lock now, so nobody else is serving this path.
            let _ = std::fs::remove_file(&fifo_path);
            mkfifo(&fifo_path, Mode::from_bits_truncate(0o622))?;
            let rx = OpenOptions::new()
                .read(true)
                .custom_flags(OFlag::O_NONBLOCK.bits())
                .open(&fifo_path)?;
            let tx = OpenOptions::new()
                .write(true)
                .custom_flags(OFlag::O_NONBLOCK.bits())
                .open(&fifo_path)?;
            guard.fifo_path = Some(fifo_path);
            guard.fifo_rx = Mutex::new(Some(rx));
            guard.fifo_tx = Mutex::new(Some(tx));
        }

        Ok(guard)
    }

    /// Starts the monitor thread forwarding wake bytes to `hook`. No-op for
    /// non-interruptible holders or when called twice.
    pub fn watch(&self, hook: Box<dyn Fn() + Send>) {
        let Some(fifo) = self.fifo_rx.lock().take() else {
            return;
        };
        let (shutdown_rx, shutdown_tx) = match pipe() {
            Ok(ends) => ends,
            Err(e) => {
                warn!("failed to create interrupt monitor pipe: {e}");
                return;
            }
        };
        *self.shutdown_tx.lock() = Some(shutdown_tx);

        let spawned = std::thread::Builder::new()
            .name("devio-open-watch".into())
            .spawn(move || {
                loop {
                    let mut fds = [
                        PollFd::new(fifo.as_fd(), PollFlags::POLLIN),
                        PollFd::new(shutdown_rx.as_fd(), PollFlags::POLLIN),
                    ];
                    match poll(&mut fds, PollTimeout::NONE) {
                        Err(Errno::EINTR) => continue,
                        Err(_) => break,
                        Ok(_) => {}
                    }
                    if fds[1].revents().is_some_and(|r| !r.is_empty()) {
                        break;
                    }
                    if fds[0].revents().is_some_and(|r| r.contains(PollFlags::POLLIN)) {
                        let mut buf = [0u8; 16];
                        if let Ok(n) = (&fifo).read(&mut buf) {
                            if n > 0 {
                                trace!("delivering an interrupt request");
                                hook();
                            }
                        }
                    }
                }
            });
        if let Err(e) = spawned {
            warn!("failed to spawn interrupt monitor thread: {e}");
        }
    }

    /// Releases the exclusion. Multi-call safe.
    pub fn release(&self) {
        if let Some(tx) = self.shutdown_tx.lock().take() {
            let _ = nix::unistd::write(&tx, &[0]);
        }
        self.fifo_rx.lock().take();
        self.fifo_tx.lock().take();
        if let Some(lock) = self.lock.lock().take() {
            if let Some(fifo_path) = &self.fifo_path {
                let _ = std::fs::remove_file(fifo_path);
            }
            drop(lock); // unlocks and closes the lock file
            trace!("exclusive lock released");
        }
    }
}

impl Drop for DeviceOpenGuard {
    fn drop(&mut self) {
        self.release();
    }
}

/// Asks the current holder (if any) to yield by writing one byte into its
/// wake FIFO. Quietly does nothing when no interruptible holder is serving
/// the path.
fn nudge(fifo_path: &std::path::Path) {
    let opened = OpenOptions::new()
        .write(true)
        .custom_flags(OFlag::O_NONBLOCK.bits())
        .open(fifo_path);
    if let Ok(mut fifo) = opened {
        let _ = fifo.write(&[1]);
    }
}
