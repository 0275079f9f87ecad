//! Poll-driven channel over a raw file descriptor.

use std::os::fd::{AsFd, AsRawFd, BorrowedFd, IntoRawFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicI32, Ordering};
use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::fcntl::OFlag;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use nix::unistd;

use crate::error::{DeviceError, Result};
use crate::stream::Channel;

/// A device channel backed by a descriptor on e.g. a hidraw or tty node.
///
/// Reads block in `poll` on two descriptors at once: the device and the
/// read end of a self-pipe. A byte written to the pipe by [`Channel::wake`]
/// makes the poll return without touching the device, which is how
/// interrupts unblock readers without closing anything. The device fd is
/// stored as an atomic so that the one-shot free and the drop backstop can
/// never close it twice.
pub struct FdChannel {
    fd: AtomicI32,
    wake_rx: OwnedFd,
    wake_tx: OwnedFd,
}

impl FdChannel {
    pub fn new(fd: OwnedFd) -> Result<FdChannel> {
        let (wake_rx, wake_tx) = unistd::pipe2(OFlag::O_NONBLOCK | OFlag::O_CLOEXEC)?;
        Ok(FdChannel {
            fd: AtomicI32::new(fd.into_raw_fd()),
            wake_rx,
            wake_tx,
        })
    }

    fn current_fd(&self) -> Result<RawFd> {
        let raw = self.fd.load(Ordering::SeqCst);
        if raw < 0 {
            return Err(DeviceError::Closed);
        }
        Ok(raw)
    }

    /// Borrows the descriptor for ancillary syscalls (termios and ioctls).
    /// Callers must hold an operation guard so the free cannot race this.
    pub(super) fn borrow_fd(&self) -> Result<BorrowedFd<'_>> {
        Ok(unsafe { BorrowedFd::borrow_raw(self.current_fd()?) })
    }

    fn drain_wake_pipe(&self) {
        let mut sink = [0u8; 16];
        while matches!(unistd::read(self.wake_rx.as_raw_fd(), &mut sink), Ok(n) if n > 0) {}
    }

    /// Polls the device for `events`, returning false if the deadline
    /// passed and Interrupted if the wake pipe fired first.
    fn wait(&self, raw: RawFd, events: PollFlags, deadline: Instant) -> Result<bool> {
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(false);
            }
            let ms = remaining.as_millis().min(u16::MAX as u128) as u16;
            let dev = unsafe { BorrowedFd::borrow_raw(raw) };
            let mut fds = [
                PollFd::new(dev, events),
                PollFd::new(self.wake_rx.as_fd(), PollFlags::POLLIN),
            ];
            match poll(&mut fds, PollTimeout::from(ms)) {
                Ok(0) => return Ok(false),
                Ok(_) => {
                    if fds[1].revents().unwrap_or(PollFlags::empty()).contains(PollFlags::POLLIN) {
                        self.drain_wake_pipe();
                        return Err(DeviceError::Interrupted);
                    }
                    return Ok(true);
                }
                Err(Errno::EINTR) => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }
}

impl Channel for FdChannel {
    fn read(&self, buf: &mut [u8], timeout: Duration) -> Result<usize> {
        let deadline = Instant::now() + timeout;
        let raw = self.current_fd()?;
        loop {
            if !self.wait(raw, PollFlags::POLLIN, deadline)? {
                return Err(DeviceError::Timeout);
            }
            match unistd::read(raw, buf) {
                Ok(n) => return Ok(n),
                Err(Errno::EINTR) | Err(Errno::EAGAIN) => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn write(&self, buf: &[u8], timeout: Duration) -> Result<usize> {
        let deadline = Instant::now() + timeout;
        let raw = self.current_fd()?;
        loop {
            if !self.wait(raw, PollFlags::POLLOUT, deadline)? {
                return Err(DeviceError::Timeout);
            }
            let dev = unsafe { BorrowedFd::borrow_raw(raw) };
            match unistd::write(dev, buf) {
                Ok(n) => return Ok(n),
                Err(Errno::EINTR) | Err(Errno::EAGAIN) => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn wake(&self) {
        let _ = unistd::write(&self.wake_tx, &[1u8]);
    }

    fn free(&self) {
        let raw = self.fd.swap(-1, Ordering::SeqCst);
        if raw >= 0 {
            let _ = unistd::close(raw);
        }
    }
}

impl Drop for FdChannel {
    fn drop(&mut self) {
        // Backstop for channels that never reached the lifetime core.
        self.free();
    }
}
