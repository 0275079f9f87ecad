//! Stream lifetime core.
//!
//! Every open device channel is governed by the same atomic triple:
//! `opened` / `closed` / `ref_count`, mutated only through compare-and-swap.
//! The triple prevents two hazards at once: freeing the OS handle while
//! another thread is mid-operation, and double-freeing when an explicit
//! close races a drop. There are no blocking locks on this path, so
//! `acquire`/`release` stay wait-free even while a close is in flight.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::trace;

use crate::error::{DeviceError, Result};

/// A raw device channel supplied by an OS backend.
///
/// Every call is fallible. `free` releases the underlying OS resource and is
/// invoked exactly once, by the lifetime core, when the last reference to
/// the stream is released.
pub trait Channel: Send + Sync {
    /// Blocking read with an upper bound; fails with
    /// [`DeviceError::Timeout`] on expiry and [`DeviceError::Interrupted`]
    /// when woken by [`Channel::wake`].
    fn read(&self, buf: &mut [u8], timeout: Duration) -> Result<usize>;

    /// Blocking write with an upper bound.
    fn write(&self, buf: &[u8], timeout: Duration) -> Result<usize>;

    /// Wakes any blocked read without closing the channel. Safe to call
    /// from any thread.
    fn wake(&self);

    /// Frees the OS resource. Called exactly once.
    fn free(&self);
}

/// The open/closed/reference-count state machine.
#[derive(Debug, Default)]
pub(crate) struct HandleState {
    opened: AtomicU32,
    closed: AtomicU32,
    ref_count: AtomicU32,
}

impl HandleState {
    /// Marks the handle open with one outstanding reference. Called exactly
    /// once, after the backend channel is fully initialized.
    pub fn init_open(&self) {
        self.opened.store(1, Ordering::SeqCst);
        self.ref_count.store(1, Ordering::SeqCst);
    }

    /// Transitions `closed` 0 → 1. True only for the caller that performed
    /// the transition; later callers get false and must do nothing further.
    pub fn request_close(&self) -> bool {
        self.closed
            .compare_exchange(0, 1, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
            && self.opened.load(Ordering::SeqCst) != 0
    }

    /// Takes a reference for an operation about to touch the OS handle.
    /// False once a close was requested or the count already reached zero.
    pub fn acquire(&self) -> bool {
        if self.closed.load(Ordering::SeqCst) != 0 {
            return false;
        }
        loop {
            let n = self.ref_count.load(Ordering::SeqCst);
            if n == 0 {
                return false;
            }
            if self
                .ref_count
                .compare_exchange(n, n + 1, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                return true;
            }
        }
    }

    /// Drops a reference. True when the count reached zero on an opened
    /// handle: the caller must free the backend resource, exactly once.
    pub fn release(&self) -> bool {
        self.ref_count.fetch_sub(1, Ordering::SeqCst) == 1
            && self.opened.load(Ordering::SeqCst) != 0
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst) != 0
    }
}

/// Shared state behind every open stream: the lifetime triple, the backend
/// channel, and the hooks to run when the stream closes.
pub(crate) struct StreamShared {
    state: HandleState,
    channel: Box<dyn Channel>,
    close_hooks: Mutex<Vec<Box<dyn FnOnce() + Send>>>,
}

impl StreamShared {
    /// Wraps a fully initialized backend channel. `init_open` here is the
    /// last step before the stream is handed to the caller.
    pub fn open(channel: Box<dyn Channel>) -> Arc<StreamShared> {
        let shared = Arc::new(StreamShared {
            state: HandleState::default(),
            channel,
            close_hooks: Mutex::new(Vec::new()),
        });
        shared.state.init_open();
        shared
    }

    /// Registers a hook to run exactly once when the stream closes.
    pub fn on_close(&self, hook: Box<dyn FnOnce() + Send>) {
        self.close_hooks.lock().push(hook);
    }

    /// Scoped reference for one operation; fails with
    /// [`DeviceError::Closed`] once the handle is going away.
    pub fn acquire(&self) -> Result<OpGuard<'_>> {
        if self.state.acquire() {
            Ok(OpGuard { shared: self })
        } else {
            Err(DeviceError::Closed)
        }
    }

    fn release(&self) {
        if self.state.release() {
            trace!("last reference released, freeing backend handle");
            self.channel.free();
        }
    }

    /// Forwards an interrupt request into the channel, unblocking any
    /// in-flight read without closing the stream.
    pub fn interrupt(&self) {
        self.channel.wake();
    }

    pub fn is_closed(&self) -> bool {
        self.state.is_closed()
    }

    /// Close: run the close hooks (exclusion release), wake blocked readers,
    /// then drop the initial reference. Idempotent.
    pub fn close(&self) {
        if self.state.request_close() {
            for hook in self.close_hooks.lock().drain(..) {
                hook();
            }
            self.channel.wake();
            self.release();
        }
    }

    pub fn read(&self, buf: &mut [u8], timeout: Duration) -> Result<usize> {
        let guard = self.acquire()?;
        match guard.channel().read(buf, timeout) {
            // A close-triggered wake surfaces as Closed, a plain interrupt
            // leaves the stream usable.
            Err(DeviceError::Interrupted) if self.is_closed() => Err(DeviceError::Closed),
            result => result,
        }
    }

    pub fn write(&self, buf: &[u8], timeout: Duration) -> Result<usize> {
        let guard = self.acquire()?;
        match guard.channel().write(buf, timeout) {
            Err(DeviceError::Interrupted) if self.is_closed() => Err(DeviceError::Closed),
            result => result,
        }
    }
}

/// RAII pairing for `acquire`/`release`: the reference is dropped however
/// the guarded operation exits.
pub(crate) struct OpGuard<'a> {
    shared: &'a StreamShared,
}

impl OpGuard<'_> {
    pub fn channel(&self) -> &dyn Channel {
        &*self.shared.channel
    }
}

impl Drop for OpGuard<'_> {
    fn drop(&mut self) {
        self.shared.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::thread;

    struct CountingChannel {
        frees: Arc<AtomicUsize>,
    }

    impl Channel for CountingChannel {
        fn read(&self, _buf: &mut [u8], _timeout: Duration) -> Result<usize> {
            Ok(0)
        }
        fn write(&self, buf: &[u8], _timeout: Duration) -> Result<usize> {
            Ok(buf.len())
        }
        fn wake(&self) {}
        fn free(&self) {
            self.frees.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn counting() -> (Arc<StreamShared>, Arc<AtomicUsize>) {
        let frees = Arc::new(AtomicUsize::new(0));
        let shared = StreamShared::open(Box::new(CountingChannel {
            frees: frees.clone(),
        }));
        (shared, frees)
    }

    #[test]
    fn acquire_fails_after_close() {
        let (shared, frees) = counting();
        assert!(shared.acquire().is_ok());
        shared.close();
        assert!(matches!(shared.acquire(), Err(DeviceError::Closed)));
        assert!(matches!(shared.acquire(), Err(DeviceError::Closed)));
        assert_eq!(frees.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn close_is_idempotent_and_frees_once() {
        let (shared, frees) = counting();
        shared.close();
        shared.close();
        shared.close();
        assert_eq!(frees.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn free_waits_for_inflight_guard() {
        let (shared, frees) = counting();
        let guard = shared.acquire().expect("open");
        shared.close();
        // The in-flight operation still holds a reference.
        assert_eq!(frees.load(Ordering::SeqCst), 0);
        drop(guard);
        assert_eq!(frees.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn close_hooks_run_exactly_once() {
        let (shared, _frees) = counting();
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = runs.clone();
        shared.on_close(Box::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        shared.close();
        shared.close();
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn concurrent_operations_and_close_free_exactly_once() {
        for _ in 0..50 {
            let (shared, frees) = counting();
            let mut handles = Vec::new();
            for _ in 0..4 {
                let shared = shared.clone();
                handles.push(thread::spawn(move || {
                    let mut buf = [0u8; 4];
                    for _ in 0..100 {
                        let _ = shared.read(&mut buf, Duration::from_millis(1));
                    }
                }));
            }
            let closer = {
                let shared = shared.clone();
                thread::spawn(move || shared.close())
            };
            for h in handles {
                h.join().unwrap();
            }
            closer.join().unwrap();
            assert_eq!(frees.load(Ordering::SeqCst), 1);
        }
    }
}
