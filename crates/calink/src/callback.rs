//! Callback locking and the process-wide callback-thread facility.
//!
//! Two rules hold everywhere in this crate:
//!
//! 1. the callback lock is strictly outside the state lock — no code
//!    path acquires the callback lock while holding the state lock;
//! 2. a thread executing a user callback is marked, and marked threads
//!    never wait on send backlog (the send task drains for them).

use std::cell::Cell;
use std::sync::Once;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::{Mutex, MutexGuard, watch};

/// How user callbacks are delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CallbackMode {
    /// Callbacks fire on the runtime's receive tasks as responses arrive.
    #[default]
    Preemptive,
    /// Callbacks fire only while the owning thread is inside
    /// [`Context::process_events`](crate::Context::process_events).
    Cooperative,
}

/// The outer lock of the two-lock hierarchy.
///
/// Dispatch paths hold it around every user-visible callback; teardown
/// paths acquire and release it as a barrier guaranteeing no callback is
/// in flight. In cooperative mode dispatch acquisition additionally
/// waits for the event-pump gate; barrier acquisition never does.
pub(crate) struct CallbackLock {
    mutex: Mutex<()>,
    mode: CallbackMode,
    gate_tx: watch::Sender<bool>,
    gate_rx: watch::Receiver<bool>,
    forced: AtomicBool,
}

impl CallbackLock {
    pub fn new(mode: CallbackMode) -> Self {
        let (gate_tx, gate_rx) = watch::channel(false);
        Self {
            mutex: Mutex::new(()),
            mode,
            gate_tx,
            gate_rx,
            forced: AtomicBool::new(false),
        }
    }

    /// Acquire for callback delivery.
    pub async fn dispatch_guard(&self) -> CallbackGuard<'_> {
        if self.mode == CallbackMode::Cooperative && !self.forced.load(Ordering::Acquire) {
            let mut rx = self.gate_rx.clone();
            let _ = rx
                .wait_for(|open| *open || self.forced.load(Ordering::Acquire))
                .await;
        }
        CallbackGuard {
            _guard: self.mutex.lock().await,
        }
    }

    /// Acquire as a barrier: returns once no callback is in flight.
    pub async fn barrier(&self) -> MutexGuard<'_, ()> {
        self.mutex.lock().await
    }

    /// Open or close the cooperative-mode gate.
    pub fn set_gate(&self, open: bool) {
        self.gate_tx.send_replace(open);
    }

    /// Permanently treat the gate as open (context teardown).
    pub fn force_open(&self) {
        self.forced.store(true, Ordering::Release);
        // wake any gate waiters
        let open = *self.gate_rx.borrow();
        self.gate_tx.send_replace(open);
    }
}

/// Proof that the callback lock is held by the current dispatch path.
pub(crate) struct CallbackGuard<'a> {
    _guard: MutexGuard<'a, ()>,
}

thread_local! {
    static IN_CALLBACK: Cell<bool> = const { Cell::new(false) };
}

/// Mark the current thread as a callback thread for the guard's lifetime.
pub(crate) fn enter() -> MarkerGuard {
    let prior = IN_CALLBACK.with(|c| c.replace(true));
    MarkerGuard { prior }
}

/// Whether the current thread is executing inside a callback dispatch.
pub(crate) fn is_callback_thread() -> bool {
    IN_CALLBACK.with(Cell::get)
}

pub(crate) struct MarkerGuard {
    prior: bool,
}

impl Drop for MarkerGuard {
    fn drop(&mut self) {
        IN_CALLBACK.with(|c| c.set(self.prior));
    }
}

static PROCESS_INIT: Once = Once::new();

extern "C" fn process_exit_handler() {
    // SAFETY: restoring the default disposition is always valid.
    unsafe {
        libc::signal(libc::SIGPIPE, libc::SIG_DFL);
    }
}

/// Runs once per process: ignore SIGPIPE so peer resets surface as write
/// errors, and register teardown with the process exit path.
pub(crate) fn process_init() {
    PROCESS_INIT.call_once(|| {
        // SAFETY: SIG_IGN is a valid disposition for SIGPIPE and the
        // handler is installed before any socket exists.
        unsafe {
            libc::signal(libc::SIGPIPE, libc::SIG_IGN);
            libc::atexit(process_exit_handler);
        }
    });
}
