//! Signal flags
//!
//! Handlers only set atomic flags; the event loop acts on them between
//! polls. The first SIGTERM or SIGINT asks for a graceful shutdown. A
//! second one exits at once with status 1 from inside the handler, without
//! flushing anything.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use signal_hook::consts::{SIGHUP, SIGINT, SIGTERM, SIGUSR1};
use signal_hook::flag;

/// Pending signal flags shared with the handlers.
#[derive(Debug, Clone, Default)]
pub struct Signals {
    terminate: Arc<AtomicBool>,
    hangup: Arc<AtomicBool>,
    user1: Arc<AtomicBool>,
}

impl Signals {
    /// Flags with no handlers installed.
    pub fn new() -> Self {
        Self::default()
    }

    /// Install the process signal handlers.
    pub fn register(&self) -> io::Result<()> {
        for signal in [SIGTERM, SIGINT] {
            // Registered first so it sees the flag as the previous signal
            // left it.
            flag::register_conditional_shutdown(signal, 1, Arc::clone(&self.terminate))?;
            flag::register(signal, Arc::clone(&self.terminate))?;
        }
        flag::register(SIGHUP, Arc::clone(&self.hangup))?;
        flag::register(SIGUSR1, Arc::clone(&self.user1))?;
        Ok(())
    }

    /// Whether shutdown was requested.
    pub fn terminate_requested(&self) -> bool {
        self.terminate.load(Ordering::Acquire)
    }

    /// Request shutdown without a signal.
    pub fn request_terminate(&self) {
        self.terminate.store(true, Ordering::Release);
    }

    /// Consume a pending SIGHUP.
    pub fn take_hangup(&self) -> bool {
        self.hangup.swap(false, Ordering::AcqRel)
    }

    /// Consume a pending SIGUSR1.
    pub fn take_user1(&self) -> bool {
        self.user1.swap(false, Ordering::AcqRel)
    }
}
