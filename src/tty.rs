//! Scoped terminal state for interactive key entry.
//!
//! While a [`TerminalGuard`] is alive:
//! - echo is disabled on the terminal,
//! - `SIGINT` is intercepted instead of killing the process,
//! - `SIGTSTP` is ignored so the shell cannot suspend us with echo off.
//!
//! Dropping the guard restores the terminal attributes and the previous
//! signal dispositions, in that order, on every exit path. An interrupt
//! caught in between trips the caller's [`CancelToken`] and is then
//! re-delivered to the process, so the default (or the caller's own)
//! `SIGINT` handling still happens, just with a sane terminal.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

#[cfg(unix)]
pub use self::unix::TerminalGuard;

/// Cancellation flag shared between a blocking read and its owner.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Clear the flag before starting a new read.
    pub fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

#[cfg(unix)]
mod unix {
    use std::io;
    use std::os::fd::RawFd;
    use std::sync::atomic::{AtomicI32, Ordering};

    use super::CancelToken;

    // Signal handlers can only reach statics. The slot is written by the
    // handler and drained by the guard that installed it.
    static CAUGHT_SIGNAL: AtomicI32 = AtomicI32::new(0);

    extern "C" fn record_signal(sig: libc::c_int) {
        CAUGHT_SIGNAL.store(sig, Ordering::SeqCst);
    }

    /// Previous `SIGINT`/`SIGTSTP` dispositions.
    pub(super) struct SignalGuard {
        old_int: libc::sigaction,
        old_tstp: libc::sigaction,
        cancel: CancelToken,
    }

    impl SignalGuard {
        pub(super) fn install(cancel: CancelToken) -> Self {
            CAUGHT_SIGNAL.store(0, Ordering::SeqCst);

            // SAFETY: sigaction structs are plain C data; zeroed is a valid
            // initial state and every pointer passed refers to a live local.
            unsafe {
                let mut act: libc::sigaction = std::mem::zeroed();
                let mut old_int: libc::sigaction = std::mem::zeroed();
                let mut old_tstp: libc::sigaction = std::mem::zeroed();

                libc::sigemptyset(&mut act.sa_mask);
                // No SA_RESTART: the blocking read must return EINTR.
                act.sa_flags = 0;
                let handler: extern "C" fn(libc::c_int) = record_signal;
                act.sa_sigaction = handler as libc::sighandler_t;
                libc::sigaction(libc::SIGINT, &act, &mut old_int);

                act.sa_sigaction = libc::SIG_IGN;
                libc::sigaction(libc::SIGTSTP, &act, &mut old_tstp);

                Self {
                    old_int,
                    old_tstp,
                    cancel,
                }
            }
        }

        pub(super) fn interrupted(&self) -> bool {
            CAUGHT_SIGNAL.load(Ordering::SeqCst) != 0
        }
    }

    impl Drop for SignalGuard {
        fn drop(&mut self) {
            // SAFETY: restores dispositions captured by `install`.
            unsafe {
                libc::sigaction(libc::SIGINT, &self.old_int, std::ptr::null_mut());
                libc::sigaction(libc::SIGTSTP, &self.old_tstp, std::ptr::null_mut());
            }

            let sig = CAUGHT_SIGNAL.swap(0, Ordering::SeqCst);
            if sig != 0 {
                self.cancel.cancel();
                // SAFETY: raising a signal on our own process.
                unsafe {
                    libc::raise(sig);
                }
            }
        }
    }

    /// Saved terminal attributes.
    struct EchoGuard {
        fd: RawFd,
        saved: libc::termios,
    }

    impl EchoGuard {
        fn disable_echo(fd: RawFd) -> io::Result<Self> {
            // SAFETY: termios is plain C data and `fd` is a terminal
            // descriptor owned by the caller for the guard's lifetime.
            unsafe {
                let mut saved: libc::termios = std::mem::zeroed();
                if libc::tcgetattr(fd, &mut saved) != 0 {
                    return Err(io::Error::last_os_error());
                }

                let mut quiet = saved;
                quiet.c_lflag &= !(libc::ECHO | libc::ECHOE | libc::ECHOK | libc::ECHONL);
                if libc::tcsetattr(fd, libc::TCSAFLUSH, &quiet) != 0 {
                    return Err(io::Error::last_os_error());
                }

                Ok(Self { fd, saved })
            }
        }
    }

    impl Drop for EchoGuard {
        fn drop(&mut self) {
            // SAFETY: restores the attributes read in `disable_echo`.
            unsafe {
                libc::tcsetattr(self.fd, libc::TCSAFLUSH, &self.saved);
            }
        }
    }

    /// Echo-off, interrupt-aware scope around one interactive read.
    pub struct TerminalGuard {
        // Field order is drop order: terminal first, then signals.
        _echo: EchoGuard,
        signals: SignalGuard,
    }

    impl TerminalGuard {
        /// Take over the terminal on `fd`.
        ///
        /// Signals are hooked before echo is changed, so an interrupt can never
        /// kill the process while echo is off.
        pub fn engage(fd: RawFd, cancel: CancelToken) -> io::Result<Self> {
            let signals = SignalGuard::install(cancel);
            let echo = EchoGuard::disable_echo(fd)?;
            Ok(Self {
                _echo: echo,
                signals,
            })
        }

        /// Returns true once `SIGINT` has arrived during this scope.
        pub fn interrupted(&self) -> bool {
            self.signals.interrupted()
        }
    }
}
