//! Process-wide cleanup coordination.
//!
//! One guard owns teardown for every exit path: normal return from the
//! pipeline, an error unwinding out of it, and an operator interrupt or
//! termination request. Teardown itself is idempotent and serialized on
//! the chroot state, so overlapping paths wait for each other instead of
//! aborting a teardown already in flight.

use anyhow::{Context, Result};
use std::process;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::chroot::Chroot;

/// Exit status after an interrupt, once teardown has run.
const INTERRUPT_EXIT_CODE: i32 = 130;

pub struct CleanupGuard {
    chroot: Arc<Chroot>,
    finalized: Arc<AtomicBool>,
}

impl CleanupGuard {
    /// Install the signal handler (SIGINT and SIGTERM) and return the
    /// guard for the normal exit path. Call once per process.
    ///
    /// The handler always drives a full teardown before exiting: teardown
    /// serializes on the chroot state, so a signal landing while another
    /// path is mid-teardown waits for that teardown to finish, finds
    /// nothing left to do, and only then exits.
    pub fn arm(chroot: Arc<Chroot>) -> Result<Self> {
        let finalized = Arc::new(AtomicBool::new(false));
        let handler_chroot = Arc::clone(&chroot);
        let handler_flag = Arc::clone(&finalized);
        ctrlc::set_handler(move || {
            eprintln!("[live] interrupted, tearing down");
            interrupt_teardown(&handler_chroot, &handler_flag);
            process::exit(INTERRUPT_EXIT_CODE);
        })
        .context("installing interrupt handler")?;
        Ok(Self { chroot, finalized })
    }

    /// Guard without the process-global handler, for tests.
    #[cfg(test)]
    pub fn detached(chroot: Arc<Chroot>) -> Self {
        Self {
            chroot,
            finalized: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Run teardown unless some path already has. Returns whether this
    /// call did the work.
    pub fn finalize(&self) -> bool {
        if self.finalized.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.chroot.exit();
        true
    }
}

impl Drop for CleanupGuard {
    fn drop(&mut self) {
        self.finalize();
    }
}

/// Signal-path teardown. Runs even when the finalized flag is already
/// set: the chroot teardown serializes on its state lock, so this blocks
/// until an in-flight teardown completes and then finds nothing left to
/// do. The flag only spares the normal exit path a redundant pass.
fn interrupt_teardown(chroot: &Chroot, finalized: &AtomicBool) {
    finalized.store(true, Ordering::SeqCst);
    chroot.exit();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chroot::Lifecycle;
    use std::env;
    use std::process::Command;
    use std::thread;
    use std::time::Duration;
    use tempfile::TempDir;

    /// Marks the re-executed child in the signal delivery test below.
    const SIGNAL_CHILD_ENV: &str = "LIVE_BUILDER_SIGNAL_CHILD";

    fn scratch_chroot() -> (TempDir, Arc<Chroot>) {
        let tmp = TempDir::new().unwrap();
        let chroot = Arc::new(Chroot::new(tmp.path().join("chroot")));
        (tmp, chroot)
    }

    #[test]
    fn finalize_runs_teardown_once() {
        let (_tmp, chroot) = scratch_chroot();
        let guard = CleanupGuard::detached(Arc::clone(&chroot));
        assert!(guard.finalize());
        assert!(!guard.finalize());
        assert_eq!(chroot.lifecycle(), Lifecycle::TornDown);
    }

    #[test]
    fn drop_finalizes_when_nothing_else_did() {
        let (_tmp, chroot) = scratch_chroot();
        {
            let _guard = CleanupGuard::detached(Arc::clone(&chroot));
        }
        assert_eq!(chroot.lifecycle(), Lifecycle::TornDown);
    }

    #[test]
    fn interrupt_tears_down_even_when_finalize_already_won() {
        let (_tmp, chroot) = scratch_chroot();
        let flag = AtomicBool::new(true);
        interrupt_teardown(&chroot, &flag);
        assert_eq!(chroot.lifecycle(), Lifecycle::TornDown);
        assert!(flag.load(Ordering::SeqCst));
    }

    #[test]
    fn interrupt_marks_the_guard_finalized() {
        let (_tmp, chroot) = scratch_chroot();
        let guard = CleanupGuard::detached(Arc::clone(&chroot));
        interrupt_teardown(&guard.chroot, &guard.finalized);
        assert!(!guard.finalize());
        assert_eq!(chroot.lifecycle(), Lifecycle::TornDown);
    }

    // Re-executes this test binary: the child arms the handler and sends
    // itself SIGTERM. The handler must run teardown and exit 130 rather
    // than let the default disposition kill the process.
    #[test]
    fn termination_signal_drives_teardown_and_exit() {
        if env::var_os(SIGNAL_CHILD_ENV).is_some() {
            termination_child();
        }
        let exe = env::current_exe().unwrap();
        let status = Command::new(exe)
            .args([
                "cleanup::tests::termination_signal_drives_teardown_and_exit",
                "--exact",
            ])
            .env(SIGNAL_CHILD_ENV, "1")
            .status()
            .unwrap();
        assert_eq!(status.code(), Some(INTERRUPT_EXIT_CODE));
    }

    fn termination_child() -> ! {
        let tmp = TempDir::new().unwrap();
        let chroot = Arc::new(Chroot::new(tmp.path().join("chroot")));
        let _guard = CleanupGuard::arm(chroot).unwrap();
        // SAFETY: sends SIGTERM to this process; no other preconditions.
        unsafe { libc::kill(libc::getpid(), libc::SIGTERM) };
        thread::sleep(Duration::from_secs(5));
        // The handler never fired.
        process::exit(86);
    }
}
