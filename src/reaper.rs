//! Process cleanup for the chroot staging tree.
//!
//! A provisioning step can leave daemons behind whose root or working
//! directory sits inside the staging tree, which keeps its mounts busy. The
//! reaper lists them once for the operator, then makes a bounded number of
//! kill passes. It never fails: a holder that survives only means the later
//! unmount falls back to a lazy detach.

use std::path::Path;
use std::thread;
use std::time::Duration;

use crate::host;

/// Kill passes attempted before giving up.
const KILL_PASSES: u32 = 3;

/// Pause after each pass, giving signalled processes time to exit.
const PASS_DELAY: Duration = Duration::from_secs(1);

/// Terminate processes holding the staging tree open. Best-effort; never
/// returns an error and never guarantees zero holders remain.
pub fn reap(root: &Path) {
    list_open_handles(root);

    for pass in 1..=KILL_PASSES {
        if !kill_holders(root) {
            return;
        }
        println!(
            "[chroot] kill pass {pass}/{KILL_PASSES} signalled processes under '{}'",
            root.display()
        );
        thread::sleep(PASS_DELAY);
    }
}

/// One diagnostic listing of open handles under the root. A missing or
/// failing lookup tool is noted, never fatal.
fn list_open_handles(root: &Path) {
    let mut cmd = host::privileged("lsof");
    cmd.arg("+D").arg(root);
    match cmd.output() {
        Ok(output) if output.status.success() => {
            let listing = String::from_utf8_lossy(&output.stdout);
            let listing = listing.trim();
            if !listing.is_empty() {
                println!(
                    "[chroot] open handles under '{}':\n{listing}",
                    root.display()
                );
            }
        }
        // lsof exits non-zero when nothing holds the tree.
        Ok(_) => {}
        Err(err) => {
            eprintln!("[chroot] warning: cannot list open handles (lsof unavailable): {err}");
        }
    }
}

/// Send one kill pass to anything holding the tree. Returns whether any
/// process was signalled.
fn kill_holders(root: &Path) -> bool {
    let mut cmd = host::privileged("fuser");
    cmd.arg("-k").arg(root);
    match cmd.output() {
        // fuser exits zero only when at least one process matched.
        Ok(output) => output.status.success(),
        Err(err) => {
            eprintln!("[chroot] warning: kill pass failed to run fuser: {err}");
            false
        }
    }
}
