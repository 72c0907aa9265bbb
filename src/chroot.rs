//! Chroot lifecycle management.
//!
//! Prepares the staging tree so provisioning hooks behave inside it: pseudo
//! filesystems mounted, service starts blocked, the service-restart shim
//! diverted to a no-op. Teardown reverses all of it. Entering is fatal on
//! any failure; teardown is best-effort all the way through so it can run
//! from error paths, the cleanup guard, and the interrupt handler.

use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use crate::host;
use crate::mount::{self, MountPoint};
use crate::reaper;

/// Service-start blocker, relative to the root.
pub const POLICY_RC_D: &str = "usr/sbin/policy-rc.d";

/// Service-restart shim that gets diverted, relative to the root.
pub const INVOKE_RC_D: &str = "usr/sbin/invoke-rc.d";

/// Diversion target as seen from inside the root.
const DIVERT_TARGET: &str = "/usr/sbin/invoke-rc.d";

/// Installed at `policy-rc.d`. Status 101 is the policy-layer convention
/// for "service action forbidden"; package hooks check it and skip starts.
const POLICY_BLOCK_SCRIPT: &str = "#!/bin/sh\nexit 101\n";

/// No-op standing in for the diverted invoke-rc.d.
const INVOKE_NOOP_SCRIPT: &str = "#!/bin/sh\nexit 0\n";

/// Lifecycle of the staging tree within one process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    /// No preparation has happened yet.
    Absent,
    /// Mounts and service blockers are in place.
    Prepared,
    /// Provisioning ran to completion.
    Built,
    /// Teardown ran.
    TornDown,
}

#[derive(Debug)]
struct ChrootState {
    lifecycle: Lifecycle,
    mounted: Vec<MountPoint>,
    service_block_installed: bool,
    invoke_rcd_diverted: bool,
}

/// Manages one chroot staging tree. Shared between the pipeline and the
/// cleanup guard via `Arc`; state sits behind a mutex so the interrupt
/// handler thread can drive teardown.
#[derive(Debug)]
pub struct Chroot {
    root: PathBuf,
    state: Mutex<ChrootState>,
}

/// Mounts the lifecycle manages, in mount order.
fn chroot_mounts(root: &Path) -> Vec<MountPoint> {
    vec![
        MountPoint::bind("/dev", root.join("dev")),
        MountPoint::bind("/run", root.join("run")),
        MountPoint::typed("proc", root.join("proc"), None),
        MountPoint::typed("sysfs", root.join("sys"), None),
        MountPoint::typed("devpts", root.join("dev/pts"), Some("gid=5,mode=620")),
    ]
}

/// Unmount order for teardown. Not the reverse of the mount order: devpts
/// nests inside the dev bind and must release first.
fn unmount_order(root: &Path) -> [PathBuf; 5] {
    [
        root.join("dev/pts"),
        root.join("dev"),
        root.join("proc"),
        root.join("sys"),
        root.join("run"),
    ]
}

impl Chroot {
    pub fn new(root: PathBuf) -> Self {
        Self {
            root,
            state: Mutex::new(ChrootState {
                lifecycle: Lifecycle::Absent,
                mounted: Vec::new(),
                service_block_installed: false,
                invoke_rcd_diverted: false,
            }),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn lifecycle(&self) -> Lifecycle {
        self.lock().lifecycle
    }

    pub fn service_block_installed(&self) -> bool {
        self.lock().service_block_installed
    }

    pub fn invoke_rcd_diverted(&self) -> bool {
        self.lock().invoke_rcd_diverted
    }

    /// Mounts this manager believes are active, in mount order.
    pub fn active_mounts(&self) -> Vec<MountPoint> {
        self.lock().mounted.clone()
    }

    /// Teardown must proceed even if a panic poisoned the lock.
    fn lock(&self) -> MutexGuard<'_, ChrootState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Prepare the tree for provisioning: mount point directories, the five
    /// pseudo-filesystem mounts, the service-start blocker, and the
    /// invoke-rc.d diversion.
    ///
    /// Idempotent: re-entering a prepared tree re-asserts each piece
    /// without doubling any of them. Any failure is fatal; partial state is
    /// left for [`Chroot::exit`] to clean up.
    pub fn enter(&self) -> Result<()> {
        let mut state = self.lock();

        println!("[chroot] entering '{}'", self.root.display());

        self.create_mount_dirs()?;

        for mount_point in chroot_mounts(&self.root) {
            mount::ensure_mounted(&mount_point)
                .with_context(|| format!("preparing chroot '{}'", self.root.display()))?;
            if !state.mounted.contains(&mount_point) {
                state.mounted.push(mount_point);
            }
        }

        self.install_script(POLICY_RC_D, POLICY_BLOCK_SCRIPT, "service-start blocker")?;
        state.service_block_installed = true;

        if !state.invoke_rcd_diverted {
            self.divert_invoke_rcd()?;
            state.invoke_rcd_diverted = true;
        }

        state.lifecycle = Lifecycle::Prepared;
        Ok(())
    }

    /// Record that provisioning completed.
    pub fn mark_built(&self) {
        self.lock().lifecycle = Lifecycle::Built;
    }

    /// Tear down everything `enter` set up: restore the diversion, remove
    /// the blocker, reap holders, unmount in strict order, then sweep the
    /// live mount table for anything left under the root.
    ///
    /// Every step logs and continues on failure. Safe to call repeatedly
    /// and from any lifecycle state; a second call finds nothing to do.
    pub fn exit(&self) {
        let mut state = self.lock();

        let live = mount::mounts_under(&self.root);
        let prepared = matches!(state.lifecycle, Lifecycle::Prepared | Lifecycle::Built);
        if prepared || !live.is_empty() {
            println!("[chroot] tearing down '{}'", self.root.display());
        }

        self.undivert_invoke_rcd(&mut state);
        self.remove_service_blocker(&mut state);

        if !live.is_empty() {
            reaper::reap(&self.root);
        }

        for target in unmount_order(&self.root) {
            mount::ensure_unmounted(&target);
        }

        // Sweep: anything still mounted under the root, deepest first, gets
        // a lazy forced detach. Covers mounts made out-of-band by hooks.
        for target in mount::mounts_under(&self.root) {
            eprintln!("[chroot] forcing lazy unmount of '{}'", target.display());
            if let Err(err) = mount::force_unmount_lazy(&target) {
                eprintln!(
                    "[chroot] warning: lazy unmount of '{}' failed: {err:#}",
                    target.display()
                );
            }
        }

        state.mounted.clear();
        state.lifecycle = Lifecycle::TornDown;
    }

    fn create_mount_dirs(&self) -> Result<()> {
        let mut cmd = host::privileged("mkdir");
        cmd.arg("-p");
        for dir in ["dev/pts", "proc", "sys", "run"] {
            cmd.arg(self.root.join(dir));
        }
        host::run_capture(&mut cmd, "creating chroot mount point directories")?;
        Ok(())
    }

    fn divert_invoke_rcd(&self) -> Result<()> {
        let mut divert = host::privileged("chroot");
        divert.arg(&self.root).args([
            "dpkg-divert",
            "--local",
            "--rename",
            "--add",
            DIVERT_TARGET,
        ]);
        host::run_capture(&mut divert, "diverting invoke-rc.d")?;
        self.install_script(INVOKE_RC_D, INVOKE_NOOP_SCRIPT, "invoke-rc.d replacement")
    }

    fn undivert_invoke_rcd(&self, state: &mut ChrootState) {
        if !state.invoke_rcd_diverted {
            return;
        }
        // Remove our no-op first so dpkg-divert can rename the original back.
        let replacement = self.root.join(INVOKE_RC_D);
        if replacement.exists() {
            let mut rm = host::privileged("rm");
            rm.arg("-f").arg(&replacement);
            if let Err(err) = host::run_capture(&mut rm, "removing invoke-rc.d replacement") {
                eprintln!("[chroot] warning: {err:#}");
            }
        }
        let mut divert = host::privileged("chroot");
        divert.arg(&self.root).args([
            "dpkg-divert",
            "--local",
            "--rename",
            "--remove",
            DIVERT_TARGET,
        ]);
        if let Err(err) = host::run_capture(&mut divert, "removing invoke-rc.d diversion") {
            eprintln!("[chroot] warning: {err:#}");
        }
        state.invoke_rcd_diverted = false;
    }

    /// Blocker removal is unconditional; a missing file is a no-op.
    fn remove_service_blocker(&self, state: &mut ChrootState) {
        let target = self.root.join(POLICY_RC_D);
        if target.exists() {
            let mut cmd = host::privileged("rm");
            cmd.arg("-f").arg(&target);
            if let Err(err) = host::run_capture(&mut cmd, "removing service-start blocker") {
                eprintln!("[chroot] warning: {err:#}");
            }
        }
        state.service_block_installed = false;
    }

    /// Stage `content` beside the root, then install it into the root-owned
    /// tree with the executable bit set.
    fn install_script(&self, rel_path: &str, content: &str, what: &str) -> Result<()> {
        let staging = self.staging_path(rel_path);
        fs::write(&staging, content)
            .with_context(|| format!("staging {what} at '{}'", staging.display()))?;
        let target = self.root.join(rel_path);
        let mut cmd = host::privileged("install");
        cmd.args(["-m", "0755"]).arg(&staging).arg(&target);
        let result = host::run_capture(&mut cmd, &format!("installing {what}"));
        let _ = fs::remove_file(&staging);
        result?;
        Ok(())
    }

    fn staging_path(&self, rel_path: &str) -> PathBuf {
        let name = rel_path.replace('/', "-");
        let parent = self.root.parent().unwrap_or(&self.root);
        parent.join(format!(".{name}.tmp"))
    }
}
