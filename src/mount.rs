//! Mount management for the chroot staging tree.
//!
//! Wraps `mount`/`umount` behind idempotent operations keyed off the live
//! mount table in `/proc/self/mounts`. Privileged invocations go through
//! [`crate::host`].

use anyhow::Result;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use crate::host;

const MOUNTS_FILE: &str = "/proc/self/mounts";

/// A single mount the lifecycle manages.
///
/// `fstype == None` marks a bind mount of `source`; otherwise the mount is a
/// typed pseudo-filesystem mount.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountPoint {
    /// Source device, tree, or pseudo-filesystem name.
    pub source: String,
    /// Target path inside the staging tree.
    pub target: PathBuf,
    /// Filesystem type for typed mounts.
    pub fstype: Option<String>,
    /// Options passed through with `-o`.
    pub options: Option<String>,
}

impl MountPoint {
    /// Bind mount of a host tree.
    pub fn bind(source: &str, target: PathBuf) -> Self {
        Self {
            source: source.to_string(),
            target,
            fstype: None,
            options: None,
        }
    }

    /// Typed pseudo-filesystem mount. The source name follows the fstype,
    /// matching how the kernel reports these mounts.
    pub fn typed(fstype: &str, target: PathBuf, options: Option<&str>) -> Self {
        Self {
            source: fstype.to_string(),
            target,
            fstype: Some(fstype.to_string()),
            options: options.map(str::to_string),
        }
    }

    pub fn is_bind(&self) -> bool {
        self.fstype.is_none()
    }

    fn mount_args(&self) -> Vec<String> {
        let mut args = Vec::new();
        match &self.fstype {
            None => args.push("--bind".to_string()),
            Some(fstype) => {
                args.push("-t".to_string());
                args.push(fstype.clone());
            }
        }
        if let Some(options) = &self.options {
            args.push("-o".to_string());
            args.push(options.clone());
        }
        args.push(self.source.clone());
        args.push(self.target.display().to_string());
        args
    }
}

impl fmt::Display for MountPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.fstype {
            Some(fstype) => write!(f, "{} at '{}'", fstype, self.target.display()),
            None => write!(f, "bind of '{}' at '{}'", self.source, self.target.display()),
        }
    }
}

/// Check if a path is currently a mount point by inspecting the mount table.
pub fn is_mounted(path: &Path) -> bool {
    let canonical = canonicalize_or_raw(path);
    match fs::read_to_string(MOUNTS_FILE) {
        Ok(table) => mount_targets(&table).iter().any(|target| *target == canonical),
        Err(_) => false,
    }
}

/// Mount unless the target is already a mount point.
///
/// Repeat calls are no-ops; an already-mounted target never gets a second
/// mount stacked on top. Failure to mount a not-mounted target is an error.
pub fn ensure_mounted(mount: &MountPoint) -> Result<()> {
    if is_mounted(&mount.target) {
        return Ok(());
    }
    let mut cmd = host::privileged("mount");
    cmd.args(mount.mount_args());
    host::run_capture(&mut cmd, &format!("mounting {mount}"))?;
    Ok(())
}

/// Unmount `target` if it is currently a mount point; otherwise a no-op.
///
/// Failure is logged and swallowed here so teardown keeps walking the
/// remaining mounts; the final sweep picks up anything left behind.
pub fn ensure_unmounted(target: &Path) {
    if !is_mounted(target) {
        return;
    }
    let mut cmd = host::privileged("umount");
    cmd.arg(target);
    if let Err(err) = host::run_capture(&mut cmd, &format!("unmounting '{}'", target.display())) {
        eprintln!("[mount] warning: {err:#}");
    }
}

/// Lazy, forced unmount for the teardown sweep.
pub fn force_unmount_lazy(target: &Path) -> Result<()> {
    let mut cmd = host::privileged("umount");
    cmd.args(["-l", "-f"]).arg(target);
    host::run_capture(
        &mut cmd,
        &format!("lazy-unmounting '{}'", target.display()),
    )?;
    Ok(())
}

/// Live mount targets at or under `root`, deepest paths first.
pub fn mounts_under(root: &Path) -> Vec<PathBuf> {
    let canonical = canonicalize_or_raw(root);
    let table = fs::read_to_string(MOUNTS_FILE).unwrap_or_default();
    targets_under(&mount_targets(&table), &canonical)
}

fn canonicalize_or_raw(path: &Path) -> PathBuf {
    fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf())
}

fn mount_targets(table: &str) -> Vec<PathBuf> {
    table
        .lines()
        .filter_map(|line| line.split_whitespace().nth(1))
        .map(|raw| PathBuf::from(unescape_mount_path(raw)))
        .collect()
}

fn targets_under(targets: &[PathBuf], root: &Path) -> Vec<PathBuf> {
    let mut under: Vec<PathBuf> = targets
        .iter()
        .filter(|target| target.starts_with(root))
        .cloned()
        .collect();
    // Deepest mounts first; a nested mount must release before its parent.
    under.sort_by_key(|target| std::cmp::Reverse(target.components().count()));
    under
}

/// Decode the octal escapes the kernel uses for whitespace in mount paths.
fn unescape_mount_path(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        let escape: String = chars.by_ref().take(3).collect();
        match escape.as_str() {
            "040" => out.push(' '),
            "011" => out.push('\t'),
            "012" => out.push('\n'),
            "134" => out.push('\\'),
            other => {
                out.push('\\');
                out.push_str(other);
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const TABLE: &str = "\
sysfs /sys sysfs rw,nosuid,nodev,noexec,relatime 0 0
proc /proc proc rw,nosuid,nodev,noexec,relatime 0 0
udev /dev devtmpfs rw,nosuid,relatime,mode=755 0 0
devpts /work/chroot/dev/pts devpts rw,nosuid,noexec,gid=5,mode=620 0 0
udev /work/chroot/dev devtmpfs rw,nosuid,relatime 0 0
proc /work/chroot/proc proc rw,relatime 0 0
sysfs /work/chroot/sys sysfs rw,relatime 0 0
tmpfs /work/chroot/run tmpfs rw,nosuid,nodev 0 0
tmpfs /work/chroot2/run tmpfs rw,nosuid,nodev 0 0
tmpfs /mnt/spaced\\040dir tmpfs rw 0 0
";

    #[test]
    fn parses_the_target_field() {
        let targets = mount_targets(TABLE);
        assert_eq!(targets[0], PathBuf::from("/sys"));
        assert_eq!(targets[3], PathBuf::from("/work/chroot/dev/pts"));
        assert_eq!(targets.last().unwrap(), &PathBuf::from("/mnt/spaced dir"));
    }

    #[test]
    fn unescapes_kernel_octal_sequences() {
        assert_eq!(unescape_mount_path(r"/mnt/a\040b"), "/mnt/a b");
        assert_eq!(unescape_mount_path(r"/mnt/a\011b"), "/mnt/a\tb");
        assert_eq!(unescape_mount_path(r"/mnt/a\134b"), "/mnt/a\\b");
        assert_eq!(unescape_mount_path("/plain/path"), "/plain/path");
    }

    #[test]
    fn targets_under_filters_by_component_and_sorts_deepest_first() {
        let targets = mount_targets(TABLE);
        let under = targets_under(&targets, Path::new("/work/chroot"));
        assert_eq!(under.len(), 5);
        assert_eq!(under[0], PathBuf::from("/work/chroot/dev/pts"));
        assert!(!under.contains(&PathBuf::from("/work/chroot2/run")));
    }

    #[test]
    fn bind_mount_args() {
        let bind = MountPoint::bind("/dev", PathBuf::from("/work/chroot/dev"));
        assert!(bind.is_bind());
        assert_eq!(bind.mount_args(), ["--bind", "/dev", "/work/chroot/dev"]);
    }

    #[test]
    fn typed_mount_args_carry_fstype_and_options() {
        let devpts = MountPoint::typed(
            "devpts",
            PathBuf::from("/work/chroot/dev/pts"),
            Some("gid=5,mode=620"),
        );
        assert!(!devpts.is_bind());
        assert_eq!(
            devpts.mount_args(),
            [
                "-t",
                "devpts",
                "-o",
                "gid=5,mode=620",
                "devpts",
                "/work/chroot/dev/pts"
            ]
        );
    }

    #[test]
    fn typed_mount_without_options() {
        let proc = MountPoint::typed("proc", PathBuf::from("/work/chroot/proc"), None);
        assert_eq!(proc.mount_args(), ["-t", "proc", "proc", "/work/chroot/proc"]);
    }

    #[test]
    fn is_mounted_returns_false_for_regular_dir() {
        let dir = TempDir::new().unwrap();
        assert!(!is_mounted(dir.path()));
    }

    #[test]
    fn ensure_unmounted_noop_on_non_mounted() {
        let dir = TempDir::new().unwrap();
        ensure_unmounted(dir.path());
        // A second call converges to the same state.
        ensure_unmounted(dir.path());
        assert!(!is_mounted(dir.path()));
    }

    #[test]
    fn mounts_under_is_empty_for_scratch_dir() {
        let dir = TempDir::new().unwrap();
        assert!(mounts_under(dir.path()).is_empty());
    }
}
