//! Host command execution with on-demand privilege.
//!
//! The pipeline runs as a regular user and wraps individual commands in
//! `sudo` only where the kernel requires root: mounts, chroot entry, the
//! package bootstrap. When the process itself runs as root the wrapper
//! degrades to a plain `Command`.

use anyhow::{bail, Context, Result};
use std::process::Command;

/// Effective uid of this process.
pub fn effective_uid() -> u32 {
    // SAFETY: geteuid takes no arguments and cannot fail.
    unsafe { libc::geteuid() }
}

/// Whether this process already runs with root privileges.
pub fn is_root() -> bool {
    effective_uid() == 0
}

/// Build a command for `program`, prefixed with `sudo` when not running as root.
pub fn privileged(program: &str) -> Command {
    privileged_for(program, is_root())
}

fn privileged_for(program: &str, root: bool) -> Command {
    if root {
        Command::new(program)
    } else {
        let mut cmd = Command::new("sudo");
        cmd.arg(program);
        cmd
    }
}

/// Run a command to completion with inherited stdio.
///
/// `what` names the operation in error messages.
pub fn run(cmd: &mut Command, what: &str) -> Result<()> {
    let status = cmd.status().with_context(|| format!("running {what}"))?;
    if !status.success() {
        bail!("{what} failed with {status}");
    }
    Ok(())
}

/// Run a command and capture stdout. On failure the error carries the
/// command's stderr so the operator sees what the tool reported.
pub fn run_capture(cmd: &mut Command, what: &str) -> Result<String> {
    let output = cmd.output().with_context(|| format!("running {what}"))?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        bail!("{what} failed with {}\n{}", output.status, stderr.trim());
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}
