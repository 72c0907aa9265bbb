use anyhow::Result;
use std::ffi::OsString;
use std::path::Path;

use crate::config::TargetConfig;
use crate::context::BuildContext;
use crate::host;

/// Bootstrap the minimal target system into the chroot directory.
///
/// Streams the bootstrap tool's output; this is the long network-bound
/// step of the pipeline.
pub fn run(ctx: &BuildContext) -> Result<()> {
    let target = &ctx.config.target;
    println!(
        "[live:debootstrap] bootstrapping {} ({}) from {}",
        target.release, target.arch, target.mirror
    );
    let mut cmd = host::privileged("debootstrap");
    cmd.args(bootstrap_args(target, &ctx.paths.chroot_dir));
    host::run(&mut cmd, "debootstrap")
}

fn bootstrap_args(target: &TargetConfig, chroot_dir: &Path) -> Vec<OsString> {
    vec![
        format!("--arch={}", target.arch).into(),
        "--variant=minbase".into(),
        target.release.as_str().into(),
        chroot_dir.into(),
        target.mirror.as_str().into(),
    ]
}
