use anyhow::{Context, Result};
use std::fs;

use crate::context::BuildContext;
use crate::paths::BuildPaths;
use crate::preflight;

/// Verify the host can run every later stage, then lay out the work tree.
pub fn run(ctx: &BuildContext) -> Result<()> {
    preflight::check_host_tools()?;
    prepare_work_tree(&ctx.paths)?;
    println!(
        "[live:setup_host] chroot directory '{}' ready",
        ctx.paths.chroot_dir.display()
    );
    Ok(())
}

fn prepare_work_tree(paths: &BuildPaths) -> Result<()> {
    fs::create_dir_all(&paths.chroot_dir).with_context(|| {
        format!(
            "creating chroot directory '{}'",
            paths.chroot_dir.display()
        )
    })?;
    Ok(())
}
