//! Command line entry point for the live image pipeline.
//!
//! `live-builder [start] [-] [end]` runs a contiguous range of build
//! stages against the working directory. Configuration is loaded before
//! anything else; a schema mismatch stops the run before any stage acts.

use anyhow::{Context, Result};
use std::env;
use std::process::ExitCode;
use std::sync::Arc;

use live_builder::chroot::Chroot;
use live_builder::cleanup::CleanupGuard;
use live_builder::config;
use live_builder::context::BuildContext;
use live_builder::paths::BuildPaths;
use live_builder::pipeline::{self, STAGES};

fn main() -> ExitCode {
    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {err:#}");
            ExitCode::FAILURE
        }
    }
}

fn run() -> Result<()> {
    let args: Vec<String> = env::args().skip(1).collect();

    let work_dir = env::current_dir().context("resolving the working directory")?;
    let config = config::load(&work_dir)?;
    let paths = BuildPaths::new(&work_dir);
    let chroot = Arc::new(Chroot::new(paths.chroot_dir.clone()));

    let guard = CleanupGuard::arm(Arc::clone(&chroot))?;
    let range = pipeline::resolve(&args, STAGES)?;

    let ctx = BuildContext::new(config, paths, chroot);
    pipeline::execute(&ctx, STAGES, range)?;

    guard.finalize();
    println!("[live] build complete");
    Ok(())
}
