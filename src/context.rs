//! Shared state threaded through every pipeline stage.

use std::sync::Arc;

use crate::chroot::Chroot;
use crate::config::BuildConfig;
use crate::paths::BuildPaths;

/// Everything a stage needs: the validated configuration, the fixed work
/// tree layout, and the chroot lifecycle manager shared with the cleanup
/// guard.
pub struct BuildContext {
    pub config: BuildConfig,
    pub paths: BuildPaths,
    pub chroot: Arc<Chroot>,
}

impl BuildContext {
    pub fn new(config: BuildConfig, paths: BuildPaths, chroot: Arc<Chroot>) -> Self {
        Self {
            config,
            paths,
            chroot,
        }
    }
}
