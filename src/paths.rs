//! Path layout for a build.
//!
//! Everything the pipeline touches lives under the working directory. This
//! module only defines WHERE things go, not HOW they are produced.

use std::path::{Path, PathBuf};

/// Fixed chroot directory name under the working directory.
pub const CHROOT_DIRNAME: &str = "chroot";

/// Fixed image staging directory name under the working directory.
pub const IMAGE_DIRNAME: &str = "image";

/// Provisioning script the operator supplies next to the config.
pub const PROVISION_SCRIPT: &str = "chroot-provision.sh";

/// Build manifest written by the packaging stage.
pub const MANIFEST_FILENAME: &str = "build-manifest.json";

/// Paths used during a build.
#[derive(Debug, Clone)]
pub struct BuildPaths {
    /// Working directory the pipeline was started in.
    pub work_dir: PathBuf,
    /// Chroot staging tree.
    pub chroot_dir: PathBuf,
    /// ISO staging tree.
    pub image_dir: PathBuf,
    /// Operator-supplied provisioning script.
    pub provision_script: PathBuf,
}

impl BuildPaths {
    /// Compute paths relative to the working directory.
    pub fn new(work_dir: &Path) -> Self {
        Self {
            chroot_dir: work_dir.join(CHROOT_DIRNAME),
            image_dir: work_dir.join(IMAGE_DIRNAME),
            provision_script: work_dir.join(PROVISION_SCRIPT),
            work_dir: work_dir.to_path_buf(),
        }
    }

    /// Output ISO path, named after the configured volume.
    pub fn iso_path(&self, volume: &str) -> PathBuf {
        self.work_dir.join(format!("{volume}.iso"))
    }

    /// Build manifest path.
    pub fn manifest_path(&self) -> PathBuf {
        self.work_dir.join(MANIFEST_FILENAME)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_names_hang_off_the_work_dir() {
        let paths = BuildPaths::new(Path::new("/work"));
        assert_eq!(paths.chroot_dir, Path::new("/work/chroot"));
        assert_eq!(paths.image_dir, Path::new("/work/image"));
        assert_eq!(
            paths.provision_script,
            Path::new("/work/chroot-provision.sh")
        );
        assert_eq!(paths.iso_path("DEMO"), Path::new("/work/DEMO.iso"));
        assert_eq!(paths.manifest_path(), Path::new("/work/build-manifest.json"));
    }
}
