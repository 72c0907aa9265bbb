//! Compressed root filesystem builder.
//!
//! Wraps `mksquashfs` to pack the chroot tree into the image the live
//! system loop-mounts as its read-only root.

use anyhow::Result;
use std::ffi::OsString;
use std::path::Path;

use crate::host;

/// Paths with no business inside a live root: package caches, the root
/// user's home, temp files, and any swap file.
pub const DEFAULT_EXCLUDES: &[&str] = &[
    "var/cache/apt/archives/*",
    "root/*",
    "root/.*",
    "tmp/*",
    "tmp/.*",
    "swapfile",
];

/// Options for packing the squashfs image.
#[derive(Debug, Clone)]
pub struct SquashfsOptions<'a> {
    /// Compression algorithm (gzip, zstd, xz, lzo, lz4).
    pub compression: &'a str,

    /// Block size (e.g. "128K", "1M"). Larger blocks compress better and
    /// cost more memory at unpack time.
    pub block_size: &'a str,

    /// Wildcard patterns excluded from the image, relative to the source.
    pub excludes: &'a [&'a str],
}

impl Default for SquashfsOptions<'_> {
    fn default() -> Self {
        Self {
            compression: "gzip",
            block_size: "1M",
            excludes: DEFAULT_EXCLUDES,
        }
    }
}

fn squashfs_args(source_dir: &Path, output: &Path, options: &SquashfsOptions) -> Vec<OsString> {
    let mut args: Vec<OsString> = vec![
        source_dir.into(),
        output.into(),
        "-noappend".into(),
        "-comp".into(),
        options.compression.into(),
        "-b".into(),
        options.block_size.into(),
    ];
    if !options.excludes.is_empty() {
        args.push("-wildcards".into());
        for pattern in options.excludes {
            args.push("-e".into());
            args.push((*pattern).into());
        }
    }
    args
}

/// Pack `source_dir` into a squashfs image at `output`.
///
/// Runs privileged so file ownership inside the tree is preserved;
/// `-noappend` replaces any image left by a previous run.
pub fn build_squashfs(source_dir: &Path, output: &Path, options: &SquashfsOptions) -> Result<()> {
    println!(
        "[squashfs] packing '{}' ({} compression)",
        source_dir.display(),
        options.compression
    );
    let mut cmd = host::privileged("mksquashfs");
    cmd.args(squashfs_args(source_dir, output, options));
    host::run(&mut cmd, "mksquashfs")
}
