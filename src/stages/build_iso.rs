use anyhow::{Context, Result};
use std::ffi::OsStr;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use crate::artifact::checksum::{sha256_file, write_sha256_manifest};
use crate::artifact::iso::{self, IsoOptions};
use crate::artifact::manifest::{now_utc_compact, write_manifest, BuildManifest};
use crate::artifact::squashfs::{build_squashfs, SquashfsOptions};
use crate::context::BuildContext;
use crate::host;
use crate::paths;

/// In-image checksum manifest name.
const CHECKSUM_FILENAME: &str = "sha256sum.txt";

/// Boot plumbing excluded from the checksum manifest; `xorriso` rewrites
/// parts of it while authoring, and the GRUB files land after hashing.
const CHECKSUM_EXCLUDES: &[&str] = &[
    "boot/grub/grub.cfg",
    "boot/grub/bios.img",
    "boot/grub/boot.cat",
    "EFI/efiboot.img",
    CHECKSUM_FILENAME,
];

/// Package the provisioned tree into the bootable ISO.
///
/// Tears the chroot down first so no mount or process leaks into the
/// packed filesystem, then stages the image tree and authors the ISO.
pub fn run(ctx: &BuildContext) -> Result<()> {
    ctx.chroot.exit();
    remove_staged_inputs(ctx)?;

    let image_dir = &ctx.paths.image_dir;
    reset_image_tree(image_dir)?;
    copy_boot_files(ctx)?;

    let squashfs_path = image_dir.join("casper/filesystem.squashfs");
    build_squashfs(ctx.chroot.root(), &squashfs_path, &SquashfsOptions::default())?;

    let rootfs_bytes = measure_rootfs(ctx.chroot.root())?;
    let size_path = image_dir.join("casper/filesystem.size");
    fs::write(&size_path, rootfs_bytes.to_string())
        .with_context(|| format!("writing '{}'", size_path.display()))?;

    write_sha256_manifest(image_dir, &image_dir.join(CHECKSUM_FILENAME), CHECKSUM_EXCLUDES)?;

    let volume = &ctx.config.image.volume;
    let iso_path = ctx.paths.iso_path(volume);
    iso::build_iso(image_dir, &iso_path, &IsoOptions::hybrid(volume, volume))?;

    let (iso_sha256, _) = sha256_file(&iso_path)?;
    let manifest = BuildManifest {
        volume: volume.clone(),
        release: ctx.config.target.release.clone(),
        mirror: ctx.config.target.mirror.clone(),
        arch: ctx.config.target.arch.clone(),
        rootfs_bytes,
        iso_path: iso_path.display().to_string(),
        iso_sha256,
        created_at_utc: now_utc_compact(),
    };
    write_manifest(&manifest, &ctx.paths.manifest_path())?;

    println!("[live:build_iso] wrote '{}'", iso_path.display());
    Ok(())
}

/// Remove the provisioning inputs the chroot stage left in the root.
/// `rm -f` tolerates inputs already gone.
fn remove_staged_inputs(ctx: &BuildContext) -> Result<()> {
    let staged_dir = ctx.chroot.root().join("root");
    let mut cmd = host::privileged("rm");
    cmd.arg("-f").arg(staged_dir.join(paths::PROVISION_SCRIPT));
    let config_name = ctx.config.source_path.file_name().unwrap_or(OsStr::new(""));
    if !config_name.is_empty() {
        cmd.arg(staged_dir.join(config_name));
    }
    host::run_capture(&mut cmd, "removing staged provisioning inputs")?;
    Ok(())
}

/// Start the image staging tree from scratch so stale artifacts from a
/// previous run cannot leak into the ISO.
fn reset_image_tree(image_dir: &Path) -> Result<()> {
    if image_dir.exists() {
        fs::remove_dir_all(image_dir)
            .with_context(|| format!("clearing '{}'", image_dir.display()))?;
    }
    for sub in ["casper", "boot/grub", "EFI"] {
        let dir = image_dir.join(sub);
        fs::create_dir_all(&dir).with_context(|| format!("creating '{}'", dir.display()))?;
    }
    Ok(())
}

/// Copy the newest kernel and initrd out of the chroot into `casper/`.
///
/// Provisioning may install several kernel revisions; the newest
/// modification time wins. The copies go through privileged `install`
/// with a world-readable mode because kernels in the tree are root-only.
fn copy_boot_files(ctx: &BuildContext) -> Result<()> {
    let boot_dir = ctx.chroot.root().join("boot");
    let kernel = newest_matching(&boot_dir, "vmlinuz-")?;
    let initrd = newest_matching(&boot_dir, "initrd.img-")?;
    let casper = ctx.paths.image_dir.join("casper");
    for (source, dest_name) in [(kernel, "vmlinuz"), (initrd, "initrd")] {
        let mut cmd = host::privileged("install");
        cmd.args(["-m", "0644"])
            .arg(&source)
            .arg(casper.join(dest_name));
        host::run_capture(&mut cmd, &format!("copying '{}'", source.display()))?;
    }
    Ok(())
}

/// Newest file in `dir` whose name starts with `prefix`.
fn newest_matching(dir: &Path, prefix: &str) -> Result<PathBuf> {
    let mut newest: Option<(SystemTime, PathBuf)> = None;
    let entries = fs::read_dir(dir).with_context(|| format!("reading '{}'", dir.display()))?;
    for entry in entries {
        let entry = entry.with_context(|| format!("reading '{}'", dir.display()))?;
        let name_os = entry.file_name();
        let Some(name) = name_os.to_str() else {
            continue;
        };
        if !name.starts_with(prefix) {
            continue;
        }
        let modified = entry
            .metadata()
            .and_then(|meta| meta.modified())
            .with_context(|| format!("inspecting '{}'", entry.path().display()))?;
        if newest.as_ref().map_or(true, |(time, _)| modified > *time) {
            newest = Some((modified, entry.path()));
        }
    }
    newest.map(|(_, path)| path).with_context(|| {
        format!(
            "no '{prefix}*' under '{}'; provisioning must install a kernel",
            dir.display()
        )
    })
}

/// Uncompressed rootfs size in bytes, for the in-image size descriptor.
fn measure_rootfs(root: &Path) -> Result<u64> {
    let mut cmd = host::privileged("du");
    cmd.args(["-sx", "--block-size=1"]).arg(root);
    let stdout = host::run_capture(&mut cmd, "measuring the root filesystem")?;
    parse_du_bytes(&stdout)
}

fn parse_du_bytes(output: &str) -> Result<u64> {
    let first = output.split_whitespace().next().context("empty du output")?;
    first
        .parse::<u64>()
        .with_context(|| format!("parsing du output '{first}'"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn du_output_parses_to_the_leading_byte_count() {
        assert_eq!(parse_du_bytes("2147483648\t/work/chroot\n").unwrap(), 2147483648);
        assert!(parse_du_bytes("").is_err());
        assert!(parse_du_bytes("not-a-number /work/chroot").is_err());
    }

    #[test]
    fn newest_matching_prefers_the_latest_modification() {
        let tmp = TempDir::new().unwrap();
        let old = tmp.path().join("vmlinuz-5.15.0-25-generic");
        let new = tmp.path().join("vmlinuz-6.8.0-31-generic");
        fs::write(&old, b"old kernel").unwrap();
        fs::write(&new, b"new kernel").unwrap();
        let stale = SystemTime::now() - std::time::Duration::from_secs(3600);
        fs::OpenOptions::new()
            .write(true)
            .open(&old)
            .unwrap()
            .set_modified(stale)
            .unwrap();

        let picked = newest_matching(tmp.path(), "vmlinuz-").unwrap();
        assert_eq!(picked, new);
    }

    #[test]
    fn newest_matching_ignores_other_prefixes() {
        let tmp = TempDir::new().unwrap();
        fs::write(tmp.path().join("config-6.8.0-31-generic"), b"config").unwrap();
        fs::write(tmp.path().join("initrd.img-6.8.0-31-generic"), b"initrd").unwrap();
        let err = newest_matching(tmp.path(), "vmlinuz-").unwrap_err();
        assert!(err.to_string().contains("vmlinuz-"));
        let initrd = newest_matching(tmp.path(), "initrd.img-").unwrap();
        assert!(initrd.ends_with("initrd.img-6.8.0-31-generic"));
    }

    #[test]
    fn image_tree_reset_clears_stale_content() {
        let tmp = TempDir::new().unwrap();
        let image_dir = tmp.path().join("image");
        fs::create_dir_all(image_dir.join("casper")).unwrap();
        fs::write(image_dir.join("casper/filesystem.squashfs"), b"stale").unwrap();

        reset_image_tree(&image_dir).unwrap();

        assert!(image_dir.join("casper").is_dir());
        assert!(image_dir.join("boot/grub").is_dir());
        assert!(image_dir.join("EFI").is_dir());
        assert!(!image_dir.join("casper/filesystem.squashfs").exists());
    }
}
