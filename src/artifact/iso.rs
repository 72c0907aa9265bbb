//! Hybrid BIOS/EFI ISO authoring.
//!
//! Wraps the GRUB image tools and `xorriso` to turn the staged image tree
//! into a bootable ISO. The BIOS path boots an El Torito GRUB core image;
//! the EFI path boots a FAT image that doubles as an El Torito alternative
//! entry and an appended partition, so the same ISO boots from optical
//! media and USB sticks.

use anyhow::{bail, Context, Result};
use std::ffi::OsString;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::process::Command;

use crate::host;

/// Host directory with the BIOS GRUB support images.
const GRUB_I386_DIR: &str = "/usr/lib/grub/i386-pc";

/// Size of the FAT EFI boot image.
const EFI_BOOT_IMAGE_BYTES: u64 = 10 * 1024 * 1024;

/// GRUB modules linked into the standalone BIOS core image.
const BIOS_INSTALL_MODULES: &str = "linux16 linux normal iso9660 biosdisk memdisk search tar ls";
const BIOS_PRELOAD_MODULES: &str = "linux16 linux normal iso9660 biosdisk search";

/// Options for authoring the ISO.
#[derive(Debug, Clone)]
pub struct IsoOptions<'a> {
    /// Volume label. Doubles as the filesystem label GRUB searches for at
    /// boot, so the booted entry finds its own medium.
    pub volume: &'a str,

    /// OS name shown in GRUB menu entries.
    pub os_name: &'a str,

    /// Extra kernel command line options for the default entry.
    pub cmdline: &'a str,

    /// Author the EFI boot path.
    pub uefi: bool,

    /// Author the BIOS boot path.
    pub bios: bool,
}

impl<'a> IsoOptions<'a> {
    /// Options for a UEFI-only ISO.
    pub fn uefi_only(volume: &'a str, os_name: &'a str) -> Self {
        Self {
            volume,
            os_name,
            cmdline: "",
            uefi: true,
            bios: false,
        }
    }

    /// Options for a hybrid UEFI+BIOS ISO.
    pub fn hybrid(volume: &'a str, os_name: &'a str) -> Self {
        Self {
            volume,
            os_name,
            cmdline: "",
            uefi: true,
            bios: true,
        }
    }
}

/// GRUB menu configuration shipped at `boot/grub/grub.cfg`.
fn grub_config(options: &IsoOptions) -> String {
    let extra = if options.cmdline.is_empty() {
        String::new()
    } else {
        format!(" {}", options.cmdline)
    };
    format!(
        "set default=\"0\"
set timeout=10

insmod all_video

search --set=root --label \"{volume}\"

menuentry \"{os} (live)\" {{
    linux /casper/vmlinuz boot=casper quiet splash{extra}
    initrd /casper/initrd
}}

menuentry \"{os} (live, safe graphics)\" {{
    linux /casper/vmlinuz boot=casper nomodeset
    initrd /casper/initrd
}}
",
        volume = options.volume,
        os = options.os_name,
        extra = extra,
    )
}

/// Embedded configuration for the standalone GRUB images. Finds the medium
/// by label and hands over to the shipped menu configuration.
fn embedded_grub_config(volume: &str) -> String {
    format!(
        "search --set=root --label \"{volume}\"\nset prefix=($root)/boot/grub/\nconfigfile /boot/grub/grub.cfg\n"
    )
}

/// Author the ISO from a fully staged image tree.
///
/// Writes the GRUB configuration and boot images into the tree, then runs
/// one `xorriso` invocation. With both boot paths enabled the result boots
/// on BIOS and EFI machines alike.
pub fn build_iso(image_dir: &Path, output: &Path, options: &IsoOptions) -> Result<()> {
    if !options.uefi && !options.bios {
        bail!("refusing to author an ISO with no boot path enabled");
    }

    let scratch = output
        .parent()
        .with_context(|| format!("resolving parent of '{}'", output.display()))?
        .join("iso-scratch");
    if scratch.exists() {
        fs::remove_dir_all(&scratch)
            .with_context(|| format!("clearing '{}'", scratch.display()))?;
    }
    fs::create_dir_all(&scratch).with_context(|| format!("creating '{}'", scratch.display()))?;

    let grub_dir = image_dir.join("boot/grub");
    fs::create_dir_all(&grub_dir).with_context(|| format!("creating '{}'", grub_dir.display()))?;
    let grub_cfg = grub_dir.join("grub.cfg");
    fs::write(&grub_cfg, grub_config(options))
        .with_context(|| format!("writing '{}'", grub_cfg.display()))?;

    let embed_cfg = scratch.join("grub-embed.cfg");
    fs::write(&embed_cfg, embedded_grub_config(options.volume))
        .with_context(|| format!("writing '{}'", embed_cfg.display()))?;

    let efi_partition = if options.uefi {
        Some(build_efi_boot_image(image_dir, &scratch, &embed_cfg)?)
    } else {
        None
    };
    if options.bios {
        build_bios_boot_image(image_dir, &scratch, &embed_cfg)?;
    }

    println!("[iso] authoring '{}'", output.display());
    let mut cmd = host::privileged("xorriso");
    cmd.args(xorriso_args(image_dir, output, options, efi_partition.as_deref()));
    host::run(&mut cmd, "xorriso")?;

    fs::remove_dir_all(&scratch).with_context(|| format!("clearing '{}'", scratch.display()))?;
    Ok(())
}

/// Build the FAT EFI boot image and place a copy at `EFI/efiboot.img` in
/// the tree. Returns the scratch copy used for the appended partition.
fn build_efi_boot_image(image_dir: &Path, scratch: &Path, embed_cfg: &Path) -> Result<PathBuf> {
    let efi_binary = scratch.join("bootx64.efi");
    let mut mkstandalone = Command::new("grub-mkstandalone");
    mkstandalone
        .arg("--format=x86_64-efi")
        .arg("--output")
        .arg(&efi_binary)
        .arg("--locales=")
        .arg("--fonts=")
        .arg(format!("boot/grub/grub.cfg={}", embed_cfg.display()));
    host::run_capture(&mut mkstandalone, "grub-mkstandalone (EFI)")?;

    let efiboot = scratch.join("efiboot.img");
    let file =
        File::create(&efiboot).with_context(|| format!("creating '{}'", efiboot.display()))?;
    file.set_len(EFI_BOOT_IMAGE_BYTES)
        .with_context(|| format!("sizing '{}'", efiboot.display()))?;
    drop(file);

    let mut mkfs = Command::new("mkfs.vfat");
    mkfs.arg(&efiboot);
    host::run_capture(&mut mkfs, "mkfs.vfat")?;

    let mut mmd = Command::new("mmd");
    mmd.arg("-i").arg(&efiboot).args(["efi", "efi/boot"]);
    host::run_capture(&mut mmd, "mmd")?;

    let mut mcopy = Command::new("mcopy");
    mcopy
        .arg("-i")
        .arg(&efiboot)
        .arg(&efi_binary)
        .arg("::efi/boot/bootx64.efi");
    host::run_capture(&mut mcopy, "mcopy")?;

    let tree_dir = image_dir.join("EFI");
    fs::create_dir_all(&tree_dir)
        .with_context(|| format!("creating '{}'", tree_dir.display()))?;
    fs::copy(&efiboot, tree_dir.join("efiboot.img"))
        .with_context(|| format!("copying '{}' into the image tree", efiboot.display()))?;
    Ok(efiboot)
}

/// Build the BIOS GRUB core image, prepend the El Torito cdboot stub, and
/// place the result at `boot/grub/bios.img` in the tree.
fn build_bios_boot_image(image_dir: &Path, scratch: &Path, embed_cfg: &Path) -> Result<()> {
    let cdboot = Path::new(GRUB_I386_DIR).join("cdboot.img");
    if !cdboot.is_file() {
        bail!(
            "missing '{}'; install the grub-pc-bin package for BIOS boot support",
            cdboot.display()
        );
    }

    let core = scratch.join("core.img");
    let mut mkstandalone = Command::new("grub-mkstandalone");
    mkstandalone
        .arg("--format=i386-pc")
        .arg("--output")
        .arg(&core)
        .arg(format!("--install-modules={BIOS_INSTALL_MODULES}"))
        .arg(format!("--modules={BIOS_PRELOAD_MODULES}"))
        .arg("--locales=")
        .arg("--fonts=")
        .arg(format!("boot/grub/grub.cfg={}", embed_cfg.display()));
    host::run_capture(&mut mkstandalone, "grub-mkstandalone (BIOS)")?;

    let mut image = fs::read(&cdboot).with_context(|| format!("reading '{}'", cdboot.display()))?;
    let core_bytes = fs::read(&core).with_context(|| format!("reading '{}'", core.display()))?;
    image.extend_from_slice(&core_bytes);
    let bios_img = image_dir.join("boot/grub/bios.img");
    fs::write(&bios_img, image).with_context(|| format!("writing '{}'", bios_img.display()))?;
    Ok(())
}

/// Argument list for the final `xorriso -as mkisofs` invocation.
fn xorriso_args(
    image_dir: &Path,
    output: &Path,
    options: &IsoOptions,
    efi_partition: Option<&Path>,
) -> Vec<OsString> {
    let mut args: Vec<OsString> = vec![
        "-as".into(),
        "mkisofs".into(),
        "-iso-level".into(),
        "3".into(),
        "-full-iso9660-filenames".into(),
        "-volid".into(),
        options.volume.into(),
        "-output".into(),
        output.into(),
    ];
    if options.bios {
        args.extend([
            "-eltorito-boot".into(),
            "boot/grub/bios.img".into(),
            "-no-emul-boot".into(),
            "-boot-load-size".into(),
            "4".into(),
            "-boot-info-table".into(),
            "--eltorito-catalog".into(),
            "boot/grub/boot.cat".into(),
            "--grub2-boot-info".into(),
            "--grub2-mbr".into(),
            Path::new(GRUB_I386_DIR).join("boot_hybrid.img").into(),
        ]);
    }
    if let Some(partition) = efi_partition {
        if options.bios {
            args.push("-eltorito-alt-boot".into());
        }
        args.extend([
            "-e".into(),
            "EFI/efiboot.img".into(),
            "-no-emul-boot".into(),
            "-append_partition".into(),
            "2".into(),
            "0xef".into(),
            partition.into(),
        ]);
    }
    args.push(image_dir.into());
    args
}
