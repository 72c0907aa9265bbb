//! Artifact builders for the live image.
//!
//! - [`squashfs`] packs the chroot tree into the compressed root filesystem
//! - [`iso`] authors the hybrid BIOS/EFI ISO from the staged image tree
//! - [`checksum`] hashes artifacts and writes the in-image manifest
//! - [`manifest`] records build metadata beside the ISO

pub mod checksum;
pub mod iso;
pub mod manifest;
pub mod squashfs;
