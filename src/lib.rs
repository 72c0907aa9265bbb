//! Staged chroot pipeline for building hybrid BIOS/EFI live Linux ISOs.
//!
//! The pipeline bootstraps a minimal system into a chroot staging tree,
//! provisions it from inside with the pseudo filesystems mounted and
//! service starts blocked, then packs the tree into a compressed root
//! filesystem and authors a bootable ISO:
//!
//! - **Stages** - `setup_host`, `debootstrap`, `run_chroot`, `build_iso`,
//!   selected as a contiguous range on the command line
//! - **Chroot lifecycle** - mounts, service blockers, and a best-effort
//!   teardown that also runs on interrupt
//! - **Artifact builders** - squashfs, checksum manifests, and the
//!   GRUB/xorriso ISO authoring path
//!
//! # Example
//!
//! ```rust,ignore
//! use live_builder::pipeline::{self, STAGES};
//!
//! let range = pipeline::resolve(&args, STAGES)?;
//! pipeline::execute(&ctx, STAGES, range)?;
//! ```
//!
//! All mount, chroot, and packaging operations shell out to the standard
//! host tools through `sudo`; the process itself runs unprivileged.

pub mod artifact;
pub mod chroot;
pub mod cleanup;
pub mod config;
pub mod context;
pub mod host;
pub mod mount;
pub mod paths;
pub mod pipeline;
pub mod preflight;
pub mod reaper;
pub mod stages;

pub use context::BuildContext;
