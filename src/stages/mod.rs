//! One module per pipeline stage, in pipeline order.

pub mod build_iso;
pub mod debootstrap;
pub mod run_chroot;
pub mod setup_host;
