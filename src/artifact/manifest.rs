//! Build run metadata written beside the ISO.

use anyhow::{Context, Result};
use serde::Serialize;
use std::fs;
use std::path::Path;
use time::OffsetDateTime;

/// Summary of one completed build.
#[derive(Debug, Serialize)]
pub struct BuildManifest {
    pub volume: String,
    pub release: String,
    pub mirror: String,
    pub arch: String,
    pub rootfs_bytes: u64,
    pub iso_path: String,
    pub iso_sha256: String,
    pub created_at_utc: String,
}

/// Write the manifest as pretty-printed JSON.
pub fn write_manifest(manifest: &BuildManifest, path: &Path) -> Result<()> {
    let body = serde_json::to_vec_pretty(manifest).context("serializing build manifest")?;
    fs::write(path, body).with_context(|| format!("writing '{}'", path.display()))?;
    Ok(())
}

/// Compact UTC timestamp, second resolution.
pub fn now_utc_compact() -> String {
    let now = OffsetDateTime::now_utc();
    format!(
        "{:04}{:02}{:02}T{:02}{:02}{:02}Z",
        now.year(),
        u8::from(now.month()),
        now.day(),
        now.hour(),
        now.minute(),
        now.second()
    )
}
