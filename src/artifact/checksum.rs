//! Artifact hashing and the in-image checksum manifest.

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{BufReader, Read, Write};
use std::path::Path;
use walkdir::WalkDir;

/// Streaming SHA-256 of one file. Returns the lowercase hex digest and the
/// byte length.
pub fn sha256_file(path: &Path) -> Result<(String, u64)> {
    let file = File::open(path).with_context(|| format!("opening '{}'", path.display()))?;
    let mut reader = BufReader::new(file);
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 1024 * 1024];
    let mut total = 0u64;
    loop {
        let read = reader
            .read(&mut buf)
            .with_context(|| format!("reading '{}'", path.display()))?;
        if read == 0 {
            break;
        }
        hasher.update(&buf[..read]);
        total += read as u64;
    }
    Ok((format!("{:x}", hasher.finalize()), total))
}

/// Hash every file under `root` into a `sha256sum -c` compatible manifest
/// at `output`.
///
/// Paths are recorded relative to `root` with a `./` prefix and sorted, so
/// identical trees produce identical manifests. `excludes` lists relative
/// paths to skip: the boot images `xorriso` rewrites during authoring, and
/// the manifest itself on a re-run.
pub fn write_sha256_manifest(root: &Path, output: &Path, excludes: &[&str]) -> Result<usize> {
    let mut entries = Vec::new();
    for entry in WalkDir::new(root).sort_by_file_name() {
        let entry = entry.with_context(|| format!("walking '{}'", root.display()))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let rel = entry
            .path()
            .strip_prefix(root)
            .with_context(|| format!("relativizing '{}'", entry.path().display()))?
            .to_string_lossy()
            .into_owned();
        if excludes.iter().any(|skip| *skip == rel) {
            continue;
        }
        let (digest, _) = sha256_file(entry.path())?;
        entries.push((digest, rel));
    }
    // walkdir sorts per directory; sort the flat list for a stable file.
    entries.sort_by(|a, b| a.1.cmp(&b.1));

    let mut file =
        File::create(output).with_context(|| format!("creating '{}'", output.display()))?;
    for (digest, rel) in &entries {
        writeln!(file, "{digest}  ./{rel}")
            .with_context(|| format!("writing '{}'", output.display()))?;
    }
    Ok(entries.len())
}
