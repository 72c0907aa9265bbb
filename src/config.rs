//! Build configuration loading and validation.
//!
//! The pipeline reads `live-build.toml` from the working directory, falling
//! back to `live-build.default.toml`. The file carries a schema version that
//! must match [`CONFIG_SCHEMA_VERSION`] exactly; a stale config aborts the
//! build before any stage runs.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

/// Expected `config_version` value. Bumped when the schema changes shape.
pub const CONFIG_SCHEMA_VERSION: &str = "1";

/// Config filenames probed in order under the working directory.
pub const CONFIG_FILENAMES: &[&str] = &["live-build.toml", "live-build.default.toml"];

/// Immutable build parameters. Loaded once at startup and passed by
/// reference; nothing mutates it after validation.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BuildConfig {
    /// Schema gate; must equal [`CONFIG_SCHEMA_VERSION`].
    pub config_version: String,
    pub target: TargetConfig,
    pub image: ImageConfig,
    /// Path the config was loaded from. The chroot provisioning stage
    /// stages a copy of this exact file into the target tree.
    #[serde(skip)]
    pub source_path: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TargetConfig {
    /// Release identifier handed to the bootstrap tool (e.g. "noble").
    pub release: String,
    /// Package mirror URL for the bootstrap.
    pub mirror: String,
    /// Target architecture.
    #[serde(default = "default_arch")]
    pub arch: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ImageConfig {
    /// ISO volume id; also names the output image file.
    pub volume: String,
}

fn default_arch() -> String {
    "amd64".to_string()
}

/// Locate and load the build config from `work_dir`.
pub fn load(work_dir: &Path) -> Result<BuildConfig> {
    let Some(config_path) = CONFIG_FILENAMES
        .iter()
        .map(|name| work_dir.join(name))
        .find(|path| path.is_file())
    else {
        bail!(
            "no build config found in '{}' (expected {})",
            work_dir.display(),
            CONFIG_FILENAMES.join(" or ")
        );
    };

    load_file(&config_path)
}

/// Load and validate a specific config file.
pub fn load_file(config_path: &Path) -> Result<BuildConfig> {
    let raw = fs::read_to_string(config_path)
        .with_context(|| format!("reading build config '{}'", config_path.display()))?;
    let mut config: BuildConfig = toml::from_str(&raw)
        .with_context(|| format!("parsing build config '{}'", config_path.display()))?;
    config.source_path = config_path.to_path_buf();
    validate(&config, config_path)?;
    Ok(config)
}

fn validate(config: &BuildConfig, config_path: &Path) -> Result<()> {
    if config.config_version != CONFIG_SCHEMA_VERSION {
        bail!(
            "invalid build config '{}': config_version is '{}' but this builder expects '{}'.\n\
             Review the file against the current template, then bump config_version.",
            config_path.display(),
            config.config_version,
            CONFIG_SCHEMA_VERSION
        );
    }

    for (field, value) in [
        ("target.release", &config.target.release),
        ("target.mirror", &config.target.mirror),
        ("target.arch", &config.target.arch),
        ("image.volume", &config.image.volume),
    ] {
        if value.trim().is_empty() {
            bail!(
                "invalid build config '{}': {} must not be empty",
                config_path.display(),
                field
            );
        }
    }

    let volume = &config.image.volume;
    if volume.len() > 32 {
        bail!(
            "invalid build config '{}': image.volume '{}' exceeds 32 bytes (ISO9660 volume id limit)",
            config_path.display(),
            volume
        );
    }
    if volume.contains('/') || volume.contains(char::is_whitespace) {
        bail!(
            "invalid build config '{}': image.volume '{}' must not contain path separators or whitespace",
            config_path.display(),
            volume
        );
    }

    Ok(())
}
