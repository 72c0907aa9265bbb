use anyhow::{bail, Result};
use std::ffi::OsStr;

use crate::context::BuildContext;
use crate::host;
use crate::paths;

/// Directory inside the root where provisioning inputs get staged.
const STAGED_DIR: &str = "root";

/// Provision the bootstrapped system from inside the chroot.
///
/// Stages the operator's provisioning script and a copy of the build
/// config into the root, prepares the chroot, and runs the script. The
/// root stays entered afterwards; the packaging stage owns teardown.
pub fn run(ctx: &BuildContext) -> Result<()> {
    let script = &ctx.paths.provision_script;
    if !script.is_file() {
        bail!(
            "provisioning script '{}' not found; place it in the working directory",
            script.display()
        );
    }

    stage_provision_inputs(ctx)?;
    ctx.chroot.enter()?;

    println!(
        "[live:run_chroot] provisioning '{}'",
        ctx.chroot.root().display()
    );
    let mut cmd = host::privileged("chroot");
    cmd.arg(ctx.chroot.root())
        .arg(format!("/{STAGED_DIR}/{}", paths::PROVISION_SCRIPT));
    host::run(&mut cmd, "provisioning script")?;

    ctx.chroot.mark_built();
    Ok(())
}

/// Copy the provisioning script (executable) and the loaded config file
/// into the root's staging directory.
fn stage_provision_inputs(ctx: &BuildContext) -> Result<()> {
    let staged_dir = ctx.chroot.root().join(STAGED_DIR);

    let script_dest = staged_dir.join(paths::PROVISION_SCRIPT);
    let mut install_script = host::privileged("install");
    install_script
        .args(["-m", "0755"])
        .arg(&ctx.paths.provision_script)
        .arg(&script_dest);
    host::run_capture(&mut install_script, "staging the provisioning script")?;

    let config_source = &ctx.config.source_path;
    let config_name = config_source.file_name().unwrap_or(OsStr::new(""));
    if config_name.is_empty() {
        return Ok(());
    }
    let mut install_config = host::privileged("install");
    install_config
        .args(["-m", "0644"])
        .arg(config_source)
        .arg(staged_dir.join(config_name));
    host::run_capture(&mut install_config, "staging the build config copy")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chroot::Chroot;
    use crate::config::{BuildConfig, ImageConfig, TargetConfig, CONFIG_SCHEMA_VERSION};
    use crate::paths::BuildPaths;
    use std::path::PathBuf;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn scratch_context(tmp: &TempDir) -> BuildContext {
        let config = BuildConfig {
            config_version: CONFIG_SCHEMA_VERSION.to_string(),
            target: TargetConfig {
                release: "noble".to_string(),
                mirror: "http://archive.ubuntu.com/ubuntu/".to_string(),
                arch: "amd64".to_string(),
            },
            image: ImageConfig {
                volume: "test-live".to_string(),
            },
            source_path: PathBuf::new(),
        };
        let paths = BuildPaths::new(tmp.path());
        let chroot = Arc::new(Chroot::new(paths.chroot_dir.clone()));
        BuildContext::new(config, paths, chroot)
    }

    #[test]
    fn missing_provisioning_script_fails_before_entering() {
        let tmp = TempDir::new().unwrap();
        let ctx = scratch_context(&tmp);
        let err = run(&ctx).unwrap_err();
        assert!(err.to_string().contains("not found"));
        assert_eq!(ctx.chroot.lifecycle(), crate::chroot::Lifecycle::Absent);
    }

    #[test]
    fn staged_script_path_is_inside_the_root_home() {
        let tmp = TempDir::new().unwrap();
        let ctx = scratch_context(&tmp);
        let staged = ctx
            .chroot
            .root()
            .join(STAGED_DIR)
            .join(paths::PROVISION_SCRIPT);
        assert!(staged.ends_with("chroot/root/chroot-provision.sh"));
    }
}
