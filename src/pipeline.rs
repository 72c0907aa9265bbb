//! Stage registry, range selection, and sequential execution.
//!
//! The pipeline is a fixed, ordered list of stages. The command line names
//! a contiguous range of them with an optional `-` marker, and execution is
//! strictly sequential, stopping at the first failure.

use anyhow::{anyhow, bail, Context, Result};

use crate::context::BuildContext;
use crate::stages;

/// Range marker on the command line.
pub const RANGE_MARKER: &str = "-";

/// One build stage: a stable name and its entry point.
#[derive(Clone, Copy)]
pub struct Stage {
    pub name: &'static str,
    pub run: fn(&BuildContext) -> Result<()>,
}

/// Every stage, in pipeline order.
pub const STAGES: &[Stage] = &[
    Stage {
        name: "setup_host",
        run: stages::setup_host::run,
    },
    Stage {
        name: "debootstrap",
        run: stages::debootstrap::run,
    },
    Stage {
        name: "run_chroot",
        run: stages::run_chroot::run,
    },
    Stage {
        name: "build_iso",
        run: stages::build_iso::run,
    },
];

fn usage() -> &'static str {
    "Usage:\n  live-builder <stage>         run one stage\n  live-builder -               run every stage\n  live-builder - <stage>       run from the first stage through <stage>\n  live-builder <stage> -       run from <stage> through the last stage\n  live-builder <from> - <to>   run the inclusive range\n\nStages, in order:\n  setup_host\n  debootstrap\n  run_chroot\n  build_iso"
}

/// Contiguous range of stage ordinals, inclusive on both ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StageRange {
    pub start: usize,
    pub end: usize,
}

impl StageRange {
    fn full(stages: &[Stage]) -> Self {
        Self {
            start: 0,
            end: stages.len() - 1,
        }
    }

    fn single(ordinal: usize) -> Self {
        Self {
            start: ordinal,
            end: ordinal,
        }
    }
}

/// Resolve command line tokens into a stage range.
///
/// The grammar is `[start] [-] [end]`: a bare stage name runs that stage
/// alone, the marker alone runs everything, and the marker beside or
/// between names selects a contiguous range.
pub fn resolve(args: &[String], stages: &[Stage]) -> Result<StageRange> {
    let tokens: Vec<&str> = args.iter().map(String::as_str).collect();
    match tokens.as_slice() {
        [] => bail!(usage()),
        [marker] if *marker == RANGE_MARKER => Ok(StageRange::full(stages)),
        [name] => Ok(StageRange::single(stage_ordinal(name, stages)?)),
        [marker, name] if *marker == RANGE_MARKER => Ok(StageRange {
            start: 0,
            end: stage_ordinal(name, stages)?,
        }),
        [name, marker] if *marker == RANGE_MARKER => Ok(StageRange {
            start: stage_ordinal(name, stages)?,
            end: stages.len() - 1,
        }),
        [_, _] => bail!(
            "two stage names need '{RANGE_MARKER}' between them to form a range\n{}",
            usage()
        ),
        [from, marker, to] if *marker == RANGE_MARKER => {
            let start = stage_ordinal(from, stages)?;
            let end = stage_ordinal(to, stages)?;
            if start > end {
                bail!("stage '{from}' comes after stage '{to}' in the pipeline");
            }
            Ok(StageRange { start, end })
        }
        [_, _, _] => bail!(
            "the middle token of a three-token range must be '{RANGE_MARKER}'\n{}",
            usage()
        ),
        _ => bail!("too many arguments\n{}", usage()),
    }
}

fn stage_ordinal(name: &str, stages: &[Stage]) -> Result<usize> {
    stages
        .iter()
        .position(|stage| stage.name == name)
        .ok_or_else(|| anyhow!("unknown stage '{name}'\n{}", usage()))
}

/// Run the selected stages in order, stopping at the first failure.
pub fn execute(ctx: &BuildContext, stages: &[Stage], range: StageRange) -> Result<()> {
    for stage in &stages[range.start..=range.end] {
        println!("[live:{}] starting", stage.name);
        (stage.run)(ctx).with_context(|| format!("running stage '{}'", stage.name))?;
        println!("[live:{}] done", stage.name);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chroot::Chroot;
    use crate::config::{BuildConfig, ImageConfig, TargetConfig, CONFIG_SCHEMA_VERSION};
    use crate::paths::BuildPaths;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tempfile::TempDir;

    fn args(tokens: &[&str]) -> Vec<String> {
        tokens.iter().map(|token| token.to_string()).collect()
    }

    #[test]
    fn no_arguments_prints_usage_and_fails() {
        let err = resolve(&args(&[]), STAGES).unwrap_err();
        assert!(err.to_string().contains("Usage:"));
    }

    #[test]
    fn lone_marker_selects_the_full_pipeline() {
        let range = resolve(&args(&["-"]), STAGES).unwrap();
        assert_eq!(
            range,
            StageRange {
                start: 0,
                end: STAGES.len() - 1
            }
        );
    }

    #[test]
    fn bare_name_selects_one_stage() {
        let range = resolve(&args(&["debootstrap"]), STAGES).unwrap();
        assert_eq!(range, StageRange { start: 1, end: 1 });
    }

    #[test]
    fn leading_marker_runs_from_the_first_stage() {
        let range = resolve(&args(&["-", "run_chroot"]), STAGES).unwrap();
        assert_eq!(range, StageRange { start: 0, end: 2 });
    }

    #[test]
    fn trailing_marker_runs_through_the_last_stage() {
        let range = resolve(&args(&["debootstrap", "-"]), STAGES).unwrap();
        assert_eq!(range, StageRange { start: 1, end: 3 });
    }

    #[test]
    fn explicit_range_is_inclusive_on_both_ends() {
        let range = resolve(&args(&["debootstrap", "-", "build_iso"]), STAGES).unwrap();
        assert_eq!(range, StageRange { start: 1, end: 3 });
    }

    #[test]
    fn single_stage_range_through_the_marker_is_allowed() {
        let range = resolve(&args(&["run_chroot", "-", "run_chroot"]), STAGES).unwrap();
        assert_eq!(range, StageRange { start: 2, end: 2 });
    }

    #[test]
    fn reversed_range_is_rejected() {
        let err = resolve(&args(&["build_iso", "-", "debootstrap"]), STAGES).unwrap_err();
        assert!(err.to_string().contains("comes after"));
    }

    #[test]
    fn two_bare_names_are_rejected() {
        let err = resolve(&args(&["setup_host", "debootstrap"]), STAGES).unwrap_err();
        assert!(err.to_string().contains("between them"));
    }

    #[test]
    fn unknown_stage_is_named_in_the_error() {
        let err = resolve(&args(&["bogus"]), STAGES).unwrap_err();
        let text = err.to_string();
        assert!(text.contains("unknown stage 'bogus'"));
        assert!(text.contains("Usage:"));
    }

    #[test]
    fn middle_token_must_be_the_marker() {
        let err = resolve(&args(&["setup_host", "then", "build_iso"]), STAGES).unwrap_err();
        assert!(err.to_string().contains("middle token"));
    }

    #[test]
    fn more_than_three_tokens_are_rejected() {
        let err = resolve(&args(&["setup_host", "-", "build_iso", "-"]), STAGES).unwrap_err();
        assert!(err.to_string().contains("too many arguments"));
    }

    #[test]
    fn registry_lists_the_stages_in_pipeline_order() {
        let names: Vec<&str> = STAGES.iter().map(|stage| stage.name).collect();
        assert_eq!(
            names,
            ["setup_host", "debootstrap", "run_chroot", "build_iso"]
        );
    }

    static RAN_BEFORE_FAILURE: AtomicUsize = AtomicUsize::new(0);
    static RAN_AFTER_FAILURE: AtomicUsize = AtomicUsize::new(0);

    fn counting_stage(_ctx: &BuildContext) -> Result<()> {
        RAN_BEFORE_FAILURE.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn failing_stage(_ctx: &BuildContext) -> Result<()> {
        bail!("stage exploded")
    }

    fn unreached_stage(_ctx: &BuildContext) -> Result<()> {
        RAN_AFTER_FAILURE.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

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
    fn execute_stops_at_the_first_failure() {
        let tmp = TempDir::new().unwrap();
        let ctx = scratch_context(&tmp);
        let stages = [
            Stage {
                name: "first",
                run: counting_stage,
            },
            Stage {
                name: "second",
                run: failing_stage,
            },
            Stage {
                name: "third",
                run: unreached_stage,
            },
        ];
        let err = execute(&ctx, &stages, StageRange { start: 0, end: 2 }).unwrap_err();
        assert!(format!("{err:#}").contains("running stage 'second'"));
        assert_eq!(RAN_BEFORE_FAILURE.load(Ordering::SeqCst), 1);
        assert_eq!(RAN_AFTER_FAILURE.load(Ordering::SeqCst), 0);
    }
}
