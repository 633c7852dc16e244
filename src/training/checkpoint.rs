//! Checkpoint discovery and resume policy
//!
//! Trainer checkpoints live in `<output_dir>/checkpoint-<step>` directories.
//! The resume argument selects between a fresh run, the latest checkpoint,
//! or a specific step.

use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::error::{Error, Result};

/// Directory name prefix of trainer checkpoints
pub const CHECKPOINT_PREFIX: &str = "checkpoint-";

/// What the resume argument asks for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResumePolicy {
    /// Start from scratch
    Fresh,
    /// Resume from the highest saved step, if any
    Latest,
    /// Resume from a specific step
    Step(u64),
}

impl ResumePolicy {
    /// Parse a resume argument.
    ///
    /// Empty or `no` starts fresh, `yes` (any case) resumes from the latest
    /// checkpoint, a positive integer selects that step and `0` starts fresh.
    pub fn parse(arg: &str) -> Result<Self> {
        let arg = arg.trim();
        if arg.is_empty() || arg.eq_ignore_ascii_case("no") {
            return Ok(ResumePolicy::Fresh);
        }
        if arg.eq_ignore_ascii_case("yes") {
            return Ok(ResumePolicy::Latest);
        }
        if arg.bytes().all(|b| b.is_ascii_digit()) {
            let step: u64 = arg
                .parse()
                .map_err(|_| Error::config(format!("Checkpoint step '{}' is out of range", arg)))?;
            return Ok(if step == 0 {
                ResumePolicy::Fresh
            } else {
                ResumePolicy::Step(step)
            });
        }

        Err(Error::config(format!(
            "Invalid resume argument '{}': expected yes, no or a checkpoint step",
            arg
        )))
    }
}

/// Resolved resume action
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResumeDecision {
    /// Train from scratch
    Fresh,
    /// Resume from a checkpoint directory
    Resume {
        /// Saved step
        step: u64,
        /// `<output_dir>/checkpoint-<step>`
        path: PathBuf,
    },
}

impl ResumeDecision {
    /// Checkpoint directory to resume from
    pub fn checkpoint_dir(&self) -> Option<&Path> {
        match self {
            ResumeDecision::Fresh => None,
            ResumeDecision::Resume { path, .. } => Some(path),
        }
    }
}

/// Step number of a checkpoint directory name
fn checkpoint_step(name: &str) -> Option<u64> {
    if name.contains("tmp") {
        return None;
    }
    name.strip_prefix(CHECKPOINT_PREFIX)?.parse().ok()
}

/// Steps of every checkpoint saved under `output_dir`, ascending
pub fn list_checkpoints(output_dir: impl AsRef<Path>) -> Result<Vec<u64>> {
    let output_dir = output_dir.as_ref();
    if !output_dir.exists() {
        return Ok(Vec::new());
    }

    let mut steps = Vec::new();
    for entry in std::fs::read_dir(output_dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        if let Some(step) = entry.file_name().to_str().and_then(checkpoint_step) {
            steps.push(step);
        }
    }
    steps.sort_unstable();
    Ok(steps)
}

/// Highest checkpoint step saved under `output_dir`
pub fn latest_checkpoint(output_dir: impl AsRef<Path>) -> Result<Option<u64>> {
    Ok(list_checkpoints(output_dir)?.last().copied())
}

/// Directory of the checkpoint saved at `step`
pub fn checkpoint_path(output_dir: impl AsRef<Path>, step: u64) -> PathBuf {
    output_dir.as_ref().join(format!("{}{}", CHECKPOINT_PREFIX, step))
}

/// Turn a resume policy into a concrete decision
pub fn resolve_resume(policy: ResumePolicy, output_dir: impl AsRef<Path>) -> Result<ResumeDecision> {
    let output_dir = output_dir.as_ref();

    let decision = match policy {
        ResumePolicy::Fresh => ResumeDecision::Fresh,
        ResumePolicy::Latest => match latest_checkpoint(output_dir)? {
            Some(step) => ResumeDecision::Resume {
                step,
                path: checkpoint_path(output_dir, step),
            },
            None => {
                debug!("No checkpoint found in {}, starting fresh", output_dir.display());
                ResumeDecision::Fresh
            }
        },
        ResumePolicy::Step(step) => {
            let path = checkpoint_path(output_dir, step);
            if !path.is_dir() {
                return Err(Error::checkpoint(format!(
                    "Checkpoint {} has not been saved; look for an existing checkpoint in {}",
                    step,
                    output_dir.display()
                )));
            }
            ResumeDecision::Resume { step, path }
        }
    };

    if let ResumeDecision::Resume { step, .. } = &decision {
        info!("Resuming from checkpoint-{}", step);
    }
    Ok(decision)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn output_dir_with(names: &[&str]) -> TempDir {
        let dir = TempDir::new().unwrap();
        for name in names {
            std::fs::create_dir(dir.path().join(name)).unwrap();
        }
        dir
    }

    #[test]
    fn test_parse_policy() {
        assert_eq!(ResumePolicy::parse("").unwrap(), ResumePolicy::Fresh);
        assert_eq!(ResumePolicy::parse("no").unwrap(), ResumePolicy::Fresh);
        assert_eq!(ResumePolicy::parse("YES").unwrap(), ResumePolicy::Latest);
        assert_eq!(ResumePolicy::parse("yes").unwrap(), ResumePolicy::Latest);
        assert_eq!(ResumePolicy::parse("12").unwrap(), ResumePolicy::Step(12));
        assert_eq!(ResumePolicy::parse("0").unwrap(), ResumePolicy::Fresh);
        assert!(ResumePolicy::parse("latest").is_err());
        assert!(ResumePolicy::parse("-3").is_err());
    }

    #[test]
    fn test_latest_checkpoint_ignores_tmp_and_junk() {
        let dir = output_dir_with(&[
            "checkpoint-5",
            "checkpoint-15",
            "checkpoint-9",
            "tmp-checkpoint-100",
            "checkpoint-20-tmp",
            "checkpoint-final",
            "runs",
        ]);
        std::fs::write(dir.path().join("checkpoint-99"), "not a directory").unwrap();

        assert_eq!(list_checkpoints(dir.path()).unwrap(), vec![5, 9, 15]);
        assert_eq!(latest_checkpoint(dir.path()).unwrap(), Some(15));
    }

    #[test]
    fn test_missing_output_dir_has_no_checkpoints() {
        let dir = TempDir::new().unwrap();
        assert_eq!(latest_checkpoint(dir.path().join("absent")).unwrap(), None);
    }

    #[test]
    fn test_resolve_latest() {
        let dir = output_dir_with(&["checkpoint-3", "checkpoint-7"]);
        let decision = resolve_resume(ResumePolicy::Latest, dir.path()).unwrap();
        assert_eq!(
            decision,
            ResumeDecision::Resume {
                step: 7,
                path: dir.path().join("checkpoint-7")
            }
        );
    }

    #[test]
    fn test_resolve_latest_without_checkpoints_is_fresh() {
        let dir = TempDir::new().unwrap();
        let decision = resolve_resume(ResumePolicy::Latest, dir.path()).unwrap();
        assert_eq!(decision, ResumeDecision::Fresh);
        assert!(decision.checkpoint_dir().is_none());
    }

    #[test]
    fn test_resolve_explicit_step() {
        let dir = output_dir_with(&["checkpoint-12"]);
        let decision = resolve_resume(ResumePolicy::Step(12), dir.path()).unwrap();
        assert_eq!(decision.checkpoint_dir(), Some(dir.path().join("checkpoint-12").as_path()));

        let err = resolve_resume(ResumePolicy::Step(15), dir.path()).unwrap_err();
        assert!(matches!(err, Error::Checkpoint(_)));
    }
}
