use crate::config;
use crate::diff::{parse_reject, FileDiff};
use crate::git::Repository;
use common::error::GitRepickError;
use common::utils::{debug_log, run_command};
use std::path::PathBuf;

/// A hunk group the patch tool could not place, read back from a `.rej`
/// sidecar. Consumed at most once by the repair engine.
#[derive(Debug)]
pub struct Reject {
    /// Repository-relative path of the file the hunks target.
    pub path: String,
    /// The sidecar on disk, removed once the reject is resolved.
    pub rej_path: PathBuf,
    pub file: FileDiff,
}

#[derive(Debug)]
pub enum PatchStageResult {
    /// Every hunk applied at the given fuzz level.
    Applied { fuzz: u32 },
    /// The loosest rung still left rejects; the working tree holds the hunks
    /// that did apply plus one `.rej` sidecar per failing file.
    Rejected { rejects: Vec<Reject> },
}

/// Try the diff against the working tree at each fuzz level, strictest
/// first. Intermediate rungs discard their partial application; the final
/// rung keeps both the applied hunks and the reject sidecars so the repair
/// stage can take over.
pub fn apply_with_ladder(
    repo: &Repository,
    diff_text: &str,
    changed_files: &[String],
    added_files: &[String],
    min_fuzz: u32,
    max_fuzz: u32,
) -> Result<PatchStageResult, GitRepickError> {
    if diff_text.is_empty() {
        return Err(GitRepickError::Generic("no patch content given".to_string()));
    }

    for fuzz in min_fuzz..=max_fuzz {
        let last_rung = fuzz == max_fuzz;
        let output = run_patch(repo, diff_text, fuzz, last_rung)?;
        debug_log(&format!(
            "patch with fuzz={} {}",
            fuzz,
            if output.success() { "applied" } else { "was rejected" }
        ));
        if output.success() {
            return Ok(PatchStageResult::Applied { fuzz });
        }
        if !last_rung {
            repo.reset_files(changed_files, added_files, true)?;
        }
    }

    let rejects = collect_rejects(repo)?;
    if rejects.is_empty() {
        // The tool failed without telling us which hunks it could not place:
        // a malformed diff or a tree it refuses to touch.
        return Err(GitRepickError::PatchCliError {
            code: None,
            stderr: "patch failed without emitting reject files".to_string(),
        });
    }
    Ok(PatchStageResult::Rejected { rejects })
}

fn run_patch(
    repo: &Repository,
    diff_text: &str,
    fuzz: u32,
    keep_rej_files: bool,
) -> Result<common::utils::CommandOutput, GitRepickError> {
    let mut argv = vec![
        config::Config::get().patch_cmd().to_string(),
        "-p1".to_string(),
        "--no-backup-if-mismatch".to_string(),
        format!("--fuzz={}", fuzz),
    ];
    if !keep_rej_files {
        argv.push("--reject-file=-".to_string());
        argv.push("--quiet".to_string());
    }
    run_command(&argv, Some(repo.workdir()), Some(diff_text.as_bytes()))
}

/// Find and parse every `.rej` sidecar under the repository root, in path
/// order so repair work is deterministic.
pub fn collect_rejects(repo: &Repository) -> Result<Vec<Reject>, GitRepickError> {
    let pattern = format!("{}/**/*.rej", repo.workdir().display());
    let mut rejects = Vec::new();

    let entries = glob::glob(&pattern)
        .map_err(|e| GitRepickError::Generic(format!("bad reject glob pattern: {}", e)))?;
    for entry in entries {
        let rej_path = match entry {
            Ok(path) => path,
            Err(e) => {
                debug_log(&format!("skipping unreadable reject candidate: {}", e));
                continue;
            }
        };
        let contents = std::fs::read_to_string(&rej_path)?;
        let file = match parse_reject(&contents) {
            Ok(parsed) => parsed,
            Err(e) => {
                eprintln!("Error processing rejected file {}: {}", rej_path.display(), e);
                continue;
            }
        };
        // The sidecar sits next to its target; that beats the header paths,
        // which still carry the prefix of whatever diff was applied.
        let target = rej_path
            .strip_prefix(repo.workdir())
            .unwrap_or(&rej_path)
            .with_extension("");
        rejects.push(Reject {
            path: target.to_string_lossy().replace('\\', "/"),
            rej_path,
            file,
        });
    }

    rejects.sort_by(|a, b| a.path.cmp(&b.path));
    Ok(rejects)
}
