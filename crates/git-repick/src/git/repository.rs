use crate::config;
use common::error::GitRepickError;
use common::utils::{debug_log, unescape_git_path, CommandOutput};

use std::path::{Path, PathBuf};
use std::process::{Command, Output, Stdio};

/// Handle to a git working tree, addressed through the git CLI.
///
/// All operations shell out; object ids are plain strings. The pipeline owns
/// one `Repository` for the duration of a pick.
pub struct Repository {
    workdir: PathBuf,
}

impl Repository {
    /// Resolve the repository containing `dir` (or the current directory).
    pub fn discover(dir: Option<&Path>) -> Result<Self, GitRepickError> {
        let mut args: Vec<String> = Vec::new();
        if let Some(dir) = dir {
            args.push("-C".to_string());
            args.push(dir.to_string_lossy().to_string());
        }
        args.push("rev-parse".to_string());
        args.push("--show-toplevel".to_string());
        let output = exec_git(&args)?;
        let toplevel = String::from_utf8(output.stdout)?.trim().to_string();
        Ok(Repository {
            workdir: PathBuf::from(toplevel),
        })
    }

    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    pub fn global_args_for_exec(&self) -> Vec<String> {
        vec!["-C".to_string(), self.workdir.to_string_lossy().to_string()]
    }

    /// Run git, treating a non-zero exit as an error.
    pub fn git(&self, args: &[&str]) -> Result<String, GitRepickError> {
        let mut full = self.global_args_for_exec();
        full.extend(args.iter().map(|s| s.to_string()));
        let output = exec_git(&full)?;
        Ok(String::from_utf8(output.stdout)?)
    }

    /// Run git, capturing the outcome without turning failure into an error.
    pub fn git_status_of(&self, args: &[&str]) -> Result<CommandOutput, GitRepickError> {
        let mut full = self.global_args_for_exec();
        full.extend(args.iter().map(|s| s.to_string()));
        exec_git_capture(&full)
    }

    /// Run git with bytes on stdin, treating a non-zero exit as an error.
    pub fn git_stdin(&self, args: &[&str], stdin_data: &[u8]) -> Result<String, GitRepickError> {
        let mut full = self.global_args_for_exec();
        full.extend(args.iter().map(|s| s.to_string()));
        let output = exec_git_stdin(&full, stdin_data)?;
        Ok(String::from_utf8(output.stdout)?)
    }

    pub fn rev_parse(&self, reference: &str) -> Result<String, GitRepickError> {
        Ok(self.git(&["rev-parse", "--verify", reference])?.trim().to_string())
    }

    pub fn head(&self) -> Result<String, GitRepickError> {
        self.rev_parse("HEAD")
    }

    /// Human-oriented description of HEAD for log output.
    pub fn describe_head(&self) -> String {
        match self.git(&["describe", "--tags", "--all", "--long", "HEAD"]) {
            Ok(description) => description.trim().to_string(),
            Err(_) => "HEAD".to_string(),
        }
    }

    pub fn git_dir(&self) -> Result<PathBuf, GitRepickError> {
        let dir = self.git(&["rev-parse", "--absolute-git-dir"])?;
        Ok(PathBuf::from(dir.trim()))
    }

    /// Attempt a cherry-pick; the caller inspects success.
    pub fn cherry_pick(
        &self,
        commit: &str,
        extra_args: &[String],
    ) -> Result<CommandOutput, GitRepickError> {
        let mut args: Vec<&str> = vec!["cherry-pick"];
        args.extend(extra_args.iter().map(|s| s.as_str()));
        args.push(commit);
        self.git_status_of(&args)
    }

    pub fn abort_cherry_pick(&self) {
        // Nothing to do when no cherry-pick is in flight; git's complaint is
        // not interesting then.
        let _ = self.git_status_of(&["cherry-pick", "--abort"]);
    }

    pub fn cherry_pick_in_progress(&self) -> bool {
        match self.git_dir() {
            Ok(git_dir) => {
                git_dir.join("CHERRY_PICK_HEAD").exists() || git_dir.join("sequencer").exists()
            }
            Err(_) => false,
        }
    }

    pub fn reset_hard(&self, reference: &str) -> Result<(), GitRepickError> {
        self.git(&["reset", "--hard", reference])?;
        Ok(())
    }

    /// True when `git status --porcelain` reports nothing.
    pub fn working_tree_clean(&self) -> Result<bool, GitRepickError> {
        let status = self.git(&["status", "--porcelain"])?;
        Ok(status.trim().is_empty())
    }

    /// Paths touched by a commit, in the order git emits them.
    pub fn changed_files(&self, commit: &str) -> Result<Vec<String>, GitRepickError> {
        let stdout = self.git(&["show", "--name-only", "--format=", commit])?;
        Ok(name_list(&stdout))
    }

    /// Paths introduced by a commit.
    pub fn added_files(&self, commit: &str) -> Result<Vec<String>, GitRepickError> {
        let stdout = self.git(&["show", "--diff-filter=A", "--name-only", "--format=", commit])?;
        Ok(name_list(&stdout))
    }

    /// Raw commit message, `%B`.
    pub fn commit_message(&self, commit: &str) -> Result<String, GitRepickError> {
        self.git(&["log", "-1", "--format=%B", commit])
    }

    pub fn commit_subject(&self, commit: &str) -> Result<String, GitRepickError> {
        Ok(self.git(&["log", "-1", "--format=%s", commit])?.trim().to_string())
    }

    pub fn commit_author(&self, commit: &str) -> Result<String, GitRepickError> {
        Ok(self
            .git(&["log", "-1", "--format=%an <%ae>", commit])?
            .trim()
            .to_string())
    }

    /// The commit's diff against its first parent, without message or color.
    pub fn show_diff(&self, commit: &str) -> Result<String, GitRepickError> {
        self.git(&["show", "--pretty=format:", "--no-color", commit])
    }

    /// File content at a given revision.
    pub fn blob_at(&self, revision: &str, path: &str) -> Result<String, GitRepickError> {
        self.git(&["show", &format!("{}:{}", revision, path)])
    }

    /// True when none of the paths carry staged or unstaged modifications.
    pub fn files_diff_free(&self, paths: &[String]) -> Result<bool, GitRepickError> {
        for path in paths {
            let unstaged = self.git_status_of(&["diff", "--exit-code", "--", path])?;
            if !unstaged.success() {
                return Ok(false);
            }
            let staged = self.git_status_of(&["diff", "--cached", "--exit-code", "--", path])?;
            if !staged.success() {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Subjects of the last `n` commits on the current branch.
    pub fn recent_subjects(&self, n: u32) -> Result<Vec<String>, GitRepickError> {
        let stdout = self.git(&["log", "--format=%s", &format!("-n{}", n)])?;
        Ok(stdout.lines().map(|s| s.to_string()).collect())
    }

    /// Last `n` commit ids reachable from `commit` that touched `paths`.
    pub fn history_commits(
        &self,
        commit: &str,
        n: u32,
        paths: &[String],
    ) -> Result<Vec<String>, GitRepickError> {
        let n_arg = n.to_string();
        let mut args: Vec<&str> = vec!["log", "-n", &n_arg, "--pretty=format:%H", commit, "--"];
        args.extend(paths.iter().map(|s| s.as_str()));
        let stdout = self.git(&args)?;
        Ok(name_list(&stdout))
    }

    /// Commit ids blamed for a line range of `path` at `revision`.
    pub fn blame_range(
        &self,
        revision: &str,
        path: &str,
        start: usize,
        end: usize,
    ) -> Result<Vec<String>, GitRepickError> {
        let range = format!("-L{},{}", start, end);
        let output = self.git_status_of(&["blame", "-l", &range, revision, "--", path])?;
        if !output.success() {
            return Ok(Vec::new());
        }
        Ok(output
            .stdout
            .lines()
            .filter_map(|line| line.split_whitespace().next())
            .map(|s| s.to_string())
            .collect())
    }

    pub fn stage(&self, paths: &[String]) -> Result<(), GitRepickError> {
        if paths.is_empty() {
            return Ok(());
        }
        let mut args: Vec<&str> = vec!["add", "--"];
        args.extend(paths.iter().map(|s| s.as_str()));
        self.git(&args)?;
        Ok(())
    }

    /// Create a commit, optionally restricted to `paths` and with an
    /// explicit author. With no paths the staged index is committed.
    pub fn commit(
        &self,
        message: &str,
        author: Option<&str>,
        paths: &[String],
    ) -> Result<(), GitRepickError> {
        let author_arg = author.map(|a| format!("--author={}", a));
        let mut args: Vec<&str> = vec!["commit", "-m", message];
        if let Some(author_arg) = author_arg.as_deref() {
            args.push(author_arg);
        }
        if !paths.is_empty() {
            args.push("--");
            args.extend(paths.iter().map(|s| s.as_str()));
        }
        self.git(&args)?;
        Ok(())
    }

    /// Replace the message of HEAD.
    pub fn amend_message(&self, message: &str) -> Result<(), GitRepickError> {
        self.git(&["commit", "--amend", "-m", message])?;
        Ok(())
    }

    /// `user.name <user.email>` from git config, when both are set.
    pub fn user_identity(&self) -> Option<String> {
        let name = self.git(&["config", "user.name"]).ok()?;
        let email = self.git(&["config", "user.email"]).ok()?;
        let name = name.trim();
        let email = email.trim();
        if name.is_empty() || email.is_empty() {
            return None;
        }
        Some(format!("{} <{}>", name, email))
    }

    /// Apply a diff to the index and working tree. Used for hunk-free
    /// commits (pure renames, mode changes) which patch(1) cannot express.
    pub fn apply_index(&self, diff_text: &str) -> Result<(), GitRepickError> {
        self.git_stdin(&["apply", "--index"], diff_text.as_bytes())?;
        Ok(())
    }

    /// Restore the listed paths to HEAD, dropping both staged and unstaged
    /// edits. Files introduced by the failed attempt are deleted outright.
    pub fn reset_files(
        &self,
        paths: &[String],
        introduced: &[String],
        remove_rej_files: bool,
    ) -> Result<(), GitRepickError> {
        for path in paths {
            if remove_rej_files {
                let rej = self.workdir.join(format!("{}.rej", path));
                if rej.exists() {
                    let _ = std::fs::remove_file(&rej);
                }
            }
            if introduced.contains(path) {
                let on_disk = self.workdir.join(path);
                if on_disk.exists() {
                    let _ = std::fs::remove_file(&on_disk);
                }
                continue;
            }
            let _ = self.git_status_of(&["reset", "--", path]);
            let _ = self.git_status_of(&["checkout", "--", path]);
        }
        Ok(())
    }
}

fn name_list(stdout: &str) -> Vec<String> {
    stdout
        .lines()
        .map(|s| unescape_git_path(s.trim()))
        .filter(|s| !s.is_empty())
        .collect()
}

pub fn exec_git(args: &[String]) -> Result<Output, GitRepickError> {
    let mut cmd = Command::new(config::Config::get().git_cmd());
    cmd.args(args);

    let output = cmd.output().map_err(GitRepickError::IoError)?;

    if !output.status.success() {
        let code = output.status.code();
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();
        return Err(GitRepickError::GitCliError {
            code,
            stderr,
            args: args.to_vec(),
        });
    }

    Ok(output)
}

/// Like `exec_git`, but captures a non-zero exit instead of erroring.
fn exec_git_capture(args: &[String]) -> Result<CommandOutput, GitRepickError> {
    let mut cmd = Command::new(config::Config::get().git_cmd());
    cmd.args(args);

    let output = cmd.output().map_err(GitRepickError::IoError)?;
    debug_log(&format!(
        "git {:?} returned {:?}",
        args,
        output.status.code()
    ));

    Ok(CommandOutput {
        code: output.status.code(),
        stdout: String::from_utf8_lossy(&output.stdout).to_string(),
        stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        timed_out: false,
    })
}

/// Helper to execute a git command with data provided on stdin
pub fn exec_git_stdin(args: &[String], stdin_data: &[u8]) -> Result<Output, GitRepickError> {
    let mut cmd = Command::new(config::Config::get().git_cmd());
    cmd.args(args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    let mut child = cmd.spawn().map_err(GitRepickError::IoError)?;

    if let Some(mut stdin) = child.stdin.take() {
        use std::io::Write;
        if let Err(e) = stdin.write_all(stdin_data) {
            return Err(GitRepickError::IoError(e));
        }
    }

    let output = child.wait_with_output().map_err(GitRepickError::IoError)?;

    if !output.status.success() {
        let code = output.status.code();
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();
        return Err(GitRepickError::GitCliError {
            code,
            stderr,
            args: args.to_vec(),
        });
    }

    Ok(output)
}
