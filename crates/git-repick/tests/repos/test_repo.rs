#![allow(dead_code)]

use git_repick::git::Repository;
use std::path::Path;
use std::process::Command;
use tempfile::TempDir;

/// A throwaway git repository for pipeline tests.
pub struct TestRepo {
    dir: TempDir,
}

impl TestRepo {
    pub fn new() -> Self {
        let dir = TempDir::new().expect("failed to create temp dir");
        let repo = TestRepo { dir };
        repo.git(&["init", "-b", "main"]);
        repo.git(&["config", "user.name", "Test User"]);
        repo.git(&["config", "user.email", "test@example.com"]);
        repo.git(&["config", "commit.gpgsign", "false"]);
        repo
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Run git in the repo, panicking on failure. Returns stdout.
    pub fn git(&self, args: &[&str]) -> String {
        let output = Command::new("git")
            .arg("-C")
            .arg(self.dir.path())
            .args(args)
            .output()
            .expect("failed to run git");
        if !output.status.success() {
            panic!(
                "git {:?} failed:\nstdout: {}\nstderr: {}",
                args,
                String::from_utf8_lossy(&output.stdout),
                String::from_utf8_lossy(&output.stderr)
            );
        }
        String::from_utf8_lossy(&output.stdout).into_owned()
    }

    /// Run git, returning success instead of panicking.
    pub fn try_git(&self, args: &[&str]) -> bool {
        Command::new("git")
            .arg("-C")
            .arg(self.dir.path())
            .args(args)
            .output()
            .map(|output| output.status.success())
            .unwrap_or(false)
    }

    pub fn write(&self, rel_path: &str, contents: &str) {
        let path = self.dir.path().join(rel_path);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).expect("failed to create parent dirs");
        }
        std::fs::write(path, contents).expect("failed to write file");
    }

    pub fn read(&self, rel_path: &str) -> String {
        std::fs::read_to_string(self.dir.path().join(rel_path)).expect("failed to read file")
    }

    pub fn exists(&self, rel_path: &str) -> bool {
        self.dir.path().join(rel_path).exists()
    }

    /// Move a file, creating destination directories as needed. The move is
    /// picked up by the next `commit_all`.
    pub fn rename(&self, rel_from: &str, rel_to: &str) {
        let to = self.dir.path().join(rel_to);
        if let Some(parent) = to.parent() {
            std::fs::create_dir_all(parent).expect("failed to create parent dirs");
        }
        std::fs::rename(self.dir.path().join(rel_from), to).expect("failed to move file");
    }

    /// Stage everything and commit; returns the new commit id.
    pub fn commit_all(&self, message: &str) -> String {
        self.git(&["add", "-A"]);
        self.git(&["commit", "-m", message]);
        self.head()
    }

    pub fn head(&self) -> String {
        self.git(&["rev-parse", "HEAD"]).trim().to_string()
    }

    pub fn commit_message(&self, rev: &str) -> String {
        self.git(&["log", "-1", "--format=%B", rev])
    }

    pub fn repository(&self) -> Repository {
        Repository::discover(Some(self.dir.path())).expect("failed to open test repository")
    }
}

impl Default for TestRepo {
    fn default() -> Self {
        Self::new()
    }
}
