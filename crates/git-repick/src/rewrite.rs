use crate::diff::Diff;
use common::error::GitRepickError;
use regex::Regex;
use std::path::{Component, Path};

/// One `old_prefix -> new_prefix` mapping, applied to every path a commit
/// references. Rules compose left to right; the first rule whose pattern
/// occurs in a path wins for that path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathRewrite {
    pub src_pattern: String,
    pub dst_pattern: String,
}

impl PathRewrite {
    /// Parse the CLI form `src:dst`.
    pub fn parse(spec: &str) -> Result<PathRewrite, GitRepickError> {
        let Some((src, dst)) = spec.split_once(':') else {
            return Err(GitRepickError::Generic(format!(
                "invalid path rewrite '{}', expected 'src:dst'",
                spec
            )));
        };
        if src.is_empty() {
            return Err(GitRepickError::Generic(format!(
                "invalid path rewrite '{}', source pattern is empty",
                spec
            )));
        }
        Ok(PathRewrite {
            src_pattern: src.to_string(),
            dst_pattern: dst.to_string(),
        })
    }

    fn apply(&self, path: &str) -> String {
        path.replace(&self.src_pattern, &self.dst_pattern)
    }
}

/// Apply rules to a list of plain paths (changed/added file lists).
pub fn rewrite_paths(rules: &[PathRewrite], paths: &[String]) -> Vec<String> {
    paths
        .iter()
        .map(|path| {
            for rule in rules {
                if path.contains(&rule.src_pattern) {
                    return rule.apply(path);
                }
            }
            path.clone()
        })
        .collect()
}

/// Apply rules to a parsed diff: the `old_path`/`new_path` fields and every
/// header line that embeds a path (`diff --git`, `---`, `+++`, `rename
/// from/to`, `copy from/to`). Hunk content is never touched.
pub fn rewrite_diff(rules: &[PathRewrite], diff: &mut Diff) {
    if rules.is_empty() {
        return;
    }

    let header_prefix =
        Regex::new(r"^(diff --git |--- |\+\+\+ |rename from |rename to |copy from |copy to )")
            .unwrap();

    for file in &mut diff.files {
        if let Some(old_path) = &file.old_path {
            file.old_path = Some(first_match_rewrite(rules, old_path));
        }
        if let Some(new_path) = &file.new_path {
            file.new_path = Some(first_match_rewrite(rules, new_path));
        }
        for line in &mut file.header {
            if header_prefix.is_match(line) {
                for rule in rules {
                    if line.contains(&rule.src_pattern) {
                        *line = rule.apply(line);
                        break;
                    }
                }
            }
        }
    }
}

fn first_match_rewrite(rules: &[PathRewrite], path: &str) -> String {
    for rule in rules {
        if path.contains(&rule.src_pattern) {
            return rule.apply(path);
        }
    }
    path.to_string()
}

/// Return paths that would escape the repository root: absolute paths or
/// paths whose `..` components climb out of the tree.
pub fn invalid_repository_paths(paths: &[String]) -> Vec<String> {
    paths
        .iter()
        .filter(|raw| {
            let trimmed = ["a/", "b/", "i/", "w/", "c/", "o/"]
                .iter()
                .find_map(|prefix| raw.strip_prefix(prefix))
                .unwrap_or(raw.as_str());
            !path_stays_in_root(Path::new(trimmed))
        })
        .cloned()
        .collect()
}

fn path_stays_in_root(path: &Path) -> bool {
    if path.is_absolute() {
        return false;
    }
    let mut depth: i32 = 0;
    for component in path.components() {
        match component {
            Component::ParentDir => {
                depth -= 1;
                if depth < 0 {
                    return false;
                }
            }
            Component::Normal(_) => depth += 1,
            Component::CurDir => {}
            Component::RootDir | Component::Prefix(_) => return false,
        }
    }
    true
}
