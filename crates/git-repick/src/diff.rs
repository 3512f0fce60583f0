use common::error::GitRepickError;
use common::utils::unescape_git_path;
use once_cell::sync::Lazy;
use regex::Regex;

/// One line of a hunk body, tagged with its role.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineKind {
    Context,
    Removed,
    Added,
}

#[derive(Debug, Clone)]
pub struct DiffLine {
    pub kind: LineKind,
    pub text: String,
    /// True when the line is followed by a `\ No newline at end of file`
    /// marker in the source text.
    pub no_newline: bool,
    /// Some emitters strip the leading space from blank context lines; the
    /// bare form must survive re-emission.
    pub bare_blank: bool,
}

impl DiffLine {
    fn new(kind: LineKind, text: &str) -> Self {
        DiffLine {
            kind,
            text: text.to_string(),
            no_newline: false,
            bare_blank: false,
        }
    }

    fn bare_blank_context() -> Self {
        DiffLine {
            kind: LineKind::Context,
            text: String::new(),
            no_newline: false,
            bare_blank: true,
        }
    }
}

/// A contiguous block of changes within one file.
#[derive(Debug, Clone)]
pub struct Hunk {
    pub old_start: usize,
    pub old_count: usize,
    pub new_start: usize,
    pub new_count: usize,
    /// Text following the closing `@@`, usually the enclosing function line.
    pub section: String,
    /// The header exactly as it appeared, for lossless emission.
    pub raw_header: String,
    pub lines: Vec<DiffLine>,
}

impl Hunk {
    /// Lines of the pre-image: context plus removed.
    pub fn source_lines(&self) -> Vec<&str> {
        self.lines
            .iter()
            .filter(|l| l.kind != LineKind::Added)
            .map(|l| l.text.as_str())
            .collect()
    }

    /// Lines of the post-image: context plus added.
    pub fn target_lines(&self) -> Vec<&str> {
        self.lines
            .iter()
            .filter(|l| l.kind != LineKind::Removed)
            .map(|l| l.text.as_str())
            .collect()
    }

    pub fn render(&self) -> String {
        let mut out = String::new();
        out.push_str(&self.raw_header);
        out.push('\n');
        for line in &self.lines {
            if !line.bare_blank {
                let prefix = match line.kind {
                    LineKind::Context => ' ',
                    LineKind::Removed => '-',
                    LineKind::Added => '+',
                };
                out.push(prefix);
                out.push_str(&line.text);
            }
            out.push('\n');
            if line.no_newline {
                out.push_str("\\ No newline at end of file\n");
            }
        }
        out
    }

    fn verify_counts(&self) -> Result<(), GitRepickError> {
        let mut old_seen = 0usize;
        let mut new_seen = 0usize;
        for line in &self.lines {
            match line.kind {
                LineKind::Context => {
                    old_seen += 1;
                    new_seen += 1;
                }
                LineKind::Removed => old_seen += 1,
                LineKind::Added => new_seen += 1,
            }
        }
        if old_seen != self.old_count || new_seen != self.new_count {
            return Err(GitRepickError::Generic(format!(
                "malformed hunk {}: counted {}/{} lines, header says {}/{}",
                self.raw_header, old_seen, new_seen, self.old_count, self.new_count
            )));
        }
        Ok(())
    }
}

/// One file's worth of a unified diff.
#[derive(Debug, Clone)]
pub struct FileDiff {
    /// Path on the pre-image side; `None` for added files.
    pub old_path: Option<String>,
    /// Path on the post-image side; `None` for deleted files.
    pub new_path: Option<String>,
    /// Raw header lines (`diff --git` through the line before the first
    /// hunk), kept verbatim for lossless emission.
    pub header: Vec<String>,
    pub hunks: Vec<Hunk>,
    pub is_binary: bool,
}

impl FileDiff {
    /// The path the change lands on in the working tree.
    pub fn target_path(&self) -> Option<&str> {
        self.new_path.as_deref().or(self.old_path.as_deref())
    }

    pub fn is_added(&self) -> bool {
        self.old_path.is_none() && self.new_path.is_some()
    }

    pub fn is_deleted(&self) -> bool {
        self.new_path.is_none() && self.old_path.is_some()
    }

    pub fn render(&self) -> String {
        let mut out = String::new();
        for line in &self.header {
            out.push_str(line);
            out.push('\n');
        }
        for hunk in &self.hunks {
            out.push_str(&hunk.render());
        }
        out
    }
}

/// A parsed multi-file unified diff, re-emittable byte for byte.
#[derive(Debug, Clone, Default)]
pub struct Diff {
    /// Lines preceding the first `diff --git`, kept verbatim.
    pub preamble: Vec<String>,
    pub files: Vec<FileDiff>,
    trailing_newline: bool,
}

static HUNK_HEADER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^@@ -(\d+)(?:,(\d+))? \+(\d+)(?:,(\d+))? @@(.*)$").unwrap());
static DIFF_GIT: Lazy<Regex> = Lazy::new(|| Regex::new(r"^diff --git a/(.*) b/(.*)$").unwrap());

impl Diff {
    pub fn parse(text: &str) -> Result<Diff, GitRepickError> {
        let lines: Vec<&str> = text.split('\n').collect();
        // A trailing newline yields one empty final element from split.
        let trailing_newline = text.ends_with('\n');
        let upper = if trailing_newline {
            lines.len() - 1
        } else {
            lines.len()
        };

        let mut diff = Diff {
            preamble: Vec::new(),
            files: Vec::new(),
            trailing_newline,
        };

        let mut i = 0;
        while i < upper {
            let line = lines[i];
            if line.starts_with("diff --git ") {
                let (file, consumed) = parse_file(&lines[..upper], i)?;
                diff.files.push(file);
                i += consumed;
            } else if diff.files.is_empty() {
                diff.preamble.push(line.to_string());
                i += 1;
            } else {
                return Err(GitRepickError::Generic(format!(
                    "unexpected line outside any file diff: {}",
                    line
                )));
            }
        }

        Ok(diff)
    }

    pub fn render(&self) -> String {
        let mut out = String::new();
        for (idx, line) in self.preamble.iter().enumerate() {
            out.push_str(line);
            if idx + 1 < self.preamble.len() || !self.files.is_empty() || self.trailing_newline {
                out.push('\n');
            }
        }
        for file in &self.files {
            out.push_str(&file.render());
        }
        if !self.trailing_newline && out.ends_with('\n') {
            out.pop();
        }
        out
    }

    pub fn has_hunks(&self) -> bool {
        self.files.iter().any(|f| !f.hunks.is_empty())
    }

    pub fn binary_paths(&self) -> Vec<String> {
        self.files
            .iter()
            .filter(|f| f.is_binary)
            .filter_map(|f| f.target_path().map(|p| p.to_string()))
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

fn parse_file(lines: &[&str], start: usize) -> Result<(FileDiff, usize), GitRepickError> {
    let mut header = vec![lines[start].to_string()];
    let mut old_path: Option<String> = None;
    let mut new_path: Option<String> = None;
    let mut saw_minus_header = false;
    let mut saw_plus_header = false;
    let mut rename_from: Option<String> = None;
    let mut rename_to: Option<String> = None;
    let mut is_binary = false;
    let mut deleted = false;
    let mut added = false;

    let mut i = start + 1;
    while i < lines.len() {
        let line = lines[i];
        if line.starts_with("diff --git ") || line.starts_with("@@ ") {
            break;
        }
        if let Some(rest) = line.strip_prefix("--- ") {
            saw_minus_header = true;
            old_path = strip_diff_path(rest);
        } else if let Some(rest) = line.strip_prefix("+++ ") {
            saw_plus_header = true;
            new_path = strip_diff_path(rest);
        } else if let Some(rest) = line.strip_prefix("rename from ") {
            rename_from = Some(unescape_git_path(rest));
        } else if let Some(rest) = line.strip_prefix("rename to ") {
            rename_to = Some(unescape_git_path(rest));
        } else if line.starts_with("Binary files ") || line.starts_with("GIT binary patch") {
            is_binary = true;
        } else if line.starts_with("deleted file mode ") {
            deleted = true;
        } else if line.starts_with("new file mode ") {
            added = true;
        }
        header.push(line.to_string());
        i += 1;
    }

    // Renames and mode-only changes carry no ---/+++ lines; fall back to the
    // rename headers, then to the diff --git line itself.
    if !saw_minus_header && !saw_plus_header {
        if rename_from.is_some() || rename_to.is_some() {
            old_path = rename_from;
            new_path = rename_to;
        } else if let Some(caps) = DIFF_GIT.captures(lines[start]) {
            old_path = Some(unescape_git_path(&caps[1]));
            new_path = Some(unescape_git_path(&caps[2]));
        }
        if deleted {
            new_path = None;
        }
        if added {
            old_path = None;
        }
    }

    let mut hunks = Vec::new();
    while i < lines.len() && HUNK_HEADER.is_match(lines[i]) {
        let (hunk, next) = parse_hunk(lines, i, lines.len())?;
        hunks.push(hunk);
        i = next;
    }

    Ok((
        FileDiff {
            old_path,
            new_path,
            header,
            hunks,
            is_binary,
        },
        i - start,
    ))
}

/// Parse one hunk starting at `lines[at]` (which must match the hunk header
/// pattern). Returns the hunk and the index of the first unconsumed line.
fn parse_hunk(lines: &[&str], at: usize, upper: usize) -> Result<(Hunk, usize), GitRepickError> {
    let caps = HUNK_HEADER
        .captures(lines[at])
        .ok_or_else(|| GitRepickError::Generic(format!("not a hunk header: {}", lines[at])))?;
    let old_start: usize = caps[1].parse().unwrap_or(0);
    let old_count: usize = caps.get(2).map_or(1, |m| m.as_str().parse().unwrap_or(1));
    let new_start: usize = caps[3].parse().unwrap_or(0);
    let new_count: usize = caps.get(4).map_or(1, |m| m.as_str().parse().unwrap_or(1));

    let mut hunk = Hunk {
        old_start,
        old_count,
        new_start,
        new_count,
        section: caps[5].trim_start().to_string(),
        raw_header: lines[at].to_string(),
        lines: Vec::new(),
    };

    let mut i = at + 1;
    let mut old_seen = 0usize;
    let mut new_seen = 0usize;
    while i < upper && (old_seen < hunk.old_count || new_seen < hunk.new_count) {
        let body = lines[i];
        if let Some(rest) = body.strip_prefix(' ') {
            hunk.lines.push(DiffLine::new(LineKind::Context, rest));
            old_seen += 1;
            new_seen += 1;
        } else if let Some(rest) = body.strip_prefix('-') {
            hunk.lines.push(DiffLine::new(LineKind::Removed, rest));
            old_seen += 1;
        } else if let Some(rest) = body.strip_prefix('+') {
            hunk.lines.push(DiffLine::new(LineKind::Added, rest));
            new_seen += 1;
        } else if body.starts_with('\\') {
            if let Some(last) = hunk.lines.last_mut() {
                last.no_newline = true;
            }
        } else if body.is_empty() {
            hunk.lines.push(DiffLine::bare_blank_context());
            old_seen += 1;
            new_seen += 1;
        } else {
            break;
        }
        i += 1;
    }
    // A trailing no-newline marker can follow the final counted line.
    if i < upper && lines[i].starts_with('\\') {
        if let Some(last) = hunk.lines.last_mut() {
            last.no_newline = true;
        }
        i += 1;
    }

    hunk.verify_counts()?;
    Ok((hunk, i))
}

/// Strip the `a/`-style prefix and any trailing timestamp from a `---`/`+++`
/// header path. `/dev/null` maps to `None`.
fn strip_diff_path(raw: &str) -> Option<String> {
    let raw = raw.split('\t').next().unwrap_or(raw).trim_end();
    if raw == "/dev/null" {
        return None;
    }
    let unescaped = unescape_git_path(raw);
    let stripped = ["a/", "b/", "i/", "w/", "c/", "o/"]
        .iter()
        .find_map(|prefix| unescaped.strip_prefix(prefix))
        .unwrap_or(&unescaped);
    Some(stripped.to_string())
}

/// Parse one reject file produced by the patch tool. Rejects start at the
/// `---`/`+++` headers, without a `diff --git` line.
pub fn parse_reject(text: &str) -> Result<FileDiff, GitRepickError> {
    let lines: Vec<&str> = text.split('\n').collect();
    let upper = if text.ends_with('\n') {
        lines.len() - 1
    } else {
        lines.len()
    };

    let mut header = Vec::new();
    let mut old_path = None;
    let mut new_path = None;

    let mut i = 0;
    while i < upper && !lines[i].starts_with("@@ ") {
        let line = lines[i];
        if let Some(rest) = line.strip_prefix("--- ") {
            old_path = strip_diff_path(rest);
        } else if let Some(rest) = line.strip_prefix("+++ ") {
            new_path = strip_diff_path(rest);
        }
        header.push(line.to_string());
        i += 1;
    }

    if old_path.is_none() && new_path.is_none() {
        return Err(GitRepickError::Generic(
            "reject file carries no file headers".to_string(),
        ));
    }

    let mut hunks = Vec::new();
    while i < upper {
        if !HUNK_HEADER.is_match(lines[i]) {
            return Err(GitRepickError::Generic(format!(
                "unexpected line in reject file: {}",
                lines[i]
            )));
        }
        let (hunk, next) = parse_hunk(&lines, i, upper)?;
        hunks.push(hunk);
        i = next;
    }

    Ok(FileDiff {
        old_path,
        new_path,
        header,
        hunks,
        is_binary: false,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\
diff --git a/src/alpha.c b/src/alpha.c
index 11111..22222 100644
--- a/src/alpha.c
+++ b/src/alpha.c
@@ -1,5 +1,6 @@ int alpha(void)
 int alpha(void)
 {
-    return 1;
+    int x = 2;
+    return x;
 }

diff --git a/src/beta.c b/src/beta.c
new file mode 100644
index 00000..33333
--- /dev/null
+++ b/src/beta.c
@@ -0,0 +1,3 @@
+int beta(void)
+{
+}
diff --git a/old/name.c b/new/name.c
similarity index 100%
rename from old/name.c
rename to new/name.c
diff --git a/gone.c b/gone.c
deleted file mode 100644
index 44444..00000
--- a/gone.c
+++ /dev/null
@@ -1,1 +0,0 @@
-int gone;
";

    #[test]
    fn test_parse_then_render_is_fixed_point() {
        let diff = Diff::parse(SAMPLE).unwrap();
        assert_eq!(diff.render(), SAMPLE);
    }

    #[test]
    fn test_parsed_paths_and_kinds() {
        let diff = Diff::parse(SAMPLE).unwrap();
        assert_eq!(diff.files.len(), 4);

        let modified = &diff.files[0];
        assert_eq!(modified.old_path.as_deref(), Some("src/alpha.c"));
        assert_eq!(modified.new_path.as_deref(), Some("src/alpha.c"));
        assert_eq!(modified.hunks.len(), 1);
        assert_eq!(modified.hunks[0].section, "int alpha(void)");

        let created = &diff.files[1];
        assert!(created.is_added());
        assert_eq!(created.target_path(), Some("src/beta.c"));

        let renamed = &diff.files[2];
        assert_eq!(renamed.old_path.as_deref(), Some("old/name.c"));
        assert_eq!(renamed.new_path.as_deref(), Some("new/name.c"));
        assert!(renamed.hunks.is_empty());

        let removed = &diff.files[3];
        assert!(removed.is_deleted());
        assert_eq!(removed.target_path(), Some("gone.c"));
    }

    #[test]
    fn test_hunk_line_tags_match_counts() {
        let diff = Diff::parse(SAMPLE).unwrap();
        let hunk = &diff.files[0].hunks[0];
        assert_eq!(hunk.old_start, 1);
        assert_eq!(hunk.old_count, 5);
        assert_eq!(hunk.new_count, 6);
        assert_eq!(hunk.source_lines().len(), 5);
        assert_eq!(hunk.target_lines().len(), 6);
    }

    #[test]
    fn test_no_newline_marker_round_trip() {
        let text = "\
diff --git a/f b/f
index 1..2 100644
--- a/f
+++ b/f
@@ -1 +1 @@
-old
\\ No newline at end of file
+new
\\ No newline at end of file
";
        let diff = Diff::parse(text).unwrap();
        assert_eq!(diff.render(), text);
    }

    #[test]
    fn test_binary_detection() {
        let text = "\
diff --git a/blob.bin b/blob.bin
index 1..2 100644
Binary files a/blob.bin and b/blob.bin differ
";
        let diff = Diff::parse(text).unwrap();
        assert!(diff.files[0].is_binary);
        assert_eq!(diff.binary_paths(), vec!["blob.bin".to_string()]);
    }

    #[test]
    fn test_malformed_hunk_counts_rejected() {
        let text = "\
diff --git a/f b/f
--- a/f
+++ b/f
@@ -1,3 +1,3 @@
 only one line
";
        assert!(Diff::parse(text).is_err());
    }

    #[test]
    fn test_parse_reject_file() {
        let text = "\
--- src/alpha.c
+++ src/alpha.c
@@ -4,3 +4,3 @@ int alpha(void)
 {
-    return 1;
+    return 2;
 }
";
        let reject = parse_reject(text).unwrap();
        assert_eq!(reject.target_path(), Some("src/alpha.c"));
        assert_eq!(reject.hunks.len(), 1);
        assert_eq!(reject.hunks[0].section, "int alpha(void)");
    }

    #[test]
    fn test_preamble_preserved() {
        let text = format!("\ncommit noise\n{}", SAMPLE);
        let diff = Diff::parse(&text).unwrap();
        assert_eq!(diff.preamble, vec!["".to_string(), "commit noise".to_string()]);
        assert_eq!(diff.render(), text);
    }
}
