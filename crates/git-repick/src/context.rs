use crate::config;
use common::error::GitRepickError;
use common::utils::debug_log;
use regex::Regex;

/// A contiguous slice of a file used as model context. Line numbers are
/// 1-based and inclusive, and always span the range that was asked for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Section {
    pub start_line: usize,
    pub end_line: usize,
}

impl Section {
    pub fn slice<'a>(&self, lines: &'a [String]) -> &'a [String] {
        let start = self.start_line.saturating_sub(1).min(lines.len());
        let end = self.end_line.min(lines.len());
        &lines[start..end]
    }

    /// Number of lines spanned; a section is never shorter than one line.
    pub fn len(&self) -> usize {
        self.end_line - self.start_line + 1
    }

    pub fn is_empty(&self) -> bool {
        self.end_line < self.start_line
    }
}

/// Locates the enclosing code unit around a target, with a fixed-width
/// window as the fallback. Heuristic and language-agnostic: section starts
/// are recognized by pattern, section ends by brace balance.
pub struct ContextExtractor {
    patterns: Vec<Regex>,
    window: usize,
}

impl ContextExtractor {
    pub fn from_config() -> Self {
        let cfg = config::Config::get();
        let patterns = cfg
            .section_start_patterns()
            .iter()
            .filter_map(|p| match Regex::new(p) {
                Ok(re) => Some(re),
                Err(e) => {
                    eprintln!("git-repick: ignoring bad section pattern '{}': {}", p, e);
                    None
                }
            })
            .collect();
        ContextExtractor {
            patterns,
            window: cfg.window_context(),
        }
    }

    #[cfg(test)]
    pub fn with_patterns(patterns: Vec<Regex>, window: usize) -> Self {
        ContextExtractor { patterns, window }
    }

    /// Find the section introduced by a line containing `header` (the text a
    /// diff hunk carries after `@@ ... @@`). Errors when the header cannot
    /// be found or the section never closes.
    pub fn section_for_header(
        &self,
        header: &str,
        lines: &[String],
    ) -> Result<Section, GitRepickError> {
        let header = header.trim();
        if header.is_empty() {
            return Err(GitRepickError::Generic(
                "no section header given to locate".to_string(),
            ));
        }
        let start_line = lines
            .iter()
            .position(|line| line.contains(header))
            .map(|idx| idx + 1)
            .ok_or_else(|| {
                GitRepickError::Generic(format!(
                    "failed to find section '{}' in {} lines",
                    header,
                    lines.len()
                ))
            })?;

        let end_line = find_brace_section_end(start_line, lines).ok_or_else(|| {
            GitRepickError::Generic(format!("failed to find end of section '{}'", header))
        })?;

        debug_log(&format!(
            "located section '{}' at lines {}-{} of {}",
            header,
            start_line,
            end_line,
            lines.len()
        ));
        Ok(Section {
            start_line,
            end_line,
        })
    }

    /// Smallest enclosing section around `target_start..=target_end`
    /// (1-based). Falls back to a fixed window when no section start is
    /// found above the target.
    pub fn section_for_range(
        &self,
        lines: &[String],
        target_start: usize,
        target_end: usize,
    ) -> Section {
        let target_start = target_start.clamp(1, lines.len().max(1));
        let target_end = target_end.clamp(target_start, lines.len().max(1));

        let Some(section_start) = self.nearest_section_start(lines, target_start) else {
            return self.window_around(lines, target_start, target_end);
        };

        let start_indent = indent_width(&lines[section_start - 1]);
        let section_end = find_brace_section_end(section_start, lines)
            .or_else(|| self.next_section_start_below(lines, section_start, start_indent))
            .unwrap_or(lines.len());

        Section {
            start_line: section_start.min(target_start),
            end_line: section_end.max(target_end),
        }
    }

    fn nearest_section_start(&self, lines: &[String], from: usize) -> Option<usize> {
        let mut min_indent = usize::MAX;
        for idx in (1..=from.min(lines.len())).rev() {
            let line = &lines[idx - 1];
            if line.trim().is_empty() {
                continue;
            }
            let indent = indent_width(line);
            if indent > min_indent {
                continue;
            }
            min_indent = indent;
            if self.patterns.iter().any(|re| re.is_match(line)) {
                return Some(idx);
            }
        }
        None
    }

    fn next_section_start_below(
        &self,
        lines: &[String],
        section_start: usize,
        indent: usize,
    ) -> Option<usize> {
        for idx in (section_start + 1)..=lines.len() {
            let line = &lines[idx - 1];
            if line.trim().is_empty() {
                continue;
            }
            if indent_width(line) <= indent && self.patterns.iter().any(|re| re.is_match(line)) {
                return Some(idx - 1);
            }
        }
        None
    }

    fn window_around(&self, lines: &[String], target_start: usize, target_end: usize) -> Section {
        Section {
            start_line: target_start.saturating_sub(self.window).max(1),
            end_line: (target_end + self.window).min(lines.len().max(1)),
        }
    }
}

/// Find the end line of a brace-delimited section by counting brackets from
/// its first line. Returns `None` when the braces never balance (or the
/// section has none).
fn find_brace_section_end(start_line: usize, lines: &[String]) -> Option<usize> {
    let mut brace_count: i64 = 0;
    let mut seen_open = false;

    for (offset, line) in lines[start_line - 1..].iter().enumerate() {
        for c in line.chars() {
            match c {
                '{' => {
                    brace_count += 1;
                    seen_open = true;
                }
                '}' => {
                    brace_count -= 1;
                    if seen_open && brace_count == 0 {
                        return Some(start_line + offset);
                    }
                }
                _ => {}
            }
        }
    }

    None
}

fn indent_width(line: &str) -> usize {
    line.chars()
        .take_while(|c| *c == ' ' || *c == '\t')
        .map(|c| if c == '\t' { 8 } else { 1 })
        .sum()
}
