use crate::config;
use crate::context::{ContextExtractor, Section};
use crate::diff::{Diff, Hunk, LineKind};
use crate::git::Repository;
use crate::llm::client::LlmClient;
use crate::llm::prompt::{parse_reply, RepairPrompt, ReplyParseError};
use crate::patch::Reject;
use crate::pipeline::CancelFlag;
use common::error::GitRepickError;
use common::utils::{debug_log, edit_distance};
use std::collections::HashMap;

/// Hunks are only matched to a section header from the original commit when
/// their line numbers are within this offset.
const HEADER_RECOVERY_MAX_LINE_OFFSET: usize = 100;
/// Minimum share of matching source lines for header recovery.
const HEADER_RECOVERY_MIN_MATCH_PERCENT: usize = 95;

/// Bounds on what the model may be asked and what of its output is accepted.
#[derive(Debug, Clone)]
pub struct GuardLimits {
    /// Reject a repair when the Levenshtein distance between the hunk's
    /// changed lines and the proposed change exceeds this; negative is
    /// unlimited.
    pub max_char_diff: i64,
    /// Reject when distance divided by proposed-change length exceeds this;
    /// negative is unlimited.
    pub max_diff_ratio: f64,
    /// Never send a prompt containing one of these phrases.
    pub filter_phrases: Vec<String>,
    /// Never send a destination section larger than this; zero is unlimited.
    pub max_input_lines: usize,
}

impl Default for GuardLimits {
    fn default() -> Self {
        GuardLimits {
            max_char_diff: 900,
            max_diff_ratio: 1.33,
            filter_phrases: vec![
                "ignore your previous instructions".to_string(),
                "forget the instructions above".to_string(),
            ],
            max_input_lines: 250,
        }
    }
}

/// Why the repair stage gave up. One unresolved reject fails the pick.
#[derive(Debug)]
pub enum RepairFailure {
    /// Transport exhausted its retries.
    Unavailable(String),
    /// The model answered, but outside the response contract.
    ParseFailed(String),
    /// The model emitted the refusal phrase.
    Refused,
    /// A guard limit stopped the repair before or after generation.
    GuardRejected(String),
    /// The reject cannot be mapped onto the destination at all.
    Unresolvable(String),
    Cancelled,
    Internal(GitRepickError),
}

impl From<GitRepickError> for RepairFailure {
    fn from(err: GitRepickError) -> Self {
        RepairFailure::Internal(err)
    }
}

#[derive(Debug, Default)]
pub struct RepairReport {
    pub hunks_repaired: usize,
    pub explanations: Vec<String>,
    pub model_prefix: String,
}

/// Turns rejects into edits of the destination working tree by asking the
/// model to rewrite the enclosing section of each rejected hunk.
pub struct RepairEngine<'a> {
    repo: &'a Repository,
    llm: &'a mut LlmClient,
    extractor: ContextExtractor,
    limits: GuardLimits,
    commit: String,
    /// The revision the hunks were authored against, usually `<commit>^`.
    parent_rev: String,
    commit_message: String,
    /// The commit's (rewritten) diff, for section-header recovery.
    commit_diff: &'a Diff,
    /// Destination path -> path inside the source commit, for blob lookups
    /// when path rewrites renamed files on the way over.
    source_paths: HashMap<String, String>,
}

impl<'a> RepairEngine<'a> {
    pub fn new(
        repo: &'a Repository,
        llm: &'a mut LlmClient,
        limits: GuardLimits,
        commit: &str,
        parent_rev: &str,
        commit_diff: &'a Diff,
        source_paths: HashMap<String, String>,
    ) -> Result<Self, GitRepickError> {
        let commit_message = repo.commit_message(commit)?;
        Ok(RepairEngine {
            repo,
            llm,
            extractor: ContextExtractor::from_config(),
            limits,
            commit: commit.to_string(),
            parent_rev: parent_rev.to_string(),
            commit_message,
            commit_diff,
            source_paths,
        })
    }

    /// Repair every reject, file by file, hunks grouped by section header.
    /// The whole batch must succeed; any failure leaves the tree for the
    /// pipeline to roll back.
    pub fn repair_all(
        &mut self,
        rejects: &[Reject],
        cancel: &CancelFlag,
    ) -> Result<RepairReport, RepairFailure> {
        if rejects.is_empty() {
            return Err(RepairFailure::Unresolvable(
                "no parseable rejects to repair".to_string(),
            ));
        }

        let mut report = RepairReport {
            model_prefix: self.llm.model_prefix(),
            ..RepairReport::default()
        };

        for reject in rejects {
            if cancel.is_cancelled() {
                return Err(RepairFailure::Cancelled);
            }
            self.repair_file(reject, cancel, &mut report)?;
            std::fs::remove_file(&reject.rej_path).map_err(GitRepickError::IoError)?;
            debug_log(&format!("resolved reject sidecar {}", reject.rej_path.display()));
        }

        Ok(report)
    }

    fn repair_file(
        &mut self,
        reject: &Reject,
        cancel: &CancelFlag,
        report: &mut RepairReport,
    ) -> Result<(), RepairFailure> {
        let on_disk = self.repo.workdir().join(&reject.path);
        let contents = std::fs::read_to_string(&on_disk).map_err(|e| {
            RepairFailure::Unresolvable(format!(
                "cannot read reject target {}: {}",
                reject.path, e
            ))
        })?;
        let had_trailing_newline = contents.ends_with('\n');
        let mut dest_lines: Vec<String> = contents.lines().map(|s| s.to_string()).collect();

        // A deletion that cannot find its victim lines has nothing to
        // anchor a repair to.
        for hunk in &reject.file.hunks {
            if deletion_without_anchor(hunk, &dest_lines) {
                return Err(RepairFailure::Unresolvable(format!(
                    "deletion-only hunk at line {} of {} has no matching lines in the destination",
                    hunk.old_start, reject.path
                )));
            }
        }

        let (mut by_section, mut headerless) = self.partition_hunks(reject);

        // Work bottom-up so earlier replacements do not shift later ones.
        let mut headers: Vec<String> = by_section.keys().cloned().collect();
        headers.sort_by_key(|header| {
            std::cmp::Reverse(by_section[header].first().map(|h| h.old_start).unwrap_or(0))
        });

        for header in headers {
            let hunks = by_section.remove(&header).unwrap_or_default();
            match self.repair_section(reject, &header, &hunks, &mut dest_lines, cancel)? {
                SectionOutcome::Repaired { summary } => {
                    report.hunks_repaired += hunks.len();
                    report.explanations.push(summary);
                }
                SectionOutcome::FallBack => headerless.extend(hunks),
            }
        }

        if !headerless.is_empty() {
            debug_log(&format!(
                "processing {} hunks without a usable section in {}",
                headerless.len(),
                reject.path
            ));
            headerless.sort_by_key(|h| std::cmp::Reverse(h.old_start));
            for hunk in &headerless {
                let summary = self.repair_windowed(reject, hunk, &mut dest_lines, cancel)?;
                report.hunks_repaired += 1;
                report.explanations.push(summary);
            }
        }

        let mut output = dest_lines.join("\n");
        if had_trailing_newline {
            output.push('\n');
        }
        std::fs::write(&on_disk, output).map_err(GitRepickError::IoError)?;
        Ok(())
    }

    /// Group a reject's hunks by section header, recovering missing headers
    /// from the commit's own hunks where the content overlaps.
    fn partition_hunks(&self, reject: &Reject) -> (HashMap<String, Vec<Hunk>>, Vec<Hunk>) {
        let mut by_section: HashMap<String, Vec<Hunk>> = HashMap::new();
        let mut headerless = Vec::new();

        let commit_hunks: Vec<&Hunk> = self
            .commit_diff
            .files
            .iter()
            .filter(|f| f.target_path() == Some(reject.path.as_str()))
            .flat_map(|f| f.hunks.iter())
            .collect();

        for hunk in &reject.file.hunks {
            let mut hunk = hunk.clone();
            if hunk.section.trim().is_empty() {
                if let Some(recovered) = recover_section_header(&hunk, &commit_hunks) {
                    debug_log(&format!(
                        "recovered section header '{}' for hunk at line {}",
                        recovered, hunk.old_start
                    ));
                    hunk.section = recovered;
                }
            }
            if hunk.section.trim().is_empty() {
                headerless.push(hunk);
            } else {
                by_section.entry(hunk.section.clone()).or_default().push(hunk);
            }
        }

        for hunks in by_section.values_mut() {
            hunks.sort_by_key(|h| h.old_start);
        }
        (by_section, headerless)
    }

    fn repair_section(
        &mut self,
        reject: &Reject,
        header: &str,
        hunks: &[Hunk],
        dest_lines: &mut Vec<String>,
        cancel: &CancelFlag,
    ) -> Result<SectionOutcome, RepairFailure> {
        let source_path = self
            .source_paths
            .get(&reject.path)
            .cloned()
            .unwrap_or_else(|| reject.path.clone());

        let Ok(parent_blob) = self.repo.blob_at(&self.parent_rev, &source_path) else {
            return Ok(SectionOutcome::FallBack);
        };
        let parent_lines: Vec<String> = parent_blob.lines().map(|s| s.to_string()).collect();
        let Ok(src_before) = self.extractor.section_for_header(header, &parent_lines) else {
            debug_log(&format!(
                "no section '{}' in {}:{}, using windowed repair",
                header, self.parent_rev, source_path
            ));
            return Ok(SectionOutcome::FallBack);
        };

        let Ok(commit_blob) = self.repo.blob_at(&self.commit, &source_path) else {
            return Ok(SectionOutcome::FallBack);
        };
        let commit_lines: Vec<String> = commit_blob.lines().map(|s| s.to_string()).collect();
        let Ok(src_after) = self.extractor.section_for_header(header, &commit_lines) else {
            return Ok(SectionOutcome::FallBack);
        };

        let Ok(dst_section) = self.extractor.section_for_header(header, dest_lines) else {
            debug_log(&format!(
                "no section '{}' in destination {}, using windowed repair",
                header, reject.path
            ));
            return Ok(SectionOutcome::FallBack);
        };

        let max_difference = config::Config::get().max_section_length_difference();
        if src_before.len().abs_diff(dst_section.len()) > max_difference {
            return Err(RepairFailure::GuardRejected(format!(
                "section '{}' drifted too far: {} lines in source, {} in destination",
                header,
                src_before.len(),
                dst_section.len()
            )));
        }

        let extra = config::Config::get().section_extra_context();
        let rejected_content = hunks
            .iter()
            .map(|h| h.render())
            .collect::<Vec<_>>()
            .join("\n");
        let commit_message = self.commit_message.clone();
        let source_before_text = widen(&src_before, extra, &parent_lines).join("\n");
        let source_after_text = widen(&src_after, extra, &commit_lines).join("\n");
        let destination_text = widen(&dst_section, extra, dest_lines).join("\n");

        let prompt = RepairPrompt {
            commit_message: &commit_message,
            file_name: &reject.path,
            rejected_hunks: &rejected_content,
            source_before: &source_before_text,
            source_after: &source_after_text,
            destination: &destination_text,
        };

        let reply = self.ask(&prompt, dst_section.len(), cancel)?;

        // The model returns a whole section; locate it inside the reply so
        // stray prose around the code block is never written to disk.
        let snippet_lines: Vec<String> = reply.snippet;
        let Ok(snippet_section) = self.extractor.section_for_header(header, &snippet_lines) else {
            return Ok(SectionOutcome::FallBack);
        };
        let replacement: Vec<String> = snippet_section.slice(&snippet_lines).to_vec();

        self.check_output_guards(
            &rejected_content,
            dst_section.slice(dest_lines),
            &replacement,
        )?;

        splice(dest_lines, dst_section, replacement);

        // The edit must leave the file in a state where the section still
        // parses; a truncated or unbalanced snippet fails the pick here.
        if self.extractor.section_for_header(header, dest_lines).is_err() {
            return Err(RepairFailure::ParseFailed(format!(
                "replacement for section '{}' no longer parses",
                header
            )));
        }

        let summary = reply.summary.unwrap_or_else(|| {
            format!("adapted section '{}' (no change summary from model)", header)
        });
        Ok(SectionOutcome::Repaired { summary })
    }

    /// Fallback for hunks without a locatable section: map the hunk onto the
    /// destination by a uniquely matching line, then have the model rewrite
    /// a fixed-width window around it.
    fn repair_windowed(
        &mut self,
        reject: &Reject,
        hunk: &Hunk,
        dest_lines: &mut Vec<String>,
        cancel: &CancelFlag,
    ) -> Result<String, RepairFailure> {
        let offset = match_offset(hunk, dest_lines).ok_or_else(|| {
            RepairFailure::Unresolvable(format!(
                "no line of the hunk at {} appears uniquely in {}",
                hunk.old_start, reject.path
            ))
        })?;

        let window = config::Config::get().window_context();
        let mapped_start = hunk.old_start.saturating_add_signed(-offset).max(1);
        let start = mapped_start.saturating_sub(window).max(1);
        let end = (mapped_start + hunk.old_count + window).min(dest_lines.len());
        let dst_section = Section {
            start_line: start,
            end_line: end.max(start),
        };

        let source_path = self
            .source_paths
            .get(&reject.path)
            .cloned()
            .unwrap_or_else(|| reject.path.clone());
        let source_before = self
            .repo
            .blob_at(&self.parent_rev, &source_path)
            .map(|blob| {
                let lines: Vec<String> = blob.lines().map(|s| s.to_string()).collect();
                window_text(&lines, hunk.old_start, hunk.old_count, window)
            })
            .unwrap_or_default();
        let source_after = self
            .repo
            .blob_at(&self.commit, &source_path)
            .map(|blob| {
                let lines: Vec<String> = blob.lines().map(|s| s.to_string()).collect();
                window_text(&lines, hunk.new_start, hunk.new_count, window)
            })
            .unwrap_or_default();

        let rejected_content = hunk.render();
        let commit_message = self.commit_message.clone();
        let destination_text = dst_section.slice(dest_lines).join("\n");
        let prompt = RepairPrompt {
            commit_message: &commit_message,
            file_name: &reject.path,
            rejected_hunks: &rejected_content,
            source_before: &source_before,
            source_after: &source_after,
            destination: &destination_text,
        };

        let reply = self.ask(&prompt, dst_section.len(), cancel)?;
        let replacement = reply.snippet;

        self.check_output_guards(
            &rejected_content,
            dst_section.slice(dest_lines),
            &replacement,
        )?;

        splice(dest_lines, dst_section, replacement);

        Ok(reply.summary.unwrap_or_else(|| {
            format!(
                "adapted hunk at line {} of {} (no change summary from model)",
                hunk.old_start, reject.path
            )
        }))
    }

    fn ask(
        &mut self,
        prompt: &RepairPrompt<'_>,
        input_lines: usize,
        cancel: &CancelFlag,
    ) -> Result<crate::llm::prompt::ParsedReply, RepairFailure> {
        if self.limits.max_input_lines != 0 && input_lines > self.limits.max_input_lines {
            return Err(RepairFailure::GuardRejected(format!(
                "destination section has {} lines, limit is {}",
                input_lines, self.limits.max_input_lines
            )));
        }

        let rendered = prompt.render();
        let lowered = rendered.to_lowercase();
        for phrase in &self.limits.filter_phrases {
            if lowered.contains(&phrase.to_lowercase()) {
                return Err(RepairFailure::GuardRejected(format!(
                    "prompt contains filtered phrase '{}'",
                    phrase
                )));
            }
        }

        if cancel.is_cancelled() {
            return Err(RepairFailure::Cancelled);
        }

        let answer = self
            .llm
            .query(&rendered)
            .map_err(|e| RepairFailure::Unavailable(e.to_string()))?;

        parse_reply(&answer, &prompt.boundary_marker()).map_err(|e| match e {
            ReplyParseError::Refused => RepairFailure::Refused,
            other => RepairFailure::ParseFailed(other.to_string()),
        })
    }

    /// Bound how far the applied change may drift from the rejected hunk.
    fn check_output_guards(
        &self,
        rejected_content: &str,
        before: &[String],
        after: &[String],
    ) -> Result<(), RepairFailure> {
        if self.limits.max_char_diff < 0 && self.limits.max_diff_ratio < 0.0 {
            return Ok(());
        }

        let hunk_changes: Vec<&str> = rejected_content
            .lines()
            .filter(|l| l.starts_with('-') || l.starts_with('+'))
            .filter(|l| !l.starts_with("---") && !l.starts_with("+++"))
            .collect();
        let proposed_changes = line_level_changes(before, after);

        let proposed_text = proposed_changes.join("\n");
        let distance = edit_distance(&hunk_changes.join("\n"), &proposed_text);
        let ratio = if proposed_text.is_empty() {
            0.0
        } else {
            distance as f64 / proposed_text.len() as f64
        };
        debug_log(&format!(
            "LLM change has edit distance {} and relative distance {:.3}",
            distance, ratio
        ));

        if self.limits.max_char_diff >= 0 && distance as i64 > self.limits.max_char_diff {
            return Err(RepairFailure::GuardRejected(format!(
                "proposed change drifts {} characters from the hunk, limit is {}",
                distance, self.limits.max_char_diff
            )));
        }
        if self.limits.max_diff_ratio >= 0.0 && ratio > self.limits.max_diff_ratio {
            return Err(RepairFailure::GuardRejected(format!(
                "proposed change ratio {:.3} exceeds limit {:.3}",
                ratio, self.limits.max_diff_ratio
            )));
        }
        Ok(())
    }
}

enum SectionOutcome {
    Repaired { summary: String },
    FallBack,
}

/// Replace `section`'s line range inside `lines` with `replacement`.
fn splice(lines: &mut Vec<String>, section: Section, replacement: Vec<String>) {
    let start = section.start_line.saturating_sub(1).min(lines.len());
    let end = section.end_line.min(lines.len());
    lines.splice(start..end, replacement);
}

/// Extend a section by `extra` lines each side, clamped to the file.
fn widen(section: &Section, extra: usize, lines: &[String]) -> Vec<String> {
    let widened = Section {
        start_line: section.start_line.saturating_sub(extra).max(1),
        end_line: (section.end_line + extra).min(lines.len().max(1)),
    };
    widened.slice(lines).to_vec()
}

fn window_text(lines: &[String], start: usize, count: usize, window: usize) -> String {
    if lines.is_empty() {
        return String::new();
    }
    let section = Section {
        start_line: start.saturating_sub(window).max(1),
        end_line: (start + count + window).min(lines.len()),
    };
    if section.end_line < section.start_line {
        return String::new();
    }
    section.slice(lines).join("\n")
}

/// True for a hunk that only deletes lines, none of which exist in the
/// destination: nothing to delete, nothing to repair.
fn deletion_without_anchor(hunk: &Hunk, dest_lines: &[String]) -> bool {
    let has_additions = hunk.lines.iter().any(|l| l.kind == LineKind::Added);
    if has_additions {
        return false;
    }
    let removed: Vec<&str> = hunk
        .lines
        .iter()
        .filter(|l| l.kind == LineKind::Removed)
        .map(|l| l.text.trim())
        .filter(|t| !t.is_empty())
        .collect();
    if removed.is_empty() {
        return false;
    }
    !removed
        .iter()
        .any(|needle| dest_lines.iter().any(|line| line.trim() == *needle))
}

/// Find the offset between the hunk's line numbers and the destination by
/// locating a hunk line that appears exactly once in the file.
fn match_offset(hunk: &Hunk, dest_lines: &[String]) -> Option<isize> {
    let mut matches: Vec<(usize, usize)> = Vec::new(); // (hunk line no, file line no)

    for (idx, line) in hunk.source_lines().iter().enumerate() {
        let needle = line.trim();
        if needle.is_empty() {
            continue;
        }
        let mut hit: Option<usize> = None;
        let mut ambiguous = false;
        for (file_idx, file_line) in dest_lines.iter().enumerate() {
            if file_line.trim() == needle {
                if hit.is_some() {
                    ambiguous = true;
                    break;
                }
                hit = Some(file_idx + 1);
            }
        }
        if ambiguous {
            continue;
        }
        if let Some(file_line) = hit {
            matches.push((hunk.old_start + idx, file_line));
        }
    }

    let (hunk_line, file_line) = matches.into_iter().min()?;
    Some(hunk_line as isize - file_line as isize)
}

/// Order-preserving multiset difference in both directions: the lines the
/// proposal removes from and adds to the section. An approximation of a
/// proper diff that is plenty for a distance guard.
fn line_level_changes(before: &[String], after: &[String]) -> Vec<String> {
    let mut changes = Vec::new();
    let mut after_pool: Vec<&String> = after.iter().collect();
    for line in before {
        if let Some(pos) = after_pool.iter().position(|l| *l == line) {
            after_pool.remove(pos);
        } else {
            changes.push(format!("-{}", line));
        }
    }
    let mut before_pool: Vec<&String> = before.iter().collect();
    for line in after {
        if let Some(pos) = before_pool.iter().position(|l| *l == line) {
            before_pool.remove(pos);
        } else {
            changes.push(format!("+{}", line));
        }
    }
    changes
}

/// Borrow a section header from a commit hunk whose pre-image overlaps the
/// rejected hunk almost entirely.
fn recover_section_header(rejected: &Hunk, commit_hunks: &[&Hunk]) -> Option<String> {
    for original in commit_hunks {
        if original.section.trim().is_empty() {
            continue;
        }
        if rejected.old_start.abs_diff(original.old_start) > HEADER_RECOVERY_MAX_LINE_OFFSET {
            continue;
        }

        let rejected_lines: Vec<&str> = rejected
            .source_lines()
            .iter()
            .map(|l| l.trim())
            .filter(|l| !l.is_empty())
            .collect();
        let original_lines: Vec<&str> = original
            .source_lines()
            .iter()
            .map(|l| l.trim())
            .filter(|l| !l.is_empty())
            .collect();
        if rejected_lines.is_empty() || original_lines.is_empty() {
            continue;
        }

        let matching = rejected_lines
            .iter()
            .filter(|l| original_lines.contains(l))
            .count();
        let similarity = matching * 100 / rejected_lines.len().max(original_lines.len());
        if similarity >= HEADER_RECOVERY_MIN_MATCH_PERCENT {
            return Some(original.section.clone());
        }
    }
    None
}
