use crate::config;
use crate::diff::Diff;
use crate::git::Repository;
use crate::llm::cache::PromptCache;
use crate::llm::client::{HttpTransport, LlmClient, LlmTransport};
use crate::patch::{self, PatchStageResult};
use crate::repair::{GuardLimits, RepairEngine, RepairFailure};
use crate::rewrite::{self, PathRewrite};
use crate::validate::ValidationRunner;
use common::error::GitRepickError;
use common::utils::{debug_log, CommandOutput};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// How many history commits are considered when hunting for dependency
/// (context) commits.
const DEPENDENCY_HISTORY_COMMITS: u32 = 5;
/// Blame this many lines around each hunk when discovering context commits.
const DEPENDENCY_BLAME_CONTEXT: usize = 3;

/// Cooperative cancellation, checked at every suspension point.
#[derive(Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationTrigger {
    None,
    EachFile,
    All,
}

#[derive(Debug, Clone)]
pub struct PickOptions {
    pub llm_enabled: bool,
    pub llm_model: Option<String>,
    pub llm_region: Option<String>,
    pub llm_cache_path: Option<PathBuf>,
    /// Ordered `(old_prefix, new_prefix)` pairs; first match wins.
    pub path_rewrites: Vec<PathRewrite>,
    pub validation_command: Option<String>,
    pub run_validation_after: ValidationTrigger,
    pub signoff: bool,
    pub record_origin: bool,
    /// Upper bound on preparatory dependency picks; zero disables them.
    pub dependency_depth: u32,
    pub min_fuzz: u32,
    pub max_fuzz: u32,
    pub keep_author: bool,
    /// Retry the native stage once with `--strategy=recursive -Xpatience`.
    pub auto_strategy: bool,
    /// Refuse when the commit subject appears in the last N subjects of the
    /// destination branch; zero disables the check.
    pub presence_check: u32,
    /// Recognized cherry-pick flags forwarded to the native stage.
    pub passthrough_args: Vec<String>,
    /// Leave the result staged but uncommitted (`-n`).
    pub no_commit: bool,
    pub guards: GuardLimits,
}

impl Default for PickOptions {
    fn default() -> Self {
        PickOptions {
            llm_enabled: true,
            llm_model: None,
            llm_region: None,
            llm_cache_path: None,
            path_rewrites: Vec::new(),
            validation_command: None,
            run_validation_after: ValidationTrigger::All,
            signoff: false,
            record_origin: false,
            dependency_depth: 2,
            min_fuzz: 1,
            max_fuzz: 2,
            keep_author: true,
            auto_strategy: true,
            presence_check: 100,
            passthrough_args: Vec::new(),
            no_commit: false,
            guards: GuardLimits::default(),
        }
    }
}

/// Which stage carried the pick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PickAttempt {
    Native,
    GitApply,
    PatchTool { fuzz: u32 },
    LlmRepair { hunks: usize },
}

#[derive(Debug)]
pub struct PickOutcome {
    pub succeeded_via: PickAttempt,
    pub annotations: Vec<String>,
    pub rejects_resolved: usize,
    pub validation_passed: bool,
    pub validation_output: Option<CommandOutput>,
    /// HEAD after the pick, when a commit was created.
    pub new_head: Option<String>,
}

#[derive(Debug)]
pub enum PickFailure {
    /// The pick refused to start.
    WorkingTreeDirty,
    /// The commit's subject already appears in recent history.
    AlreadyPresent { subject: String },
    /// The commit touches binary files and the native stage failed.
    BinaryConflict { paths: Vec<String> },
    /// Nothing left to apply (also raised when rewriting empties the diff).
    EmptyDiff,
    /// The patch stage left rejects and the LLM stage is unavailable.
    PatchRejected,
    /// The patch stage failed structurally.
    PatchUnresolvable(String),
    LlmUnavailable(String),
    LlmParseFailed(String),
    LlmRefused,
    LlmGuardRejected(String),
    ValidationFailed(CommandOutput),
    /// Dependency picks would exceed their bound or revisit a commit.
    DependencyLimit,
    Cancelled,
    /// The working tree could not be restored; loud on purpose.
    RollbackError(String),
    Internal(GitRepickError),
}

impl PickFailure {
    pub fn exit_code(&self) -> i32 {
        match self {
            PickFailure::PatchRejected => 2,
            PickFailure::LlmUnavailable(_)
            | PickFailure::LlmParseFailed(_)
            | PickFailure::LlmRefused
            | PickFailure::LlmGuardRejected(_) => 3,
            PickFailure::ValidationFailed(_) => 4,
            PickFailure::RollbackError(_) => 5,
            _ => 1,
        }
    }
}

impl fmt::Display for PickFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PickFailure::WorkingTreeDirty => {
                write!(f, "working tree is not clean; commit or stash changes first")
            }
            PickFailure::AlreadyPresent { subject } => {
                write!(f, "commit is already present in the current branch: {}", subject)
            }
            PickFailure::BinaryConflict { paths } => {
                write!(f, "cannot repair binary files: {}", paths.join(", "))
            }
            PickFailure::EmptyDiff => write!(f, "commit has an empty diff, nothing to pick"),
            PickFailure::PatchRejected => {
                write!(f, "patch stage left rejected hunks and the LLM stage is disabled")
            }
            PickFailure::PatchUnresolvable(msg) => write!(f, "patch stage failed: {}", msg),
            PickFailure::LlmUnavailable(msg) => write!(f, "LLM unavailable: {}", msg),
            PickFailure::LlmParseFailed(msg) => {
                write!(f, "LLM response could not be used: {}", msg)
            }
            PickFailure::LlmRefused => write!(f, "LLM declined to generate patched code"),
            PickFailure::LlmGuardRejected(msg) => {
                write!(f, "LLM change rejected by limits: {}", msg)
            }
            PickFailure::ValidationFailed(output) => write!(
                f,
                "validation command failed with exit code {:?}",
                output.code
            ),
            PickFailure::DependencyLimit => {
                write!(f, "dependency picks exceeded their configured bound")
            }
            PickFailure::Cancelled => write!(f, "pick was cancelled"),
            PickFailure::RollbackError(msg) => write!(
                f,
                "rollback failed, the working tree may be inconsistent: {}",
                msg
            ),
            PickFailure::Internal(err) => write!(f, "{}", err),
        }
    }
}

impl From<GitRepickError> for PickFailure {
    fn from(err: GitRepickError) -> Self {
        PickFailure::Internal(err)
    }
}

impl From<RepairFailure> for PickFailure {
    fn from(err: RepairFailure) -> Self {
        match err {
            RepairFailure::Unavailable(msg) => PickFailure::LlmUnavailable(msg),
            RepairFailure::ParseFailed(msg) => PickFailure::LlmParseFailed(msg),
            RepairFailure::Refused => PickFailure::LlmRefused,
            RepairFailure::GuardRejected(msg) => PickFailure::LlmGuardRejected(msg),
            RepairFailure::Unresolvable(msg) => PickFailure::PatchUnresolvable(msg),
            RepairFailure::Cancelled => PickFailure::Cancelled,
            RepairFailure::Internal(err) => PickFailure::Internal(err),
        }
    }
}

/// The pick state machine. Owns the working tree for the duration of a pick:
/// native cherry-pick, then the patch-tool fuzz ladder, then LLM repair,
/// then validation, with exact rollback on every failure path.
pub struct Pipeline {
    repo: Repository,
    cancel: CancelFlag,
    /// Commits currently being picked, for cycle detection in dependency
    /// picks.
    in_flight: HashSet<String>,
    /// Every path changed since the pipeline started, for `All` validation.
    session_changed: Vec<String>,
    transport_override: Option<Box<dyn LlmTransport>>,
}

impl Pipeline {
    pub fn new(repo: Repository) -> Self {
        Pipeline {
            repo,
            cancel: CancelFlag::new(),
            in_flight: HashSet::new(),
            session_changed: Vec::new(),
            transport_override: None,
        }
    }

    pub fn repo(&self) -> &Repository {
        &self.repo
    }

    pub fn cancel_flag(&self) -> CancelFlag {
        self.cancel.clone()
    }

    /// Substitute the LLM transport; tests use a scripted one.
    pub fn set_transport(&mut self, transport: Box<dyn LlmTransport>) {
        self.transport_override = Some(transport);
    }

    pub fn pick(
        &mut self,
        commit_ref: &str,
        options: &PickOptions,
    ) -> Result<PickOutcome, PickFailure> {
        let commit = self.repo.rev_parse(commit_ref)?;
        if self.in_flight.contains(&commit) {
            return Err(PickFailure::DependencyLimit);
        }

        // START: the tree must be exclusively ours and clean.
        if self.repo.cherry_pick_in_progress() {
            self.repo.abort_cherry_pick();
        }
        if !self.repo.working_tree_clean()? {
            return Err(PickFailure::WorkingTreeDirty);
        }
        let snapshot = self.repo.head()?;

        self.in_flight.insert(commit.clone());
        let result = self.pick_inner(&commit, options, &snapshot);
        self.in_flight.remove(&commit);

        match result {
            Ok(outcome) => Ok(outcome),
            Err(failure) => {
                self.rollback(&snapshot, &commit, options)?;
                Err(failure)
            }
        }
    }

    fn pick_inner(
        &mut self,
        commit: &str,
        options: &PickOptions,
        snapshot: &str,
    ) -> Result<PickOutcome, PickFailure> {
        let destination = self.repo.describe_head();
        debug_log(&format!(
            "on {} cherry-pick {} with passthrough args {:?}",
            destination, commit, options.passthrough_args
        ));
        self.check_cancel()?;

        if options.presence_check > 0 {
            let subject = self.repo.commit_subject(commit)?;
            if self.repo.recent_subjects(options.presence_check)?.contains(&subject) {
                return Err(PickFailure::AlreadyPresent { subject });
            }
        }

        let changed_src = self.repo.changed_files(commit)?;
        if changed_src.is_empty() {
            return Err(PickFailure::EmptyDiff);
        }
        let invalid = rewrite::invalid_repository_paths(&changed_src);
        if !invalid.is_empty() {
            return Err(PickFailure::PatchUnresolvable(format!(
                "commit references paths outside the repository: {}",
                invalid.join(", ")
            )));
        }

        let changed = rewrite::rewrite_paths(&options.path_rewrites, &changed_src);
        let added_src = self.repo.added_files(commit)?;
        let added = rewrite::rewrite_paths(&options.path_rewrites, &added_src);

        let validator = match &options.validation_command {
            Some(command) => Some(ValidationRunner::from_command_line(command)?),
            None => None,
        };
        let parent_rev = parent_revision(commit, &options.passthrough_args);

        // NATIVE_TRY. Pointless when path rewrites are configured: git would
        // apply the change to the source-tree paths.
        if options.path_rewrites.is_empty() {
            if let Some(outcome) =
                self.try_native(commit, options, snapshot, &changed, validator.as_ref())?
            {
                return Ok(outcome);
            }

            if !options.no_commit && options.dependency_depth > 0 {
                if let Some(outcome) = self.try_with_dependencies(
                    commit,
                    options,
                    snapshot,
                    &changed,
                    validator.as_ref(),
                )? {
                    return Ok(outcome);
                }
            }
        }

        // PATCH_TRY.
        if options.max_fuzz == 0 {
            debug_log("patch stage disabled (--max-fuzz=0)");
            return Err(PickFailure::PatchRejected);
        }
        self.check_cancel()?;

        let diff_text = if parent_rev == format!("{}^", commit) {
            self.repo.show_diff(commit)?
        } else {
            self.repo.git(&["diff", &parent_rev, commit])?
        };
        let mut diff = Diff::parse(&diff_text)
            .map_err(|e| PickFailure::PatchUnresolvable(e.to_string()))?;
        if diff.is_empty() {
            return Err(PickFailure::EmptyDiff);
        }
        let binary = diff.binary_paths();
        if !binary.is_empty() {
            return Err(PickFailure::BinaryConflict { paths: binary });
        }

        rewrite::rewrite_diff(&options.path_rewrites, &mut diff);
        let mut referenced: Vec<String> = Vec::new();
        for file in &diff.files {
            referenced.extend(file.old_path.iter().cloned());
            referenced.extend(file.new_path.iter().cloned());
        }
        let invalid = rewrite::invalid_repository_paths(&referenced);
        if !invalid.is_empty() {
            return Err(PickFailure::PatchUnresolvable(format!(
                "rewritten diff references paths outside the repository: {}",
                invalid.join(", ")
            )));
        }
        let rewritten_text = diff.render();

        for file in &diff.files {
            if file.is_added() {
                if let Some(path) = file.target_path() {
                    if self.repo.workdir().join(path).exists() {
                        return Err(PickFailure::PatchUnresolvable(format!(
                            "file {} introduced by the commit already exists",
                            path
                        )));
                    }
                }
            } else if let Some(path) = &file.old_path {
                if !self.repo.workdir().join(path).exists() {
                    return Err(PickFailure::PatchUnresolvable(format!(
                        "file {} changed by the commit does not exist",
                        path
                    )));
                }
            }
        }

        // A pure rename or mode change has no hunks for patch(1) to chew on.
        if !diff.has_hunks() {
            self.repo.apply_index(&rewritten_text).map_err(|e| {
                PickFailure::PatchUnresolvable(format!("git apply failed: {}", e))
            })?;
            return self.finish_commit(
                commit,
                options,
                PickAttempt::GitApply,
                vec!["Applied with: git apply".to_string()],
                0,
                &changed,
                &added,
                validator.as_ref(),
            );
        }

        let ladder_result = patch::apply_with_ladder(
            &self.repo,
            &rewritten_text,
            &changed,
            &added,
            options.min_fuzz,
            options.max_fuzz,
        )
        .map_err(|e| PickFailure::PatchUnresolvable(e.to_string()))?;

        let rejects = match ladder_result {
            PatchStageResult::Applied { fuzz } => {
                return self.finish_commit(
                    commit,
                    options,
                    PickAttempt::PatchTool { fuzz },
                    vec![format!("Applied with: patch tool (fuzz={})", fuzz)],
                    0,
                    &changed,
                    &added,
                    validator.as_ref(),
                );
            }
            PatchStageResult::Rejected { rejects } => rejects,
        };

        // LLM_TRY.
        if !options.llm_enabled {
            debug_log(&format!(
                "{} rejects left and the LLM stage is disabled",
                rejects.len()
            ));
            return Err(PickFailure::PatchRejected);
        }
        self.check_cancel()?;

        let transport: Box<dyn LlmTransport> = match self.transport_override.take() {
            Some(transport) => transport,
            None => Box::new(
                HttpTransport::from_options(
                    options.llm_model.as_deref(),
                    options.llm_region.as_deref(),
                )
                .map_err(|e| PickFailure::LlmUnavailable(e.to_string()))?,
            ),
        };
        let cache_path = options
            .llm_cache_path
            .clone()
            .or_else(|| config::Config::get().llm_cache_path());
        let mut llm = LlmClient::new(transport, cache_path.map(PromptCache::new));

        let source_paths: HashMap<String, String> = changed
            .iter()
            .cloned()
            .zip(changed_src.iter().cloned())
            .collect();
        let report = {
            let mut engine = RepairEngine::new(
                &self.repo,
                &mut llm,
                options.guards.clone(),
                commit,
                &parent_rev,
                &diff,
                source_paths,
            )?;
            engine.repair_all(&rejects, &self.cancel)?
        };
        debug_log(&format!(
            "LLM stats: {:?} (model {})",
            llm.stats(),
            llm.model_id()
        ));

        let mut annotations = vec![format!(
            "Applied with: LLM repair ({} hunks)",
            report.hunks_repaired
        )];
        annotations.extend(report.explanations.iter().cloned());

        self.finish_commit(
            commit,
            options,
            PickAttempt::LlmRepair {
                hunks: report.hunks_repaired,
            },
            annotations,
            report.hunks_repaired,
            &changed,
            &added,
            validator.as_ref(),
        )
    }

    /// NATIVE_TRY: plain cherry-pick, then once more with the patience
    /// strategy. Returns the finished outcome on success, `None` to fall
    /// through to the patch stage.
    fn try_native(
        &mut self,
        commit: &str,
        options: &PickOptions,
        snapshot: &str,
        changed: &[String],
        validator: Option<&ValidationRunner>,
    ) -> Result<Option<PickOutcome>, PickFailure> {
        let mut strategy_sets: Vec<Vec<String>> = vec![Vec::new()];
        let user_has_strategy = options
            .passthrough_args
            .iter()
            .any(|a| a.starts_with("--strategy") || a.starts_with("-X"));
        if options.auto_strategy && !user_has_strategy {
            strategy_sets.push(vec![
                "--strategy=recursive".to_string(),
                "-Xpatience".to_string(),
            ]);
        }

        for strategy in strategy_sets {
            self.check_cancel()?;
            let mut args = options.passthrough_args.clone();
            args.extend(strategy.iter().cloned());
            if options.no_commit && !args.iter().any(|a| a == "-n" || a == "--no-commit") {
                args.push("-n".to_string());
            }
            let attempt = self.repo.cherry_pick(commit, &args)?;
            if attempt.success() {
                debug_log(&format!(
                    "native cherry-pick succeeded with strategy args {:?}",
                    strategy
                ));
                let outcome = self.finish_native(commit, options, changed, validator)?;
                return Ok(Some(outcome));
            }
            debug_log(&format!(
                "native cherry-pick failed: {}",
                attempt.stderr.trim()
            ));
            self.repo.abort_cherry_pick();
            self.repo.reset_hard(snapshot)?;
        }
        Ok(None)
    }

    /// Native success path: amend the created commit with the audit trail,
    /// then validate.
    fn finish_native(
        &mut self,
        commit: &str,
        options: &PickOptions,
        changed: &[String],
        validator: Option<&ValidationRunner>,
    ) -> Result<PickOutcome, PickFailure> {
        let annotations = vec!["Applied with: native cherry-pick".to_string()];
        if !options.no_commit {
            let message =
                self.build_message(&self.repo.commit_message(commit)?, &annotations, options, commit);
            self.repo.amend_message(&message)?;
        }

        self.session_changed.extend(changed.iter().cloned());
        let (validation_passed, validation_output) =
            self.run_validation(options, validator, changed)?;

        Ok(PickOutcome {
            succeeded_via: PickAttempt::Native,
            annotations,
            rejects_resolved: 0,
            validation_passed,
            validation_output,
            new_head: if options.no_commit {
                None
            } else {
                Some(self.repo.head()?)
            },
        })
    }

    /// Commit construction for the patch and LLM stages, plus the shape
    /// cross-check and validation.
    #[allow(clippy::too_many_arguments)]
    fn finish_commit(
        &mut self,
        commit: &str,
        options: &PickOptions,
        attempt: PickAttempt,
        annotations: Vec<String>,
        rejects_resolved: usize,
        changed: &[String],
        added: &[String],
        validator: Option<&ValidationRunner>,
    ) -> Result<PickOutcome, PickFailure> {
        self.check_cancel()?;

        let mut all_paths: Vec<String> = changed.to_vec();
        for path in added {
            if !all_paths.contains(path) {
                all_paths.push(path.clone());
            }
        }

        let mut new_head = None;
        if !options.no_commit {
            let message =
                self.build_message(&self.repo.commit_message(commit)?, &annotations, options, commit);
            let author = if options.keep_author {
                Some(self.repo.commit_author(commit)?)
            } else {
                None
            };
            // `git apply --index` already staged everything, including the
            // delete half of renames; commit the index as a whole there.
            if matches!(attempt, PickAttempt::GitApply) {
                self.repo.commit(&message, author.as_deref(), &[])?;
            } else {
                self.repo.stage(&all_paths)?;
                self.repo.commit(&message, author.as_deref(), &all_paths)?;
            }

            // The reconstructed commit must change the same files with the
            // same number of hunks as the source commit did.
            if !matches!(attempt, PickAttempt::GitApply)
                && !self.commit_shapes_match(commit, options)?
            {
                return Err(PickFailure::PatchUnresolvable(
                    "reconstructed commit does not match the shape of the source commit"
                        .to_string(),
                ));
            }
            new_head = Some(self.repo.head()?);
        } else {
            self.repo.stage(&all_paths)?;
        }

        self.session_changed.extend(all_paths.iter().cloned());
        let (validation_passed, validation_output) =
            self.run_validation(options, validator, &all_paths)?;

        Ok(PickOutcome {
            succeeded_via: attempt,
            annotations,
            rejects_resolved,
            validation_passed,
            validation_output,
            new_head,
        })
    }

    /// Try to prepare the destination with up to `dependency_depth` context
    /// commits discovered by blame, then retry the native pick. Rolls back
    /// to `snapshot` and reports `None` when any step fails.
    fn try_with_dependencies(
        &mut self,
        commit: &str,
        options: &PickOptions,
        snapshot: &str,
        changed: &[String],
        validator: Option<&ValidationRunner>,
    ) -> Result<Option<PickOutcome>, PickFailure> {
        let history =
            self.repo
                .history_commits(commit, DEPENDENCY_HISTORY_COMMITS, changed)?;
        let context = self.find_context_commits(commit)?;
        let mut relevant: Vec<String> = history
            .into_iter()
            .filter(|c| context.contains(c))
            .collect();
        if relevant.is_empty() {
            debug_log("no dependency commits found near the target hunks");
            return Ok(None);
        }
        // History is newest-first; keep the tail `depth` candidates and
        // apply them in that listing order.
        let depth = options.dependency_depth as usize;
        if relevant.len() > depth {
            relevant = relevant.split_off(relevant.len() - depth);
        }

        debug_log(&format!(
            "attempting {} dependency commit(s) before picking {}",
            relevant.len(),
            commit
        ));

        for dependency in &relevant {
            self.check_cancel()?;
            if self.in_flight.contains(dependency) {
                return Err(PickFailure::DependencyLimit);
            }
            let attempt = self.repo.cherry_pick(dependency, &[])?;
            if !attempt.success() {
                debug_log(&format!(
                    "dependency pick of {} failed: {}",
                    dependency,
                    attempt.stderr.trim()
                ));
                self.repo.abort_cherry_pick();
                self.repo.reset_hard(snapshot)?;
                return Ok(None);
            }
            let trailer = format!("Cherry-picked as dependency for {}", commit);
            let message = self.build_message(
                &self.repo.commit_message("HEAD")?,
                &[trailer],
                options,
                dependency,
            );
            self.repo.amend_message(&message)?;
            self.session_changed
                .extend(self.repo.changed_files(dependency)?);
        }

        // Retry the plain native pick on the prepared tree.
        let mut args = options.passthrough_args.clone();
        if options.no_commit && !args.iter().any(|a| a == "-n" || a == "--no-commit") {
            args.push("-n".to_string());
        }
        let attempt = self.repo.cherry_pick(commit, &args)?;
        if !attempt.success() {
            self.repo.abort_cherry_pick();
            self.repo.reset_hard(snapshot)?;
            return Ok(None);
        }

        match self.finish_native(commit, options, changed, validator) {
            Ok(outcome) => Ok(Some(outcome)),
            Err(PickFailure::ValidationFailed(_)) => {
                // The prepared context did not buy a valid pick; undo it all
                // and let the patch stage try from the snapshot.
                self.repo.reset_hard(snapshot)?;
                Ok(None)
            }
            Err(other) => Err(other),
        }
    }

    /// Commits that last touched the neighborhood of the target hunks in
    /// the commit's parent, per git blame.
    fn find_context_commits(&self, commit: &str) -> Result<HashSet<String>, PickFailure> {
        let diff_text =
            self.repo
                .git(&["show", "--pretty=format:", "--no-color", "-U0", commit])?;
        let diff = Diff::parse(&diff_text)
            .map_err(|e| PickFailure::PatchUnresolvable(e.to_string()))?;

        let parent = format!("{}^", commit);
        let mut found = HashSet::new();
        for file in &diff.files {
            let Some(path) = file.target_path() else {
                continue;
            };
            for hunk in &file.hunks {
                let start = hunk.new_start.saturating_sub(DEPENDENCY_BLAME_CONTEXT).max(1);
                let end = hunk.new_start + hunk.new_count + DEPENDENCY_BLAME_CONTEXT;
                for blamed in self.repo.blame_range(&parent, path, start, end)? {
                    if blamed != commit && !blamed.starts_with('^') {
                        found.insert(blamed);
                    }
                }
            }
        }
        Ok(found)
    }

    /// The audit-trail block: original message, blank line, then one
    /// annotation per line, the origin reference, and the sign-off trailer.
    fn build_message(
        &self,
        original: &str,
        annotations: &[String],
        options: &PickOptions,
        commit: &str,
    ) -> String {
        let mut trailer_lines: Vec<String> = annotations.to_vec();
        if options.record_origin {
            trailer_lines.push(format!("(cherry picked from commit {})", commit));
        }
        if options.signoff {
            match self.repo.user_identity() {
                Some(identity) => trailer_lines.push(format!("Signed-off-by: {}", identity)),
                None => eprintln!(
                    "git-repick: cannot add sign-off, user.name/user.email not configured"
                ),
            }
        }
        format!("{}\n\n{}", original.trim_end(), trailer_lines.join("\n"))
    }

    /// Compare changed-file and hunk counts of the source commit and the
    /// reconstructed HEAD commit.
    fn commit_shapes_match(
        &self,
        commit: &str,
        options: &PickOptions,
    ) -> Result<bool, PickFailure> {
        let source = self.commit_shape(commit)?;
        let result = self.commit_shape("HEAD")?;
        // Path rewrites change names, not shape; compare counts only.
        let matches = source == result;
        if !matches {
            debug_log(&format!(
                "shape mismatch for {}: source {:?}, reconstructed {:?} (rewrites: {})",
                commit,
                source,
                result,
                options.path_rewrites.len()
            ));
        }
        Ok(matches)
    }

    fn commit_shape(&self, commit: &str) -> Result<(usize, usize), PickFailure> {
        let text = self.repo.show_diff(commit)?;
        let diff =
            Diff::parse(&text).map_err(|e| PickFailure::PatchUnresolvable(e.to_string()))?;
        let files = diff.files.len();
        let hunks: usize = diff.files.iter().map(|f| f.hunks.len()).sum();
        Ok((files, hunks))
    }

    fn run_validation(
        &mut self,
        options: &PickOptions,
        validator: Option<&ValidationRunner>,
        changed: &[String],
    ) -> Result<(bool, Option<CommandOutput>), PickFailure> {
        let Some(validator) = validator else {
            return Ok((true, None));
        };

        match options.run_validation_after {
            ValidationTrigger::None => Ok((true, None)),
            ValidationTrigger::EachFile => {
                let mut last = None;
                for path in changed {
                    self.check_cancel()?;
                    let output = validator
                        .run(self.repo.workdir(), std::slice::from_ref(path))?;
                    if !output.success() {
                        return Err(PickFailure::ValidationFailed(output));
                    }
                    last = Some(output);
                }
                Ok((true, last))
            }
            ValidationTrigger::All => {
                self.check_cancel()?;
                let mut paths: Vec<String> = Vec::new();
                for path in &self.session_changed {
                    if !paths.contains(path) {
                        paths.push(path.clone());
                    }
                }
                for path in changed {
                    if !paths.contains(path) {
                        paths.push(path.clone());
                    }
                }
                let output = validator.run(self.repo.workdir(), &paths)?;
                if !output.success() {
                    return Err(PickFailure::ValidationFailed(output));
                }
                Ok((true, Some(output)))
            }
        }
    }

    /// ROLLBACK: restore the tree captured at START exactly. Failure here is
    /// the one state we cannot hide.
    fn rollback(
        &mut self,
        snapshot: &str,
        commit: &str,
        options: &PickOptions,
    ) -> Result<(), PickFailure> {
        self.repo.abort_cherry_pick();
        if let Err(e) = self.repo.reset_hard(snapshot) {
            return Err(PickFailure::RollbackError(format!(
                "failed to reset to {}: {}",
                snapshot, e
            )));
        }

        // Sweep reject sidecars and files the failed attempt introduced.
        let pattern = format!("{}/**/*.rej", self.repo.workdir().display());
        if let Ok(entries) = glob::glob(&pattern) {
            for rej_path in entries.flatten() {
                let _ = std::fs::remove_file(&rej_path);
            }
        }
        if let Ok(added_src) = self.repo.added_files(commit) {
            for path in rewrite::rewrite_paths(&options.path_rewrites, &added_src) {
                let on_disk = self.repo.workdir().join(&path);
                if on_disk.exists() {
                    let _ = std::fs::remove_file(&on_disk);
                }
            }
        }

        match self.repo.working_tree_clean() {
            Ok(true) => Ok(()),
            Ok(false) => Err(PickFailure::RollbackError(format!(
                "working tree still dirty after reset to {}",
                snapshot
            ))),
            Err(e) => Err(PickFailure::RollbackError(e.to_string())),
        }
    }

    fn check_cancel(&self) -> Result<(), PickFailure> {
        if self.cancel.is_cancelled() {
            return Err(PickFailure::Cancelled);
        }
        Ok(())
    }
}

/// The revision the commit's hunks were authored against: the first parent,
/// or the `-m` mainline parent for merge picks.
fn parent_revision(commit: &str, passthrough_args: &[String]) -> String {
    let mut iter = passthrough_args.iter();
    while let Some(arg) = iter.next() {
        if arg == "-m" || arg == "--mainline" {
            if let Some(parent) = iter.next() {
                return format!("{}^{}", commit, parent);
            }
        }
    }
    format!("{}^", commit)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parent_revision() {
        assert_eq!(parent_revision("abc", &[]), "abc^");
        assert_eq!(
            parent_revision("abc", &["-m".to_string(), "2".to_string()]),
            "abc^2"
        );
        assert_eq!(
            parent_revision("abc", &["--mainline".to_string(), "1".to_string()]),
            "abc^1"
        );
    }

    #[test]
    fn test_exit_codes() {
        assert_eq!(PickFailure::PatchRejected.exit_code(), 2);
        assert_eq!(PickFailure::LlmRefused.exit_code(), 3);
        assert_eq!(
            PickFailure::LlmUnavailable("x".to_string()).exit_code(),
            3
        );
        assert_eq!(
            PickFailure::ValidationFailed(CommandOutput {
                code: Some(1),
                stdout: String::new(),
                stderr: String::new(),
                timed_out: false,
            })
            .exit_code(),
            4
        );
        assert_eq!(PickFailure::RollbackError("x".to_string()).exit_code(), 5);
        assert_eq!(PickFailure::WorkingTreeDirty.exit_code(), 1);
    }

    #[test]
    fn test_cancel_flag() {
        let flag = CancelFlag::new();
        assert!(!flag.is_cancelled());
        let clone = flag.clone();
        clone.cancel();
        assert!(flag.is_cancelled());
    }
}
