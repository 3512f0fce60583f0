use clap::{Parser, ValueEnum};
use git_repick::git::Repository;
use git_repick::pipeline::{PickAttempt, PickOptions, Pipeline, ValidationTrigger};
use git_repick::repair::GuardLimits;
use git_repick::rewrite::PathRewrite;
use std::path::PathBuf;

/// Cherry-pick parameters the fallback stages understand; anything else is
/// forwarded to the native stage with a warning.
const SUPPORTED_GIT_ARGS: &[&str] = &[
    "-x",
    "-n",
    "--no-commit",
    "-s",
    "--signoff",
    "-m",
    "--mainline",
    "--strategy",
    "-X",
];

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum ValidationWhen {
    /// Never run the validation command
    None,
    /// Run it once per changed file
    EachFile,
    /// Run it once with every changed path
    All,
}

#[derive(Parser)]
#[command(name = "git-repick")]
#[command(version)]
#[command(about = "git cherry-pick with a fuzzy-patch and LLM-repair fallback")]
#[command(long_about = "\
A drop-in substitute for git cherry-pick. When the native cherry-pick cannot
apply a commit, the commit is decomposed into per-file diffs and re-applied
with patch(1) at increasing fuzz; hunks the patch tool rejects are repaired
by an LLM against the destination context. The result is committed with an
audit trail appended to the message, optionally gated by a validation
command.")]
struct Cli {
    /// Max. fuzz factor for patch application, 0 disables the patch stage
    #[arg(long, default_value_t = 2)]
    max_fuzz: u32,

    /// Min. fuzz factor for patch application
    #[arg(long, default_value_t = 1)]
    min_fuzz: u32,

    /// Max. number of dependency commits picked to prepare the destination
    #[arg(long, default_value_t = 2, value_name = "N")]
    dependency_depth: u32,

    /// Do not keep the original commit author on fallback picks
    #[arg(long)]
    no_keep_author: bool,

    /// Do not retry the native stage with alternative merge strategies
    #[arg(long)]
    no_auto_strategy: bool,

    /// Change the working directory before doing anything else
    #[arg(short = 'C', long = "change-dir", value_name = "DIR")]
    change_dir: Option<PathBuf>,

    /// Refuse when the commit subject is in the last N subjects (0 = off)
    #[arg(long, default_value_t = 100, value_name = "N")]
    check_commit_presence: u32,

    /// Validation command; changed paths are appended as arguments
    #[arg(long, value_name = "CMD")]
    validation_command: Option<String>,

    /// When to run the validation command
    #[arg(long, value_enum, default_value = "all")]
    run_validation_after: ValidationWhen,

    /// Rewrite paths with the pattern 'src:dst' (repeatable, first match wins)
    #[arg(long = "path-rewrite", value_name = "SRC:DST")]
    path_rewrite: Vec<String>,

    /// Do not use an LLM to repair hunks the patch tool rejects
    #[arg(long)]
    no_llm_pick: bool,

    /// Model identifier handed to the LLM transport
    #[arg(long, value_name = "MODEL")]
    llm_model: Option<String>,

    /// Region handed to the LLM transport
    #[arg(long, value_name = "REGION")]
    llm_region: Option<String>,

    /// LLM response cache file
    #[arg(long = "llm-cache", value_name = "PATH")]
    llm_cache: Option<PathBuf>,

    /// Only accept LLM changes within this edit distance (-1 = unlimited)
    #[arg(long, default_value_t = 900)]
    llm_limit_char_diff: i64,

    /// Only accept LLM changes within this relative distance (-1 = unlimited)
    #[arg(long, default_value_t = 1.33)]
    llm_limit_diff_ratio: f64,

    /// Refuse prompts containing this phrase (repeatable)
    #[arg(long = "llm-filter-phrase", value_name = "PHRASE")]
    llm_filter_phrase: Vec<String>,

    /// Largest destination section forwarded to the LLM (0 = unlimited)
    #[arg(long, default_value_t = 250, value_name = "LINES")]
    llm_input_lines: usize,

    /// Append a Signed-off-by trailer to created commits
    #[arg(short = 's', long)]
    signoff: bool,

    /// Append a "(cherry picked from commit ...)" line
    #[arg(short = 'x', long)]
    record_origin: bool,

    /// git cherry-pick arguments followed by the commit to pick
    #[arg(trailing_var_arg = true, allow_hyphen_values = true, required = true)]
    args: Vec<String>,
}

fn main() {
    let cli = Cli::parse();

    if let Some(dir) = &cli.change_dir {
        if let Err(e) = std::env::set_current_dir(dir) {
            eprintln!("git-repick: cannot change to {}: {}", dir.display(), e);
            std::process::exit(1);
        }
    }

    let mut rewrites = Vec::new();
    for spec in &cli.path_rewrite {
        match PathRewrite::parse(spec) {
            Ok(rule) => rewrites.push(rule),
            Err(e) => {
                eprintln!("git-repick: {}", e);
                std::process::exit(1);
            }
        }
    }

    // The last trailing argument is the commit; everything before it is
    // handed through to git cherry-pick.
    let (commit_ref, raw_passthrough) = match cli.args.split_last() {
        Some((commit, rest)) => (commit.clone(), rest.to_vec()),
        None => {
            eprintln!("git-repick: no commit specified");
            std::process::exit(1);
        }
    };

    let mut options = PickOptions {
        llm_enabled: !cli.no_llm_pick,
        llm_model: cli.llm_model.clone(),
        llm_region: cli.llm_region.clone(),
        llm_cache_path: cli.llm_cache.clone(),
        path_rewrites: rewrites,
        validation_command: cli.validation_command.clone(),
        run_validation_after: match cli.run_validation_after {
            ValidationWhen::None => ValidationTrigger::None,
            ValidationWhen::EachFile => ValidationTrigger::EachFile,
            ValidationWhen::All => ValidationTrigger::All,
        },
        signoff: cli.signoff,
        record_origin: cli.record_origin,
        dependency_depth: cli.dependency_depth,
        min_fuzz: cli.min_fuzz,
        max_fuzz: cli.max_fuzz,
        keep_author: !cli.no_keep_author,
        auto_strategy: !cli.no_auto_strategy,
        presence_check: cli.check_commit_presence,
        passthrough_args: Vec::new(),
        no_commit: false,
        guards: GuardLimits {
            max_char_diff: cli.llm_limit_char_diff,
            max_diff_ratio: cli.llm_limit_diff_ratio,
            filter_phrases: if cli.llm_filter_phrase.is_empty() {
                GuardLimits::default().filter_phrases
            } else {
                cli.llm_filter_phrase.clone()
            },
            max_input_lines: cli.llm_input_lines,
        },
    };
    absorb_passthrough(&mut options, &raw_passthrough);

    let repo = match Repository::discover(None) {
        Ok(repo) => repo,
        Err(e) => {
            eprintln!("git-repick: {}", e);
            std::process::exit(1);
        }
    };

    let mut pipeline = Pipeline::new(repo);
    match pipeline.pick(&commit_ref, &options) {
        Ok(outcome) => {
            println!(
                "Successfully picked {} via {}",
                commit_ref,
                describe_attempt(outcome.succeeded_via)
            );
            if let Some(output) = &outcome.validation_output {
                if !output.stdout.trim().is_empty() {
                    println!("{}", output.stdout.trim_end());
                }
            }
        }
        Err(failure) => {
            eprintln!("error: {}", failure);
            std::process::exit(failure.exit_code());
        }
    }
}

/// Fold flags we implement ourselves out of the passthrough list, and warn
/// about flags the fallback stages will ignore.
fn absorb_passthrough(options: &mut PickOptions, raw: &[String]) {
    let mut unsupported = Vec::new();
    for arg in raw {
        match arg.as_str() {
            "-x" => {
                options.record_origin = true;
                continue;
            }
            "-s" | "--signoff" => {
                options.signoff = true;
                continue;
            }
            "-n" | "--no-commit" => {
                options.no_commit = true;
                continue;
            }
            _ => {}
        }
        let known = SUPPORTED_GIT_ARGS.contains(&arg.as_str())
            || arg.starts_with("--strategy")
            || arg.starts_with("-X")
            || arg.starts_with("--mainline=");
        if !known && arg.starts_with('-') {
            unsupported.push(arg.clone());
        }
        options.passthrough_args.push(arg.clone());
    }
    if !unsupported.is_empty() {
        eprintln!(
            "git-repick: fallback stages will ignore unrecognized arguments: {}",
            unsupported.join(" ")
        );
    }
}

fn describe_attempt(attempt: PickAttempt) -> String {
    match attempt {
        PickAttempt::Native => "native cherry-pick".to_string(),
        PickAttempt::GitApply => "git apply".to_string(),
        PickAttempt::PatchTool { fuzz } => format!("patch tool (fuzz={})", fuzz),
        PickAttempt::LlmRepair { hunks } => format!("LLM repair ({} hunks)", hunks),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_absorb_passthrough_folds_known_flags() {
        let mut options = PickOptions::default();
        let raw = vec![
            "-x".to_string(),
            "-s".to_string(),
            "-n".to_string(),
            "-m".to_string(),
            "1".to_string(),
        ];
        absorb_passthrough(&mut options, &raw);
        assert!(options.record_origin);
        assert!(options.signoff);
        assert!(options.no_commit);
        assert_eq!(options.passthrough_args, vec!["-m".to_string(), "1".to_string()]);
    }

    #[test]
    fn test_cli_parses_commit_and_passthrough() {
        let cli = Cli::parse_from(["git-repick", "--max-fuzz", "3", "-x", "HEAD~2"]);
        assert_eq!(cli.max_fuzz, 3);
        assert!(cli.record_origin);
        assert_eq!(cli.args, vec!["HEAD~2".to_string()]);
    }

    #[test]
    fn test_cli_trailing_args_keep_hyphen_values() {
        let cli = Cli::parse_from(["git-repick", "abc123", "-n"]);
        assert_eq!(cli.args, vec!["abc123".to_string(), "-n".to_string()]);
    }
}
