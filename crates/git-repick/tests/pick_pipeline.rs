mod repos;

use common::error::GitRepickError;
use git_repick::llm::client::LlmTransport;
use git_repick::llm::prompt::{
    ADAPTED_SNIPPET_HEADER, EXPLANATION_HEADER, REFUSAL_PHRASE, SUMMARY_SECTION_HEADER,
};
use git_repick::pipeline::{PickAttempt, PickFailure, PickOptions, Pipeline, ValidationTrigger};
use repos::test_repo::TestRepo;
use std::sync::Mutex;

/// Transport driven by a fixed script of replies; errors once exhausted.
struct ScriptedTransport {
    replies: Mutex<Vec<String>>,
}

impl ScriptedTransport {
    fn new(replies: Vec<String>) -> Self {
        ScriptedTransport {
            replies: Mutex::new(replies),
        }
    }

    fn empty() -> Self {
        Self::new(Vec::new())
    }
}

impl LlmTransport for ScriptedTransport {
    fn model_id(&self) -> &str {
        "scripted-model-v1"
    }

    fn send(&self, _prompt: &str) -> Result<String, GitRepickError> {
        let mut replies = self.replies.lock().unwrap();
        if replies.is_empty() {
            return Err(GitRepickError::LlmTransport(
                "scripted transport exhausted".to_string(),
            ));
        }
        Ok(replies.remove(0))
    }
}

fn reply_with_snippet(snippet: &str) -> String {
    format!(
        "## {}\nThe surrounding helper was renamed in the destination.\n\n\
         ## {}\nApplied the return-value change to the renamed-helper variant.\n\n\
         ## {}\n```c\n{}\n```\n",
        EXPLANATION_HEADER, SUMMARY_SECTION_HEADER, ADAPTED_SNIPPET_HEADER, snippet
    )
}

const ALPHA_BASE: &str = "\
#include <stdio.h>

static int helper_value(void)
{
    return 41;
}

int alpha(void)
{
    int bias = 1;
    int scale = 3;
    int v = helper_value();
    return v + 1;
}
";

/// Build a repo with a feature commit changing `alpha` and a destination
/// where the helper has been renamed, so native and patch stages both fail.
fn drifted_repo() -> (TestRepo, String) {
    let repo = TestRepo::new();
    repo.write("src/alpha.c", ALPHA_BASE);
    repo.commit_all("add alpha");

    repo.git(&["checkout", "-b", "feature"]);
    repo.write("src/alpha.c", &ALPHA_BASE.replace("return v + 1;", "return v + 2;"));
    let feature = repo.commit_all("alpha: bump return value");

    repo.git(&["checkout", "main"]);
    repo.write(
        "src/alpha.c",
        &ALPHA_BASE.replace("helper_value", "base_value"),
    );
    repo.commit_all("rename helper_value to base_value");

    (repo, feature)
}

/// Options for the drifted-repo scenarios. The cache lives outside the
/// repository so it never dirties the working tree.
fn llm_options(cache_dir: &std::path::Path) -> PickOptions {
    PickOptions {
        max_fuzz: 2,
        dependency_depth: 0,
        llm_cache_path: Some(cache_dir.join("llm-cache.json")),
        ..PickOptions::default()
    }
}

#[test]
fn test_clean_pick_uses_native_stage() {
    let repo = TestRepo::new();
    repo.write("src/lib.c", "int one(void)\n{\n    return 1;\n}\n");
    repo.commit_all("initial");

    repo.git(&["checkout", "-b", "feature"]);
    repo.write("src/lib.c", "int one(void)\n{\n    return 100;\n}\n");
    let feature = repo.commit_all("lib: return 100");
    repo.git(&["checkout", "main"]);

    let mut pipeline = Pipeline::new(repo.repository());
    let options = PickOptions {
        record_origin: true,
        dependency_depth: 0,
        ..PickOptions::default()
    };
    let outcome = pipeline.pick(&feature, &options).unwrap();

    assert_eq!(outcome.succeeded_via, PickAttempt::Native);
    assert!(outcome.validation_passed);
    let message = repo.commit_message("HEAD");
    assert!(message.contains("lib: return 100"));
    assert!(message.contains("Applied with: native cherry-pick"));
    assert!(message.contains(&format!("(cherry picked from commit {})", feature)));
    assert_eq!(repo.read("src/lib.c"), "int one(void)\n{\n    return 100;\n}\n");
}

#[test]
fn test_llm_repair_pick_and_cache_replay() {
    let (repo, feature) = drifted_repo();
    let cache_dir = tempfile::tempdir().unwrap();
    let snapshot = repo.head();

    let adapted = "int alpha(void)\n{\n    int bias = 1;\n    int scale = 3;\n    int v = base_value();\n    return v + 2;\n}";
    let mut pipeline = Pipeline::new(repo.repository());
    pipeline.set_transport(Box::new(ScriptedTransport::new(vec![reply_with_snippet(
        adapted,
    )])));
    let options = llm_options(cache_dir.path());
    let outcome = pipeline.pick(&feature, &options).unwrap();

    assert_eq!(outcome.succeeded_via, PickAttempt::LlmRepair { hunks: 1 });
    assert_eq!(outcome.rejects_resolved, 1);
    let message = repo.commit_message("HEAD");
    assert!(message.contains("Applied with: LLM repair (1 hunks)"));
    let picked = repo.read("src/alpha.c");
    assert!(picked.contains("int v = base_value();"));
    assert!(picked.contains("return v + 2;"));
    assert!(!repo.exists("src/alpha.c.rej"));

    // One entry was written to the cache.
    let cache =
        git_repick::llm::cache::PromptCache::new(cache_dir.path().join("llm-cache.json"));
    assert_eq!(cache.len(), 1);

    // Replay: same pick against the same destination is served entirely
    // from the cache; the exhausted transport would fail any network call.
    repo.git(&["reset", "--hard", &snapshot]);
    let mut replay = Pipeline::new(repo.repository());
    replay.set_transport(Box::new(ScriptedTransport::empty()));
    let outcome = replay.pick(&feature, &llm_options(cache_dir.path())).unwrap();
    assert_eq!(outcome.succeeded_via, PickAttempt::LlmRepair { hunks: 1 });
    assert_eq!(cache.len(), 1);
}

#[test]
fn test_llm_refusal_rolls_back() {
    let (repo, feature) = drifted_repo();
    let cache_dir = tempfile::tempdir().unwrap();
    let snapshot = repo.head();
    let dest_before = repo.read("src/alpha.c");

    let mut pipeline = Pipeline::new(repo.repository());
    pipeline.set_transport(Box::new(ScriptedTransport::new(vec![format!(
        "## {}\n{}\n",
        ADAPTED_SNIPPET_HEADER, REFUSAL_PHRASE
    )])));
    let err = pipeline
        .pick(&feature, &llm_options(cache_dir.path()))
        .unwrap_err();

    assert!(matches!(err, PickFailure::LlmRefused));
    assert_eq!(err.exit_code(), 3);
    assert_eq!(repo.head(), snapshot);
    assert_eq!(repo.read("src/alpha.c"), dest_before);
    assert!(!repo.exists("src/alpha.c.rej"));
    assert!(repo.repository().working_tree_clean().unwrap());
}

#[test]
fn test_llm_disabled_fails_with_patch_rejected() {
    let (repo, feature) = drifted_repo();
    let cache_dir = tempfile::tempdir().unwrap();
    let snapshot = repo.head();

    let mut pipeline = Pipeline::new(repo.repository());
    let options = PickOptions {
        llm_enabled: false,
        ..llm_options(cache_dir.path())
    };
    let err = pipeline.pick(&feature, &options).unwrap_err();

    assert!(matches!(err, PickFailure::PatchRejected));
    assert_eq!(err.exit_code(), 2);
    assert_eq!(repo.head(), snapshot);
    assert!(repo.repository().working_tree_clean().unwrap());
}

#[test]
fn test_validation_failure_rolls_back() {
    let repo = TestRepo::new();
    repo.write("a.c", "int a;\n");
    repo.commit_all("initial");

    repo.git(&["checkout", "-b", "feature"]);
    repo.write("a.c", "int a = 5;\n");
    let feature = repo.commit_all("set a");
    repo.git(&["checkout", "main"]);
    let snapshot = repo.head();

    let mut pipeline = Pipeline::new(repo.repository());
    let options = PickOptions {
        validation_command: Some("false".to_string()),
        run_validation_after: ValidationTrigger::All,
        dependency_depth: 0,
        ..PickOptions::default()
    };
    let err = pipeline.pick(&feature, &options).unwrap_err();

    assert!(matches!(err, PickFailure::ValidationFailed(_)));
    assert_eq!(err.exit_code(), 4);
    assert_eq!(repo.head(), snapshot);
    assert_eq!(repo.read("a.c"), "int a;\n");
    assert!(repo.repository().working_tree_clean().unwrap());
}

#[test]
fn test_validation_success_is_reported() {
    let repo = TestRepo::new();
    repo.write("a.c", "int a;\n");
    repo.commit_all("initial");

    repo.git(&["checkout", "-b", "feature"]);
    repo.write("a.c", "int a = 5;\n");
    let feature = repo.commit_all("set a");
    repo.git(&["checkout", "main"]);

    let mut pipeline = Pipeline::new(repo.repository());
    let options = PickOptions {
        validation_command: Some("echo validated".to_string()),
        dependency_depth: 0,
        ..PickOptions::default()
    };
    let outcome = pipeline.pick(&feature, &options).unwrap();

    assert!(outcome.validation_passed);
    let output = outcome.validation_output.expect("validation ran");
    assert!(output.stdout.contains("validated"));
    assert!(output.stdout.contains("a.c"));
}

#[test]
fn test_dirty_tree_refuses_to_start() {
    let repo = TestRepo::new();
    repo.write("a.c", "int a;\n");
    repo.commit_all("initial");

    repo.git(&["checkout", "-b", "feature"]);
    repo.write("a.c", "int a = 5;\n");
    let feature = repo.commit_all("set a");
    repo.git(&["checkout", "main"]);

    repo.write("a.c", "int a; /* uncommitted */\n");

    let mut pipeline = Pipeline::new(repo.repository());
    let err = pipeline
        .pick(&feature, &PickOptions::default())
        .unwrap_err();

    assert!(matches!(err, PickFailure::WorkingTreeDirty));
    // The uncommitted edit survives: refusal must not destroy user state.
    assert_eq!(repo.read("a.c"), "int a; /* uncommitted */\n");
}

#[test]
fn test_already_present_commit_is_refused() {
    let repo = TestRepo::new();
    repo.write("a.c", "int a;\n");
    repo.commit_all("initial");

    repo.git(&["checkout", "-b", "feature"]);
    repo.write("a.c", "int a = 5;\n");
    let feature = repo.commit_all("set a");
    repo.git(&["checkout", "main"]);

    // First pick succeeds, second refuses on the duplicate subject.
    let mut pipeline = Pipeline::new(repo.repository());
    pipeline.pick(&feature, &PickOptions::default()).unwrap();
    let err = pipeline
        .pick(&feature, &PickOptions::default())
        .unwrap_err();
    assert!(matches!(err, PickFailure::AlreadyPresent { .. }));
}

#[test]
fn test_unanchored_deletion_is_unresolvable() {
    let repo = TestRepo::new();
    let base = "\
keep top
obsolete marker alpha
obsolete marker beta
keep bottom
";
    repo.write("list.txt", base);
    repo.commit_all("initial");

    repo.git(&["checkout", "-b", "feature"]);
    repo.write("list.txt", "keep top\nkeep bottom\n");
    let feature = repo.commit_all("drop obsolete markers");
    repo.git(&["checkout", "main"]);
    repo.write(
        "list.txt",
        "keep top\nfresh content one\nfresh content two\nkeep bottom\n",
    );
    repo.commit_all("replace markers with fresh content");
    let snapshot = repo.head();

    let cache_dir = tempfile::tempdir().unwrap();
    let mut pipeline = Pipeline::new(repo.repository());
    pipeline.set_transport(Box::new(ScriptedTransport::empty()));
    let err = pipeline
        .pick(&feature, &llm_options(cache_dir.path()))
        .unwrap_err();

    assert!(matches!(err, PickFailure::PatchUnresolvable(_)));
    assert_eq!(repo.head(), snapshot);
    assert!(repo.repository().working_tree_clean().unwrap());
}
