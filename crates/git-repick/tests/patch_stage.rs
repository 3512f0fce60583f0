mod repos;

use git_repick::pipeline::{PickAttempt, PickOptions, Pipeline};
use git_repick::rewrite::PathRewrite;
use repos::test_repo::TestRepo;

const TARGET_BASE: &str = "\
int top(void)
{
    return 0;
}

int target(void)
{
    int x = 1;
    return x;
}
";

/// Native cherry-pick conflicts on the adjacent-line edit; patch(1) places
/// the hunk once the fuzz ladder reaches the mismatched context line.
#[test]
fn test_fuzzy_patch_pick() {
    let repo = TestRepo::new();
    repo.write("src/target.c", TARGET_BASE);
    repo.commit_all("add target");

    repo.git(&["checkout", "-b", "feature"]);
    repo.write(
        "src/target.c",
        &TARGET_BASE.replace("    return x;", "    return x + 5;"),
    );
    let feature = repo.commit_all("target: bump return value");

    repo.git(&["checkout", "main"]);
    repo.write(
        "src/target.c",
        &TARGET_BASE.replace("    int x = 1;", "    int x = 2;"),
    );
    repo.commit_all("target: seed x differently");

    let mut pipeline = Pipeline::new(repo.repository());
    let options = PickOptions {
        min_fuzz: 1,
        max_fuzz: 3,
        llm_enabled: false,
        dependency_depth: 0,
        ..PickOptions::default()
    };
    let outcome = pipeline.pick(&feature, &options).unwrap();

    assert_eq!(outcome.succeeded_via, PickAttempt::PatchTool { fuzz: 3 });
    let message = repo.commit_message("HEAD");
    assert!(message.contains("Applied with: patch tool (fuzz=3)"));
    let picked = repo.read("src/target.c");
    assert!(picked.contains("    int x = 2;"));
    assert!(picked.contains("    return x + 5;"));
    assert!(repo.repository().working_tree_clean().unwrap());
}

/// The pick keeps the source commit's author and message on the
/// reconstructed commit.
#[test]
fn test_fuzzy_pick_preserves_author_and_message() {
    let repo = TestRepo::new();
    repo.write("src/target.c", TARGET_BASE);
    repo.commit_all("add target");

    repo.git(&["checkout", "-b", "feature"]);
    repo.write(
        "src/target.c",
        &TARGET_BASE.replace("    return x;", "    return x + 5;"),
    );
    repo.git(&["add", "-A"]);
    repo.git(&[
        "commit",
        "-m",
        "target: bump return value\n\nLonger body explaining the change.",
        "--author=Original Author <origin@example.com>",
    ]);
    let feature = repo.head();

    repo.git(&["checkout", "main"]);
    repo.write(
        "src/target.c",
        &TARGET_BASE.replace("    int x = 1;", "    int x = 2;"),
    );
    repo.commit_all("target: seed x differently");

    let mut pipeline = Pipeline::new(repo.repository());
    let options = PickOptions {
        min_fuzz: 1,
        max_fuzz: 3,
        llm_enabled: false,
        dependency_depth: 0,
        ..PickOptions::default()
    };
    pipeline.pick(&feature, &options).unwrap();

    let author = repo.git(&["log", "-1", "--format=%an <%ae>", "HEAD"]);
    assert_eq!(author.trim(), "Original Author <origin@example.com>");
    let message = repo.commit_message("HEAD");
    assert!(message.contains("Longer body explaining the change."));
}

/// Cross-codebase pick: the destination renamed the directory; path
/// rewriting points the whole diff at the new location.
#[test]
fn test_cross_codebase_path_rewrite() {
    let repo = TestRepo::new();
    repo.write(
        "drivers/old/foo.c",
        "int probe(void)\n{\n    return 0;\n}\n",
    );
    repo.commit_all("add driver");

    repo.git(&["checkout", "-b", "feature"]);
    repo.write(
        "drivers/old/foo.c",
        "int probe(void)\n{\n    return 1;\n}\n",
    );
    let feature = repo.commit_all("driver: probe returns 1");

    repo.git(&["checkout", "main"]);
    repo.rename("drivers/old/foo.c", "drivers/new/foo.c");
    repo.commit_all("move driver to new layout");

    let mut pipeline = Pipeline::new(repo.repository());
    let options = PickOptions {
        path_rewrites: vec![PathRewrite {
            src_pattern: "drivers/old/".to_string(),
            dst_pattern: "drivers/new/".to_string(),
        }],
        llm_enabled: false,
        ..PickOptions::default()
    };
    let outcome = pipeline.pick(&feature, &options).unwrap();

    assert_eq!(outcome.succeeded_via, PickAttempt::PatchTool { fuzz: 1 });
    assert_eq!(
        repo.read("drivers/new/foo.c"),
        "int probe(void)\n{\n    return 1;\n}\n"
    );
    assert!(!repo.exists("drivers/old/foo.c"));
    // The reconstructed commit references only the rewritten path.
    let touched = repo.git(&["show", "--name-only", "--format=", "HEAD"]);
    assert!(touched.contains("drivers/new/foo.c"));
    assert!(!touched.contains("drivers/old/foo.c"));
}

/// A pure rename commit has no hunks for patch(1); it is carried over with
/// git apply against the rewritten paths.
#[test]
fn test_rename_only_commit_uses_git_apply() {
    let repo = TestRepo::new();
    repo.write(
        "drivers/old/foo.c",
        "int probe(void)\n{\n    return 0;\n}\n",
    );
    repo.commit_all("add driver");

    repo.git(&["checkout", "-b", "feature"]);
    repo.rename("drivers/old/foo.c", "drivers/old/bar.c");
    let feature = repo.commit_all("driver: rename foo to bar");

    repo.git(&["checkout", "main"]);
    repo.rename("drivers/old/foo.c", "drivers/new/foo.c");
    repo.commit_all("move driver to new layout");

    let mut pipeline = Pipeline::new(repo.repository());
    let options = PickOptions {
        path_rewrites: vec![PathRewrite {
            src_pattern: "drivers/old/".to_string(),
            dst_pattern: "drivers/new/".to_string(),
        }],
        llm_enabled: false,
        ..PickOptions::default()
    };
    let outcome = pipeline.pick(&feature, &options).unwrap();

    assert_eq!(outcome.succeeded_via, PickAttempt::GitApply);
    assert!(repo.exists("drivers/new/bar.c"));
    assert!(!repo.exists("drivers/new/foo.c"));
    assert!(repo.repository().working_tree_clean().unwrap());
}

/// Disabling the patch stage makes a conflicting pick fail right after the
/// native stage.
#[test]
fn test_max_fuzz_zero_disables_fallback() {
    let repo = TestRepo::new();
    repo.write("src/target.c", TARGET_BASE);
    repo.commit_all("add target");

    repo.git(&["checkout", "-b", "feature"]);
    repo.write(
        "src/target.c",
        &TARGET_BASE.replace("    return x;", "    return x + 5;"),
    );
    let feature = repo.commit_all("target: bump return value");

    repo.git(&["checkout", "main"]);
    repo.write(
        "src/target.c",
        &TARGET_BASE.replace("    int x = 1;", "    int x = 2;"),
    );
    repo.commit_all("target: seed x differently");
    let snapshot = repo.head();

    let mut pipeline = Pipeline::new(repo.repository());
    let options = PickOptions {
        max_fuzz: 0,
        llm_enabled: false,
        dependency_depth: 0,
        ..PickOptions::default()
    };
    let err = pipeline.pick(&feature, &options).unwrap_err();
    assert_eq!(err.exit_code(), 2);
    assert_eq!(repo.head(), snapshot);
    assert!(repo.repository().working_tree_clean().unwrap());
}
