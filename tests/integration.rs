//! E2E Integration tests for blockfix
//!
//! Run with: cargo test --test integration
//! Verbose:  TEST_VERBOSE=1 cargo test --test integration -- --nocapture

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;

/// Test logging macro - prints when TEST_VERBOSE is set
macro_rules! test_log {
    ($level:expr, $($arg:tt)*) => {
        if std::env::var("TEST_VERBOSE").is_ok() {
            eprintln!("[{}] [integration:{}] {}",
                $level,
                line!(),
                format!($($arg)*)
            );
        }
    };
}

const OPEN: &str = "<!-- block: Greeting [id:3fa9c1] -->";
const CLOSE: &str = "<!-- /block:3fa9c1 -->";

fn get_binary_path() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_blockfix"))
}

/// Run blockfix with config files disabled and colors off.
fn run_blockfix(args: &[&str]) -> (String, String, i32) {
    test_log!("RUN", "blockfix with args: {:?}", args);

    let output = Command::new(get_binary_path())
        .args(["--no-config", "--color", "never"])
        .args(args)
        .env("NO_COLOR", "1")
        .output()
        .expect("Failed to run blockfix");

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    let code = output.status.code().unwrap_or(-1);

    test_log!("OUTPUT", "Exit code: {}", code);
    if !stderr.is_empty() {
        test_log!("STDERR", "{}", stderr);
    }

    (stdout, stderr, code)
}

fn corrupted_doc() -> String {
    format!("# Notes\r\n\r\n{OPEN}\r\nline1\nline2\r\n\r\n{CLOSE}\r\n\r\nEnd\r\n")
}

fn repaired_doc() -> String {
    format!("# Notes\r\n\r\n{OPEN}\r\nline1\r\nline2\r\n{CLOSE}\r\n\r\nEnd\r\n")
}

const REGISTRY: &str = r#"{
  "blocks": {
    "3fa9c1": {
      "id": "3fa9c1",
      "name": "Greeting",
      "content": "line1\r\nline2\r\n\n",
      "tags": ["intro"]
    }
  },
  "meta": {"version": 1}
}"#;

/// Layout: <tmp>/projects/{a,b}/..., <tmp>/data/blocks.db.json
struct Fixture {
    _temp: TempDir,
    projects: PathBuf,
    registry: PathBuf,
}

impl Fixture {
    fn new() -> Self {
        let temp = TempDir::new().expect("tempdir");
        let projects = temp.path().join("projects");
        let data = temp.path().join("data");
        fs::create_dir_all(projects.join("a/nested")).unwrap();
        fs::create_dir_all(projects.join("b")).unwrap();
        fs::create_dir_all(&data).unwrap();

        fs::write(projects.join("a/broken.md"), corrupted_doc()).unwrap();
        fs::write(projects.join("a/nested/also_broken.md"), corrupted_doc()).unwrap();
        fs::write(projects.join("b/lf_only.md"), format!("{OPEN}\nx\n{CLOSE}\n")).unwrap();
        fs::write(projects.join("b/plain.md"), "no blocks\r\nhere\n").unwrap();
        fs::write(projects.join("b/notes.txt"), corrupted_doc()).unwrap();

        let registry = data.join("blocks.db.json");
        fs::write(&registry, REGISTRY).unwrap();

        Self {
            _temp: temp,
            projects,
            registry,
        }
    }

    fn data_dir(&self) -> &Path {
        self.registry.parent().unwrap()
    }

    fn registry_arg(&self) -> String {
        self.registry.display().to_string()
    }

    fn root_arg(&self) -> String {
        self.projects.display().to_string()
    }

    fn backups(&self) -> Vec<PathBuf> {
        fs::read_dir(self.data_dir())
            .unwrap()
            .filter_map(|e| e.ok().map(|e| e.path()))
            .filter(|p| p.to_string_lossy().contains(".backup-"))
            .collect()
    }
}

// ============================================================================
// Basic Functionality Tests
// ============================================================================

#[test]
fn test_e2e_repairs_blocks_and_registry() {
    test_log!("START", "Full repair run");
    let fx = Fixture::new();

    let (stdout, stderr, code) =
        run_blockfix(&["--registry", &fx.registry_arg(), &fx.root_arg()]);
    let combined = format!("{}{}", stdout, stderr);

    assert_eq!(code, 0, "Should exit successfully: {}", stderr);
    assert!(combined.contains("Done: 2 file(s) fixed"), "{}", combined);

    assert_eq!(
        fs::read_to_string(fx.projects.join("a/broken.md")).unwrap(),
        repaired_doc()
    );
    assert_eq!(
        fs::read_to_string(fx.projects.join("a/nested/also_broken.md")).unwrap(),
        repaired_doc()
    );
    // Files the tool must not touch
    assert_eq!(
        fs::read_to_string(fx.projects.join("b/lf_only.md")).unwrap(),
        format!("{OPEN}\nx\n{CLOSE}\n")
    );
    assert_eq!(
        fs::read_to_string(fx.projects.join("b/plain.md")).unwrap(),
        "no blocks\r\nhere\n"
    );
    assert_eq!(
        fs::read_to_string(fx.projects.join("b/notes.txt")).unwrap(),
        corrupted_doc()
    );

    let registry = fs::read_to_string(&fx.registry).unwrap();
    assert!(!registry.contains('\r'));
    assert!(registry.ends_with("}\n"));
    assert!(registry.contains("\"content\": \"line1\\nline2\""));
    let keys_in_order: Vec<_> = ["\"id\"", "\"name\"", "\"content\"", "\"tags\"", "\"meta\""]
        .iter()
        .map(|k| registry.find(k).unwrap())
        .collect();
    let mut sorted = keys_in_order.clone();
    sorted.sort();
    assert_eq!(keys_in_order, sorted, "key order must be preserved");

    let backups = fx.backups();
    assert_eq!(backups.len(), 1);
    assert_eq!(fs::read_to_string(&backups[0]).unwrap(), REGISTRY);

    test_log!("END", "Test PASSED");
}

#[test]
fn test_e2e_second_run_is_noop() {
    test_log!("START", "Idempotent second run");
    let fx = Fixture::new();

    let (_, _, code) = run_blockfix(&["--registry", &fx.registry_arg(), &fx.root_arg()]);
    assert_eq!(code, 0);
    let registry_after_first = fs::read_to_string(&fx.registry).unwrap();

    let (stdout, stderr, code) =
        run_blockfix(&["--registry", &fx.registry_arg(), &fx.root_arg()]);
    let combined = format!("{}{}", stdout, stderr);
    assert_eq!(code, 0);
    assert!(combined.contains("Already clean"), "{}", combined);
    assert!(combined.contains("Done: 0 file(s) fixed"), "{}", combined);
    assert_eq!(
        fs::read_to_string(&fx.registry).unwrap(),
        registry_after_first
    );
    assert_eq!(fx.backups().len(), 1, "clean registry must not be backed up");

    test_log!("END", "Test PASSED");
}

#[test]
fn test_e2e_dry_run_writes_nothing() {
    test_log!("START", "Dry run");
    let fx = Fixture::new();

    let (stdout, stderr, code) = run_blockfix(&[
        "--dry-run",
        "--registry",
        &fx.registry_arg(),
        &fx.root_arg(),
    ]);
    let combined = format!("{}{}", stdout, stderr);

    assert_eq!(code, 0, "Dry run exits 0");
    assert!(combined.contains("DRY RUN"), "{}", combined);
    assert!(combined.contains("Done: 2 file(s) fixed"), "{}", combined);
    assert!(combined.contains("dry run, no changes written"));

    assert_eq!(
        fs::read_to_string(fx.projects.join("a/broken.md")).unwrap(),
        corrupted_doc()
    );
    assert_eq!(fs::read_to_string(&fx.registry).unwrap(), REGISTRY);
    assert!(fx.backups().is_empty());

    test_log!("END", "Test PASSED");
}

#[test]
fn test_e2e_json_report() {
    test_log!("START", "JSON report");
    let fx = Fixture::new();

    let (stdout, _stderr, code) = run_blockfix(&[
        "--json",
        "--dry-run",
        "--registry",
        &fx.registry_arg(),
        &fx.root_arg(),
    ]);
    assert_eq!(code, 0);

    let report: serde_json::Value = serde_json::from_str(&stdout).expect("valid JSON");
    assert_eq!(report["status"], "dry_run");
    assert_eq!(report["dry_run"], true);
    assert_eq!(report["registry"]["status"], "fixed");
    assert_eq!(report["registry"]["fixed_blocks"][0]["id"], "3fa9c1");
    assert_eq!(report["registry"]["fixed_blocks"][0]["name"], "Greeting");
    assert!(report["registry"].get("backup").is_none());
    assert_eq!(report["files"]["scanned"], 4);
    assert_eq!(report["files"]["fixed"].as_array().unwrap().len(), 2);

    let fixed: Vec<_> = report["files"]["fixed"]
        .as_array()
        .unwrap()
        .iter()
        .map(|f| f["path"].as_str().unwrap().to_string())
        .collect();
    let mut sorted = fixed.clone();
    sorted.sort();
    assert_eq!(fixed, sorted, "files are processed in sorted order");

    test_log!("END", "Test PASSED");
}

// ============================================================================
// Registry Edge Cases
// ============================================================================

#[test]
fn test_e2e_missing_registry_is_not_fatal() {
    test_log!("START", "Missing registry");
    let fx = Fixture::new();
    let missing = fx.data_dir().join("absent.json");

    let (stdout, stderr, code) = run_blockfix(&[
        "--registry",
        &missing.display().to_string(),
        &fx.root_arg(),
    ]);
    let combined = format!("{}{}", stdout, stderr);

    assert_eq!(code, 0);
    assert!(combined.contains("DB not found"), "{}", combined);
    assert_eq!(
        fs::read_to_string(fx.projects.join("a/broken.md")).unwrap(),
        repaired_doc()
    );

    test_log!("END", "Test PASSED");
}

#[test]
fn test_e2e_malformed_registry_aborts() {
    test_log!("START", "Malformed registry JSON");
    let fx = Fixture::new();
    fs::write(&fx.registry, "{\"blocks\": {").unwrap();

    let (_stdout, stderr, code) =
        run_blockfix(&["--registry", &fx.registry_arg(), &fx.root_arg()]);

    assert_eq!(code, 1);
    assert!(stderr.contains("Malformed registry JSON"), "{}", stderr);
    assert_eq!(
        fs::read_to_string(fx.projects.join("a/broken.md")).unwrap(),
        corrupted_doc(),
        "the run stops before any file is touched"
    );

    test_log!("END", "Test PASSED");
}

#[test]
fn test_e2e_skip_registry() {
    test_log!("START", "Skip registry");
    let fx = Fixture::new();

    let (_, _, code) = run_blockfix(&["--skip-registry", &fx.root_arg()]);
    assert_eq!(code, 0);
    assert_eq!(fs::read_to_string(&fx.registry).unwrap(), REGISTRY);

    test_log!("END", "Test PASSED");
}

#[test]
fn test_e2e_registry_source_file_outside_roots() {
    test_log!("START", "Registry sourceFile outside scan roots");
    let fx = Fixture::new();
    let outside = fx.data_dir().join("outside.md");
    fs::write(&outside, corrupted_doc()).unwrap();

    let registry = serde_json::json!({
        "blocks": {
            "3fa9c1": {
                "content": "line1\nline2",
                "sourceFile": outside.display().to_string(),
            }
        }
    });
    fs::write(&fx.registry, registry.to_string()).unwrap();

    let empty_root = fx.data_dir().join("empty");
    fs::create_dir(&empty_root).unwrap();

    let (_, _, code) = run_blockfix(&[
        "--registry",
        &fx.registry_arg(),
        &empty_root.display().to_string(),
    ]);
    assert_eq!(code, 0);
    assert_eq!(fs::read_to_string(&outside).unwrap(), repaired_doc());

    test_log!("END", "Test PASSED");
}

// ============================================================================
// Marker Validation
// ============================================================================

#[test]
fn test_e2e_mismatched_markers_left_untouched() {
    test_log!("START", "Mismatched markers");
    let fx = Fixture::new();
    let bad = fx.projects.join("b/bad.md");
    let content = "<!-- block: A [id:aa] -->\r\nx\ny\r\n<!-- /block:bb -->\r\n";
    fs::write(&bad, content).unwrap();

    let (_stdout, stderr, code) =
        run_blockfix(&["--skip-registry", &fx.root_arg()]);

    assert_eq!(code, 0, "malformed markers are a warning, not an error");
    assert!(stderr.contains("Warning"), "{}", stderr);
    assert!(stderr.contains("does not match"), "{}", stderr);
    assert_eq!(fs::read_to_string(&bad).unwrap(), content);

    test_log!("END", "Test PASSED");
}

// ============================================================================
// Discovery Options
// ============================================================================

#[test]
fn test_e2e_overlapping_roots_counted_once() {
    test_log!("START", "Overlapping roots");
    let fx = Fixture::new();
    let nested = fx.projects.join("a");

    let (stdout, _stderr, code) = run_blockfix(&[
        "--json",
        "--dry-run",
        "--skip-registry",
        &fx.root_arg(),
        &nested.display().to_string(),
    ]);
    assert_eq!(code, 0);

    let report: serde_json::Value = serde_json::from_str(&stdout).expect("valid JSON");
    assert_eq!(report["files"]["scanned"], 4);
    assert_eq!(report["files"]["fixed"].as_array().unwrap().len(), 2);

    test_log!("END", "Test PASSED");
}

#[test]
fn test_e2e_missing_root_warns() {
    test_log!("START", "Missing root");
    let fx = Fixture::new();
    let missing = fx.projects.join("does-not-exist");

    let (_stdout, stderr, code) = run_blockfix(&[
        "--skip-registry",
        &missing.display().to_string(),
    ]);
    assert_eq!(code, 0);
    assert!(stderr.contains("root does not exist"), "{}", stderr);

    test_log!("END", "Test PASSED");
}

#[test]
fn test_e2e_custom_glob() {
    test_log!("START", "Custom glob");
    let fx = Fixture::new();

    let (_, _, code) = run_blockfix(&["--skip-registry", "--glob", "*.txt", &fx.root_arg()]);
    assert_eq!(code, 0);
    assert_eq!(
        fs::read_to_string(fx.projects.join("b/notes.txt")).unwrap(),
        repaired_doc()
    );
    assert_eq!(
        fs::read_to_string(fx.projects.join("a/broken.md")).unwrap(),
        corrupted_doc()
    );

    test_log!("END", "Test PASSED");
}

#[test]
fn test_e2e_config_file_roots() {
    test_log!("START", "Roots from config file");
    let fx = Fixture::new();
    let config = fx.data_dir().join("blockfix.toml");
    fs::write(
        &config,
        format!(
            "registry = {:?}\nroots = [{:?}]\n",
            fx.registry_arg(),
            fx.root_arg()
        ),
    )
    .unwrap();

    let output = Command::new(get_binary_path())
        .args(["--color", "never", "--config"])
        .arg(&config)
        .output()
        .expect("Failed to run blockfix");
    assert_eq!(output.status.code(), Some(0));
    assert_eq!(
        fs::read_to_string(fx.projects.join("a/broken.md")).unwrap(),
        repaired_doc()
    );
    assert_eq!(fx.backups().len(), 1);

    test_log!("END", "Test PASSED");
}

// ============================================================================
// Argument Errors
// ============================================================================

#[test]
fn test_e2e_invalid_glob_exit_code() {
    let fx = Fixture::new();
    let (_stdout, stderr, code) =
        run_blockfix(&["--skip-registry", "--glob", "[", &fx.root_arg()]);
    assert_eq!(code, 2);
    assert!(stderr.contains("Invalid glob pattern"), "{}", stderr);
}

#[test]
fn test_e2e_unknown_flag_exit_code() {
    let (_stdout, _stderr, code) = run_blockfix(&["--frobnicate"]);
    assert_eq!(code, 2);
}

#[test]
fn test_e2e_help_exits_zero() {
    let (stdout, _stderr, code) = run_blockfix(&["--help"]);
    assert_eq!(code, 0);
    assert!(stdout.contains("--dry-run"));
}
