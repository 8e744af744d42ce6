use std::path::Path;
use std::process::Command;
use tempfile::TempDir;

fn run_cli(args: &[&str], cwd: &Path) -> std::process::Output {
    Command::new(env!("CARGO_BIN_EXE_tether-cli"))
        .args(args)
        .current_dir(cwd)
        .env_remove("ANTHROPIC_API_KEY")
        .output()
        .expect("cli command should execute")
}

#[test]
fn help_lists_run_and_plan_subcommands() {
    let temp = TempDir::new().expect("tempdir should create");
    let output = run_cli(&["--help"], temp.path());

    assert!(output.status.success());
    let stdout = String::from_utf8(output.stdout).expect("stdout should be utf8");
    assert!(stdout.contains("run"));
    assert!(stdout.contains("plan"));
}

#[test]
fn run_with_missing_workspace_fails_before_contacting_a_model() {
    let temp = TempDir::new().expect("tempdir should create");
    let missing = temp.path().join("missing");
    let output = run_cli(
        &[
            "run",
            "--workspace",
            missing.to_str().expect("path should be utf8"),
            "--prompt",
            "fix the build",
            "--permissions",
            "deny",
        ],
        temp.path(),
    );

    assert_eq!(output.status.code(), Some(1));
    let stderr = String::from_utf8(output.stderr).expect("stderr should be utf8");
    assert!(stderr.contains("is not accessible"), "stderr:\n{stderr}");
}

#[test]
fn run_without_credentials_reports_a_configuration_error() {
    let temp = TempDir::new().expect("tempdir should create");
    let output = run_cli(
        &[
            "run",
            "--workspace",
            temp.path().to_str().expect("path should be utf8"),
            "--prompt",
            "fix the build",
        ],
        temp.path(),
    );

    assert_eq!(output.status.code(), Some(1));
    let stderr = String::from_utf8(output.stderr).expect("stderr should be utf8");
    assert!(stderr.contains("error:"), "stderr:\n{stderr}");
}

#[test]
fn unknown_permission_mode_is_rejected_by_the_parser() {
    let temp = TempDir::new().expect("tempdir should create");
    let output = run_cli(
        &[
            "run",
            "--workspace",
            ".",
            "--prompt",
            "x",
            "--permissions",
            "sometimes",
        ],
        temp.path(),
    );

    assert_eq!(output.status.code(), Some(2));
}
