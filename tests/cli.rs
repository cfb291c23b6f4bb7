use assert_cmd::prelude::*;
use color_eyre::Result;
use std::fs;
use std::process::Command;

const CONFIG: &str = r#"
[control_plane]
url = "http://127.0.0.1:9"

[experiment]
id = "exp-cli"

[[steps]]
id = "hello"
type = "run-command"

[steps.parameters]
executable = "true"
"#;

#[test]
fn test_steps_lists_types() -> Result<()> {
    let output = Command::cargo_bin("crucible")?.arg("steps").output()?;
    assert!(output.status.success(), "stderr: {}", String::from_utf8_lossy(&output.stderr));

    let stdout = String::from_utf8_lossy(&output.stdout);
    for step_type in ["apply-isolation", "deploy-microcode", "flash-fpga", "power-cycle", "run-command"] {
        assert!(stdout.contains(step_type), "missing {}", step_type);
    }
    Ok(())
}

#[test]
fn test_help_lists_commands() -> Result<()> {
    let output = Command::cargo_bin("crucible")?.arg("--help").output()?;
    assert!(output.status.success());

    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("Usage: crucible"));
    assert!(stdout.contains("validate"));
    assert!(stdout.contains("tick"));
    Ok(())
}

#[test]
fn test_validate_accepts_config() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("crucible.toml");
    fs::write(&path, CONFIG)?;

    let output = Command::cargo_bin("crucible")?.arg("validate").arg(&path).output()?;
    assert!(output.status.success(), "stderr: {}", String::from_utf8_lossy(&output.stderr));
    assert!(String::from_utf8_lossy(&output.stdout).contains("exp-cli with 1 step(s) is valid"));
    Ok(())
}

#[test]
fn test_validate_rejects_unknown_parameter() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("crucible.toml");
    fs::write(&path, CONFIG.replace("executable = \"true\"", "executable = \"true\"\nshell = true"))?;

    let output = Command::cargo_bin("crucible")?.arg("validate").arg(&path).output()?;
    assert!(!output.status.success());
    Ok(())
}

#[test]
fn test_tick_runs_command_step() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("crucible.toml");
    let state = dir.path().join("state.redb");
    fs::write(
        &path,
        format!("{}\n[state]\npath = {:?}\n", CONFIG, state.display().to_string()),
    )?;

    // First tick runs the tool, second judges its exit code
    let output = Command::cargo_bin("crucible")?.arg("tick").arg(&path).output()?;
    assert!(output.status.success(), "stderr: {}", String::from_utf8_lossy(&output.stderr));
    assert!(String::from_utf8_lossy(&output.stdout).contains("hello\tin-progress-continue"));

    let output = Command::cargo_bin("crucible")?.arg("tick").arg(&path).output()?;
    assert!(output.status.success());
    assert!(String::from_utf8_lossy(&output.stdout).contains("hello\tsucceeded"));
    Ok(())
}
