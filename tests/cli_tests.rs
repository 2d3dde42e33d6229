use std::io::Write;
use subprocess::{Exec, ExitStatus, Redirection};

fn ctrbench() -> Exec {
    Exec::cmd(env!("CARGO_BIN_EXE_ctrbench"))
        .env("NO_COLOR", "1")
        .stdout(Redirection::Pipe)
        .stderr(Redirection::Merge)
}

#[test]
fn version_prints_the_package_version() -> anyhow::Result<()> {
    let capture = ctrbench().arg("version").capture()?;
    assert!(capture.success());
    assert!(capture.stdout_str().contains(env!("CARGO_PKG_VERSION")));
    Ok(())
}

#[test]
fn null_driver_benchmark_reports_every_section() -> anyhow::Result<()> {
    let mut file = tempfile::Builder::new().suffix(".yaml").tempfile()?;
    writeln!(
        file,
        "name: cli\nimage: busybox\ndrivers:\n  - type: Null\n    threads: 2\n    iterations: 3\ncommands: [run, stop, remove]"
    )?;

    let capture = ctrbench()
        .args(&["run", "--skip-limit", "--benchmark"])
        .arg(file.path())
        .capture()?;
    let stdout = capture.stdout_str();

    assert!(capture.success(), "{stdout}");
    assert!(stdout.contains("SUMMARY TIMINGS/THREAD RATES"));
    assert!(stdout.contains("DETAILED COMMAND TIMINGS/STATISTICS"));
    assert!(stdout.contains("cli:Null:2"));
    assert!(!stdout.contains("OVERHEAD"));
    Ok(())
}

#[test]
fn invalid_benchmark_exits_with_an_error() -> anyhow::Result<()> {
    let mut file = tempfile::Builder::new().suffix(".yaml").tempfile()?;
    writeln!(
        file,
        "name: bad\ndrivers:\n  - type: Null\n    threads: 1\n    iterations: 1\ncommands: [run]"
    )?;

    let capture = ctrbench()
        .args(&["run", "--skip-limit", "-b"])
        .arg(file.path())
        .capture()?;
    assert!(matches!(capture.exit_status, ExitStatus::Exited(code) if code != 0));
    Ok(())
}
