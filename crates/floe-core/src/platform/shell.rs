use std::process::{Command, Output};
use std::time::Duration;

use floe_types::error::{FloeError, Result};

/// Build a `sh -c` command for a script string.
pub fn command_for_script(script: &str) -> Command {
    let mut cmd = Command::new("sh");
    cmd.arg("-c").arg(script);
    cmd
}

/// Run a script and return its stdout; a non-zero exit is an error.
pub fn run_capture(script: &str) -> Result<String> {
    let output = run_command_with_timeout(&mut command_for_script(script), Duration::from_secs(60))?;
    if !output.status.success() {
        return Err(FloeError::Other(format!(
            "command failed ({}): {}",
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    String::from_utf8(output.stdout)
        .map_err(|_| FloeError::Other("command output is not valid UTF-8".into()))
}

/// Run an already-configured `Command` with a timeout. The command is spawned
/// with piped stdout/stderr. Returns an error if it does not complete in time.
pub fn run_command_with_timeout(cmd: &mut Command, timeout: Duration) -> std::io::Result<Output> {
    let mut child = cmd
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::piped())
        .spawn()?;

    let deadline = std::time::Instant::now() + timeout;
    let poll_interval = Duration::from_millis(100);

    loop {
        match child.try_wait()? {
            Some(status) => {
                let stdout = child
                    .stdout
                    .take()
                    .map(|mut r| {
                        let mut buf = Vec::new();
                        std::io::Read::read_to_end(&mut r, &mut buf).ok();
                        buf
                    })
                    .unwrap_or_default();
                let stderr = child
                    .stderr
                    .take()
                    .map(|mut r| {
                        let mut buf = Vec::new();
                        std::io::Read::read_to_end(&mut r, &mut buf).ok();
                        buf
                    })
                    .unwrap_or_default();
                return Ok(Output {
                    status,
                    stdout,
                    stderr,
                });
            }
            None => {
                if std::time::Instant::now() >= deadline {
                    let _ = child.kill();
                    let _ = child.wait();
                    return Err(std::io::Error::new(
                        std::io::ErrorKind::TimedOut,
                        format!("command timed out after {} seconds", timeout.as_secs()),
                    ));
                }
                std::thread::sleep(poll_interval);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_capture_returns_stdout() {
        assert_eq!(run_capture("printf secret").unwrap(), "secret");
    }

    #[test]
    fn run_capture_reports_failure() {
        let err = run_capture("echo nope >&2; exit 3").unwrap_err();
        assert!(err.to_string().contains("nope"));
    }
}
