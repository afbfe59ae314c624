//! Local execution through `bash`.

use super::ExecOutput;
use std::io::Write;
use std::process::{Command, Stdio};

/// Environment forced on every script: no AWS CLI pager, no auto-prompt.
pub const PROVIDER_ENV: &[(&str, &str)] = &[("AWS_PAGER", ""), ("AWS_CLI_AUTO_PROMPT", "off")];

/// Run `script` on bash's stdin; generated scripts rely on `pipefail`, so
/// plain `sh` will not do.
pub fn exec_local(script: &str) -> Result<ExecOutput, String> {
    let mut cmd = Command::new("bash");
    cmd.envs(PROVIDER_ENV.iter().copied())
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    let mut child = cmd
        .spawn()
        .map_err(|e| format!("failed to spawn bash: {}", e))?;

    // stdin must be dropped before waiting or bash never sees EOF
    let mut stdin = child
        .stdin
        .take()
        .ok_or_else(|| "bash stdin unavailable".to_string())?;
    stdin
        .write_all(script.as_bytes())
        .map_err(|e| format!("cannot pass script to bash: {}", e))?;
    drop(stdin);

    let output = child
        .wait_with_output()
        .map_err(|e| format!("bash did not finish: {}", e))?;

    Ok(ExecOutput {
        // None when bash was killed by a signal
        exit_code: output.status.code().unwrap_or(-1),
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provider_env_applied() {
        let out = exec_local("echo \"pager=[${AWS_PAGER-unset}] prompt=[$AWS_CLI_AUTO_PROMPT]\"").unwrap();
        assert_eq!(out.stdout.trim(), "pager=[] prompt=[off]");
    }

    #[test]
    fn test_local_exit_code() {
        let out = exec_local("echo 'An error occurred (ValidationError)' >&2; exit 254").unwrap();
        assert_eq!(out.exit_code, 254);
        assert!(out.stderr.contains("ValidationError"));
    }

    #[test]
    fn test_local_continuation_lines() {
        let out = exec_local("echo one \\\n  two \\\n  three").unwrap();
        assert!(out.success());
        assert_eq!(out.stdout.trim(), "one two three");
    }

    #[test]
    fn test_local_signal_killed() {
        let out = exec_local("kill -9 $$").unwrap();
        assert_eq!(out.exit_code, -1);
    }

    #[test]
    fn test_local_pipefail_stops_script() {
        let out = exec_local("set -euo pipefail\nfalse | true\necho unreachable").unwrap();
        assert!(!out.success());
        assert!(!out.stdout.contains("unreachable"));
    }
}
