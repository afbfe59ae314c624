//! Script execution. Provider CLIs are only ever reached through `bash` on
//! the operator's machine.

pub mod local;

/// Output from executing a script.
#[derive(Debug, Clone)]
pub struct ExecOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Last non-empty stderr line, falling back to the exit code.
    pub fn error_summary(&self) -> String {
        self.stderr
            .lines()
            .rev()
            .map(str::trim)
            .find(|l| !l.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| format!("exit code {}", self.exit_code))
    }
}

/// Execute a generated script.
pub fn exec_script(script: &str) -> Result<ExecOutput, String> {
    local::exec_local(script)
}

/// Execute a read-only provider query and return its trimmed stdout.
pub fn query(script: &str) -> Result<String, String> {
    let out = exec_script(script)?;
    if !out.success() {
        return Err(out.error_summary());
    }
    Ok(out.stdout.trim().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exec_output_success() {
        let ok = ExecOutput { exit_code: 0, stdout: "ok".into(), stderr: "".into() };
        assert!(ok.success());
        let fail = ExecOutput { exit_code: 255, stdout: "".into(), stderr: "err".into() };
        assert!(!fail.success());
    }

    #[test]
    fn test_error_summary() {
        let out = ExecOutput {
            exit_code: 255,
            stdout: String::new(),
            stderr: "Waiting for changeset\n\nAn error occurred (ValidationError)\n  \n".into(),
        };
        assert_eq!(out.error_summary(), "An error occurred (ValidationError)");
        let silent = ExecOutput { exit_code: 3, stdout: String::new(), stderr: String::new() };
        assert_eq!(silent.error_summary(), "exit code 3");
    }

    #[test]
    fn test_exec_script() {
        let out = exec_script("echo ok").unwrap();
        assert!(out.success());
        assert_eq!(out.stdout.trim(), "ok");
    }

    #[test]
    fn test_query() {
        assert_eq!(query("echo '  CREATE_COMPLETE '").unwrap(), "CREATE_COMPLETE");
        let err = query("echo 'Stack does not exist' >&2; exit 254").unwrap_err();
        assert_eq!(err, "Stack does not exist");
    }
}
