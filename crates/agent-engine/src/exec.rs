//! Subprocess executors, one per supported scripting language.
//!
//! Every failure mode (missing interpreter, write error, timeout) is folded
//! into an [`ExecResult`] with `retcode = -1`; running a script never errors
//! into the caller.

use std::io::Write as _;
use std::path::Path;
use std::process::Stdio;
use std::sync::OnceLock;
use std::time::Duration;

use tokio::process::Command;

use crate::pod::Digest;

/// A supported scripting language.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Language {
    Bash,
    Python,
    PowerShell,
}

impl Language {
    /// Maps a config `language` string (and its aliases) to an executor.
    pub(crate) fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "bash" | "sh" => Some(Language::Bash),
            "python" | "python3" | "py" => Some(Language::Python),
            "powershell" | "pwsh" | "ps1" => Some(Language::PowerShell),
            _ => None,
        }
    }

    fn suffix(self) -> &'static str {
        match self {
            Language::Bash => ".sh",
            Language::Python => ".py",
            Language::PowerShell => ".ps1",
        }
    }

    fn program(self) -> &'static str {
        match self {
            Language::Bash => "bash",
            Language::Python => python_program(),
            Language::PowerShell => {
                if cfg!(windows) {
                    "powershell"
                } else {
                    "pwsh"
                }
            }
        }
    }

    fn interpreter_args(self) -> &'static [&'static str] {
        match self {
            Language::Bash | Language::Python => &[],
            Language::PowerShell => &[
                "-NoProfile",
                "-NonInteractive",
                "-ExecutionPolicy",
                "Bypass",
                "-File",
            ],
        }
    }
}

impl std::fmt::Display for Language {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Language::Bash => "bash",
            Language::Python => "python",
            Language::PowerShell => "powershell",
        };
        f.write_str(s)
    }
}

/// Resolved once per process; prefers `python3` over `python`.
fn python_program() -> &'static str {
    static PROGRAM: OnceLock<&'static str> = OnceLock::new();
    *PROGRAM.get_or_init(|| {
        for candidate in ["python3", "python"] {
            let found = std::process::Command::new(candidate)
                .arg("--version")
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .status()
                .map(|status| status.success())
                .unwrap_or(false);
            if found {
                return candidate;
            }
        }
        "python"
    })
}

/// Captured output of one script run.
#[derive(Debug, Clone)]
pub(crate) struct ExecResult {
    pub(crate) stdout: String,
    pub(crate) stderr: String,
    pub(crate) retcode: i32,
}

impl ExecResult {
    fn failure(message: String) -> Self {
        Self {
            stdout: String::new(),
            stderr: message,
            retcode: -1,
        }
    }
}

/// Everything a script run needs beyond its body.
pub(crate) struct ScriptJob<'a> {
    pub(crate) job_name: &'a str,
    pub(crate) job_type: &'a str,
    pub(crate) timeout_secs: u64,
    /// Work-item payload file, passed as the sole positional argument.
    pub(crate) input_path: Option<&'a Path>,
    /// The work digest, exported to the script environment.
    pub(crate) digest: Option<&'a Digest>,
}

/// Runs `script_body` under the interpreter for `language`.
pub(crate) async fn run_script(
    language: Language,
    script_body: &str,
    job: ScriptJob<'_>,
) -> ExecResult {
    let script_file = match tempfile::Builder::new()
        .prefix("kash-job-")
        .suffix(language.suffix())
        .tempfile()
    {
        Ok(mut file) => match file.write_all(script_body.as_bytes()).and_then(|()| file.flush()) {
            Ok(()) => file,
            Err(err) => return ExecResult::failure(format!("failed to write script: {err}")),
        },
        Err(err) => return ExecResult::failure(format!("failed to write script: {err}")),
    };

    let mut cmd = Command::new(language.program());
    cmd.args(language.interpreter_args());
    cmd.arg(script_file.path());
    if let Some(input) = job.input_path {
        cmd.arg(input);
    }

    cmd.env("JOB_NAME", job.job_name);
    cmd.env("JOB_TYPE", job.job_type);
    if let Some(digest) = job.digest {
        cmd.env("JOB_DIGEST_ID", &digest.id);
        cmd.env("JOB_DIGEST_TAGS", digest.tag_names().join(","));
    }

    cmd.stdin(Stdio::null());
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());
    cmd.kill_on_drop(true);

    tracing::debug!(
        job = job.job_name,
        language = %language,
        timeout_secs = job.timeout_secs,
        "running script"
    );

    // `script_file` stays alive (and on disk) until the run finishes; the
    // temp file is removed on drop whichever way the match exits.
    match tokio::time::timeout(Duration::from_secs(job.timeout_secs), cmd.output()).await {
        Ok(Ok(output)) => ExecResult {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            retcode: output.status.code().unwrap_or(-1),
        },
        Ok(Err(err)) => ExecResult::failure(format!(
            "failed to run {}: {err}",
            language.program()
        )),
        Err(_) => ExecResult::failure(format!(
            "script timed out after {} seconds",
            job.timeout_secs
        )),
    }
}
