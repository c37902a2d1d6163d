//! Subprocess Executor: shell-free spawn of external commands with
//! combined-stream capture, exit-status enforcement and a retry count.
//!
//! Spawning always goes through [`std::process::Command`] with a plain
//! argument vector — argv\[0\] is passed straight to the host spawn API
//! (no shell, no string concatenation, no metacharacter expansion).
//! Combined stdout+stderr are merged through a single OS pipe (via
//! `os_pipe`) so captured output preserves true interleaving, the same
//! way a shell's `2>&1` would, rather than concatenating two separately
//! buffered streams.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::process::{Command, ExitStatus, Stdio};
use std::thread;

use camino::Utf8Path;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitStatusKind {
    Code(i32),
    Signal(i32),
    Unknown,
}

impl std::fmt::Display for ExitStatusKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExitStatusKind::Code(c) => write!(f, "exit code {c}"),
            ExitStatusKind::Signal(s) => write!(f, "signal {s}"),
            ExitStatusKind::Unknown => write!(f, "unknown exit status"),
        }
    }
}

/// Raised when a command's final exit code is non-zero, or when it
/// terminated abnormally (signalled or stopped). Carries everything a
/// failure classifier needs to decide whether the failure is retriable.
#[derive(Debug, thiserror::Error)]
#[error("command {argv:?} failed ({status})")]
pub struct ExecutionError {
    pub status: ExitStatusKind,
    pub argv: Vec<String>,
    pub output: String,
}

pub struct CommandSpec<'a> {
    argv: Vec<String>,
    cwd: Option<&'a Utf8Path>,
    env: Option<&'a HashMap<String, String>>,
    remove_env: Option<&'a [String]>,
    stdin: Option<&'a [u8]>,
    quiet: bool,
    print_on_failure: bool,
    retries: u32,
}

impl<'a> CommandSpec<'a> {
    pub fn new(argv: Vec<String>) -> Self {
        assert!(!argv.is_empty(), "command argument vector must not be empty");
        Self {
            argv,
            cwd: None,
            env: None,
            remove_env: None,
            stdin: None,
            quiet: false,
            print_on_failure: false,
            retries: 0,
        }
    }

    pub fn cwd(mut self, cwd: &'a Utf8Path) -> Self {
        self.cwd = Some(cwd);
        self
    }

    pub fn env(mut self, env: &'a HashMap<String, String>) -> Self {
        self.env = Some(env);
        self
    }

    /// Names of environment variables that must not be inherited from the
    /// parent process by the child, e.g. credential-bearing variables the
    /// caller has marked sensitive.
    pub fn remove_env(mut self, names: &'a [String]) -> Self {
        self.remove_env = Some(names);
        self
    }

    pub fn stdin(mut self, input: &'a [u8]) -> Self {
        self.stdin = Some(input);
        self
    }

    pub fn quiet(mut self, quiet: bool) -> Self {
        self.quiet = quiet;
        self
    }

    pub fn print_on_failure(mut self, print: bool) -> Self {
        self.print_on_failure = print;
        self
    }

    pub fn retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }
}

/// Runs `spec`, retrying up to `spec.retries` additional times (no
/// back-off, immediate re-spawn) on non-zero exit. Returns the buffered
/// combined output on success.
pub fn run(spec: &CommandSpec) -> Result<String, ExecutionError> {
    let mut attempts_left = spec.retries + 1;
    loop {
        match run_once(spec) {
            Ok(output) => return Ok(output),
            Err(err) => {
                attempts_left -= 1;
                if attempts_left == 0 {
                    if spec.print_on_failure {
                        eprintln!("git-fastclone: command failed: {:?}", spec.argv);
                        for line in err.output.lines() {
                            eprintln!("    {line}");
                        }
                    }
                    return Err(err);
                }
            }
        }
    }
}

fn run_once(spec: &CommandSpec) -> Result<String, ExecutionError> {
    let (mut reader, writer) = os_pipe::pipe().expect("failed to create capture pipe");

    let mut cmd = Command::new(&spec.argv[0]);
    cmd.args(&spec.argv[1..]);
    if let Some(cwd) = spec.cwd {
        cmd.current_dir(cwd);
    }
    if let Some(env) = spec.env {
        cmd.envs(env.iter());
    }
    if let Some(names) = spec.remove_env {
        for name in names {
            cmd.env_remove(name);
        }
    }
    cmd.stdin(if spec.stdin.is_some() {
        Stdio::piped()
    } else {
        Stdio::null()
    });
    cmd.stdout(writer.try_clone().expect("failed to clone capture pipe"));
    cmd.stderr(writer);

    let mut child = spawn(&mut cmd, &spec.argv)?;

    // Stdin is written on its own thread, concurrently with draining the
    // combined-output pipe below: a child that both expects a large
    // stdin payload and produces enough output to fill the pipe before
    // finishing its read would otherwise deadlock us in `write_all` and
    // itself in its own write.
    let buf = thread::scope(|scope| {
        if let Some(input) = spec.stdin {
            if let Some(mut stdin) = child.stdin.take() {
                scope.spawn(move || {
                    let _ = stdin.write_all(input);
                });
            }
        }

        let mut buf = Vec::new();
        let mut chunk = [0u8; 8192];
        loop {
            let n = reader.read(&mut chunk).unwrap_or(0);
            if n == 0 {
                break;
            }
            buf.extend_from_slice(&chunk[..n]);
            if !spec.quiet {
                let _ = std::io::stdout().write_all(&chunk[..n]);
            }
        }
        buf
    });

    let status = child.wait().map_err(|e| io_spawn_error(&spec.argv, e))?;
    let output = String::from_utf8_lossy(&buf).into_owned();

    if status.success() {
        Ok(output)
    } else {
        Err(ExecutionError {
            status: classify_status(status),
            argv: spec.argv.clone(),
            output,
        })
    }
}

fn spawn(cmd: &mut Command, argv: &[String]) -> Result<std::process::Child, ExecutionError> {
    cmd.spawn().map_err(|e| io_spawn_error(argv, e))
}

fn io_spawn_error(argv: &[String], e: std::io::Error) -> ExecutionError {
    ExecutionError {
        status: ExitStatusKind::Unknown,
        argv: argv.to_vec(),
        output: format!("failed to spawn {:?}: {e}", argv.first()),
    }
}

#[cfg(unix)]
fn classify_status(status: ExitStatus) -> ExitStatusKind {
    use std::os::unix::process::ExitStatusExt;
    if let Some(code) = status.code() {
        ExitStatusKind::Code(code)
    } else if let Some(signal) = status.signal() {
        ExitStatusKind::Signal(signal)
    } else {
        ExitStatusKind::Unknown
    }
}

#[cfg(not(unix))]
fn classify_status(status: ExitStatus) -> ExitStatusKind {
    status
        .code()
        .map(ExitStatusKind::Code)
        .unwrap_or(ExitStatusKind::Unknown)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn argv(words: &[&str]) -> Vec<String> {
        words.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn captures_combined_output_on_success() {
        let spec = CommandSpec::new(argv(&["sh", "-c", "echo out; echo err >&2"])).quiet(true);
        let output = run(&spec).expect("command should succeed");
        assert!(output.contains("out"));
        assert!(output.contains("err"));
    }

    #[test]
    fn non_zero_exit_is_an_execution_error() {
        let spec = CommandSpec::new(argv(&["sh", "-c", "echo boom; exit 7"])).quiet(true);
        let err = run(&spec).unwrap_err();
        assert_eq!(err.status, ExitStatusKind::Code(7));
        assert!(err.output.contains("boom"));
    }

    #[test]
    fn retries_run_the_command_again() {
        let dir = tempfile::tempdir().unwrap();
        let counter = dir.path().join("attempts");
        let script = format!(
            "n=$(cat {0} 2>/dev/null || echo 0); n=$((n+1)); echo $n > {0}; [ $n -ge 3 ]",
            counter.display()
        );
        let spec = CommandSpec::new(argv(&["sh", "-c", &script]))
            .quiet(true)
            .retries(2);
        assert!(run(&spec).is_ok());
        let attempts: u32 = std::fs::read_to_string(&counter)
            .unwrap()
            .trim()
            .parse()
            .unwrap();
        assert_eq!(attempts, 3);
    }

    #[test]
    fn no_shell_metacharacter_expansion() {
        // argv[0] is the literal string "echo *"; there is no shell to glob it.
        let spec = CommandSpec::new(argv(&["echo", "*", "not-a-glob"])).quiet(true);
        let output = run(&spec).unwrap();
        assert_eq!(output.trim(), "* not-a-glob");
    }

    #[test]
    fn large_stdin_and_output_do_not_deadlock() {
        // `cat` echoes stdin back to stdout; a payload larger than a
        // pipe buffer forces the writer and reader to run concurrently
        // or the parent would block in `write_all` while the child
        // blocks writing its own output.
        let input = vec![b'x'; 4 * 1024 * 1024];
        let spec = CommandSpec::new(argv(&["cat"])).quiet(true).stdin(&input);
        let output = run(&spec).expect("cat should succeed");
        assert_eq!(output.len(), input.len());
    }
}
