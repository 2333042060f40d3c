//! External command execution
//!
//! Every side effect on the machine (package installs, service management,
//! the finalizing restart, session creation) goes through a [`CommandRunner`].
//! [`SystemRunner`] spawns real processes; [`mock::MockRunner`] scripts
//! outcomes for tests.

use crate::errors::{BootstrapError, CommandError, Result};
use async_trait::async_trait;
use std::fmt;
use std::process::Stdio;
use std::time::{Duration, Instant};
use tracing::{debug, instrument};

/// Number of trailing stderr lines kept in a command failure
const STDERR_TAIL_LINES: usize = 5;

/// A command to execute
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    /// Program to execute
    pub program: String,
    /// Program arguments
    pub args: Vec<String>,
    /// Extra environment variables
    pub env: Vec<(String, String)>,
    /// Run as this user instead of the invoking one
    pub user: Option<String>,
}

impl CommandSpec {
    /// Create a command for `program` with no arguments
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
            user: None,
        }
    }

    /// A bash script executed with `bash -c` and `pipefail`
    pub fn shell(script: impl Into<String>) -> Self {
        Self::new("bash").args(["-o", "pipefail", "-c"]).arg(script)
    }

    /// Append one argument
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Append several arguments
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Add an environment variable
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Run as another user (with that user's home directory)
    pub fn as_user(mut self, user: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self
    }

    /// Full argv including the run-as prefix
    pub fn argv(&self) -> Vec<String> {
        let mut argv = Vec::with_capacity(self.args.len() + 5);
        if let Some(user) = &self.user {
            argv.extend(["sudo", "-u", user.as_str(), "-H"].map(String::from));
            if !self.env.is_empty() {
                argv.push("env".to_string());
                argv.extend(self.env.iter().map(|(k, v)| format!("{}={}", k, v)));
            }
        }
        argv.push(self.program.clone());
        argv.extend(self.args.iter().cloned());
        argv
    }
}

impl fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", shell_words::join(self.argv()))
    }
}

/// Captured result of a finished command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit code, `None` when terminated by a signal
    pub code: Option<i32>,
    /// Captured standard output
    pub stdout: String,
    /// Captured standard error
    pub stderr: String,
    /// Wall-clock runtime
    pub duration: Duration,
}

impl CommandOutput {
    /// Successful output with the given stdout
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            code: Some(0),
            stdout: stdout.into(),
            stderr: String::new(),
            duration: Duration::ZERO,
        }
    }

    /// Failed output with the given exit code and stderr
    pub fn failed(code: i32, stderr: impl Into<String>) -> Self {
        Self {
            code: Some(code),
            stdout: String::new(),
            stderr: stderr.into(),
            duration: Duration::ZERO,
        }
    }

    /// Whether the process exited with status zero
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    /// Last few stderr lines, joined for single-line display
    pub fn stderr_tail(&self) -> String {
        let lines: Vec<&str> = self
            .stderr
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .collect();
        let start = lines.len().saturating_sub(STDERR_TAIL_LINES);
        lines[start..].join(" | ")
    }
}

/// Executes commands on behalf of step actions and the session watcher
#[async_trait]
pub trait CommandRunner: Send + Sync + fmt::Debug {
    /// Run a command to completion. `Err` means the process could not be
    /// started; a non-zero exit is reported through [`CommandOutput`].
    async fn run(&self, spec: &CommandSpec) -> Result<CommandOutput>;
}

/// Run a command and turn a non-zero exit into [`CommandError::Failed`]
pub async fn run_checked(runner: &dyn CommandRunner, spec: &CommandSpec) -> Result<CommandOutput> {
    let output = runner.run(spec).await?;
    if output.success() {
        Ok(output)
    } else {
        Err(BootstrapError::Command(CommandError::Failed {
            command: spec.to_string(),
            code: output.code,
            stderr_tail: output.stderr_tail(),
        }))
    }
}

/// Runner that spawns real processes
#[derive(Debug, Clone, Default)]
pub struct SystemRunner;

impl SystemRunner {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl CommandRunner for SystemRunner {
    #[instrument(skip_all, fields(program = %spec.program))]
    async fn run(&self, spec: &CommandSpec) -> Result<CommandOutput> {
        let argv = spec.argv();
        let mut command = tokio::process::Command::new(&argv[0]);
        command
            .args(&argv[1..])
            .env("DEBIAN_FRONTEND", "noninteractive")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if spec.user.is_none() {
            for (key, value) in &spec.env {
                command.env(key, value);
            }
        }

        let started = Instant::now();
        let output = command.output().await.map_err(|source| {
            BootstrapError::Command(CommandError::Spawn {
                command: spec.program.clone(),
                source,
            })
        })?;
        let duration = started.elapsed();

        debug!(
            "Command exited with {:?} after {:?}",
            output.status.code(),
            duration
        );

        Ok(CommandOutput {
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            duration,
        })
    }
}

pub mod mock {
    //! Scripted command runner for tests
    //!
    //! Responses are matched by substring against the rendered command line.
    //! Queued responses are consumed first-in first-out; once a pattern's queue
    //! is empty its sticky response (if any) applies, then the default.

    use super::{CommandOutput, CommandRunner, CommandSpec};
    use crate::errors::Result;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    #[derive(Debug, Default)]
    struct Script {
        queued: Vec<(String, VecDeque<CommandOutput>)>,
        sticky: Vec<(String, CommandOutput)>,
    }

    /// Mock runner recording every command it is asked to run
    #[derive(Debug, Clone)]
    pub struct MockRunner {
        script: Arc<Mutex<Script>>,
        history: Arc<Mutex<Vec<CommandSpec>>>,
        default: CommandOutput,
    }

    impl Default for MockRunner {
        fn default() -> Self {
            Self::new()
        }
    }

    impl MockRunner {
        /// Every command succeeds with empty output unless scripted otherwise
        pub fn new() -> Self {
            Self {
                script: Arc::new(Mutex::new(Script::default())),
                history: Arc::new(Mutex::new(Vec::new())),
                default: CommandOutput::ok(""),
            }
        }

        /// Use `output` for every command matching `pattern`
        pub fn set_response(&self, pattern: &str, output: CommandOutput) {
            let mut script = self.script.lock().unwrap();
            script.sticky.retain(|(p, _)| p != pattern);
            script.sticky.push((pattern.to_string(), output));
        }

        /// Use `output` once for the next command matching `pattern`
        pub fn push_response(&self, pattern: &str, output: CommandOutput) {
            let mut script = self.script.lock().unwrap();
            match script.queued.iter_mut().find(|(p, _)| p == pattern) {
                Some((_, queue)) => queue.push_back(output),
                None => script
                    .queued
                    .push((pattern.to_string(), VecDeque::from([output]))),
            }
        }

        /// Make the next `times` commands matching `pattern` fail with exit code 1
        pub fn fail_times(&self, pattern: &str, times: usize) {
            for _ in 0..times {
                self.push_response(pattern, CommandOutput::failed(1, "scripted failure"));
            }
        }

        /// Make every command matching `pattern` fail with exit code 1
        pub fn fail_always(&self, pattern: &str) {
            self.set_response(pattern, CommandOutput::failed(1, "scripted failure"));
        }

        /// Remove sticky and queued responses for `pattern`
        pub fn clear_response(&self, pattern: &str) {
            let mut script = self.script.lock().unwrap();
            script.sticky.retain(|(p, _)| p != pattern);
            script.queued.retain(|(p, _)| p != pattern);
        }

        /// Commands run so far, in order
        pub fn history(&self) -> Vec<CommandSpec> {
            self.history.lock().unwrap().clone()
        }

        /// Rendered command lines run so far
        pub fn command_lines(&self) -> Vec<String> {
            self.history().iter().map(ToString::to_string).collect()
        }

        /// Number of commands whose rendered line contains `pattern`
        pub fn count_matching(&self, pattern: &str) -> usize {
            self.command_lines()
                .iter()
                .filter(|line| line.contains(pattern))
                .count()
        }

        /// Forget recorded history
        pub fn clear_history(&self) {
            self.history.lock().unwrap().clear();
        }

        fn respond(&self, line: &str) -> CommandOutput {
            let mut script = self.script.lock().unwrap();
            for (pattern, queue) in script.queued.iter_mut() {
                if line.contains(pattern.as_str()) {
                    if let Some(output) = queue.pop_front() {
                        return output;
                    }
                }
            }
            script
                .sticky
                .iter()
                .find(|(pattern, _)| line.contains(pattern.as_str()))
                .map(|(_, output)| output.clone())
                .unwrap_or_else(|| self.default.clone())
        }
    }

    #[async_trait]
    impl CommandRunner for MockRunner {
        async fn run(&self, spec: &CommandSpec) -> Result<CommandOutput> {
            let line = spec.to_string();
            self.history.lock().unwrap().push(spec.clone());
            Ok(self.respond(&line))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::mock::MockRunner;
    use super::*;

    #[test]
    fn test_shell_spec_display_quotes_script() {
        let spec = CommandSpec::shell("apt-get update && apt-get -y upgrade");
        assert_eq!(
            spec.to_string(),
            "bash -o pipefail -c 'apt-get update && apt-get -y upgrade'"
        );
    }

    #[test]
    fn test_run_as_user_prefix() {
        let spec = CommandSpec::new("gsettings")
            .args(["set", "org.gnome.desktop.session", "idle-delay", "uint32 0"])
            .env("DISPLAY", ":0")
            .as_user("ubuntu");
        assert_eq!(
            spec.argv(),
            vec![
                "sudo",
                "-u",
                "ubuntu",
                "-H",
                "env",
                "DISPLAY=:0",
                "gsettings",
                "set",
                "org.gnome.desktop.session",
                "idle-delay",
                "uint32 0"
            ]
        );
    }

    #[test]
    fn test_stderr_tail_keeps_last_lines() {
        let output = CommandOutput::failed(100, "a\n\nb\nc\nd\ne\nf\n");
        assert_eq!(output.stderr_tail(), "b | c | d | e | f");
        assert!(!output.success());
    }

    #[tokio::test]
    async fn test_run_checked_maps_failure() {
        let runner = MockRunner::new();
        runner.fail_always("apt-get");

        let err = run_checked(&runner, &CommandSpec::shell("apt-get update"))
            .await
            .unwrap_err();
        match err {
            BootstrapError::Command(CommandError::Failed { code, command, .. }) => {
                assert_eq!(code, Some(1));
                assert!(command.contains("apt-get update"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_mock_queue_then_sticky_then_default() {
        let runner = MockRunner::new();
        runner.push_response("curl", CommandOutput::failed(7, "connection refused"));
        runner.set_response("curl", CommandOutput::ok("sticky"));

        let spec = CommandSpec::new("curl").arg("-fsSL");
        assert_eq!(runner.run(&spec).await.unwrap().code, Some(7));
        assert_eq!(runner.run(&spec).await.unwrap().stdout, "sticky");

        runner.clear_response("curl");
        assert_eq!(runner.run(&spec).await.unwrap().stdout, "");
        assert_eq!(runner.count_matching("curl"), 3);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_system_runner_captures_output() {
        let runner = SystemRunner::new();
        let output = runner
            .run(&CommandSpec::new("sh").args(["-c", "echo out; echo err >&2; exit 3"]))
            .await
            .unwrap();
        assert_eq!(output.code, Some(3));
        assert_eq!(output.stdout.trim(), "out");
        assert_eq!(output.stderr.trim(), "err");
    }

    #[tokio::test]
    async fn test_system_runner_spawn_failure() {
        let runner = SystemRunner::new();
        let err = runner
            .run(&CommandSpec::new("/nonexistent/firstboot-test-binary"))
            .await
            .unwrap_err();
        assert!(matches!(err, BootstrapError::Command(CommandError::Spawn { .. })));
    }
}
