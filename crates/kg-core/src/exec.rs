//! External command execution
//!
//! Every call to `kind`, `kubectl`, `flux`, `lsof` and friends goes through
//! [`CommandRunner`], so the orchestration logic can be exercised against a
//! scripted runner in tests.

use async_trait::async_trait;
use std::fmt;
use std::fs::File;
use std::io;
use std::path::Path;
use std::process::{Child, Stdio};

use tokio::io::AsyncWriteExt;

use crate::error::{CommandError, PreconditionError};

/// A single external command line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub program: String,
    pub args: Vec<String>,
    /// Data piped to the program's stdin
    pub stdin: Option<String>,
}

impl Invocation {
    pub fn new<I, S>(program: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
            stdin: None,
        }
    }

    /// Pipe `input` to the program's stdin
    pub fn with_stdin(mut self, input: impl Into<String>) -> Self {
        self.stdin = Some(input.into());
        self
    }

    /// Program followed by its arguments
    pub fn argv(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.program.as_str()).chain(self.args.iter().map(String::as_str))
    }
}

impl fmt::Display for Invocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            write!(f, " {}", arg)?;
        }
        Ok(())
    }
}

/// Captured result of a finished command
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    /// Successful run printing `stdout`
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            success: true,
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    /// Failed run printing `stderr`
    pub fn failed(stderr: impl Into<String>) -> Self {
        Self {
            success: false,
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }
}

/// Runs external programs
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run to completion and capture output
    async fn run(&self, invocation: &Invocation) -> io::Result<CommandOutput>;

    /// Whether `tool` resolves on PATH
    async fn is_available(&self, tool: &str) -> bool;

    /// Start a process that outlives this one, with stdout and stderr
    /// appended to `log_path`
    fn spawn_detached(&self, invocation: &Invocation, log_path: &Path) -> io::Result<Child>;
}

/// Run a command and fail on a non-zero exit, keeping stderr verbatim
pub async fn run_checked<R>(runner: &R, invocation: &Invocation) -> Result<CommandOutput, CommandError>
where
    R: CommandRunner + ?Sized,
{
    tracing::debug!("Running: {}", invocation);

    let output = runner
        .run(invocation)
        .await
        .map_err(|source| CommandError::Spawn {
            command: invocation.to_string(),
            source,
        })?;

    if !output.success {
        return Err(CommandError::Failed {
            command: invocation.to_string(),
            stderr: output.stderr.trim_end().to_string(),
        });
    }

    Ok(output)
}

/// Fail with [`PreconditionError::MissingTool`] for the first absent tool
pub async fn require_tools<R>(runner: &R, tools: &[(&str, &str)]) -> Result<(), PreconditionError>
where
    R: CommandRunner + ?Sized,
{
    for (tool, hint) in tools {
        if !runner.is_available(tool).await {
            return Err(PreconditionError::MissingTool {
                tool: tool.to_string(),
                hint: hint.to_string(),
            });
        }
        tracing::debug!("Found {}", tool);
    }
    Ok(())
}

/// Runner backed by real processes
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemRunner;

#[async_trait]
impl CommandRunner for SystemRunner {
    async fn run(&self, invocation: &Invocation) -> io::Result<CommandOutput> {
        let mut command = tokio::process::Command::new(&invocation.program);
        command
            .args(&invocation.args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        if invocation.stdin.is_some() {
            command.stdin(Stdio::piped());
        } else {
            command.stdin(Stdio::null());
        }

        let mut child = command.spawn()?;

        if let (Some(input), Some(mut stdin)) = (&invocation.stdin, child.stdin.take()) {
            stdin.write_all(input.as_bytes()).await?;
            // Close stdin so the program sees EOF
            drop(stdin);
        }

        let output = child.wait_with_output().await?;
        Ok(CommandOutput {
            success: output.status.success(),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        })
    }

    async fn is_available(&self, tool: &str) -> bool {
        let finder = if cfg!(windows) { "where" } else { "which" };
        tokio::process::Command::new(finder)
            .arg(tool)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .map(|status| status.success())
            .unwrap_or(false)
    }

    fn spawn_detached(&self, invocation: &Invocation, log_path: &Path) -> io::Result<Child> {
        spawn_logged(&invocation.program, &invocation.args, log_path)
    }
}

/// Spawn `program` in its own process group with output sent to `log_path`
fn spawn_logged(program: &str, args: &[String], log_path: &Path) -> io::Result<Child> {
    if let Some(parent) = log_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let log = File::create(log_path)?;
    let log_err = log.try_clone()?;

    let mut command = std::process::Command::new(program);
    command
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::from(log))
        .stderr(Stdio::from(log_err));

    // Detach from our process group so terminal signals aimed at the
    // invoking shell do not reach the tunnel
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        command.process_group(0);
    }

    command.spawn()
}

/// Scripted runner for tests
#[cfg(any(test, feature = "test-util"))]
pub mod testing {
    use super::*;
    use std::sync::Mutex;

    struct Rule {
        pattern: Vec<String>,
        output: CommandOutput,
    }

    /// Answers commands from a rule table and records every call
    ///
    /// A rule matches when every pattern token appears in the command's argv.
    /// The most recently added matching rule wins; unmatched commands succeed
    /// with empty output.
    #[derive(Default)]
    pub struct ScriptedRunner {
        rules: Mutex<Vec<Rule>>,
        calls: Mutex<Vec<Invocation>>,
        missing_tools: Mutex<Vec<String>>,
        spawn_substitute: Mutex<Option<(String, Vec<String>)>>,
    }

    impl ScriptedRunner {
        pub fn new() -> Self {
            Self::default()
        }

        /// Answer commands containing all of `pattern` with `output`
        pub fn on(self, pattern: &[&str], output: CommandOutput) -> Self {
            self.rules.lock().unwrap().push(Rule {
                pattern: pattern.iter().map(|s| s.to_string()).collect(),
                output,
            });
            self
        }

        /// Report `tool` as absent from PATH
        pub fn without_tool(self, tool: &str) -> Self {
            self.missing_tools.lock().unwrap().push(tool.to_string());
            self
        }

        /// Run `program args` in place of any detached spawn
        pub fn spawning(self, program: &str, args: &[&str]) -> Self {
            *self.spawn_substitute.lock().unwrap() = Some((
                program.to_string(),
                args.iter().map(|s| s.to_string()).collect(),
            ));
            self
        }

        /// All invocations so far, in order
        pub fn calls(&self) -> Vec<Invocation> {
            self.calls.lock().unwrap().clone()
        }

        /// Number of invocations containing all of `pattern`
        pub fn count(&self, pattern: &[&str]) -> usize {
            self.calls
                .lock()
                .unwrap()
                .iter()
                .filter(|inv| matches(inv, pattern))
                .count()
        }

        fn respond(&self, invocation: &Invocation) -> CommandOutput {
            self.rules
                .lock()
                .unwrap()
                .iter()
                .rev()
                .find(|rule| {
                    let pattern: Vec<&str> = rule.pattern.iter().map(String::as_str).collect();
                    matches(invocation, &pattern)
                })
                .map(|rule| rule.output.clone())
                .unwrap_or_else(|| CommandOutput::ok(""))
        }
    }

    fn matches(invocation: &Invocation, pattern: &[&str]) -> bool {
        pattern
            .iter()
            .all(|token| invocation.argv().any(|arg| arg == *token))
    }

    #[async_trait]
    impl CommandRunner for ScriptedRunner {
        async fn run(&self, invocation: &Invocation) -> io::Result<CommandOutput> {
            self.calls.lock().unwrap().push(invocation.clone());
            Ok(self.respond(invocation))
        }

        async fn is_available(&self, tool: &str) -> bool {
            !self.missing_tools.lock().unwrap().iter().any(|t| t == tool)
        }

        fn spawn_detached(&self, invocation: &Invocation, log_path: &Path) -> io::Result<Child> {
            self.calls.lock().unwrap().push(invocation.clone());
            let substitute = self.spawn_substitute.lock().unwrap().clone();
            match substitute {
                Some((program, args)) => spawn_logged(&program, &args, log_path),
                None => Err(io::Error::new(
                    io::ErrorKind::Unsupported,
                    "no spawn substitute configured",
                )),
            }
        }
    }
}
