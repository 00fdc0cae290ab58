//! Thin wrapper over the `kubectl` command line

use std::time::Duration;

use crate::error::{CommandError, ProvisionError};
use crate::exec::{run_checked, CommandOutput, CommandRunner, Invocation};

/// Extra time granted to kubectl beyond its own `--timeout` before the
/// call is abandoned
const WAIT_GRACE: Duration = Duration::from_secs(15);

/// kubectl bound to an optional kubeconfig context
pub struct Kubectl<'a, R: ?Sized> {
    runner: &'a R,
    context: Option<String>,
}

impl<'a, R: CommandRunner + ?Sized> Kubectl<'a, R> {
    pub fn new(runner: &'a R, context: Option<String>) -> Self {
        Self { runner, context }
    }

    /// Build a kubectl invocation, inserting `--context` when set
    pub fn invocation(&self, args: &[&str]) -> Invocation {
        let mut full: Vec<String> = Vec::with_capacity(args.len() + 2);
        if let Some(context) = &self.context {
            full.push("--context".to_string());
            full.push(context.clone());
        }
        full.extend(args.iter().map(|s| s.to_string()));
        Invocation::new("kubectl", full)
    }

    /// Run and require success
    pub async fn run(&self, args: &[&str]) -> Result<CommandOutput, CommandError> {
        run_checked(self.runner, &self.invocation(args)).await
    }

    /// Run and report only whether it succeeded
    pub async fn succeeds(&self, args: &[&str]) -> bool {
        self.run(args).await.is_ok()
    }

    /// `kubectl apply -f -` with `manifest` on stdin (create or replace)
    pub async fn apply(&self, manifest: &str) -> Result<(), CommandError> {
        let invocation = self.invocation(&["apply", "-f", "-"]).with_stdin(manifest);
        let output = run_checked(self.runner, &invocation).await?;
        tracing::debug!("{}", output.stdout.trim_end());
        Ok(())
    }

    /// `kubectl wait` bounded by `timeout`
    ///
    /// An expired wait maps to [`ProvisionError::Timeout`]; any other
    /// kubectl failure is passed through as a command error.
    pub async fn wait(
        &self,
        what: &str,
        namespace: Option<&str>,
        target: &[&str],
        condition: &str,
        timeout: Duration,
    ) -> Result<(), ProvisionError> {
        let for_arg = format!("--for=condition={}", condition);
        let timeout_arg = format!("--timeout={}s", timeout.as_secs());

        let mut args: Vec<&str> = Vec::new();
        if let Some(ns) = namespace {
            args.extend(["-n", ns]);
        }
        args.push("wait");
        args.extend(target);
        args.push(&for_arg);
        args.push(&timeout_arg);

        let invocation = self.invocation(&args);
        let result = tokio::time::timeout(timeout + WAIT_GRACE, run_checked(self.runner, &invocation)).await;

        match result {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(CommandError::Failed { stderr, .. })) if is_timeout_message(&stderr) => {
                Err(ProvisionError::Timeout {
                    what: what.to_string(),
                    timeout,
                    detail: stderr,
                })
            }
            Ok(Err(e)) => Err(e.into()),
            Err(_) => Err(ProvisionError::Timeout {
                what: what.to_string(),
                timeout,
                detail: "kubectl did not return".to_string(),
            }),
        }
    }
}

fn is_timeout_message(stderr: &str) -> bool {
    stderr.contains("timed out")
}
