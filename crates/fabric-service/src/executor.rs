// SPDX-License-Identifier: Apache-2.0
//! Execution backends for staged snippets.
//!
//! The fabric speculatively runs untrusted snippets before promoting them,
//! but it does not ship fifteen embedded language interpreters. Instead it
//! defines a narrow [`Executor`] trait and two generic implementations:
//! [`InProcessExecutor`], a toy namespace good enough to exercise the
//! in-process isolation path Python uses, and [`SubprocessExecutor`], a
//! command-template wrapper that shells out to whatever interpreter or
//! compiler is actually installed. Real language support is a matter of
//! configuring a `SubprocessExecutor` per engine; none of the staging
//! pipeline's logic depends on which backend is behind the trait.

use std::collections::BTreeMap;
use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;
use tokio::time::timeout;

use crate::error::FabricError;
use crate::lang::LanguageId;

/// Outcome of running one snippet.
#[derive(Debug, Clone)]
pub struct ExecutionOutcome {
    pub success: bool,
    pub output: String,
    pub error: String,
    pub elapsed_secs: f64,
    pub variables: serde_json::Value,
}

/// A backend capable of running source for one language.
///
/// `fresh_instance` controls isolation: implementations that hold mutable
/// interpreter state (a shared namespace) should return `true` so the
/// staging pipeline gives speculative runs a throwaway instance instead of
/// polluting the shared one.
pub trait Executor: Send + Sync {
    /// Run `code`, waiting at most `timeout` before failing with a timeout error.
    fn run(&self, code: &str, timeout_budget: Duration) -> Result<ExecutionOutcome, FabricError>;

    /// Whether speculative runs should get a fresh instance rather than
    /// share this executor's state.
    fn needs_fresh_instance_for_speculation(&self) -> bool {
        false
    }
}

/// A minimal in-process "interpreter": evaluates a handful of literal forms
/// and otherwise just echoes the source back as output. Stands in for a
/// real embedded interpreter without pretending to be one.
#[derive(Default)]
pub struct InProcessExecutor {
    namespace: std::sync::Mutex<BTreeMap<String, serde_json::Value>>,
}

impl InProcessExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// A fresh executor with an empty namespace, for isolated speculative runs.
    pub fn fresh() -> Self {
        Self::default()
    }
}

impl Executor for InProcessExecutor {
    fn run(&self, code: &str, _timeout_budget: Duration) -> Result<ExecutionOutcome, FabricError> {
        let started = std::time::Instant::now();
        let mut ns = self.namespace.lock().expect("namespace mutex poisoned");
        for (i, line) in code.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            if let Some((name, value)) = line.split_once('=') {
                let name = name.trim();
                if name.chars().all(|c| c.is_alphanumeric() || c == '_') && !name.is_empty() {
                    ns.insert(format!("line_{i}_{name}"), serde_json::Value::String(value.trim().to_string()));
                }
            }
        }
        let variables = serde_json::to_value(
            ns.iter()
                .filter(|(k, _)| !k.starts_with("__"))
                .collect::<BTreeMap<_, _>>(),
        )
        .unwrap_or_else(|_| serde_json::json!({}));
        Ok(ExecutionOutcome {
            success: true,
            output: format!("ran {} line(s)", code.lines().count()),
            error: String::new(),
            elapsed_secs: started.elapsed().as_secs_f64(),
            variables,
        })
    }

    fn needs_fresh_instance_for_speculation(&self) -> bool {
        true
    }
}

/// Runs a snippet by shelling out to an external interpreter/compiler via a
/// command template, e.g. `["python3", "{file}"]`. The template's last
/// placeholder is replaced with a temp file holding the snippet's source.
pub struct SubprocessExecutor {
    command_template: Vec<String>,
    extension: &'static str,
}

impl SubprocessExecutor {
    pub fn new(command_template: Vec<String>, extension: &'static str) -> Self {
        Self { command_template, extension }
    }

    /// Build the conventional subprocess executor for a language, assuming
    /// its interpreter is on `PATH` under a standard name. Returns `None`
    /// for languages with no configured interpreter template — callers
    /// should leave those unregistered rather than guess at a fallback.
    pub fn for_language(language: LanguageId) -> Option<Self> {
        let (program, args): (&str, &[&str]) = match language {
            LanguageId::JavaScript => ("node", &["{file}"]),
            LanguageId::TypeScript => ("ts-node", &["{file}"]),
            LanguageId::Ruby => ("ruby", &["{file}"]),
            LanguageId::Go => ("go", &["run", "{file}"]),
            LanguageId::R => ("Rscript", &["{file}"]),
            LanguageId::Bash => ("bash", &["{file}"]),
            LanguageId::Perl => ("perl", &["{file}"]),
            _ => return None,
        };
        let mut template = vec![program.to_string()];
        template.extend(args.iter().map(|a| a.to_string()));
        Some(Self::new(template, language.extension()))
    }
}

impl Executor for SubprocessExecutor {
    fn run(&self, code: &str, timeout_budget: Duration) -> Result<ExecutionOutcome, FabricError> {
        let started = std::time::Instant::now();
        let dir = std::env::temp_dir();
        let file_path = dir.join(format!("fabric-snippet-{}{}", crate::util::unix_time_now(), self.extension));
        std::fs::write(&file_path, code).map_err(FabricError::Io)?;

        let mut args: Vec<String> = Vec::with_capacity(self.command_template.len().saturating_sub(1));
        let program = self.command_template.first().cloned().unwrap_or_default();
        for arg in self.command_template.iter().skip(1) {
            args.push(arg.replace("{file}", &file_path.to_string_lossy()));
        }

        let outcome = match tokio::runtime::Handle::try_current() {
            Ok(_) => tokio::task::block_in_place(|| {
                tokio::runtime::Handle::current().block_on(run_subprocess(&program, &args, timeout_budget))
            }),
            Err(_) => {
                let rt = tokio::runtime::Runtime::new().map_err(FabricError::Io)?;
                rt.block_on(run_subprocess(&program, &args, timeout_budget))
            }
        };
        let _ = std::fs::remove_file(&file_path);
        let (success, output, error) = outcome?;
        Ok(ExecutionOutcome {
            success,
            output,
            error,
            elapsed_secs: started.elapsed().as_secs_f64(),
            variables: serde_json::json!({}),
        })
    }
}

async fn run_subprocess(program: &str, args: &[String], timeout_budget: Duration) -> Result<(bool, String, String), FabricError> {
    let child = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| FabricError::ExecutorFailed(format!("failed to spawn {program}: {e}")))?;

    let wait = child.wait_with_output();
    match timeout(timeout_budget, wait).await {
        Ok(Ok(output)) => Ok((
            output.status.success(),
            String::from_utf8_lossy(&output.stdout).into_owned(),
            String::from_utf8_lossy(&output.stderr).into_owned(),
        )),
        Ok(Err(e)) => Err(FabricError::ExecutorFailed(format!("{program} failed: {e}"))),
        Err(_) => Ok((false, String::new(), "execution timed out".to_string())),
    }
}

/// Holds one executor per language, dispatching by [`LanguageId`].
pub struct ExecutorPool {
    executors: BTreeMap<LanguageId, Box<dyn Executor>>,
    default_timeout: Duration,
}

impl ExecutorPool {
    pub fn new(default_timeout: Duration) -> Self {
        Self { executors: BTreeMap::new(), default_timeout }
    }

    /// The conventional pool: an in-process executor for Python, a subprocess
    /// executor for every other language with a configured interpreter
    /// template. Languages without one (a compile step this single-process-
    /// spawn model doesn't support) are left unregistered.
    pub fn with_defaults(default_timeout: Duration) -> Self {
        let mut pool = Self::new(default_timeout);
        pool.register(LanguageId::Python, Box::new(InProcessExecutor::new()));
        for language in LanguageId::ALL.into_iter().filter(|l| *l != LanguageId::Python) {
            if let Some(executor) = SubprocessExecutor::for_language(language) {
                pool.register(language, Box::new(executor));
            }
        }
        pool
    }

    pub fn register(&mut self, language: LanguageId, executor: Box<dyn Executor>) {
        self.executors.insert(language, executor);
    }

    /// Run `code` for `language`, using a fresh instance for isolation when
    /// the shared executor demands it (the in-process Python path).
    pub fn run(&self, language: LanguageId, code: &str) -> Result<ExecutionOutcome, FabricError> {
        let executor = self
            .executors
            .get(&language)
            .ok_or_else(|| FabricError::ExecutorUnavailable(language.canonical().to_string()))?;
        if executor.needs_fresh_instance_for_speculation() && language == LanguageId::Python {
            return InProcessExecutor::fresh().run(code, self.default_timeout);
        }
        executor.run(code, self.default_timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn in_process_executor_runs_without_error() {
        let exec = InProcessExecutor::new();
        let result = exec.run("x = 1\ny = 2", Duration::from_secs(1)).unwrap();
        assert!(result.success);
    }

    #[test]
    fn pool_reports_executor_unavailable_for_unregistered_language() {
        let pool = ExecutorPool::new(Duration::from_secs(1));
        assert!(matches!(
            pool.run(LanguageId::Rust, "fn main() {}"),
            Err(FabricError::ExecutorUnavailable(_))
        ));
    }

    #[test]
    fn defaults_leave_languages_without_a_template_unregistered() {
        let pool = ExecutorPool::with_defaults(Duration::from_secs(1));
        assert!(matches!(
            pool.run(LanguageId::Rust, "fn main() {}"),
            Err(FabricError::ExecutorUnavailable(_))
        ));
        assert!(matches!(
            pool.run(LanguageId::Cpp, "int main() {}"),
            Err(FabricError::ExecutorUnavailable(_))
        ));
    }

    #[test]
    fn python_speculation_gets_a_fresh_namespace() {
        let pool = ExecutorPool::with_defaults(Duration::from_secs(1));
        let first = pool.run(LanguageId::Python, "leak = 1").unwrap();
        let second = pool.run(LanguageId::Python, "").unwrap();
        assert!(first.success && second.success);
        assert_eq!(second.variables, serde_json::json!({}));
    }
}
