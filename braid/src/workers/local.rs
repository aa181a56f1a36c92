//! In-process worker backend.
//!
//! Function tasks run on the blocking thread pool; command tasks spawn a
//! child process with `kill_on_drop`, so aborting the dispatch future (how
//! the scheduler implements best-effort cancellation) also reaps the child.

use async_trait::async_trait;
use serde_json::Value;
use std::io::ErrorKind;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use tokio::process::Command;

use crate::task::TaskKind;
use crate::template::CommandTemplate;
use crate::value::Bindings;

use super::{EnvSpec, WorkUnit, WorkerBackend, WorkerFailure};

/// Worker backend executing units on the local machine.
#[derive(Clone, Debug)]
pub struct LocalBackend {
    work_root: PathBuf,
}

impl Default for LocalBackend {
    fn default() -> Self {
        Self {
            work_root: std::env::temp_dir().join("braid-work"),
        }
    }
}

impl LocalBackend {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Root directory for per-unit command working directories.
    #[must_use]
    pub fn with_work_root(root: impl Into<PathBuf>) -> Self {
        Self {
            work_root: root.into(),
        }
    }

    async fn run_command(
        &self,
        unit: &WorkUnit,
        template: &CommandTemplate,
        env: &EnvSpec,
    ) -> Result<Bindings, WorkerFailure> {
        let unit_dir = self.work_root.join(sanitize(&unit.unit.to_string()));
        tokio::fs::create_dir_all(&unit_dir).await?;

        let output_paths = template.resolve_output_paths(&unit.inputs, &unit_dir);
        let argv = template.render(&unit.inputs, &output_paths);

        let output = Command::new(&template.program)
            .args(&argv)
            .envs(&env.vars)
            .current_dir(&unit_dir)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| {
                if e.kind() == ErrorKind::NotFound {
                    WorkerFailure::EnvUnavailable(format!(
                        "command `{}` not found",
                        template.program
                    ))
                } else {
                    WorkerFailure::Io(e.to_string())
                }
            })?;

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
        if !output.status.success() {
            return Err(WorkerFailure::Command {
                status: output.status.code().unwrap_or(-1),
                stdout,
                stderr,
            });
        }

        let mut outputs = Bindings::default();
        for spec in &unit.task.outputs {
            if template.stdout_output.as_deref() == Some(spec.name.as_str()) {
                outputs.insert(spec.name.clone(), Value::String(stdout.clone()));
            } else if let Some(path) = output_paths.get(&spec.name) {
                outputs.insert(spec.name.clone(), Value::String(path.clone()));
            }
        }
        Ok(outputs)
    }
}

#[async_trait]
impl WorkerBackend for LocalBackend {
    async fn submit(&self, unit: &WorkUnit, env: &EnvSpec) -> Result<Bindings, WorkerFailure> {
        match &unit.task.kind {
            TaskKind::Function(f) => {
                let f = Arc::clone(f);
                let inputs = unit.inputs.clone();
                tokio::task::spawn_blocking(move || f(&inputs))
                    .await
                    .map_err(|e| WorkerFailure::task(format!("task aborted: {e}")))?
            }
            TaskKind::Command(template) => self.run_command(unit, template, env).await,
            // The scheduler expands these itself; reaching a backend with
            // one is a wiring bug upstream.
            TaskKind::Workflow(_) => Err(WorkerFailure::task(
                "nested workflows are expanded by the scheduler",
            )),
        }
    }
}

fn sanitize(raw: &str) -> String {
    raw.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect()
}
