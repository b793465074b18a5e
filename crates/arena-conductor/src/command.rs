use crate::fault::FaultInjector;
use crate::oracle::StateProbe;
use crate::problem::{Application, ClusterPrerequisite, Workload, WorkloadGenerator};
use anyhow::{anyhow, Result};
use std::process::{Command, Output, Stdio};
use std::thread;
use std::time::{Duration, Instant};
use tracing::debug;

pub const ARENA_NAMESPACE_ENV: &str = "ARENA_NAMESPACE";
pub const ARENA_PROBLEM_ID_ENV: &str = "ARENA_PROBLEM_ID";

const PROBE_WAIT_STEP: Duration = Duration::from_millis(10);

pub(crate) fn build_command(argv: &[String]) -> Result<Command> {
    let (program, args) = argv
        .split_first()
        .ok_or_else(|| anyhow!("command argv must not be empty"))?;
    let mut cmd = Command::new(program);
    cmd.args(args);
    Ok(cmd)
}

/// Runs `cmd` and turns a non-zero exit into an error naming `step` and the
/// most useful stream.
pub fn run_checked_command(mut cmd: Command, step: &str) -> Result<Output> {
    let out = cmd
        .output()
        .map_err(|e| anyhow!("{}: failed to spawn: {}", step, e))?;
    if out.status.success() {
        return Ok(out);
    }
    let stderr = String::from_utf8_lossy(&out.stderr).trim().to_string();
    let stdout = String::from_utf8_lossy(&out.stdout).trim().to_string();
    let detail = if !stderr.is_empty() {
        stderr
    } else if !stdout.is_empty() {
        stdout
    } else {
        "command exited non-zero".to_string()
    };
    Err(anyhow!("{}: {}", step, detail))
}

fn run_argv(argv: &[String], step: &str, env: &[(&str, &str)]) -> Result<Output> {
    let mut cmd = build_command(argv)?;
    for (key, value) in env {
        cmd.env(key, value);
    }
    debug!(step, argv = ?argv, "running command");
    run_checked_command(cmd, step)
}

#[derive(Debug, Clone)]
pub struct CommandApplication {
    name: String,
    namespace: String,
    deploy: Option<Vec<String>>,
    delete: Option<Vec<String>>,
    cleanup: Option<Vec<String>>,
}

impl CommandApplication {
    /// Lifecycle steps without a command are no-ops.
    pub fn new(
        name: impl Into<String>,
        namespace: impl Into<String>,
        deploy: Option<Vec<String>>,
        delete: Option<Vec<String>>,
        cleanup: Option<Vec<String>>,
    ) -> Self {
        Self {
            name: name.into(),
            namespace: namespace.into(),
            deploy,
            delete,
            cleanup,
        }
    }

    fn run(&self, argv: Option<&Vec<String>>, step: &str) -> Result<()> {
        let Some(argv) = argv else {
            return Ok(());
        };
        run_argv(
            argv,
            &format!("{} {}", self.name, step),
            &[(ARENA_NAMESPACE_ENV, self.namespace.as_str())],
        )?;
        Ok(())
    }
}

impl Application for CommandApplication {
    fn name(&self) -> &str {
        &self.name
    }

    fn namespace(&self) -> &str {
        &self.namespace
    }

    fn deploy(&self) -> Result<()> {
        self.run(self.deploy.as_ref(), "deploy")
    }

    fn delete(&self) -> Result<()> {
        self.run(self.delete.as_ref(), "delete")
    }

    fn cleanup(&self) -> Result<()> {
        self.run(self.cleanup.as_ref(), "cleanup")
    }
}

#[derive(Debug, Clone)]
pub struct CommandFaultInjector {
    problem_id: String,
    namespace: String,
    inject: Vec<String>,
    recover: Vec<String>,
}

impl CommandFaultInjector {
    pub fn new(
        problem_id: impl Into<String>,
        namespace: impl Into<String>,
        inject: Vec<String>,
        recover: Vec<String>,
    ) -> Self {
        Self {
            problem_id: problem_id.into(),
            namespace: namespace.into(),
            inject,
            recover,
        }
    }

    fn env(&self) -> [(&str, &str); 2] {
        [
            (ARENA_NAMESPACE_ENV, self.namespace.as_str()),
            (ARENA_PROBLEM_ID_ENV, self.problem_id.as_str()),
        ]
    }
}

impl FaultInjector for CommandFaultInjector {
    fn inject_fault(&self) -> Result<()> {
        run_argv(&self.inject, "fault inject", &self.env())?;
        Ok(())
    }

    fn recover_fault(&self) -> Result<()> {
        run_argv(&self.recover, "fault recover", &self.env())?;
        Ok(())
    }
}

/// Load generator backed by a long-running command. The command runs on a
/// background thread; its exit status is the workload outcome.
#[derive(Debug, Clone)]
pub struct CommandWorkload {
    namespace: String,
    argv: Vec<String>,
}

impl CommandWorkload {
    pub fn new(namespace: impl Into<String>, argv: Vec<String>) -> Self {
        Self {
            namespace: namespace.into(),
            argv,
        }
    }
}

impl WorkloadGenerator for CommandWorkload {
    fn start_workload(&self) -> Workload {
        let argv = self.argv.clone();
        let namespace = self.namespace.clone();
        Workload::blocking(move || {
            run_argv(&argv, "workload", &[(ARENA_NAMESPACE_ENV, namespace.as_str())])?;
            Ok(())
        })
    }
}

/// Probe that holds when its command exits zero. A command that cannot be
/// spawned is an error, not a failed check.
#[derive(Debug, Clone)]
pub struct CommandProbe {
    name: String,
    namespace: String,
    argv: Vec<String>,
}

impl CommandProbe {
    pub fn new(name: impl Into<String>, namespace: impl Into<String>, argv: Vec<String>) -> Self {
        Self {
            name: name.into(),
            namespace: namespace.into(),
            argv,
        }
    }
}

impl StateProbe for CommandProbe {
    fn name(&self) -> &str {
        &self.name
    }

    fn check(&self) -> Result<bool> {
        let mut cmd = build_command(&self.argv)?;
        cmd.env(ARENA_NAMESPACE_ENV, &self.namespace);
        let out = cmd
            .output()
            .map_err(|e| anyhow!("probe {}: failed to spawn: {}", self.name, e))?;
        debug!(probe = %self.name, status = ?out.status.code(), "probe checked");
        Ok(out.status.success())
    }

    fn check_within(&self, budget: Duration) -> Result<bool> {
        let deadline = Instant::now() + budget;
        let mut cmd = build_command(&self.argv)?;
        cmd.env(ARENA_NAMESPACE_ENV, &self.namespace);
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::null());
        cmd.stderr(Stdio::null());
        let mut child = cmd
            .spawn()
            .map_err(|e| anyhow!("probe {}: failed to spawn: {}", self.name, e))?;
        loop {
            if let Some(status) = child.try_wait()? {
                debug!(probe = %self.name, status = ?status.code(), "probe checked");
                return Ok(status.success());
            }
            let now = Instant::now();
            if now >= deadline {
                let _ = child.kill();
                let _ = child.wait();
                return Err(anyhow!(
                    "probe {}: no answer within {:?}",
                    self.name,
                    budget
                ));
            }
            thread::sleep(PROBE_WAIT_STEP.min(deadline - now));
        }
    }
}

#[derive(Debug, Clone)]
pub struct CommandPrerequisite {
    name: String,
    setup: Vec<String>,
    teardown: Option<Vec<String>>,
}

impl CommandPrerequisite {
    pub fn new(name: impl Into<String>, setup: Vec<String>, teardown: Option<Vec<String>>) -> Self {
        Self {
            name: name.into(),
            setup,
            teardown,
        }
    }
}

impl ClusterPrerequisite for CommandPrerequisite {
    fn name(&self) -> &str {
        &self.name
    }

    fn setup(&self) -> Result<()> {
        run_argv(&self.setup, &format!("{} setup", self.name), &[])?;
        Ok(())
    }

    fn teardown(&self) -> Result<()> {
        match &self.teardown {
            Some(argv) => {
                run_argv(argv, &format!("{} teardown", self.name), &[])?;
                Ok(())
            }
            None => Ok(()),
        }
    }
}
