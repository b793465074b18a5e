use crate::command::{build_command, ARENA_NAMESPACE_ENV, ARENA_PROBLEM_ID_ENV};
use crate::problem::ProblemBriefing;
use anyhow::{anyhow, Context, Result};
use std::collections::VecDeque;
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::Path;
use std::process::Stdio;
use tracing::debug;

pub const ARENA_BRIEFING_ENV: &str = "ARENA_BRIEFING";

/// The decision-maker under evaluation. Receives the latest environment
/// message and answers with free text that should contain a call.
pub trait Agent: Send {
    fn name(&self) -> &str;

    fn init_context(&mut self, _briefing: &ProblemBriefing) -> Result<()> {
        Ok(())
    }

    fn get_action(&mut self, input: &str) -> Result<String>;
}

/// Replays a fixed list of actions, one per turn.
#[derive(Debug, Clone)]
pub struct ScriptedAgent {
    name: String,
    actions: VecDeque<String>,
}

impl ScriptedAgent {
    pub fn new<I, S>(actions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            name: "scripted".to_string(),
            actions: actions.into_iter().map(Into::into).collect(),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Loads a YAML or JSON list of action strings.
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read script {}", path.display()))?;
        let actions: Vec<String> = serde_yaml::from_str(&raw)
            .with_context(|| format!("script {} must be a list of strings", path.display()))?;
        Ok(Self::new(actions))
    }

    pub fn remaining(&self) -> usize {
        self.actions.len()
    }
}

impl Agent for ScriptedAgent {
    fn name(&self) -> &str {
        &self.name
    }

    fn get_action(&mut self, _input: &str) -> Result<String> {
        self.actions
            .pop_front()
            .ok_or_else(|| anyhow!("scripted agent {} has no actions left", self.name))
    }
}

/// Runs an external command once per turn: the environment message goes to
/// stdin and stdout is taken as the action. The briefing is exported as JSON
/// in `ARENA_BRIEFING`.
#[derive(Debug, Clone)]
pub struct CommandAgent {
    name: String,
    argv: Vec<String>,
    briefing: Option<ProblemBriefing>,
}

impl CommandAgent {
    pub fn new(argv: Vec<String>) -> Result<Self> {
        let name = argv
            .first()
            .and_then(|program| Path::new(program).file_name())
            .map(|name| name.to_string_lossy().to_string())
            .ok_or_else(|| anyhow!("agent command must not be empty"))?;
        Ok(Self {
            name,
            argv,
            briefing: None,
        })
    }
}

impl Agent for CommandAgent {
    fn name(&self) -> &str {
        &self.name
    }

    fn init_context(&mut self, briefing: &ProblemBriefing) -> Result<()> {
        self.briefing = Some(briefing.clone());
        Ok(())
    }

    fn get_action(&mut self, input: &str) -> Result<String> {
        let mut cmd = build_command(&self.argv)?;
        if let Some(briefing) = &self.briefing {
            cmd.env(ARENA_BRIEFING_ENV, serde_json::to_string(briefing)?);
            cmd.env(ARENA_PROBLEM_ID_ENV, &briefing.problem_id);
            cmd.env(ARENA_NAMESPACE_ENV, &briefing.namespace);
        }
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        let mut child = cmd
            .spawn()
            .with_context(|| format!("failed to spawn agent {}", self.name))?;
        // stdin is closed at the end of this block so the child sees EOF.
        let written = match child.stdin.take() {
            Some(mut stdin) => stdin.write_all(input.as_bytes()),
            None => Ok(()),
        };
        let out = child.wait_with_output()?;
        match written {
            Err(err) if err.kind() == ErrorKind::BrokenPipe => {
                debug!(agent = %self.name, "agent exited before reading its input");
            }
            Err(err) => {
                return Err(anyhow!("failed to write to agent {}: {}", self.name, err));
            }
            Ok(()) => {}
        }
        if !out.status.success() {
            let stderr = String::from_utf8_lossy(&out.stderr).trim().to_string();
            return Err(anyhow!(
                "agent {} exited with {}: {}",
                self.name,
                out.status,
                stderr
            ));
        }
        let action = String::from_utf8_lossy(&out.stdout).to_string();
        debug!(agent = %self.name, bytes = action.len(), "agent responded");
        Ok(action)
    }
}
