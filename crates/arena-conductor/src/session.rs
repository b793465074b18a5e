use crate::error::SessionError;
use arena_core::{hashchain, SESSION_SCHEMA_VERSION};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    System,
    Assistant,
    Env,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::System => "system",
            Role::Assistant => "assistant",
            Role::Env => "env",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceEntry {
    pub role: Role,
    pub content: String,
}

impl TraceEntry {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }

    fn chain_line(&self) -> String {
        format!("{}:{}", self.role.as_str(), self.content)
    }
}

#[derive(Debug, Clone, Copy)]
struct Mark {
    at: DateTime<Utc>,
    instant: Instant,
}

impl Mark {
    fn now() -> Self {
        Self {
            at: Utc::now(),
            instant: Instant::now(),
        }
    }
}

/// Serialized form of a finalized session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRecord {
    pub schema_version: String,
    pub session_id: String,
    pub problem_id: String,
    pub agent: String,
    pub started_at: Option<String>,
    pub ended_at: Option<String>,
    pub duration_secs: f64,
    pub history: Vec<TraceEntry>,
    pub results: BTreeMap<String, Value>,
    pub solution: Option<Value>,
    pub trace_head: Option<String>,
}

/// Trace, timing and results of one problem attempt. A session is never
/// reused across problems.
#[derive(Debug)]
pub struct Session {
    session_id: String,
    problem_id: Option<String>,
    agent_name: Option<String>,
    history: Vec<TraceEntry>,
    started: Option<Mark>,
    ended: Option<Mark>,
    results: BTreeMap<String, Value>,
    solution: Option<Value>,
    trace_head: Option<String>,
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

impl Session {
    pub fn new() -> Self {
        Self {
            session_id: uuid::Uuid::now_v7().to_string(),
            problem_id: None,
            agent_name: None,
            history: Vec::new(),
            started: None,
            ended: None,
            results: BTreeMap::new(),
            solution: None,
            trace_head: None,
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn problem_id(&self) -> Option<&str> {
        self.problem_id.as_deref()
    }

    pub fn agent_name(&self) -> Option<&str> {
        self.agent_name.as_deref()
    }

    pub fn history(&self) -> &[TraceEntry] {
        &self.history
    }

    pub fn results(&self) -> &BTreeMap<String, Value> {
        &self.results
    }

    pub fn solution(&self) -> Option<&Value> {
        self.solution.as_ref()
    }

    pub fn trace_head(&self) -> Option<&str> {
        self.trace_head.as_deref()
    }

    pub fn is_started(&self) -> bool {
        self.started.is_some()
    }

    pub fn is_ended(&self) -> bool {
        self.ended.is_some()
    }

    pub fn start(&mut self) -> Result<(), SessionError> {
        if self.started.is_some() {
            return Err(SessionError::AlreadyStarted(self.session_id.clone()));
        }
        self.started = Some(Mark::now());
        Ok(())
    }

    pub fn end(&mut self) -> Result<(), SessionError> {
        if self.started.is_none() {
            return Err(SessionError::NotStarted(self.session_id.clone()));
        }
        if self.ended.is_some() {
            return Err(SessionError::AlreadyEnded(self.session_id.clone()));
        }
        self.ended = Some(Mark::now());
        Ok(())
    }

    pub fn add(&mut self, entry: TraceEntry) {
        let head = hashchain(self.trace_head.as_deref(), &entry.chain_line());
        self.trace_head = Some(head);
        self.history.push(entry);
    }

    /// Last write wins.
    pub fn add_result(&mut self, key: impl Into<String>, value: Value) {
        self.results.insert(key.into(), value);
    }

    /// Records `value` only if `key` is still unset. Returns whether it was
    /// written.
    pub fn add_result_once(&mut self, key: &str, value: Value) -> bool {
        if self.results.contains_key(key) {
            return false;
        }
        self.results.insert(key.to_string(), value);
        true
    }

    pub fn set_problem(&mut self, problem_id: impl Into<String>) {
        self.problem_id = Some(problem_id.into());
    }

    pub fn set_agent(&mut self, agent_name: impl Into<String>) {
        self.agent_name = Some(agent_name.into());
    }

    pub fn set_solution(&mut self, solution: Option<Value>) {
        self.solution = solution;
    }

    /// Elapsed time since `start()`. Zero before start, frozen after `end()`.
    pub fn get_duration(&self) -> Duration {
        match (self.started, self.ended) {
            (Some(start), Some(end)) => end.instant.saturating_duration_since(start.instant),
            (Some(start), None) => start.instant.elapsed(),
            (None, _) => Duration::ZERO,
        }
    }

    pub fn to_record(&self) -> SessionRecord {
        SessionRecord {
            schema_version: SESSION_SCHEMA_VERSION.to_string(),
            session_id: self.session_id.clone(),
            problem_id: self.problem_id.clone().unwrap_or_default(),
            agent: self.agent_name.clone().unwrap_or_default(),
            started_at: self.started.map(|m| m.at.to_rfc3339()),
            ended_at: self.ended.map(|m| m.at.to_rfc3339()),
            duration_secs: self.get_duration().as_secs_f64(),
            history: self.history.clone(),
            results: self.results.clone(),
            solution: self.solution.clone(),
            trace_head: self.trace_head.clone(),
        }
    }
}
