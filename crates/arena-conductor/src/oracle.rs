use crate::session::TraceEntry;
use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info};

pub const TIME_TO_DETECT: &str = "TTD";
pub const TIME_TO_LOCALIZE: &str = "TTL";
pub const TIME_TO_ANALYZE: &str = "TTA";
pub const TIME_TO_MITIGATE: &str = "TTM";

/// Timing metrics, in the order the overhead report looks them up.
pub const TIMING_KEYS: [&str; 4] = [
    TIME_TO_DETECT,
    TIME_TO_LOCALIZE,
    TIME_TO_ANALYZE,
    TIME_TO_MITIGATE,
];

/// Outcome of one oracle evaluation. Serializes as a flat object with a
/// mandatory `success` key next to the diagnostic fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OracleResult {
    pub success: bool,
    #[serde(flatten)]
    pub details: BTreeMap<String, Value>,
}

impl OracleResult {
    pub fn new(success: bool) -> Self {
        Self {
            success,
            details: BTreeMap::new(),
        }
    }

    pub fn with(mut self, key: impl Into<String>, value: Value) -> Self {
        self.details.insert(key.into(), value);
        self
    }

    pub fn to_value(&self) -> Value {
        let mut map = serde_json::Map::new();
        map.insert("success".to_string(), Value::Bool(self.success));
        for (k, v) in &self.details {
            if k != "success" {
                map.insert(k.clone(), v.clone());
            }
        }
        Value::Object(map)
    }

    /// First timing metric carried by this result.
    pub fn timing(&self) -> Option<(&'static str, f64)> {
        TIMING_KEYS.iter().find_map(|key| {
            self.details
                .get(*key)
                .and_then(Value::as_f64)
                .map(|secs| (*key, secs))
        })
    }
}

/// Grading contract shared by every oracle variant.
pub trait Oracle: Send {
    fn name(&self) -> &str;

    fn evaluate(
        &self,
        solution: &Value,
        trace: &[TraceEntry],
        duration: Duration,
    ) -> Result<OracleResult>;
}

/// A yes/no check against live environment state.
pub trait StateProbe: Send + Sync {
    fn name(&self) -> &str;
    fn check(&self) -> Result<bool>;

    /// Like [`StateProbe::check`], but gives up with an error once `budget`
    /// has elapsed. Probes that cannot block may keep the default.
    fn check_within(&self, _budget: Duration) -> Result<bool> {
        self.check()
    }
}

fn secs(duration: Duration) -> Value {
    json!(duration.as_secs_f64())
}

fn normalize(text: &str) -> String {
    text.trim().to_lowercase()
}

pub struct DetectionOracle {
    expected: String,
}

impl DetectionOracle {
    pub fn new(expected: impl Into<String>) -> Self {
        Self {
            expected: expected.into(),
        }
    }
}

impl Default for DetectionOracle {
    fn default() -> Self {
        Self::new("Yes")
    }
}

impl Oracle for DetectionOracle {
    fn name(&self) -> &str {
        "detection"
    }

    fn evaluate(
        &self,
        solution: &Value,
        _trace: &[TraceEntry],
        duration: Duration,
    ) -> Result<OracleResult> {
        let (success, accuracy) = match solution.as_str() {
            Some(answer) if normalize(answer) == normalize(&self.expected) => (true, "Correct"),
            Some(_) => (false, "Incorrect"),
            None => (false, "Invalid Format"),
        };
        info!(oracle = "detection", accuracy, "detection evaluated");
        Ok(OracleResult::new(success)
            .with("Detection Accuracy", json!(accuracy))
            .with(TIME_TO_DETECT, secs(duration)))
    }
}

pub struct LocalizationOracle {
    expected: Vec<String>,
}

impl LocalizationOracle {
    pub fn new<I, S>(expected: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            expected: expected.into_iter().map(Into::into).collect(),
        }
    }

    fn submitted_targets(solution: &Value) -> Option<BTreeSet<String>> {
        match solution {
            Value::String(s) => Some(std::iter::once(normalize(s)).collect()),
            Value::Array(items) => items
                .iter()
                .map(|v| v.as_str().map(normalize))
                .collect::<Option<BTreeSet<String>>>(),
            _ => None,
        }
    }
}

impl Oracle for LocalizationOracle {
    fn name(&self) -> &str {
        "localization"
    }

    /// Succeeds when every expected target is among the submitted ones,
    /// compared case-insensitively. Extra targets are reported but allowed.
    fn evaluate(
        &self,
        solution: &Value,
        _trace: &[TraceEntry],
        duration: Duration,
    ) -> Result<OracleResult> {
        let Some(submitted) = Self::submitted_targets(solution) else {
            return Ok(OracleResult::new(false)
                .with("Localization Accuracy", json!("Invalid Format"))
                .with(TIME_TO_LOCALIZE, secs(duration)));
        };
        let expected: BTreeSet<String> = self.expected.iter().map(|s| normalize(s)).collect();
        let matched: Vec<&String> = expected.intersection(&submitted).collect();
        let missing: Vec<&String> = expected.difference(&submitted).collect();
        let unexpected: Vec<&String> = submitted.difference(&expected).collect();
        let accuracy = if expected.is_empty() {
            0.0
        } else {
            matched.len() as f64 / expected.len() as f64 * 100.0
        };
        let success = !expected.is_empty() && missing.is_empty();
        info!(oracle = "localization", success, accuracy, "localization evaluated");
        Ok(OracleResult::new(success)
            .with("Localization Accuracy", json!(accuracy))
            .with("matched", json!(matched))
            .with("missing", json!(missing))
            .with("unexpected", json!(unexpected))
            .with(TIME_TO_LOCALIZE, secs(duration)))
    }
}

/// One-shot mitigation check: every probe must hold at evaluation time.
pub struct MitigationOracle {
    probes: Vec<Box<dyn StateProbe>>,
}

impl MitigationOracle {
    pub fn new(probes: Vec<Box<dyn StateProbe>>) -> Self {
        Self { probes }
    }
}

impl Oracle for MitigationOracle {
    fn name(&self) -> &str {
        "mitigation"
    }

    fn evaluate(
        &self,
        _solution: &Value,
        _trace: &[TraceEntry],
        duration: Duration,
    ) -> Result<OracleResult> {
        let mut checks = serde_json::Map::new();
        let mut success = true;
        for probe in &self.probes {
            let held = probe
                .check()
                .with_context(|| format!("mitigation probe {} failed", probe.name()))?;
            success &= held;
            checks.insert(probe.name().to_string(), Value::Bool(held));
        }
        info!(oracle = "mitigation", success, "mitigation evaluated");
        Ok(OracleResult::new(success)
            .with("checks", Value::Object(checks))
            .with(TIME_TO_MITIGATE, secs(duration)))
    }
}

/// Polls a probe at a fixed interval until it holds or the timeout elapses.
/// Probe errors count as "not yet" and are reported in the result.
pub struct StatePollingOracle {
    name: String,
    probe: Box<dyn StateProbe>,
    interval: Duration,
    timeout: Duration,
    timing_key: Option<&'static str>,
}

impl StatePollingOracle {
    pub fn new(probe: Box<dyn StateProbe>, interval: Duration, timeout: Duration) -> Self {
        Self {
            name: format!("poll:{}", probe.name()),
            probe,
            interval,
            timeout,
            timing_key: None,
        }
    }

    pub fn with_timing_key(mut self, key: &'static str) -> Self {
        self.timing_key = Some(key);
        self
    }
}

impl Oracle for StatePollingOracle {
    fn name(&self) -> &str {
        &self.name
    }

    fn evaluate(
        &self,
        _solution: &Value,
        _trace: &[TraceEntry],
        duration: Duration,
    ) -> Result<OracleResult> {
        let started = Instant::now();
        let deadline = started + self.timeout;
        let mut attempts = 0u64;
        let mut last_error: Option<String> = None;
        let success = loop {
            attempts += 1;
            match self
                .probe
                .check_within(deadline.saturating_duration_since(Instant::now()))
            {
                Ok(true) => break true,
                Ok(false) => {}
                Err(err) => {
                    debug!(probe = self.probe.name(), error = %err, "probe check failed");
                    last_error = Some(err.to_string());
                }
            }
            let now = Instant::now();
            if now >= deadline {
                break false;
            }
            thread::sleep(self.interval.min(deadline - now));
        };
        let waited = started.elapsed();
        if success {
            info!(probe = self.probe.name(), attempts, "condition observed");
        } else {
            info!(
                probe = self.probe.name(),
                timeout_secs = self.timeout.as_secs_f64(),
                "condition not observed before deadline"
            );
        }
        let mut result = OracleResult::new(success)
            .with("attempts", json!(attempts))
            .with("waited_secs", secs(waited))
            .with("timed_out", json!(!success));
        if let Some(err) = last_error {
            result = result.with("last_error", json!(err));
        }
        if let Some(key) = self.timing_key {
            result = result.with(key, secs(duration + waited));
        }
        Ok(result)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompositionMode {
    All,
    Any,
}

/// Composes child oracles behind the same contract. Every child is
/// evaluated so the result carries all diagnostics.
pub struct CompoundOracle {
    name: String,
    mode: CompositionMode,
    children: Vec<Box<dyn Oracle>>,
}

impl CompoundOracle {
    pub fn new(mode: CompositionMode, children: Vec<Box<dyn Oracle>>) -> Self {
        let names: Vec<&str> = children.iter().map(|c| c.name()).collect();
        Self {
            name: format!("compound({})", names.join(",")),
            mode,
            children,
        }
    }

    pub fn all(children: Vec<Box<dyn Oracle>>) -> Self {
        Self::new(CompositionMode::All, children)
    }
}

impl Oracle for CompoundOracle {
    fn name(&self) -> &str {
        &self.name
    }

    fn evaluate(
        &self,
        solution: &Value,
        trace: &[TraceEntry],
        duration: Duration,
    ) -> Result<OracleResult> {
        let mut outcomes = Vec::with_capacity(self.children.len());
        let mut breakdown = serde_json::Map::new();
        let mut timing = None;
        for (idx, child) in self.children.iter().enumerate() {
            let result = child.evaluate(solution, trace, duration)?;
            if timing.is_none() {
                timing = result.timing();
            }
            outcomes.push(result.success);
            breakdown.insert(format!("{}:{}", idx, child.name()), result.to_value());
        }
        let success = match self.mode {
            CompositionMode::All => !outcomes.is_empty() && outcomes.iter().all(|ok| *ok),
            CompositionMode::Any => outcomes.iter().any(|ok| *ok),
        };
        let mut result = OracleResult::new(success)
            .with("mode", json!(self.mode))
            .with("oracles", Value::Object(breakdown));
        if let Some((key, value)) = timing {
            result = result.with(key, json!(value));
        }
        Ok(result)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct JudgeRequest<'a> {
    pub expected: &'a str,
    pub submission: String,
    pub trace: &'a [TraceEntry],
}

#[derive(Debug, Clone, Deserialize)]
pub struct JudgeVerdict {
    pub correct: bool,
    #[serde(default)]
    pub reasoning: Option<String>,
}

/// Model-backed grader for free-form answers.
pub trait Judge: Send + Sync {
    fn judge(&self, request: &JudgeRequest<'_>) -> Result<JudgeVerdict>;
}

pub struct LlmJudgeOracle {
    expected: String,
    judge: Box<dyn Judge>,
}

impl LlmJudgeOracle {
    pub fn new(expected: impl Into<String>, judge: Box<dyn Judge>) -> Self {
        Self {
            expected: expected.into(),
            judge,
        }
    }
}

impl Oracle for LlmJudgeOracle {
    fn name(&self) -> &str {
        "llm_judge"
    }

    fn evaluate(
        &self,
        solution: &Value,
        trace: &[TraceEntry],
        duration: Duration,
    ) -> Result<OracleResult> {
        let submission = match solution {
            Value::String(s) => s.clone(),
            Value::Null => String::new(),
            other => other.to_string(),
        };
        let verdict = self.judge.judge(&JudgeRequest {
            expected: &self.expected,
            submission,
            trace,
        })?;
        info!(oracle = "llm_judge", correct = verdict.correct, "judge verdict");
        let mut result = OracleResult::new(verdict.correct).with(TIME_TO_ANALYZE, secs(duration));
        if let Some(reasoning) = verdict.reasoning {
            result = result.with("judgment", json!(reasoning));
        }
        Ok(result)
    }
}

/// Judge served over HTTP: POSTs the request as JSON and expects a
/// `{"correct": bool, "reasoning": string?}` body.
pub struct HttpJudge {
    endpoint: String,
    model: Option<String>,
    client: reqwest::blocking::Client,
}

impl HttpJudge {
    pub fn new(endpoint: impl Into<String>, model: Option<String>) -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(120))
            .build()?;
        Ok(Self {
            endpoint: endpoint.into(),
            model,
            client,
        })
    }
}

impl Judge for HttpJudge {
    fn judge(&self, request: &JudgeRequest<'_>) -> Result<JudgeVerdict> {
        let body = json!({
            "model": self.model,
            "expected": request.expected,
            "submission": request.submission,
            "trace": request.trace,
        });
        let response = self
            .client
            .post(&self.endpoint)
            .json(&body)
            .send()
            .with_context(|| format!("judge request to {} failed", self.endpoint))?;
        let status = response.status();
        if !status.is_success() {
            return Err(anyhow!("judge at {} returned {}", self.endpoint, status));
        }
        Ok(response.json::<JudgeVerdict>()?)
    }
}
