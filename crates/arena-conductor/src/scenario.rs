use crate::command::{
    CommandApplication, CommandFaultInjector, CommandPrerequisite, CommandProbe, CommandWorkload,
};
use crate::oracle::{
    CompositionMode, CompoundOracle, DetectionOracle, HttpJudge, LlmJudgeOracle,
    LocalizationOracle, MitigationOracle, Oracle, StatePollingOracle, StateProbe, TIME_TO_DETECT,
    TIME_TO_LOCALIZE, TIME_TO_MITIGATE,
};
use crate::problem::{ClusterPrerequisite, Problem, ProblemRegistry};
use crate::stage::Stage;
use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

const DEFAULT_POLL_INTERVAL_MS: u64 = 1_000;
const DEFAULT_POLL_TIMEOUT_MS: u64 = 60_000;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScenarioFile {
    pub schema_version: String,
    pub id: String,
    #[serde(default)]
    pub description: String,
    pub application: ApplicationSpec,
    pub fault: FaultSpec,
    #[serde(default)]
    pub workload: Option<WorkloadSpec>,
    pub oracles: OracleSet,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationSpec {
    pub name: String,
    pub namespace: String,
    #[serde(default)]
    pub deploy: Option<Vec<String>>,
    #[serde(default)]
    pub delete: Option<Vec<String>>,
    #[serde(default)]
    pub cleanup: Option<Vec<String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FaultSpec {
    pub inject: Vec<String>,
    pub recover: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkloadSpec {
    pub command: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OracleSet {
    #[serde(default)]
    pub detection: Option<OracleSpec>,
    #[serde(default)]
    pub localization: Option<OracleSpec>,
    #[serde(default)]
    pub mitigation: Option<OracleSpec>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OracleKind {
    Detection,
    Localization,
    Mitigation,
    Poll,
    Compound,
    LlmJudge,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbeSpec {
    #[serde(default)]
    pub name: Option<String>,
    pub command: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OracleSpec {
    pub kind: OracleKind,
    #[serde(default)]
    pub expected: Option<Value>,
    #[serde(default)]
    pub probes: Vec<ProbeSpec>,
    #[serde(default)]
    pub probe: Option<ProbeSpec>,
    #[serde(default)]
    pub interval_ms: Option<u64>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub mode: Option<CompositionMode>,
    #[serde(default)]
    pub oracles: Vec<OracleSpec>,
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrerequisiteSpec {
    pub name: String,
    pub setup: Vec<String>,
    #[serde(default)]
    pub teardown: Option<Vec<String>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClusterFile {
    #[serde(default)]
    pub prerequisites: Vec<PrerequisiteSpec>,
}

fn read_document(path: &Path) -> Result<Value> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    let is_json = path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.eq_ignore_ascii_case("json"))
        .unwrap_or(false);
    if is_json {
        Ok(serde_json::from_str(&raw)
            .with_context(|| format!("{} is not valid JSON", path.display()))?)
    } else {
        Ok(serde_yaml::from_str(&raw)
            .with_context(|| format!("{} is not valid YAML", path.display()))?)
    }
}

pub fn parse_scenario_value(value: Value) -> Result<ScenarioFile> {
    arena_schemas::validate_value(arena_schemas::SCENARIO_SCHEMA, &value)?;
    Ok(serde_json::from_value(value)?)
}

/// Reads a YAML or JSON scenario and validates it before use.
pub fn load_scenario(path: &Path) -> Result<ScenarioFile> {
    let value = read_document(path)?;
    parse_scenario_value(value)
        .with_context(|| format!("invalid scenario {}", path.display()))
}

fn is_scenario_path(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|ext| ext.to_str()),
        Some("yaml") | Some("yml") | Some("json")
    )
}

/// Every scenario file directly under `dir`, sorted by path.
pub fn load_scenarios_dir(dir: &Path) -> Result<Vec<(PathBuf, ScenarioFile)>> {
    let mut paths = Vec::new();
    for entry in fs::read_dir(dir).with_context(|| format!("failed to read {}", dir.display()))? {
        let path = entry?.path();
        if path.is_file() && is_scenario_path(&path) {
            paths.push(path);
        }
    }
    paths.sort();
    paths
        .into_iter()
        .map(|path| load_scenario(&path).map(|scenario| (path, scenario)))
        .collect()
}

pub fn load_cluster(path: &Path) -> Result<Vec<Box<dyn ClusterPrerequisite>>> {
    let value = read_document(path)?;
    let cluster: ClusterFile = serde_json::from_value(value)
        .with_context(|| format!("invalid cluster file {}", path.display()))?;
    cluster
        .prerequisites
        .into_iter()
        .map(|spec| {
            if spec.setup.is_empty() {
                return Err(anyhow!("prerequisite {} has an empty setup command", spec.name));
            }
            Ok(Box::new(CommandPrerequisite::new(spec.name, spec.setup, spec.teardown))
                as Box<dyn ClusterPrerequisite>)
        })
        .collect()
}

fn stage_timing_key(stage: Stage) -> Option<&'static str> {
    match stage {
        Stage::Detection => Some(TIME_TO_DETECT),
        Stage::Localization => Some(TIME_TO_LOCALIZE),
        Stage::Mitigation => Some(TIME_TO_MITIGATE),
        Stage::Done => None,
    }
}

fn build_probe(spec: &ProbeSpec, namespace: &str, idx: usize) -> Box<dyn StateProbe> {
    let name = spec
        .name
        .clone()
        .unwrap_or_else(|| format!("probe_{}", idx));
    Box::new(CommandProbe::new(name, namespace, spec.command.clone()))
}

fn expected_text(spec: &OracleSpec) -> Result<Option<String>> {
    match &spec.expected {
        None => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.clone())),
        Some(other) => Err(anyhow!(
            "{:?} oracle expects a string answer, got {}",
            spec.kind,
            other
        )),
    }
}

fn build_oracle(spec: &OracleSpec, stage: Stage, namespace: &str) -> Result<Box<dyn Oracle>> {
    let oracle: Box<dyn Oracle> = match spec.kind {
        OracleKind::Detection => match expected_text(spec)? {
            Some(expected) => Box::new(DetectionOracle::new(expected)),
            None => Box::new(DetectionOracle::default()),
        },
        OracleKind::Localization => {
            let targets: Vec<String> = match &spec.expected {
                Some(Value::String(s)) => vec![s.clone()],
                Some(Value::Array(items)) => items
                    .iter()
                    .map(|v| {
                        v.as_str()
                            .map(str::to_string)
                            .ok_or_else(|| anyhow!("localization targets must be strings"))
                    })
                    .collect::<Result<_>>()?,
                _ => return Err(anyhow!("localization oracle requires expected targets")),
            };
            if targets.is_empty() {
                return Err(anyhow!("localization oracle requires expected targets"));
            }
            Box::new(LocalizationOracle::new(targets))
        }
        OracleKind::Mitigation => {
            if spec.probes.is_empty() {
                return Err(anyhow!("mitigation oracle requires at least one probe"));
            }
            let probes = spec
                .probes
                .iter()
                .enumerate()
                .map(|(idx, probe)| build_probe(probe, namespace, idx))
                .collect();
            Box::new(MitigationOracle::new(probes))
        }
        OracleKind::Poll => {
            let probe = spec
                .probe
                .as_ref()
                .ok_or_else(|| anyhow!("poll oracle requires a probe"))?;
            let mut oracle = StatePollingOracle::new(
                build_probe(probe, namespace, 0),
                Duration::from_millis(spec.interval_ms.unwrap_or(DEFAULT_POLL_INTERVAL_MS)),
                Duration::from_millis(spec.timeout_ms.unwrap_or(DEFAULT_POLL_TIMEOUT_MS)),
            );
            if let Some(key) = stage_timing_key(stage) {
                oracle = oracle.with_timing_key(key);
            }
            Box::new(oracle)
        }
        OracleKind::Compound => {
            if spec.oracles.is_empty() {
                return Err(anyhow!("compound oracle requires child oracles"));
            }
            let children = spec
                .oracles
                .iter()
                .map(|child| build_oracle(child, stage, namespace))
                .collect::<Result<Vec<_>>>()?;
            Box::new(CompoundOracle::new(
                spec.mode.unwrap_or(CompositionMode::All),
                children,
            ))
        }
        OracleKind::LlmJudge => {
            let endpoint = spec
                .endpoint
                .clone()
                .ok_or_else(|| anyhow!("llm_judge oracle requires an endpoint"))?;
            let expected = expected_text(spec)?
                .ok_or_else(|| anyhow!("llm_judge oracle requires an expected answer"))?;
            Box::new(LlmJudgeOracle::new(
                expected,
                Box::new(HttpJudge::new(endpoint, spec.model.clone())?),
            ))
        }
    };
    Ok(oracle)
}

impl ScenarioFile {
    pub fn build_problem(&self) -> Result<Problem> {
        let namespace = &self.application.namespace;
        let app = CommandApplication::new(
            self.application.name.clone(),
            namespace.clone(),
            self.application.deploy.clone(),
            self.application.delete.clone(),
            self.application.cleanup.clone(),
        );
        let injector = CommandFaultInjector::new(
            self.id.clone(),
            namespace.clone(),
            self.fault.inject.clone(),
            self.fault.recover.clone(),
        );
        let mut problem = Problem::new(self.id.clone(), Arc::new(app), Arc::new(injector))
            .with_description(self.description.clone());
        if let Some(workload) = &self.workload {
            problem = problem.with_workload(Box::new(CommandWorkload::new(
                namespace.clone(),
                workload.command.clone(),
            )));
        }
        if let Some(spec) = &self.oracles.detection {
            problem = problem.with_detection_oracle(build_oracle(spec, Stage::Detection, namespace)?);
        }
        if let Some(spec) = &self.oracles.localization {
            problem = problem
                .with_localization_oracle(build_oracle(spec, Stage::Localization, namespace)?);
        }
        if let Some(spec) = &self.oracles.mitigation {
            problem = problem
                .with_mitigation_oracle(build_oracle(spec, Stage::Mitigation, namespace)?);
        }
        Ok(problem)
    }

    /// Stages that have an oracle configured.
    pub fn graded_stages(&self) -> Vec<Stage> {
        [
            (Stage::Detection, self.oracles.detection.is_some()),
            (Stage::Localization, self.oracles.localization.is_some()),
            (Stage::Mitigation, self.oracles.mitigation.is_some()),
        ]
        .into_iter()
        .filter_map(|(stage, present)| present.then_some(stage))
        .collect()
    }

    pub fn register(self, registry: &mut ProblemRegistry) {
        let id = self.id.clone();
        registry.register(id, move || self.build_problem());
    }
}
