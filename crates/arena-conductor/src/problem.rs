use crate::error::ConductorError;
use crate::fault::{FaultGuard, FaultInjector};
use crate::oracle::Oracle;
use crate::stage::Stage;
use anyhow::{anyhow, Result};
use serde::Serialize;
use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::thread;

/// Deployment handle for the application under test.
pub trait Application: Send + Sync {
    fn name(&self) -> &str;
    fn namespace(&self) -> &str;
    fn deploy(&self) -> Result<()>;
    fn delete(&self) -> Result<()>;
    fn cleanup(&self) -> Result<()>;
}

/// Shared cluster-level dependency provisioned around every run
/// (storage operators, telemetry stacks).
pub trait ClusterPrerequisite: Send + Sync {
    fn name(&self) -> &str;
    fn setup(&self) -> Result<()>;
    fn teardown(&self) -> Result<()>;
}

pub type WorkloadFuture = Pin<Box<dyn Future<Output = Result<()>> + Send + 'static>>;

/// What a problem hands back when asked to start load. Both blocking and
/// asynchronous generators are run in the background and never awaited by
/// the agent loop.
pub enum Workload {
    Idle,
    Blocking(Box<dyn FnOnce() -> Result<()> + Send + 'static>),
    Async(WorkloadFuture),
}

impl Workload {
    pub fn blocking(f: impl FnOnce() -> Result<()> + Send + 'static) -> Self {
        Workload::Blocking(Box::new(f))
    }

    pub fn future(f: impl Future<Output = Result<()>> + Send + 'static) -> Self {
        Workload::Async(Box::pin(f))
    }
}

pub trait WorkloadGenerator: Send + Sync {
    fn start_workload(&self) -> Workload;
}

/// Handle to a dispatched workload.
pub enum WorkloadTask {
    Thread(thread::JoinHandle<Result<()>>),
    Task {
        handle: tokio::task::JoinHandle<Result<()>>,
        runtime: tokio::runtime::Handle,
    },
}

impl WorkloadTask {
    pub fn is_finished(&self) -> bool {
        match self {
            WorkloadTask::Thread(handle) => handle.is_finished(),
            WorkloadTask::Task { handle, .. } => handle.is_finished(),
        }
    }

    /// Waits for the workload and returns its outcome. Must not be called
    /// from inside the runtime.
    pub fn join(self) -> Result<()> {
        match self {
            WorkloadTask::Thread(handle) => handle
                .join()
                .map_err(|_| anyhow!("workload thread panicked"))?,
            WorkloadTask::Task { handle, runtime } => runtime
                .block_on(handle)
                .map_err(|e| anyhow!("workload task failed to complete: {}", e))?,
        }
    }
}

pub fn dispatch_workload(
    workload: Workload,
    runtime: &tokio::runtime::Handle,
) -> Result<Option<WorkloadTask>> {
    match workload {
        Workload::Idle => Ok(None),
        Workload::Blocking(run) => {
            let handle = thread::Builder::new()
                .name("arena-workload".to_string())
                .spawn(run)?;
            Ok(Some(WorkloadTask::Thread(handle)))
        }
        Workload::Async(fut) => Ok(Some(WorkloadTask::Task {
            handle: runtime.spawn(fut),
            runtime: runtime.clone(),
        })),
    }
}

/// One chaos scenario: an application, its fault and the stage oracles.
pub struct Problem {
    id: String,
    description: String,
    app: Arc<dyn Application>,
    faults: Arc<FaultGuard>,
    workload: Option<Box<dyn WorkloadGenerator>>,
    detection_oracle: Option<Box<dyn Oracle>>,
    localization_oracle: Option<Box<dyn Oracle>>,
    mitigation_oracle: Option<Box<dyn Oracle>>,
}

impl Problem {
    pub fn new(
        id: impl Into<String>,
        app: Arc<dyn Application>,
        injector: Arc<dyn FaultInjector>,
    ) -> Self {
        let id = id.into();
        Self {
            faults: Arc::new(FaultGuard::new(id.clone(), injector)),
            id,
            description: String::new(),
            app,
            workload: None,
            detection_oracle: None,
            localization_oracle: None,
            mitigation_oracle: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_workload(mut self, workload: Box<dyn WorkloadGenerator>) -> Self {
        self.workload = Some(workload);
        self
    }

    pub fn with_detection_oracle(mut self, oracle: Box<dyn Oracle>) -> Self {
        self.detection_oracle = Some(oracle);
        self
    }

    pub fn with_localization_oracle(mut self, oracle: Box<dyn Oracle>) -> Self {
        self.localization_oracle = Some(oracle);
        self
    }

    pub fn with_mitigation_oracle(mut self, oracle: Box<dyn Oracle>) -> Self {
        self.mitigation_oracle = Some(oracle);
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn app(&self) -> &Arc<dyn Application> {
        &self.app
    }

    pub fn namespace(&self) -> &str {
        self.app.namespace()
    }

    pub fn faults(&self) -> &Arc<FaultGuard> {
        &self.faults
    }

    pub fn start_workload(&self) -> Workload {
        self.workload
            .as_ref()
            .map(|w| w.start_workload())
            .unwrap_or(Workload::Idle)
    }

    pub fn oracle_for(&self, stage: Stage) -> Option<&dyn Oracle> {
        let slot = match stage {
            Stage::Detection => &self.detection_oracle,
            Stage::Localization => &self.localization_oracle,
            Stage::Mitigation => &self.mitigation_oracle,
            Stage::Done => return None,
        };
        slot.as_deref()
    }
}

pub const SUBMIT_INSTRUCTIONS: &str = "Use submit(...) when ready.";

/// What the agent is told about a freshly initialized problem.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProblemBriefing {
    pub problem_id: String,
    pub description: String,
    pub namespace: String,
    pub instructions: String,
    pub apis: BTreeMap<String, String>,
}

impl ProblemBriefing {
    pub fn for_problem(problem: &Problem) -> Self {
        let mut apis = BTreeMap::new();
        apis.insert("submit(...)".to_string(), "Submit your solution".to_string());
        Self {
            problem_id: problem.id().to_string(),
            description: problem.description().to_string(),
            namespace: problem.namespace().to_string(),
            instructions: SUBMIT_INSTRUCTIONS.to_string(),
            apis,
        }
    }
}

pub type ProblemFactory = Box<dyn Fn() -> Result<Problem> + Send + Sync>;

/// Problems by id. Instances are built fresh on every lookup.
#[derive(Default)]
pub struct ProblemRegistry {
    factories: BTreeMap<String, ProblemFactory>,
}

impl ProblemRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        id: impl Into<String>,
        factory: impl Fn() -> Result<Problem> + Send + Sync + 'static,
    ) {
        self.factories.insert(id.into(), Box::new(factory));
    }

    pub fn problem_ids(&self) -> Vec<String> {
        self.factories.keys().cloned().collect()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.factories.contains_key(id)
    }

    pub fn get_problem_instance(&self, id: &str) -> Result<Problem> {
        let factory = self
            .factories
            .get(id)
            .ok_or_else(|| ConductorError::UnknownProblem(id.to_string()))?;
        factory()
    }
}
