use crate::agent::Agent;
use crate::config::ConductorConfig;
use crate::error::ConductorError;
use crate::fault::FaultLease;
use crate::interrupt::InterruptGate;
use crate::oracle::{OracleResult, TIMING_KEYS};
use crate::parser::{parse_response, ParseError};
use crate::problem::{
    dispatch_workload, ClusterPrerequisite, Problem, ProblemBriefing, ProblemRegistry,
    WorkloadTask,
};
use crate::session::{Role, Session, TraceEntry};
use crate::sink::{JsonlSessionSink, SessionSink};
use crate::stage::{next_stage, Stage};
use crate::tracker::TrackerClient;
use anyhow::{anyhow, Result};
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::time::Instant;
use tracing::{error, info, warn};

pub const REJECTION_MESSAGE: &str = "[❌] Only `submit(...)` is supported in this interface.";
pub const INITIAL_PROMPT: &str = "Please take the next action";
pub const STEP_LIMIT_KEY: &str = "step_limit_reached";
pub const RUN_ERROR_KEY: &str = "run_error";
pub const RECOVERY_ERROR_KEY: &str = "fault_recovery_error";

const SETUP_PHASE: &str = "setup";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SubmissionStatus {
    ValidSubmission,
    InvalidSubmission,
}

impl fmt::Display for SubmissionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SubmissionStatus::ValidSubmission => f.write_str("Submission received."),
            SubmissionStatus::InvalidSubmission => {
                f.write_str("Invalid submission: submit(...) requires a solution argument.")
            }
        }
    }
}

/// Environment reply to one agent action.
#[derive(Debug, Clone, PartialEq)]
pub enum EnvResponse {
    Rejected,
    ParseError(ParseError),
    Submission(SubmissionStatus),
}

impl EnvResponse {
    pub fn message(&self) -> String {
        match self {
            EnvResponse::Rejected => REJECTION_MESSAGE.to_string(),
            EnvResponse::ParseError(err) => err.to_string(),
            EnvResponse::Submission(status) => status.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub session_id: String,
    pub problem_id: String,
    pub agent: String,
    pub final_stage: Stage,
    pub steps: usize,
    pub step_limit_reached: bool,
    pub history: Vec<TraceEntry>,
    pub results: BTreeMap<String, Value>,
    pub session_duration_secs: f64,
    pub total_elapsed_secs: f64,
    pub timing_key: Option<String>,
    pub framework_overhead_secs: Option<f64>,
    pub trace_head: Option<String>,
    pub session_dir: Option<PathBuf>,
}

impl RunReport {
    pub fn stage_result(&self, stage: Stage) -> Option<&Value> {
        stage.results_key().and_then(|key| self.results.get(key))
    }

    pub fn stage_succeeded(&self, stage: Stage) -> Option<bool> {
        self.stage_result(stage)
            .and_then(|v| v.get("success"))
            .and_then(Value::as_bool)
    }
}

/// State owned by one problem attempt between `init_problem` and the end of
/// `start_problem`.
struct ActiveRun {
    problem: Problem,
    session: Session,
    stage: Stage,
    lease: FaultLease,
    steps: usize,
    step_limit_reached: bool,
    started: Instant,
    // Prerequisites whose setup succeeded, in provisioning order.
    provisioned: usize,
}

impl ActiveRun {
    fn ask_env(&mut self, action: &str) -> Result<EnvResponse> {
        let call = match parse_response(action) {
            Ok(call) => call,
            Err(err) => {
                warn!(problem_id = %self.problem.id(), error = %err, "unparseable action");
                return Ok(EnvResponse::ParseError(err));
            }
        };
        if !call.is_submission() {
            return Ok(EnvResponse::Rejected);
        }
        let Some(solution) = call.args.into_iter().next() else {
            return Ok(EnvResponse::Submission(SubmissionStatus::InvalidSubmission));
        };
        self.grade(solution)?;
        Ok(EnvResponse::Submission(SubmissionStatus::ValidSubmission))
    }

    fn grade(&mut self, solution: Value) -> Result<()> {
        self.session.set_solution(Some(solution.clone()));
        let stage = self.stage;
        let Some(results_key) = stage.results_key() else {
            return Ok(());
        };
        let result = match self.problem.oracle_for(stage) {
            Some(oracle) => oracle.evaluate(
                &solution,
                self.session.history(),
                self.session.get_duration(),
            )?,
            None => {
                warn!(problem_id = %self.problem.id(), stage = %stage, "no oracle configured for stage");
                OracleResult::new(false).with("unsupported", json!(true))
            }
        };
        self.session.add_result(results_key, result.to_value());
        for key in TIMING_KEYS {
            if let Some(value) = result.details.get(key) {
                self.session.add_result_once(key, value.clone());
            }
        }
        let next = next_stage(stage, result.success);
        info!(
            session_id = %self.session.session_id(),
            problem_id = %self.problem.id(),
            from = %stage,
            to = %next,
            success = result.success,
            "stage transition"
        );
        self.stage = next;
        Ok(())
    }

    fn handle_action(&mut self, action: &str) -> Result<EnvResponse> {
        self.session.add(TraceEntry::new(Role::Assistant, action));
        let response = self.ask_env(action)?;
        self.session
            .add(TraceEntry::new(Role::Env, response.message()));
        Ok(response)
    }

    fn drive(&mut self, agent: &mut dyn Agent, max_steps: usize) -> Result<()> {
        let mut input = INITIAL_PROMPT.to_string();
        while !self.stage.is_terminal() {
            if self.steps >= max_steps {
                warn!(
                    problem_id = %self.problem.id(),
                    stage = %self.stage,
                    max_steps,
                    "step limit reached before grading finished"
                );
                self.step_limit_reached = true;
                break;
            }
            let action = agent.get_action(&input)?;
            self.steps += 1;
            input = self.handle_action(&action)?.message();
        }
        Ok(())
    }
}

/// Drives problems end to end: environment bring-up, fault injection, the
/// agent loop with staged grading, then recovery, persistence and teardown.
///
/// Only one problem may be active at a time.
pub struct Orchestrator {
    registry: ProblemRegistry,
    config: ConductorConfig,
    gate: InterruptGate,
    agent: Option<Box<dyn Agent>>,
    prerequisites: Vec<Box<dyn ClusterPrerequisite>>,
    sink: Option<Box<dyn SessionSink>>,
    tracker: Option<TrackerClient>,
    runtime: tokio::runtime::Runtime,
    workloads: Vec<WorkloadTask>,
    active: Option<ActiveRun>,
}

impl Orchestrator {
    pub fn new(registry: ProblemRegistry, config: ConductorConfig) -> Result<Self> {
        config.validate()?;
        let tracker = match (&config.tracker_endpoint, config.use_tracker) {
            (Some(endpoint), true) => Some(TrackerClient::new(endpoint.clone())?),
            _ => None,
        };
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .thread_name("arena-workload")
            .enable_all()
            .build()?;
        Ok(Self {
            registry,
            sink: Some(Box::new(JsonlSessionSink::new(config.results_dir.clone()))),
            config,
            gate: InterruptGate::global(),
            agent: None,
            prerequisites: Vec::new(),
            tracker,
            runtime,
            workloads: Vec::new(),
            active: None,
        })
    }

    pub fn with_gate(mut self, gate: InterruptGate) -> Self {
        self.gate = gate;
        self
    }

    /// Replaces the session sink; `None` disables persistence.
    pub fn with_sink(mut self, sink: Option<Box<dyn SessionSink>>) -> Self {
        self.sink = sink;
        self
    }

    pub fn config(&self) -> &ConductorConfig {
        &self.config
    }

    pub fn registry(&self) -> &ProblemRegistry {
        &self.registry
    }

    pub fn register_agent(&mut self, agent: Box<dyn Agent>) {
        info!(agent = agent.name(), "agent registered");
        self.agent = Some(agent);
    }

    pub fn add_prerequisite(&mut self, prerequisite: Box<dyn ClusterPrerequisite>) {
        self.prerequisites.push(prerequisite);
    }

    pub fn current_stage(&self) -> Option<Stage> {
        self.active.as_ref().map(|run| run.stage)
    }

    pub fn active_session(&self) -> Option<&Session> {
        self.active.as_ref().map(|run| &run.session)
    }

    /// Background workloads started so far. They are never joined by the
    /// agent loop.
    pub fn workload_tasks(&self) -> &[WorkloadTask] {
        &self.workloads
    }

    pub fn take_workload_tasks(&mut self) -> Vec<WorkloadTask> {
        std::mem::take(&mut self.workloads)
    }

    /// Joins workloads that have already exited and keeps the rest.
    fn reap_workloads(&mut self) {
        let (finished, running): (Vec<WorkloadTask>, Vec<WorkloadTask>) =
            std::mem::take(&mut self.workloads)
                .into_iter()
                .partition(WorkloadTask::is_finished);
        self.workloads = running;
        for task in finished {
            if let Err(err) = task.join() {
                warn!(error = %err, "background workload failed");
            }
        }
    }

    /// Resolves the problem, provisions prerequisites, redeploys the
    /// application, injects the fault and starts the workload. On failure the
    /// fault is recovered and the environment torn down before the error is
    /// returned as [`ConductorError::RunAborted`].
    pub fn init_problem(&mut self, problem_id: &str) -> Result<ProblemBriefing> {
        if let Some(active) = &self.active {
            return Err(ConductorError::ProblemAlreadyActive(active.problem.id().to_string()).into());
        }
        let agent_name = match &self.agent {
            Some(agent) => agent.name().to_string(),
            None => return Err(ConductorError::NoAgent.into()),
        };
        let started = Instant::now();
        let problem = self.registry.get_problem_instance(problem_id)?;

        let mut session = Session::new();
        session.set_problem(problem_id);
        session.set_agent(agent_name);
        info!(
            session_id = %session.session_id(),
            problem_id,
            "initializing problem"
        );

        let lease = FaultLease::new(self.gate.clone(), problem.faults().clone());
        let briefing = ProblemBriefing::for_problem(&problem);
        let mut run = ActiveRun {
            problem,
            session,
            stage: Stage::Detection,
            lease,
            steps: 0,
            step_limit_reached: false,
            started,
            provisioned: 0,
        };

        match self.prepare(&mut run, &briefing) {
            Ok(()) => {
                self.active = Some(run);
                Ok(briefing)
            }
            Err(err) => {
                error!(problem_id, error = %err, "problem setup failed");
                Err(self.abort(run, SETUP_PHASE.to_string(), err))
            }
        }
    }

    fn prepare(&mut self, run: &mut ActiveRun, briefing: &ProblemBriefing) -> Result<()> {
        for prerequisite in &self.prerequisites {
            info!(prerequisite = prerequisite.name(), "provisioning prerequisite");
            prerequisite.setup()?;
            run.provisioned += 1;
        }

        let app = run.problem.app().clone();
        if let Err(err) = app.delete() {
            warn!(app = app.name(), error = %err, "pre-deploy delete failed; continuing");
        }
        info!(app = app.name(), namespace = app.namespace(), "deploying application");
        app.deploy()?;

        run.lease.inject()?;

        let workload = run.problem.start_workload();
        if let Some(task) = dispatch_workload(workload, self.runtime.handle())? {
            info!(problem_id = %run.problem.id(), "workload started in background");
            self.workloads.push(task);
        }

        let agent = self.agent.as_mut().ok_or(ConductorError::NoAgent)?;
        agent.init_context(briefing)?;

        run.session.add(TraceEntry::new(
            Role::System,
            serde_json::to_string(briefing)?,
        ));
        run.session.start()?;
        Ok(())
    }

    /// Grades one action against the active problem without recording it in
    /// the trace.
    pub fn ask_env(&mut self, action: &str) -> Result<EnvResponse> {
        let run = self.active.as_mut().ok_or(ConductorError::NoActiveProblem)?;
        run.ask_env(action)
    }

    /// Records one agent action and the environment reply in the trace.
    pub fn handle_action(&mut self, action: &str) -> Result<EnvResponse> {
        let run = self.active.as_mut().ok_or(ConductorError::NoActiveProblem)?;
        run.handle_action(action)
    }

    /// Runs the agent loop for the initialized problem and always finishes
    /// with recovery, persistence and teardown.
    pub fn start_problem(&mut self) -> Result<RunReport> {
        let mut agent = self.agent.take().ok_or(ConductorError::NoAgent)?;
        let Some(mut run) = self.active.take() else {
            self.agent = Some(agent);
            return Err(ConductorError::NoActiveProblem.into());
        };
        let outcome = run.drive(agent.as_mut(), self.config.max_steps);
        self.agent = Some(agent);
        match outcome {
            Ok(()) => Ok(self.finish(run, None)),
            Err(err) => {
                let stage = run.stage.to_string();
                error!(problem_id = %run.problem.id(), stage = %stage, error = %err, "run aborted");
                Err(self.abort(run, stage, err))
            }
        }
    }

    pub fn run_problem(&mut self, problem_id: &str) -> Result<RunReport> {
        self.init_problem(problem_id)?;
        self.start_problem()
    }

    /// Discards the active problem, finishing it as aborted.
    pub fn abandon(&mut self) -> Result<RunReport> {
        let run = self.active.take().ok_or(ConductorError::NoActiveProblem)?;
        Ok(self.finish(run, Some(&anyhow!("run abandoned before completion"))))
    }

    fn abort(&mut self, run: ActiveRun, stage: String, err: anyhow::Error) -> anyhow::Error {
        let problem_id = run.problem.id().to_string();
        let report = self.finish(run, Some(&err));
        ConductorError::RunAborted {
            problem_id,
            stage,
            report: Box::new(report),
            source: err.into(),
        }
        .into()
    }

    fn finish(&mut self, run: ActiveRun, failure: Option<&anyhow::Error>) -> RunReport {
        let ActiveRun {
            problem,
            mut session,
            stage,
            mut lease,
            steps,
            step_limit_reached,
            started,
            provisioned,
        } = run;

        if let Err(err) = lease.release() {
            session.add_result(RECOVERY_ERROR_KEY, json!(err.to_string()));
        }
        drop(lease);

        if let Some(err) = failure {
            session.add_result(RUN_ERROR_KEY, json!(format!("{:#}", err)));
        }
        if step_limit_reached {
            session.add_result(STEP_LIMIT_KEY, json!(true));
        }
        if !session.is_started() {
            if let Err(err) = session.start() {
                warn!(session_id = %session.session_id(), error = %err, "session start failed");
            }
        }
        if let Err(err) = session.end() {
            warn!(session_id = %session.session_id(), error = %err, "session end failed");
        }
        let record = session.to_record();
        let session_dir = match self.sink.as_mut() {
            Some(sink) => match sink.write_session(&record) {
                Ok(dir) => Some(dir),
                Err(err) => {
                    let message = format!("{:#}", err);
                    error!(session_id = %record.session_id, error = %message, "session persistence failed");
                    None
                }
            },
            None => None,
        };
        if let Some(tracker) = &self.tracker {
            tracker.upload_best_effort(&record);
        }

        let app = problem.app();
        if let Err(err) = app.cleanup() {
            warn!(app = app.name(), error = %err, "application teardown failed");
        }
        for prerequisite in self.prerequisites.iter().take(provisioned).rev() {
            if let Err(err) = prerequisite.teardown() {
                warn!(prerequisite = prerequisite.name(), error = %err, "prerequisite teardown failed");
            }
        }

        self.reap_workloads();

        let total_elapsed_secs = started.elapsed().as_secs_f64();
        let timing = TIMING_KEYS.iter().find_map(|key| {
            record
                .results
                .get(*key)
                .and_then(Value::as_f64)
                .map(|secs| (key.to_string(), secs))
        });
        let framework_overhead_secs = timing.as_ref().map(|(_, secs)| total_elapsed_secs - secs);
        match (&timing, framework_overhead_secs) {
            (Some((key, secs)), Some(overhead)) => info!(
                problem_id = %record.problem_id,
                total_elapsed_secs,
                timing_key = %key,
                timing_secs = secs,
                framework_overhead_secs = overhead,
                "run finished"
            ),
            _ => info!(
                problem_id = %record.problem_id,
                total_elapsed_secs,
                "run finished without a timing metric"
            ),
        }

        RunReport {
            session_id: record.session_id,
            problem_id: record.problem_id,
            agent: record.agent,
            final_stage: stage,
            steps,
            step_limit_reached,
            history: record.history,
            results: record.results,
            session_duration_secs: record.duration_secs,
            total_elapsed_secs,
            timing_key: timing.map(|(key, _)| key),
            framework_overhead_secs,
            trace_head: record.trace_head,
            session_dir,
        }
    }
}
