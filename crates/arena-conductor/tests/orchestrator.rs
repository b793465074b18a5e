use anyhow::{anyhow, Result};
use arena_conductor::oracle::TIME_TO_DETECT;
use arena_conductor::orchestrator::{
    INITIAL_PROMPT, RECOVERY_ERROR_KEY, REJECTION_MESSAGE, RUN_ERROR_KEY, STEP_LIMIT_KEY,
};
use arena_conductor::{
    Agent, Application, ClusterPrerequisite, ConductorConfig, ConductorError, DetectionOracle, EnvResponse,
    FaultInjector, InterruptGate, LocalizationOracle, Oracle, OracleResult, Orchestrator,
    Problem, ProblemRegistry, Role, ScriptedAgent, SessionRecord, SessionSink, Stage,
    StatePollingOracle, StateProbe, SubmissionStatus, TraceEntry, Workload, WorkloadGenerator,
};
use serde_json::{json, Value};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::time::{Duration, Instant};

#[derive(Default)]
struct Counters {
    deploy: AtomicUsize,
    delete: AtomicUsize,
    cleanup: AtomicUsize,
    inject: AtomicUsize,
    recover: AtomicUsize,
}

impl Counters {
    fn get(counter: &AtomicUsize) -> usize {
        counter.load(Ordering::SeqCst)
    }
}

struct FakeApp {
    counters: Arc<Counters>,
}

impl Application for FakeApp {
    fn name(&self) -> &str {
        "hotel-reservation"
    }
    fn namespace(&self) -> &str {
        "test-hotel-reservation"
    }
    fn deploy(&self) -> Result<()> {
        self.counters.deploy.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
    fn delete(&self) -> Result<()> {
        self.counters.delete.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
    fn cleanup(&self) -> Result<()> {
        self.counters.cleanup.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

struct FakeInjector {
    counters: Arc<Counters>,
    fail_inject: bool,
    fail_recover: bool,
    interrupt_during_inject: Option<InterruptGate>,
}

impl FaultInjector for FakeInjector {
    fn inject_fault(&self) -> Result<()> {
        self.counters.inject.fetch_add(1, Ordering::SeqCst);
        if let Some(gate) = &self.interrupt_during_inject {
            gate.interrupt();
        }
        if self.fail_inject {
            return Err(anyhow!("chaos operator unavailable"));
        }
        Ok(())
    }
    fn recover_fault(&self) -> Result<()> {
        self.counters.recover.fetch_add(1, Ordering::SeqCst);
        if self.fail_recover {
            return Err(anyhow!("recovery command failed"));
        }
        Ok(())
    }
}

struct FixedOracle(bool);

impl Oracle for FixedOracle {
    fn name(&self) -> &str {
        "fixed"
    }
    fn evaluate(&self, _: &Value, _: &[TraceEntry], _: Duration) -> Result<OracleResult> {
        Ok(OracleResult::new(self.0))
    }
}

struct FailingOracle;

impl Oracle for FailingOracle {
    fn name(&self) -> &str {
        "failing"
    }
    fn evaluate(&self, _: &Value, _: &[TraceEntry], _: Duration) -> Result<OracleResult> {
        Err(anyhow!("cluster api unreachable"))
    }
}

struct NeverReady;

impl StateProbe for NeverReady {
    fn name(&self) -> &str {
        "pods-ready"
    }
    fn check(&self) -> Result<bool> {
        Ok(false)
    }
}

#[derive(Clone, Default)]
struct MemorySink {
    records: Arc<Mutex<Vec<SessionRecord>>>,
}

impl SessionSink for MemorySink {
    fn write_session(&mut self, record: &SessionRecord) -> Result<PathBuf> {
        let mut records = self.records.lock().expect("sink lock");
        records.push(record.clone());
        Ok(PathBuf::from(format!("memory/{}", record.session_id)))
    }
}

impl MemorySink {
    fn records(&self) -> Vec<SessionRecord> {
        self.records.lock().expect("sink lock").clone()
    }
}

struct FakePrerequisite {
    name: &'static str,
    fail_setup: bool,
    log: Arc<Mutex<Vec<String>>>,
}

impl ClusterPrerequisite for FakePrerequisite {
    fn name(&self) -> &str {
        self.name
    }
    fn setup(&self) -> Result<()> {
        self.log
            .lock()
            .expect("log lock")
            .push(format!("setup:{}", self.name));
        if self.fail_setup {
            return Err(anyhow!("{} setup failed", self.name));
        }
        Ok(())
    }
    fn teardown(&self) -> Result<()> {
        self.log
            .lock()
            .expect("log lock")
            .push(format!("teardown:{}", self.name));
        Ok(())
    }
}

struct ChannelWorkload(mpsc::Sender<&'static str>);

impl WorkloadGenerator for ChannelWorkload {
    fn start_workload(&self) -> Workload {
        let tx = self.0.clone();
        Workload::blocking(move || {
            tx.send("workload ran").map_err(|e| anyhow!(e.to_string()))?;
            Ok(())
        })
    }
}

#[derive(Clone, Copy)]
enum MitigationCheck {
    Passes,
    Errors,
    NeverReady,
}

impl MitigationCheck {
    fn build(self) -> Box<dyn Oracle> {
        match self {
            MitigationCheck::Passes => Box::new(FixedOracle(true)),
            MitigationCheck::Errors => Box::new(FailingOracle),
            MitigationCheck::NeverReady => Box::new(StatePollingOracle::new(
                Box::new(NeverReady),
                Duration::from_millis(10),
                Duration::from_millis(60),
            )),
        }
    }
}

#[derive(Default)]
struct Setup {
    fail_inject: bool,
    fail_recover: bool,
    interrupt_during_inject: Option<InterruptGate>,
    localization: bool,
    mitigation: Option<MitigationCheck>,
    workload: Option<mpsc::Sender<&'static str>>,
}

const PROBLEM_ID: &str = "misconfig_app_hotel_res";

fn registry(setup: Setup, counters: Arc<Counters>) -> ProblemRegistry {
    let setup = Arc::new(Mutex::new(setup));
    let mut registry = ProblemRegistry::new();
    registry.register(PROBLEM_ID, move || {
        let setup = setup.lock().expect("setup lock");
        let injector = FakeInjector {
            counters: counters.clone(),
            fail_inject: setup.fail_inject,
            fail_recover: setup.fail_recover,
            interrupt_during_inject: setup.interrupt_during_inject.clone(),
        };
        let mut problem = Problem::new(
            PROBLEM_ID,
            Arc::new(FakeApp {
                counters: counters.clone(),
            }),
            Arc::new(injector),
        )
        .with_description("Is there an anomaly in the hotel reservation service?")
        .with_detection_oracle(Box::new(DetectionOracle::new("Yes")));
        if setup.localization {
            problem = problem.with_localization_oracle(Box::new(LocalizationOracle::new(["geo"])));
        }
        if let Some(check) = setup.mitigation {
            problem = problem.with_mitigation_oracle(check.build());
        }
        if let Some(tx) = &setup.workload {
            problem = problem.with_workload(Box::new(ChannelWorkload(tx.clone())));
        }
        Ok(problem)
    });
    registry
}

fn test_gate() -> (InterruptGate, Arc<AtomicUsize>) {
    let exits = Arc::new(AtomicUsize::new(0));
    let seen = exits.clone();
    let gate = InterruptGate::with_terminator(move || {
        seen.fetch_add(1, Ordering::SeqCst);
    });
    (gate, exits)
}

fn orchestrator(
    registry: ProblemRegistry,
    config: ConductorConfig,
    gate: InterruptGate,
    sink: &MemorySink,
) -> Orchestrator {
    Orchestrator::new(registry, config)
        .expect("orchestrator builds")
        .with_gate(gate)
        .with_sink(Some(Box::new(sink.clone())))
}

fn default_orchestrator(setup: Setup, counters: &Arc<Counters>, sink: &MemorySink) -> Orchestrator {
    let (gate, _) = test_gate();
    orchestrator(
        registry(setup, counters.clone()),
        ConductorConfig::default(),
        gate,
        sink,
    )
}

fn full_setup() -> Setup {
    Setup {
        localization: true,
        mitigation: Some(MitigationCheck::Passes),
        ..Setup::default()
    }
}

fn aborted_report(err: &anyhow::Error) -> &arena_conductor::RunReport {
    err.downcast_ref::<ConductorError>()
        .and_then(ConductorError::report)
        .expect("aborted run carries its report")
}

#[test]
fn non_submission_action_is_rejected_without_grading() {
    let counters = Arc::new(Counters::default());
    let sink = MemorySink::default();
    let mut orch = default_orchestrator(full_setup(), &counters, &sink);
    orch.register_agent(Box::new(ScriptedAgent::new(Vec::<String>::new())));
    orch.init_problem(PROBLEM_ID).expect("init");

    let response = orch.ask_env("noop").expect("ask_env");
    assert_eq!(response, EnvResponse::Rejected);
    assert_eq!(response.message(), REJECTION_MESSAGE);
    let response = orch.ask_env("get_logs(\"geo\")").expect("ask_env");
    assert_eq!(response, EnvResponse::Rejected);
    assert_eq!(orch.current_stage(), Some(Stage::Detection));
    let session = orch.active_session().expect("active session");
    assert!(session.results().is_empty());
    assert!(session.solution().is_none());

    let response = orch.ask_env("submit(\"Yes\"").expect("ask_env");
    assert!(matches!(response, EnvResponse::ParseError(_)));
    assert!(response.message().starts_with("Error parsing response:"));
    assert_eq!(orch.current_stage(), Some(Stage::Detection));

    orch.abandon().expect("abandon");
    assert_eq!(Counters::get(&counters.recover), 1);
}

#[test]
fn detection_success_advances_to_localization() {
    let counters = Arc::new(Counters::default());
    let sink = MemorySink::default();
    let mut orch = default_orchestrator(full_setup(), &counters, &sink);
    orch.register_agent(Box::new(ScriptedAgent::new(Vec::<String>::new())));
    orch.init_problem(PROBLEM_ID).expect("init");

    let response = orch.ask_env("```python\nsubmit(\"Yes\")\n```").expect("ask_env");
    assert_eq!(
        response,
        EnvResponse::Submission(SubmissionStatus::ValidSubmission)
    );
    assert_eq!(orch.current_stage(), Some(Stage::Localization));
    let session = orch.active_session().expect("session");
    assert_eq!(session.results()["Detection Results"]["success"], json!(true));
    assert_eq!(session.solution(), Some(&json!("Yes")));
    orch.abandon().expect("abandon");
}

#[test]
fn detection_failure_skips_localization() {
    let counters = Arc::new(Counters::default());
    let sink = MemorySink::default();
    let mut orch = default_orchestrator(full_setup(), &counters, &sink);
    orch.register_agent(Box::new(ScriptedAgent::new(Vec::<String>::new())));
    orch.init_problem(PROBLEM_ID).expect("init");

    orch.ask_env("submit(\"No\")").expect("ask_env");
    assert_eq!(orch.current_stage(), Some(Stage::Mitigation));
    let session = orch.active_session().expect("session");
    assert_eq!(session.results()["Detection Results"]["success"], json!(false));
    assert!(!session.results().contains_key("Localization Results"));
    orch.abandon().expect("abandon");
}

#[test]
fn full_run_grades_every_stage_and_tears_down_once() {
    let counters = Arc::new(Counters::default());
    let sink = MemorySink::default();
    let mut orch = default_orchestrator(full_setup(), &counters, &sink);
    orch.register_agent(Box::new(ScriptedAgent::new([
        "noop",
        "Thinking about it.\n```\nsubmit(\"Yes\")\n```",
        "submit([\"geo\"])",
        "submit()",
        "submit(None)",
    ])));

    let report = orch.run_problem(PROBLEM_ID).expect("run completes");
    assert_eq!(report.final_stage, Stage::Done);
    assert_eq!(report.steps, 5);
    assert!(!report.step_limit_reached);
    assert_eq!(report.stage_succeeded(Stage::Detection), Some(true));
    assert_eq!(report.stage_succeeded(Stage::Localization), Some(true));
    assert_eq!(report.stage_succeeded(Stage::Mitigation), Some(true));
    assert!(report.results.contains_key(TIME_TO_DETECT));
    assert_eq!(report.timing_key.as_deref(), Some(TIME_TO_DETECT));
    let overhead = report.framework_overhead_secs.expect("overhead reported");
    assert!(overhead >= 0.0);
    assert!(overhead <= report.total_elapsed_secs);

    assert_eq!(report.history.len(), 11);
    assert_eq!(report.history[0].role, Role::System);
    assert_eq!(report.history[1].role, Role::Assistant);
    assert_eq!(report.history[2].content, REJECTION_MESSAGE);
    assert_eq!(
        report.history[8].content,
        SubmissionStatus::InvalidSubmission.to_string()
    );
    assert!(report
        .history
        .iter()
        .skip(1)
        .step_by(2)
        .all(|entry| entry.role == Role::Assistant));

    assert_eq!(Counters::get(&counters.inject), 1);
    assert_eq!(Counters::get(&counters.recover), 1);
    assert_eq!(Counters::get(&counters.delete), 1);
    assert_eq!(Counters::get(&counters.deploy), 1);
    assert_eq!(Counters::get(&counters.cleanup), 1);

    let records = sink.records();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].session_id, report.session_id);
    assert_eq!(records[0].agent, "scripted");
    assert!(records[0].ended_at.is_some());
    assert_eq!(
        report.session_dir,
        Some(PathBuf::from(format!("memory/{}", report.session_id)))
    );

    drop(orch);
    assert_eq!(Counters::get(&counters.recover), 1);
}

#[test]
fn first_agent_input_is_the_initial_prompt() {
    struct Recording(Arc<Mutex<Vec<String>>>);

    impl Agent for Recording {
        fn name(&self) -> &str {
            "recording"
        }
        fn get_action(&mut self, input: &str) -> Result<String> {
            self.0.lock().expect("lock").push(input.to_string());
            Ok("submit(\"No\")".to_string())
        }
    }

    let counters = Arc::new(Counters::default());
    let sink = MemorySink::default();
    let mut orch = default_orchestrator(full_setup(), &counters, &sink);
    let inputs = Arc::new(Mutex::new(Vec::new()));
    orch.register_agent(Box::new(Recording(inputs.clone())));
    let report = orch.run_problem(PROBLEM_ID).expect("run");
    assert_eq!(report.final_stage, Stage::Done);

    let inputs = inputs.lock().expect("lock");
    assert_eq!(inputs.len(), 2);
    assert_eq!(inputs[0], INITIAL_PROMPT);
    assert_eq!(inputs[1], SubmissionStatus::ValidSubmission.to_string());
}

#[test]
fn polling_mitigation_gives_up_at_deadline() {
    let counters = Arc::new(Counters::default());
    let sink = MemorySink::default();
    let setup = Setup {
        mitigation: Some(MitigationCheck::NeverReady),
        ..Setup::default()
    };
    let mut orch = default_orchestrator(setup, &counters, &sink);
    orch.register_agent(Box::new(ScriptedAgent::new([
        "submit(\"No\")",
        "submit(\"scaled up geo\")",
    ])));

    let started = Instant::now();
    let report = orch.run_problem(PROBLEM_ID).expect("run completes");
    assert!(started.elapsed() < Duration::from_secs(10));
    assert_eq!(report.final_stage, Stage::Done);
    let mitigation = report
        .stage_result(Stage::Mitigation)
        .expect("mitigation graded");
    assert_eq!(mitigation["success"], json!(false));
    assert_eq!(mitigation["timed_out"], json!(true));
    assert!(mitigation["attempts"].as_u64().unwrap_or(0) >= 2);
    assert_eq!(Counters::get(&counters.recover), 1);
}

#[test]
fn oracle_error_aborts_run_but_recovers_exactly_once() {
    let counters = Arc::new(Counters::default());
    let sink = MemorySink::default();
    let setup = Setup {
        mitigation: Some(MitigationCheck::Errors),
        ..Setup::default()
    };
    let mut orch = default_orchestrator(setup, &counters, &sink);
    orch.register_agent(Box::new(ScriptedAgent::new([
        "submit(\"No\")",
        "submit(\"restart geo\")",
        "submit(\"never reached\")",
    ])));

    let err = orch.run_problem(PROBLEM_ID).expect_err("oracle error aborts");
    let report = aborted_report(&err);
    assert_eq!(report.final_stage, Stage::Mitigation);
    assert_eq!(report.steps, 2);
    let last = report.history.last().expect("trace kept");
    assert_eq!(last.role, Role::Assistant);
    assert_eq!(last.content, "submit(\"restart geo\")");
    assert!(report.results[RUN_ERROR_KEY]
        .as_str()
        .unwrap_or_default()
        .contains("cluster api unreachable"));
    assert!(matches!(
        err.downcast_ref::<ConductorError>(),
        Some(ConductorError::RunAborted { stage, .. }) if stage == "mitigation"
    ));

    assert_eq!(Counters::get(&counters.recover), 1);
    assert_eq!(Counters::get(&counters.cleanup), 1);
    assert_eq!(sink.records().len(), 1);
    drop(orch);
    assert_eq!(Counters::get(&counters.recover), 1);
}

#[test]
fn failed_recovery_is_reported_and_retried_once() {
    let counters = Arc::new(Counters::default());
    let sink = MemorySink::default();
    let setup = Setup {
        fail_recover: true,
        ..full_setup()
    };
    let mut orch = default_orchestrator(setup, &counters, &sink);
    orch.register_agent(Box::new(ScriptedAgent::new([
        "submit(\"No\")",
        "submit(None)",
    ])));

    let report = orch.run_problem(PROBLEM_ID).expect("run completes");
    assert!(report.results.contains_key(RECOVERY_ERROR_KEY));
    assert_eq!(Counters::get(&counters.recover), 2);
    drop(orch);
    assert_eq!(Counters::get(&counters.recover), 2);
}

#[test]
fn step_limit_stops_the_loop() {
    let counters = Arc::new(Counters::default());
    let sink = MemorySink::default();
    let (gate, _) = test_gate();
    let config = ConductorConfig::default()
        .with_max_steps(Some(3))
        .expect("positive");
    let mut orch = orchestrator(registry(full_setup(), counters.clone()), config, gate, &sink);
    orch.register_agent(Box::new(ScriptedAgent::new(vec!["noop"; 10])));

    let report = orch.run_problem(PROBLEM_ID).expect("run stops at cap");
    assert_eq!(report.steps, 3);
    assert!(report.step_limit_reached);
    assert_eq!(report.final_stage, Stage::Detection);
    assert_eq!(report.results[STEP_LIMIT_KEY], json!(true));
    assert!(report.framework_overhead_secs.is_none());
    assert_eq!(Counters::get(&counters.recover), 1);
}

#[test]
fn stage_without_oracle_records_unsupported_result() {
    let counters = Arc::new(Counters::default());
    let sink = MemorySink::default();
    let mut orch = default_orchestrator(Setup::default(), &counters, &sink);
    orch.register_agent(Box::new(ScriptedAgent::new([
        "submit(\"Yes\")",
        "submit([\"geo\"])",
        "submit(None)",
    ])));

    let report = orch.run_problem(PROBLEM_ID).expect("run");
    assert_eq!(report.final_stage, Stage::Done);
    let localization = report
        .stage_result(Stage::Localization)
        .expect("localization recorded");
    assert_eq!(localization["success"], json!(false));
    assert_eq!(localization["unsupported"], json!(true));
    assert_eq!(
        report.stage_result(Stage::Mitigation).expect("mitigation")["unsupported"],
        json!(true)
    );
}

#[test]
fn lifecycle_preconditions_are_enforced() {
    let counters = Arc::new(Counters::default());
    let sink = MemorySink::default();
    let mut orch = default_orchestrator(full_setup(), &counters, &sink);

    let err = orch.init_problem(PROBLEM_ID).expect_err("agent required");
    assert!(matches!(
        err.downcast_ref::<ConductorError>(),
        Some(ConductorError::NoAgent)
    ));

    orch.register_agent(Box::new(ScriptedAgent::new(["submit(\"Yes\")"])));
    let err = orch.start_problem().expect_err("problem required");
    assert!(matches!(
        err.downcast_ref::<ConductorError>(),
        Some(ConductorError::NoActiveProblem)
    ));
    let err = orch.init_problem("unknown").expect_err("unknown id");
    assert!(matches!(
        err.downcast_ref::<ConductorError>(),
        Some(ConductorError::UnknownProblem(id)) if id == "unknown"
    ));

    orch.init_problem(PROBLEM_ID).expect("init");
    let err = orch.init_problem(PROBLEM_ID).expect_err("one problem at a time");
    assert!(matches!(
        err.downcast_ref::<ConductorError>(),
        Some(ConductorError::ProblemAlreadyActive(_))
    ));
    assert_eq!(Counters::get(&counters.inject), 1);
    orch.abandon().expect("abandon");
    assert_eq!(Counters::get(&counters.recover), 1);
}

#[test]
fn injection_failure_aborts_before_the_loop_and_still_recovers() {
    let counters = Arc::new(Counters::default());
    let sink = MemorySink::default();
    let setup = Setup {
        fail_inject: true,
        ..full_setup()
    };
    let mut orch = default_orchestrator(setup, &counters, &sink);
    orch.register_agent(Box::new(ScriptedAgent::new(["submit(\"Yes\")"])));

    let err = orch.run_problem(PROBLEM_ID).expect_err("injection failure aborts");
    let report = aborted_report(&err);
    assert_eq!(report.steps, 0);
    assert!(matches!(
        err.downcast_ref::<ConductorError>(),
        Some(ConductorError::RunAborted { stage, .. }) if stage == "setup"
    ));
    assert_eq!(Counters::get(&counters.inject), 1);
    assert_eq!(Counters::get(&counters.recover), 1);
    assert_eq!(Counters::get(&counters.cleanup), 1);
    assert!(orch.current_stage().is_none());
    assert_eq!(sink.records().len(), 1);
}

#[test]
fn interrupt_during_injection_is_deferred_until_hook_is_registered() {
    let counters = Arc::new(Counters::default());
    let sink = MemorySink::default();
    let (gate, exits) = test_gate();
    let setup = Setup {
        interrupt_during_inject: Some(gate.clone()),
        ..full_setup()
    };
    let mut orch = orchestrator(
        registry(setup, counters.clone()),
        ConductorConfig::default(),
        gate.clone(),
        &sink,
    );
    orch.register_agent(Box::new(ScriptedAgent::new(Vec::<String>::new())));
    orch.init_problem(PROBLEM_ID).expect("init");

    assert_eq!(exits.load(Ordering::SeqCst), 1);
    assert_eq!(gate.interrupts_received(), 1);
    assert!(!gate.interrupt_pending());
    assert_eq!(Counters::get(&counters.inject), 1);
    assert_eq!(Counters::get(&counters.recover), 1);

    orch.abandon().expect("abandon");
    drop(orch);
    assert_eq!(Counters::get(&counters.recover), 1);
}

#[test]
fn workload_runs_in_background_without_being_joined() {
    let counters = Arc::new(Counters::default());
    let sink = MemorySink::default();
    let (tx, rx) = mpsc::channel();
    let setup = Setup {
        workload: Some(tx),
        ..full_setup()
    };
    let mut orch = default_orchestrator(setup, &counters, &sink);
    orch.register_agent(Box::new(ScriptedAgent::new([
        "submit(\"Yes\")",
        "submit([\"geo\"])",
        "submit(None)",
    ])));
    let report = orch.run_problem(PROBLEM_ID).expect("run");
    assert_eq!(report.final_stage, Stage::Done);

    assert_eq!(
        rx.recv_timeout(Duration::from_secs(5)).expect("workload ran"),
        "workload ran"
    );
    for task in orch.take_workload_tasks() {
        task.join().expect("workload finished cleanly");
    }
}

#[test]
fn finished_workloads_are_reaped_between_runs() {
    let counters = Arc::new(Counters::default());
    let sink = MemorySink::default();
    let (tx, rx) = mpsc::channel();
    let setup = Setup {
        workload: Some(tx),
        ..full_setup()
    };
    let mut orch = default_orchestrator(setup, &counters, &sink);
    let script = ["submit(\"Yes\")", "submit([\"geo\"])", "submit(None)"];

    orch.register_agent(Box::new(ScriptedAgent::new(script)));
    orch.run_problem(PROBLEM_ID).expect("first run");
    rx.recv_timeout(Duration::from_secs(5)).expect("first workload ran");
    let deadline = Instant::now() + Duration::from_secs(5);
    while !orch.workload_tasks().iter().all(|t| t.is_finished()) {
        assert!(Instant::now() < deadline, "first workload never exited");
        std::thread::sleep(Duration::from_millis(5));
    }

    orch.register_agent(Box::new(ScriptedAgent::new(script)));
    orch.run_problem(PROBLEM_ID).expect("second run");
    rx.recv_timeout(Duration::from_secs(5)).expect("second workload ran");
    assert!(orch.workload_tasks().len() <= 1);
}

#[test]
fn prerequisites_tear_down_in_reverse_order() {
    let counters = Arc::new(Counters::default());
    let sink = MemorySink::default();
    let log = Arc::new(Mutex::new(Vec::new()));
    let mut orch = default_orchestrator(full_setup(), &counters, &sink);
    for name in ["metrics", "registry"] {
        orch.add_prerequisite(Box::new(FakePrerequisite {
            name,
            fail_setup: false,
            log: log.clone(),
        }));
    }
    orch.register_agent(Box::new(ScriptedAgent::new([
        "submit(\"Yes\")",
        "submit([\"geo\"])",
        "submit(None)",
    ])));
    orch.run_problem(PROBLEM_ID).expect("run");
    assert_eq!(
        *log.lock().expect("log lock"),
        vec![
            "setup:metrics",
            "setup:registry",
            "teardown:registry",
            "teardown:metrics",
        ]
    );
}

#[test]
fn failed_prerequisite_only_tears_down_provisioned_ones() {
    let counters = Arc::new(Counters::default());
    let sink = MemorySink::default();
    let log = Arc::new(Mutex::new(Vec::new()));
    let mut orch = default_orchestrator(full_setup(), &counters, &sink);
    for (name, fail_setup) in [("metrics", false), ("registry", true), ("tracing", false)] {
        orch.add_prerequisite(Box::new(FakePrerequisite {
            name,
            fail_setup,
            log: log.clone(),
        }));
    }
    orch.register_agent(Box::new(ScriptedAgent::new(Vec::<String>::new())));
    let err = orch.init_problem(PROBLEM_ID).expect_err("setup fails");
    assert!(aborted_report(&err).results.contains_key(RUN_ERROR_KEY));
    assert_eq!(
        *log.lock().expect("log lock"),
        vec!["setup:metrics", "setup:registry", "teardown:metrics"]
    );
    assert_eq!(Counters::get(&counters.deploy), 0);
    assert_eq!(Counters::get(&counters.inject), 0);
}

#[test]
fn scripted_agent_running_dry_aborts_with_partial_report() {
    let counters = Arc::new(Counters::default());
    let sink = MemorySink::default();
    let mut orch = default_orchestrator(full_setup(), &counters, &sink);
    orch.register_agent(Box::new(ScriptedAgent::new(["submit(\"Yes\")"])));

    let err = orch.run_problem(PROBLEM_ID).expect_err("agent runs dry");
    let report = aborted_report(&err);
    assert_eq!(report.final_stage, Stage::Localization);
    assert_eq!(report.stage_succeeded(Stage::Detection), Some(true));
    assert_eq!(Counters::get(&counters.recover), 1);

    assert!(report.results.contains_key(RUN_ERROR_KEY));
}
