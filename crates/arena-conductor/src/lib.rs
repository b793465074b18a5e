pub mod agent;
pub mod command;
pub mod config;
pub mod error;
pub mod fault;
pub mod interrupt;
pub mod oracle;
pub mod orchestrator;
pub mod parser;
pub mod problem;
pub mod scenario;
pub mod session;
pub mod sink;
pub mod stage;
pub mod tracker;

pub use agent::{Agent, CommandAgent, ScriptedAgent};
pub use config::ConductorConfig;
pub use error::{ConductorError, SessionError};
pub use fault::{FaultGuard, FaultInjector, FaultLease, FaultTransition};
pub use interrupt::{install_interrupt_handler, CriticalSection, InterruptGate};
pub use oracle::{
    CompositionMode, CompoundOracle, DetectionOracle, LocalizationOracle, MitigationOracle,
    Oracle, OracleResult, StatePollingOracle, StateProbe,
};
pub use orchestrator::{EnvResponse, Orchestrator, RunReport, SubmissionStatus};
pub use parser::{parse_response, ParseError, ParsedCall};
pub use problem::{
    Application, ClusterPrerequisite, Problem, ProblemBriefing, ProblemRegistry, Workload,
    WorkloadGenerator, WorkloadTask,
};
pub use session::{Role, Session, SessionRecord, TraceEntry};
pub use sink::{JsonlSessionSink, SessionSink};
pub use stage::{next_stage, Stage};
