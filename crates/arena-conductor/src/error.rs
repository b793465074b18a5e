use crate::orchestrator::RunReport;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SessionError {
    #[error("session {0} already started")]
    AlreadyStarted(String),
    #[error("session {0} has not been started")]
    NotStarted(String),
    #[error("session {0} already ended")]
    AlreadyEnded(String),
}

#[derive(Debug, Error)]
pub enum ConductorError {
    #[error("no agent registered; call register_agent first")]
    NoAgent,
    #[error("no problem initialized; call init_problem first")]
    NoActiveProblem,
    #[error("problem {0} is still active; finish it before starting another")]
    ProblemAlreadyActive(String),
    #[error("unknown problem id: {0}")]
    UnknownProblem(String),
    #[error("fault injection failed for {problem_id}: {message}")]
    FaultInjection { problem_id: String, message: String },
    #[error("fault recovery failed for {problem_id}: {message}")]
    FaultRecovery { problem_id: String, message: String },
    #[error("run of {problem_id} aborted at stage {stage}: {source}")]
    RunAborted {
        problem_id: String,
        stage: String,
        report: Box<RunReport>,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync + 'static>,
    },
}

impl ConductorError {
    /// Partial report of an aborted run, if this error carries one.
    pub fn report(&self) -> Option<&RunReport> {
        match self {
            ConductorError::RunAborted { report, .. } => Some(report),
            _ => None,
        }
    }
}
