use anyhow::{anyhow, Result};
use arena_conductor::scenario::{load_cluster, load_scenario, load_scenarios_dir, ScenarioFile};
use arena_conductor::{
    install_interrupt_handler, Agent, CommandAgent, ConductorConfig, ConductorError,
    Orchestrator, ProblemRegistry, RunReport, ScriptedAgent, Stage,
};
use clap::{Parser, Subcommand};
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use tracing::info;
use tracing_subscriber::EnvFilter;

const DEFAULT_LOG_FILTER: &str = "arena=info,arena_conductor=info";

#[derive(Parser)]
#[command(name = "arena", version = "0.3.0", about = "Chaos problem orchestration CLI")]
struct Cli {
    /// Emit logs as JSON lines on stderr.
    #[arg(long, global = true)]
    log_json: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one scenario end to end with an agent.
    Run {
        #[arg(long)]
        scenario: PathBuf,
        #[arg(long)]
        cluster: Option<PathBuf>,
        #[arg(long, conflicts_with = "agent_cmd", required_unless_present = "agent_cmd")]
        script: Option<PathBuf>,
        /// Shell command run once per turn; prompt on stdin, action on stdout.
        #[arg(long)]
        agent_cmd: Option<String>,
        #[arg(long)]
        max_steps: Option<usize>,
        #[arg(long)]
        results_dir: Option<PathBuf>,
        #[arg(long)]
        json: bool,
    },
    List {
        #[arg(long)]
        scenarios: PathBuf,
        #[arg(long)]
        json: bool,
    },
    Describe {
        scenario: PathBuf,
        #[arg(long)]
        json: bool,
    },
    Validate {
        scenario: PathBuf,
        #[arg(long)]
        json: bool,
    },
    Bundle {
        #[arg(long)]
        session_dir: PathBuf,
        #[arg(long)]
        out: PathBuf,
        #[arg(long)]
        json: bool,
    },
}

fn init_tracing(log_json: bool) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if log_json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);
    let json_mode = command_json_mode(&cli.command);
    let result = run_command(cli.command);
    match result {
        Ok(Some(payload)) => {
            emit_json(&payload);
            Ok(())
        }
        Ok(None) => Ok(()),
        Err(err) => {
            if json_mode {
                let (code, details) = error_details(&err);
                emit_json(&json_error(code, format!("{:#}", err), details));
                std::process::exit(1);
            }
            if let Some(report) = aborted_report(&err) {
                print_report(report);
            }
            Err(err)
        }
    }
}

fn run_command(command: Commands) -> Result<Option<Value>> {
    match command {
        Commands::Run {
            scenario,
            cluster,
            script,
            agent_cmd,
            max_steps,
            results_dir,
            json,
        } => {
            install_interrupt_handler()?;
            let config = ConductorConfig::from_env()?
                .with_max_steps(max_steps)?
                .with_results_dir(results_dir);
            let scenario = load_scenario(&scenario)?;
            let problem_id = scenario.id.clone();
            let mut registry = ProblemRegistry::new();
            scenario.register(&mut registry);

            let mut orchestrator = Orchestrator::new(registry, config)?;
            if let Some(cluster) = cluster {
                for prerequisite in load_cluster(&cluster)? {
                    orchestrator.add_prerequisite(prerequisite);
                }
            }
            orchestrator.register_agent(build_agent(script.as_deref(), agent_cmd)?);
            info!(problem_id = %problem_id, "starting run");
            let report = orchestrator.run_problem(&problem_id)?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "run",
                    "report": report_to_json(&report)?,
                })));
            }
            print_report(&report);
        }
        Commands::List { scenarios, json } => {
            let loaded = load_scenarios_dir(&scenarios)?;
            if json {
                let items: Vec<Value> = loaded
                    .iter()
                    .map(|(path, scenario)| scenario_summary_json(path, scenario))
                    .collect();
                return Ok(Some(json!({
                    "ok": true,
                    "command": "list",
                    "scenarios": items,
                })));
            }
            for (path, scenario) in &loaded {
                println!("{}\t{}", scenario.id, path.display());
            }
        }
        Commands::Describe { scenario, json } => {
            let loaded = load_scenario(&scenario)?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "describe",
                    "scenario": scenario_summary_json(&scenario, &loaded),
                    "definition": serde_json::to_value(&loaded)?,
                })));
            }
            print_scenario(&scenario, &loaded);
        }
        Commands::Validate { scenario, json } => {
            let loaded = load_scenario(&scenario)?;
            loaded.build_problem()?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "validate",
                    "id": loaded.id,
                    "path": scenario.display().to_string(),
                })));
            }
            println!("ok: {} ({})", loaded.id, scenario.display());
        }
        Commands::Bundle {
            session_dir,
            out,
            json,
        } => {
            let files = arena_provenance::build_debug_bundle(&session_dir, &out)?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "bundle",
                    "session_dir": session_dir.display().to_string(),
                    "bundle": out.display().to_string(),
                    "files": files,
                })));
            }
            println!("bundle: {} ({} files)", out.display(), files);
        }
    }
    Ok(None)
}

fn build_agent(script: Option<&Path>, agent_cmd: Option<String>) -> Result<Box<dyn Agent>> {
    match (script, agent_cmd) {
        (Some(path), None) => Ok(Box::new(ScriptedAgent::from_file(path)?)),
        (None, Some(cmd)) => Ok(Box::new(CommandAgent::new(vec![
            "sh".to_string(),
            "-c".to_string(),
            cmd,
        ])?)),
        _ => Err(anyhow!("exactly one of --script or --agent-cmd is required")),
    }
}

fn aborted_report(err: &anyhow::Error) -> Option<&RunReport> {
    err.downcast_ref::<ConductorError>()
        .and_then(ConductorError::report)
}

fn error_details(err: &anyhow::Error) -> (&'static str, Value) {
    match err.downcast_ref::<ConductorError>() {
        Some(ConductorError::RunAborted { report, stage, .. }) => (
            "run_aborted",
            json!({
                "stage": stage,
                "report": serde_json::to_value(report.as_ref()).unwrap_or(Value::Null),
            }),
        ),
        Some(ConductorError::UnknownProblem(id)) => ("unknown_problem", json!({"problem_id": id})),
        Some(_) => ("conductor_error", json!({})),
        None => ("command_failed", json!({})),
    }
}

fn report_to_json(report: &RunReport) -> Result<Value> {
    Ok(serde_json::to_value(report)?)
}

fn scenario_summary_json(path: &Path, scenario: &ScenarioFile) -> Value {
    let stages: Vec<&str> = scenario
        .graded_stages()
        .into_iter()
        .map(Stage::as_str)
        .collect();
    json!({
        "id": scenario.id,
        "path": path.display().to_string(),
        "description": scenario.description,
        "application": scenario.application.name,
        "namespace": scenario.application.namespace,
        "graded_stages": stages,
        "has_workload": scenario.workload.is_some(),
    })
}

fn print_scenario(path: &Path, scenario: &ScenarioFile) {
    println!("id: {}", scenario.id);
    println!("path: {}", path.display());
    if !scenario.description.is_empty() {
        println!("description: {}", scenario.description);
    }
    println!(
        "application: {} (namespace {})",
        scenario.application.name, scenario.application.namespace
    );
    let stages: Vec<&str> = scenario
        .graded_stages()
        .into_iter()
        .map(Stage::as_str)
        .collect();
    println!("graded_stages: {}", stages.join(", "));
    println!(
        "workload: {}",
        if scenario.workload.is_some() { "command" } else { "none" }
    );
}

fn print_report(report: &RunReport) {
    println!("session_id: {}", report.session_id);
    println!("problem_id: {}", report.problem_id);
    println!("final_stage: {}", report.final_stage);
    println!("steps: {}", report.steps);
    if report.step_limit_reached {
        println!("step_limit_reached: true");
    }
    for stage in [Stage::Detection, Stage::Localization, Stage::Mitigation] {
        match report.stage_succeeded(stage) {
            Some(success) => println!("{}: success={}", stage, success),
            None => println!("{}: not graded", stage),
        }
    }
    println!("total_elapsed_secs: {:.3}", report.total_elapsed_secs);
    match (&report.timing_key, report.framework_overhead_secs) {
        (Some(key), Some(overhead)) => {
            println!("framework_overhead_secs: {:.3} (excluding {})", overhead, key)
        }
        _ => println!("framework_overhead_secs: n/a"),
    }
    if let Some(dir) = &report.session_dir {
        println!("session_dir: {}", dir.display());
    }
}

fn emit_json(value: &Value) {
    match serde_json::to_string(value) {
        Ok(s) => println!("{}", s),
        Err(_) => println!(
            "{{\"ok\":false,\"error\":{{\"code\":\"serialization_error\",\"message\":\"failed to serialize JSON payload\",\"details\":{{}}}}}}"
        ),
    }
}

fn json_error(code: &str, message: String, details: Value) -> Value {
    json!({
        "ok": false,
        "error": {
            "code": code,
            "message": message,
            "details": details
        }
    })
}

fn command_json_mode(command: &Commands) -> bool {
    match command {
        Commands::Run { json, .. }
        | Commands::List { json, .. }
        | Commands::Describe { json, .. }
        | Commands::Validate { json, .. }
        | Commands::Bundle { json, .. } => *json,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn run_requires_exactly_one_agent_source() {
        assert!(Cli::try_parse_from(["arena", "run", "--scenario", "s.yaml"]).is_err());
        assert!(Cli::try_parse_from([
            "arena",
            "run",
            "--scenario",
            "s.yaml",
            "--script",
            "a.yaml",
            "--agent-cmd",
            "cat",
        ])
        .is_err());
        let cli = Cli::try_parse_from([
            "arena",
            "run",
            "--scenario",
            "s.yaml",
            "--agent-cmd",
            "python agent.py",
            "--max-steps",
            "5",
            "--json",
        ])
        .expect("valid run");
        assert!(command_json_mode(&cli.command));
    }

    #[test]
    fn json_error_shape() {
        let value = json_error("run_aborted", "boom".to_string(), json!({"stage": "setup"}));
        assert_eq!(value["ok"], json!(false));
        assert_eq!(value["error"]["code"], json!("run_aborted"));
        assert_eq!(value["error"]["details"]["stage"], json!("setup"));
    }

    #[test]
    fn build_agent_rejects_missing_source() {
        assert!(build_agent(None, None).is_err());
        assert!(build_agent(None, Some("cat".to_string())).is_ok());
    }
}
