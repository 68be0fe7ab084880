//! Epic Conductor CLI
//!
//! Drives one epic stored in a `bd` workspace.

use std::path::PathBuf;

use conductor::store::BeadsStore;
use conductor::{render_proposal, CommandExecutor, ConductorConfig, Orchestrator, RunState, StepOutcome};

const USAGE: &str = "Usage: epic-conductor <run|step|status|analyze> <epic-id>";

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let args: Vec<String> = std::env::args().collect();
    if args.len() < 3 {
        eprintln!("{}", USAGE);
        eprintln!("\nReads .conductor.toml from the current directory when present.");
        eprintln!("\nEnvironment variables:");
        eprintln!("  RUST_LOG=debug  Show store commands and dispatch details");
        std::process::exit(2);
    }
    let command = args[1].as_str();
    let epic_id = args[2].as_str();

    let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
    let config = match ConductorConfig::discover(&cwd) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Invalid configuration: {}", e);
            std::process::exit(2);
        }
    };

    let store = BeadsStore::from_config(&config.store);
    if !store.is_initialized() {
        eprintln!(
            "No beads workspace at {}; run `bd init` there or set [store].workspace",
            config.store.workspace.display()
        );
        std::process::exit(2);
    }
    let executor = CommandExecutor::from_config(&config.dispatch, config.store.workspace.clone());
    let orchestrator = Orchestrator::new(store, executor, config);

    let code = match command {
        "run" => match orchestrator.run(epic_id).await {
            Ok(summary) => {
                println!("Epic {}: {:?} after {} steps", summary.epic_id, summary.state, summary.steps);
                for outcome in &summary.outcomes {
                    println!("  {} [{}] {:?}", outcome.task_id, outcome.path, outcome.result);
                }
                for halt in &summary.halts {
                    println!("\n{}", halt);
                }
                match summary.state {
                    RunState::Complete => 0,
                    RunState::Waiting => 0,
                    RunState::Halted => 1,
                }
            }
            Err(e) => {
                eprintln!("Run failed: {}", e);
                1
            }
        },
        "step" => match orchestrator.step(epic_id).await {
            Ok(StepOutcome::Progressed { batch, outcomes, halts }) => {
                println!("Ran batch {}", batch.task_ids.join(", "));
                for outcome in &outcomes {
                    println!("  {} [{}] {:?}", outcome.task_id, outcome.path, outcome.result);
                }
                for halt in &halts {
                    println!("\n{}", halt);
                }
                0
            }
            Ok(StepOutcome::Waiting { report, .. }) => {
                println!("{}", report);
                0
            }
            Ok(StepOutcome::Halted(halts)) => {
                for halt in &halts {
                    println!("{}", halt);
                }
                1
            }
            Ok(StepOutcome::Complete) => {
                println!("Epic {} is complete", epic_id);
                0
            }
            Err(e) => {
                eprintln!("Step failed: {}", e);
                1
            }
        },
        "status" => match orchestrator.status(epic_id).await {
            Ok(status) => {
                print!("{}", status);
                0
            }
            Err(e) => {
                eprintln!("Status failed: {}", e);
                1
            }
        },
        "analyze" => match orchestrator.analyze(epic_id).await {
            Ok(report) => {
                match serde_json::to_string_pretty(&report) {
                    Ok(json) => println!("{}", json),
                    Err(e) => eprintln!("Failed to encode report: {}", e),
                }
                for proposal in &report.proposals {
                    println!("\n{}", render_proposal(proposal));
                }
                0
            }
            Err(e) => {
                eprintln!("Analyze failed: {}", e);
                1
            }
        },
        other => {
            eprintln!("Unknown command '{}'\n{}", other, USAGE);
            2
        }
    };

    std::process::exit(code);
}
