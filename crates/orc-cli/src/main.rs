use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use orc_core::workflow::{ExecutionPlan, WorkflowDefinition};

#[derive(Parser)]
#[command(name = "orc", version, about = "Declarative multi-agent workflow orchestrator")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Validate one or more workflow definition files: schema, then DAG
    /// business rules (duplicate stages, unknown dependencies, cycles).
    Validate {
        /// Workflow YAML files to validate.
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    orc_core::init_tracing();

    let cli = Cli::parse();

    match cli.command {
        Command::Validate { files } => Ok(validate(&files)),
    }
}

fn validate(files: &[PathBuf]) -> ExitCode {
    let mut any_invalid = false;

    for path in files {
        match validate_one(path) {
            Ok(()) => {
                println!("{}: Valid", path.display());
            }
            Err(errors) => {
                any_invalid = true;
                println!("{}: Invalid", path.display());
                for error in errors {
                    println!("  - {error}");
                }
            }
        }
    }

    if any_invalid {
        println!("\nvalidation failed: one or more files contain errors");
        ExitCode::FAILURE
    } else {
        println!("\nall {} file(s) valid", files.len());
        ExitCode::SUCCESS
    }
}

/// Validate a single file's schema and DAG business rules, collecting every
/// error found rather than stopping at the first.
fn validate_one(path: &PathBuf) -> Result<(), Vec<String>> {
    let data = std::fs::read_to_string(path)
        .map_err(|e| vec![format!("reading {}: {e}", path.display())])?;

    let definition: WorkflowDefinition =
        serde_yaml::from_str(&data).map_err(|e| vec![format!("schema error: {e}")])?;

    let mut errors = definition.validate();

    if let Err(err) = ExecutionPlan::build(&definition.stages) {
        errors.push(err.to_string());
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}
