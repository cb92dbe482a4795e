//! hivectl - CLI client for hived
//!
//! Starts and inspects runs, and is the command agents use to peek, claim
//! and report steps.

use mimalloc::MiMalloc;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

mod client;
mod render;

use clap::{Parser, Subcommand};
use client::{Client, ClientError};
use std::io::Read;

/// CLI client for the hived workflow daemon.
#[derive(Parser)]
#[command(name = "hivectl")]
#[command(about = "Control plane for the hived workflow daemon")]
#[command(version)]
struct Cli {
    /// Daemon address
    #[arg(
        long,
        global = true,
        env = "HIVE_ADDR",
        default_value = "http://127.0.0.1:7800"
    )]
    addr: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start and inspect runs
    Run {
        #[command(subcommand)]
        command: RunCommand,
    },

    /// Agent-facing step operations
    Step {
        #[command(subcommand)]
        command: StepCommand,
    },

    /// Print the prompt a polling trigger carries (no daemon required)
    Prompt {
        /// Workflow id
        workflow: String,

        /// Agent role within the workflow
        role: String,

        /// Model the worker session should use
        #[arg(long)]
        model: Option<String>,

        /// Print the worker prompt instead of the polling prompt
        #[arg(long)]
        work: bool,
    },
}

#[derive(Subcommand)]
enum RunCommand {
    /// Start a run of a workflow
    Start {
        /// Workflow id (directory name under the daemon's workflows dir)
        workflow: String,

        /// Task title
        task: String,

        /// URL that receives the run's events
        #[arg(long)]
        notify_url: Option<String>,
    },

    /// List runs, newest first
    List {
        /// Only runs of this workflow
        #[arg(long)]
        workflow: Option<String>,
    },

    /// Show a run with its steps, stories and events
    Status {
        /// Run ID
        run_id: String,
    },
}

#[derive(Subcommand)]
enum StepCommand {
    /// Check for claimable work without side effects; prints HAS_WORK or NO_WORK
    Peek {
        /// Agent identity, e.g. feature-dev_developer
        agent_id: String,
    },

    /// Claim the next step; prints its JSON or NO_WORK
    Claim {
        /// Agent identity, e.g. feature-dev_developer
        agent_id: String,
    },

    /// Report a step's output
    Complete {
        /// Step ID
        step_id: String,

        /// Output text; read from stdin when omitted or "-"
        output: Option<String>,
    },

    /// Report a step failure
    Fail {
        /// Step ID
        step_id: String,

        /// What went wrong
        error: String,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let client = Client::new(&cli.addr);

    let result = match cli.command {
        Command::Prompt {
            workflow,
            role,
            model,
            work,
        } => {
            show_prompt(&workflow, &role, model.as_deref(), work);
            Ok(())
        }
        Command::Run { command } => run_command(&client, command).await,
        Command::Step { command } => step_command(&client, command).await,
    };

    if let Err(e) = result {
        eprintln!("error: {e}");
        std::process::exit(1);
    }
}

async fn run_command(client: &Client, command: RunCommand) -> Result<(), ClientError> {
    client.wait_for_ready().await?;
    match command {
        RunCommand::Start {
            workflow,
            task,
            notify_url,
        } => {
            let req = client::CreateRunRequest {
                workflow,
                task,
                notify_url,
            };
            let run = client.create_run(&req).await?;
            render::print_run_created(&run);
        }
        RunCommand::List { workflow } => {
            let runs = client.list_runs(workflow.as_deref()).await?;
            render::print_run_list(&runs);
        }
        RunCommand::Status { run_id } => {
            let run = client.get_run(&run_id).await?;
            let steps = client.list_steps(&run_id).await?;
            let stories = client.list_stories(&run_id).await?;
            let events = client.list_events(&run_id).await?;
            render::print_run_details(&run, &steps, &stories, &events);
        }
    }
    Ok(())
}

/// Step commands are run by agents; their stdout is parsed, so it carries
/// only the documented tokens and JSON.
async fn step_command(client: &Client, command: StepCommand) -> Result<(), ClientError> {
    match command {
        StepCommand::Peek { agent_id } => {
            let has_work = client.peek(&agent_id).await?;
            println!("{}", if has_work { "HAS_WORK" } else { "NO_WORK" });
        }
        StepCommand::Claim { agent_id } => match client.claim(&agent_id).await? {
            Some(step) => {
                let json = serde_json::to_string(&step)
                    .map_err(|e| ClientError::InvalidResponse(e.to_string()))?;
                println!("{json}");
            }
            None => println!("NO_WORK"),
        },
        StepCommand::Complete { step_id, output } => {
            let output = match output.as_deref() {
                None | Some("-") => read_stdin()?,
                Some(text) => text.to_string(),
            };
            let result = client.complete(&step_id, &output).await?;
            if result.run_completed {
                println!("Step {step_id} done; run completed");
            } else if result.advanced {
                println!("Step {step_id} done; pipeline advanced");
            } else {
                println!("Step {step_id} done");
            }
        }
        StepCommand::Fail { step_id, error } => {
            let result = client.fail(&step_id, &error).await?;
            if result.run_failed {
                println!("Step {step_id} failed; run failed");
            } else if result.retrying {
                println!("Step {step_id} failed; will retry");
            }
        }
    }
    Ok(())
}

fn read_stdin() -> Result<String, ClientError> {
    let mut buf = String::new();
    std::io::stdin()
        .read_to_string(&mut buf)
        .map_err(|e| ClientError::IoError(e.to_string()))?;
    Ok(buf)
}

fn show_prompt(workflow: &str, role: &str, model: Option<&str>, work: bool) {
    let prompt = if work {
        hive_core::prompt::work_prompt(workflow, role)
    } else {
        hive_core::prompt::polling_prompt(workflow, role, model)
    };
    println!("{prompt}");
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parses_step_complete_without_output() {
        let cli = Cli::try_parse_from(["hivectl", "step", "complete", "abc"]).unwrap();
        match cli.command {
            Command::Step {
                command: StepCommand::Complete { step_id, output },
            } => {
                assert_eq!(step_id, "abc");
                assert!(output.is_none());
            }
            _ => panic!("expected step complete"),
        }
    }

    #[test]
    fn parses_run_start_with_notify_url() {
        let cli = Cli::try_parse_from([
            "hivectl",
            "--addr",
            "http://127.0.0.1:9000",
            "run",
            "start",
            "feature-dev",
            "add login",
            "--notify-url",
            "http://hooks.local/x",
        ])
        .unwrap();
        assert_eq!(cli.addr, "http://127.0.0.1:9000");
        match cli.command {
            Command::Run {
                command:
                    RunCommand::Start {
                        workflow,
                        task,
                        notify_url,
                    },
            } => {
                assert_eq!(workflow, "feature-dev");
                assert_eq!(task, "add login");
                assert_eq!(notify_url.as_deref(), Some("http://hooks.local/x"));
            }
            _ => panic!("expected run start"),
        }
    }
}
