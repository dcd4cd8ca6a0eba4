//! `pipeline` command-line entry point.

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};

use pipeline::core::resume::find_resume_point;
use pipeline::exit_codes;
use pipeline::io::agent::CommandInvoker;
use pipeline::io::config::load_config;
use pipeline::io::git::{Git, GitWorkflow};
use pipeline::io::init::{InitOptions, ProjectPaths, init_project};
use pipeline::io::scaffold::HeadingScaffolder;
use pipeline::io::state_store::load_state;
use pipeline::io::templates::PromptTemplates;
use pipeline::logging;
use pipeline::walker::{Collaborators, WalkOutcome, run_pipeline};

#[derive(Parser)]
#[command(
    name = "pipeline",
    version,
    about = "Resumable milestone/phase/task workflow driven by agent CLIs"
)]
struct Cli {
    /// Project root containing `.pipeline/`.
    #[arg(long, global = true, default_value = ".")]
    root: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create `.pipeline/state.json`, a default config and milestone spec placeholders.
    Init {
        /// Project name recorded in the state file.
        #[arg(long)]
        project: String,
        /// Milestone id; repeat for several (lexical order is processing order).
        #[arg(long = "milestone", required = true)]
        milestones: Vec<String>,
        /// Overwrite an existing state file and config.
        #[arg(short, long)]
        force: bool,
    },
    /// Advance the workflow until it finishes or reaches a phase review gate.
    Run {
        /// Walk a scratch copy with placeholder agents; the project is left untouched.
        #[arg(long)]
        dry_run: bool,
    },
    /// Print the next unit of work.
    Status,
    /// Check the state file against its schema and invariants, and the config.
    Validate,
}

fn main() {
    logging::init();
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("{err:#}");
            std::process::exit(exit_codes::FAILED);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    let paths = ProjectPaths::new(cli.root);
    match cli.command {
        Command::Init {
            project,
            milestones,
            force,
        } => cmd_init(&paths, project, milestones, force),
        Command::Run { dry_run } => cmd_run(&paths, dry_run),
        Command::Status => cmd_status(&paths),
        Command::Validate => cmd_validate(&paths),
    }
}

fn cmd_init(
    paths: &ProjectPaths,
    project: String,
    milestones: Vec<String>,
    force: bool,
) -> Result<i32> {
    init_project(
        &paths.root,
        &InitOptions {
            project,
            milestones,
            force,
        },
    )?;
    println!("initialized {}", paths.pipeline_dir.display());
    Ok(exit_codes::OK)
}

fn cmd_run(paths: &ProjectPaths, dry_run: bool) -> Result<i32> {
    let mut config = load_config(&paths.config_path)?;
    config.dry_run |= dry_run;

    let agent = CommandInvoker::new(&config, paths.root.clone(), paths.logs_dir.clone());
    let templates = PromptTemplates::new(paths.templates_dir(&config));
    let git = GitWorkflow::new(Git::new(&paths.root), config.git.clone());
    let outcome = run_pipeline(
        paths,
        &config,
        Collaborators {
            agent: &agent,
            templates: &templates,
            scaffolder: &HeadingScaffolder,
            git: &git,
        },
    )?;

    match outcome {
        WalkOutcome::Finished => {
            println!("complete");
            Ok(exit_codes::OK)
        }
        WalkOutcome::Halted {
            milestone_id,
            phase_id,
        } => {
            println!(
                "phase {milestone_id}/{phase_id} completed; review it, then run again to continue"
            );
            Ok(exit_codes::REVIEW_GATE)
        }
    }
}

fn cmd_status(paths: &ProjectPaths) -> Result<i32> {
    let state = load_state(&paths.state_path)?;
    match find_resume_point(&state) {
        Some(point) => {
            println!("{point}");
            Ok(exit_codes::OK)
        }
        None => {
            println!("complete");
            Ok(exit_codes::COMPLETE)
        }
    }
}

fn cmd_validate(paths: &ProjectPaths) -> Result<i32> {
    load_config(&paths.config_path)?;
    let state = load_state(&paths.state_path)?;
    println!(
        "ok: {} ({} milestones)",
        state.project_name,
        state.milestones.len()
    );
    Ok(exit_codes::OK)
}
