//! `conductor` command-line entry point.
//!
//! Each subcommand loads `conductor.toml`, wires the shipped adapters into a
//! [`Services`] bundle, and makes one call into the engine.

use std::path::PathBuf;
use std::thread;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Args, Parser, Subcommand};
use conductor::error::is_precondition;
use conductor::exit_codes;
use conductor::io::checks::ShellCheckRunner;
use conductor::io::config::{DEFAULT_CONFIG_FILE, IssueSource, PipelineConfig, load_config};
use conductor::io::context::TemplateContextBuilder;
use conductor::io::events::JsonlEventLog;
use conductor::io::git::GitWorktrees;
use conductor::io::issues::{FileIssueTracker, GhIssueTracker, IssueTracker};
use conductor::io::session::TmuxSessions;
use conductor::io::store::FsStore;
use conductor::logging;
use conductor::orchestrator::{AdvanceReport, Orchestrator};
use conductor::services::Services;
use conductor::stage::run_stage;
use conductor::state::PipelineState;

#[derive(Parser)]
#[command(
    name = "conductor",
    version,
    about = "Drive issues through staged agent pipelines with deterministic check gates"
)]
struct Cli {
    /// Pipeline definition.
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create, advance, and inspect single pipelines.
    #[command(subcommand)]
    Pipeline(PipelineCommand),
    /// Run stages directly, without applying transitions.
    #[command(subcommand)]
    Stage(StageCommand),
    /// Supervise every pipeline at once.
    #[command(subcommand)]
    Orchestrator(OrchestratorCommand),
}

#[derive(Subcommand)]
enum PipelineCommand {
    /// Fetch the issue, provision a worktree, and start at the first stage.
    Create(IssueArg),
    /// Run the current stage once and apply the resulting transition.
    Advance(IssueArg),
    /// Show one pipeline.
    Status {
        #[command(flatten)]
        issue: IssueArg,
        /// Print the full state document.
        #[arg(long)]
        json: bool,
    },
    /// Start the next attempt of the current stage (ignores the attempt cap).
    Retry {
        #[command(flatten)]
        issue: IssueArg,
        #[arg(long, default_value = "manual retry")]
        reason: String,
    },
    /// Mark the pipeline failed.
    Fail {
        #[command(flatten)]
        issue: IssueArg,
        #[arg(long)]
        reason: String,
    },
    /// Mark the pipeline failed and remove its worktree.
    Abort(IssueArg),
}

#[derive(Subcommand)]
enum StageCommand {
    /// Execute the current stage attempt and print its result.
    Run(IssueArg),
}

#[derive(Subcommand)]
enum OrchestratorCommand {
    /// Decide skip, steer, or advance for every in-flight pipeline.
    CheckIn {
        /// Keep ticking at the configured poll interval.
        #[arg(long)]
        watch: bool,
    },
    /// Summarize every pipeline.
    Status,
}

#[derive(Args)]
struct IssueArg {
    /// Issue identifier.
    issue: String,
}

/// The shipped adapters, owned for the lifetime of one command.
struct Adapters {
    sessions: TmuxSessions,
    checks: ShellCheckRunner,
    store: FsStore,
    context: TemplateContextBuilder,
    events: JsonlEventLog,
    issues: Box<dyn IssueTracker>,
    workspace: GitWorktrees,
}

impl Adapters {
    fn new(config: &PipelineConfig) -> Self {
        let state_dir = config.state_dir();
        let issues: Box<dyn IssueTracker> = match config.issues.source {
            IssueSource::Github => Box::new(GhIssueTracker::new(config.issues.repo.clone())),
            IssueSource::Files => Box::new(FileIssueTracker::new(config.issues_dir())),
        };
        Self {
            sessions: TmuxSessions::new(
                state_dir.join("sessions"),
                config.defaults.agent_command.clone(),
                config.defaults.flags.clone(),
                config.defaults.output_limit_bytes,
            ),
            checks: ShellCheckRunner::new(config.defaults.output_limit_bytes),
            store: FsStore::new(&state_dir),
            context: TemplateContextBuilder::new(state_dir.join("context")),
            events: JsonlEventLog::new(&state_dir),
            issues,
            workspace: GitWorktrees::new(config.repo_dir(), config.worktree_dir()),
        }
    }

    fn services(&self) -> Services<'_> {
        Services {
            sessions: &self.sessions,
            checks: &self.checks,
            store: &self.store,
            context: &self.context,
            events: &self.events,
            issues: self.issues.as_ref(),
            workspace: &self.workspace,
        }
    }
}

fn main() {
    logging::init();
    if let Err(err) = run() {
        eprintln!("error: {err:#}");
        let code = if is_precondition(&err) {
            exit_codes::PRECONDITION
        } else {
            exit_codes::ERROR
        };
        std::process::exit(code);
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse();
    let config = load_config(&cli.config)?;
    let adapters = Adapters::new(&config);
    let services = adapters.services();
    let orchestrator = Orchestrator::new(services, &config);

    match cli.command {
        Command::Pipeline(command) => cmd_pipeline(&orchestrator, command),
        Command::Stage(StageCommand::Run(IssueArg { issue })) => {
            let result = run_stage(&services, &config, &issue)?;
            println!("{}", serde_json::to_string_pretty(&result).context("serialize run result")?);
            Ok(())
        }
        Command::Orchestrator(OrchestratorCommand::CheckIn { watch }) => {
            cmd_check_in(&orchestrator, &config, watch)
        }
        Command::Orchestrator(OrchestratorCommand::Status) => {
            let pipelines = orchestrator.list()?;
            if pipelines.is_empty() {
                println!("no pipelines");
            }
            for state in &pipelines {
                println!("{}", status_line(state));
            }
            Ok(())
        }
    }
}

fn cmd_pipeline(orchestrator: &Orchestrator<'_>, command: PipelineCommand) -> Result<()> {
    match command {
        PipelineCommand::Create(IssueArg { issue }) => {
            let state = orchestrator.create(&issue)?;
            println!(
                "created pipeline {} at stage {} ({})",
                state.issue,
                state.current_stage,
                state.workdir.display()
            );
        }
        PipelineCommand::Advance(IssueArg { issue }) => {
            let report = orchestrator.advance(&issue)?;
            println!("{}", report_line(&report));
        }
        PipelineCommand::Status { issue, json } => {
            let state = orchestrator.status(&issue.issue)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&state).context("serialize state")?);
            } else {
                println!("{}", status_line(&state));
                for entry in &state.stage_history {
                    println!(
                        "  {} #{}: {} ({} fix rounds)",
                        entry.stage,
                        entry.attempt,
                        entry.outcome.as_str(),
                        entry.fix_rounds
                    );
                }
            }
        }
        PipelineCommand::Retry { issue, reason } => {
            let state = orchestrator.retry(&issue.issue, &reason)?;
            println!("{}", status_line(&state));
        }
        PipelineCommand::Fail { issue, reason } => {
            let state = orchestrator.fail(&issue.issue, &reason)?;
            println!("{}", status_line(&state));
        }
        PipelineCommand::Abort(IssueArg { issue }) => {
            let state = orchestrator.abort(&issue)?;
            println!("{}", status_line(&state));
        }
    }
    Ok(())
}

fn cmd_check_in(orchestrator: &Orchestrator<'_>, config: &PipelineConfig, watch: bool) -> Result<()> {
    loop {
        let reports = orchestrator.check_in(Utc::now())?;
        for report in &reports {
            println!("{report}");
        }
        if !watch {
            return Ok(());
        }
        thread::sleep(config.poll_interval());
    }
}

fn report_line(report: &AdvanceReport) -> String {
    format!(
        "{} {} #{}: {} ({})",
        report.issue, report.stage, report.attempt, report.action, report.message
    )
}

fn status_line(state: &PipelineState) -> String {
    let mut line = format!(
        "{} [{}] {} #{}",
        state.issue, state.status, state.current_stage, state.current_attempt
    );
    if let Some(session) = &state.current_session {
        line.push_str(&format!(" session={}", session.handle));
    }
    if let Some(err) = &state.last_error {
        line.push_str(&format!(" last_error={err}"));
    }
    line
}
