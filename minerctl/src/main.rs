//! `minerctl`: the miner agent's command line.

mod system;

use std::{path::PathBuf, process::ExitCode};

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use dialoguer::{Confirm, Password, console::Term};
use miner_config::{ConfigLoader, ConfigLoaderOptions};
use miner_core::{
    AgentContext, AgentError, JobBackend, LifecycleFailure, LifecycleManager,
    LifecycleReport, RunOptions,
};
use miner_model::{ExitStatus, InterruptReason, RegisterMinerRequest};
use tokio_util::sync::CancellationToken;
use tracing::warn;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Lifecycle failure other than an authentication problem.
const EXIT_FAILURE: u8 = 1;
const EXIT_NEEDS_LOGIN: u8 = 2;
/// The job ran but its script did not succeed (`--fail-on-job-error`).
const EXIT_JOB_FAILED: u8 = 3;
/// Stopped by Ctrl-C, as shells report SIGINT.
const EXIT_INTERRUPTED: u8 = 130;

#[derive(Parser)]
#[command(name = "minerctl", about = "Miner agent: claim and run training jobs")]
struct Cli {
    /// TOML config file overlaid on the defaults
    #[arg(long, global = true, env = "MINER_CONFIG")]
    config: Option<PathBuf>,
    /// Log at debug level unless RUST_LOG says otherwise
    #[arg(long, short, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Log in and store the session token and miner id
    Login {
        #[arg(long)]
        username: String,
        /// Prompted for when omitted
        #[arg(long, env = "MINER_PASSWORD", hide_env_values = true)]
        password: Option<String>,
    },
    /// Forget the stored credentials
    Logout {
        /// Also delete every job workspace
        #[arg(long)]
        purge_jobs: bool,
    },
    /// Register a new miner account
    Register {
        #[arg(long)]
        ethereum_address: String,
        #[arg(long)]
        username: String,
        #[arg(long)]
        email: String,
    },
    /// List jobs waiting for a miner
    PendingJobs,
    /// Show the backend's record of a job
    JobDetails {
        #[arg(long)]
        doc_id: String,
    },
    /// Claim a job and run it: fetch, provision, execute
    StartTraining {
        #[arg(long)]
        doc_id: String,
        /// Skip the confirmation prompt
        #[arg(long, short)]
        yes: bool,
        /// Keep previously downloaded artifacts that still verify
        #[arg(long)]
        reuse_artifacts: bool,
        /// Exit with status 3 when the training script fails
        #[arg(long)]
        fail_on_job_error: bool,
    },
    /// Download a job's artifacts without running it
    FetchJob {
        #[arg(long)]
        doc_id: String,
        #[arg(long)]
        reuse_artifacts: bool,
    },
    /// Open a fetched job's script in $EDITOR
    EditScript {
        #[arg(long)]
        doc_id: String,
    },
    /// Run a previously fetched job
    ExecuteJob {
        #[arg(long)]
        doc_id: String,
        #[arg(long)]
        fail_on_job_error: bool,
    },
    /// Remove a stale job lock left by a dead process
    Unlock {
        #[arg(long)]
        doc_id: String,
    },
    /// Show local job workspaces
    Status {
        /// Limit the report to one job
        #[arg(long)]
        doc_id: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_level.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let config = ConfigLoader::new(ConfigLoaderOptions {
        config_path: cli.config,
        ..Default::default()
    })
    .load()
    .context("failed to load configuration")?;
    config
        .ensure_directories()
        .context("failed to create data directories")?;
    let ctx = AgentContext::load(config);

    match cli.command {
        Command::Login { username, password } => {
            let password = match password {
                Some(password) => password,
                None => Password::new()
                    .with_prompt("Password")
                    .interact_on(&Term::stderr())?,
            };
            let result = async {
                let credentials = ctx.backend()?.login(&username, &password).await?;
                ctx.credential_store().save(&credentials)?;
                Ok::<_, AgentError>(credentials)
            }
            .await;
            match result {
                Ok(credentials) => {
                    println!("logged in as miner {}", credentials.miner_id());
                    Ok(ExitCode::SUCCESS)
                }
                Err(err) => Ok(report_error(&err)),
            }
        }
        Command::Logout { purge_jobs } => {
            ctx.credential_store()
                .clear()
                .context("failed to clear credentials")?;
            if purge_jobs {
                ctx.workspace()
                    .remove_all()
                    .context("failed to remove job workspaces")?;
            }
            println!("logged out");
            Ok(ExitCode::SUCCESS)
        }
        Command::Register {
            ethereum_address,
            username,
            email,
        } => {
            let request = RegisterMinerRequest {
                ethereum_address,
                username,
                email,
            };
            let result = async {
                Ok::<_, AgentError>(ctx.backend()?.register_miner(&request).await?)
            }
            .await;
            match result {
                Ok(body) => {
                    print_json(&body)?;
                    Ok(ExitCode::SUCCESS)
                }
                Err(err) => Ok(report_error(&err)),
            }
        }
        Command::PendingJobs => {
            let result = async {
                let credentials = ctx.require_credentials()?;
                Ok::<_, AgentError>(ctx.backend()?.pending_jobs(credentials).await?)
            }
            .await;
            match result {
                Ok(jobs) => {
                    print_json(&jobs)?;
                    Ok(ExitCode::SUCCESS)
                }
                Err(err) => Ok(report_error(&err)),
            }
        }
        Command::JobDetails { doc_id } => {
            let result = async {
                let credentials = ctx.require_credentials()?;
                Ok::<_, AgentError>(
                    ctx.backend()?.job_details(credentials, &doc_id).await?,
                )
            }
            .await;
            match result {
                Ok(body) => {
                    print_json(&body)?;
                    Ok(ExitCode::SUCCESS)
                }
                Err(err) => Ok(report_error(&err)),
            }
        }
        Command::StartTraining {
            doc_id,
            yes,
            reuse_artifacts,
            fail_on_job_error,
        } => {
            if !yes {
                let proceed = Confirm::new()
                    .with_prompt(format!(
                        "Start training job {doc_id} on this machine?"
                    ))
                    .default(false)
                    .interact_on(&Term::stderr())?;
                if !proceed {
                    println!("aborted");
                    return Ok(ExitCode::SUCCESS);
                }
            }

            let manager = match LifecycleManager::from_context(&ctx) {
                Ok(manager) => manager,
                Err(err) => return Ok(report_error(&err)),
            };
            let system_details = tokio::task::spawn_blocking(system::snapshot)
                .await
                .context("collecting system details panicked")?;
            let options = RunOptions {
                reuse_artifacts: reuse_artifacts || ctx.config().reuse_artifacts,
                system_details,
                cancel: cancel_on_ctrl_c(),
            };
            let outcome = manager.start_training(&ctx, &doc_id, options).await;
            Ok(finish_run(outcome, fail_on_job_error))
        }
        Command::FetchJob {
            doc_id,
            reuse_artifacts,
        } => {
            let manager = match LifecycleManager::from_context(&ctx) {
                Ok(manager) => manager,
                Err(err) => return Ok(report_error(&err)),
            };
            let reuse = reuse_artifacts || ctx.config().reuse_artifacts;
            match manager
                .fetch_job(&ctx, &doc_id, reuse, cancel_on_ctrl_c())
                .await
            {
                Ok(metadata) => {
                    for record in &metadata.artifacts {
                        println!(
                            "{:<16} {:>12} bytes  sha256 {}",
                            record.kind.as_str(),
                            record.bytes,
                            record.sha256
                        );
                    }
                    println!(
                        "fetched {doc_id}; run it with `minerctl execute-job --doc-id {doc_id}`"
                    );
                    Ok(ExitCode::SUCCESS)
                }
                Err(failure) => Ok(report_failure(&failure)),
            }
        }
        Command::EditScript { doc_id } => {
            edit_script(&ctx, &doc_id).await?;
            Ok(ExitCode::SUCCESS)
        }
        Command::ExecuteJob {
            doc_id,
            fail_on_job_error,
        } => {
            let manager = match LifecycleManager::from_context(&ctx) {
                Ok(manager) => manager,
                Err(err) => return Ok(report_error(&err)),
            };
            let outcome = manager.execute_job(&doc_id, cancel_on_ctrl_c()).await;
            Ok(finish_run(outcome, fail_on_job_error))
        }
        Command::Unlock { doc_id } => {
            if ctx.workspace().break_lock(&doc_id)? {
                println!("removed lock on {doc_id}");
            } else {
                println!("{doc_id} is not locked");
            }
            Ok(ExitCode::SUCCESS)
        }
        Command::Status { doc_id } => {
            match doc_id {
                Some(doc_id) => print_job_status(&ctx, &doc_id)?,
                None => print_overview(&ctx)?,
            }
            Ok(ExitCode::SUCCESS)
        }
    }
}

/// Token cancelled by the first Ctrl-C, which stops whichever stage is
/// running. A second Ctrl-C exits at once.
fn cancel_on_ctrl_c() -> CancellationToken {
    let token = CancellationToken::new();
    let child = token.clone();
    tokio::spawn(async move {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!(error = %err, "cannot listen for Ctrl-C");
            return;
        }
        warn!("interrupt received; stopping the job (Ctrl-C again to exit now)");
        child.cancel();

        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("interrupted again; exiting without cleanup");
            std::process::exit(i32::from(EXIT_INTERRUPTED));
        }
    });
    token
}

fn finish_run(
    outcome: Result<LifecycleReport, LifecycleFailure>,
    fail_on_job_error: bool,
) -> ExitCode {
    match outcome {
        Ok(report) => {
            let result = &report.result;
            println!(
                "job {} completed in {:.1}s: {}",
                report.doc_id,
                result.duration().as_secs_f64(),
                result.exit_status.describe()
            );
            let cancelled = matches!(
                result.exit_status,
                ExitStatus::Interrupted { reason: InterruptReason::Cancelled }
            );
            if cancelled {
                ExitCode::from(EXIT_INTERRUPTED)
            } else if result.succeeded() || !fail_on_job_error {
                ExitCode::SUCCESS
            } else {
                ExitCode::from(EXIT_JOB_FAILED)
            }
        }
        Err(failure) => report_failure(&failure),
    }
}

fn report_failure(failure: &LifecycleFailure) -> ExitCode {
    eprintln!("error: {failure}: {}", failure.cause);
    print_sources(&failure.cause);
    exit_code_for(&failure.cause)
}

fn report_error(err: &AgentError) -> ExitCode {
    eprintln!("error: {err}");
    print_sources(err);
    exit_code_for(err)
}

fn print_sources(err: &AgentError) {
    let mut source = std::error::Error::source(err);
    while let Some(cause) = source {
        eprintln!("  caused by: {cause}");
        source = cause.source();
    }
}

fn exit_code_for(err: &AgentError) -> ExitCode {
    if matches!(err, AgentError::Cancelled) {
        ExitCode::from(EXIT_INTERRUPTED)
    } else if err.needs_login() {
        eprintln!("hint: run `minerctl login --username <name>`");
        ExitCode::from(EXIT_NEEDS_LOGIN)
    } else {
        ExitCode::from(EXIT_FAILURE)
    }
}

fn print_json<T: serde::Serialize + ?Sized>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn edit_script(ctx: &AgentContext, doc_id: &str) -> Result<()> {
    let paths = ctx.workspace().paths(doc_id)?;
    let script = paths.script();
    if !script.is_file() {
        bail!(
            "{doc_id} has no script at {}; fetch the job first",
            script.display()
        );
    }

    // EDITOR may carry arguments, e.g. `code --wait`.
    let mut words = ctx.config().editor.split_whitespace();
    let program = words.next().context("EDITOR is empty")?;
    let status = tokio::process::Command::new(program)
        .args(words)
        .arg(&script)
        .status()
        .await
        .with_context(|| format!("failed to launch editor `{program}`"))?;
    if !status.success() {
        bail!("editor exited with {status}");
    }
    Ok(())
}

fn print_job_status(ctx: &AgentContext, doc_id: &str) -> Result<()> {
    let workspace = ctx.workspace();
    let paths = workspace.paths(doc_id)?;
    if !paths.root.is_dir() {
        println!("{doc_id}: no local workspace");
        return Ok(());
    }

    println!("job:       {doc_id}");
    println!("workspace: {}", paths.root.display());
    println!("locked:    {}", workspace.is_locked(doc_id)?);
    match workspace.load_metadata(doc_id) {
        Ok(metadata) => {
            println!("fetched:   {}", metadata.fetched_at.to_rfc3339());
            for record in &metadata.artifacts {
                println!("  {:<16} {:>12} bytes", record.kind.as_str(), record.bytes);
            }
        }
        Err(err) => println!("fetched:   no ({err})"),
    }
    if workspace.has_completed_results(doc_id)? {
        let result = workspace.read_result(doc_id)?;
        println!(
            "result:    {} at {}",
            result.exit_status.describe(),
            result.finished_at.to_rfc3339()
        );
    } else {
        println!("result:    none");
    }
    Ok(())
}

fn print_overview(ctx: &AgentContext) -> Result<()> {
    let jobs = ctx.workspace().list_jobs()?;
    if jobs.is_empty() {
        println!("no job workspaces under {}", ctx.config().jobs_dir().display());
        return Ok(());
    }
    println!("{:<32} {:<8} {:<10} {:<6}", "JOB", "FETCHED", "COMPLETED", "LOCKED");
    for job in jobs {
        println!(
            "{:<32} {:<8} {:<10} {:<6}",
            job.doc_id, job.fetched, job.completed, job.locked
        );
    }
    Ok(())
}
