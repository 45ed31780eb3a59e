//! Autonomous CI healing loop.
//!
//! `healer run` clones a repository onto a `<TEAM>_<LEADER>_AI_FIX` branch,
//! repairs failing tests with a model, pushes the fixes and waits for CI.
//! A JSON run record lands in `<workspace>/runs/<run_id>/result.json`.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};

use healer::core::branch::generate_branch_name;
use healer::exit_codes;
use healer::heal::{HealRequest, HealSettings, LiveCollaborators, new_run_id, run_healing};
use healer::io::config::{DEFAULT_CONFIG_FILE, HealerConfig, load_config, write_config};
use healer::io::run_record::{RunRecord, read_run_record, write_run_record};
use healer::logging;
use healer::progress::ProgressEvent;

#[derive(Parser)]
#[command(name = "healer", version, about = "Autonomous CI healing loop")]
struct Cli {
    /// Config file (defaults apply when it does not exist).
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Heal a repository until its tests pass or retries run out.
    Run {
        /// Remote URL or local path of the repository.
        #[arg(long)]
        repo: String,
        /// Branch to clone (remote default when omitted).
        #[arg(long)]
        branch: Option<String>,
        #[arg(long, default_value = "default_team")]
        team: String,
        #[arg(long, default_value = "admin")]
        leader: String,
        /// Override `max_retries` from config.
        #[arg(long)]
        max_retries: Option<u32>,
        /// Print the run record as JSON instead of a summary.
        #[arg(long)]
        json: bool,
    },
    /// Print the working branch name for a team and leader.
    BranchName { team: String, leader: String },
    /// Write a config file populated with defaults.
    InitConfig {
        /// Overwrite an existing file.
        #[arg(short, long)]
        force: bool,
    },
    /// Print a stored run record.
    Show { run_id: String },
}

fn main() {
    let _ = dotenvy::dotenv();
    logging::init("warn");

    let cli = Cli::parse();
    let code = match dispatch(cli) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("{err:#}");
            exit_codes::INVALID
        }
    };
    std::process::exit(code);
}

fn dispatch(cli: Cli) -> Result<i32> {
    match cli.command {
        Command::Run {
            repo,
            branch,
            team,
            leader,
            max_retries,
            json,
        } => {
            let config = load_config(&cli.config)?;
            let request = HealRequest {
                run_id: new_run_id(),
                repo_url: repo,
                source_branch: branch,
                team_name: team,
                leader_name: leader,
                max_retries: max_retries.unwrap_or(config.max_retries),
            };
            cmd_run(&config, &request, json)
        }
        Command::BranchName { team, leader } => {
            println!("{}", generate_branch_name(&team, &leader)?);
            Ok(exit_codes::OK)
        }
        Command::InitConfig { force } => cmd_init_config(&cli.config, force),
        Command::Show { run_id } => {
            let config = load_config(&cli.config)?;
            let record = read_run_record(&config.workspace_dir, &run_id)?;
            println!(
                "{}",
                serde_json::to_string_pretty(&record).context("serialize run record")?
            );
            Ok(exit_codes::OK)
        }
    }
}

fn cmd_run(config: &HealerConfig, request: &HealRequest, json: bool) -> Result<i32> {
    let live = LiveCollaborators::from_config(config, &request.repo_url)?;
    let settings = HealSettings::from_config(config);

    let outcome = run_healing(request, live.collaborators(), &settings, |node, _, state| {
        let event = ProgressEvent::update(node, state);
        eprintln!(
            "[{:>3}%] {} (iteration {})",
            event.progress, event.current_step, event.iteration
        );
    })?;

    let path = write_run_record(&settings.workspace_dir, &outcome.state)?;
    let record = RunRecord::from_state(&outcome.state);
    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&record).context("serialize run record")?
        );
    } else {
        print_summary(&record, &path);
    }

    Ok(match record.final_status {
        _ if record.fatal_error.is_some() => exit_codes::INVALID,
        Some(status) if status.is_success() => exit_codes::OK,
        _ => exit_codes::FAILED,
    })
}

fn print_summary(record: &RunRecord, path: &Path) {
    let status = record.final_status.map_or("unknown", |status| status.as_str());
    println!("run:        {}", record.run_id);
    println!("status:     {status}");
    if let Some(branch) = &record.branch_name {
        println!("branch:     {branch}");
    }
    println!("iterations: {}", record.iterations);
    println!("failures:   {}", record.failures_detected);
    println!("commits:    {}", record.commits);
    println!("score:      {}", record.score);
    if let Some(error) = &record.fatal_error {
        println!("error:      {error}");
    }
    println!("record:     {}", path.display());
}

fn cmd_init_config(path: &Path, force: bool) -> Result<i32> {
    if path.exists() && !force {
        bail!("{} already exists (use --force to overwrite)", path.display());
    }
    write_config(path, &HealerConfig::default())?;
    println!("wrote {}", path.display());
    Ok(exit_codes::OK)
}
