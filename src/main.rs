mod checkpoint;
mod client;
mod config;
mod daemon;
mod error;
mod git;
mod integrations;
mod model;
mod orchestrator;
mod store;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use client::Client;
use config::HarnessConfig;
use daemon::protocol::Request;
use daemon::{Daemon, Registry};
use model::{AgentConfig, ModeFlags, Verdict};

#[derive(Parser)]
#[command(name = "harness", about = "Drive long-running autonomous coding agent sessions")]
struct Cli {
    /// Project directory (default: current directory)
    #[arg(short, long, default_value = ".")]
    project: PathBuf,

    /// Path to the daemon socket (default: $HARNESS_RUNTIME_DIR/daemon.sock)
    #[arg(long)]
    socket: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the daemon in the foreground.
    Daemon,
    /// Start a new agent against a spec file.
    Start {
        /// Path to the specification file.
        spec: PathBuf,
        /// Human-chosen slug identifying this SpecRun.
        #[arg(long)]
        slug: Option<String>,
        /// Target branch to merge into.
        #[arg(long)]
        target_branch: Option<String>,
        /// Resolve every checkpoint with its kind's default verdict.
        #[arg(long)]
        auto_accept: bool,
        #[arg(long)]
        file_only_mode: bool,
        #[arg(long)]
        skip_mr_creation: bool,
        #[arg(long)]
        skip_puppeteer: bool,
        #[arg(long)]
        skip_test_suite: bool,
        #[arg(long)]
        skip_regression_testing: bool,
        /// Override the AI subprocess command line, e.g. `--command "codex exec"`.
        #[arg(long)]
        command: Option<String>,
    },
    /// List all agents known to the daemon.
    List,
    /// Show one agent's current record.
    Status { agent_id: u64 },
    /// Gracefully stop a running agent.
    Stop { agent_id: u64 },
    /// Remove a stopped agent's record.
    Remove { agent_id: u64 },
    /// Resolve a pending checkpoint.
    Resolve {
        agent_id: u64,
        checkpoint_id: String,
        #[arg(value_enum)]
        verdict: VerdictArg,
        #[arg(long)]
        modifications: Option<String>,
        #[arg(long)]
        notes: Option<String>,
    },
    /// Tail an agent's session log.
    Logs {
        agent_id: u64,
        /// Number of lines to show from the end.
        #[arg(short, long, default_value_t = 50)]
        tail: usize,
    },
}

#[derive(Debug, Clone, clap::ValueEnum)]
enum VerdictArg {
    Approved,
    Modified,
    Rejected,
}

impl From<VerdictArg> for Verdict {
    fn from(v: VerdictArg) -> Self {
        match v {
            VerdictArg::Approved => Verdict::Approved,
            VerdictArg::Modified => Verdict::Modified,
            VerdictArg::Rejected => Verdict::Rejected,
        }
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();
    let socket_path = cli.socket.clone().unwrap_or_else(daemon::server::default_socket_path);

    let exit_code = match cli.command {
        Commands::Daemon => cmd_daemon(&socket_path).await,
        Commands::Start { .. } => cmd_start(&cli.project, &socket_path, cli.command).await,
        Commands::List => cmd_list(&socket_path).await,
        Commands::Status { agent_id } => cmd_status(&socket_path, agent_id).await,
        Commands::Stop { agent_id } => cmd_stop(&socket_path, agent_id).await,
        Commands::Remove { agent_id } => cmd_remove(&socket_path, agent_id).await,
        Commands::Resolve { agent_id, checkpoint_id, verdict, modifications, notes } => {
            cmd_resolve(&socket_path, agent_id, &checkpoint_id, verdict, modifications, notes).await
        }
        Commands::Logs { agent_id, tail } => cmd_logs(&cli.project, agent_id, tail).await,
    };

    std::process::exit(exit_code);
}

async fn cmd_daemon(socket_path: &PathBuf) -> i32 {
    let registry_path = daemon::server::default_registry_path();
    let registry = match Registry::load(registry_path) {
        Ok(r) => r,
        Err(e) => {
            eprintln!("failed to load registry: {e}");
            return 1;
        }
    };
    let daemon = std::sync::Arc::new(Daemon::new(registry));
    match daemon.serve(socket_path).await {
        Ok(()) => 0,
        Err(e) => {
            eprintln!("daemon error: {e}");
            1
        }
    }
}

async fn cmd_start(project: &PathBuf, socket_path: &PathBuf, command: Commands) -> i32 {
    let Commands::Start {
        spec,
        slug,
        target_branch,
        auto_accept,
        file_only_mode,
        skip_mr_creation,
        skip_puppeteer,
        skip_test_suite,
        skip_regression_testing,
        command,
    } = command
    else {
        unreachable!("cmd_start only called with Commands::Start")
    };

    match std::fs::metadata(&spec) {
        Ok(m) if m.len() >= 50 => {}
        Ok(_) => {
            eprintln!("spec file {} is smaller than 50 bytes; refusing to start", spec.display());
            return 1;
        }
        Err(e) => {
            eprintln!("cannot read spec file {}: {e}", spec.display());
            return 1;
        }
    }

    let harness_config = HarnessConfig::load_or_default(project);
    let slug = slug.unwrap_or_else(|| {
        spec.file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| "spec".to_string())
    });

    let agent_config = AgentConfig {
        project_dir: project.clone(),
        spec_path: spec,
        spec_slug: slug,
        target_branch: target_branch.unwrap_or(harness_config.defaults.target_branch),
        auto_accept,
        mode_flags: ModeFlags {
            file_only_mode,
            skip_mr_creation,
            skip_puppeteer,
            skip_test_suite,
            skip_regression_testing,
        },
        command: command
            .map(|c| c.split_whitespace().map(str::to_string).collect())
            .or(harness_config.defaults.command),
    };

    let mut client = match Client::connect(socket_path).await {
        Ok(c) => c,
        Err(e) => {
            eprintln!("{e}");
            return 1;
        }
    };
    match client.call(Request::Start(agent_config)).await {
        Ok(resp) if resp.ok => {
            println!("{}", serde_json::to_string_pretty(&resp.value).unwrap_or_default());
            0
        }
        Ok(resp) => {
            eprintln!("Error: {}", resp.error.unwrap_or_default());
            1
        }
        Err(e) => {
            eprintln!("{e}");
            1
        }
    }
}

async fn cmd_list(socket_path: &PathBuf) -> i32 {
    simple_call(socket_path, Request::List).await
}

async fn cmd_status(socket_path: &PathBuf, agent_id: u64) -> i32 {
    simple_call(socket_path, Request::Status { agent_id }).await
}

async fn cmd_stop(socket_path: &PathBuf, agent_id: u64) -> i32 {
    simple_call(socket_path, Request::Stop { agent_id }).await
}

async fn cmd_remove(socket_path: &PathBuf, agent_id: u64) -> i32 {
    simple_call(socket_path, Request::Remove { agent_id }).await
}

async fn cmd_resolve(
    socket_path: &PathBuf,
    agent_id: u64,
    checkpoint_id: &str,
    verdict: VerdictArg,
    modifications: Option<String>,
    human_notes: Option<String>,
) -> i32 {
    let modifications = match modifications {
        Some(raw) => match serde_json::from_str(&raw) {
            Ok(v) => Some(v),
            Err(e) => {
                eprintln!("--modifications must be valid JSON: {e}");
                return 1;
            }
        },
        None => None,
    };
    simple_call(
        socket_path,
        Request::ResolveCheckpoint {
            agent_id,
            checkpoint_id: checkpoint_id.to_string(),
            verdict: verdict.into(),
            modifications,
            human_notes,
        },
    )
    .await
}

async fn cmd_logs(project: &PathBuf, agent_id: u64, tail: usize) -> i32 {
    let runs_dir = project.join(".claude-agent");
    let Ok(entries) = std::fs::read_dir(&runs_dir) else {
        eprintln!("no workspace found under {}", runs_dir.display());
        return 1;
    };
    let mut log_files = Vec::new();
    for run_dir in entries.flatten() {
        let run_logs = run_dir.path().join("logs");
        if let Ok(files) = std::fs::read_dir(&run_logs) {
            for f in files.flatten() {
                if f.file_name().to_string_lossy().starts_with(&format!("{agent_id}-")) {
                    log_files.push(f.path());
                }
            }
        }
    }
    log_files.sort();
    let Some(latest) = log_files.last() else {
        eprintln!("no log file found for agent {agent_id}");
        return 1;
    };
    match std::fs::read_to_string(latest) {
        Ok(content) => {
            let lines: Vec<&str> = content.lines().collect();
            let start = lines.len().saturating_sub(tail);
            for line in &lines[start..] {
                println!("{line}");
            }
            0
        }
        Err(e) => {
            eprintln!("error reading log: {e}");
            1
        }
    }
}

/// Shared path for the read-only commands: call, print the value (or
/// error), and map the result to an exit code. `waiting_checkpoint`
/// status is surfaced with exit code 2 (§6) so scripts can distinguish
/// "pending" from "done" without parsing JSON.
async fn simple_call(socket_path: &PathBuf, request: Request) -> i32 {
    let mut client = match Client::connect(socket_path).await {
        Ok(c) => c,
        Err(e) => {
            eprintln!("{e}");
            return 1;
        }
    };
    match client.call(request).await {
        Ok(resp) if resp.ok => {
            let is_waiting = resp
                .value
                .as_ref()
                .and_then(|v| v.get("status"))
                .and_then(|s| s.as_str())
                .map(|s| s == "waiting_checkpoint")
                .unwrap_or(false);
            println!("{}", serde_json::to_string_pretty(&resp.value).unwrap_or_default());
            if is_waiting {
                2
            } else {
                0
            }
        }
        Ok(resp) => {
            eprintln!("Error: {}", resp.error.unwrap_or_default());
            1
        }
        Err(e) => {
            eprintln!("{e}");
            1
        }
    }
}
