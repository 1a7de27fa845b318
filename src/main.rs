mod agent;
mod config;
mod events;
mod executor;
mod features;
mod lock;
mod orchestrator;
mod prompts;
mod queues;
mod sessions;
mod workspace;

use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::{Parser, Subcommand};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::config::{CONFIG_FILE, ProjectConfig};
use crate::features::{FeatureStatus, FeatureStore};
use crate::lock::FileLock;
use crate::orchestrator::{Orchestrator, OrchestratorState};
use crate::sessions::{SessionFilter, SessionLog};

#[derive(Parser)]
#[command(
    name = "autodev",
    about = "Drive autonomous coding agents through an implement-merge-verify pipeline"
)]
struct Cli {
    /// Project directory (default: current directory)
    #[arg(short, long, default_value = ".")]
    project: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the scheduler and run until stopped or all features settle
    Run,
    /// Show feature counts and recent activity
    Status,
    /// Ask a running scheduler to stop gracefully
    Stop,
    /// Reopen a failed feature and queue it ahead of new work
    Retry {
        id: u64,
        /// Note passed to the agent alongside the previous session tail
        #[arg(long, default_value = "")]
        note: String,
    },
    /// Like retry, but all other tracks hold until this feature finishes
    Resume {
        id: u64,
        #[arg(long, default_value = "")]
        note: String,
    },
    /// List recorded agent sessions, newest first
    Sessions {
        /// Only sessions for this feature
        #[arg(long)]
        feature: Option<u64>,
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("autodev=info")),
        )
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Run => cmd_run(&cli.project),
        Commands::Status => cmd_status(&cli.project),
        Commands::Stop => cmd_stop(&cli.project),
        Commands::Retry { id, note } => cmd_request(&cli.project, "retry", id, &note),
        Commands::Resume { id, note } => cmd_request(&cli.project, "resume", id, &note),
        Commands::Sessions { feature, limit } => cmd_sessions(&cli.project, feature, limit),
    }
}

fn load_config_or_exit(project_dir: &Path) -> ProjectConfig {
    match ProjectConfig::load(project_dir) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {e}");
            eprintln!("Create {CONFIG_FILE} in the project root before running autodev.");
            std::process::exit(1);
        }
    }
}

fn runtime_dir(project_dir: &Path) -> PathBuf {
    project_dir.join(".autodev")
}

fn stop_sentinel(project_dir: &Path) -> PathBuf {
    runtime_dir(project_dir).join("stop")
}

fn requests_file(project_dir: &Path) -> PathBuf {
    runtime_dir(project_dir).join("requests.json")
}

/// Operator commands written by a second CLI process and drained by the
/// running scheduler.
#[derive(Debug, Serialize, Deserialize)]
struct OperatorRequest {
    action: String,
    feature_id: u64,
    #[serde(default)]
    note: String,
}

fn cmd_run(project_dir: &Path) {
    let config = load_config_or_exit(project_dir);
    if !config.tracks_configured || config.tracks.is_empty() {
        eprintln!(
            "No tracks configured. Add a \"tracks\" list (exactly one default) to {CONFIG_FILE} \
             and set \"tracks_configured\": true."
        );
        std::process::exit(1);
    }

    let _ = std::fs::create_dir_all(runtime_dir(project_dir));
    let _ = std::fs::remove_file(stop_sentinel(project_dir));

    let rt = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("Error: failed to start runtime: {e}");
            std::process::exit(1);
        }
    };

    let exit = rt.block_on(async {
        let orchestrator = Orchestrator::new(project_dir.to_path_buf(), config);
        if let Err(e) = orchestrator.start().await {
            eprintln!("Error: {e}");
            return 1;
        }
        println!("autodev running; stop with Ctrl-C or `autodev stop`.");

        let monitor = {
            let orchestrator = orchestrator.clone();
            let project_dir = project_dir.to_path_buf();
            tokio::spawn(async move {
                monitor_loop(&orchestrator, &project_dir).await;
            })
        };

        orchestrator.join().await;
        monitor.abort();
        let _ = std::fs::remove_file(stop_sentinel(project_dir));
        println!("autodev stopped.");
        0
    });
    std::process::exit(exit);
}

/// Watches for Ctrl-C, the stop sentinel, operator requests, and the
/// everything-settled condition.
async fn monitor_loop(orchestrator: &Orchestrator, project_dir: &Path) {
    let mut ctrl_c = Box::pin(tokio::signal::ctrl_c());
    loop {
        tokio::select! {
            _ = &mut ctrl_c => {
                orchestrator.stop();
                return;
            }
            _ = tokio::time::sleep(Duration::from_secs(1)) => {}
        }

        if stop_sentinel(project_dir).exists() {
            orchestrator.stop();
            return;
        }

        drain_requests(orchestrator, project_dir);

        if orchestrator.state() == OrchestratorState::Running && all_settled(orchestrator) {
            println!("All features settled; shutting down.");
            orchestrator.stop();
            return;
        }
    }
}

fn all_settled(orchestrator: &Orchestrator) -> bool {
    match orchestrator.features().load_features() {
        Ok(features) => {
            !features.is_empty()
                && features.iter().all(|f| {
                    matches!(f.status, FeatureStatus::Passed | FeatureStatus::Failed)
                })
                && orchestrator
                    .get_status()
                    .tracks
                    .values()
                    .all(|t| t.current_feature.is_none() && t.queued == 0)
        }
        Err(_) => false,
    }
}

fn drain_requests(orchestrator: &Orchestrator, project_dir: &Path) {
    let path = requests_file(project_dir);
    if !path.exists() {
        return;
    }
    let Ok(_lock) = FileLock::acquire(&path) else {
        return;
    };
    let requests: Vec<OperatorRequest> = std::fs::read_to_string(&path)
        .ok()
        .and_then(|content| serde_json::from_str(&content).ok())
        .unwrap_or_default();
    let _ = std::fs::remove_file(&path);

    for request in requests {
        let result = match request.action.as_str() {
            "retry" => orchestrator.retry_feature(request.feature_id, &request.note),
            "resume" => orchestrator.resume_feature(request.feature_id, &request.note),
            other => {
                warn!(action = other, "unknown operator request");
                continue;
            }
        };
        match result {
            Ok(()) => println!("{} queued for feature {}", request.action, request.feature_id),
            Err(e) => eprintln!("{} failed for feature {}: {e}", request.action, request.feature_id),
        }
    }
}

fn cmd_stop(project_dir: &Path) {
    let dir = runtime_dir(project_dir);
    if let Err(e) = std::fs::create_dir_all(&dir)
        .and_then(|_| std::fs::write(stop_sentinel(project_dir), ""))
    {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
    println!("Stop requested; the scheduler exits after in-flight features finish.");
}

fn cmd_request(project_dir: &Path, action: &str, id: u64, note: &str) {
    let path = requests_file(project_dir);
    let _ = std::fs::create_dir_all(runtime_dir(project_dir));
    let _lock = match FileLock::acquire(&path) {
        Ok(lock) => lock,
        Err(e) => {
            eprintln!("Error: {e}");
            std::process::exit(1);
        }
    };
    let mut requests: Vec<OperatorRequest> = std::fs::read_to_string(&path)
        .ok()
        .and_then(|content| serde_json::from_str(&content).ok())
        .unwrap_or_default();
    requests.push(OperatorRequest {
        action: action.into(),
        feature_id: id,
        note: note.into(),
    });
    match serde_json::to_string_pretty(&requests)
        .map_err(std::io::Error::other)
        .and_then(|content| std::fs::write(&path, content))
    {
        Ok(()) => println!("{action} request recorded for feature {id}."),
        Err(e) => {
            eprintln!("Error: {e}");
            std::process::exit(1);
        }
    }
}

fn cmd_status(project_dir: &Path) {
    let config = load_config_or_exit(project_dir);
    let store = FeatureStore::new(config.features_file(project_dir));
    let features = match store.load_features() {
        Ok(features) => features,
        Err(e) => {
            eprintln!("Error: {e}");
            std::process::exit(1);
        }
    };

    let count = |status: FeatureStatus| features.iter().filter(|f| f.status == status).count();
    println!("Project: {}", config.project_name);
    println!("Features: {} total", features.len());
    println!("  open:      {}", count(FeatureStatus::Open));
    println!("  verifying: {}", count(FeatureStatus::Verifying));
    println!("  passed:    {}", count(FeatureStatus::Passed));
    println!("  failed:    {}", count(FeatureStatus::Failed));

    for feature in features.iter().filter(|f| f.status == FeatureStatus::Failed) {
        if let Some(reason) = &feature.failure_reason {
            println!("  #{} {}: {}", feature.id, feature.name, reason);
        }
    }

    println!("Tracks:");
    for track in &config.tracks {
        let default = if track.is_default { " (default)" } else { "" };
        println!(
            "  {}{}  categories: {}",
            track.name,
            default,
            if track.categories.is_empty() {
                "-".to_string()
            } else {
                track.categories.join(", ")
            }
        );
    }
}

fn cmd_sessions(project_dir: &Path, feature: Option<u64>, limit: usize) {
    let log = SessionLog::new(runtime_dir(project_dir).join("sessions.json"));
    let filter = SessionFilter {
        feature_id: feature,
        ..SessionFilter::default()
    };
    match log.get_sessions(&filter, 0, limit) {
        Ok(sessions) => {
            if sessions.is_empty() {
                println!("No sessions recorded.");
                return;
            }
            for session in sessions {
                let duration = session
                    .duration_ms
                    .map(|ms| format!("{:.1}s", ms as f64 / 1000.0))
                    .unwrap_or_else(|| "-".into());
                println!(
                    "{}  feature {:<4} {:<12} {:?}  {}  agent: {}",
                    session.started_at.format("%Y-%m-%d %H:%M:%S"),
                    session.feature_id,
                    session.track,
                    session.status,
                    duration,
                    session.agent_used.as_deref().unwrap_or("-"),
                );
            }
        }
        Err(e) => {
            eprintln!("Error: {e}");
            std::process::exit(1);
        }
    }
}
