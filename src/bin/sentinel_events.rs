//! sentinel_events - operator tool for the detection log
//!
//! `list` prints logged detections, most recent first.
//! `feedback` applies a reviewer verdict to the clip behind a snapshot,
//! moving it between the accident and normal corpora.

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use accident_sentinel::{
    artifacts::ArtifactStore, config::SentinelConfig, most_recent_first, storage::read_events,
    FeedbackOutcome, Verdict,
};

#[path = "../ui.rs"]
mod ui;

#[derive(Parser, Debug)]
#[command(name = "sentinel_events", about = "Inspect detections and apply reviewer feedback")]
struct Args {
    /// Settings file (JSON, or TOML with a .toml extension)
    #[arg(long, env = "SENTINEL_CONFIG", value_name = "PATH", global = true)]
    config: Option<PathBuf>,

    /// UI mode for stderr progress
    #[arg(long, value_enum, default_value = "auto", value_name = "MODE", global = true)]
    ui: ui::UiMode,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List logged detections, most recent first
    List {
        /// Show at most N events
        #[arg(long, value_name = "N")]
        limit: Option<usize>,
        /// Only events from this camera id
        #[arg(long, value_name = "ID")]
        camera: Option<String>,
        /// Event log to read (overrides settings)
        #[arg(long, value_name = "PATH")]
        event_log: Option<PathBuf>,
    },
    /// Relabel the clip behind a snapshot
    Feedback {
        /// Snapshot file name as recorded in the event log
        #[arg(long, value_name = "NAME")]
        snapshot: String,
        /// correct | false_positive
        #[arg(long)]
        verdict: Verdict,
        /// Corpus root holding accident/ and normal/ (overrides settings)
        #[arg(long, value_name = "PATH")]
        corpus_root: Option<PathBuf>,
    },
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    let args = Args::parse();
    let ui = ui::Ui::new(args.ui);
    let config = {
        let _stage = ui.stage("Load settings");
        SentinelConfig::load_from(args.config.as_deref())?
    };

    match args.command {
        Command::List {
            limit,
            camera,
            event_log,
        } => {
            let path = event_log.unwrap_or(config.storage.event_log);
            let events = {
                let _stage = ui.stage("Read event log");
                read_events(&path)?
            };
            let total = events.len();
            let shown: Vec<_> = most_recent_first(events)
                .into_iter()
                .filter(|ev| camera.as_deref().map_or(true, |id| ev.camera_id == id))
                .take(limit.unwrap_or(usize::MAX))
                .collect();

            println!("sentinel_events: {} ({} logged)", path.display(), total);
            for ev in &shown {
                println!(
                    "{}  {:<12} {:<20} {}  @ {}",
                    ev.timestamp, ev.camera_id, ev.camera_name, ev.snapshot_ref, ev.location
                );
            }
            if shown.is_empty() {
                println!("no detections");
            }
        }
        Command::Feedback {
            snapshot,
            verdict,
            corpus_root,
        } => {
            let corpus_root = corpus_root.unwrap_or(config.storage.corpus_root);
            let store = ArtifactStore::with_dirs(&config.storage.snapshot_dir, &corpus_root)?;
            let outcome = {
                let _stage = ui.stage("Apply feedback");
                store.apply_feedback(&snapshot, verdict)?
            };
            match outcome {
                FeedbackOutcome::Moved { from, to } => {
                    println!("moved {} -> {}", from.display(), to.display())
                }
                FeedbackOutcome::AlreadyLabeled(path) => {
                    println!("already labeled {}: {}", verdict, path.display())
                }
                FeedbackOutcome::NotFound { clip_name } => {
                    println!("nothing found for {} ({})", snapshot, clip_name)
                }
            }
        }
    }
    Ok(())
}
