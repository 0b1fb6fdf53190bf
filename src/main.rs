//! ScriptFlow - Main Entry Point
//!
//! Replays a JSON recording through the user node stage and prints every
//! derived message as a JSON line on stdout. Diagnostics, node logs and
//! problems go to the log on stderr.

use anyhow::Context;
use clap::Parser;
use scriptflow_rs::{
    config::{ProjectFile, StageConfig},
    pipeline::{DiagnosticsBridge, DiagnosticsFeed, StageEvent, StageServices, UserNodePlayer},
    player::{MemoryPlayer, Player, PlayerState, Recording},
    types::{PlayerProblem, SubscribePayload},
};
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "scriptflow", version, about = "Run user script nodes over a recording")]
struct Cli {
    /// Project file with user nodes and global variables
    project: PathBuf,

    /// Recording to replay (JSON)
    recording: PathBuf,

    /// Playback speed multiplier (0.1 - 10.0)
    #[arg(long, default_value_t = 1.0)]
    speed: f64,

    /// Recording time covered by each emitted frame, in milliseconds
    #[arg(long, default_value_t = 100)]
    batch_ms: u64,

    /// Sleep between frames to replay at the chosen speed
    #[arg(long)]
    realtime: bool,

    /// Also print the input messages of the recording
    #[arg(long)]
    include_inputs: bool,

    /// Stage config (TOML), overriding the project's stage settings
    #[arg(long)]
    stage_config: Option<PathBuf>,

    /// Write a daily-rolling log file into this directory
    #[arg(long)]
    log_dir: Option<PathBuf>,
}

fn init_logging(log_dir: Option<&PathBuf>) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let (file_layer, guard) = match log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "scriptflow.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (
                Some(
                    tracing_subscriber::fmt::layer()
                        .with_writer(writer)
                        .with_ansi(false),
                ),
                Some(guard),
            )
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,scriptflow_rs=debug")),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(file_layer)
        .init();
    guard
}

fn report_events(feed: &DiagnosticsFeed) {
    for event in feed.drain() {
        match event {
            StageEvent::Diagnostics {
                node_id,
                diagnostics,
            } => {
                for diagnostic in diagnostics {
                    if diagnostic.is_error() {
                        tracing::error!("{}: {}", node_id, diagnostic);
                    } else {
                        tracing::warn!("{}: {}", node_id, diagnostic);
                    }
                }
            }
            StageEvent::Logs { node_id, logs } => {
                for log in logs {
                    tracing::info!("{} [{:?}] {}", node_id, log.source, log.value);
                }
            }
        }
    }
}

/// Print derived messages until the stage closes its listener.
async fn print_states(
    mut states: tokio::sync::mpsc::Receiver<PlayerState>,
    printed_topics: HashSet<String>,
) -> anyhow::Result<usize> {
    let mut printed = 0;
    let mut last_problems: Vec<PlayerProblem> = Vec::new();
    while let Some(state) = states.recv().await {
        if state.problems != last_problems {
            for problem in &state.problems {
                tracing::warn!(
                    "Problem: {}{}",
                    problem.message,
                    problem
                        .error
                        .as_deref()
                        .map(|e| format!(" ({})", e))
                        .unwrap_or_default()
                );
            }
            last_problems = state.problems.clone();
        }
        let Some(active) = state.active_data else {
            continue;
        };
        for message in active.messages.iter() {
            if printed_topics.contains(&message.topic) {
                println!("{}", serde_json::to_string(message)?);
                printed += 1;
            }
        }
    }
    Ok(printed)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let _guard = init_logging(cli.log_dir.as_ref());

    tracing::info!("Starting ScriptFlow");

    let project = ProjectFile::load(&cli.project)
        .with_context(|| format!("loading project {:?}", cli.project))?;
    let config = match &cli.stage_config {
        Some(path) => StageConfig::from_toml_file(path)
            .with_context(|| format!("loading stage config {:?}", path))?,
        None => project.stage.clone(),
    };
    let recording = Recording::load(&cli.recording)
        .with_context(|| format!("loading recording {:?}", cli.recording))?;
    tracing::info!(
        "Loaded {} nodes and {} messages on {} topics",
        project.nodes.len(),
        recording.messages.len(),
        recording.topics.len()
    );
    let input_topics: Vec<String> = recording.topics.iter().map(|t| t.name.clone()).collect();

    let upstream = Arc::new(MemoryPlayer::new(recording).with_name(
        cli.recording
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "recording".to_string()),
    ));
    upstream.set_playback_speed(cli.speed);

    let (bridge, feed) = DiagnosticsBridge::new();
    let stage = UserNodePlayer::new(
        upstream.clone(),
        StageServices::with_rhai(&config, Arc::new(bridge)),
        config,
    );
    let (tx, mut rx) = tokio::sync::mpsc::channel(64);
    stage.set_listener(tx);
    stage.set_user_nodes(project.user_nodes()).await;
    stage
        .update_global_variables(project.global_variables.clone())
        .await;

    // The first state compiles the nodes against the recording's topics.
    upstream.emit_current().await?;
    rx.recv().await.context("stage closed before the first state")?;
    report_events(&feed);

    let outputs = stage.output_topics().await;
    if outputs.is_empty() {
        tracing::warn!("No user node is active; nothing will be derived");
    }
    let mut printed_topics: HashSet<String> = outputs.iter().map(|t| t.name.clone()).collect();
    let mut subscriptions: Vec<SubscribePayload> = outputs
        .iter()
        .map(|t| SubscribePayload::new(t.name.clone()))
        .collect();
    if cli.include_inputs {
        printed_topics.extend(input_topics.iter().cloned());
        subscriptions.extend(input_topics.iter().map(|t| SubscribePayload::new(t.clone())));
    }
    stage.update_subscriptions(subscriptions).await;

    let printer = tokio::spawn(print_states(rx, printed_topics));

    let batch = Duration::from_millis(cli.batch_ms.max(1));
    let mut time = upstream.start_time();
    upstream.start_playback();
    // Messages at the start time belong to the first frame.
    upstream.advance_to(time).await?;
    while !upstream.is_finished() {
        time = time.saturating_add(batch);
        upstream.advance_to(time).await?;
        report_events(&feed);
        if cli.realtime {
            let pause = batch.as_secs_f64() / upstream.playback_speed();
            tokio::time::sleep(Duration::from_secs_f64(pause)).await;
        }
    }
    upstream.pause_playback();

    stage.shutdown().await;
    let printed = printer.await??;
    report_events(&feed);
    tracing::info!("Done: {} messages printed", printed);
    Ok(())
}
