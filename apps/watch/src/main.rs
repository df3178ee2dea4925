//! tunedeck-watch - follow workflow runs from the terminal.
//!
//! Connects the shared realtime client, subscribes to the given runs and
//! prints every event plus connection status changes until Ctrl-C.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use tunedeck_protocol::WorkflowEvent;
use tunedeck_realtime::{
    ClientConfig, ClientError, FeedOptions, StatusWatcher, WorkflowEventFeed, init_shared,
    reset_shared,
};

#[derive(Parser, Debug)]
#[command(name = "tunedeck-watch")]
#[command(about = "Follow TuneDeck workflow runs over the realtime event socket")]
#[command(version)]
struct Args {
    /// Run ids to follow
    #[arg(required = true)]
    runs: Vec<String>,

    /// Socket URL (overrides the config file)
    #[arg(short, long, env = "TUNEDECK_WS_URL")]
    url: Option<String>,

    /// JSON client configuration file
    #[arg(short, long, env = "TUNEDECK_CONFIG")]
    config: Option<PathBuf>,

    /// Give up after this many reconnection attempts (0 = never)
    #[arg(long)]
    max_attempts: Option<u32>,

    /// Print events as JSON lines
    #[arg(long)]
    json: bool,

    /// Log every inbound event and dispatch
    #[arg(long)]
    debug: bool,
}

impl Args {
    fn client_config(&self) -> Result<ClientConfig> {
        let mut config = match &self.config {
            Some(path) => ClientConfig::load(path)
                .with_context(|| format!("failed to load {}", path.display()))?,
            None => ClientConfig::from_env(),
        };
        if let Some(url) = &self.url {
            config.url = Some(url.clone());
        }
        if let Some(max) = self.max_attempts {
            config.reconnection.max_attempts = max;
        }
        config.debug |= self.debug;
        config.validate().context("invalid client configuration")?;
        Ok(config)
    }
}

fn print_event(event: &WorkflowEvent, json: bool) {
    if json {
        match serde_json::to_string(event) {
            Ok(line) => println!("{line}"),
            Err(e) => warn!("failed to encode event: {e}"),
        }
        return;
    }
    println!(
        "{} {:<5} {} {}{}",
        event.timestamp,
        event.phase,
        event.run_id,
        event.node_name.as_deref().unwrap_or("-"),
        if event.issues.is_empty() {
            String::new()
        } else {
            format!(" ({} issues)", event.issues.len())
        }
    );
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,tunedeck=debug")),
        )
        .init();

    let args = Args::parse();
    let config = args.client_config()?;
    let client = init_shared(config);
    info!(url = %client.url(), runs = ?args.runs, "starting");

    let mut status = StatusWatcher::new(client.clone());
    let status_task = tokio::spawn(async move {
        while let Some(s) = status.changed().await {
            match (s.next_retry_delay, &s.last_error) {
                (Some(delay), _) => info!(
                    state = %s.state,
                    attempt = s.reconnect_attempt,
                    "retrying in {:.1}s",
                    delay.as_secs_f64()
                ),
                (None, Some(err)) => warn!(state = %s.state, error = %err, "connection status"),
                (None, None) => info!(state = %s.state, "connection status"),
            }
        }
    });

    let feeds: Vec<_> = args
        .runs
        .iter()
        .map(|run| {
            let mut feed = WorkflowEventFeed::new(
                client.clone(),
                run.as_str(),
                FeedOptions {
                    auto_connect: false,
                    ..FeedOptions::default()
                },
            );
            let json = args.json;
            tokio::spawn(async move {
                while let Some(event) = feed.next().await {
                    print_event(&event, json);
                }
            })
        })
        .collect();

    match client.connect().await {
        Ok(()) => info!("connected"),
        // Retries continue in the background.
        Err(ClientError::ClosedBeforeOpen) => warn!("first attempt failed, retrying"),
        Err(e) => return Err(e).context("failed to connect"),
    }

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for Ctrl-C")?;

    let stats = client.stats();
    info!(
        events = stats.total_events_processed,
        reconnections = stats.total_reconnections,
        "shutting down"
    );
    for feed in feeds {
        feed.abort();
    }
    status_task.abort();
    reset_shared();
    Ok(())
}
