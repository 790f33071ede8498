//! 'main' for the Podium scoreboard process

use std::time::Duration;

use anyhow::{bail, Result};
use clap::Parser;
use config::{Config, Environment, File};
use podium_common::{ClassId, StateSnapshot};
use podium_module_realtime_sync::SyncClient;
use podium_module_state_fetcher::{open_session, FetcherConfig};
use tokio::sync::broadcast::error::RecvError;
use tokio::{select, signal, time};
use tracing::{info, warn};
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter, Registry};

#[derive(Parser, Debug)]
#[command(name = "scoreboard")]
#[command(about = "Follow one class's debate state and log every change")]
struct Args {
    /// Configuration file, without extension
    #[arg(short, long, default_value = "scoreboard")]
    config: String,

    /// Class to follow, overrides class-id in the configuration
    #[arg(long)]
    class: Option<u64>,
}

/// Process-only settings, the modules read their own keys
#[derive(Debug, serde::Deserialize)]
#[serde(rename_all = "kebab-case")]
struct ScoreboardConfig {
    #[serde(default)]
    username: Option<String>,
    #[serde(default)]
    password: Option<String>,
    #[serde(default = "default_login_type")]
    login_type: String,
    #[serde(default)]
    class_id: Option<u64>,
    /// Seconds between debate progress reads, 0 disables
    #[serde(default)]
    refresh_progress: u64,
}

fn default_login_type() -> String {
    "judge".to_string()
}

/// Standard main
#[tokio::main]
pub async fn main() -> Result<()> {
    let args = Args::parse();

    // Standard logging using RUST_LOG for log levels
    let fmt_layer = fmt::layer().with_filter(EnvFilter::from_default_env());
    Registry::default().with(fmt_layer).init();

    info!("Podium scoreboard process");

    let config = Config::builder()
        .add_source(File::with_name(&args.config).required(false))
        .add_source(Environment::with_prefix("PODIUM"))
        .build()?;
    let cfg: ScoreboardConfig = config.clone().try_deserialize()?;

    let session = open_session(&FetcherConfig::try_load(&config)?).await?;
    let client = SyncClient::try_load(&config, session)?;

    sign_in(&client, &cfg, args.class.or(cfg.class_id).map(ClassId)).await?;
    client.mount().await?;
    follow(&client, cfg.refresh_progress).await;

    client.connection().disconnect().await?;
    info!("Exiting");
    Ok(())
}

/// Log in if the session has no token, then make sure the wanted class is selected
async fn sign_in(client: &SyncClient, cfg: &ScoreboardConfig, class_id: Option<ClassId>) -> Result<()> {
    let api = client.fetcher().api();
    let logged_in = api.session().read().await.session().is_logged_in();

    if !logged_in {
        let (Some(username), Some(password)) = (&cfg.username, &cfg.password) else {
            bail!("No saved session and no username/password configured");
        };
        api.login(username, password, &cfg.login_type).await?;
    }

    let current = api.session().read().await.context().class_id;
    match class_id {
        Some(wanted) if current != Some(wanted) => {
            api.select_class(wanted).await?;
        }
        Some(_) => {}
        None if current.is_none() => warn!("No class selected, the scoreboard will stay offline"),
        None => {}
    }
    Ok(())
}

async fn follow(client: &SyncClient, refresh_secs: u64) {
    let mut snapshots = client.store().subscribe();
    let mut questions = client.store().subscribe_questions();
    let mut states = client.connection().subscribe_state();

    log_snapshot(&snapshots.borrow_and_update());

    let mut refresh = time::interval(Duration::from_secs(refresh_secs.max(1)));
    refresh.reset();

    loop {
        select! {
            _ = signal::ctrl_c() => break,

            Ok(()) = snapshots.changed() => log_snapshot(&snapshots.borrow_and_update()),

            Ok(()) = states.changed() => {
                let state = *states.borrow_and_update();
                info!(%state, "Connection");
            }

            question = questions.recv() => match question {
                Ok(question) => info!(%question, "New question"),
                Err(RecvError::Lagged(missed)) => warn!(missed, "Question notifications dropped"),
                Err(RecvError::Closed) => break,
            },

            _ = refresh.tick(), if refresh_secs > 0 => {
                let class_id = client.session().read().await.context().class_id;
                client.fetcher().fetch_debate_progress(class_id).await;
            }
        }
    }
}

fn log_snapshot(snapshot: &StateSnapshot) {
    let team = snapshot.current_team.as_ref().and_then(|team| team.name.as_deref());
    let progress = snapshot.debate_progress.as_ref().and_then(|p| p.progress());
    info!(
        stage = %snapshot.stage,
        team,
        slots = snapshot.remaining_slots,
        countdown = snapshot.countdown_seconds,
        scored = snapshot.score_progress.submitted,
        judges = snapshot.score_progress.total,
        pre_voting = progress.map(|p| p.pre_voting_progress.submitted),
        post_voting = progress.map(|p| p.post_voting_progress.submitted),
        "Scoreboard"
    );
    if let Some(marker) = snapshot.debate_progress.as_ref().and_then(|p| p.error()) {
        warn!("Debate progress unavailable: {marker}");
    }
}
