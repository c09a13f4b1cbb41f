#![forbid(unsafe_code)]

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info};

mod bridge;
mod config;
mod db;
mod ghost;
mod matrix;
mod slack;
mod utils;
mod web;

use bridge::{ActiveTeams, BridgedRoomRegistry, EventRelayHandler, GhostRegistry};
use config::Config;
use web::{IngestContext, PreauthStore, WebServer};

#[derive(Parser)]
#[command(name = "matrix-appservice-slack", about = "A Slack to Matrix bridge")]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short, long, default_value = "config.yaml", env = "CONFIG_PATH")]
    config: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = Arc::new(
        Config::load_from_file(&cli.config)
            .with_context(|| format!("failed to load config from {}", cli.config))?,
    );
    utils::logging::init_tracing(&config.logging);
    info!("matrix-appservice-slack starting up");

    let store = db::connect(&config.database).context("failed to open datastore")?;
    // A partially migrated schema must never serve traffic.
    store
        .ensure_schema()
        .await
        .context("schema migration failed")?;

    let intent: Arc<dyn matrix::MatrixIntent> = Arc::new(matrix::AppserviceClient::new(
        &config.homeserver.url,
        &config.homeserver.appservice_token,
    )?);
    let slack_api: Arc<dyn slack::SlackApi> = Arc::new(slack::SlackClient::new()?);

    let ghosts = Arc::new(GhostRegistry::new(
        &config.homeserver.server_name,
        &config.ghosts.username_prefix,
        Arc::clone(&intent),
        Arc::clone(&slack_api),
        Arc::clone(&store),
    ));
    let rooms = Arc::new(
        BridgedRoomRegistry::load(Arc::clone(&store), ghosts, &config.ghosts.displayname_suffix)
        .await
        .context("failed to load bridged rooms")?,
    );

    let ctx = Arc::new(IngestContext {
        store,
        rooms: Arc::clone(&rooms) as Arc<dyn bridge::RoomRegistry>,
        slack: slack_api,
        events: Arc::new(EventRelayHandler::new(rooms)),
        active_teams: Arc::new(ActiveTeams::default()),
        oauth2: config.oauth2.clone(),
        preauth: PreauthStore::default(),
    });

    let web_server = WebServer::new(Arc::clone(&config), ctx);
    let web_handle = tokio::spawn(async move {
        if let Err(err) = web_server.start().await {
            error!("web server error: {err}");
        }
    });
    tokio::pin!(web_handle);

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("received Ctrl+C, beginning shutdown");
        },
        _ = &mut web_handle => {
            info!("web server task exited, beginning shutdown");
        },
    }
    web_handle.abort();

    info!("matrix-appservice-slack shutting down");
    Ok(())
}
