//! HTTP front end: the inbound webhook/event listener, OAuth callback,
//! health and metrics endpoints.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use salvo::prelude::*;
use serde_json::json;
use tracing::info;

use crate::bridge::{ActiveTeams, RoomRegistry, SlackEventHandler};
use crate::config::{Config, OAuth2Config};
use crate::db::Datastore;
use crate::slack::SlackApi;

pub mod ingest;
pub mod metrics;
pub mod oauth;

use ingest::inbound_request;
use metrics::metrics_endpoint;

/// Pending account links: opaque pre-auth token to the Matrix user who
/// requested it. Entries are one-shot, consumed by the authorize
/// callback.
#[derive(Default)]
pub struct PreauthStore(Mutex<HashMap<String, String>>);

impl PreauthStore {
    pub fn insert(&self, token: &str, matrix_id: &str) {
        self.0.lock().insert(token.to_owned(), matrix_id.to_owned());
    }

    pub fn take(&self, token: &str) -> Option<String> {
        self.0.lock().remove(token)
    }
}

/// Everything a request handler needs, injected once at startup.
pub struct IngestContext {
    pub store: Arc<dyn Datastore>,
    pub rooms: Arc<dyn RoomRegistry>,
    pub slack: Arc<dyn SlackApi>,
    pub events: Arc<dyn SlackEventHandler>,
    pub active_teams: Arc<ActiveTeams>,
    pub oauth2: Option<OAuth2Config>,
    pub preauth: PreauthStore,
}

pub struct WebState {
    pub ctx: Arc<IngestContext>,
    pub started_at: Instant,
}

static WEB_STATE: OnceCell<WebState> = OnceCell::new();

pub fn web_state() -> &'static WebState {
    WEB_STATE
        .get()
        .expect("web state is not initialized before handler execution")
}

pub struct WebServer {
    config: Arc<Config>,
}

impl WebServer {
    pub fn new(config: Arc<Config>, ctx: Arc<IngestContext>) -> Self {
        let _ = WEB_STATE.set(WebState {
            ctx,
            started_at: Instant::now(),
        });
        Self { config }
    }

    pub async fn start(&self) -> Result<()> {
        let bind_addr = format!("{}:{}", self.config.web.bind_address, self.config.web.port);
        info!("starting web server on {}", bind_addr);

        let acceptor = TcpListener::new(bind_addr).bind().await;
        Server::new(acceptor).serve(root_router()).await;
        Ok(())
    }
}

pub fn root_router() -> Router {
    Router::new()
        .push(Router::with_path("health").get(health_check))
        .push(Router::with_path("metrics").get(metrics_endpoint))
        // The catch-all takes every method; anything but GET/POST is
        // acknowledged with an empty body and counted as dropped.
        .push(Router::with_path("{**rest}").goal(inbound_request))
}

#[handler]
async fn health_check(res: &mut Response) {
    let uptime = web_state().started_at.elapsed().as_secs();
    res.render(Json(json!({ "status": "ok", "uptime_seconds": uptime })));
}
