//! Room and ghost plumbing between ingestion and delivery: the
//! [`BridgedRoom`] seam, the concrete webhook relay room, the lazy
//! ghost registry and the set of teams served by a streaming
//! connection.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use serde_json::{Value, json};
use thiserror::Error;
use tracing::{debug, info};

use crate::db::{Datastore, DatastoreError, RoomEntry, UserEntry};
use crate::ghost::{GhostError, SlackGhost};
use crate::matrix::MatrixIntent;
use crate::slack::{RelayMessage, SlackApi, substitute_mentions};

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error(transparent)]
    Ghost(#[from] GhostError),

    #[error(transparent)]
    Datastore(#[from] DatastoreError),

    #[error("room entry malformed: {0}")]
    BadRoomEntry(String),
}

/// One bridged room as ingestion sees it.
#[async_trait]
pub trait BridgedRoom: Send + Sync {
    fn inbound_id(&self) -> &str;
    fn matrix_room_id(&self) -> &str;
    fn slack_channel_id(&self) -> &str;
    fn slack_team_id(&self) -> Option<String>;
    /// Elevated client token, when the owning team is registered.
    fn bot_token(&self) -> Option<String>;

    /// Persists the room when the remote channel was renamed.
    async fn refresh_channel_name(&self, name: &str) -> Result<(), BridgeError>;

    /// Relays one enriched inbound message into the Matrix room.
    async fn handle_inbound(&self, msg: RelayMessage) -> Result<(), BridgeError>;
}

/// Consumer of Events API callbacks, shared between the webhook path
/// and any streaming transport.
#[async_trait]
pub trait SlackEventHandler: Send + Sync {
    async fn handle_event(&self, team_id: Option<&str>, event: &Value) -> Result<(), BridgeError>;
}

pub trait RoomRegistry: Send + Sync {
    fn room_by_inbound_id(&self, inbound_id: &str) -> Option<Arc<dyn BridgedRoom>>;
}

/// Teams currently served by a persistent streaming connection. When
/// a team is listed here, webhook-delivered copies of its events are
/// acknowledged but not processed.
#[derive(Default)]
pub struct ActiveTeams(RwLock<HashSet<String>>);

impl ActiveTeams {
    pub fn insert(&self, team_id: &str) {
        self.0.write().insert(team_id.to_owned());
    }

    pub fn remove(&self, team_id: &str) {
        self.0.write().remove(team_id);
    }

    pub fn contains(&self, team_id: &str) -> bool {
        self.0.read().contains(team_id)
    }
}

/// Lazily creates one ghost per sighted Slack identity, backed by any
/// previously persisted profile state.
pub struct GhostRegistry {
    server_name: String,
    username_prefix: String,
    intent: Arc<dyn MatrixIntent>,
    slack: Arc<dyn SlackApi>,
    store: Arc<dyn Datastore>,
    ghosts: tokio::sync::Mutex<HashMap<String, Arc<SlackGhost>>>,
}

impl GhostRegistry {
    pub fn new(
        server_name: &str,
        username_prefix: &str,
        intent: Arc<dyn MatrixIntent>,
        slack: Arc<dyn SlackApi>,
        store: Arc<dyn Datastore>,
    ) -> Self {
        Self {
            server_name: server_name.to_owned(),
            username_prefix: username_prefix.to_owned(),
            intent,
            slack,
            store,
            ghosts: tokio::sync::Mutex::new(HashMap::new()),
        }
    }

    pub fn ghost_user_id(&self, slack_id: &str, team_id: Option<&str>) -> String {
        let localpart = match team_id {
            Some(team) => format!("{}{}_{}", self.username_prefix, team, slack_id),
            None => format!("{}{}", self.username_prefix, slack_id),
        };
        format!("@{}:{}", localpart.to_lowercase(), self.server_name)
    }

    pub async fn get_or_create(
        &self,
        slack_id: &str,
        team_id: Option<&str>,
    ) -> Result<Arc<SlackGhost>, BridgeError> {
        let user_id = self.ghost_user_id(slack_id, team_id);
        let mut ghosts = self.ghosts.lock().await;
        if let Some(ghost) = ghosts.get(&user_id) {
            return Ok(Arc::clone(ghost));
        }

        let entry = match self.store.get_user(&user_id).await? {
            Some(entry) => entry,
            None => {
                debug!(ghost = %user_id, "first sighting, creating ghost entry");
                let entry = UserEntry::new(&user_id, slack_id, team_id);
                self.store.upsert_user(&entry).await?;
                entry
            }
        };

        let ghost = Arc::new(SlackGhost::new(
            entry,
            Arc::clone(&self.intent),
            Arc::clone(&self.slack),
            Arc::clone(&self.store),
        ));
        ghosts.insert(user_id, Arc::clone(&ghost));
        Ok(ghost)
    }
}

struct RelayRoomState {
    team_id: Option<String>,
    channel_name: Option<String>,
    slack_type: String,
    bot_token: Option<String>,
}

/// Concrete webhook relay room: profiles synced, text relayed through
/// the sender's ghost, activity fact recorded.
pub struct RelayRoom {
    inbound_id: String,
    matrix_room_id: String,
    channel_id: String,
    state: Mutex<RelayRoomState>,
    ghosts: Arc<GhostRegistry>,
    store: Arc<dyn Datastore>,
    displayname_suffix: String,
}

impl RelayRoom {
    pub fn from_entry(
        entry: &RoomEntry,
        ghosts: Arc<GhostRegistry>,
        store: Arc<dyn Datastore>,
        displayname_suffix: &str,
    ) -> Result<Self, BridgeError> {
        if entry.matrix_id.is_empty() || entry.remote_id.is_empty() {
            return Err(BridgeError::BadRoomEntry(entry.id.clone()));
        }
        let remote_str = |key: &str| {
            entry
                .remote
                .get(key)
                .and_then(Value::as_str)
                .map(ToOwned::to_owned)
        };
        Ok(Self {
            inbound_id: entry.id.clone(),
            matrix_room_id: entry.matrix_id.clone(),
            channel_id: entry.remote_id.clone(),
            state: Mutex::new(RelayRoomState {
                team_id: remote_str("slack_team_id"),
                channel_name: remote_str("name"),
                slack_type: remote_str("slack_type").unwrap_or_else(|| "channel".to_owned()),
                bot_token: remote_str("slack_bot_token"),
            }),
            ghosts,
            store,
            displayname_suffix: displayname_suffix.to_owned(),
        })
    }

    pub fn to_entry(&self) -> RoomEntry {
        let state = self.state.lock();
        RoomEntry {
            id: self.inbound_id.clone(),
            matrix_id: self.matrix_room_id.clone(),
            remote_id: self.channel_id.clone(),
            remote: json!({
                "slack_team_id": state.team_id,
                "slack_type": state.slack_type,
                "name": state.channel_name,
                "slack_bot_token": state.bot_token,
            }),
        }
    }
}

#[async_trait]
impl BridgedRoom for RelayRoom {
    fn inbound_id(&self) -> &str {
        &self.inbound_id
    }

    fn matrix_room_id(&self) -> &str {
        &self.matrix_room_id
    }

    fn slack_channel_id(&self) -> &str {
        &self.channel_id
    }

    fn slack_team_id(&self) -> Option<String> {
        self.state.lock().team_id.clone()
    }

    fn bot_token(&self) -> Option<String> {
        self.state.lock().bot_token.clone()
    }

    async fn refresh_channel_name(&self, name: &str) -> Result<(), BridgeError> {
        {
            let mut state = self.state.lock();
            if state.channel_name.as_deref() == Some(name) {
                return Ok(());
            }
            state.channel_name = Some(name.to_owned());
        }
        info!(room = %self.inbound_id, name, "remote channel renamed, persisting room");
        self.store.upsert_room(&self.to_entry()).await?;
        Ok(())
    }

    async fn handle_inbound(&self, msg: RelayMessage) -> Result<(), BridgeError> {
        let Some(sender) = msg.user_id.clone().or_else(|| msg.bot_id.clone()) else {
            debug!(room = %self.inbound_id, "inbound message without a sender, skipping");
            return Ok(());
        };
        let team_id = self.slack_team_id().or_else(|| msg.team_id.clone());

        let ghost = self
            .ghosts
            .get_or_create(&sender, team_id.as_deref())
            .await?;

        if let Some(token) = self.bot_token() {
            ghost.update(&token, &msg, &self.displayname_suffix).await;
        }

        ghost
            .send_text(&self.matrix_room_id, &self.channel_id, &msg.ts, &msg.text)
            .await?;

        self.store
            .upsert_activity_metrics(ghost.user_id(), &self.inbound_id, Utc::now().date_naive())
            .await?;
        Ok(())
    }
}

/// In-memory room index, loaded once from storage at startup.
pub struct BridgedRoomRegistry {
    rooms: RwLock<HashMap<String, Arc<dyn BridgedRoom>>>,
    by_channel: RwLock<HashMap<String, String>>,
}

impl BridgedRoomRegistry {
    pub fn new() -> Self {
        Self {
            rooms: RwLock::new(HashMap::new()),
            by_channel: RwLock::new(HashMap::new()),
        }
    }

    pub async fn load(
        store: Arc<dyn Datastore>,
        ghosts: Arc<GhostRegistry>,
        displayname_suffix: &str,
    ) -> Result<Self, BridgeError> {
        let registry = Self::new();
        for entry in store.get_all_rooms().await? {
            match RelayRoom::from_entry(
                &entry,
                Arc::clone(&ghosts),
                Arc::clone(&store),
                displayname_suffix,
            ) {
                Ok(room) => registry.insert(Arc::new(room)),
                Err(err) => {
                    tracing::warn!(room = %entry.id, "skipping unloadable room: {err}");
                }
            }
        }
        info!(count = registry.rooms.read().len(), "bridged rooms loaded");
        Ok(registry)
    }

    pub fn insert(&self, room: Arc<dyn BridgedRoom>) {
        self.by_channel
            .write()
            .insert(room.slack_channel_id().to_owned(), room.inbound_id().to_owned());
        self.rooms
            .write()
            .insert(room.inbound_id().to_owned(), room);
    }

    pub fn room_by_channel_id(&self, channel_id: &str) -> Option<Arc<dyn BridgedRoom>> {
        let inbound_id = self.by_channel.read().get(channel_id).cloned()?;
        self.rooms.read().get(&inbound_id).cloned()
    }
}

impl Default for BridgedRoomRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl RoomRegistry for BridgedRoomRegistry {
    fn room_by_inbound_id(&self, inbound_id: &str) -> Option<Arc<dyn BridgedRoom>> {
        self.rooms.read().get(inbound_id).cloned()
    }
}

/// Relays Events API message callbacks straight into their rooms.
/// Events arriving here skip the webhook-only history enrichment; the
/// payload already carries the canonical message body.
pub struct EventRelayHandler {
    rooms: Arc<BridgedRoomRegistry>,
}

impl EventRelayHandler {
    pub fn new(rooms: Arc<BridgedRoomRegistry>) -> Self {
        Self { rooms }
    }
}

#[async_trait]
impl SlackEventHandler for EventRelayHandler {
    async fn handle_event(&self, team_id: Option<&str>, event: &Value) -> Result<(), BridgeError> {
        if event.get("type").and_then(Value::as_str) != Some("message")
            || event.get("subtype").is_some()
        {
            return Ok(());
        }
        let Some(channel_id) = event.get("channel").and_then(Value::as_str) else {
            return Ok(());
        };
        let Some(room) = self.rooms.room_by_channel_id(channel_id) else {
            debug!(channel_id, "event for an unbridged channel, ignoring");
            return Ok(());
        };

        let mut msg = RelayMessage::from_history_message(event);
        msg.channel_id = channel_id.to_owned();
        msg.team_id = team_id.map(ToOwned::to_owned);
        room.handle_inbound(msg).await
    }
}

/// Resolves `<@U...>` mentions against the team's stored ghosts.
pub async fn substitute_team_mentions(
    store: &dyn Datastore,
    team_id: Option<&str>,
    text: &str,
) -> Result<String, DatastoreError> {
    let users = match team_id {
        Some(team) => store.get_all_users_for_team(team).await?,
        None => Vec::new(),
    };
    let by_slack_id: HashMap<&str, &str> = users
        .iter()
        .filter_map(|user| {
            let slack_id = user.slack_id.as_deref()?;
            let name = user.display_name.as_deref()?;
            Some((slack_id, name))
        })
        .collect();
    Ok(substitute_mentions(text, |id| {
        by_slack_id.get(id).map(|name| (*name).to_owned())
    }))
}
