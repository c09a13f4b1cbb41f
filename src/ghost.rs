//! One puppeted Slack identity on the Matrix side. A ghost owns its
//! profile-sync state machine, the coalesced user-info lookup slot and
//! the event-recording send operations.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use parking_lot::Mutex;
use serde_json::json;
use thiserror::Error;
use tracing::{debug, warn};

use crate::db::{Datastore, DatastoreError, EventEntry, UserEntry};
use crate::matrix::{MatrixError, MatrixIntent};
use crate::slack::{RelayMessage, SlackApi, SlackError, SlackUserInfo};

const USER_INFO_TTL: Duration = Duration::from_secs(10 * 60);
const TYPING_TIMEOUT_MS: u64 = 20_000;

#[derive(Debug, Error)]
pub enum GhostError {
    #[error(transparent)]
    Matrix(#[from] MatrixError),

    #[error(transparent)]
    Slack(#[from] SlackError),

    #[error(transparent)]
    Datastore(#[from] DatastoreError),

    #[error("user info lookup failed: {0}")]
    Lookup(String),
}

/// The message being replied to, for building quoted-reply fallbacks.
#[derive(Debug, Clone)]
pub struct ReplySource {
    pub event_id: String,
    pub sender: String,
    pub body: String,
}

type SharedFetch = Shared<BoxFuture<'static, Result<SlackUserInfo, String>>>;

/// Single-slot user-info cache. At most one remote fetch is in flight
/// per ghost; concurrent callers attach to it instead of duplicating
/// the call.
enum UserInfoSlot {
    Empty,
    InFlight(SharedFetch),
    Cached {
        info: SlackUserInfo,
        fetched_at: Instant,
    },
}

pub struct SlackGhost {
    user_id: String,
    slack_id: String,
    intent: Arc<dyn MatrixIntent>,
    slack: Arc<dyn SlackApi>,
    store: Arc<dyn Datastore>,
    entry: Mutex<UserEntry>,
    updating: AtomicBool,
    typing_in: Mutex<HashSet<String>>,
    user_info: tokio::sync::Mutex<UserInfoSlot>,
}

impl SlackGhost {
    pub fn new(
        entry: UserEntry,
        intent: Arc<dyn MatrixIntent>,
        slack: Arc<dyn SlackApi>,
        store: Arc<dyn Datastore>,
    ) -> Self {
        Self {
            user_id: entry.id.clone(),
            slack_id: entry.slack_id.clone().unwrap_or_default(),
            intent,
            slack,
            store,
            entry: Mutex::new(entry),
            updating: AtomicBool::new(false),
            typing_in: Mutex::new(HashSet::new()),
            user_info: tokio::sync::Mutex::new(UserInfoSlot::Empty),
        }
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    /// Profile sync entry point, invoked once per inbound message.
    /// While a sync is running, further calls are dropped outright;
    /// the profile converges on a later message instead.
    pub async fn update(&self, token: &str, msg: &RelayMessage, displayname_suffix: &str) {
        if self
            .updating
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!(ghost = %self.user_id, "profile update already in progress, dropping");
            return;
        }

        let (name_result, avatar_result) = tokio::join!(
            self.sync_display_name(token, msg, displayname_suffix),
            self.sync_avatar(token, msg),
        );
        if let Err(err) = name_result {
            warn!(ghost = %self.user_id, "displayname sync failed: {err}");
        }
        if let Err(err) = avatar_result {
            warn!(ghost = %self.user_id, "avatar sync failed: {err}");
        }

        self.updating.store(false, Ordering::SeqCst);
    }

    async fn sync_display_name(
        &self,
        token: &str,
        msg: &RelayMessage,
        suffix: &str,
    ) -> Result<(), GhostError> {
        // bot_id plus user_id at once marks a bot-channel operation on
        // a user's behalf; renaming the ghost would be wrong here.
        if msg.bot_id.is_some() && msg.user_id.is_some() {
            return Ok(());
        }

        let base = if let Some(name) = msg.user_name.as_deref() {
            Some(name.to_owned())
        } else if let Some(bot_id) = msg.bot_id.as_deref() {
            self.slack.bots_info(token, bot_id).await?.name
        } else if msg.user_id.is_some() {
            self.get_user_info(token).await?.best_name()
        } else {
            None
        };
        let Some(base) = base else {
            return Ok(());
        };

        let name = format!("{base}{suffix}");
        if self.entry.lock().display_name.as_deref() == Some(name.as_str()) {
            return Ok(());
        }

        self.intent.set_display_name(&self.user_id, &name).await?;
        self.entry.lock().display_name = Some(name);
        self.persist_entry().await
    }

    async fn sync_avatar(&self, token: &str, msg: &RelayMessage) -> Result<(), GhostError> {
        if msg.bot_id.is_some() && msg.user_id.is_some() {
            return Ok(());
        }

        // Bots expose no avatar hash, so the icon URL itself is the
        // change detector.
        let (url, hash) = if let Some(bot_id) = msg.bot_id.as_deref() {
            let bot = self.slack.bots_info(token, bot_id).await?;
            match bot.best_icon() {
                Some(url) => (url.to_owned(), url.to_owned()),
                None => return Ok(()),
            }
        } else if msg.user_id.is_some() {
            let info = self.get_user_info(token).await?;
            let Some(url) = info.best_avatar().map(ToOwned::to_owned) else {
                return Ok(());
            };
            let hash = info.profile.avatar_hash.clone().unwrap_or_else(|| url.clone());
            (url, hash)
        } else {
            return Ok(());
        };

        if self.entry.lock().avatar_url.as_deref() == Some(hash.as_str()) {
            return Ok(());
        }

        let bytes = self.slack.fetch_file_content(&url, token).await?;
        let content_type = content_type_for(&url);
        let mxc = self.intent.upload_content(bytes, content_type).await?;
        self.intent.set_avatar_url(&self.user_id, &mxc).await?;
        // The hash is recorded only after the profile mutation, so a
        // crash mid-upload retries on the next message.
        self.entry.lock().avatar_url = Some(hash);
        self.persist_entry().await
    }

    async fn get_user_info(&self, token: &str) -> Result<SlackUserInfo, GhostError> {
        let fetch = {
            let mut slot = self.user_info.lock().await;
            match &*slot {
                UserInfoSlot::Cached { info, fetched_at }
                    if fetched_at.elapsed() < USER_INFO_TTL =>
                {
                    return Ok(info.clone());
                }
                UserInfoSlot::InFlight(fetch) => fetch.clone(),
                _ => {
                    let slack = Arc::clone(&self.slack);
                    let token = token.to_owned();
                    let slack_id = self.slack_id.clone();
                    let fetch: SharedFetch = async move {
                        slack
                            .users_info(&token, &slack_id)
                            .await
                            .map_err(|err| err.to_string())
                    }
                    .boxed()
                    .shared();
                    *slot = UserInfoSlot::InFlight(fetch.clone());
                    fetch
                }
            }
        };

        let result = fetch.await;
        let mut slot = self.user_info.lock().await;
        match result {
            Ok(info) => {
                *slot = UserInfoSlot::Cached {
                    info: info.clone(),
                    fetched_at: Instant::now(),
                };
                Ok(info)
            }
            Err(message) => {
                *slot = UserInfoSlot::Empty;
                Err(GhostError::Lookup(message))
            }
        }
    }

    async fn persist_entry(&self) -> Result<(), GhostError> {
        let entry = self.entry.lock().clone();
        self.store.upsert_user(&entry).await?;
        Ok(())
    }

    pub async fn send_text(
        &self,
        room_id: &str,
        channel_id: &str,
        ts: &str,
        text: &str,
    ) -> Result<String, GhostError> {
        let content = json!({ "msgtype": "m.text", "body": text });
        self.send_message(room_id, channel_id, ts, content).await
    }

    /// Delivers a message event and records the dedup row. A failed
    /// record-write propagates: the message is on the wire but
    /// unindexed, which the caller must treat as partial failure.
    pub async fn send_message(
        &self,
        room_id: &str,
        channel_id: &str,
        ts: &str,
        content: serde_json::Value,
    ) -> Result<String, GhostError> {
        let event_id = self.intent.send_message(&self.user_id, room_id, content).await?;
        self.record_event(room_id, &event_id, channel_id, ts).await?;
        Ok(event_id)
    }

    pub async fn send_reaction(
        &self,
        room_id: &str,
        reacted_event_id: &str,
        channel_id: &str,
        ts: &str,
        key: &str,
    ) -> Result<String, GhostError> {
        let content = json!({
            "m.relates_to": {
                "rel_type": "m.annotation",
                "event_id": reacted_event_id,
                "key": key
            }
        });
        let event_id = self
            .intent
            .send_event(&self.user_id, room_id, "m.reaction", content)
            .await?;
        self.record_event(room_id, &event_id, channel_id, ts).await?;
        Ok(event_id)
    }

    pub async fn send_with_reply(
        &self,
        room_id: &str,
        channel_id: &str,
        ts: &str,
        text: &str,
        reply: &ReplySource,
    ) -> Result<String, GhostError> {
        let body = format!("{}{}", get_fallback_text(reply), text);
        let formatted = format!("{}{}", get_fallback_html(room_id, reply), text);
        let content = json!({
            "msgtype": "m.text",
            "body": body,
            "format": "org.matrix.custom.html",
            "formatted_body": formatted,
            "m.relates_to": {
                "m.in_reply_to": { "event_id": reply.event_id }
            }
        });
        self.send_message(room_id, channel_id, ts, content).await
    }

    async fn record_event(
        &self,
        room_id: &str,
        event_id: &str,
        channel_id: &str,
        ts: &str,
    ) -> Result<(), GhostError> {
        let entry = EventEntry::new(room_id, event_id, channel_id, ts);
        self.store.upsert_event(&entry).await?;
        Ok(())
    }

    pub async fn send_typing(&self, room_id: &str) -> Result<(), GhostError> {
        self.typing_in.lock().insert(room_id.to_owned());
        self.intent
            .send_typing(&self.user_id, room_id, true, TYPING_TIMEOUT_MS)
            .await?;
        Ok(())
    }

    /// No-op when the ghost is not recorded as typing in the room.
    pub async fn cancel_typing(&self, room_id: &str) -> Result<(), GhostError> {
        if !self.typing_in.lock().remove(room_id) {
            return Ok(());
        }
        self.intent.send_typing(&self.user_id, room_id, false, 0).await?;
        Ok(())
    }

    pub async fn update_read_marker(
        &self,
        room_id: &str,
        event_id: &str,
    ) -> Result<(), GhostError> {
        self.intent
            .send_read_receipt(&self.user_id, room_id, event_id)
            .await?;
        Ok(())
    }
}

/// Quoted-reply plain-text preamble. Pure function of the reply.
pub fn get_fallback_text(reply: &ReplySource) -> String {
    let quoted = reply.body.replace('\n', "\n> ");
    format!("> <{}> {}\n\n", reply.sender, quoted)
}

/// Quoted-reply rich preamble in the standard mx-reply envelope.
pub fn get_fallback_html(room_id: &str, reply: &ReplySource) -> String {
    format!(
        "<mx-reply><blockquote><a href=\"https://matrix.to/#/{room}/{event}\">In reply to</a> \
         <a href=\"https://matrix.to/#/{sender}\">{sender}</a><br />{body}</blockquote></mx-reply>",
        room = room_id,
        event = reply.event_id,
        sender = reply.sender,
        body = reply.body,
    )
}

fn content_type_for(url: &str) -> &'static str {
    if url.ends_with(".png") {
        "image/png"
    } else if url.ends_with(".gif") {
        "image/gif"
    } else {
        "image/jpeg"
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use async_trait::async_trait;
    use serde_json::Value;
    use tokio::sync::Notify;

    use super::*;
    use crate::slack::{
        AuthTestResponse, OAuthAccessResponse, SlackBotInfo, SlackFile, SlackProfile,
    };

    #[derive(Default)]
    struct CountingIntent {
        display_name_calls: AtomicUsize,
        avatar_calls: AtomicUsize,
        typing_calls: AtomicUsize,
        last_display_name: Mutex<Option<String>>,
    }

    #[async_trait]
    impl MatrixIntent for CountingIntent {
        async fn set_display_name(&self, _: &str, name: &str) -> Result<(), MatrixError> {
            self.display_name_calls.fetch_add(1, Ordering::SeqCst);
            *self.last_display_name.lock() = Some(name.to_owned());
            Ok(())
        }
        async fn set_avatar_url(&self, _: &str, _: &str) -> Result<(), MatrixError> {
            self.avatar_calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
        async fn upload_content(&self, _: Vec<u8>, _: &str) -> Result<String, MatrixError> {
            Ok("mxc://example.org/uploaded".to_owned())
        }
        async fn send_message(&self, _: &str, _: &str, _: Value) -> Result<String, MatrixError> {
            Ok("$sent:example.org".to_owned())
        }
        async fn send_event(
            &self,
            _: &str,
            _: &str,
            _: &str,
            _: Value,
        ) -> Result<String, MatrixError> {
            Ok("$reacted:example.org".to_owned())
        }
        async fn send_typing(&self, _: &str, _: &str, _: bool, _: u64) -> Result<(), MatrixError> {
            self.typing_calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
        async fn send_read_receipt(&self, _: &str, _: &str, _: &str) -> Result<(), MatrixError> {
            Ok(())
        }
    }

    struct GatedSlack {
        entered: Notify,
        release: Notify,
        users_info_calls: AtomicUsize,
        gated: bool,
    }

    impl GatedSlack {
        fn new(gated: bool) -> Self {
            Self {
                entered: Notify::new(),
                release: Notify::new(),
                users_info_calls: AtomicUsize::new(0),
                gated,
            }
        }
    }

    #[async_trait]
    impl SlackApi for GatedSlack {
        async fn users_info(&self, _: &str, user_id: &str) -> Result<SlackUserInfo, SlackError> {
            self.users_info_calls.fetch_add(1, Ordering::SeqCst);
            if self.gated {
                self.entered.notify_one();
                self.release.notified().await;
            }
            Ok(SlackUserInfo {
                id: user_id.to_owned(),
                name: Some("alice".to_owned()),
                is_bot: false,
                profile: SlackProfile::default(),
            })
        }
        async fn bots_info(&self, _: &str, _: &str) -> Result<SlackBotInfo, SlackError> {
            Ok(SlackBotInfo::default())
        }
        async fn conversations_history_at(
            &self,
            _: &str,
            _: &str,
            _: &str,
        ) -> Result<Vec<Value>, SlackError> {
            Ok(vec![])
        }
        async fn auth_test(&self, _: &str) -> Result<AuthTestResponse, SlackError> {
            unimplemented!()
        }
        async fn oauth_access(
            &self,
            _: &str,
            _: &str,
            _: &str,
            _: &str,
        ) -> Result<OAuthAccessResponse, SlackError> {
            unimplemented!()
        }
        async fn auth_revoke(&self, _: &str) -> Result<(), SlackError> {
            Ok(())
        }
        async fn files_shared_public_url(&self, _: &str, _: &str) -> Result<SlackFile, SlackError> {
            unimplemented!()
        }
        async fn fetch_file_content(&self, _: &str, _: &str) -> Result<Vec<u8>, SlackError> {
            Ok(vec![1, 2, 3])
        }
    }

    #[cfg(feature = "sqlite")]
    async fn temp_store() -> (Arc<dyn Datastore>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ghost.db").to_string_lossy().into_owned();
        let store = crate::db::sqlite::SqliteDatastore::new(path);
        store.ensure_schema().await.unwrap();
        (Arc::new(store), dir)
    }

    #[cfg(feature = "sqlite")]
    fn ghost(
        intent: Arc<CountingIntent>,
        slack: Arc<GatedSlack>,
        store: Arc<dyn Datastore>,
    ) -> Arc<SlackGhost> {
        let entry = UserEntry::new("@_slack_u1:example.org", "U1", Some("T1"));
        Arc::new(SlackGhost::new(entry, intent, slack, store))
    }

    fn plain_message() -> RelayMessage {
        RelayMessage {
            user_id: Some("U1".to_owned()),
            channel_id: "C1".to_owned(),
            ts: "1.0".to_owned(),
            text: "hi".to_owned(),
            ..Default::default()
        }
    }

    #[cfg(feature = "sqlite")]
    #[tokio::test]
    async fn concurrent_update_is_dropped_not_queued() {
        let intent = Arc::new(CountingIntent::default());
        let slack = Arc::new(GatedSlack::new(true));
        let (store, _dir) = temp_store().await;
        let ghost = ghost(Arc::clone(&intent), Arc::clone(&slack), store);

        let first = {
            let ghost = Arc::clone(&ghost);
            tokio::spawn(async move {
                ghost.update("tok", &plain_message(), " (Slack)").await;
            })
        };
        // Wait until the first update is parked inside the remote
        // lookup, then issue the second.
        slack.entered.notified().await;
        ghost.update("tok", &plain_message(), " (Slack)").await;
        slack.release.notify_one();
        first.await.unwrap();

        assert_eq!(intent.display_name_calls.load(Ordering::SeqCst), 1);
        assert_eq!(slack.users_info_calls.load(Ordering::SeqCst), 1);
        assert_eq!(
            intent.last_display_name.lock().as_deref(),
            Some("alice (Slack)")
        );
    }

    #[cfg(feature = "sqlite")]
    #[tokio::test]
    async fn repeated_update_with_same_name_is_a_no_op() {
        let intent = Arc::new(CountingIntent::default());
        let slack = Arc::new(GatedSlack::new(false));
        let (store, _dir) = temp_store().await;
        let ghost = ghost(Arc::clone(&intent), slack, Arc::clone(&store));

        let mut msg = plain_message();
        msg.user_name = Some("alice".to_owned());
        ghost.update("tok", &msg, " (Slack)").await;
        ghost.update("tok", &msg, " (Slack)").await;

        assert_eq!(intent.display_name_calls.load(Ordering::SeqCst), 1);
        let persisted = store.get_user("@_slack_u1:example.org").await.unwrap().unwrap();
        assert_eq!(persisted.display_name.as_deref(), Some("alice (Slack)"));
    }

    #[cfg(feature = "sqlite")]
    #[tokio::test]
    async fn bot_and_user_together_skip_profile_sync() {
        let intent = Arc::new(CountingIntent::default());
        let slack = Arc::new(GatedSlack::new(false));
        let (store, _dir) = temp_store().await;
        let ghost = ghost(Arc::clone(&intent), Arc::clone(&slack), store);

        let mut msg = plain_message();
        msg.bot_id = Some("B1".to_owned());
        ghost.update("tok", &msg, " (Slack)").await;

        assert_eq!(intent.display_name_calls.load(Ordering::SeqCst), 0);
        assert_eq!(intent.avatar_calls.load(Ordering::SeqCst), 0);
        assert_eq!(slack.users_info_calls.load(Ordering::SeqCst), 0);
    }

    #[cfg(feature = "sqlite")]
    #[tokio::test]
    async fn send_text_records_the_dedup_row() {
        let intent = Arc::new(CountingIntent::default());
        let slack = Arc::new(GatedSlack::new(false));
        let (store, _dir) = temp_store().await;
        let ghost = ghost(intent, slack, Arc::clone(&store));

        let event_id = ghost
            .send_text("!room:example.org", "C1", "1700000000.000100", "hello")
            .await
            .unwrap();
        assert_eq!(event_id, "$sent:example.org");

        let recorded = store
            .get_event_by_slack_id("C1", "1700000000.000100")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(recorded.event_id, event_id);
        assert_eq!(recorded.room_id, "!room:example.org");
    }

    #[cfg(feature = "sqlite")]
    #[tokio::test]
    async fn reaction_and_reply_record_their_own_dedup_rows() {
        let intent = Arc::new(CountingIntent::default());
        let slack = Arc::new(GatedSlack::new(false));
        let (store, _dir) = temp_store().await;
        let ghost = ghost(intent, slack, Arc::clone(&store));

        ghost
            .send_reaction("!room:example.org", "$target:example.org", "C1", "2.0", "👍")
            .await
            .unwrap();
        let reaction = store.get_event_by_slack_id("C1", "2.0").await.unwrap().unwrap();
        assert_eq!(reaction.event_id, "$reacted:example.org");

        let reply = ReplySource {
            event_id: "$target:example.org".to_owned(),
            sender: "@alice:example.org".to_owned(),
            body: "original".to_owned(),
        };
        ghost
            .send_with_reply("!room:example.org", "C1", "3.0", "agreed", &reply)
            .await
            .unwrap();
        let replied = store.get_event_by_slack_id("C1", "3.0").await.unwrap().unwrap();
        assert_eq!(replied.event_id, "$sent:example.org");
    }

    #[cfg(feature = "sqlite")]
    #[tokio::test]
    async fn read_marker_update_is_best_effort_passthrough() {
        let intent = Arc::new(CountingIntent::default());
        let slack = Arc::new(GatedSlack::new(false));
        let (store, _dir) = temp_store().await;
        let ghost = ghost(intent, slack, store);

        ghost
            .update_read_marker("!room:example.org", "$seen:example.org")
            .await
            .unwrap();
    }

    #[cfg(feature = "sqlite")]
    #[tokio::test]
    async fn cancel_typing_without_typing_is_idempotent() {
        let intent = Arc::new(CountingIntent::default());
        let slack = Arc::new(GatedSlack::new(false));
        let (store, _dir) = temp_store().await;
        let ghost = ghost(Arc::clone(&intent), slack, store);

        ghost.cancel_typing("!room:example.org").await.unwrap();
        assert_eq!(intent.typing_calls.load(Ordering::SeqCst), 0);

        ghost.send_typing("!room:example.org").await.unwrap();
        ghost.cancel_typing("!room:example.org").await.unwrap();
        ghost.cancel_typing("!room:example.org").await.unwrap();
        assert_eq!(intent.typing_calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn fallback_text_quotes_every_line() {
        let reply = ReplySource {
            event_id: "$orig:example.org".to_owned(),
            sender: "@alice:example.org".to_owned(),
            body: "first\nsecond".to_owned(),
        };
        assert_eq!(
            get_fallback_text(&reply),
            "> <@alice:example.org> first\n> second\n\n"
        );
    }

    #[test]
    fn fallback_html_links_the_original_event() {
        let reply = ReplySource {
            event_id: "$orig:example.org".to_owned(),
            sender: "@alice:example.org".to_owned(),
            body: "hello".to_owned(),
        };
        let html = get_fallback_html("!room:example.org", &reply);
        assert!(html.starts_with("<mx-reply><blockquote>"));
        assert!(html.contains("!room:example.org/$orig:example.org"));
        assert!(html.ends_with("</blockquote></mx-reply>"));
    }
}
