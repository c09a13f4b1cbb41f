//! Slack Web API client. The [`SlackApi`] trait is the seam the ghost
//! and ingestion layers depend on; [`SlackClient`] is the reqwest
//! implementation.

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;
use serde_json::{Value, json};
use thiserror::Error;
use tracing::warn;

static USER_MENTION_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"<@([A-Z0-9]+)(?:\|[^>]+)?>").expect("valid user mention regex"));
static CHANNEL_MENTION_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"<#([A-Z0-9]+)\|([^>]+)>").expect("valid channel mention regex")
});
static LINK_WITH_LABEL_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"<((?:https?|mailto):[^>|]+)\|([^>]+)>").expect("valid labeled link regex")
});
static RAW_LINK_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"<((?:https?|mailto):[^>]+)>").expect("valid raw link regex"));

#[derive(Debug, Error)]
pub enum SlackError {
    #[error("slack request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("slack api {method} returned ok=false: {code}")]
    Api { method: String, code: String },

    #[error("slack api {method} response missing field {field}")]
    MissingField { method: String, field: &'static str },

    /// Exact-timestamp history lookup returned nothing.
    #[error("could not find history for channel {channel} ts {ts}")]
    CouldNotFindHistory { channel: String, ts: String },

    /// More than one message at the same timestamp. The message is
    /// dropped rather than guessed at.
    #[error("history collision for channel {channel} ts {ts}: {count} matches")]
    HistoryCollision {
        channel: String,
        ts: String,
        count: usize,
    },
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct SlackProfile {
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub avatar_hash: Option<String>,
    #[serde(default)]
    pub real_name: Option<String>,
    #[serde(default)]
    pub image_original: Option<String>,
    #[serde(default)]
    pub image_512: Option<String>,
    #[serde(default)]
    pub image_192: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct SlackUserInfo {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub is_bot: bool,
    #[serde(default)]
    pub profile: SlackProfile,
}

impl SlackUserInfo {
    /// Display name priority matches what Slack clients themselves
    /// render: profile display name, then real name, then handle.
    pub fn best_name(&self) -> Option<String> {
        [
            self.profile.display_name.as_deref(),
            self.profile.real_name.as_deref(),
            self.name.as_deref(),
        ]
        .into_iter()
        .flatten()
        .map(str::trim)
        .find(|value| !value.is_empty())
        .map(str::to_owned)
    }

    pub fn best_avatar(&self) -> Option<&str> {
        self.profile
            .image_original
            .as_deref()
            .or(self.profile.image_512.as_deref())
            .or(self.profile.image_192.as_deref())
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SlackBotIcons {
    #[serde(default)]
    pub image_72: Option<String>,
    #[serde(default)]
    pub image_48: Option<String>,
    #[serde(default)]
    pub image_36: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SlackBotInfo {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub icons: SlackBotIcons,
}

impl SlackBotInfo {
    pub fn best_icon(&self) -> Option<&str> {
        self.icons
            .image_72
            .as_deref()
            .or(self.icons.image_48.as_deref())
            .or(self.icons.image_36.as_deref())
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SlackFile {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub mimetype: Option<String>,
    #[serde(default)]
    pub url_private: Option<String>,
    #[serde(default)]
    pub permalink_public: Option<String>,
    #[serde(default)]
    pub public_url_shared: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AuthTestResponse {
    pub user_id: String,
    pub team_id: String,
    #[serde(default)]
    pub team: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub bot_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OAuthBotGrant {
    pub bot_user_id: String,
    pub bot_access_token: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OAuthAccessResponse {
    pub access_token: String,
    #[serde(default)]
    pub scope: String,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub team_id: Option<String>,
    #[serde(default)]
    pub team_name: Option<String>,
    #[serde(default)]
    pub bot: Option<OAuthBotGrant>,
}

/// One inbound remote message in strongly typed form. Built either
/// from legacy webhook form parameters or from a history lookup, never
/// passed around as raw JSON.
#[derive(Debug, Clone, Default)]
pub struct RelayMessage {
    pub team_id: Option<String>,
    pub team_domain: Option<String>,
    pub channel_id: String,
    pub channel_name: Option<String>,
    pub user_id: Option<String>,
    pub user_name: Option<String>,
    pub bot_id: Option<String>,
    pub ts: String,
    pub text: String,
    pub thread_ts: Option<String>,
    pub files: Vec<SlackFile>,
}

impl RelayMessage {
    /// Builds a message from a `conversations.history` entry.
    pub fn from_history_message(message: &Value) -> Self {
        let files = message
            .get("files")
            .and_then(Value::as_array)
            .map(|files| {
                files
                    .iter()
                    .filter_map(|file| serde_json::from_value(file.clone()).ok())
                    .collect()
            })
            .unwrap_or_default();
        Self {
            team_id: None,
            team_domain: None,
            channel_id: String::new(),
            channel_name: None,
            user_id: message
                .get("user")
                .and_then(Value::as_str)
                .map(ToOwned::to_owned),
            user_name: None,
            bot_id: message
                .get("bot_id")
                .and_then(Value::as_str)
                .map(ToOwned::to_owned),
            ts: message
                .get("ts")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_owned(),
            text: message
                .get("text")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_owned(),
            thread_ts: message
                .get("thread_ts")
                .and_then(Value::as_str)
                .map(ToOwned::to_owned),
            files,
        }
    }
}

/// The Slack Web API surface the bridge consumes.
#[async_trait]
pub trait SlackApi: Send + Sync {
    async fn users_info(&self, token: &str, user_id: &str) -> Result<SlackUserInfo, SlackError>;

    async fn bots_info(&self, token: &str, bot_id: &str) -> Result<SlackBotInfo, SlackError>;

    /// Messages at exactly `ts` (inclusive window, oldest = latest).
    async fn conversations_history_at(
        &self,
        token: &str,
        channel_id: &str,
        ts: &str,
    ) -> Result<Vec<Value>, SlackError>;

    async fn auth_test(&self, token: &str) -> Result<AuthTestResponse, SlackError>;

    async fn oauth_access(
        &self,
        client_id: &str,
        client_secret: &str,
        code: &str,
        redirect_uri: &str,
    ) -> Result<OAuthAccessResponse, SlackError>;

    async fn auth_revoke(&self, token: &str) -> Result<(), SlackError>;

    /// Makes a file link-shareable and returns the refreshed metadata.
    async fn files_shared_public_url(
        &self,
        token: &str,
        file_id: &str,
    ) -> Result<SlackFile, SlackError>;

    async fn fetch_file_content(&self, url: &str, token: &str) -> Result<Vec<u8>, SlackError>;
}

/// Exact-timestamp lookup with the dedup policy applied: zero matches
/// and same-microsecond collisions are both failures, never guesses.
pub async fn lookup_message_at(
    api: &dyn SlackApi,
    token: &str,
    channel_id: &str,
    ts: &str,
) -> Result<RelayMessage, SlackError> {
    let messages = api.conversations_history_at(token, channel_id, ts).await?;
    match messages.len() {
        0 => Err(SlackError::CouldNotFindHistory {
            channel: channel_id.to_owned(),
            ts: ts.to_owned(),
        }),
        1 => Ok(RelayMessage::from_history_message(&messages[0])),
        count => Err(SlackError::HistoryCollision {
            channel: channel_id.to_owned(),
            ts: ts.to_owned(),
            count,
        }),
    }
}

/// Rewrites Slack's wire-format text into plain readable text: HTML
/// entities, `<@U...>` user mentions (resolved through `resolve_user`,
/// falling back to the raw id), channel mentions, special mentions and
/// links.
pub fn substitute_mentions(input: &str, resolve_user: impl Fn(&str) -> Option<String>) -> String {
    let mut text = input
        .replace("&amp;", "&")
        .replace("&lt;", "<")
        .replace("&gt;", ">");

    text = USER_MENTION_REGEX
        .replace_all(&text, |caps: &regex::Captures| {
            let id = &caps[1];
            match resolve_user(id) {
                Some(name) => format!("@{name}"),
                None => format!("@{id}"),
            }
        })
        .to_string();
    text = CHANNEL_MENTION_REGEX
        .replace_all(&text, |caps: &regex::Captures| format!("#{}", &caps[2]))
        .to_string();
    text = text
        .replace("<!channel>", "@channel")
        .replace("<!here>", "@here")
        .replace("<!everyone>", "@everyone");
    text = LINK_WITH_LABEL_REGEX
        .replace_all(&text, |caps: &regex::Captures| {
            format!("{} ({})", &caps[2], &caps[1])
        })
        .to_string();
    text = RAW_LINK_REGEX
        .replace_all(&text, |caps: &regex::Captures| caps[1].to_string())
        .to_string();

    text
}

#[derive(Clone)]
pub struct SlackClient {
    http: reqwest::Client,
}

impl SlackClient {
    pub fn new() -> Result<Self, SlackError> {
        let http = reqwest::Client::builder()
            .user_agent("matrix-appservice-slack")
            .build()?;
        Ok(Self { http })
    }

    async fn api_post(&self, method: &str, token: &str, payload: Value) -> Result<Value, SlackError> {
        let response = self
            .http
            .post(format!("https://slack.com/api/{method}"))
            .bearer_auth(token)
            .json(&payload)
            .send()
            .await?;
        let value: Value = response.json().await?;
        check_ok(method, value)
    }

    fn field<T>(method: &str, field: &'static str, value: Option<T>) -> Result<T, SlackError> {
        value.ok_or(SlackError::MissingField {
            method: method.to_owned(),
            field,
        })
    }
}

fn check_ok(method: &str, value: Value) -> Result<Value, SlackError> {
    if value.get("ok").and_then(Value::as_bool).unwrap_or(false) {
        Ok(value)
    } else {
        let code = value
            .get("error")
            .and_then(Value::as_str)
            .unwrap_or("unknown_error")
            .to_owned();
        Err(SlackError::Api {
            method: method.to_owned(),
            code,
        })
    }
}

#[async_trait]
impl SlackApi for SlackClient {
    async fn users_info(&self, token: &str, user_id: &str) -> Result<SlackUserInfo, SlackError> {
        let value = self
            .api_post("users.info", token, json!({ "user": user_id }))
            .await?;
        let user = Self::field("users.info", "user", value.get("user").cloned())?;
        serde_json::from_value(user).map_err(|_| SlackError::MissingField {
            method: "users.info".to_owned(),
            field: "user",
        })
    }

    async fn bots_info(&self, token: &str, bot_id: &str) -> Result<SlackBotInfo, SlackError> {
        let value = self
            .api_post("bots.info", token, json!({ "bot": bot_id }))
            .await?;
        let bot = Self::field("bots.info", "bot", value.get("bot").cloned())?;
        serde_json::from_value(bot).map_err(|_| SlackError::MissingField {
            method: "bots.info".to_owned(),
            field: "bot",
        })
    }

    async fn conversations_history_at(
        &self,
        token: &str,
        channel_id: &str,
        ts: &str,
    ) -> Result<Vec<Value>, SlackError> {
        let value = self
            .api_post(
                "conversations.history",
                token,
                json!({
                    "channel": channel_id,
                    "oldest": ts,
                    "latest": ts,
                    "inclusive": true
                }),
            )
            .await?;
        Ok(value
            .get("messages")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default())
    }

    async fn auth_test(&self, token: &str) -> Result<AuthTestResponse, SlackError> {
        let value = self.api_post("auth.test", token, json!({})).await?;
        serde_json::from_value(value).map_err(|_| SlackError::MissingField {
            method: "auth.test".to_owned(),
            field: "user_id",
        })
    }

    async fn oauth_access(
        &self,
        client_id: &str,
        client_secret: &str,
        code: &str,
        redirect_uri: &str,
    ) -> Result<OAuthAccessResponse, SlackError> {
        let response = self
            .http
            .post("https://slack.com/api/oauth.access")
            .form(&[
                ("client_id", client_id),
                ("client_secret", client_secret),
                ("code", code),
                ("redirect_uri", redirect_uri),
            ])
            .send()
            .await?;
        let value: Value = response.json().await?;
        let value = check_ok("oauth.access", value)?;
        serde_json::from_value(value).map_err(|_| SlackError::MissingField {
            method: "oauth.access".to_owned(),
            field: "access_token",
        })
    }

    async fn auth_revoke(&self, token: &str) -> Result<(), SlackError> {
        self.api_post("auth.revoke", token, json!({})).await?;
        Ok(())
    }

    async fn files_shared_public_url(
        &self,
        token: &str,
        file_id: &str,
    ) -> Result<SlackFile, SlackError> {
        let value = self
            .api_post("files.sharedPublicURL", token, json!({ "file": file_id }))
            .await?;
        let file = Self::field("files.sharedPublicURL", "file", value.get("file").cloned())?;
        serde_json::from_value(file).map_err(|_| SlackError::MissingField {
            method: "files.sharedPublicURL".to_owned(),
            field: "file",
        })
    }

    async fn fetch_file_content(&self, url: &str, token: &str) -> Result<Vec<u8>, SlackError> {
        let response = self.http.get(url).bearer_auth(token).send().await?;
        let status = response.status();
        if !status.is_success() {
            warn!("file fetch from {url} failed with status {status}");
        }
        let bytes = response.error_for_status()?.bytes().await?;
        Ok(bytes.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedHistory(Vec<Value>);

    #[async_trait]
    impl SlackApi for FixedHistory {
        async fn users_info(&self, _: &str, _: &str) -> Result<SlackUserInfo, SlackError> {
            unimplemented!()
        }
        async fn bots_info(&self, _: &str, _: &str) -> Result<SlackBotInfo, SlackError> {
            unimplemented!()
        }
        async fn conversations_history_at(
            &self,
            _: &str,
            _: &str,
            _: &str,
        ) -> Result<Vec<Value>, SlackError> {
            Ok(self.0.clone())
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
            unimplemented!()
        }
        async fn files_shared_public_url(&self, _: &str, _: &str) -> Result<SlackFile, SlackError> {
            unimplemented!()
        }
        async fn fetch_file_content(&self, _: &str, _: &str) -> Result<Vec<u8>, SlackError> {
            unimplemented!()
        }
    }

    #[tokio::test]
    async fn empty_history_is_could_not_find() {
        let api = FixedHistory(vec![]);
        let err = lookup_message_at(&api, "tok", "C1", "1.0").await.unwrap_err();
        assert!(matches!(err, SlackError::CouldNotFindHistory { .. }));
    }

    #[tokio::test]
    async fn two_matches_is_a_collision() {
        let message = serde_json::json!({"ts": "1.0", "text": "hi"});
        let api = FixedHistory(vec![message.clone(), message]);
        let err = lookup_message_at(&api, "tok", "C1", "1.0").await.unwrap_err();
        assert!(matches!(err, SlackError::HistoryCollision { count: 2, .. }));
    }

    #[tokio::test]
    async fn single_match_returns_the_message() {
        let message = serde_json::json!({
            "ts": "1234.5678",
            "text": "hello",
            "user": "U1",
            "files": [{"id": "F1", "name": "cat.png", "public_url_shared": false}]
        });
        let api = FixedHistory(vec![message]);
        let relayed = lookup_message_at(&api, "tok", "C1", "1234.5678").await.unwrap();
        assert_eq!(relayed.ts, "1234.5678");
        assert_eq!(relayed.user_id.as_deref(), Some("U1"));
        assert_eq!(relayed.files.len(), 1);
        assert_eq!(relayed.files[0].id, "F1");
    }

    #[test]
    fn mention_substitution_resolves_known_users() {
        let text = "hey <@U123>, see <#C99|general> and <https://a.example|docs> or <https://b.example> &amp; more";
        let out = substitute_mentions(text, |id| {
            (id == "U123").then(|| "alice".to_string())
        });
        assert_eq!(
            out,
            "hey @alice, see #general and docs (https://a.example) or https://b.example & more"
        );
    }

    #[test]
    fn mention_substitution_falls_back_to_raw_id() {
        let out = substitute_mentions("<@U42> <!here>", |_| None);
        assert_eq!(out, "@U42 @here");
    }

    #[test]
    fn best_name_prefers_display_name_and_skips_blanks() {
        let user = SlackUserInfo {
            id: "U1".into(),
            name: Some("handle".into()),
            is_bot: false,
            profile: SlackProfile {
                display_name: Some("  ".into()),
                real_name: Some("Alice A".into()),
                ..Default::default()
            },
        };
        assert_eq!(user.best_name().as_deref(), Some("Alice A"));
    }
}
