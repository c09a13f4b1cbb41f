use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A remote Slack identity mapped to its local ghost, or (when
/// `is_remote` is false) a plain Matrix user record sharing the same
/// keyspace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserEntry {
    pub id: String,
    pub slack_id: Option<String>,
    pub team_id: Option<String>,
    pub display_name: Option<String>,
    pub avatar_url: Option<String>,
    pub is_remote: bool,
}

impl UserEntry {
    /// Builds a ghost record. Slack ids are case-insensitive on the
    /// wire but stored uppercase, so normalization happens here and
    /// not just at write time.
    pub fn new(id: impl Into<String>, slack_id: &str, team_id: Option<&str>) -> Self {
        Self {
            id: id.into(),
            slack_id: Some(slack_id.to_uppercase()),
            team_id: team_id.map(str::to_uppercase),
            display_name: None,
            avatar_url: None,
            is_remote: true,
        }
    }
}

/// A pure local-user record: no remote binding, free-form payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatrixUserEntry {
    pub id: String,
    pub data: Value,
}

/// One relayed message/reaction: the dedup mapping between a Matrix
/// event and its Slack (channel, ts) counterpart.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventEntry {
    pub room_id: String,
    pub event_id: String,
    pub slack_channel_id: String,
    pub slack_ts: String,
    pub extras: Option<Value>,
}

impl EventEntry {
    pub fn new(
        room_id: impl Into<String>,
        event_id: impl Into<String>,
        slack_channel_id: impl Into<String>,
        slack_ts: impl Into<String>,
    ) -> Self {
        Self {
            room_id: room_id.into(),
            event_id: event_id.into(),
            slack_channel_id: slack_channel_id.into(),
            slack_ts: slack_ts.into(),
            extras: None,
        }
    }

    pub fn with_extras(mut self, extras: Value) -> Self {
        self.extras = Some(extras);
        self
    }
}

/// A bridged room's persisted configuration. `remote` is owned by the
/// room abstraction and opaque to storage, except for the activity
/// aggregates which read `slack_team_id` and `slack_type` out of it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomEntry {
    pub id: String,
    pub matrix_id: String,
    pub remote_id: String,
    pub remote: Value,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TeamEntry {
    pub id: String,
    pub name: String,
    pub bot_token: String,
    pub bot_id: String,
    pub domain: String,
    pub scopes: String,
    pub status: TeamStatus,
    pub user_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TeamStatus {
    Ok,
    Archived,
    BadAuth,
}

impl TeamStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TeamStatus::Ok => "ok",
            TeamStatus::Archived => "archived",
            TeamStatus::BadAuth => "bad_auth",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "ok" => TeamStatus::Ok,
            "archived" => TeamStatus::Archived,
            _ => TeamStatus::BadAuth,
        }
    }
}

/// A per-user, per-team delegated credential used to act on Slack as
/// the linked user instead of as the bridge bot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PuppetEntry {
    pub matrix_id: String,
    pub team_id: String,
    pub slack_id: String,
    pub token: String,
}

/// A linked-account record from a Matrix user to a Slack identity.
/// `bot_granted` records whether the grant that produced this token
/// also carried a bot token for the workspace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlackAccount {
    pub matrix_id: String,
    pub slack_id: String,
    pub team_id: String,
    pub access_token: String,
    pub bot_granted: bool,
}

/// Room categories recognized by the activity aggregates, parsed from
/// the `slack_type` field of a room's remote payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RoomType {
    Channel,
    Group,
    Im,
    Unknown,
}

impl RoomType {
    pub fn parse(s: &str) -> Self {
        match s {
            "channel" => RoomType::Channel,
            "group" | "mpim" => RoomType::Group,
            "im" => RoomType::Im,
            _ => RoomType::Unknown,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_entry_uppercases_remote_ids() {
        let entry = UserEntry::new("@_slack_u1:example.org", "u012ab", Some("t987xy"));
        assert_eq!(entry.slack_id.as_deref(), Some("U012AB"));
        assert_eq!(entry.team_id.as_deref(), Some("T987XY"));
        assert!(entry.is_remote);
    }

    #[test]
    fn user_entry_mixed_case_remote_ids() {
        let entry = UserEntry::new("@g:example.org", "U012aB", None);
        assert_eq!(entry.slack_id.as_deref(), Some("U012AB"));
        assert_eq!(entry.team_id, None);
    }

    #[test]
    fn team_status_round_trips() {
        for status in [TeamStatus::Ok, TeamStatus::Archived, TeamStatus::BadAuth] {
            assert_eq!(TeamStatus::parse(status.as_str()), status);
        }
    }

    #[test]
    fn room_type_groups_mpim_with_group() {
        assert_eq!(RoomType::parse("mpim"), RoomType::Group);
        assert_eq!(RoomType::parse("channel"), RoomType::Channel);
        assert_eq!(RoomType::parse("whatever"), RoomType::Unknown);
    }
}
