use std::collections::HashMap;

use async_trait::async_trait;
use chrono::NaiveDate;
use serde_json::Value;

use super::DatastoreError;
use super::models::{
    EventEntry, MatrixUserEntry, PuppetEntry, RoomEntry, RoomType, SlackAccount, TeamEntry,
    UserEntry,
};

/// Per-team activity aggregates. Rooms are grouped by [`RoomType`],
/// users by their remote/ghost flag.
pub type RoomActivity = HashMap<String, HashMap<RoomType, u64>>;
pub type UserActivity = HashMap<String, HashMap<bool, u64>>;

/// The storage contract every backend must satisfy identically. All
/// methods are safe to call concurrently; lookups return `Ok(None)`
/// rather than an error when nothing matches.
#[async_trait]
pub trait Datastore: Send + Sync {
    /// Applies forward-only numbered migrations up to the latest known
    /// schema version. A failed step leaves the stored version
    /// untouched and must abort startup.
    async fn ensure_schema(&self) -> Result<(), DatastoreError>;

    async fn upsert_user(&self, user: &UserEntry) -> Result<(), DatastoreError>;
    async fn get_user(&self, id: &str) -> Result<Option<UserEntry>, DatastoreError>;
    async fn get_all_users_for_team(
        &self,
        team_id: &str,
    ) -> Result<Vec<UserEntry>, DatastoreError>;

    async fn store_matrix_user(&self, user: &MatrixUserEntry) -> Result<(), DatastoreError>;
    async fn get_matrix_user(&self, id: &str) -> Result<Option<MatrixUserEntry>, DatastoreError>;

    async fn insert_account(&self, account: &SlackAccount) -> Result<(), DatastoreError>;
    async fn get_accounts_for_matrix_user(
        &self,
        matrix_id: &str,
    ) -> Result<Vec<SlackAccount>, DatastoreError>;
    async fn get_accounts_for_team(
        &self,
        team_id: &str,
    ) -> Result<Vec<SlackAccount>, DatastoreError>;
    async fn delete_account(
        &self,
        matrix_id: &str,
        slack_id: &str,
        team_id: &str,
    ) -> Result<(), DatastoreError>;

    async fn upsert_event(&self, event: &EventEntry) -> Result<(), DatastoreError>;
    async fn get_event_by_matrix_id(
        &self,
        room_id: &str,
        event_id: &str,
    ) -> Result<Option<EventEntry>, DatastoreError>;
    async fn get_event_by_slack_id(
        &self,
        channel_id: &str,
        ts: &str,
    ) -> Result<Option<EventEntry>, DatastoreError>;

    async fn upsert_room(&self, room: &RoomEntry) -> Result<(), DatastoreError>;
    async fn delete_room(&self, id: &str) -> Result<(), DatastoreError>;
    async fn get_all_rooms(&self) -> Result<Vec<RoomEntry>, DatastoreError>;
    async fn get_room_count(&self) -> Result<i64, DatastoreError>;

    async fn upsert_team(&self, team: &TeamEntry) -> Result<(), DatastoreError>;
    async fn get_team(&self, id: &str) -> Result<Option<TeamEntry>, DatastoreError>;
    async fn delete_team(&self, id: &str) -> Result<(), DatastoreError>;
    async fn get_all_teams(&self) -> Result<Vec<TeamEntry>, DatastoreError>;

    async fn set_puppet_token(&self, puppet: &PuppetEntry) -> Result<(), DatastoreError>;
    async fn remove_puppet_token_by_matrix_id(
        &self,
        matrix_id: &str,
        team_id: &str,
    ) -> Result<(), DatastoreError>;
    async fn get_puppet_token_by_slack_id(
        &self,
        team_id: &str,
        slack_id: &str,
    ) -> Result<Option<String>, DatastoreError>;
    async fn get_puppet_matrix_user_by_slack_id(
        &self,
        team_id: &str,
        slack_id: &str,
    ) -> Result<Option<String>, DatastoreError>;
    async fn get_puppet_token_by_matrix_id(
        &self,
        matrix_id: &str,
        team_id: &str,
    ) -> Result<Option<String>, DatastoreError>;
    async fn get_puppets_by_matrix_id(
        &self,
        matrix_id: &str,
    ) -> Result<Vec<PuppetEntry>, DatastoreError>;
    async fn get_puppeted_users(&self) -> Result<Vec<PuppetEntry>, DatastoreError>;

    async fn set_user_admin_room(
        &self,
        matrix_id: &str,
        room_id: &str,
    ) -> Result<(), DatastoreError>;
    async fn get_user_admin_room(
        &self,
        matrix_id: &str,
    ) -> Result<Option<String>, DatastoreError>;
    async fn get_user_for_admin_room(
        &self,
        room_id: &str,
    ) -> Result<Option<String>, DatastoreError>;

    /// Records a (user, room, day) activity fact. Inserting the same
    /// fact twice is a no-op, not an update.
    async fn upsert_activity_metrics(
        &self,
        user_id: &str,
        room_id: &str,
        date: NaiveDate,
    ) -> Result<(), DatastoreError>;
    async fn get_active_rooms_per_team(
        &self,
        activity_threshold_days: u32,
        history_window_days: u32,
    ) -> Result<RoomActivity, DatastoreError>;
    async fn get_active_users_per_team(
        &self,
        activity_threshold_days: u32,
        history_window_days: u32,
    ) -> Result<UserActivity, DatastoreError>;
}

/// Positional-field form of [`Datastore::upsert_event`]. Both forms
/// normalize to the same persisted row.
pub async fn upsert_event_parts(
    store: &dyn Datastore,
    room_id: &str,
    event_id: &str,
    channel_id: &str,
    ts: &str,
    extras: Option<Value>,
) -> Result<(), DatastoreError> {
    let mut entry = EventEntry::new(room_id, event_id, channel_id, ts);
    entry.extras = extras;
    store.upsert_event(&entry).await
}

/// Groups rooms that met the activity threshold by owning team and
/// room type. Both fields live in the room's `remote` payload, the one
/// place the storage layer reads it.
pub(crate) fn fold_room_activity(rooms: &[RoomEntry], active_room_ids: &[String]) -> RoomActivity {
    let mut result = RoomActivity::new();
    for room_id in active_room_ids {
        let Some(room) = rooms.iter().find(|r| &r.id == room_id) else {
            continue;
        };
        let team = room
            .remote
            .get("slack_team_id")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_owned();
        let kind = RoomType::parse(
            room.remote
                .get("slack_type")
                .and_then(|v| v.as_str())
                .unwrap_or_default(),
        );
        *result.entry(team).or_default().entry(kind).or_insert(0) += 1;
    }
    result
}

/// Groups users that met the activity threshold by team and by the
/// remote/ghost kind flag. Users without a stored entry are skipped.
pub(crate) fn fold_user_activity(users: &[UserEntry], active_user_ids: &[String]) -> UserActivity {
    let mut result = UserActivity::new();
    for user_id in active_user_ids {
        let Some(user) = users.iter().find(|u| &u.id == user_id) else {
            continue;
        };
        let team = user.team_id.clone().unwrap_or_default();
        *result
            .entry(team)
            .or_default()
            .entry(user.is_remote)
            .or_insert(0) += 1;
    }
    result
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn fold_room_activity_groups_by_team_and_type() {
        let rooms = vec![
            RoomEntry {
                id: "r1".into(),
                matrix_id: "!a:hs".into(),
                remote_id: "C1".into(),
                remote: json!({"slack_team_id": "T1", "slack_type": "channel"}),
            },
            RoomEntry {
                id: "r2".into(),
                matrix_id: "!b:hs".into(),
                remote_id: "C2".into(),
                remote: json!({"slack_team_id": "T1", "slack_type": "im"}),
            },
            RoomEntry {
                id: "r3".into(),
                matrix_id: "!c:hs".into(),
                remote_id: "C3".into(),
                remote: json!({"slack_team_id": "T2", "slack_type": "channel"}),
            },
        ];
        let active = vec!["r1".to_string(), "r2".to_string(), "r3".to_string()];
        let folded = fold_room_activity(&rooms, &active);
        assert_eq!(folded["T1"][&RoomType::Channel], 1);
        assert_eq!(folded["T1"][&RoomType::Im], 1);
        assert_eq!(folded["T2"][&RoomType::Channel], 1);
    }

    #[test]
    fn fold_user_activity_skips_unknown_users() {
        let users = vec![UserEntry::new("@g:hs", "U1", Some("T1"))];
        let active = vec!["@g:hs".to_string(), "@missing:hs".to_string()];
        let folded = fold_user_activity(&users, &active);
        assert_eq!(folded["T1"][&true], 1);
        assert_eq!(folded.len(), 1);
    }
}
