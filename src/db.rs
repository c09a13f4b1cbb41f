pub use self::datastore::{Datastore, RoomActivity, UserActivity, upsert_event_parts};
pub use self::error::DatastoreError;
pub use self::models::{
    EventEntry, MatrixUserEntry, PuppetEntry, RoomEntry, RoomType, SlackAccount, TeamEntry,
    TeamStatus, UserEntry,
};

pub mod datastore;
pub mod error;
pub mod migrations;
pub mod models;
pub mod rows;
pub mod schema;

#[cfg(feature = "postgres")]
pub mod postgres;

#[cfg(feature = "sqlite")]
pub mod sqlite;

use std::sync::Arc;

use crate::config::{DatabaseConfig, DbEngine};

/// Opens the backend selected by configuration. The caller is expected
/// to run [`Datastore::ensure_schema`] before serving traffic.
pub fn connect(config: &DatabaseConfig) -> Result<Arc<dyn Datastore>, DatastoreError> {
    match config.engine {
        #[cfg(feature = "sqlite")]
        DbEngine::Sqlite => Ok(Arc::new(sqlite::SqliteDatastore::new(
            config.connection_string.clone(),
        ))),
        #[cfg(feature = "postgres")]
        DbEngine::Postgres => Ok(Arc::new(postgres::PostgresDatastore::new(
            &config.connection_string,
            config.max_connections,
        )?)),
        #[cfg(not(feature = "sqlite"))]
        DbEngine::Sqlite => Err(DatastoreError::Connection(
            "sqlite feature not enabled".to_string(),
        )),
        #[cfg(not(feature = "postgres"))]
        DbEngine::Postgres => Err(DatastoreError::Connection(
            "postgres feature not enabled".to_string(),
        )),
    }
}

/// The shared backend conformance suite. Both backends must pass every
/// check with identical results; this is the storage contract's core
/// correctness guarantee.
#[cfg(test)]
pub(crate) mod conformance {
    use std::sync::Arc;

    use chrono::{Days, Utc};
    use serde_json::json;

    use super::*;

    pub async fn run_all(store: Arc<dyn Datastore>) {
        store.ensure_schema().await.expect("schema");
        users(&*store).await;
        matrix_users(&*store).await;
        accounts(&*store).await;
        events(&*store).await;
        rooms(&*store).await;
        teams(&*store).await;
        puppets(&*store).await;
        admin_rooms(&*store).await;
        activity(&*store).await;
    }

    async fn users(store: &dyn Datastore) {
        // Construction normalizes remote ids to uppercase.
        let user = UserEntry::new("@_slack_u1:hs", "u111aa", Some("t111aa"));
        store.upsert_user(&user).await.unwrap();
        let loaded = store.get_user("@_slack_u1:hs").await.unwrap().unwrap();
        assert_eq!(loaded.slack_id.as_deref(), Some("U111AA"));
        assert_eq!(loaded.team_id.as_deref(), Some("T111AA"));

        // Upsert replaces, never appends.
        let mut renamed = user.clone();
        renamed.display_name = Some("alice".into());
        store.upsert_user(&renamed).await.unwrap();
        let mut renamed_again = user.clone();
        renamed_again.display_name = Some("alice2".into());
        store.upsert_user(&renamed_again).await.unwrap();
        let loaded = store.get_user("@_slack_u1:hs").await.unwrap().unwrap();
        assert_eq!(loaded.display_name.as_deref(), Some("alice2"));

        assert!(store.get_user("@_slack_missing:hs").await.unwrap().is_none());

        let other = UserEntry::new("@_slack_u2:hs", "U222BB", Some("T111AA"));
        store.upsert_user(&other).await.unwrap();
        let team = store.get_all_users_for_team("t111aa").await.unwrap();
        assert_eq!(team.len(), 2);
    }

    async fn matrix_users(store: &dyn Datastore) {
        let user = MatrixUserEntry {
            id: "@alice:hs".into(),
            data: json!({"access_token_linked": true}),
        };
        store.store_matrix_user(&user).await.unwrap();
        let loaded = store.get_matrix_user("@alice:hs").await.unwrap().unwrap();
        assert_eq!(loaded, user);

        // The kind flag keeps ghost and plain-user lookups apart even
        // though they share a table.
        assert!(store.get_user("@alice:hs").await.unwrap().is_none());
    }

    async fn accounts(store: &dyn Datastore) {
        let account = SlackAccount {
            matrix_id: "@alice:hs".into(),
            slack_id: "U1".into(),
            team_id: "T1".into(),
            access_token: "xoxp-first".into(),
            bot_granted: false,
        };
        store.insert_account(&account).await.unwrap();

        // Conflicting insert refreshes the credential fields in place.
        let refreshed = SlackAccount {
            access_token: "xoxp-second".into(),
            bot_granted: true,
            ..account.clone()
        };
        store.insert_account(&refreshed).await.unwrap();
        let for_user = store.get_accounts_for_matrix_user("@alice:hs").await.unwrap();
        assert_eq!(for_user.len(), 1);
        assert_eq!(for_user[0].access_token, "xoxp-second");
        assert!(for_user[0].bot_granted);

        let for_team = store.get_accounts_for_team("T1").await.unwrap();
        assert_eq!(for_team.len(), 1);

        store.delete_account("@alice:hs", "U1", "T1").await.unwrap();
        assert!(store
            .get_accounts_for_matrix_user("@alice:hs")
            .await
            .unwrap()
            .is_empty());
    }

    async fn events(store: &dyn Datastore) {
        let entry = EventEntry::new("!room:hs", "$event1", "CHAN1", "1234567890.000100")
            .with_extras(json!({"slack_file_id": "F1"}));
        store.upsert_event(&entry).await.unwrap();

        let by_matrix = store
            .get_event_by_matrix_id("!room:hs", "$event1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(by_matrix, entry);

        let by_slack = store
            .get_event_by_slack_id("CHAN1", "1234567890.000100")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(by_slack, entry);

        // The positional form normalizes to the same row shape.
        upsert_event_parts(store, "!room:hs", "$event2", "CHAN1", "1234567890.000200", None)
            .await
            .unwrap();
        let by_slack = store
            .get_event_by_slack_id("CHAN1", "1234567890.000200")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(by_slack.event_id, "$event2");
        assert_eq!(by_slack.extras, None);

        // Re-upserting the same matrix key with a new slack ts replaces
        // the row reachable from either side.
        let moved = EventEntry::new("!room:hs", "$event1", "CHAN1", "1234567890.000300");
        store.upsert_event(&moved).await.unwrap();
        assert!(store
            .get_event_by_slack_id("CHAN1", "1234567890.000100")
            .await
            .unwrap()
            .is_none());
        let by_matrix = store
            .get_event_by_matrix_id("!room:hs", "$event1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(by_matrix.slack_ts, "1234567890.000300");
    }

    async fn rooms(store: &dyn Datastore) {
        let room = RoomEntry {
            id: "inboundid_aaaaaaaaaaaaaaaaaaaaaaaa".into(),
            matrix_id: "!bridged:hs".into(),
            remote_id: "CHAN1".into(),
            remote: json!({"slack_team_id": "T1", "slack_type": "channel", "name": "general"}),
        };
        store.upsert_room(&room).await.unwrap();
        assert_eq!(store.get_room_count().await.unwrap(), 1);

        let mut renamed = room.clone();
        renamed.remote["name"] = json!("general-renamed");
        store.upsert_room(&renamed).await.unwrap();
        let all = store.get_all_rooms().await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].remote["name"], json!("general-renamed"));

        store.delete_room(&room.id).await.unwrap();
        assert_eq!(store.get_room_count().await.unwrap(), 0);
    }

    async fn teams(store: &dyn Datastore) {
        let team = TeamEntry {
            id: "T900".into(),
            name: "acme".into(),
            bot_token: "xoxb-1".into(),
            bot_id: "B1".into(),
            domain: "acme.slack.com".into(),
            scopes: "bot".into(),
            status: TeamStatus::Ok,
            user_id: "U900".into(),
        };
        store.upsert_team(&team).await.unwrap();
        let loaded = store.get_team("T900").await.unwrap().unwrap();
        assert_eq!(loaded, team);

        let mut archived = team.clone();
        archived.status = TeamStatus::Archived;
        store.upsert_team(&archived).await.unwrap();
        let loaded = store.get_team("T900").await.unwrap().unwrap();
        assert_eq!(loaded.status, TeamStatus::Archived);

        assert_eq!(store.get_all_teams().await.unwrap().len(), 1);
        store.delete_team("T900").await.unwrap();
        assert!(store.get_team("T900").await.unwrap().is_none());
    }

    async fn puppets(store: &dyn Datastore) {
        let puppet = PuppetEntry {
            matrix_id: "@bob:hs".into(),
            team_id: "T1".into(),
            slack_id: "U7".into(),
            token: "xoxp-puppet".into(),
        };
        store.set_puppet_token(&puppet).await.unwrap();

        assert_eq!(
            store.get_puppet_token_by_slack_id("T1", "U7").await.unwrap(),
            Some("xoxp-puppet".to_string())
        );
        assert_eq!(
            store
                .get_puppet_matrix_user_by_slack_id("T1", "U7")
                .await
                .unwrap(),
            Some("@bob:hs".to_string())
        );
        assert_eq!(
            store
                .get_puppet_token_by_matrix_id("@bob:hs", "T1")
                .await
                .unwrap(),
            Some("xoxp-puppet".to_string())
        );

        // At most one puppet per (team, matrix user): relinking the
        // same matrix user to a new slack id replaces the old row.
        let relinked = PuppetEntry {
            slack_id: "U8".into(),
            token: "xoxp-puppet2".into(),
            ..puppet.clone()
        };
        store.set_puppet_token(&relinked).await.unwrap();
        assert!(store
            .get_puppet_token_by_slack_id("T1", "U7")
            .await
            .unwrap()
            .is_none());
        assert_eq!(store.get_puppets_by_matrix_id("@bob:hs").await.unwrap().len(), 1);
        assert_eq!(store.get_puppeted_users().await.unwrap().len(), 1);

        store
            .remove_puppet_token_by_matrix_id("@bob:hs", "T1")
            .await
            .unwrap();
        assert!(store.get_puppeted_users().await.unwrap().is_empty());
    }

    async fn admin_rooms(store: &dyn Datastore) {
        store
            .set_user_admin_room("@carol:hs", "!admin1:hs")
            .await
            .unwrap();
        assert_eq!(
            store.get_user_admin_room("@carol:hs").await.unwrap(),
            Some("!admin1:hs".to_string())
        );
        assert_eq!(
            store.get_user_for_admin_room("!admin1:hs").await.unwrap(),
            Some("@carol:hs".to_string())
        );

        // One-to-one: moving the user to a new control room drops the
        // old binding entirely.
        store
            .set_user_admin_room("@carol:hs", "!admin2:hs")
            .await
            .unwrap();
        assert!(store
            .get_user_for_admin_room("!admin1:hs")
            .await
            .unwrap()
            .is_none());
    }

    async fn activity(store: &dyn Datastore) {
        let today = Utc::now().date_naive();

        let busy_room = RoomEntry {
            id: "room_busy".into(),
            matrix_id: "!busy:hs".into(),
            remote_id: "CBUSY".into(),
            remote: json!({"slack_team_id": "TACT", "slack_type": "channel"}),
        };
        let quiet_room = RoomEntry {
            id: "room_quiet".into(),
            matrix_id: "!quiet:hs".into(),
            remote_id: "CQUIET".into(),
            remote: json!({"slack_team_id": "TQUIET", "slack_type": "channel"}),
        };
        store.upsert_room(&busy_room).await.unwrap();
        store.upsert_room(&quiet_room).await.unwrap();

        let ghost = UserEntry::new("@_slack_act:hs", "UACT", Some("TACT"));
        store.upsert_user(&ghost).await.unwrap();

        for days_ago in 1..=3u64 {
            let date = today - Days::new(days_ago);
            store
                .upsert_activity_metrics("@_slack_act:hs", "room_busy", date)
                .await
                .unwrap();
            // Same-day duplicates are no-ops, not extra activity.
            store
                .upsert_activity_metrics("@_slack_act:hs", "room_busy", date)
                .await
                .unwrap();
        }
        store
            .upsert_activity_metrics("@_slack_act:hs", "room_quiet", today - Days::new(1))
            .await
            .unwrap();

        let rooms = store.get_active_rooms_per_team(2, 30).await.unwrap();
        assert_eq!(rooms["TACT"][&RoomType::Channel], 1);
        assert!(!rooms.contains_key("TQUIET"));

        let users = store.get_active_users_per_team(2, 30).await.unwrap();
        assert_eq!(users["TACT"][&true], 1);

        // A window too short to cover the facts yields nothing.
        let rooms = store.get_active_rooms_per_team(4, 30).await.unwrap();
        assert!(rooms.is_empty());
    }
}
