use std::sync::Arc;

use async_trait::async_trait;
use chrono::NaiveDate;
use diesel::connection::SimpleConnection;
use diesel::prelude::*;
use diesel::sqlite::SqliteConnection;
use diesel::upsert::excluded;

use super::datastore::{Datastore, RoomActivity, UserActivity, fold_room_activity, fold_user_activity};
use super::error::DatastoreError;
use super::migrations;
use super::models::{
    EventEntry, MatrixUserEntry, PuppetEntry, RoomEntry, SlackAccount, TeamEntry, UserEntry,
};
use super::rows::{
    AccountRow, ActivityRow, AdminRoomRow, EventRow, PuppetRow, RoomRow, TeamRow, UserRow,
    activity_cutoff, format_date,
};
use super::schema::{accounts, admin_rooms, events, metrics_activities, puppets, rooms, teams, users};

fn establish_connection(path: &str) -> Result<SqliteConnection, DatastoreError> {
    let mut conn = SqliteConnection::establish(path)
        .map_err(|e| DatastoreError::Connection(e.to_string()))?;
    // Webhook handling issues overlapping writes from independent
    // requests; without a busy timeout those surface as SQLITE_BUSY.
    conn.batch_execute("PRAGMA busy_timeout = 5000; PRAGMA foreign_keys = ON;")
        .map_err(DatastoreError::query)?;
    Ok(conn)
}

/// The embedded single-file backend. Every call opens a short-lived
/// connection on the blocking pool, mirroring how the relational
/// backend checks a connection out of its pool.
pub struct SqliteDatastore {
    db_path: Arc<String>,
}

impl SqliteDatastore {
    pub fn new(db_path: impl Into<String>) -> Self {
        Self {
            db_path: Arc::new(db_path.into()),
        }
    }

    async fn with_conn<F, T>(&self, f: F) -> Result<T, DatastoreError>
    where
        F: FnOnce(&mut SqliteConnection) -> Result<T, DatastoreError> + Send + 'static,
        T: Send + 'static,
    {
        let db_path = self.db_path.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = establish_connection(&db_path)?;
            f(&mut conn)
        })
        .await
        .map_err(|e| DatastoreError::Query(format!("database task failed: {e}")))?
    }
}

#[derive(QueryableByName)]
struct VersionRow {
    #[diesel(sql_type = diesel::sql_types::Integer)]
    version: i32,
}

#[derive(QueryableByName)]
struct RoomIdRow {
    #[diesel(sql_type = diesel::sql_types::Text)]
    room_id: String,
}

#[derive(QueryableByName)]
struct UserIdRow {
    #[diesel(sql_type = diesel::sql_types::Text)]
    user_id: String,
}

fn stored_schema_version(conn: &mut SqliteConnection) -> Result<i32, DatastoreError> {
    let rows: Vec<VersionRow> = diesel::sql_query("SELECT version FROM schema_version")
        .load(conn)
        .map_err(DatastoreError::query)?;
    Ok(rows.first().map(|r| r.version).unwrap_or(0))
}

/// Applies the given steps from the stored version upward. Each step
/// runs in one transaction together with the version bump, so a failed
/// step never advances the version.
pub(crate) fn apply_migrations(
    conn: &mut SqliteConnection,
    steps: &[&[&str]],
) -> Result<(), DatastoreError> {
    diesel::sql_query(migrations::VERSION_TABLE)
        .execute(conn)
        .map_err(DatastoreError::query)?;

    let current = stored_schema_version(conn)?;
    for (idx, step) in steps.iter().enumerate() {
        let version = idx as i32 + 1;
        if version <= current {
            continue;
        }
        conn.transaction(|conn| {
            for stmt in *step {
                diesel::sql_query(*stmt).execute(conn)?;
            }
            diesel::sql_query("DELETE FROM schema_version").execute(conn)?;
            diesel::sql_query(format!(
                "INSERT INTO schema_version (version) VALUES ({version})"
            ))
            .execute(conn)?;
            Ok::<_, diesel::result::Error>(())
        })
        .map_err(|e| DatastoreError::Migration {
            version,
            message: e.to_string(),
        })?;
        tracing::info!(version, "applied schema migration");
    }
    Ok(())
}

#[async_trait]
impl Datastore for SqliteDatastore {
    async fn ensure_schema(&self) -> Result<(), DatastoreError> {
        self.with_conn(|conn| apply_migrations(conn, migrations::STEPS))
            .await
    }

    async fn upsert_user(&self, user: &UserEntry) -> Result<(), DatastoreError> {
        let row = UserRow::from_entry(user);
        self.with_conn(move |conn| {
            diesel::insert_into(users::table)
                .values(&row)
                .on_conflict(users::id)
                .do_update()
                .set(&row)
                .execute(conn)
                .map(|_| ())
                .map_err(DatastoreError::query)
        })
        .await
    }

    async fn get_user(&self, id: &str) -> Result<Option<UserEntry>, DatastoreError> {
        let id = id.to_string();
        self.with_conn(move |conn| {
            users::table
                .filter(users::id.eq(id))
                .filter(users::is_remote.eq(true))
                .select(UserRow::as_select())
                .first::<UserRow>(conn)
                .optional()
                .map_err(DatastoreError::query)
                .map(|row| row.map(UserRow::into_entry))
        })
        .await
    }

    async fn get_all_users_for_team(
        &self,
        team_id: &str,
    ) -> Result<Vec<UserEntry>, DatastoreError> {
        let team_id = team_id.to_uppercase();
        self.with_conn(move |conn| {
            let rows = users::table
                .filter(users::team_id.eq(team_id))
                .filter(users::is_remote.eq(true))
                .order(users::id.asc())
                .select(UserRow::as_select())
                .load::<UserRow>(conn)
                .map_err(DatastoreError::query)?;
            Ok(rows.into_iter().map(UserRow::into_entry).collect())
        })
        .await
    }

    async fn store_matrix_user(&self, user: &MatrixUserEntry) -> Result<(), DatastoreError> {
        let row = UserRow::from_matrix_user(user)?;
        self.with_conn(move |conn| {
            diesel::insert_into(users::table)
                .values(&row)
                .on_conflict(users::id)
                .do_update()
                .set(&row)
                .execute(conn)
                .map(|_| ())
                .map_err(DatastoreError::query)
        })
        .await
    }

    async fn get_matrix_user(&self, id: &str) -> Result<Option<MatrixUserEntry>, DatastoreError> {
        let id = id.to_string();
        self.with_conn(move |conn| {
            users::table
                .filter(users::id.eq(id))
                .filter(users::is_remote.eq(false))
                .select(UserRow::as_select())
                .first::<UserRow>(conn)
                .optional()
                .map_err(DatastoreError::query)?
                .map(UserRow::into_matrix_user)
                .transpose()
        })
        .await
    }

    async fn insert_account(&self, account: &SlackAccount) -> Result<(), DatastoreError> {
        let row = AccountRow::from_entry(account);
        self.with_conn(move |conn| {
            diesel::insert_into(accounts::table)
                .values(&row)
                .on_conflict((accounts::matrix_id, accounts::slack_id, accounts::team_id))
                .do_update()
                .set((
                    accounts::access_token.eq(excluded(accounts::access_token)),
                    accounts::bot_granted.eq(excluded(accounts::bot_granted)),
                ))
                .execute(conn)
                .map(|_| ())
                .map_err(DatastoreError::query)
        })
        .await
    }

    async fn get_accounts_for_matrix_user(
        &self,
        matrix_id: &str,
    ) -> Result<Vec<SlackAccount>, DatastoreError> {
        let matrix_id = matrix_id.to_string();
        self.with_conn(move |conn| {
            let rows = accounts::table
                .filter(accounts::matrix_id.eq(matrix_id))
                .order((accounts::team_id.asc(), accounts::slack_id.asc()))
                .select(AccountRow::as_select())
                .load::<AccountRow>(conn)
                .map_err(DatastoreError::query)?;
            Ok(rows.into_iter().map(AccountRow::into_entry).collect())
        })
        .await
    }

    async fn get_accounts_for_team(
        &self,
        team_id: &str,
    ) -> Result<Vec<SlackAccount>, DatastoreError> {
        let team_id = team_id.to_string();
        self.with_conn(move |conn| {
            let rows = accounts::table
                .filter(accounts::team_id.eq(team_id))
                .order((accounts::matrix_id.asc(), accounts::slack_id.asc()))
                .select(AccountRow::as_select())
                .load::<AccountRow>(conn)
                .map_err(DatastoreError::query)?;
            Ok(rows.into_iter().map(AccountRow::into_entry).collect())
        })
        .await
    }

    async fn delete_account(
        &self,
        matrix_id: &str,
        slack_id: &str,
        team_id: &str,
    ) -> Result<(), DatastoreError> {
        let (matrix_id, slack_id, team_id) =
            (matrix_id.to_string(), slack_id.to_string(), team_id.to_string());
        self.with_conn(move |conn| {
            diesel::delete(
                accounts::table
                    .filter(accounts::matrix_id.eq(matrix_id))
                    .filter(accounts::slack_id.eq(slack_id))
                    .filter(accounts::team_id.eq(team_id)),
            )
            .execute(conn)
            .map(|_| ())
            .map_err(DatastoreError::query)
        })
        .await
    }

    async fn upsert_event(&self, event: &EventEntry) -> Result<(), DatastoreError> {
        let row = EventRow::from_entry(event)?;
        self.with_conn(move |conn| {
            // The row is unique on both key pairs, so replace any entry
            // reachable from either side before inserting.
            conn.transaction(|conn| {
                diesel::delete(
                    events::table
                        .filter(events::room_id.eq(&row.room_id))
                        .filter(events::event_id.eq(&row.event_id)),
                )
                .execute(conn)?;
                diesel::delete(
                    events::table
                        .filter(events::slack_channel_id.eq(&row.slack_channel_id))
                        .filter(events::slack_ts.eq(&row.slack_ts)),
                )
                .execute(conn)?;
                diesel::insert_into(events::table).values(&row).execute(conn)?;
                Ok::<_, diesel::result::Error>(())
            })
            .map_err(DatastoreError::query)
        })
        .await
    }

    async fn get_event_by_matrix_id(
        &self,
        room_id: &str,
        event_id: &str,
    ) -> Result<Option<EventEntry>, DatastoreError> {
        let (room_id, event_id) = (room_id.to_string(), event_id.to_string());
        self.with_conn(move |conn| {
            events::table
                .filter(events::room_id.eq(room_id))
                .filter(events::event_id.eq(event_id))
                .select(EventRow::as_select())
                .first::<EventRow>(conn)
                .optional()
                .map_err(DatastoreError::query)?
                .map(EventRow::into_entry)
                .transpose()
        })
        .await
    }

    async fn get_event_by_slack_id(
        &self,
        channel_id: &str,
        ts: &str,
    ) -> Result<Option<EventEntry>, DatastoreError> {
        let (channel_id, ts) = (channel_id.to_string(), ts.to_string());
        self.with_conn(move |conn| {
            events::table
                .filter(events::slack_channel_id.eq(channel_id))
                .filter(events::slack_ts.eq(ts))
                .select(EventRow::as_select())
                .first::<EventRow>(conn)
                .optional()
                .map_err(DatastoreError::query)?
                .map(EventRow::into_entry)
                .transpose()
        })
        .await
    }

    async fn upsert_room(&self, room: &RoomEntry) -> Result<(), DatastoreError> {
        let row = RoomRow::from_entry(room)?;
        self.with_conn(move |conn| {
            diesel::insert_into(rooms::table)
                .values(&row)
                .on_conflict(rooms::id)
                .do_update()
                .set(&row)
                .execute(conn)
                .map(|_| ())
                .map_err(DatastoreError::query)
        })
        .await
    }

    async fn delete_room(&self, id: &str) -> Result<(), DatastoreError> {
        let id = id.to_string();
        self.with_conn(move |conn| {
            diesel::delete(rooms::table.filter(rooms::id.eq(id)))
                .execute(conn)
                .map(|_| ())
                .map_err(DatastoreError::query)
        })
        .await
    }

    async fn get_all_rooms(&self) -> Result<Vec<RoomEntry>, DatastoreError> {
        self.with_conn(move |conn| {
            let rows = rooms::table
                .order(rooms::id.asc())
                .select(RoomRow::as_select())
                .load::<RoomRow>(conn)
                .map_err(DatastoreError::query)?;
            rows.into_iter().map(RoomRow::into_entry).collect()
        })
        .await
    }

    async fn get_room_count(&self) -> Result<i64, DatastoreError> {
        self.with_conn(move |conn| {
            rooms::table
                .count()
                .get_result(conn)
                .map_err(DatastoreError::query)
        })
        .await
    }

    async fn upsert_team(&self, team: &TeamEntry) -> Result<(), DatastoreError> {
        let row = TeamRow::from_entry(team);
        self.with_conn(move |conn| {
            diesel::insert_into(teams::table)
                .values(&row)
                .on_conflict(teams::id)
                .do_update()
                .set(&row)
                .execute(conn)
                .map(|_| ())
                .map_err(DatastoreError::query)
        })
        .await
    }

    async fn get_team(&self, id: &str) -> Result<Option<TeamEntry>, DatastoreError> {
        let id = id.to_string();
        self.with_conn(move |conn| {
            teams::table
                .filter(teams::id.eq(id))
                .select(TeamRow::as_select())
                .first::<TeamRow>(conn)
                .optional()
                .map_err(DatastoreError::query)
                .map(|row| row.map(TeamRow::into_entry))
        })
        .await
    }

    async fn delete_team(&self, id: &str) -> Result<(), DatastoreError> {
        let id = id.to_string();
        self.with_conn(move |conn| {
            diesel::delete(teams::table.filter(teams::id.eq(id)))
                .execute(conn)
                .map(|_| ())
                .map_err(DatastoreError::query)
        })
        .await
    }

    async fn get_all_teams(&self) -> Result<Vec<TeamEntry>, DatastoreError> {
        self.with_conn(move |conn| {
            let rows = teams::table
                .order(teams::id.asc())
                .select(TeamRow::as_select())
                .load::<TeamRow>(conn)
                .map_err(DatastoreError::query)?;
            Ok(rows.into_iter().map(TeamRow::into_entry).collect())
        })
        .await
    }

    async fn set_puppet_token(&self, puppet: &PuppetEntry) -> Result<(), DatastoreError> {
        let row = PuppetRow::from_entry(puppet);
        self.with_conn(move |conn| {
            // One puppet token per (team, slack user) and per
            // (team, matrix user); clear both slots before inserting.
            conn.transaction(|conn| {
                diesel::delete(
                    puppets::table
                        .filter(puppets::team_id.eq(&row.team_id))
                        .filter(puppets::slack_id.eq(&row.slack_id)),
                )
                .execute(conn)?;
                diesel::delete(
                    puppets::table
                        .filter(puppets::team_id.eq(&row.team_id))
                        .filter(puppets::matrix_id.eq(&row.matrix_id)),
                )
                .execute(conn)?;
                diesel::insert_into(puppets::table).values(&row).execute(conn)?;
                Ok::<_, diesel::result::Error>(())
            })
            .map_err(DatastoreError::query)
        })
        .await
    }

    async fn remove_puppet_token_by_matrix_id(
        &self,
        matrix_id: &str,
        team_id: &str,
    ) -> Result<(), DatastoreError> {
        let (matrix_id, team_id) = (matrix_id.to_string(), team_id.to_string());
        self.with_conn(move |conn| {
            diesel::delete(
                puppets::table
                    .filter(puppets::matrix_id.eq(matrix_id))
                    .filter(puppets::team_id.eq(team_id)),
            )
            .execute(conn)
            .map(|_| ())
            .map_err(DatastoreError::query)
        })
        .await
    }

    async fn get_puppet_token_by_slack_id(
        &self,
        team_id: &str,
        slack_id: &str,
    ) -> Result<Option<String>, DatastoreError> {
        let (team_id, slack_id) = (team_id.to_string(), slack_id.to_string());
        self.with_conn(move |conn| {
            puppets::table
                .filter(puppets::team_id.eq(team_id))
                .filter(puppets::slack_id.eq(slack_id))
                .select(puppets::token)
                .first::<String>(conn)
                .optional()
                .map_err(DatastoreError::query)
        })
        .await
    }

    async fn get_puppet_matrix_user_by_slack_id(
        &self,
        team_id: &str,
        slack_id: &str,
    ) -> Result<Option<String>, DatastoreError> {
        let (team_id, slack_id) = (team_id.to_string(), slack_id.to_string());
        self.with_conn(move |conn| {
            puppets::table
                .filter(puppets::team_id.eq(team_id))
                .filter(puppets::slack_id.eq(slack_id))
                .select(puppets::matrix_id)
                .first::<String>(conn)
                .optional()
                .map_err(DatastoreError::query)
        })
        .await
    }

    async fn get_puppet_token_by_matrix_id(
        &self,
        matrix_id: &str,
        team_id: &str,
    ) -> Result<Option<String>, DatastoreError> {
        let (matrix_id, team_id) = (matrix_id.to_string(), team_id.to_string());
        self.with_conn(move |conn| {
            puppets::table
                .filter(puppets::matrix_id.eq(matrix_id))
                .filter(puppets::team_id.eq(team_id))
                .select(puppets::token)
                .first::<String>(conn)
                .optional()
                .map_err(DatastoreError::query)
        })
        .await
    }

    async fn get_puppets_by_matrix_id(
        &self,
        matrix_id: &str,
    ) -> Result<Vec<PuppetEntry>, DatastoreError> {
        let matrix_id = matrix_id.to_string();
        self.with_conn(move |conn| {
            let rows = puppets::table
                .filter(puppets::matrix_id.eq(matrix_id))
                .order(puppets::team_id.asc())
                .select(PuppetRow::as_select())
                .load::<PuppetRow>(conn)
                .map_err(DatastoreError::query)?;
            Ok(rows.into_iter().map(PuppetRow::into_entry).collect())
        })
        .await
    }

    async fn get_puppeted_users(&self) -> Result<Vec<PuppetEntry>, DatastoreError> {
        self.with_conn(move |conn| {
            let rows = puppets::table
                .order((puppets::team_id.asc(), puppets::slack_id.asc()))
                .select(PuppetRow::as_select())
                .load::<PuppetRow>(conn)
                .map_err(DatastoreError::query)?;
            Ok(rows.into_iter().map(PuppetRow::into_entry).collect())
        })
        .await
    }

    async fn set_user_admin_room(
        &self,
        matrix_id: &str,
        room_id: &str,
    ) -> Result<(), DatastoreError> {
        let row = AdminRoomRow {
            room_id: room_id.to_string(),
            matrix_id: matrix_id.to_string(),
        };
        self.with_conn(move |conn| {
            conn.transaction(|conn| {
                diesel::delete(
                    admin_rooms::table.filter(admin_rooms::matrix_id.eq(&row.matrix_id)),
                )
                .execute(conn)?;
                diesel::delete(admin_rooms::table.filter(admin_rooms::room_id.eq(&row.room_id)))
                    .execute(conn)?;
                diesel::insert_into(admin_rooms::table)
                    .values(&row)
                    .execute(conn)?;
                Ok::<_, diesel::result::Error>(())
            })
            .map_err(DatastoreError::query)
        })
        .await
    }

    async fn get_user_admin_room(
        &self,
        matrix_id: &str,
    ) -> Result<Option<String>, DatastoreError> {
        let matrix_id = matrix_id.to_string();
        self.with_conn(move |conn| {
            admin_rooms::table
                .filter(admin_rooms::matrix_id.eq(matrix_id))
                .select(admin_rooms::room_id)
                .first::<String>(conn)
                .optional()
                .map_err(DatastoreError::query)
        })
        .await
    }

    async fn get_user_for_admin_room(
        &self,
        room_id: &str,
    ) -> Result<Option<String>, DatastoreError> {
        let room_id = room_id.to_string();
        self.with_conn(move |conn| {
            admin_rooms::table
                .filter(admin_rooms::room_id.eq(room_id))
                .select(admin_rooms::matrix_id)
                .first::<String>(conn)
                .optional()
                .map_err(DatastoreError::query)
        })
        .await
    }

    async fn upsert_activity_metrics(
        &self,
        user_id: &str,
        room_id: &str,
        date: NaiveDate,
    ) -> Result<(), DatastoreError> {
        let row = ActivityRow {
            user_id: user_id.to_string(),
            room_id: room_id.to_string(),
            date: format_date(date),
        };
        self.with_conn(move |conn| {
            diesel::insert_into(metrics_activities::table)
                .values(&row)
                .on_conflict_do_nothing()
                .execute(conn)
                .map(|_| ())
                .map_err(DatastoreError::query)
        })
        .await
    }

    async fn get_active_rooms_per_team(
        &self,
        activity_threshold_days: u32,
        history_window_days: u32,
    ) -> Result<RoomActivity, DatastoreError> {
        let cutoff = format_date(activity_cutoff(history_window_days));
        self.with_conn(move |conn| {
            let active: Vec<RoomIdRow> = diesel::sql_query(
                "SELECT room_id FROM metrics_activities WHERE date >= ? \
                 GROUP BY room_id HAVING COUNT(DISTINCT date) >= ?",
            )
            .bind::<diesel::sql_types::Text, _>(&cutoff)
            .bind::<diesel::sql_types::BigInt, _>(activity_threshold_days as i64)
            .load(conn)
            .map_err(DatastoreError::query)?;

            let rooms: Vec<RoomEntry> = rooms::table
                .select(RoomRow::as_select())
                .load::<RoomRow>(conn)
                .map_err(DatastoreError::query)?
                .into_iter()
                .map(RoomRow::into_entry)
                .collect::<Result<_, _>>()?;

            let active_ids: Vec<String> = active.into_iter().map(|r| r.room_id).collect();
            Ok(fold_room_activity(&rooms, &active_ids))
        })
        .await
    }

    async fn get_active_users_per_team(
        &self,
        activity_threshold_days: u32,
        history_window_days: u32,
    ) -> Result<UserActivity, DatastoreError> {
        let cutoff = format_date(activity_cutoff(history_window_days));
        self.with_conn(move |conn| {
            let active: Vec<UserIdRow> = diesel::sql_query(
                "SELECT user_id FROM metrics_activities WHERE date >= ? \
                 GROUP BY user_id HAVING COUNT(DISTINCT date) >= ?",
            )
            .bind::<diesel::sql_types::Text, _>(&cutoff)
            .bind::<diesel::sql_types::BigInt, _>(activity_threshold_days as i64)
            .load(conn)
            .map_err(DatastoreError::query)?;

            let active_ids: Vec<String> = active.into_iter().map(|r| r.user_id).collect();
            let entries = users::table
                .filter(users::id.eq_any(&active_ids))
                .select(UserRow::as_select())
                .load::<UserRow>(conn)
                .map_err(DatastoreError::query)?
                .into_iter()
                .map(UserRow::into_entry)
                .collect::<Vec<_>>();

            Ok(fold_user_activity(&entries, &active_ids))
        })
        .await
    }
}
