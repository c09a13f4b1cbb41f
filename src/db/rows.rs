//! Diesel row types shared by the sqlite and postgres backends, plus
//! the conversions between persisted rows and the public models.

use chrono::NaiveDate;
use diesel::prelude::*;

use super::DatastoreError;
use super::models::{
    EventEntry, MatrixUserEntry, PuppetEntry, RoomEntry, SlackAccount, TeamEntry, TeamStatus,
    UserEntry,
};
use super::schema::{accounts, admin_rooms, events, metrics_activities, puppets, rooms, teams, users};

pub const DATE_FORMAT: &str = "%Y-%m-%d";

#[derive(Debug, Clone, Queryable, Selectable, Insertable, AsChangeset)]
#[diesel(table_name = users)]
#[diesel(treat_none_as_null = true)]
pub struct UserRow {
    pub id: String,
    pub slack_id: Option<String>,
    pub team_id: Option<String>,
    pub display_name: Option<String>,
    pub avatar_url: Option<String>,
    pub is_remote: bool,
    pub json: Option<String>,
}

impl UserRow {
    pub fn from_entry(entry: &UserEntry) -> Self {
        Self {
            id: entry.id.clone(),
            slack_id: entry.slack_id.as_deref().map(str::to_uppercase),
            team_id: entry.team_id.as_deref().map(str::to_uppercase),
            display_name: entry.display_name.clone(),
            avatar_url: entry.avatar_url.clone(),
            is_remote: entry.is_remote,
            json: None,
        }
    }

    pub fn from_matrix_user(user: &MatrixUserEntry) -> Result<Self, DatastoreError> {
        let json = serde_json::to_string(&user.data)
            .map_err(|e| DatastoreError::Serialization(e.to_string()))?;
        Ok(Self {
            id: user.id.clone(),
            slack_id: None,
            team_id: None,
            display_name: None,
            avatar_url: None,
            is_remote: false,
            json: Some(json),
        })
    }

    pub fn into_entry(self) -> UserEntry {
        UserEntry {
            id: self.id,
            slack_id: self.slack_id,
            team_id: self.team_id,
            display_name: self.display_name,
            avatar_url: self.avatar_url,
            is_remote: self.is_remote,
        }
    }

    pub fn into_matrix_user(self) -> Result<MatrixUserEntry, DatastoreError> {
        let data = match self.json {
            Some(raw) => serde_json::from_str(&raw)
                .map_err(|e| DatastoreError::Serialization(e.to_string()))?,
            None => serde_json::Value::Null,
        };
        Ok(MatrixUserEntry { id: self.id, data })
    }
}

#[derive(Debug, Clone, Queryable, Selectable, Insertable)]
#[diesel(table_name = events)]
pub struct EventRow {
    pub room_id: String,
    pub event_id: String,
    pub slack_channel_id: String,
    pub slack_ts: String,
    pub extras: Option<String>,
}

impl EventRow {
    pub fn from_entry(entry: &EventEntry) -> Result<Self, DatastoreError> {
        let extras = entry
            .extras
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(|e| DatastoreError::Serialization(e.to_string()))?;
        Ok(Self {
            room_id: entry.room_id.clone(),
            event_id: entry.event_id.clone(),
            slack_channel_id: entry.slack_channel_id.clone(),
            slack_ts: entry.slack_ts.clone(),
            extras,
        })
    }

    pub fn into_entry(self) -> Result<EventEntry, DatastoreError> {
        let extras = self
            .extras
            .as_deref()
            .map(serde_json::from_str)
            .transpose()
            .map_err(|e| DatastoreError::Serialization(e.to_string()))?;
        Ok(EventEntry {
            room_id: self.room_id,
            event_id: self.event_id,
            slack_channel_id: self.slack_channel_id,
            slack_ts: self.slack_ts,
            extras,
        })
    }
}

#[derive(Debug, Clone, Queryable, Selectable, Insertable, AsChangeset)]
#[diesel(table_name = rooms)]
pub struct RoomRow {
    pub id: String,
    pub matrix_id: String,
    pub remote_id: String,
    pub remote: String,
}

impl RoomRow {
    pub fn from_entry(entry: &RoomEntry) -> Result<Self, DatastoreError> {
        let remote = serde_json::to_string(&entry.remote)
            .map_err(|e| DatastoreError::Serialization(e.to_string()))?;
        Ok(Self {
            id: entry.id.clone(),
            matrix_id: entry.matrix_id.clone(),
            remote_id: entry.remote_id.clone(),
            remote,
        })
    }

    pub fn into_entry(self) -> Result<RoomEntry, DatastoreError> {
        let remote = serde_json::from_str(&self.remote)
            .map_err(|e| DatastoreError::Serialization(e.to_string()))?;
        Ok(RoomEntry {
            id: self.id,
            matrix_id: self.matrix_id,
            remote_id: self.remote_id,
            remote,
        })
    }
}

#[derive(Debug, Clone, Queryable, Selectable, Insertable, AsChangeset)]
#[diesel(table_name = teams)]
pub struct TeamRow {
    pub id: String,
    pub name: String,
    pub bot_token: String,
    pub bot_id: String,
    pub domain: String,
    pub scopes: String,
    pub status: String,
    pub user_id: String,
}

impl TeamRow {
    pub fn from_entry(entry: &TeamEntry) -> Self {
        Self {
            id: entry.id.clone(),
            name: entry.name.clone(),
            bot_token: entry.bot_token.clone(),
            bot_id: entry.bot_id.clone(),
            domain: entry.domain.clone(),
            scopes: entry.scopes.clone(),
            status: entry.status.as_str().to_owned(),
            user_id: entry.user_id.clone(),
        }
    }

    pub fn into_entry(self) -> TeamEntry {
        TeamEntry {
            id: self.id,
            name: self.name,
            bot_token: self.bot_token,
            bot_id: self.bot_id,
            domain: self.domain,
            scopes: self.scopes,
            status: TeamStatus::parse(&self.status),
            user_id: self.user_id,
        }
    }
}

#[derive(Debug, Clone, Queryable, Selectable, Insertable)]
#[diesel(table_name = accounts)]
pub struct AccountRow {
    pub matrix_id: String,
    pub slack_id: String,
    pub team_id: String,
    pub access_token: String,
    pub bot_granted: bool,
}

impl AccountRow {
    pub fn from_entry(entry: &SlackAccount) -> Self {
        Self {
            matrix_id: entry.matrix_id.clone(),
            slack_id: entry.slack_id.clone(),
            team_id: entry.team_id.clone(),
            access_token: entry.access_token.clone(),
            bot_granted: entry.bot_granted,
        }
    }

    pub fn into_entry(self) -> SlackAccount {
        SlackAccount {
            matrix_id: self.matrix_id,
            slack_id: self.slack_id,
            team_id: self.team_id,
            access_token: self.access_token,
            bot_granted: self.bot_granted,
        }
    }
}

#[derive(Debug, Clone, Queryable, Selectable, Insertable)]
#[diesel(table_name = puppets)]
pub struct PuppetRow {
    pub matrix_id: String,
    pub team_id: String,
    pub slack_id: String,
    pub token: String,
}

impl PuppetRow {
    pub fn from_entry(entry: &PuppetEntry) -> Self {
        Self {
            matrix_id: entry.matrix_id.clone(),
            team_id: entry.team_id.clone(),
            slack_id: entry.slack_id.clone(),
            token: entry.token.clone(),
        }
    }

    pub fn into_entry(self) -> PuppetEntry {
        PuppetEntry {
            matrix_id: self.matrix_id,
            team_id: self.team_id,
            slack_id: self.slack_id,
            token: self.token,
        }
    }
}

#[derive(Debug, Clone, Queryable, Selectable, Insertable)]
#[diesel(table_name = admin_rooms)]
pub struct AdminRoomRow {
    pub room_id: String,
    pub matrix_id: String,
}

#[derive(Debug, Clone, Queryable, Selectable, Insertable)]
#[diesel(table_name = metrics_activities)]
pub struct ActivityRow {
    pub user_id: String,
    pub room_id: String,
    pub date: String,
}

pub fn format_date(date: NaiveDate) -> String {
    date.format(DATE_FORMAT).to_string()
}

/// First day still inside the history window, inclusive.
pub fn activity_cutoff(history_window_days: u32) -> NaiveDate {
    chrono::Utc::now().date_naive() - chrono::Days::new(history_window_days as u64)
}
