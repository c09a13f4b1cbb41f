//! Forward-only numbered schema migrations, shared by both backends.
//!
//! Every statement sticks to the SQL subset sqlite and postgres agree
//! on (TEXT/BOOLEAN columns, natural primary keys, no serial types),
//! which is what makes the two backends answer queries identically.

/// The schema version a fully migrated database reports.
pub const LATEST_SCHEMA: i32 = 4;

/// One entry per version, applied sequentially. Step `STEPS[n]`
/// migrates a version-`n` database to version `n + 1`.
pub const STEPS: &[&[&str]] = &[
    // v0 -> v1: core identity/room/event mappings
    &[
        "CREATE TABLE users (
            id TEXT PRIMARY KEY,
            slack_id TEXT,
            team_id TEXT,
            display_name TEXT,
            avatar_url TEXT,
            is_remote BOOLEAN NOT NULL DEFAULT FALSE,
            json TEXT
        )",
        "CREATE INDEX idx_users_slack_id ON users(slack_id, team_id)",
        "CREATE TABLE rooms (
            id TEXT PRIMARY KEY,
            matrix_id TEXT NOT NULL,
            remote_id TEXT NOT NULL,
            remote TEXT NOT NULL
        )",
        "CREATE TABLE events (
            room_id TEXT NOT NULL,
            event_id TEXT NOT NULL,
            slack_channel_id TEXT NOT NULL,
            slack_ts TEXT NOT NULL,
            extras TEXT,
            PRIMARY KEY (room_id, event_id)
        )",
        "CREATE UNIQUE INDEX idx_events_slack ON events(slack_channel_id, slack_ts)",
    ],
    // v1 -> v2: oauth state (teams, linked accounts, puppets) and
    // per-user admin rooms
    &[
        "CREATE TABLE teams (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            bot_token TEXT NOT NULL,
            bot_id TEXT NOT NULL,
            domain TEXT NOT NULL,
            scopes TEXT NOT NULL,
            status TEXT NOT NULL,
            user_id TEXT NOT NULL
        )",
        "CREATE TABLE accounts (
            matrix_id TEXT NOT NULL,
            slack_id TEXT NOT NULL,
            team_id TEXT NOT NULL,
            access_token TEXT NOT NULL,
            PRIMARY KEY (matrix_id, slack_id, team_id)
        )",
        "CREATE TABLE puppets (
            matrix_id TEXT NOT NULL,
            team_id TEXT NOT NULL,
            slack_id TEXT NOT NULL,
            token TEXT NOT NULL,
            PRIMARY KEY (team_id, slack_id)
        )",
        "CREATE UNIQUE INDEX idx_puppets_matrix ON puppets(team_id, matrix_id)",
        "CREATE TABLE admin_rooms (
            room_id TEXT PRIMARY KEY,
            matrix_id TEXT NOT NULL UNIQUE
        )",
    ],
    // v2 -> v3: activity facts (a set of (user, room, day) rows)
    &[
        "CREATE TABLE metrics_activities (
            user_id TEXT NOT NULL,
            room_id TEXT NOT NULL,
            date TEXT NOT NULL,
            PRIMARY KEY (user_id, room_id, date)
        )",
        "CREATE INDEX idx_metrics_activities_date ON metrics_activities(date)",
    ],
    // v3 -> v4: record whether a linked account's grant also carried
    // a bot token
    &["ALTER TABLE accounts ADD COLUMN bot_granted BOOLEAN NOT NULL DEFAULT FALSE"],
];

/// Bookkeeping table for the stored version. Created outside the
/// numbered steps; an empty table reads as version 0.
pub const VERSION_TABLE: &str =
    "CREATE TABLE IF NOT EXISTS schema_version (version INTEGER NOT NULL)";
