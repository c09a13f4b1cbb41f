// Shared diesel table definitions. Both backends use identical column
// types (TEXT/BOOLEAN only, natural keys, ISO-8601 dates as TEXT) so a
// single schema serves sqlite and postgres alike.

diesel::table! {
    users (id) {
        id -> Text,
        slack_id -> Nullable<Text>,
        team_id -> Nullable<Text>,
        display_name -> Nullable<Text>,
        avatar_url -> Nullable<Text>,
        is_remote -> Bool,
        json -> Nullable<Text>,
    }
}

diesel::table! {
    events (room_id, event_id) {
        room_id -> Text,
        event_id -> Text,
        slack_channel_id -> Text,
        slack_ts -> Text,
        extras -> Nullable<Text>,
    }
}

diesel::table! {
    rooms (id) {
        id -> Text,
        matrix_id -> Text,
        remote_id -> Text,
        remote -> Text,
    }
}

diesel::table! {
    teams (id) {
        id -> Text,
        name -> Text,
        bot_token -> Text,
        bot_id -> Text,
        domain -> Text,
        scopes -> Text,
        status -> Text,
        user_id -> Text,
    }
}

diesel::table! {
    accounts (matrix_id, slack_id, team_id) {
        matrix_id -> Text,
        slack_id -> Text,
        team_id -> Text,
        access_token -> Text,
        bot_granted -> Bool,
    }
}

diesel::table! {
    puppets (team_id, slack_id) {
        matrix_id -> Text,
        team_id -> Text,
        slack_id -> Text,
        token -> Text,
    }
}

diesel::table! {
    admin_rooms (room_id) {
        room_id -> Text,
        matrix_id -> Text,
    }
}

diesel::table! {
    metrics_activities (user_id, room_id, date) {
        user_id -> Text,
        room_id -> Text,
        date -> Text,
    }
}
