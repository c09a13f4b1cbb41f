//! OAuth authorize callback: code exchange, team-limit enforcement
//! and account/team persistence. A human is waiting behind the
//! redirect, so every failure renders an HTML page instead of a bare
//! status.

use salvo::http::StatusCode;
use tracing::{error, info, warn};

use super::IngestContext;
use super::ingest::InboundResponse;
use super::metrics::RequestOutcome;
use crate::db::{PuppetEntry, SlackAccount, TeamEntry, TeamStatus};

pub async fn handle_authorize(
    ctx: &IngestContext,
    inbound_id: &str,
    code: Option<&str>,
) -> (InboundResponse, RequestOutcome) {
    let Some(oauth) = ctx.oauth2.as_ref() else {
        return (
            html_error(
                StatusCode::INTERNAL_SERVER_ERROR,
                "OAuth is not configured on this bridge.",
            ),
            RequestOutcome::Fail,
        );
    };

    // Two legal callers share this endpoint: a bound room (legacy
    // per-channel flow, accepted but no user token stored) and a
    // one-shot pre-auth token from an account-link request.
    let bound_room = ctx.rooms.room_by_inbound_id(inbound_id);
    let pending_user = if bound_room.is_none() {
        ctx.preauth.take(inbound_id)
    } else {
        None
    };
    if bound_room.is_none() && pending_user.is_none() {
        return (
            html_error(
                StatusCode::FORBIDDEN,
                "This authorization link has expired or is not recognized.",
            ),
            RequestOutcome::Fail,
        );
    }

    let Some(code) = code else {
        return (
            html_error(StatusCode::FORBIDDEN, "Missing authorization code."),
            RequestOutcome::Fail,
        );
    };

    let redirect_uri = format!(
        "{}/{}/authorize",
        oauth.redirect_prefix.trim_end_matches('/'),
        inbound_id
    );
    let grant = match ctx
        .slack
        .oauth_access(&oauth.client_id, &oauth.client_secret, code, &redirect_uri)
        .await
    {
        Ok(grant) => grant,
        Err(err) => {
            warn!("oauth code exchange failed: {err}");
            return (
                html_error(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Token exchange with Slack failed. Please try the link again.",
                ),
                RequestOutcome::Fail,
            );
        }
    };

    // Bot-token grants register a whole workspace; the team limit is
    // enforced before anything is persisted.
    if let Some(bot) = grant.bot.as_ref()
        && let Some(limit) = oauth.team_limit
    {
        let teams = match ctx.store.get_all_teams().await {
            Ok(teams) => teams,
            Err(err) => {
                error!("could not count bridged teams: {err}");
                return (
                    html_error(StatusCode::INTERNAL_SERVER_ERROR, "Internal storage error."),
                    RequestOutcome::Fail,
                );
            }
        };
        let already_bridged = grant
            .team_id
            .as_deref()
            .is_some_and(|id| teams.iter().any(|team| team.id == id));
        if !already_bridged && teams.len() as u32 >= limit {
            warn!(limit, "team limit reached, rejecting new workspace");
            if let Err(err) = ctx.slack.auth_revoke(&bot.bot_access_token).await {
                warn!("best-effort token revoke failed: {err}");
            }
            return (
                html_error(
                    StatusCode::FORBIDDEN,
                    "This bridge has reached its maximum number of workspaces. \
                     The issued token has been revoked.",
                ),
                RequestOutcome::Fail,
            );
        }
    }

    // Account first, validated team record last. A transient window
    // where the account references a not-yet-upserted team is
    // tolerated.
    if let Some(matrix_id) = pending_user.as_deref()
        && let (Some(user_id), Some(team_id)) = (grant.user_id.as_deref(), grant.team_id.as_deref())
    {
        let account = SlackAccount {
            matrix_id: matrix_id.to_owned(),
            slack_id: user_id.to_owned(),
            team_id: team_id.to_owned(),
            access_token: grant.access_token.clone(),
            bot_granted: grant.bot.is_some(),
        };
        if let Err(err) = ctx.store.insert_account(&account).await {
            error!("failed to persist linked account: {err}");
            return (
                html_error(StatusCode::INTERNAL_SERVER_ERROR, "Internal storage error."),
                RequestOutcome::Fail,
            );
        }
        // The same user token doubles as the puppeting credential, so
        // messages from this user relay under their own identity.
        let puppet = PuppetEntry {
            matrix_id: matrix_id.to_owned(),
            team_id: team_id.to_owned(),
            slack_id: user_id.to_owned(),
            token: grant.access_token.clone(),
        };
        if let Err(err) = ctx.store.set_puppet_token(&puppet).await {
            error!("failed to persist puppet credential: {err}");
            return (
                html_error(StatusCode::INTERNAL_SERVER_ERROR, "Internal storage error."),
                RequestOutcome::Fail,
            );
        }
        info!(matrix_id, team_id, "slack account linked");
    }

    if let Some(bot) = grant.bot.as_ref() {
        // The team record comes from auth.test, never from the
        // client-supplied metadata.
        let auth = match ctx.slack.auth_test(&bot.bot_access_token).await {
            Ok(auth) => auth,
            Err(err) => {
                warn!("bot token validation failed: {err}");
                return (
                    html_error(
                        StatusCode::INTERNAL_SERVER_ERROR,
                        "Could not validate the issued bot token with Slack.",
                    ),
                    RequestOutcome::Fail,
                );
            }
        };
        let team = TeamEntry {
            id: auth.team_id.clone(),
            name: grant
                .team_name
                .clone()
                .or_else(|| auth.team.clone())
                .unwrap_or_else(|| auth.team_id.clone()),
            bot_token: bot.bot_access_token.clone(),
            bot_id: auth.bot_id.clone().unwrap_or_default(),
            domain: auth.url.clone().unwrap_or_default(),
            scopes: grant.scope.clone(),
            status: TeamStatus::Ok,
            user_id: auth.user_id.clone(),
        };
        if let Err(err) = ctx.store.upsert_team(&team).await {
            error!("failed to persist team: {err}");
            return (
                html_error(StatusCode::INTERNAL_SERVER_ERROR, "Internal storage error."),
                RequestOutcome::Fail,
            );
        }
        info!(team = %team.id, "workspace registered");
    }

    (
        InboundResponse::Html(
            html_page(
                "Linked!",
                "Your Slack account is now linked. You can close this window.",
            ),
            StatusCode::OK,
        ),
        RequestOutcome::Success,
    )
}

fn html_error(status: StatusCode, message: &str) -> InboundResponse {
    InboundResponse::Html(html_page("Something went wrong", message), status)
}

fn html_page(title: &str, message: &str) -> String {
    format!(
        "<!DOCTYPE html><html><head><title>{title}</title></head>\
         <body><h1>{title}</h1><p>{message}</p></body></html>"
    )
}
