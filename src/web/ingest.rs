//! Inbound request classification and the legacy webhook relay path.
//!
//! Three shapes arrive on the same listener: JSON POSTs from the
//! Events API, form-encoded legacy webhook posts, and OAuth authorize
//! redirects. Everything else is acknowledged and dropped.

use salvo::http::{Method, StatusCode};
use salvo::prelude::*;
use serde::Deserialize;
use serde_json::{Value, json};
use thiserror::Error;
use tracing::{debug, error, warn};

use super::metrics::{RequestOutcome, WebhookTimer};
use super::{IngestContext, oauth, web_state};
use crate::bridge::substitute_team_mentions;
use crate::slack::{RelayMessage, SlackError, lookup_message_at};

/// Slack's own relay identity. Posts from it are our own messages
/// reflected back and must never be re-relayed.
pub const SLACK_RELAY_SENDER: &str = "USLACKBOT";

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("malformed inbound url: {0}")]
    MalformedUrl(String),
}

/// Extracts the 32-character inbound id and the subpath after it.
/// The subpath defaults to `post` when absent.
pub fn get_url_parts(path: &str) -> Result<(String, String), IngestError> {
    let path = path.split('?').next().unwrap_or(path);
    let mut segments = path.split('/').filter(|segment| !segment.is_empty());
    let inbound_id = segments
        .by_ref()
        .find(|segment| segment.len() == 32)
        .ok_or_else(|| IngestError::MalformedUrl(path.to_owned()))?;
    let subpath = segments.next().unwrap_or("post");
    Ok((inbound_id.to_owned(), subpath.to_owned()))
}

/// Caller-supplied fields of a legacy webhook post.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct WebhookParams {
    pub team_id: Option<String>,
    pub team_domain: Option<String>,
    pub channel_id: Option<String>,
    pub channel_name: Option<String>,
    pub timestamp: Option<String>,
    pub user_id: Option<String>,
    pub user_name: Option<String>,
    pub text: Option<String>,
}

pub enum InboundResponse {
    Json(Value, StatusCode),
    /// url_verification challenge, echoed verbatim.
    Text(String),
    Html(String, StatusCode),
}

fn ack() -> InboundResponse {
    InboundResponse::Json(json!({}), StatusCode::OK)
}

#[handler]
pub async fn inbound_request(req: &mut Request, res: &mut Response) {
    let timer = WebhookTimer::start();
    let ctx = &web_state().ctx;
    let (response, outcome) = route_inbound(ctx, req).await;
    match response {
        InboundResponse::Json(value, status) => {
            res.status_code(status);
            res.render(Json(value));
        }
        InboundResponse::Text(body) => {
            res.render(Text::Plain(body));
        }
        InboundResponse::Html(body, status) => {
            res.status_code(status);
            res.render(Text::Html(body));
        }
    }
    timer.finish(outcome);
}

async fn route_inbound(
    ctx: &IngestContext,
    req: &mut Request,
) -> (InboundResponse, RequestOutcome) {
    // Only GET and POST carry meaning on this listener; every other
    // method is acknowledged with an empty body and dropped.
    if req.method() != Method::GET && req.method() != Method::POST {
        debug!(method = %req.method(), "unsupported method, dropping");
        return (ack(), RequestOutcome::Dropped);
    }

    let is_json = req
        .content_type()
        .is_some_and(|mime| mime.subtype() == "json");
    if req.method() == Method::POST && is_json {
        return match req.parse_json::<Value>().await {
            Ok(body) => handle_events_api(ctx, body).await,
            Err(err) => {
                warn!("unparsable events api payload: {err}");
                (
                    InboundResponse::Json(json!({}), StatusCode::BAD_REQUEST),
                    RequestOutcome::Dropped,
                )
            }
        };
    }

    let path = req.uri().path().to_owned();
    let (inbound_id, subpath) = match get_url_parts(&path) {
        Ok(parts) => parts,
        Err(err) => {
            debug!("{err}");
            return (
                InboundResponse::Json(json!({}), StatusCode::NOT_FOUND),
                RequestOutcome::Dropped,
            );
        }
    };

    match subpath.as_str() {
        "post" => {
            let params: WebhookParams = if req.method() == Method::POST {
                req.parse_form().await.unwrap_or_default()
            } else {
                req.parse_queries().unwrap_or_default()
            };
            handle_webhook(ctx, &inbound_id, params).await
        }
        "authorize" => {
            let code = req.query::<String>("code");
            oauth::handle_authorize(ctx, &inbound_id, code.as_deref()).await
        }
        _ => (ack(), RequestOutcome::Dropped),
    }
}

/// Events API dispatch: echo verification challenges, suppress
/// webhook copies for teams with an active streaming connection, hand
/// everything else to the event handler.
pub async fn handle_events_api(
    ctx: &IngestContext,
    body: Value,
) -> (InboundResponse, RequestOutcome) {
    match body.get("type").and_then(Value::as_str) {
        Some("url_verification") => {
            let challenge = body
                .get("challenge")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_owned();
            (InboundResponse::Text(challenge), RequestOutcome::Success)
        }
        Some("event_callback") => {
            let team_id = body.get("team_id").and_then(Value::as_str);
            if let Some(team) = team_id
                && ctx.active_teams.contains(team)
            {
                debug!(team, "event also served by streaming connection, suppressing");
                return (ack(), RequestOutcome::Dropped);
            }
            let Some(event) = body.get("event") else {
                return (ack(), RequestOutcome::Dropped);
            };
            match ctx.events.handle_event(team_id, event).await {
                Ok(()) => (ack(), RequestOutcome::Success),
                Err(err) => {
                    error!("event callback handling failed: {err}");
                    (ack(), RequestOutcome::Fail)
                }
            }
        }
        _ => (ack(), RequestOutcome::Dropped),
    }
}

/// Legacy webhook relay: resolve the room, refresh its channel name,
/// filter self-reflection, enrich from history when a token exists,
/// substitute mentions and hand off.
pub async fn handle_webhook(
    ctx: &IngestContext,
    inbound_id: &str,
    params: WebhookParams,
) -> (InboundResponse, RequestOutcome) {
    let Some(room) = ctx.rooms.room_by_inbound_id(inbound_id) else {
        debug!(inbound_id, "webhook for an unbridged channel, dropping");
        return (ack(), RequestOutcome::Dropped);
    };

    if let Some(name) = params.channel_name.as_deref()
        && let Err(err) = room.refresh_channel_name(name).await
    {
        warn!("failed to persist channel rename: {err}");
    }

    if params.user_id.as_deref() == Some(SLACK_RELAY_SENDER) {
        debug!("own relayed message reflected back, dropping");
        return (ack(), RequestOutcome::Dropped);
    }

    let Some(ts) = params.timestamp.clone() else {
        debug!("webhook without a timestamp, dropping");
        return (ack(), RequestOutcome::Dropped);
    };

    let mut msg = match room.bot_token() {
        // No elevated token: the inline text is taken verbatim.
        None => relay_from_params(&params, room.slack_channel_id()),
        Some(token) => {
            match lookup_message_at(&*ctx.slack, &token, room.slack_channel_id(), &ts).await {
                Ok(mut found) => {
                    found.channel_id = room.slack_channel_id().to_owned();
                    merge_caller_metadata(&mut found, &params);
                    if let Err(err) = enrich_files(ctx, &token, &mut found).await {
                        warn!("file enrichment failed, relaying as plain text: {err}");
                        found.files.clear();
                    }
                    found
                }
                Err(SlackError::CouldNotFindHistory { .. }) => {
                    debug!("history lookup found nothing, using inline parameters");
                    relay_from_params(&params, room.slack_channel_id())
                }
                Err(err @ SlackError::HistoryCollision { .. }) => {
                    error!(payload = ?params, "{err}; dropping message");
                    return (ack(), RequestOutcome::Dropped);
                }
                Err(err) => {
                    warn!("history lookup failed: {err}");
                    return (ack(), RequestOutcome::Fail);
                }
            }
        }
    };

    let team_id = msg.team_id.clone().or_else(|| room.slack_team_id());
    match substitute_team_mentions(&*ctx.store, team_id.as_deref(), &msg.text).await {
        Ok(text) => msg.text = text,
        Err(err) => warn!("mention substitution failed, keeping raw text: {err}"),
    }

    match room.handle_inbound(msg).await {
        Ok(()) => (ack(), RequestOutcome::Success),
        Err(err) => {
            error!(inbound_id, "relay failed: {err}");
            (
                InboundResponse::Json(json!({}), StatusCode::INTERNAL_SERVER_ERROR),
                RequestOutcome::Fail,
            )
        }
    }
}

fn relay_from_params(params: &WebhookParams, channel_id: &str) -> RelayMessage {
    RelayMessage {
        team_id: params.team_id.clone(),
        team_domain: params.team_domain.clone(),
        channel_id: channel_id.to_owned(),
        channel_name: params.channel_name.clone(),
        user_id: params.user_id.clone(),
        user_name: params.user_name.clone(),
        bot_id: None,
        ts: params.timestamp.clone().unwrap_or_default(),
        text: params.text.clone().unwrap_or_default(),
        thread_ts: None,
        files: Vec::new(),
    }
}

/// History results lack the caller-side identifiers, so the webhook's
/// own metadata wins wherever it is present.
fn merge_caller_metadata(msg: &mut RelayMessage, params: &WebhookParams) {
    if params.team_id.is_some() {
        msg.team_id = params.team_id.clone();
    }
    if params.team_domain.is_some() {
        msg.team_domain = params.team_domain.clone();
    }
    if params.channel_name.is_some() {
        msg.channel_name = params.channel_name.clone();
    }
    if params.user_id.is_some() {
        msg.user_id = params.user_id.clone();
    }
    if params.user_name.is_some() {
        msg.user_name = params.user_name.clone();
    }
}

/// Makes every attached file link-shareable, verifies the content is
/// fetchable and appends the public links to the text. Any failure
/// propagates so the caller can fall back to plain text; the text is
/// only touched once every file made it through, so the fallback never
/// carries partial links.
async fn enrich_files(
    ctx: &IngestContext,
    token: &str,
    msg: &mut RelayMessage,
) -> Result<(), SlackError> {
    let files = std::mem::take(&mut msg.files);
    let mut enriched = Vec::with_capacity(files.len());
    let mut links = String::new();
    for mut file in files {
        if !file.public_url_shared {
            file = ctx.slack.files_shared_public_url(token, &file.id).await?;
        }
        if let Some(url) = file
            .url_private
            .as_deref()
            .or(file.permalink_public.as_deref())
        {
            ctx.slack.fetch_file_content(url, token).await?;
        }
        if let Some(link) = file.permalink_public.as_deref() {
            links.push('\n');
            links.push_str(link);
        }
        enriched.push(file);
    }
    msg.text.push_str(&links);
    msg.files = enriched;
    Ok(())
}
