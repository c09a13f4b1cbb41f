//! Matrix client-server API access on behalf of appservice ghosts.
//! Every call impersonates a ghost via the `user_id` query parameter.

use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use serde_json::{Value, json};
use thiserror::Error;
use url::Url;

#[derive(Debug, Error)]
pub enum MatrixError {
    #[error("matrix request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("matrix api returned {status}: {body}")]
    Api { status: u16, body: String },

    #[error("invalid homeserver url: {0}")]
    BadUrl(#[from] url::ParseError),

    #[error("matrix response missing field {0}")]
    MissingField(&'static str),
}

/// The delivery primitive the ghost layer consumes. Everything is
/// issued as a specific user, never as the bridge bot.
#[async_trait]
pub trait MatrixIntent: Send + Sync {
    async fn set_display_name(&self, user_id: &str, name: &str) -> Result<(), MatrixError>;

    async fn set_avatar_url(&self, user_id: &str, mxc_url: &str) -> Result<(), MatrixError>;

    /// Uploads binary content, returning the `mxc://` content URI.
    async fn upload_content(
        &self,
        data: Vec<u8>,
        content_type: &str,
    ) -> Result<String, MatrixError>;

    /// Sends an `m.room.message` event, returning the new event id.
    async fn send_message(
        &self,
        user_id: &str,
        room_id: &str,
        content: Value,
    ) -> Result<String, MatrixError>;

    /// Sends an arbitrary room event (reactions use `m.reaction`).
    async fn send_event(
        &self,
        user_id: &str,
        room_id: &str,
        event_type: &str,
        content: Value,
    ) -> Result<String, MatrixError>;

    async fn send_typing(
        &self,
        user_id: &str,
        room_id: &str,
        typing: bool,
        timeout_ms: u64,
    ) -> Result<(), MatrixError>;

    async fn send_read_receipt(
        &self,
        user_id: &str,
        room_id: &str,
        event_id: &str,
    ) -> Result<(), MatrixError>;
}

pub struct AppserviceClient {
    http: reqwest::Client,
    base_url: Url,
    as_token: String,
    txn_counter: AtomicU64,
}

impl AppserviceClient {
    pub fn new(homeserver_url: &str, as_token: &str) -> Result<Self, MatrixError> {
        Ok(Self {
            http: reqwest::Client::new(),
            base_url: Url::parse(homeserver_url)?,
            as_token: as_token.to_owned(),
            txn_counter: AtomicU64::new(0),
        })
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url, MatrixError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| MatrixError::MissingField("homeserver url path"))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn next_txn_id(&self) -> String {
        let n = self.txn_counter.fetch_add(1, Ordering::Relaxed);
        format!(
            "slackbridge-{}-{}",
            std::process::id(),
            n
        )
    }

    async fn check(response: reqwest::Response) -> Result<Value, MatrixError> {
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(MatrixError::Api {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response.json().await?)
    }
}

#[async_trait]
impl MatrixIntent for AppserviceClient {
    async fn set_display_name(&self, user_id: &str, name: &str) -> Result<(), MatrixError> {
        let url = self.endpoint(&["_matrix", "client", "v3", "profile", user_id, "displayname"])?;
        let response = self
            .http
            .put(url)
            .bearer_auth(&self.as_token)
            .query(&[("user_id", user_id)])
            .json(&json!({ "displayname": name }))
            .send()
            .await?;
        Self::check(response).await?;
        Ok(())
    }

    async fn set_avatar_url(&self, user_id: &str, mxc_url: &str) -> Result<(), MatrixError> {
        let url = self.endpoint(&["_matrix", "client", "v3", "profile", user_id, "avatar_url"])?;
        let response = self
            .http
            .put(url)
            .bearer_auth(&self.as_token)
            .query(&[("user_id", user_id)])
            .json(&json!({ "avatar_url": mxc_url }))
            .send()
            .await?;
        Self::check(response).await?;
        Ok(())
    }

    async fn upload_content(
        &self,
        data: Vec<u8>,
        content_type: &str,
    ) -> Result<String, MatrixError> {
        let url = self.endpoint(&["_matrix", "media", "v3", "upload"])?;
        let response = self
            .http
            .post(url)
            .bearer_auth(&self.as_token)
            .header("Content-Type", content_type)
            .body(data)
            .send()
            .await?;
        let value = Self::check(response).await?;
        value
            .get("content_uri")
            .and_then(Value::as_str)
            .map(ToOwned::to_owned)
            .ok_or(MatrixError::MissingField("content_uri"))
    }

    async fn send_message(
        &self,
        user_id: &str,
        room_id: &str,
        content: Value,
    ) -> Result<String, MatrixError> {
        self.send_event(user_id, room_id, "m.room.message", content)
            .await
    }

    async fn send_event(
        &self,
        user_id: &str,
        room_id: &str,
        event_type: &str,
        content: Value,
    ) -> Result<String, MatrixError> {
        let txn_id = self.next_txn_id();
        let url = self.endpoint(&[
            "_matrix", "client", "v3", "rooms", room_id, "send", event_type, &txn_id,
        ])?;
        let response = self
            .http
            .put(url)
            .bearer_auth(&self.as_token)
            .query(&[("user_id", user_id)])
            .json(&content)
            .send()
            .await?;
        let value = Self::check(response).await?;
        value
            .get("event_id")
            .and_then(Value::as_str)
            .map(ToOwned::to_owned)
            .ok_or(MatrixError::MissingField("event_id"))
    }

    async fn send_typing(
        &self,
        user_id: &str,
        room_id: &str,
        typing: bool,
        timeout_ms: u64,
    ) -> Result<(), MatrixError> {
        let url = self.endpoint(&["_matrix", "client", "v3", "rooms", room_id, "typing", user_id])?;
        let body = if typing {
            json!({ "typing": true, "timeout": timeout_ms })
        } else {
            json!({ "typing": false })
        };
        let response = self
            .http
            .put(url)
            .bearer_auth(&self.as_token)
            .query(&[("user_id", user_id)])
            .json(&body)
            .send()
            .await?;
        Self::check(response).await?;
        Ok(())
    }

    async fn send_read_receipt(
        &self,
        user_id: &str,
        room_id: &str,
        event_id: &str,
    ) -> Result<(), MatrixError> {
        let url = self.endpoint(&[
            "_matrix", "client", "v3", "rooms", room_id, "receipt", "m.read", event_id,
        ])?;
        let response = self
            .http
            .post(url)
            .bearer_auth(&self.as_token)
            .query(&[("user_id", user_id)])
            .json(&json!({}))
            .send()
            .await?;
        Self::check(response).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_keeps_ids_as_single_segments() {
        let client = AppserviceClient::new("https://matrix.example.org", "tok").unwrap();
        let url = client
            .endpoint(&["_matrix", "client", "v3", "rooms", "!abc:example.org", "typing", "@_slack_u1:example.org"])
            .unwrap();
        let path = url.path();
        assert_eq!(
            path,
            "/_matrix/client/v3/rooms/!abc:example.org/typing/@_slack_u1:example.org"
        );
        // Characters illegal in a path segment must be escaped, not
        // split into new segments.
        let aliased = client.endpoint(&["room", "#general:example.org"]).unwrap();
        assert!(aliased.path().contains("%23general"));
    }

    #[test]
    fn txn_ids_are_unique_per_call() {
        let client = AppserviceClient::new("https://matrix.example.org", "tok").unwrap();
        let a = client.next_txn_id();
        let b = client.next_txn_id();
        assert_ne!(a, b);
    }
}
