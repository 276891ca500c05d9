//! Matrix client-server API adapter.
//!
//! Implements `mxb_core::ports::Transport` directly over reqwest: login,
//! whoami, long-poll sync, message send, and room join. All wire shapes and
//! HTTP-status → error-taxonomy mapping live here; the core never sees JSON
//! from the homeserver.

use std::{
    collections::HashMap,
    sync::atomic::{AtomicU64, Ordering},
    time::Duration,
};

use serde::Deserialize;
use serde_json::json;

use mxb_core::{
    domain::{Credential, Event, EventId, RoomId, SyncBatch, SyncCursor, UserId},
    errors::Error,
    ports::Transport,
    Result,
};

/// Slack on top of the server-side long-poll timeout before the local HTTP
/// client gives up on a sync request.
const SYNC_CLIENT_MARGIN: Duration = Duration::from_secs(15);

pub struct MatrixTransport {
    http: reqwest::Client,
    base_url: String,
    /// Monotonic transaction id suffix for idempotent sends.
    txn_counter: AtomicU64,
    txn_prefix: u128,
}

impl MatrixTransport {
    pub fn new(homeserver_url: &str) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .expect("reqwest client build");
        // Prefix transaction ids with process start time so ids never repeat
        // across restarts (the server dedups sends per {token, txn id}).
        let txn_prefix = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis();
        Self {
            http,
            base_url: homeserver_url.trim_end_matches('/').to_string(),
            txn_counter: AtomicU64::new(0),
            txn_prefix,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/_matrix/client/v3{path}", self.base_url)
    }

    fn next_txn_id(&self) -> String {
        let n = self.txn_counter.fetch_add(1, Ordering::SeqCst);
        format!("mxb-{}-{n}", self.txn_prefix)
    }

    async fn read_error(resp: reqwest::Response, context: &str) -> Error {
        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();
        let errcode = serde_json::from_str::<serde_json::Value>(&body)
            .ok()
            .and_then(|v| v.get("errcode").and_then(|c| c.as_str()).map(String::from))
            .unwrap_or_else(|| "<no errcode>".to_string());
        map_status(status.as_u16(), &errcode, context)
    }
}

/// Classify an HTTP failure into the core taxonomy.
///
/// 401 means the access token is no longer usable (refreshable); 429 and 5xx
/// are transient; everything else 4xx is a server rejection the loop cannot
/// fix on its own.
fn map_status(status: u16, errcode: &str, context: &str) -> Error {
    match status {
        401 => Error::TokenExpired(format!("{context}: {errcode}")),
        429 => Error::NetworkUnavailable(format!("{context}: rate limited ({errcode})")),
        500..=599 => Error::NetworkUnavailable(format!("{context}: server error {status}")),
        _ => Error::ServerRejected(format!("{context}: {status} {errcode}")),
    }
}

fn map_request_error(e: reqwest::Error, context: &str) -> Error {
    Error::NetworkUnavailable(format!("{context}: {e}"))
}

// ── Wire shapes (sync response subset this client consumes) ──

#[derive(Deserialize)]
struct SyncResponse {
    next_batch: String,
    #[serde(default)]
    rooms: RawRooms,
}

#[derive(Deserialize, Default)]
struct RawRooms {
    #[serde(default)]
    join: HashMap<String, RawJoinedRoom>,
    #[serde(default)]
    invite: HashMap<String, RawInvitedRoom>,
}

#[derive(Deserialize, Default)]
struct RawJoinedRoom {
    #[serde(default)]
    timeline: RawTimeline,
}

#[derive(Deserialize, Default)]
struct RawTimeline {
    #[serde(default)]
    events: Vec<RawEvent>,
}

#[derive(Deserialize, Default)]
struct RawInvitedRoom {
    #[serde(default)]
    invite_state: RawInviteState,
}

#[derive(Deserialize, Default)]
struct RawInviteState {
    #[serde(default)]
    events: Vec<RawEvent>,
}

#[derive(Deserialize)]
struct RawEvent {
    #[serde(default)]
    event_id: Option<String>,
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    sender: Option<String>,
    #[serde(default)]
    state_key: Option<String>,
    #[serde(default)]
    content: serde_json::Value,
    #[serde(default)]
    origin_server_ts: Option<i64>,
}

/// Flatten a decoded `/sync` body into an ordered event batch.
///
/// Joined-room timelines keep their server order. Invite-room state arrives
/// stripped (no event ids), so membership events get a synthetic
/// `invite:{room}:{state_key}` id — stable across overlapping polls, which is
/// what the dedup window needs.
fn decode_sync(resp: SyncResponse) -> SyncBatch {
    let mut events = Vec::new();

    for (room_id, room) in resp.rooms.join {
        let room_id = RoomId(room_id);
        for raw in room.timeline.events {
            let Some(event_id) = raw.event_id else {
                continue; // timeline events without ids are malformed, skip
            };
            let Some(sender) = raw.sender else {
                continue;
            };
            events.push(Event {
                id: EventId(event_id),
                room_id: room_id.clone(),
                sender: UserId(sender),
                kind: raw.kind,
                state_key: raw.state_key,
                content: raw.content,
                origin_ts: raw.origin_server_ts.unwrap_or(0),
            });
        }
    }

    for (room_id, room) in resp.rooms.invite {
        let room_id = RoomId(room_id);
        for raw in room.invite_state.events {
            if raw.kind != "m.room.member" {
                continue;
            }
            let Some(state_key) = raw.state_key else {
                continue;
            };
            let Some(sender) = raw.sender else {
                continue;
            };
            events.push(Event {
                id: EventId(format!("invite:{}:{state_key}", room_id.0)),
                room_id: room_id.clone(),
                sender: UserId(sender),
                kind: raw.kind,
                state_key: Some(state_key),
                content: raw.content,
                origin_ts: raw.origin_server_ts.unwrap_or(0),
            });
        }
    }

    SyncBatch {
        events,
        next_cursor: SyncCursor(resp.next_batch),
    }
}

#[derive(Deserialize)]
struct LoginResponse {
    access_token: String,
    user_id: String,
}

#[derive(Deserialize)]
struct WhoamiResponse {
    user_id: String,
}

#[derive(Deserialize)]
struct SendResponse {
    event_id: String,
}

#[async_trait::async_trait]
impl Transport for MatrixTransport {
    async fn login(&self, user: &str, password: &str) -> Result<Credential> {
        let body = json!({
            "type": "m.login.password",
            "identifier": { "type": "m.id.user", "user": user },
            "password": password,
        });
        let resp = self
            .http
            .post(self.url("/login"))
            .json(&body)
            .send()
            .await
            .map_err(|e| map_request_error(e, "login"))?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let err = Self::read_error(resp, "login").await;
            // A 403 on login is bad credentials, not a server refusal.
            return Err(match (status, err) {
                (401 | 403, e) => Error::InvalidCredentials(e.to_string()),
                (_, e) => e,
            });
        }

        let login: LoginResponse = resp.json().await.map_err(|e| map_request_error(e, "login"))?;
        tracing::info!(user_id = %login.user_id, "login succeeded");
        Ok(Credential::new(login.access_token, UserId(login.user_id)))
    }

    async fn whoami(&self, token: &str) -> Result<UserId> {
        let resp = self
            .http
            .get(self.url("/account/whoami"))
            .bearer_auth(token)
            .send()
            .await
            .map_err(|e| map_request_error(e, "whoami"))?;

        if !resp.status().is_success() {
            return Err(Self::read_error(resp, "whoami").await);
        }

        let who: WhoamiResponse = resp
            .json()
            .await
            .map_err(|e| map_request_error(e, "whoami"))?;
        Ok(UserId(who.user_id))
    }

    async fn sync(
        &self,
        cursor: Option<&SyncCursor>,
        token: &str,
        timeout: Duration,
    ) -> Result<SyncBatch> {
        let mut query: Vec<(&str, String)> =
            vec![("timeout", timeout.as_millis().to_string())];
        if let Some(since) = cursor {
            query.push(("since", since.0.clone()));
        }

        let resp = self
            .http
            .get(self.url("/sync"))
            .query(&query)
            .bearer_auth(token)
            // The server holds the request open up to `timeout`; give the
            // local client strictly longer so it is the server that decides.
            .timeout(timeout + SYNC_CLIENT_MARGIN)
            .send()
            .await
            .map_err(|e| map_request_error(e, "sync"))?;

        if !resp.status().is_success() {
            return Err(Self::read_error(resp, "sync").await);
        }

        let body: SyncResponse = resp.json().await.map_err(|e| map_request_error(e, "sync"))?;
        Ok(decode_sync(body))
    }

    async fn send_message(
        &self,
        room: &RoomId,
        content: serde_json::Value,
        token: &str,
    ) -> Result<EventId> {
        let txn_id = self.next_txn_id();
        let resp = self
            .http
            .put(self.url(&format!(
                "/rooms/{}/send/m.room.message/{txn_id}",
                room.0
            )))
            .bearer_auth(token)
            .json(&content)
            .send()
            .await
            .map_err(|e| map_request_error(e, "send_message"))?;

        if !resp.status().is_success() {
            return Err(Self::read_error(resp, "send_message").await);
        }

        let sent: SendResponse = resp
            .json()
            .await
            .map_err(|e| map_request_error(e, "send_message"))?;
        Ok(EventId(sent.event_id))
    }

    async fn join_room(&self, room: &RoomId, token: &str) -> Result<()> {
        let resp = self
            .http
            .post(self.url(&format!("/rooms/{}/join", room.0)))
            .bearer_auth(token)
            .json(&json!({}))
            .send()
            .await
            .map_err(|e| map_request_error(e, "join_room"))?;

        if !resp.status().is_success() {
            return Err(Self::read_error(resp, "join_room").await);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping_matches_taxonomy() {
        assert!(matches!(
            map_status(401, "M_UNKNOWN_TOKEN", "sync"),
            Error::TokenExpired(_)
        ));
        assert!(matches!(
            map_status(429, "M_LIMIT_EXCEEDED", "sync"),
            Error::NetworkUnavailable(_)
        ));
        assert!(matches!(
            map_status(502, "<no errcode>", "sync"),
            Error::NetworkUnavailable(_)
        ));
        assert!(matches!(
            map_status(403, "M_FORBIDDEN", "send_message"),
            Error::ServerRejected(_)
        ));
    }

    #[test]
    fn decode_sync_flattens_timelines_in_order() {
        let body = serde_json::json!({
            "next_batch": "s72595_4483_1934",
            "rooms": {
                "join": {
                    "!room:hs": {
                        "timeline": {
                            "events": [
                                {
                                    "event_id": "$1",
                                    "type": "m.room.message",
                                    "sender": "@alice:hs",
                                    "content": {"msgtype": "m.text", "body": "!hello"},
                                    "origin_server_ts": 100
                                },
                                {
                                    "event_id": "$2",
                                    "type": "m.room.message",
                                    "sender": "@bob:hs",
                                    "content": {"msgtype": "m.text", "body": "later"},
                                    "origin_server_ts": 200
                                }
                            ]
                        }
                    }
                }
            }
        });
        let resp: SyncResponse = serde_json::from_value(body).unwrap();
        let batch = decode_sync(resp);

        assert_eq!(batch.next_cursor, SyncCursor("s72595_4483_1934".into()));
        assert_eq!(batch.events.len(), 2);
        assert_eq!(batch.events[0].id, EventId("$1".into()));
        assert_eq!(batch.events[1].id, EventId("$2".into()));
        assert_eq!(batch.events[0].body(), Some("!hello"));
    }

    #[test]
    fn decode_sync_synthesizes_stable_invite_ids() {
        let body = serde_json::json!({
            "next_batch": "s1",
            "rooms": {
                "invite": {
                    "!new:hs": {
                        "invite_state": {
                            "events": [
                                {
                                    "type": "m.room.name",
                                    "sender": "@alice:hs",
                                    "content": {"name": "A room"}
                                },
                                {
                                    "type": "m.room.member",
                                    "sender": "@alice:hs",
                                    "state_key": "@bot:hs",
                                    "content": {"membership": "invite"}
                                }
                            ]
                        }
                    }
                }
            }
        });
        let resp: SyncResponse = serde_json::from_value(body).unwrap();
        let batch = decode_sync(resp);

        // Non-member stripped state is dropped; the invite is kept with a
        // synthetic id stable across repeated polls.
        assert_eq!(batch.events.len(), 1);
        let ev = &batch.events[0];
        assert_eq!(ev.id, EventId("invite:!new:hs:@bot:hs".into()));
        assert_eq!(ev.membership(), Some("invite"));
        assert_eq!(ev.state_key.as_deref(), Some("@bot:hs"));
    }

    #[test]
    fn decode_sync_handles_empty_heartbeat() {
        let resp: SyncResponse = serde_json::from_value(serde_json::json!({
            "next_batch": "s2"
        }))
        .unwrap();
        let batch = decode_sync(resp);
        assert!(batch.events.is_empty());
        assert_eq!(batch.next_cursor, SyncCursor("s2".into()));
    }

    #[test]
    fn txn_ids_never_repeat() {
        let t = MatrixTransport::new("https://hs.example/");
        let a = t.next_txn_id();
        let b = t.next_txn_id();
        assert_ne!(a, b);
        assert_eq!(t.url("/sync"), "https://hs.example/_matrix/client/v3/sync");
    }
}
