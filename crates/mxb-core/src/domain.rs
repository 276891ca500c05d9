use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Matrix room id (`!abc:server`).
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RoomId(pub String);

/// Matrix event id (`$abc`), unique within a room.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EventId(pub String);

/// Matrix user id (`@user:server`).
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UserId(pub String);

/// Opaque `since` continuation marker returned by the homeserver.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncCursor(pub String);

/// The one live access credential for this process.
///
/// Mutated only by the token manager; replaced atomically on refresh.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    pub access_token: String,
    pub user_id: UserId,
    pub issued_at: DateTime<Utc>,
}

impl Credential {
    pub fn new(access_token: String, user_id: UserId) -> Self {
        Self {
            access_token,
            user_id,
            issued_at: Utc::now(),
        }
    }
}

/// A decoded timeline or state event. Immutable once received.
#[derive(Clone, Debug)]
pub struct Event {
    pub id: EventId,
    pub room_id: RoomId,
    pub sender: UserId,
    /// Event type (`m.room.message`, `m.room.member`, ...).
    pub kind: String,
    /// State key for state events (empty-string keys are meaningful in Matrix,
    /// so this stays `Option` rather than defaulting).
    pub state_key: Option<String>,
    pub content: serde_json::Value,
    pub origin_ts: i64,
}

impl Event {
    /// `content.msgtype` for message events.
    pub fn msgtype(&self) -> Option<&str> {
        self.content.get("msgtype").and_then(|v| v.as_str())
    }

    /// `content.body` for message events.
    pub fn body(&self) -> Option<&str> {
        self.content.get("body").and_then(|v| v.as_str())
    }

    /// `content.membership` for member events.
    pub fn membership(&self) -> Option<&str> {
        self.content.get("membership").and_then(|v| v.as_str())
    }
}

/// One poll's worth of events, in server arrival order (per-room order is
/// meaningful; cross-room order is not).
#[derive(Clone, Debug)]
pub struct SyncBatch {
    pub events: Vec<Event>,
    pub next_cursor: SyncCursor,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn event_content_accessors() {
        let ev = Event {
            id: EventId("$1".into()),
            room_id: RoomId("!r:hs".into()),
            sender: UserId("@a:hs".into()),
            kind: "m.room.message".into(),
            state_key: None,
            content: json!({"msgtype": "m.text", "body": "!hello"}),
            origin_ts: 0,
        };
        assert_eq!(ev.msgtype(), Some("m.text"));
        assert_eq!(ev.body(), Some("!hello"));
        assert_eq!(ev.membership(), None);
    }
}
