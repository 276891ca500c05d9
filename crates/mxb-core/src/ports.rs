use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{
    domain::{Credential, EventId, RoomId, SyncBatch, SyncCursor, UserId},
    Result,
};

/// Hexagonal port for the homeserver's client-server API.
///
/// The core never talks HTTP directly; `mxb-http` implements this over
/// reqwest. Bit-exact wire shapes live entirely in the adapter.
#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    /// Password login. Returns a fresh credential on success.
    async fn login(&self, user: &str, password: &str) -> Result<Credential>;

    /// Resolve the user id owning `token`. Used to validate a credential
    /// before the sync loop is allowed to start.
    async fn whoami(&self, token: &str) -> Result<UserId>;

    /// One long-poll, bounded server-side by `timeout`. An empty batch with
    /// an advanced (or unchanged) cursor is a heartbeat, not an error.
    async fn sync(
        &self,
        cursor: Option<&SyncCursor>,
        token: &str,
        timeout: Duration,
    ) -> Result<SyncBatch>;

    /// Send an `m.room.message` event into a room.
    async fn send_message(
        &self,
        room: &RoomId,
        content: serde_json::Value,
        token: &str,
    ) -> Result<EventId>;

    /// Accept an invite.
    async fn join_room(&self, room: &RoomId, token: &str) -> Result<()>;
}

/// State that must survive a process restart.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct PersistedState {
    pub credential: Option<Credential>,
    pub cursor: Option<SyncCursor>,
}

/// Hexagonal port for durable {credential, cursor} storage.
///
/// Implementations must make each save durable before returning: the sync
/// loop relies on the cursor being on disk before events are dispatched.
#[async_trait::async_trait]
pub trait StateStore: Send + Sync {
    async fn load(&self) -> Result<PersistedState>;
    async fn save_credential(&self, credential: &Credential) -> Result<()>;
    async fn save_cursor(&self, cursor: &SyncCursor) -> Result<()>;
    /// Write out any buffered state. Called once at shutdown.
    async fn flush(&self) -> Result<()>;
}
