use std::sync::Arc;

use serde_json::json;

use crate::{
    dispatch::EventHandler,
    domain::{Event, UserId},
    ports::Transport,
    token::TokenManager,
    Result,
};

/// The `!hello`-style command: prefix-matched text from another user gets a
/// reply notice into the originating room.
///
/// Kept as a pure predicate + action pair so further commands compose without
/// touching the dispatcher.
pub struct HelloCommand {
    prefix: String,
    reply: String,
    self_id: UserId,
    transport: Arc<dyn Transport>,
    tokens: Arc<TokenManager>,
}

impl HelloCommand {
    pub fn new(
        prefix: String,
        reply: String,
        self_id: UserId,
        transport: Arc<dyn Transport>,
        tokens: Arc<TokenManager>,
    ) -> Self {
        Self {
            prefix,
            reply,
            self_id,
            transport,
            tokens,
        }
    }
}

#[async_trait::async_trait]
impl EventHandler for HelloCommand {
    fn name(&self) -> &'static str {
        "hello-command"
    }

    fn matches(&self, event: &Event) -> bool {
        event.kind == "m.room.message"
            && event.msgtype() == Some("m.text")
            && event.sender != self.self_id
            && event
                .body()
                .map(|b| b.starts_with(&self.prefix))
                .unwrap_or(false)
    }

    async fn handle(&self, event: &Event) -> Result<()> {
        let cred = self.tokens.current().await?;
        let content = json!({
            "msgtype": "m.notice",
            "body": self.reply,
            "m.relates_to": {
                "m.in_reply_to": { "event_id": event.id.0 }
            }
        });
        let sent = self
            .transport
            .send_message(&event.room_id, content, &cred.access_token)
            .await?;
        tracing::info!(
            room_id = %event.room_id.0,
            in_reply_to = %event.id.0,
            event_id = %sent.0,
            "replied to command"
        );
        Ok(())
    }
}

/// Accepts invites addressed to the bot.
///
/// The SDK the original deployment leaned on did this as a client mixin;
/// here it is an ordinary handler registration so dispatch stays uniform.
pub struct Autojoin {
    self_id: UserId,
    transport: Arc<dyn Transport>,
    tokens: Arc<TokenManager>,
}

impl Autojoin {
    pub fn new(self_id: UserId, transport: Arc<dyn Transport>, tokens: Arc<TokenManager>) -> Self {
        Self {
            self_id,
            transport,
            tokens,
        }
    }
}

#[async_trait::async_trait]
impl EventHandler for Autojoin {
    fn name(&self) -> &'static str {
        "autojoin"
    }

    fn matches(&self, event: &Event) -> bool {
        event.kind == "m.room.member"
            && event.state_key.as_deref() == Some(self.self_id.0.as_str())
            && event.membership() == Some("invite")
    }

    async fn handle(&self, event: &Event) -> Result<()> {
        let cred = self.tokens.current().await?;
        self.transport
            .join_room(&event.room_id, &cred.access_token)
            .await?;
        tracing::info!(room_id = %event.room_id.0, inviter = %event.sender.0, "joined room");
        Ok(())
    }
}
