/// Core error type for the bot.
///
/// Adapter crates map their specific failures into this taxonomy so the sync
/// loop can decide uniformly: retry with backoff, refresh the token, or stop.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The credential exchange itself was rejected (bad password, unknown
    /// user, or a rejected long-lived token with no way to re-login). Fatal.
    #[error("invalid credentials: {0}")]
    InvalidCredentials(String),

    /// A 401-class response for the current access token. Refreshable.
    #[error("access token rejected: {0}")]
    TokenExpired(String),

    /// Transport-level failure or a 5xx/429 from the server. Retryable.
    #[error("network unavailable: {0}")]
    NetworkUnavailable(String),

    /// The server understood the request and refused it. Fatal, operator
    /// must intervene.
    #[error("server rejected request: {0}")]
    ServerRejected(String),

    /// A registered handler's action failed or timed out. Non-fatal,
    /// isolated per handler.
    #[error("handler '{handler}' failed: {reason}")]
    Handler { handler: String, reason: String },

    /// Durable storage failed. Fatal: cursor/credential guarantees cannot be
    /// upheld, safer to stop than silently lose state.
    #[error("persistence failure: {0}")]
    Persistence(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Recoverable locally via backoff, without operator involvement.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::NetworkUnavailable(_))
    }

    /// 401-class: the current token is unusable but a refresh may fix it.
    pub fn is_token_rejection(&self) -> bool {
        matches!(self, Error::TokenExpired(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
