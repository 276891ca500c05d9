use std::sync::Arc;

use tokio::sync::Mutex;

use crate::{
    config::Config,
    domain::{Credential, UserId},
    errors::Error,
    ports::{StateStore, Transport},
    Result,
};

#[derive(Default)]
struct TokenState {
    credential: Option<Credential>,
    valid: bool,
}

/// Owns the one live access credential and its refresh lifecycle.
///
/// All mutation happens under a single async mutex, which is held across the
/// credential exchange itself. That gives two guarantees the sync loop needs:
/// refresh is mutually exclusive with itself, and a caller whose rejected
/// token has already been replaced gets the live credential back without a
/// duplicate exchange.
pub struct TokenManager {
    cfg: Arc<Config>,
    transport: Arc<dyn Transport>,
    store: Arc<dyn StateStore>,
    state: Mutex<TokenState>,
}

impl TokenManager {
    pub fn new(cfg: Arc<Config>, transport: Arc<dyn Transport>, store: Arc<dyn StateStore>) -> Self {
        Self {
            cfg,
            transport,
            store,
            state: Mutex::new(TokenState::default()),
        }
    }

    /// Acquire and validate the initial credential. Must succeed before the
    /// sync loop may enter polling.
    ///
    /// Resolution order: persisted credential, configured `ACCESS_TOKEN`,
    /// password login. Each candidate is validated against the homeserver
    /// (`whoami`); a 401 on one candidate falls through to the next.
    pub async fn initialize(&self) -> Result<Credential> {
        let mut st = self.state.lock().await;

        if let Some(cred) = self.store.load().await?.credential {
            match self.transport.whoami(&cred.access_token).await {
                Ok(user_id) => {
                    tracing::info!(user_id = %user_id.0, "persisted credential valid");
                    st.credential = Some(cred.clone());
                    st.valid = true;
                    return Ok(cred);
                }
                Err(e) if e.is_token_rejection() => {
                    tracing::warn!(error = %e, "persisted credential rejected, falling back");
                }
                Err(e) => return Err(e),
            }
        }

        if let Some(token) = &self.cfg.access_token {
            match self.transport.whoami(token).await {
                Ok(user_id) => {
                    tracing::info!(user_id = %user_id.0, "configured access token valid");
                    let cred = Credential::new(token.clone(), user_id);
                    self.store.save_credential(&cred).await?;
                    st.credential = Some(cred.clone());
                    st.valid = true;
                    return Ok(cred);
                }
                Err(e) if e.is_token_rejection() && self.cfg.can_login() => {
                    tracing::warn!(error = %e, "configured access token rejected, logging in");
                }
                Err(e) if e.is_token_rejection() => {
                    return Err(Error::InvalidCredentials(format!(
                        "configured ACCESS_TOKEN rejected and no login identity available: {e}"
                    )));
                }
                Err(e) => return Err(e),
            }
        }

        let cred = self.exchange().await?;
        self.store.save_credential(&cred).await?;
        st.credential = Some(cred.clone());
        st.valid = true;
        Ok(cred)
    }

    /// The live credential. If the current one has been invalidated, performs
    /// (or awaits) a refresh first; never blocks longer than one refresh cycle.
    pub async fn current(&self) -> Result<Credential> {
        let mut st = self.state.lock().await;
        if st.valid {
            if let Some(cred) = &st.credential {
                return Ok(cred.clone());
            }
        }

        let cred = self.exchange().await?;
        self.store.save_credential(&cred).await?;
        st.credential = Some(cred.clone());
        st.valid = true;
        Ok(cred)
    }

    /// Mark `rejected` unusable. A no-op if it has already been replaced.
    pub async fn invalidate(&self, rejected: &Credential) {
        let mut st = self.state.lock().await;
        if let Some(live) = &st.credential {
            if live.access_token == rejected.access_token {
                st.valid = false;
            }
        }
    }

    /// Refresh after the server rejected `rejected`.
    ///
    /// Concurrent callers collapse into one exchange: whoever acquires the
    /// lock first performs the login; latecomers observe that the live
    /// credential already differs from the one they saw rejected and take it
    /// as-is. The new credential is persisted before it is published, so a
    /// crash after refresh never loses a usable token.
    pub async fn refresh_after_rejection(&self, rejected: &Credential) -> Result<Credential> {
        let mut st = self.state.lock().await;
        if st.valid {
            if let Some(live) = &st.credential {
                if live.access_token != rejected.access_token {
                    return Ok(live.clone());
                }
            }
        }
        st.valid = false;

        let cred = self.exchange().await?;
        self.store.save_credential(&cred).await?;
        st.credential = Some(cred.clone());
        st.valid = true;
        tracing::info!(user_id = %cred.user_id.0, "access token refreshed");
        Ok(cred)
    }

    /// The bot's own user id, once initialized.
    pub async fn user_id(&self) -> Option<UserId> {
        let st = self.state.lock().await;
        st.credential.as_ref().map(|c| c.user_id.clone())
    }

    async fn exchange(&self) -> Result<Credential> {
        let (Some(user), Some(pass)) = (&self.cfg.bot_username, &self.cfg.bot_password) else {
            return Err(Error::InvalidCredentials(
                "access token rejected and no BOT_USERNAME/BOT_PASSWORD to re-login with"
                    .to_string(),
            ));
        };
        self.transport.login(user, pass).await
    }
}
