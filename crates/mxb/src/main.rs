use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use mxb_core::{
    config::Config,
    dispatch::Dispatcher,
    handlers::{Autojoin, HelloCommand},
    ports::StateStore,
    sync::SyncEngine,
    token::TokenManager,
};
use mxb_http::MatrixTransport;
use mxb_store::FsStateStore;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    mxb_core::logging::init("mxb");

    let cfg = Arc::new(Config::load()?);
    tracing::info!(homeserver = %cfg.homeserver_url, "starting");

    let transport: Arc<MatrixTransport> = Arc::new(MatrixTransport::new(&cfg.homeserver_url));
    let store = Arc::new(FsStateStore::open(cfg.state_file.clone()).await?);
    let tokens = Arc::new(TokenManager::new(
        cfg.clone(),
        transport.clone(),
        store.clone(),
    ));

    // A validated credential is a precondition of polling; a bad token or an
    // unreachable server is a fatal startup failure (non-zero exit).
    let cred = tokens.initialize().await?;
    tracing::info!(user_id = %cred.user_id.0, "credential validated, starting sync");

    let mut dispatcher = Dispatcher::new(cfg.handler_timeout);
    if cfg.autojoin {
        dispatcher.register(Arc::new(Autojoin::new(
            cred.user_id.clone(),
            transport.clone(),
            tokens.clone(),
        )));
    }
    dispatcher.register(Arc::new(HelloCommand::new(
        cfg.command_prefix.clone(),
        cfg.command_reply.clone(),
        cred.user_id,
        transport.clone(),
        tokens.clone(),
    )));

    let shutdown = CancellationToken::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("shutdown signal received");
                shutdown.cancel();
            }
        });
    }

    let cursor = store.load().await?.cursor;
    let engine = SyncEngine::new(
        cfg,
        transport,
        store,
        tokens,
        Arc::new(dispatcher),
        shutdown,
    );
    engine.run(cursor).await?;

    tracing::info!("stopped cleanly");
    Ok(())
}
