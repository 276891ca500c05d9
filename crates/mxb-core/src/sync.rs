use std::{
    collections::{HashSet, VecDeque},
    sync::Arc,
    time::Duration,
};

use tokio_util::sync::CancellationToken;

use crate::{
    config::Config,
    dispatch::Dispatcher,
    domain::{EventId, SyncCursor},
    ports::{StateStore, Transport},
    token::TokenManager,
    Result,
};

/// Exponential backoff for transient sync failures.
///
/// Delays are non-decreasing up to the cap: each step multiplies the previous
/// delay and adds jitter before clamping, so consecutive failures never retry
/// faster than the attempt before. `reset` after any successful poll.
pub struct Backoff {
    base: Duration,
    cap: Duration,
    factor: f64,
    current: Option<Duration>,
}

impl Backoff {
    pub fn new(base: Duration, cap: Duration) -> Self {
        Self {
            base,
            cap: cap.max(base),
            factor: 2.0,
            current: None,
        }
    }

    pub fn reset(&mut self) {
        self.current = None;
    }

    pub fn next_delay(&mut self) -> Duration {
        let next = match self.current {
            None => self.base,
            Some(cur) => {
                let jitter =
                    Duration::from_millis(time_jitter(cur.as_millis() as u64 / 4));
                (cur.mul_f64(self.factor) + jitter).min(self.cap).max(cur)
            }
        };
        self.current = Some(next.min(self.cap));
        next.min(self.cap)
    }
}

/// Jitter without an RNG dependency: random-enough value in `0..max` from the
/// clock's sub-second noise.
fn time_jitter(max: u64) -> u64 {
    if max == 0 {
        return 0;
    }
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .subsec_nanos() as u64;
    nanos % max
}

/// Bounded in-memory window of recently seen event ids.
///
/// Covers overlapping poll responses (server retry semantics): within the
/// window an event id is dispatched at most once. FIFO eviction keeps memory
/// bounded for a long-running daemon.
pub struct DedupWindow {
    cap: usize,
    seen: HashSet<EventId>,
    order: VecDeque<EventId>,
}

impl DedupWindow {
    pub fn new(cap: usize) -> Self {
        Self {
            cap: cap.max(1),
            seen: HashSet::new(),
            order: VecDeque::new(),
        }
    }

    /// Record `id`; returns false if it was already in the window.
    pub fn insert(&mut self, id: &EventId) -> bool {
        if self.seen.contains(id) {
            return false;
        }
        if self.order.len() == self.cap {
            if let Some(evicted) = self.order.pop_front() {
                self.seen.remove(&evicted);
            }
        }
        self.seen.insert(id.clone());
        self.order.push_back(id.clone());
        true
    }
}

/// The sync loop: one in-flight long-poll at a time, cursor persisted before
/// dispatch, transient failures retried forever with capped backoff.
///
/// Exactly one engine per process; a second loop sharing the cursor would
/// double-process events.
pub struct SyncEngine {
    cfg: Arc<Config>,
    transport: Arc<dyn Transport>,
    store: Arc<dyn StateStore>,
    tokens: Arc<TokenManager>,
    dispatcher: Arc<Dispatcher>,
    shutdown: CancellationToken,
}

impl SyncEngine {
    pub fn new(
        cfg: Arc<Config>,
        transport: Arc<dyn Transport>,
        store: Arc<dyn StateStore>,
        tokens: Arc<TokenManager>,
        dispatcher: Arc<Dispatcher>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            cfg,
            transport,
            store,
            tokens,
            dispatcher,
            shutdown,
        }
    }

    /// Run until cancelled (Ok) or a fatal error stops progress (Err).
    ///
    /// The shutdown token is observed only at poll boundaries and during
    /// backoff waits, never mid-request, and the store is flushed on every
    /// exit path so the last durable cursor write survives.
    pub async fn run(&self, start_cursor: Option<SyncCursor>) -> Result<()> {
        let result = self.run_loop(start_cursor).await;
        if let Err(e) = self.store.flush().await {
            tracing::error!(error = %e, "state flush on shutdown failed");
            return result.and(Err(e));
        }
        result
    }

    async fn run_loop(&self, start_cursor: Option<SyncCursor>) -> Result<()> {
        let mut cursor = start_cursor;
        let mut backoff = Backoff::new(self.cfg.backoff_base, self.cfg.backoff_cap);
        let mut window = DedupWindow::new(self.cfg.dedup_window);

        tracing::info!(
            since = cursor.as_ref().map(|c| c.0.as_str()).unwrap_or("<initial>"),
            "sync loop started"
        );

        loop {
            if self.shutdown.is_cancelled() {
                tracing::info!("shutdown requested, stopping at poll boundary");
                return Ok(());
            }

            let cred = match self.tokens.current().await {
                Ok(cred) => cred,
                Err(e) if e.is_transient() => {
                    self.wait_before_retry(&mut backoff, &e).await;
                    continue;
                }
                Err(e) => {
                    tracing::error!(error = %e, "no usable credential, stopping");
                    return Err(e);
                }
            };

            match self
                .transport
                .sync(cursor.as_ref(), &cred.access_token, self.cfg.sync_timeout)
                .await
            {
                Ok(batch) => {
                    backoff.reset();

                    // Durability before delivery: a crash from here on may
                    // redeliver events after this cursor, never skip them.
                    self.store.save_cursor(&batch.next_cursor).await?;
                    cursor = Some(batch.next_cursor);

                    for event in &batch.events {
                        if !window.insert(&event.id) {
                            tracing::debug!(event_id = %event.id.0, "duplicate event dropped");
                            continue;
                        }
                        self.dispatcher.dispatch(event).await;
                    }
                }
                Err(e) if e.is_transient() => {
                    self.wait_before_retry(&mut backoff, &e).await;
                }
                Err(e) if e.is_token_rejection() => {
                    tracing::warn!(error = %e, "access token rejected mid-sync, refreshing");
                    self.tokens.invalidate(&cred).await;
                    match self.tokens.refresh_after_rejection(&cred).await {
                        Ok(_) => backoff.reset(),
                        Err(e) if e.is_transient() => {
                            self.wait_before_retry(&mut backoff, &e).await;
                        }
                        Err(e) => {
                            tracing::error!(error = %e, "token refresh failed, stopping");
                            return Err(e);
                        }
                    }
                }
                Err(e) => {
                    tracing::error!(error = %e, "unrecoverable sync failure, stopping");
                    return Err(e);
                }
            }
        }
    }

    async fn wait_before_retry(&self, backoff: &mut Backoff, cause: &crate::Error) {
        let delay = backoff.next_delay();
        tracing::warn!(
            error = %cause,
            delay_ms = delay.as_millis() as u64,
            "transient failure, backing off"
        );
        tokio::select! {
            _ = self.shutdown.cancelled() => {}
            _ = tokio::time::sleep(delay) => {}
        }
    }
}
