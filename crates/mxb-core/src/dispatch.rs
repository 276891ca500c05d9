use std::{sync::Arc, time::Duration};

use tokio::time::timeout;

use crate::{domain::Event, errors::Error, Result};

/// A registered predicate + action pair.
///
/// Handlers are registered at startup and never removed. `matches` must be
/// cheap and side-effect free; all real work belongs in `handle`.
#[async_trait::async_trait]
pub trait EventHandler: Send + Sync {
    fn name(&self) -> &'static str;
    fn matches(&self, event: &Event) -> bool;
    async fn handle(&self, event: &Event) -> Result<()>;
}

/// Fans each event out to every matching handler.
///
/// Handler failures are isolated: an error or timeout in one action is logged
/// and does not stop the other handlers or the sync loop. Events must be
/// dispatched in arrival order, so `dispatch` is awaited per event; each
/// action is bounded by `action_timeout` to keep the loop from stalling.
pub struct Dispatcher {
    handlers: Vec<Arc<dyn EventHandler>>,
    action_timeout: Duration,
}

impl Dispatcher {
    pub fn new(action_timeout: Duration) -> Self {
        Self {
            handlers: Vec::new(),
            action_timeout,
        }
    }

    pub fn register(&mut self, handler: Arc<dyn EventHandler>) {
        self.handlers.push(handler);
    }

    pub fn handler_count(&self) -> usize {
        self.handlers.len()
    }

    /// Run every matching handler against `event`. Returns the number of
    /// failed actions (already logged); never an error.
    pub async fn dispatch(&self, event: &Event) -> usize {
        let mut failures = 0;
        for handler in &self.handlers {
            if !handler.matches(event) {
                continue;
            }

            let outcome = match timeout(self.action_timeout, handler.handle(event)).await {
                Ok(Ok(())) => Ok(()),
                Ok(Err(e)) => Err(Error::Handler {
                    handler: handler.name().to_string(),
                    reason: e.to_string(),
                }),
                Err(_) => Err(Error::Handler {
                    handler: handler.name().to_string(),
                    reason: format!("timed out after {:?}", self.action_timeout),
                }),
            };

            if let Err(e) = outcome {
                failures += 1;
                tracing::warn!(
                    event_id = %event.id.0,
                    room_id = %event.room_id.0,
                    error = %e,
                    "handler failed"
                );
            }
        }
        failures
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{EventId, RoomId, UserId};
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn text_event(body: &str) -> Event {
        Event {
            id: EventId("$1".into()),
            room_id: RoomId("!r:hs".into()),
            sender: UserId("@a:hs".into()),
            kind: "m.room.message".into(),
            state_key: None,
            content: json!({"msgtype": "m.text", "body": body}),
            origin_ts: 0,
        }
    }

    struct CountingHandler {
        calls: AtomicUsize,
        fail: bool,
        hang: bool,
    }

    impl CountingHandler {
        fn new(fail: bool, hang: bool) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                fail,
                hang,
            })
        }
    }

    #[async_trait]
    impl EventHandler for CountingHandler {
        fn name(&self) -> &'static str {
            "counting"
        }

        fn matches(&self, _event: &Event) -> bool {
            true
        }

        async fn handle(&self, _event: &Event) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.hang {
                tokio::time::sleep(Duration::from_secs(3600)).await;
            }
            if self.fail {
                return Err(Error::ServerRejected("nope".into()));
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn failing_handler_does_not_block_the_next_one() {
        let mut d = Dispatcher::new(Duration::from_secs(1));
        let bad = CountingHandler::new(true, false);
        let good = CountingHandler::new(false, false);
        d.register(bad.clone());
        d.register(good.clone());

        let failures = d.dispatch(&text_event("hi")).await;
        assert_eq!(failures, 1);
        assert_eq!(bad.calls.load(Ordering::SeqCst), 1);
        assert_eq!(good.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn hung_handler_is_cut_off_and_counted_as_failure() {
        let mut d = Dispatcher::new(Duration::from_millis(50));
        let hung = CountingHandler::new(false, true);
        let good = CountingHandler::new(false, false);
        d.register(hung);
        d.register(good.clone());

        let failures = d.dispatch(&text_event("hi")).await;
        assert_eq!(failures, 1);
        assert_eq!(good.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn non_matching_handler_is_skipped() {
        struct NeverMatches;

        #[async_trait]
        impl EventHandler for NeverMatches {
            fn name(&self) -> &'static str {
                "never"
            }
            fn matches(&self, _event: &Event) -> bool {
                false
            }
            async fn handle(&self, _event: &Event) -> Result<()> {
                panic!("must not run");
            }
        }

        let mut d = Dispatcher::new(Duration::from_secs(1));
        d.register(Arc::new(NeverMatches));
        assert_eq!(d.dispatch(&text_event("hi")).await, 0);
    }
}
