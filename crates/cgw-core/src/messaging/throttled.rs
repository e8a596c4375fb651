use std::{collections::HashMap, sync::Arc, time::Duration};

use tokio::sync::Mutex;
use tokio::time::{sleep, Instant};

use crate::{
    domain::{ChatId, DeliveryId},
    errors::TransportError,
    messaging::port::MessagingPort,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ThrottleConfig {
    /// Minimum spacing between any two sends on one connection (bot-wide flood control).
    pub global_min_interval: Duration,
    /// Minimum spacing between sends to the same chat (Telegram 1 msg/sec style limits).
    pub per_chat_min_interval: Duration,
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            global_min_interval: Duration::from_millis(40),     // ~25/sec
            per_chat_min_interval: Duration::from_millis(1050), // ~0.95/sec
        }
    }
}

#[derive(Debug)]
struct IntervalLimiter {
    interval: Duration,
    next: Instant,
}

impl IntervalLimiter {
    fn new(interval: Duration) -> Self {
        Self {
            interval,
            next: Instant::now(),
        }
    }

    /// Reserve the next slot and return the wait duration required before executing.
    fn reserve(&mut self) -> Duration {
        let now = Instant::now();
        let start = if now >= self.next { now } else { self.next };
        self.next = start + self.interval;
        start.saturating_duration_since(now)
    }
}

/// Per-chat limiters are swept once this many chats are tracked.
const PRUNE_CHATS_AT: usize = 256;

/// Drop limiters whose window has passed; a fresh limiter behaves the same.
/// Limiters handed out (or locked) by an in-flight send are kept.
fn prune_idle(map: &mut HashMap<ChatId, Arc<Mutex<IntervalLimiter>>>, now: Instant) {
    map.retain(|_, lim| {
        Arc::strong_count(lim) > 1 || lim.try_lock().map_or(true, |l| l.next > now)
    });
}

/// MessagingPort decorator that spaces out outbound sends.
///
/// One instance wraps one tenant connection, so a busy clinic only ever
/// waits on its own limits.
pub struct ThrottledMessenger {
    inner: Arc<dyn MessagingPort>,
    cfg: ThrottleConfig,
    global: Mutex<IntervalLimiter>,
    per_chat: Mutex<HashMap<ChatId, Arc<Mutex<IntervalLimiter>>>>,
}

impl ThrottledMessenger {
    pub fn new(inner: Arc<dyn MessagingPort>, cfg: ThrottleConfig) -> Self {
        Self {
            inner,
            cfg,
            global: Mutex::new(IntervalLimiter::new(cfg.global_min_interval)),
            per_chat: Mutex::new(HashMap::new()),
        }
    }

    async fn limiter_for_chat(&self, chat_id: &ChatId) -> Arc<Mutex<IntervalLimiter>> {
        let mut map = self.per_chat.lock().await;
        if map.len() >= PRUNE_CHATS_AT && !map.contains_key(chat_id) {
            prune_idle(&mut map, Instant::now());
        }
        map.entry(chat_id.clone())
            .or_insert_with(|| {
                Arc::new(Mutex::new(IntervalLimiter::new(
                    self.cfg.per_chat_min_interval,
                )))
            })
            .clone()
    }

    async fn throttle_chat(&self, chat_id: &ChatId) {
        let global_wait = { self.global.lock().await.reserve() };
        let chat_wait = {
            let lim = self.limiter_for_chat(chat_id).await;
            let mut guard = lim.lock().await;
            guard.reserve()
        };

        let wait = global_wait.max(chat_wait);
        if !wait.is_zero() {
            sleep(wait).await;
        }
    }
}

#[async_trait::async_trait]
impl MessagingPort for ThrottledMessenger {
    async fn send_text(&self, chat_id: &ChatId, body: &str) -> Result<DeliveryId, TransportError> {
        self.throttle_chat(chat_id).await;
        self.inner.send_text(chat_id, body).await
    }
}
