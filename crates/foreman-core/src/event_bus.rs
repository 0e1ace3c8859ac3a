use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, RwLock};

use foreman_persistence::Store;
use foreman_types::{OutboxEvent, RuntimeEvent};

pub type EventHandler = Arc<dyn Fn(&RuntimeEvent) -> anyhow::Result<()> + Send + Sync>;

const DEFAULT_HISTORY_CAPACITY: usize = 2048;

#[derive(Debug, Clone, Copy, Default)]
pub struct DispatchReport {
    pub handlers_run: usize,
    pub failures: usize,
}

impl DispatchReport {
    pub fn all_succeeded(&self) -> bool {
        self.failures == 0
    }
}

struct BusInner {
    by_type: HashMap<String, Vec<EventHandler>>,
    wildcard: Vec<EventHandler>,
}

/// In-process publish/subscribe with per-event-type subscriber sets. Handler
/// errors are isolated: they are logged, do not reach the publisher, and do
/// not stop the remaining handlers. A bounded ring of recent events is kept
/// for replay and debugging.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<RwLock<BusInner>>,
    history: Arc<Mutex<VecDeque<RuntimeEvent>>>,
    history_capacity: usize,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_history_capacity(DEFAULT_HISTORY_CAPACITY)
    }

    pub fn with_history_capacity(history_capacity: usize) -> Self {
        Self {
            inner: Arc::new(RwLock::new(BusInner {
                by_type: HashMap::new(),
                wildcard: Vec::new(),
            })),
            history: Arc::new(Mutex::new(VecDeque::new())),
            history_capacity,
        }
    }

    pub fn subscribe<F>(&self, event_type: &str, handler: F)
    where
        F: Fn(&RuntimeEvent) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.inner
            .write()
            .expect("bus lock")
            .by_type
            .entry(event_type.to_string())
            .or_default()
            .push(Arc::new(handler));
    }

    pub fn subscribe_all<F>(&self, handler: F)
    where
        F: Fn(&RuntimeEvent) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.inner
            .write()
            .expect("bus lock")
            .wildcard
            .push(Arc::new(handler));
    }

    pub fn subscriber_count(&self, event_type: &str) -> usize {
        let inner = self.inner.read().expect("bus lock");
        inner.by_type.get(event_type).map(Vec::len).unwrap_or(0) + inner.wildcard.len()
    }

    /// Synchronous dispatch: handlers run inline on the caller.
    pub fn dispatch(&self, event: &RuntimeEvent) -> DispatchReport {
        self.remember(event);
        let handlers = {
            let inner = self.inner.read().expect("bus lock");
            let mut handlers = inner
                .by_type
                .get(&event.event_type)
                .cloned()
                .unwrap_or_default();
            handlers.extend(inner.wildcard.iter().cloned());
            handlers
        };

        let mut report = DispatchReport::default();
        for handler in handlers {
            report.handlers_run += 1;
            if let Err(err) = handler(event) {
                report.failures += 1;
                tracing::warn!(
                    event_type = %event.event_type,
                    event_id = %event.id,
                    error = %err,
                    "event handler failed"
                );
            }
        }
        report
    }

    /// Fire-and-forget dispatch on a spawned task.
    pub fn dispatch_async(&self, event: RuntimeEvent) {
        let bus = self.clone();
        tokio::spawn(async move {
            bus.dispatch(&event);
        });
    }

    fn remember(&self, event: &RuntimeEvent) {
        let mut history = self.history.lock().expect("history lock");
        if history.len() >= self.history_capacity {
            history.pop_front();
        }
        history.push_back(event.clone());
    }

    pub fn history(&self, limit: usize) -> Vec<RuntimeEvent> {
        let history = self.history.lock().expect("history lock");
        history
            .iter()
            .rev()
            .take(limit)
            .rev()
            .cloned()
            .collect()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Outbox-backed emitter. Every event follows the same sequence: append the
/// row undelivered, dispatch in process, then mark delivered only when every
/// handler succeeded. Rows left undelivered are picked up by
/// [`PersistentEmitter::replay_undelivered`] on the next boot.
#[derive(Clone)]
pub struct PersistentEmitter {
    store: Arc<Store>,
    bus: EventBus,
}

impl PersistentEmitter {
    pub fn new(store: Arc<Store>, bus: EventBus) -> Self {
        Self { store, bus }
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    /// Returns `true` when the event was durably recorded and delivered.
    pub async fn emit(&self, event: RuntimeEvent) -> anyhow::Result<bool> {
        let row = OutboxEvent::from_runtime(&event);
        self.store.append_outbox(&row).await?;

        let report = self.bus.dispatch(&event);
        if !report.all_succeeded() {
            tracing::warn!(
                event_type = %event.event_type,
                event_id = %event.id,
                failures = report.failures,
                "event left undelivered for replay"
            );
            self.store.increment_retry(&event.id).await?;
            return Ok(false);
        }

        self.store.mark_delivered(&event.id).await?;
        Ok(true)
    }

    /// Re-dispatch rows that never completed delivery. Handlers must be
    /// idempotent by event id.
    pub async fn replay_undelivered(&self, max_events: usize) -> anyhow::Result<usize> {
        let pending = self.store.undelivered_events(max_events).await?;
        let total = pending.len();
        let mut replayed = 0usize;

        for row in pending {
            let event = row.to_runtime();
            let report = self.bus.dispatch(&event);
            if report.all_succeeded() {
                self.store.mark_delivered(&event.id).await?;
                replayed += 1;
            } else {
                self.store.increment_retry(&event.id).await?;
            }
        }

        if replayed > 0 {
            tracing::info!(replayed, total, "replayed undelivered events");
        }
        Ok(replayed)
    }

    pub async fn cleanup_delivered(&self, older_than: chrono::Duration) -> anyhow::Result<usize> {
        Ok(self.store.purge_delivered(older_than).await?)
    }
}
