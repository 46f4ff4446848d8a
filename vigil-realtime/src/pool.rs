//! Ref-counted push-stream connection pool.
//!
//! One connection per distinct URL, shared by any number of
//! `(event name, callback)` subscribers. The connection is opened with the
//! first subscriber, kept alive with backoff-and-retry for as long as anyone
//! is subscribed, and torn down with the last unsubscribe.

use crate::backoff::{Backoff, BackoffState};
use crate::config::PoolConfig;
use crate::sse::{DEFAULT_EVENT, StreamMessage};
use crate::transport::StreamConnector;
use futures::StreamExt;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Callback invoked for each message routed to a subscriber.
pub type MessageCallback = Arc<dyn Fn(&StreamMessage) + Send + Sync>;

/// Connection health signals for whoever tracks engine health.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PoolDiagnostic {
    /// A connection opened. `after_failures` is the streak it ended.
    Connected { url: String, after_failures: u32 },
    /// An open connection closed or errored; a reconnect is scheduled.
    Disconnected { url: String },
    /// Emitted every `degraded_after_failures` consecutive failures.
    Degraded { url: String, consecutive_failures: u32 },
    /// The last subscriber left and the connection was torn down.
    Closed { url: String },
}

/// Shared pool handle. Cheap to clone.
#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    connector: Arc<dyn StreamConnector>,
    config: PoolConfig,
    entries: Mutex<HashMap<String, ConnectionEntry>>,
    diagnostics: broadcast::Sender<PoolDiagnostic>,
    next_id: AtomicU64,
}

struct ConnectionEntry {
    ref_count: usize,
    shared: Arc<EntryShared>,
    task: JoinHandle<()>,
}

/// State visible to both the pool and the connection's supervisor task.
struct EntryShared {
    url: String,
    subscribers: Mutex<HashMap<String, Vec<(u64, MessageCallback)>>>,
    connected: AtomicBool,
    consecutive_failures: AtomicU32,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl ConnectionPool {
    pub fn new(connector: Arc<dyn StreamConnector>, config: PoolConfig) -> Self {
        let (diagnostics, _) = broadcast::channel(64);
        Self {
            inner: Arc::new(PoolInner {
                connector,
                config,
                entries: Mutex::new(HashMap::new()),
                diagnostics,
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// Registers `callback` for `event_name` on the stream at `url`.
    ///
    /// Messages whose event name has no subscriber fall back to subscribers of
    /// the generic `message` event. Must be called inside a tokio runtime.
    pub fn subscribe(
        &self,
        url: &str,
        event_name: &str,
        callback: MessageCallback,
    ) -> PoolSubscription {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let mut entries = lock(&self.inner.entries);

        match entries.get_mut(url) {
            Some(entry) => {
                entry.ref_count += 1;
                lock(&entry.shared.subscribers)
                    .entry(event_name.to_string())
                    .or_default()
                    .push((id, callback));
                debug!("pool: {url} ref_count -> {}", entry.ref_count);
            }
            None => {
                let shared = Arc::new(EntryShared {
                    url: url.to_string(),
                    subscribers: Mutex::new(HashMap::from([(
                        event_name.to_string(),
                        vec![(id, callback)],
                    )])),
                    connected: AtomicBool::new(false),
                    consecutive_failures: AtomicU32::new(0),
                });
                let task = tokio::spawn(supervise(
                    shared.clone(),
                    self.inner.connector.clone(),
                    Backoff::new(
                        self.inner.config.backoff_base(),
                        self.inner.config.backoff_max(),
                    ),
                    self.inner.config.degraded_after_failures.max(1),
                    self.inner.diagnostics.clone(),
                ));
                info!("pool: opening connection to {url}");
                entries.insert(
                    url.to_string(),
                    ConnectionEntry {
                        ref_count: 1,
                        shared,
                        task,
                    },
                );
            }
        }

        PoolSubscription {
            pool: Arc::downgrade(&self.inner),
            url: url.to_string(),
            event_name: event_name.to_string(),
            id,
            released: false,
        }
    }

    pub fn subscribe_diagnostics(&self) -> broadcast::Receiver<PoolDiagnostic> {
        self.inner.diagnostics.subscribe()
    }

    pub fn is_connected(&self, url: &str) -> bool {
        lock(&self.inner.entries)
            .get(url)
            .is_some_and(|e| e.shared.connected.load(Ordering::SeqCst))
    }

    /// True when at least one pooled connection is currently open.
    pub fn any_connected(&self) -> bool {
        lock(&self.inner.entries)
            .values()
            .any(|e| e.shared.connected.load(Ordering::SeqCst))
    }

    pub fn ref_count(&self, url: &str) -> usize {
        lock(&self.inner.entries)
            .get(url)
            .map(|e| e.ref_count)
            .unwrap_or(0)
    }

    pub fn consecutive_failures(&self, url: &str) -> u32 {
        lock(&self.inner.entries)
            .get(url)
            .map(|e| e.shared.consecutive_failures.load(Ordering::SeqCst))
            .unwrap_or(0)
    }

    /// Number of distinct URLs with at least one subscriber.
    pub fn connection_count(&self) -> usize {
        lock(&self.inner.entries).len()
    }

    /// Tears down every connection regardless of subscribers.
    pub fn shutdown(&self) {
        self.inner.close_all();
    }
}

impl PoolInner {
    fn release(&self, url: &str, event_name: &str, id: u64) {
        let mut entries = lock(&self.entries);
        let Some(entry) = entries.get_mut(url) else {
            return;
        };

        {
            let mut subscribers = lock(&entry.shared.subscribers);
            if let Some(list) = subscribers.get_mut(event_name) {
                list.retain(|(sub_id, _)| *sub_id != id);
                if list.is_empty() {
                    subscribers.remove(event_name);
                }
            }
        }

        entry.ref_count = entry.ref_count.saturating_sub(1);
        debug!("pool: {url} ref_count -> {}", entry.ref_count);
        if entry.ref_count == 0 {
            if let Some(entry) = entries.remove(url) {
                entry.task.abort();
                entry.shared.connected.store(false, Ordering::SeqCst);
            }
            info!("pool: closed connection to {url}");
            let _ = self.diagnostics.send(PoolDiagnostic::Closed {
                url: url.to_string(),
            });
        }
    }

    fn close_all(&self) {
        let mut entries = lock(&self.entries);
        for (url, entry) in entries.drain() {
            entry.task.abort();
            debug!("pool: shutdown closed {url}");
        }
    }
}

impl Drop for PoolInner {
    fn drop(&mut self) {
        self.close_all();
    }
}

impl EntryShared {
    fn dispatch(&self, message: &StreamMessage) {
        let callbacks: Vec<MessageCallback> = {
            let subscribers = lock(&self.subscribers);
            let named = subscribers.get(&message.event).filter(|l| !l.is_empty());
            named
                .or_else(|| subscribers.get(DEFAULT_EVENT))
                .map(|list| list.iter().map(|(_, cb)| cb.clone()).collect())
                .unwrap_or_default()
        };
        if callbacks.is_empty() {
            debug!("pool: no subscriber for '{}' on {}", message.event, self.url);
        }
        for callback in callbacks {
            callback(message);
        }
    }
}

/// Keeps one connection alive until the last subscriber leaves.
async fn supervise(
    shared: Arc<EntryShared>,
    connector: Arc<dyn StreamConnector>,
    policy: Backoff,
    degraded_every: u32,
    diagnostics: broadcast::Sender<PoolDiagnostic>,
) {
    let mut backoff = BackoffState::new(policy);

    loop {
        match connector.connect(&shared.url).await {
            Ok(mut stream) => {
                let after_failures = backoff.on_success();
                shared.consecutive_failures.store(0, Ordering::SeqCst);
                shared.connected.store(true, Ordering::SeqCst);
                info!("pool: connected to {} after {after_failures} failures", shared.url);
                let _ = diagnostics.send(PoolDiagnostic::Connected {
                    url: shared.url.clone(),
                    after_failures,
                });

                while let Some(item) = stream.next().await {
                    match item {
                        Ok(message) => shared.dispatch(&message),
                        Err(e) => {
                            warn!("pool: stream error on {}: {e}", shared.url);
                            break;
                        }
                    }
                }

                shared.connected.store(false, Ordering::SeqCst);
                let _ = diagnostics.send(PoolDiagnostic::Disconnected {
                    url: shared.url.clone(),
                });
            }
            Err(e) => {
                warn!("pool: connect to {} failed: {e}", shared.url);
            }
        }

        let delay = backoff.on_failure();
        let failures = backoff.consecutive_failures();
        shared.consecutive_failures.store(failures, Ordering::SeqCst);
        if failures % degraded_every == 0 {
            let _ = diagnostics.send(PoolDiagnostic::Degraded {
                url: shared.url.clone(),
                consecutive_failures: failures,
            });
        }
        debug!("pool: reconnecting to {} in {delay:?} (failure {failures})", shared.url);
        tokio::time::sleep(delay).await;
    }
}

/// A live pool subscription. Dropping it unsubscribes.
#[must_use = "dropping a PoolSubscription unsubscribes immediately"]
pub struct PoolSubscription {
    pool: Weak<PoolInner>,
    url: String,
    event_name: String,
    id: u64,
    released: bool,
}

impl PoolSubscription {
    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn event_name(&self) -> &str {
        &self.event_name
    }

    pub fn unsubscribe(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        if let Some(pool) = self.pool.upgrade() {
            pool.release(&self.url, &self.event_name, self.id);
        }
    }
}

impl Drop for PoolSubscription {
    fn drop(&mut self) {
        self.release();
    }
}

impl std::fmt::Debug for PoolSubscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolSubscription")
            .field("url", &self.url)
            .field("event_name", &self.event_name)
            .field("id", &self.id)
            .finish()
    }
}
