//! Local subscription registry.
//!
//! Maps subscription patterns to callbacks. Lookups and mutations take a
//! short synchronous lock; callbacks never run under it, so mutation never
//! blocks an in-flight dispatch.
//!
//! Each entry additionally carries an async gate. Every invocation holds the
//! gate shared; [`Registry::unsubscribe`] marks the entry inactive and then
//! takes the gate exclusively, so once it returns no invocation of that entry
//! is running or will start. A callback unsubscribing itself is detected and
//! does not wait on its own invocation.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tracing::debug;

use relay_core::{BackendChannel, ChannelNamer, Event, Pattern, Result};

use crate::handler::{EventHandler, HandlerResult};

tokio::task_local! {
    static ACTIVE_SUBSCRIPTION: SubscriptionId;
}

/// Identifier returned by `subscribe`. Monotonic per registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

/// One registered subscription.
pub struct SubscriptionEntry {
    id: SubscriptionId,
    pattern: Pattern,
    backend: BackendChannel,
    handler: Arc<dyn EventHandler>,
    registered_at: DateTime<Utc>,
    active: AtomicBool,
    gate: tokio::sync::RwLock<()>,
}

impl SubscriptionEntry {
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    pub fn pattern(&self) -> &Pattern {
        &self.pattern
    }

    /// Backend subscription serving this entry.
    pub fn backend_channel(&self) -> &BackendChannel {
        &self.backend
    }

    pub fn registered_at(&self) -> DateTime<Utc> {
        self.registered_at
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// Run the callback for `event`, unless the entry was unsubscribed.
    ///
    /// Returns `None` when the entry is no longer active.
    pub async fn invoke(&self, event: Arc<Event>) -> Option<HandlerResult> {
        let _gate = self.gate.read().await;
        if !self.is_active() {
            return None;
        }
        Some(
            ACTIVE_SUBSCRIPTION
                .scope(self.id, self.handler.handle(event))
                .await,
        )
    }
}

impl fmt::Debug for SubscriptionEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionEntry")
            .field("id", &self.id)
            .field("pattern", &self.pattern)
            .field("registered_at", &self.registered_at)
            .field("active", &self.is_active())
            .finish()
    }
}

/// Registry of local subscriptions.
pub struct Registry {
    namer: ChannelNamer,
    entries: RwLock<BTreeMap<SubscriptionId, Arc<SubscriptionEntry>>>,
    next_id: AtomicU64,
    generation: watch::Sender<u64>,
}

impl Registry {
    pub fn new(namer: ChannelNamer) -> Self {
        let (generation, _) = watch::channel(0);
        Self {
            namer,
            entries: RwLock::new(BTreeMap::new()),
            next_id: AtomicU64::new(1),
            generation,
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, BTreeMap<SubscriptionId, Arc<SubscriptionEntry>>> {
        self.entries.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, BTreeMap<SubscriptionId, Arc<SubscriptionEntry>>> {
        self.entries.write().unwrap_or_else(|e| e.into_inner())
    }

    fn bump_generation(&self) {
        self.generation.send_modify(|g| *g += 1);
    }

    /// Register a callback for a pattern string.
    pub fn subscribe(&self, pattern: &str, handler: Arc<dyn EventHandler>) -> Result<SubscriptionId> {
        let pattern = Pattern::parse(pattern)?;
        let backend = self.namer.backend_channel(&pattern);
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::SeqCst));
        let entry = Arc::new(SubscriptionEntry {
            id,
            pattern,
            backend,
            handler,
            registered_at: Utc::now(),
            active: AtomicBool::new(true),
            gate: tokio::sync::RwLock::new(()),
        });

        let new_channel = {
            let mut entries = self.write();
            let new_channel = !entries.values().any(|e| e.backend == entry.backend);
            entries.insert(id, entry.clone());
            new_channel
        };
        if new_channel {
            self.bump_generation();
        }
        debug!(
            subsystem = "bus",
            component = "registry",
            op = "subscribe",
            subscription_id = %id,
            pattern = %entry.pattern,
            new_channel,
            "Registered subscription"
        );
        Ok(id)
    }

    /// Remove a subscription.
    ///
    /// When this returns, no invocation of the entry is running or will start,
    /// except the caller's own when called from inside the entry's callback.
    /// Returns `false` for an unknown id.
    pub async fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let (entry, channel_gone) = {
            let mut entries = self.write();
            let Some(entry) = entries.remove(&id) else {
                return false;
            };
            entry.active.store(false, Ordering::SeqCst);
            let gone = !entries.values().any(|e| e.backend == entry.backend);
            (entry, gone)
        };
        if channel_gone {
            self.bump_generation();
        }

        let reentrant = ACTIVE_SUBSCRIPTION.try_with(|current| *current == id).unwrap_or(false);
        if !reentrant {
            drop(entry.gate.write().await);
        }
        debug!(
            subsystem = "bus",
            component = "registry",
            op = "unsubscribe",
            subscription_id = %id,
            reentrant,
            "Removed subscription"
        );
        true
    }

    /// Entries matching an event type, in registration order.
    pub fn matching(&self, event_type: &str) -> Vec<Arc<SubscriptionEntry>> {
        self.read()
            .values()
            .filter(|e| e.pattern.matches(event_type))
            .cloned()
            .collect()
    }

    /// Entries served by the backend subscription that delivered a message.
    ///
    /// A message published once reaches the subscription connection once per
    /// matching backend subscription; selecting by the delivering channel
    /// keeps an event from reaching an entry twice.
    pub fn matching_backend(
        &self,
        delivered_by: &BackendChannel,
        event_type: &str,
    ) -> Vec<Arc<SubscriptionEntry>> {
        self.read()
            .values()
            .filter(|e| &e.backend == delivered_by && e.pattern.matches(event_type))
            .cloned()
            .collect()
    }

    /// Backend subscriptions needed to serve every entry.
    pub fn backend_channels(&self) -> BTreeSet<BackendChannel> {
        self.read().values().map(|e| e.backend.clone()).collect()
    }

    /// Receiver notified whenever [`Registry::backend_channels`] changes.
    pub fn watch(&self) -> watch::Receiver<u64> {
        self.generation.subscribe()
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// Deactivate every entry without waiting. Used at shutdown.
    pub fn clear(&self) {
        let mut entries = self.write();
        for entry in entries.values() {
            entry.active.store(false, Ordering::SeqCst);
        }
        entries.clear();
        drop(entries);
        self.bump_generation();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::{handler_fn, NoOpHandler};
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    fn registry() -> Registry {
        Registry::new(ChannelNamer::new("event").unwrap())
    }

    fn event(t: &str) -> Arc<Event> {
        Arc::new(Event::new(t, json!({}), "o"))
    }

    #[test]
    fn test_matching_in_registration_order() {
        let r = registry();
        let a = r.subscribe("room:*", Arc::new(NoOpHandler)).unwrap();
        let b = r.subscribe("room:1", Arc::new(NoOpHandler)).unwrap();
        let c = r.subscribe("*", Arc::new(NoOpHandler)).unwrap();
        r.subscribe("chat:*", Arc::new(NoOpHandler)).unwrap();

        let ids: Vec<_> = r.matching("room:1").iter().map(|e| e.id()).collect();
        assert_eq!(ids, vec![a, b, c]);
        assert!(a < b && b < c);
    }

    #[test]
    fn test_subscribe_rejects_bad_pattern() {
        let r = registry();
        assert!(r.subscribe("room:*:x", Arc::new(NoOpHandler)).is_err());
        assert!(r.is_empty());
    }

    #[test]
    fn test_backend_channels_deduplicated() {
        let r = registry();
        r.subscribe("room:*", Arc::new(NoOpHandler)).unwrap();
        r.subscribe("room:*", Arc::new(NoOpHandler)).unwrap();
        r.subscribe("room:1", Arc::new(NoOpHandler)).unwrap();
        let channels: Vec<_> = r.backend_channels().into_iter().collect();
        assert_eq!(
            channels,
            vec![
                BackendChannel::Channel("event:d:room:1".into()),
                BackendChannel::Pattern("event:d:room:*".into()),
            ]
        );
    }

    #[test]
    fn test_matching_backend_prevents_duplicates() {
        let r = registry();
        let wild = r.subscribe("room:*", Arc::new(NoOpHandler)).unwrap();
        let exact = r.subscribe("room:1", Arc::new(NoOpHandler)).unwrap();

        let via_pattern = r.matching_backend(
            &BackendChannel::Pattern("event:d:room:*".into()),
            "room:1",
        );
        let via_channel = r.matching_backend(
            &BackendChannel::Channel("event:d:room:1".into()),
            "room:1",
        );
        assert_eq!(via_pattern.iter().map(|e| e.id()).collect::<Vec<_>>(), vec![wild]);
        assert_eq!(via_channel.iter().map(|e| e.id()).collect::<Vec<_>>(), vec![exact]);
    }

    #[tokio::test]
    async fn test_generation_changes_only_with_channel_set() {
        let r = registry();
        let mut rx = r.watch();
        rx.borrow_and_update();

        let a = r.subscribe("x", Arc::new(NoOpHandler)).unwrap();
        assert!(rx.has_changed().unwrap());
        rx.borrow_and_update();

        let b = r.subscribe("x", Arc::new(NoOpHandler)).unwrap();
        assert!(!rx.has_changed().unwrap());

        assert!(r.unsubscribe(a).await);
        assert!(!rx.has_changed().unwrap());
        assert!(r.unsubscribe(b).await);
        assert!(rx.has_changed().unwrap());
        assert!(r.backend_channels().is_empty());
    }

    #[tokio::test]
    async fn test_unsubscribe_unknown_id() {
        let r = registry();
        assert!(!r.unsubscribe(SubscriptionId(99)).await);
    }

    #[tokio::test]
    async fn test_invoke_after_unsubscribe_is_skipped() {
        let r = registry();
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        let id = r
            .subscribe(
                "t",
                Arc::new(handler_fn(move |_| {
                    let c = c.clone();
                    async move {
                        c.fetch_add(1, Ordering::SeqCst);
                        Ok(())
                    }
                })),
            )
            .unwrap();
        let entry = r.matching("t").remove(0);
        assert!(entry.invoke(event("t")).await.is_some());
        r.unsubscribe(id).await;
        assert!(entry.invoke(event("t")).await.is_none());
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_unsubscribe_waits_for_inflight_invocation() {
        let r = Arc::new(registry());
        let finished = Arc::new(AtomicBool::new(false));
        let f = finished.clone();
        let id = r
            .subscribe(
                "t",
                Arc::new(handler_fn(move |_| {
                    let f = f.clone();
                    async move {
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        f.store(true, Ordering::SeqCst);
                        Ok(())
                    }
                })),
            )
            .unwrap();

        let entry = r.matching("t").remove(0);
        let running = tokio::spawn(async move { entry.invoke(event("t")).await });
        tokio::time::sleep(Duration::from_millis(10)).await;

        r.unsubscribe(id).await;
        assert!(finished.load(Ordering::SeqCst));
        assert!(running.await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_callback_may_unsubscribe_itself() {
        let r = Arc::new(registry());
        let slot: Arc<std::sync::Mutex<Option<SubscriptionId>>> = Default::default();
        let (r2, s2) = (r.clone(), slot.clone());
        let id = r
            .subscribe(
                "t",
                Arc::new(handler_fn(move |_| {
                    let r = r2.clone();
                    let s = s2.clone();
                    async move {
                        let own = s.lock().unwrap().take();
                        if let Some(own) = own {
                            assert!(r.unsubscribe(own).await);
                        }
                        Ok(())
                    }
                })),
            )
            .unwrap();
        *slot.lock().unwrap() = Some(id);

        let entry = r.matching("t").remove(0);
        let result = tokio::time::timeout(Duration::from_secs(1), entry.invoke(event("t"))).await;
        assert!(matches!(result, Ok(Some(Ok(())))));
        assert!(r.is_empty());
    }

    #[tokio::test]
    async fn test_clear_deactivates_everything() {
        let r = registry();
        r.subscribe("a", Arc::new(NoOpHandler)).unwrap();
        let entry = r.matching("a").remove(0);
        r.clear();
        assert!(r.is_empty());
        assert!(!entry.is_active());
    }
}
