use hdc_core::{PendingChatNotification, Toast, ToastSeverity, DEFAULT_TOAST_TTL_MS};
use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Source of toast ids. Scoped to one broker so two workspaces never collide.
pub trait ToastIdGenerator: Send {
    fn next_id(&mut self) -> u64;
}

#[derive(Debug, Default)]
pub struct MonotonicToastIds {
    last: u64,
}

impl ToastIdGenerator for MonotonicToastIds {
    fn next_id(&mut self) -> u64 {
        self.last += 1;
        self.last
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToastEvent {
    Shown(Toast),
    Dismissed(u64),
    Expired(u64),
}

struct ActiveToast {
    toast: Toast,
    expiry: Option<JoinHandle<()>>,
}

struct ToastHub {
    listeners: BTreeMap<u64, mpsc::UnboundedSender<ToastEvent>>,
    next_listener_id: u64,
    ids: Box<dyn ToastIdGenerator>,
    active: BTreeMap<u64, ActiveToast>,
    disposed: bool,
}

impl ToastHub {
    fn broadcast(&mut self, event: &ToastEvent) {
        self.listeners
            .retain(|_, listener| listener.send(event.clone()).is_ok());
    }
}

fn lock_hub(hub: &Mutex<ToastHub>) -> MutexGuard<'_, ToastHub> {
    hub.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Fire-and-forget toast publisher. Cheap to clone and callable from anywhere.
#[derive(Clone)]
pub struct Notifier {
    hub: Arc<Mutex<ToastHub>>,
    default_ttl_ms: u64,
}

impl Notifier {
    pub fn new(default_ttl_ms: u64) -> Self {
        Self::with_ids(default_ttl_ms, Box::<MonotonicToastIds>::default())
    }

    pub fn with_ids(default_ttl_ms: u64, ids: Box<dyn ToastIdGenerator>) -> Self {
        Self {
            hub: Arc::new(Mutex::new(ToastHub {
                listeners: BTreeMap::new(),
                next_listener_id: 0,
                ids,
                active: BTreeMap::new(),
                disposed: false,
            })),
            default_ttl_ms,
        }
    }

    pub fn success(&self, message: impl Into<String>, ttl_ms: Option<u64>) -> Option<u64> {
        self.publish(ToastSeverity::Success, message, ttl_ms)
    }

    pub fn error(&self, message: impl Into<String>, ttl_ms: Option<u64>) -> Option<u64> {
        self.publish(ToastSeverity::Error, message, ttl_ms)
    }

    pub fn info(&self, message: impl Into<String>, ttl_ms: Option<u64>) -> Option<u64> {
        self.publish(ToastSeverity::Info, message, ttl_ms)
    }

    pub fn warning(&self, message: impl Into<String>, ttl_ms: Option<u64>) -> Option<u64> {
        self.publish(ToastSeverity::Warning, message, ttl_ms)
    }

    /// Delivers the toast to current observers. Without observers the toast is dropped
    /// and `None` is returned.
    pub fn publish(
        &self,
        severity: ToastSeverity,
        message: impl Into<String>,
        ttl_ms: Option<u64>,
    ) -> Option<u64> {
        let mut hub = lock_hub(&self.hub);
        if hub.disposed || hub.listeners.is_empty() {
            debug!(event = "toast_dropped", severity = %severity);
            return None;
        }

        let toast = Toast {
            id: hub.ids.next_id(),
            message: message.into(),
            severity,
            ttl_ms: ttl_ms.unwrap_or(self.default_ttl_ms),
        };
        let id = toast.id;
        hub.broadcast(&ToastEvent::Shown(toast.clone()));
        let expiry = self.schedule_expiry(id, toast.ttl_ms);
        hub.active.insert(id, ActiveToast { toast, expiry });
        Some(id)
    }

    /// Removes a toast before its ttl elapses.
    pub fn dismiss(&self, id: u64) -> bool {
        let mut hub = lock_hub(&self.hub);
        let Some(active) = hub.active.remove(&id) else {
            return false;
        };
        if let Some(expiry) = active.expiry {
            expiry.abort();
        }
        hub.broadcast(&ToastEvent::Dismissed(id));
        true
    }

    pub fn active_toasts(&self) -> Vec<Toast> {
        lock_hub(&self.hub)
            .active
            .values()
            .map(|active| active.toast.clone())
            .collect()
    }

    pub fn subscribe(&self) -> ToastSubscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut hub = lock_hub(&self.hub);
        hub.next_listener_id += 1;
        let id = hub.next_listener_id;
        if !hub.disposed {
            hub.listeners.insert(id, tx);
        }
        ToastSubscription {
            id,
            rx,
            hub: Arc::downgrade(&self.hub),
        }
    }

    pub fn observer_count(&self) -> usize {
        lock_hub(&self.hub).listeners.len()
    }

    /// Stops timers and closes every subscription. Later publishes are dropped.
    pub fn dispose(&self) {
        let mut hub = lock_hub(&self.hub);
        hub.disposed = true;
        for (_, active) in std::mem::take(&mut hub.active) {
            if let Some(expiry) = active.expiry {
                expiry.abort();
            }
        }
        hub.listeners.clear();
    }

    fn schedule_expiry(&self, id: u64, ttl_ms: u64) -> Option<JoinHandle<()>> {
        let runtime = match tokio::runtime::Handle::try_current() {
            Ok(runtime) => runtime,
            Err(_) => {
                warn!(event = "toast_expiry_unscheduled", toast_id = id);
                return None;
            }
        };
        let hub = Arc::downgrade(&self.hub);
        Some(runtime.spawn(async move {
            tokio::time::sleep(Duration::from_millis(ttl_ms)).await;
            expire(&hub, id);
        }))
    }
}

fn expire(hub: &Weak<Mutex<ToastHub>>, id: u64) {
    let Some(hub) = hub.upgrade() else {
        return;
    };
    let mut hub = lock_hub(&hub);
    if hub.active.remove(&id).is_some() {
        hub.broadcast(&ToastEvent::Expired(id));
    }
}

/// Observer registration. Dropping it unregisters the observer.
pub struct ToastSubscription {
    id: u64,
    rx: mpsc::UnboundedReceiver<ToastEvent>,
    hub: Weak<Mutex<ToastHub>>,
}

impl ToastSubscription {
    pub async fn recv(&mut self) -> Option<ToastEvent> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<ToastEvent> {
        self.rx.try_recv().ok()
    }
}

impl Drop for ToastSubscription {
    fn drop(&mut self) {
        if let Some(hub) = self.hub.upgrade() {
            lock_hub(&hub).listeners.remove(&self.id);
        }
    }
}

/// Pending chat requests plus the toast channel. The two never interact:
/// chat requests wait for a decision, toasts vanish on their own.
pub struct NotificationBroker {
    pending: VecDeque<PendingChatNotification>,
    pending_tx: watch::Sender<Vec<PendingChatNotification>>,
    notifier: Notifier,
}

impl Default for NotificationBroker {
    fn default() -> Self {
        Self::new(Notifier::new(DEFAULT_TOAST_TTL_MS))
    }
}

impl NotificationBroker {
    pub fn new(notifier: Notifier) -> Self {
        let (pending_tx, _rx) = watch::channel(Vec::new());
        Self {
            pending: VecDeque::new(),
            pending_tx,
            notifier,
        }
    }

    pub fn notifier(&self) -> &Notifier {
        &self.notifier
    }

    /// Queues a hand-off. A repeated hand-off for an escalation already waiting keeps
    /// its original position and returns false.
    pub fn enqueue(&mut self, notification: PendingChatNotification) -> bool {
        if self.contains(&notification.escalation_id) {
            debug!(
                event = "chat_request_duplicate",
                escalation_id = %notification.escalation_id
            );
            return false;
        }
        self.pending.push_back(notification);
        self.publish_pending();
        true
    }

    pub fn pending(&self) -> impl Iterator<Item = &PendingChatNotification> {
        self.pending.iter()
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn get(&self, escalation_id: &str) -> Option<&PendingChatNotification> {
        self.pending
            .iter()
            .find(|pending| pending.escalation_id == escalation_id)
    }

    pub fn contains(&self, escalation_id: &str) -> bool {
        self.get(escalation_id).is_some()
    }

    /// Removes the entry after it was accepted.
    pub fn take(&mut self, escalation_id: &str) -> Option<PendingChatNotification> {
        let index = self
            .pending
            .iter()
            .position(|pending| pending.escalation_id == escalation_id)?;
        let removed = self.pending.remove(index);
        self.publish_pending();
        removed
    }

    pub fn dismiss_chat(&mut self, escalation_id: &str) -> bool {
        self.take(escalation_id).is_some()
    }

    pub fn watch_pending(&self) -> watch::Receiver<Vec<PendingChatNotification>> {
        self.pending_tx.subscribe()
    }

    pub fn dispose(&mut self) {
        self.pending.clear();
        self.publish_pending();
        self.notifier.dispose();
    }

    fn publish_pending(&self) {
        self.pending_tx
            .send_replace(self.pending.iter().cloned().collect());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hdc_core::CaseSummary;

    fn request(escalation_id: &str) -> PendingChatNotification {
        PendingChatNotification {
            escalation_id: escalation_id.to_string(),
            summary: CaseSummary {
                customer_name: "Ada".to_string(),
                concern: "Refund".to_string(),
                case_number: "1001".to_string(),
                ..CaseSummary::default()
            },
        }
    }

    #[test]
    fn pending_queue_is_fifo_without_duplicates() {
        let mut broker = NotificationBroker::default();
        assert!(broker.enqueue(request("E1")));
        assert!(broker.enqueue(request("E2")));
        assert!(!broker.enqueue(request("E1")));

        let order: Vec<_> = broker
            .pending()
            .map(|pending| pending.escalation_id.as_str())
            .collect();
        assert_eq!(order, vec!["E1", "E2"]);

        assert!(broker.dismiss_chat("E1"));
        assert!(!broker.dismiss_chat("E1"));
        assert_eq!(broker.take("E2").map(|p| p.escalation_id), Some("E2".to_string()));
        assert_eq!(broker.pending_len(), 0);
    }

    #[test]
    fn pending_watchers_see_queue_changes() {
        let mut broker = NotificationBroker::default();
        let rx = broker.watch_pending();
        broker.enqueue(request("E1"));
        assert_eq!(rx.borrow().len(), 1);
        broker.dispose();
        assert!(rx.borrow().is_empty());
    }

    #[test]
    fn publish_without_observers_is_dropped() {
        let notifier = Notifier::new(DEFAULT_TOAST_TTL_MS);
        assert_eq!(notifier.success("saved", None), None);
        assert!(notifier.active_toasts().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn observers_receive_toasts_until_expiry() {
        let notifier = Notifier::new(DEFAULT_TOAST_TTL_MS);
        let mut first = notifier.subscribe();
        let mut second = notifier.subscribe();

        let id = notifier.error("lookup failed", None).expect("delivered");
        for sub in [&mut first, &mut second] {
            let Some(ToastEvent::Shown(toast)) = sub.recv().await else {
                panic!("expected shown toast");
            };
            assert_eq!(toast.id, id);
            assert_eq!(toast.severity, ToastSeverity::Error);
            assert_eq!(toast.ttl_ms, DEFAULT_TOAST_TTL_MS);
        }

        tokio::time::sleep(Duration::from_millis(DEFAULT_TOAST_TTL_MS + 1)).await;
        assert_eq!(first.recv().await, Some(ToastEvent::Expired(id)));
        assert!(notifier.active_toasts().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn dismiss_cancels_expiry() {
        let notifier = Notifier::new(DEFAULT_TOAST_TTL_MS);
        let mut sub = notifier.subscribe();
        let id = notifier.info("hello", Some(50)).expect("delivered");
        assert!(matches!(sub.recv().await, Some(ToastEvent::Shown(_))));

        assert!(notifier.dismiss(id));
        assert_eq!(sub.recv().await, Some(ToastEvent::Dismissed(id)));

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(sub.try_recv(), None);
        assert!(!notifier.dismiss(id));
    }

    #[tokio::test]
    async fn ids_are_monotonic_per_notifier() {
        let a = Notifier::new(DEFAULT_TOAST_TTL_MS);
        let b = Notifier::new(DEFAULT_TOAST_TTL_MS);
        let _sub_a = a.subscribe();
        let _sub_b = b.subscribe();

        let first = a.success("one", None).expect("a1");
        let second = a.warning("two", None).expect("a2");
        assert!(second > first);
        assert_eq!(b.info("other", None), Some(1));
    }

    #[tokio::test]
    async fn dropping_subscription_unregisters_observer() {
        let notifier = Notifier::new(DEFAULT_TOAST_TTL_MS);
        {
            let _sub = notifier.subscribe();
            assert_eq!(notifier.observer_count(), 1);
        }
        assert_eq!(notifier.observer_count(), 0);
        assert_eq!(notifier.info("nobody listening", None), None);
    }

    #[tokio::test]
    async fn dispose_closes_subscriptions() {
        let notifier = Notifier::new(DEFAULT_TOAST_TTL_MS);
        let mut sub = notifier.subscribe();
        notifier.dispose();
        assert_eq!(sub.recv().await, None);
        assert_eq!(notifier.success("late", None), None);
    }

    struct FixedIds(u64);

    impl ToastIdGenerator for FixedIds {
        fn next_id(&mut self) -> u64 {
            self.0 += 10;
            self.0
        }
    }

    #[tokio::test]
    async fn injected_id_generator_is_used() {
        let notifier = Notifier::with_ids(1_000, Box::new(FixedIds(0)));
        let _sub = notifier.subscribe();
        assert_eq!(notifier.info("a", None), Some(10));
        assert_eq!(notifier.info("b", None), Some(20));
    }
}
